//! # Ribosome Host
//!
//! Starts a plugin process and connects it to the editor.
//!
//! ## Startup
//!
//! ```text
//! install logging ─▶ handshake (channel id) ─▶ read g:<plugin>_* settings
//!        │                                            │
//!        │                              build PluginState, attach log handler
//!        │                                            │
//!        └──────────────▶ define triggers + VimLeave hook ─▶ serve until exit
//! ```
//!
//! A failure anywhere before serving ends the process with exit code 1.
//! Once serving, the process exits with 0 when the editor leaves or
//! closes the stream.

pub mod logging;
pub mod manifest;
pub mod session;

use std::process::ExitCode;
use std::sync::Arc;

use ribosome_core::{
    Dispatcher, LogHandler, PluginConfig, PluginData, PluginSettings, PluginStateHolder,
    RibosomeError, RuntimeConfig, internal,
};
use ribosome_nvim::NvimError;
use tracing::{error, info};

pub use logging::{LogFormat, LogGuard, LogSettings};
pub use manifest::PluginManifest;
pub use session::{Message, Session};

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur while starting or serving a plugin
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Incompatible manifest version: expected {expected}, got {got}")]
    IncompatibleVersion { expected: String, got: String },

    #[error("cannot install logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Ribosome(#[from] RibosomeError),

    #[error("editor error: {}", .0.report())]
    Nvim(#[from] NvimError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs a plugin over stdio until the editor goes away.
///
/// Logging goes to `RIBOSOME_LOG_FILE` if set, formatted according to
/// `RIBOSOME_FILE_LOG_FMT`.
pub async fn start_plugin<D: PluginData>(
    config: PluginConfig<D>,
    data: D,
    runtime: RuntimeConfig,
) -> ExitCode {
    let logs = match LogSettings::from_env(runtime.log.level.clone()).and_then(|s| logging::install(&s)) {
        Ok(logs) => logs,
        Err(e) => {
            eprintln!("ribosome: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let plugin = config.basic().name.clone();
    info!(%plugin, version = env!("CARGO_PKG_VERSION"), "starting plugin");

    let result = run_session(config, data, &runtime, Session::stdio(), Some(logs.handler())).await;
    match result {
        Ok(()) => {
            info!(%plugin, "plugin stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(%plugin, error = %e, "plugin failed");
            ExitCode::FAILURE
        }
    }
}

/// Sets the plugin up on `session` and serves requests.
pub async fn run_session<D: PluginData>(
    config: PluginConfig<D>,
    data: D,
    runtime: &RuntimeConfig,
    session: Session,
    log_handler: Option<Arc<dyn LogHandler>>,
) -> HostResult<()> {
    let channel = session.handshake().await?;
    let nvim = session.nvim();
    let plugin = config.basic().name.clone();

    let settings = {
        let nvim = nvim.clone();
        let plugin = plugin.clone();
        tokio::task::spawn_blocking(move || PluginSettings::load(&plugin).run(&nvim)).await??
    };

    let mut state = config.build(data, settings, runtime)?;
    if let Some(handler) = log_handler {
        state.set_log_handler(handler);
    }
    let holder = PluginStateHolder::new(state, runtime.dispatch.lock_timeout());
    let dispatcher = Dispatcher::new(holder, nvim.clone());

    let triggers = dispatcher.run(internal::redefine_triggers()).await?;
    {
        let nvim = nvim.clone();
        let plugin = plugin.clone();
        tokio::task::spawn_blocking(move || session::exit_hook(&plugin, channel).run(&nvim)).await??;
    }
    info!(%plugin, channel, triggers, "plugin ready");

    session.serve(dispatcher).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use serde_json::{Value, json};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    /// Hands every write to the fake editor; each write is one message.
    struct ChannelWriter(mpsc::UnboundedSender<Vec<u8>>);

    impl Write for ChannelWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let _ = self.0.send(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    async fn send(editor: &mut DuplexStream, message: Message) {
        editor.write_all(message.encode().as_bytes()).await.unwrap();
    }

    /// Answers the plugin's requests, polls once and leaves.
    async fn fake_editor(
        mut editor: DuplexStream,
        mut from_plugin: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> (Vec<String>, Value) {
        let mut methods = Vec::new();
        send(
            &mut editor,
            Message::Request {
                id: 99,
                method: "function:poll".to_string(),
                args: vec![json!([])],
            },
        )
        .await;
        while let Some(bytes) = from_plugin.recv().await {
            let line = String::from_utf8(bytes).unwrap();
            match Message::parse(line.trim_end()).unwrap() {
                Message::Request { id, method, .. } => {
                    let (error, result) = match method.as_str() {
                        "nvim_get_api_info" => (Value::Null, json!([5, {}])),
                        "nvim_get_var" => (json!([0, "Key not found"]), Value::Null),
                        _ => (Value::Null, Value::Null),
                    };
                    methods.push(method);
                    send(&mut editor, Message::Response { id, error, result }).await;
                }
                Message::Response { id: 99, result, .. } => {
                    send(
                        &mut editor,
                        Message::Notification {
                            method: session::VIM_LEAVE.to_string(),
                            args: vec![],
                        },
                    )
                    .await;
                    return (methods, result);
                }
                _ => {}
            }
        }
        (methods, Value::Null)
    }

    #[tokio::test]
    async fn test_run_session_end_to_end() {
        let (editor, plugin) = tokio::io::duplex(64 * 1024);
        let (writer, from_plugin) = mpsc::unbounded_channel();
        let session = Session::new(plugin, ChannelWriter(writer));
        let editor = tokio::spawn(fake_editor(editor, from_plugin));

        let mut runtime = RuntimeConfig::default();
        runtime.gather.threads = 1;
        let config = PluginConfig::<Value>::new("notes", "nt");
        run_session(config, json!({}), &runtime, session, None).await.unwrap();

        let (methods, poll) = editor.await.unwrap();
        assert_eq!(poll, json!(true));
        assert_eq!(methods[0], "nvim_get_api_info");
        assert_eq!(methods.iter().filter(|m| *m == "nvim_get_var").count(), 2);
        assert!(methods.iter().filter(|m| *m == "nvim_exec2").count() >= 2);
    }

    #[tokio::test]
    async fn test_startup_failure_is_an_error() {
        let (editor, plugin) = tokio::io::duplex(64 * 1024);
        let (writer, from_plugin) = mpsc::unbounded_channel();
        let session = Session::new(plugin, ChannelWriter(writer));
        let _editor = tokio::spawn(fake_editor(editor, from_plugin));

        let mut runtime = RuntimeConfig::default();
        runtime.gather.threads = 1;
        let config = PluginConfig::<Value>::new("notes", "nt").default_component("absent");
        let result = run_session(config, json!({}), &runtime, session, None).await;
        assert!(matches!(result, Err(HostError::Ribosome(RibosomeError::UnknownComponent(_)))));
    }
}
