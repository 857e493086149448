//! The editor session.
//!
//! ## Learning: One Reader, One Worker
//!
//! ```text
//!  stdin ──▶ reader task ──┬── response ──▶ pending[id] ──▶ blocked NvimApi::request
//!                          ├── request / notification ──▶ queue ──▶ worker ──▶ Dispatcher
//!                          └── vim_leave ──▶ cancel + close queue
//!  stdout ◀── responses, outgoing requests and notifications
//! ```
//!
//! Messages are JSON arrays, one per line, shaped like msgpack-RPC:
//! `[0, id, method, args]`, `[1, id, error, result]` and
//! `[2, method, args]`. Programs run on blocking threads and call into the
//! editor synchronously; the reader task keeps routing responses to them
//! while the worker waits for the program to finish. The worker handles
//! incoming messages one at a time, in arrival order.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};

use ribosome_core::{Dispatcher, PluginData, Request};
use ribosome_nvim::{Nvim, NvimApi, NvimError, NvimIO, NvimResult};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{HostError, HostResult};

/// The notification the editor sends from its `VimLeave` autocmd.
pub const VIM_LEAVE: &str = "vim_leave";

/// One line of the session protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u64,
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: u64,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        args: Vec<Value>,
    },
}

impl Message {
    /// Parses one line.
    pub fn parse(line: &str) -> HostResult<Self> {
        let parts: Vec<Value> = serde_json::from_str(line)
            .map_err(|e| HostError::Protocol(format!("not a message array: {}", e)))?;
        match parts.as_slice() {
            [kind, id, method, args] if kind.as_u64() == Some(0) => Ok(Self::Request {
                id: message_id(id)?,
                method: method_name(method)?,
                args: arguments(args)?,
            }),
            [kind, id, error, result] if kind.as_u64() == Some(1) => Ok(Self::Response {
                id: message_id(id)?,
                error: error.clone(),
                result: result.clone(),
            }),
            [kind, method, args] if kind.as_u64() == Some(2) => Ok(Self::Notification {
                method: method_name(method)?,
                args: arguments(args)?,
            }),
            _ => Err(HostError::Protocol(format!("unknown message shape: {}", line))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, args } => json!([0, id, method, args]),
            Self::Response { id, error, result } => json!([1, id, error, result]),
            Self::Notification { method, args } => json!([2, method, args]),
        }
    }

    /// The line written to the editor, newline included.
    pub fn encode(&self) -> String {
        let mut line = self.to_value().to_string();
        line.push('\n');
        line
    }
}

fn message_id(value: &Value) -> HostResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| HostError::Protocol(format!("invalid message id {}", value)))
}

fn method_name(value: &Value) -> HostResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| HostError::Protocol(format!("invalid method name {}", value)))
}

fn arguments(value: &Value) -> HostResult<Vec<Value>> {
    match value {
        Value::Array(args) => Ok(args.clone()),
        Value::Null => Ok(Vec::new()),
        other => Err(HostError::Protocol(format!("arguments must be a list, got {}", other))),
    }
}

/// Renders an editor error object, usually `[type, message]`.
fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Array(parts) => match parts.as_slice() {
            [_, Value::String(message)] => message.clone(),
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}

struct Pending {
    method: String,
    reply: std_mpsc::Sender<NvimResult<Value>>,
}

/// The outgoing half of the session, shared by every [`Nvim`] clone.
struct Transport {
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    channel: AtomicI64,
    closed: AtomicBool,
}

impl Transport {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            channel: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn send(&self, message: &Message) -> NvimResult<()> {
        let line = message.encode();
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| NvimError::transport("writer lock poisoned"))?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| NvimError::transport(e.to_string()))
    }

    fn resolve(&self, id: u64, error: Value, result: Value) {
        let pending = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        let Some(pending) = pending else {
            warn!(id, "response to unknown request");
            return;
        };
        let reply = if error.is_null() {
            Ok(result)
        } else {
            Err(NvimError::request(pending.method, error_message(&error)))
        };
        // the requester may have given up already
        let _ = pending.reply.send(reply);
    }

    /// Fails every waiting request and refuses new ones.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl NvimApi for Transport {
    fn request(&self, method: &str, args: Vec<Value>) -> NvimResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = std_mpsc::channel();
        self.pending
            .lock()
            .map_err(|_| NvimError::transport("pending table poisoned"))?
            .insert(
                id,
                Pending {
                    method: method.to_string(),
                    reply,
                },
            );
        if self.closed.load(Ordering::SeqCst) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(NvimError::transport("session closed"));
        }
        let message = Message::Request {
            id,
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.send(&message) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            return Err(e);
        }
        response.recv().map_err(|_| {
            NvimError::transport(format!("session closed while waiting for `{}`", method))
        })?
    }

    fn notify(&self, method: &str, args: Vec<Value>) -> NvimResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NvimError::transport("session closed"));
        }
        self.send(&Message::Notification {
            method: method.to_string(),
            args,
        })
    }

    fn channel_id(&self) -> i64 {
        self.channel.load(Ordering::SeqCst)
    }
}

/// A connection to the editor.
pub struct Session {
    nvim: Nvim,
    transport: Arc<Transport>,
    incoming: mpsc::UnboundedReceiver<Message>,
    reader: JoinHandle<()>,
}

impl Session {
    /// A session over the process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), std::io::stdout())
    }

    /// Starts reading from `reader`. Must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: Write + Send + 'static,
    {
        let transport = Arc::new(Transport::new(Box::new(writer)));
        let nvim = Nvim::from_arc(transport.clone());
        let (queue, incoming) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(reader, transport.clone(), nvim.clone(), queue));
        Self {
            nvim,
            transport,
            incoming,
            reader,
        }
    }

    /// The editor handle backed by this session.
    pub fn nvim(&self) -> Nvim {
        self.nvim.clone()
    }

    /// Asks the editor for our channel id and records it.
    pub async fn handshake(&self) -> HostResult<i64> {
        let nvim = self.nvim.clone();
        let (channel, _metadata) = tokio::task::spawn_blocking(move || {
            NvimIO::<(i64, Value)>::read_tpe("nvim_get_api_info", vec![]).run(&nvim)
        })
        .await??;
        self.transport.channel.store(channel, Ordering::SeqCst);
        info!(channel, "connected to editor");
        Ok(channel)
    }

    /// Handles incoming messages until the editor leaves or closes the
    /// stream. Messages queued before that are still handled.
    pub async fn serve<D: PluginData>(mut self, dispatcher: Dispatcher<D>) -> HostResult<()> {
        let transport = self.transport.clone();
        while let Some(message) = self.incoming.recv().await {
            match message {
                Message::Request { id, method, args } => {
                    let response = match dispatcher.dispatch(Request::new(method, args, true)).await {
                        Ok(result) => Message::Response {
                            id,
                            error: Value::Null,
                            result,
                        },
                        Err(e) => Message::Response {
                            id,
                            error: json!(e.to_string()),
                            result: Value::Null,
                        },
                    };
                    respond(&transport, response).await?;
                }
                Message::Notification { method, args } => {
                    // failures are logged and reported by the dispatcher
                    let _ = dispatcher.handle(Request::new(method, args, false)).await;
                }
                Message::Response { id, .. } => debug!(id, "stray response"),
            }
        }
        self.reader.abort();
        info!("session finished");
        Ok(())
    }
}

async fn respond(transport: &Arc<Transport>, response: Message) -> HostResult<()> {
    let transport = transport.clone();
    let sent = tokio::task::spawn_blocking(move || transport.send(&response)).await?;
    if let Err(e) = sent {
        warn!(error = %e.report(), "cannot send response");
    }
    Ok(())
}

async fn read_loop<R>(
    reader: R,
    transport: Arc<Transport>,
    nvim: Nvim,
    queue: mpsc::UnboundedSender<Message>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut queue = Some(queue);
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("editor closed the stream");
                break;
            }
            Err(e) => {
                error!(error = %e, "cannot read from editor");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match Message::parse(&line) {
            Ok(Message::Response { id, error, result }) => transport.resolve(id, error, result),
            Ok(Message::Notification { method, .. }) if method == VIM_LEAVE => {
                info!("editor is exiting");
                nvim.cancel();
                queue = None;
            }
            Ok(message) => match &queue {
                Some(sender) => {
                    if sender.send(message).is_err() {
                        warn!("worker stopped, dropping message");
                    }
                }
                None => refuse(&transport, message),
            },
            Err(e) => warn!(error = %e, "malformed message"),
        }
    }
    nvim.cancel();
    transport.close();
}

/// Answers requests that arrive after shutdown began.
fn refuse(transport: &Transport, message: Message) {
    if let Message::Request { id, method, .. } = message {
        debug!(%method, "refusing request during shutdown");
        let response = Message::Response {
            id,
            error: json!("plugin is shutting down"),
            result: Value::Null,
        };
        if let Err(e) = transport.send(&response) {
            warn!(error = %e.report(), "cannot send response");
        }
    }
}

/// Defines the autocmd that tells the host the editor is exiting.
pub fn exit_hook(plugin: &str, channel: i64) -> NvimIO<()> {
    let source = format!(
        "augroup {}_host\n  autocmd!\n  autocmd VimLeave * call rpcnotify({}, '{}')\naugroup end",
        plugin, channel, VIM_LEAVE
    );
    NvimIO::write("nvim_exec2", vec![json!(source), json!({"output": false})])
}
