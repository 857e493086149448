//! Request dispatch.
//!
//! ## Learning: Async Lock, Blocking Work
//!
//! Requests arrive on an async task, but programs talk to the editor with
//! blocking round-trips. The dispatcher therefore splits every request:
//!
//! ```text
//!   async                         │ blocking pool
//!   ──────────────────────────────┼──────────────────────────────────
//!   lock_owned() with timeout ──▶ │ lookup ─▶ parse args ─▶ bind
//!                                 │ log program ─▶ run_prog
//!   await JoinHandle ◀─────────── │ guard dropped here
//! ```
//!
//! The owned guard moves into the blocking task, so the lock is released
//! on every exit of the task, including a panic. A panic surfaces as a
//! `JoinError` and is reported as one opaque fatal error; the process
//! keeps serving.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::plugin_state::PluginState;
use crate::prog::{Prog, run_prog};
use crate::rpc::{RpcKind, RpcProgram};
use crate::{Nvim, NvimIO, PluginData, RibosomeError, RibosomeResult};

/// One call from the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// `<kind>:<name>`, e.g. `command:incr`
    pub method: String,
    pub args: Vec<Value>,
    /// Whether the editor waits for a result.
    pub sync: bool,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Vec<Value>, sync: bool) -> Self {
        Self {
            method: method.into(),
            args,
            sync,
        }
    }
}

/// Shared ownership of the plugin state behind one lock.
pub struct PluginStateHolder<D> {
    state: Arc<Mutex<PluginState<D>>>,
    timeout: Duration,
}

impl<D: PluginData> PluginStateHolder<D> {
    pub fn new(state: PluginState<D>, timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquires the state, failing after the holder's timeout.
    pub async fn lock(&self) -> RibosomeResult<OwnedMutexGuard<PluginState<D>>> {
        tokio::time::timeout(self.timeout, self.state.clone().lock_owned())
            .await
            .map_err(|_| RibosomeError::LockTimeout(self.timeout))
    }

    /// Reads from the state under the lock.
    pub async fn inspect<F, R>(&self, f: F) -> RibosomeResult<R>
    where
        F: FnOnce(&PluginState<D>) -> R,
    {
        let guard = self.lock().await?;
        Ok(f(&guard))
    }
}

impl<D> Clone for PluginStateHolder<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            timeout: self.timeout,
        }
    }
}

/// Routes editor requests to programs.
pub struct Dispatcher<D> {
    holder: PluginStateHolder<D>,
    nvim: Nvim,
}

impl<D: PluginData> Dispatcher<D> {
    pub fn new(holder: PluginStateHolder<D>, nvim: Nvim) -> Self {
        Self { holder, nvim }
    }

    pub fn holder(&self) -> &PluginStateHolder<D> {
        &self.holder
    }

    pub fn nvim(&self) -> &Nvim {
        &self.nvim
    }

    /// Runs the program registered for `request.method`.
    pub async fn dispatch(&self, request: Request) -> RibosomeResult<Value> {
        let method = request.method.clone();
        let result = self
            .with_state(move |state, nvim| execute(state, nvim, request))
            .await;
        match &result {
            Ok(_) => debug!(%method, "request finished"),
            Err(e) if e.is_fatal() => error!(%method, error = %e, "request failed fatally"),
            Err(e) => warn!(%method, error = %e, "request failed"),
        }
        result
    }

    /// Dispatches `request` and reports failures of asynchronous requests
    /// to the editor, since nobody waits for their result.
    pub async fn handle(&self, request: Request) -> RibosomeResult<Value> {
        let sync = request.sync;
        let result = self.dispatch(request).await;
        if let (false, Err(e)) = (sync, &result) {
            self.report(e).await;
        }
        result
    }

    /// Runs a program outside of any request, e.g. at startup.
    pub async fn run<A: Send + 'static>(&self, prog: Prog<D, A>) -> RibosomeResult<A> {
        self.with_state(move |state, nvim| run_prog(state, nvim, prog))
            .await
    }

    async fn with_state<A, F>(&self, f: F) -> RibosomeResult<A>
    where
        A: Send + 'static,
        F: FnOnce(&mut PluginState<D>, &Nvim) -> RibosomeResult<A> + Send + 'static,
    {
        let mut guard = self.holder.lock().await?;
        let nvim = self.nvim.clone();
        let joined = tokio::task::spawn_blocking(move || f(&mut guard, &nvim)).await;
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(error = %e, "program panicked");
                Err(RibosomeError::Fatal("program panicked".to_string()))
            }
            Err(e) => Err(RibosomeError::Fatal(e.to_string())),
        }
    }

    async fn report(&self, error: &RibosomeError) {
        let nvim = self.nvim.clone();
        let message = error.to_string();
        let sent = tokio::task::spawn_blocking(move || {
            NvimIO::notify("nvim_err_writeln", vec![json!(message)]).run(&nvim)
        })
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            warn!("could not report error to the editor");
        }
    }
}

impl<D> Clone for Dispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            holder: self.holder.clone(),
            nvim: self.nvim.clone(),
        }
    }
}

/// Looks up, binds and runs one request against the locked state.
fn execute<D: PluginData>(
    state: &mut PluginState<D>,
    nvim: &Nvim,
    request: Request,
) -> RibosomeResult<Value> {
    let rpc = state
        .lookup_method(&request.method)
        .cloned()
        .ok_or_else(|| RibosomeError::UnknownMethod(request.method.clone()))?;
    let kind = request
        .method
        .split_once(':')
        .and_then(|(kind, _)| RpcKind::parse(kind));
    let args = parse_args(&rpc, kind, request.args)?;
    let prog = rpc.program().bind(args)?;
    state.log_program(rpc.program().name());
    debug!(method = %request.method, program = rpc.program().name(), "running program");
    run_prog(state, nvim, prog)
}

/// Turns the raw request arguments into the program's positional ones.
///
/// Functions receive `a:000` as a single list, which is unpacked. For
/// json programs the trailing tokens starting at the first one that opens
/// an object are joined and parsed as one JSON document.
fn parse_args<D>(rpc: &RpcProgram<D>, kind: Option<RpcKind>, args: Vec<Value>) -> RibosomeResult<Vec<Value>> {
    let mut args = match (kind, <[Value; 1]>::try_from(args)) {
        (Some(RpcKind::Function), Ok([Value::Array(inner)])) => inner,
        (_, Ok([single])) => vec![single],
        (_, Err(args)) => args,
    };
    if !rpc.options().json {
        return Ok(args);
    }
    let start = args
        .iter()
        .position(|arg| matches!(arg, Value::String(s) if s.trim_start().starts_with('{')));
    if let Some(start) = start {
        let text = args[start..]
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        let document: Value = serde_json::from_str(&text)?;
        args.truncate(start);
        args.push(document);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::fixtures::{Counter, Inner, Other, bump_x, recording, runtime};
    use crate::internal::redefine_triggers;
    use crate::output::{IO, ProgIO};
    use crate::plugin_state::PluginConfig;
    use crate::program::Program;
    use crate::rpc::RpcProgram;
    use crate::settings::PluginSettings;
    use crate::view::ComponentData;
    use crate::NS;
    use ribosome_nvim::testing::RecordingApi;

    fn incr() -> Program<Counter> {
        Program::block("incr", |(): ()| {
            NS::<Counter, ()>::modify(|mut c| {
                c.counter += 1;
                c
            })
        })
    }

    fn bump_y() -> Program<Counter> {
        Program::block("bump_y", |(): ()| {
            NS::<ComponentData<Counter, Other>, ()>::modify(|mut v| {
                v.comp.y += 1;
                v
            })
        })
    }

    fn pair() -> Program<Counter> {
        Program::block("f", |(a, b): (i64, i64)| {
            NS::<Counter, ()>::modify(move |mut c| {
                c.counter = a + b;
                c
            })
        })
    }

    fn dispatcher<D: PluginData>(config: PluginConfig<D>, data: D) -> Dispatcher<D> {
        let state = config
            .build(data, PluginSettings::default(), &runtime())
            .unwrap();
        let (_, nvim) = recording();
        Dispatcher::new(PluginStateHolder::new(state, Duration::from_secs(10)), nvim)
    }

    fn config() -> PluginConfig<Counter> {
        PluginConfig::new("test_plugin", "tst")
            .rpc(RpcProgram::command(incr()))
            .rpc(RpcProgram::command(pair()))
    }

    async fn counter(dispatcher: &Dispatcher<Counter>) -> i64 {
        dispatcher.holder().inspect(|s| s.data().counter).await.unwrap()
    }

    #[tokio::test]
    async fn test_trivial_call() {
        let dispatcher = dispatcher(config(), Counter::default());
        let result = dispatcher
            .dispatch(Request::new("command:incr", vec![], false))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(counter(&dispatcher).await, 1);
        let log = dispatcher.holder().inspect(|s| s.program_log().to_vec()).await.unwrap();
        assert_eq!(log, vec!["incr".to_string()]);
    }

    #[tokio::test]
    async fn test_component_isolation() {
        let config = PluginConfig::new("test_plugin", "tst")
            .component(Component::new("c1").state::<Inner>().rpc(RpcProgram::command(bump_x())))
            .component(Component::new("c2").state::<Other>().rpc(RpcProgram::command(bump_y())))
            .default_component("c1")
            .default_component("c2");
        let dispatcher = dispatcher(config, Counter::default());
        for method in ["command:bump_x", "command:bump_x", "command:bump_y"] {
            dispatcher.dispatch(Request::new(method, vec![], false)).await.unwrap();
        }
        let mut state = dispatcher.holder().lock().await.unwrap();
        assert_eq!(state.component_value::<Inner>().unwrap().x, 2);
        assert_eq!(state.component_value::<Other>().unwrap().y, 1);
        assert_eq!(state.data(), &Counter::default());
    }

    #[tokio::test]
    async fn test_json_update_state() {
        let data = json!({"d": {"d": {"a": "v", "items": [
            {"name": "first", "value": 4},
            {"name": "second", "value": 7}
        ]}}});
        let dispatcher = dispatcher(PluginConfig::<Value>::new("test_plugin", "tst"), data);
        let query = r#"{"patch":{"query":"d.d.items(name=second)","data":{"value":21}}}"#;
        dispatcher
            .dispatch(Request::new("function:update_state", vec![json!([query])], true))
            .await
            .unwrap();
        let items = dispatcher
            .holder()
            .inspect(|s| s.data()["d"]["d"]["items"].clone())
            .await
            .unwrap();
        assert_eq!(items, json!([{"name": "first", "value": 4}, {"name": "second", "value": 21}]));
    }

    #[tokio::test]
    async fn test_json_tokens_are_reassembled() {
        let dispatcher = dispatcher(PluginConfig::<Value>::new("test_plugin", "tst"), json!({"a": 1}));
        let tokens = vec![
            json!(r#"{"patch":"#),
            json!(r#"{"query":"a","#),
            json!(r#""data":2}}"#),
        ];
        dispatcher
            .dispatch(Request::new("function:update_state", vec![Value::Array(tokens)], true))
            .await
            .unwrap();
        let data = dispatcher.holder().inspect(|s| s.data().clone()).await.unwrap();
        assert_eq!(data, json!({"a": 2}));

        let broken = dispatcher
            .dispatch(Request::new("function:update_state", vec![json!(["{nope"])], true))
            .await;
        assert!(matches!(broken, Err(RibosomeError::Decode(_))));
    }

    #[tokio::test]
    async fn test_arity_error_leaves_state() {
        let dispatcher = dispatcher(config(), Counter::default());
        let err = dispatcher
            .dispatch(Request::new("command:f", vec![json!(1)], false))
            .await
            .unwrap_err();
        assert!(matches!(err, RibosomeError::Arity { .. }));
        assert!(err.to_string().contains("exactly 2"));
        assert_eq!(counter(&dispatcher).await, 0);
        let log = dispatcher.holder().inspect(|s| s.program_log().len()).await.unwrap();
        assert_eq!(log, 0);

        dispatcher
            .dispatch(Request::new("command:f", vec![json!("2"), json!("3")], false))
            .await
            .unwrap();
        assert_eq!(counter(&dispatcher).await, 5);
    }

    #[tokio::test]
    async fn test_gathered_io() {
        let gather = Program::<Counter>::io("gather", |(): ()| {
            NS::<Counter, _>::pure(ProgIO::gather(
                vec![
                    IO::pure(1),
                    IO::pure(2),
                    IO::new(|| {
                        std::thread::sleep(Duration::from_millis(20));
                        anyhow::bail!("late failure")
                    }),
                ],
                Duration::from_secs(5),
            ))
        });
        let dispatcher = dispatcher(
            PluginConfig::new("test_plugin", "tst").rpc(RpcProgram::function(gather)),
            Counter::default(),
        );
        let result = dispatcher
            .dispatch(Request::new("function:gather", vec![json!([])], true))
            .await
            .unwrap();
        let items = result.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], json!({"Ok": 1}));
        assert_eq!(items[1], json!({"Ok": 2}));
        assert!(items[2].get("Err").is_some());
    }

    #[tokio::test]
    async fn test_enable_component() {
        let ping = Program::<Counter>::block("extra_ping", |(): ()| NS::<Counter, String>::pure("pong".to_string()));
        let config = PluginConfig::new("test_plugin", "tst")
            .component(Component::new("extra").rpc(RpcProgram::function(ping)));
        let dispatcher = dispatcher(config, Counter::default());
        dispatcher.run(redefine_triggers()).await.unwrap();

        let has_ping = |s: &PluginState<Counter>| {
            s.rpc_triggers()
                .iter()
                .any(|t| t.spec.method == "function:extra_ping")
        };
        assert!(!dispatcher.holder().inspect(has_ping).await.unwrap());
        let missing = dispatcher
            .dispatch(Request::new("function:extra_ping", vec![json!([])], true))
            .await;
        assert!(matches!(missing, Err(RibosomeError::UnknownMethod(_))));

        let added = dispatcher
            .dispatch(Request::new("function:enable_components", vec![json!(["extra"])], true))
            .await
            .unwrap();
        assert_eq!(added, json!(["extra"]));
        assert!(dispatcher.holder().inspect(has_ping).await.unwrap());
        let pong = dispatcher
            .dispatch(Request::new("function:extra_ping", vec![json!([])], true))
            .await
            .unwrap();
        assert_eq!(pong, json!("pong"));

        let specs = dispatcher.holder().inspect(|s| s.distinct_specs()).await.unwrap();
        let triggers = dispatcher
            .holder()
            .inspect(|s| s.rpc_triggers().iter().map(|t| t.spec.clone()).collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(specs, triggers);
    }

    #[tokio::test]
    async fn test_unknown_method_is_reported_for_async_requests() {
        let state = config().build(Counter::default(), PluginSettings::default(), &runtime()).unwrap();
        let api = Arc::new(RecordingApi::new());
        let dispatcher = Dispatcher::new(
            PluginStateHolder::new(state, Duration::from_secs(10)),
            Nvim::from_arc(api.clone()),
        );
        let err = dispatcher
            .handle(Request::new("command:nope", vec![], false))
            .await
            .unwrap_err();
        assert!(matches!(err, RibosomeError::UnknownMethod(_)));
        let reported = api.requests();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, "nvim_err_writeln");

        dispatcher.handle(Request::new("command:nope", vec![], true)).await.unwrap_err();
        assert_eq!(api.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatched_poll_only_touches_program_log() {
        let dispatcher = dispatcher(config(), Counter { counter: 3 });
        let data = |s: &PluginState<Counter>| serde_json::to_value(s.data()).unwrap();
        let before = dispatcher.holder().inspect(data).await.unwrap();
        for _ in 0..2 {
            let alive = dispatcher
                .dispatch(Request::new("function:poll", vec![json!([1, "x"])], true))
                .await
                .unwrap();
            assert_eq!(alive, json!(true));
        }
        assert_eq!(dispatcher.holder().inspect(data).await.unwrap(), before);
        let log = dispatcher.holder().inspect(|s| s.program_log().to_vec()).await.unwrap();
        assert_eq!(log, vec!["poll".to_string(), "poll".to_string()]);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let state = config().build(Counter::default(), PluginSettings::default(), &runtime()).unwrap();
        let (_, nvim) = recording();
        let dispatcher = Dispatcher::new(PluginStateHolder::new(state, Duration::from_millis(50)), nvim);
        let guard = dispatcher.holder().lock().await.unwrap();
        let err = dispatcher
            .dispatch(Request::new("command:incr", vec![], false))
            .await
            .unwrap_err();
        assert!(matches!(err, RibosomeError::LockTimeout(_)));
        drop(guard);
        dispatcher.dispatch(Request::new("command:incr", vec![], false)).await.unwrap();
        assert_eq!(counter(&dispatcher).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_are_serialized() {
        let slow = Program::<Counter>::block("slow_incr", |(): ()| {
            NS::<Counter, Counter>::get().flat_map(|c| {
                std::thread::sleep(Duration::from_millis(30));
                NS::set(Counter {
                    counter: c.counter + 1,
                })
            })
        });
        let dispatcher = dispatcher(
            PluginConfig::new("test_plugin", "tst").rpc(RpcProgram::command(slow)),
            Counter::default(),
        );
        let first = dispatcher.clone();
        let second = dispatcher.clone();
        let (a, b) = tokio::join!(
            first.dispatch(Request::new("command:slow_incr", vec![], false)),
            second.dispatch(Request::new("command:slow_incr", vec![], false)),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(counter(&dispatcher).await, 2);
    }

    #[tokio::test]
    async fn test_panicking_program_is_fatal_and_releases_lock() {
        let boom = Program::<Counter>::compose("boom", |(): ()| {
            Prog::<Counter, i64>::pure(1).map(|n| {
                if n > 0 {
                    panic!("boom");
                }
                n
            })
        });
        let dispatcher = dispatcher(config().rpc(RpcProgram::command(boom)), Counter::default());
        let err = dispatcher
            .dispatch(Request::new("command:boom", vec![], false))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        dispatcher.dispatch(Request::new("command:incr", vec![], false)).await.unwrap();
        assert_eq!(counter(&dispatcher).await, 1);
    }
}
