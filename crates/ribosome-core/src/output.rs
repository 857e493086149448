//! What an `Exec` step does with its result.
//!
//! ## Learning: Effects as Values
//!
//! A program does not run IO itself. Its `NS` returns a [`ProgIO`]
//! describing the effect (one IO, a batch of IOs with a deadline, a
//! subprocess, an echo, a custom payload) and the [`ProgOutput::io`]
//! interpreter decides how to carry it out. Tests swap the interpreter;
//! production uses [`DefaultInterpreter`] backed by a [`GatherPool`].
//!
//! ```text
//!   NS<R, ProgIO<A>> ──Exec──▶ ProgOutput::io ──▶ ProgIoInterpreter
//!                                                   ├─ Scalar     run inline
//!                                                   ├─ Gather     GatherPool, input order
//!                                                   ├─ Subprocess tokio::process
//!                                                   ├─ Echo       logger program or editor
//!                                                   └─ Custom     PluginState::io_executor
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use ribosome_nvim::NvimIO;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::runtime::Runtime;

use crate::plugin_state::PluginState;
use crate::prog::Prog;
use crate::{PluginData, RibosomeError};

/// A type-erased effect result.
pub type IoValue = Box<dyn Any + Send>;

/// How the result of an `Exec` step becomes the next program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// The value is the program's result.
    Result,
    /// The value is dropped.
    Unit,
    /// The value is a [`ProgIO`] to interpret.
    Io,
}

type Interpret<D, X, A> = Box<dyn FnOnce(X, &PluginState<D>) -> Prog<D, A> + Send>;

/// Turns an `Exec` step's value `X` into the continuation `Prog<D, A>`.
pub struct ProgOutput<D, X, A> {
    kind: OutputKind,
    interpret: Interpret<D, X, A>,
}

impl<D, X, A> fmt::Debug for ProgOutput<D, X, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProgOutput::{:?}", self.kind)
    }
}

impl<D: PluginData, X: Send + 'static, A: Send + 'static> ProgOutput<D, X, A> {
    pub fn new<F>(kind: OutputKind, interpret: F) -> Self
    where
        F: FnOnce(X, &PluginState<D>) -> Prog<D, A> + Send + 'static,
    {
        Self {
            kind,
            interpret: Box::new(interpret),
        }
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub(crate) fn interpret(self, x: X, state: &PluginState<D>) -> Prog<D, A> {
        (self.interpret)(x, state)
    }
}

impl<D: PluginData, A: Send + 'static> ProgOutput<D, A, A> {
    /// Returns the value as is.
    pub fn result() -> Self {
        Self::new(OutputKind::Result, |a, _| Prog::pure(a))
    }
}

impl<D: PluginData, X: Send + 'static> ProgOutput<D, X, ()> {
    /// Drops the value.
    pub fn unit() -> Self {
        Self::new(OutputKind::Unit, |_, _| Prog::pure(()))
    }
}

impl<D: PluginData, A: Send + 'static> ProgOutput<D, ProgIO<A>, A> {
    /// Interprets the value with the state's [`ProgIoInterpreter`].
    pub fn io() -> Self {
        Self::new(OutputKind::Io, |io: ProgIO<A>, state| {
            state
                .program_interpreter()
                .interpret(io.kind, state)
                .downcast::<A>("ProgIO")
        })
    }
}

/// A deferred side effect that does not need the editor.
pub struct IO<A> {
    thunk: Box<dyn FnOnce() -> anyhow::Result<A> + Send>,
}

impl<A: Send + 'static> IO<A> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<A> + Send + 'static,
    {
        Self { thunk: Box::new(f) }
    }

    pub fn pure(a: A) -> Self {
        Self::new(move || Ok(a))
    }

    /// Defers an infallible function.
    pub fn delay<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::new(move || Ok(f()))
    }

    pub fn run(self) -> anyhow::Result<A> {
        (self.thunk)()
    }

    fn erase(self) -> IO<IoValue> {
        IO::new(move || self.run().map(|a| Box::new(a) as IoValue))
    }
}

impl<A> fmt::Debug for IO<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IO(..)")
    }
}

/// Why one element of a gathered batch has no value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum GatherError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// One result of a gathered batch.
pub type Gathered<A> = Result<A, GatherError>;

/// An external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subprocess {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Subprocess {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            timeout,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// The outcome of a finished [`Subprocess`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprocessResult {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl SubprocessResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_output(output: std::process::Output) -> Self {
        let lines = |bytes: &[u8]| {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::to_string)
                .collect()
        };
        Self {
            code: output.status.code(),
            stdout: lines(&output.stdout),
            stderr: lines(&output.stderr),
        }
    }
}

/// Severity of an [`Echo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EchoLevel {
    Info,
    Warning,
    Error,
}

/// Messages for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub messages: Vec<String>,
    pub level: EchoLevel,
}

type Collect = fn(Vec<Gathered<IoValue>>) -> IoValue;

/// The untyped effect carried by a [`ProgIO`].
pub enum ProgIoKind {
    Scalar(IO<IoValue>),
    Gather {
        ios: Vec<IO<IoValue>>,
        timeout: Option<Duration>,
        collect: Collect,
    },
    Subprocess(Subprocess),
    GatherSubprocesses {
        procs: Vec<Subprocess>,
        timeout: Option<Duration>,
    },
    Echo(Echo),
    Custom(Value),
}

impl fmt::Debug for ProgIoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(_) => write!(f, "Scalar"),
            Self::Gather { ios, timeout, .. } => write!(f, "Gather({}, {:?})", ios.len(), timeout),
            Self::Subprocess(sp) => write!(f, "Subprocess({})", sp.program),
            Self::GatherSubprocesses { procs, timeout } => {
                write!(f, "GatherSubprocesses({}, {:?})", procs.len(), timeout)
            }
            Self::Echo(echo) => write!(f, "Echo({:?})", echo.level),
            Self::Custom(value) => write!(f, "Custom({})", value),
        }
    }
}

/// An effect a program asks the runtime to perform, yielding `A`.
///
/// Interpreters must produce a value of type `A` for each kind; the
/// constructors below fix `A` per kind.
pub struct ProgIO<A> {
    kind: ProgIoKind,
    _marker: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for ProgIO<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProgIO::{:?}", self.kind)
    }
}

impl<A> ProgIO<A> {
    fn from_kind(kind: ProgIoKind) -> Self {
        Self {
            kind,
            _marker: PhantomData,
        }
    }

    pub fn kind(&self) -> &ProgIoKind {
        &self.kind
    }
}

impl<A: Send + 'static> ProgIO<A> {
    /// Runs one IO synchronously.
    pub fn scalar(io: IO<A>) -> Self {
        Self::from_kind(ProgIoKind::Scalar(io.erase()))
    }
}

fn collect_gathered<A: Send + 'static>(results: Vec<Gathered<IoValue>>) -> IoValue {
    let typed: Vec<Gathered<A>> = results
        .into_iter()
        .map(|r| {
            r.and_then(|value| {
                value
                    .downcast::<A>()
                    .map(|a| *a)
                    .map_err(|_| GatherError::Failed("unexpected result type".to_string()))
            })
        })
        .collect();
    Box::new(typed)
}

impl<A: Send + 'static> ProgIO<Vec<Gathered<A>>> {
    /// Runs IOs in parallel, waiting at most `timeout` for all of them.
    pub fn gather(ios: Vec<IO<A>>, timeout: Duration) -> Self {
        Self::gather_with(ios, Some(timeout))
    }

    /// Runs IOs in parallel with the pool's default timeout.
    pub fn gather_default(ios: Vec<IO<A>>) -> Self {
        Self::gather_with(ios, None)
    }

    fn gather_with(ios: Vec<IO<A>>, timeout: Option<Duration>) -> Self {
        Self::from_kind(ProgIoKind::Gather {
            ios: ios.into_iter().map(IO::erase).collect(),
            timeout,
            collect: collect_gathered::<A>,
        })
    }
}

impl ProgIO<SubprocessResult> {
    pub fn subprocess(subprocess: Subprocess) -> Self {
        Self::from_kind(ProgIoKind::Subprocess(subprocess))
    }
}

impl ProgIO<Vec<Gathered<SubprocessResult>>> {
    pub fn gather_subprocesses(procs: Vec<Subprocess>, timeout: Duration) -> Self {
        Self::from_kind(ProgIoKind::GatherSubprocesses {
            procs,
            timeout: Some(timeout),
        })
    }
}

impl ProgIO<()> {
    pub fn echo(messages: Vec<String>, level: EchoLevel) -> Self {
        Self::from_kind(ProgIoKind::Echo(Echo { messages, level }))
    }

    pub fn echo_info(message: impl Into<String>) -> Self {
        Self::echo(vec![message.into()], EchoLevel::Info)
    }

    pub fn echo_error(message: impl Into<String>) -> Self {
        Self::echo(vec![message.into()], EchoLevel::Error)
    }
}

impl ProgIO<Value> {
    /// Hands `payload` to the plugin's io executor.
    pub fn custom(payload: Value) -> Self {
        Self::from_kind(ProgIoKind::Custom(payload))
    }
}

/// Carries out [`ProgIO`] effects.
pub trait ProgIoInterpreter<D>: Send + Sync {
    fn interpret(&self, io: ProgIoKind, state: &PluginState<D>) -> Prog<D, IoValue>;
}

/// Runs user IO outside the editor connection.
pub type IoExecutor = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

/// A bounded worker pool for gathered IO and subprocesses.
///
/// ## Learning: Owning a Runtime
///
/// The pool owns a separate multi-threaded tokio runtime so gathered work
/// never competes with the request loop. Results travel back over a
/// `std::sync::mpsc` channel, which lets the calling thread wait with a
/// deadline without entering any runtime.
pub struct GatherPool {
    runtime: Option<Runtime>,
    default_timeout: Duration,
}

impl GatherPool {
    /// Starts a pool running at most `threads` blocking tasks at once.
    pub fn new(threads: usize, default_timeout: Duration) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.clamp(1, 4))
            .max_blocking_threads(threads.max(1))
            .thread_name("ribosome-gather")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            default_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Runs `ios` in parallel. Results keep the input order; anything not
    /// finished by the deadline is reported as [`GatherError::TimedOut`].
    pub fn gather<T: Send + 'static>(&self, ios: Vec<IO<T>>, timeout: Duration) -> Vec<Gathered<T>> {
        let Some(runtime) = &self.runtime else {
            return unavailable(ios.len());
        };
        let count = ios.len();
        let (tx, rx) = mpsc::channel();
        for (index, io) in ios.into_iter().enumerate() {
            let tx = tx.clone();
            runtime.spawn_blocking(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| io.run())) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(GatherError::Failed(format!("{:#}", e))),
                    Err(_) => Err(GatherError::Failed("io panicked".to_string())),
                };
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);
        collect_indexed(rx, count, timeout, timeout)
    }

    /// Runs `procs` concurrently, killing any that outlive their timeout.
    pub fn gather_subprocesses(
        &self,
        procs: Vec<Subprocess>,
        timeout: Duration,
    ) -> Vec<Gathered<SubprocessResult>> {
        let Some(runtime) = &self.runtime else {
            return unavailable(procs.len());
        };
        let count = procs.len();
        let (tx, rx) = mpsc::channel();
        for (index, sp) in procs.into_iter().enumerate() {
            let tx = tx.clone();
            let limit = sp.timeout.min(timeout);
            runtime.spawn(async move {
                let mut command = tokio::process::Command::new(&sp.program);
                command
                    .args(&sp.args)
                    .stdin(Stdio::null())
                    .kill_on_drop(true);
                if let Some(cwd) = &sp.cwd {
                    command.current_dir(cwd);
                }
                let outcome = match tokio::time::timeout(limit, command.output()).await {
                    Ok(Ok(output)) => Ok(SubprocessResult::from_output(output)),
                    Ok(Err(e)) => Err(GatherError::Failed(format!("{}: {}", sp.program, e))),
                    Err(_) => Err(GatherError::TimedOut(limit)),
                };
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);
        collect_indexed(rx, count, timeout + Duration::from_millis(200), timeout)
    }
}

impl Drop for GatherPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for GatherPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatherPool")
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

fn unavailable<T>(count: usize) -> Vec<Gathered<T>> {
    (0..count)
        .map(|_| Err(GatherError::Failed("gather pool shut down".to_string())))
        .collect()
}

fn collect_indexed<T>(
    rx: mpsc::Receiver<(usize, Gathered<T>)>,
    count: usize,
    wait: Duration,
    timeout: Duration,
) -> Vec<Gathered<T>> {
    let deadline = Instant::now() + wait;
    let mut slots: Vec<Option<Gathered<T>>> = (0..count).map(|_| None).collect();
    let mut pending = count;
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((index, outcome)) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(outcome);
                    pending -= 1;
                }
            }
            Err(_) => break,
        }
    }
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Err(GatherError::TimedOut(timeout))))
        .collect()
}

/// The interpreter installed by default.
///
/// Gathered work always goes through the pool; the state's io executor
/// only receives [`ProgIO::custom`] payloads.
pub struct DefaultInterpreter {
    pool: Arc<GatherPool>,
}

impl DefaultInterpreter {
    pub fn new(pool: GatherPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &GatherPool {
        &self.pool
    }
}

impl<D: PluginData> ProgIoInterpreter<D> for DefaultInterpreter {
    fn interpret(&self, io: ProgIoKind, state: &PluginState<D>) -> Prog<D, IoValue> {
        let pool = self.pool.clone();
        match io {
            ProgIoKind::Scalar(io) => Prog::nvim(NvimIO::from_io(move || io.run())),
            ProgIoKind::Gather {
                ios,
                timeout,
                collect,
            } => Prog::nvim(NvimIO::simple(move || {
                let timeout = timeout.unwrap_or(pool.default_timeout());
                collect(pool.gather(ios, timeout))
            })),
            ProgIoKind::Subprocess(sp) => Prog::nvim(NvimIO::from_io(move || {
                let timeout = sp.timeout;
                pool.gather_subprocesses(vec![sp], timeout)
                    .pop()
                    .unwrap_or(Err(GatherError::Failed("no result".to_string())))
                    .map(|result| Box::new(result) as IoValue)
            })),
            ProgIoKind::GatherSubprocesses { procs, timeout } => Prog::nvim(NvimIO::simple(move || {
                let timeout = timeout.unwrap_or(pool.default_timeout());
                Box::new(pool.gather_subprocesses(procs, timeout)) as IoValue
            })),
            ProgIoKind::Echo(echo) => echo_prog(echo, state),
            ProgIoKind::Custom(payload) => match state.io_executor() {
                Some(executor) => Prog::nvim(NvimIO::from_io(move || {
                    executor(payload).map(|value| Box::new(value) as IoValue)
                })),
                None => Prog::failed(RibosomeError::Prog(
                    "no io executor configured for custom effects".to_string(),
                )),
            },
        }
    }
}

/// Sends `echo` to the plugin's logger program, or to the editor.
fn echo_prog<D: PluginData>(echo: Echo, state: &PluginState<D>) -> Prog<D, IoValue> {
    match state.logger() {
        Some(logger) => logger
            .call(vec![json!(echo.messages), json!(echo.level)])
            .map(|_| Box::new(()) as IoValue),
        None => Prog::nvim(default_echo(echo).map(|()| Box::new(()) as IoValue)),
    }
}

fn default_echo(echo: Echo) -> NvimIO<()> {
    echo.messages
        .into_iter()
        .fold(NvimIO::pure(()), move |io, message| {
            match echo.level {
                EchoLevel::Info => tracing::info!(%message, "echo"),
                EchoLevel::Warning => tracing::warn!(%message, "echo"),
                EchoLevel::Error => tracing::error!(%message, "echo"),
            }
            let level = echo.level;
            io.then(move || match level {
                EchoLevel::Error => NvimIO::write("nvim_err_writeln", vec![json!(message)]),
                EchoLevel::Warning => NvimIO::write(
                    "nvim_echo",
                    vec![json!([[message, "WarningMsg"]]), json!(true), json!({})],
                ),
                EchoLevel::Info => NvimIO::write(
                    "nvim_echo",
                    vec![json!([[message]]), json!(true), json!({})],
                ),
            })
        })
}
