//! Suspended computations over an editor handle.
//!
//! ## Stack Safety
//!
//! `NvimIO<A>` is a typed facade over an untyped [`Step`] tree. The typed
//! layer guarantees that every continuation receives the type its
//! predecessor produced; the untyped layer lets [`evaluate`] drive any chain
//! with one loop and a `Vec` of pending frames instead of recursion.

use std::any::Any;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Nvim, NvimError, NvimResult};

type Erased = Box<dyn Any + Send>;
type Thunk = Box<dyn FnOnce(&Nvim) -> Step + Send>;
type Cont = Box<dyn FnOnce(Erased) -> Step + Send>;
type Handler = Box<dyn FnOnce(NvimResult<Erased>) -> Step + Send>;

/// Number of operation labels kept for error trails.
const TRAIL_LEN: usize = 8;

enum Step {
    Pure(Erased),
    Failed(NvimError),
    Suspend(Cow<'static, str>, Thunk),
    BindSuspend(Box<Step>, Cont),
    Recover(Box<Step>, Handler),
}

enum Frame {
    Bind(Cont),
    Recover(Handler),
}

/// A suspended computation that yields `A` when run against an [`Nvim`].
#[must_use = "an NvimIO does nothing until it is run"]
pub struct NvimIO<A> {
    step: Step,
    _marker: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for NvimIO<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match &self.step {
            Step::Pure(_) => "Pure".to_string(),
            Step::Failed(e) => format!("Failed({})", e),
            Step::Suspend(label, _) => format!("Suspend({})", label),
            Step::BindSuspend(..) => "BindSuspend".to_string(),
            Step::Recover(..) => "Recover".to_string(),
        };
        write!(f, "NvimIO::{}", variant)
    }
}

fn type_mismatch(op: &str) -> NvimError {
    NvimError::fatal(op, "continuation received a value of an unexpected type")
}

fn downcast<A: 'static>(value: Erased, op: &str) -> NvimResult<A> {
    value.downcast::<A>().map(|a| *a).map_err(|_| type_mismatch(op))
}

impl<A: Send + 'static> NvimIO<A> {
    fn from_step(step: Step) -> Self {
        Self {
            step,
            _marker: PhantomData,
        }
    }

    fn labelled<F>(label: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: FnOnce(&Nvim) -> NvimResult<A> + Send + 'static,
    {
        Self::from_step(Step::Suspend(
            label.into(),
            Box::new(move |nvim| match f(nvim) {
                Ok(a) => Step::Pure(Box::new(a)),
                Err(e) => Step::Failed(e),
            }),
        ))
    }

    // ==================== Construction ====================

    pub fn pure(a: A) -> Self {
        Self::from_step(Step::Pure(Box::new(a)))
    }

    pub fn failed(error: NvimError) -> Self {
        Self::from_step(Step::Failed(error))
    }

    /// Fails with a logical error.
    pub fn error(message: impl Into<String>) -> Self {
        Self::failed(NvimError::logical(message))
    }

    /// Defers `f` until the computation runs.
    pub fn delay<F>(f: F) -> Self
    where
        F: FnOnce(&Nvim) -> A + Send + 'static,
    {
        Self::labelled("delay", move |nvim| Ok(f(nvim)))
    }

    /// Defers a fallible `f` until the computation runs.
    pub fn try_delay<F>(f: F) -> Self
    where
        F: FnOnce(&Nvim) -> NvimResult<A> + Send + 'static,
    {
        Self::labelled("delay", f)
    }

    /// Defers the construction of another computation.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce(&Nvim) -> NvimIO<A> + Send + 'static,
    {
        Self::from_step(Step::Suspend(
            Cow::Borrowed("suspend"),
            Box::new(move |nvim| f(nvim).step),
        ))
    }

    /// Runs a side effect that does not need the editor.
    pub fn from_io<F, E>(f: F) -> Self
    where
        F: FnOnce() -> Result<A, E> + Send + 'static,
        E: fmt::Display,
    {
        Self::labelled("from_io", move |_| {
            f().map_err(|e| NvimError::logical(e.to_string()))
        })
    }

    pub fn from_result(result: NvimResult<A>) -> Self {
        match result {
            Ok(a) => Self::pure(a),
            Err(e) => Self::failed(e),
        }
    }

    /// Lifts an `Either`-like result, turning `Err` into a logical error.
    pub fn from_either<E: fmt::Display>(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::pure(a),
            Err(e) => Self::error(e.to_string()),
        }
    }

    pub fn from_maybe(value: Option<A>, error: impl Into<String>) -> Self {
        match value {
            Some(a) => Self::pure(a),
            None => Self::error(error),
        }
    }

    /// Synchronously evaluates a pure function when the computation runs.
    pub fn simple<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::labelled("simple", move |_| Ok(f()))
    }

    // ==================== Composition ====================

    pub fn flat_map<B, F>(self, f: F) -> NvimIO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> NvimIO<B> + Send + 'static,
    {
        let cont: Cont = Box::new(move |value| match downcast::<A>(value, "flat_map") {
            Ok(a) => f(a).step,
            Err(e) => Step::Failed(e),
        });
        NvimIO::from_step(Step::BindSuspend(Box::new(self.step), cont))
    }

    pub fn map<B, F>(self, f: F) -> NvimIO<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |a| NvimIO::pure(f(a)))
    }

    /// Sequences `next` after `self`, discarding this value.
    pub fn then<B, F>(self, next: F) -> NvimIO<B>
    where
        B: Send + 'static,
        F: FnOnce() -> NvimIO<B> + Send + 'static,
    {
        self.flat_map(move |_| next())
    }

    /// Hands the full outcome (value, logical error or fatal error) to `f`.
    pub fn recover_failure<B, F>(self, f: F) -> NvimIO<B>
    where
        B: Send + 'static,
        F: FnOnce(NvimResult<A>) -> NvimIO<B> + Send + 'static,
    {
        let handler: Handler = Box::new(move |result| {
            let typed = result.and_then(|value| downcast::<A>(value, "recover_failure"));
            f(typed).step
        });
        NvimIO::from_step(Step::Recover(Box::new(self.step), handler))
    }

    /// Replaces any error with a value computed from it.
    pub fn recover<F>(self, f: F) -> NvimIO<A>
    where
        F: FnOnce(NvimError) -> A + Send + 'static,
    {
        self.recover_failure(move |result| match result {
            Ok(a) => NvimIO::pure(a),
            Err(e) => NvimIO::pure(f(e)),
        })
    }

    /// Runs `finalizer` after `self` on every outcome, then restores the outcome.
    pub fn ensure<F>(self, finalizer: F) -> NvimIO<A>
    where
        F: FnOnce() -> NvimIO<()> + Send + 'static,
    {
        self.recover_failure(move |result| finalizer().flat_map(move |()| NvimIO::from_result(result)))
    }

    // ==================== Transport ====================

    /// Requests `method` and decodes the response with `decode`.
    pub fn read<F, E>(method: &str, args: Vec<Value>, decode: F) -> Self
    where
        F: FnOnce(Value) -> Result<A, E> + Send + 'static,
        E: fmt::Display,
    {
        let method = method.to_string();
        Self::labelled(format!("read:{}", method), move |nvim| {
            let response = nvim.request(&method, args)?;
            decode(response).map_err(|e| NvimError::decode(method.as_str(), e.to_string()))
        })
    }

    /// Requests `method` and requires the response to have type `A`.
    pub fn read_tpe(method: &str, args: Vec<Value>) -> Self
    where
        A: DeserializeOwned,
    {
        Self::read(method, args, serde_json::from_value::<A>)
    }

    /// Requests `method` and builds `A` with a constructor that may not apply.
    pub fn read_cons<F>(method: &str, cons: F, args: Vec<Value>) -> Self
    where
        F: FnOnce(&Value) -> Option<A> + Send + 'static,
    {
        Self::read(method, args, move |value| {
            cons(&value).ok_or_else(|| format!("unexpected response {}", value))
        })
    }

    /// Reads a global variable.
    pub fn get_var(name: &str) -> Self
    where
        A: DeserializeOwned,
    {
        Self::read_tpe("nvim_get_var", vec![Value::String(name.to_string())])
    }

    /// Calls a vimscript function.
    pub fn call_function(name: &str, args: Vec<Value>) -> Self
    where
        A: DeserializeOwned,
    {
        Self::read_tpe(
            "nvim_call_function",
            vec![Value::String(name.to_string()), Value::Array(args)],
        )
    }

    // ==================== Running ====================

    /// Runs the computation to completion on the calling thread.
    pub fn run(self, nvim: &Nvim) -> NvimResult<A> {
        evaluate(self.step, nvim).and_then(|value| downcast::<A>(value, "run"))
    }
}

impl NvimIO<()> {
    /// Requests `method` and discards the response.
    pub fn write(method: &str, args: Vec<Value>) -> Self {
        let method = method.to_string();
        Self::labelled(format!("write:{}", method), move |nvim| {
            nvim.request(&method, args).map(|_| ())
        })
    }

    /// Sends `method` as a notification.
    pub fn notify(method: &str, args: Vec<Value>) -> Self {
        let method = method.to_string();
        Self::labelled(format!("notify:{}", method), move |nvim| nvim.notify(&method, args))
    }

    /// Executes an ex command.
    pub fn command(cmd: impl Into<String>) -> Self {
        Self::write("nvim_command", vec![Value::String(cmd.into())])
    }

    /// Blocks the current request for `duration`.
    pub fn sleep(duration: Duration) -> Self {
        Self::labelled("sleep", move |_| {
            std::thread::sleep(duration);
            Ok(())
        })
    }

    /// Starts `thunk` on a detached worker thread. The result is logged, never awaited.
    pub fn fork<F>(thunk: F) -> Self
    where
        F: FnOnce() -> NvimIO<()> + Send + 'static,
    {
        Self::labelled("fork", move |nvim| {
            let nvim = nvim.clone();
            std::thread::Builder::new()
                .name("ribosome-fork".to_string())
                .spawn(move || {
                    if let Err(e) = thunk().run(&nvim) {
                        tracing::warn!(error = %e.report(), "forked computation failed");
                    }
                })
                .map(|_| ())
                .map_err(|e| NvimError::fatal("fork", e.to_string()))
        })
    }

    /// Fails every step after this one if `nvim` has been cancelled.
    pub fn unless_cancelled() -> Self {
        NvimIO::cancelled().flat_map(|cancelled| {
            if cancelled {
                NvimIO::error("cancelled")
            } else {
                NvimIO::pure(())
            }
        })
    }
}

impl NvimIO<bool> {
    /// Reads the cooperative cancellation flag.
    pub fn cancelled() -> Self {
        Self::labelled("cancelled", |nvim| Ok(nvim.is_cancelled()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `f`, turning a panic into a failed step attributed to `op`.
fn guarded<F>(op: &str, f: F) -> Step
where
    F: FnOnce() -> Step,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(step) => step,
        Err(payload) => Step::Failed(NvimError::fatal(op, panic_message(payload.as_ref()))),
    }
}

/// The trampoline. Pending continuations live in `frames`, never on the native stack.
fn evaluate(step: Step, nvim: &Nvim) -> NvimResult<Erased> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut trail: VecDeque<Cow<'static, str>> = VecDeque::with_capacity(TRAIL_LEN);
    let mut current = step;

    loop {
        current = match current {
            Step::Suspend(label, thunk) => {
                if trail.len() == TRAIL_LEN {
                    trail.pop_front();
                }
                trail.push_back(label.clone());
                guarded(&label, move || thunk(nvim))
            }
            Step::BindSuspend(inner, cont) => {
                frames.push(Frame::Bind(cont));
                *inner
            }
            Step::Recover(inner, handler) => {
                frames.push(Frame::Recover(handler));
                *inner
            }
            Step::Pure(value) => match frames.pop() {
                None => return Ok(value),
                Some(Frame::Bind(cont)) => guarded("flat_map", move || cont(value)),
                Some(Frame::Recover(handler)) => guarded("recover", move || handler(Ok(value))),
            },
            Step::Failed(error) => {
                let error = error.with_trail(trail.iter().map(|label| label.as_ref()));
                let handler = loop {
                    match frames.pop() {
                        None => return Err(error),
                        Some(Frame::Bind(_)) => continue,
                        Some(Frame::Recover(handler)) => break handler,
                    }
                };
                guarded("recover", move || handler(Err(error)))
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NvimErrorKind;
    use crate::testing::RecordingApi;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nvim() -> Nvim {
        Nvim::new(RecordingApi::new())
    }

    #[test]
    fn test_pure_and_map() {
        let io = NvimIO::pure(20).map(|x| x + 1).map(|x| x * 2);
        assert_eq!(io.run(&nvim()).unwrap(), 42);
    }

    #[test]
    fn test_deep_left_nested_chain_is_stack_safe() {
        let mut io = NvimIO::pure(0u64);
        for _ in 0..200_000 {
            io = io.flat_map(|x| NvimIO::pure(x + 1));
        }
        assert_eq!(io.run(&nvim()).unwrap(), 200_000);
    }

    #[test]
    fn test_deep_right_nested_chain_is_stack_safe() {
        fn count(n: u64) -> NvimIO<u64> {
            if n == 0 {
                NvimIO::pure(0)
            } else {
                NvimIO::suspend(move |_| count(n - 1)).map(|x| x + 1)
            }
        }
        assert_eq!(count(100_000).run(&nvim()).unwrap(), 100_000);
    }

    #[test]
    fn test_error_short_circuits() {
        let reached = Arc::new(AtomicUsize::new(0));
        let counter = reached.clone();
        let io = NvimIO::<i32>::error("nope").map(move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x
        });
        let err = io.run(&nvim()).unwrap_err();
        assert_eq!(err.kind(), &NvimErrorKind::Logical("nope".to_string()));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recover_failure_sees_all_outcomes() {
        let ok = NvimIO::pure(1).recover_failure(|r| NvimIO::pure(r.is_ok()));
        assert!(ok.run(&nvim()).unwrap());

        let logical = NvimIO::<i32>::error("x")
            .recover_failure(|r| NvimIO::pure(r.unwrap_err().is_logical()));
        assert!(logical.run(&nvim()).unwrap());

        let fatal = NvimIO::<i32>::delay(|_| panic!("kaboom"))
            .recover_failure(|r| NvimIO::pure(r.unwrap_err().is_fatal()));
        assert!(fatal.run(&nvim()).unwrap());
    }

    #[test]
    fn test_panic_becomes_fatal_error_with_op() {
        let err = NvimIO::<i32>::delay(|_| panic!("kaboom")).run(&nvim()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.op(), Some("delay"));
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_ensure_runs_finalizer_on_error() {
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        let io = NvimIO::<i32>::error("fail").ensure(move || {
            NvimIO::simple(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert!(io.run(&nvim()).is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_tpe_and_write() {
        let api = Arc::new(RecordingApi::new().with_var("answer", json!(42)));
        let nvim = Nvim::from_arc(api.clone());

        let value: i64 = NvimIO::get_var("answer").run(&nvim).unwrap();
        assert_eq!(value, 42);

        NvimIO::command("echo 'hi'").run(&nvim).unwrap();
        assert_eq!(api.commands(), vec!["echo 'hi'".to_string()]);
    }

    #[test]
    fn test_read_tpe_decode_error() {
        let api = RecordingApi::new().with_var("answer", json!("not a number"));
        let err = NvimIO::<i64>::get_var("answer").run(&Nvim::new(api)).unwrap_err();
        assert!(matches!(err.kind(), NvimErrorKind::Decode { .. }));
        assert_eq!(err.op(), Some("nvim_get_var"));
    }

    #[test]
    fn test_read_cons() {
        let api = RecordingApi::new().with_var("name", json!("ribosome"));
        let io = NvimIO::read_cons(
            "nvim_get_var",
            |v: &Value| v.as_str().map(str::len),
            vec![json!("name")],
        );
        assert_eq!(io.run(&Nvim::new(api)).unwrap(), 8);
    }

    #[test]
    fn test_cancellation_flag() {
        let nvim = nvim();
        assert!(!NvimIO::cancelled().run(&nvim).unwrap());
        nvim.cancel();
        assert!(NvimIO::cancelled().run(&nvim).unwrap());
        assert!(NvimIO::unless_cancelled().run(&nvim).is_err());
    }

    #[test]
    fn test_fork_does_not_block() {
        let (tx, rx) = std::sync::mpsc::channel();
        NvimIO::fork(move || {
            NvimIO::simple(move || {
                let _ = tx.send(7);
            })
        })
        .run(&nvim())
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_from_maybe_and_either() {
        assert_eq!(NvimIO::from_maybe(Some(1), "none").run(&nvim()).unwrap(), 1);
        assert!(NvimIO::<i32>::from_maybe(None, "none").run(&nvim()).is_err());
        let parsed: Result<i32, _> = "12".parse::<i32>();
        assert_eq!(NvimIO::from_either(parsed).run(&nvim()).unwrap(), 12);
    }

    proptest! {
        #[test]
        fn prop_chain_matches_fold(steps in prop::collection::vec(any::<i32>(), 0..64)) {
            let expected = steps.iter().fold(0i32, |acc, x| acc.wrapping_add(*x));
            let io = steps.iter().enumerate().fold(NvimIO::pure(0i32), |io, (i, &x)| {
                if i % 2 == 0 {
                    io.flat_map(move |acc| NvimIO::pure(acc.wrapping_add(x)))
                } else {
                    io.flat_map(move |acc| NvimIO::suspend(move |_| NvimIO::pure(acc)))
                        .map(move |acc| acc.wrapping_add(x))
                }
            });
            prop_assert_eq!(io.run(&nvim()).unwrap(), expected);
        }

        #[test]
        fn prop_error_stops_at_failing_step(len in 1usize..40, fail in 0usize..40) {
            let fail = fail % len;
            let reached = Arc::new(AtomicUsize::new(0));
            let io = (0..len).fold(NvimIO::pure(()), |io, i| {
                let reached = reached.clone();
                io.then(move || {
                    if i == fail {
                        NvimIO::error(format!("step {i}"))
                    } else {
                        NvimIO::simple(move || {
                            reached.fetch_add(1, Ordering::SeqCst);
                        })
                    }
                })
            });
            let err = io.run(&nvim()).unwrap_err();
            prop_assert_eq!(err.kind(), &NvimErrorKind::Logical(format!("step {fail}")));
            prop_assert_eq!(reached.load(Ordering::SeqCst), fail);
        }
    }
}
