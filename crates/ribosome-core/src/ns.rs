//! State transformer layered on [`NvimIO`].
//!
//! ## Learning: State Threading Without Mutation
//!
//! An `NS<S, A>` is a function `S -> NvimIO<(S, A)>`. Nothing is shared:
//! the state is moved into the computation and handed back with the
//! result. `zoom` and `transform_s` let a computation written against a
//! small view `T` run against a larger state `S`, which is how programs
//! touch one field of the plugin state without seeing the rest.
//!
//! ## Stack Safety
//!
//! `flat_map` defers running the inner computation behind
//! [`NvimIO::suspend`], so the trampoline in `NvimIO` drives chains of any
//! depth.

use std::fmt;
use std::sync::Arc;

use ribosome_nvim::{Nvim, NvimError, NvimIO};

type RunFn<S, A> = Box<dyn FnOnce(S) -> NvimIO<(S, A)> + Send>;

/// A state transformer over `S` producing `A` inside [`NvimIO`].
#[must_use = "an NS does nothing until it is run"]
pub struct NS<S, A> {
    run: RunFn<S, A>,
}

impl<S, A> fmt::Debug for NS<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NS(..)")
    }
}

impl<S: Send + 'static, A: Send + 'static> NS<S, A> {
    /// Wraps a raw state function.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(S) -> NvimIO<(S, A)> + Send + 'static,
    {
        Self { run: Box::new(f) }
    }

    // ==================== Construction ====================

    pub fn pure(a: A) -> Self {
        Self::new(move |s| NvimIO::pure((s, a)))
    }

    /// Fails with a logical error.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |_| NvimIO::error(message))
    }

    pub fn failed(error: NvimError) -> Self {
        Self::new(move |_| NvimIO::failed(error))
    }

    /// Defers `f` until the computation runs.
    pub fn delay<F>(f: F) -> Self
    where
        F: FnOnce(&Nvim) -> A + Send + 'static,
    {
        Self::new(move |s| NvimIO::delay(move |nvim| (s, f(nvim))))
    }

    /// Runs an editor computation, leaving the state untouched.
    pub fn lift(io: NvimIO<A>) -> Self {
        Self::new(move |s| io.map(move |a| (s, a)))
    }

    /// Reads a value from the state.
    pub fn inspect<F>(f: F) -> Self
    where
        F: FnOnce(&S) -> A + Send + 'static,
    {
        Self::new(move |s| {
            let a = f(&s);
            NvimIO::pure((s, a))
        })
    }

    /// Reads a value from the state, failing with the error's message.
    pub fn inspect_either<F, E>(f: F) -> Self
    where
        F: FnOnce(&S) -> Result<A, E> + Send + 'static,
        E: fmt::Display,
    {
        Self::new(move |s| match f(&s) {
            Ok(a) => NvimIO::pure((s, a)),
            Err(e) => NvimIO::error(e.to_string()),
        })
    }

    /// Reads an optional value from the state, failing with `error` on `None`.
    pub fn inspect_maybe<F>(f: F, error: impl Into<String>) -> Self
    where
        F: FnOnce(&S) -> Option<A> + Send + 'static,
    {
        let error = error.into();
        Self::new(move |s| match f(&s) {
            Some(a) => NvimIO::pure((s, a)),
            None => NvimIO::error(error),
        })
    }

    /// Lifts a pure state function.
    pub fn from_id<F>(f: F) -> Self
    where
        F: FnOnce(S) -> (S, A) + Send + 'static,
    {
        Self::new(move |s| NvimIO::pure(f(s)))
    }

    /// Lifts a fallible state function.
    pub fn from_either_state<F, E>(f: F) -> Self
    where
        F: FnOnce(S) -> Result<(S, A), E> + Send + 'static,
        E: fmt::Display,
    {
        Self::new(move |s| NvimIO::from_either(f(s)))
    }

    /// Lifts an `Option`, failing with `error` on `None`.
    pub fn m(value: Option<A>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(move |s| NvimIO::from_maybe(value, error).map(move |a| (s, a)))
    }

    /// Lifts a `Result`, failing with the error's message.
    pub fn e<E: fmt::Display + Send + 'static>(value: Result<A, E>) -> Self {
        Self::new(move |s| NvimIO::from_either(value).map(move |a| (s, a)))
    }

    // ==================== Composition ====================

    pub fn flat_map<B, F>(self, f: F) -> NS<S, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> NS<S, B> + Send + 'static,
    {
        let run = self.run;
        NS::new(move |s| NvimIO::suspend(move |_| run(s)).flat_map(move |(s, a)| (f(a).run)(s)))
    }

    pub fn map<B, F>(self, f: F) -> NS<S, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        let run = self.run;
        NS::new(move |s| NvimIO::suspend(move |_| run(s)).map(move |(s, a)| (s, f(a))))
    }

    /// Sequences `next` after `self`, discarding this value.
    pub fn then<B, F>(self, next: F) -> NS<S, B>
    where
        B: Send + 'static,
        F: FnOnce() -> NS<S, B> + Send + 'static,
    {
        self.flat_map(move |_| next())
    }

    /// Runs `self` against the part of `T` that `lens` focuses on.
    pub fn zoom<T: Send + 'static>(self, lens: Lens<T, S>) -> NS<T, A> {
        let run = self.run;
        NS::new(move |t| {
            let s = (lens.get)(&t);
            run(s).map(move |(s, a)| ((lens.set)(t, s), a))
        })
    }

    /// Runs `self` against a view of `T` built by `to` and written back by `from`.
    pub fn transform_s<T, To, From>(self, to: To, from: From) -> NS<T, A>
    where
        T: Send + 'static,
        To: FnOnce(&T) -> S + Send + 'static,
        From: FnOnce(T, S) -> T + Send + 'static,
    {
        let run = self.run;
        NS::new(move |t| {
            let s = to(&t);
            run(s).map(move |(s, a)| (from(t, s), a))
        })
    }

    // ==================== Running ====================

    /// Produces the editor computation for an initial state.
    pub fn run(self, s: S) -> NvimIO<(S, A)> {
        (self.run)(s)
    }

    /// Runs and keeps only the value.
    pub fn run_a(self, s: S) -> NvimIO<A> {
        self.run(s).map(|(_, a)| a)
    }

    /// Runs and keeps only the final state.
    pub fn run_s(self, s: S) -> NvimIO<S> {
        self.run(s).map(|(s, _)| s)
    }
}

impl<S: Clone + Send + 'static> NS<S, S> {
    /// Returns a copy of the current state.
    pub fn get() -> Self {
        Self::new(|s: S| {
            let copy = s.clone();
            NvimIO::pure((s, copy))
        })
    }
}

impl<S: Send + 'static> NS<S, ()> {
    /// Replaces the state.
    pub fn set(s: S) -> Self {
        Self::new(move |_| NvimIO::pure((s, ())))
    }

    /// Applies `f` to the state.
    pub fn modify<F>(f: F) -> Self
    where
        F: FnOnce(S) -> S + Send + 'static,
    {
        Self::new(move |s| NvimIO::pure((f(s), ())))
    }
}

/// A reusable focus on a part `T` of a whole `S`.
pub struct Lens<S, T> {
    get: Arc<dyn Fn(&S) -> T + Send + Sync>,
    set: Arc<dyn Fn(S, T) -> S + Send + Sync>,
}

impl<S, T> Lens<S, T> {
    pub fn new<G, P>(get: G, set: P) -> Self
    where
        G: Fn(&S) -> T + Send + Sync + 'static,
        P: Fn(S, T) -> S + Send + Sync + 'static,
    {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    /// Reads the focused part.
    pub fn view(&self, s: &S) -> T {
        (self.get)(s)
    }

    /// Replaces the focused part.
    pub fn replace(&self, s: S, t: T) -> S {
        (self.set)(s, t)
    }
}

impl<S, T> Clone for Lens<S, T> {
    fn clone(&self) -> Self {
        Self {
            get: self.get.clone(),
            set: self.set.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ribosome_nvim::testing::RecordingApi;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Pair {
        left: i32,
        right: String,
    }

    fn nvim() -> Nvim {
        Nvim::new(RecordingApi::new())
    }

    fn left() -> Lens<Pair, i32> {
        Lens::new(|p: &Pair| p.left, |p: Pair, left| Pair { left, ..p })
    }

    #[test]
    fn test_get_set_modify() {
        let ns = NS::<i32, ()>::modify(|s| s + 1)
            .then(NS::get)
            .flat_map(|s| NS::set(s * 10));
        assert_eq!(ns.run_s(1).run(&nvim()).unwrap(), 20);
    }

    #[test]
    fn test_inspect_variants() {
        let ok = NS::<i32, i32>::inspect(|s| s * 2);
        assert_eq!(ok.run(4).run(&nvim()).unwrap(), (4, 8));

        let none = NS::<i32, i32>::inspect_maybe(|_| None, "missing");
        assert!(none.run(0).run(&nvim()).is_err());

        let either = NS::<i32, i32>::inspect_either(|s| if *s > 0 { Ok(*s) } else { Err("negative") });
        assert_eq!(either.run_a(3).run(&nvim()).unwrap(), 3);
    }

    #[test]
    fn test_zoom_writes_back_through_lens() {
        let pair = Pair {
            left: 1,
            right: "r".to_string(),
        };
        let ns = NS::<i32, ()>::modify(|l| l + 41).zoom(left());
        let result = ns.run_s(pair).run(&nvim()).unwrap();
        assert_eq!(result.left, 42);
        assert_eq!(result.right, "r");
    }

    #[test]
    fn test_transform_s() {
        let ns = NS::<String, usize>::inspect(|s| s.len()).transform_s(
            |p: &Pair| p.right.clone(),
            |p, right| Pair { right, ..p },
        );
        let pair = Pair {
            left: 0,
            right: "four".to_string(),
        };
        assert_eq!(ns.run_a(pair).run(&nvim()).unwrap(), 4);
    }

    #[test]
    fn test_lift_and_delay_see_the_editor() {
        let api = RecordingApi::new().with_var("flag", json!(true));
        let ns = NS::<(), bool>::lift(NvimIO::get_var("flag"))
            .flat_map(|flag| NS::delay(move |nvim| flag && nvim.channel_id() == 1));
        assert!(ns.run_a(()).run(&Nvim::new(api)).unwrap());
    }

    #[test]
    fn test_deep_flat_map_is_stack_safe() {
        let mut ns = NS::<u64, ()>::pure(());
        for _ in 0..100_000 {
            ns = ns.flat_map(|()| NS::modify(|s| s + 1));
        }
        assert_eq!(ns.run_s(0).run(&nvim()).unwrap(), 100_000);
    }

    #[test]
    fn test_m_and_e() {
        assert!(NS::<(), i32>::m(None, "nothing").run_a(()).run(&nvim()).is_err());
        let parsed = "7".parse::<i32>();
        assert_eq!(NS::<(), i32>::e(parsed).run_a(()).run(&nvim()).unwrap(), 7);
    }
}
