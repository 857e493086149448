//! The program language and its interpreter.
//!
//! ## Learning: A Free Monad in Rust
//!
//! A [`Prog`] is data, not behavior: a tree of `Pure`, `Error`, `Bind` and
//! `Exec` nodes. Building one does nothing; [`run_prog`] walks it against
//! the locked plugin state. `Exec` is the only node that touches state: it
//! projects a view through its [`Wrappers`], runs an [`NS`] against the
//! editor, writes the view back and asks its [`ProgOutput`] for the next
//! `Prog`.
//!
//! The typed `Prog<D, A>` wraps an untyped node tree, the same split
//! `NvimIO` uses, so the interpreter is one loop with an explicit
//! continuation stack.
//!
//! ## Partial Commits
//!
//! An `Exec` step writes its view back only after its `NS` succeeded. A
//! failing step leaves the state as the previous steps left it; there is
//! no rollback of earlier steps.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use ribosome_nvim::{Nvim, NvimIO};

use crate::ns::NS;
use crate::output::ProgOutput;
use crate::plugin_state::PluginState;
use crate::view::{StateDescriptor, StateView, Wrappers};
use crate::{PluginData, RibosomeError, RibosomeResult};

type Erased = Box<dyn Any + Send>;
type Cont<D> = Box<dyn FnOnce(Erased) -> Node<D> + Send>;
type ExecFn<D> = Box<dyn FnOnce(&mut PluginState<D>, &Nvim) -> RibosomeResult<Node<D>> + Send>;

enum Node<D> {
    Pure(Erased),
    Error(RibosomeError),
    Bind(Box<Node<D>>, Cont<D>),
    Exec {
        name: String,
        descriptor: Option<StateDescriptor>,
        run: ExecFn<D>,
    },
}

fn type_mismatch(op: &str) -> RibosomeError {
    RibosomeError::Fatal(format!("`{}` received a value of an unexpected type", op))
}

/// A program yielding `A`, to be run against `PluginState<D>`.
#[must_use = "a Prog does nothing until it is run"]
pub struct Prog<D, A> {
    node: Node<D>,
    _marker: PhantomData<fn() -> A>,
}

impl<D, A> fmt::Debug for Prog<D, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Node::Pure(_) => write!(f, "Prog::Pure"),
            Node::Error(e) => write!(f, "Prog::Error({})", e),
            Node::Bind(..) => write!(f, "Prog::Bind"),
            Node::Exec {
                name, descriptor, ..
            } => match descriptor {
                Some(d) => write!(f, "Prog::Exec({}, {})", name, d),
                None => write!(f, "Prog::Exec({})", name),
            },
        }
    }
}

impl<D: PluginData, A: Send + 'static> Prog<D, A> {
    fn from_node(node: Node<D>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub fn pure(a: A) -> Self {
        Self::from_node(Node::Pure(Box::new(a)))
    }

    /// Fails the program with a user-facing message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::failed(RibosomeError::Prog(message.into()))
    }

    pub fn failed(error: RibosomeError) -> Self {
        Self::from_node(Node::Error(error))
    }

    pub fn from_result(result: RibosomeResult<A>) -> Self {
        match result {
            Ok(a) => Self::pure(a),
            Err(e) => Self::failed(e),
        }
    }

    /// Runs `code` against the view `R` and continues with `output`.
    ///
    /// The view's wrappers are derived from `R`; see [`StateView`].
    pub fn exec<R, M, X>(name: impl Into<String>, code: NS<R, X>, output: ProgOutput<D, X, A>) -> Self
    where
        R: StateView<D, M>,
        X: Send + 'static,
    {
        Self::exec_with(name, code, Wrappers::of::<M>(), output)
    }

    /// Runs `code` against a view built by explicit `wrappers`.
    pub fn exec_with<R, X>(
        name: impl Into<String>,
        code: NS<R, X>,
        wrappers: Wrappers<D, R>,
        output: ProgOutput<D, X, A>,
    ) -> Self
    where
        R: Send + 'static,
        X: Send + 'static,
    {
        let run: ExecFn<D> = Box::new(move |state, nvim| {
            let view = wrappers.get(state)?;
            let (view, x) = code.run(view).run(nvim)?;
            wrappers.put(view, state);
            Ok(output.interpret(x, state).node)
        });
        Self::from_node(Node::Exec {
            name: name.into(),
            descriptor: Some(wrappers.descriptor()),
            run,
        })
    }

    /// Runs an editor computation that needs no plugin state.
    pub fn nvim(io: NvimIO<A>) -> Self {
        Self::from_node(Node::Exec {
            name: "nvim".to_string(),
            descriptor: None,
            run: Box::new(move |_, nvim| Ok(Node::Pure(Box::new(io.run(nvim)?)))),
        })
    }

    /// Runs `f` with direct access to the plugin state.
    pub(crate) fn access<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&mut PluginState<D>, &Nvim) -> RibosomeResult<A> + Send + 'static,
    {
        Self::from_node(Node::Exec {
            name: name.into(),
            descriptor: None,
            run: Box::new(move |state, nvim| Ok(Node::Pure(Box::new(f(state, nvim)?)))),
        })
    }

    pub fn flat_map<B, F>(self, f: F) -> Prog<D, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Prog<D, B> + Send + 'static,
    {
        let cont: Cont<D> = Box::new(move |value| match value.downcast::<A>() {
            Ok(a) => f(*a).node,
            Err(_) => Node::Error(type_mismatch("flat_map")),
        });
        Prog::from_node(Node::Bind(Box::new(self.node), cont))
    }

    pub fn map<B, F>(self, f: F) -> Prog<D, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |a| Prog::pure(f(a)))
    }

    /// Sequences `next` after `self`, discarding this value.
    pub fn then<B, F>(self, next: F) -> Prog<D, B>
    where
        B: Send + 'static,
        F: FnOnce() -> Prog<D, B> + Send + 'static,
    {
        self.flat_map(move |_| next())
    }
}

impl<D: PluginData> Prog<D, Erased> {
    /// Recovers the static type of an erased value.
    pub(crate) fn downcast<A: Send + 'static>(self, op: &'static str) -> Prog<D, A> {
        self.flat_map(move |value| match value.downcast::<A>() {
            Ok(a) => Prog::pure(*a),
            Err(_) => Prog::failed(type_mismatch(op)),
        })
    }
}

/// Walks `prog` to a value, mutating `state` as `Exec` steps commit.
pub fn run_prog<D, A>(state: &mut PluginState<D>, nvim: &Nvim, prog: Prog<D, A>) -> RibosomeResult<A>
where
    D: PluginData,
    A: Send + 'static,
{
    let mut stack: Vec<Cont<D>> = Vec::new();
    let mut current = prog.node;

    loop {
        current = match current {
            Node::Pure(value) => match stack.pop() {
                Some(cont) => cont(value),
                None => {
                    return value
                        .downcast::<A>()
                        .map(|a| *a)
                        .map_err(|_| type_mismatch("run_prog"));
                }
            },
            Node::Error(error) => return Err(error),
            Node::Bind(inner, cont) => {
                stack.push(cont);
                *inner
            }
            Node::Exec {
                name,
                descriptor,
                run,
            } => {
                match descriptor {
                    Some(d) => tracing::debug!(step = %name, view = %d, "exec"),
                    None => tracing::debug!(step = %name, "exec"),
                }
                run(state, nvim).unwrap_or_else(Node::Error)
            }
        };
    }
}

/// Compiles `prog` into a state computation over the whole plugin state.
pub fn eval_prog<D, A>(prog: Prog<D, A>) -> NS<PluginState<D>, A>
where
    D: PluginData,
    A: Send + 'static,
{
    NS::new(move |mut state: PluginState<D>| {
        NvimIO::try_delay(move |nvim| {
            run_prog(&mut state, nvim, prog)
                .map(|a| (state, a))
                .map_err(RibosomeError::into_nvim)
        })
    })
}
