//! Programs: named, re-entrant computations bound to request arguments.
//!
//! ## Learning: Deriving Metadata from Signatures
//!
//! A program is built from a closure `Fn(Args) -> NS<R, A>`. Everything the
//! dispatcher needs to know is read off that signature at construction:
//!
//! - `Args: ProgramArgs` gives the arity bounds and parameter type names;
//! - `R: StateView<D, M>` gives the state descriptor (see [`crate::view`]);
//! - `A: Serialize` lets the result travel back to the editor as JSON.
//!
//! Arguments arrive as JSON values. A string that does not decode to the
//! parameter type is retried as a JSON literal, so `:Cmd 3` reaches an
//! `i64` parameter as `3`.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ns::NS;
use crate::output::{ProgIO, ProgOutput};
use crate::prog::Prog;
use crate::view::{StateDescriptor, StateView};
use crate::{PluginData, RibosomeError, RibosomeResult};

/// Arity bounds, parameter types and state view of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamsSpec {
    pub min: usize,
    /// `None` for variadic programs.
    pub max: Option<usize>,
    pub types: Vec<&'static str>,
    /// `None` for programs composed from other programs.
    pub state: Option<StateDescriptor>,
}

impl ParamsSpec {
    /// Human readable arity, e.g. `exactly 2` or `between 1 and 3`.
    pub fn describe(&self) -> String {
        match self.max {
            Some(max) if max == self.min => format!("exactly {}", max),
            Some(max) => format!("between {} and {}", self.min, max),
            None => format!("at least {}", self.min),
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min && self.max.is_none_or(|max| count <= max)
    }

    /// The `-nargs` value for a command running this program.
    pub fn nargs(&self) -> &'static str {
        match (self.min, self.max) {
            (_, Some(0)) => "0",
            (1, Some(1)) => "1",
            (0, Some(1)) => "?",
            (0, _) => "*",
            _ => "+",
        }
    }
}

/// Decodes a request's positional arguments.
pub trait ProgramArgs: Sized + Send + 'static {
    /// Returns `(min, max, type names)`.
    fn bounds() -> (usize, Option<usize>, Vec<&'static str>);

    fn decode(args: Vec<Value>) -> RibosomeResult<Self>;
}

fn accepts_null<T: DeserializeOwned>() -> bool {
    serde_json::from_value::<T>(Value::Null).is_ok()
}

fn decode_arg<T: DeserializeOwned>(index: usize, arg: Option<Value>) -> RibosomeResult<T> {
    let Some(value) = arg else {
        return serde_json::from_value(Value::Null).map_err(|_| {
            RibosomeError::Decode(format!("missing argument {} ({})", index + 1, type_name::<T>()))
        });
    };
    match serde_json::from_value::<T>(value.clone()) {
        Ok(decoded) => Ok(decoded),
        Err(err) => match &value {
            Value::String(token) => serde_json::from_str(token).map_err(|_| {
                RibosomeError::Decode(format!("argument {}: {}", index + 1, err))
            }),
            _ => Err(RibosomeError::Decode(format!("argument {}: {}", index + 1, err))),
        },
    }
}

impl ProgramArgs for () {
    fn bounds() -> (usize, Option<usize>, Vec<&'static str>) {
        (0, Some(0), Vec::new())
    }

    fn decode(_: Vec<Value>) -> RibosomeResult<Self> {
        Ok(())
    }
}

macro_rules! impl_program_args {
    ($($ty:ident => $idx:tt),+) => {
        impl<$($ty),+> ProgramArgs for ($($ty,)+)
        where
            $($ty: DeserializeOwned + Send + 'static),+
        {
            fn bounds() -> (usize, Option<usize>, Vec<&'static str>) {
                let optional = [$(accepts_null::<$ty>()),+];
                let min = optional.iter().rposition(|o| !*o).map_or(0, |i| i + 1);
                (min, Some(optional.len()), vec![$(type_name::<$ty>()),+])
            }

            fn decode(args: Vec<Value>) -> RibosomeResult<Self> {
                let mut args = args.into_iter();
                Ok(($(decode_arg::<$ty>($idx, args.next())?,)+))
            }
        }
    };
}

impl_program_args!(A => 0);
impl_program_args!(A => 0, B => 1);
impl_program_args!(A => 0, B => 1, C => 2);
impl_program_args!(A => 0, B => 1, C => 2, E => 3);
impl_program_args!(A => 0, B => 1, C => 2, E => 3, F => 4);
impl_program_args!(A => 0, B => 1, C => 2, E => 3, F => 4, G => 5);

/// Any number of arguments of one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Varargs<T>(pub Vec<T>);

impl<T: DeserializeOwned + Send + 'static> ProgramArgs for Varargs<T> {
    fn bounds() -> (usize, Option<usize>, Vec<&'static str>) {
        (0, None, vec![type_name::<T>()])
    }

    fn decode(args: Vec<Value>) -> RibosomeResult<Self> {
        args.into_iter()
            .enumerate()
            .map(|(i, arg)| decode_arg::<T>(i, Some(arg)))
            .collect::<RibosomeResult<Vec<T>>>()
            .map(Varargs)
    }
}

/// How a program was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    /// Wraps one state computation.
    Block,
    /// Builds a `Prog` directly, usually from other programs.
    Compose,
}

type Code<D> = Box<dyn Fn(Vec<Value>) -> RibosomeResult<Prog<D, Value>> + Send + Sync>;

struct ProgramInner<D> {
    name: String,
    kind: ProgramKind,
    params: ParamsSpec,
    code: Code<D>,
}

/// A named, reusable computation over `PluginState<D>`.
///
/// Cloning is cheap; clones share the code.
pub struct Program<D> {
    inner: Arc<ProgramInner<D>>,
}

fn to_json<A: Serialize>(name: &str, value: A) -> RibosomeResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| RibosomeError::Prog(format!("cannot encode result of `{}`: {}", name, e)))
}

impl<D: PluginData> Program<D> {
    fn build<Args, F>(name: String, kind: ProgramKind, state: Option<StateDescriptor>, code: F) -> Self
    where
        Args: ProgramArgs,
        F: Fn(Args) -> Prog<D, Value> + Send + Sync + 'static,
    {
        let (min, max, types) = Args::bounds();
        Self {
            inner: Arc::new(ProgramInner {
                name,
                kind,
                params: ParamsSpec {
                    min,
                    max,
                    types,
                    state,
                },
                code: Box::new(move |args| Args::decode(args).map(&code)),
            }),
        }
    }

    /// A program running one state computation; its result is returned.
    pub fn block<Args, R, M, A, F>(name: impl Into<String>, f: F) -> Self
    where
        Args: ProgramArgs,
        R: StateView<D, M>,
        A: Serialize + Send + 'static,
        F: Fn(Args) -> NS<R, A> + Send + Sync + 'static,
    {
        let name = name.into();
        let step = name.clone();
        Self::build(name, ProgramKind::Block, Some(R::descriptor()), move |args| {
            let step = step.clone();
            Prog::exec(step.clone(), f(args), ProgOutput::result())
                .flat_map(move |a| Prog::from_result(to_json(&step, a)))
        })
    }

    /// A program running one state computation whose result is an effect.
    pub fn io<Args, R, M, A, F>(name: impl Into<String>, f: F) -> Self
    where
        Args: ProgramArgs,
        R: StateView<D, M>,
        A: Serialize + Send + 'static,
        F: Fn(Args) -> NS<R, ProgIO<A>> + Send + Sync + 'static,
    {
        let name = name.into();
        let step = name.clone();
        Self::build(name, ProgramKind::Block, Some(R::descriptor()), move |args| {
            let step = step.clone();
            Prog::exec(step.clone(), f(args), ProgOutput::io())
                .flat_map(move |a| Prog::from_result(to_json(&step, a)))
        })
    }

    /// A program that builds its `Prog` directly.
    pub fn compose<Args, A, F>(name: impl Into<String>, f: F) -> Self
    where
        Args: ProgramArgs,
        A: Serialize + Send + 'static,
        F: Fn(Args) -> Prog<D, A> + Send + Sync + 'static,
    {
        let name = name.into();
        let step = name.clone();
        Self::build(name, ProgramKind::Compose, None, move |args| {
            let step = step.clone();
            f(args).flat_map(move |a| Prog::from_result(to_json(&step, a)))
        })
    }

    /// Checks arity and decodes `args`.
    pub fn bind(&self, args: Vec<Value>) -> RibosomeResult<Prog<D, Value>> {
        let params = &self.inner.params;
        if !params.accepts(args.len()) {
            return Err(RibosomeError::Arity {
                name: self.inner.name.clone(),
                expected: params.describe(),
                got: args.len(),
            });
        }
        (self.inner.code)(args)
    }

    /// Runs this program as a step of another program.
    pub fn call(&self, args: Vec<Value>) -> Prog<D, Value> {
        match self.bind(args) {
            Ok(prog) => prog,
            Err(e) => Prog::failed(e),
        }
    }
}

impl<D> Program<D> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ProgramKind {
        self.inner.kind
    }

    pub fn params(&self) -> &ParamsSpec {
        &self.inner.params
    }
}

impl<D> Clone for Program<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> fmt::Debug for Program<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("params", &self.inner.params)
            .finish()
    }
}
