//! # Ribosome Core
//!
//! Plugin state, typed programs and request dispatch.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │   method lookup ─▶ arg parsing ─▶ state lock ─▶ run_prog    │
//! └─────────────┬──────────────────────────────────────────────┘
//!               │ &mut PluginState
//! ┌─────────────▼──────────────────────────────────────────────┐
//! │ PluginState: data, active components, component data,       │
//! │              programs, triggers, mappings, program log       │
//! └─────────────┬──────────────────────────────────────────────┘
//!               │ Wrappers::get / put
//! ┌─────────────▼───────────┐      ┌──────────────────────────┐
//! │ Prog: Pure/Error/Bind/  │─────▶│ NS<R, X> ─▶ NvimIO<(R,X)>│
//! │       Exec              │      └──────────────────────────┘
//! └─────────────────────────┘
//! ```
//!
//! A [`Program`] is bound to request arguments, producing a [`Prog`]. The
//! interpreter walks the `Prog`; each `Exec` step projects the view its code
//! declared (plain data, component data, resources, the whole state) out of
//! the locked [`PluginState`], runs the [`NS`] against the editor, writes the
//! view back and continues with whatever the step's output produced.

pub mod component;
pub mod config;
pub mod dispatch;
pub mod internal;
pub mod mapping;
pub mod ns;
pub mod output;
pub mod plugin_state;
pub mod prog;
pub mod program;
pub mod query;
pub mod rpc;
pub mod settings;
pub mod view;

#[cfg(test)]
pub(crate) mod fixtures;

pub use component::{Component, ComponentState, StateType};
pub use config::RuntimeConfig;
pub use dispatch::{Dispatcher, PluginStateHolder, Request};
pub use mapping::Mapping;
pub use ns::{Lens, NS};
pub use output::{
    Echo, EchoLevel, GatherError, GatherPool, Gathered, IO, ProgIO, ProgIoInterpreter, ProgOutput,
    Subprocess, SubprocessResult,
};
pub use plugin_state::{BasicConfig, LogHandler, PluginConfig, PluginState};
pub use prog::{Prog, eval_prog, run_prog};
pub use program::{ParamsSpec, Program, ProgramArgs, Varargs};
pub use query::StateQuery;
pub use rpc::{ActiveRpcTrigger, PrefixStyle, RpcHandlerSpec, RpcKind, RpcMethod, RpcOptions, RpcProgram};
pub use settings::PluginSettings;
pub use view::{ComponentData, Resources, Ribosome, StateDescriptor, StateView, Wrappers};

pub use ribosome_nvim::{Nvim, NvimApi, NvimError, NvimIO};

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Bounds every user plugin data type must satisfy.
///
/// Data is cloned into each program's view and serialized for the `state`
/// and `update_state` internal programs.
pub trait PluginData: Clone + Send + Serialize + DeserializeOwned + 'static {}

impl<T> PluginData for T where T: Clone + Send + Serialize + DeserializeOwned + 'static {}

/// Result type for runtime operations
pub type RibosomeResult<T> = Result<T, RibosomeError>;

/// Errors that can occur while building or running plugin programs
#[derive(Debug, thiserror::Error)]
pub enum RibosomeError {
    #[error("wrong number of arguments for `{name}`: expected {expected}, got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("cannot decode arguments: {0}")]
    Decode(String),

    #[error("no handler for `{0}`")]
    UnknownMethod(String),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("no active mapping with id {0}")]
    UnknownMapping(String),

    #[error("{0}")]
    Prog(String),

    #[error(transparent)]
    Nvim(NvimError),

    #[error("invalid program `{name}`: {message}")]
    Type { name: String, message: String },

    #[error("state lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Fatal(String),
}

impl RibosomeError {
    pub(crate) fn type_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Type {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns true for conditions that indicate a bug rather than bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Converts into an editor effect error, keeping editor errors intact.
    pub fn into_nvim(self) -> NvimError {
        match self {
            Self::Nvim(e) => e,
            Self::Fatal(message) => NvimError::fatal("prog", message),
            other => NvimError::logical(other.to_string()),
        }
    }
}

impl From<NvimError> for RibosomeError {
    fn from(err: NvimError) -> Self {
        match err.kind() {
            ribosome_nvim::NvimErrorKind::Logical(message) => Self::Prog(message.clone()),
            ribosome_nvim::NvimErrorKind::Fatal(_) => Self::Fatal(err.report()),
            _ => Self::Nvim(err),
        }
    }
}

impl From<serde_json::Error> for RibosomeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
