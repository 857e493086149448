//! # Ribosome Nvim
//!
//! The editor effect of the ribosome runtime.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   run(&Nvim)   ┌────────────────────┐
//! │  NvimIO<A>   │ ─────────────▶ │ trampoline (loop)  │
//! │ Pure/Suspend │                │  frame stack (heap)│
//! │ BindSuspend  │                └─────────┬──────────┘
//! └──────────────┘                          │ request/notify
//!                                 ┌─────────▼──────────┐
//!                                 │ Nvim ─▶ dyn NvimApi│
//!                                 └────────────────────┘
//! ```
//!
//! `NvimIO` values are descriptions. Nothing touches the editor until
//! [`NvimIO::run`] walks the description with an [`Nvim`] handle. Binds are
//! kept on a heap allocated frame stack, so arbitrarily deep chains run in
//! constant native stack.

mod api;
mod error;
mod io;
pub mod testing;

pub use api::{Nvim, NvimApi};
pub use error::{NvimError, NvimErrorKind};
pub use io::NvimIO;

/// Result type for editor operations
pub type NvimResult<T> = Result<T, NvimError>;
