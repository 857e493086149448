//! The editor handle threaded through every [`crate::NvimIO`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::NvimResult;

/// A channel to a running editor.
///
/// Implementations map `request` onto a blocking msgpack-RPC round trip and
/// `notify` onto a fire-and-forget message.
pub trait NvimApi: Send + Sync {
    /// Sends a request and waits for the response.
    fn request(&self, method: &str, args: Vec<Value>) -> NvimResult<Value>;

    /// Sends a notification.
    fn notify(&self, method: &str, args: Vec<Value>) -> NvimResult<()>;

    /// The RPC channel id the editor uses to reach this process.
    fn channel_id(&self) -> i64;
}

/// Cloneable handle to the editor plus the cooperative cancellation flag.
#[derive(Clone)]
pub struct Nvim {
    api: Arc<dyn NvimApi>,
    cancelled: Arc<AtomicBool>,
}

impl Nvim {
    /// Wraps an api implementation.
    pub fn new(api: impl NvimApi + 'static) -> Self {
        Self::from_arc(Arc::new(api))
    }

    /// Wraps a shared api implementation.
    pub fn from_arc(api: Arc<dyn NvimApi>) -> Self {
        Self {
            api,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request(&self, method: &str, args: Vec<Value>) -> NvimResult<Value> {
        tracing::trace!(method, "nvim request");
        self.api.request(method, args)
    }

    pub fn notify(&self, method: &str, args: Vec<Value>) -> NvimResult<()> {
        tracing::trace!(method, "nvim notify");
        self.api.notify(method, args)
    }

    pub fn channel_id(&self) -> i64 {
        self.api.channel_id()
    }

    /// Signals running programs to wind down. Programs observe it through
    /// [`crate::NvimIO::cancelled`]; nothing is interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Nvim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nvim")
            .field("channel_id", &self.channel_id())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
