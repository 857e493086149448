//! Editor effect errors.
//!
//! Every error carries the name of the operation that produced it and a
//! short trail of the operations executed just before. The trail replaces a
//! native backtrace: it names editor calls, not stack frames.

/// The category of an [`NvimError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NvimErrorKind {
    /// A logical failure raised by program code (`NvimIO::error`).
    #[error("{0}")]
    Logical(String),

    /// The editor answered a request with an error.
    #[error("`{method}` failed: {message}")]
    Request { method: String, message: String },

    /// The channel to the editor broke.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The editor answered, but the answer had the wrong shape.
    #[error("cannot decode result of `{method}`: {message}")]
    Decode { method: String, message: String },

    /// A bug: a panic or a broken internal invariant.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Error produced while running an [`crate::NvimIO`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}")]
pub struct NvimError {
    kind: NvimErrorKind,
    op: Option<String>,
    trace: Vec<String>,
}

impl NvimError {
    fn new(kind: NvimErrorKind) -> Self {
        Self {
            kind,
            op: None,
            trace: Vec::new(),
        }
    }

    /// A logical error raised by program code.
    pub fn logical(message: impl Into<String>) -> Self {
        Self::new(NvimErrorKind::Logical(message.into()))
    }

    /// An error reported by the editor for `method`.
    pub fn request(method: impl Into<String>, message: impl Into<String>) -> Self {
        let method = method.into();
        Self::new(NvimErrorKind::Request {
            method: method.clone(),
            message: message.into(),
        })
        .with_op(method)
    }

    /// A broken channel.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(NvimErrorKind::Transport(message.into()))
    }

    /// A response that did not decode.
    pub fn decode(method: impl Into<String>, message: impl Into<String>) -> Self {
        let method = method.into();
        Self::new(NvimErrorKind::Decode {
            method: method.clone(),
            message: message.into(),
        })
        .with_op(method)
    }

    /// A fatal condition raised while running `op`.
    pub fn fatal(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NvimErrorKind::Fatal(message.into())).with_op(op)
    }

    /// Sets the originating operation.
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Attaches the operation trail unless one is already present.
    pub(crate) fn with_trail<'a>(mut self, trail: impl IntoIterator<Item = &'a str>) -> Self {
        if self.trace.is_empty() {
            self.trace = trail.into_iter().map(str::to_string).collect();
        }
        if self.op.is_none() {
            self.op = self.trace.last().cloned();
        }
        self
    }

    /// Returns the error category.
    pub fn kind(&self) -> &NvimErrorKind {
        &self.kind
    }

    /// Returns the operation that failed, if known.
    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    /// Returns the trail of operations that ran before the failure.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    /// Returns true for bugs, false for expected failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, NvimErrorKind::Fatal(_))
    }

    /// Returns true for errors raised by program code.
    pub fn is_logical(&self) -> bool {
        matches!(self.kind, NvimErrorKind::Logical(_))
    }

    /// Renders the error with its operation and trail, for logs.
    pub fn report(&self) -> String {
        let mut out = self.kind.to_string();
        if let Some(op) = &self.op {
            out.push_str(&format!(" (in `{}`)", op));
        }
        if !self.trace.is_empty() {
            out.push_str(&format!(" after [{}]", self.trace.join(" -> ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_names_method() {
        let err = NvimError::request("nvim_get_var", "Key not found: foo");
        assert_eq!(err.op(), Some("nvim_get_var"));
        assert_eq!(err.to_string(), "`nvim_get_var` failed: Key not found: foo");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_trail_sets_missing_op() {
        let err = NvimError::logical("boom").with_trail(["delay", "read:nvim_eval"]);
        assert_eq!(err.op(), Some("read:nvim_eval"));
        assert_eq!(err.trace().len(), 2);
        assert!(err.report().contains("delay -> read:nvim_eval"));
    }
}
