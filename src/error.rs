// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::any::Any;
use thiserror::Error;

/// Result type alias that all filato public API functions can use.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Composite error type for everything the runtime produces.
///
/// The enum is `Clone` because a one-shot result can fan out to any number of
/// waiters, each of which receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The task observed a cancellation signal at a suspension point.
    ///
    /// This is re-raised inside the cancelled task itself, never inside its
    /// parent. A task that wants to keep running after a cancel request can
    /// intercept it with [`unset_cancelled`].
    ///
    /// [`unset_cancelled`]: crate::task::unset_cancelled
    #[error("cancelled")]
    Cancelled,

    /// A cancel request targeted a task that had already finished.
    #[error("dead")]
    Dead,

    /// A pipe worker exceeded the per-item timeout of its stage.
    #[error("timeout")]
    Timeout,

    /// The task body panicked. The payload is the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A failure raised by user code: a task body returning an error, a
    /// promise failed explicitly, or a pipe `catch` hook replacing an error.
    #[error("{0}")]
    Fail(String),
}

impl Error {
    /// Builds a user-raised failure from a message.
    pub fn fail(msg: impl Into<String>) -> Error {
        Error::Fail(msg.into())
    }

    /// True iff this error is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Error {
        Error::Fail(msg.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::Fail(msg)
    }
}

// Panic payloads are almost always `&str` or `String`; anything else gets a
// placeholder so the original failure is not silently dropped.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancelled_err_msg() {
        assert_eq!(Error::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn dead_err_msg() {
        assert_eq!(Error::Dead.to_string(), "dead");
    }

    #[test]
    fn timeout_err_msg() {
        assert_eq!(Error::Timeout.to_string(), "timeout");
    }

    #[test]
    fn fail_err_msg_is_verbatim() {
        assert_eq!(Error::fail("boom").to_string(), "boom");
        let err: Error = "boom".into();
        assert_eq!(err, Error::Fail("boom".to_string()));
    }

    #[test]
    fn panicked_err_msg() {
        assert_eq!(
            Error::Panicked("at the disco".to_string()).to_string(),
            "task panicked: at the disco"
        );
    }

    #[test]
    fn panic_payload_extraction() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42_u32)), "unknown panic payload");
    }
}
