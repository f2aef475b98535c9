use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// The result type used throughout the protocol stack. `Err` carries a [Status] whose code a
///  caller can match on to decide policy (most importantly: `Unavailable` is the one transient,
///  safe-to-retry code - everything else is terminal for the operation that saw it).
pub type StatusResult<T> = Result<T, Status>;

/// Status codes shared across all protocol layers. The numeric values are part of the wire
///  format: stream abort / end-of-stream fragments carry the code as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
}

/// A status code plus an optional human-readable message.
///
/// NB: Unlike `anyhow`-style errors this is a *value* - an `Ok` status is representable because
///      end-of-stream frames carry one on the wire, and close paths pass one around.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        }
        else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Status {
        Status { code, message: message.into() }
    }

    pub fn ok() -> Status {
        Status::new(StatusCode::Ok, "")
    }

    pub fn cancelled() -> Status {
        Status::new(StatusCode::Cancelled, "")
    }

    pub fn unknown(message: impl Into<String>) -> Status {
        Status::new(StatusCode::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(StatusCode::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(StatusCode::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Status {
        Status::new(StatusCode::FailedPrecondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(StatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(StatusCode::Unavailable, message)
    }

    pub fn data_loss(message: impl Into<String>) -> Status {
        Status::new(StatusCode::DataLoss, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// An `Ok` status is not meaningful for aborting pending work - closing with `Ok` must still
    ///  cancel whatever has not completed yet.
    pub fn or_cancelled(&self) -> Status {
        if self.is_ok() {
            Status::cancelled()
        }
        else {
            self.clone()
        }
    }

    pub fn as_result(&self) -> StatusResult<()> {
        if self.is_ok() {
            Ok(())
        }
        else {
            Err(self.clone())
        }
    }

    pub fn from_result(result: &StatusResult<()>) -> Status {
        match result {
            Ok(()) => Status::ok(),
            Err(status) => status.clone(),
        }
    }
}

/// Translates a `oneshot` receive result into the status contract: a completion sender that was
///  dropped without firing counts as cancellation, so every registered completion is observed
///  exactly once even across teardown.
pub fn recv_status(received: Result<StatusResult<()>, tokio::sync::oneshot::error::RecvError>) -> StatusResult<()> {
    match received {
        Ok(result) => result,
        Err(_) => Err(Status::cancelled()),
    }
}
