//! Error abstractions.
//!
//! Failures split along two axes. The *kind* is either `Client`, a
//! domain-meaningful failure of a user-initiated call whose message flows
//! back to the caller, or `Internal`, which covers transport,
//! serialization and library faults and crosses the wire as an opaque
//! `"internal error"`. The *propagation* rule is that service boundaries
//! normalize: a method handler serializes whatever it threw into a wire
//! envelope, and the requesting side deserializes it back into the same
//! kind, preserving `code`, `message` and `details` but not the local
//! cause chain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The wire code of a client-kind error.
pub const CODE_CLIENT: &str = "EFAIL";
/// The wire code of an internal-kind error.
pub const CODE_INTERNAL: &str = "EINTERNAL";

const MSG_INTERNAL: &str = "internal error";

/// Application error variants.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum AppError {
    /// A domain-meaningful failure of a user-initiated call.
    ///
    /// The message is preserved across service boundaries.
    #[error("{message}")]
    Client {
        message: String,
        details: BTreeMap<String, serde_json::Value>,
    },
    /// Any other failure, locally attributed via its details map and cause
    /// chain, genericized when it crosses the wire from an opaque origin.
    #[error("{message}")]
    Internal {
        message: String,
        details: BTreeMap<String, serde_json::Value>,
    },
}

impl AppError {
    /// Create a new client-kind error.
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
            details: Default::default(),
        }
    }

    /// Create a new internal-kind error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            details: Default::default(),
        }
    }

    /// Attach a detail entry to this error.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        match &mut self {
            Self::Client { details, .. } | Self::Internal { details, .. } => {
                details.insert(key.into(), value.into());
            }
        }
        self
    }
}

/// The error type signalling that an operation was interrupted by shutdown.
///
/// Retry loops and sleeps observing a cancelled token fail with this error;
/// the fault sink recognizes it anywhere in a cause chain and suppresses
/// the report, as shutdown is not a fault.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("operation canceled by shutdown")]
pub struct Canceled;

/// The serialized form of an error as it crosses a service boundary.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WireError {
    /// The error code, `EFAIL` or `EINTERNAL`.
    pub code: String,
    /// The error message.
    pub message: String,
    /// Structured attribution data.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// A service method response: a result or a serialized error, never both.
///
/// An inbound payload matching neither shape is a protocol error and
/// surfaces as a deserialization failure on the requesting side.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Result { result: T },
    Error { error: WireError },
}

/// Serialize an error for transport across a service boundary.
///
/// Client errors keep their message and details. Explicitly constructed
/// internal errors keep theirs as well; anything else is opaque and is
/// genericized so that internals do not leak to callers.
pub fn serialize_error(err: &anyhow::Error) -> WireError {
    match err.downcast_ref::<AppError>() {
        Some(AppError::Client { message, details }) => WireError {
            code: CODE_CLIENT.into(),
            message: message.clone(),
            details: details.clone(),
        },
        Some(AppError::Internal { message, details }) => WireError {
            code: CODE_INTERNAL.into(),
            message: message.clone(),
            details: details.clone(),
        },
        None => WireError {
            code: CODE_INTERNAL.into(),
            message: MSG_INTERNAL.into(),
            details: Default::default(),
        },
    }
}

/// Deserialize a wire error back into an application error.
///
/// Unknown codes deserialize as internal errors.
pub fn deserialize_error(wire: WireError) -> AppError {
    if wire.code == CODE_CLIENT {
        AppError::Client {
            message: wire.message,
            details: wire.details,
        }
    } else {
        AppError::Internal {
            message: wire.message,
            details: wire.details,
        }
    }
}
