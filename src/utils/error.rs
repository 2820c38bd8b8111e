//! Error types shared across the broker, the client connection and the
//! market handlers.
//!
//! The taxonomy follows the delivery protocol:
//!
//! - [`ConnectionError`]: the broker cannot be reached, refuses the session or
//!   the transport breaks. Fatal for the component holding the connection.
//! - [`PublishError`]: a single publish was refused. Reported, never retried.
//! - [`ProcessingError`]: a delivered payload could not be interpreted. Always
//!   contained to that one message, which is then nacked without requeue.
//! - [`ProtocolViolation`]: a settlement that should be impossible under
//!   correct use. Logged at error level wherever it is detected.
//!
//! Server-side failures are expressed as [`BrokerError`], which maps to a
//! wire-level [`ErrorCode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::message::DeliveryTag;

/// Why a routing key or binding pattern was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingKeyError {
    #[error("routing key is empty")]
    Empty,
    #[error("routing key exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("`{key}` contains an empty segment")]
    EmptySegment { key: String },
    #[error("invalid character {ch:?} in segment `{segment}`")]
    InvalidCharacter { segment: String, ch: char },
    #[error("wildcard must occupy a whole segment, found `{segment}`")]
    MisplacedWildcard { segment: String },
}

/// Settlement misuse. These never happen when the session API is used as
/// intended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("delivery {0} is still unsettled")]
    Unsettled(DeliveryTag),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),
    #[error("delivery {0} was already settled")]
    AlreadySettled(DeliveryTag),
}

/// Stable error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    PreconditionFailed,
    InvalidRoutingKey,
    InvalidPattern,
    ProtocolViolation,
    NotOpen,
    AccessRefused,
    MalformedFrame,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::PreconditionFailed => "precondition_failed",
            ErrorCode::InvalidRoutingKey => "invalid_routing_key",
            ErrorCode::InvalidPattern => "invalid_pattern",
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::NotOpen => "not_open",
            ErrorCode::AccessRefused => "access_refused",
            ErrorCode::MalformedFrame => "malformed_frame",
            ErrorCode::InternalError => "internal_error",
        };
        f.write_str(label)
    }
}

/// Failures of the embedded store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors raised by broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),
    #[error("queue `{0}` not found")]
    QueueNotFound(String),
    #[error("consumer `{0}` not found")]
    ConsumerNotFound(String),
    #[error("client `{0}` is not registered")]
    UnknownClient(String),
    #[error("`{name}` already declared with durable={existing}")]
    PreconditionFailed { name: String, existing: bool },
    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(RoutingKeyError),
    #[error("invalid binding pattern: {0}")]
    InvalidPattern(RoutingKeyError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error("session must be opened with hello first")]
    NotOpened,
    #[error("unknown virtual host `{0}`")]
    UnknownVhost(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BrokerError {
    /// The wire code reported to the peer for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::ExchangeNotFound(_)
            | BrokerError::QueueNotFound(_)
            | BrokerError::ConsumerNotFound(_)
            | BrokerError::UnknownClient(_) => ErrorCode::NotFound,
            BrokerError::PreconditionFailed { .. } => ErrorCode::PreconditionFailed,
            BrokerError::InvalidRoutingKey(_) => ErrorCode::InvalidRoutingKey,
            BrokerError::InvalidPattern(_) => ErrorCode::InvalidPattern,
            BrokerError::Protocol(_) => ErrorCode::ProtocolViolation,
            BrokerError::NotOpened => ErrorCode::NotOpen,
            BrokerError::UnknownVhost(_) => ErrorCode::AccessRefused,
            BrokerError::Storage(_) => ErrorCode::InternalError,
        }
    }
}

/// Errors of the server accept loop.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),
}

/// Errors of a client connection to the broker.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid broker uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("broker at {endpoint} is unreachable: {source}")]
    Unreachable {
        endpoint: String,
        source: tungstenite::Error,
    },
    #[error("broker refused the request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("connection is closed")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("frame codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors returned by [`crate::connection::Publisher::publish`].
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("no open connection to the broker")]
    BrokerUnavailable,
    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(#[from] RoutingKeyError),
    #[error("payload must serialize to a JSON object: {0}")]
    InvalidPayload(String),
    #[error("broker rejected the message ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error(transparent)]
    Connection(ConnectionError),
}

impl From<ConnectionError> for PublishError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Rejected { code, message } => PublishError::Rejected { code, message },
            ConnectionError::Closed => PublishError::BrokerUnavailable,
            other => PublishError::Connection(other),
        }
    }
}

/// Domain failure while interpreting one delivery.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("payload is not a valid {kind}: {source}")]
    Decode {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors that end a consumption loop.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}
