#![forbid(unsafe_code)]

use parley_protocol::AckStatus;
use parley_store::StoreError;
use thiserror::Error;

/// Failure taxonomy for connection operations.
///
/// Authentication failures terminate the connection; every other
/// variant is reported only on the caller's acknowledgment channel and
/// never broadcast.
#[derive(Debug, Error)]
pub enum OpError {
	#[error("authentication failed: {0}")]
	AuthenticationFailed(String),

	#[error("user is not a participant of this room")]
	NotAMember,

	#[error("invalid payload: {0}")]
	InvalidPayload(String),

	#[error("room or message not found")]
	NotFound,

	#[error("operation not permitted for this user")]
	Forbidden,

	#[error("internal error: {0}")]
	Internal(StoreError),
}

impl OpError {
	pub fn ack_status(&self) -> AckStatus {
		match self {
			OpError::AuthenticationFailed(_) => AckStatus::AuthenticationFailed,
			OpError::NotAMember => AckStatus::NotAMember,
			OpError::InvalidPayload(_) => AckStatus::InvalidPayload,
			OpError::NotFound => AckStatus::NotFound,
			OpError::Forbidden => AckStatus::Forbidden,
			OpError::Internal(_) => AckStatus::Internal,
		}
	}

	/// Caller-facing detail string. Internal failures are not leaked.
	pub fn detail(&self) -> String {
		match self {
			OpError::Internal(_) => "internal error".to_string(),
			other => other.to_string(),
		}
	}
}

impl From<StoreError> for OpError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound => OpError::NotFound,
			other => OpError::Internal(other),
		}
	}
}
