use thiserror::Error;

use crate::code::Code;

/// Errors surfaced by the protocol engine, either as return values of the
/// public API or through handler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
	#[error("malformed message")]
	Malformed,
	#[error("repeated non-repeatable critical option {0}")]
	RepeatedCriticalOption(u16),
	#[error("peer answered with Reset")]
	ResetReceived,
	#[error("exchange timed out")]
	TimedOut,
	#[error("socket error: {0}")]
	Socket(#[from] SocketError),
	#[error("block seq number would exceed 20 bits")]
	BlockSeqNumOverflow,
	#[error("ETag changed between blocks of one transfer")]
	EtagMismatch,
	#[error("exchange cancelled")]
	Cancelled,
	#[error("user handler failed")]
	UserHandlerError,
	#[error("buffer too small")]
	BufferTooSmall,
	#[error("invalid transmission parameters")]
	InvalidParams,
	#[error("{0} is not a request code")]
	NotARequest(Code),
	#[error("no observation established for this token")]
	UnknownObservation,
	#[error("no exchange with this id")]
	UnknownExchange,
	#[error("invalid block option")]
	InvalidBlockOption,
}

/// Transport-level failure reported by the socket capability. The distinct
/// kinds mirror the errno values the engine cares about; everything else is
/// lumped into `Io`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
	#[error("connection refused")]
	ConnRefused,
	#[error("receive timed out")]
	TimedOut,
	#[error("protocol error")]
	Proto,
	#[error("no such device")]
	NoDevice,
	#[error("I/O error")]
	Io,
}
