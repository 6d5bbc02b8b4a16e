use alloc::vec::Vec;
use core::fmt::{self, Debug, Display};
use std::time::Instant;

use rand::RngCore;

use crate::code::Code;
use crate::msg::Kind;
use crate::options::Options;
use crate::retry::RetryState;
use crate::socket::Socket;
use crate::token::Token;

use super::{DeliveryHandler, PayloadWriter, RequestHandler, ResponseHandler};

/// Process-wide unique identifier of one exchange. Ids are allocated
/// monotonically and never reused; 0 is the distinguished invalid value
/// returned for fire-and-forget sends.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExchangeId(u64);

impl ExchangeId {
	pub const INVALID: ExchangeId = ExchangeId(0);

	pub fn is_valid(self) -> bool {
		self.0 != 0
	}
}

impl Display for ExchangeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

impl Debug for ExchangeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		<Self as Display>::fmt(self, f)
	}
}

#[derive(Default)]
pub(crate) struct IdAlloc {
	last: u64,
}

impl IdAlloc {
	pub fn next(&mut self) -> ExchangeId {
		self.last += 1;
		ExchangeId(self.last)
	}
}

/// Client-side BLOCK1 progress: how much of the request payload has been
/// acknowledged, and the block size in force (it may only shrink).
pub(crate) struct Block1Tx {
	pub next_offset: usize,
	pub size: u16,
	/// Bytes carried by the transmission currently awaiting its ACK.
	pub last_chunk_len: usize,
}

/// Client-side BLOCK2 progress: the next payload byte the handler expects.
pub(crate) struct Block2Rx {
	pub next_offset: usize,
	pub size: u16,
	/// ETag of the first block; later blocks must match bit for bit.
	pub etag: Option<Vec<u8>>,
	/// False until the first response block actually arrived.
	pub started: bool,
}

pub(crate) struct ClientExchange<S: Socket, R: RngCore> {
	pub token: Token,
	pub msg_id: u16,
	pub kind: Kind,
	pub code: Code,
	pub options: Options,
	pub writer: Option<PayloadWriter<S, R>>,
	pub handler: Option<ResponseHandler<S, R>>,
	pub held: bool,
	/// An Empty ACK arrived; the response will come separately.
	pub separate: bool,
	pub retry: Option<RetryState>,
	pub retransmit_at: Option<Instant>,
	pub expire_at: Instant,
	pub block1: Option<Block1Tx>,
	pub block2: Option<Block2Rx>,
	/// Explicit starting offset requested by the user before the first
	/// send or from within the response handler.
	pub next_payload_offset: Option<usize>,
	/// Exact bytes of the latest transmission, re-sent verbatim on retry.
	pub last_sent: Vec<u8>,
}

/// Server-side BLOCK2 progress: how much of the response payload has been
/// handed to the peer.
pub(crate) struct Block2Tx {
	pub next_offset: usize,
}

/// Server-side BLOCK1 progress: the next request payload byte we expect.
pub(crate) struct Block1Rx {
	pub next_offset: usize,
}

pub(crate) struct PreparedResponse<S: Socket, R: RngCore> {
	pub code: Code,
	pub options: Options,
	pub writer: Option<PayloadWriter<S, R>>,
}

pub(crate) struct ServerExchange<S: Socket, R: RngCore> {
	pub handler: Option<RequestHandler<S, R>>,
	pub request_kind: Kind,
	pub request_token: Token,
	/// Set when the originating request carried Observe=0.
	pub observe_token: Option<Token>,
	pub block1: Option<Block1Rx>,
	pub response: Option<PreparedResponse<S, R>>,
	pub block2: Option<Block2Tx>,
	pub expire_at: Instant,
	/// Message id of a separate Confirmable response awaiting its ACK.
	pub con_msg_id: Option<u16>,
	pub retry: Option<RetryState>,
	pub retransmit_at: Option<Instant>,
	pub last_sent: Vec<u8>,
}

pub(crate) struct NotifyExchange<S: Socket, R: RngCore> {
	pub observe_token: Token,
	pub msg_id: u16,
	pub kind: Kind,
	pub code: Code,
	/// Response options without the Observe option; continuation blocks
	/// must not carry it.
	pub options: Options,
	pub writer: Option<PayloadWriter<S, R>>,
	pub delivery: Option<DeliveryHandler<S, R>>,
	pub block2: Option<Block2Tx>,
	/// Observe counter value, consumed by the first transmission.
	pub observe_seq: Option<u32>,
	pub held: bool,
	pub awaiting_ack: bool,
	pub retry: Option<RetryState>,
	pub retransmit_at: Option<Instant>,
	pub expire_at: Instant,
	pub last_sent: Vec<u8>,
}

pub(crate) enum Role<S: Socket, R: RngCore> {
	Client(ClientExchange<S, R>),
	Server(ServerExchange<S, R>),
	Notify(NotifyExchange<S, R>),
}

pub(crate) struct Exchange<S: Socket, R: RngCore> {
	pub id: ExchangeId,
	pub role: Role<S, R>,
}

impl<S: Socket, R: RngCore> Exchange<S, R> {
	pub fn client(&self) -> Option<&ClientExchange<S, R>> {
		match &self.role {
			Role::Client(c) => Some(c),
			_ => None,
		}
	}

	pub fn client_mut(&mut self) -> Option<&mut ClientExchange<S, R>> {
		match &mut self.role {
			Role::Client(c) => Some(c),
			_ => None,
		}
	}

	pub fn server_mut(&mut self) -> Option<&mut ServerExchange<S, R>> {
		match &mut self.role {
			Role::Server(s) => Some(s),
			_ => None,
		}
	}

	pub fn notify_mut(&mut self) -> Option<&mut NotifyExchange<S, R>> {
		match &mut self.role {
			Role::Notify(n) => Some(n),
			_ => None,
		}
	}

	/// Earliest instant at which this exchange needs a timer tick.
	pub fn next_deadline(&self) -> Option<Instant> {
		let (retransmit_at, expire_at) = match &self.role {
			Role::Client(c) => (c.retransmit_at, Some(c.expire_at)),
			Role::Server(s) => (s.retransmit_at, Some(s.expire_at)),
			Role::Notify(n) => (n.retransmit_at, Some(n.expire_at)),
		};

		match (retransmit_at, expire_at) {
			(Some(r), Some(e)) => Some(r.min(e)),
			(r, e) => r.or(e),
		}
	}
}
