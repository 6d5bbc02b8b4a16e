//! The UDP protocol engine: one [`Ctx`] multiplexes request/response
//! exchanges, block-wise transfers and observations over a single datagram
//! socket talking to a single peer.
//!
//! The context performs no I/O on its own: an outer event loop feeds it
//! datagrams through [`Ctx::handle_incoming_packet`] and fires
//! [`Ctx::handle_timeout`] whenever [`Ctx::next_timeout`] comes due.
//!
//! Every user callback is invoked synchronously from those two entry
//! points (or from the public API itself) and is allowed to re-enter the
//! engine: send new requests, set up responses, or cancel any exchange,
//! including the one currently being delivered. Internally this works by
//! detaching the callback from its exchange before invoking it and by
//! recording in-progress deliveries so that a re-entrant cancel is applied
//! after the callback returns.

mod client;
mod exchange;
mod observe;
mod server;

pub use exchange::ExchangeId;
use exchange::{Exchange, IdAlloc, Role};
pub use observe::ObserveId;

use alloc::vec::Vec;
use core::mem;
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};
use rand::RngCore;

use crate::cache::{NotifyIdCache, ResponseCache};
use crate::code::Code;
use crate::config::{Config, UdpTxParams};
use crate::error::Error;
use crate::msg::{self, Kind};
use crate::options::{Options, OptionsView};
use crate::socket::Socket;
use crate::time::TimeProvider;
use crate::token::Token;

use observe::Observation;

/// Terminal and intermediate states delivered to a client response handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
	/// Final response received; the exchange is over.
	Ok,
	/// One block of a BLOCK2 response; more will follow.
	PartialContent,
	Fail,
	Cancel,
}

/// States delivered to a server-side request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequestState {
	/// The request (or its final block) arrived in full.
	Received,
	/// One BLOCK1 chunk arrived; more will follow.
	PartialContent,
	/// The exchange is being torn down; no request data is attached.
	Cleanup,
}

/// Reliability requested for an outgoing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPreference {
	Confirmable,
	NonConfirmable,
}

/// A (possibly partial) response as seen by a client response handler.
pub struct Response<'a> {
	pub code: Code,
	pub options: OptionsView<'a>,
	/// Payload starting at `payload_offset` within the full response body.
	pub payload: &'a [u8],
	pub payload_offset: usize,
}

/// A (possibly partial) request as seen by a server request handler.
pub struct ServerRequest<'a> {
	pub code: Code,
	pub options: OptionsView<'a>,
	pub payload: &'a [u8],
	pub payload_offset: usize,
	/// Present when the request establishes an observation (Observe=0).
	pub observe: Option<ObserveId>,
}

/// Header of a freshly arrived request, handed to the new-request callback
/// before any exchange exists for it.
pub struct IncomingRequest<'a> {
	pub code: Code,
	pub options: OptionsView<'a>,
	pub token: Token,
}

/// Code and options of an outgoing request.
#[derive(Clone, Default)]
pub struct RequestHeader {
	pub code: Code,
	pub options: Options,
}

/// Code and options of an outgoing response or notification.
#[derive(Clone, Default)]
pub struct ResponseHeader {
	pub code: Code,
	pub options: Options,
}

pub type ResponseHandler<S, R> = Box<dyn FnMut(&mut Ctx<S, R>, ExchangeId, RequestState, Option<&Response<'_>>)>;
pub type RequestHandler<S, R> =
	Box<dyn FnMut(&mut Ctx<S, R>, ExchangeId, ServerRequestState, Option<&ServerRequest<'_>>) -> Result<(), ()>>;
/// Fills `buf` with payload bytes starting at the given absolute offset and
/// returns how many bytes it wrote. Writing less than `buf.len()` marks the
/// end of the payload. Returning `Err` aborts the exchange; the writer may
/// also cancel any exchange, including the one (passed by id) it is
/// producing payload for.
pub type PayloadWriter<S, R> =
	Box<dyn FnMut(&mut Ctx<S, R>, ExchangeId, usize, &mut [u8]) -> Result<usize, ()>>;
pub type DeliveryHandler<S, R> = Box<dyn FnOnce(&mut Ctx<S, R>, Result<(), Error>)>;
pub type ObserveCancelHandler<S, R> = Box<dyn FnOnce(&mut Ctx<S, R>, ObserveId)>;
pub type NewRequestCallback<'c, S, R> = &'c mut dyn FnMut(&mut Ctx<S, R>, &IncomingRequest<'_>) -> Result<(), Code>;

/// Message counters of one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
	/// Duplicate Confirmable requests answered from the response cache.
	pub incoming_retransmissions: u64,
	/// Confirmable transmissions re-sent after an ACK timeout.
	pub outgoing_retransmissions: u64,
}

/// One in-progress user-callback invocation. A re-entrant cancel of the
/// same exchange is recorded here and applied once the callback returns.
struct Delivery {
	id: ExchangeId,
	cancel: bool,
}

pub(crate) enum Chunk {
	Data(Vec<u8>),
	Cancelled,
	Failed,
}

/// Result of one server request-handler invocation.
pub(crate) enum HandlerOutcome {
	Ok,
	/// The handler reported an error; the request is answered with 5.00.
	HandlerError,
	/// The exchange was cancelled or removed during the call.
	Gone,
}

/// State of the request currently going through the new-request callback
/// and the request handler; used by `accept_async_request` and
/// `observe_async_start`.
pub(crate) struct CurrentRequest {
	pub kind: Kind,
	pub token: Token,
	pub observe: Option<u32>,
	pub accepted: Option<ExchangeId>,
}

/// The CoAP/UDP context. One context owns one socket and talks to one
/// peer; `S` is the socket capability and `R` the PRNG used for tokens,
/// message ids and retransmission jitter.
pub struct Ctx<S: Socket, R: RngCore> {
	pub(crate) socket: S,
	pub(crate) rng: R,
	clock: Arc<dyn TimeProvider>,
	pub(crate) tx_params: UdpTxParams,
	pub(crate) exchange_max_time: Duration,
	in_buf: Vec<u8>,
	in_buf_size: usize,
	out_buf: Vec<u8>,
	next_msg_id: u16,
	pub(crate) id_alloc: IdAlloc,
	pub(crate) exchanges: Vec<Exchange<S, R>>,
	pub(crate) observations: Vec<Observation<S, R>>,
	pub(crate) response_cache: Option<ResponseCache>,
	pub(crate) notify_ids: NotifyIdCache,
	stats: Stats,
	deliveries: Vec<Delivery>,
	pub(crate) current_request: Option<CurrentRequest>,
	pub(crate) torn_down: bool,
}

impl<S: Socket, R: RngCore> Ctx<S, R> {
	pub fn new(socket: S, mut rng: R, clock: Arc<dyn TimeProvider>, config: Config) -> Result<Self, Error> {
		config.validate()?;

		let response_cache = match config.response_cache_size {
			0 => None,
			size => Some(ResponseCache::new(size, config.exchange_max_time)),
		};

		let next_msg_id = rng.next_u32() as u16;

		Ok(Ctx {
			socket,
			rng,
			clock,
			tx_params: config.tx_params,
			exchange_max_time: config.exchange_max_time,
			in_buf: alloc::vec![0; config.input_buffer_size],
			in_buf_size: config.input_buffer_size,
			out_buf: alloc::vec![0; config.output_buffer_size],
			next_msg_id,
			id_alloc: IdAlloc::default(),
			exchanges: Vec::new(),
			observations: Vec::new(),
			response_cache,
			notify_ids: NotifyIdCache::new(config.notify_cache_size),
			stats: Stats::default(),
			deliveries: Vec::new(),
			current_request: None,
			torn_down: false,
		})
	}

	pub fn tx_params(&self) -> &UdpTxParams {
		&self.tx_params
	}

	/// Swaps the transmission parameters at runtime. An invalid set is
	/// rejected and the previous one stays in force. Raising NSTART may
	/// immediately put held exchanges on the wire.
	pub fn set_tx_params(&mut self, params: UdpTxParams) -> Result<(), Error> {
		params.validate()?;
		self.tx_params = params;
		self.promote_held();
		Ok(())
	}

	pub fn stats(&self) -> Stats {
		self.stats
	}

	/// Direct access to the owned socket, e.g. for adjusting its receive
	/// timeout between event-loop turns.
	pub fn socket_mut(&mut self) -> &mut S {
		&mut self.socket
	}

	pub(crate) fn now(&self) -> Instant {
		self.clock.now()
	}

	pub(crate) fn next_token(&mut self) -> Token {
		Token::new(&self.rng.next_u64().to_be_bytes()).unwrap_or_default()
	}

	pub(crate) fn alloc_msg_id(&mut self) -> u16 {
		let id = self.next_msg_id;
		self.next_msg_id = id.wrapping_add(1);
		id
	}

	pub(crate) fn index_of(&self, id: ExchangeId) -> Option<usize> {
		self.exchanges.iter().position(|ex| ex.id == id)
	}

	/// Whether a handler or writer of this exchange is on the call stack.
	pub(crate) fn delivering(&self, id: ExchangeId) -> bool {
		self.deliveries.iter().any(|d| d.id == id)
	}

	pub(crate) fn bump_incoming_retransmissions(&mut self) {
		self.stats.incoming_retransmissions += 1;
	}

	// ------------------------------------------------------------------
	// Outgoing frames

	/// Serializes one message into the output buffer, puts it on the wire
	/// and returns the exact bytes for retransmission or caching.
	pub(crate) fn build_and_send(
		&mut self,
		kind: Kind,
		code: Code,
		msg_id: u16,
		token: &Token,
		options: &Options,
		payload: &[u8],
	) -> Result<Vec<u8>, Error> {
		let mut out = mem::take(&mut self.out_buf);

		let result = msg::serialize(kind, code, msg_id, token, options.bytes(), payload, &mut out);

		let bytes = match result {
			Ok(len) => out[..len].to_vec(),
			Err(e) => {
				self.out_buf = out;
				return Err(e);
			}
		};

		self.out_buf = out;
		self.socket.send(&bytes)?;
		trace!("sent {} {} id={} ({} bytes)", code, msg_id, token.len(), bytes.len());

		Ok(bytes)
	}

	pub(crate) fn send_empty(&mut self, kind: Kind, msg_id: u16) -> Result<(), Error> {
		self.build_and_send(kind, Code::EMPTY, msg_id, &Token::default(), &Options::new(), &[])?;
		Ok(())
	}

	/// Payload capacity of one outgoing message, assuming a worst-case
	/// token and leaving room for one block option plus the marker.
	pub(crate) fn payload_space(&self, options_len: usize) -> usize {
		self.out_buf
			.len()
			.saturating_sub(msg::HEADER_LEN + Token::MAX_LEN + options_len + 5 + 1)
	}

	/// Largest usable block size given the current options, or `None` when
	/// not even a 16-byte block fits into the output buffer.
	pub(crate) fn max_block_size(&self, options_len: usize) -> Option<u16> {
		let space = self.payload_space(options_len).min(1024);

		if space < 16 {
			return None;
		}

		// Largest power of two not exceeding `space`.
		Some(1 << (15 - (space as u16).leading_zeros()))
	}

	/// Block size used when restarting a transfer whose response did not
	/// fit into the input buffer.
	pub(crate) fn input_block_size(&self) -> Option<u16> {
		let space = (self.in_buf_size / 2).min(1024);

		if space < 16 {
			return None;
		}

		Some(1 << (15 - (space as u16).leading_zeros()))
	}

	// ------------------------------------------------------------------
	// Payload writers

	fn take_writer(&mut self, id: ExchangeId) -> Option<crate::udp::PayloadWriter<S, R>> {
		let idx = self.index_of(id)?;

		match &mut self.exchanges[idx].role {
			Role::Client(c) => c.writer.take(),
			Role::Server(s) => s.response.as_mut().and_then(|r| r.writer.take()),
			Role::Notify(n) => n.writer.take(),
		}
	}

	fn put_writer(&mut self, id: ExchangeId, writer: crate::udp::PayloadWriter<S, R>) {
		let Some(idx) = self.index_of(id) else { return };

		match &mut self.exchanges[idx].role {
			Role::Client(c) => c.writer = Some(writer),
			Role::Server(s) => {
				if let Some(r) = s.response.as_mut() {
					r.writer = Some(writer);
				}
			}
			Role::Notify(n) => n.writer = Some(writer),
		}
	}

	/// Asks the exchange's payload writer for up to `want` bytes at
	/// `offset`. The writer may re-enter the engine, including cancelling
	/// the exchange it is writing for.
	pub(crate) fn writer_chunk(&mut self, id: ExchangeId, offset: usize, want: usize) -> Chunk {
		if self.index_of(id).is_none() {
			return Chunk::Cancelled;
		}

		let Some(mut writer) = self.take_writer(id) else {
			return Chunk::Data(Vec::new());
		};

		let mut buf = alloc::vec![0; want];

		self.deliveries.push(Delivery { id, cancel: false });
		let result = writer(self, id, offset, &mut buf);
		let cancel = self.deliveries.pop().map(|d| d.cancel).unwrap_or(false);

		let alive = self.index_of(id).is_some();

		if alive {
			self.put_writer(id, writer);
		}

		if cancel {
			self.finish_cancel(id);
			return Chunk::Cancelled;
		}

		if !alive {
			return Chunk::Cancelled;
		}

		match result {
			Ok(len) if len <= want => {
				buf.truncate(len);
				Chunk::Data(buf)
			}
			Ok(len) => {
				warn!("payload writer claims {len} bytes in a {want}-byte chunk");
				Chunk::Failed
			}
			Err(()) => Chunk::Failed,
		}
	}

	// ------------------------------------------------------------------
	// Deliveries and cancellation

	/// Invokes the client response handler with the usual detach dance:
	/// the handler is removed from the exchange for the duration of the
	/// call so it can freely re-enter the engine. Terminal states consume
	/// the exchange; a re-entrant cancel during a non-terminal delivery is
	/// honored by a follow-up Cancel delivery.
	pub(crate) fn deliver_client(&mut self, id: ExchangeId, state: RequestState, response: Option<&Response<'_>>) {
		let terminal = !matches!(state, RequestState::PartialContent);

		let Some(idx) = self.index_of(id) else { return };

		let handler = self.exchanges[idx].client_mut().and_then(|c| c.handler.take());

		let Some(mut handler) = handler else {
			if terminal {
				self.exchanges.remove(idx);
				self.promote_held();
			}
			return;
		};

		self.deliveries.push(Delivery { id, cancel: false });
		handler(self, id, state, response);
		let cancel = self.deliveries.pop().map(|d| d.cancel).unwrap_or(false);

		let Some(idx) = self.index_of(id) else {
			self.promote_held();
			return;
		};

		if terminal {
			self.exchanges.remove(idx);
			self.promote_held();
		} else if cancel {
			self.exchanges.remove(idx);
			handler(self, id, RequestState::Cancel, None);
			self.promote_held();
		} else if let Some(c) = self.exchanges[idx].client_mut() {
			c.handler = Some(handler);
		}
	}

	pub(crate) fn fail_client(&mut self, id: ExchangeId) {
		self.deliver_client(id, RequestState::Fail, None);
	}

	/// Invokes a server request handler for a Received/PartialContent
	/// state, distinguishing a handler-reported error from the exchange
	/// disappearing under us.
	pub(crate) fn deliver_server_request(
		&mut self,
		id: ExchangeId,
		state: ServerRequestState,
		request: &ServerRequest<'_>,
	) -> HandlerOutcome {
		let Some(idx) = self.index_of(id) else { return HandlerOutcome::Gone };

		let handler = self.exchanges[idx].server_mut().and_then(|s| s.handler.take());

		let Some(mut handler) = handler else { return HandlerOutcome::Ok };

		self.deliveries.push(Delivery { id, cancel: false });
		let result = handler(self, id, state, Some(request));
		let cancel = self.deliveries.pop().map(|d| d.cancel).unwrap_or(false);

		let Some(idx) = self.index_of(id) else { return HandlerOutcome::Gone };

		if cancel {
			self.exchanges.remove(idx);
			let _ = handler(self, id, ServerRequestState::Cleanup, None);
			self.promote_held();
			return HandlerOutcome::Gone;
		}

		if let Some(s) = self.exchanges[idx].server_mut() {
			s.handler = Some(handler);
		}

		match result {
			Ok(()) => HandlerOutcome::Ok,
			Err(()) => HandlerOutcome::HandlerError,
		}
	}

	/// Removes a server exchange and tells its handler that it is gone.
	pub(crate) fn cleanup_server(&mut self, id: ExchangeId) {
		let Some(idx) = self.index_of(id) else { return };

		let ex = self.exchanges.remove(idx);

		if let Role::Server(mut s) = ex.role {
			if let Some(mut handler) = s.handler.take() {
				let _ = handler(self, id, ServerRequestState::Cleanup, None);
			}
		}

		self.promote_held();
	}

	/// Removes a notification exchange and reports the delivery outcome.
	pub(crate) fn finish_notify(&mut self, id: ExchangeId, result: Result<(), Error>) {
		let Some(idx) = self.index_of(id) else { return };

		let ex = self.exchanges.remove(idx);

		if let Role::Notify(mut n) = ex.role {
			if let Some(delivery) = n.delivery.take() {
				delivery(self, result);
			}
		}

		self.promote_held();
	}

	fn finish_cancel(&mut self, id: ExchangeId) {
		let Some(idx) = self.index_of(id) else { return };

		let ex = self.exchanges.remove(idx);

		match ex.role {
			Role::Client(mut c) => {
				if let Some(mut handler) = c.handler.take() {
					handler(self, id, RequestState::Cancel, None);
				}
			}
			Role::Server(mut s) => {
				if let Some(mut handler) = s.handler.take() {
					let _ = handler(self, id, ServerRequestState::Cleanup, None);
				}
			}
			Role::Notify(mut n) => {
				if let Some(delivery) = n.delivery.take() {
					delivery(self, Err(Error::Cancelled));
				}
			}
		}

		self.promote_held();
	}

	/// Terminates an exchange. If its handler has not yet seen a terminal
	/// state it is invoked with Cancel (Cleanup for server exchanges).
	/// Unknown ids are ignored. Safe to call from inside any handler or
	/// payload writer, including for the exchange currently being
	/// delivered.
	pub fn exchange_cancel(&mut self, id: ExchangeId) {
		if !id.is_valid() {
			return;
		}

		// The exchange is currently inside a handler or writer call;
		// record the cancel and let the invoker apply it.
		if let Some(delivery) = self.deliveries.iter_mut().rev().find(|d| d.id == id) {
			delivery.cancel = true;
			return;
		}

		self.finish_cancel(id);
	}

	// ------------------------------------------------------------------
	// NSTART admission

	pub(crate) fn unconfirmed_count(&self) -> usize {
		self.exchanges
			.iter()
			.filter(|ex| match &ex.role {
				Role::Client(c) => {
					c.kind == Kind::Confirmable && !c.held && !c.separate && c.retransmit_at.is_some()
				}
				Role::Notify(n) => !n.held && n.awaiting_ack,
				Role::Server(_) => false,
			})
			.count()
	}

	pub(crate) fn has_held(&self) -> bool {
		self.exchanges.iter().any(|ex| match &ex.role {
			Role::Client(c) => c.held,
			Role::Notify(n) => n.held,
			Role::Server(_) => false,
		})
	}

	/// Puts held exchanges on the wire while NSTART admits them. Runs
	/// whenever an unconfirmed slot frees up, before control returns to
	/// the event loop.
	pub(crate) fn promote_held(&mut self) {
		if self.torn_down {
			return;
		}

		loop {
			if self.unconfirmed_count() >= self.tx_params.nstart {
				return;
			}

			let held = self.exchanges.iter().find_map(|ex| match &ex.role {
				Role::Client(c) if c.held => Some(ex.id),
				Role::Notify(n) if n.held => Some(ex.id),
				_ => None,
			});

			let Some(id) = held else { return };

			let is_client = {
				let Some(idx) = self.index_of(id) else { continue };
				match &mut self.exchanges[idx].role {
					Role::Client(c) => {
						c.held = false;
						true
					}
					Role::Notify(n) => {
						n.held = false;
						false
					}
					Role::Server(_) => continue,
				}
			};

			let result = if is_client {
				self.transmit_request(id)
			} else {
				self.transmit_notify(id)
			};

			match result {
				Ok(()) => {}
				Err(Error::Cancelled) => {}
				Err(e) => {
					debug!("failed to transmit held exchange {id}: {e}");
					if is_client {
						self.fail_client(id);
					} else {
						self.finish_notify(id, Err(e));
					}
				}
			}
		}
	}

	// ------------------------------------------------------------------
	// Timers

	/// Earliest instant at which [`Ctx::handle_timeout`] has work to do.
	pub fn next_timeout(&self) -> Option<Instant> {
		self.exchanges.iter().filter_map(|ex| ex.next_deadline()).min()
	}

	/// Fires every due retransmission and lifetime deadline.
	pub fn handle_timeout(&mut self) {
		loop {
			let now = self.now();

			let due = self
				.exchanges
				.iter()
				.find(|ex| ex.next_deadline().is_some_and(|d| d <= now))
				.map(|ex| ex.id);

			let Some(id) = due else { return };

			self.process_deadline(id, now);
		}
	}

	fn process_deadline(&mut self, id: ExchangeId, now: Instant) {
		enum Action {
			GiveUp,
			Resend(Vec<u8>),
			Nothing,
		}

		let Some(idx) = self.index_of(id) else { return };
		let params = self.tx_params;

		// First pass under the exchange borrow: update the retry state and
		// decide what to do; side effects happen once the borrow is gone.
		fn plan(
			retry: &mut Option<crate::retry::RetryState>,
			retransmit_at: &mut Option<Instant>,
			expire_at: Instant,
			last_sent: &[u8],
			params: &UdpTxParams,
			now: Instant,
		) -> Action {
			if expire_at <= now {
				return Action::GiveUp;
			}

			let Some(mut state) = *retry else {
				*retransmit_at = None;
				return Action::Nothing;
			};

			if state.all_retries_sent(params) {
				return Action::GiveUp;
			}

			state.advance();
			*retry = Some(state);
			*retransmit_at = Some(now + state.recv_timeout);

			Action::Resend(last_sent.to_vec())
		}

		let action = match &mut self.exchanges[idx].role {
			Role::Client(c) => plan(&mut c.retry, &mut c.retransmit_at, c.expire_at, &c.last_sent, &params, now),
			Role::Server(s) => plan(&mut s.retry, &mut s.retransmit_at, s.expire_at, &s.last_sent, &params, now),
			Role::Notify(n) => plan(&mut n.retry, &mut n.retransmit_at, n.expire_at, &n.last_sent, &params, now),
		};

		match action {
			Action::Nothing => {}
			Action::GiveUp => {
				debug!("exchange {id} ran out of time");
				self.conclude(id, Error::TimedOut);
			}
			Action::Resend(bytes) => {
				self.stats.outgoing_retransmissions += 1;

				if self.socket.send(&bytes).is_err() {
					warn!("retransmission of {id} failed");
					self.conclude(id, Error::Socket(crate::error::SocketError::Io));
				}
			}
		}
	}

	/// Ends an exchange with the failure reporting appropriate to its role.
	fn conclude(&mut self, id: ExchangeId, error: Error) {
		let Some(idx) = self.index_of(id) else { return };

		match self.exchanges[idx].role {
			Role::Client(_) => self.fail_client(id),
			Role::Server(_) => self.cleanup_server(id),
			Role::Notify(_) => self.finish_notify(id, Err(error)),
		}
	}

	// ------------------------------------------------------------------
	// Incoming datagrams

	/// Pulls datagrams from the socket and dispatches them until the
	/// socket's receive timeout strikes. Logical protocol errors surface
	/// through handler invocations and still yield `Ok`; only a socket in
	/// an unusable state produces `Err`.
	pub fn handle_incoming_packet(
		&mut self,
		mut on_request: Option<NewRequestCallback<'_, S, R>>,
	) -> Result<(), Error> {
		loop {
			let mut buf = mem::take(&mut self.in_buf);

			if buf.len() != self.in_buf_size {
				buf = alloc::vec![0; self.in_buf_size];
			}

			let received = self.socket.recv(&mut buf);

			let result = match received {
				Err(e) => Err(Error::Socket(e)),
				Ok(None) => Ok(None),
				Ok(Some(full_len)) => {
					let seen = full_len.min(buf.len());
					let data = &buf[..seen];

					if full_len > buf.len() {
						trace!("datagram truncated from {} to {} bytes", full_len, seen);
						self.on_truncated(data).map(Some)
					} else {
						self.dispatch(data, &mut on_request).map(Some)
					}
				}
			};

			self.in_buf = buf;

			match result {
				Ok(Some(())) => continue,
				Ok(None) => return Ok(()),
				Err(e) => return Err(e),
			}
		}
	}

	fn dispatch(
		&mut self,
		data: &[u8],
		on_request: &mut Option<NewRequestCallback<'_, S, R>>,
	) -> Result<(), Error> {
		let msg = match msg::parse(data) {
			Ok(msg) => msg,
			Err(_) => {
				self.on_unparseable(data);
				return Ok(());
			}
		};

		match msg.kind {
			Kind::Acknowledgement => self.on_ack(&msg),
			Kind::Reset => {
				self.on_reset(msg.msg_id);
				Ok(())
			}
			Kind::Confirmable | Kind::NonConfirmable => {
				if msg.code.is_empty() {
					// CoAP ping; a NON Empty message has no defined
					// meaning and is dropped.
					if msg.kind == Kind::Confirmable {
						self.send_empty(Kind::Reset, msg.msg_id)?;
					}
					Ok(())
				} else if msg.code.is_request() {
					self.on_incoming_request(&msg, on_request)
				} else if msg.code.is_response() {
					self.on_messaged_response(&msg)
				} else {
					debug!("ignoring {:?} message with code {}", msg.kind, msg.code);
					Ok(())
				}
			}
		}
	}

	/// A datagram the strict parser rejected. Header and token may still
	/// be readable; a response shape that matches a pending exchange fails
	/// that exchange, everything else is dropped silently per RFC 7252
	/// §4.2.
	fn on_unparseable(&mut self, data: &[u8]) {
		let Some(head) = msg::parse_head_only(data) else {
			debug!("dropping malformed datagram of {} bytes", data.len());
			return;
		};

		if !head.code.is_response() {
			debug!("dropping malformed {:?} with code {}", head.kind, head.code);
			return;
		}

		let matched = match head.kind {
			Kind::Acknowledgement => self.find_client_by_msg_id(head.msg_id, &head.token),
			Kind::Confirmable | Kind::NonConfirmable => self.find_client_by_token(&head.token),
			Kind::Reset => None,
		};

		match matched {
			Some(id) => {
				warn!("response for exchange {id} is malformed");
				self.fail_client(id);
			}
			None => debug!("dropping malformed response"),
		}
	}

	pub(crate) fn find_client_by_msg_id(&self, msg_id: u16, token: &Token) -> Option<ExchangeId> {
		self.exchanges.iter().find_map(|ex| {
			ex.client()
				.filter(|c| !c.held && c.msg_id == msg_id && c.token == *token)
				.map(|_| ex.id)
		})
	}

	pub(crate) fn find_client_by_token(&self, token: &Token) -> Option<ExchangeId> {
		self.exchanges.iter().find_map(|ex| {
			ex.client().filter(|c| !c.held && c.token == *token).map(|_| ex.id)
		})
	}
}

impl<S: Socket, R: RngCore> Drop for Ctx<S, R> {
	/// Teardown cancels every live exchange in creation order, then every
	/// observation.
	fn drop(&mut self) {
		self.torn_down = true;

		while let Some(ex) = (!self.exchanges.is_empty()).then(|| self.exchanges.remove(0)) {
			let id = ex.id;

			match ex.role {
				Role::Client(mut c) => {
					if let Some(mut handler) = c.handler.take() {
						handler(self, id, RequestState::Cancel, None);
					}
				}
				Role::Server(mut s) => {
					if let Some(mut handler) = s.handler.take() {
						let _ = handler(self, id, ServerRequestState::Cleanup, None);
					}
				}
				Role::Notify(mut n) => {
					if let Some(delivery) = n.delivery.take() {
						delivery(self, Err(Error::Cancelled));
					}
				}
			}
		}

		while let Some(observation) = (!self.observations.is_empty()).then(|| self.observations.remove(0)) {
			let token = observation.token;
			self.cancel_observation_entry(observation, token);
		}
	}
}
