//! Server-side exchanges: accepting requests, piggybacked and separate
//! responses, BLOCK1 request reassembly and BLOCK2 response serving.

use alloc::vec::Vec;

use log::{debug, warn};
use rand::RngCore;

use crate::code::Code;
use crate::error::Error;
use crate::msg::{Kind, Msg};
use crate::options::{self, BlockKind, BlockOption, Options};
use crate::retry::RetryState;
use crate::socket::Socket;
use crate::token::Token;

use super::exchange::{Block1Rx, Block2Tx, Exchange, PreparedResponse, Role, ServerExchange};
use super::{
	Chunk, Ctx, CurrentRequest, ExchangeId, HandlerOutcome, IncomingRequest, NewRequestCallback,
	ObserveId, PayloadWriter, RequestHandler, ResponseHeader, ServerRequest, ServerRequestState,
};

impl<S: Socket, R: RngCore> Ctx<S, R> {
	/// Promotes the request currently going through the new-request
	/// callback into a tracked exchange whose lifecycle is reported to
	/// `handler`. Only valid from within that callback.
	pub fn accept_async_request(&mut self, handler: RequestHandler<S, R>) -> Result<ExchangeId, Error> {
		let now = self.now();
		let expire_at = now + self.exchange_max_time;

		let id = self.id_alloc.next();

		let Some(current) = &mut self.current_request else {
			warn!("no incoming request to accept");
			return Err(Error::InvalidParams);
		};

		if current.accepted.is_some() {
			return Err(Error::InvalidParams);
		}

		current.accepted = Some(id);

		let server = ServerExchange {
			handler: Some(handler),
			request_kind: current.kind,
			request_token: current.token,
			observe_token: (current.observe == Some(0)).then_some(current.token),
			block1: None,
			response: None,
			block2: None,
			expire_at,
			con_msg_id: None,
			retry: None,
			retransmit_at: None,
			last_sent: Vec::new(),
		};

		self.exchanges.push(Exchange { id, role: Role::Server(server) });

		Ok(id)
	}

	/// Hands the engine the response for an accepted request. Called from
	/// inside the request handler it produces a piggybacked ACK response;
	/// called later it goes out as a separate response (Confirmable when
	/// the request was, with its own retransmission schedule).
	pub fn setup_async_response(
		&mut self,
		id: ExchangeId,
		header: ResponseHeader,
		writer: Option<PayloadWriter<S, R>>,
	) -> Result<(), Error> {
		let mut opts = header.options;

		// The engine owns the block options and the Observe counter.
		opts.remove(options::BLOCK1);
		opts.remove(options::BLOCK2);
		opts.remove(options::OBSERVE);

		{
			let idx = self.index_of(id).ok_or(Error::UnknownExchange)?;
			let s = self.exchanges[idx].server_mut().ok_or(Error::UnknownExchange)?;

			if s.response.is_some() {
				return Err(Error::InvalidParams);
			}

			s.response = Some(PreparedResponse { code: header.code, options: opts, writer });
		}

		// Inside the request handler the response rides on the ACK, which
		// the post-handler path sends. Outside of it this is the separate
		// response moment.
		if !self.delivering(id) {
			self.send_first_response(id, None, None, None)?;
		}

		Ok(())
	}


	/// A well-formed request datagram.
	pub(crate) fn on_incoming_request(
		&mut self,
		msg: &Msg<'_>,
		on_request: &mut Option<NewRequestCallback<'_, S, R>>,
	) -> Result<(), Error> {
		let con = msg.kind == Kind::Confirmable;

		// Duplicates of recently answered Confirmable requests are
		// absorbed by replaying the cached response bytes verbatim.
		if con {
			let now = self.now();
			let cached = self
				.response_cache
				.as_mut()
				.and_then(|cache| cache.get(msg.msg_id, now))
				.map(|bytes| bytes.to_vec());

			if let Some(bytes) = cached {
				debug!("replaying cached response for duplicate request {}", msg.msg_id);
				self.bump_incoming_retransmissions();
				self.socket.send(&bytes).map_err(Error::Socket)?;
				return Ok(());
			}
		}

		let reply_kind = if con { Kind::Acknowledgement } else { Kind::NonConfirmable };
		let reply_msg_id = if con { msg.msg_id } else { self.alloc_msg_id() };

		if let Some(number) = msg.options.repeated_critical() {
			warn!("request repeats critical option {number}");
			return self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::BAD_OPTION);
		}

		let block1 = match msg.options.block(BlockKind::Block1) {
			Ok(block) => block,
			Err(_) => return self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::BAD_OPTION),
		};

		let block2 = match msg.options.block(BlockKind::Block2) {
			Ok(block) => block,
			Err(_) => return self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::BAD_OPTION),
		};

		if let Some(b) = &block1 {
			if b.has_more && msg.payload.len() != b.size as usize {
				warn!("Block1 claims more data but the block is not full");
				return self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::BAD_OPTION);
			}
		}

		// A request continuing an in-progress transfer is matched by the
		// exact byte offset it carries, not by its token: every block may
		// legally arrive under a fresh one.
		if let Some(b1) = block1 {
			if b1.offset() > 0 {
				if let Some(id) = self.find_block1_continuation(b1.offset()) {
					return self.continue_block1_request(id, msg, b1, block2);
				}
			}
		}

		if let Some(b2) = block2 {
			if b2.offset() > 0 {
				if let Some(id) = self.find_block2_serving(b2.offset()) {
					return self.continue_block2_serving(id, msg, b2);
				}
			}
		}

		self.start_new_request(msg, block1, block2, on_request)
	}

	fn find_block1_continuation(&self, offset: usize) -> Option<ExchangeId> {
		self.exchanges.iter().find_map(|ex| match &ex.role {
			Role::Server(s) if s.block1.as_ref().is_some_and(|b| b.next_offset == offset) => Some(ex.id),
			_ => None,
		})
	}

	fn find_block2_serving(&self, offset: usize) -> Option<ExchangeId> {
		self.exchanges.iter().find_map(|ex| match &ex.role {
			Role::Server(s)
				if s.response.is_some() && s.block2.as_ref().is_some_and(|b| b.next_offset == offset) =>
			{
				Some(ex.id)
			}
			Role::Notify(n) if n.block2.as_ref().is_some_and(|b| b.next_offset == offset) => Some(ex.id),
			_ => None,
		})
	}

	fn start_new_request(
		&mut self,
		msg: &Msg<'_>,
		block1: Option<BlockOption>,
		block2: Option<BlockOption>,
		on_request: &mut Option<NewRequestCallback<'_, S, R>>,
	) -> Result<(), Error> {
		let con = msg.kind == Kind::Confirmable;
		let reply_kind = if con { Kind::Acknowledgement } else { Kind::NonConfirmable };
		let reply_msg_id = if con { msg.msg_id } else { self.alloc_msg_id() };

		let observe = msg.options.observe();

		// Observe=1 is an explicit deregistration, whatever else the
		// request does.
		if observe == Some(1) {
			self.cancel_observation(msg.token);
		}

		let Some(callback) = on_request else {
			debug!("no request listener installed");
			return self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::INTERNAL_SERVER_ERROR);
		};

		self.current_request = Some(CurrentRequest {
			kind: msg.kind,
			token: msg.token,
			observe,
			accepted: None,
		});

		let incoming = IncomingRequest {
			code: msg.code,
			options: msg.options,
			token: msg.token,
		};

		let verdict = callback(self, &incoming);

		let accepted = self.current_request.as_ref().and_then(|r| r.accepted);

		if let Err(code) = verdict {
			self.current_request = None;

			if let Some(id) = accepted {
				self.exchange_cancel(id);
			}

			return self.respond_simple(reply_msg_id, &msg.token, reply_kind, code);
		}

		let Some(id) = accepted else {
			self.current_request = None;
			debug!("request listener accepted nothing");
			return self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::INTERNAL_SERVER_ERROR);
		};

		let partial = block1.as_ref().is_some_and(|b| b.has_more);

		let state = if partial {
			ServerRequestState::PartialContent
		} else {
			ServerRequestState::Received
		};

		let request = ServerRequest {
			code: msg.code,
			options: msg.options,
			payload: msg.payload,
			payload_offset: block1.as_ref().map(|b| b.offset()).unwrap_or(0),
			observe: (observe == Some(0)).then_some(ObserveId { token: msg.token }),
		};

		let outcome = self.deliver_server_request(id, state, &request);
		self.current_request = None;

		match outcome {
			HandlerOutcome::Gone => return Ok(()),
			HandlerOutcome::HandlerError => {
				self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::INTERNAL_SERVER_ERROR)?;
				self.cleanup_server(id);
				return Ok(());
			}
			HandlerOutcome::Ok => {}
		}

		if partial {
			// First BLOCK1 chunk: remember how far we got and ask for more.
			let Some(b1) = block1 else { return Ok(()) };

			if let Some(idx) = self.index_of(id) {
				if let Some(s) = self.exchanges[idx].server_mut() {
					s.block1 = Some(Block1Rx { next_offset: msg.payload.len() });
				}
			}

			return self.respond_continue(reply_msg_id, &msg.token, reply_kind, b1);
		}

		let has_response = self
			.index_of(id)
			.and_then(|idx| self.exchanges[idx].server_mut().map(|s| s.response.is_some()))
			.unwrap_or(false);

		if has_response {
			let echo = block1.map(|b| {
				// The final Block1 echo acknowledges the whole payload.
				BlockOption { kind: BlockKind::Block1, seq_num: b.seq_num, size: b.size, has_more: false }
			});

			return self.send_first_response(id, Some((reply_msg_id, msg.token, reply_kind)), block2, echo);
		}

		// No response yet: acknowledge receipt and wait for
		// setup_async_response.
		if con {
			self.send_empty(Kind::Acknowledgement, msg.msg_id)?;
		}

		Ok(())
	}

	fn continue_block1_request(
		&mut self,
		id: ExchangeId,
		msg: &Msg<'_>,
		b1: BlockOption,
		block2: Option<BlockOption>,
	) -> Result<(), Error> {
		let con = msg.kind == Kind::Confirmable;
		let reply_kind = if con { Kind::Acknowledgement } else { Kind::NonConfirmable };
		let reply_msg_id = if con { msg.msg_id } else { self.alloc_msg_id() };

		let now = self.now();
		let expire_at = now + self.exchange_max_time;

		{
			let Some(idx) = self.index_of(id) else { return Ok(()) };
			let Some(s) = self.exchanges[idx].server_mut() else { return Ok(()) };

			s.request_kind = msg.kind;
			s.request_token = msg.token;
			s.expire_at = expire_at;
		}

		let state = if b1.has_more {
			ServerRequestState::PartialContent
		} else {
			ServerRequestState::Received
		};

		let request = ServerRequest {
			code: msg.code,
			options: msg.options,
			payload: msg.payload,
			payload_offset: b1.offset(),
			observe: None,
		};

		match self.deliver_server_request(id, state, &request) {
			HandlerOutcome::Gone => return Ok(()),
			HandlerOutcome::HandlerError => {
				self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::INTERNAL_SERVER_ERROR)?;
				self.cleanup_server(id);
				return Ok(());
			}
			HandlerOutcome::Ok => {}
		}

		if b1.has_more {
			if let Some(idx) = self.index_of(id) {
				if let Some(s) = self.exchanges[idx].server_mut() {
					if let Some(b) = &mut s.block1 {
						b.next_offset += msg.payload.len();
					}
				}
			}

			return self.respond_continue(reply_msg_id, &msg.token, reply_kind, b1);
		}

		// Final block: the handler must have set up the response.
		{
			let Some(idx) = self.index_of(id) else { return Ok(()) };
			if let Some(s) = self.exchanges[idx].server_mut() {
				s.block1 = None;
			}
		}

		let has_response = self
			.index_of(id)
			.and_then(|idx| self.exchanges[idx].server_mut().map(|s| s.response.is_some()))
			.unwrap_or(false);

		if !has_response {
			if con {
				self.send_empty(Kind::Acknowledgement, msg.msg_id)?;
			}

			return Ok(());
		}

		let echo = BlockOption {
			kind: BlockKind::Block1,
			seq_num: b1.seq_num,
			size: b1.size,
			has_more: false,
		};

		self.send_first_response(id, Some((reply_msg_id, msg.token, reply_kind)), block2, Some(echo))
	}

	/// Serves the next BLOCK2 block of an in-progress response or
	/// notification transfer. The requested block size is honored up to
	/// what the output buffer allows; the request handler is not involved.
	fn continue_block2_serving(&mut self, id: ExchangeId, msg: &Msg<'_>, b2: BlockOption) -> Result<(), Error> {
		let con = msg.kind == Kind::Confirmable;
		let reply_kind = if con { Kind::Acknowledgement } else { Kind::NonConfirmable };
		let reply_msg_id = if con { msg.msg_id } else { self.alloc_msg_id() };

		let now = self.now();
		let expire_at = now + self.exchange_max_time;

		let (code, stored_opts) = {
			let Some(idx) = self.index_of(id) else { return Ok(()) };

			match &mut self.exchanges[idx].role {
				Role::Server(s) => {
					s.expire_at = expire_at;
					s.request_kind = msg.kind;
					s.request_token = msg.token;

					let Some(r) = &s.response else { return Ok(()) };
					(r.code, r.options.clone())
				}
				Role::Notify(n) => {
					n.expire_at = expire_at;
					(n.code, n.options.clone())
				}
				Role::Client(_) => return Ok(()),
			}
		};

		let offset = b2.offset();

		let mut opts = stored_opts;

		let max = match self.max_block_size(opts.len()) {
			Some(max) => max,
			None => {
				self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::INTERNAL_SERVER_ERROR)?;
				self.cleanup_server(id);
				return Ok(());
			}
		};

		let size = b2.size.min(max);

		let chunk = match self.writer_chunk(id, offset, size as usize) {
			Chunk::Data(data) => data,
			Chunk::Cancelled => {
				return self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::INTERNAL_SERVER_ERROR)
			}
			Chunk::Failed => {
				self.respond_simple(reply_msg_id, &msg.token, reply_kind, Code::INTERNAL_SERVER_ERROR)?;
				self.cleanup_server(id);
				return Ok(());
			}
		};

		let has_more = chunk.len() == size as usize;

		opts.set_block(BlockOption::new(BlockKind::Block2, (offset / size as usize) as u32, size, has_more)?);

		self.respond(reply_kind, code, reply_msg_id, &msg.token, &opts, &chunk)?;

		enum After {
			Keep,
			CleanupServer,
			FinishNotify,
		}

		let after = {
			let Some(idx) = self.index_of(id) else { return Ok(()) };

			match &mut self.exchanges[idx].role {
				Role::Server(s) => {
					if has_more {
						if let Some(b) = &mut s.block2 {
							b.next_offset = offset + chunk.len();
						}
						After::Keep
					} else {
						s.block2 = None;
						After::CleanupServer
					}
				}
				Role::Notify(n) => {
					if has_more {
						if let Some(b) = &mut n.block2 {
							b.next_offset = offset + chunk.len();
						}
						After::Keep
					} else {
						n.block2 = None;
						After::FinishNotify
					}
				}
				Role::Client(_) => After::Keep,
			}
		};

		match after {
			After::Keep => {}
			After::CleanupServer => self.cleanup_server(id),
			After::FinishNotify => self.maybe_finish_notify(id),
		}

		Ok(())
	}

	/// Sends the first message of a prepared response: piggybacked on the
	/// request's ACK when `reply_to` is given, as a separate CON/NON
	/// message otherwise.
	pub(crate) fn send_first_response(
		&mut self,
		id: ExchangeId,
		reply_to: Option<(u16, Token, Kind)>,
		requested_block2: Option<BlockOption>,
		block1_echo: Option<BlockOption>,
	) -> Result<(), Error> {
		let (code, mut opts, observe_token, request_kind, request_token) = {
			let Some(idx) = self.index_of(id) else { return Ok(()) };
			let Some(s) = self.exchanges[idx].server_mut() else { return Ok(()) };

			let Some(r) = &s.response else { return Err(Error::InvalidParams) };

			(r.code, r.options.clone(), s.observe_token, s.request_kind, s.request_token)
		};

		// The response establishing an observation carries the first
		// Observe counter value.
		if let Some(token) = observe_token {
			if self.has_observation(&token) {
				if let Some(seq) = self.take_observe_seq(&token) {
					opts.set_observe(seq);
				}
			}
		}

		if let Some(echo) = block1_echo {
			opts.set_block(echo);
		}

		let (reply_msg_id, token, reply_kind) = match reply_to {
			Some((msg_id, token, kind)) => (msg_id, token, kind),
			None => {
				let kind = match request_kind {
					Kind::Confirmable => Kind::Confirmable,
					_ => Kind::NonConfirmable,
				};
				(self.alloc_msg_id(), request_token, kind)
			}
		};

		let offset = requested_block2.map(|b| b.offset()).unwrap_or(0);

		let max = match self.max_block_size(opts.len()) {
			Some(max) => max,
			None => {
				self.respond_simple(reply_msg_id, &token, reply_kind, Code::INTERNAL_SERVER_ERROR)?;
				self.cleanup_server(id);
				return Ok(());
			}
		};

		let size = requested_block2.map(|b| b.size.min(max)).unwrap_or(max);

		let chunk = match self.writer_chunk(id, offset, size as usize) {
			Chunk::Data(data) => data,
			Chunk::Cancelled => {
				// The writer cancelled its own exchange; the peer still
				// needs an answer to stop retransmitting.
				return self.respond_simple(reply_msg_id, &token, reply_kind, Code::INTERNAL_SERVER_ERROR);
			}
			Chunk::Failed => {
				self.respond_simple(reply_msg_id, &token, reply_kind, Code::INTERNAL_SERVER_ERROR)?;
				self.cleanup_server(id);
				return Ok(());
			}
		};

		let has_more = chunk.len() == size as usize;

		if has_more || requested_block2.is_some() {
			opts.set_block(BlockOption::new(
				BlockKind::Block2,
				(offset / size as usize) as u32,
				size,
				has_more,
			)?);
		}

		let bytes = self.respond(reply_kind, code, reply_msg_id, &token, &opts, &chunk)?;

		let separate_con = reply_to.is_none() && reply_kind == Kind::Confirmable;

		let now = self.now();
		let retry = separate_con.then(|| RetryState::new(&self.tx_params, &mut self.rng));

		let Some(idx) = self.index_of(id) else { return Ok(()) };
		let Some(s) = self.exchanges[idx].server_mut() else { return Ok(()) };

		if has_more {
			s.block2 = Some(Block2Tx { next_offset: offset + chunk.len() });
		}

		if let Some(retry) = retry {
			s.con_msg_id = Some(reply_msg_id);
			s.retry = Some(retry);
			s.retransmit_at = Some(now + retry.recv_timeout);
			s.last_sent = bytes;
		}

		if !has_more && !separate_con {
			self.cleanup_server(id);
		}

		Ok(())
	}

	fn respond_continue(
		&mut self,
		msg_id: u16,
		token: &Token,
		kind: Kind,
		b1: BlockOption,
	) -> Result<(), Error> {
		let mut opts = Options::new();
		opts.set_block(BlockOption {
			kind: BlockKind::Block1,
			seq_num: b1.seq_num,
			size: b1.size,
			has_more: true,
		});

		self.respond(kind, Code::CONTINUE, msg_id, token, &opts, &[])?;
		Ok(())
	}

	/// Sends a bare response code, e.g. 4.02 Bad Option or 5.00.
	pub(crate) fn respond_simple(
		&mut self,
		msg_id: u16,
		token: &Token,
		kind: Kind,
		code: Code,
	) -> Result<(), Error> {
		self.respond(kind, code, msg_id, token, &Options::new(), &[])?;
		Ok(())
	}

	/// Sends one response message and, for ACKs, remembers its bytes so a
	/// duplicate of the request is answered identically.
	fn respond(
		&mut self,
		kind: Kind,
		code: Code,
		msg_id: u16,
		token: &Token,
		opts: &Options,
		payload: &[u8],
	) -> Result<Vec<u8>, Error> {
		let bytes = self.build_and_send(kind, code, msg_id, token, opts, payload)?;

		if kind == Kind::Acknowledgement {
			let now = self.now();

			if let Some(cache) = &mut self.response_cache {
				cache.insert(msg_id, &bytes, now);
			}
		}

		Ok(bytes)
	}

}
