//! Client-side exchanges: sending requests, matching responses, BLOCK1
//! request chunking and BLOCK2 response reassembly.

use alloc::vec::Vec;

use log::{debug, warn};
use rand::RngCore;

use crate::code::Code;
use crate::error::Error;
use crate::msg::{Kind, Msg};
use crate::options::{self, BlockKind, BlockOption};
use crate::retry::RetryState;
use crate::socket::Socket;
use crate::token::Token;

use super::exchange::{Block1Tx, Block2Rx, ClientExchange, Exchange, Role};
use super::{Chunk, Ctx, ExchangeId, PayloadWriter, RequestHeader, RequestState, Response, ResponseHandler};

impl<S: Socket, R: RngCore> Ctx<S, R> {
	/// Starts a new exchange towards the peer.
	///
	/// Confirmable requests enter the NSTART admission queue and are
	/// retransmitted with exponential backoff until acknowledged.
	/// Non-confirmable requests go on the wire immediately; without a
	/// `handler` no state is retained and the invalid id is returned.
	///
	/// A `writer` supplies the request payload chunk by chunk; payloads
	/// that do not fit one datagram are sent as a BLOCK1 transfer. The
	/// header may carry an explicit Block1 option to start the transfer at
	/// a given offset, or a Block2 option to request a response from a
	/// given offset.
	pub fn send_async_request(
		&mut self,
		kind: Kind,
		header: RequestHeader,
		writer: Option<PayloadWriter<S, R>>,
		handler: Option<ResponseHandler<S, R>>,
	) -> Result<ExchangeId, Error> {
		if self.torn_down {
			return Err(Error::Cancelled);
		}

		if !matches!(kind, Kind::Confirmable | Kind::NonConfirmable) {
			return Err(Error::InvalidParams);
		}

		if !header.code.is_request() {
			warn!("{} cannot start a request", header.code);
			return Err(Error::NotARequest(header.code));
		}

		let mut opts = header.options;

		// The engine manages both block options from here on.
		let block1 = opts.block(BlockKind::Block1)?;
		let block2 = opts.block(BlockKind::Block2)?;
		opts.remove(options::BLOCK1);
		opts.remove(options::BLOCK2);

		let id = self.id_alloc.next();
		let now = self.now();
		let retained = handler.is_some();

		let client = ClientExchange {
			token: Token::default(),
			msg_id: 0,
			kind,
			code: header.code,
			options: opts,
			writer,
			handler,
			held: false,
			separate: false,
			retry: None,
			retransmit_at: None,
			expire_at: now + self.exchange_max_time,
			block1: block1.map(|b| Block1Tx {
				next_offset: b.offset(),
				size: b.size,
				last_chunk_len: 0,
			}),
			block2: block2.map(|b| Block2Rx {
				next_offset: b.offset(),
				size: b.size,
				etag: None,
				started: false,
			}),
			next_payload_offset: None,
			last_sent: Vec::new(),
		};

		if kind == Kind::NonConfirmable {
			self.exchanges.push(Exchange { id, role: Role::Client(client) });

			if let Err(e) = self.transmit_non_request(id) {
				if let Some(idx) = self.index_of(id) {
					self.exchanges.remove(idx);
				}
				return Err(e);
			}

			if !retained {
				if let Some(idx) = self.index_of(id) {
					self.exchanges.remove(idx);
				}
				return Ok(ExchangeId::INVALID);
			}

			return Ok(id);
		}

		let held = self.unconfirmed_count() >= self.tx_params.nstart || self.has_held();

		let mut client = client;
		client.held = held;
		self.exchanges.push(Exchange { id, role: Role::Client(client) });

		if !held {
			match self.transmit_request(id) {
				Ok(()) | Err(Error::Cancelled) => {}
				Err(e) => {
					debug!("initial transmission of {id} failed: {e}");
					self.fail_client(id);
				}
			}
		}

		Ok(id)
	}

	/// Tells the engine which response payload byte the handler wants
	/// next; intervening BLOCK2 blocks are skipped. Valid before the first
	/// transmission or from within the response handler.
	pub fn set_next_response_payload_offset(&mut self, id: ExchangeId, offset: usize) -> Result<(), Error> {
		let idx = self.index_of(id).ok_or(Error::UnknownExchange)?;
		let c = self.exchanges[idx].client_mut().ok_or(Error::UnknownExchange)?;

		c.next_payload_offset = Some(offset);
		Ok(())
	}

	/// Builds and sends the current transmission of a client exchange:
	/// the next BLOCK1 chunk, a BLOCK2 continuation request, or the plain
	/// request. Every distinct transmission gets a fresh token and
	/// message id; retransmissions of it reuse the exact bytes.
	pub(crate) fn transmit_request(&mut self, id: ExchangeId) -> Result<(), Error> {
		let token = self.next_token();
		let msg_id = self.alloc_msg_id();

		let (kind, code, mut opts, has_writer, block1, block2, skip) = {
			let Some(idx) = self.index_of(id) else { return Err(Error::Cancelled) };
			let Some(c) = self.exchanges[idx].client_mut() else { return Err(Error::Cancelled) };

			c.token = token;
			c.msg_id = msg_id;

			(
				c.kind,
				c.code,
				c.options.clone(),
				c.writer.is_some(),
				c.block1.as_ref().map(|b| (b.next_offset, b.size)),
				c.block2.as_ref().map(|b| (b.next_offset, b.size)),
				c.next_payload_offset,
			)
		};

		let mut payload = Vec::new();
		let mut block1_sent: Option<(u16, usize)> = None;
		let mut block1_started = false;

		if let Some((offset, size)) = block1 {
			let max = self.max_block_size(opts.len()).ok_or(Error::BufferTooSmall)?;
			let size = size.min(max);

			let seq = (offset / size as usize) as u64;
			if seq > options::MAX_SEQ_NUM as u64 {
				return Err(Error::BlockSeqNumOverflow);
			}

			payload = match self.writer_chunk(id, offset, size as usize) {
				Chunk::Data(data) => data,
				Chunk::Cancelled => return Err(Error::Cancelled),
				Chunk::Failed => return Err(Error::UserHandlerError),
			};

			let has_more = payload.len() == size as usize;
			opts.set_block(BlockOption::new(BlockKind::Block1, seq as u32, size, has_more)?);
			block1_sent = Some((size, payload.len()));
		} else if has_writer {
			// No block transfer in progress yet: read up to one full block
			// and switch to BLOCK1 if the writer fills it entirely.
			let probe = self.max_block_size(opts.len()).ok_or(Error::BufferTooSmall)?;

			payload = match self.writer_chunk(id, 0, probe as usize) {
				Chunk::Data(data) => data,
				Chunk::Cancelled => return Err(Error::Cancelled),
				Chunk::Failed => return Err(Error::UserHandlerError),
			};

			if payload.len() == probe as usize {
				opts.set_block(BlockOption::new(BlockKind::Block1, 0, probe, true)?);
				block1_sent = Some((probe, payload.len()));
				block1_started = true;
			}
		}

		let mut block2_created: Option<(usize, u16)> = None;

		if let Some((next_offset, size)) = block2 {
			let seq = (next_offset / size as usize) as u64;
			if seq > options::MAX_SEQ_NUM as u64 {
				return Err(Error::BlockSeqNumOverflow);
			}

			opts.set_block(BlockOption::new(BlockKind::Block2, seq as u32, size, false)?);
		} else if let Some(target) = skip {
			// Start the response transfer right at the block covering the
			// requested offset.
			let size = self.input_block_size().ok_or(Error::BufferTooSmall)?;
			let seq = (target / size as usize) as u64;
			if seq > options::MAX_SEQ_NUM as u64 {
				return Err(Error::BlockSeqNumOverflow);
			}

			opts.set_block(BlockOption::new(BlockKind::Block2, seq as u32, size, false)?);
			block2_created = Some((target, size));
		}

		let bytes = self.build_and_send(kind, code, msg_id, &token, &opts, &payload)?;

		let now = self.now();
		let retry = (kind == Kind::Confirmable).then(|| RetryState::new(&self.tx_params, &mut self.rng));

		let Some(idx) = self.index_of(id) else { return Ok(()) };
		let Some(c) = self.exchanges[idx].client_mut() else { return Ok(()) };

		if let Some((size, chunk_len)) = block1_sent {
			if block1_started {
				c.block1 = Some(Block1Tx { next_offset: 0, size, last_chunk_len: chunk_len });
			} else if let Some(b) = &mut c.block1 {
				b.size = size;
				b.last_chunk_len = chunk_len;
			}
		}

		if let Some((target, size)) = block2_created {
			c.block2 = Some(Block2Rx { next_offset: target, size, etag: None, started: false });
			c.next_payload_offset = None;
		}

		c.separate = false;

		if let Some(retry) = retry {
			c.retry = Some(retry);
			c.retransmit_at = Some(now + retry.recv_timeout);
			c.last_sent = bytes;
		}

		Ok(())
	}

	/// Sends a non-confirmable request; a block-wise payload goes out as
	/// consecutive NON messages without waiting for anything. The server
	/// has no way to renegotiate the block size here.
	fn transmit_non_request(&mut self, id: ExchangeId) -> Result<(), Error> {
		loop {
			self.transmit_request(id)?;

			let Some(idx) = self.index_of(id) else { return Ok(()) };
			let Some(c) = self.exchanges[idx].client_mut() else { return Ok(()) };

			match &mut c.block1 {
				Some(b) if b.last_chunk_len == b.size as usize => {
					b.next_offset += b.last_chunk_len;
				}
				_ => return Ok(()),
			}
		}
	}

	// ------------------------------------------------------------------
	// Incoming matching

	pub(crate) fn on_ack(&mut self, msg: &Msg<'_>) -> Result<(), Error> {
		let msg_id = msg.msg_id;

		let client = self.exchanges.iter().find_map(|ex| {
			ex.client()
				.filter(|c| c.kind == Kind::Confirmable && !c.held && c.msg_id == msg_id)
				.map(|_| ex.id)
		});

		if let Some(id) = client {
			if msg.code.is_empty() {
				// Separate-response path: the request is acknowledged, the
				// response will arrive under its own message id.
				if let Some(idx) = self.index_of(id) {
					if let Some(c) = self.exchanges[idx].client_mut() {
						c.separate = true;
						c.retry = None;
						c.retransmit_at = None;
					}
				}

				self.promote_held();
				return Ok(());
			}

			let token_matches = self
				.index_of(id)
				.and_then(|idx| self.exchanges[idx].client())
				.map(|c| c.token == msg.token)
				.unwrap_or(false);

			if !token_matches {
				debug!("ACK {msg_id} has a matching id but a foreign token");
				return Ok(());
			}

			if let Some(number) = msg.options.repeated_critical() {
				warn!("response repeats critical option {number}");
				self.fail_client(id);
				return Ok(());
			}

			self.handle_response(id, msg);
			return Ok(());
		}

		if msg.code.is_empty() {
			if self.ack_notify(msg_id) {
				return Ok(());
			}

			if self.ack_server_response(msg_id) {
				return Ok(());
			}
		}

		debug!("ignoring unexpected ACK {msg_id}");
		Ok(())
	}

	fn ack_server_response(&mut self, msg_id: u16) -> bool {
		let id = self.exchanges.iter().find_map(|ex| match &ex.role {
			Role::Server(s) if s.con_msg_id == Some(msg_id) => Some(ex.id),
			_ => None,
		});

		let Some(id) = id else { return false };

		let done = {
			let Some(idx) = self.index_of(id) else { return true };
			let Some(s) = self.exchanges[idx].server_mut() else { return true };

			s.retry = None;
			s.retransmit_at = None;
			s.con_msg_id = None;

			s.block2.is_none()
		};

		if done {
			self.cleanup_server(id);
		}

		true
	}

	pub(crate) fn on_reset(&mut self, msg_id: u16) {
		let client = self.exchanges.iter().find_map(|ex| {
			ex.client().filter(|c| !c.held && c.msg_id == msg_id).map(|_| ex.id)
		});

		if let Some(id) = client {
			debug!("peer reset exchange {id}");
			self.fail_client(id);
			return;
		}

		if self.reset_notify(msg_id) {
			return;
		}

		let server = self.exchanges.iter().find_map(|ex| match &ex.role {
			Role::Server(s) if s.con_msg_id == Some(msg_id) => Some(ex.id),
			_ => None,
		});

		if let Some(id) = server {
			debug!("peer reset the separate response of {id}");
			self.cleanup_server(id);
			return;
		}

		// A late Reset for an already-forgotten notification still
		// cancels its observation through the notify id ring.
		if let Some(token) = self.notify_ids.token_for(msg_id) {
			self.cancel_observation(token);
		}
	}

	/// A response arriving as its own CON or NON message (separate
	/// response), matched by token.
	pub(crate) fn on_messaged_response(&mut self, msg: &Msg<'_>) -> Result<(), Error> {
		let Some(id) = self.find_client_by_token(&msg.token) else {
			debug!("response with unknown token");

			// Reject unexpected Confirmable responses so the peer stops
			// retransmitting them.
			if msg.kind == Kind::Confirmable {
				self.send_empty(Kind::Reset, msg.msg_id)?;
			}

			return Ok(());
		};

		if let Some(number) = msg.options.repeated_critical() {
			warn!("separate response repeats critical option {number}");

			if msg.kind == Kind::Confirmable {
				self.send_empty(Kind::Reset, msg.msg_id)?;
			}

			self.fail_client(id);
			return Ok(());
		}

		if msg.kind == Kind::Confirmable {
			if let Err(e) = self.send_empty(Kind::Acknowledgement, msg.msg_id) {
				warn!("failed to acknowledge a separate response");
				self.fail_client(id);
				return Err(e);
			}
		}

		self.handle_response(id, msg);
		Ok(())
	}

	/// A datagram longer than the input buffer. When it can be attributed
	/// to a live exchange, the transfer is restarted block-wise with a
	/// size that fits; a truncated request is answered with 4.13 as long
	/// as its token was readable.
	pub(crate) fn on_truncated(&mut self, data: &[u8]) -> Result<(), Error> {
		let Some(head) = crate::msg::parse_head_only(data) else {
			debug!("dropping truncated datagram with unreadable token");
			return Ok(());
		};

		if head.code.is_request() {
			if head.kind == Kind::Confirmable {
				self.respond_simple(
					head.msg_id,
					&head.token,
					Kind::Acknowledgement,
					Code::REQUEST_ENTITY_TOO_LARGE,
				)?;
			}

			return Ok(());
		}

		if !head.code.is_response() {
			return Ok(());
		}

		let matched = match head.kind {
			Kind::Acknowledgement => self.find_client_by_msg_id(head.msg_id, &head.token),
			Kind::Confirmable | Kind::NonConfirmable => self.find_client_by_token(&head.token),
			Kind::Reset => None,
		};

		let Some(id) = matched else {
			debug!("dropping truncated response");
			return Ok(());
		};

		self.restart_with_smaller_blocks(id);
		Ok(())
	}

	/// The response was too large for the input buffer: redo the request
	/// as a BLOCK2 transfer with blocks the buffer can hold.
	fn restart_with_smaller_blocks(&mut self, id: ExchangeId) {
		let Some(size) = self.input_block_size() else {
			debug!("input buffer cannot hold any block, failing {id}");
			self.fail_client(id);
			return;
		};

		{
			let Some(idx) = self.index_of(id) else { return };
			let Some(c) = self.exchanges[idx].client_mut() else { return };

			if c.block2.as_ref().is_some_and(|b| b.size <= size) {
				debug!("peer keeps sending blocks larger than the input buffer");
				self.fail_client(id);
				return;
			}

			let next_offset = c
				.block2
				.as_ref()
				.map(|b| b.next_offset)
				.or(c.next_payload_offset)
				.unwrap_or(0);

			c.block2 = Some(Block2Rx { next_offset, size, etag: None, started: false });
			c.retry = None;
			c.retransmit_at = None;
		}

		match self.transmit_request(id) {
			Ok(()) | Err(Error::Cancelled) => {}
			Err(e) => {
				debug!("block size renegotiation failed: {e}");
				self.fail_client(id);
			}
		}
	}

	// ------------------------------------------------------------------
	// Response processing

	fn handle_response(&mut self, id: ExchangeId, msg: &Msg<'_>) {
		{
			let Some(idx) = self.index_of(id) else { return };
			let Some(c) = self.exchanges[idx].client_mut() else { return };

			c.retry = None;
			c.retransmit_at = None;
		}

		// An in-progress BLOCK1 transfer continues on 2.31.
		if msg.code == Code::CONTINUE {
			self.continue_block1(id, msg);
			return;
		}

		// Any other code ends payload submission, even mid-transfer.
		{
			let Some(idx) = self.index_of(id) else { return };
			let Some(c) = self.exchanges[idx].client_mut() else { return };
			c.block1 = None;
		}

		let block2 = match msg.options.block(BlockKind::Block2) {
			Ok(block) => block,
			Err(_) => {
				warn!("response carries an unusable Block2 option");
				self.fail_client(id);
				return;
			}
		};

		match block2 {
			None => self.finish_plain_response(id, msg),
			Some(block) => self.handle_block2_response(id, msg, block),
		}
	}

	fn continue_block1(&mut self, id: ExchangeId, msg: &Msg<'_>) {
		let echo = match msg.options.block(BlockKind::Block1) {
			Ok(Some(echo)) => Some(echo),
			_ => None,
		};

		let advanced = {
			let Some(idx) = self.index_of(id) else { return };
			let Some(c) = self.exchanges[idx].client_mut() else { return };

			match (&mut c.block1, echo) {
				(Some(b), Some(echo)) => {
					b.next_offset += b.last_chunk_len;

					// The server may only shrink the block size.
					if echo.size < b.size {
						b.size = echo.size;
					}

					true
				}
				_ => {
					warn!("2.31 Continue without a BLOCK1 transfer to continue");
					false
				}
			}
		};

		if !advanced {
			self.fail_client(id);
			return;
		}

		match self.transmit_request(id) {
			Ok(()) | Err(Error::Cancelled) => {}
			Err(e) => {
				debug!("failed to send the next request block: {e}");
				self.fail_client(id);
			}
		}
	}

	fn finish_plain_response(&mut self, id: ExchangeId, msg: &Msg<'_>) {
		let transfer_started = {
			let Some(idx) = self.index_of(id) else { return };
			self.exchanges[idx]
				.client()
				.and_then(|c| c.block2.as_ref())
				.map(|b| b.started)
				.unwrap_or(false)
		};

		if transfer_started {
			warn!("BLOCK2 transfer continued with an unfragmented response");
			self.fail_client(id);
			return;
		}

		let response = Response {
			code: msg.code,
			options: msg.options,
			payload: msg.payload,
			payload_offset: 0,
		};

		self.deliver_client(id, RequestState::Ok, Some(&response));
	}

	fn handle_block2_response(&mut self, id: ExchangeId, msg: &Msg<'_>, block: BlockOption) {
		if block.has_more && msg.payload.len() != block.size as usize {
			warn!("Block2 claims more data but the block is not full");
			self.fail_client(id);
			return;
		}

		let expected = {
			let Some(idx) = self.index_of(id) else { return };
			let Some(c) = self.exchanges[idx].client_mut() else { return };

			let etag = msg.options.etag();

			match &mut c.block2 {
				Some(b) if b.started => {
					// ETag continuity across the whole transfer.
					let consistent = match (&b.etag, etag) {
						(Some(stored), Some(seen)) => stored.as_slice() == seen,
						(None, None) => true,
						_ => false,
					};

					if !consistent {
						warn!("resource changed mid-transfer");
						None
					} else {
						if block.size < b.size {
							b.size = block.size;
						}

						Some(b.next_offset)
					}
				}
				Some(b) => {
					b.started = true;
					b.etag = etag.map(|e| e.to_vec());

					if block.size < b.size {
						b.size = block.size;
					}

					// A skip-ahead requested before the first block arrived
					// may point into the middle of it.
					if let Some(target) = c.next_payload_offset.take() {
						b.next_offset = b.next_offset.max(target);
					}

					Some(b.next_offset)
				}
				None => {
					let next_offset = c.next_payload_offset.take().unwrap_or(0);

					c.block2 = Some(Block2Rx {
						next_offset,
						size: block.size,
						etag: etag.map(|e| e.to_vec()),
						started: true,
					});

					Some(next_offset)
				}
			}
		};

		let Some(expected) = expected else {
			self.fail_client(id);
			return;
		};

		let start = block.offset();
		let end = start + msg.payload.len();

		// The block must cover the byte the handler expects next.
		if expected < start || (expected >= end && !(msg.payload.is_empty() && expected == start)) {
			warn!(
				"Block2 covers {}..{} but the transfer expects offset {}",
				start, end, expected
			);
			self.fail_client(id);
			return;
		}

		let skip = expected - start;

		let response = Response {
			code: msg.code,
			options: msg.options,
			payload: &msg.payload[skip.min(msg.payload.len())..],
			payload_offset: expected,
		};

		if !block.has_more {
			self.deliver_client(id, RequestState::Ok, Some(&response));
			return;
		}

		self.deliver_client(id, RequestState::PartialContent, Some(&response));

		// The handler may have cancelled the exchange or skipped ahead.
		let proceed = {
			let Some(idx) = self.index_of(id) else { return };
			let Some(c) = self.exchanges[idx].client_mut() else { return };

			let target = c.next_payload_offset.take().unwrap_or(end).max(end);

			if let Some(b) = &mut c.block2 {
				b.next_offset = target;
			}

			// Continuation requests carry no payload.
			c.writer = None;
			c.block1 = None;

			true
		};

		if proceed {
			match self.transmit_request(id) {
				Ok(()) | Err(Error::Cancelled) => {}
				Err(e) => {
					debug!("failed to request the next response block: {e}");
					self.fail_client(id);
				}
			}
		}
	}
}
