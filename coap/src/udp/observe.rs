//! RFC 7641 observations: the registry, notification delivery and the
//! Reset-as-cancel plumbing.

use alloc::vec::Vec;

use log::{debug, warn};
use rand::RngCore;

use crate::error::Error;
use crate::msg::Kind;
use crate::options::{self, BlockKind, BlockOption};
use crate::retry::RetryState;
use crate::socket::Socket;
use crate::token::Token;

use super::exchange::{Block2Tx, Exchange, NotifyExchange, Role};
use super::{
	Chunk, Ctx, DeliveryHandler, ExchangeId, NotifyPreference, ObserveCancelHandler, PayloadWriter,
	ResponseHeader,
};

/// Identifies an observation: the token of the request that established it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ObserveId {
	pub token: Token,
}

/// One registered observation. Notifications carry `next_seq` as their
/// Observe option value; the counter starts at 0 with the response to the
/// establishing request and increments with every message sent since.
pub(crate) struct Observation<S: Socket, R: RngCore> {
	pub token: Token,
	pub next_seq: u32,
	pub on_cancel: Option<ObserveCancelHandler<S, R>>,
}

impl<S: Socket, R: RngCore> Ctx<S, R> {
	/// Registers an observation for the request currently being handled.
	/// Only valid from within a request handler whose request carried
	/// Observe=0. Re-registering the same token cancels the previous
	/// observation first.
	pub fn observe_async_start(
		&mut self,
		observe_id: ObserveId,
		on_cancel: ObserveCancelHandler<S, R>,
	) -> Result<(), Error> {
		let valid = self
			.current_request
			.as_ref()
			.is_some_and(|r| r.observe == Some(0) && r.token == observe_id.token);

		if !valid {
			warn!("observation can only start from a request with Observe=0");
			return Err(Error::InvalidParams);
		}

		self.cancel_observation(observe_id.token);

		self.observations.push(Observation {
			token: observe_id.token,
			next_seq: 0,
			on_cancel: Some(on_cancel),
		});

		Ok(())
	}

	/// Emits one notification for an established observation.
	///
	/// A non-confirmable notification without a delivery handler is fire
	/// and forget and yields the invalid exchange id. Confirmable
	/// notifications (and any notification whose payload needs further
	/// BLOCK2 blocks) are tracked as exchanges; the delivery handler then
	/// reports the final outcome. A non-2.xx/3.xx code cancels the
	/// observation right after the notification goes out.
	pub fn notify_async(
		&mut self,
		observe_id: ObserveId,
		header: ResponseHeader,
		preference: NotifyPreference,
		writer: Option<PayloadWriter<S, R>>,
		delivery: Option<DeliveryHandler<S, R>>,
	) -> Result<ExchangeId, Error> {
		if self.torn_down {
			return Err(Error::Cancelled);
		}

		let token = observe_id.token;

		let seq = self.take_observe_seq(&token).ok_or(Error::UnknownObservation)?;

		let kind = match preference {
			NotifyPreference::Confirmable => Kind::Confirmable,
			NotifyPreference::NonConfirmable => Kind::NonConfirmable,
		};

		let mut opts = header.options;
		opts.remove(options::BLOCK1);
		opts.remove(options::BLOCK2);
		opts.remove(options::OBSERVE);

		let id = self.id_alloc.next();
		let now = self.now();

		let notify = NotifyExchange {
			observe_token: token,
			msg_id: 0,
			kind,
			code: header.code,
			options: opts,
			writer,
			delivery,
			block2: None,
			observe_seq: Some(seq),
			held: false,
			awaiting_ack: false,
			retry: None,
			retransmit_at: None,
			expire_at: now + self.exchange_max_time,
			last_sent: Vec::new(),
		};

		let held = kind == Kind::Confirmable
			&& (self.unconfirmed_count() >= self.tx_params.nstart || self.has_held());

		let mut notify = notify;
		notify.held = held;
		self.exchanges.push(Exchange { id, role: Role::Notify(notify) });

		if held {
			return Ok(id);
		}

		if let Err(e) = self.transmit_notify(id) {
			if let Some(idx) = self.index_of(id) {
				self.exchanges.remove(idx);
			}
			return Err(e);
		}

		// An error-class notification tells the peer the resource is gone;
		// the observation dies with it.
		if !matches!(header.code.class(), 2 | 3) {
			self.cancel_observation(token);
		}

		let tracked = {
			match self.index_of(id) {
				None => false,
				Some(idx) => match &self.exchanges[idx].role {
					Role::Notify(n) => n.awaiting_ack || n.block2.is_some(),
					_ => false,
				},
			}
		};

		if tracked {
			return Ok(id);
		}

		// Fire and forget: nothing left to track.
		if let Some(idx) = self.index_of(id) {
			let ex = self.exchanges.remove(idx);

			if let Role::Notify(mut n) = ex.role {
				if let Some(delivery) = n.delivery.take() {
					delivery(self, Ok(()));
				}
			}
		}

		Ok(ExchangeId::INVALID)
	}

	/// Builds and sends the first message of a notification, including the
	/// Observe option and the first BLOCK2 block when the payload needs
	/// splitting.
	pub(crate) fn transmit_notify(&mut self, id: ExchangeId) -> Result<(), Error> {
		let msg_id = self.alloc_msg_id();

		let (kind, code, token, mut opts, observe_seq) = {
			let Some(idx) = self.index_of(id) else { return Err(Error::Cancelled) };
			let Some(n) = self.exchanges[idx].notify_mut() else { return Err(Error::Cancelled) };

			n.msg_id = msg_id;

			(n.kind, n.code, n.observe_token, n.options.clone(), n.observe_seq)
		};

		if let Some(seq) = observe_seq {
			opts.set_observe(seq);
		}

		let size = self.max_block_size(opts.len()).ok_or(Error::BufferTooSmall)?;

		let payload = match self.writer_chunk(id, 0, size as usize) {
			Chunk::Data(data) => data,
			Chunk::Cancelled => return Err(Error::Cancelled),
			Chunk::Failed => return Err(Error::UserHandlerError),
		};

		let has_more = payload.len() == size as usize;

		if has_more {
			opts.set_block(BlockOption::new(BlockKind::Block2, 0, size, true)?);
		}

		let bytes = self.build_and_send(kind, code, msg_id, &token, &opts, &payload)?;

		self.notify_ids.insert(msg_id, token);

		let now = self.now();
		let retry = (kind == Kind::Confirmable).then(|| RetryState::new(&self.tx_params, &mut self.rng));

		let Some(idx) = self.index_of(id) else { return Ok(()) };
		let Some(n) = self.exchanges[idx].notify_mut() else { return Ok(()) };

		n.observe_seq = None;

		if has_more {
			n.block2 = Some(Block2Tx { next_offset: payload.len() });
		}

		if let Some(retry) = retry {
			n.awaiting_ack = true;
			n.retry = Some(retry);
			n.retransmit_at = Some(now + retry.recv_timeout);
			n.last_sent = bytes;
		}

		Ok(())
	}

	/// Reserves the next Observe counter value for `token`.
	pub(crate) fn take_observe_seq(&mut self, token: &Token) -> Option<u32> {
		let observation = self.observations.iter_mut().find(|o| o.token == *token)?;

		let seq = observation.next_seq;
		observation.next_seq = (seq + 1) & 0x00ff_ffff;

		Some(seq)
	}

	pub(crate) fn has_observation(&self, token: &Token) -> bool {
		self.observations.iter().any(|o| o.token == *token)
	}

	/// An Empty ACK confirming a Confirmable notification.
	pub(crate) fn ack_notify(&mut self, msg_id: u16) -> bool {
		let id = self.exchanges.iter().find_map(|ex| match &ex.role {
			Role::Notify(n) if !n.held && n.awaiting_ack && n.msg_id == msg_id => Some(ex.id),
			_ => None,
		});

		let Some(id) = id else { return false };

		if let Some(idx) = self.index_of(id) {
			if let Some(n) = self.exchanges[idx].notify_mut() {
				n.awaiting_ack = false;
				n.retry = None;
				n.retransmit_at = None;
			}
		}

		self.promote_held();
		self.maybe_finish_notify(id);
		true
	}

	/// A Reset matching the latest transmission of a tracked notification.
	pub(crate) fn reset_notify(&mut self, msg_id: u16) -> bool {
		let hit = self.exchanges.iter().find_map(|ex| match &ex.role {
			Role::Notify(n) if !n.held && n.msg_id == msg_id => Some((ex.id, n.observe_token)),
			_ => None,
		});

		let Some((id, token)) = hit else { return false };

		debug!("peer reset notification {id}");
		self.finish_notify(id, Err(Error::ResetReceived));
		self.cancel_observation(token);
		true
	}

	/// Completes a tracked notification once it is both acknowledged and
	/// fully transferred.
	pub(crate) fn maybe_finish_notify(&mut self, id: ExchangeId) {
		let done = {
			let Some(idx) = self.index_of(id) else { return };
			match &self.exchanges[idx].role {
				Role::Notify(n) => !n.awaiting_ack && n.block2.is_none(),
				_ => false,
			}
		};

		if done {
			self.finish_notify(id, Ok(()));
		}
	}

	/// Drops the observation registered under `token`, forgets its cached
	/// notification ids and invokes the user's cancel callback.
	pub(crate) fn cancel_observation(&mut self, token: Token) {
		let Some(idx) = self.observations.iter().position(|o| o.token == token) else {
			return;
		};

		let observation = self.observations.remove(idx);
		self.cancel_observation_entry(observation, token);
	}

	pub(crate) fn cancel_observation_entry(&mut self, mut observation: Observation<S, R>, token: Token) {
		debug!("observation {token:?} cancelled");
		self.notify_ids.forget(&token);

		if let Some(on_cancel) = observation.on_cancel.take() {
			on_cancel(self, ObserveId { token });
		}
	}
}
