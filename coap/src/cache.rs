use alloc::collections::VecDeque;
use core::time::Duration;
use std::time::Instant;

use log::trace;

use crate::token::Token;

struct CacheEntry {
	msg_id: u16,
	data: Box<[u8]>,
	expires_at: Instant,
}

/// Cache of serialized responses to recently answered Confirmable requests,
/// keyed by message id. A duplicate request is answered by re-sending the
/// cached bytes verbatim. Entries expire after EXCHANGE_LIFETIME and the
/// total byte budget is enforced by dropping the oldest entries first.
pub struct ResponseCache {
	capacity: usize,
	used: usize,
	ttl: Duration,
	entries: VecDeque<CacheEntry>,
}

impl ResponseCache {
	pub fn new(capacity: usize, ttl: Duration) -> ResponseCache {
		ResponseCache {
			capacity,
			used: 0,
			ttl,
			entries: VecDeque::new(),
		}
	}

	fn drop_expired(&mut self, now: Instant) {
		while let Some(front) = self.entries.front() {
			if front.expires_at > now {
				break;
			}

			self.used -= self.entries.pop_front().map(|e| e.data.len()).unwrap_or(0);
		}
	}

	pub fn insert(&mut self, msg_id: u16, data: &[u8], now: Instant) {
		self.drop_expired(now);

		if data.len() > self.capacity {
			trace!("response of {} bytes does not fit in the cache", data.len());
			return;
		}

		while self.used + data.len() > self.capacity {
			self.used -= self.entries.pop_front().map(|e| e.data.len()).unwrap_or(0);
		}

		self.used += data.len();
		self.entries.push_back(CacheEntry {
			msg_id,
			data: data.into(),
			expires_at: now + self.ttl,
		});
	}

	pub fn get(&mut self, msg_id: u16, now: Instant) -> Option<&[u8]> {
		self.drop_expired(now);

		self.entries
			.iter()
			.rev()
			.find(|e| e.msg_id == msg_id)
			.map(|e| &*e.data)
	}
}

/// Ring of recently sent notification message ids. A Reset matching any
/// cached id cancels the corresponding observation, even when newer
/// notifications have been emitted since.
pub struct NotifyIdCache {
	capacity: usize,
	entries: VecDeque<(u16, Token)>,
}

impl NotifyIdCache {
	pub fn new(capacity: usize) -> NotifyIdCache {
		NotifyIdCache {
			capacity,
			entries: VecDeque::new(),
		}
	}

	pub fn insert(&mut self, msg_id: u16, token: Token) {
		if self.capacity == 0 {
			return;
		}

		if self.entries.len() == self.capacity {
			self.entries.pop_front();
		}

		self.entries.push_back((msg_id, token));
	}

	pub fn token_for(&self, msg_id: u16) -> Option<Token> {
		self.entries
			.iter()
			.rev()
			.find(|(id, _)| *id == msg_id)
			.map(|(_, token)| *token)
	}

	/// Call after an observation died; its ids no longer cancel anything.
	pub fn forget(&mut self, token: &Token) {
		self.entries.retain(|(_, t)| t != token);
	}
}
