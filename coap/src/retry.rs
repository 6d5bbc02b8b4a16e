use core::time::Duration;

use rand::RngCore;

use crate::config::UdpTxParams;

/// Retransmission state of a single Confirmable transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
	pub retry_count: u32,
	/// How long to wait for an ACK to the most recent (re)transmission.
	pub recv_timeout: Duration,
}

impl RetryState {
	/// Draws the initial timeout from `ACK_TIMEOUT * U[1.0,
	/// ACK_RANDOM_FACTOR]`. A factor of exactly 1.0 skips the PRNG so that
	/// tests get reproducible schedules.
	pub fn new<R: RngCore>(params: &UdpTxParams, rng: &mut R) -> RetryState {
		let spread = params.ack_random_factor - 1.0;

		let factor = if spread > 0.0 {
			1.0 + spread * (rng.next_u32() as f64 / u32::MAX as f64)
		} else {
			1.0
		};

		RetryState {
			retry_count: 0,
			recv_timeout: params.ack_timeout.mul_f64(factor),
		}
	}

	/// Call when the wait expired and the message is about to be re-sent.
	pub fn advance(&mut self) {
		self.retry_count += 1;
		self.recv_timeout *= 2;
	}

	pub fn all_retries_sent(&self, params: &UdpTxParams) -> bool {
		self.retry_count >= params.max_retransmit
	}
}
