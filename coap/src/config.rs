use core::time::Duration;

use crate::error::Error;

/// RFC 7252 transmission parameters. Validated both at context creation and
/// when swapped in at runtime; a rejected set leaves the previous one in
/// force.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UdpTxParams {
	/// Initial ACK wait; RFC 7252 requires at least 1 second.
	pub ack_timeout: Duration,
	/// Spread factor for the initial wait, >= 1.0. With exactly 1.0 the
	/// engine never consults the PRNG and produces deterministic timings.
	pub ack_random_factor: f64,
	/// How many times a Confirmable message is re-sent before giving up.
	pub max_retransmit: u32,
	/// Upper bound on concurrent unacknowledged Confirmable transmissions.
	pub nstart: usize,
}

impl Default for UdpTxParams {
	fn default() -> Self {
		Self {
			ack_timeout: Duration::from_secs(2),
			ack_random_factor: 1.5,
			max_retransmit: 4,
			nstart: 1,
		}
	}
}

impl UdpTxParams {
	pub fn validate(&self) -> Result<(), Error> {
		if self.ack_timeout < Duration::from_secs(1) {
			log::warn!("ACK_TIMEOUT below 1 second");
			return Err(Error::InvalidParams);
		}

		if !self.ack_random_factor.is_finite() || self.ack_random_factor < 1.0 {
			log::warn!("ACK_RANDOM_FACTOR below 1.0");
			return Err(Error::InvalidParams);
		}

		if self.nstart < 1 {
			log::warn!("NSTART below 1");
			return Err(Error::InvalidParams);
		}

		Ok(())
	}

	/// MAX_TRANSMIT_WAIT: the longest time from the first transmission of a
	/// Confirmable message to the moment the sender gives up.
	pub fn max_transmit_wait(&self) -> Duration {
		let spans = (1u32 << (self.max_retransmit + 1)) - 1;
		self.ack_timeout.mul_f64(spans as f64 * self.ack_random_factor)
	}
}

/// Context-wide tunables.
#[derive(Debug, Clone)]
pub struct Config {
	pub tx_params: UdpTxParams,
	/// Largest incoming datagram the context can look at. Anything longer
	/// arrives truncated.
	pub input_buffer_size: usize,
	/// Largest outgoing datagram; bounds the negotiated block size.
	pub output_buffer_size: usize,
	/// Byte budget for the duplicate-request response cache; 0 disables it.
	pub response_cache_size: usize,
	/// How many recent notification message ids are kept for matching a
	/// delayed Reset to its observation.
	pub notify_cache_size: usize,
	/// Upper bound on the life of any exchange, including gaps between
	/// block-wise continuations.
	pub exchange_max_time: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			tx_params: UdpTxParams::default(),
			input_buffer_size: 1152,
			output_buffer_size: 1152,
			response_cache_size: 0,
			notify_cache_size: 4,
			// EXCHANGE_LIFETIME for the default transmission parameters.
			exchange_max_time: Duration::from_secs(247),
		}
	}
}

impl Config {
	pub fn validate(&self) -> Result<(), Error> {
		self.tx_params.validate()?;

		// Anything smaller cannot even hold a message header.
		if self.input_buffer_size < 4 || self.output_buffer_size < 4 {
			log::warn!("message buffers must hold at least a 4-byte header");
			return Err(Error::InvalidParams);
		}

		Ok(())
	}
}
