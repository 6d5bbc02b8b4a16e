use core::time::Duration;

use crate::error::SocketError;

/// Datagram socket capability consumed by the engine. One socket talks to
/// exactly one remote peer; connecting and address management happen outside.
pub trait Socket {
	/// Sends one datagram. Partial sends are transport errors.
	fn send(&mut self, data: &[u8]) -> Result<(), SocketError>;

	/// Receives one datagram into `buf`, blocking up to the configured
	/// receive timeout. Returns `Ok(None)` on timeout. On success returns
	/// the length of the full datagram, which may exceed `buf.len()`; the
	/// excess is discarded by the transport. The caller uses that to detect
	/// truncation.
	fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, SocketError>;

	/// Estimated payload capacity of a single datagram, if known.
	fn inner_mtu(&self) -> Option<usize>;

	fn set_recv_timeout(&mut self, timeout: Duration) -> Result<(), SocketError>;
}
