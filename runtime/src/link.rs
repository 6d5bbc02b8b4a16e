use core::time::Duration;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};

use coap::{Socket, SocketError};
use log::{error, warn};

/// Rough per-datagram budget on an Ethernet path: MTU minus IP and UDP
/// headers.
const DEFAULT_MTU: usize = 1500 - 28;

/// A connected UDP socket backing one CoAP context.
pub struct UdpLink {
	socket: UdpSocket,
	/// Staging area large enough for any UDP datagram, so that truncation
	/// against the engine's input buffer can be reported exactly.
	recv_buf: Vec<u8>,
}

impl UdpLink {
	/// Binds an ephemeral local port and connects it to the peer.
	pub fn connect(peer: SocketAddr) -> io::Result<UdpLink> {
		let local: SocketAddr = match peer {
			SocketAddr::V4(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(),
			SocketAddr::V6(_) => SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into(),
		};

		let socket = UdpSocket::bind(local)?;
		socket.connect(peer)?;
		socket.set_read_timeout(Some(Duration::from_secs(30)))?;

		Ok(UdpLink { socket, recv_buf: vec![0; 65536] })
	}

	/// Wraps an already bound and connected socket.
	pub fn from_socket(socket: UdpSocket) -> UdpLink {
		UdpLink { socket, recv_buf: vec![0; 65536] }
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}
}

fn map_err(err: io::Error) -> SocketError {
	match err.kind() {
		ErrorKind::ConnectionRefused => SocketError::ConnRefused,
		ErrorKind::TimedOut | ErrorKind::WouldBlock => SocketError::TimedOut,
		_ => {
			#[cfg(unix)]
			match err.raw_os_error() {
				Some(libc::EPROTO) => return SocketError::Proto,
				Some(libc::ENODEV) => return SocketError::NoDevice,
				_ => {}
			}

			error!("socket I/O failed: {err}");
			SocketError::Io
		}
	}
}

impl Socket for UdpLink {
	fn send(&mut self, data: &[u8]) -> Result<(), SocketError> {
		let sent = self.socket.send(data).map_err(map_err)?;

		if sent != data.len() {
			warn!("only sent {}/{} bytes", sent, data.len());
			return Err(SocketError::Io);
		}

		Ok(())
	}

	fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, SocketError> {
		let received = match self.socket.recv(&mut self.recv_buf) {
			Ok(n) => n,
			Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => return Ok(None),
			Err(e) => return Err(map_err(e)),
		};

		let copy = received.min(buf.len());
		buf[..copy].copy_from_slice(&self.recv_buf[..copy]);

		Ok(Some(received))
	}

	fn inner_mtu(&self) -> Option<usize> {
		Some(DEFAULT_MTU)
	}

	fn set_recv_timeout(&mut self, timeout: Duration) -> Result<(), SocketError> {
		// A zero duration would disable the timeout entirely.
		let timeout = timeout.max(Duration::from_millis(1));
		self.socket.set_read_timeout(Some(timeout)).map_err(map_err)
	}
}
