//! CoAP-over-UDP protocol engine (RFC 7252) with block-wise transfers
//! (RFC 7959) and observe (RFC 7641), built for constrained M2M clients
//! and servers.
//!
//! The engine is deliberately free of I/O and clocks of its own: it
//! consumes a [`socket::Socket`] capability, a [`time::TimeProvider`] and
//! a PRNG, and is driven by an external event loop that alternates
//! [`udp::Ctx::handle_incoming_packet`] with [`udp::Ctx::handle_timeout`].
//! One context talks to exactly one remote peer.

extern crate alloc;

pub mod cache;
pub mod code;
pub mod config;
pub mod error;
pub mod msg;
pub mod options;
pub mod retry;
pub mod socket;
pub mod time;
pub mod token;
pub mod udp;

pub use code::Code;
pub use config::{Config, UdpTxParams};
pub use error::{Error, SocketError};
pub use msg::Kind;
pub use socket::Socket;
pub use time::{SystemClock, TimeProvider};
pub use token::Token;
pub use udp::{
	Ctx, ExchangeId, IncomingRequest, NotifyPreference, ObserveId, RequestHeader, RequestState,
	Response, ResponseHeader, ServerRequest, ServerRequestState, Stats,
};
