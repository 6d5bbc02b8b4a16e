//! Production event loop for the CoAP engine.
//!
//! The engine itself performs no I/O; this crate supplies the missing
//! pieces: a connected UDP socket implementing the engine's socket
//! capability, a stderr logger, and a blocking loop that alternates
//! socket receives with engine timer ticks.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use coap::udp::NewRequestCallback;
use coap::{Ctx, Error, Socket};
use rand::RngCore;

mod link;
mod logger;

pub use link::UdpLink;
pub use logger::init as init_logger;

static EXIT: AtomicBool = AtomicBool::new(false);

/// How long one loop turn may sit in `recv` when the engine has no timer
/// armed.
const IDLE_WAIT: Duration = Duration::from_secs(30);

/// One turn of the event loop: wait for a datagram until the engine's
/// next deadline, dispatch whatever arrived, then fire due timers.
pub fn poll_once<R: RngCore>(
	ctx: &mut Ctx<UdpLink, R>,
	on_request: &mut Option<NewRequestCallback<'_, UdpLink, R>>,
) -> Result<(), Error> {
	let wait = match ctx.next_timeout() {
		Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(IDLE_WAIT),
		None => IDLE_WAIT,
	};

	ctx.socket_mut().set_recv_timeout(wait)?;

	let result = match on_request {
		Some(callback) => ctx.handle_incoming_packet(Some(&mut **callback)),
		None => ctx.handle_incoming_packet(None),
	};

	ctx.handle_timeout();

	result
}

/// Drives the context until Ctrl-C.
pub fn run<R: RngCore>(
	ctx: &mut Ctx<UdpLink, R>,
	mut on_request: Option<NewRequestCallback<'_, UdpLink, R>>,
) -> Result<(), Error> {
	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed))
		.map_err(|err| log::error!("failed to install the Ctrl+C handler: {err}"))
		.map_err(|()| Error::InvalidParams)?;

	while !EXIT.load(Ordering::Relaxed) {
		poll_once(ctx, &mut on_request)?;
	}

	log::info!("exit requested, tearing the context down");
	Ok(())
}
