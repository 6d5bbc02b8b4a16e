use std::time::Instant;

/// Monotonic time source injected into the context. Production code uses
/// [`SystemClock`]; tests drive a manually advanced clock so that every
/// retransmission schedule is deterministic.
pub trait TimeProvider {
	fn now(&self) -> Instant;
}

/// The real monotonic clock.
pub struct SystemClock;

impl TimeProvider for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}
