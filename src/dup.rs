//! Fan-out of one receive path into two sinks.

use core::cell::Cell;

use crate::driver::{LayerStats, Receiver, Stats, Transmitter};

/// Delivers every packet to both sinks.
///
/// Returns the larger of the two accepted counts; when the sinks disagree,
/// the shorter one silently lost the tail of the packet and `dup_errors`
/// records it.
pub struct Dup<'a> {
	a: &'a dyn Receiver,
	b: &'a dyn Receiver,
	dup_errors: Cell<u32>,
	stats: LayerStats,
}

impl<'a> Dup<'a> {
	pub fn new(a: &'a dyn Receiver, b: &'a dyn Receiver) -> Self {
		Dup {
			a,
			b,
			dup_errors: Cell::new(0),
			stats: LayerStats::new(),
		}
	}

	pub fn dup_errors(&self) -> u32 {
		self.dup_errors.get()
	}

	pub fn stats(&self) -> Stats {
		self.stats.snapshot()
	}
}

impl Receiver for Dup<'_> {
	fn recv(&self, src: &[u8], caller: &dyn Transmitter) -> usize {
		let na = self.a.recv(src, caller);
		let nb = self.b.recv(src, caller);
		if na != nb {
			self.dup_errors.set(self.dup_errors.get().wrapping_add(1));
		}
		let n = na.max(nb);
		if n == src.len() {
			self.stats.rx_packet(n);
		} else {
			self.stats.rx_retry();
		}
		n
	}
}
