// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Protocol demultiplexer.
//!
//! Routes a received packet to a child by its leading protocol byte. The
//! binding table is an application-owned ordered slice; the first match
//! wins, [`Match::Other`] catches anything and the end of the slice
//! terminates the search without a fallback. Masked matches route whole
//! protocol families, e.g. every framed packet on a raw link.

use crate::driver::{LayerStats, Receiver, Stats, Transmitter};

/// Selector of one [`Binding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
	/// Exactly this protocol byte.
	Id(u8),
	/// Any byte with `byte & mask == value`.
	Masked { value: u8, mask: u8 },
	/// Catch-all.
	Other,
}

impl Match {
	fn covers(self, byte: u8) -> bool {
		match self {
			Match::Id(id) => byte == id,
			Match::Masked { value, mask } => byte & mask == value,
			Match::Other => true,
		}
	}
}

/// One row of the dispatch table.
pub struct Binding<'a> {
	select: Match,
	to: &'a dyn Receiver,
}

impl<'a> Binding<'a> {
	pub fn id(id: u8, to: &'a dyn Receiver) -> Self {
		Binding {
			select: Match::Id(id),
			to,
		}
	}

	pub fn masked(value: u8, mask: u8, to: &'a dyn Receiver) -> Self {
		Binding {
			select: Match::Masked { value, mask },
			to,
		}
	}

	pub fn other(to: &'a dyn Receiver) -> Self {
		Binding {
			select: Match::Other,
			to,
		}
	}
}

/// The dispatcher. Receive-only: children send through their own parent.
pub struct Dispatch<'a> {
	bindings: &'a [Binding<'a>],
	stats: LayerStats,
}

impl<'a> Dispatch<'a> {
	pub fn new(bindings: &'a [Binding<'a>]) -> Self {
		Dispatch {
			bindings,
			stats: LayerStats::new(),
		}
	}

	pub fn stats(&self) -> Stats {
		self.stats.snapshot()
	}
}

impl Receiver for Dispatch<'_> {
	fn recv(&self, src: &[u8], caller: &dyn Transmitter) -> usize {
		let Some(&proto) = src.first() else {
			return 0;
		};
		for binding in self.bindings {
			if binding.select.covers(proto) {
				let accepted = binding.to.recv(src, caller);
				if accepted == src.len() {
					self.stats.rx_packet(src.len());
				} else {
					self.stats.rx_retry();
				}
				return accepted;
			}
		}
		trace!("no binding for protocol {proto:#04x}, dropping {} bytes", src.len());
		self.stats.rx_drop();
		src.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::Null;
	use crate::proto;
	use crate::testing::CaptureSink;

	#[test]
	fn first_match_wins_and_other_catches() {
		let msg = CaptureSink::new();
		let term = CaptureSink::new();
		let bindings = [Binding::id(proto::MSG, &msg), Binding::other(&term)];
		let dispatch = Dispatch::new(&bindings);

		assert_eq!(dispatch.recv(&[0x7F, 0x01], &Null), 2);
		assert_eq!(dispatch.recv(&[0x05, b'h', b'i'], &Null), 3);

		assert_eq!(msg.packets.borrow().as_slice(), &[vec![0x7F, 0x01]]);
		assert_eq!(term.packets.borrow().as_slice(), &[vec![0x05, b'h', b'i']]);
	}

	#[test]
	fn unmatched_is_consumed_and_counted() {
		let msg = CaptureSink::new();
		let bindings = [Binding::id(proto::MSG, &msg)];
		let dispatch = Dispatch::new(&bindings);

		assert_eq!(dispatch.recv(&[0x05, 0xAA], &Null), 2);
		assert!(msg.packets.borrow().is_empty());
		assert_eq!(dispatch.stats().rx_dropped, 1);
	}

	#[test]
	fn masked_binding_routes_a_family() {
		let frames = CaptureSink::new();
		let rest = CaptureSink::new();
		let bindings = [
			Binding::masked(proto::FRAME, proto::FRAME_MASK, &frames),
			Binding::other(&rest),
		];
		let dispatch = Dispatch::new(&bindings);

		dispatch.recv(&[0x83, 1, 2], &Null);
		dispatch.recv(&[0x7F, 9], &Null);

		assert_eq!(frames.packets.borrow().len(), 1);
		assert_eq!(rest.packets.borrow().len(), 1);
	}
}
