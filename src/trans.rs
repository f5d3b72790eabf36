// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Counted transport streams.
//!
//! Envelope `[0x7E, port, counter_lo, counter_hi]` ahead of the payload.
//! The 16-bit little-endian packet counter is monotone per port; the
//! receiver tracks the next expected value and accounts a gap in
//! `rx_dropped` before resynchronizing to the peer. Delivery stays
//! best-effort, the counter only makes losses visible.

use core::cell::{Cell, OnceCell};

use crate::driver::{LayerStats, Receiver, SendBuf, Stats, Transmitter, TxError};
use crate::proto;

const HDR: usize = 4;

pub struct Trans<'a> {
	port: u8,
	parent: &'a dyn Transmitter,
	child: OnceCell<&'a dyn Receiver>,
	tx_count: Cell<u16>,
	rx_expect: Cell<Option<u16>>,
	stats: LayerStats,
}

impl<'a> Trans<'a> {
	pub fn new(port: u8, parent: &'a dyn Transmitter) -> Self {
		Trans {
			port,
			parent,
			child: OnceCell::new(),
			tx_count: Cell::new(0),
			rx_expect: Cell::new(None),
			stats: LayerStats::new(),
		}
	}

	pub fn set_child(&self, child: &'a dyn Receiver) {
		let _ = self.child.set(child);
	}

	pub fn stats(&self) -> Stats {
		self.stats.snapshot()
	}
}

impl Transmitter for Trans<'_> {
	fn capacity(&self, size: usize) -> Result<usize, TxError> {
		Ok(self.parent.capacity(size + HDR)?.saturating_sub(HDR))
	}

	fn get_send_buf(&self, size: usize) -> Result<SendBuf<'_>, TxError> {
		let mut buf = match self.parent.get_send_buf(size + HDR) {
			Ok(buf) => buf,
			Err(e) => {
				self.stats.tx_retry();
				return Err(e);
			}
		};
		if buf.granted() < HDR + 1 {
			self.stats.tx_retry();
			return Err(TxError::Again);
		}
		buf.reserve(HDR, 0);
		Ok(buf)
	}

	fn send(&self, mut buf: SendBuf<'_>, len: usize) -> usize {
		debug_assert!(len <= buf.granted());
		let count = self.tx_count.get();
		self.tx_count.set(count.wrapping_add(1));
		buf.restore(HDR, 0);
		buf[0] = proto::TRANS;
		buf[1] = self.port;
		buf[2..4].copy_from_slice(&count.to_le_bytes());
		self.parent.send(buf, len + HDR);
		self.stats.tx_packet(len);
		len
	}
}

impl Receiver for Trans<'_> {
	fn recv(&self, src: &[u8], caller: &dyn Transmitter) -> usize {
		if src.is_empty() {
			return 0;
		}
		if src.len() < HDR || src[0] != proto::TRANS {
			self.stats.rx_error();
			return src.len();
		}
		if src[1] != self.port {
			self.stats.rx_drop();
			return src.len();
		}
		let count = u16::from_le_bytes([src[2], src[3]]);
		let Some(child) = self.child.get() else {
			self.stats.rx_drop();
			return src.len();
		};
		let accepted = child.recv(&src[HDR..], caller);
		if accepted == 0 && src.len() > HDR {
			self.stats.rx_retry();
			return 0;
		}
		// The packet is in; account a counter gap now.
		if let Some(expect) = self.rx_expect.get() {
			if count != expect {
				debug!(
					"port {} lost {} packets",
					self.port,
					count.wrapping_sub(expect)
				);
				self.stats.rx_drop();
			}
		}
		self.rx_expect.set(Some(count.wrapping_add(1)));
		self.stats.rx_packet(accepted);
		if accepted == src.len() - HDR {
			src.len()
		} else {
			accepted + HDR
		}
	}
}
