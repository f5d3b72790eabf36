// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Private byte streams, protocol identifiers `0x01..=0x0F`.
//!
//! A [`User`] layer prefixes outbound payloads with its identifier and
//! strips it from inbound packets before forwarding them to its child. The
//! payload itself is opaque to the stack.

use core::cell::OnceCell;

use crate::driver::{LayerStats, Receiver, SendBuf, Stats, Transmitter, TxError};
use crate::proto;

pub struct User<'a> {
	id: u8,
	parent: &'a dyn Transmitter,
	child: OnceCell<&'a dyn Receiver>,
	stats: LayerStats,
}

impl<'a> User<'a> {
	pub fn new(id: u8, parent: &'a dyn Transmitter) -> Self {
		debug_assert!((proto::USER1..=proto::USER15).contains(&id));
		User {
			id,
			parent,
			child: OnceCell::new(),
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

impl Transmitter for User<'_> {
	fn capacity(&self, size: usize) -> Result<usize, TxError> {
		Ok(self.parent.capacity(size + 1)?.saturating_sub(1))
	}

	fn get_send_buf(&self, size: usize) -> Result<SendBuf<'_>, TxError> {
		let mut buf = match self.parent.get_send_buf(size + 1) {
			Ok(buf) => buf,
			Err(e) => {
				self.stats.tx_retry();
				return Err(e);
			}
		};
		if buf.granted() < 2 {
			self.stats.tx_retry();
			return Err(TxError::Again);
		}
		buf.reserve(1, 0);
		Ok(buf)
	}

	fn send(&self, mut buf: SendBuf<'_>, len: usize) -> usize {
		debug_assert!(len <= buf.granted());
		buf.restore(1, 0);
		buf[0] = self.id;
		self.parent.send(buf, len + 1);
		self.stats.tx_packet(len);
		len
	}
}

impl Receiver for User<'_> {
	fn recv(&self, src: &[u8], caller: &dyn Transmitter) -> usize {
		if src.is_empty() {
			return 0;
		}
		if src[0] != self.id {
			self.stats.rx_drop();
			return src.len();
		}
		let Some(child) = self.child.get() else {
			self.stats.rx_drop();
			return src.len();
		};
		let accepted = child.recv(&src[1..], caller);
		if accepted == src.len() - 1 {
			self.stats.rx_packet(accepted);
			src.len()
		} else if accepted == 0 {
			self.stats.rx_retry();
			0
		} else {
			// Stream child keeping a suffix; the caller re-presents it.
			self.stats.rx_retry();
			accepted + 1
		}
	}
}
