// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Receive-side redirection.
//!
//! A [`Redirect`] copies every received packet verbatim out through a
//! target transmitter. Without a target it replies through the caller it
//! was fed from, which turns it into a loopback. When the target grants
//! only a fragment, the behavior depends on the fragmentation option:
//! enabled, the fragment is sent and the remainder re-presented by the
//! caller; disabled, the grant is freed and the packet dropped.

use crate::driver::{LayerStats, Receiver, Stats, Transmitter, TxError};

pub struct Redirect<'a> {
	target: Option<&'a dyn Transmitter>,
	fragment: bool,
	stats: LayerStats,
}

/// A [`Redirect`] without a target: everything comes back to the sender.
pub type Loopback<'a> = Redirect<'a>;

impl<'a> Redirect<'a> {
	pub fn new(target: &'a dyn Transmitter, fragment: bool) -> Self {
		Redirect {
			target: Some(target),
			fragment,
			stats: LayerStats::new(),
		}
	}

	pub fn loopback() -> Self {
		Redirect {
			target: None,
			fragment: false,
			stats: LayerStats::new(),
		}
	}

	pub fn stats(&self) -> Stats {
		self.stats.snapshot()
	}
}

impl Receiver for Redirect<'_> {
	fn recv(&self, src: &[u8], caller: &dyn Transmitter) -> usize {
		if src.is_empty() {
			return 0;
		}
		let target = self.target.unwrap_or(caller);
		let mut buf = match target.get_send_buf(src.len()) {
			Ok(buf) => buf,
			Err(TxError::Again) => {
				self.stats.tx_retry();
				return 0;
			}
			Err(TxError::NoBuffer) => {
				self.stats.tx_retry();
				self.stats.rx_drop();
				return src.len();
			}
		};
		let granted = buf.granted();
		if granted < src.len() && !self.fragment {
			drop(buf);
			self.stats.tx_retry();
			self.stats.rx_drop();
			return src.len();
		}
		let part = granted.min(src.len());
		buf[..part].copy_from_slice(&src[..part]);
		target.send(buf, part);
		self.stats.rx_packet(part);
		self.stats.tx_packet(part);
		part
	}
}
