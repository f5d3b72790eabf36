//! Serial phy adapter.
//!
//! Bridges any blocking [`embedded_io`] port into the driver contract:
//! upwards a [`pump`](Serial::pump) that reads the port and feeds the
//! child, re-presenting whatever the child did not accept; downwards a
//! transmit lease over an internal buffer that is written out on commit.
//! Interrupt-driven phys stay outside the crate; this adapter covers wired
//! bring-up and host-side testing.

use core::cell::{OnceCell, RefCell, RefMut};

use embedded_io::{Read, Write};

use crate::driver::{LayerStats, Receiver, SendBuf, Stats, Transmitter, TxError};

struct Carry<const CAP: usize> {
	buf: [u8; CAP],
	pos: usize,
	len: usize,
}

pub struct Serial<'a, T, const CAP: usize = 256> {
	io: RefCell<T>,
	txbuf: RefCell<[u8; CAP]>,
	rx: RefCell<Carry<CAP>>,
	child: OnceCell<&'a dyn Receiver>,
	stats: LayerStats,
}

impl<'a, T: Read + Write, const CAP: usize> Serial<'a, T, CAP> {
	pub fn new(io: T) -> Self {
		Serial {
			io: RefCell::new(io),
			txbuf: RefCell::new([0; CAP]),
			rx: RefCell::new(Carry {
				buf: [0; CAP],
				pos: 0,
				len: 0,
			}),
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

	fn feed(&self, rx: &mut Carry<CAP>) {
		let Some(child) = self.child.get() else {
			self.stats.rx_drop();
			rx.pos = rx.len;
			return;
		};
		while rx.pos < rx.len {
			let accepted = child.recv(&rx.buf[rx.pos..rx.len], self);
			if accepted == 0 {
				self.stats.rx_retry();
				return;
			}
			rx.pos += accepted;
		}
	}

	/// Reads the port once and drives the bytes up the stack. Returns how
	/// many fresh bytes were read; a carried suffix from an earlier call is
	/// re-presented first and may leave no room for fresh input.
	pub fn pump(&self) -> Result<usize, T::Error> {
		let mut rx = self.rx.borrow_mut();
		if rx.pos < rx.len {
			self.feed(&mut rx);
			if rx.pos < rx.len {
				return Ok(0);
			}
		}
		let n = self.io.borrow_mut().read(&mut rx.buf)?;
		rx.pos = 0;
		rx.len = n;
		if n > 0 {
			self.stats.rx_packet(n);
			self.feed(&mut rx);
		} else if let Some(child) = self.child.get() {
			// Quiet link: give the stack a chance to drain deliveries it
			// had to hold back earlier.
			let _ = child.recv(&[], self);
		}
		Ok(n)
	}
}

impl<T: Read + Write, const CAP: usize> Transmitter for Serial<'_, T, CAP> {
	fn capacity(&self, size: usize) -> Result<usize, TxError> {
		match self.txbuf.try_borrow_mut() {
			Ok(_) => Ok(size.min(CAP)),
			Err(_) => {
				self.stats.tx_retry();
				Err(TxError::Again)
			}
		}
	}

	fn get_send_buf(&self, size: usize) -> Result<SendBuf<'_>, TxError> {
		match self.txbuf.try_borrow_mut() {
			Ok(buf) => Ok(SendBuf::new(
				RefMut::map(buf, |b| &mut b[..]),
				0,
				size.min(CAP),
			)),
			Err(_) => {
				self.stats.tx_retry();
				Err(TxError::Again)
			}
		}
	}

	fn send(&self, buf: SendBuf<'_>, len: usize) -> usize {
		let result = self.io.borrow_mut().write_all(&buf[..len]);
		drop(buf);
		match result {
			Ok(()) => {
				self.stats.tx_packet(len);
				len
			}
			Err(e) => {
				warn!("serial write failed: {e:?}");
				self.stats.tx_drop();
				0
			}
		}
	}
}
