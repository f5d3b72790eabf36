//! Shared fixtures for the unit tests: a scriptable phy, a capture sink and
//! a hand-driven clock.

use core::cell::{Cell, RefCell, RefMut};

use std::vec::Vec;

use crate::clock::{Clock, Ticks};
use crate::driver::{Receiver, SendBuf, Transmitter, TxError};

pub(crate) struct TestClock(pub Cell<u32>);

impl TestClock {
	pub fn new() -> Self {
		TestClock(Cell::new(0))
	}

	pub fn advance(&self, ticks: u32) {
		self.0.set(self.0.get().wrapping_add(ticks));
	}
}

impl Clock for TestClock {
	fn now(&self) -> Ticks {
		Ticks(self.0.get())
	}
}

/// A buffer-owning bottom layer that records everything committed to it.
pub(crate) struct TestPhy {
	buf: RefCell<[u8; 512]>,
	grant: Cell<usize>,
	pub wire: RefCell<Vec<u8>>,
}

impl TestPhy {
	pub fn new() -> Self {
		TestPhy {
			buf: RefCell::new([0; 512]),
			grant: Cell::new(512),
			wire: RefCell::new(Vec::new()),
		}
	}

	/// Caps every grant at `n` bytes to provoke fragmentation paths.
	pub fn with_grant(n: usize) -> Self {
		let phy = Self::new();
		phy.grant.set(n);
		phy
	}

	pub fn take_wire(&self) -> Vec<u8> {
		core::mem::take(&mut *self.wire.borrow_mut())
	}
}

impl Transmitter for TestPhy {
	fn capacity(&self, size: usize) -> Result<usize, TxError> {
		match self.buf.try_borrow_mut() {
			Ok(_) => Ok(size.min(self.grant.get())),
			Err(_) => Err(TxError::Again),
		}
	}

	fn get_send_buf(&self, size: usize) -> Result<SendBuf<'_>, TxError> {
		match self.buf.try_borrow_mut() {
			Ok(b) => Ok(SendBuf::new(
				RefMut::map(b, |b| &mut b[..]),
				0,
				size.min(self.grant.get()),
			)),
			Err(_) => Err(TxError::Again),
		}
	}

	fn send(&self, buf: SendBuf<'_>, len: usize) -> usize {
		self.wire.borrow_mut().extend_from_slice(&buf[..len]);
		len
	}
}

/// Records every delivery; optionally accepts only a prefix to exercise the
/// re-present contract.
pub(crate) struct CaptureSink {
	pub packets: RefCell<Vec<Vec<u8>>>,
	pub accept: Cell<usize>,
}

impl CaptureSink {
	pub fn new() -> Self {
		CaptureSink {
			packets: RefCell::new(Vec::new()),
			accept: Cell::new(usize::MAX),
		}
	}

	/// All accepted bytes in delivery order.
	pub fn concat(&self) -> Vec<u8> {
		self.packets.borrow().iter().flatten().copied().collect()
	}
}

impl Receiver for CaptureSink {
	fn recv(&self, src: &[u8], _caller: &dyn Transmitter) -> usize {
		let n = src.len().min(self.accept.get());
		if n > 0 {
			self.packets.borrow_mut().push(src[..n].to_vec());
		}
		n
	}
}
