//! Fixtures shared by the end-to-end scenarios: a hand-driven clock, a
//! capturing phy and sink, and compact-frame wire helpers.

#![allow(dead_code)]

use core::cell::{Cell, RefCell, RefMut};

use isn::clock::{Clock, Ticks};
use isn::crc::crc8;
use isn::driver::{Receiver, SendBuf, Transmitter, TxError};

pub struct TestClock(pub Cell<u32>);

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
		Ticks::new(self.0.get())
	}
}

pub struct TestPhy {
	buf: RefCell<[u8; 512]>,
	pub wire: RefCell<Vec<u8>>,
}

impl TestPhy {
	pub fn new() -> Self {
		TestPhy {
			buf: RefCell::new([0; 512]),
			wire: RefCell::new(Vec::new()),
		}
	}

	pub fn take_wire(&self) -> Vec<u8> {
		core::mem::take(&mut *self.wire.borrow_mut())
	}
}

impl Transmitter for TestPhy {
	fn capacity(&self, size: usize) -> Result<usize, TxError> {
		match self.buf.try_borrow_mut() {
			Ok(_) => Ok(size.min(512)),
			Err(_) => Err(TxError::Again),
		}
	}

	fn get_send_buf(&self, size: usize) -> Result<SendBuf<'_>, TxError> {
		match self.buf.try_borrow_mut() {
			Ok(b) => Ok(SendBuf::new(RefMut::map(b, |b| &mut b[..]), 0, size.min(512))),
			Err(_) => Err(TxError::Again),
		}
	}

	fn send(&self, buf: SendBuf<'_>, len: usize) -> usize {
		self.wire.borrow_mut().extend_from_slice(&buf[..len]);
		len
	}
}

pub struct CaptureSink {
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

/// Serializes `payload` as one compact (CRC-8) frame.
pub fn compact_frame(payload: &[u8]) -> Vec<u8> {
	assert!(!payload.is_empty() && payload.len() <= 64);
	let mut wire = vec![0xC0 | (payload.len() - 1) as u8];
	wire.extend_from_slice(payload);
	wire.push(crc8(&wire));
	wire
}

/// Splits a stream of compact/short frames back into payloads.
pub fn split_frames(mut wire: &[u8]) -> Vec<Vec<u8>> {
	let mut frames = Vec::new();
	while let Some(&header) = wire.first() {
		assert!(header & 0x80 != 0, "not a frame header: {header:#x}");
		let len = usize::from(header & 0x3F) + 1;
		let crc = usize::from(header & 0x40 != 0);
		frames.push(wire[1..1 + len].to_vec());
		wire = &wire[1 + len + crc..];
	}
	frames
}
