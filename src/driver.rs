// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The uniform driver contract every layer of the stack implements.
//!
//! A layer faces two directions. Towards the wire it is a [`Transmitter`]:
//! it hands out send-buffer reservations, commits them and accounts for
//! refusals. Towards the application it is a [`Receiver`]: it accepts a
//! byte range and reports how much of it it consumed. Layers compose by
//! holding a shared borrow of their parent (for the downward calls) and of
//! their children (for the upward calls); the application owns every layer
//! and all of them share one lifetime.
//!
//! Flow control is refusal, never blocking: a transmitter that cannot
//! reserve returns [`TxError`], a receiver that cannot keep up accepts
//! fewer bytes than offered and the caller re-presents the rest.

use core::cell::{Cell, RefMut};
use core::ops::{Deref, DerefMut};

use thiserror::Error;

/// Why a send-buffer request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
	/// The buffer is reserved elsewhere right now; ask again later.
	#[error("send buffer busy, ask again later")]
	Again,
	/// The layer has no capacity for this request.
	#[error("no send buffer available")]
	NoBuffer,
}

/// A committed reservation of outbound buffer space.
///
/// The lease points into the buffer-owning layer's transmit storage, offset
/// past the header space every layer between here and the wire reserved for
/// itself. Dereferencing yields exactly the granted payload window.
///
/// Dropping an unsent lease releases the reservation (the `free` operation
/// of the driver contract); passing it to [`Transmitter::send`] commits it.
/// Exactly one of the two happens, by construction.
pub struct SendBuf<'a> {
	buf: RefMut<'a, [u8]>,
	off: usize,
	granted: usize,
}

impl<'a> SendBuf<'a> {
	/// Builds a lease over `buf` granting `granted` bytes at `off`.
	///
	/// Only buffer-owning layers (phy adapters) call this; everyone else
	/// narrows a lease obtained from their parent.
	pub fn new(buf: RefMut<'a, [u8]>, off: usize, granted: usize) -> Self {
		debug_assert!(off + granted <= buf.len());
		SendBuf { buf, off, granted }
	}

	pub fn granted(&self) -> usize {
		self.granted
	}

	/// Sets aside `head` bytes before and `tail` bytes after the payload
	/// window for this layer's header and trailer.
	pub fn reserve(&mut self, head: usize, tail: usize) {
		debug_assert!(head + tail <= self.granted);
		self.off += head;
		self.granted -= head + tail;
	}

	/// Undoes a [`reserve`](Self::reserve) so the header and trailer space
	/// becomes writable again. Called on the way down in `send`.
	pub fn restore(&mut self, head: usize, tail: usize) {
		debug_assert!(head <= self.off);
		self.off -= head;
		self.granted += head + tail;
		debug_assert!(self.off + self.granted <= self.buf.len());
	}

	/// Shrinks the grant to `len` payload bytes.
	pub fn truncate(&mut self, len: usize) {
		debug_assert!(len <= self.granted);
		self.granted = len;
	}
}

impl Deref for SendBuf<'_> {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		&self.buf[self.off..self.off + self.granted]
	}
}

impl DerefMut for SendBuf<'_> {
	fn deref_mut(&mut self) -> &mut [u8] {
		&mut self.buf[self.off..self.off + self.granted]
	}
}

/// Downward-facing half of the driver contract.
pub trait Transmitter {
	/// Pure availability probe: the size a reservation of `size` bytes
	/// would be granted right now. No state changes.
	fn capacity(&self, size: usize) -> Result<usize, TxError>;

	/// Reserves an outbound buffer of up to `size` bytes.
	///
	/// The granted window may be smaller than requested. At most one lease
	/// per buffer-owning layer is live at a time; a second request gets
	/// [`TxError::Again`].
	fn get_send_buf(&self, size: usize) -> Result<SendBuf<'_>, TxError>;

	/// Commits `len` payload bytes of a lease. `len` must not exceed the
	/// grant. Returns the payload bytes actually sent.
	fn send(&self, buf: SendBuf<'_>, len: usize) -> usize;
}

/// Upward-facing half of the driver contract.
pub trait Receiver {
	/// Delivers a received byte range.
	///
	/// Returns how many bytes were accepted. On a short return the caller
	/// must re-present the unaccepted suffix on its next call; `0` means no
	/// progress. A malformed packet is consumed in full (return `src.len()`)
	/// and accounted in the layer's statistics, never surfaced as an error.
	///
	/// `caller` is the transmitter to reply through for layers that answer
	/// towards the wire they were fed from.
	fn recv(&self, src: &[u8], caller: &dyn Transmitter) -> usize;
}

/// Snapshot of a layer's statistics record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
	pub tx_packets: u32,
	pub tx_counter: u32,
	pub tx_retries: u32,
	pub tx_dropped: u32,
	pub rx_packets: u32,
	pub rx_counter: u32,
	pub rx_errors: u32,
	pub rx_dropped: u32,
	pub rx_retries: u32,
}

/// Live statistics counters of a layer.
///
/// Single-writer monotone counters; plain cells are enough on the
/// cooperative single-core execution model, and a [`snapshot`]
/// (`Self::snapshot`) is sample-accurate at any point.
#[derive(Default)]
pub struct LayerStats {
	tx_packets: Cell<u32>,
	tx_counter: Cell<u32>,
	tx_retries: Cell<u32>,
	tx_dropped: Cell<u32>,
	rx_packets: Cell<u32>,
	rx_counter: Cell<u32>,
	rx_errors: Cell<u32>,
	rx_dropped: Cell<u32>,
	rx_retries: Cell<u32>,
}

fn bump(cell: &Cell<u32>) {
	cell.set(cell.get().wrapping_add(1));
}

impl LayerStats {
	pub const fn new() -> Self {
		LayerStats {
			tx_packets: Cell::new(0),
			tx_counter: Cell::new(0),
			tx_retries: Cell::new(0),
			tx_dropped: Cell::new(0),
			rx_packets: Cell::new(0),
			rx_counter: Cell::new(0),
			rx_errors: Cell::new(0),
			rx_dropped: Cell::new(0),
			rx_retries: Cell::new(0),
		}
	}

	pub fn snapshot(&self) -> Stats {
		Stats {
			tx_packets: self.tx_packets.get(),
			tx_counter: self.tx_counter.get(),
			tx_retries: self.tx_retries.get(),
			tx_dropped: self.tx_dropped.get(),
			rx_packets: self.rx_packets.get(),
			rx_counter: self.rx_counter.get(),
			rx_errors: self.rx_errors.get(),
			rx_dropped: self.rx_dropped.get(),
			rx_retries: self.rx_retries.get(),
		}
	}

	pub fn tx_packet(&self, bytes: usize) {
		bump(&self.tx_packets);
		self.tx_counter
			.set(self.tx_counter.get().wrapping_add(bytes as u32));
	}

	pub fn tx_retry(&self) {
		bump(&self.tx_retries);
	}

	pub fn tx_drop(&self) {
		bump(&self.tx_dropped);
	}

	pub fn rx_packet(&self, bytes: usize) {
		bump(&self.rx_packets);
		self.rx_counter
			.set(self.rx_counter.get().wrapping_add(bytes as u32));
	}

	pub fn rx_error(&self) {
		bump(&self.rx_errors);
	}

	pub fn rx_drop(&self) {
		bump(&self.rx_dropped);
	}

	pub fn rx_retry(&self) {
		bump(&self.rx_retries);
	}
}

/// A layer that refuses every send and swallows every receive.
///
/// Useful as the `caller` of a receive path that has no reply direction and
/// as a terminal sink during bring-up.
pub struct Null;

impl Transmitter for Null {
	fn capacity(&self, _size: usize) -> Result<usize, TxError> {
		Err(TxError::NoBuffer)
	}

	fn get_send_buf(&self, _size: usize) -> Result<SendBuf<'_>, TxError> {
		Err(TxError::NoBuffer)
	}

	fn send(&self, _buf: SendBuf<'_>, _len: usize) -> usize {
		0
	}
}

impl Receiver for Null {
	fn recv(&self, src: &[u8], _caller: &dyn Transmitter) -> usize {
		src.len()
	}
}
