// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Framing layer: carves a raw byte stream into self-delimited packets and
//! serializes outgoing packets with a length header and an optional CRC
//! trailer.
//!
//! Four wire variants share one engine, selected by [`FrameMode`]:
//!
//! | mode    | header | trailer  | payload    |
//! |---------|--------|----------|------------|
//! | Short   | 1 B    | none     | 1..=64     |
//! | Compact | 1 B    | CRC-8    | 1..=64     |
//! | Long    | 2 B    | CRC-16   | 1..=4096   |
//! | Jumbo   | 2 B    | CRC-32   | 1..=8192   |
//!
//! The 1-byte header is `0x80 | crc << 6 | (len - 1)`; receive honors the
//! per-frame CRC bit. Long headers carry `len - 1` in the low four bits of
//! `0xC0..=0xCF` plus a second byte, jumbo in the low five bits of
//! `0xE0..=0xFF` plus a second byte; both always carry their CRC,
//! big-endian after the payload.
//!
//! Bytes outside the frame family (the ASCII terminal and single-byte
//! ping) accumulate and are flushed to the `other` sink whenever a frame
//! begins and at the end of each `recv` call. A receive that stalls longer
//! than the frame timeout discards the partial frame and resynchronizes.

use core::cell::{Cell, OnceCell, RefCell};

use bit_field::BitField;

use crate::clock::{Clock, Ticks};
use crate::crc::{self, CRC32_INIT, crc8_update, crc16_update, crc32_update};
use crate::driver::{LayerStats, Receiver, SendBuf, Stats, Transmitter, TxError};
use crate::proto;

bitflags! {
	/// Flag bits of the 1-byte frame header.
	pub struct HeaderFlags: u8 {
		/// Marks the byte as a frame header.
		const FRAME = 0x80;
		/// A CRC-8 trailer follows the payload.
		const CRC = 0x40;
	}
}

/// Wire variant of a [`Frame`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
	Short,
	Compact,
	Long,
	Jumbo,
}

impl FrameMode {
	pub const fn max_payload(self) -> usize {
		match self {
			FrameMode::Short | FrameMode::Compact => 64,
			FrameMode::Long => 4096,
			FrameMode::Jumbo => 8192,
		}
	}

	const fn header_len(self) -> usize {
		match self {
			FrameMode::Short | FrameMode::Compact => 1,
			FrameMode::Long | FrameMode::Jumbo => 2,
		}
	}

	/// Trailer length on the send side; receive derives it per frame.
	const fn crc_len(self) -> usize {
		match self {
			FrameMode::Short => 0,
			FrameMode::Compact => 1,
			FrameMode::Long => 2,
			FrameMode::Jumbo => 4,
		}
	}

	fn is_marker(self, byte: u8) -> bool {
		match self {
			FrameMode::Short | FrameMode::Compact => {
				byte & proto::FRAME_MASK == proto::FRAME
			}
			FrameMode::Long => byte & proto::FRAME_LONG_MASK == proto::FRAME_LONG,
			FrameMode::Jumbo => byte & proto::FRAME_JUMBO_MASK == proto::FRAME_JUMBO,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
	Idle,
	InHeader,
	InBody,
	InCrc,
	Forwarding,
}

struct FrameRx<const CAP: usize> {
	state: RxState,
	buf: [u8; CAP],
	/// Expected payload length of the frame in progress.
	len: usize,
	/// Payload bytes collected so far.
	size: usize,
	/// Payload bytes already accepted by the child while forwarding.
	fwd: usize,
	/// Pending non-frame bytes at the front of `buf` while idle.
	term: usize,
	hdr0: u8,
	crc_len: usize,
	crc_got: usize,
	crc_acc: u32,
	crc_wire: u32,
}

impl<const CAP: usize> FrameRx<CAP> {
	fn new() -> Self {
		FrameRx {
			state: RxState::Idle,
			buf: [0; CAP],
			len: 0,
			size: 0,
			fwd: 0,
			term: 0,
			hdr0: 0,
			crc_len: 0,
			crc_got: 0,
			crc_acc: 0,
			crc_wire: 0,
		}
	}

	fn reset(&mut self) {
		self.state = RxState::Idle;
		self.len = 0;
		self.size = 0;
		self.fwd = 0;
	}
}

/// The framing layer. `CAP` bounds the receive buffer and must cover the
/// mode's maximum payload; the [`ShortFrame`], [`LongFrame`] and
/// [`JumboFrame`] aliases pick the matching size.
pub struct Frame<'a, const CAP: usize> {
	mode: FrameMode,
	parent: &'a dyn Transmitter,
	clock: &'a dyn Clock,
	/// Inter-byte resynchronization timeout in clock ticks.
	timeout: u32,
	child: OnceCell<&'a dyn Receiver>,
	other: OnceCell<&'a dyn Receiver>,
	last_ts: Cell<Ticks>,
	rx: RefCell<FrameRx<CAP>>,
	stats: LayerStats,
}

pub type ShortFrame<'a> = Frame<'a, 64>;
pub type LongFrame<'a> = Frame<'a, 4096>;
pub type JumboFrame<'a> = Frame<'a, 8192>;

impl<'a, const CAP: usize> Frame<'a, CAP> {
	pub fn new(
		mode: FrameMode,
		parent: &'a dyn Transmitter,
		clock: &'a dyn Clock,
		timeout: u32,
	) -> Self {
		debug_assert!(mode.max_payload() <= CAP);
		Frame {
			mode,
			parent,
			clock,
			timeout,
			child: OnceCell::new(),
			other: OnceCell::new(),
			last_ts: Cell::new(clock.now()),
			rx: RefCell::new(FrameRx::new()),
			stats: LayerStats::new(),
		}
	}

	/// Wires the layer the de-framed packets are delivered to.
	pub fn set_child(&self, child: &'a dyn Receiver) {
		let _ = self.child.set(child);
	}

	/// Wires the sink for non-frame bytes (ASCII terminal, ping). Without
	/// one those bytes are discarded silently.
	pub fn set_other(&self, other: &'a dyn Receiver) {
		let _ = self.other.set(other);
	}

	pub fn stats(&self) -> Stats {
		self.stats.snapshot()
	}

	fn begin(&self, rx: &mut FrameRx<CAP>, byte: u8) {
		rx.size = 0;
		rx.fwd = 0;
		rx.crc_got = 0;
		rx.crc_wire = 0;
		match self.mode {
			FrameMode::Short | FrameMode::Compact => {
				rx.len = usize::from(byte.get_bits(0..6)) + 1;
				rx.crc_len = if HeaderFlags::from_bits_truncate(byte).contains(HeaderFlags::CRC) {
					1
				} else {
					0
				};
				rx.crc_acc = u32::from(crc8_update(0, byte));
				rx.state = RxState::InBody;
			}
			FrameMode::Long => {
				rx.hdr0 = byte;
				rx.crc_len = 2;
				rx.crc_acc = u32::from(crc16_update(0xFFFF, byte));
				rx.state = RxState::InHeader;
			}
			FrameMode::Jumbo => {
				rx.hdr0 = byte;
				rx.crc_len = 4;
				rx.crc_acc = crc32_update(CRC32_INIT, byte);
				rx.state = RxState::InHeader;
			}
		}
	}

	/// Second header byte of the two-byte variants. Returns false on an
	/// over-length header, which drops the frame.
	fn finish_header(&self, rx: &mut FrameRx<CAP>, byte: u8) -> bool {
		let high = usize::from(rx.hdr0.get_bits(0..5));
		rx.len = (high << 8 | usize::from(byte)) + 1;
		match self.mode {
			FrameMode::Long => rx.crc_acc = u32::from(crc16_update(rx.crc_acc as u16, byte)),
			_ => rx.crc_acc = crc32_update(rx.crc_acc, byte),
		}
		if rx.len > self.mode.max_payload() || rx.len > CAP {
			warn!("frame header advertises {} bytes, dropping", rx.len);
			self.stats.rx_error();
			rx.reset();
			return false;
		}
		rx.state = RxState::InBody;
		true
	}

	/// Wire value the accumulated CRC must match.
	fn crc_expected(&self, rx: &FrameRx<CAP>) -> u32 {
		match self.mode {
			FrameMode::Short | FrameMode::Compact => rx.crc_acc & 0xFF,
			FrameMode::Long => rx.crc_acc & 0xFFFF,
			FrameMode::Jumbo => crc::crc32_finish(rx.crc_acc),
		}
	}

	/// Offers the completed payload to the child. Returns false while the
	/// child refuses; the caller must re-drive later.
	fn forward(&self, rx: &mut FrameRx<CAP>) -> bool {
		let Some(child) = self.child.get() else {
			self.stats.rx_drop();
			rx.reset();
			return true;
		};
		let pending = rx.len - rx.fwd;
		let accepted = child.recv(&rx.buf[rx.fwd..rx.len], self);
		if accepted < pending {
			rx.fwd += accepted;
			self.stats.rx_retry();
			return false;
		}
		self.stats.rx_packet(rx.len);
		rx.reset();
		true
	}

	fn flush_term(&self, rx: &mut FrameRx<CAP>, caller: &dyn Transmitter) {
		if rx.term == 0 {
			return;
		}
		if let Some(other) = self.other.get() {
			let accepted = other.recv(&rx.buf[..rx.term], caller);
			if accepted < rx.term {
				self.stats.rx_drop();
			}
		}
		rx.term = 0;
	}
}

impl<const CAP: usize> Receiver for Frame<'_, CAP> {
	fn recv(&self, src: &[u8], caller: &dyn Transmitter) -> usize {
		let mut rx = self.rx.borrow_mut();

		// Resynchronize: a frame stalled past the timeout is lost.
		if rx.state != RxState::Idle && self.clock.elapsed(self.last_ts.get()) > self.timeout {
			debug!("frame timed out in {:?}, resynchronizing", rx.state);
			self.stats.rx_drop();
			rx.reset();
		}
		self.last_ts.set(self.clock.now());

		// A packet still waiting on the child blocks new input.
		if rx.state == RxState::Forwarding && !self.forward(&mut rx) {
			return 0;
		}

		let mut consumed = 0;
		while consumed < src.len() {
			let byte = src[consumed];
			consumed += 1;
			match rx.state {
				RxState::Idle => {
					if self.mode.is_marker(byte) {
						self.flush_term(&mut rx, caller);
						self.begin(&mut rx, byte);
					} else {
						if rx.term == rx.buf.len() {
							self.flush_term(&mut rx, caller);
						}
						let at = rx.term;
						rx.buf[at] = byte;
						rx.term += 1;
					}
				}
				RxState::InHeader => {
					self.finish_header(&mut rx, byte);
				}
				RxState::InBody => {
					let at = rx.size;
					rx.buf[at] = byte;
					rx.size += 1;
					rx.crc_acc = match self.mode {
						FrameMode::Short | FrameMode::Compact => {
							u32::from(crc8_update(rx.crc_acc as u8, byte))
						}
						FrameMode::Long => u32::from(crc16_update(rx.crc_acc as u16, byte)),
						FrameMode::Jumbo => crc32_update(rx.crc_acc, byte),
					};
					if rx.size == rx.len {
						if rx.crc_len > 0 {
							rx.state = RxState::InCrc;
						} else {
							rx.state = RxState::Forwarding;
							if !self.forward(&mut rx) {
								return consumed;
							}
						}
					}
				}
				RxState::InCrc => {
					rx.crc_wire = rx.crc_wire << 8 | u32::from(byte);
					rx.crc_got += 1;
					if rx.crc_got == rx.crc_len {
						if rx.crc_wire == self.crc_expected(&rx) {
							rx.state = RxState::Forwarding;
							if !self.forward(&mut rx) {
								return consumed;
							}
						} else {
							warn!(
								"frame CRC mismatch, got {:#x} expected {:#x}",
								rx.crc_wire,
								self.crc_expected(&rx)
							);
							self.stats.rx_error();
							rx.reset();
						}
					}
				}
				RxState::Forwarding => {
					// Handled before the loop; a fresh byte cannot arrive
					// here within one call.
					consumed -= 1;
					if !self.forward(&mut rx) {
						return consumed;
					}
				}
			}
		}

		self.flush_term(&mut rx, caller);
		consumed
	}
}

impl<const CAP: usize> Transmitter for Frame<'_, CAP> {
	fn capacity(&self, size: usize) -> Result<usize, TxError> {
		let overhead = self.mode.header_len() + self.mode.crc_len();
		let want = size.min(self.mode.max_payload());
		let avail = self.parent.capacity(want + overhead)?;
		Ok(avail.saturating_sub(overhead).min(want))
	}

	fn get_send_buf(&self, size: usize) -> Result<SendBuf<'_>, TxError> {
		let hdr = self.mode.header_len();
		let crc = self.mode.crc_len();
		let want = size.min(self.mode.max_payload());
		let mut buf = match self.parent.get_send_buf(want + hdr + crc) {
			Ok(buf) => buf,
			Err(e) => {
				self.stats.tx_retry();
				return Err(e);
			}
		};
		if buf.granted() < hdr + crc + 1 {
			self.stats.tx_retry();
			return Err(TxError::Again);
		}
		let payload = (buf.granted() - hdr - crc).min(want);
		buf.reserve(hdr, crc);
		buf.truncate(payload);
		Ok(buf)
	}

	fn send(&self, mut buf: SendBuf<'_>, len: usize) -> usize {
		debug_assert!(len >= 1 && len <= buf.granted());
		let hdr = self.mode.header_len();
		let crc = self.mode.crc_len();
		buf.restore(hdr, crc);
		match self.mode {
			FrameMode::Short => {
				buf[0] = HeaderFlags::FRAME.bits() | (len - 1) as u8;
			}
			FrameMode::Compact => {
				buf[0] = (HeaderFlags::FRAME | HeaderFlags::CRC).bits() | (len - 1) as u8;
			}
			FrameMode::Long => {
				buf[0] = proto::FRAME_LONG | ((len - 1) >> 8) as u8;
				buf[1] = (len - 1) as u8;
			}
			FrameMode::Jumbo => {
				buf[0] = proto::FRAME_JUMBO | ((len - 1) >> 8) as u8;
				buf[1] = (len - 1) as u8;
			}
		}
		match self.mode {
			FrameMode::Short => {}
			FrameMode::Compact => {
				buf[hdr + len] = crc::crc8(&buf[..hdr + len]);
			}
			FrameMode::Long => {
				let sum = crc::crc16(&buf[..hdr + len]);
				buf[hdr + len..hdr + len + 2].copy_from_slice(&sum.to_be_bytes());
			}
			FrameMode::Jumbo => {
				let sum = crc::crc32(&buf[..hdr + len]);
				buf[hdr + len..hdr + len + 4].copy_from_slice(&sum.to_be_bytes());
			}
		}
		self.parent.send(buf, hdr + len + crc);
		self.stats.tx_packet(len);
		len
	}
}
