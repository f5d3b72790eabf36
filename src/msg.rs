// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Message layer: a virtual device of up to 128 numbered, fixed-size
//! records.
//!
//! Each record carries a priority that a [`post`](Message::post) can only
//! raise (except `CLEAR`, which cancels). One [`schedule`](Message::schedule)
//! call transmits at most one message: the scheduler scans the table
//! round-robin from its cursor, picks the highest eligible priority and,
//! depending on it, emits the record's descriptor, a bare query, or the
//! record bytes produced by the slot's handler.
//!
//! A slot whose query went out sits in `QUERY_WAIT` and emits nothing until
//! the matching reply arrives, an `UNLOCK_ARGS`/`CLEAR` post intervenes or
//! [`resend_queries`](Message::resend_queries) re-arms it. `UPDATE_ARGS`
//! additionally locks the whole layer onto that slot: until the peer
//! answers, only queries and descriptors may pass. Record 0 is the
//! mandatory device identity and the final slot is the `"%!"` sentinel
//! out-of-range peers are clamped to, which makes them reload the table.
//!
//! Wire envelope: `0x7F`, then a flags byte (`0x80` = descriptor, low
//! seven bits = message number), then the record bytes or descriptor text.
//! Message number 127 without a body is the peer's fast-load request for
//! every descriptor.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::ptr;

use heapless::Vec;

use crate::driver::{LayerStats, Receiver, Stats, Transmitter};
use crate::proto;
use crate::reactor::{Outcome, Queue, Reactor, Tasklet};

/// Widest record a message can carry.
pub const RECORD_MAX: usize = 64;
/// Table bound, message numbers 0..=127.
pub const TABLE_MAX: usize = 128;
/// Descriptor of the mandatory final table entry.
pub const SENTINEL: &str = "%!";

const NUM_LAST: u8 = 127;
const RECV_EMPTY: u8 = 0xFF;
const DESC_FLAG: u8 = 0x80;

/// Scheduling priority of a message slot. Higher transmits earlier.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct MsgPrio(u8);

impl MsgPrio {
	pub const CLEAR: MsgPrio = MsgPrio(0);
	pub const LOW: MsgPrio = MsgPrio(1);
	pub const NORMAL: MsgPrio = MsgPrio(4);
	pub const HIGH: MsgPrio = MsgPrio(8);
	pub const HIGHEST: MsgPrio = MsgPrio(15);
	pub const UPDATE_ARGS: MsgPrio = MsgPrio(25);
	pub const QUERY_WAIT: MsgPrio = MsgPrio(26);
	pub const QUERY_ARGS: MsgPrio = MsgPrio(27);
	pub const UNLOCK_ARGS: MsgPrio = MsgPrio(29);
	pub const DESCRIPTION_LOW: MsgPrio = MsgPrio(30);
	pub const DESCRIPTION: MsgPrio = MsgPrio(31);

	pub const fn into(self) -> u8 {
		self.0
	}

	pub const fn from(x: u8) -> Self {
		MsgPrio(x)
	}
}

impl fmt::Display for MsgPrio {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Why a handler runs and for which slot.
pub struct MsgEvent {
	msgnum: u8,
	priority: MsgPrio,
	input_valid: bool,
}

impl MsgEvent {
	pub fn msgnum(&self) -> u8 {
		self.msgnum
	}

	pub fn priority(&self) -> MsgPrio {
		self.priority
	}

	/// Peer data arrived for this slot and is passed as `input`.
	pub fn is_input_valid(&self) -> bool {
		self.input_valid
	}

	/// The handler is asked to produce the current record, no data came in.
	pub fn is_query(&self) -> bool {
		!self.input_valid
	}

	/// The input answers a query this device sent earlier.
	pub fn is_reply(&self) -> bool {
		self.input_valid
			&& (self.priority == MsgPrio::QUERY_WAIT || self.priority == MsgPrio::QUERY_ARGS)
	}
}

/// What the handler produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
	/// `output` holds the record to transmit.
	Reply,
	/// Nothing to transmit this round.
	Silent,
}

/// Per-record application callback.
///
/// `input` carries peer data when [`MsgEvent::is_input_valid`]; `output` is
/// the record-sized buffer whose content goes on the wire on
/// [`HandlerResult::Reply`].
pub trait MsgHandler {
	fn handle(&self, event: &MsgEvent, input: Option<&[u8]>, output: &mut [u8]) -> HandlerResult;
}

/// One row of the message table.
pub struct MsgEntry<'a> {
	pub size: u8,
	pub desc: &'a str,
	pub handler: Option<&'a dyn MsgHandler>,
}

impl<'a> MsgEntry<'a> {
	pub fn new(size: u8, desc: &'a str, handler: &'a dyn MsgHandler) -> Self {
		MsgEntry {
			size,
			desc,
			handler: Some(handler),
		}
	}

	/// An entry without a handler: posts for it go out as bare queries.
	pub fn bare(size: u8, desc: &'a str) -> Self {
		MsgEntry {
			size,
			desc,
			handler: None,
		}
	}

	/// The mandatory final entry.
	pub fn sentinel() -> Self {
		MsgEntry {
			size: 0,
			desc: SENTINEL,
			handler: None,
		}
	}
}

/// Construction options.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgOptions {
	/// Restrict to a single outstanding query: `QUERY_ARGS` transmission
	/// also acquires the layer lock, not only `UPDATE_ARGS`.
	pub single_query: bool,
}

#[derive(Clone, Copy)]
struct Notify<'a> {
	reactor: &'a Reactor<'a>,
	queue: Queue,
	task: &'a dyn Tasklet,
	holdon: u8,
	busy: u8,
}

struct MsgState {
	prio: [MsgPrio; TABLE_MAX],
	recv_buf: Vec<u8, RECORD_MAX>,
	recv_msgnum: u8,
	cursor: u8,
	lock_msgnum: u8,
	resend_counter: u32,
	pending: bool,
}

pub struct Message<'a> {
	table: &'a [MsgEntry<'a>],
	parent: &'a dyn Transmitter,
	opts: MsgOptions,
	state: RefCell<MsgState>,
	notify: Cell<Option<Notify<'a>>>,
	kicked: Cell<bool>,
	stats: LayerStats,
}

impl<'a> Message<'a> {
	/// Builds the layer over an application-owned table. The table holds at
	/// least the identity record and the [`MsgEntry::sentinel`] at the end.
	pub fn new(table: &'a [MsgEntry<'a>], parent: &'a dyn Transmitter, opts: MsgOptions) -> Self {
		debug_assert!(table.len() >= 2 && table.len() <= TABLE_MAX);
		debug_assert!(table.last().is_some_and(|e| e.desc == SENTINEL));
		debug_assert!(table.iter().all(|e| usize::from(e.size) <= RECORD_MAX));
		Message {
			table,
			parent,
			opts,
			state: RefCell::new(MsgState {
				prio: [MsgPrio::CLEAR; TABLE_MAX],
				recv_buf: Vec::new(),
				recv_msgnum: RECV_EMPTY,
				cursor: 0,
				lock_msgnum: 0,
				resend_counter: 0,
				pending: false,
			}),
			notify: Cell::new(None),
			kicked: Cell::new(false),
			stats: LayerStats::new(),
		}
	}

	/// Wires a reactor: every post enqueues `task` (usually this layer
	/// itself, which drains [`schedule`](Self::schedule)) under the
	/// `holdon` mutex bits; the `busy` bits are held while a received
	/// message waits for its handler.
	pub fn set_notify(
		&self,
		reactor: &'a Reactor<'a>,
		queue: Queue,
		task: &'a dyn Tasklet,
		holdon: u8,
		busy: u8,
	) {
		self.notify.set(Some(Notify {
			reactor,
			queue,
			task,
			holdon,
			busy,
		}));
	}

	pub fn stats(&self) -> Stats {
		self.stats.snapshot()
	}

	/// Work is queued for a later [`schedule`](Self::schedule) call.
	pub fn pending(&self) -> bool {
		self.state.borrow().pending
	}

	/// The slot the layer is query-locked on, if any.
	pub fn query_lock(&self) -> Option<u8> {
		let lock = self.state.borrow().lock_msgnum;
		(lock != 0).then_some(lock)
	}

	/// Requests transmission of a slot. Priorities only grow until the slot
	/// transmits; `CLEAR` cancels, and `UNLOCK_ARGS` releases a query lock
	/// held by the slot.
	pub fn post(&self, msgnum: u8, prio: MsgPrio) {
		{
			let mut st = self.state.borrow_mut();
			let slot = usize::from(msgnum).min(self.table.len() - 1);
			if prio == MsgPrio::CLEAR {
				st.prio[slot] = MsgPrio::CLEAR;
				if usize::from(st.lock_msgnum) == slot {
					st.lock_msgnum = 0;
				}
				return;
			}
			if prio == MsgPrio::UNLOCK_ARGS && usize::from(st.lock_msgnum) == slot {
				st.lock_msgnum = 0;
			}
			st.prio[slot] = st.prio[slot].max(prio);
			st.pending = true;
		}
		self.kick();
	}

	/// [`post`](Self::post) addressed by handler identity instead of
	/// message number. Returns whether a slot matched.
	pub fn post_by_handler(&self, handler: &dyn MsgHandler, prio: MsgPrio) -> bool {
		let found = self.table.iter().position(|e| {
			e.handler.is_some_and(|h| {
				ptr::addr_eq(h as *const dyn MsgHandler, handler as *const dyn MsgHandler)
			})
		});
		match found {
			Some(slot) => {
				self.post(slot as u8, prio);
				true
			}
			None => false,
		}
	}

	/// Re-arms slots stuck in `QUERY_WAIT` once the call counter exceeds
	/// `timeout`: each goes back to `QUERY_ARGS` and will be retransmitted.
	/// Returns how many were rescheduled.
	pub fn resend_queries(&self, timeout: u32) -> usize {
		let rearmed = {
			let mut st = self.state.borrow_mut();
			st.resend_counter += 1;
			if st.resend_counter <= timeout {
				return 0;
			}
			st.resend_counter = 0;
			let mut rearmed = 0;
			for slot in 0..self.table.len() {
				if st.prio[slot] == MsgPrio::QUERY_WAIT {
					st.prio[slot] = MsgPrio::QUERY_ARGS;
					rearmed += 1;
				}
			}
			if rearmed > 0 {
				st.pending = true;
			}
			rearmed
		};
		if rearmed > 0 {
			self.kick();
		}
		rearmed
	}

	fn kick(&self) {
		let Some(notify) = self.notify.get() else {
			return;
		};
		if self.kicked.replace(true) {
			return;
		}
		let now = notify.reactor.clock().now();
		if notify
			.reactor
			.call_ex(notify.queue, notify.task, 0, now, notify.holdon, None, None)
			.is_err()
		{
			self.kicked.set(false);
			warn!("reactor queue full, message scheduling delayed");
		}
	}

	fn busy_lock(&self) {
		if let Some(n) = self.notify.get() {
			if n.busy != 0 {
				n.reactor.lock(n.busy);
			}
		}
	}

	fn busy_unlock(&self) {
		if let Some(n) = self.notify.get() {
			if n.busy != 0 {
				n.reactor.unlock(n.busy);
			}
		}
	}

	fn eligible(prio: MsgPrio, slot: usize, lock: u8, recv_msgnum: u8) -> bool {
		if prio == MsgPrio::CLEAR {
			return false;
		}
		if prio == MsgPrio::QUERY_WAIT {
			// Waiting slots only dispatch their own reply.
			return usize::from(recv_msgnum) == slot;
		}
		if lock != 0 && usize::from(lock) != slot {
			// The lock holds back argument traffic of other slots.
			return prio == MsgPrio::QUERY_ARGS
				|| prio == MsgPrio::UNLOCK_ARGS
				|| prio >= MsgPrio::DESCRIPTION_LOW;
		}
		true
	}

	fn transmit(&self, msgnum: u8, descriptor: bool, body: &[u8]) -> bool {
		let need = body.len() + 2;
		let mut buf = match self.parent.get_send_buf(need) {
			Ok(buf) if buf.granted() >= need => buf,
			Ok(_) | Err(_) => {
				self.stats.tx_retry();
				return false;
			}
		};
		buf[0] = proto::MSG;
		buf[1] = if descriptor { msgnum | DESC_FLAG } else { msgnum };
		buf[2..need].copy_from_slice(body);
		self.parent.send(buf, need);
		self.stats.tx_packet(body.len());
		true
	}

	fn advance(&self, slot: usize, session: MsgPrio, demote_to: MsgPrio) {
		let mut st = self.state.borrow_mut();
		if st.prio[slot] == session {
			st.prio[slot] = demote_to;
		}
		st.cursor = ((slot + 1) % self.table.len()) as u8;
	}

	fn finish(&self) -> bool {
		let mut st = self.state.borrow_mut();
		let pending = st.prio[..self.table.len()]
			.iter()
			.any(|p| *p != MsgPrio::CLEAR);
		st.pending = pending;
		pending
	}

	/// Transmits at most one message. Returns whether work remains, either
	/// because other slots are posted or because the parent refused the
	/// needed capacity.
	pub fn schedule(&self) -> bool {
		let mut st = self.state.borrow_mut();
		let n = self.table.len();
		let mut best: Option<(usize, MsgPrio)> = None;
		for i in 0..n {
			let slot = (usize::from(st.cursor) + i) % n;
			let prio = st.prio[slot];
			if !Self::eligible(prio, slot, st.lock_msgnum, st.recv_msgnum) {
				continue;
			}
			// Among equal priorities the lower message number wins within
			// a single pass, wherever the cursor started.
			if best.is_none_or(|(s, b)| prio > b || (prio == b && slot < s)) {
				best = Some((slot, prio));
			}
		}
		let Some((slot, session)) = best else {
			st.pending = false;
			return false;
		};
		let entry = &self.table[slot];
		let input_valid = usize::from(st.recv_msgnum) == slot;

		// Capacity first, so nothing is consumed on refusal. A QUERY_ARGS
		// session needs the bare two-byte query at most, and a QUERY_WAIT
		// session only ever consumes its reply, so neither is charged the
		// record size.
		let need = if session >= MsgPrio::DESCRIPTION_LOW {
			entry.desc.len() + 2
		} else if session == MsgPrio::QUERY_WAIT {
			0
		} else if entry.handler.is_none() || session == MsgPrio::QUERY_ARGS {
			2
		} else {
			usize::from(entry.size) + 2
		};
		if need > 0 {
			match self.parent.capacity(need) {
				Ok(granted) if granted >= need => {}
				_ => {
					st.pending = true;
					return true;
				}
			}
		}

		if session >= MsgPrio::DESCRIPTION_LOW {
			drop(st);
			if self.transmit(slot as u8, true, entry.desc.as_bytes()) {
				// A description answering a peer query is followed by the
				// arguments; a broadcast one trickles them out at low
				// priority.
				let demote = if session == MsgPrio::DESCRIPTION {
					MsgPrio::HIGHEST
				} else {
					MsgPrio::LOW
				};
				self.advance(slot, session, demote);
			}
			return self.finish();
		}

		let Some(handler) = entry.handler else {
			drop(st);
			if self.transmit(slot as u8, false, &[]) {
				self.advance(slot, session, MsgPrio::CLEAR);
			}
			return self.finish();
		};

		if session == MsgPrio::QUERY_ARGS && !input_valid {
			// Self-initiated query; the reply will wake the slot.
			drop(st);
			if self.transmit(slot as u8, false, &[]) {
				if self.opts.single_query {
					self.state.borrow_mut().lock_msgnum = slot as u8;
				}
				self.advance(slot, session, MsgPrio::QUERY_WAIT);
			}
			return self.finish();
		}

		let input = if input_valid {
			let data = st.recv_buf.clone();
			st.recv_buf.clear();
			st.recv_msgnum = RECV_EMPTY;
			Some(data)
		} else {
			None
		};
		drop(st);
		if input.is_some() {
			self.busy_unlock();
		}

		let event = MsgEvent {
			msgnum: slot as u8,
			priority: session,
			input_valid,
		};
		let size = usize::from(entry.size);
		let mut out = [0u8; RECORD_MAX];
		let result = handler.handle(&event, input.as_deref(), &mut out[..size]);

		let done = match result {
			HandlerResult::Silent => true,
			HandlerResult::Reply => {
				if session == MsgPrio::QUERY_WAIT || session == MsgPrio::QUERY_ARGS {
					// The reply to our own query ends the exchange; sending
					// arguments back would ping-pong forever.
					true
				} else {
					self.transmit(slot as u8, false, &out[..size])
				}
			}
		};
		if done {
			if result == HandlerResult::Reply && session == MsgPrio::UPDATE_ARGS {
				self.state.borrow_mut().lock_msgnum = slot as u8;
			}
			self.advance(slot, session, MsgPrio::CLEAR);
		}
		self.finish()
	}
}

impl Receiver for Message<'_> {
	fn recv(&self, src: &[u8], _caller: &dyn Transmitter) -> usize {
		if src.is_empty() {
			return 0;
		}
		if src.len() < 2 || src[0] != proto::MSG {
			self.stats.rx_error();
			return src.len();
		}
		let flags = src[1];
		let descriptor = flags & DESC_FLAG != 0;
		let num = flags & !DESC_FLAG;
		let data = &src[2..];

		{
			let mut st = self.state.borrow_mut();

			if num == NUM_LAST && data.is_empty() {
				// Fast load: the peer wants the whole table.
				let prio = if descriptor {
					MsgPrio::DESCRIPTION_LOW
				} else {
					MsgPrio::LOW
				};
				for slot in 1..self.table.len() - 1 {
					st.prio[slot] = st.prio[slot].max(prio);
				}
				st.pending = true;
				self.stats.rx_packet(0);
				drop(st);
				self.kick();
				return src.len();
			}

			// Unknown numbers land on the sentinel, whose "%!" descriptor
			// tells the peer to reload.
			let slot = usize::from(num).min(self.table.len() - 1);

			if descriptor && usize::from(st.lock_msgnum) == slot {
				st.lock_msgnum = 0;
			}

			if data.is_empty() {
				// Peer query for our descriptor or arguments.
				let prio = if descriptor {
					MsgPrio::DESCRIPTION
				} else {
					MsgPrio::HIGHEST
				};
				st.prio[slot] = st.prio[slot].max(prio);
				st.pending = true;
				self.stats.rx_packet(0);
			} else {
				if data.len() != usize::from(self.table[slot].size) {
					debug!(
						"message {slot} carries {} bytes, record holds {}",
						data.len(),
						self.table[slot].size
					);
					self.stats.rx_drop();
					return src.len();
				}
				if st.prio[slot] == MsgPrio::UPDATE_ARGS {
					// A fresher local value is queued; stale echo.
					self.stats.rx_drop();
					return src.len();
				}
				if st.recv_msgnum != RECV_EMPTY {
					// One message at a time awaits dispatch.
					self.stats.rx_retry();
					return 0;
				}
				st.recv_buf.clear();
				let _ = st.recv_buf.extend_from_slice(data);
				st.recv_msgnum = slot as u8;
				if usize::from(st.lock_msgnum) == slot {
					st.lock_msgnum = 0;
				}
				let prio = if descriptor {
					MsgPrio::DESCRIPTION
				} else {
					MsgPrio::HIGHEST
				};
				st.prio[slot] = st.prio[slot].max(prio);
				st.pending = true;
				self.stats.rx_packet(data.len());
				drop(st);
				self.busy_lock();
			}
		}
		self.kick();
		src.len()
	}
}

impl Tasklet for Message<'_> {
	fn run(&self, reactor: &Reactor<'_>, _arg: usize) -> Outcome {
		self.kicked.set(false);
		let sent_before = self.stats.snapshot().tx_packets;
		if self.schedule() {
			if self.stats.snapshot().tx_packets == sent_before {
				// The parent refused capacity; back off one tick so the
				// reactor is not spun on an immediately-ready retry.
				let retry = reactor.clock().now().wrapping_add(1);
				reactor.change_timed_self(retry);
			}
			Outcome::Requeue
		} else {
			Outcome::Done
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::cell::Cell;
	use std::vec::Vec as StdVec;

	use crate::driver::Null;
	use crate::testing::TestPhy;

	struct Identity;

	impl MsgHandler for Identity {
		fn handle(
			&self,
			_event: &MsgEvent,
			_input: Option<&[u8]>,
			output: &mut [u8],
		) -> HandlerResult {
			output.copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 1, 2, 3, 4]);
			HandlerResult::Reply
		}
	}

	struct Led {
		value: Cell<u8>,
		last_reply: Cell<bool>,
		inputs: RefCell<StdVec<StdVec<u8>>>,
	}

	impl Led {
		fn new() -> Self {
			Led {
				value: Cell::new(0),
				last_reply: Cell::new(false),
				inputs: RefCell::new(StdVec::new()),
			}
		}
	}

	impl MsgHandler for Led {
		fn handle(&self, event: &MsgEvent, input: Option<&[u8]>, output: &mut [u8]) -> HandlerResult {
			self.last_reply.set(event.is_reply());
			if let Some(input) = input {
				self.inputs.borrow_mut().push(input.to_vec());
				self.value.set(input[0]);
			}
			output[0] = self.value.get();
			HandlerResult::Reply
		}
	}

	fn led_table<'a>(identity: &'a Identity, led: &'a Led) -> [MsgEntry<'a>; 3] {
		[
			MsgEntry::new(8, "%T0{device}", identity),
			MsgEntry::new(1, "LED {:onoff}", led),
			MsgEntry::sentinel(),
		]
	}

	#[test]
	fn peer_write_invokes_handler_and_echoes() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		assert_eq!(msg.recv(&[0x7F, 0x01, 0x05], &Null), 3);
		assert_eq!(led.inputs.borrow().len(), 0);
		assert!(msg.pending());

		msg.schedule();
		assert_eq!(led.inputs.borrow().as_slice(), &[vec![0x05]]);
		assert_eq!(led.value.get(), 5);
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x05]);
		assert!(!msg.pending());
	}

	#[test]
	fn peer_query_returns_the_record() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		led.value.set(9);
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		assert_eq!(msg.recv(&[0x7F, 0x01], &Null), 2);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x09]);
	}

	#[test]
	fn descriptor_query_sends_text_then_arguments() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		assert_eq!(msg.recv(&[0x7F, 0x81], &Null), 2);
		assert!(msg.schedule());
		let mut expect = vec![0x7F, 0x81];
		expect.extend_from_slice(b"LED {:onoff}");
		assert_eq!(phy.take_wire(), expect);

		// Demoted to HIGHEST: the arguments follow.
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x00]);
	}

	#[test]
	fn fast_load_broadcasts_descriptors_round_robin() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		assert_eq!(msg.recv(&[0x7F, 0xFF], &Null), 2);
		// Only slot 1 lies strictly between identity and sentinel.
		assert!(msg.schedule());
		let mut expect = vec![0x7F, 0x81];
		expect.extend_from_slice(b"LED {:onoff}");
		assert_eq!(phy.take_wire(), expect);

		// Demoted to LOW, the record itself follows eventually.
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x00]);
		assert!(!msg.schedule());
	}

	#[test]
	fn query_waits_for_the_reply() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		msg.post(1, MsgPrio::QUERY_ARGS);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01]);

		// Waiting: nothing more goes out for this slot.
		assert!(!msg.schedule());
		assert!(phy.take_wire().is_empty());

		// The reply dispatches to the handler without a retransmission.
		assert_eq!(msg.recv(&[0x7F, 0x01, 0x07], &Null), 3);
		msg.schedule();
		assert!(phy.take_wire().is_empty());
		assert!(led.last_reply.get());
		assert_eq!(led.value.get(), 7);
	}

	#[test]
	fn resend_queries_rearms_waiting_slots() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		msg.post(1, MsgPrio::QUERY_ARGS);
		msg.schedule();
		phy.take_wire();

		assert_eq!(msg.resend_queries(2), 0);
		assert_eq!(msg.resend_queries(2), 0);
		assert_eq!(msg.resend_queries(2), 1);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01]);
	}

	#[test]
	fn update_args_locks_until_the_peer_answers() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let other = Led::new();
		let table = [
			MsgEntry::new(8, "%T0{device}", &identity),
			MsgEntry::new(1, "LED", &led),
			MsgEntry::new(1, "AUX", &other),
			MsgEntry::sentinel(),
		];
		let msg = Message::new(&table, &phy, MsgOptions::default());

		led.value.set(3);
		msg.post(1, MsgPrio::UPDATE_ARGS);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x03]);
		assert_eq!(msg.query_lock(), Some(1));

		// Argument traffic of other slots is held back; nothing is
		// schedulable until the acknowledgement arrives.
		msg.post(2, MsgPrio::NORMAL);
		assert!(!msg.schedule());
		assert!(phy.take_wire().is_empty());

		// The acknowledgement releases the lock and slot 2 drains.
		assert_eq!(msg.recv(&[0x7F, 0x01, 0x03], &Null), 3);
		assert_eq!(msg.query_lock(), None);
		msg.schedule();
		msg.schedule();
		let wire = phy.take_wire();
		assert!(wire.windows(3).any(|w| w == [0x7F, 0x02, 0x00]));
	}

	#[test]
	fn single_query_option_locks_on_queries() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(
			&table,
			&phy,
			MsgOptions {
				single_query: true,
			},
		);

		msg.post(1, MsgPrio::QUERY_ARGS);
		msg.schedule();
		assert_eq!(msg.query_lock(), Some(1));

		msg.recv(&[0x7F, 0x01, 0x01], &Null);
		assert_eq!(msg.query_lock(), None);
	}

	#[test]
	fn mismatched_record_size_is_dropped() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		assert_eq!(msg.recv(&[0x7F, 0x01, 1, 2, 3], &Null), 5);
		assert_eq!(msg.stats().rx_dropped, 1);
		assert!(!msg.pending());
	}

	#[test]
	fn occupied_receive_slot_backpressures() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		assert_eq!(msg.recv(&[0x7F, 0x01, 0x05], &Null), 3);
		assert_eq!(msg.recv(&[0x7F, 0x01, 0x06], &Null), 0);
		assert_eq!(msg.stats().rx_retries, 1);

		// Dispatch frees the slot and the retry goes through.
		msg.schedule();
		assert_eq!(msg.recv(&[0x7F, 0x01, 0x06], &Null), 3);
	}

	#[test]
	fn out_of_range_number_clamps_to_the_sentinel() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		// Message 100 does not exist; the peer learns it from "%!".
		assert_eq!(msg.recv(&[0x7F, 0x80 | 100], &Null), 2);
		msg.schedule();
		let mut expect = vec![0x7F, 0x80 | 2];
		expect.extend_from_slice(b"%!");
		assert_eq!(phy.take_wire(), expect);
	}

	#[test]
	fn post_is_monotone_and_clear_cancels() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		msg.post(1, MsgPrio::HIGH);
		msg.post(1, MsgPrio::LOW);
		{
			let st = msg.state.borrow();
			assert_eq!(st.prio[1], MsgPrio::HIGH);
		}
		msg.post(1, MsgPrio::CLEAR);
		assert!(!msg.schedule());
		assert!(phy.take_wire().is_empty());
	}

	#[test]
	fn post_by_handler_resolves_the_slot() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		assert!(msg.post_by_handler(&led, MsgPrio::NORMAL));
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x00]);

		let stranger = Led::new();
		assert!(!msg.post_by_handler(&stranger, MsgPrio::NORMAL));
	}

	#[test]
	fn minimal_table_works() {
		let phy = TestPhy::new();
		let identity = Identity;
		let table = [MsgEntry::new(8, "%T0{device}", &identity), MsgEntry::sentinel()];
		let msg = Message::new(&table, &phy, MsgOptions::default());

		// Fast load has nothing between identity and sentinel.
		assert_eq!(msg.recv(&[0x7F, 0xFF], &Null), 2);
		assert!(!msg.schedule());

		msg.post(0, MsgPrio::NORMAL);
		msg.schedule();
		assert_eq!(
			phy.take_wire(),
			vec![0x7F, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 1, 2, 3, 4]
		);
	}

	#[test]
	fn equal_priority_ties_go_to_the_lower_msgnum() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let other = Led::new();
		let table = [
			MsgEntry::new(8, "%T0{device}", &identity),
			MsgEntry::new(1, "LED", &led),
			MsgEntry::new(1, "AUX", &other),
			MsgEntry::sentinel(),
		];
		let msg = Message::new(&table, &phy, MsgOptions::default());

		// Move the cursor past slot 1.
		msg.post(1, MsgPrio::NORMAL);
		msg.schedule();
		phy.take_wire();

		// The scan now starts at slot 2, but message 1 still wins the tie.
		msg.post(1, MsgPrio::NORMAL);
		msg.post(2, MsgPrio::NORMAL);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x00]);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x02, 0x00]);
	}

	#[test]
	fn early_reply_to_a_pending_query_is_consumed() {
		// The peer's update overtakes our query before it was transmitted:
		// the slot still sits at QUERY_ARGS with input pending. The session
		// is charged the two query bytes, not the record, and ends without
		// transmitting.
		let phy = TestPhy::with_grant(2);
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		msg.post(1, MsgPrio::QUERY_ARGS);
		assert_eq!(msg.recv(&[0x7F, 0x01, 0x09], &Null), 3);
		assert!(!msg.schedule());
		assert!(phy.take_wire().is_empty());
		assert!(led.last_reply.get());
		assert_eq!(led.value.get(), 9);
	}

	#[test]
	fn query_reply_dispatches_under_link_pressure() {
		// Two bytes of capacity cover a query session even though the
		// record would not fit; consuming the reply sends nothing.
		let phy = TestPhy::with_grant(2);
		let identity = Identity;
		let led = Led::new();
		let table = led_table(&identity, &led);
		let msg = Message::new(&table, &phy, MsgOptions::default());

		msg.post(1, MsgPrio::QUERY_ARGS);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01]);

		// The reply lands before the next schedule; the slot is still at
		// QUERY_WAIT and the handler must run despite the tiny grant.
		assert_eq!(msg.recv(&[0x7F, 0x01, 0x09], &Null), 3);
		assert!(!msg.schedule());
		assert!(phy.take_wire().is_empty());
		assert!(led.last_reply.get());
		assert_eq!(led.value.get(), 9);
	}

	#[test]
	fn higher_priority_slot_transmits_first() {
		let phy = TestPhy::new();
		let identity = Identity;
		let led = Led::new();
		let other = Led::new();
		let table = [
			MsgEntry::new(8, "%T0{device}", &identity),
			MsgEntry::new(1, "LED", &led),
			MsgEntry::new(1, "AUX", &other),
			MsgEntry::sentinel(),
		];
		let msg = Message::new(&table, &phy, MsgOptions::default());

		msg.post(1, MsgPrio::LOW);
		msg.post(2, MsgPrio::HIGH);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x02, 0x00]);
		msg.schedule();
		assert_eq!(phy.take_wire(), vec![0x7F, 0x01, 0x00]);
	}
}
