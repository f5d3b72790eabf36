// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative tasklet reactor.
//!
//! A single worker runs tasklets to completion, in strict class order
//! across the four queues and FIFO within a class, subject to two gates: a
//! tasklet's scheduled time must have passed and none of its mutex bits may
//! be locked. Locked tasklets simply stay in place and are skipped, so they
//! accumulate at the head of their list until the bits clear.
//!
//! The slot storage is provided by the application at construction, sized
//! to its needs; free and live slots share it, chained through plain index
//! links. The reactor is not `Sync`: interrupt handlers and other cores
//! feed it through [`Channel`]s, which are drained at the top of
//! [`runall`](Reactor::runall).
//!
//! A tasklet returns an [`Outcome`]: `Done`, `Requeue` to re-arm itself
//! (with [`change_timed_self`](Reactor::change_timed_self) adjusting the
//! next deadline), or `Reply(value)`. A reply runs the spawning caller
//! continuation with the value, or crosses back to the originating core as
//! a return-cell when the tasklet was spawned through a channel.

mod channel;

pub use channel::{Channel, ChannelEvent, ChannelFull, DEPTH as CHANNEL_DEPTH};

use core::cell::{Cell, RefCell};
use core::ptr;

use thiserror::Error;

use crate::clock::{Clock, Ticks};

/// Queue classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
	System = 0,
	Priority = 1,
	User = 2,
	Back = 3,
}

const QUEUES: usize = 4;
const NONE: u8 = u8::MAX;

/// The tasklet queue is out of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tasklet queue full")]
pub struct QueueFull;

/// What a finished tasklet wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	/// Complete.
	Done,
	/// Reschedule this tasklet, by default immediately.
	Requeue,
	/// Complete and hand the value to the caller continuation.
	Reply(usize),
}

/// A unit of deferred work.
///
/// Identity matters: cancellation and rescheduling address a tasklet by
/// the pair (object address, argument), so recurring work must be spawned
/// from a place that outlives the reactor's storage.
pub trait Tasklet {
	fn run(&self, reactor: &Reactor<'_>, arg: usize) -> Outcome;
}

fn same_task(a: &dyn Tasklet, b: &dyn Tasklet) -> bool {
	ptr::addr_eq(a as *const dyn Tasklet, b as *const dyn Tasklet)
}

#[derive(Clone, Copy)]
struct Entry<'a> {
	task: &'a dyn Tasklet,
	arg: usize,
	caller: Option<&'a dyn Tasklet>,
	caller_channel: Option<&'a Channel<'a>>,
	time: Ticks,
	mutex: u8,
	queue: Queue,
}

/// One cell of the reactor's storage. Applications create the storage as
/// `RefCell::new([Slot::vacant(); N])` and hand it to [`Reactor::new`].
#[derive(Clone, Copy)]
pub struct Slot<'a> {
	entry: Option<Entry<'a>>,
	next: u8,
}

impl Slot<'_> {
	pub const fn vacant() -> Self {
		Slot {
			entry: None,
			next: NONE,
		}
	}
}

#[derive(Clone, Copy)]
struct Current<'a> {
	caller: Option<&'a dyn Tasklet>,
	caller_channel: Option<&'a Channel<'a>>,
	queue: Queue,
	retime: Option<Ticks>,
}

pub struct Reactor<'a> {
	clock: &'a dyn Clock,
	slots: &'a RefCell<[Slot<'a>]>,
	free: Cell<u8>,
	heads: [Cell<u8>; QUEUES],
	tails: [Cell<u8>; QUEUES],
	locked: Cell<u8>,
	handed_mutexes: Cell<u8>,
	queue_changed: Cell<bool>,
	next_time: Cell<Option<Ticks>>,
	current: Cell<Option<Current<'a>>>,
}

impl<'a> Reactor<'a> {
	/// Builds a reactor over `slots`. The storage is reinitialized; at most
	/// 255 slots are addressable.
	pub fn new(clock: &'a dyn Clock, slots: &'a RefCell<[Slot<'a>]>) -> Self {
		let count;
		{
			let mut slots = slots.borrow_mut();
			debug_assert!(slots.len() < usize::from(NONE));
			count = slots.len().min(usize::from(NONE));
			for i in 0..count {
				slots[i] = Slot {
					entry: None,
					next: if i + 1 < count { (i + 1) as u8 } else { NONE },
				};
			}
		}
		Reactor {
			clock,
			slots,
			free: Cell::new(if count > 0 { 0 } else { NONE }),
			heads: [const { Cell::new(NONE) }; QUEUES],
			tails: [const { Cell::new(NONE) }; QUEUES],
			locked: Cell::new(0),
			handed_mutexes: Cell::new(0),
			queue_changed: Cell::new(false),
			next_time: Cell::new(None),
			current: Cell::new(None),
		}
	}

	pub fn clock(&self) -> &dyn Clock {
		self.clock
	}

	/// Schedules `task` to run as soon as the worker gets to it.
	pub fn call(&self, queue: Queue, task: &'a dyn Tasklet, arg: usize) -> Result<(), QueueFull> {
		self.call_ex(queue, task, arg, self.clock.now(), 0, None, None)
	}

	/// Schedules `task` to run once `at` has passed.
	pub fn call_at(
		&self,
		queue: Queue,
		task: &'a dyn Tasklet,
		arg: usize,
		at: Ticks,
	) -> Result<(), QueueFull> {
		self.call_ex(queue, task, arg, at, 0, None, None)
	}

	/// Full-form scheduling: deadline, mutex gating and a caller
	/// continuation, optionally living behind `caller_channel` on another
	/// core.
	pub fn call_ex(
		&self,
		queue: Queue,
		task: &'a dyn Tasklet,
		arg: usize,
		at: Ticks,
		mutex: u8,
		caller: Option<&'a dyn Tasklet>,
		caller_channel: Option<&'a Channel<'a>>,
	) -> Result<(), QueueFull> {
		let mut slots = self.slots.borrow_mut();
		let idx = self.free.get();
		if idx == NONE {
			return Err(QueueFull);
		}
		self.free.set(slots[usize::from(idx)].next);
		slots[usize::from(idx)] = Slot {
			entry: Some(Entry {
				task,
				arg,
				caller,
				caller_channel,
				time: at,
				mutex,
				queue,
			}),
			next: NONE,
		};
		let q = queue as usize;
		if self.heads[q].get() == NONE {
			self.heads[q].set(idx);
		} else {
			slots[usize::from(self.tails[q].get())].next = idx;
		}
		self.tails[q].set(idx);
		self.queue_changed.set(true);
		Ok(())
	}

	/// Tail-call from within a running tasklet: spawns `task` inheriting
	/// the current tasklet's caller and queue, so the reply still reaches
	/// the original continuation.
	pub fn pass(&self, task: &'a dyn Tasklet, arg: usize) -> Result<(), QueueFull> {
		let (queue, caller, caller_channel) = match self.current.get() {
			Some(ctx) => (ctx.queue, ctx.caller, ctx.caller_channel),
			None => (Queue::User, None, None),
		};
		self.call_ex(queue, task, arg, self.clock.now(), 0, caller, caller_channel)
	}

	fn remove_matching(&self, task: &dyn Tasklet, arg: usize, first_only: bool) -> usize {
		let mut slots = self.slots.borrow_mut();
		let mut removed = 0;
		for q in 0..QUEUES {
			let mut prev = NONE;
			let mut cur = self.heads[q].get();
			while cur != NONE {
				let slot = slots[usize::from(cur)];
				let next = slot.next;
				let matches = slot
					.entry
					.is_some_and(|e| same_task(e.task, task) && e.arg == arg);
				if matches {
					if prev == NONE {
						self.heads[q].set(next);
					} else {
						slots[usize::from(prev)].next = next;
					}
					if self.tails[q].get() == cur {
						self.tails[q].set(prev);
					}
					slots[usize::from(cur)] = Slot {
						entry: None,
						next: self.free.get(),
					};
					self.free.set(cur);
					removed += 1;
					self.queue_changed.set(true);
					if first_only {
						return removed;
					}
				} else {
					prev = cur;
				}
				cur = next;
			}
		}
		removed
	}

	/// Cancels the first queued tasklet matching object and argument.
	/// Never touches a tasklet that is currently running.
	pub fn drop_task(&self, task: &dyn Tasklet, arg: usize) -> bool {
		self.remove_matching(task, arg, true) == 1
	}

	/// Cancels every queued tasklet matching object and argument and
	/// returns how many were removed.
	pub fn drop_all(&self, task: &dyn Tasklet, arg: usize) -> usize {
		self.remove_matching(task, arg, false)
	}

	/// Moves a queued tasklet's deadline. Returns whether one matched.
	pub fn change_timed(&self, task: &dyn Tasklet, arg: usize, at: Ticks) -> bool {
		let mut slots = self.slots.borrow_mut();
		for q in 0..QUEUES {
			let mut cur = self.heads[q].get();
			while cur != NONE {
				let next = slots[usize::from(cur)].next;
				if let Some(e) = slots[usize::from(cur)].entry.as_mut() {
					if same_task(e.task, task) && e.arg == arg {
						e.time = at;
						self.queue_changed.set(true);
						return true;
					}
				}
				cur = next;
			}
		}
		false
	}

	/// From within a running tasklet: sets the deadline its `Requeue`
	/// outcome will be re-armed with.
	pub fn change_timed_self(&self, at: Ticks) {
		if let Some(mut ctx) = self.current.get() {
			ctx.retime = Some(at);
			self.current.set(Some(ctx));
		}
	}

	/// Hands out the next free mutex bit, up to eight.
	pub fn get_mutex(&self) -> Option<u8> {
		let n = self.handed_mutexes.get();
		if n >= 8 {
			return None;
		}
		self.handed_mutexes.set(n + 1);
		Some(1 << n)
	}

	pub fn lock(&self, bits: u8) {
		self.locked.set(self.locked.get() | bits);
		self.queue_changed.set(true);
	}

	pub fn unlock(&self, bits: u8) {
		self.locked.set(self.locked.get() & !bits);
		self.queue_changed.set(true);
	}

	pub fn is_locked(&self, bits: u8) -> bool {
		self.locked.get() & bits != 0
	}

	/// Nearest deadline among the deferred tasklets after the last full
	/// scan; what an idle host sleeps towards.
	pub fn next_time(&self) -> Option<Ticks> {
		self.next_time.get()
	}

	/// Runs at most one ready tasklet. Returns whether one ran; when
	/// nothing is ready and nothing changed since the last scan, it returns
	/// without looking.
	pub fn step(&self) -> bool {
		let now = self.clock.now();

		if !self.queue_changed.get() {
			match self.next_time.get() {
				Some(t) if (t.0.wrapping_sub(now.0) as i32) <= 0 => {}
				_ => return false,
			}
		}

		let mut next: Option<Ticks> = None;
		let mut picked: Option<Entry<'a>> = None;
		{
			let mut slots = self.slots.borrow_mut();
			'scan: for q in 0..QUEUES {
				let mut prev = NONE;
				let mut cur = self.heads[q].get();
				while cur != NONE {
					let slot = slots[usize::from(cur)];
					let Some(entry) = slot.entry else {
						prev = cur;
						cur = slot.next;
						continue;
					};
					if entry.mutex & self.locked.get() != 0 {
						prev = cur;
						cur = slot.next;
						continue;
					}
					let remains = entry.time.0.wrapping_sub(now.0) as i32;
					if remains > 0 {
						let closer = match next {
							Some(t) => remains < t.0.wrapping_sub(now.0) as i32,
							None => true,
						};
						if closer {
							next = Some(entry.time);
						}
						prev = cur;
						cur = slot.next;
						continue;
					}
					if prev == NONE {
						self.heads[q].set(slot.next);
					} else {
						slots[usize::from(prev)].next = slot.next;
					}
					if self.tails[q].get() == cur {
						self.tails[q].set(prev);
					}
					slots[usize::from(cur)] = Slot {
						entry: None,
						next: self.free.get(),
					};
					self.free.set(cur);
					picked = Some(entry);
					break 'scan;
				}
			}
		}

		let Some(entry) = picked else {
			self.next_time.set(next);
			self.queue_changed.set(false);
			return false;
		};

		let saved = self.current.replace(Some(Current {
			caller: entry.caller,
			caller_channel: entry.caller_channel,
			queue: entry.queue,
			retime: None,
		}));
		trace!("running tasklet arg {:#x}", entry.arg);
		let outcome = entry.task.run(self, entry.arg);
		let retime = self
			.current
			.replace(saved)
			.and_then(|ctx| ctx.retime);

		match outcome {
			Outcome::Done => {}
			Outcome::Requeue => {
				let at = retime.unwrap_or(now);
				if self
					.call_ex(
						entry.queue,
						entry.task,
						entry.arg,
						at,
						entry.mutex,
						entry.caller,
						entry.caller_channel,
					)
					.is_err()
				{
					warn!("queue full, recurring tasklet lost");
				}
			}
			Outcome::Reply(value) => {
				if let Some(ch) = entry.caller_channel {
					if ch.push_return(entry.caller, value).is_err() {
						warn!("return channel full, reply lost");
					}
				} else if let Some(caller) = entry.caller {
					let _ = caller.run(self, value);
				}
			}
		}
		self.queue_changed.set(true);
		true
	}

	/// Runs everything that is ready. Returns the number of tasklets run.
	pub fn poll(&self) -> usize {
		let mut ran = 0;
		while self.step() {
			ran += 1;
		}
		ran
	}

	/// Drains foreign channels into the local queues, then runs everything
	/// that is ready.
	pub fn runall(&self, foreign: &[&Channel<'a>]) -> usize {
		for ch in foreign {
			while let Some(ev) = ch.pop() {
				match ev.task {
					Some(task) => {
						if self
							.call_ex(ev.queue, task, ev.arg, ev.time, 0, ev.caller, ev.reply_to)
							.is_err()
						{
							warn!("queue full, channel event lost");
						}
					}
					None => {
						if let Some(caller) = ev.caller {
							let _ = caller.run(self, ev.arg);
						}
					}
				}
			}
		}
		self.poll()
	}
}
