// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-core tasklet channels.
//!
//! A [`Channel`] is a single-producer/single-consumer ring of tasklet
//! events. The producing core enqueues, the reactor core drains it in
//! [`runall`](super::Reactor::runall) and spawns every event as a local
//! tasklet. An event without a tasklet is a return-cell: it carries a
//! completed tasklet's reply back to its caller on the originating core.
//!
//! The ring holds [`DEPTH`] entries with cursors stored modulo the depth:
//! empty iff `rdi == wri`, full iff `(wri + 1) & mask == rdi`, so one cell
//! always stays unused. An optional wake-up hook runs after every enqueue
//! so the producing side can interrupt a sleeping reactor core.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use super::{Queue, Tasklet};
use crate::clock::Ticks;

/// Ring capacity; one entry is sacrificed to the full/empty distinction.
pub const DEPTH: usize = 16;
const MASK: usize = DEPTH - 1;

/// The channel is full; the event was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel full")]
pub struct ChannelFull;

#[derive(Clone, Copy)]
pub struct ChannelEvent<'a> {
	/// `None` marks a return-cell.
	pub(crate) task: Option<&'a dyn Tasklet>,
	pub(crate) arg: usize,
	pub(crate) caller: Option<&'a dyn Tasklet>,
	/// Channel the reply crosses back over, usually towards the
	/// producing core.
	pub(crate) reply_to: Option<&'a Channel<'a>>,
	pub(crate) queue: Queue,
	pub(crate) time: Ticks,
}

impl ChannelEvent<'_> {
	const fn vacant() -> Self {
		ChannelEvent {
			task: None,
			arg: 0,
			caller: None,
			reply_to: None,
			queue: Queue::User,
			time: Ticks::new(0),
		}
	}
}

pub struct Channel<'a> {
	ring: [UnsafeCell<ChannelEvent<'a>>; DEPTH],
	rdi: CachePadded<AtomicUsize>,
	wri: CachePadded<AtomicUsize>,
	wakeup: Option<fn()>,
}

// One core enqueues, one core drains; the cursors carry the release/acquire
// ordering and a cell is never written while the consumer may read it.
unsafe impl Sync for Channel<'_> {}

impl<'a> Channel<'a> {
	pub fn new(wakeup: Option<fn()>) -> Self {
		Channel {
			ring: core::array::from_fn(|_| UnsafeCell::new(ChannelEvent::vacant())),
			rdi: CachePadded::new(AtomicUsize::new(0)),
			wri: CachePadded::new(AtomicUsize::new(0)),
			wakeup,
		}
	}

	fn push(&self, ev: ChannelEvent<'a>) -> Result<(), ChannelFull> {
		let wri = self.wri.load(Ordering::Relaxed);
		let rdi = self.rdi.load(Ordering::Acquire);
		if (wri + 1) & MASK == rdi {
			return Err(ChannelFull);
		}
		unsafe {
			*self.ring[wri].get() = ev;
		}
		self.wri.store((wri + 1) & MASK, Ordering::Release);
		if let Some(wakeup) = self.wakeup {
			wakeup();
		}
		Ok(())
	}

	/// Producer side: schedule `task` on the consuming core at `time`.
	pub fn call_at(
		&self,
		queue: Queue,
		task: &'a dyn Tasklet,
		arg: usize,
		time: Ticks,
	) -> Result<(), ChannelFull> {
		self.push(ChannelEvent {
			task: Some(task),
			arg,
			caller: None,
			reply_to: None,
			queue,
			time,
		})
	}

	/// Like [`call_at`](Self::call_at) with a continuation to run once the
	/// tasklet replies. With `reply_to` the reply crosses back over that
	/// channel as a return-cell and the continuation runs on the core
	/// draining it; without, it runs on the consuming core.
	pub fn call_with_caller(
		&self,
		queue: Queue,
		task: &'a dyn Tasklet,
		arg: usize,
		caller: &'a dyn Tasklet,
		reply_to: Option<&'a Channel<'a>>,
		time: Ticks,
	) -> Result<(), ChannelFull> {
		self.push(ChannelEvent {
			task: Some(task),
			arg,
			caller: Some(caller),
			reply_to,
			queue,
			time,
		})
	}

	/// Carries a reply value back to `caller` on the consuming core.
	pub(crate) fn push_return(
		&self,
		caller: Option<&'a dyn Tasklet>,
		value: usize,
	) -> Result<(), ChannelFull> {
		self.push(ChannelEvent {
			task: None,
			arg: value,
			caller,
			reply_to: None,
			queue: Queue::User,
			time: Ticks::new(0),
		})
	}

	/// Consumer side.
	pub fn pop(&self) -> Option<ChannelEvent<'a>> {
		let rdi = self.rdi.load(Ordering::Relaxed);
		let wri = self.wri.load(Ordering::Acquire);
		if rdi == wri {
			return None;
		}
		let ev = unsafe { *self.ring[rdi].get() };
		self.rdi.store((rdi + 1) & MASK, Ordering::Release);
		Some(ev)
	}

	pub fn len(&self) -> usize {
		let rdi = self.rdi.load(Ordering::Acquire);
		let wri = self.wri.load(Ordering::Acquire);
		wri.wrapping_sub(rdi) & MASK
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::reactor::{Outcome, Reactor};

	struct Nop;

	impl Tasklet for Nop {
		fn run(&self, _reactor: &Reactor<'_>, _arg: usize) -> Outcome {
			Outcome::Done
		}
	}

	#[test]
	fn fills_to_depth_minus_one() {
		let task = Nop;
		let ch = Channel::new(None);
		for i in 0..DEPTH - 1 {
			ch.call_at(Queue::User, &task, i, Ticks::new(0)).unwrap();
		}
		assert_eq!(ch.len(), DEPTH - 1);
		assert_eq!(
			ch.call_at(Queue::User, &task, 99, Ticks::new(0)),
			Err(ChannelFull)
		);
	}

	#[test]
	fn drains_in_order_and_wraps() {
		let task = Nop;
		let ch = Channel::new(None);
		for round in 0..3 {
			for i in 0..DEPTH - 1 {
				ch.call_at(Queue::User, &task, round * 100 + i, Ticks::new(0))
					.unwrap();
			}
			for i in 0..DEPTH - 1 {
				assert_eq!(ch.pop().unwrap().arg, round * 100 + i);
			}
			assert!(ch.is_empty());
		}
	}

	#[test]
	fn wakeup_fires_per_enqueue() {
		static WOKE: AtomicUsize = AtomicUsize::new(0);
		fn wake() {
			WOKE.fetch_add(1, Ordering::Relaxed);
		}

		let task = Nop;
		let ch = Channel::new(Some(wake));
		ch.call_at(Queue::User, &task, 0, Ticks::new(0)).unwrap();
		ch.call_at(Queue::User, &task, 1, Ticks::new(0)).unwrap();
		assert_eq!(WOKE.load(Ordering::Relaxed), 2);
	}
}
