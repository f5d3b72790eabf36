// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Layered protocol core of the ISOTEL Sensor Network.
//!
//! Small devices often have exactly one unreliable byte link and three
//! kinds of traffic to put on it: structured configuration and telemetry
//! messages, transparent byte streams, and a plain ASCII terminal. This
//! crate provides the protocol stack that multiplexes all of them:
//!
//! * [`driver`] — the uniform two-trait contract every layer implements,
//!   the send-buffer lease and per-layer statistics;
//! * [`frame`] — packet delimiting over the raw stream, with CRC trailers
//!   and timeout resynchronization;
//! * [`dispatch`] — demultiplexing by protocol byte;
//! * [`user`], [`trans`], [`redirect`], [`dup`] — thin envelopes and
//!   fan-out helpers;
//! * [`msg`] — the priority-scheduled message table with query/response
//!   tracking;
//! * [`reactor`] — the cooperative tasklet scheduler and cross-core
//!   channels gluing it all to the application;
//! * [`clock`] — the wrap-safe microsecond time base;
//! * [`phy`] — a serial adapter over `embedded-io` for wired bring-up.
//!
//! Layers are plain structs owned by the application and wired with shared
//! borrows, so a whole stack lives in one scope without allocation.
//! Everything is best-effort: layers refuse instead of blocking, errors are
//! counted instead of propagated, and the peer retries.

#![warn(rust_2018_idioms)]
#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod clock;
pub mod crc;
pub mod dispatch;
pub mod driver;
pub mod dup;
pub mod frame;
pub mod msg;
pub mod phy;
pub mod proto;
pub mod reactor;
pub mod redirect;
pub mod trans;
pub mod user;

#[cfg(test)]
mod testing;

pub use crate::clock::{Clock, Ticks};
pub use crate::driver::{Receiver, SendBuf, Stats, Transmitter, TxError};
