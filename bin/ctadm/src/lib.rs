// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection tracker administration library.
//!
//! There is no kernel to talk to: `ctadm` owns an engine of its own
//! and drives it from a packet capture, with the capture's timestamps
//! standing in for the clock.

pub mod log;
pub mod replay;

pub use log::SlogLog;
pub use replay::Replayer;
pub use replay::read_capture;
