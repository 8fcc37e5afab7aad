// Copyright 2020 Parity Technologies (UK) Ltd.
// This file is part of Polkadot.

// Polkadot is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Polkadot is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Polkadot.  If not, see <http://www.gnu.org/licenses/>.

//! Configuration of the approval voting subsystem and the protocol constants it runs with.
//!
//! The protocol parameters proper (`needed_approvals`, `n_delay_tranches`, `no_show_slots`,
//! `relay_vrf_modulo_samples` and `zeroth_delay_tranche_width`) are not configured here: they
//! are read from the [`SessionInfo`](polkadot_node_primitives::SessionInfo) of each session.

use polkadot_node_primitives::{BlockNumber, SessionIndex};

use crate::time::Tick;

pub use polkadot_approval_distribution::{MAX_APPROVAL_BATCH_SIZE, MAX_ASSIGNMENT_BATCH_SIZE};

/// The duration of a single tick in milliseconds.
pub const TICK_DURATION_MILLIS: u64 = 500;

/// The amount of ticks to wait after the last assignment was received before a candidate
/// is considered approved, giving the approvals of late assignments a chance to propagate.
pub const APPROVAL_DELAY: Tick = 2;

/// Assignments claiming a tranche this many ticks ahead of the current one are not accepted yet.
pub const TICK_TOO_FAR_IN_FUTURE: Tick = 20;

/// The number of sessions, including the current one, for which session info is kept.
pub const APPROVAL_SESSIONS: SessionIndex = 6;

/// The maximum amount of unfinalized blocks imported at once when catching up with a new head.
pub const MAX_HEADS_LOOK_BACK: BlockNumber = 500;

/// The maximum amount of `Seconded` statements a single validator may issue per relay-parent.
pub const SECONDING_LIMIT: usize = 3;

/// The amount of backing votes a candidate needs before it is considered backed.
pub const MINIMUM_BACKING_VOTES: u32 = 2;

/// Configuration for the approval voting subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
	/// The duration of a relay-chain slot, in milliseconds. Expected to be a multiple of
	/// [`TICK_DURATION_MILLIS`].
	pub slot_duration_millis: u64,
}

impl Default for Config {
	fn default() -> Self {
		Config { slot_duration_millis: 6_000 }
	}
}
