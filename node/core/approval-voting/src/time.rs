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

//! Time utilities for approval voting.

use futures::prelude::*;

use polkadot_node_primitives::{
	approval::DelayTranche, BlockNumber, CandidateHash, Hash, Slot,
};
use std::{
	collections::{btree_map, BTreeMap, HashMap, HashSet},
	pin::Pin,
	time::{Duration, SystemTime},
};

use crate::config::TICK_DURATION_MILLIS;

/// A base unit of time, starting from the Unix epoch, split into half-second intervals.
pub type Tick = u64;

/// A clock which allows querying of the current tick as well as
/// waiting for a tick to be reached.
pub trait Clock {
	/// Yields the current tick.
	fn tick_now(&self) -> Tick;

	/// Yields a future which concludes when the given tick is reached.
	fn wait(&self, tick: Tick) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

/// Extension methods for clocks.
pub trait ClockExt {
	/// The delay tranche the clock is currently in, relative to the start of `base_slot`.
	fn tranche_now(&self, slot_duration_millis: u64, base_slot: Slot) -> DelayTranche;
}

impl<C: Clock + ?Sized> ClockExt for C {
	fn tranche_now(&self, slot_duration_millis: u64, base_slot: Slot) -> DelayTranche {
		self.tick_now()
			.saturating_sub(slot_number_to_tick(slot_duration_millis, base_slot)) as u32
	}
}

/// A clock which uses the actual underlying system clock.
pub struct SystemClock;

impl Clock for SystemClock {
	/// Yields the current tick.
	fn tick_now(&self) -> Tick {
		match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
			Err(_) => 0,
			Ok(d) => d.as_millis() as u64 / TICK_DURATION_MILLIS,
		}
	}

	/// Yields a future which concludes when the given tick is reached.
	fn wait(&self, tick: Tick) -> Pin<Box<dyn Future<Output = ()> + Send>> {
		let fut = async move {
			let now = SystemTime::now();
			let tick_onset = tick_to_time(tick);
			if now < tick_onset {
				if let Ok(until) = tick_onset.duration_since(now) {
					futures_timer::Delay::new(until).await;
				}
			}
		};

		Box::pin(fut)
	}
}

/// The wall-clock instant at which the given tick starts.
pub fn tick_to_time(tick: Tick) -> SystemTime {
	SystemTime::UNIX_EPOCH + Duration::from_millis(TICK_DURATION_MILLIS * tick)
}

/// assumes `slot_duration_millis` evenly divided by tick duration.
pub fn slot_number_to_tick(slot_duration_millis: u64, slot: Slot) -> Tick {
	let ticks_per_slot = slot_duration_millis / TICK_DURATION_MILLIS;
	slot.0 * ticks_per_slot
}

/// Pending wakeups of `(block, candidate)` pairs, ordered by tick.
///
/// At most one wakeup is kept per pair: scheduling an earlier tick replaces a later one and
/// scheduling a later tick is ignored.
#[derive(Debug, Default)]
pub(crate) struct Wakeups {
	// Tick -> [(Relay Block, Candidate Hash)]
	wakeups: BTreeMap<Tick, Vec<(Hash, CandidateHash)>>,
	reverse_wakeups: HashMap<(Hash, CandidateHash), Tick>,
	block_numbers: BTreeMap<BlockNumber, HashSet<Hash>>,
}

impl Wakeups {
	// Returns the first tick there exist wakeups for, if any.
	fn first(&self) -> Option<Tick> {
		self.wakeups.keys().next().cloned()
	}

	fn note_block(&mut self, block_hash: Hash, block_number: BlockNumber) {
		self.block_numbers.entry(block_number).or_default().insert(block_hash);
	}

	/// The tick of the pending wakeup for the given block and candidate, if any.
	pub(crate) fn wakeup_for(&self, block_hash: Hash, candidate_hash: CandidateHash) -> Option<Tick> {
		self.reverse_wakeups.get(&(block_hash, candidate_hash)).copied()
	}

	/// Schedules a wakeup at the given tick. No-op if there is already an earlier or equal wake-up
	/// for these values. Replaces any later wakeup.
	pub(crate) fn schedule(
		&mut self,
		block_hash: Hash,
		block_number: BlockNumber,
		candidate_hash: CandidateHash,
		tick: Tick,
	) {
		if let Some(prev) = self.reverse_wakeups.get(&(block_hash, candidate_hash)) {
			if prev <= &tick {
				return
			}

			// we are replacing previous wakeup with an earlier one.
			if let btree_map::Entry::Occupied(mut entry) = self.wakeups.entry(*prev) {
				if let Some(pos) =
					entry.get().iter().position(|x| x == &(block_hash, candidate_hash))
				{
					entry.get_mut().remove(pos);
				}

				if entry.get().is_empty() {
					let _ = entry.remove_entry();
				}
			}
		} else {
			self.note_block(block_hash, block_number);
		}

		self.reverse_wakeups.insert((block_hash, candidate_hash), tick);
		self.wakeups.entry(tick).or_default().push((block_hash, candidate_hash));
	}

	/// Prunes all wakeups of blocks at or below the finalized height.
	pub(crate) fn prune_finalized_wakeups(&mut self, finalized_number: BlockNumber) {
		let after = self.block_numbers.split_off(&(finalized_number + 1));
		let pruned_blocks: HashSet<_> = std::mem::replace(&mut self.block_numbers, after)
			.into_iter()
			.flat_map(|(_number, hashes)| hashes)
			.collect();

		self.prune_blocks(&pruned_blocks);
	}

	/// Prunes all wakeups of the given blocks, regardless of their height.
	pub(crate) fn prune_blocks(&mut self, pruned_blocks: &HashSet<Hash>) {
		if pruned_blocks.is_empty() {
			return
		}

		for hashes in self.block_numbers.values_mut() {
			hashes.retain(|h| !pruned_blocks.contains(h));
		}
		self.block_numbers.retain(|_, hashes| !hashes.is_empty());

		let mut pruned_wakeups = BTreeMap::new();
		self.reverse_wakeups.retain(|&(ref h, ref c_h), tick| {
			let live = !pruned_blocks.contains(h);
			if !live {
				pruned_wakeups.entry(*tick).or_insert_with(HashSet::new).insert((*h, *c_h));
			}
			live
		});

		for (tick, pruned) in pruned_wakeups {
			if let btree_map::Entry::Occupied(mut entry) = self.wakeups.entry(tick) {
				entry.get_mut().retain(|wakeup| !pruned.contains(wakeup));
				if entry.get().is_empty() {
					let _ = entry.remove();
				}
			}
		}
	}

	// Takes one wakeup scheduled exactly at `tick`, if any remains.
	fn pop_at(&mut self, tick: Tick) -> Option<(Tick, Hash, CandidateHash)> {
		let mut entry = match self.wakeups.entry(tick) {
			btree_map::Entry::Occupied(entry) => entry,
			btree_map::Entry::Vacant(_) => return None,
		};

		let popped = entry.get_mut().pop();
		if entry.get().is_empty() {
			let _ = entry.remove();
		}

		let (hash, candidate_hash) = popped?;
		self.reverse_wakeups.remove(&(hash, candidate_hash));
		Some((tick, hash, candidate_hash))
	}

	/// Get the wakeup for a particular block/candidate combo, if any.
	///
	/// Waits on the clock until the first scheduled tick is reached. Never concludes while
	/// there are no wakeups.
	pub(crate) async fn next(&mut self, clock: &(dyn Clock + Sync)) -> (Tick, Hash, CandidateHash) {
		loop {
			let tick = match self.first() {
				None => return future::pending().await,
				Some(tick) => tick,
			};

			clock.wait(tick).await;

			if let Some(woken) = self.pop_at(tick) {
				return woken
			}
		}
	}
}
