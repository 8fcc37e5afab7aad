// Copyright 2021 Parity Technologies (UK) Ltd.
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

//! An in-memory store of the approval voting state.
//!
//! The store owns every [`BlockEntry`] and [`CandidateEntry`], indexed by hash, along with the
//! hashes of all stored blocks at each height. Nothing outside of the approval voting task holds
//! a reference into it.

use polkadot_node_primitives::{BlockNumber, CandidateHash, Hash};

use std::collections::{BTreeMap, HashMap};

use crate::entries::{BlockEntry, CandidateEntry};

/// A range from earliest..last block number stored within the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlockRange(pub(crate) BlockNumber, pub(crate) BlockNumber);

/// Storage for the block and candidate entries of the approval voting task.
#[derive(Debug, Default)]
pub struct Backend {
	stored_block_range: Option<StoredBlockRange>,
	blocks_at_height: BTreeMap<BlockNumber, Vec<Hash>>,
	block_entries: HashMap<Hash, BlockEntry>,
	candidate_entries: HashMap<CandidateHash, CandidateEntry>,
}

impl Backend {
	/// Load a block entry.
	pub fn load_block_entry(&self, hash: &Hash) -> Option<&BlockEntry> {
		self.block_entries.get(hash)
	}

	/// Load a block entry for modification.
	pub fn block_entry_mut(&mut self, hash: &Hash) -> Option<&mut BlockEntry> {
		self.block_entries.get_mut(hash)
	}

	/// Load a candidate entry.
	pub fn load_candidate_entry(&self, candidate_hash: &CandidateHash) -> Option<&CandidateEntry> {
		self.candidate_entries.get(candidate_hash)
	}

	/// Load a candidate entry for modification.
	pub fn candidate_entry_mut(
		&mut self,
		candidate_hash: &CandidateHash,
	) -> Option<&mut CandidateEntry> {
		self.candidate_entries.get_mut(candidate_hash)
	}

	/// Load all blocks at a specific height.
	pub fn load_blocks_at_height(&self, height: &BlockNumber) -> &[Hash] {
		self.blocks_at_height.get(height).map(|v| &v[..]).unwrap_or(&[])
	}

	/// Load the stored block range.
	pub fn load_stored_blocks(&self) -> Option<StoredBlockRange> {
		self.stored_block_range
	}

	/// Return all stored blocks, ascending by height.
	#[cfg(test)]
	pub fn load_all_blocks(&self) -> Vec<Hash> {
		self.blocks_at_height.values().flatten().copied().collect()
	}

	pub(crate) fn write_stored_block_range(&mut self, range: StoredBlockRange) {
		self.stored_block_range = Some(range);
	}

	pub(crate) fn write_blocks_at_height(&mut self, height: BlockNumber, blocks: Vec<Hash>) {
		self.blocks_at_height.insert(height, blocks);
	}

	pub(crate) fn delete_blocks_at_height(&mut self, height: BlockNumber) -> Vec<Hash> {
		self.blocks_at_height.remove(&height).unwrap_or_default()
	}

	pub(crate) fn write_block_entry(&mut self, entry: BlockEntry) {
		self.block_entries.insert(entry.block_hash(), entry);
	}

	pub(crate) fn delete_block_entry(&mut self, hash: &Hash) -> Option<BlockEntry> {
		self.block_entries.remove(hash)
	}

	pub(crate) fn write_candidate_entry(&mut self, entry: CandidateEntry) {
		self.candidate_entries.insert(entry.candidate_receipt().hash(), entry);
	}

	pub(crate) fn delete_candidate_entry(&mut self, hash: &CandidateHash) {
		self.candidate_entries.remove(hash);
	}
}
