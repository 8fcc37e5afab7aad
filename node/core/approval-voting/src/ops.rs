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

//! Middleware interface that leverages the in-memory backend to add and prune entries.

use polkadot_node_primitives::{BlockNumber, CandidateHash, CandidateReceipt, GroupIndex, Hash};

use std::collections::{hash_map::Entry, HashMap, HashSet};

use crate::{
	backend::{Backend, StoredBlockRange},
	criteria::OurAssignment,
	entries::{ApprovalEntry, BlockEntry, CandidateEntry},
};

/// Information about a new candidate necessary to instantiate the requisite
/// candidate and approval entries.
#[derive(Clone)]
pub(crate) struct NewCandidateInfo {
	pub candidate: CandidateReceipt,
	pub backing_group: GroupIndex,
	pub our_assignment: Option<OurAssignment>,
}

/// Canonicalize some particular block, pruning everything before it and
/// pruning any competing branches at the same height.
///
/// Returns the hashes of all pruned blocks.
pub(crate) fn canonicalize(
	store: &mut Backend,
	canon_number: BlockNumber,
	canon_hash: Hash,
) -> HashSet<Hash> {
	let mut pruned = HashSet::new();

	let range = match store.load_stored_blocks() {
		None => return pruned,
		Some(range) if range.0 > canon_number => return pruned,
		Some(range) => range,
	};

	// Candidates which lost an approval entry, to be deleted if no block references them.
	let mut visited_candidates = HashSet::new();

	// All the block heights we visited but didn't necessarily delete everything from.
	let mut visited_heights = HashMap::new();

	let mut visit_and_remove_block_entry =
		|block_hash: Hash, store: &mut Backend, pruned: &mut HashSet<Hash>| -> Vec<Hash> {
			let block_entry = match store.delete_block_entry(&block_hash) {
				None => return Vec::new(),
				Some(b) => b,
			};

			pruned.insert(block_hash);
			for &(_, ref candidate_hash) in block_entry.candidates() {
				if let Some(candidate) = store.candidate_entry_mut(candidate_hash) {
					candidate.remove_approval_entry(&block_hash);
					visited_candidates.insert(*candidate_hash);
				}
			}

			block_entry.children
		};

	// First visit everything before the height.
	for i in range.0..canon_number {
		let at_height = store.delete_blocks_at_height(i);

		for b in at_height {
			let _ = visit_and_remove_block_entry(b, store, &mut pruned);
		}
	}

	// Then visit everything at the height.
	let pruned_branches = {
		let at_height = store.delete_blocks_at_height(canon_number);

		// Note that while there may be branches descending from blocks at earlier heights,
		// we have already covered them by removing everything at earlier heights.
		let mut pruned_branches = Vec::new();

		for b in at_height {
			let children = visit_and_remove_block_entry(b, store, &mut pruned);

			if b != canon_hash {
				pruned_branches.extend(children);
			}
		}

		pruned_branches
	};

	// Follow all children of non-canonicalized blocks.
	{
		let mut frontier: Vec<(BlockNumber, Hash)> =
			pruned_branches.into_iter().map(|h| (canon_number + 1, h)).collect();
		while let Some((height, next_child)) = frontier.pop() {
			let children = visit_and_remove_block_entry(next_child, store, &mut pruned);

			// extend the frontier of branches to include the given height.
			frontier.extend(children.into_iter().map(|h| (height + 1, h)));

			// visit the at-height key for this deleted block's height.
			let at_height = match visited_heights.entry(height) {
				Entry::Occupied(e) => e.into_mut(),
				Entry::Vacant(e) => e.insert(store.load_blocks_at_height(&height).to_vec()),
			};
			if let Some(i) = at_height.iter().position(|x| x == &next_child) {
				at_height.remove(i);
			}
		}
	}

	// Delete all `CandidateEntry`s which now have empty `block_assignments`.
	for candidate_hash in visited_candidates {
		let unreferenced = store
			.load_candidate_entry(&candidate_hash)
			.map_or(false, |c| c.has_no_approval_entries());

		if unreferenced {
			store.delete_candidate_entry(&candidate_hash);
		}
	}

	// Update all blocks-at-height keys, deleting all those which are now empty.
	for (h, at) in visited_heights.into_iter() {
		if at.is_empty() {
			let _ = store.delete_blocks_at_height(h);
		} else {
			store.write_blocks_at_height(h, at);
		}
	}

	// due to the fork pruning, this range actually might go too far above where our actual highest block is,
	// if a relatively short fork is canonicalized.
	let new_range = StoredBlockRange(canon_number + 1, std::cmp::max(range.1, canon_number + 2));

	store.write_stored_block_range(new_range);

	pruned
}

/// Record a new block entry.
///
/// This will update the blocks-at-height mapping, the stored block range, if necessary,
/// and add block and candidate entries. It will also add approval entries to existing
/// candidate entries and add this as a child of any block entry corresponding to the
/// parent hash.
///
/// Has no effect if there is already an entry for the block or `candidate_info` returns
/// `None` for any of the candidates referenced by the block entry. In these cases,
/// no information about new candidates will be referred to by this function.
pub(crate) fn add_block_entry(
	store: &mut Backend,
	entry: BlockEntry,
	n_validators: usize,
	candidate_info: impl Fn(&CandidateHash) -> Option<NewCandidateInfo>,
) -> Vec<(CandidateHash, CandidateEntry)> {
	let session = entry.session();
	let parent_hash = entry.parent_hash();
	let number = entry.block_number();

	if store.load_block_entry(&entry.block_hash()).is_some() {
		// seems we already have a block entry for this block. nothing to do here.
		return Vec::new()
	}

	let infos = match entry
		.candidates()
		.iter()
		.map(|(_, candidate_hash)| candidate_info(candidate_hash).map(|i| (*candidate_hash, i)))
		.collect::<Option<Vec<_>>>()
	{
		None => return Vec::new(),
		Some(infos) => infos,
	};

	// Update the stored block range.
	{
		let new_range = match store.load_stored_blocks() {
			None => Some(StoredBlockRange(number, number + 1)),
			Some(range) if range.1 <= number => Some(StoredBlockRange(range.0, number + 1)),
			Some(range) if range.0 > number => Some(StoredBlockRange(number, range.1)),
			Some(_) => None,
		};

		if let Some(range) = new_range {
			store.write_stored_block_range(range);
		}
	};

	// Update the blocks at height meta key.
	{
		let mut blocks_at_height = store.load_blocks_at_height(&number).to_vec();
		blocks_at_height.push(entry.block_hash());
		store.write_blocks_at_height(number, blocks_at_height)
	};

	let mut candidate_entries = Vec::with_capacity(infos.len());

	for (candidate_hash, NewCandidateInfo { candidate, backing_group, our_assignment }) in infos {
		let mut candidate_entry = store
			.load_candidate_entry(&candidate_hash)
			.cloned()
			.unwrap_or_else(move || CandidateEntry::new(candidate, session, n_validators));

		candidate_entry.add_approval_entry(
			entry.block_hash(),
			ApprovalEntry::fresh(backing_group, our_assignment, n_validators),
		);

		store.write_candidate_entry(candidate_entry.clone());

		candidate_entries.push((candidate_hash, candidate_entry));
	}

	// Update the child index for the parent.
	if let Some(parent) = store.block_entry_mut(&parent_hash) {
		parent.add_child(entry.block_hash());
	}

	// Put the new block entry in.
	store.write_block_entry(entry);

	candidate_entries
}

/// Forcibly approve all candidates included at up to the given relay-chain height in the indicated
/// chain.
///
/// Returns the hashes of the blocks which became fully approved by this.
pub(crate) fn force_approve(
	store: &mut Backend,
	chain_head: Hash,
	up_to: BlockNumber,
) -> Vec<Hash> {
	let mut approved_hashes = Vec::new();
	let mut cur_hash = chain_head;

	// iterate back to the `up_to` block, and then iterate backwards until all blocks
	// are updated.
	while let Some(entry) = store.block_entry_mut(&cur_hash) {
		cur_hash = entry.parent_hash();

		if entry.block_number() > up_to {
			continue
		}

		if !entry.is_fully_approved() {
			entry.approved_bitfield.fill(true);
			approved_hashes.push(entry.block_hash());
		}
	}

	approved_hashes
}
