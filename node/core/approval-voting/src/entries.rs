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

//! Block, candidate and approval entries.
//!
//! All of them live in memory, owned by the [`Backend`](crate::backend::Backend), and are
//! rebuilt from the chain on restart.

use polkadot_node_primitives::{
	approval::{AssignmentCert, DelayTranche, RelayVRFStory},
	BlockNumber, CandidateHash, CandidateReceipt, CoreIndex, GroupIndex, Hash, SessionIndex,
	Slot, ValidatorIndex, ValidatorSignature,
};

use bitvec::{order::Lsb0, slice::BitSlice, vec::BitVec};
use std::collections::BTreeMap;

use crate::{criteria::OurAssignment, time::Tick};

/// Metadata regarding a specific tranche of assignments for a specific candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct TrancheEntry {
	tranche: DelayTranche,
	// Assigned validators, and the instant we received their assignment, rounded
	// to the nearest tick.
	assignments: Vec<(ValidatorIndex, Tick)>,
}

impl TrancheEntry {
	/// Get the tranche of this entry.
	pub fn tranche(&self) -> DelayTranche {
		self.tranche
	}

	/// Get the assignments for this entry.
	pub fn assignments(&self) -> &[(ValidatorIndex, Tick)] {
		&self.assignments
	}
}

/// Metadata regarding approval of a particular candidate within the context of some
/// particular block.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalEntry {
	tranches: Vec<TrancheEntry>,
	backing_group: GroupIndex,
	our_assignment: Option<OurAssignment>,
	our_approval_sig: Option<ValidatorSignature>,
	// `n_validators` bits.
	assignments: BitVec<u8, Lsb0>,
	approved: bool,
}

impl ApprovalEntry {
	/// Convenience constructor
	pub fn new(
		tranches: Vec<TrancheEntry>,
		backing_group: GroupIndex,
		our_assignment: Option<OurAssignment>,
		our_approval_sig: Option<ValidatorSignature>,
		assignments: BitVec<u8, Lsb0>,
		approved: bool,
	) -> Self {
		Self { tranches, backing_group, our_assignment, our_approval_sig, assignments, approved }
	}

	/// An entry with no assignments yet, sized for `n_validators`.
	pub fn fresh(
		backing_group: GroupIndex,
		our_assignment: Option<OurAssignment>,
		n_validators: usize,
	) -> Self {
		Self::new(
			Vec::new(),
			backing_group,
			our_assignment,
			None,
			BitVec::repeat(false, n_validators),
			false,
		)
	}

	/// Our assignment to this candidate under this block, if any.
	pub fn our_assignment(&self) -> Option<&OurAssignment> {
		self.our_assignment.as_ref()
	}

	/// Note that our assignment is triggered. No-op if already triggered.
	pub fn trigger_our_assignment(
		&mut self,
		tick_now: Tick,
	) -> Option<(AssignmentCert, ValidatorIndex, DelayTranche)> {
		let our = self.our_assignment.as_mut().and_then(|a| {
			if a.triggered() {
				return None
			}
			a.mark_triggered();

			Some(a.clone())
		});

		our.map(|a| {
			self.import_assignment(a.tranche(), a.validator_index(), tick_now);

			(a.cert().clone(), a.validator_index(), a.tranche())
		})
	}

	/// Import our local approval vote signature for this candidate.
	pub fn import_approval_sig(&mut self, approval_sig: ValidatorSignature) {
		self.our_approval_sig = Some(approval_sig);
	}

	/// Our approval signature, once we have issued one.
	pub fn our_approval_sig(&self) -> Option<&ValidatorSignature> {
		self.our_approval_sig.as_ref()
	}

	/// Whether a validator is already assigned.
	pub fn is_assigned(&self, validator_index: ValidatorIndex) -> bool {
		self.assignments.get(validator_index.0 as usize).map(|b| *b).unwrap_or(false)
	}

	/// Import an assignment. No-op if the validator is already assigned or out of bounds.
	pub fn import_assignment(
		&mut self,
		tranche: DelayTranche,
		validator_index: ValidatorIndex,
		tick_now: Tick,
	) {
		match self.assignments.get_mut(validator_index.0 as usize) {
			None => return,
			Some(ref bit) if **bit => return,
			Some(mut bit) => *bit = true,
		}

		// linear search probably faster than binary. not many tranches typically.
		let idx = match self.tranches.iter().position(|t| t.tranche >= tranche) {
			Some(pos) => {
				if self.tranches[pos].tranche > tranche {
					self.tranches.insert(pos, TrancheEntry { tranche, assignments: Vec::new() });
				}

				pos
			},
			None => {
				self.tranches.push(TrancheEntry { tranche, assignments: Vec::new() });

				self.tranches.len() - 1
			},
		};

		self.tranches[idx].assignments.push((validator_index, tick_now));
	}

	/// Produce a bitvec indicating the assignments of all validators up to and
	/// including `tranche`.
	pub fn assignments_up_to(&self, tranche: DelayTranche) -> BitVec<u8, Lsb0> {
		self.tranches.iter().take_while(|e| e.tranche <= tranche).fold(
			BitVec::repeat(false, self.assignments.len()),
			|mut a, e| {
				for &(v, _) in &e.assignments {
					a.set(v.0 as _, true);
				}

				a
			},
		)
	}

	/// Whether the approval entry is approved
	pub fn is_approved(&self) -> bool {
		self.approved
	}

	/// Mark the approval entry as approved.
	pub fn mark_approved(&mut self) {
		self.approved = true;
	}

	/// Access the tranches.
	pub fn tranches(&self) -> &[TrancheEntry] {
		&self.tranches
	}

	/// Get the number of validators in this approval entry.
	pub fn n_validators(&self) -> usize {
		self.assignments.len()
	}

	/// Get the number of assignments by validators, including the local validator.
	pub fn n_assignments(&self) -> usize {
		self.assignments.count_ones()
	}

	/// Get the backing group index of the approval entry.
	pub fn backing_group(&self) -> GroupIndex {
		self.backing_group
	}
}

/// Metadata regarding approval of a particular candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEntry {
	candidate: CandidateReceipt,
	session: SessionIndex,
	// Assignments are based on blocks, so we need to track assignments separately
	// based on the block we are looking at.
	block_assignments: BTreeMap<Hash, ApprovalEntry>,
	approvals: BitVec<u8, Lsb0>,
}

impl CandidateEntry {
	/// A candidate entry with no approval entries and no approvals.
	pub fn new(candidate: CandidateReceipt, session: SessionIndex, n_validators: usize) -> Self {
		CandidateEntry {
			candidate,
			session,
			block_assignments: BTreeMap::new(),
			approvals: BitVec::repeat(false, n_validators),
		}
	}

	/// Access the bit-vec of approvals.
	pub fn approvals(&self) -> &BitSlice<u8, Lsb0> {
		&self.approvals
	}

	/// Note that a given validator has approved. Return the previous approval state.
	pub fn mark_approval(&mut self, validator: ValidatorIndex) -> bool {
		match self.approvals.get_mut(validator.0 as usize) {
			None => false,
			Some(mut bit) => std::mem::replace(&mut *bit, true),
		}
	}

	/// Whether the given validator has approved this candidate.
	pub fn has_approved(&self, validator: ValidatorIndex) -> bool {
		self.approvals.get(validator.0 as usize).map(|b| *b).unwrap_or(false)
	}

	/// Get the candidate receipt.
	pub fn candidate_receipt(&self) -> &CandidateReceipt {
		&self.candidate
	}

	/// Get the approval entry, mutably, for this candidate under a specific block.
	pub fn approval_entry_mut(&mut self, block_hash: &Hash) -> Option<&mut ApprovalEntry> {
		self.block_assignments.get_mut(block_hash)
	}

	/// Get the approval entry for this candidate under a specific block.
	pub fn approval_entry(&self, block_hash: &Hash) -> Option<&ApprovalEntry> {
		self.block_assignments.get(block_hash)
	}

	/// All blocks the candidate is included in, with the approval entries under them.
	pub fn block_assignments(&self) -> impl Iterator<Item = (&Hash, &ApprovalEntry)> {
		self.block_assignments.iter()
	}

	pub(crate) fn add_approval_entry(&mut self, block_hash: Hash, entry: ApprovalEntry) {
		self.block_assignments.insert(block_hash, entry);
	}

	pub(crate) fn remove_approval_entry(&mut self, block_hash: &Hash) -> Option<ApprovalEntry> {
		self.block_assignments.remove(block_hash)
	}

	/// Whether no block references this candidate any longer.
	pub fn has_no_approval_entries(&self) -> bool {
		self.block_assignments.is_empty()
	}
}

/// Metadata regarding approval of a particular block, by way of approval of the
/// candidates contained within it.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEntry {
	pub(crate) block_hash: Hash,
	pub(crate) parent_hash: Hash,
	pub(crate) block_number: BlockNumber,
	pub(crate) session: SessionIndex,
	pub(crate) slot: Slot,
	pub(crate) relay_vrf_story: RelayVRFStory,
	// The candidates included as-of this block and the index of the core they are
	// leaving. Sorted ascending by core index.
	pub(crate) candidates: Vec<(CoreIndex, CandidateHash)>,
	// A bitfield where the i'th bit corresponds to the i'th candidate in `candidates`.
	// The i'th bit is `true` iff the candidate has been approved in the context of this
	// block. The block can be considered approved if the bitfield has all bits set to `true`.
	pub(crate) approved_bitfield: BitVec<u8, Lsb0>,
	pub(crate) children: Vec<Hash>,
}

impl BlockEntry {
	/// Mark a candidate as fully approved in the bitfield.
	pub fn mark_approved_by_hash(&mut self, candidate_hash: &CandidateHash) {
		if let Some(p) = self.candidates.iter().position(|(_, h)| h == candidate_hash) {
			self.approved_bitfield.set(p, true);
		}
	}

	/// Whether a candidate is approved in the bitfield.
	pub fn is_candidate_approved(&self, candidate_hash: &CandidateHash) -> bool {
		self.candidates
			.iter()
			.position(|(_, h)| h == candidate_hash)
			.and_then(|p| self.approved_bitfield.get(p).map(|b| *b))
			.unwrap_or(false)
	}

	/// Whether the block entry is fully approved.
	pub fn is_fully_approved(&self) -> bool {
		self.approved_bitfield.all()
	}

	/// Iterate over all unapproved candidates.
	pub fn unapproved_candidates(&self) -> impl Iterator<Item = CandidateHash> + '_ {
		self.approved_bitfield.iter_zeros().filter_map(move |i| self.candidates.get(i)).map(|c| c.1)
	}

	/// Get the slot of the block.
	pub fn slot(&self) -> Slot {
		self.slot
	}

	/// Get the relay-vrf-story of the block.
	pub fn relay_vrf_story(&self) -> RelayVRFStory {
		self.relay_vrf_story
	}

	/// Get the session index of the block.
	pub fn session(&self) -> SessionIndex {
		self.session
	}

	/// Get the i'th candidate.
	pub fn candidate(&self, i: usize) -> Option<&(CoreIndex, CandidateHash)> {
		self.candidates.get(i)
	}

	/// Access the underlying candidates as a slice.
	pub fn candidates(&self) -> &[(CoreIndex, CandidateHash)] {
		&self.candidates
	}

	/// Access the block number of the block entry.
	pub fn block_number(&self) -> BlockNumber {
		self.block_number
	}

	/// Access the block hash of the block entry.
	pub fn block_hash(&self) -> Hash {
		self.block_hash
	}

	/// Access the parent hash of the block entry.
	pub fn parent_hash(&self) -> Hash {
		self.parent_hash
	}

	/// The blocks built on top of this one that we know of.
	#[cfg(test)]
	pub fn children(&self) -> &[Hash] {
		&self.children
	}

	/// Note a child block.
	pub fn add_child(&mut self, child: Hash) {
		if !self.children.contains(&child) {
			self.children.push(child);
		}
	}
}
