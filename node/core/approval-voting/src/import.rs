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

//! Block import logic for the approval voting subsystem.
//!
//! There are two major concerns when handling block import notifications.
//!   * Determining all new blocks.
//!   * Handling session changes
//!
//! When receiving a block import notification, the approval voting subsystem needs to account
//! for the fact that there may have been blocks missed by the notification. It needs to iterate
//! the ancestry of the block notification back to either the last finalized block or a block
//! that is already accounted for within the store.
//!
//! We maintain a rolling window of session indices. This starts as empty

use polkadot_node_primitives::{
	approval::{self as approval_types, BlockApprovalMeta, RelayVRFStory},
	BlockNumber, CandidateHash, CandidateReceipt, CoreIndex, GroupIndex, Hash, Header,
	SessionIndex, Slot,
};

use bitvec::{order::Lsb0, vec::BitVec};
use std::collections::HashMap;

use crate::{
	config::{APPROVAL_SESSIONS, MAX_HEADS_LOOK_BACK},
	criteria::{AssignmentCriteria, OurAssignment},
	entries::{BlockEntry, CandidateEntry},
	error::{Error, Result},
	interfaces::{CandidateEvent, ChainApi, ChainApiError, RuntimeApi},
	keystore::Keystore,
	ops,
	rolling_session_window::{RollingSessionWindow, SessionWindowUpdate, SessionsUnavailable},
	time::{slot_number_to_tick, Tick},
	State, LOG_TARGET,
};

#[derive(Debug)]
struct ImportedBlockInfo {
	included_candidates: Vec<(CandidateHash, CandidateReceipt, CoreIndex, GroupIndex)>,
	session_index: SessionIndex,
	assignments: HashMap<CoreIndex, OurAssignment>,
	n_validators: usize,
	relay_vrf_story: RelayVRFStory,
	slot: Slot,
	force_approve: Option<BlockNumber>,
}

struct ImportedBlockInfoEnv<'a> {
	runtime: &'a dyn RuntimeApi,
	session_window: &'a Option<RollingSessionWindow>,
	assignment_criteria: &'a dyn AssignmentCriteria,
	keystore: &'a dyn Keystore,
}

/// Computes information about the imported block. Returns an error if the info couldn't be extracted.
async fn imported_block_info(
	env: ImportedBlockInfoEnv<'_>,
	block_hash: Hash,
	block_header: &Header,
) -> Result<ImportedBlockInfo> {
	// fetch candidates
	let included_candidates: Vec<_> = env
		.runtime
		.candidate_events(block_hash)
		.await?
		.into_iter()
		.filter_map(|e| match e {
			CandidateEvent::CandidateIncluded(receipt, core, group) =>
				Some((receipt.hash(), receipt, core, group)),
			_ => None,
		})
		.collect();

	// fetch session. ignore blocks that are too old, but unless sessions are really
	// short, that shouldn't happen.
	let session_index = env.runtime.session_index_for_child(block_header.parent_hash).await?;

	if env
		.session_window
		.as_ref()
		.map_or(true, |s| session_index < s.earliest_session())
	{
		tracing::debug!(
			target: LOG_TARGET,
			?block_hash,
			session_index,
			"Block is from ancient session. Skipping",
		);

		return Err(Error::BlockFromAncientSession(block_hash, session_index))
	}

	// The epoch is read from the post-state of the block itself: a block triggering an epoch
	// change still has the old epoch in the state of its parent.
	let babe_epoch = env.runtime.babe_epoch(block_hash).await?;

	let session_info = match env.session_window.as_ref().and_then(|s| s.session_info(session_index))
	{
		Some(s) => s,
		None => {
			tracing::debug!(target: LOG_TARGET, ?block_hash, "Session info unavailable for block");

			return Err(Error::SessionInfoUnavailable(session_index))
		},
	};

	let (assignments, slot, relay_vrf_story) = {
		let unsafe_vrf = match approval_types::babe_unsafe_vrf_info(block_header) {
			Some(unsafe_vrf) => unsafe_vrf,
			None => {
				tracing::debug!(
					target: LOG_TARGET,
					?block_hash,
					"BABE VRF info unavailable for block",
				);

				return Err(Error::VrfInfoUnavailable(block_hash))
			},
		};

		let slot = unsafe_vrf.slot();
		let relay_vrf = unsafe_vrf.compute_randomness(
			&babe_epoch.authorities,
			&babe_epoch.randomness,
			babe_epoch.epoch_index,
		)?;

		let assignments = env.assignment_criteria.compute_assignments(
			env.keystore,
			relay_vrf,
			&crate::criteria::Config::from(session_info),
			included_candidates
				.iter()
				.map(|(c_hash, _, core, group)| (*c_hash, *core, *group))
				.collect(),
		);

		(assignments, slot, relay_vrf)
	};

	tracing::trace!(target: LOG_TARGET, n_assignments = assignments.len(), "Produced assignments");

	let force_approve = block_header.force_approve.filter(|num| *num < block_header.number);
	if let Some(num) = force_approve {
		tracing::trace!(
			target: LOG_TARGET,
			?block_hash,
			current_number = block_header.number,
			approved_number = num,
			"Force-approving based on header",
		);
	}

	Ok(ImportedBlockInfo {
		included_candidates,
		session_index,
		assignments,
		n_validators: session_info.validators.len(),
		relay_vrf_story,
		slot,
		force_approve,
	})
}

/// Given a new chain-head hash, this determines the hashes of all new blocks we should track
/// metadata for, given this head.
///
/// This is guaranteed to be a subset of the (inclusive) ancestry of `head` determined as all
/// blocks above the lower bound or above the highest known block, whichever is higher.
/// This is formatted in descending order by block height.
///
/// An implication of this is that if `head` itself is known or not above the lower bound,
/// then the returned list will be empty.
pub(crate) async fn determine_new_blocks(
	chain: &dyn ChainApi,
	is_known: impl Fn(&Hash) -> bool,
	head: Hash,
	header: &Header,
	lower_bound_number: BlockNumber,
) -> std::result::Result<Vec<(Hash, Header)>, ChainApiError> {
	const ANCESTRY_STEP: usize = 4;

	let min_block_needed = lower_bound_number + 1;

	// Early exit if the block is known or too early.
	if is_known(&head) || header.number < min_block_needed {
		return Ok(Vec::new())
	}

	let mut ancestry = vec![(head, header.clone())];

	// Early exit if the parent hash is known or no further blocks
	// are needed.
	if is_known(&header.parent_hash) || header.number == min_block_needed {
		return Ok(ancestry)
	}

	'outer: loop {
		let (last_hash, last_number, last_parent) = match ancestry.last() {
			Some((hash, header)) => (*hash, header.number, header.parent_hash),
			None => break,
		};

		// The last block in the ancestry is always above the minimum here.
		let ancestry_step =
			std::cmp::min(ANCESTRY_STEP, last_number.saturating_sub(min_block_needed) as usize);

		let batch_hashes = if ancestry_step <= 1 {
			vec![last_parent]
		} else {
			// Continue past these errors.
			match chain.ancestors(last_hash, ancestry_step).await {
				Err(_) => break 'outer,
				Ok(ancestors) => ancestors,
			}
		};

		let mut batch_headers = Vec::with_capacity(batch_hashes.len());
		for hash in &batch_hashes {
			// Any failed header fetch means we'll just ignore those blocks
			// as the chain has failed us.
			match chain.block_header(*hash).await {
				Ok(Some(h)) => batch_headers.push(h),
				Ok(None) | Err(_) => break 'outer,
			}
		}

		if batch_hashes.is_empty() {
			break
		}

		for (hash, header) in batch_hashes.into_iter().zip(batch_headers) {
			let is_relevant = header.number >= min_block_needed;
			let is_terminating = header.number == min_block_needed;

			if is_known(&hash) || !is_relevant {
				break 'outer
			}

			ancestry.push((hash, header));

			if is_terminating {
				break 'outer
			}
		}
	}

	Ok(ancestry)
}

/// Update the rolling session window based on the session of the given head's child.
///
/// Returns `None` when the window is first initialized.
pub(crate) async fn cache_session_info_for_head(
	state: &mut State,
	runtime: &dyn RuntimeApi,
	head: Hash,
) -> std::result::Result<Option<SessionWindowUpdate>, SessionsUnavailable> {
	match state.session_window.as_mut() {
		Some(window) => window.cache_session_info_for_head(runtime, head).await.map(Some),
		None => {
			state.session_window =
				Some(RollingSessionWindow::new(runtime, APPROVAL_SESSIONS, head).await?);
			Ok(None)
		},
	}
}

/// Information about a block and imported candidates.
#[derive(Debug)]
pub struct BlockImportedCandidates {
	pub block_hash: Hash,
	pub block_number: BlockNumber,
	pub block_tick: Tick,
	pub imported_candidates: Vec<(CandidateHash, CandidateEntry)>,
}

/// The result of importing a new head.
#[derive(Debug, Default)]
pub(crate) struct NewHeadOutcome {
	/// Information about all candidates imported under each block, in ascending block order.
	pub imported: Vec<BlockImportedCandidates>,
	/// Metadata for approval distribution about the newly imported chain.
	pub approval_meta: Vec<BlockApprovalMeta>,
	/// Blocks which are approved as of their import.
	pub approved: Vec<Hash>,
}

/// Handle a new notification of a header. This will
///   * determine all blocks to import,
///   * extract candidate information from them
///   * update the rolling session window
///   * compute our assignments
///   * import the block and candidates to the store
///   * and return information about all candidates imported under each block.
///
/// It is the responsibility of the caller to schedule wakeups for each block.
pub(crate) async fn handle_new_head(
	state: &mut State,
	runtime: &dyn RuntimeApi,
	chain: &dyn ChainApi,
	head: Hash,
	finalized_number: &Option<BlockNumber>,
) -> Result<NewHeadOutcome> {
	let header = match chain.block_header(head).await {
		Err(e) => {
			tracing::debug!(target: LOG_TARGET, error = %e, "Chain API temporarily unreachable");

			return Ok(NewHeadOutcome::default())
		},
		Ok(None) => {
			tracing::warn!(target: LOG_TARGET, ?head, "Missing header for new head");
			return Ok(NewHeadOutcome::default())
		},
		Ok(Some(h)) => h,
	};

	// Update session info based on most recent head.
	match cache_session_info_for_head(state, runtime, head).await {
		Err(e) => {
			tracing::debug!(
				target: LOG_TARGET,
				?head,
				?e,
				"Could not cache session info when processing head.",
			);

			return Ok(NewHeadOutcome::default())
		},
		Ok(Some(a @ SessionWindowUpdate::Advanced { .. })) => {
			tracing::info!(
				target: LOG_TARGET,
				update = ?a,
				"Advanced session window for approvals",
			);
		},
		Ok(_) => {},
	}

	// If we've just started the node and are far behind,
	// import at most `MAX_HEADS_LOOK_BACK` blocks.
	let lower_bound_number = header.number.saturating_sub(MAX_HEADS_LOOK_BACK);
	let lower_bound_number = finalized_number.unwrap_or(lower_bound_number).max(lower_bound_number);

	let new_blocks = determine_new_blocks(
		chain,
		|h| state.db.load_block_entry(h).is_some(),
		head,
		&header,
		lower_bound_number,
	)
	.await?;

	if new_blocks.is_empty() {
		return Ok(NewHeadOutcome::default())
	}

	let mut outcome = NewHeadOutcome {
		imported: Vec::with_capacity(new_blocks.len()),
		approval_meta: Vec::with_capacity(new_blocks.len()),
		approved: Vec::new(),
	};

	// `determine_new_blocks` gives us a vec in backwards order. we want to move forwards.
	let imported_blocks_and_info = {
		let mut imported_blocks_and_info = Vec::with_capacity(new_blocks.len());
		for (block_hash, block_header) in new_blocks.into_iter().rev() {
			let env = ImportedBlockInfoEnv {
				runtime,
				session_window: &state.session_window,
				assignment_criteria: &*state.assignment_criteria,
				keystore: &*state.keystore,
			};

			match imported_block_info(env, block_hash, &block_header).await {
				Ok(i) => imported_blocks_and_info.push((block_hash, block_header, i)),
				Err(error) => {
					// It's possible that we've lost a race with finality.
					let lost_to_finality = match chain.finalized_block_hash(block_header.number).await
					{
						Ok(Some(h)) if h != block_hash => true,
						_ => false,
					};

					if !lost_to_finality {
						// Such errors are likely spurious, but this prevents us from getting gaps
						// in the store.
						tracing::warn!(
							target: LOG_TARGET,
							"Skipping chain: unable to gather info about imported block {:?}: {}",
							(block_hash, block_header.number),
							error,
						);
					}

					return Ok(NewHeadOutcome::default())
				},
			};
		}

		imported_blocks_and_info
	};

	tracing::trace!(
		target: LOG_TARGET,
		imported_blocks = imported_blocks_and_info.len(),
		"Inserting imported blocks into the store"
	);

	for (block_hash, block_header, imported_block_info) in imported_blocks_and_info {
		let ImportedBlockInfo {
			included_candidates,
			session_index,
			assignments,
			n_validators,
			relay_vrf_story,
			slot,
			force_approve,
		} = imported_block_info;

		let session_info = match state
			.session_window
			.as_ref()
			.and_then(|s| s.session_info(session_index))
		{
			Some(s) => s,
			None => return Err(Error::SessionInfoUnavailable(session_index)),
		};

		let block_tick = slot_number_to_tick(state.slot_duration_millis, slot);
		let needed_approvals = session_info.needed_approvals as usize;
		let validator_group_lens: Vec<usize> =
			session_info.validator_groups.iter().map(|v| v.len()).collect();
		// insta-approve candidates on low-node testnets
		let num_candidates = included_candidates.len();
		let approved_bitfield = {
			if needed_approvals == 0 {
				tracing::debug!(
					target: LOG_TARGET,
					block_hash = ?block_hash,
					"Insta-approving all candidates",
				);
				BitVec::<u8, Lsb0>::repeat(true, num_candidates)
			} else {
				let mut result = BitVec::<u8, Lsb0>::repeat(false, num_candidates);
				for (i, &(_, _, _, backing_group)) in included_candidates.iter().enumerate() {
					let backing_group_size =
						validator_group_lens.get(backing_group.0 as usize).copied().unwrap_or(0);
					if n_validators.saturating_sub(backing_group_size) < needed_approvals {
						result.set(i, true);
					}
				}
				if result.any() {
					tracing::debug!(
						target: LOG_TARGET,
						block_hash = ?block_hash,
						"Insta-approving {}/{} candidates as the number of validators is too low",
						result.count_ones(),
						result.len(),
					);
				}

				result
			}
		};

		// If all bits are already set, the block is approved as of now.
		if approved_bitfield.all() {
			outcome.approved.push(block_hash);
		}

		let block_entry = BlockEntry {
			block_hash,
			parent_hash: block_header.parent_hash,
			block_number: block_header.number,
			session: session_index,
			slot,
			relay_vrf_story,
			candidates: included_candidates
				.iter()
				.map(|(hash, _, core, _)| (*core, *hash))
				.collect(),
			approved_bitfield,
			children: Vec::new(),
		};

		tracing::trace!(
			target: LOG_TARGET,
			?block_hash,
			block_number = block_header.number,
			"Writing BlockEntry",
		);

		let candidate_entries =
			ops::add_block_entry(&mut state.db, block_entry, n_validators, |candidate_hash| {
				included_candidates.iter().find(|(hash, _, _, _)| candidate_hash == hash).map(
					|(_, receipt, core, backing_group)| ops::NewCandidateInfo {
						candidate: receipt.clone(),
						backing_group: *backing_group,
						our_assignment: assignments.get(core).cloned(),
					},
				)
			});

		for _ in &candidate_entries {
			state.metrics.on_candidate_imported();
		}

		// force-approve needs to load the current block entry as well as all
		// ancestors. this can only be done after writing the block entry above.
		if let Some(up_to) = force_approve {
			tracing::debug!(target: LOG_TARGET, ?block_hash, up_to, "Enacting force-approve");
			let approved_hashes = ops::force_approve(&mut state.db, block_hash, up_to);
			tracing::debug!(
				target: LOG_TARGET,
				?block_hash,
				up_to,
				"Force-approving {} blocks",
				approved_hashes.len()
			);

			outcome.approved.extend(approved_hashes);
		}

		outcome.approval_meta.push(BlockApprovalMeta {
			hash: block_hash,
			number: block_header.number,
			parent_hash: block_header.parent_hash,
			candidates: included_candidates.iter().map(|(hash, _, _, _)| *hash).collect(),
			slot,
			session: session_index,
		});

		outcome.imported.push(BlockImportedCandidates {
			block_hash,
			block_number: block_header.number,
			block_tick,
			imported_candidates: candidate_entries,
		});
	}

	tracing::trace!(
		target: LOG_TARGET,
		head = ?head,
		chain_length = outcome.approval_meta.len(),
		"Informing distribution of newly imported chain",
	);

	Ok(outcome)
}
