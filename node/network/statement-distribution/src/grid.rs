// Copyright 2022 Parity Technologies (UK) Ltd.
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

//! Utilities for handling distribution of backed candidates along the grid.
//!
//! Members of a backing group share statements among themselves directly. Once a
//! candidate is backed, the group advertises it along the grid with a
//! "manifest": a summary of the statements known about it. Every validator in
//! the session sees a backed candidate along at most two hops of the grid.
//!
//! Receivers which already know the candidate answer a manifest with an
//! acknowledgement, which is just a manifest in the opposite direction. Once
//! two validators have exchanged manifests, they keep each other up to date
//! with the statements the other is missing, sent directly.

use polkadot_node_network_protocol::{grid_topology::SessionGridTopology, vstaging::StatementFilter};
use polkadot_node_primitives::{CandidateHash, CompactStatement, GroupIndex, Hash, ValidatorIndex};

use bitvec::{order::Lsb0, slice::BitSlice, vec::BitVec};

use std::collections::{
	hash_map::{Entry, HashMap},
	HashSet,
};

use crate::{groups::Groups, LOG_TARGET};

/// Our local view of a subset of the grid topology organized around a specific
/// validator group.
///
/// This tracks which authorities we expect to communicate with concerning
/// candidates from the group. This includes both the authorities we are
/// expected to send to as well as the authorities we expect to receive from.
///
/// In the case that this group is the group that we are locally assigned to,
/// the 'receiving' side will be empty.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GroupSubView {
	sending: HashSet<ValidatorIndex>,
	receiving: HashSet<ValidatorIndex>,
}

impl GroupSubView {
	/// Validators we forward manifests for this group to.
	pub fn sending(&self) -> &HashSet<ValidatorIndex> {
		&self.sending
	}

	/// Validators we accept manifests for this group from.
	pub fn receiving(&self) -> &HashSet<ValidatorIndex> {
		&self.receiving
	}
}

/// Our local view of the topology for a session, as it pertains to backed
/// candidate distribution.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionTopologyView {
	group_views: HashMap<GroupIndex, GroupSubView>,
}

impl SessionTopologyView {
	/// The sub-view for a group, if the group exists.
	pub fn group_view(&self, group: GroupIndex) -> Option<&GroupSubView> {
		self.group_views.get(&group)
	}

	/// Whether the validator is one we send manifests to or receive them from,
	/// for any group.
	pub fn is_grid_peer(&self, validator: ValidatorIndex) -> bool {
		self.group_views
			.values()
			.any(|v| v.sending.contains(&validator) || v.receiving.contains(&validator))
	}
}

/// Build a view of the topology for the session.
///
/// For groups that we are part of: we receive from nobody and send to our X/Y
/// peers outside the group.
///
/// For groups that we are not part of: we receive from any validator in the
/// group we share a slice with and send to the corresponding X/Y slice. For any
/// validators we don't share a slice with, we receive from the nodes which
/// share a slice with them.
pub fn build_session_topology<'a>(
	groups: impl IntoIterator<Item = &'a Vec<ValidatorIndex>>,
	topology: &SessionGridTopology,
	our_index: Option<ValidatorIndex>,
) -> SessionTopologyView {
	let mut view = SessionTopologyView { group_views: HashMap::new() };

	let our_index = match our_index {
		None => return view,
		Some(i) => i,
	};

	let our_neighbors = match topology.compute_grid_neighbors_for(our_index) {
		None => {
			tracing::warn!(target: LOG_TARGET, ?our_index, "our index unrecognized in topology?");

			return view
		},
		Some(n) => n,
	};

	for (i, group) in groups.into_iter().enumerate() {
		let mut sub_view = GroupSubView::default();
		let outside_group = |v: &&ValidatorIndex| !group.contains(*v);

		if group.contains(&our_index) {
			sub_view.sending.extend(our_neighbors.validator_indices_x.iter().filter(outside_group));
			sub_view.sending.extend(our_neighbors.validator_indices_y.iter().filter(outside_group));
		} else {
			for &group_val in group {
				// If the validator shares a slice with us, we expect to
				// receive from them and send to our neighbors in the other
				// dimension.

				if our_neighbors.validator_indices_x.contains(&group_val) {
					sub_view.receiving.insert(group_val);
					sub_view
						.sending
						.extend(our_neighbors.validator_indices_y.iter().filter(outside_group));

					continue
				}

				if our_neighbors.validator_indices_y.contains(&group_val) {
					sub_view.receiving.insert(group_val);
					sub_view
						.sending
						.extend(our_neighbors.validator_indices_x.iter().filter(outside_group));

					continue
				}

				// If they don't share a slice with us, we don't send to anybody
				// but receive from any peers sharing a dimension with both of us.
				let their_neighbors = match topology.compute_grid_neighbors_for(group_val) {
					None => {
						tracing::warn!(
							target: LOG_TARGET,
							index = ?group_val,
							"validator index unrecognized in topology?"
						);

						continue
					},
					Some(n) => n,
				};

				// their X, our Y
				for potential_link in &their_neighbors.validator_indices_x {
					if our_neighbors.validator_indices_y.contains(potential_link) {
						sub_view.receiving.insert(*potential_link);
						break // one max
					}
				}

				// their Y, our X
				for potential_link in &their_neighbors.validator_indices_y {
					if our_neighbors.validator_indices_x.contains(potential_link) {
						sub_view.receiving.insert(*potential_link);
						break // one max
					}
				}
			}
		}

		view.group_views.insert(GroupIndex(i as _), sub_view);
	}

	view
}

/// The kind of backed candidate manifest we should send to a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
	/// Full manifests contain information about the candidate and should be sent
	/// to peers which aren't guaranteed to have the candidate already.
	Full,
	/// Acknowledgement manifests omit information which is implicit in the candidate
	/// itself, and should be sent to peers which are guaranteed to have the candidate
	/// already.
	Acknowledgement,
}

/// A summary of a manifest being sent by a counterparty.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSummary {
	/// The claimed parent head data hash of the candidate.
	pub claimed_parent_hash: Hash,
	/// The claimed group index assigned to the candidate.
	pub claimed_group_index: GroupIndex,
	/// A statement filter sent alongside the candidate, communicating
	/// knowledge.
	pub statement_knowledge: StatementFilter,
}

/// Errors in importing a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestImportError {
	/// The manifest conflicts with another, previously sent manifest.
	Conflicting,
	/// The manifest has overflowed beyond the limits of what the
	/// counterparty was allowed to send us.
	Overflow,
	/// The manifest claims insufficient attestations to achieve the backing
	/// threshold.
	Insufficient,
	/// The manifest is malformed.
	Malformed,
	/// The manifest was not allowed to be sent.
	Disallowed,
}

/// A tracker of knowledge from authorities within the grid for a particular
/// relay-parent.
#[derive(Debug, Default)]
pub struct GridTracker {
	received: HashMap<ValidatorIndex, ReceivedManifests>,
	confirmed_backed: HashMap<CandidateHash, KnownBackedCandidate>,
	unconfirmed: HashMap<CandidateHash, Vec<(ValidatorIndex, GroupIndex)>>,
	pending_manifests: HashMap<ValidatorIndex, HashMap<CandidateHash, ManifestKind>>,

	// maps target to (originator, statement) pairs.
	pending_statements: HashMap<ValidatorIndex, HashSet<(ValidatorIndex, CompactStatement)>>,
}

impl GridTracker {
	/// Attempt to import a manifest advertised by a remote peer.
	///
	/// This checks whether the peer is allowed to send us manifests
	/// about this group at this relay-parent. This also does sanity
	/// checks on the format of the manifest and the amount of votes
	/// it contains. It has effects on the stored state only when successful.
	///
	/// This returns a `bool` on success, which if true indicates that an acknowledgement is
	/// to be sent in response to the received manifest. This only occurs when the
	/// candidate is already known to be confirmed and backed.
	pub fn import_manifest(
		&mut self,
		session_topology: &SessionTopologyView,
		groups: &Groups,
		candidate_hash: CandidateHash,
		seconding_limit: usize,
		manifest: ManifestSummary,
		kind: ManifestKind,
		sender: ValidatorIndex,
	) -> Result<bool, ManifestImportError> {
		let claimed_group_index = manifest.claimed_group_index;

		let group_topology = match session_topology.group_views.get(&claimed_group_index) {
			None => return Err(ManifestImportError::Disallowed),
			Some(g) => g,
		};

		let receiving_from = group_topology.receiving.contains(&sender);
		let sending_to = group_topology.sending.contains(&sender);
		let manifest_allowed = match kind {
			// Peers can send manifests _if_:
			//   * They are in the receiving set for the group AND the manifest is full OR
			//   * They are in the sending set for the group AND we have sent them a manifest AND
			//     the received manifest is partial.
			ManifestKind::Full => receiving_from,
			ManifestKind::Acknowledgement =>
				sending_to &&
					self.confirmed_backed
						.get(&candidate_hash)
						.map_or(false, |c| c.has_sent_manifest_to(sender)),
		};

		if !manifest_allowed {
			return Err(ManifestImportError::Disallowed)
		}

		let (group_size, backing_threshold) =
			match groups.get_size_and_backing_threshold(claimed_group_index) {
				Some(x) => x,
				None => return Err(ManifestImportError::Malformed),
			};

		let remote_knowledge = manifest.statement_knowledge.clone();

		if !remote_knowledge.has_len(group_size) {
			return Err(ManifestImportError::Malformed)
		}

		if !remote_knowledge.has_seconded() {
			return Err(ManifestImportError::Malformed)
		}

		// ensure votes are sufficient to back.
		let votes = remote_knowledge.backing_validators();

		if votes < backing_threshold {
			return Err(ManifestImportError::Insufficient)
		}

		self.received.entry(sender).or_default().import_received(
			group_size,
			seconding_limit,
			candidate_hash,
			manifest,
		)?;

		let mut ack = false;
		if let Some(confirmed) = self.confirmed_backed.get_mut(&candidate_hash) {
			if receiving_from && !confirmed.has_sent_manifest_to(sender) {
				// due to checks above, the manifest `kind` is guaranteed to be `Full`
				self.pending_manifests
					.entry(sender)
					.or_default()
					.insert(candidate_hash, ManifestKind::Acknowledgement);

				ack = true;
			}

			// add all statements in local_knowledge & !remote_knowledge
			// to `pending_statements` for this validator.
			confirmed.manifest_received_from(sender, remote_knowledge);
			if let Some(pending_statements) = confirmed.pending_statements(sender) {
				self.pending_statements.entry(sender).or_default().extend(
					decompose_statement_filter(
						groups,
						claimed_group_index,
						candidate_hash,
						&pending_statements,
					),
				);
			}
		} else {
			// conflicting manifests were rejected above, so the group is stable per sender.
			let unconfirmed = self.unconfirmed.entry(candidate_hash).or_default();
			if !unconfirmed.contains(&(sender, claimed_group_index)) {
				unconfirmed.push((sender, claimed_group_index));
			}
		}

		Ok(ack)
	}

	/// Add a new backed candidate to the tracker. This yields
	/// a list of validators which we should either advertise to
	/// or signal that we know the candidate, along with the corresponding
	/// type of manifest we should send.
	pub fn add_backed_candidate(
		&mut self,
		session_topology: &SessionTopologyView,
		candidate_hash: CandidateHash,
		group_index: GroupIndex,
		local_knowledge: StatementFilter,
	) -> Vec<(ValidatorIndex, ManifestKind)> {
		let c = match self.confirmed_backed.entry(candidate_hash) {
			Entry::Occupied(_) => return Vec::new(),
			Entry::Vacant(v) => v.insert(KnownBackedCandidate {
				group_index,
				mutual_knowledge: HashMap::new(),
				local_knowledge,
			}),
		};

		// Populate the entry with previously unconfirmed manifests.
		for (v, claimed_group_index) in
			self.unconfirmed.remove(&candidate_hash).into_iter().flatten()
		{
			if claimed_group_index != group_index {
				// This is misbehavior, but is handled more comprehensively elsewhere
				continue
			}

			let statement_filter = self
				.received
				.get(&v)
				.and_then(|r| r.candidate_statement_filter(&candidate_hash));

			if let Some(statement_filter) = statement_filter {
				c.manifest_received_from(v, statement_filter);
			}
		}

		// It is possible that we are a validator in the group ourselves.
		let group_topology = match session_topology.group_views.get(&group_index) {
			None => return Vec::new(),
			Some(g) => g,
		};

		// advertise onwards and accept received advertisements

		let sending_group_manifests =
			group_topology.sending.iter().map(|v| (*v, ManifestKind::Full));

		let receiving_group_manifests = group_topology.receiving.iter().filter_map(|v| {
			if c.has_received_manifest_from(*v) {
				Some((*v, ManifestKind::Acknowledgement))
			} else {
				None
			}
		});

		// Note that order is important: if a validator is part of both the sending
		// and receiving groups, we may overwrite a `Full` manifest with an
		// `Acknowledgement` one.
		for (v, manifest_mode) in sending_group_manifests.chain(receiving_group_manifests) {
			self.pending_manifests
				.entry(v)
				.or_default()
				.insert(candidate_hash, manifest_mode);
		}

		self.pending_manifests
			.iter()
			.filter_map(|(v, x)| x.get(&candidate_hash).map(|k| (*v, *k)))
			.collect()
	}

	/// Note that a backed candidate has been advertised to a
	/// given validator.
	pub fn manifest_sent_to(
		&mut self,
		groups: &Groups,
		validator_index: ValidatorIndex,
		candidate_hash: CandidateHash,
		local_knowledge: StatementFilter,
	) {
		if let Some(c) = self.confirmed_backed.get_mut(&candidate_hash) {
			c.manifest_sent_to(validator_index, local_knowledge);

			if let Some(pending_statements) = c.pending_statements(validator_index) {
				self.pending_statements.entry(validator_index).or_default().extend(
					decompose_statement_filter(
						groups,
						c.group_index,
						candidate_hash,
						&pending_statements,
					),
				);
			}
		}

		if let Some(x) = self.pending_manifests.get_mut(&validator_index) {
			x.remove(&candidate_hash);
		}
	}

	/// Returns a vector of all candidates pending manifests for the specific validator, and
	/// the type of manifest we should send.
	pub fn pending_manifests_for(
		&self,
		validator_index: ValidatorIndex,
	) -> Vec<(CandidateHash, ManifestKind)> {
		self.pending_manifests
			.get(&validator_index)
			.into_iter()
			.flat_map(|pending| pending.iter().map(|(c, m)| (*c, *m)))
			.collect()
	}

	/// Returns a statement filter indicating statements that a given peer
	/// is awaiting concerning the given candidate, constrained by the statements
	/// we have ourselves.
	pub fn pending_statements_for(
		&self,
		validator_index: ValidatorIndex,
		candidate_hash: CandidateHash,
	) -> Option<StatementFilter> {
		self.confirmed_backed
			.get(&candidate_hash)
			.and_then(|x| x.pending_statements(validator_index))
	}

	/// Returns a vector of all pending statements to the validator, sorted with
	/// `Seconded` statements at the front.
	///
	/// Statements are in the form `(Originator, Statement Kind)`.
	pub fn all_pending_statements_for(
		&self,
		validator_index: ValidatorIndex,
	) -> Vec<(ValidatorIndex, CompactStatement)> {
		let mut v = self
			.pending_statements
			.get(&validator_index)
			.map(|x| x.iter().cloned().collect())
			.unwrap_or(Vec::new());

		v.sort_by_key(|(_, s)| match s {
			CompactStatement::Seconded(_) => 0u32,
			CompactStatement::Valid(_) => 1u32,
		});

		v
	}

	/// Whether a validator can request a manifest from us.
	pub fn can_request(&self, validator: ValidatorIndex, candidate_hash: CandidateHash) -> bool {
		self.confirmed_backed.get(&candidate_hash).map_or(false, |c| {
			c.has_sent_manifest_to(validator) && !c.has_received_manifest_from(validator)
		})
	}

	/// Determine the validators which can send a statement to us by direct broadcast.
	///
	/// The flag alongside each validator indicates whether they already sent it.
	pub fn direct_statement_providers(
		&self,
		groups: &Groups,
		originator: ValidatorIndex,
		statement: &CompactStatement,
	) -> Vec<(ValidatorIndex, bool)> {
		let (g, c_h, kind, in_group) =
			match extract_statement_and_group_info(groups, originator, statement) {
				None => return Vec::new(),
				Some(x) => x,
			};

		self.confirmed_backed
			.get(&c_h)
			.map(|k| k.direct_statement_providers(g, in_group, kind))
			.unwrap_or_default()
	}

	/// Determine the validators which can receive a statement from us by direct
	/// broadcast.
	pub fn direct_statement_targets(
		&self,
		groups: &Groups,
		originator: ValidatorIndex,
		statement: &CompactStatement,
	) -> Vec<ValidatorIndex> {
		let (g, c_h, kind, in_group) =
			match extract_statement_and_group_info(groups, originator, statement) {
				None => return Vec::new(),
				Some(x) => x,
			};

		self.confirmed_backed
			.get(&c_h)
			.map(|k| k.direct_statement_targets(g, in_group, kind))
			.unwrap_or_default()
	}

	/// Note that we have learned about a statement. This will update
	/// `pending_statements_for` for any relevant validators if actually
	/// fresh.
	pub fn learned_fresh_statement(
		&mut self,
		groups: &Groups,
		session_topology: &SessionTopologyView,
		originator: ValidatorIndex,
		statement: &CompactStatement,
	) {
		let (g, c_h, kind, in_group) =
			match extract_statement_and_group_info(groups, originator, statement) {
				None => return,
				Some(x) => x,
			};

		let known = match self.confirmed_backed.get_mut(&c_h) {
			None => return,
			Some(x) => x,
		};

		if !known.note_fresh_statement(in_group, kind) {
			return
		}

		// Add to `pending_statements` for all validators we communicate with
		// who have exchanged manifests.
		let all_group_validators = session_topology
			.group_views
			.get(&g)
			.into_iter()
			.flat_map(|g| g.sending.iter().chain(g.receiving.iter()));

		for v in all_group_validators {
			if known.is_pending_statement(*v, in_group, kind) {
				self.pending_statements
					.entry(*v)
					.or_default()
					.insert((originator, *statement));
			}
		}
	}

	/// Note that a direct statement about a given candidate was sent to or
	/// received from the given validator.
	pub fn sent_or_received_direct_statement(
		&mut self,
		groups: &Groups,
		originator: ValidatorIndex,
		counterparty: ValidatorIndex,
		statement: &CompactStatement,
		received: bool,
	) {
		if let Some((_, c_h, kind, in_group)) =
			extract_statement_and_group_info(groups, originator, statement)
		{
			if let Some(known) = self.confirmed_backed.get_mut(&c_h) {
				known.sent_or_received_direct_statement(counterparty, in_group, kind, received);

				if let Some(pending) = self.pending_statements.get_mut(&counterparty) {
					pending.remove(&(originator, *statement));
				}
			}
		}
	}

	/// Get the advertised statement filter of a validator for a candidate.
	pub fn advertised_statements(
		&self,
		validator: ValidatorIndex,
		candidate_hash: &CandidateHash,
	) -> Option<StatementFilter> {
		self.received.get(&validator)?.candidate_statement_filter(candidate_hash)
	}

	/// The group a confirmed backed candidate belongs to.
	pub fn backed_group(&self, candidate_hash: &CandidateHash) -> Option<GroupIndex> {
		self.confirmed_backed.get(candidate_hash).map(|c| c.group_index)
	}

	/// Whether the candidate has been confirmed as backed.
	pub fn is_confirmed_backed(&self, candidate_hash: &CandidateHash) -> bool {
		self.confirmed_backed.contains_key(candidate_hash)
	}
}

fn extract_statement_and_group_info(
	groups: &Groups,
	originator: ValidatorIndex,
	statement: &CompactStatement,
) -> Option<(GroupIndex, CandidateHash, StatementKind, usize)> {
	let (statement_kind, candidate_hash) = match statement {
		CompactStatement::Seconded(h) => (StatementKind::Seconded, h),
		CompactStatement::Valid(h) => (StatementKind::Valid, h),
	};

	let group = groups.by_validator_index(originator)?;
	let index_in_group = groups.get(group)?.iter().position(|v| v == &originator)?;

	Some((group, *candidate_hash, statement_kind, index_in_group))
}

fn decompose_statement_filter(
	groups: &Groups,
	group_index: GroupIndex,
	candidate_hash: CandidateHash,
	statement_filter: &StatementFilter,
) -> Vec<(ValidatorIndex, CompactStatement)> {
	let group = match groups.get(group_index) {
		None => return Vec::new(),
		Some(g) => g,
	};

	let seconded = statement_filter
		.seconded_in_group
		.iter_ones()
		.filter_map(|i| group.get(i).copied())
		.map(|v| (v, CompactStatement::Seconded(candidate_hash)));

	let valid = statement_filter
		.validated_in_group
		.iter_ones()
		.filter_map(|i| group.get(i).copied())
		.map(|v| (v, CompactStatement::Valid(candidate_hash)));

	seconded.chain(valid).collect()
}

// `a & !b`, over the shorter of the two.
fn and_not(a: &BitSlice<u8, Lsb0>, b: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
	a.iter().by_vals().zip(b.iter().by_vals()).map(|(a, b)| a && !b).collect()
}

fn is_superset(a: &BitSlice<u8, Lsb0>, b: &BitSlice<u8, Lsb0>) -> bool {
	a.len() == b.len() && a.iter().by_vals().zip(b.iter().by_vals()).all(|(a, b)| a || !b)
}

/// A summary of the manifests received from a single validator.
#[derive(Debug, Default)]
struct ReceivedManifests {
	received: HashMap<CandidateHash, ManifestSummary>,
	// group -> seconded counts.
	seconded_counts: HashMap<GroupIndex, Vec<usize>>,
}

impl ReceivedManifests {
	fn candidate_statement_filter(
		&self,
		candidate_hash: &CandidateHash,
	) -> Option<StatementFilter> {
		self.received.get(candidate_hash).map(|m| m.statement_knowledge.clone())
	}

	/// Attempt to import a received manifest from a counterparty.
	///
	/// This will reject manifests which are either duplicate, conflicting,
	/// or imply an irrational amount of `Seconded` statements.
	///
	/// This assumes that the manifest has already been checked for
	/// validity - i.e. that the bitvecs match the claimed group in size
	/// and that the manifest includes at least one `Seconded`
	/// attestation and includes enough attestations for the candidate
	/// to be backed.
	///
	/// This also should only be invoked when we are intended to track
	/// the knowledge of this peer as determined by the [`SessionTopologyView`].
	fn import_received(
		&mut self,
		group_size: usize,
		seconding_limit: usize,
		candidate_hash: CandidateHash,
		manifest_summary: ManifestSummary,
	) -> Result<(), ManifestImportError> {
		match self.received.entry(candidate_hash) {
			Entry::Occupied(mut e) => {
				let prev = e.get_mut();

				// occupied entry.

				// filter out clearly conflicting data.
				{
					if prev.claimed_group_index != manifest_summary.claimed_group_index {
						return Err(ManifestImportError::Conflicting)
					}

					if prev.claimed_parent_hash != manifest_summary.claimed_parent_hash {
						return Err(ManifestImportError::Conflicting)
					}

					if !is_superset(
						&manifest_summary.statement_knowledge.seconded_in_group,
						&prev.statement_knowledge.seconded_in_group,
					) {
						return Err(ManifestImportError::Conflicting)
					}

					if !is_superset(
						&manifest_summary.statement_knowledge.validated_in_group,
						&prev.statement_knowledge.validated_in_group,
					) {
						return Err(ManifestImportError::Conflicting)
					}
				}

				// All the checks passed. Now only the newly seconded bits count.
				let fresh_seconded = and_not(
					&manifest_summary.statement_knowledge.seconded_in_group,
					&prev.statement_knowledge.seconded_in_group,
				);

				let within_limits = updating_ensure_within_seconding_limit(
					&mut self.seconded_counts,
					manifest_summary.claimed_group_index,
					group_size,
					seconding_limit,
					&fresh_seconded,
				);

				if within_limits {
					*prev = manifest_summary;
					Ok(())
				} else {
					Err(ManifestImportError::Overflow)
				}
			},
			Entry::Vacant(e) => {
				let within_limits = updating_ensure_within_seconding_limit(
					&mut self.seconded_counts,
					manifest_summary.claimed_group_index,
					group_size,
					seconding_limit,
					&manifest_summary.statement_knowledge.seconded_in_group,
				);

				if within_limits {
					e.insert(manifest_summary);
					Ok(())
				} else {
					Err(ManifestImportError::Overflow)
				}
			},
		}
	}
}

// updates validator-seconded records but only if the new statements
// are OK. returns `true` if alright and `false` otherwise.
fn updating_ensure_within_seconding_limit(
	seconded_counts: &mut HashMap<GroupIndex, Vec<usize>>,
	group_index: GroupIndex,
	group_size: usize,
	seconding_limit: usize,
	new_seconded: &BitSlice<u8, Lsb0>,
) -> bool {
	if seconding_limit == 0 {
		return false
	}

	// due to the check above, if this was non-existent this function will
	// always return `true`.
	let counts = seconded_counts.entry(group_index).or_insert_with(|| vec![0; group_size]);

	for i in new_seconded.iter_ones() {
		if counts.get(i).map_or(false, |c| *c >= seconding_limit) {
			return false
		}
	}

	for i in new_seconded.iter_ones() {
		if let Some(c) = counts.get_mut(i) {
			*c += 1;
		}
	}

	true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
	Seconded,
	Valid,
}

trait FilterQuery {
	fn contains(&self, index: usize, statement_kind: StatementKind) -> bool;
	fn set(&mut self, index: usize, statement_kind: StatementKind);
}

impl FilterQuery for StatementFilter {
	fn contains(&self, index: usize, statement_kind: StatementKind) -> bool {
		match statement_kind {
			StatementKind::Seconded => self.seconded_in_group.get(index).map_or(false, |x| *x),
			StatementKind::Valid => self.validated_in_group.get(index).map_or(false, |x| *x),
		}
	}

	fn set(&mut self, index: usize, statement_kind: StatementKind) {
		let b = match statement_kind {
			StatementKind::Seconded => self.seconded_in_group.get_mut(index),
			StatementKind::Valid => self.validated_in_group.get_mut(index),
		};

		if let Some(mut b) = b {
			*b = true;
		}
	}
}

/// Knowledge that we have about a remote peer concerning a candidate, and that they have about us
/// concerning the candidate.
#[derive(Debug, Clone)]
struct MutualKnowledge {
	/// Knowledge the remote peer has about the candidate, as far as we're aware.
	/// `Some` only if they have advertised, acknowledged, or requested the candidate.
	remote_knowledge: Option<StatementFilter>,
	/// Knowledge we have indicated to the remote peer about the candidate.
	/// `Some` only if we have advertised, acknowledged, or requested the candidate
	/// from them.
	local_knowledge: Option<StatementFilter>,
	/// Knowledge peer circulated to us, this is different from `local_knowledge` and
	/// `remote_knowledge`, through the fact that includes only statements that we received from
	/// peer while the other two, after manifest exchange, track statements that either we sent or
	/// received from peer.
	received_knowledge: Option<StatementFilter>,
}

// A utility struct for keeping track of metadata about candidates
// we have confirmed as having been backed.
#[derive(Debug, Clone)]
struct KnownBackedCandidate {
	group_index: GroupIndex,
	local_knowledge: StatementFilter,
	mutual_knowledge: HashMap<ValidatorIndex, MutualKnowledge>,
}

impl KnownBackedCandidate {
	fn has_received_manifest_from(&self, validator: ValidatorIndex) -> bool {
		self.mutual_knowledge
			.get(&validator)
			.map_or(false, |k| k.remote_knowledge.is_some())
	}

	fn has_sent_manifest_to(&self, validator: ValidatorIndex) -> bool {
		self.mutual_knowledge
			.get(&validator)
			.map_or(false, |k| k.local_knowledge.is_some())
	}

	fn manifest_sent_to(&mut self, validator: ValidatorIndex, local_knowledge: StatementFilter) {
		let k = self.mutual_knowledge.entry(validator).or_insert_with(|| MutualKnowledge {
			remote_knowledge: None,
			local_knowledge: None,
			received_knowledge: None,
		});

		k.received_knowledge = Some(StatementFilter::blank(local_knowledge.seconded_in_group.len()));
		k.local_knowledge = Some(local_knowledge);
	}

	fn manifest_received_from(&mut self, validator: ValidatorIndex, remote_knowledge: StatementFilter) {
		let k = self.mutual_knowledge.entry(validator).or_insert_with(|| MutualKnowledge {
			remote_knowledge: None,
			local_knowledge: None,
			received_knowledge: None,
		});

		k.remote_knowledge = Some(remote_knowledge);
	}

	fn direct_statement_providers(
		&self,
		group_index: GroupIndex,
		originator_index_in_group: usize,
		statement_kind: StatementKind,
	) -> Vec<(ValidatorIndex, bool)> {
		if group_index != self.group_index {
			return Vec::new()
		}

		self.mutual_knowledge
			.iter()
			.filter(|(_, k)| k.remote_knowledge.is_some() && k.local_knowledge.is_some())
			.map(|(v, k)| {
				let already_received = k
					.received_knowledge
					.as_ref()
					.map_or(false, |r| r.contains(originator_index_in_group, statement_kind));

				(*v, already_received)
			})
			.collect()
	}

	fn direct_statement_targets(
		&self,
		group_index: GroupIndex,
		originator_index_in_group: usize,
		statement_kind: StatementKind,
	) -> Vec<ValidatorIndex> {
		if group_index != self.group_index {
			return Vec::new()
		}

		self.mutual_knowledge
			.iter()
			.filter(|(_, k)| k.local_knowledge.is_some())
			.filter(|(_, k)| {
				k.remote_knowledge
					.as_ref()
					.map_or(false, |r| !r.contains(originator_index_in_group, statement_kind))
			})
			.map(|(v, _)| *v)
			.collect()
	}

	fn note_fresh_statement(
		&mut self,
		statement_index_in_group: usize,
		statement_kind: StatementKind,
	) -> bool {
		let really_fresh = !self.local_knowledge.contains(statement_index_in_group, statement_kind);
		self.local_knowledge.set(statement_index_in_group, statement_kind);

		really_fresh
	}

	fn sent_or_received_direct_statement(
		&mut self,
		validator: ValidatorIndex,
		statement_index_in_group: usize,
		statement_kind: StatementKind,
		received: bool,
	) {
		if let Some(k) = self.mutual_knowledge.get_mut(&validator) {
			if let (Some(r), Some(l)) = (k.remote_knowledge.as_mut(), k.local_knowledge.as_mut()) {
				r.set(statement_index_in_group, statement_kind);
				l.set(statement_index_in_group, statement_kind);
			}

			if received {
				if let Some(rk) = k.received_knowledge.as_mut() {
					rk.set(statement_index_in_group, statement_kind);
				}
			}
		}
	}

	fn is_pending_statement(
		&self,
		validator: ValidatorIndex,
		statement_index_in_group: usize,
		statement_kind: StatementKind,
	) -> bool {
		// existence of both remote & local knowledge indicate we have exchanged
		// manifests.
		// then, everything that is not in the remote knowledge is pending
		self.mutual_knowledge
			.get(&validator)
			.filter(|k| k.local_knowledge.is_some())
			.and_then(|k| k.remote_knowledge.as_ref())
			.map_or(false, |k| !k.contains(statement_index_in_group, statement_kind))
	}

	fn pending_statements(&self, validator: ValidatorIndex) -> Option<StatementFilter> {
		// existence of both remote & local knowledge indicate we have exchanged
		// manifests.
		// then, everything that is not in the remote knowledge is pending, and we
		// further limit this by what is in the local knowledge itself. we use the
		// full local knowledge, as the local knowledge stored here may be outdated.
		let full_local = &self.local_knowledge;

		self.mutual_knowledge
			.get(&validator)
			.filter(|k| k.local_knowledge.is_some())
			.and_then(|k| k.remote_knowledge.as_ref())
			.map(|remote| StatementFilter {
				seconded_in_group: and_not(
					&full_local.seconded_in_group,
					&remote.seconded_in_group,
				),
				validated_in_group: and_not(
					&full_local.validated_in_group,
					&remote.validated_in_group,
				),
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use polkadot_node_network_protocol::grid_topology::TopologyPeerInfo;
	use assert_matches::assert_matches;

	fn filter(seconded: &[bool], valid: &[bool]) -> StatementFilter {
		StatementFilter {
			seconded_in_group: seconded.iter().copied().collect(),
			validated_in_group: valid.iter().copied().collect(),
		}
	}

	fn candidate(n: u8) -> CandidateHash {
		CandidateHash(Hash::repeat_byte(n))
	}

	fn validators(indices: &[u32]) -> HashSet<ValidatorIndex> {
		indices.iter().map(|i| ValidatorIndex(*i)).collect()
	}

	// 0 1 2
	// 3 4 5
	// 6 7 8
	fn square_topology() -> SessionGridTopology {
		let canonical = (0..9)
			.map(|i| TopologyPeerInfo { peer_ids: Vec::new(), validator_index: ValidatorIndex(i) })
			.collect();

		SessionGridTopology::new((0..9).collect(), canonical)
	}

	fn summary(group: u32, statement_knowledge: StatementFilter) -> ManifestSummary {
		ManifestSummary {
			claimed_parent_hash: Hash::repeat_byte(0xaa),
			claimed_group_index: GroupIndex(group),
			statement_knowledge,
		}
	}

	// group 0 has three members and a backing threshold of two. we receive manifests
	// for it from validator 1 and send them to validator 2.
	fn simple_setup() -> (SessionTopologyView, Groups) {
		let groups = Groups::new(
			vec![vec![ValidatorIndex(5), ValidatorIndex(6), ValidatorIndex(7)]],
			2,
		);

		let mut view = SessionTopologyView::default();
		view.group_views.insert(
			GroupIndex(0),
			GroupSubView { sending: validators(&[2]), receiving: validators(&[1]) },
		);

		(view, groups)
	}

	#[test]
	fn topology_view_routes_through_shared_slices() {
		let groups = vec![
			vec![ValidatorIndex(0), ValidatorIndex(4)],
			vec![ValidatorIndex(1), ValidatorIndex(5)],
			vec![ValidatorIndex(8)],
		];

		let view = build_session_topology(groups.iter(), &square_topology(), Some(ValidatorIndex(0)));

		// our own group: send to all neighbors, receive from nobody.
		let own = view.group_view(GroupIndex(0)).expect("group exists");
		assert_eq!(own.sending(), &validators(&[1, 2, 3, 6]));
		assert!(own.receiving().is_empty());

		// 1 shares our row: receive from them and pass along our column.
		// 5 shares nothing: receive from 3 (their row, our column) and 2 (their
		// column, our row).
		let shared = view.group_view(GroupIndex(1)).expect("group exists");
		assert_eq!(shared.sending(), &validators(&[3, 6]));
		assert_eq!(shared.receiving(), &validators(&[1, 2, 3]));

		let remote = view.group_view(GroupIndex(2)).expect("group exists");
		assert!(remote.sending().is_empty());
		assert_eq!(remote.receiving(), &validators(&[2, 6]));

		assert!(view.is_grid_peer(ValidatorIndex(6)));
		assert!(!view.is_grid_peer(ValidatorIndex(7)));
	}

	#[test]
	fn topology_view_empty_without_local_index() {
		let groups = vec![vec![ValidatorIndex(0)]];

		assert_eq!(
			build_session_topology(groups.iter(), &square_topology(), None),
			SessionTopologyView::default(),
		);
		assert_eq!(
			build_session_topology(groups.iter(), &square_topology(), Some(ValidatorIndex(42))),
			SessionTopologyView::default(),
		);
	}

	#[test]
	fn manifest_direction_is_enforced() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();
		let knowledge = filter(&[true, true, false], &[false, false, false]);

		// validator 2 is one we send to, not receive from.
		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, knowledge.clone()),
				ManifestKind::Full,
				ValidatorIndex(2),
			),
			Err(ManifestImportError::Disallowed),
		);

		// acknowledgements need a manifest from us first.
		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, knowledge.clone()),
				ManifestKind::Acknowledgement,
				ValidatorIndex(2),
			),
			Err(ManifestImportError::Disallowed),
		);

		// no such group in the view.
		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(1, knowledge),
				ManifestKind::Full,
				ValidatorIndex(1),
			),
			Err(ManifestImportError::Disallowed),
		);
	}

	#[test]
	fn wrong_filter_length_is_malformed_and_ignored() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, filter(&[true, true], &[false, false])),
				ManifestKind::Full,
				ValidatorIndex(1),
			),
			Err(ManifestImportError::Malformed),
		);

		assert!(tracker.received.is_empty());
		assert!(tracker.unconfirmed.is_empty());
		assert!(tracker.advertised_statements(ValidatorIndex(1), &candidate(1)).is_none());
	}

	#[test]
	fn manifest_needs_seconded_and_threshold() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, filter(&[false, false, false], &[true, true, true])),
				ManifestKind::Full,
				ValidatorIndex(1),
			),
			Err(ManifestImportError::Malformed),
		);

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, filter(&[true, false, false], &[false, false, false])),
				ManifestKind::Full,
				ValidatorIndex(1),
			),
			Err(ManifestImportError::Insufficient),
		);

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, filter(&[true, false, false], &[false, true, false])),
				ManifestKind::Full,
				ValidatorIndex(1),
			),
			Ok(false),
		);
	}

	#[test]
	fn conflicting_manifests_are_rejected() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();

		let import = |tracker: &mut GridTracker, manifest| {
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				manifest,
				ManifestKind::Full,
				ValidatorIndex(1),
			)
		};

		assert_eq!(import(&mut tracker, summary(0, filter(&[true, true, false], &[false, false, true]))), Ok(false));

		// forgetting a statement.
		assert_eq!(
			import(&mut tracker, summary(0, filter(&[true, true, false], &[false, false, false]))),
			Err(ManifestImportError::Conflicting),
		);

		// different parent.
		let mut other_parent = summary(0, filter(&[true, true, false], &[false, false, true]));
		other_parent.claimed_parent_hash = Hash::repeat_byte(0xbb);
		assert_eq!(import(&mut tracker, other_parent), Err(ManifestImportError::Conflicting));

		// learning more is fine.
		assert_eq!(import(&mut tracker, summary(0, filter(&[true, true, true], &[false, false, true]))), Ok(false));
		assert_eq!(
			tracker.advertised_statements(ValidatorIndex(1), &candidate(1)),
			Some(filter(&[true, true, true], &[false, false, true])),
		);
	}

	#[test]
	fn seconding_limit_overflow() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();

		let knowledge = filter(&[true, true, false], &[false, false, false]);
		let mut import = |c: u8, limit: usize| {
			tracker.import_manifest(
				&view,
				&groups,
				candidate(c),
				limit,
				summary(0, knowledge.clone()),
				ManifestKind::Full,
				ValidatorIndex(1),
			)
		};

		assert_eq!(import(1, 0), Err(ManifestImportError::Overflow));
		assert_eq!(import(1, 1), Ok(false));
		assert_eq!(import(2, 1), Err(ManifestImportError::Overflow));
	}

	#[test]
	fn acknowledgement_clears_sent_manifest() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();
		let local_knowledge = filter(&[true, true, false], &[false, false, false]);

		let to_send = tracker.add_backed_candidate(&view, candidate(1), GroupIndex(0), local_knowledge.clone());
		assert_eq!(to_send, vec![(ValidatorIndex(2), ManifestKind::Full)]);
		assert_eq!(tracker.pending_manifests_for(ValidatorIndex(2)), vec![(candidate(1), ManifestKind::Full)]);

		tracker.manifest_sent_to(&groups, ValidatorIndex(2), candidate(1), local_knowledge.clone());
		assert!(tracker.pending_manifests_for(ValidatorIndex(2)).is_empty());
		assert!(tracker.can_request(ValidatorIndex(2), candidate(1)));

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, local_knowledge.clone()),
				ManifestKind::Acknowledgement,
				ValidatorIndex(2),
			),
			Ok(false),
		);

		assert!(tracker.pending_manifests_for(ValidatorIndex(2)).is_empty());
		assert!(!tracker.can_request(ValidatorIndex(2), candidate(1)));

		// backing the same candidate again has no effect.
		assert!(tracker.add_backed_candidate(&view, candidate(1), GroupIndex(0), local_knowledge).is_empty());
		assert!(tracker.pending_manifests_for(ValidatorIndex(2)).is_empty());
	}

	#[test]
	fn unconfirmed_manifest_is_acknowledged_on_backing() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();
		let remote_knowledge = filter(&[true, true, false], &[false, false, false]);

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, remote_knowledge.clone()),
				ManifestKind::Full,
				ValidatorIndex(1),
			),
			Ok(false),
		);

		let mut to_send = tracker.add_backed_candidate(
			&view,
			candidate(1),
			GroupIndex(0),
			remote_knowledge,
		);
		to_send.sort_by_key(|(v, _)| *v);

		assert_eq!(
			to_send,
			vec![
				(ValidatorIndex(1), ManifestKind::Acknowledgement),
				(ValidatorIndex(2), ManifestKind::Full),
			],
		);
	}

	#[test]
	fn manifest_after_backing_requests_ack() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();
		let knowledge = filter(&[true, true, false], &[false, false, false]);

		tracker.add_backed_candidate(&view, candidate(1), GroupIndex(0), knowledge.clone());

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, knowledge),
				ManifestKind::Full,
				ValidatorIndex(1),
			),
			Ok(true),
		);

		assert_eq!(
			tracker.pending_manifests_for(ValidatorIndex(1)),
			vec![(candidate(1), ManifestKind::Acknowledgement)],
		);
	}

	#[test]
	fn statements_flow_after_manifest_exchange() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();
		let local_knowledge = filter(&[true, true, false], &[false, false, true]);
		let remote_knowledge = filter(&[true, true, false], &[false, false, false]);

		tracker.add_backed_candidate(&view, candidate(1), GroupIndex(0), local_knowledge.clone());
		tracker.manifest_sent_to(&groups, ValidatorIndex(2), candidate(1), local_knowledge);

		// nothing pending until they tell us what they know.
		assert!(tracker.all_pending_statements_for(ValidatorIndex(2)).is_empty());

		assert_eq!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, remote_knowledge),
				ManifestKind::Acknowledgement,
				ValidatorIndex(2),
			),
			Ok(false),
		);

		let valid_7 = CompactStatement::Valid(candidate(1));
		assert_eq!(
			tracker.all_pending_statements_for(ValidatorIndex(2)),
			vec![(ValidatorIndex(7), valid_7)],
		);
		assert_eq!(
			tracker.pending_statements_for(ValidatorIndex(2), candidate(1)),
			Some(filter(&[false, false, false], &[false, false, true])),
		);
		assert_eq!(
			tracker.direct_statement_targets(&groups, ValidatorIndex(7), &valid_7),
			vec![ValidatorIndex(2)],
		);

		// a new statement from validator 5 becomes pending for them too.
		let valid_5 = CompactStatement::Valid(candidate(1));
		tracker.learned_fresh_statement(&groups, &view, ValidatorIndex(5), &valid_5);
		assert_eq!(tracker.all_pending_statements_for(ValidatorIndex(2)).len(), 2);

		// learning it twice isn't fresh.
		tracker.sent_or_received_direct_statement(&groups, ValidatorIndex(5), ValidatorIndex(2), &valid_5, false);
		tracker.learned_fresh_statement(&groups, &view, ValidatorIndex(5), &valid_5);
		assert_eq!(
			tracker.all_pending_statements_for(ValidatorIndex(2)),
			vec![(ValidatorIndex(7), valid_7)],
		);

		tracker.sent_or_received_direct_statement(&groups, ValidatorIndex(7), ValidatorIndex(2), &valid_7, false);
		assert!(tracker.all_pending_statements_for(ValidatorIndex(2)).is_empty());
		assert!(tracker.direct_statement_targets(&groups, ValidatorIndex(7), &valid_7).is_empty());
	}

	#[test]
	fn direct_providers_flag_duplicates() {
		let (view, groups) = simple_setup();
		let mut tracker = GridTracker::default();
		let knowledge = filter(&[true, true, false], &[false, false, false]);
		let valid_7 = CompactStatement::Valid(candidate(1));

		tracker.add_backed_candidate(&view, candidate(1), GroupIndex(0), knowledge.clone());

		// no exchange yet.
		assert!(tracker.direct_statement_providers(&groups, ValidatorIndex(7), &valid_7).is_empty());

		tracker.manifest_sent_to(&groups, ValidatorIndex(2), candidate(1), knowledge.clone());
		assert_matches!(
			tracker.import_manifest(
				&view,
				&groups,
				candidate(1),
				3,
				summary(0, knowledge),
				ManifestKind::Acknowledgement,
				ValidatorIndex(2),
			),
			Ok(false)
		);

		assert_eq!(
			tracker.direct_statement_providers(&groups, ValidatorIndex(7), &valid_7),
			vec![(ValidatorIndex(2), false)],
		);

		tracker.sent_or_received_direct_statement(&groups, ValidatorIndex(7), ValidatorIndex(2), &valid_7, true);
		assert_eq!(
			tracker.direct_statement_providers(&groups, ValidatorIndex(7), &valid_7),
			vec![(ValidatorIndex(2), true)],
		);

		// unknown originators have no providers.
		assert!(tracker.direct_statement_providers(&groups, ValidatorIndex(99), &valid_7).is_empty());
	}
}
