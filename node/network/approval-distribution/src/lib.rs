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

//! [`State`] for the approval distribution protocol: the gossip of assignments and approval
//! votes for candidates included in unfinalized relay-chain blocks.
//!
//! Messages are routed along the session grid topology, with a small amount of random
//! circulation on top. Everything here is synchronous: each entry point returns the
//! [`NetworkBridgeTxMessage`]s to hand to the network bridge, and messages received from peers
//! are checked through an [`ApprovalVotingHandle`] before being circulated further.

#![warn(missing_docs)]

use std::collections::{hash_map, BTreeMap, HashMap, HashSet, VecDeque};

use polkadot_node_network_protocol::{
	self as net_protocol,
	grid_topology::{RandomRouting, RequiredRouting, SessionGridTopologies, SessionGridTopology},
	v1 as protocol_v1, vstaging as protocol_vstaging, NetworkBridgeEvent, NetworkBridgeTxMessage,
	PeerId, UnifiedReputationChange as Rep, ValidationVersion, Versioned,
	VersionedValidationProtocol, View,
};
use polkadot_node_primitives::{
	approval::{
		ApprovalCheckResult, AssignmentCheckResult, BlockApprovalMeta, IndirectAssignmentCert,
		IndirectSignedApprovalVote,
	},
	BlockNumber, CandidateIndex, Hash, SessionIndex, ValidatorIndex, ValidatorSignature,
};
use itertools::Itertools;
use rand::{CryptoRng, Rng};

mod metrics;

pub use metrics::Metrics;
use metrics::SentMessagesStats;

#[cfg(test)]
mod tests;

const LOG_TARGET: &str = "parachain::approval-distribution";

const COST_UNEXPECTED_MESSAGE: Rep =
	Rep::CostMinor("Peer sent an out-of-view assignment or approval");
const COST_DUPLICATE_MESSAGE: Rep = Rep::CostMinorRepeated("Peer sent identical messages");
const COST_ASSIGNMENT_TOO_FAR_IN_THE_FUTURE: Rep =
	Rep::CostMinor("The vote was valid but too far in the future");
const COST_INVALID_MESSAGE: Rep = Rep::CostMajor("The vote was bad");

const BENEFIT_VALID_MESSAGE: Rep = Rep::BenefitMinor("Peer sent a valid message");
const BENEFIT_VALID_MESSAGE_FIRST: Rep =
	Rep::BenefitMinorFirst("Valid message with new information");

/// The maximum amount of assignments per network message.
pub const MAX_ASSIGNMENT_BATCH_SIZE: usize = 300;

/// The maximum amount of approvals per network message.
pub const MAX_APPROVAL_BATCH_SIZE: usize = 300;

/// The approval-voting side of the protocol, which checks and imports messages received
/// from peers before they are circulated any further.
pub trait ApprovalVotingHandle {
	/// Check an assignment for a candidate and import it if it is valid.
	fn check_and_import_assignment(
		&mut self,
		assignment: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
	) -> AssignmentCheckResult;

	/// Check an approval vote and import it if it is valid.
	fn check_and_import_approval(
		&mut self,
		approval: IndirectSignedApprovalVote,
	) -> ApprovalCheckResult;
}

// Blocks which were finalized recently. Messages arriving late for these are not punished.
#[derive(Debug, Default)]
struct RecentlyOutdated {
	buf: VecDeque<Hash>,
}

impl RecentlyOutdated {
	fn note_outdated(&mut self, hash: Hash) {
		const MAX_BUF_LEN: usize = 20;

		self.buf.push_back(hash);

		while self.buf.len() > MAX_BUF_LEN {
			let _ = self.buf.pop_front();
		}
	}

	fn is_recent_outdated(&self, hash: &Hash) -> bool {
		self.buf.contains(hash)
	}
}

// Contains topology routing information for assignments and approvals.
#[derive(Debug, Clone)]
struct ApprovalRouting {
	required_routing: RequiredRouting,
	local: bool,
	random_routing: RandomRouting,
}

// An assignment together with the approval vote of the same validator, if any.
#[derive(Debug, Clone)]
struct ApprovalEntry {
	assignment: IndirectAssignmentCert,
	candidate_index: CandidateIndex,
	approval: Option<IndirectSignedApprovalVote>,
	routing_info: ApprovalRouting,
}

#[derive(Debug, Clone, PartialEq)]
enum ApprovalEntryError {
	InvalidValidatorIndex,
	InvalidCandidateIndex,
	DuplicateApproval,
}

impl ApprovalEntry {
	fn new(
		assignment: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
		routing_info: ApprovalRouting,
	) -> Self {
		ApprovalEntry { assignment, candidate_index, approval: None, routing_info }
	}

	// The message subject shared by the assignment and the approval.
	fn message_subject(&self) -> MessageSubject {
		MessageSubject(self.assignment.block_hash, self.candidate_index, self.assignment.validator)
	}

	fn note_approval(
		&mut self,
		approval: IndirectSignedApprovalVote,
	) -> Result<(), ApprovalEntryError> {
		if self.assignment.validator != approval.validator {
			return Err(ApprovalEntryError::InvalidValidatorIndex)
		}

		if self.candidate_index != approval.candidate_index {
			return Err(ApprovalEntryError::InvalidCandidateIndex)
		}

		if self.approval.is_some() {
			return Err(ApprovalEntryError::DuplicateApproval)
		}

		self.approval = Some(approval);
		Ok(())
	}
}

// We keep track of each peer view and protocol version using this struct.
#[derive(Debug, Clone)]
struct PeerEntry {
	view: View,
	version: ValidationVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
	Assignment,
	Approval,
}

// Identifies the assignment and approval of one validator for one candidate in one block.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct MessageSubject(Hash, CandidateIndex, ValidatorIndex);

#[derive(Debug, Clone, Default)]
struct Knowledge {
	// When there is no entry, this means the message is unknown
	// When there is an entry with `MessageKind::Assignment`, the assignment is known.
	// When there is an entry with `MessageKind::Approval`, the assignment and approval are known.
	known_messages: HashMap<MessageSubject, MessageKind>,
}

impl Knowledge {
	fn contains(&self, message: &MessageSubject, kind: MessageKind) -> bool {
		match (kind, self.known_messages.get(message)) {
			(_, None) => false,
			(MessageKind::Assignment, Some(_)) => true,
			(MessageKind::Approval, Some(MessageKind::Assignment)) => false,
			(MessageKind::Approval, Some(MessageKind::Approval)) => true,
		}
	}

	// Returns `true` if the knowledge grew.
	fn insert(&mut self, message: MessageSubject, kind: MessageKind) -> bool {
		match self.known_messages.entry(message) {
			hash_map::Entry::Vacant(vacant) => {
				vacant.insert(kind);
				true
			},
			hash_map::Entry::Occupied(mut occupied) => match (*occupied.get(), kind) {
				(MessageKind::Assignment, MessageKind::Assignment) => false,
				(MessageKind::Approval, MessageKind::Approval) => false,
				(MessageKind::Approval, MessageKind::Assignment) => false,
				(MessageKind::Assignment, MessageKind::Approval) => {
					*occupied.get_mut() = MessageKind::Approval;
					true
				},
			},
		}
	}
}

/// Information that has been circulated to and from a peer.
#[derive(Debug, Clone, Default)]
struct PeerKnowledge {
	/// The knowledge we've sent to the peer.
	sent: Knowledge,
	/// The knowledge we've received from the peer.
	received: Knowledge,
}

impl PeerKnowledge {
	fn contains(&self, message: &MessageSubject, kind: MessageKind) -> bool {
		self.sent.contains(message, kind) || self.received.contains(message, kind)
	}
}

/// Information about blocks in our current view as well as whether peers know of them.
struct BlockEntry {
	/// Peers who we know are aware of this block and thus, the candidates within it.
	/// This maps to their knowledge of messages.
	known_by: HashMap<PeerId, PeerKnowledge>,
	/// The number of the block.
	number: BlockNumber,
	/// The parent hash of the block.
	parent_hash: Hash,
	/// Our knowledge of messages.
	knowledge: Knowledge,
	/// A votes entry for each candidate indexed by [`CandidateIndex`].
	candidates: Vec<CandidateEntry>,
	/// The session index of this block.
	session: SessionIndex,
}

impl BlockEntry {
	fn known_by(&self) -> Vec<PeerId> {
		self.known_by.keys().cloned().collect::<Vec<_>>()
	}

	fn approval_entry_mut(
		&mut self,
		candidate_index: CandidateIndex,
		validator_index: ValidatorIndex,
	) -> Option<&mut ApprovalEntry> {
		self.candidates
			.get_mut(candidate_index as usize)
			.and_then(|candidate_entry| candidate_entry.messages.get_mut(&validator_index))
	}
}

// Information about candidates in the context of a particular block they are included in.
// In other words, multiple `CandidateEntry`s may exist for the same candidate,
// if it is included by multiple blocks - this is likely the case when there are forks.
#[derive(Debug, Default)]
struct CandidateEntry {
	messages: HashMap<ValidatorIndex, ApprovalEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MessageSource {
	Peer(PeerId),
	Local,
}

impl MessageSource {
	fn peer_id(&self) -> Option<PeerId> {
		match self {
			Self::Peer(id) => Some(*id),
			Self::Local => None,
		}
	}
}

enum PendingMessage {
	Assignment(IndirectAssignmentCert, CandidateIndex),
	Approval(IndirectSignedApprovalVote),
}

/// The [`State`] struct is responsible for tracking the overall state of the protocol.
///
/// It tracks metadata about our view of the unfinalized chain,
/// which assignments and approvals we have seen, and our peers' views.
#[derive(Default)]
pub struct State {
	/// These two fields are used in conjunction to construct a view over the unfinalized chain.
	blocks_by_number: BTreeMap<BlockNumber, Vec<Hash>>,
	blocks: HashMap<Hash, BlockEntry>,

	/// Our view updates to our peers can race with `NewBlocks` updates. We store messages received
	/// against the directly mentioned blocks in our view in this map until `NewBlocks` is
	/// received.
	///
	/// As long as the parent is already in the `blocks` map and `NewBlocks` messages aren't
	/// delayed by more than a block length, this strategy will work well for mitigating the race.
	pending_known: HashMap<Hash, Vec<(PeerId, PendingMessage)>>,

	/// Peer data is partially stored here, and partially inline within the [`BlockEntry`]s
	peer_views: HashMap<PeerId, PeerEntry>,

	/// Keeps a topology for various different sessions.
	topologies: SessionGridTopologies,

	/// Tracks recently finalized blocks.
	recent_outdated_blocks: RecentlyOutdated,

	metrics: Metrics,
}

impl State {
	/// Create a new, empty state reporting to the given metrics.
	pub fn new(metrics: Metrics) -> Self {
		State { metrics, ..Default::default() }
	}

	/// Whether the block is currently tracked.
	pub fn knows_block(&self, hash: &Hash) -> bool {
		self.blocks.contains_key(hash)
	}

	/// Handle an event from the network bridge.
	pub fn handle_network_msg(
		&mut self,
		voting: &mut impl ApprovalVotingHandle,
		event: NetworkBridgeEvent<net_protocol::ApprovalDistributionMessage>,
		rng: &mut (impl CryptoRng + Rng),
	) -> Vec<NetworkBridgeTxMessage> {
		let mut out = Vec::new();

		match event {
			NetworkBridgeEvent::PeerConnected(peer_id, role, version) => {
				// insert a blank view if none already present
				tracing::trace!(target: LOG_TARGET, ?peer_id, ?role, "Peer connected");
				self.peer_views.entry(peer_id).or_insert(PeerEntry {
					view: Default::default(),
					version: ValidationVersion::from_protocol_version(version),
				});
			},
			NetworkBridgeEvent::PeerDisconnected(peer_id) => {
				tracing::trace!(target: LOG_TARGET, ?peer_id, "Peer disconnected");
				self.peer_views.remove(&peer_id);
				self.blocks.iter_mut().for_each(|(_hash, entry)| {
					entry.known_by.remove(&peer_id);
				})
			},
			NetworkBridgeEvent::NewGossipTopology(topology) => {
				self.handle_new_session_topology(
					&mut out,
					topology.session,
					topology.topology,
					topology.local_index,
				);
			},
			NetworkBridgeEvent::PeerViewChange(peer_id, view) => {
				self.handle_peer_view_change(&mut out, peer_id, view, rng);
			},
			NetworkBridgeEvent::OurViewChange(view) => {
				tracing::trace!(target: LOG_TARGET, ?view, "Own view change");
				for head in view.iter() {
					if !self.blocks.contains_key(head) {
						self.pending_known.entry(*head).or_default();
					}
				}

				self.pending_known.retain(|h, _| {
					let live = view.contains(h);
					if !live {
						tracing::trace!(
							target: LOG_TARGET,
							block_hash = ?h,
							"Cleaning up stale pending messages",
						);
					}
					live
				});
			},
			NetworkBridgeEvent::PeerMessage(peer_id, message) => {
				self.process_incoming_peer_message(voting, &mut out, peer_id, message, rng);
			},
		}

		out
	}

	/// Start tracking newly imported blocks, sharing what we know with peers who already
	/// have them in view.
	pub fn handle_new_blocks(
		&mut self,
		voting: &mut impl ApprovalVotingHandle,
		metas: Vec<BlockApprovalMeta>,
		rng: &mut (impl CryptoRng + Rng),
	) -> Vec<NetworkBridgeTxMessage> {
		let mut out = Vec::new();
		let mut new_hashes = HashSet::new();

		for meta in &metas {
			match self.blocks.entry(meta.hash) {
				hash_map::Entry::Vacant(entry) => {
					let candidates_count = meta.candidates.len();
					let mut candidates = Vec::with_capacity(candidates_count);
					candidates.resize_with(candidates_count, Default::default);

					entry.insert(BlockEntry {
						known_by: HashMap::new(),
						number: meta.number,
						parent_hash: meta.parent_hash,
						knowledge: Knowledge::default(),
						candidates,
						session: meta.session,
					});

					self.topologies.inc_session_refs(meta.session);

					new_hashes.insert(meta.hash);

					// In case there are duplicates, we should only set this if the entry
					// was vacant.
					self.blocks_by_number.entry(meta.number).or_default().push(meta.hash);
				},
				_ => continue,
			}
		}

		tracing::debug!(
			target: LOG_TARGET,
			"Got new blocks {:?}",
			metas.iter().map(|m| (m.hash, m.number)).collect_vec(),
		);

		let total_peers = self.peer_views.len();
		for (peer_id, PeerEntry { view, version }) in self.peer_views.iter() {
			let intersection = view.iter().filter(|h| new_hashes.contains(h));
			let view_intersection = View::new(intersection.cloned(), view.finalized_number);
			Self::unify_with_peer(
				&mut out,
				&self.metrics,
				&mut self.blocks,
				&self.topologies,
				total_peers,
				*peer_id,
				*version,
				view_intersection,
				rng,
			);
		}

		let pending_now_known = self
			.pending_known
			.keys()
			.filter(|k| self.blocks.contains_key(k))
			.copied()
			.collect_vec();

		let to_import = pending_now_known
			.into_iter()
			.inspect(|h| {
				tracing::trace!(
					target: LOG_TARGET,
					block_hash = ?h,
					"Extracting pending messages for new block"
				)
			})
			.filter_map(|k| self.pending_known.remove(&k))
			.flatten()
			.collect_vec();

		if !to_import.is_empty() {
			tracing::debug!(
				target: LOG_TARGET,
				num = to_import.len(),
				"Processing pending assignment/approvals",
			);

			let _timer = self.metrics.time_import_pending_now_known();

			for (peer_id, message) in to_import {
				match message {
					PendingMessage::Assignment(assignment, candidate_index) => {
						self.import_assignment_from_peer(
							voting,
							&mut out,
							peer_id,
							assignment,
							candidate_index,
							rng,
						);
					},
					PendingMessage::Approval(approval_vote) => {
						self.import_approval_from_peer(voting, &mut out, peer_id, approval_vote);
					},
				}
			}
		}

		out
	}

	/// Distribute our own assignment for a candidate.
	pub fn distribute_assignment(
		&mut self,
		assignment: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
		rng: &mut (impl CryptoRng + Rng),
	) -> Vec<NetworkBridgeTxMessage> {
		let mut out = Vec::new();
		let block_hash = assignment.block_hash;
		let message_subject = MessageSubject(block_hash, candidate_index, assignment.validator);

		let entry = match self.blocks.get_mut(&block_hash) {
			Some(entry) => entry,
			None => {
				tracing::debug!(
					target: LOG_TARGET,
					?block_hash,
					"Local assignment for a block we don't know",
				);
				return out
			},
		};

		if !entry.knowledge.insert(message_subject.clone(), MessageKind::Assignment) {
			// if we already imported an assignment, there is no need to distribute it again
			tracing::warn!(
				target: LOG_TARGET,
				?message_subject,
				"Importing locally an already known assignment",
			);
			return out
		}

		tracing::debug!(target: LOG_TARGET, ?message_subject, "Importing locally a new assignment");

		self.circulate_assignment(&mut out, MessageSource::Local, assignment, candidate_index, rng);
		out
	}

	/// Distribute our own approval vote. The matching assignment must have been distributed
	/// beforehand.
	pub fn distribute_approval(
		&mut self,
		vote: IndirectSignedApprovalVote,
	) -> Vec<NetworkBridgeTxMessage> {
		let mut out = Vec::new();
		let block_hash = vote.block_hash;
		let message_subject = MessageSubject(block_hash, vote.candidate_index, vote.validator);

		let entry = match self.blocks.get_mut(&block_hash) {
			Some(entry) => entry,
			None => {
				tracing::debug!(
					target: LOG_TARGET,
					?block_hash,
					"Local approval for a block we don't know",
				);
				return out
			},
		};

		if !entry.knowledge.contains(&message_subject, MessageKind::Assignment) {
			tracing::warn!(
				target: LOG_TARGET,
				?message_subject,
				"Local approval without a known assignment",
			);
			return out
		}

		if !entry.knowledge.insert(message_subject.clone(), MessageKind::Approval) {
			tracing::warn!(
				target: LOG_TARGET,
				?message_subject,
				"Importing locally an already known approval",
			);
			return out
		}

		tracing::debug!(target: LOG_TARGET, ?message_subject, "Importing locally a new approval");

		self.circulate_approval(&mut out, MessageSource::Local, vote);
		out
	}

	/// Retrieve approval signatures from state for the given relay block/indices.
	pub fn get_approval_signatures(
		&self,
		indices: HashSet<(Hash, CandidateIndex)>,
	) -> HashMap<ValidatorIndex, ValidatorSignature> {
		let mut all_sigs = HashMap::new();
		for (hash, index) in indices {
			let block_entry = match self.blocks.get(&hash) {
				None => {
					tracing::debug!(
						target: LOG_TARGET,
						?hash,
						"`get_approval_signatures`: could not find block entry for given hash!"
					);
					continue
				},
				Some(e) => e,
			};

			let candidate_entry = match block_entry.candidates.get(index as usize) {
				None => {
					tracing::debug!(
						target: LOG_TARGET,
						?hash,
						?index,
						"`get_approval_signatures`: could not find candidate entry for given hash and index!"
					);
					continue
				},
				Some(e) => e,
			};

			let sigs = candidate_entry.messages.iter().filter_map(|(validator_index, entry)| {
				entry.approval.as_ref().map(|approval| (*validator_index, approval.signature))
			});
			all_sigs.extend(sigs);
		}
		all_sigs
	}

	/// Prune every block at or below the finalized number.
	pub fn handle_block_finalized(&mut self, finalized_number: BlockNumber) {
		// split_off returns everything after the given key, including the key
		let split_point = finalized_number.saturating_add(1);
		let mut old_blocks = self.blocks_by_number.split_off(&split_point);

		// after split_off old_blocks actually contains new blocks, we need to swap
		std::mem::swap(&mut self.blocks_by_number, &mut old_blocks);

		// now that we pruned `self.blocks_by_number`, let's clean up `self.blocks` too
		old_blocks.values().flatten().for_each(|relay_block| {
			self.recent_outdated_blocks.note_outdated(*relay_block);
			if let Some(block_entry) = self.blocks.remove(relay_block) {
				self.topologies.dec_session_refs(block_entry.session);
			}
		});
	}

	fn handle_new_session_topology(
		&mut self,
		out: &mut Vec<NetworkBridgeTxMessage>,
		session: SessionIndex,
		topology: SessionGridTopology,
		local_index: Option<ValidatorIndex>,
	) {
		if local_index.is_none() {
			// this protocol only matters to validators.
			return
		}

		self.topologies.insert_topology(session, topology, local_index);
		let topology = match self.topologies.get_topology(session) {
			Some(topology) => topology,
			None => return,
		};

		let stats = adjust_required_routing_and_propagate(
			out,
			&mut self.blocks,
			&self.topologies,
			|block_entry| block_entry.session == session,
			|required_routing, local, validator_index| {
				if required_routing == &RequiredRouting::PendingTopology {
					topology
						.local_grid_neighbors()
						.required_routing_by_index(*validator_index, local)
				} else {
					*required_routing
				}
			},
			&self.peer_views,
		);
		self.metrics.note_new_topology_stats(stats);
	}

	fn process_incoming_peer_message(
		&mut self,
		voting: &mut impl ApprovalVotingHandle,
		out: &mut Vec<NetworkBridgeTxMessage>,
		peer_id: PeerId,
		msg: net_protocol::ApprovalDistributionMessage,
		rng: &mut (impl CryptoRng + Rng),
	) {
		let msg = match msg {
			Versioned::V1(msg) | Versioned::VStaging(msg) => msg,
		};

		match msg {
			protocol_v1::ApprovalDistributionMessage::Assignments(assignments) => {
				tracing::trace!(
					target: LOG_TARGET,
					peer_id = %peer_id,
					num = assignments.len(),
					"Processing assignments from a peer",
				);
				for (assignment, candidate_index) in assignments {
					if let Some(pending) = self.pending_known.get_mut(&assignment.block_hash) {
						tracing::trace!(
							target: LOG_TARGET,
							%peer_id,
							block_hash = ?assignment.block_hash,
							?candidate_index,
							validator_index = ?assignment.validator,
							"Pending assignment",
						);

						pending.push((peer_id, PendingMessage::Assignment(assignment, candidate_index)));

						continue
					}

					self.import_assignment_from_peer(
						voting,
						out,
						peer_id,
						assignment,
						candidate_index,
						rng,
					);
				}
			},
			protocol_v1::ApprovalDistributionMessage::Approvals(approvals) => {
				tracing::trace!(
					target: LOG_TARGET,
					peer_id = %peer_id,
					num = approvals.len(),
					"Processing approvals from a peer",
				);
				for approval_vote in approvals {
					if let Some(pending) = self.pending_known.get_mut(&approval_vote.block_hash) {
						tracing::trace!(
							target: LOG_TARGET,
							%peer_id,
							block_hash = ?approval_vote.block_hash,
							candidate_index = ?approval_vote.candidate_index,
							validator_index = ?approval_vote.validator,
							"Pending approval",
						);

						pending.push((peer_id, PendingMessage::Approval(approval_vote)));

						continue
					}

					self.import_approval_from_peer(voting, out, peer_id, approval_vote);
				}
			},
		}
	}

	// handle a peer view change: requires that the peer is already connected
	// and has an entry in `peer_views`.
	fn handle_peer_view_change(
		&mut self,
		out: &mut Vec<NetworkBridgeTxMessage>,
		peer_id: PeerId,
		view: View,
		rng: &mut (impl CryptoRng + Rng),
	) {
		tracing::trace!(target: LOG_TARGET, ?view, "Peer view change");
		let finalized_number = view.finalized_number;

		let (old_view, version) = if let Some(peer_entry) = self.peer_views.get_mut(&peer_id) {
			(Some(std::mem::replace(&mut peer_entry.view, view.clone())), peer_entry.version)
		} else {
			// This shouldn't happen, but if it does we assume protocol version 1.
			tracing::warn!(
				target: LOG_TARGET,
				?peer_id,
				?view,
				"Peer view change for missing `peer_entry`"
			);

			(None, ValidationVersion::V1)
		};

		let old_finalized_number = old_view.map(|v| v.finalized_number).unwrap_or(0);

		// we want to prune every block known_by peer up to (including) view.finalized_number
		let blocks = &mut self.blocks;
		// the `BTreeMap::range` is constrained by stored keys
		// so the loop won't take ages if the new finalized_number skyrockets
		// but we need to make sure the range is not empty, otherwise it will panic
		let range = old_finalized_number..=finalized_number;
		if !range.is_empty() && !blocks.is_empty() {
			self.blocks_by_number
				.range(range)
				.flat_map(|(_number, hashes)| hashes)
				.for_each(|hash| {
					if let Some(entry) = blocks.get_mut(hash) {
						entry.known_by.remove(&peer_id);
					}
				});
		}

		Self::unify_with_peer(
			out,
			&self.metrics,
			&mut self.blocks,
			&self.topologies,
			self.peer_views.len(),
			peer_id,
			version,
			view,
			rng,
		);
	}

	fn import_assignment_from_peer(
		&mut self,
		voting: &mut impl ApprovalVotingHandle,
		out: &mut Vec<NetworkBridgeTxMessage>,
		peer_id: PeerId,
		assignment: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
		rng: &mut (impl CryptoRng + Rng),
	) {
		let block_hash = assignment.block_hash;
		let validator_index = assignment.validator;

		let entry = match self.blocks.get_mut(&block_hash) {
			Some(entry) => entry,
			None => {
				tracing::trace!(
					target: LOG_TARGET,
					?peer_id,
					hash = ?block_hash,
					?validator_index,
					"Unexpected assignment",
				);
				if !self.recent_outdated_blocks.is_recent_outdated(&block_hash) {
					report(out, peer_id, COST_UNEXPECTED_MESSAGE);
				}
				self.metrics.on_assignment_rejected("unknown-block");
				return
			},
		};

		// Compute metadata on the assignment.
		let message_subject = MessageSubject(block_hash, candidate_index, validator_index);
		let message_kind = MessageKind::Assignment;

		// check if our knowledge of the peer already contains this assignment
		match entry.known_by.entry(peer_id) {
			hash_map::Entry::Occupied(mut peer_knowledge) => {
				let peer_knowledge = peer_knowledge.get_mut();
				if peer_knowledge.contains(&message_subject, message_kind) {
					// wasn't included before
					if !peer_knowledge.received.insert(message_subject.clone(), message_kind) {
						tracing::debug!(
							target: LOG_TARGET,
							?peer_id,
							?message_subject,
							"Duplicate assignment",
						);
						report(out, peer_id, COST_DUPLICATE_MESSAGE);
						self.metrics.on_assignment_rejected("duplicate");
					} else {
						tracing::trace!(
							target: LOG_TARGET,
							?peer_id,
							?message_subject,
							"We sent the message to the peer while peer was sending it to us. Known race condition.",
						);
					}
					return
				}
			},
			hash_map::Entry::Vacant(_) => {
				tracing::debug!(
					target: LOG_TARGET,
					?peer_id,
					?message_subject,
					"Assignment from a peer is out of view",
				);
				report(out, peer_id, COST_UNEXPECTED_MESSAGE);
			},
		}

		// if the assignment is known to be valid, reward the peer
		if entry.knowledge.contains(&message_subject, message_kind) {
			report(out, peer_id, BENEFIT_VALID_MESSAGE);
			if let Some(peer_knowledge) = entry.known_by.get_mut(&peer_id) {
				tracing::trace!(target: LOG_TARGET, ?peer_id, ?message_subject, "Known assignment");
				peer_knowledge.received.insert(message_subject, message_kind);
			}
			return
		}

		let result = voting.check_and_import_assignment(assignment.clone(), candidate_index);
		tracing::trace!(target: LOG_TARGET, ?peer_id, ?message_subject, ?result, "Checked assignment");

		match result {
			AssignmentCheckResult::Accepted => {
				report(out, peer_id, BENEFIT_VALID_MESSAGE_FIRST);
				entry.knowledge.insert(message_subject.clone(), message_kind);
				if let Some(peer_knowledge) = entry.known_by.get_mut(&peer_id) {
					peer_knowledge.received.insert(message_subject, message_kind);
				}
			},
			AssignmentCheckResult::AcceptedDuplicate => {
				// "duplicate" assignments aren't necessarily equal.
				// There is more than one way each validator can be assigned to each core.
				if let Some(peer_knowledge) = entry.known_by.get_mut(&peer_id) {
					peer_knowledge.received.insert(message_subject, message_kind);
				}
				tracing::debug!(
					target: LOG_TARGET,
					hash = ?block_hash,
					?peer_id,
					"Got an `AcceptedDuplicate` assignment",
				);
				return
			},
			AssignmentCheckResult::TooFarInFuture => {
				tracing::debug!(
					target: LOG_TARGET,
					hash = ?block_hash,
					?peer_id,
					"Got an assignment too far in the future",
				);
				report(out, peer_id, COST_ASSIGNMENT_TOO_FAR_IN_THE_FUTURE);
				self.metrics.on_assignment_rejected("too-far-in-future");
				return
			},
			AssignmentCheckResult::Bad(error) => {
				tracing::info!(
					target: LOG_TARGET,
					hash = ?block_hash,
					?peer_id,
					%error,
					"Got a bad assignment from peer",
				);
				report(out, peer_id, COST_INVALID_MESSAGE);
				self.metrics.on_assignment_rejected("bad");
				return
			},
		}

		self.circulate_assignment(
			out,
			MessageSource::Peer(peer_id),
			assignment,
			candidate_index,
			rng,
		);
	}

	// Invariant: to our knowledge, none of the peers except for the `source` know about the
	// assignment.
	fn circulate_assignment(
		&mut self,
		out: &mut Vec<NetworkBridgeTxMessage>,
		source: MessageSource,
		assignment: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
		rng: &mut (impl CryptoRng + Rng),
	) {
		let block_hash = assignment.block_hash;
		let validator_index = assignment.validator;

		let entry = match self.blocks.get_mut(&block_hash) {
			Some(entry) => entry,
			None => return,
		};

		let topology = self.topologies.get_topology(entry.session);
		let local = source == MessageSource::Local;

		let required_routing = topology.map_or(RequiredRouting::PendingTopology, |t| {
			t.local_grid_neighbors().required_routing_by_index(validator_index, local)
		});

		// All the peers that know the relay chain block.
		let peers_to_filter = entry.known_by();

		let candidate_entry = match entry.candidates.get_mut(candidate_index as usize) {
			Some(candidate_entry) => candidate_entry,
			None => {
				tracing::warn!(
					target: LOG_TARGET,
					hash = ?block_hash,
					?candidate_index,
					"Missing candidate entry on `circulate_assignment`",
				);
				return
			},
		};

		self.metrics.on_assignment_imported();

		let approval_entry =
			candidate_entry.messages.entry(validator_index).or_insert_with(|| {
				ApprovalEntry::new(
					assignment.clone(),
					candidate_index,
					ApprovalRouting { required_routing, local, random_routing: Default::default() },
				)
			});

		// Dispatch the message to all peers in the routing set which
		// know the block.
		//
		// If the topology isn't known yet (race with networking subsystems)
		// then messages will be sent when we get it.
		let n_peers_total = self.peer_views.len();
		let source_peer = source.peer_id();

		let mut peers = Vec::new();
		for peer in peers_to_filter.into_iter() {
			if Some(peer) == source_peer {
				continue
			}

			if let Some(true) =
				topology.map(|t| t.local_grid_neighbors().route_to_peer(required_routing, &peer))
			{
				peers.push(peer);
				continue
			}

			if !topology.map_or(false, |t| t.is_validator(&peer)) {
				continue
			}

			// Note: at this point, we haven't received the message from any peers
			// other than the source peer, and we just got it, so we haven't sent it
			// to any peers either.
			let random_routing = &mut approval_entry.routing_info.random_routing;
			if random_routing.sample(n_peers_total, rng) {
				random_routing.inc_sent();
				peers.push(peer);
			}
		}

		let message_subject = MessageSubject(block_hash, candidate_index, validator_index);
		for peer in peers.iter() {
			// we already filtered peers above, so this should always be Some
			if let Some(peer_knowledge) = entry.known_by.get_mut(peer) {
				peer_knowledge.sent.insert(message_subject.clone(), MessageKind::Assignment);
			}
		}

		if !peers.is_empty() {
			tracing::trace!(
				target: LOG_TARGET,
				?block_hash,
				?candidate_index,
				local,
				num_peers = peers.len(),
				"Sending an assignment to peers",
			);

			let peers = with_versions(&self.peer_views, &peers);
			let mut stats = SentMessagesStats::default();
			send_assignments_batched(out, vec![(assignment, candidate_index)], &peers, &mut stats);
			self.metrics.note_basic_circulation_stats(stats);
		}
	}

	fn import_approval_from_peer(
		&mut self,
		voting: &mut impl ApprovalVotingHandle,
		out: &mut Vec<NetworkBridgeTxMessage>,
		peer_id: PeerId,
		vote: IndirectSignedApprovalVote,
	) {
		let block_hash = vote.block_hash;
		let validator_index = vote.validator;
		let candidate_index = vote.candidate_index;

		let entry = match self.blocks.get_mut(&block_hash) {
			Some(entry) => entry,
			None => {
				if !self.recent_outdated_blocks.is_recent_outdated(&block_hash) {
					report(out, peer_id, COST_UNEXPECTED_MESSAGE);
					tracing::debug!(target: LOG_TARGET, "Received approval for invalid block");
				}
				self.metrics.on_approval_rejected("unknown-block");
				return
			},
		};

		// compute metadata on the approval.
		let message_subject = MessageSubject(block_hash, candidate_index, validator_index);
		let message_kind = MessageKind::Approval;

		if !entry.knowledge.contains(&message_subject, MessageKind::Assignment) {
			tracing::trace!(
				target: LOG_TARGET,
				?peer_id,
				?message_subject,
				"Unknown approval assignment",
			);
			report(out, peer_id, COST_UNEXPECTED_MESSAGE);
			self.metrics.on_approval_rejected("unknown-assignment");
			return
		}

		// check if our knowledge of the peer already contains this approval
		match entry.known_by.entry(peer_id) {
			hash_map::Entry::Occupied(mut knowledge) => {
				let peer_knowledge = knowledge.get_mut();
				if peer_knowledge.contains(&message_subject, message_kind) {
					if !peer_knowledge.received.insert(message_subject.clone(), message_kind) {
						tracing::trace!(
							target: LOG_TARGET,
							?peer_id,
							?message_subject,
							"Duplicate approval",
						);
						report(out, peer_id, COST_DUPLICATE_MESSAGE);
						self.metrics.on_approval_rejected("duplicate");
					}
					return
				}
			},
			hash_map::Entry::Vacant(_) => {
				tracing::debug!(
					target: LOG_TARGET,
					?peer_id,
					?message_subject,
					"Approval from a peer is out of view",
				);
				report(out, peer_id, COST_UNEXPECTED_MESSAGE);
			},
		}

		// if the approval is known to be valid, reward the peer
		if entry.knowledge.contains(&message_subject, message_kind) {
			tracing::trace!(target: LOG_TARGET, ?peer_id, ?message_subject, "Known approval");
			report(out, peer_id, BENEFIT_VALID_MESSAGE);
			if let Some(peer_knowledge) = entry.known_by.get_mut(&peer_id) {
				peer_knowledge.received.insert(message_subject, message_kind);
			}
			return
		}

		let result = voting.check_and_import_approval(vote.clone());
		tracing::trace!(target: LOG_TARGET, ?peer_id, ?result, "Checked approval");

		match result {
			ApprovalCheckResult::Accepted => {
				report(out, peer_id, BENEFIT_VALID_MESSAGE_FIRST);
				entry.knowledge.insert(message_subject.clone(), message_kind);
				if let Some(peer_knowledge) = entry.known_by.get_mut(&peer_id) {
					peer_knowledge.received.insert(message_subject, message_kind);
				}
			},
			ApprovalCheckResult::Bad(error) => {
				report(out, peer_id, COST_INVALID_MESSAGE);
				tracing::info!(
					target: LOG_TARGET,
					?peer_id,
					%error,
					"Got a bad approval from peer",
				);
				self.metrics.on_approval_rejected("bad");
				return
			},
		}

		self.circulate_approval(out, MessageSource::Peer(peer_id), vote);
	}

	// Invariant: to our knowledge, none of the peers except for the `source` know about the
	// approval.
	fn circulate_approval(
		&mut self,
		out: &mut Vec<NetworkBridgeTxMessage>,
		source: MessageSource,
		vote: IndirectSignedApprovalVote,
	) {
		let block_hash = vote.block_hash;
		let validator_index = vote.validator;
		let candidate_index = vote.candidate_index;

		let entry = match self.blocks.get_mut(&block_hash) {
			Some(entry) => entry,
			None => return,
		};

		// The entry is created when the assignment is imported.
		let required_routing = match entry.approval_entry_mut(candidate_index, validator_index) {
			Some(approval_entry) => {
				if let Err(err) = approval_entry.note_approval(vote.clone()) {
					// this would indicate a bug in approval-voting:
					// - validator index mismatch
					// - candidate index mismatch
					// - duplicate approval
					tracing::warn!(
						target: LOG_TARGET,
						hash = ?block_hash,
						?candidate_index,
						?validator_index,
						?err,
						"Possible bug: Vote import failed",
					);
					return
				}
				approval_entry.routing_info.required_routing
			},
			None => {
				tracing::warn!(
					target: LOG_TARGET,
					peer_id = ?source.peer_id(),
					?candidate_index,
					?validator_index,
					"Unknown approval assignment",
				);
				return
			},
		};

		self.metrics.on_approval_imported();

		// Dispatch the approval to all peers required by the topology, with the exception of
		// the source peer.
		let topology = self.topologies.get_topology(entry.session);
		let source_peer = source.peer_id();
		let message_subject = MessageSubject(block_hash, candidate_index, validator_index);

		let peers = entry
			.known_by
			.iter()
			.filter(|(peer, knowledge)| {
				if Some(**peer) == source_peer {
					return false
				}

				// At this point, the only peer we're aware of which has the approval message is
				// the source peer. Every peer in the required routing which knows the block
				// has the assignment already, except the one it came from, and so do the
				// randomly selected ones.
				let in_topology = topology.map_or(false, |t| {
					t.local_grid_neighbors().route_to_peer(required_routing, peer)
				});
				in_topology || knowledge.sent.contains(&message_subject, MessageKind::Assignment)
			})
			.map(|(peer, _)| *peer)
			.collect_vec();

		// Add the metadata of the approval to the knowledge of each peer.
		for peer in peers.iter() {
			if let Some(peer_knowledge) = entry.known_by.get_mut(peer) {
				peer_knowledge.sent.insert(message_subject.clone(), MessageKind::Approval);
			}
		}

		if !peers.is_empty() {
			tracing::trace!(
				target: LOG_TARGET,
				?block_hash,
				local = source_peer.is_none(),
				num_peers = peers.len(),
				"Sending an approval to peers",
			);

			let peers = with_versions(&self.peer_views, &peers);
			let mut stats = SentMessagesStats::default();
			send_approvals_batched(out, vec![vote], &peers, &mut stats);
			self.metrics.note_basic_circulation_stats(stats);
		}
	}

	fn unify_with_peer(
		out: &mut Vec<NetworkBridgeTxMessage>,
		metrics: &Metrics,
		entries: &mut HashMap<Hash, BlockEntry>,
		topologies: &SessionGridTopologies,
		total_peers: usize,
		peer_id: PeerId,
		version: ValidationVersion,
		view: View,
		rng: &mut (impl CryptoRng + Rng),
	) {
		metrics.on_unify_with_peer();
		let _timer = metrics.time_unify_with_peer();

		let mut assignments_to_send = Vec::new();
		let mut approvals_to_send = Vec::new();

		let view_finalized_number = view.finalized_number;
		for head in view.into_iter() {
			let mut block = head;

			// Walk the chain back to last finalized block of the peer view.
			loop {
				let entry = match entries.get_mut(&block) {
					Some(entry) if entry.number > view_finalized_number => entry,
					_ => break,
				};

				// Any peer which is in the `known_by` set has already been
				// sent all messages it's meant to get for that block and all
				// in-scope prior blocks.
				if entry.known_by.contains_key(&peer_id) {
					break
				}

				let peer_knowledge = entry.known_by.entry(peer_id).or_default();
				let topology = topologies.get_topology(entry.session);

				let approval_entries =
					entry.candidates.iter_mut().flat_map(|candidate| candidate.messages.values_mut());

				for approval_entry in approval_entries {
					// Propagate the message to all peers in the required routing set OR
					// randomly sample peers.
					let required_routing = approval_entry.routing_info.required_routing;
					let in_topology = topology.map_or(false, |t| {
						t.local_grid_neighbors().route_to_peer(required_routing, &peer_id)
					});

					let route = in_topology || {
						if !topology.map_or(false, |t| t.is_validator(&peer_id)) {
							false
						} else {
							let random_routing = &mut approval_entry.routing_info.random_routing;
							let route_random = random_routing.sample(total_peers, rng);
							if route_random {
								random_routing.inc_sent();
							}
							route_random
						}
					};

					if !route {
						continue
					}

					let message_subject = approval_entry.message_subject();

					// Only send stuff a peer doesn't know in the context of a relay chain block.
					if !peer_knowledge.contains(&message_subject, MessageKind::Assignment) {
						peer_knowledge.sent.insert(message_subject.clone(), MessageKind::Assignment);
						assignments_to_send.push((
							approval_entry.assignment.clone(),
							approval_entry.candidate_index,
						));
					}

					// The assignment is known to the peer at this point, so the approval
					// can follow.
					if let Some(approval) = approval_entry.approval.as_ref() {
						if !peer_knowledge.contains(&message_subject, MessageKind::Approval) {
							peer_knowledge.sent.insert(message_subject, MessageKind::Approval);
							approvals_to_send.push(approval.clone());
						}
					}
				}

				block = entry.parent_hash;
			}
		}

		let peers = [(peer_id, version)];
		let mut stats = SentMessagesStats::default();

		if !assignments_to_send.is_empty() {
			tracing::trace!(
				target: LOG_TARGET,
				?peer_id,
				?version,
				num = assignments_to_send.len(),
				"Sending assignments to unified peer",
			);

			send_assignments_batched(out, assignments_to_send, &peers, &mut stats);
		}

		if !approvals_to_send.is_empty() {
			tracing::trace!(
				target: LOG_TARGET,
				?peer_id,
				?version,
				num = approvals_to_send.len(),
				"Sending approvals to unified peer",
			);

			send_approvals_batched(out, approvals_to_send, &peers, &mut stats);
		}

		metrics.note_unify_with_peer_stats(stats);
	}
}

// This adjusts the required routing of messages in blocks that pass the block filter
// according to the modifier function given.
//
// The modifier accepts as inputs the current required-routing state, whether
// the message is locally originating, and the validator index of the message issuer.
//
// Then, if the topology is known, this progates messages to all peers in the required
// routing set which are aware of the block. Peers which are unaware of the block
// will have the message sent when it enters their view in `unify_with_peer`.
//
// Note that the required routing of a message can be modified even if the
// topology is unknown yet.
fn adjust_required_routing_and_propagate<BlockFilter, RoutingModifier>(
	out: &mut Vec<NetworkBridgeTxMessage>,
	blocks: &mut HashMap<Hash, BlockEntry>,
	topologies: &SessionGridTopologies,
	block_filter: BlockFilter,
	routing_modifier: RoutingModifier,
	peer_views: &HashMap<PeerId, PeerEntry>,
) -> SentMessagesStats
where
	BlockFilter: Fn(&BlockEntry) -> bool,
	RoutingModifier: Fn(&RequiredRouting, bool, &ValidatorIndex) -> RequiredRouting,
{
	let mut peer_assignments: HashMap<PeerId, Vec<_>> = HashMap::new();
	let mut peer_approvals: HashMap<PeerId, Vec<_>> = HashMap::new();

	// Iterate all blocks in the session, producing payloads
	// for each connected peer.
	for block_entry in blocks.values_mut() {
		if !block_filter(block_entry) {
			continue
		}

		let topology = match topologies.get_topology(block_entry.session) {
			Some(t) => t,
			None => continue,
		};

		let approval_entries = block_entry
			.candidates
			.iter_mut()
			.flat_map(|candidate| candidate.messages.values_mut());

		for approval_entry in approval_entries {
			let new_required_routing = routing_modifier(
				&approval_entry.routing_info.required_routing,
				approval_entry.routing_info.local,
				&approval_entry.assignment.validator,
			);

			approval_entry.routing_info.required_routing = new_required_routing;

			if new_required_routing.is_empty() {
				continue
			}

			let message_subject = approval_entry.message_subject();

			for (peer, peer_knowledge) in block_entry.known_by.iter_mut() {
				if !topology.local_grid_neighbors().route_to_peer(new_required_routing, peer) {
					continue
				}

				// Only send stuff a peer doesn't know in the context of a relay chain block.
				if !peer_knowledge.contains(&message_subject, MessageKind::Assignment) {
					peer_knowledge.sent.insert(message_subject.clone(), MessageKind::Assignment);
					peer_assignments
						.entry(*peer)
						.or_default()
						.push((approval_entry.assignment.clone(), approval_entry.candidate_index));
				}

				if let Some(approval) = approval_entry.approval.as_ref() {
					if !peer_knowledge.contains(&message_subject, MessageKind::Approval) {
						peer_knowledge.sent.insert(message_subject.clone(), MessageKind::Approval);
						peer_approvals.entry(*peer).or_default().push(approval.clone());
					}
				}
			}
		}
	}

	let mut stats = SentMessagesStats::default();

	// Send messages in accumulated packets, assignments preceding approvals.
	for (peer, assignments_packet) in peer_assignments {
		if let Some(peer_view) = peer_views.get(&peer) {
			send_assignments_batched(out, assignments_packet, &[(peer, peer_view.version)], &mut stats);
		} else {
			// This should never happen.
			tracing::warn!(target: LOG_TARGET, ?peer, "Unknown protocol version for peer");
		}
	}

	for (peer, approvals_packet) in peer_approvals {
		if let Some(peer_view) = peer_views.get(&peer) {
			send_approvals_batched(out, approvals_packet, &[(peer, peer_view.version)], &mut stats);
		} else {
			// This should never happen.
			tracing::warn!(target: LOG_TARGET, ?peer, "Unknown protocol version for peer");
		}
	}

	stats
}

fn report(out: &mut Vec<NetworkBridgeTxMessage>, peer_id: PeerId, rep: Rep) {
	tracing::trace!(target: LOG_TARGET, reputation = ?rep, ?peer_id, "Reputation change for peer");
	out.push(NetworkBridgeTxMessage::ReportPeer(peer_id, rep.into()));
}

fn with_versions(
	peer_views: &HashMap<PeerId, PeerEntry>,
	peers: &[PeerId],
) -> Vec<(PeerId, ValidationVersion)> {
	peers
		.iter()
		.filter_map(|peer_id| peer_views.get(peer_id).map(|entry| (*peer_id, entry.version)))
		.collect()
}

fn filter_by_peer_version(
	peers: &[(PeerId, ValidationVersion)],
	version: ValidationVersion,
) -> Vec<PeerId> {
	peers.iter().filter(|(_, v)| *v == version).map(|(peer_id, _)| *peer_id).collect()
}

fn approval_message(
	version: ValidationVersion,
	message: protocol_v1::ApprovalDistributionMessage,
) -> VersionedValidationProtocol {
	match version {
		ValidationVersion::V1 =>
			Versioned::V1(protocol_v1::ValidationProtocol::ApprovalDistribution(message)),
		ValidationVersion::VStaging =>
			Versioned::VStaging(protocol_vstaging::ValidationProtocol::ApprovalDistribution(message)),
	}
}

/// Send assignments while honoring the batch size limit of the protocol.
///
/// Splitting the messages into multiple notifications allows more granular processing at the
/// destination, such that the receiver doesn't get stuck for long processing a batch
/// of assignments.
fn send_assignments_batched(
	out: &mut Vec<NetworkBridgeTxMessage>,
	assignments: Vec<(IndirectAssignmentCert, CandidateIndex)>,
	peers: &[(PeerId, ValidationVersion)],
	stats: &mut SentMessagesStats,
) {
	for version in [ValidationVersion::V1, ValidationVersion::VStaging] {
		let peers = filter_by_peer_version(peers, version);
		if peers.is_empty() {
			continue
		}

		for batch in assignments.chunks(MAX_ASSIGNMENT_BATCH_SIZE) {
			stats.note_assignments(batch.len() * peers.len(), peers.len());
			out.push(NetworkBridgeTxMessage::SendValidationMessage(
				peers.clone(),
				approval_message(
					version,
					protocol_v1::ApprovalDistributionMessage::Assignments(batch.to_vec()),
				),
			));
		}
	}
}

/// Send approvals while honoring the batch size limit of the protocol and the peer version.
fn send_approvals_batched(
	out: &mut Vec<NetworkBridgeTxMessage>,
	approvals: Vec<IndirectSignedApprovalVote>,
	peers: &[(PeerId, ValidationVersion)],
	stats: &mut SentMessagesStats,
) {
	for version in [ValidationVersion::V1, ValidationVersion::VStaging] {
		let peers = filter_by_peer_version(peers, version);
		if peers.is_empty() {
			continue
		}

		for batch in approvals.chunks(MAX_APPROVAL_BATCH_SIZE) {
			stats.note_approvals(batch.len() * peers.len(), peers.len());
			out.push(NetworkBridgeTxMessage::SendValidationMessage(
				peers.clone(),
				approval_message(
					version,
					protocol_v1::ApprovalDistributionMessage::Approvals(batch.to_vec()),
				),
			));
		}
	}
}
