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

//! Statement distribution for backed candidates.
//!
//! Validators in a backing group exchange signed statements directly with
//! each other (the "cluster"). Once a candidate is backed it is advertised to
//! the rest of the session along the grid topology with manifests, and
//! statements then flow directly between validators that exchanged manifests.
//!
//! The [`State`] here is synchronous. Every handler returns the messages the
//! network bridge should act on.

#![warn(missing_docs)]

use polkadot_node_network_protocol::{
	grid_topology::SessionGridTopology,
	vstaging::{
		self as protocol_vstaging, BackedCandidateAcknowledgement, BackedCandidateManifest,
		StatementDistributionMessage, StatementFilter,
	},
	NetworkBridgeEvent, NetworkBridgeTxMessage, PeerId, UnifiedReputationChange as Rep,
	ValidationVersion, Versioned, View,
};
use polkadot_node_primitives::{
	CandidateHash, CompactStatement, GroupIndex, Hash, ParaId, SessionIndex, SessionInfo,
	SignedStatement, SigningContext, ValidatorIndex,
};

use std::collections::{HashMap, HashSet};

pub mod cluster;
pub mod grid;
pub mod groups;
pub mod statement_store;

use cluster::{Accept as ClusterAccept, ClusterTracker, RejectIncoming as ClusterRejectIncoming};
use grid::{GridTracker, ManifestImportError, ManifestKind, ManifestSummary, SessionTopologyView};
use groups::Groups;
use statement_store::StatementStore;


const LOG_TARGET: &str = "parachain::statement-distribution";

const COST_UNEXPECTED_STATEMENT: Rep = Rep::CostMinor("Unexpected Statement");
const COST_UNEXPECTED_STATEMENT_MISSING_KNOWLEDGE: Rep =
	Rep::CostMinor("Unexpected Statement, missing knowledge for relay parent");
const COST_INVALID_SIGNATURE: Rep = Rep::CostMajor("Invalid Statement Signature");
const COST_DUPLICATE_STATEMENT: Rep =
	Rep::CostMajorRepeated("Statement sent more than once by peer");
const COST_EXCESSIVE_SECONDED: Rep = Rep::CostMinor("Sent Excessive `Seconded` Statements");

const COST_UNEXPECTED_MANIFEST_MISSING_KNOWLEDGE: Rep =
	Rep::CostMinor("Unexpected Manifest, missing knowledge for relay parent");
const COST_UNEXPECTED_MANIFEST_DISALLOWED: Rep =
	Rep::CostMinor("Unexpected Manifest, Peer Disallowed");
const COST_CONFLICTING_MANIFEST: Rep = Rep::CostMajor("Manifest conflicts with previous");
const COST_INSUFFICIENT_MANIFEST: Rep =
	Rep::CostMajor("Manifest statements insufficient to back candidate");
const COST_INVALID_MANIFEST: Rep = Rep::CostMajor("Manifest is malformed");
const COST_UNEXPECTED_ACKNOWLEDGEMENT_UNKNOWN_CANDIDATE: Rep =
	Rep::CostMinor("Unexpected acknowledgement, unknown candidate");

const BENEFIT_VALID_STATEMENT: Rep = Rep::BenefitMajor("Peer provided a valid statement");
const BENEFIT_VALID_STATEMENT_FIRST: Rep =
	Rep::BenefitMajorFirst("Peer was the first to provide a valid statement");

/// The reputation change for a rejected manifest.
pub fn manifest_import_cost(error: ManifestImportError) -> Rep {
	match error {
		ManifestImportError::Disallowed => COST_UNEXPECTED_MANIFEST_DISALLOWED,
		ManifestImportError::Malformed => COST_INVALID_MANIFEST,
		ManifestImportError::Insufficient => COST_INSUFFICIENT_MANIFEST,
		ManifestImportError::Conflicting => COST_CONFLICTING_MANIFEST,
		ManifestImportError::Overflow => COST_EXCESSIVE_SECONDED,
	}
}

struct PerSessionState {
	session_info: SessionInfo,
	groups: Groups,
	local_validator: Option<ValidatorIndex>,
	// `None` until the gossip topology for the session arrives.
	topology: Option<SessionGridTopology>,
	grid_view: Option<SessionTopologyView>,
}

impl PerSessionState {
	fn apply_topology(&mut self, topology: SessionGridTopology) {
		let grid_view =
			grid::build_session_topology(self.groups.all().iter(), &topology, self.local_validator);

		self.grid_view = Some(grid_view);
		self.topology = Some(topology);
	}
}

struct LocalValidatorState {
	index: ValidatorIndex,
	// `None` for validators which aren't assigned to any group.
	cluster_tracker: Option<ClusterTracker>,
	grid_tracker: GridTracker,
}

struct PerRelayParentState {
	session: SessionIndex,
	local_validator: Option<LocalValidatorState>,
	statement_store: StatementStore,
}

struct ConfirmedCandidate {
	relay_parent: Hash,
	group_index: GroupIndex,
	para_id: ParaId,
	parent_head_data_hash: Hash,
}

struct PeerState {
	view: View,
	protocol_version: ValidationVersion,
}

/// Statement distribution state for all active relay-parents.
pub struct State {
	seconding_limit: usize,
	minimum_backing_votes: u32,
	per_session: HashMap<SessionIndex, PerSessionState>,
	per_relay_parent: HashMap<Hash, PerRelayParentState>,
	confirmed: HashMap<CandidateHash, ConfirmedCandidate>,
	peers: HashMap<PeerId, PeerState>,
	// topologies which arrived before the session itself.
	pending_topologies: HashMap<SessionIndex, SessionGridTopology>,
}

impl State {
	/// Create a new state. `seconding_limit` bounds the `Seconded` statements any
	/// validator may issue per relay-parent.
	pub fn new(seconding_limit: usize, minimum_backing_votes: u32) -> Self {
		State {
			seconding_limit,
			minimum_backing_votes,
			per_session: HashMap::new(),
			per_relay_parent: HashMap::new(),
			confirmed: HashMap::new(),
			peers: HashMap::new(),
			pending_topologies: HashMap::new(),
		}
	}

	/// Register a session. `local_validator` is our index in it, if any.
	pub fn handle_new_session(
		&mut self,
		session: SessionIndex,
		session_info: SessionInfo,
		local_validator: Option<ValidatorIndex>,
	) {
		if self.per_session.contains_key(&session) {
			return
		}

		let groups =
			Groups::new(session_info.validator_groups.clone(), self.minimum_backing_votes);

		let mut per_session = PerSessionState {
			session_info,
			groups,
			local_validator,
			topology: None,
			grid_view: None,
		};

		if let Some(topology) = self.pending_topologies.remove(&session) {
			per_session.apply_topology(topology);
		}

		self.per_session.insert(session, per_session);
	}

	/// Start tracking statements at a relay-parent. The session must be known.
	pub fn activate_relay_parent(&mut self, relay_parent: Hash, session: SessionIndex) {
		if self.per_relay_parent.contains_key(&relay_parent) {
			return
		}

		let per_session = match self.per_session.get(&session) {
			None => {
				tracing::debug!(
					target: LOG_TARGET,
					?relay_parent,
					session,
					"No session info for relay-parent, ignoring",
				);
				return
			},
			Some(s) => s,
		};

		let local_validator = per_session.local_validator.map(|index| {
			let cluster_tracker = per_session
				.groups
				.by_validator_index(index)
				.and_then(|g| per_session.groups.get(g))
				.and_then(|g| ClusterTracker::new(g.to_vec(), self.seconding_limit));

			LocalValidatorState { index, cluster_tracker, grid_tracker: GridTracker::default() }
		});

		self.per_relay_parent.insert(
			relay_parent,
			PerRelayParentState {
				session,
				local_validator,
				statement_store: StatementStore::new(&per_session.groups),
			},
		);
	}

	/// Stop tracking a relay-parent, dropping all of its statements and sessions
	/// no longer referenced.
	pub fn deactivate_relay_parent(&mut self, relay_parent: &Hash) {
		if self.per_relay_parent.remove(relay_parent).is_none() {
			return
		}

		self.confirmed.retain(|_, c| &c.relay_parent != relay_parent);

		let live_sessions: HashSet<SessionIndex> =
			self.per_relay_parent.values().map(|s| s.session).collect();
		let latest_session = self.per_session.keys().max().copied();

		self.per_session
			.retain(|s, _| live_sessions.contains(s) || Some(*s) == latest_session);
	}

	/// Whether the relay-parent is tracked.
	pub fn is_active(&self, relay_parent: &Hash) -> bool {
		self.per_relay_parent.contains_key(relay_parent)
	}

	/// Handle an event from the network.
	pub fn handle_network_update(
		&mut self,
		update: NetworkBridgeEvent<StatementDistributionMessage>,
	) -> Vec<NetworkBridgeTxMessage> {
		match update {
			NetworkBridgeEvent::PeerConnected(peer_id, _role, protocol_version) => {
				let protocol_version = ValidationVersion::from_protocol_version(protocol_version);
				self.peers.insert(peer_id, PeerState { view: View::default(), protocol_version });
				Vec::new()
			},
			NetworkBridgeEvent::PeerDisconnected(peer_id) => {
				self.peers.remove(&peer_id);
				Vec::new()
			},
			NetworkBridgeEvent::NewGossipTopology(topology) => {
				match self.per_session.get_mut(&topology.session) {
					Some(per_session) => per_session.apply_topology(topology.topology),
					None => {
						self.pending_topologies.insert(topology.session, topology.topology);
					},
				}
				Vec::new()
			},
			NetworkBridgeEvent::PeerViewChange(peer_id, view) =>
				self.handle_peer_view_update(peer_id, view),
			NetworkBridgeEvent::PeerMessage(peer_id, message) => match message {
				StatementDistributionMessage::Statement(relay_parent, statement) =>
					self.handle_incoming_statement(peer_id, relay_parent, statement),
				StatementDistributionMessage::BackedCandidateManifest(manifest) =>
					self.handle_incoming_manifest(peer_id, manifest),
				StatementDistributionMessage::BackedCandidateKnown(ack) =>
					self.handle_incoming_acknowledgement(peer_id, ack),
			},
			NetworkBridgeEvent::OurViewChange(_) => Vec::new(),
		}
	}

	fn handle_peer_view_update(
		&mut self,
		peer_id: PeerId,
		view: View,
	) -> Vec<NetworkBridgeTxMessage> {
		let fresh: Vec<Hash> = match self.peers.get_mut(&peer_id) {
			None => return Vec::new(),
			Some(peer) => {
				let fresh = view.difference(&peer.view).copied().collect();
				peer.view = view;
				fresh
			},
		};

		let mut messages = Vec::new();
		for relay_parent in fresh {
			let validator = match self.validator_for_peer(&relay_parent, &peer_id) {
				None => continue,
				Some(v) => v,
			};

			messages.extend(self.send_pending_cluster_statements(relay_parent, validator));
			messages.extend(self.send_pending_grid_messages(relay_parent, validator));
		}

		messages
	}

	/// Distribute a statement signed by the local validator.
	pub fn share_local_statement(
		&mut self,
		relay_parent: Hash,
		statement: SignedStatement,
	) -> Vec<NetworkBridgeTxMessage> {
		let per_relay_parent = match self.per_relay_parent.get_mut(&relay_parent) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let per_session = match self.per_session.get(&per_relay_parent.session) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let local_validator = match per_relay_parent.local_validator.as_mut() {
			None => return Vec::new(),
			Some(l) => l,
		};

		if statement.validator_index() != local_validator.index {
			tracing::warn!(
				target: LOG_TARGET,
				validator_index = ?statement.validator_index(),
				"Asked to share a statement not signed by us",
			);
			return Vec::new()
		}

		let compact = *statement.payload();
		if !per_relay_parent.statement_store.insert(statement) {
			return Vec::new()
		}

		if let Some(cluster) = local_validator.cluster_tracker.as_mut() {
			cluster.note_issued(local_validator.index, compact);
		}

		if let Some(grid_view) = per_session.grid_view.as_ref() {
			local_validator.grid_tracker.learned_fresh_statement(
				&per_session.groups,
				grid_view,
				local_validator.index,
				&compact,
			);
		}

		let originator = local_validator.index;
		self.circulate_statement(relay_parent, originator, compact)
	}

	/// Note that a candidate has been backed at the relay-parent, advertising it
	/// along the grid.
	pub fn note_backed_candidate(
		&mut self,
		relay_parent: Hash,
		candidate_hash: CandidateHash,
		group_index: GroupIndex,
		para_id: ParaId,
		parent_head_data_hash: Hash,
	) -> Vec<NetworkBridgeTxMessage> {
		let per_relay_parent = match self.per_relay_parent.get_mut(&relay_parent) {
			None => return Vec::new(),
			Some(s) => s,
		};

		self.confirmed.insert(
			candidate_hash,
			ConfirmedCandidate { relay_parent, group_index, para_id, parent_head_data_hash },
		);

		let per_session = match self.per_session.get(&per_relay_parent.session) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let (local_validator, grid_view) =
			match (per_relay_parent.local_validator.as_mut(), per_session.grid_view.as_ref()) {
				(Some(l), Some(g)) => (l, g),
				_ => return Vec::new(),
			};

		let group_size = match per_session.groups.get(group_index) {
			None => return Vec::new(),
			Some(g) => g.len(),
		};

		let mut local_knowledge = StatementFilter::blank(group_size);
		per_relay_parent.statement_store.fill_statement_filter(
			group_index,
			candidate_hash,
			&mut local_knowledge,
		);

		let targets = local_validator.grid_tracker.add_backed_candidate(
			grid_view,
			candidate_hash,
			group_index,
			local_knowledge,
		);

		tracing::debug!(
			target: LOG_TARGET,
			?candidate_hash,
			?relay_parent,
			n_targets = targets.len(),
			"Advertising backed candidate along the grid",
		);

		let mut messages = Vec::new();
		for (validator, _) in targets {
			messages.extend(self.send_pending_grid_messages(relay_parent, validator));
		}

		messages
	}

	fn handle_incoming_statement(
		&mut self,
		peer: PeerId,
		relay_parent: Hash,
		statement: SignedStatement,
	) -> Vec<NetworkBridgeTxMessage> {
		let per_relay_parent = match self.per_relay_parent.get_mut(&relay_parent) {
			None => return vec![report(peer, COST_UNEXPECTED_STATEMENT_MISSING_KNOWLEDGE)],
			Some(s) => s,
		};

		let per_session = match self.per_session.get(&per_relay_parent.session) {
			None => return vec![report(peer, COST_UNEXPECTED_STATEMENT_MISSING_KNOWLEDGE)],
			Some(s) => s,
		};

		let local_validator = match per_relay_parent.local_validator.as_mut() {
			None => return vec![report(peer, COST_UNEXPECTED_STATEMENT)],
			Some(l) => l,
		};

		let sender = match per_session.topology.as_ref().and_then(|t| t.validator_for_peer(&peer)) {
			None => return vec![report(peer, COST_UNEXPECTED_STATEMENT)],
			Some(v) => v,
		};

		let originator = statement.validator_index();
		let compact = *statement.payload();

		let from_cluster = local_validator
			.cluster_tracker
			.as_ref()
			.map_or(false, |c| c.targets().contains(&sender));

		if from_cluster {
			let cluster = local_validator.cluster_tracker.as_ref();
			match cluster.map(|c| c.can_receive(sender, originator, compact)) {
				Some(Ok(ClusterAccept::Ok)) | Some(Ok(ClusterAccept::WithPrejudice)) => {},
				Some(Err(ClusterRejectIncoming::ExcessiveSeconded)) =>
					return vec![report(peer, COST_EXCESSIVE_SECONDED)],
				Some(Err(ClusterRejectIncoming::Duplicate)) =>
					return vec![report(peer, COST_DUPLICATE_STATEMENT)],
				Some(Err(_)) | None => return vec![report(peer, COST_UNEXPECTED_STATEMENT)],
			}
		} else {
			let providers = local_validator.grid_tracker.direct_statement_providers(
				&per_session.groups,
				originator,
				&compact,
			);

			match providers.into_iter().find(|(v, _)| *v == sender) {
				None => return vec![report(peer, COST_UNEXPECTED_STATEMENT)],
				Some((_, true)) => return vec![report(peer, COST_DUPLICATE_STATEMENT)],
				Some((_, false)) => {},
			}
		}

		let signing_context =
			SigningContext { session_index: per_relay_parent.session, parent_hash: relay_parent };
		let signature_valid = per_session
			.session_info
			.validators
			.get(originator.0 as usize)
			.map_or(false, |key| statement.check_signature(&signing_context, key));

		if !signature_valid {
			tracing::debug!(
				target: LOG_TARGET,
				?peer,
				?originator,
				"Statement with invalid signature",
			);
			return vec![report(peer, COST_INVALID_SIGNATURE)]
		}

		if from_cluster {
			if let Some(cluster) = local_validator.cluster_tracker.as_mut() {
				cluster.note_received(sender, originator, compact);
			}
		} else {
			local_validator.grid_tracker.sent_or_received_direct_statement(
				&per_session.groups,
				originator,
				sender,
				&compact,
				true,
			);
		}

		if !per_relay_parent.statement_store.insert(statement) {
			return vec![report(peer, BENEFIT_VALID_STATEMENT)]
		}

		if let Some(grid_view) = per_session.grid_view.as_ref() {
			local_validator.grid_tracker.learned_fresh_statement(
				&per_session.groups,
				grid_view,
				originator,
				&compact,
			);
		}

		let mut messages = vec![report(peer, BENEFIT_VALID_STATEMENT_FIRST)];
		messages.extend(self.circulate_statement(relay_parent, originator, compact));
		messages
	}

	fn handle_incoming_manifest(
		&mut self,
		peer: PeerId,
		manifest: BackedCandidateManifest,
	) -> Vec<NetworkBridgeTxMessage> {
		let relay_parent = manifest.relay_parent;
		let candidate_hash = manifest.candidate_hash;

		let sender = {
			let (per_relay_parent, per_session) = match self.relay_parent_state(&relay_parent) {
				None => return vec![report(peer, COST_UNEXPECTED_MANIFEST_MISSING_KNOWLEDGE)],
				Some(x) => x,
			};

			if per_relay_parent.local_validator.is_none() {
				return vec![report(peer, COST_UNEXPECTED_MANIFEST_MISSING_KNOWLEDGE)]
			}

			match per_session.topology.as_ref().and_then(|t| t.validator_for_peer(&peer)) {
				None => return vec![report(peer, COST_UNEXPECTED_MANIFEST_DISALLOWED)],
				Some(v) => v,
			}
		};

		let summary = ManifestSummary {
			claimed_parent_hash: manifest.parent_head_data_hash,
			claimed_group_index: manifest.group_index,
			statement_knowledge: manifest.statement_knowledge,
		};

		match self.import_manifest(relay_parent, candidate_hash, summary, ManifestKind::Full, sender)
		{
			Err(e) => {
				tracing::debug!(
					target: LOG_TARGET,
					?candidate_hash,
					?peer,
					error = ?e,
					"Rejected manifest",
				);
				vec![report(peer, manifest_import_cost(e))]
			},
			Ok(_) => self.send_pending_grid_messages(relay_parent, sender),
		}
	}

	fn handle_incoming_acknowledgement(
		&mut self,
		peer: PeerId,
		acknowledgement: BackedCandidateAcknowledgement,
	) -> Vec<NetworkBridgeTxMessage> {
		let candidate_hash = acknowledgement.candidate_hash;
		let (relay_parent, group_index, parent_head_data_hash) =
			match self.confirmed.get(&candidate_hash) {
				None =>
					return vec![report(peer, COST_UNEXPECTED_ACKNOWLEDGEMENT_UNKNOWN_CANDIDATE)],
				Some(c) => (c.relay_parent, c.group_index, c.parent_head_data_hash),
			};

		let sender = match self
			.relay_parent_state(&relay_parent)
			.and_then(|(_, s)| s.topology.as_ref())
			.and_then(|t| t.validator_for_peer(&peer))
		{
			None => return vec![report(peer, COST_UNEXPECTED_MANIFEST_DISALLOWED)],
			Some(v) => v,
		};

		let summary = ManifestSummary {
			claimed_parent_hash: parent_head_data_hash,
			claimed_group_index: group_index,
			statement_knowledge: acknowledgement.statement_knowledge,
		};

		match self.import_manifest(
			relay_parent,
			candidate_hash,
			summary,
			ManifestKind::Acknowledgement,
			sender,
		) {
			Err(e) => vec![report(peer, manifest_import_cost(e))],
			Ok(_) => self.send_pending_grid_messages(relay_parent, sender),
		}
	}

	fn import_manifest(
		&mut self,
		relay_parent: Hash,
		candidate_hash: CandidateHash,
		summary: ManifestSummary,
		kind: ManifestKind,
		sender: ValidatorIndex,
	) -> Result<bool, ManifestImportError> {
		let per_relay_parent = self
			.per_relay_parent
			.get_mut(&relay_parent)
			.ok_or(ManifestImportError::Disallowed)?;
		let per_session = self
			.per_session
			.get(&per_relay_parent.session)
			.ok_or(ManifestImportError::Disallowed)?;
		let grid_view = per_session.grid_view.as_ref().ok_or(ManifestImportError::Disallowed)?;
		let local_validator = per_relay_parent
			.local_validator
			.as_mut()
			.ok_or(ManifestImportError::Disallowed)?;

		local_validator.grid_tracker.import_manifest(
			grid_view,
			&per_session.groups,
			candidate_hash,
			self.seconding_limit,
			summary,
			kind,
			sender,
		)
	}

	// Send a statement we just learned to every cluster member and grid
	// counterparty which may receive it.
	fn circulate_statement(
		&mut self,
		relay_parent: Hash,
		originator: ValidatorIndex,
		statement: CompactStatement,
	) -> Vec<NetworkBridgeTxMessage> {
		let per_relay_parent = match self.per_relay_parent.get_mut(&relay_parent) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let per_session = match self.per_session.get(&per_relay_parent.session) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let local_validator = match per_relay_parent.local_validator.as_mut() {
			None => return Vec::new(),
			Some(l) => l,
		};

		let signed = match per_relay_parent.statement_store.validator_statement(originator, statement)
		{
			None => return Vec::new(),
			Some(s) => s.clone(),
		};

		let topology = match per_session.topology.as_ref() {
			None => return Vec::new(),
			Some(t) => t,
		};

		let mut recipients = Vec::new();

		if let Some(cluster) = local_validator.cluster_tracker.as_mut() {
			let targets: Vec<_> = cluster
				.targets()
				.iter()
				.copied()
				.filter(|v| *v != local_validator.index)
				.filter(|v| cluster.can_send(*v, originator, statement).is_ok())
				.collect();

			for target in targets {
				let peers = connected_peers_for(&self.peers, topology, target, &relay_parent);
				if peers.is_empty() {
					continue
				}

				cluster.note_sent(target, originator, statement);
				recipients.extend(peers);
			}
		}

		let grid_targets = local_validator.grid_tracker.direct_statement_targets(
			&per_session.groups,
			originator,
			&statement,
		);

		for target in grid_targets {
			if target == local_validator.index {
				continue
			}

			let peers = connected_peers_for(&self.peers, topology, target, &relay_parent);
			if peers.is_empty() {
				continue
			}

			local_validator.grid_tracker.sent_or_received_direct_statement(
				&per_session.groups,
				originator,
				target,
				&statement,
				false,
			);
			recipients.extend(peers);
		}

		if recipients.is_empty() {
			return Vec::new()
		}

		recipients.sort();
		recipients.dedup();

		vec![statement_message(recipients, relay_parent, signed)]
	}

	// Flush the cluster statements `target` is missing.
	fn send_pending_cluster_statements(
		&mut self,
		relay_parent: Hash,
		target: ValidatorIndex,
	) -> Vec<NetworkBridgeTxMessage> {
		let per_relay_parent = match self.per_relay_parent.get_mut(&relay_parent) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let per_session = match self.per_session.get(&per_relay_parent.session) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let (topology, local_validator) =
			match (per_session.topology.as_ref(), per_relay_parent.local_validator.as_mut()) {
				(Some(t), Some(l)) => (t, l),
				_ => return Vec::new(),
			};

		let cluster = match local_validator.cluster_tracker.as_mut() {
			None => return Vec::new(),
			Some(c) => c,
		};

		let peers = connected_peers_for(&self.peers, topology, target, &relay_parent);
		if peers.is_empty() {
			return Vec::new()
		}

		let mut messages = Vec::new();
		for (originator, statement) in cluster.pending_statements_for(target) {
			if cluster.can_send(target, originator, statement).is_err() {
				continue
			}

			let signed =
				match per_relay_parent.statement_store.validator_statement(originator, statement) {
					None => continue,
					Some(s) => s.clone(),
				};

			cluster.note_sent(target, originator, statement);
			messages.push(statement_message(peers.clone(), relay_parent, signed));
		}

		messages
	}

	// Flush the manifests and direct statements pending for `target` along the grid.
	fn send_pending_grid_messages(
		&mut self,
		relay_parent: Hash,
		target: ValidatorIndex,
	) -> Vec<NetworkBridgeTxMessage> {
		let per_relay_parent = match self.per_relay_parent.get_mut(&relay_parent) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let per_session = match self.per_session.get(&per_relay_parent.session) {
			None => return Vec::new(),
			Some(s) => s,
		};

		let (topology, local_validator) =
			match (per_session.topology.as_ref(), per_relay_parent.local_validator.as_mut()) {
				(Some(t), Some(l)) => (t, l),
				_ => return Vec::new(),
			};

		let peers = connected_peers_for(&self.peers, topology, target, &relay_parent);
		if peers.is_empty() {
			return Vec::new()
		}

		let mut messages = Vec::new();
		for (candidate_hash, kind) in local_validator.grid_tracker.pending_manifests_for(target) {
			let confirmed = match self.confirmed.get(&candidate_hash) {
				None => continue,
				Some(c) => c,
			};

			let group_size = match per_session.groups.get(confirmed.group_index) {
				None => continue,
				Some(g) => g.len(),
			};

			let mut local_knowledge = StatementFilter::blank(group_size);
			per_relay_parent.statement_store.fill_statement_filter(
				confirmed.group_index,
				candidate_hash,
				&mut local_knowledge,
			);

			let message = match kind {
				ManifestKind::Full =>
					StatementDistributionMessage::BackedCandidateManifest(BackedCandidateManifest {
						relay_parent,
						candidate_hash,
						group_index: confirmed.group_index,
						para_id: confirmed.para_id,
						parent_head_data_hash: confirmed.parent_head_data_hash,
						statement_knowledge: local_knowledge.clone(),
					}),
				ManifestKind::Acknowledgement =>
					StatementDistributionMessage::BackedCandidateKnown(
						BackedCandidateAcknowledgement {
							candidate_hash,
							statement_knowledge: local_knowledge.clone(),
						},
					),
			};

			local_validator.grid_tracker.manifest_sent_to(
				&per_session.groups,
				target,
				candidate_hash,
				local_knowledge,
			);
			messages.push(vstaging_message(peers.clone(), message));
		}

		for (originator, statement) in local_validator.grid_tracker.all_pending_statements_for(target)
		{
			let signed =
				match per_relay_parent.statement_store.validator_statement(originator, statement) {
					None => continue,
					Some(s) => s.clone(),
				};

			local_validator.grid_tracker.sent_or_received_direct_statement(
				&per_session.groups,
				originator,
				target,
				&statement,
				false,
			);
			messages.push(statement_message(peers.clone(), relay_parent, signed));
		}

		messages
	}

	fn relay_parent_state(
		&self,
		relay_parent: &Hash,
	) -> Option<(&PerRelayParentState, &PerSessionState)> {
		let per_relay_parent = self.per_relay_parent.get(relay_parent)?;
		let per_session = self.per_session.get(&per_relay_parent.session)?;
		Some((per_relay_parent, per_session))
	}

	fn validator_for_peer(&self, relay_parent: &Hash, peer: &PeerId) -> Option<ValidatorIndex> {
		self.relay_parent_state(relay_parent)
			.and_then(|(_, s)| s.topology.as_ref())
			.and_then(|t| t.validator_for_peer(peer))
	}
}

// Peers of the validator which speak the staging protocol and have the
// relay-parent in their view.
fn connected_peers_for(
	peers: &HashMap<PeerId, PeerState>,
	topology: &SessionGridTopology,
	validator: ValidatorIndex,
	relay_parent: &Hash,
) -> Vec<PeerId> {
	topology
		.peer_ids_for(validator)
		.into_iter()
		.flatten()
		.filter(|p| {
			peers.get(p).map_or(false, |state| {
				state.protocol_version == ValidationVersion::VStaging &&
					state.view.contains(relay_parent)
			})
		})
		.copied()
		.collect()
}

fn report(peer: PeerId, rep: Rep) -> NetworkBridgeTxMessage {
	NetworkBridgeTxMessage::ReportPeer(peer, rep.into())
}

fn vstaging_message(
	peers: Vec<PeerId>,
	message: StatementDistributionMessage,
) -> NetworkBridgeTxMessage {
	NetworkBridgeTxMessage::SendValidationMessage(
		peers,
		Versioned::VStaging(protocol_vstaging::ValidationProtocol::StatementDistribution(message)),
	)
}

fn statement_message(
	peers: Vec<PeerId>,
	relay_parent: Hash,
	statement: SignedStatement,
) -> NetworkBridgeTxMessage {
	vstaging_message(peers, StatementDistributionMessage::Statement(relay_parent, statement))
}
