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

use super::*;
use polkadot_node_network_protocol::{
	grid_topology::TopologyPeerInfo, NewGossipTopology, ObservedRole,
};
use polkadot_node_primitives::{
	approval::{
		ApprovalCheckError, AssignmentCert, AssignmentCertKind, VrfOutput, VrfProof, VrfSignature,
		RELAY_VRF_MODULO_CONTEXT,
	},
	keypair_from_seed, CandidateHash, Slot,
};
use assert_matches::assert_matches;
use rand::SeedableRng;

const N_VALIDATORS: usize = 9;

#[derive(Default)]
struct MockVoting {
	assignment_result: Option<AssignmentCheckResult>,
	approval_result: Option<ApprovalCheckResult>,
	assignments: Vec<(IndirectAssignmentCert, CandidateIndex)>,
	approvals: Vec<IndirectSignedApprovalVote>,
}

impl ApprovalVotingHandle for MockVoting {
	fn check_and_import_assignment(
		&mut self,
		assignment: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
	) -> AssignmentCheckResult {
		self.assignments.push((assignment, candidate_index));
		self.assignment_result.clone().unwrap_or(AssignmentCheckResult::Accepted)
	}

	fn check_and_import_approval(
		&mut self,
		approval: IndirectSignedApprovalVote,
	) -> ApprovalCheckResult {
		self.approvals.push(approval);
		self.approval_result.clone().unwrap_or(ApprovalCheckResult::Accepted)
	}
}

struct TestState {
	state: State,
	voting: MockVoting,
	rng: rand_chacha::ChaCha12Rng,
	peers: Vec<PeerId>,
}

impl TestState {
	fn new() -> Self {
		TestState {
			state: State::default(),
			voting: MockVoting::default(),
			rng: rand_chacha::ChaCha12Rng::seed_from_u64(12345),
			peers: (0..N_VALIDATORS).map(|_| PeerId::random()).collect(),
		}
	}

	fn network(
		&mut self,
		event: NetworkBridgeEvent<net_protocol::ApprovalDistributionMessage>,
	) -> Vec<NetworkBridgeTxMessage> {
		self.state.handle_network_msg(&mut self.voting, event, &mut self.rng)
	}

	fn new_blocks(&mut self, metas: Vec<BlockApprovalMeta>) -> Vec<NetworkBridgeTxMessage> {
		self.state.handle_new_blocks(&mut self.voting, metas, &mut self.rng)
	}

	// Our own validator index is 0. With an identity shuffling of 9 validators,
	// the X neighbors are validators 1 and 2, the Y neighbors 3 and 6.
	fn set_topology(&mut self) -> Vec<NetworkBridgeTxMessage> {
		let canonical_shuffling = self
			.peers
			.iter()
			.enumerate()
			.map(|(i, peer)| TopologyPeerInfo {
				peer_ids: vec![*peer],
				validator_index: ValidatorIndex(i as u32),
			})
			.collect();
		let topology = SessionGridTopology::new((0..N_VALIDATORS).collect(), canonical_shuffling);

		self.network(NetworkBridgeEvent::NewGossipTopology(NewGossipTopology {
			session: 0,
			topology,
			local_index: Some(ValidatorIndex(0)),
		}))
	}

	fn connect(&mut self, validator: usize, version: ValidationVersion, view: View) -> PeerId {
		let peer = self.peers[validator];
		let out = self.network(NetworkBridgeEvent::PeerConnected(
			peer,
			ObservedRole::Authority,
			version.into(),
		));
		assert!(out.is_empty());
		self.network(NetworkBridgeEvent::PeerViewChange(peer, view));
		peer
	}

	fn send_assignments(
		&mut self,
		peer: PeerId,
		assignments: Vec<(IndirectAssignmentCert, CandidateIndex)>,
	) -> Vec<NetworkBridgeTxMessage> {
		self.network(NetworkBridgeEvent::PeerMessage(
			peer,
			Versioned::V1(protocol_v1::ApprovalDistributionMessage::Assignments(assignments)),
		))
	}

	fn send_approvals(
		&mut self,
		peer: PeerId,
		approvals: Vec<IndirectSignedApprovalVote>,
	) -> Vec<NetworkBridgeTxMessage> {
		self.network(NetworkBridgeEvent::PeerMessage(
			peer,
			Versioned::V1(protocol_v1::ApprovalDistributionMessage::Approvals(approvals)),
		))
	}
}

fn view(heads: &[Hash]) -> View {
	View::new(heads.iter().copied(), 0)
}

fn block_meta(hash: Hash, number: BlockNumber, parent_hash: Hash, n_candidates: usize) -> BlockApprovalMeta {
	BlockApprovalMeta {
		hash,
		number,
		parent_hash,
		candidates: vec![CandidateHash(Hash::repeat_byte(0xCC)); n_candidates],
		slot: Slot(1),
		session: 0,
	}
}

fn fake_assignment_cert(block_hash: Hash, validator: ValidatorIndex) -> IndirectAssignmentCert {
	let keypair = keypair_from_seed([1; 32]).expect("valid seed");
	let ctx = schnorrkel::signing_context(RELAY_VRF_MODULO_CONTEXT);
	let msg = b"WhenParachains?";
	let (inout, proof, _) = keypair.vrf_sign(ctx.bytes(msg));
	let out = inout.to_output();

	IndirectAssignmentCert {
		block_hash,
		validator,
		cert: AssignmentCert {
			kind: AssignmentCertKind::RelayVRFModulo { sample: 1 },
			vrf: VrfSignature { output: VrfOutput(out), proof: VrfProof(proof) },
		},
	}
}

fn fake_approval(
	block_hash: Hash,
	candidate_index: CandidateIndex,
	validator: ValidatorIndex,
) -> IndirectSignedApprovalVote {
	IndirectSignedApprovalVote {
		block_hash,
		candidate_index,
		validator,
		signature: ValidatorSignature([0; 64]),
	}
}

fn report(peer: PeerId, rep: Rep) -> NetworkBridgeTxMessage {
	NetworkBridgeTxMessage::ReportPeer(peer, rep.into())
}

fn assignments_message(
	version: ValidationVersion,
	assignments: Vec<(IndirectAssignmentCert, CandidateIndex)>,
) -> VersionedValidationProtocol {
	approval_message(version, protocol_v1::ApprovalDistributionMessage::Assignments(assignments))
}

fn approvals_message(
	version: ValidationVersion,
	approvals: Vec<IndirectSignedApprovalVote>,
) -> VersionedValidationProtocol {
	approval_message(version, protocol_v1::ApprovalDistributionMessage::Approvals(approvals))
}

fn peer_set(peers: &[PeerId]) -> HashSet<PeerId> {
	peers.iter().copied().collect()
}

#[test]
fn assignment_from_grid_neighbor_is_routed_along_the_other_dimension() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	assert!(test.set_topology().is_empty());
	assert!(test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]).is_empty());

	let peer_x = test.connect(1, ValidationVersion::V1, view(&[hash_a]));
	let peer_y = test.connect(3, ValidationVersion::V1, view(&[hash_a]));
	let peer_other = test.connect(4, ValidationVersion::V1, view(&[hash_a]));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	let out = test.send_assignments(peer_x, vec![(cert.clone(), 0)]);

	assert_eq!(out.len(), 2);
	assert_eq!(out[0], report(peer_x, BENEFIT_VALID_MESSAGE_FIRST));
	assert_matches!(
		&out[1],
		NetworkBridgeTxMessage::SendValidationMessage(peers, msg) => {
			// The Y neighbor is required, the other validator is sampled at random.
			assert_eq!(peer_set(peers), peer_set(&[peer_y, peer_other]));
			assert_eq!(*msg, assignments_message(ValidationVersion::V1, vec![(cert.clone(), 0)]));
		}
	);
	assert_eq!(test.voting.assignments, vec![(cert.clone(), 0)]);

	// A peer without the block in view sends the same assignment.
	let peer_late = test.peers[5];
	test.network(NetworkBridgeEvent::PeerConnected(
		peer_late,
		ObservedRole::Authority,
		ValidationVersion::V1.into(),
	));
	let out = test.send_assignments(peer_late, vec![(cert, 0)]);
	assert_eq!(
		out,
		vec![
			report(peer_late, COST_UNEXPECTED_MESSAGE),
			report(peer_late, BENEFIT_VALID_MESSAGE),
		]
	);
	assert_eq!(test.voting.assignments.len(), 1);
}

#[test]
fn duplicate_assignment_is_punished() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	let out = test.send_assignments(peer, vec![(cert.clone(), 0)]);
	assert_eq!(out, vec![report(peer, BENEFIT_VALID_MESSAGE_FIRST)]);

	let out = test.send_assignments(peer, vec![(cert, 0)]);
	assert_eq!(out, vec![report(peer, COST_DUPLICATE_MESSAGE)]);
	assert_eq!(test.voting.assignments.len(), 1);
}

#[test]
fn import_approval_happy_path() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer_x = test.connect(1, ValidationVersion::V1, view(&[hash_a]));
	let peer_y1 = test.connect(3, ValidationVersion::V1, view(&[hash_a]));
	let peer_y2 = test.connect(6, ValidationVersion::V1, view(&[hash_a]));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	let out = test.send_assignments(peer_x, vec![(cert, 0)]);
	assert_eq!(out.len(), 2);
	assert_matches!(
		&out[1],
		NetworkBridgeTxMessage::SendValidationMessage(peers, _) => {
			assert_eq!(peer_set(peers), peer_set(&[peer_y1, peer_y2]));
		}
	);

	let approval = fake_approval(hash_a, 0, ValidatorIndex(1));
	let out = test.send_approvals(peer_x, vec![approval.clone()]);

	assert_eq!(out.len(), 2);
	assert_eq!(out[0], report(peer_x, BENEFIT_VALID_MESSAGE_FIRST));
	assert_matches!(
		&out[1],
		NetworkBridgeTxMessage::SendValidationMessage(peers, msg) => {
			assert_eq!(peer_set(peers), peer_set(&[peer_y1, peer_y2]));
			assert_eq!(*msg, approvals_message(ValidationVersion::V1, vec![approval.clone()]));
		}
	);
	assert_eq!(test.voting.approvals, vec![approval]);
}

#[test]
fn import_approval_bad() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));

	// An approval without a known assignment is not even checked.
	let approval = fake_approval(hash_a, 0, ValidatorIndex(1));
	let out = test.send_approvals(peer, vec![approval.clone()]);
	assert_eq!(out, vec![report(peer, COST_UNEXPECTED_MESSAGE)]);
	assert!(test.voting.approvals.is_empty());

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	let out = test.send_assignments(peer, vec![(cert, 0)]);
	assert_eq!(out, vec![report(peer, BENEFIT_VALID_MESSAGE_FIRST)]);

	test.voting.approval_result =
		Some(ApprovalCheckResult::Bad(ApprovalCheckError::InvalidSignature(ValidatorIndex(1))));
	let out = test.send_approvals(peer, vec![approval]);
	assert_eq!(out, vec![report(peer, COST_INVALID_MESSAGE)]);
	assert_eq!(test.voting.approvals.len(), 1);
	assert!(test.state.get_approval_signatures([(hash_a, 0)].into_iter().collect()).is_empty());
}

#[test]
fn assignment_too_far_in_the_future_is_not_circulated() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));
	test.connect(3, ValidationVersion::V1, view(&[hash_a]));

	test.voting.assignment_result = Some(AssignmentCheckResult::TooFarInFuture);
	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	let out = test.send_assignments(peer, vec![(cert, 0)]);
	assert_eq!(out, vec![report(peer, COST_ASSIGNMENT_TOO_FAR_IN_THE_FUTURE)]);
}

#[test]
fn messages_for_blocks_not_yet_imported_are_kept_pending() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.network(NetworkBridgeEvent::OurViewChange(view(&[hash_a])));

	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));
	let peer_y = test.connect(3, ValidationVersion::V1, view(&[hash_a]));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	let approval = fake_approval(hash_a, 0, ValidatorIndex(1));
	assert!(test.send_assignments(peer, vec![(cert.clone(), 0)]).is_empty());
	assert!(test.send_approvals(peer, vec![approval.clone()]).is_empty());
	assert!(test.voting.assignments.is_empty());

	let out = test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	assert_eq!(
		out,
		vec![
			report(peer, BENEFIT_VALID_MESSAGE_FIRST),
			NetworkBridgeTxMessage::SendValidationMessage(
				vec![peer_y],
				assignments_message(ValidationVersion::V1, vec![(cert, 0)]),
			),
			report(peer, BENEFIT_VALID_MESSAGE_FIRST),
			NetworkBridgeTxMessage::SendValidationMessage(
				vec![peer_y],
				approvals_message(ValidationVersion::V1, vec![approval]),
			),
		]
	);
	assert_eq!(test.voting.assignments.len(), 1);
	assert_eq!(test.voting.approvals.len(), 1);
}

#[test]
fn pending_messages_are_dropped_when_the_block_leaves_our_view() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.network(NetworkBridgeEvent::OurViewChange(view(&[hash_a])));
	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	assert!(test.send_assignments(peer, vec![(cert, 0)]).is_empty());

	test.network(NetworkBridgeEvent::OurViewChange(view(&[])));
	assert!(test.state.pending_known.is_empty());

	assert!(test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]).is_empty());
	assert!(test.voting.assignments.is_empty());
}

#[test]
fn peer_view_change_sends_messages_for_ancestry() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);
	let hash_b = Hash::repeat_byte(2);
	let hash_c = Hash::repeat_byte(3);

	test.set_topology();
	test.new_blocks(vec![
		block_meta(hash_a, 1, Hash::zero(), 1),
		block_meta(hash_b, 2, hash_a, 1),
	]);

	let cert_a = fake_assignment_cert(hash_a, ValidatorIndex(0));
	let cert_b = fake_assignment_cert(hash_b, ValidatorIndex(0));
	assert!(test.state.distribute_assignment(cert_a.clone(), 0, &mut test.rng).is_empty());
	assert!(test.state.distribute_assignment(cert_b.clone(), 0, &mut test.rng).is_empty());

	let peer = test.connect(1, ValidationVersion::V1, View::default());
	let out = test.network(NetworkBridgeEvent::PeerViewChange(peer, view(&[hash_b])));
	assert_eq!(
		out,
		vec![NetworkBridgeTxMessage::SendValidationMessage(
			vec![peer],
			assignments_message(ValidationVersion::V1, vec![(cert_b, 0), (cert_a, 0)]),
		)]
	);

	// The peer moves on to a block we don't know yet.
	let out = test.network(NetworkBridgeEvent::PeerViewChange(peer, view(&[hash_c])));
	assert!(out.is_empty());

	assert!(test.new_blocks(vec![block_meta(hash_c, 3, hash_b, 1)]).is_empty());
	let cert_c = fake_assignment_cert(hash_c, ValidatorIndex(0));
	let out = test.state.distribute_assignment(cert_c.clone(), 0, &mut test.rng);
	assert_eq!(
		out,
		vec![NetworkBridgeTxMessage::SendValidationMessage(
			vec![peer],
			assignments_message(ValidationVersion::V1, vec![(cert_c, 0)]),
		)]
	);

	// The peer finalized block 2: we forget what it knows about the blocks up to it.
	let out = test.network(NetworkBridgeEvent::PeerViewChange(peer, View::new([hash_c], 2)));
	assert!(out.is_empty());
	assert!(!test.state.blocks[&hash_a].known_by.contains_key(&peer));
	assert!(!test.state.blocks[&hash_b].known_by.contains_key(&peer));
	assert!(test.state.blocks[&hash_c].known_by.contains_key(&peer));
}

#[test]
fn new_topology_propagates_pending_messages() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer_x = test.connect(1, ValidationVersion::V1, view(&[hash_a]));
	let peer_y = test.connect(3, ValidationVersion::V1, view(&[hash_a]));
	test.connect(4, ValidationVersion::V1, view(&[hash_a]));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(0));
	let approval = fake_approval(hash_a, 0, ValidatorIndex(0));
	assert!(test.state.distribute_assignment(cert.clone(), 0, &mut test.rng).is_empty());
	assert!(test.state.distribute_approval(approval.clone()).is_empty());

	let out = test.set_topology();
	assert_eq!(out.len(), 4);

	let mut assignment_peers = HashSet::new();
	for message in &out[..2] {
		assert_matches!(
			message,
			NetworkBridgeTxMessage::SendValidationMessage(peers, msg) => {
				assert_eq!(*msg, assignments_message(ValidationVersion::V1, vec![(cert.clone(), 0)]));
				assignment_peers.extend(peers.iter().copied());
			}
		);
	}
	assert_eq!(assignment_peers, peer_set(&[peer_x, peer_y]));

	let mut approval_peers = HashSet::new();
	for message in &out[2..] {
		assert_matches!(
			message,
			NetworkBridgeTxMessage::SendValidationMessage(peers, msg) => {
				assert_eq!(*msg, approvals_message(ValidationVersion::V1, vec![approval.clone()]));
				approval_peers.extend(peers.iter().copied());
			}
		);
	}
	assert_eq!(approval_peers, peer_set(&[peer_x, peer_y]));
}

#[test]
fn messages_for_recently_finalized_blocks_are_not_punished() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);
	let hash_unknown = Hash::repeat_byte(9);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));

	test.state.handle_block_finalized(1);
	assert!(!test.state.knows_block(&hash_a));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(1));
	assert!(test.send_assignments(peer, vec![(cert, 0)]).is_empty());
	assert!(test.send_approvals(peer, vec![fake_approval(hash_a, 0, ValidatorIndex(1))]).is_empty());

	let cert = fake_assignment_cert(hash_unknown, ValidatorIndex(1));
	let out = test.send_assignments(peer, vec![(cert, 0)]);
	assert_eq!(out, vec![report(peer, COST_UNEXPECTED_MESSAGE)]);
	assert!(test.voting.assignments.is_empty());
}

#[test]
fn finalization_keeps_descendants() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);
	let hash_b = Hash::repeat_byte(2);

	test.new_blocks(vec![
		block_meta(hash_a, 1, Hash::zero(), 1),
		block_meta(hash_b, 2, hash_a, 1),
	]);

	test.state.handle_block_finalized(1);
	assert!(!test.state.knows_block(&hash_a));
	assert!(test.state.knows_block(&hash_b));
	assert!(test.state.recent_outdated_blocks.is_recent_outdated(&hash_a));
}

#[test]
fn get_approval_signatures_returns_known_votes() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 2)]);
	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));

	let local_cert = fake_assignment_cert(hash_a, ValidatorIndex(0));
	let mut local_approval = fake_approval(hash_a, 0, ValidatorIndex(0));
	local_approval.signature = ValidatorSignature([7; 64]);
	test.state.distribute_assignment(local_cert, 0, &mut test.rng);
	test.state.distribute_approval(local_approval);

	test.send_assignments(peer, vec![(fake_assignment_cert(hash_a, ValidatorIndex(1)), 0)]);
	test.send_approvals(peer, vec![fake_approval(hash_a, 0, ValidatorIndex(1))]);

	// An assignment without approval for the second candidate.
	test.send_assignments(peer, vec![(fake_assignment_cert(hash_a, ValidatorIndex(1)), 1)]);

	let signatures = test
		.state
		.get_approval_signatures([(hash_a, 0), (hash_a, 1), (hash_a, 5)].into_iter().collect());
	assert_eq!(signatures.len(), 2);
	assert_eq!(signatures[&ValidatorIndex(0)], ValidatorSignature([7; 64]));
	assert_eq!(signatures[&ValidatorIndex(1)], ValidatorSignature([0; 64]));
}

#[test]
fn assignments_are_sent_in_batches() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);
	let n_candidates = MAX_ASSIGNMENT_BATCH_SIZE + 1;

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), n_candidates)]);

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(0));
	for candidate_index in 0..n_candidates {
		let out =
			test.state.distribute_assignment(cert.clone(), candidate_index as _, &mut test.rng);
		assert!(out.is_empty());
	}

	let peer = test.connect(1, ValidationVersion::V1, View::default());
	let out = test.network(NetworkBridgeEvent::PeerViewChange(peer, view(&[hash_a])));
	assert_eq!(out.len(), 2);

	let batch_len = |message: &NetworkBridgeTxMessage| match message {
		NetworkBridgeTxMessage::SendValidationMessage(
			_,
			Versioned::V1(protocol_v1::ValidationProtocol::ApprovalDistribution(
				protocol_v1::ApprovalDistributionMessage::Assignments(assignments),
			)),
		) => assignments.len(),
		other => panic!("unexpected message {:?}", other),
	};
	assert_eq!(batch_len(&out[0]), MAX_ASSIGNMENT_BATCH_SIZE);
	assert_eq!(batch_len(&out[1]), 1);
}

#[test]
fn messages_are_wrapped_for_the_peer_version() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer_v1 = test.connect(1, ValidationVersion::V1, view(&[hash_a]));
	let peer_staging = test.connect(3, ValidationVersion::VStaging, view(&[hash_a]));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(0));
	let out = test.state.distribute_assignment(cert.clone(), 0, &mut test.rng);
	assert_eq!(
		out,
		vec![
			NetworkBridgeTxMessage::SendValidationMessage(
				vec![peer_v1],
				assignments_message(ValidationVersion::V1, vec![(cert.clone(), 0)]),
			),
			NetworkBridgeTxMessage::SendValidationMessage(
				vec![peer_staging],
				assignments_message(ValidationVersion::VStaging, vec![(cert, 0)]),
			),
		]
	);
}

#[test]
fn disconnected_peer_is_forgotten() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	let peer = test.connect(1, ValidationVersion::V1, view(&[hash_a]));
	assert!(test.state.blocks[&hash_a].known_by.contains_key(&peer));

	test.network(NetworkBridgeEvent::PeerDisconnected(peer));
	assert!(!test.state.blocks[&hash_a].known_by.contains_key(&peer));
	assert!(!test.state.peer_views.contains_key(&peer));

	let cert = fake_assignment_cert(hash_a, ValidatorIndex(0));
	assert!(test.state.distribute_assignment(cert, 0, &mut test.rng).is_empty());
}

#[test]
fn local_approval_requires_local_assignment() {
	let mut test = TestState::new();
	let hash_a = Hash::repeat_byte(1);

	test.set_topology();
	test.new_blocks(vec![block_meta(hash_a, 1, Hash::zero(), 1)]);
	test.connect(1, ValidationVersion::V1, view(&[hash_a]));

	let approval = fake_approval(hash_a, 0, ValidatorIndex(0));
	assert!(test.state.distribute_approval(approval).is_empty());
	assert!(test.state.get_approval_signatures([(hash_a, 0)].into_iter().collect()).is_empty());
}

#[test]
fn knowledge_only_grows() {
	let subject = MessageSubject(Hash::repeat_byte(1), 0, ValidatorIndex(1));
	let mut knowledge = Knowledge::default();

	assert!(!knowledge.contains(&subject, MessageKind::Assignment));
	assert!(knowledge.insert(subject.clone(), MessageKind::Assignment));
	assert!(!knowledge.contains(&subject, MessageKind::Approval));
	assert!(knowledge.insert(subject.clone(), MessageKind::Approval));
	assert!(!knowledge.insert(subject.clone(), MessageKind::Assignment));

	assert!(knowledge.contains(&subject, MessageKind::Assignment));
	assert!(knowledge.contains(&subject, MessageKind::Approval));
}

#[test]
fn recently_outdated_is_bounded() {
	let mut recent = RecentlyOutdated::default();
	for i in 0..21u8 {
		recent.note_outdated(Hash::repeat_byte(i));
	}

	assert!(!recent.is_recent_outdated(&Hash::repeat_byte(0)));
	assert!(recent.is_recent_outdated(&Hash::repeat_byte(1)));
	assert!(recent.is_recent_outdated(&Hash::repeat_byte(20)));
}
