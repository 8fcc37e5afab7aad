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

use super::*;
use crate::{
	config::APPROVAL_SESSIONS,
	criteria::{tests::garbage_vrf, InvalidAssignment, OurAssignment},
	import::tests::babe_header_and_epoch,
	interfaces::{BabeEpoch, CandidateEvent, ChainApiError, RuntimeApiError},
	keystore::LocalKeystore,
	time::tests::MockClock,
};
use polkadot_node_network_protocol::{
	grid_topology::{SessionGridTopology, TopologyPeerInfo},
	v1 as protocol_v1, NewGossipTopology, ObservedRole, PeerId, ReputationChange,
	ValidationVersion, Versioned, VersionedValidationProtocol, View,
};
use polkadot_node_primitives::{
	approval::{AssignmentCert, AssignmentCertKind},
	keypair_from_seed, AssignmentId, CandidateDescriptor, CompactStatement, CoreIndex, Header,
	ParaId, PersistedValidationData, PoV, SigningContext, ValidationCode,
};
use assert_matches::assert_matches;
use futures::{executor::block_on, future, task::Poll};
use parking_lot::Mutex;

const SLOT_DURATION_MILLIS: u64 = 6000;
const N_VALIDATORS: usize = 6;

pub(crate) fn garbage_assignment_cert(sample: u32) -> AssignmentCert {
	AssignmentCert { kind: AssignmentCertKind::RelayVRFModulo { sample }, vrf: garbage_vrf() }
}

/// Assignment criteria answering with fixed closures.
pub(crate) struct MockAssignmentCriteria<Compute, Check>(Compute, Check);

impl<Compute, Check> MockAssignmentCriteria<Compute, Check>
where
	Compute: Fn() -> HashMap<CoreIndex, OurAssignment>,
	Check: Fn() -> std::result::Result<DelayTranche, InvalidAssignment>,
{
	pub(crate) fn new(compute_assignments: Compute, check_assignment_cert: Check) -> Self {
		MockAssignmentCriteria(compute_assignments, check_assignment_cert)
	}
}

impl<Check> MockAssignmentCriteria<fn() -> HashMap<CoreIndex, OurAssignment>, Check>
where
	Check: Fn() -> std::result::Result<DelayTranche, InvalidAssignment>,
{
	pub(crate) fn check_only(check_assignment_cert: Check) -> Self {
		MockAssignmentCriteria(HashMap::new, check_assignment_cert)
	}
}

impl<Compute, Check> AssignmentCriteria for MockAssignmentCriteria<Compute, Check>
where
	Compute: Fn() -> HashMap<CoreIndex, OurAssignment> + Send + Sync,
	Check: Fn() -> std::result::Result<DelayTranche, InvalidAssignment> + Send + Sync,
{
	fn compute_assignments(
		&self,
		_keystore: &dyn Keystore,
		_relay_vrf_story: polkadot_node_primitives::approval::RelayVRFStory,
		_config: &criteria::Config,
		_leaving_cores: Vec<(CandidateHash, CoreIndex, GroupIndex)>,
	) -> HashMap<CoreIndex, OurAssignment> {
		(self.0)()
	}

	fn check_assignment_cert(
		&self,
		_claimed_core_index: CoreIndex,
		_validator_index: ValidatorIndex,
		_config: &criteria::Config,
		_relay_vrf_story: polkadot_node_primitives::approval::RelayVRFStory,
		_assignment: &AssignmentCert,
		_backing_group: GroupIndex,
	) -> std::result::Result<DelayTranche, InvalidAssignment> {
		(self.1)()
	}
}

#[derive(Default)]
struct MockRuntimeInner {
	session: SessionIndex,
	sessions: HashMap<SessionIndex, SessionInfo>,
	blocks: HashMap<Hash, (Vec<CandidateEvent>, BabeEpoch)>,
}

/// A runtime where every block is in the same session.
#[derive(Default)]
pub(crate) struct MockRuntime {
	inner: Mutex<MockRuntimeInner>,
}

impl MockRuntime {
	/// Make `session` the current session. The session and the ones in the approval window
	/// before it all use `info`.
	pub(crate) fn set_session(&self, session: SessionIndex, info: SessionInfo) {
		let mut inner = self.inner.lock();
		inner.session = session;
		for s in session.saturating_sub(APPROVAL_SESSIONS - 1)..=session {
			inner.sessions.insert(s, info.clone());
		}
	}

	pub(crate) fn insert_block(&self, hash: Hash, events: Vec<CandidateEvent>, epoch: BabeEpoch) {
		self.inner.lock().blocks.insert(hash, (events, epoch));
	}

	fn unknown_block(hash: Hash) -> RuntimeApiError {
		RuntimeApiError(format!("unknown block {:?}", hash))
	}
}

#[async_trait::async_trait]
impl RuntimeApi for MockRuntime {
	async fn session_index_for_child(
		&self,
		_block: Hash,
	) -> std::result::Result<SessionIndex, RuntimeApiError> {
		Ok(self.inner.lock().session)
	}

	async fn session_info(
		&self,
		_block: Hash,
		session: SessionIndex,
	) -> std::result::Result<Option<SessionInfo>, RuntimeApiError> {
		Ok(self.inner.lock().sessions.get(&session).cloned())
	}

	async fn candidate_events(
		&self,
		block: Hash,
	) -> std::result::Result<Vec<CandidateEvent>, RuntimeApiError> {
		self.inner
			.lock()
			.blocks
			.get(&block)
			.map(|(events, _)| events.clone())
			.ok_or_else(|| Self::unknown_block(block))
	}

	async fn babe_epoch(&self, block: Hash) -> std::result::Result<BabeEpoch, RuntimeApiError> {
		self.inner
			.lock()
			.blocks
			.get(&block)
			.map(|(_, epoch)| epoch.clone())
			.ok_or_else(|| Self::unknown_block(block))
	}

	async fn validation_code_by_hash(
		&self,
		_block: Hash,
		_code_hash: polkadot_node_primitives::ValidationCodeHash,
	) -> std::result::Result<Option<ValidationCode>, RuntimeApiError> {
		Ok(Some(ValidationCode(vec![1, 2, 3])))
	}
}

/// A block tree held in memory, remembering which blocks were reported approved.
#[derive(Default)]
pub(crate) struct MockChain {
	headers: Mutex<HashMap<Hash, Header>>,
	finalized: Mutex<HashMap<BlockNumber, Hash>>,
	approved: Mutex<Vec<Hash>>,
}

impl MockChain {
	pub(crate) fn insert_header(&self, header: Header) {
		self.headers.lock().insert(header.hash(), header);
	}

	/// Build and insert headers `from_number..=to_number` on top of `parent`, in ascending order.
	pub(crate) fn build_chain(
		&self,
		parent: Hash,
		from_number: BlockNumber,
		to_number: BlockNumber,
	) -> Vec<(Hash, Header)> {
		let mut parent_hash = parent;
		(from_number..=to_number)
			.map(|number| {
				let header = Header {
					parent_hash,
					number,
					state_root: Hash::zero(),
					babe_pre_digest: None,
					force_approve: None,
				};
				let hash = header.hash();
				parent_hash = hash;
				self.insert_header(header.clone());
				(hash, header)
			})
			.collect()
	}

	fn approved(&self) -> Vec<Hash> {
		self.approved.lock().clone()
	}
}

#[async_trait::async_trait]
impl ChainApi for MockChain {
	async fn block_header(&self, hash: Hash) -> std::result::Result<Option<Header>, ChainApiError> {
		Ok(self.headers.lock().get(&hash).cloned())
	}

	async fn finalized_block_hash(
		&self,
		number: BlockNumber,
	) -> std::result::Result<Option<Hash>, ChainApiError> {
		Ok(self.finalized.lock().get(&number).copied())
	}

	async fn ancestors(&self, hash: Hash, k: usize) -> std::result::Result<Vec<Hash>, ChainApiError> {
		let headers = self.headers.lock();
		let mut ancestors = Vec::with_capacity(k);
		let mut next = headers.get(&hash).map(|h| h.parent_hash);

		while let Some(parent) = next {
			if ancestors.len() >= k || !headers.contains_key(&parent) {
				break
			}
			ancestors.push(parent);
			next = headers.get(&parent).map(|h| h.parent_hash);
		}

		Ok(ancestors)
	}

	async fn best_leaf(&self) -> std::result::Result<Option<Hash>, ChainApiError> {
		Ok(self.headers.lock().iter().max_by_key(|(_, h)| h.number).map(|(hash, _)| *hash))
	}

	async fn approved_block(&self, hash: Hash) {
		self.approved.lock().push(hash);
	}
}

#[derive(Default)]
struct MockRecovery {
	unavailable: Mutex<HashSet<CandidateHash>>,
	requests: Mutex<Vec<(CandidateHash, Option<GroupIndex>)>>,
}

#[async_trait::async_trait]
impl AvailabilityRecovery for MockRecovery {
	async fn recover(
		&self,
		candidate: CandidateReceipt,
		_session: SessionIndex,
		backing_group: Option<GroupIndex>,
	) -> std::result::Result<AvailableData, RecoveryError> {
		let candidate_hash = candidate.hash();
		self.requests.lock().push((candidate_hash, backing_group));

		if self.unavailable.lock().contains(&candidate_hash) {
			return Err(RecoveryError::Unavailable)
		}

		Ok(AvailableData {
			pov: PoV { block_data: vec![42; 8] },
			validation_data: PersistedValidationData::default(),
		})
	}
}

#[derive(Default)]
struct MockPvf {
	invalid: Mutex<HashSet<CandidateHash>>,
	validated: Mutex<Vec<CandidateHash>>,
}

#[async_trait::async_trait]
impl Pvf for MockPvf {
	async fn validate(
		&self,
		_validation_data: PersistedValidationData,
		_pov: PoV,
		candidate: CandidateReceipt,
		_validation_code: ValidationCode,
	) -> ValidationResult {
		let candidate_hash = candidate.hash();
		self.validated.lock().push(candidate_hash);

		if self.invalid.lock().contains(&candidate_hash) {
			ValidationResult::Invalid("bad para block".into())
		} else {
			ValidationResult::Valid
		}
	}
}

#[derive(Default)]
struct MockNetwork {
	sent: Mutex<Vec<(Vec<PeerId>, VersionedValidationProtocol)>>,
	reports: Mutex<Vec<(PeerId, ReputationChange)>>,
}

impl NetworkBridge for MockNetwork {
	fn send_validation_message(&self, peers: Vec<PeerId>, message: VersionedValidationProtocol) {
		self.sent.lock().push((peers, message));
	}

	fn report_peer(&self, peer: PeerId, rep: ReputationChange) {
		self.reports.lock().push((peer, rep));
	}
}

fn validator_key(i: usize) -> schnorrkel::Keypair {
	keypair_from_seed([i as u8 + 100; 32]).expect("32 bytes are a valid mini secret key; qed")
}

// Validator `0` is us. Groups `0..3` and `3..6`.
fn session_info(needed_approvals: u32) -> SessionInfo {
	let keys: Vec<_> = (0..N_VALIDATORS).map(validator_key).collect();

	SessionInfo {
		validators: keys.iter().map(|k| ValidatorId::from(k.public)).collect(),
		assignment_keys: keys.iter().map(|k| AssignmentId::from(k.public)).collect(),
		validator_groups: vec![
			(0..3).map(ValidatorIndex).collect(),
			(3..N_VALIDATORS as u32).map(ValidatorIndex).collect(),
		],
		n_cores: 2,
		needed_approvals,
		zeroth_delay_tranche_width: 5,
		relay_vrf_modulo_samples: 3,
		n_delay_tranches: 50,
		no_show_slots: 2,
	}
}

fn make_candidate(para_id: u32, relay_parent: Hash) -> CandidateReceipt {
	CandidateReceipt {
		descriptor: CandidateDescriptor {
			para_id: ParaId(para_id),
			relay_parent,
			..Default::default()
		},
		commitments_hash: Hash::zero(),
	}
}

fn sign_approval_vote(
	validator: usize,
	block_hash: Hash,
	candidate_index: CandidateIndex,
	candidate_hash: CandidateHash,
	session: SessionIndex,
) -> IndirectSignedApprovalVote {
	let payload = ApprovalVote(candidate_hash).signing_payload(session);

	IndirectSignedApprovalVote {
		block_hash,
		candidate_index,
		validator: ValidatorIndex(validator as u32),
		signature: ValidatorSignature::sign(&validator_key(validator), &payload),
	}
}

fn indirect_cert(block_hash: Hash, validator: u32) -> IndirectAssignmentCert {
	IndirectAssignmentCert {
		block_hash,
		validator: ValidatorIndex(validator),
		cert: garbage_assignment_cert(0),
	}
}

// Returns `Pending` once, letting the subsystem handle everything that is ready.
async fn yield_now() {
	let mut yielded = false;
	future::poll_fn(move |cx| {
		if yielded {
			Poll::Ready(())
		} else {
			yielded = true;
			cx.waker().wake_by_ref();
			Poll::Pending
		}
	})
	.await
}

const SESSION: SessionIndex = 1;

struct TestHarness {
	tx: mpsc::Sender<ApprovalVotingMessage>,
	clock: MockClock,
	runtime: Arc<MockRuntime>,
	chain: Arc<MockChain>,
	recovery: Arc<MockRecovery>,
	pvf: Arc<MockPvf>,
	network: Arc<MockNetwork>,
}

impl TestHarness {
	async fn send(&mut self, msg: ApprovalVotingMessage) {
		self.tx.send(msg).await.expect("subsystem is running");
		yield_now().await;
	}

	async fn set_tick(&mut self, tick: Tick) {
		self.clock.inner.lock().set_tick(tick);
		yield_now().await;
	}

	// Import a block with the given candidates at `Slot(number)`. All candidates are
	// included on consecutive cores, backed by group 1.
	async fn import_block(
		&mut self,
		parent_hash: Hash,
		number: BlockNumber,
		candidates: &[CandidateReceipt],
	) -> Hash {
		let (header, epoch, _) = babe_header_and_epoch(parent_hash, number, Slot(number as u64));
		let hash = header.hash();

		let events = candidates
			.iter()
			.enumerate()
			.map(|(i, c)| CandidateEvent::CandidateIncluded(c.clone(), CoreIndex(i as u32), GroupIndex(1)))
			.collect();

		self.runtime.insert_block(hash, events, epoch);
		self.chain.insert_header(header);
		self.send(ApprovalVotingMessage::ActiveLeaf(hash)).await;

		hash
	}

	async fn approved_ancestor(
		&mut self,
		target: Hash,
		lower_bound: BlockNumber,
	) -> Option<HighestApprovedAncestorBlock> {
		let (tx, rx) = oneshot::channel();
		self.send(ApprovalVotingMessage::ApprovedAncestor(target, lower_bound, tx)).await;
		rx.await.expect("subsystem answers")
	}

	async fn import_assignment(
		&mut self,
		cert: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
	) -> AssignmentCheckResult {
		let (tx, rx) = oneshot::channel();
		self.send(ApprovalVotingMessage::CheckAndImportAssignment(cert, candidate_index, tx))
			.await;
		rx.await.expect("subsystem answers")
	}

	async fn import_approval(&mut self, vote: IndirectSignedApprovalVote) -> ApprovalCheckResult {
		let (tx, rx) = oneshot::channel();
		self.send(ApprovalVotingMessage::CheckAndImportApproval(vote, tx)).await;
		rx.await.expect("subsystem answers")
	}

	async fn approval_signatures(
		&mut self,
		candidate_hash: CandidateHash,
	) -> HashMap<ValidatorIndex, ValidatorSignature> {
		let (tx, rx) = oneshot::channel();
		self.send(ApprovalVotingMessage::GetApprovalSignaturesForCandidate(candidate_hash, tx))
			.await;
		rx.await.expect("subsystem answers")
	}
}

fn test_harness<T: Future<Output = TestHarness>>(
	needed_approvals: u32,
	assignment_criteria: Arc<dyn AssignmentCriteria>,
	test: impl FnOnce(TestHarness) -> T,
) {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();

	let keystore = LocalKeystore::in_memory();
	keystore.insert(validator_key(0));

	let runtime = Arc::new(MockRuntime::default());
	runtime.set_session(SESSION, session_info(needed_approvals));

	// the first block is authored in slot 1, so its tick is 12.
	let clock = MockClock::new(12);
	let chain = Arc::new(MockChain::default());
	let recovery = Arc::new(MockRecovery::default());
	let pvf = Arc::new(MockPvf::default());
	let network = Arc::new(MockNetwork::default());

	let collaborators = Collaborators {
		runtime: runtime.clone(),
		chain: chain.clone(),
		recovery: recovery.clone(),
		pvf: pvf.clone(),
		network: network.clone(),
	};

	let (tx, rx) = mpsc::channel(64);

	let subsystem = ApprovalVotingSubsystem::new(
		Config { slot_duration_millis: SLOT_DURATION_MILLIS },
		Arc::new(keystore),
		collaborators,
		Metrics::default(),
		Default::default(),
	)
	.with_assignment_criteria(assignment_criteria)
	.with_clock(Arc::new(clock.clone()));

	let harness = TestHarness { tx, clock, runtime, chain, recovery, pvf, network };

	let test_fut = async move {
		let mut harness = test(harness).await;
		harness.send(ApprovalVotingMessage::Conclude).await;
	};

	let (result, ()) = block_on(future::join(subsystem.run(rx), test_fut));
	assert_matches!(result, Ok(()));
}

// Our assignment is in tranche 0 for core 0.
fn our_tranche_zero_assignment() -> Arc<dyn AssignmentCriteria> {
	our_assignment_in_tranche(0)
}

fn our_assignment_in_tranche(tranche: DelayTranche) -> Arc<dyn AssignmentCriteria> {
	Arc::new(MockAssignmentCriteria::new(
		move || {
			let mut assignments = HashMap::new();
			assignments.insert(
				CoreIndex(0),
				OurAssignment::new(garbage_assignment_cert(0), tranche, ValidatorIndex(0), false),
			);
			assignments
		},
		|| Ok(0),
	))
}

fn no_assignments() -> Arc<dyn AssignmentCriteria> {
	Arc::new(MockAssignmentCriteria::check_only(|| Ok(0)))
}

#[test]
fn min_prefer_some_prefers_some() {
	assert_eq!(min_prefer_some(Some(5), None), Some(5));
	assert_eq!(min_prefer_some(None, Some(7)), Some(7));
	assert_eq!(min_prefer_some(Some(5), Some(3)), Some(3));
	assert_eq!(min_prefer_some::<u64>(None, None), None);
}

// A state with one block at slot 0 holding one candidate, on which we have an
// untriggered tranche 0 assignment.
fn state_with_our_assignment() -> (State, Hash, CandidateHash) {
	let mut state = crate::import::tests::single_session_state(SESSION, session_info(1));
	let keystore = LocalKeystore::in_memory();
	keystore.insert(validator_key(0));
	state.keystore = Arc::new(keystore);

	let parent_hash = Hash::repeat_byte(0);
	let block_hash = Hash::repeat_byte(1);
	let candidate = make_candidate(1, parent_hash);
	let candidate_hash = candidate.hash();

	state.db.write_block_entry(BlockEntry {
		block_hash,
		parent_hash,
		block_number: 1,
		session: SESSION,
		slot: Slot(0),
		relay_vrf_story: polkadot_node_primitives::approval::RelayVRFStory([0u8; 32]),
		candidates: vec![(CoreIndex(0), candidate_hash)],
		approved_bitfield: bitvec::bitvec![u8, bitvec::order::Lsb0; 0; 1],
		children: Vec::new(),
	});

	let mut candidate_entry = CandidateEntry::new(candidate, SESSION, N_VALIDATORS);
	candidate_entry.add_approval_entry(
		block_hash,
		ApprovalEntry::fresh(
			GroupIndex(1),
			Some(OurAssignment::new(garbage_assignment_cert(0), 0, ValidatorIndex(0), false)),
			N_VALIDATORS,
		),
	);
	state.db.write_candidate_entry(candidate_entry);

	(state, block_hash, candidate_hash)
}

#[test]
fn triggered_assignment_is_stored() {
	let (mut state, block_hash, candidate_hash) = state_with_our_assignment();

	let wakeups = Wakeups::default();
	let actions = process_wakeup(&mut state, &wakeups, block_hash, candidate_hash);
	assert!(actions.iter().any(|a| matches!(a, Action::LaunchApproval { .. })));

	let approval_entry = state
		.db
		.load_candidate_entry(&candidate_hash)
		.and_then(|c| c.approval_entry(&block_hash))
		.cloned()
		.unwrap();
	assert!(approval_entry.our_assignment().unwrap().triggered());
	assert_eq!(approval_entry.tranches()[0].tranche(), 0);
	assert_eq!(approval_entry.tranches()[0].assignments(), &[(ValidatorIndex(0), 0)]);

	// a second wakeup doesn't trigger the assignment again.
	let actions = process_wakeup(&mut state, &wakeups, block_hash, candidate_hash);
	assert!(!actions.iter().any(|a| matches!(a, Action::LaunchApproval { .. })));
}

#[test]
fn approval_is_issued_once() {
	let (mut state, block_hash, candidate_hash) = state_with_our_assignment();
	let wakeups = Wakeups::default();
	let _ = process_wakeup(&mut state, &wakeups, block_hash, candidate_hash);

	let request = ApprovalVoteRequest { validator_index: ValidatorIndex(0), block_hash };
	let (_, vote) = issue_approval(&mut state, &wakeups, candidate_hash, request);
	assert_matches!(vote, Some(vote) => {
		assert_eq!(vote.validator, ValidatorIndex(0));
		assert_eq!(vote.candidate_index, 0);
	});

	let stored_sig = state
		.db
		.load_candidate_entry(&candidate_hash)
		.and_then(|c| c.approval_entry(&block_hash))
		.and_then(|e| e.our_approval_sig().cloned());
	assert!(stored_sig.is_some());

	let (actions, vote) = issue_approval(&mut state, &wakeups, candidate_hash, request);
	assert!(vote.is_none());
	assert!(actions.is_empty());
}

#[test]
fn local_check_approves_block_after_delay() {
	test_harness(1, our_tranche_zero_assignment(), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let candidate_hash = candidate.hash();
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		// the wakeup for tranche 0 fires immediately, and the check succeeds.
		assert_eq!(harness.recovery.requests.lock().clone(), vec![(candidate_hash, Some(GroupIndex(1)))]);
		assert_eq!(harness.pvf.validated.lock().clone(), vec![candidate_hash]);

		let signatures = harness.approval_signatures(candidate_hash).await;
		assert_eq!(signatures.len(), 1);
		let payload = ApprovalVote(candidate_hash).signing_payload(SESSION);
		assert!(signatures[&ValidatorIndex(0)]
			.verify(&payload, &ValidatorId::from(validator_key(0).public)));

		// our own assignment is too recent for the approval to count yet.
		assert!(harness.chain.approved().is_empty());
		assert_eq!(harness.approved_ancestor(block_hash, 0).await, None);

		harness.set_tick(12 + APPROVAL_DELAY).await;

		assert_eq!(harness.chain.approved(), vec![block_hash]);
		assert_eq!(
			harness.approved_ancestor(block_hash, 0).await,
			Some(HighestApprovedAncestorBlock { hash: block_hash, number: 1 }),
		);

		harness
	});
}

#[test]
fn invalid_candidate_is_not_approved() {
	test_harness(1, our_tranche_zero_assignment(), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let candidate_hash = candidate.hash();
		harness.pvf.invalid.lock().insert(candidate_hash);

		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;
		assert_eq!(harness.pvf.validated.lock().clone(), vec![candidate_hash]);

		harness.set_tick(30).await;

		assert!(harness.approval_signatures(candidate_hash).await.is_empty());
		assert!(harness.chain.approved().is_empty());
		assert_eq!(harness.approved_ancestor(block_hash, 0).await, None);

		harness
	});
}

#[test]
fn unavailable_candidate_is_not_validated() {
	test_harness(1, our_tranche_zero_assignment(), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let candidate_hash = candidate.hash();
		harness.recovery.unavailable.lock().insert(candidate_hash);

		harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		assert_eq!(harness.recovery.requests.lock().len(), 1);
		assert!(harness.pvf.validated.lock().is_empty());
		assert!(harness.approval_signatures(candidate_hash).await.is_empty());

		harness
	});
}

#[test]
fn remote_approvals_approve_block() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let candidate_hash = candidate.hash();
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		for v in [1, 2] {
			assert_eq!(
				harness.import_assignment(indirect_cert(block_hash, v), 0).await,
				AssignmentCheckResult::Accepted,
			);
		}

		assert_eq!(
			harness.import_assignment(indirect_cert(block_hash, 1), 0).await,
			AssignmentCheckResult::AcceptedDuplicate,
		);

		for v in [1, 2] {
			let vote = sign_approval_vote(v, block_hash, 0, candidate_hash, SESSION);
			assert_eq!(harness.import_approval(vote).await, ApprovalCheckResult::Accepted);
		}

		// duplicates are accepted without effect.
		let vote = sign_approval_vote(1, block_hash, 0, candidate_hash, SESSION);
		assert_eq!(harness.import_approval(vote).await, ApprovalCheckResult::Accepted);

		assert!(harness.chain.approved().is_empty());
		harness.set_tick(12 + APPROVAL_DELAY).await;
		assert_eq!(harness.chain.approved(), vec![block_hash]);

		// we never had an assignment of our own.
		assert!(harness.recovery.requests.lock().is_empty());

		harness
	});
}

#[test]
fn bad_approvals_are_rejected() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let candidate_hash = candidate.hash();
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		// no assignment yet.
		let vote = sign_approval_vote(1, block_hash, 0, candidate_hash, SESSION);
		assert_eq!(
			harness.import_approval(vote).await,
			ApprovalCheckResult::Bad(ApprovalCheckError::NoAssignment(ValidatorIndex(1))),
		);

		let unknown = Hash::repeat_byte(0xff);
		let vote = sign_approval_vote(1, unknown, 0, candidate_hash, SESSION);
		assert_eq!(
			harness.import_approval(vote).await,
			ApprovalCheckResult::Bad(ApprovalCheckError::UnknownBlock(unknown)),
		);

		let vote = sign_approval_vote(1, block_hash, 1, candidate_hash, SESSION);
		assert_eq!(
			harness.import_approval(vote).await,
			ApprovalCheckResult::Bad(ApprovalCheckError::InvalidCandidateIndex(1)),
		);

		let mut vote = sign_approval_vote(1, block_hash, 0, candidate_hash, SESSION);
		vote.validator = ValidatorIndex(N_VALIDATORS as u32);
		assert_eq!(
			harness.import_approval(vote).await,
			ApprovalCheckResult::Bad(ApprovalCheckError::InvalidValidatorIndex(ValidatorIndex(
				N_VALIDATORS as u32
			))),
		);

		// signed by validator 2, claimed for validator 1.
		let mut vote = sign_approval_vote(2, block_hash, 0, candidate_hash, SESSION);
		vote.validator = ValidatorIndex(1);
		assert_eq!(
			harness.import_approval(vote).await,
			ApprovalCheckResult::Bad(ApprovalCheckError::InvalidSignature(ValidatorIndex(1))),
		);

		// signed for a different session.
		let vote = sign_approval_vote(1, block_hash, 0, candidate_hash, SESSION + 1);
		assert_eq!(
			harness.import_approval(vote).await,
			ApprovalCheckResult::Bad(ApprovalCheckError::InvalidSignature(ValidatorIndex(1))),
		);

		harness
	});
}

#[test]
fn bad_assignments_are_rejected() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		let unknown = Hash::repeat_byte(0xff);
		assert_eq!(
			harness.import_assignment(indirect_cert(unknown, 1), 0).await,
			AssignmentCheckResult::Bad(AssignmentCheckError::UnknownBlock(unknown)),
		);

		assert_eq!(
			harness.import_assignment(indirect_cert(block_hash, 1), 1).await,
			AssignmentCheckResult::Bad(AssignmentCheckError::InvalidCandidateIndex(1)),
		);

		harness
	});
}

#[test]
fn invalid_certs_are_rejected() {
	let criteria = Arc::new(MockAssignmentCriteria::check_only(|| {
		Err(InvalidAssignment::InvalidAssignmentKey)
	}));

	test_harness(2, criteria, |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		assert_matches!(
			harness.import_assignment(indirect_cert(block_hash, 1), 0).await,
			AssignmentCheckResult::Bad(AssignmentCheckError::InvalidCert(ValidatorIndex(1), _))
		);

		harness
	});
}

#[test]
fn assignments_too_far_in_the_future_are_deferred() {
	let criteria = Arc::new(MockAssignmentCriteria::check_only(|| Ok(TICK_TOO_FAR_IN_FUTURE as u32)));

	test_harness(2, criteria, |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		assert_eq!(
			harness.import_assignment(indirect_cert(block_hash, 1), 0).await,
			AssignmentCheckResult::TooFarInFuture,
		);

		// once the clock catches up, the same assignment is fine.
		harness.set_tick(13).await;
		assert_eq!(
			harness.import_assignment(indirect_cert(block_hash, 1), 0).await,
			AssignmentCheckResult::Accepted,
		);

		harness
	});
}

#[test]
fn no_show_triggers_our_later_assignment() {
	test_harness(1, our_assignment_in_tranche(1), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		// validator 1 covers the only needed approval in tranche 0.
		assert_eq!(
			harness.import_assignment(indirect_cert(block_hash, 1), 0).await,
			AssignmentCheckResult::Accepted,
		);

		// it becomes a no-show after 2 slots, at tick 36.
		for tick in 13..36 {
			harness.set_tick(tick).await;
		}
		assert!(harness.recovery.requests.lock().is_empty());

		for tick in 36..48 {
			harness.set_tick(tick).await;
		}
		assert_eq!(harness.recovery.requests.lock().len(), 1);

		harness
	});
}

#[test]
fn blocks_without_candidates_are_approved_on_import() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let hash_a = harness.import_block(Hash::repeat_byte(0), 1, &[]).await;
		let hash_b = harness.import_block(hash_a, 2, &[]).await;
		let candidate = make_candidate(1, hash_b);
		let hash_c = harness.import_block(hash_b, 3, &[candidate]).await;

		assert_eq!(harness.chain.approved(), vec![hash_a, hash_b]);

		assert_eq!(
			harness.approved_ancestor(hash_c, 0).await,
			Some(HighestApprovedAncestorBlock { hash: hash_b, number: 2 }),
		);
		assert_eq!(
			harness.approved_ancestor(hash_c, 1).await,
			Some(HighestApprovedAncestorBlock { hash: hash_b, number: 2 }),
		);
		assert_eq!(harness.approved_ancestor(hash_c, 2).await, None);
		assert_eq!(harness.approved_ancestor(hash_c, 3).await, None);
		assert_eq!(harness.approved_ancestor(Hash::repeat_byte(0xff), 0).await, None);

		harness
	});
}

#[test]
fn importing_a_head_twice_is_a_noop() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let hash_a = harness.import_block(Hash::repeat_byte(0), 1, &[]).await;
		harness.send(ApprovalVotingMessage::ActiveLeaf(hash_a)).await;

		assert_eq!(harness.chain.approved(), vec![hash_a]);

		harness
	});
}

#[test]
fn finalization_prunes_blocks() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let candidate_a = make_candidate(1, Hash::repeat_byte(0));
		let candidate_b = make_candidate(2, Hash::repeat_byte(0));
		let hash_a = harness.import_block(Hash::repeat_byte(0), 1, &[candidate_a.clone()]).await;
		let hash_b = harness.import_block(hash_a, 2, &[candidate_b]).await;

		let vote = sign_approval_vote(1, hash_a, 0, candidate_a.hash(), SESSION);
		assert_eq!(
			harness.import_assignment(indirect_cert(hash_a, 1), 0).await,
			AssignmentCheckResult::Accepted,
		);
		assert_eq!(harness.import_approval(vote).await, ApprovalCheckResult::Accepted);

		harness.send(ApprovalVotingMessage::BlockFinalized(hash_a, 1)).await;

		assert_eq!(
			harness.import_assignment(indirect_cert(hash_a, 2), 0).await,
			AssignmentCheckResult::Bad(AssignmentCheckError::UnknownBlock(hash_a)),
		);
		assert!(harness.approval_signatures(candidate_a.hash()).await.is_empty());

		assert_eq!(
			harness.import_assignment(indirect_cert(hash_b, 2), 0).await,
			AssignmentCheckResult::Accepted,
		);

		harness
	});
}

#[test]
fn assignments_from_peers_are_imported() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;

		let peer = PeerId::random();
		harness
			.send(ApprovalVotingMessage::NetworkBridgeUpdate(NetworkBridgeEvent::PeerConnected(
				peer,
				ObservedRole::Authority,
				ValidationVersion::V1.into(),
			)))
			.await;
		harness
			.send(ApprovalVotingMessage::NetworkBridgeUpdate(NetworkBridgeEvent::PeerViewChange(
				peer,
				View::new([block_hash], 0),
			)))
			.await;
		harness
			.send(ApprovalVotingMessage::NetworkBridgeUpdate(NetworkBridgeEvent::PeerMessage(
				peer,
				Versioned::V1(protocol_v1::ApprovalDistributionMessage::Assignments(vec![(
					indirect_cert(block_hash, 1),
					0,
				)])),
			)))
			.await;

		assert!(harness
			.network
			.reports
			.lock()
			.iter()
			.any(|(reported, rep)| *reported == peer && rep.value > 0));

		assert_eq!(
			harness.import_assignment(indirect_cert(block_hash, 1), 0).await,
			AssignmentCheckResult::AcceptedDuplicate,
		);

		harness
	});
}

// Our cluster is group 0: validators 0, 1 and 2.
fn seconded_by(validator: usize, relay_parent: Hash) -> SignedStatement {
	SignedStatement::sign(
		&validator_key(validator),
		CompactStatement::Seconded(CandidateHash(Hash::repeat_byte(0xcc))),
		&SigningContext { session_index: SESSION, parent_hash: relay_parent },
		ValidatorIndex(validator as u32),
	)
}

fn missing_knowledge_reported(harness: &TestHarness, peer: PeerId) -> bool {
	harness
		.network
		.reports
		.lock()
		.iter()
		.any(|(reported, rep)| {
			*reported == peer && rep.value < 0 && rep.reason.contains("missing knowledge")
		})
}

#[test]
fn statements_are_tracked_from_import_until_finalization() {
	test_harness(2, no_assignments(), |mut harness| async move {
		let peers: Vec<PeerId> = (0..N_VALIDATORS).map(|_| PeerId::random()).collect();
		let topology = SessionGridTopology::new(
			(0..N_VALIDATORS).collect(),
			peers
				.iter()
				.enumerate()
				.map(|(i, p)| TopologyPeerInfo {
					peer_ids: vec![*p],
					validator_index: ValidatorIndex(i as u32),
				})
				.collect(),
		);
		harness
			.send(ApprovalVotingMessage::StatementDistributionUpdate(
				NetworkBridgeEvent::NewGossipTopology(NewGossipTopology {
					session: SESSION,
					topology,
					local_index: Some(ValidatorIndex(0)),
				}),
			))
			.await;
		for peer in &peers[1..3] {
			harness
				.send(ApprovalVotingMessage::StatementDistributionUpdate(
					NetworkBridgeEvent::PeerConnected(
						*peer,
						ObservedRole::Authority,
						ValidationVersion::VStaging.into(),
					),
				))
				.await;
		}

		// nothing is known before the block is imported.
		let unknown = Hash::repeat_byte(0xee);
		harness
			.send(ApprovalVotingMessage::StatementDistributionUpdate(
				NetworkBridgeEvent::PeerMessage(
					peers[1],
					vstaging::StatementDistributionMessage::Statement(
						unknown,
						seconded_by(1, unknown),
					),
				),
			))
			.await;
		assert!(missing_knowledge_reported(&harness, peers[1]));

		let candidate = make_candidate(1, Hash::repeat_byte(0));
		let block_hash = harness.import_block(Hash::repeat_byte(0), 1, &[candidate]).await;
		for peer in &peers[1..3] {
			harness
				.send(ApprovalVotingMessage::StatementDistributionUpdate(
					NetworkBridgeEvent::PeerViewChange(*peer, View::new([block_hash], 0)),
				))
				.await;
		}

		let statement = seconded_by(1, block_hash);
		harness
			.send(ApprovalVotingMessage::StatementDistributionUpdate(
				NetworkBridgeEvent::PeerMessage(
					peers[1],
					vstaging::StatementDistributionMessage::Statement(
						block_hash,
						statement.clone(),
					),
				),
			))
			.await;

		assert!(harness
			.network
			.reports
			.lock()
			.iter()
			.any(|(reported, rep)| *reported == peers[1] && rep.value > 0));
		assert!(harness.network.sent.lock().iter().any(|(to, message)| {
			to == &vec![peers[2]] &&
				matches!(
					message,
					Versioned::VStaging(vstaging::ValidationProtocol::StatementDistribution(
						vstaging::StatementDistributionMessage::Statement(rp, s),
					)) if *rp == block_hash && s == &statement
				)
		}));

		harness.send(ApprovalVotingMessage::BlockFinalized(block_hash, 1)).await;

		harness
			.send(ApprovalVotingMessage::StatementDistributionUpdate(
				NetworkBridgeEvent::PeerMessage(
					peers[2],
					vstaging::StatementDistributionMessage::Statement(
						block_hash,
						seconded_by(2, block_hash),
					),
				),
			))
			.await;
		assert!(missing_knowledge_reported(&harness, peers[2]));

		harness
	});
}

#[test]
fn closed_channel_is_fatal() {
	let runtime = Arc::new(MockRuntime::default());
	let collaborators = Collaborators {
		runtime,
		chain: Arc::new(MockChain::default()),
		recovery: Arc::new(MockRecovery::default()),
		pvf: Arc::new(MockPvf::default()),
		network: Arc::new(MockNetwork::default()),
	};

	let (tx, rx) = mpsc::channel(1);
	drop(tx);

	let subsystem = ApprovalVotingSubsystem::new(
		Config::default(),
		Arc::new(LocalKeystore::in_memory()),
		collaborators,
		Metrics::default(),
		Default::default(),
	)
	.with_clock(Arc::new(MockClock::default()));

	assert_matches!(block_on(subsystem.run(rx)), Err(FatalError::MessageChannelClosed));
}
