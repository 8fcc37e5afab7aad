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

//! The Approval Voting Subsystem.
//!
//! This subsystem is responsible for determining candidates to do approval checks
//! on, performing those approval checks, and tracking the assignments and approvals
//! of others. It uses this information to determine when candidates and blocks have
//! been sufficiently approved to finalize.
//!
//! The subsystem runs as a single task which owns all of its state. Collaborator calls
//! (recovery, validation) run as futures polled by that task, and their results come back
//! into the same loop. Approval distribution runs inside the same task, as does statement
//! distribution for the relay-parents imported here.

use polkadot_approval_distribution::ApprovalVotingHandle;
use polkadot_node_network_protocol::{self as net_protocol, vstaging, NetworkBridgeEvent};
use polkadot_node_primitives::{
	approval::{
		ApprovalCheckError, ApprovalCheckResult, ApprovalVote, AssignmentCheckError,
		AssignmentCheckResult, DelayTranche, IndirectAssignmentCert, IndirectSignedApprovalVote,
	},
	AvailableData, BlockNumber, CandidateHash, CandidateIndex, CandidateReceipt, GroupIndex, Hash,
	ParaId, SessionIndex, SessionInfo, SignedStatement, Slot, ValidatorId, ValidatorIndex,
	ValidatorSignature,
};

use futures::{
	channel::{mpsc, oneshot},
	future::BoxFuture,
	prelude::*,
	stream::FuturesUnordered,
};
use rand::{rngs::StdRng, SeedableRng};

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::Arc,
};

mod approval_checking;
mod backend;
pub mod config;
pub mod criteria;
mod entries;
mod error;
mod import;
pub mod interfaces;
pub mod keystore;
mod metrics;
mod ops;
mod rolling_session_window;
pub mod time;

#[cfg(test)]
mod tests;

use crate::{
	approval_checking::RequiredTranches,
	backend::Backend,
	config::{APPROVAL_DELAY, MINIMUM_BACKING_VOTES, SECONDING_LIMIT, TICK_TOO_FAR_IN_FUTURE},
	criteria::{AssignmentCriteria, RealAssignmentCriteria},
	entries::{ApprovalEntry, BlockEntry, CandidateEntry},
	error::{log_error, FatalResult, Result},
	interfaces::{
		dispatch, AvailabilityRecovery, ChainApi, NetworkBridge, Pvf, RecoveryError, RuntimeApi,
		ValidationResult,
	},
	keystore::Keystore,
	rolling_session_window::RollingSessionWindow,
	time::{slot_number_to_tick, Clock, ClockExt, SystemClock, Tick, Wakeups},
};

pub use config::Config;
pub use error::FatalError;
pub use metrics::Metrics;

const LOG_TARGET: &str = "parachain::approval-voting";

/// Messages received by the approval voting subsystem.
#[derive(Debug)]
pub enum ApprovalVotingMessage {
	/// A new relay-chain head was imported. The head and any of its unknown ancestors are
	/// imported into the approval protocol.
	ActiveLeaf(Hash),
	/// A block was finalized.
	BlockFinalized(Hash, BlockNumber),
	/// Check if the assignment is valid and can be accepted by our view of the protocol.
	/// Should not be sent unless the block hash is known.
	CheckAndImportAssignment(
		IndirectAssignmentCert,
		CandidateIndex,
		oneshot::Sender<AssignmentCheckResult>,
	),
	/// Check if the approval vote is valid and can be accepted by our view of the
	/// protocol.
	///
	/// Should not be sent unless the block hash within the indirect vote is known.
	CheckAndImportApproval(IndirectSignedApprovalVote, oneshot::Sender<ApprovalCheckResult>),
	/// Returns the highest possible ancestor hash of the provided block hash which is
	/// acceptable to vote on finality for.
	/// The `BlockNumber` provided is the number of the block's ancestor which is the
	/// earliest possible vote.
	///
	/// It can also return the same block hash, if that is acceptable to vote upon.
	/// Return `None` if the input hash is unrecognized.
	ApprovedAncestor(Hash, BlockNumber, oneshot::Sender<Option<HighestApprovedAncestorBlock>>),
	/// Retrieve all available approval signatures for a candidate from approval-distribution.
	GetApprovalSignaturesForCandidate(
		CandidateHash,
		oneshot::Sender<HashMap<ValidatorIndex, ValidatorSignature>>,
	),
	/// An update from the network bridge for approval distribution.
	NetworkBridgeUpdate(NetworkBridgeEvent<net_protocol::ApprovalDistributionMessage>),
	/// An update from the network bridge for statement distribution.
	StatementDistributionUpdate(NetworkBridgeEvent<vstaging::StatementDistributionMessage>),
	/// Distribute a statement we signed at the given relay-parent.
	ShareStatement(Hash, SignedStatement),
	/// A candidate was backed at the given relay-parent.
	CandidateBacked {
		/// The relay-parent of the candidate.
		relay_parent: Hash,
		/// The hash of the candidate.
		candidate_hash: CandidateHash,
		/// The group which backed the candidate.
		group_index: GroupIndex,
		/// The para the candidate is for.
		para_id: ParaId,
		/// The hash of the candidate's parent head-data.
		parent_head_data_hash: Hash,
	},
	/// Conclude the subsystem.
	Conclude,
}

/// The highest approved ancestor of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighestApprovedAncestorBlock {
	/// The block hash of the highest viable ancestor.
	pub hash: Hash,
	/// The block number of the highest viable ancestor.
	pub number: BlockNumber,
}

/// The rest of the node, as seen by the approval voting subsystem.
#[derive(Clone)]
pub struct Collaborators {
	/// Access to the runtime state of relay-chain blocks.
	pub runtime: Arc<dyn RuntimeApi>,
	/// Access to the block tree.
	pub chain: Arc<dyn ChainApi>,
	/// Recovery of available data.
	pub recovery: Arc<dyn AvailabilityRecovery>,
	/// Candidate validation.
	pub pvf: Arc<dyn Pvf>,
	/// The outgoing side of the network.
	pub network: Arc<dyn NetworkBridge>,
}

/// The approval voting subsystem.
pub struct ApprovalVotingSubsystem {
	config: Config,
	keystore: Arc<dyn Keystore>,
	collaborators: Collaborators,
	assignment_criteria: Arc<dyn AssignmentCriteria>,
	clock: Arc<dyn Clock + Send + Sync>,
	metrics: Metrics,
	distribution_metrics: polkadot_approval_distribution::Metrics,
}

impl ApprovalVotingSubsystem {
	/// Create a new approval voting subsystem with the given keystore, config and collaborators.
	pub fn new(
		config: Config,
		keystore: Arc<dyn Keystore>,
		collaborators: Collaborators,
		metrics: Metrics,
		distribution_metrics: polkadot_approval_distribution::Metrics,
	) -> Self {
		ApprovalVotingSubsystem {
			config,
			keystore,
			collaborators,
			assignment_criteria: Arc::new(RealAssignmentCriteria),
			clock: Arc::new(SystemClock),
			metrics,
			distribution_metrics,
		}
	}

	/// Replace the assignment criteria.
	pub fn with_assignment_criteria(mut self, criteria: Arc<dyn AssignmentCriteria>) -> Self {
		self.assignment_criteria = criteria;
		self
	}

	/// Replace the clock.
	pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
		self.clock = clock;
		self
	}

	/// Run the subsystem until [`ApprovalVotingMessage::Conclude`] is received.
	pub async fn run(
		self,
		messages: mpsc::Receiver<ApprovalVotingMessage>,
	) -> FatalResult<()> {
		run(self, messages).await
	}
}

/// The state of the approval voting task, apart from its queues.
pub(crate) struct State {
	pub(crate) session_window: Option<RollingSessionWindow>,
	pub(crate) keystore: Arc<dyn Keystore>,
	pub(crate) slot_duration_millis: u64,
	pub(crate) clock: Arc<dyn Clock + Send + Sync>,
	pub(crate) assignment_criteria: Arc<dyn AssignmentCriteria>,
	pub(crate) db: Backend,
	pub(crate) metrics: Metrics,
}

#[derive(Debug, Clone)]
struct ApprovalStatus {
	required_tranches: RequiredTranches,
	tranche_now: DelayTranche,
	block_tick: Tick,
}

impl State {
	fn session_info(&self, i: SessionIndex) -> Option<&SessionInfo> {
		self.session_window.as_ref().and_then(|w| w.session_info(i))
	}

	// Compute the required tranches for approval for this block and candidate combo.
	// Fails if there is no approval entry for the block under the candidate or no session info
	// for the block's session.
	fn approval_status<'a, 'b>(
		&'a self,
		block_entry: &'a BlockEntry,
		candidate_entry: &'b CandidateEntry,
	) -> Option<(&'b ApprovalEntry, ApprovalStatus)> {
		let session_info = match self.session_info(block_entry.session()) {
			Some(s) => s,
			None => {
				tracing::warn!(
					target: LOG_TARGET,
					"Unknown session info for {}",
					block_entry.session()
				);
				return None
			},
		};
		let block_hash = block_entry.block_hash();

		let tranche_now = self.clock.tranche_now(self.slot_duration_millis, block_entry.slot());
		let block_tick = slot_number_to_tick(self.slot_duration_millis, block_entry.slot());
		let no_show_duration = slot_number_to_tick(
			self.slot_duration_millis,
			Slot(u64::from(session_info.no_show_slots)),
		);

		candidate_entry.approval_entry(&block_hash).map(|approval_entry| {
			let required_tranches = approval_checking::tranches_to_approve(
				approval_entry,
				candidate_entry.approvals(),
				tranche_now,
				block_tick,
				no_show_duration,
				session_info.needed_approvals as _,
			);

			let status = ApprovalStatus { required_tranches, block_tick, tranche_now };

			(approval_entry, status)
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ApprovalVoteRequest {
	validator_index: ValidatorIndex,
	block_hash: Hash,
}

#[derive(Debug)]
enum Action {
	ScheduleWakeup {
		block_hash: Hash,
		block_number: BlockNumber,
		candidate_hash: CandidateHash,
		tick: Tick,
	},
	LaunchApproval {
		candidate_hash: CandidateHash,
		indirect_cert: IndirectAssignmentCert,
		assignment_tranche: DelayTranche,
		relay_block_hash: Hash,
		candidate_index: CandidateIndex,
		session: SessionIndex,
		candidate: CandidateReceipt,
		backing_group: GroupIndex,
	},
	NoteApprovedInChainSelection(Hash),
	IssueApproval(CandidateHash, ApprovalVoteRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalOutcome {
	Approved,
	Failed,
}

struct ApprovalState {
	candidate_hash: CandidateHash,
	approval_outcome: ApprovalOutcome,
}

// Candidates currently being recovered and validated, with everyone waiting on them.
#[derive(Default)]
struct CurrentlyCheckingSet {
	candidate_hash_map: HashMap<CandidateHash, HashSet<ApprovalVoteRequest>>,
	currently_checking: FuturesUnordered<BoxFuture<'static, ApprovalState>>,
}

impl CurrentlyCheckingSet {
	// Returns `true` if the candidate is already being checked, in which case the request
	// is served when that check concludes.
	fn insert_request(&mut self, candidate_hash: CandidateHash, request: ApprovalVoteRequest) -> bool {
		match self.candidate_hash_map.get_mut(&candidate_hash) {
			Some(requests) => {
				requests.insert(request);
				true
			},
			None => false,
		}
	}

	fn launch(
		&mut self,
		candidate_hash: CandidateHash,
		request: ApprovalVoteRequest,
		check: BoxFuture<'static, ApprovalState>,
	) {
		self.candidate_hash_map.entry(candidate_hash).or_default().insert(request);
		self.currently_checking.push(check);
	}

	fn conclude(&mut self, candidate_hash: &CandidateHash) -> Vec<ApprovalVoteRequest> {
		self.candidate_hash_map
			.remove(candidate_hash)
			.map(|requests| requests.into_iter().collect())
			.unwrap_or_default()
	}
}

#[derive(Debug, Clone)]
enum ApprovalStateTransition {
	RemoteApproval(ValidatorIndex),
	LocalApproval(ValidatorIndex, ValidatorSignature),
	WakeupProcessed,
}

impl ApprovalStateTransition {
	fn validator_index(&self) -> Option<ValidatorIndex> {
		match *self {
			ApprovalStateTransition::RemoteApproval(v) |
			ApprovalStateTransition::LocalApproval(v, _) => Some(v),
			ApprovalStateTransition::WakeupProcessed => None,
		}
	}

	fn is_local_approval(&self) -> bool {
		match *self {
			ApprovalStateTransition::RemoteApproval(_) => false,
			ApprovalStateTransition::LocalApproval(_, _) => true,
			ApprovalStateTransition::WakeupProcessed => false,
		}
	}
}

// The approval voting side of approval distribution. Imports go straight into the state,
// the actions they cause are collected for the main loop.
struct VotingHandle<'a> {
	state: &'a mut State,
	wakeups: &'a Wakeups,
	actions: &'a mut Vec<Action>,
}

impl ApprovalVotingHandle for VotingHandle<'_> {
	fn check_and_import_assignment(
		&mut self,
		assignment: IndirectAssignmentCert,
		candidate_index: CandidateIndex,
	) -> AssignmentCheckResult {
		let (res, actions) = check_and_import_assignment(self.state, assignment, candidate_index);
		self.actions.extend(actions);
		res
	}

	fn check_and_import_approval(
		&mut self,
		approval: IndirectSignedApprovalVote,
	) -> ApprovalCheckResult {
		let (res, actions) = check_and_import_approval(self.state, self.wakeups, approval);
		self.actions.extend(actions);
		res
	}
}

enum LoopEvent {
	Wakeup(Hash, CandidateHash),
	Message(Option<ApprovalVotingMessage>),
	Checked(ApprovalState),
}

async fn run(
	subsystem: ApprovalVotingSubsystem,
	mut messages: mpsc::Receiver<ApprovalVotingMessage>,
) -> FatalResult<()> {
	let ApprovalVotingSubsystem {
		config,
		keystore,
		collaborators,
		assignment_criteria,
		clock,
		metrics,
		distribution_metrics,
	} = subsystem;

	let mut state = State {
		session_window: None,
		keystore,
		slot_duration_millis: config.slot_duration_millis,
		clock: clock.clone(),
		assignment_criteria,
		db: Backend::default(),
		metrics,
	};

	let mut distribution = polkadot_approval_distribution::State::new(distribution_metrics);
	let mut statements =
		polkadot_statement_distribution::State::new(SECONDING_LIMIT, MINIMUM_BACKING_VOTES);
	let mut rng = StdRng::from_entropy();
	let mut wakeups = Wakeups::default();
	let mut currently_checking_set = CurrentlyCheckingSet::default();
	let mut approvals_cache = HashMap::new();
	let mut last_finalized_height: Option<BlockNumber> = None;

	loop {
		let event = futures::select! {
			(_tick, woken_block, woken_candidate) = wakeups.next(&*clock).fuse() =>
				LoopEvent::Wakeup(woken_block, woken_candidate),
			next_msg = messages.next() => LoopEvent::Message(next_msg),
			approval_state = currently_checking_set.currently_checking.select_next_some() =>
				LoopEvent::Checked(approval_state),
		};

		let result = match event {
			LoopEvent::Wakeup(woken_block, woken_candidate) => {
				state.metrics.on_wakeup();
				Ok(process_wakeup(&mut state, &wakeups, woken_block, woken_candidate))
			},
			LoopEvent::Message(None) => return Err(FatalError::MessageChannelClosed),
			LoopEvent::Message(Some(ApprovalVotingMessage::Conclude)) => return Ok(()),
			LoopEvent::Message(Some(msg)) =>
				handle_message(
					&mut state,
					&mut distribution,
					&mut statements,
					&collaborators,
					&mut wakeups,
					&mut rng,
					&mut approvals_cache,
					&mut last_finalized_height,
					msg,
				)
				.await,
			LoopEvent::Checked(ApprovalState { candidate_hash, approval_outcome }) => {
				approvals_cache.insert(candidate_hash, approval_outcome);
				let requests = currently_checking_set.conclude(&candidate_hash);

				Ok(match approval_outcome {
					ApprovalOutcome::Approved => requests
						.into_iter()
						.map(|request| Action::IssueApproval(candidate_hash, request))
						.collect(),
					ApprovalOutcome::Failed => Vec::new(),
				})
			},
		};

		let actions = log_error(result)?;

		handle_actions(
			&mut state,
			&mut distribution,
			&collaborators,
			&mut wakeups,
			&mut rng,
			&mut currently_checking_set,
			&approvals_cache,
			actions,
		)
		.await;
	}
}

#[allow(clippy::too_many_arguments)]
async fn handle_actions(
	state: &mut State,
	distribution: &mut polkadot_approval_distribution::State,
	collaborators: &Collaborators,
	wakeups: &mut Wakeups,
	rng: &mut StdRng,
	currently_checking_set: &mut CurrentlyCheckingSet,
	approvals_cache: &HashMap<CandidateHash, ApprovalOutcome>,
	actions: Vec<Action>,
) {
	let mut actions: VecDeque<Action> = actions.into();

	while let Some(action) = actions.pop_front() {
		match action {
			Action::ScheduleWakeup { block_hash, block_number, candidate_hash, tick } =>
				wakeups.schedule(block_hash, block_number, candidate_hash, tick),
			Action::IssueApproval(candidate_hash, approval_request) => {
				let (issue_actions, vote) =
					issue_approval(state, wakeups, candidate_hash, approval_request);

				if let Some(vote) = vote {
					dispatch(&*collaborators.network, distribution.distribute_approval(vote));
				}

				for action in issue_actions.into_iter().rev() {
					actions.push_front(action);
				}
			},
			Action::LaunchApproval {
				candidate_hash,
				indirect_cert,
				assignment_tranche,
				relay_block_hash,
				candidate_index,
				session,
				candidate,
				backing_group,
			} => {
				state.metrics.on_assignment_produced(assignment_tranche);
				let request = ApprovalVoteRequest {
					validator_index: indirect_cert.validator,
					block_hash: relay_block_hash,
				};

				dispatch(
					&*collaborators.network,
					distribution.distribute_assignment(indirect_cert, candidate_index, rng),
				);

				match approvals_cache.get(&candidate_hash) {
					Some(ApprovalOutcome::Approved) =>
						actions.push_front(Action::IssueApproval(candidate_hash, request)),
					Some(ApprovalOutcome::Failed) => {},
					None =>
						if !currently_checking_set.insert_request(candidate_hash, request) {
							let check = launch_approval(
								collaborators,
								state.metrics.clone(),
								session,
								candidate,
								relay_block_hash,
								backing_group,
							);
							currently_checking_set.launch(candidate_hash, request, check);
						},
				}
			},
			Action::NoteApprovedInChainSelection(block_hash) => {
				tracing::debug!(target: LOG_TARGET, ?block_hash, "Block approved");
				collaborators.chain.approved_block(block_hash).await;
			},
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn handle_message(
	state: &mut State,
	distribution: &mut polkadot_approval_distribution::State,
	statements: &mut polkadot_statement_distribution::State,
	collaborators: &Collaborators,
	wakeups: &mut Wakeups,
	rng: &mut StdRng,
	approvals_cache: &mut HashMap<CandidateHash, ApprovalOutcome>,
	last_finalized_height: &mut Option<BlockNumber>,
	msg: ApprovalVotingMessage,
) -> Result<Vec<Action>> {
	let mut actions = Vec::new();

	match msg {
		ApprovalVotingMessage::ActiveLeaf(head) => {
			let outcome = import::handle_new_head(
				state,
				&*collaborators.runtime,
				&*collaborators.chain,
				head,
				&*last_finalized_height,
			)
			.await?;

			for block_batch in outcome.imported {
				tracing::debug!(
					target: LOG_TARGET,
					block_number = ?block_batch.block_number,
					block_hash = ?block_batch.block_hash,
					num_candidates = block_batch.imported_candidates.len(),
					"Imported new block.",
				);

				for (c_hash, c_entry) in block_batch.imported_candidates {
					let our_tranche = c_entry
						.approval_entry(&block_batch.block_hash)
						.and_then(|a| a.our_assignment().map(|a| a.tranche()));

					if let Some(our_tranche) = our_tranche {
						let tick = our_tranche as Tick + block_batch.block_tick;
						tracing::trace!(
							target: LOG_TARGET,
							tranche = our_tranche,
							candidate_hash = ?c_hash,
							block_hash = ?block_batch.block_hash,
							block_tick = block_batch.block_tick,
							"Scheduling first wakeup.",
						);

						// Our first wakeup will just be the tranche of our assignment,
						// if any. This will likely be superseded by incoming assignments
						// and approvals which trigger rescheduling.
						actions.push(Action::ScheduleWakeup {
							block_hash: block_batch.block_hash,
							block_number: block_batch.block_number,
							candidate_hash: c_hash,
							tick,
						});
					}
				}
			}

			actions.extend(outcome.approved.into_iter().map(Action::NoteApprovedInChainSelection));

			for meta in &outcome.approval_meta {
				activate_statement_relay_parent(state, statements, meta.hash, meta.session);
			}

			let mut handle = VotingHandle { state, wakeups: &*wakeups, actions: &mut actions };
			let messages = distribution.handle_new_blocks(&mut handle, outcome.approval_meta, rng);
			dispatch(&*collaborators.network, messages);
		},
		ApprovalVotingMessage::BlockFinalized(block_hash, block_number) => {
			tracing::debug!(target: LOG_TARGET, ?block_hash, ?block_number, "Block finalized");
			*last_finalized_height = Some(block_number);

			let pruned = ops::canonicalize(&mut state.db, block_number, block_hash);

			wakeups.prune_finalized_wakeups(block_number);
			wakeups.prune_blocks(&pruned);
			distribution.handle_block_finalized(block_number);
			for relay_parent in &pruned {
				statements.deactivate_relay_parent(relay_parent);
			}

			let db = &state.db;
			approvals_cache.retain(|candidate_hash, _| db.load_candidate_entry(candidate_hash).is_some());
		},
		ApprovalVotingMessage::CheckAndImportAssignment(a, claimed_core, res) => {
			let (check_outcome, assignment_actions) =
				check_and_import_assignment(state, a, claimed_core);
			let _ = res.send(check_outcome);
			actions.extend(assignment_actions);
		},
		ApprovalVotingMessage::CheckAndImportApproval(a, res) => {
			let (check_outcome, approval_actions) = check_and_import_approval(state, wakeups, a);
			let _ = res.send(check_outcome);
			actions.extend(approval_actions);
		},
		ApprovalVotingMessage::ApprovedAncestor(target, lower_bound, res) => {
			match handle_approved_ancestor(&state.db, &*collaborators.chain, target, lower_bound)
				.await
			{
				Ok(v) => {
					let _ = res.send(v);
				},
				Err(e) => {
					let _ = res.send(None);
					return Err(e)
				},
			}
		},
		ApprovalVotingMessage::GetApprovalSignaturesForCandidate(candidate_hash, tx) => {
			let _ = tx.send(get_approval_signatures_for_candidate(
				&state.db,
				distribution,
				candidate_hash,
			));
		},
		ApprovalVotingMessage::NetworkBridgeUpdate(event) => {
			let mut handle = VotingHandle { state, wakeups: &*wakeups, actions: &mut actions };
			let messages = distribution.handle_network_msg(&mut handle, event, rng);
			dispatch(&*collaborators.network, messages);
		},
		ApprovalVotingMessage::StatementDistributionUpdate(event) => {
			dispatch(&*collaborators.network, statements.handle_network_update(event));
		},
		ApprovalVotingMessage::ShareStatement(relay_parent, statement) => {
			dispatch(
				&*collaborators.network,
				statements.share_local_statement(relay_parent, statement),
			);
		},
		ApprovalVotingMessage::CandidateBacked {
			relay_parent,
			candidate_hash,
			group_index,
			para_id,
			parent_head_data_hash,
		} => {
			let messages = statements.note_backed_candidate(
				relay_parent,
				candidate_hash,
				group_index,
				para_id,
				parent_head_data_hash,
			);
			dispatch(&*collaborators.network, messages);
		},
		ApprovalVotingMessage::Conclude => {},
	}

	Ok(actions)
}

// Statements are tracked at a relay-parent from its import until it is finalized or pruned.
fn activate_statement_relay_parent(
	state: &State,
	statements: &mut polkadot_statement_distribution::State,
	relay_parent: Hash,
	session: SessionIndex,
) {
	let session_info = match state.session_info(session) {
		None => {
			tracing::debug!(
				target: LOG_TARGET,
				?relay_parent,
				session,
				"No session info, not tracking statements",
			);
			return
		},
		Some(s) => s,
	};

	let local_validator = session_info
		.validators
		.iter()
		.position(|key| state.keystore.validator_keypair(key).is_some())
		.map(|i| ValidatorIndex(i as u32));

	statements.handle_new_session(session, session_info.clone(), local_validator);
	statements.activate_relay_parent(relay_parent, session);
}

fn get_approval_signatures_for_candidate(
	db: &Backend,
	distribution: &polkadot_approval_distribution::State,
	candidate_hash: CandidateHash,
) -> HashMap<ValidatorIndex, ValidatorSignature> {
	let entry = match db.load_candidate_entry(&candidate_hash) {
		None => {
			tracing::debug!(
				target: LOG_TARGET,
				?candidate_hash,
				"Sent back empty votes because the candidate was not found in the store."
			);
			return HashMap::new()
		},
		Some(e) => e,
	};

	let relay_hashes = entry.block_assignments().map(|(relay_hash, _)| relay_hash);

	let mut candidate_indices = HashSet::new();
	// Retrieve `CoreIndices`/`CandidateIndices` as required by approval-distribution:
	for hash in relay_hashes {
		let block_entry = match db.load_block_entry(hash) {
			None => {
				tracing::debug!(
					target: LOG_TARGET,
					?candidate_hash,
					"Block entry for assignment missing."
				);
				continue
			},
			Some(e) => e,
		};
		for (candidate_index, (_core_index, c_hash)) in block_entry.candidates().iter().enumerate()
		{
			if c_hash == &candidate_hash {
				candidate_indices.insert((*hash, candidate_index as CandidateIndex));
				break
			}
		}
	}

	distribution.get_approval_signatures(candidate_indices)
}

async fn handle_approved_ancestor(
	db: &Backend,
	chain: &dyn ChainApi,
	target: Hash,
	lower_bound: BlockNumber,
) -> Result<Option<HighestApprovedAncestorBlock>> {
	let mut all_approved_max = None;

	let target_number = match chain.block_header(target).await? {
		Some(h) => h.number,
		None => return Ok(None),
	};

	if target_number <= lower_bound {
		return Ok(None)
	}

	// request ancestors up to but not including the lower bound,
	// as not-approved ancestors imply not-approved descendants.
	let ancestry = if target_number > lower_bound + 1 {
		chain.ancestors(target, (target_number - lower_bound - 1) as usize).await?
	} else {
		Vec::new()
	};

	for (i, block_hash) in std::iter::once(target).chain(ancestry).enumerate() {
		// Block entries should be present as the assumption is that
		// nothing here is finalized. If we encounter any missing block
		// entries we can fail.
		let entry = match db.load_block_entry(&block_hash) {
			None => {
				let block_number = target_number.saturating_sub(i as u32);
				tracing::info!(
					target: LOG_TARGET,
					unknown_number = ?block_number,
					unknown_hash = ?block_hash,
					"Chain between ({}, {}) and {} not fully known. Forcing vote on {}",
					target,
					target_number,
					lower_bound,
					lower_bound,
				);
				return Ok(None)
			},
			Some(b) => b,
		};

		// even if traversing millions of blocks this is fairly cheap and always dwarfed by the
		// disk lookups.
		if entry.is_fully_approved() {
			if all_approved_max.is_none() {
				// First iteration of the loop is target, i = 0. After that,
				// ancestry is moving backwards.
				all_approved_max = Some((block_hash, target_number - i as BlockNumber));
			}
		} else {
			all_approved_max = None;
			tracing::trace!(
				target: LOG_TARGET,
				?block_hash,
				unapproved = entry.unapproved_candidates().count(),
				"Block is not fully approved",
			);
		}
	}

	tracing::trace!(
		target: LOG_TARGET,
		"approved blocks {}-[{}]-{}",
		target_number,
		all_approved_max.map_or("".into(), |(_, n)| n.to_string()),
		lower_bound,
	);

	Ok(all_approved_max.map(|(hash, number)| HighestApprovedAncestorBlock { hash, number }))
}

// `Option::cmp` treats `None` as less than `Some`.
pub(crate) fn min_prefer_some<T: std::cmp::PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
	match (a, b) {
		(None, None) => None,
		(None, Some(x)) | (Some(x), None) => Some(x),
		(Some(x), Some(y)) => Some(if x < y { x } else { y }),
	}
}

fn schedule_wakeup_action(
	approval_entry: &ApprovalEntry,
	block_hash: Hash,
	block_number: BlockNumber,
	candidate_hash: CandidateHash,
	block_tick: Tick,
	tick_now: Tick,
	required_tranches: RequiredTranches,
) -> Option<Action> {
	let maybe_action = match required_tranches {
		_ if approval_entry.is_approved() => None,
		RequiredTranches::All => None,
		RequiredTranches::Exact { next_no_show, last_assignment_tick, .. } => {
			// Take the earlier of the next no show or the last assignment tick + required delay,
			// only considering the latter if it is after the current moment.
			min_prefer_some(
				last_assignment_tick.map(|l| l + APPROVAL_DELAY).filter(|t| t > &tick_now),
				next_no_show,
			)
			.map(|tick| Action::ScheduleWakeup { block_hash, block_number, candidate_hash, tick })
		},
		RequiredTranches::Pending { considered, next_no_show, clock_drift, .. } => {
			// select the minimum of `next_no_show`, or the tick of the next non-empty tranche
			// after `considered`, including any tranche that might contain our own untriggered
			// assignment.
			let next_non_empty_tranche = {
				let next_announced = approval_entry
					.tranches()
					.iter()
					.skip_while(|t| t.tranche() <= considered)
					.map(|t| t.tranche())
					.next();

				let our_untriggered = approval_entry.our_assignment().and_then(|t| {
					if !t.triggered() && t.tranche() > considered {
						Some(t.tranche())
					} else {
						None
					}
				});

				// Apply the clock drift to these tranches.
				min_prefer_some(next_announced, our_untriggered)
					.map(|t| t as Tick + block_tick + clock_drift)
			};

			min_prefer_some(next_non_empty_tranche, next_no_show).map(|tick| {
				Action::ScheduleWakeup { block_hash, block_number, candidate_hash, tick }
			})
		},
	};

	match maybe_action {
		Some(Action::ScheduleWakeup { ref tick, .. }) => tracing::trace!(
			target: LOG_TARGET,
			tick,
			?candidate_hash,
			?block_hash,
			block_tick,
			"Scheduling next wakeup.",
		),
		None => tracing::trace!(
			target: LOG_TARGET,
			?candidate_hash,
			?block_hash,
			block_tick,
			"No wakeup needed.",
		),
		Some(_) => {}, // unreachable
	}

	maybe_action
}

fn check_and_import_assignment(
	state: &mut State,
	assignment: IndirectAssignmentCert,
	candidate_index: CandidateIndex,
) -> (AssignmentCheckResult, Vec<Action>) {
	let tick_now = state.clock.tick_now();

	let block_entry = match state.db.load_block_entry(&assignment.block_hash) {
		Some(b) => b.clone(),
		None =>
			return (
				AssignmentCheckResult::Bad(AssignmentCheckError::UnknownBlock(
					assignment.block_hash,
				)),
				Vec::new(),
			),
	};

	let session_info = match state.session_info(block_entry.session()) {
		Some(s) => s,
		None =>
			return (
				AssignmentCheckResult::Bad(AssignmentCheckError::UnknownSessionIndex(
					block_entry.session(),
				)),
				Vec::new(),
			),
	};

	let (claimed_core_index, assigned_candidate_hash) =
		match block_entry.candidate(candidate_index as usize) {
			Some((c, h)) => (*c, *h),
			None =>
				return (
					AssignmentCheckResult::Bad(AssignmentCheckError::InvalidCandidateIndex(
						candidate_index,
					)),
					Vec::new(),
				),
		};

	let mut candidate_entry = match state.db.load_candidate_entry(&assigned_candidate_hash) {
		Some(c) => c.clone(),
		None =>
			return (
				AssignmentCheckResult::Bad(AssignmentCheckError::InvalidCandidate(
					candidate_index,
					assigned_candidate_hash,
				)),
				Vec::new(),
			),
	};

	let res = {
		// import the assignment.
		let approval_entry = match candidate_entry.approval_entry_mut(&assignment.block_hash) {
			Some(a) => a,
			None =>
				return (
					AssignmentCheckResult::Bad(AssignmentCheckError::Internal(
						assignment.block_hash,
						assigned_candidate_hash,
					)),
					Vec::new(),
				),
		};

		let res = state.assignment_criteria.check_assignment_cert(
			claimed_core_index,
			assignment.validator,
			&criteria::Config::from(session_info),
			block_entry.relay_vrf_story(),
			&assignment.cert,
			approval_entry.backing_group(),
		);

		let tranche = match res {
			Err(reason) =>
				return (
					AssignmentCheckResult::Bad(AssignmentCheckError::InvalidCert(
						assignment.validator,
						format!("{:?}", reason),
					)),
					Vec::new(),
				),
			Ok(tranche) => {
				let current_tranche =
					state.clock.tranche_now(state.slot_duration_millis, block_entry.slot());

				let too_far_in_future = current_tranche + TICK_TOO_FAR_IN_FUTURE as DelayTranche;

				if tranche >= too_far_in_future {
					return (AssignmentCheckResult::TooFarInFuture, Vec::new())
				}

				tranche
			},
		};

		let is_duplicate = approval_entry.is_assigned(assignment.validator);
		approval_entry.import_assignment(tranche, assignment.validator, tick_now);

		if is_duplicate {
			AssignmentCheckResult::AcceptedDuplicate
		} else {
			tracing::trace!(
				target: LOG_TARGET,
				validator = assignment.validator.0,
				candidate_hash = ?assigned_candidate_hash,
				para_id = ?candidate_entry.candidate_receipt().descriptor.para_id,
				"Imported assignment.",
			);

			AssignmentCheckResult::Accepted
		}
	};

	let mut actions = Vec::new();

	if res == AssignmentCheckResult::Accepted {
		// We've imported a new assignment, so we need to schedule a wake-up for when that
		// might no-show.
		if let Some((approval_entry, status)) = state.approval_status(&block_entry, &candidate_entry)
		{
			actions.extend(schedule_wakeup_action(
				approval_entry,
				block_entry.block_hash(),
				block_entry.block_number(),
				assigned_candidate_hash,
				status.block_tick,
				tick_now,
				status.required_tranches,
			));
		}

		// We also write the candidate entry as it now contains the new assignment.
		state.db.write_candidate_entry(candidate_entry);
	}

	(res, actions)
}

fn check_and_import_approval(
	state: &mut State,
	wakeups: &Wakeups,
	approval: IndirectSignedApprovalVote,
) -> (ApprovalCheckResult, Vec<Action>) {
	macro_rules! respond_early {
		($e: expr) => {{
			return ($e, Vec::new())
		}};
	}

	let block_entry = match state.db.load_block_entry(&approval.block_hash) {
		Some(b) => b.clone(),
		None => respond_early!(ApprovalCheckResult::Bad(ApprovalCheckError::UnknownBlock(
			approval.block_hash
		),)),
	};

	let session_info = match state.session_info(block_entry.session()) {
		Some(s) => s,
		None => respond_early!(ApprovalCheckResult::Bad(
			ApprovalCheckError::UnknownSessionIndex(block_entry.session()),
		)),
	};

	let approved_candidate_hash = match block_entry.candidate(approval.candidate_index as usize) {
		Some((_, h)) => *h,
		None => respond_early!(ApprovalCheckResult::Bad(
			ApprovalCheckError::InvalidCandidateIndex(approval.candidate_index),
		)),
	};

	let pubkey = match session_info.validators.get(approval.validator.0 as usize) {
		Some(k) => k,
		None => respond_early!(ApprovalCheckResult::Bad(
			ApprovalCheckError::InvalidValidatorIndex(approval.validator),
		)),
	};

	// Signature check:
	let payload = ApprovalVote(approved_candidate_hash).signing_payload(block_entry.session());
	if !approval.signature.verify(&payload, pubkey) {
		respond_early!(ApprovalCheckResult::Bad(ApprovalCheckError::InvalidSignature(
			approval.validator
		),))
	}

	let candidate_entry = match state.db.load_candidate_entry(&approved_candidate_hash) {
		Some(c) => c.clone(),
		None => respond_early!(ApprovalCheckResult::Bad(ApprovalCheckError::InvalidCandidate(
			approval.candidate_index,
			approved_candidate_hash
		),)),
	};

	// Don't accept approvals until assignment.
	match candidate_entry.approval_entry(&approval.block_hash) {
		None => respond_early!(ApprovalCheckResult::Bad(ApprovalCheckError::Internal(
			approval.block_hash,
			approved_candidate_hash
		),)),
		Some(e) if !e.is_assigned(approval.validator) => respond_early!(
			ApprovalCheckResult::Bad(ApprovalCheckError::NoAssignment(approval.validator),)
		),
		_ => {},
	}

	// importing the approval can be heavy as it may trigger acceptance for a series of blocks.
	if candidate_entry.has_approved(approval.validator) {
		tracing::trace!(
			target: LOG_TARGET,
			validator_index = approval.validator.0,
			candidate_hash = ?approved_candidate_hash,
			"Duplicate approval",
		);
		respond_early!(ApprovalCheckResult::Accepted)
	}

	tracing::trace!(
		target: LOG_TARGET,
		validator_index = approval.validator.0,
		candidate_hash = ?approved_candidate_hash,
		para_id = ?candidate_entry.candidate_receipt().descriptor.para_id,
		"Importing approval vote",
	);

	let actions = advance_approval_state(
		state,
		wakeups,
		block_entry,
		approved_candidate_hash,
		candidate_entry,
		ApprovalStateTransition::RemoteApproval(approval.validator),
	);

	(ApprovalCheckResult::Accepted, actions)
}

// Advance the approval state, either by importing an approval vote which is already checked to be
// valid and corresponding to an assigned validator on the candidate and block, or by noting that
// there are no further wakeups or tranches needed. This updates the block entry and candidate entry
// as necessary and schedules any further wakeups.
fn advance_approval_state(
	state: &mut State,
	wakeups: &Wakeups,
	mut block_entry: BlockEntry,
	candidate_hash: CandidateHash,
	mut candidate_entry: CandidateEntry,
	transition: ApprovalStateTransition,
) -> Vec<Action> {
	let validator_index = transition.validator_index();

	let already_approved_by = validator_index.as_ref().map(|v| candidate_entry.mark_approval(*v));
	let candidate_approved_in_block = block_entry.is_candidate_approved(&candidate_hash);

	// Check for early exits.
	//
	// If the candidate was approved
	// but not the block, it means that we still need more approvals for the candidate under the
	// block.
	//
	// If the block was approved, but the validator hadn't approved it yet, we should still hold
	// onto the approval vote in case it is needed by another fork. Otherwise, our assignment
	// might manifest as a no-show.
	if !transition.is_local_approval() && candidate_approved_in_block {
		if already_approved_by == Some(false) {
			state.db.write_candidate_entry(candidate_entry);
		}

		return Vec::new()
	}

	let mut actions = Vec::new();
	let block_hash = block_entry.block_hash();
	let block_number = block_entry.block_number();
	let tick_now = state.clock.tick_now();

	let (is_approved, status, no_shows) = match state.approval_status(&block_entry, &candidate_entry)
	{
		Some((approval_entry, status)) => {
			let check = approval_checking::check_approval(
				&candidate_entry,
				approval_entry,
				status.required_tranches.clone(),
			);

			// Check whether this is approved, while allowing a maximum
			// assignment tick of `now - APPROVAL_DELAY` - that is, that
			// all counted assignments are at least `APPROVAL_DELAY` ticks old.
			let is_approved = check.is_approved(tick_now.saturating_sub(APPROVAL_DELAY));

			(is_approved, status, check.known_no_shows())
		},
		None => {
			tracing::warn!(
				target: LOG_TARGET,
				?candidate_hash,
				?block_hash,
				?validator_index,
				"No approval entry or session info for approval under block",
			);

			return Vec::new()
		},
	};

	if is_approved {
		tracing::trace!(
			target: LOG_TARGET,
			?candidate_hash,
			?block_hash,
			"Candidate approved under block.",
		);

		let was_block_approved = block_entry.is_fully_approved();
		block_entry.mark_approved_by_hash(&candidate_hash);
		let is_block_approved = block_entry.is_fully_approved();

		if no_shows != 0 {
			state.metrics.on_no_shows(no_shows);
		}

		state.metrics.on_candidate_approved(status.tranche_now as _);

		if is_block_approved && !was_block_approved {
			state.metrics.on_block_approved(status.tranche_now as _);
			actions.push(Action::NoteApprovedInChainSelection(block_hash));
		}

		state.db.write_block_entry(block_entry);
	}

	let mut newly_approved = false;
	if let Some(approval_entry) = candidate_entry.approval_entry_mut(&block_hash) {
		let was_approved = approval_entry.is_approved();
		newly_approved = is_approved && !was_approved;

		if is_approved {
			approval_entry.mark_approved();
		}

		if let ApprovalStateTransition::LocalApproval(_, ref sig) = transition {
			approval_entry.import_approval_sig(*sig);
		}

		actions.extend(schedule_wakeup_action(
			approval_entry,
			block_hash,
			block_number,
			candidate_hash,
			status.block_tick,
			tick_now,
			status.required_tranches,
		));
	}

	if let ApprovalStateTransition::RemoteApproval(approver) = transition {
		// Make sure we wake other blocks in case they have
		// a no-show that might be covered by this approval.
		for (fork_block_hash, fork_approval_entry) in
			candidate_entry.block_assignments().filter(|(h, _)| **h != block_hash)
		{
			let assigned_on_fork_block = fork_approval_entry.is_assigned(approver);

			if wakeups.wakeup_for(*fork_block_hash, candidate_hash).is_none() &&
				!fork_approval_entry.is_approved() &&
				assigned_on_fork_block
			{
				if let Some(fork_block_entry) = state.db.load_block_entry(fork_block_hash) {
					actions.push(Action::ScheduleWakeup {
						block_hash: *fork_block_hash,
						block_number: fork_block_entry.block_number(),
						candidate_hash,
						// Schedule the wakeup next tick, since the assignment must be a
						// no-show, because there is no-wakeup scheduled.
						tick: tick_now + 1,
					})
				}
			}
		}
	}

	// We have no need to write the candidate entry if all of the following
	// is true:
	//
	// 1. This is not a local approval, as we don't store anything new in the approval entry.
	// 2. The candidate is not newly approved, as we haven't altered the approval entry's
	//    approved flag with `mark_approved` above.
	// 3. The approver, if any, had already approved the candidate, as we haven't altered the
	//    bitfield.
	if transition.is_local_approval() || newly_approved || !already_approved_by.unwrap_or(true) {
		// In all other cases, we need to write the candidate entry.
		state.db.write_candidate_entry(candidate_entry);
	}

	actions
}

fn should_trigger_assignment(
	approval_entry: &ApprovalEntry,
	candidate_entry: &CandidateEntry,
	required_tranches: RequiredTranches,
	tranche_now: DelayTranche,
) -> bool {
	match approval_entry.our_assignment() {
		None => false,
		Some(assignment) if assignment.triggered() => false,
		Some(assignment) if assignment.tranche() == 0 => true,
		Some(assignment) => {
			match required_tranches {
				RequiredTranches::All => !approval_checking::check_approval(
					candidate_entry,
					approval_entry,
					RequiredTranches::All,
				)
				// when all are required, we are just waiting for the first 1/3+
				.is_approved(Tick::max_value()),
				RequiredTranches::Pending { maximum_broadcast, clock_drift, .. } => {
					let drifted_tranche_now =
						tranche_now.saturating_sub(clock_drift as DelayTranche);
					assignment.tranche() <= maximum_broadcast &&
						assignment.tranche() <= drifted_tranche_now
				},
				RequiredTranches::Exact { .. } => {
					// indicates that no new assignments are needed at the moment.
					false
				},
			}
		},
	}
}

fn process_wakeup(
	state: &mut State,
	wakeups: &Wakeups,
	relay_block: Hash,
	candidate_hash: CandidateHash,
) -> Vec<Action> {
	let block_entry = match state.db.load_block_entry(&relay_block) {
		Some(b) => b.clone(),
		None => return Vec::new(),
	};

	let mut candidate_entry = match state.db.load_candidate_entry(&candidate_hash) {
		Some(c) => c.clone(),
		None => return Vec::new(),
	};

	let session_info = match state.session_info(block_entry.session()) {
		Some(i) => i,
		None => {
			tracing::warn!(
				target: LOG_TARGET,
				"Missing session info for live block {} in session {}",
				relay_block,
				block_entry.session(),
			);

			return Vec::new()
		},
	};

	let block_tick = slot_number_to_tick(state.slot_duration_millis, block_entry.slot());
	let no_show_duration = slot_number_to_tick(
		state.slot_duration_millis,
		Slot(u64::from(session_info.no_show_slots)),
	);
	let needed_approvals = session_info.needed_approvals as usize;

	let tranche_now = state.clock.tranche_now(state.slot_duration_millis, block_entry.slot());

	tracing::trace!(
		target: LOG_TARGET,
		tranche = tranche_now,
		?candidate_hash,
		block_hash = ?relay_block,
		"Processing wakeup",
	);

	let (should_trigger, backing_group) = {
		let approval_entry = match candidate_entry.approval_entry(&relay_block) {
			Some(e) => e,
			None => return Vec::new(),
		};

		let tranches_to_approve = approval_checking::tranches_to_approve(
			approval_entry,
			candidate_entry.approvals(),
			tranche_now,
			block_tick,
			no_show_duration,
			needed_approvals,
		);

		let should_trigger = should_trigger_assignment(
			approval_entry,
			&candidate_entry,
			tranches_to_approve,
			tranche_now,
		);

		(should_trigger, approval_entry.backing_group())
	};

	let mut actions = Vec::new();
	let candidate_receipt = candidate_entry.candidate_receipt().clone();

	let maybe_cert = if should_trigger {
		let tick_now = state.clock.tick_now();
		candidate_entry
			.approval_entry_mut(&relay_block)
			.and_then(|approval_entry| approval_entry.trigger_our_assignment(tick_now))
	} else {
		None
	};

	if let Some((cert, val_index, tranche)) = maybe_cert {
		// `advance_approval_state` doesn't write back for processed wakeups.
		state.db.write_candidate_entry(candidate_entry.clone());

		let indirect_cert =
			IndirectAssignmentCert { block_hash: relay_block, validator: val_index, cert };

		tracing::trace!(
			target: LOG_TARGET,
			?candidate_hash,
			para_id = ?candidate_receipt.descriptor.para_id,
			block_hash = ?relay_block,
			"Launching approval work.",
		);

		if let Some(i) = block_entry.candidates().iter().position(|(_, h)| &candidate_hash == h) {
			actions.push(Action::LaunchApproval {
				candidate_hash,
				indirect_cert,
				assignment_tranche: tranche,
				relay_block_hash: relay_block,
				candidate_index: i as _,
				session: block_entry.session(),
				candidate: candidate_receipt,
				backing_group,
			});
		}
	}

	// Although we checked approval earlier in this function,
	// this wakeup might have advanced the state to approved via
	// a no-show that was immediately covered and therefore
	// we need to check for that and advance the state.
	//
	// Note that this function also schedules a wakeup as necessary.
	actions.extend(advance_approval_state(
		state,
		wakeups,
		block_entry,
		candidate_hash,
		candidate_entry,
		ApprovalStateTransition::WakeupProcessed,
	));

	actions
}

// Recover the candidate, fetch its validation code and validate it.
fn launch_approval(
	collaborators: &Collaborators,
	metrics: Metrics,
	session_index: SessionIndex,
	candidate: CandidateReceipt,
	block_hash: Hash,
	backing_group: GroupIndex,
) -> BoxFuture<'static, ApprovalState> {
	let runtime = collaborators.runtime.clone();
	let recovery = collaborators.recovery.clone();
	let pvf = collaborators.pvf.clone();

	async move {
		let _timer = metrics.time_recover_and_approve();

		let candidate_hash = candidate.hash();
		let para_id = candidate.descriptor.para_id;
		let failed = ApprovalState { candidate_hash, approval_outcome: ApprovalOutcome::Failed };

		tracing::trace!(target: LOG_TARGET, ?candidate_hash, ?para_id, "Recovering data.");

		let available_data =
			match recovery.recover(candidate.clone(), session_index, Some(backing_group)).await {
				Ok(data) => data,
				Err(RecoveryError::Unavailable) => {
					tracing::warn!(
						target: LOG_TARGET,
						?para_id,
						?candidate_hash,
						"Data unavailable for candidate",
					);
					metrics.on_approval_unavailable();
					return failed
				},
				Err(RecoveryError::Invalid) => {
					tracing::warn!(
						target: LOG_TARGET,
						?para_id,
						?candidate_hash,
						"Data recovery invalid for candidate",
					);
					metrics.on_approval_invalid();
					return failed
				},
			};

		let validation_code_hash = candidate.descriptor.validation_code_hash;
		let validation_code =
			match runtime.validation_code_by_hash(block_hash, validation_code_hash).await {
				Ok(Some(code)) => code,
				Ok(None) | Err(_) => {
					// Validation code is not pruned before the candidates it could check.
					tracing::warn!(
						target: LOG_TARGET,
						?para_id,
						?candidate_hash,
						"Validation code unavailable for block {:?} in the state of block {:?}",
						validation_code_hash,
						block_hash,
					);
					metrics.on_approval_error();
					return failed
				},
			};

		let AvailableData { pov, validation_data } = available_data;

		match pvf.validate(validation_data, pov, candidate, validation_code).await {
			ValidationResult::Valid => {
				tracing::trace!(target: LOG_TARGET, ?candidate_hash, ?para_id, "Candidate Valid");
				ApprovalState { candidate_hash, approval_outcome: ApprovalOutcome::Approved }
			},
			ValidationResult::Invalid(reason) => {
				tracing::warn!(
					target: LOG_TARGET,
					?reason,
					?candidate_hash,
					?para_id,
					"Detected invalid candidate as an approval checker.",
				);
				metrics.on_approval_invalid();
				failed
			},
		}
	}
	.boxed()
}

// Sign an approval vote. Returns the vote to distribute, if one was issued.
fn issue_approval(
	state: &mut State,
	wakeups: &Wakeups,
	candidate_hash: CandidateHash,
	ApprovalVoteRequest { validator_index, block_hash }: ApprovalVoteRequest,
) -> (Vec<Action>, Option<IndirectSignedApprovalVote>) {
	let block_entry = match state.db.load_block_entry(&block_hash) {
		Some(b) => b.clone(),
		None => {
			// not a cause for alarm - just lost a race with pruning, most likely.
			state.metrics.on_approval_stale();
			return (Vec::new(), None)
		},
	};

	let candidate_index = match block_entry.candidates().iter().position(|e| e.1 == candidate_hash)
	{
		None => {
			tracing::warn!(
				target: LOG_TARGET,
				"Candidate hash {} is not present in the block entry's candidates for relay block {}",
				candidate_hash,
				block_entry.parent_hash(),
			);

			state.metrics.on_approval_error();
			return (Vec::new(), None)
		},
		Some(idx) => idx,
	};

	let session_info = match state.session_info(block_entry.session()) {
		Some(s) => s,
		None => {
			tracing::warn!(
				target: LOG_TARGET,
				"Missing session info for live block {} in session {}",
				block_hash,
				block_entry.session(),
			);

			state.metrics.on_approval_error();
			return (Vec::new(), None)
		},
	};

	let candidate_entry = match state.db.load_candidate_entry(&candidate_hash) {
		Some(c) => c.clone(),
		None => {
			tracing::warn!(
				target: LOG_TARGET,
				"Missing entry for candidate index {} in relay block {}",
				candidate_index,
				block_hash,
			);

			state.metrics.on_approval_error();
			return (Vec::new(), None)
		},
	};

	if candidate_entry
		.approval_entry(&block_hash)
		.map_or(false, |e| e.our_approval_sig().is_some())
	{
		tracing::trace!(
			target: LOG_TARGET,
			?candidate_hash,
			?block_hash,
			"Approval already issued",
		);

		return (Vec::new(), None)
	}

	let validator_pubkey = match session_info.validators.get(validator_index.0 as usize) {
		Some(p) => p.clone(),
		None => {
			tracing::warn!(
				target: LOG_TARGET,
				"Validator index {} out of bounds in session {}",
				validator_index.0,
				block_entry.session(),
			);

			state.metrics.on_approval_error();
			return (Vec::new(), None)
		},
	};

	let session = block_entry.session();
	let sig = match sign_approval(&*state.keystore, &validator_pubkey, candidate_hash, session) {
		Some(sig) => sig,
		None => {
			tracing::warn!(
				target: LOG_TARGET,
				validator_index = ?validator_index,
				session,
				"Could not issue approval signature. Assignment key present but not validator key?",
			);

			state.metrics.on_approval_error();
			return (Vec::new(), None)
		},
	};

	tracing::trace!(
		target: LOG_TARGET,
		?candidate_hash,
		?block_hash,
		validator_index = validator_index.0,
		"Issuing approval vote",
	);

	let actions = advance_approval_state(
		state,
		wakeups,
		block_entry,
		candidate_hash,
		candidate_entry,
		ApprovalStateTransition::LocalApproval(validator_index, sig),
	);

	state.metrics.on_approval_produced();

	let vote = IndirectSignedApprovalVote {
		block_hash,
		candidate_index: candidate_index as _,
		validator: validator_index,
		signature: sig,
	};

	(actions, Some(vote))
}

// Sign an approval vote. Fails if the key isn't present in the store.
fn sign_approval(
	keystore: &dyn Keystore,
	public: &ValidatorId,
	candidate_hash: CandidateHash,
	session_index: SessionIndex,
) -> Option<ValidatorSignature> {
	let key = keystore.validator_keypair(public)?;

	let payload = ApprovalVote(candidate_hash).signing_payload(session_index);

	Some(ValidatorSignature::sign(&key, &payload[..]))
}
