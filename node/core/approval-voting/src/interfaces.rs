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

//! The collaborators of the approval voting task.
//!
//! Everything the task needs from the rest of the node is reached through the traits in this
//! module: the runtime state, the block tree, candidate recovery and validation, and the
//! network. All of them are object-safe and shared as `Arc<dyn _>`.

use polkadot_node_network_protocol::{
	NetworkBridgeTxMessage, PeerId, ReputationChange, VersionedValidationProtocol,
};
use polkadot_node_primitives::{
	AvailableData, BabeAuthorityId, BlockNumber, CandidateReceipt, CoreIndex, GroupIndex, Hash,
	Header, PersistedValidationData, PoV, SessionIndex, SessionInfo, ValidationCode,
	ValidationCodeHash,
};

/// An error returned by the runtime API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Runtime API error: {0}")]
pub struct RuntimeApiError(pub String);

/// An error returned by the chain API.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Chain API error: {0}")]
pub struct ChainApiError(pub String);

/// The reasons candidate recovery can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryError {
	/// Not enough chunks were available to recover the data.
	#[error("Data is unavailable")]
	Unavailable,
	/// The recovered data does not match the erasure root.
	#[error("Data is invalid")]
	Invalid,
}

/// An event emitted by the runtime for a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateEvent {
	/// This candidate receipt was backed in the most recent block.
	CandidateBacked(CandidateReceipt, CoreIndex, GroupIndex),
	/// This candidate receipt was included and became a parablock at the most recent block.
	CandidateIncluded(CandidateReceipt, CoreIndex, GroupIndex),
	/// This candidate receipt was not made available in time and timed out.
	CandidateTimedOut(CandidateReceipt, CoreIndex),
}

/// The BABE epoch a block was authored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BabeEpoch {
	/// The epoch index.
	pub epoch_index: u64,
	/// The authorities of the epoch.
	pub authorities: Vec<BabeAuthorityId>,
	/// The randomness of the epoch.
	pub randomness: [u8; 32],
}

/// The outcome of validating a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
	/// The candidate is valid.
	Valid,
	/// The candidate is invalid, for the given reason.
	Invalid(String),
}

/// Access to the runtime state of relay-chain blocks.
#[async_trait::async_trait]
pub trait RuntimeApi: Send + Sync {
	/// The session index a child of the given block would be in.
	async fn session_index_for_child(&self, block: Hash) -> Result<SessionIndex, RuntimeApiError>;

	/// Information about a session, if it is still known at the given block.
	async fn session_info(
		&self,
		block: Hash,
		session: SessionIndex,
	) -> Result<Option<SessionInfo>, RuntimeApiError>;

	/// The candidate events emitted by the given block.
	async fn candidate_events(&self, block: Hash) -> Result<Vec<CandidateEvent>, RuntimeApiError>;

	/// The BABE epoch of the given block.
	async fn babe_epoch(&self, block: Hash) -> Result<BabeEpoch, RuntimeApiError>;

	/// The validation code with the given hash, as known at the given block.
	async fn validation_code_by_hash(
		&self,
		block: Hash,
		code_hash: ValidationCodeHash,
	) -> Result<Option<ValidationCode>, RuntimeApiError>;
}

/// Access to the block tree.
#[async_trait::async_trait]
pub trait ChainApi: Send + Sync {
	/// The header of the given block, if known.
	async fn block_header(&self, hash: Hash) -> Result<Option<Header>, ChainApiError>;

	/// The hash of the finalized block at the given height, if any.
	async fn finalized_block_hash(
		&self,
		number: BlockNumber,
	) -> Result<Option<Hash>, ChainApiError>;

	/// Up to `k` ancestors of the given block, in descending order, not including the block.
	async fn ancestors(&self, hash: Hash, k: usize) -> Result<Vec<Hash>, ChainApiError>;

	/// The best leaf of the block tree.
	async fn best_leaf(&self) -> Result<Option<Hash>, ChainApiError>;

	/// Note that all parachain candidates of the block have been approved.
	async fn approved_block(&self, hash: Hash);
}

/// Recovery of the data needed to check a candidate.
#[async_trait::async_trait]
pub trait AvailabilityRecovery: Send + Sync {
	/// Recover the available data of a candidate, which was backed by the given group.
	async fn recover(
		&self,
		receipt: CandidateReceipt,
		session: SessionIndex,
		backing_group: Option<GroupIndex>,
	) -> Result<AvailableData, RecoveryError>;
}

/// Execution of the parachain validation function.
#[async_trait::async_trait]
pub trait Pvf: Send + Sync {
	/// Validate a candidate exhaustively against its validation code.
	async fn validate(
		&self,
		validation_data: PersistedValidationData,
		pov: PoV,
		receipt: CandidateReceipt,
		validation_code: ValidationCode,
	) -> ValidationResult;
}

/// The outgoing side of the network.
pub trait NetworkBridge: Send + Sync {
	/// Send a message to the given peers on the validation peer-set.
	fn send_validation_message(&self, peers: Vec<PeerId>, message: VersionedValidationProtocol);

	/// Adjust the reputation of a peer.
	fn report_peer(&self, peer: PeerId, rep: ReputationChange);
}

/// Hand a batch of messages produced by the distribution logic to the network.
pub(crate) fn dispatch(network: &dyn NetworkBridge, messages: Vec<NetworkBridgeTxMessage>) {
	for message in messages {
		match message {
			NetworkBridgeTxMessage::ReportPeer(peer, rep) => network.report_peer(peer, rep),
			NetworkBridgeTxMessage::SendValidationMessage(peers, message) =>
				network.send_validation_message(peers, message),
		}
	}
}
