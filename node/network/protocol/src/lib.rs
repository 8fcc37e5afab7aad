// Copyright (C) Parity Technologies (UK) Ltd.
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

//! Network protocol types for the approval and statement distribution subsystems.

#![warn(missing_docs)]

use polkadot_node_primitives::{BlockNumber, Hash, SessionIndex, ValidatorIndex};
use parity_scale_codec::{Decode, Encode};

pub use libp2p_identity::PeerId;

pub mod grid_topology;
pub mod reputation;

pub use reputation::{ReputationChange, UnifiedReputationChange};

/// A version of the protocol.
pub type ProtocolVersion = u32;

/// The protocol versions of the validation peer-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationVersion {
	/// The first version.
	V1 = 1,
	/// The staging version, which carries backed candidate manifests.
	VStaging = 2,
}

impl From<ValidationVersion> for ProtocolVersion {
	fn from(version: ValidationVersion) -> Self {
		version as ProtocolVersion
	}
}

impl ValidationVersion {
	/// Interpret a negotiated protocol version. Unknown versions fall back to `V1`.
	pub fn from_protocol_version(version: ProtocolVersion) -> Self {
		if version == ValidationVersion::VStaging as ProtocolVersion {
			ValidationVersion::VStaging
		} else {
			ValidationVersion::V1
		}
	}
}

/// The role of a peer as observed by the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedRole {
	/// A light node.
	Light,
	/// A full node.
	Full,
	/// A node taking part in consensus.
	Authority,
}

/// A message versioned by the protocol version it was sent over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Versioned<V1, VStaging> {
	/// V1 type.
	V1(V1),
	/// VStaging type.
	VStaging(VStaging),
}

/// All messages of the validation peer-set, over any version.
pub type VersionedValidationProtocol =
	Versioned<v1::ValidationProtocol, vstaging::ValidationProtocol>;

/// Approval distribution messages, over any version.
pub type ApprovalDistributionMessage =
	Versioned<v1::ApprovalDistributionMessage, vstaging::ApprovalDistributionMessage>;

/// A new gossip topology for a session.
#[derive(Debug, Clone)]
pub struct NewGossipTopology {
	/// The session the topology is valid for.
	pub session: SessionIndex,
	/// The topology itself.
	pub topology: grid_topology::SessionGridTopology,
	/// Our own index in the session, if we are a validator.
	pub local_index: Option<ValidatorIndex>,
}

/// Events from network.
#[derive(Debug, Clone)]
pub enum NetworkBridgeEvent<M> {
	/// A peer has connected.
	PeerConnected(PeerId, ObservedRole, ProtocolVersion),

	/// A peer has disconnected.
	PeerDisconnected(PeerId),

	/// Our neighbors in the new gossip topology for the session.
	NewGossipTopology(NewGossipTopology),

	/// Peer has sent a message.
	PeerMessage(PeerId, M),

	/// Peer's `View` has changed.
	PeerViewChange(PeerId, View),

	/// Our `View` has changed.
	OurViewChange(View),
}

/// Requests from the distribution subsystems to the network bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkBridgeTxMessage {
	/// Report a peer for their actions.
	ReportPeer(PeerId, ReputationChange),

	/// Send a message to one or more peers on the validation peer-set.
	SendValidationMessage(Vec<PeerId>, VersionedValidationProtocol),
}

/// A succinct representation of a peer's view. This consists of a bounded amount of chain heads
/// and the highest known finalized block number.
#[derive(Default, Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct View {
	heads: Vec<Hash>,
	/// The number of the finalized block.
	pub finalized_number: BlockNumber,
}

impl View {
	/// Construct a new view based on heads and a finalized block number.
	pub fn new(heads: impl IntoIterator<Item = Hash>, finalized_number: BlockNumber) -> Self {
		let mut heads = heads.into_iter().collect::<Vec<Hash>>();
		heads.sort();
		heads.dedup();
		Self { heads, finalized_number }
	}

	/// Obtain the number of heads that are in view.
	pub fn len(&self) -> usize {
		self.heads.len()
	}

	/// Check if the number of heads contained, is null.
	pub fn is_empty(&self) -> bool {
		self.heads.is_empty()
	}

	/// Obtain an iterator over all heads.
	pub fn iter(&self) -> impl Iterator<Item = &Hash> {
		self.heads.iter()
	}

	/// Obtain an iterator over all heads, consuming the view.
	pub fn into_iter(self) -> impl Iterator<Item = Hash> {
		self.heads.into_iter()
	}

	/// Returns an iterator of the hashes present in `Self` but not in `other`.
	pub fn difference<'a>(&'a self, other: &'a View) -> impl Iterator<Item = &'a Hash> + 'a {
		self.heads.iter().filter(move |h| !other.contains(h))
	}

	/// An iterator containing hashes present in both `Self` and in `other`.
	pub fn intersection<'a>(&'a self, other: &'a View) -> impl Iterator<Item = &'a Hash> + 'a {
		self.heads.iter().filter(move |h| other.contains(h))
	}

	/// Whether the view contains a given hash.
	pub fn contains(&self, hash: &Hash) -> bool {
		self.heads.contains(hash)
	}
}

/// v1 protocol types.
pub mod v1 {
	use polkadot_node_primitives::{
		approval::{IndirectAssignmentCert, IndirectSignedApprovalVote},
		CandidateIndex,
	};
	use parity_scale_codec::{Decode, Encode};

	/// Network messages used by the approval distribution subsystem.
	#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
	pub enum ApprovalDistributionMessage {
		/// Assignments for candidates in recent, unfinalized blocks.
		///
		/// Actually checking the assignment may yield a different result.
		#[codec(index = 0)]
		Assignments(Vec<(IndirectAssignmentCert, CandidateIndex)>),
		/// Approvals for candidates in some recent, unfinalized block.
		#[codec(index = 1)]
		Approvals(Vec<IndirectSignedApprovalVote>),
	}

	/// All network messages on the validation peer-set.
	#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
	pub enum ValidationProtocol {
		/// Approval distribution messages
		#[codec(index = 4)]
		ApprovalDistribution(ApprovalDistributionMessage),
	}
}

/// vstaging protocol types.
pub mod vstaging {
	use polkadot_node_primitives::{
		CandidateHash, GroupIndex, Hash, ParaId, SignedStatement,
	};
	use bitvec::{order::Lsb0, slice::BitSlice, vec::BitVec};
	use parity_scale_codec::{Decode, Encode};

	pub use super::v1::ApprovalDistributionMessage;

	/// A summary of which statements about a candidate are known by a peer.
	///
	/// Both bitfields are indexed by the position of the validator in the backing group.
	#[derive(Debug, Default, Clone, PartialEq, Eq, Encode, Decode)]
	pub struct StatementFilter {
		/// Seconded statements. '1' is known or undesired.
		pub seconded_in_group: BitVec<u8, Lsb0>,
		/// Valid statements. '1' is known or undesired.
		pub validated_in_group: BitVec<u8, Lsb0>,
	}

	impl StatementFilter {
		/// Create a new blank filter with the given group size.
		pub fn blank(group_size: usize) -> Self {
			StatementFilter {
				seconded_in_group: BitVec::repeat(false, group_size),
				validated_in_group: BitVec::repeat(false, group_size),
			}
		}

		/// Create a new full filter with the given group size.
		pub fn full(group_size: usize) -> Self {
			StatementFilter {
				seconded_in_group: BitVec::repeat(true, group_size),
				validated_in_group: BitVec::repeat(true, group_size),
			}
		}

		/// Whether the filter has a specific expected length, consistent across both
		/// bitfields.
		pub fn has_len(&self, len: usize) -> bool {
			self.seconded_in_group.len() == len && self.validated_in_group.len() == len
		}

		/// Determine the number of backing validators in the statement filter.
		pub fn backing_validators(&self) -> usize {
			self.seconded_in_group
				.iter()
				.by_vals()
				.zip(self.validated_in_group.iter().by_vals())
				.filter(|&(s, v)| s || v)
				.count()
		}

		/// Whether the statement filter has at least one seconded statement.
		pub fn has_seconded(&self) -> bool {
			self.seconded_in_group.iter().by_vals().any(|x| x)
		}

		/// Mask out `Seconded` statements in `self` according to the provided
		/// bitvec. Bits appearing in `mask` will not appear in `self` afterwards.
		pub fn mask_seconded(&mut self, mask: &BitSlice<u8, Lsb0>) {
			for (mut x, mask) in self.seconded_in_group.iter_mut().zip(mask.iter().by_vals()) {
				*x = *x && !mask;
			}
		}

		/// Mask out `Valid` statements in `self` according to the provided
		/// bitvec. Bits appearing in `mask` will not appear in `self` afterwards.
		pub fn mask_valid(&mut self, mask: &BitSlice<u8, Lsb0>) {
			for (mut x, mask) in self.validated_in_group.iter_mut().zip(mask.iter().by_vals()) {
				*x = *x && !mask;
			}
		}
	}

	/// A manifest of a known backed candidate, along with a description
	/// of the statements backing it.
	#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
	pub struct BackedCandidateManifest {
		/// The relay-parent of the candidate.
		pub relay_parent: Hash,
		/// The hash of the candidate.
		pub candidate_hash: CandidateHash,
		/// The group index backing the candidate at the relay-parent.
		pub group_index: GroupIndex,
		/// The para ID of the candidate.
		pub para_id: ParaId,
		/// The head-data corresponding to the candidate.
		pub parent_head_data_hash: Hash,
		/// A statement filter which indicates which validators in the
		/// para's group at the relay-parent have validated this candidate
		/// and issued statements about it, to the advertiser's knowledge.
		///
		/// This MUST have exactly the minimum amount of bytes
		/// necessary to represent the number of validators in the assigned
		/// backing group as-of the relay-parent.
		pub statement_knowledge: StatementFilter,
	}

	/// An acknowledgement of a backed candidate being known.
	#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
	pub struct BackedCandidateAcknowledgement {
		/// The hash of the candidate.
		pub candidate_hash: CandidateHash,
		/// A statement filter which indicates which validators in the
		/// para's group at the relay-parent have validated this candidate
		/// and issued statements about it, to the advertiser's knowledge.
		pub statement_knowledge: StatementFilter,
	}

	/// Network messages used by the statement distribution subsystem.
	#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
	pub enum StatementDistributionMessage {
		/// A notification of a signed statement in compact form, for a given relay parent.
		#[codec(index = 0)]
		Statement(Hash, SignedStatement),

		/// A notification of a backed candidate being known by the
		/// sending node, for the purpose of being requested by the receiving node
		/// if needed.
		#[codec(index = 1)]
		BackedCandidateManifest(BackedCandidateManifest),

		/// A notification of a backed candidate being known by the sending node,
		/// for the purpose of informing a receiving node which already has the candidate.
		#[codec(index = 2)]
		BackedCandidateKnown(BackedCandidateAcknowledgement),
	}

	/// All network messages on the validation peer-set.
	#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
	pub enum ValidationProtocol {
		/// Statement distribution messages
		#[codec(index = 3)]
		StatementDistribution(StatementDistributionMessage),
		/// Approval distribution messages
		#[codec(index = 4)]
		ApprovalDistribution(ApprovalDistributionMessage),
	}
}
