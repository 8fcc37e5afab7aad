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

//! Types relevant for approval.

use parity_scale_codec::{Decode, Encode, EncodeLike, Input, Output};

use crate::{
	BabeAuthorityId, BlockNumber, CandidateHash, CandidateIndex, CoreIndex, Hash, Header,
	SessionIndex, Slot, ValidatorIndex, ValidatorSignature,
};

/// Validators assigning to check a particular candidate are split up into tranches.
/// Earlier tranches of validators check first, with later tranches serving as backup.
pub type DelayTranche = u32;

/// A static context used to compute the Relay VRF story based on the
/// VRF output included in the header-chain.
pub const RELAY_VRF_STORY_CONTEXT: &[u8] = b"A&V RC-VRF";

/// A static context used for all relay-vrf-modulo VRFs.
pub const RELAY_VRF_MODULO_CONTEXT: &[u8] = b"A&V MOD";

/// A static context used for all relay-vrf-delay VRFs.
pub const RELAY_VRF_DELAY_CONTEXT: &[u8] = b"A&V DELAY";

/// A static context used for transcripts indicating assigned availability core.
pub const ASSIGNED_CORE_CONTEXT: &[u8] = b"A&V ASSIGNED";

/// A static context associated with producing randomness for a core.
pub const CORE_RANDOMNESS_CONTEXT: &[u8] = b"A&V CORE";

/// A static context associated with producing randomness for a tranche.
pub const TRANCHE_RANDOMNESS_CONTEXT: &[u8] = b"A&V TRANCHE";

/// The engine id of BABE, used as the label of its VRF transcripts.
pub const BABE_ENGINE_ID: [u8; 4] = *b"BABE";

/// Random bytes derived from the VRF submitted within the block by the
/// block author as a credential and used as input to approval assignment criteria.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct RelayVRFStory(pub [u8; 32]);

/// The output of a VRF evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfOutput(pub schnorrkel::vrf::VRFOutput);

impl Encode for VrfOutput {
	fn size_hint(&self) -> usize {
		32
	}

	fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
		self.0.as_bytes().encode_to(dest)
	}
}

impl EncodeLike for VrfOutput {}

impl Decode for VrfOutput {
	fn decode<I: Input>(input: &mut I) -> Result<Self, parity_scale_codec::Error> {
		let bytes = <[u8; 32]>::decode(input)?;
		schnorrkel::vrf::VRFOutput::from_bytes(&bytes[..])
			.map(VrfOutput)
			.map_err(|_| "malformed VRF output".into())
	}
}

/// The proof accompanying a VRF output.
#[derive(Debug, Clone)]
pub struct VrfProof(pub schnorrkel::vrf::VRFProof);

impl PartialEq for VrfProof {
	fn eq(&self, other: &Self) -> bool {
		self.0.to_bytes() == other.0.to_bytes()
	}
}

impl Eq for VrfProof {}

impl Encode for VrfProof {
	fn size_hint(&self) -> usize {
		64
	}

	fn encode_to<T: Output + ?Sized>(&self, dest: &mut T) {
		self.0.to_bytes().encode_to(dest)
	}
}

impl EncodeLike for VrfProof {}

impl Decode for VrfProof {
	fn decode<I: Input>(input: &mut I) -> Result<Self, parity_scale_codec::Error> {
		let bytes = <[u8; 64]>::decode(input)?;
		schnorrkel::vrf::VRFProof::from_bytes(&bytes[..])
			.map(VrfProof)
			.map_err(|_| "malformed VRF proof".into())
	}
}

/// A VRF output paired with the proof of its correct evaluation.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct VrfSignature {
	/// The VRF output.
	pub output: VrfOutput,
	/// The VRF proof.
	pub proof: VrfProof,
}

/// Different kinds of input data or criteria that can prove a validator's assignment
/// to check a particular parachain.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum AssignmentCertKind {
	/// An assignment story based on the VRF that authorized the relay-chain block where the
	/// candidate was included combined with a sample number.
	///
	/// The context used to produce bytes is [`RELAY_VRF_MODULO_CONTEXT`]
	RelayVRFModulo {
		/// The sample number used in this cert.
		sample: u32,
	},
	/// An assignment story based on the VRF that authorized the relay-chain block where the
	/// candidate was included combined with the index of a particular core.
	///
	/// The context is [`RELAY_VRF_DELAY_CONTEXT`]
	RelayVRFDelay {
		/// The core index chosen in this cert.
		core_index: CoreIndex,
	},
}

/// A certification of assignment.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct AssignmentCert {
	/// The criterion which is claimed to be met by this cert.
	pub kind: AssignmentCertKind,
	/// The VRF signature showing the criterion is met.
	pub vrf: VrfSignature,
}

/// An assignment criterion which refers to the candidate under which the assignment is
/// relevant by block hash.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct IndirectAssignmentCert {
	/// A block hash where the candidate appears.
	pub block_hash: Hash,
	/// The validator index.
	pub validator: ValidatorIndex,
	/// The cert itself.
	pub cert: AssignmentCert,
}

/// A signed approval vote which references the candidate indirectly via the block.
///
/// In practice, we have a look-up from block hash and candidate index to candidate hash,
/// so this can be transformed into a signed [`ApprovalVote`].
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct IndirectSignedApprovalVote {
	/// A block hash where the candidate appears.
	pub block_hash: Hash,
	/// The index of the candidate in the list of candidates fully included as-of the block.
	pub candidate_index: CandidateIndex,
	/// The validator index.
	pub validator: ValidatorIndex,
	/// The signature by the validator.
	pub signature: ValidatorSignature,
}

/// A vote of approval on a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ApprovalVote(pub CandidateHash);

impl ApprovalVote {
	/// Yields the signing payload for this approval vote.
	pub fn signing_payload(&self, session_index: SessionIndex) -> Vec<u8> {
		const MAGIC: [u8; 4] = *b"APPR";

		(MAGIC, &self.0, session_index).encode()
	}
}

/// Metadata about a block which is now live in the approval protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockApprovalMeta {
	/// The hash of the block.
	pub hash: Hash,
	/// The number of the block.
	pub number: BlockNumber,
	/// The hash of the parent block.
	pub parent_hash: Hash,
	/// The candidates included by the block.
	/// Note that these are not the same as the candidates that appear within the block body.
	pub candidates: Vec<CandidateHash>,
	/// The consensus slot of the block.
	pub slot: Slot,
	/// The session of the block.
	pub session: SessionIndex,
}

/// Errors that can occur during the approvals protocol.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum ApprovalError {
	#[error("Schnorrkel signature error")]
	SchnorrkelSignature(schnorrkel::errors::SignatureError),
	#[error("Authority index {0} out of bounds")]
	AuthorityOutOfBounds(usize),
}

/// The result type of [`IndirectAssignmentCert`] checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentCheckResult {
	/// The vote was accepted and should be propagated onwards.
	Accepted,
	/// The vote was valid but duplicate and should not be propagated onwards.
	AcceptedDuplicate,
	/// The vote was valid but too far in the future to accept right now.
	TooFarInFuture,
	/// The vote was bad and should be ignored, reporting the peer who propagated it.
	Bad(AssignmentCheckError),
}

/// The error result type of [`IndirectAssignmentCert`] checking.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AssignmentCheckError {
	#[error("Unknown block: {0:?}")]
	UnknownBlock(Hash),
	#[error("Unknown session index: {0}")]
	UnknownSessionIndex(SessionIndex),
	#[error("Invalid candidate index: {0}")]
	InvalidCandidateIndex(CandidateIndex),
	#[error("Invalid candidate {0}: {1:?}")]
	InvalidCandidate(CandidateIndex, CandidateHash),
	#[error("Invalid cert: {0:?}, reason: {1}")]
	InvalidCert(ValidatorIndex, String),
	#[error("Internal state mismatch: {0:?}, {1:?}")]
	Internal(Hash, CandidateHash),
}

/// The result type of [`IndirectSignedApprovalVote`] checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalCheckResult {
	/// The vote was accepted and should be propagated onwards.
	Accepted,
	/// The vote was bad and should be ignored, reporting the peer who propagated it.
	Bad(ApprovalCheckError),
}

/// The error result type of [`IndirectSignedApprovalVote`] checking.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ApprovalCheckError {
	#[error("Unknown block: {0:?}")]
	UnknownBlock(Hash),
	#[error("Unknown session index: {0}")]
	UnknownSessionIndex(SessionIndex),
	#[error("Invalid candidate index: {0}")]
	InvalidCandidateIndex(CandidateIndex),
	#[error("Invalid validator index: {0:?}")]
	InvalidValidatorIndex(ValidatorIndex),
	#[error("Invalid candidate {0}: {1:?}")]
	InvalidCandidate(CandidateIndex, CandidateHash),
	#[error("Invalid signature: {0:?}")]
	InvalidSignature(ValidatorIndex),
	#[error("No assignment for {0:?}")]
	NoAssignment(ValidatorIndex),
	#[error("Internal state mismatch: {0:?}, {1:?}")]
	Internal(Hash, CandidateHash),
}

/// The BABE VRF transcript for a given slot and epoch.
pub fn babe_vrf_transcript(randomness: &[u8; 32], slot: Slot, epoch: u64) -> merlin::Transcript {
	let mut transcript = merlin::Transcript::new(&BABE_ENGINE_ID);
	transcript.append_u64(b"slot number", slot.0);
	transcript.append_u64(b"current epoch", epoch);
	transcript.append_message(b"chain randomness", &randomness[..]);
	transcript
}

/// An unsafe VRF output. Provide BABE Epoch info to create a `RelayVRFStory`.
pub struct UnsafeVRFOutput {
	vrf_output: VrfOutput,
	slot: Slot,
	authority_index: u32,
}

impl UnsafeVRFOutput {
	/// Get the slot.
	pub fn slot(&self) -> Slot {
		self.slot
	}

	/// Compute the randomness associated with this VRF output.
	pub fn compute_randomness(
		self,
		authorities: &[BabeAuthorityId],
		randomness: &[u8; 32],
		epoch_index: u64,
	) -> Result<RelayVRFStory, ApprovalError> {
		let author = match authorities.get(self.authority_index as usize) {
			None => return Err(ApprovalError::AuthorityOutOfBounds(self.authority_index as _)),
			Some(x) => x,
		};

		let pubkey = schnorrkel::PublicKey::from_bytes(&author.0[..])
			.map_err(ApprovalError::SchnorrkelSignature)?;

		let transcript = babe_vrf_transcript(randomness, self.slot, epoch_index);

		let inout = self
			.vrf_output
			.0
			.attach_input_hash(&pubkey, transcript)
			.map_err(ApprovalError::SchnorrkelSignature)?;
		Ok(RelayVRFStory(inout.make_bytes(RELAY_VRF_STORY_CONTEXT)))
	}
}

/// Extract the slot number and relay VRF from a header.
///
/// This fails if there is no BABE digest or its VRF output is malformed.
pub fn babe_unsafe_vrf_info(header: &Header) -> Option<UnsafeVRFOutput> {
	let pre = header.babe_pre_digest.as_ref()?;
	let vrf_output = schnorrkel::vrf::VRFOutput::from_bytes(&pre.vrf_output[..]).ok()?;

	Some(UnsafeVRFOutput {
		vrf_output: VrfOutput(vrf_output),
		slot: pre.slot,
		authority_index: pre.authority_index,
	})
}
