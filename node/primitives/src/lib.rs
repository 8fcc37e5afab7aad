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

//! Primitive types used by the approval subsystems.
//!
//! These cover identifiers, session information, candidate receipts and the signed
//! statements exchanged between validators. Cryptography is consumed through `schnorrkel`;
//! nothing here implements signature or VRF math.

#![warn(missing_docs)]

use parity_scale_codec::{Decode, Encode};

pub use primitive_types::H256;

pub mod approval;

/// A hash of a relay-chain block or any other 32-byte digest.
pub type Hash = H256;

/// The number of a relay-chain block.
pub type BlockNumber = u32;

/// The index of a session.
pub type SessionIndex = u32;

/// The index of a candidate in the list of candidates fully included as-of a block.
pub type CandidateIndex = u32;

/// The signing context used for all sr25519 signatures produced by validators.
pub const SIGNING_CTX: &[u8] = b"substrate";

/// Compute the 256-bit blake2b hash of some data.
pub fn blake2_256(data: &[u8]) -> Hash {
	let digest = blake2b_simd::Params::new().hash_length(32).hash(data);
	Hash::from_slice(digest.as_bytes())
}

macro_rules! index_type {
	($(#[$attr:meta])* $name:ident) => {
		$(#[$attr])*
		#[derive(
			Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode,
		)]
		pub struct $name(pub u32);

		impl From<u32> for $name {
			fn from(i: u32) -> Self {
				$name(i)
			}
		}

		impl std::fmt::Display for $name {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				std::fmt::Display::fmt(&self.0, f)
			}
		}
	};
}

index_type!(
	/// Index of a validator in the session's validator set.
	ValidatorIndex
);
index_type!(
	/// Index of a backing group in the session.
	GroupIndex
);
index_type!(
	/// Index of an availability core.
	CoreIndex
);
index_type!(
	/// Unique identifier of a parachain.
	ParaId
);

/// A consensus slot number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Slot(pub u64);

impl From<u64> for Slot {
	fn from(slot: u64) -> Self {
		Slot(slot)
	}
}

impl From<Slot> for u64 {
	fn from(slot: Slot) -> u64 {
		slot.0
	}
}

/// The hash of a candidate receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct CandidateHash(pub Hash);

impl std::fmt::Display for CandidateHash {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		std::fmt::Display::fmt(&self.0, f)
	}
}

macro_rules! public_key_type {
	($(#[$attr:meta])* $name:ident) => {
		$(#[$attr])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
		pub struct $name(pub [u8; 32]);

		impl $name {
			/// Interpret the key as an sr25519 public key.
			pub fn to_public(&self) -> Option<schnorrkel::PublicKey> {
				schnorrkel::PublicKey::from_bytes(&self.0[..]).ok()
			}
		}

		impl From<schnorrkel::PublicKey> for $name {
			fn from(public: schnorrkel::PublicKey) -> Self {
				$name(public.to_bytes())
			}
		}
	};
}

public_key_type!(
	/// The public key a validator signs statements and approvals with.
	ValidatorId
);
public_key_type!(
	/// The public key a validator computes approval assignments with.
	AssignmentId
);
public_key_type!(
	/// The public key of a block-production authority.
	BabeAuthorityId
);

/// An sr25519 signature produced by a validator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct ValidatorSignature(pub [u8; 64]);

impl std::fmt::Debug for ValidatorSignature {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "ValidatorSignature(0x")?;
		for byte in &self.0[..8] {
			write!(f, "{:02x}", byte)?;
		}
		write!(f, "..)")
	}
}

impl ValidatorSignature {
	/// Sign a payload with the given keypair.
	pub fn sign(pair: &schnorrkel::Keypair, payload: &[u8]) -> Self {
		ValidatorSignature(pair.sign_simple(SIGNING_CTX, payload).to_bytes())
	}

	/// Verify the signature over `payload` against the given public key.
	pub fn verify(&self, payload: &[u8], key: &ValidatorId) -> bool {
		let public = match key.to_public() {
			Some(p) => p,
			None => return false,
		};

		schnorrkel::Signature::from_bytes(&self.0[..])
			.and_then(|sig| public.verify_simple(SIGNING_CTX, payload, &sig))
			.is_ok()
	}
}

/// Head data of a parachain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct HeadData(pub Vec<u8>);

impl HeadData {
	/// The hash of the head data.
	pub fn hash(&self) -> Hash {
		blake2_256(&self.0)
	}
}

/// The code executed to validate candidates of a parachain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct ValidationCode(pub Vec<u8>);

/// The hash of some validation code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct ValidationCodeHash(pub Hash);

impl ValidationCode {
	/// The hash of the validation code.
	pub fn hash(&self) -> ValidationCodeHash {
		ValidationCodeHash(blake2_256(&self.0))
	}
}

/// A proof of validity of a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct PoV {
	/// The block witness data.
	pub block_data: Vec<u8>,
}

impl PoV {
	/// The hash of the PoV.
	pub fn hash(&self) -> Hash {
		blake2_256(&self.encode())
	}
}

/// The parachain-relevant state of the relay chain at the moment of candidate creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct PersistedValidationData {
	/// The parent head data.
	pub parent_head: HeadData,
	/// The relay-chain block number this is in the context of.
	pub relay_parent_number: BlockNumber,
	/// The maximum legal size of a PoV block, in bytes.
	pub max_pov_size: u32,
}

/// The data recovered from the availability layer for a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AvailableData {
	/// The proof of validity.
	pub pov: PoV,
	/// The persisted validation data needed for approval checks.
	pub validation_data: PersistedValidationData,
}

/// The fields of a candidate which commit to its context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct CandidateDescriptor {
	/// The parachain the candidate is for.
	pub para_id: ParaId,
	/// The relay-chain block the candidate is built upon.
	pub relay_parent: Hash,
	/// The hash of the proof of validity.
	pub pov_hash: Hash,
	/// The hash of the head data produced by the candidate.
	pub para_head: Hash,
	/// The hash of the validation code the candidate is checked against.
	pub validation_code_hash: ValidationCodeHash,
}

/// A receipt of a backed candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct CandidateReceipt {
	/// The descriptor of the candidate.
	pub descriptor: CandidateDescriptor,
	/// The hash of the candidate's commitments.
	pub commitments_hash: Hash,
}

impl CandidateReceipt {
	/// Get a reference to the candidate descriptor.
	pub fn descriptor(&self) -> &CandidateDescriptor {
		&self.descriptor
	}

	/// Computes the blake2-256 hash of the receipt.
	pub fn hash(&self) -> CandidateHash {
		CandidateHash(blake2_256(&self.encode()))
	}
}

/// Information about validator sets of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct SessionInfo {
	/// Validators in canonical ordering.
	pub validators: Vec<ValidatorId>,
	/// The assignment keys for validators, in the same ordering as `validators`.
	pub assignment_keys: Vec<AssignmentId>,
	/// Validators in shuffled ordering, split into backing groups.
	pub validator_groups: Vec<Vec<ValidatorIndex>>,
	/// The number of availability cores used by the protocol during this session.
	pub n_cores: u32,
	/// The zeroth delay tranche width.
	pub zeroth_delay_tranche_width: u32,
	/// The number of samples we do of `relay_vrf_modulo`.
	pub relay_vrf_modulo_samples: u32,
	/// The number of delay tranches in total.
	pub n_delay_tranches: u32,
	/// How many slots must pass before an assignment is considered a "no-show".
	pub no_show_slots: u32,
	/// The number of validators needed to approve a block.
	pub needed_approvals: u32,
}

/// The BABE pre-runtime digest carried by a relay-chain header.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BabePreDigest {
	/// The slot the block was authored in.
	pub slot: Slot,
	/// The index of the authority in the epoch's authority set.
	pub authority_index: u32,
	/// The VRF output of the block author.
	pub vrf_output: [u8; 32],
}

/// A relay-chain block header, reduced to what approval voting consumes.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Header {
	/// The parent hash.
	pub parent_hash: Hash,
	/// The block number.
	pub number: BlockNumber,
	/// The state root.
	pub state_root: Hash,
	/// The BABE digest, if any.
	pub babe_pre_digest: Option<BabePreDigest>,
	/// A request to force-approve all blocks up to and including the given number.
	pub force_approve: Option<BlockNumber>,
}

impl Header {
	/// The hash of the header.
	pub fn hash(&self) -> Hash {
		blake2_256(&self.encode())
	}
}

/// The context of a signed statement: the session and the relay parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SigningContext {
	/// The session index the signature is made in.
	pub session_index: SessionIndex,
	/// The relay parent the signature is made at.
	pub parent_hash: Hash,
}

/// A statement about the validity of a parachain candidate, referring to the candidate
/// by hash only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum CompactStatement {
	/// A validator seconds the candidate.
	#[codec(index = 1)]
	Seconded(CandidateHash),
	/// A validator deems the candidate valid.
	#[codec(index = 2)]
	Valid(CandidateHash),
}

impl CompactStatement {
	/// The hash of the candidate the statement refers to.
	pub fn candidate_hash(&self) -> &CandidateHash {
		match self {
			CompactStatement::Seconded(h) | CompactStatement::Valid(h) => h,
		}
	}

	/// Get the signing payload of the statement.
	pub fn signing_payload(&self, context: &SigningContext) -> Vec<u8> {
		(b"BKNG", self, context).encode()
	}
}

/// A compact statement signed by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SignedStatement {
	statement: CompactStatement,
	validator_index: ValidatorIndex,
	signature: ValidatorSignature,
}

impl SignedStatement {
	/// Sign a statement in the given context.
	pub fn sign(
		pair: &schnorrkel::Keypair,
		statement: CompactStatement,
		context: &SigningContext,
		validator_index: ValidatorIndex,
	) -> Self {
		let signature = ValidatorSignature::sign(pair, &statement.signing_payload(context));
		SignedStatement { statement, validator_index, signature }
	}

	/// Check the signature against the claimed validator key.
	pub fn check_signature(&self, context: &SigningContext, key: &ValidatorId) -> bool {
		self.signature.verify(&self.statement.signing_payload(context), key)
	}

	/// The statement itself.
	pub fn payload(&self) -> &CompactStatement {
		&self.statement
	}

	/// The validator index of the signer.
	pub fn validator_index(&self) -> ValidatorIndex {
		self.validator_index
	}

	/// The signature.
	pub fn signature(&self) -> &ValidatorSignature {
		&self.signature
	}
}

/// Derive a deterministic sr25519 keypair from a seed. Intended for tests and
/// development keystores.
pub fn keypair_from_seed(seed: [u8; 32]) -> Option<schnorrkel::Keypair> {
	schnorrkel::MiniSecretKey::from_bytes(&seed[..])
		.ok()
		.map(|mini| mini.expand_to_keypair(schnorrkel::ExpansionMode::Ed25519))
}
