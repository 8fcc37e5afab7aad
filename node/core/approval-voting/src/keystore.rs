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

//! Lookup of the local signing keys.

use polkadot_node_primitives::{AssignmentId, ValidatorId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Read-only access to the sr25519 keys held by this node.
pub trait Keystore: Send + Sync {
	/// The keypair behind the given assignment key, if we hold it.
	fn assignment_keypair(&self, public: &AssignmentId) -> Option<schnorrkel::Keypair>;

	/// The keypair behind the given validator key, if we hold it.
	fn validator_keypair(&self, public: &ValidatorId) -> Option<schnorrkel::Keypair>;
}

/// An in-memory keystore. The same keypair may serve as both the assignment and the validator
/// key.
#[derive(Default)]
pub struct LocalKeystore {
	keys: RwLock<HashMap<[u8; 32], schnorrkel::Keypair>>,
}

impl LocalKeystore {
	/// An empty keystore.
	pub fn in_memory() -> Self {
		Self::default()
	}

	/// Add a keypair, returning its public key bytes.
	pub fn insert(&self, pair: schnorrkel::Keypair) -> [u8; 32] {
		let public = pair.public.to_bytes();
		self.keys.write().insert(public, pair);
		public
	}

	fn get(&self, public: &[u8; 32]) -> Option<schnorrkel::Keypair> {
		self.keys.read().get(public).cloned()
	}
}

impl Keystore for LocalKeystore {
	fn assignment_keypair(&self, public: &AssignmentId) -> Option<schnorrkel::Keypair> {
		self.get(&public.0)
	}

	fn validator_keypair(&self, public: &ValidatorId) -> Option<schnorrkel::Keypair> {
		self.get(&public.0)
	}
}
