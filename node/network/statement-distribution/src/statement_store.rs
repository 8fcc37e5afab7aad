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

//! A store of all statements under a given relay-parent.
//!
//! This structure doesn't attempt to do any spam protection, which must
//! be provided at a higher level.
//!
//! Statements are indexed by their signer and, per backing group and candidate,
//! as bitfields over the group which feed the statement filters of manifests.

use polkadot_node_network_protocol::vstaging::StatementFilter;
use polkadot_node_primitives::{
	CandidateHash, CompactStatement, GroupIndex, SignedStatement, ValidatorIndex,
};
use bitvec::{order::Lsb0 as BitOrderLsb0, vec::BitVec};

use std::collections::hash_map::{Entry as HEntry, HashMap};

use crate::groups::Groups;

/// Storage for statements. Intended to be used for statements signed under
/// the same relay-parent. See module docs for more details.
#[derive(Debug)]
pub struct StatementStore {
	validator_meta: HashMap<ValidatorIndex, ValidatorMeta>,
	group_statements: HashMap<(GroupIndex, CandidateHash), GroupStatements>,
	known_statements: HashMap<Fingerprint, SignedStatement>,
}

impl StatementStore {
	/// Create a new [`StatementStore`]
	pub fn new(groups: &Groups) -> Self {
		let mut validator_meta = HashMap::new();
		for (g, group) in groups.all().iter().enumerate() {
			for (i, v) in group.iter().enumerate() {
				validator_meta.insert(
					*v,
					ValidatorMeta {
						seconded_count: 0,
						within_group_index: i,
						group: GroupIndex(g as _),
						group_size: group.len(),
					},
				);
			}
		}

		StatementStore {
			validator_meta,
			group_statements: HashMap::new(),
			known_statements: HashMap::new(),
		}
	}

	/// Insert a statement. Returns `true` if was not known already, `false` if it was.
	/// Ignores statements by unknown validators and returns `false`.
	pub fn insert(&mut self, statement: SignedStatement) -> bool {
		let validator_index = statement.validator_index();

		let validator_meta = match self.validator_meta.get_mut(&validator_index) {
			None => return false,
			Some(m) => m,
		};

		let compact = *statement.payload();
		match self.known_statements.entry((validator_index, compact)) {
			HEntry::Occupied(_) => return false,
			HEntry::Vacant(e) => {
				e.insert(statement);
			},
		}

		let group_statements = self
			.group_statements
			.entry((validator_meta.group, *compact.candidate_hash()))
			.or_insert_with(|| GroupStatements::with_group_size(validator_meta.group_size));

		match compact {
			CompactStatement::Seconded(_) => {
				validator_meta.seconded_count += 1;
				group_statements.note_seconded(validator_meta.within_group_index);
			},
			CompactStatement::Valid(_) => {
				group_statements.note_validated(validator_meta.within_group_index);
			},
		}

		true
	}

	/// Fill a `StatementFilter` to be used in the grid topology with all statements
	/// we have on record for the candidate.
	pub fn fill_statement_filter(
		&self,
		group_index: GroupIndex,
		candidate_hash: CandidateHash,
		statement_filter: &mut StatementFilter,
	) {
		if let Some(statements) = self.group_statements.get(&(group_index, candidate_hash)) {
			for i in statements.seconded_statements.iter_ones() {
				if let Some(mut b) = statement_filter.seconded_in_group.get_mut(i) {
					*b = true;
				}
			}

			for i in statements.valid_statements.iter_ones() {
				if let Some(mut b) = statement_filter.validated_in_group.get_mut(i) {
					*b = true;
				}
			}
		}
	}

	/// Get a statement by validator index and compact form.
	pub fn validator_statement(
		&self,
		validator_index: ValidatorIndex,
		statement: CompactStatement,
	) -> Option<&SignedStatement> {
		self.known_statements.get(&(validator_index, statement))
	}

	/// The number of distinct candidates a validator has seconded.
	pub fn seconded_count(&self, validator_index: &ValidatorIndex) -> usize {
		self.validator_meta.get(validator_index).map_or(0, |m| m.seconded_count)
	}
}

type Fingerprint = (ValidatorIndex, CompactStatement);

#[derive(Debug)]
struct ValidatorMeta {
	group: GroupIndex,
	group_size: usize,
	within_group_index: usize,
	seconded_count: usize,
}

#[derive(Debug)]
struct GroupStatements {
	seconded_statements: BitVec<u8, BitOrderLsb0>,
	valid_statements: BitVec<u8, BitOrderLsb0>,
}

impl GroupStatements {
	fn with_group_size(group_size: usize) -> Self {
		GroupStatements {
			seconded_statements: BitVec::repeat(false, group_size),
			valid_statements: BitVec::repeat(false, group_size),
		}
	}

	fn note_seconded(&mut self, within_group_index: usize) {
		self.seconded_statements.set(within_group_index, true);
	}

	fn note_validated(&mut self, within_group_index: usize) {
		self.valid_statements.set(within_group_index, true);
	}
}
