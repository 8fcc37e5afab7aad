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

//! Direct distribution of statements among the members of a backing group.
//!
//! Validators in the same group exchange statements directly, before the
//! candidate is backed. The only resource bound we rely on is the number of
//! `Seconded` statements each validator may issue at a relay-parent: a bounded
//! number of `Seconded` statements implies a bounded number of `Valid`
//! statements about the same candidates.
//!
//! A misbehaving validator may show different sets of `Seconded` statements to
//! different members of the group. We accept such statements from an honest
//! relayer "with prejudice" so the relayer isn't punished, but we never forward
//! more than the limit from any one originator. In the worst case this leaves
//! `limit * group_size^2` statements in memory, which is small for realistic
//! group sizes.

use polkadot_node_primitives::{CandidateHash, CompactStatement, ValidatorIndex};

use std::collections::{HashMap, HashSet};

/// A statement together with the validator that signed it.
type Fingerprint = (ValidatorIndex, CompactStatement);

/// What we know about the statements a single group member has seen.
#[derive(Debug, Default)]
struct MemberKnowledge {
	// statements the member sent to us.
	received: HashSet<Fingerprint>,
	// statements we sent to the member.
	sent: HashSet<Fingerprint>,
	// candidates the member is aware of because a `Seconded` statement
	// crossed the link in either direction.
	received_candidates: HashSet<CandidateHash>,
	sent_candidates: HashSet<CandidateHash>,
	// candidates the member itself seconded, counted against the limit.
	seconded: HashSet<CandidateHash>,
}

impl MemberKnowledge {
	fn knows_statement(&self, fingerprint: &Fingerprint) -> bool {
		self.received.contains(fingerprint) || self.sent.contains(fingerprint)
	}

	fn received_seconded_from(&self, originator: ValidatorIndex) -> usize {
		self.received
			.iter()
			.filter(|(orig, s)| {
				*orig == originator && matches!(s, CompactStatement::Seconded(_))
			})
			.count()
	}
}

/// Tracks the statements exchanged with the other members of our backing group
/// at a single relay-parent.
#[derive(Debug)]
pub struct ClusterTracker {
	validators: Vec<ValidatorIndex>,
	seconding_limit: usize,
	members: HashMap<ValidatorIndex, MemberKnowledge>,
	// statements we know that a member doesn't, keyed by the member.
	pending: HashMap<ValidatorIndex, HashSet<Fingerprint>>,
}

impl ClusterTracker {
	/// Create a tracker for the given cluster. `None` when the cluster is empty.
	pub fn new(cluster_validators: Vec<ValidatorIndex>, seconding_limit: usize) -> Option<Self> {
		if cluster_validators.is_empty() {
			return None
		}

		Some(ClusterTracker {
			validators: cluster_validators,
			seconding_limit,
			members: HashMap::new(),
			pending: HashMap::new(),
		})
	}

	/// Query whether a statement from `originator`, relayed by `sender`, may be accepted.
	///
	/// `Valid` statements are not deduplicated across senders.
	pub fn can_receive(
		&self,
		sender: ValidatorIndex,
		originator: ValidatorIndex,
		statement: CompactStatement,
	) -> Result<Accept, RejectIncoming> {
		if !self.is_member(sender) || !self.is_member(originator) {
			return Err(RejectIncoming::NotInGroup)
		}

		let fingerprint = (originator, statement);
		if self.member(sender).map_or(false, |m| m.received.contains(&fingerprint)) {
			return Err(RejectIncoming::Duplicate)
		}

		match statement {
			CompactStatement::Seconded(candidate_hash) => {
				// the statement itself isn't counted, it was ruled out as a duplicate above.
				let already_relayed =
					self.member(sender).map_or(0, |m| m.received_seconded_from(originator));

				if already_relayed >= self.seconding_limit {
					return Err(RejectIncoming::ExcessiveSeconded)
				}

				if self.within_seconding_limit(originator, candidate_hash) {
					Ok(Accept::Ok)
				} else {
					Ok(Accept::WithPrejudice)
				}
			},
			CompactStatement::Valid(candidate_hash) =>
				if self.knows_candidate(sender, candidate_hash) {
					Ok(Accept::Ok)
				} else {
					Err(RejectIncoming::CandidateUnknown)
				},
		}
	}

	/// Note a statement we issued ourselves. It becomes pending for every member
	/// not already aware of it.
	pub fn note_issued(&mut self, originator: ValidatorIndex, statement: CompactStatement) {
		let fingerprint = (originator, statement);
		for member in self.validators.clone() {
			self.queue_unless_known(member, fingerprint);
		}
	}

	/// Note an accepted statement. Must follow a successful [`Self::can_receive`].
	pub fn note_received(
		&mut self,
		sender: ValidatorIndex,
		originator: ValidatorIndex,
		statement: CompactStatement,
	) {
		let fingerprint = (originator, statement);
		for member in self.validators.clone() {
			if member == sender {
				if let Some(pending) = self.pending.get_mut(&sender) {
					pending.remove(&fingerprint);
				}
			} else {
				self.queue_unless_known(member, fingerprint);
			}
		}

		let sender_knowledge = self.members.entry(sender).or_default();
		sender_knowledge.received.insert(fingerprint);
		if let CompactStatement::Seconded(candidate_hash) = statement {
			sender_knowledge.received_candidates.insert(candidate_hash);

			// statements accepted with prejudice are not counted towards the originator.
			if self.within_seconding_limit(originator, candidate_hash) {
				self.members.entry(originator).or_default().seconded.insert(candidate_hash);
			}
		}
	}

	/// Query whether we may send a statement to the given member.
	pub fn can_send(
		&self,
		target: ValidatorIndex,
		originator: ValidatorIndex,
		statement: CompactStatement,
	) -> Result<(), RejectOutgoing> {
		if !self.is_member(target) || !self.is_member(originator) {
			return Err(RejectOutgoing::NotInGroup)
		}

		if self.member(target).map_or(false, |m| m.knows_statement(&(originator, statement))) {
			return Err(RejectOutgoing::Known)
		}

		match statement {
			// every member gets the same `Seconded` statements: the first `limit`
			// from each originator.
			CompactStatement::Seconded(candidate_hash) =>
				if self.within_seconding_limit(originator, candidate_hash) {
					Ok(())
				} else {
					Err(RejectOutgoing::ExcessiveSeconded)
				},
			CompactStatement::Valid(candidate_hash) =>
				if self.knows_candidate(target, candidate_hash) {
					Ok(())
				} else {
					Err(RejectOutgoing::CandidateUnknown)
				},
		}
	}

	/// Note a statement sent to a member. Must follow a successful [`Self::can_send`].
	pub fn note_sent(
		&mut self,
		target: ValidatorIndex,
		originator: ValidatorIndex,
		statement: CompactStatement,
	) {
		let fingerprint = (originator, statement);
		let target_knowledge = self.members.entry(target).or_default();
		target_knowledge.sent.insert(fingerprint);

		if let CompactStatement::Seconded(candidate_hash) = statement {
			target_knowledge.sent_candidates.insert(candidate_hash);
			self.members.entry(originator).or_default().seconded.insert(candidate_hash);
		}

		if let Some(pending) = self.pending.get_mut(&target) {
			pending.remove(&fingerprint);
		}
	}

	/// All members of the cluster, including the local validator if it is one.
	pub fn targets(&self) -> &[ValidatorIndex] {
		&self.validators
	}

	/// Members which may relay statements signed by `originator`.
	/// Empty when the originator is outside the cluster.
	pub fn senders_for_originator(&self, originator: ValidatorIndex) -> &[ValidatorIndex] {
		if self.is_member(originator) {
			&self.validators[..]
		} else {
			&[]
		}
	}

	/// Whether the member is known to be aware of the candidate: a `Seconded`
	/// statement for it crossed our link with them, or they seconded it.
	pub fn knows_candidate(&self, validator: ValidatorIndex, candidate_hash: CandidateHash) -> bool {
		self.member(validator).map_or(false, |m| {
			m.sent_candidates.contains(&candidate_hash) ||
				m.received_candidates.contains(&candidate_hash) ||
				m.seconded.contains(&candidate_hash)
		})
	}

	/// Statements still to be sent to `target`, as `(originator, statement)`.
	/// `Seconded` statements come first.
	pub fn pending_statements_for(
		&self,
		target: ValidatorIndex,
	) -> Vec<(ValidatorIndex, CompactStatement)> {
		let mut pending = self
			.pending
			.get(&target)
			.map(|p| p.iter().copied().collect::<Vec<_>>())
			.unwrap_or_default();

		pending.sort_by_key(|(_, s)| match s {
			CompactStatement::Seconded(_) => 0u8,
			CompactStatement::Valid(_) => 1u8,
		});

		pending
	}

	// Either the validator already seconded this candidate or it has room for another.
	// A validator exactly at the limit which seconded this candidate is under-counted
	// by one, which yields `true` for both cases.
	fn within_seconding_limit(&self, validator: ValidatorIndex, candidate_hash: CandidateHash) -> bool {
		let others = self
			.member(validator)
			.map_or(0, |m| m.seconded.iter().filter(|c| **c != candidate_hash).count());

		others < self.seconding_limit
	}

	fn queue_unless_known(&mut self, member: ValidatorIndex, fingerprint: Fingerprint) {
		if self.member(member).map_or(false, |m| m.knows_statement(&fingerprint)) {
			return
		}

		self.pending.entry(member).or_default().insert(fingerprint);
	}

	fn member(&self, validator: ValidatorIndex) -> Option<&MemberKnowledge> {
		self.members.get(&validator)
	}

	fn is_member(&self, validator: ValidatorIndex) -> bool {
		self.validators.contains(&validator)
	}
}

/// An incoming statement was accepted.
#[derive(Debug, PartialEq)]
pub enum Accept {
	/// Neither the sender nor the originator exceeded any limit.
	Ok,
	/// The sender is honest but the originator seconded too many candidates.
	WithPrejudice,
}

/// An incoming statement was rejected.
#[derive(Debug, PartialEq)]
pub enum RejectIncoming {
	/// The sender relayed too many `Seconded` statements from one originator.
	ExcessiveSeconded,
	/// Sender or originator is outside the group.
	NotInGroup,
	/// A `Valid` statement for a candidate the sender never learned of.
	CandidateUnknown,
	/// The sender already sent this statement.
	Duplicate,
}

/// An outgoing statement was rejected.
#[derive(Debug, PartialEq)]
pub enum RejectOutgoing {
	/// A `Valid` statement for a candidate the target doesn't know.
	CandidateUnknown,
	/// The originator is past the seconding limit. Indicates a local bug.
	ExcessiveSeconded,
	/// The target already knows the statement.
	Known,
	/// Target or originator is outside the group.
	NotInGroup,
}

#[cfg(test)]
mod tests {
	use super::*;
	use polkadot_node_primitives::Hash;

	fn candidate(n: u8) -> CandidateHash {
		CandidateHash(Hash::repeat_byte(n))
	}

	fn group() -> Vec<ValidatorIndex> {
		vec![ValidatorIndex(5), ValidatorIndex(200), ValidatorIndex(24), ValidatorIndex(146)]
	}

	#[test]
	fn outsiders_are_rejected_both_ways() {
		let tracker = ClusterTracker::new(group(), 2).expect("non-empty");
		let seconded = CompactStatement::Seconded(candidate(1));

		assert_eq!(
			tracker.can_receive(ValidatorIndex(100), ValidatorIndex(5), seconded),
			Err(RejectIncoming::NotInGroup),
		);
		assert_eq!(
			tracker.can_receive(ValidatorIndex(5), ValidatorIndex(100), seconded),
			Err(RejectIncoming::NotInGroup),
		);
		assert_eq!(
			tracker.can_send(ValidatorIndex(100), ValidatorIndex(5), seconded),
			Err(RejectOutgoing::NotInGroup),
		);
		assert_eq!(tracker.can_receive(ValidatorIndex(5), ValidatorIndex(200), seconded), Ok(Accept::Ok));
	}

	#[test]
	fn empty_cluster_is_refused() {
		assert!(ClusterTracker::new(Vec::new(), 2).is_none());
	}

	#[test]
	fn relayer_over_limit_is_excessive() {
		let mut tracker = ClusterTracker::new(group(), 2).expect("non-empty");

		tracker.note_received(ValidatorIndex(5), ValidatorIndex(200), CompactStatement::Seconded(candidate(1)));
		tracker.note_received(ValidatorIndex(5), ValidatorIndex(200), CompactStatement::Seconded(candidate(2)));

		assert_eq!(
			tracker.can_receive(ValidatorIndex(5), ValidatorIndex(200), CompactStatement::Seconded(candidate(3))),
			Err(RejectIncoming::ExcessiveSeconded),
		);

		// another relayer is fine, but the originator is over its limit.
		assert_eq!(
			tracker.can_receive(ValidatorIndex(24), ValidatorIndex(200), CompactStatement::Seconded(candidate(3))),
			Ok(Accept::WithPrejudice),
		);

		// a candidate the originator already seconded is no prejudice.
		assert_eq!(
			tracker.can_receive(ValidatorIndex(24), ValidatorIndex(200), CompactStatement::Seconded(candidate(1))),
			Ok(Accept::Ok),
		);
	}

	#[test]
	fn duplicates_are_rejected() {
		let mut tracker = ClusterTracker::new(group(), 2).expect("non-empty");
		let statement = CompactStatement::Seconded(candidate(1));

		tracker.note_received(ValidatorIndex(5), ValidatorIndex(5), statement);
		assert_eq!(
			tracker.can_receive(ValidatorIndex(5), ValidatorIndex(5), statement),
			Err(RejectIncoming::Duplicate),
		);
	}

	#[test]
	fn valid_needs_known_candidate() {
		let mut tracker = ClusterTracker::new(group(), 2).expect("non-empty");
		let valid = CompactStatement::Valid(candidate(1));

		assert_eq!(
			tracker.can_receive(ValidatorIndex(5), ValidatorIndex(200), valid),
			Err(RejectIncoming::CandidateUnknown),
		);
		assert_eq!(
			tracker.can_send(ValidatorIndex(5), ValidatorIndex(200), valid),
			Err(RejectOutgoing::CandidateUnknown),
		);

		tracker.note_received(ValidatorIndex(5), ValidatorIndex(200), CompactStatement::Seconded(candidate(1)));
		assert_eq!(tracker.can_receive(ValidatorIndex(5), ValidatorIndex(200), valid), Ok(Accept::Ok));

		// 200 seconded it, so they know about it too.
		assert_eq!(tracker.can_send(ValidatorIndex(200), ValidatorIndex(24), valid), Ok(()));
		assert!(!tracker.knows_candidate(ValidatorIndex(146), candidate(1)));
	}

	#[test]
	fn sending_respects_knowledge_and_limit() {
		let mut tracker = ClusterTracker::new(group(), 1).expect("non-empty");
		let first = CompactStatement::Seconded(candidate(1));
		let second = CompactStatement::Seconded(candidate(2));

		assert_eq!(tracker.can_send(ValidatorIndex(24), ValidatorIndex(5), first), Ok(()));
		tracker.note_sent(ValidatorIndex(24), ValidatorIndex(5), first);

		assert_eq!(
			tracker.can_send(ValidatorIndex(24), ValidatorIndex(5), first),
			Err(RejectOutgoing::Known),
		);
		assert_eq!(
			tracker.can_send(ValidatorIndex(146), ValidatorIndex(5), second),
			Err(RejectOutgoing::ExcessiveSeconded),
		);
		assert_eq!(tracker.can_send(ValidatorIndex(146), ValidatorIndex(5), first), Ok(()));
	}

	#[test]
	fn pending_statements_track_what_members_lack() {
		let mut tracker = ClusterTracker::new(group(), 2).expect("non-empty");
		let seconded = CompactStatement::Seconded(candidate(1));
		let valid = CompactStatement::Valid(candidate(1));

		tracker.note_issued(ValidatorIndex(5), valid);
		tracker.note_received(ValidatorIndex(200), ValidatorIndex(200), seconded);

		// 200 sent the seconded statement, so it only lacks ours.
		assert_eq!(tracker.pending_statements_for(ValidatorIndex(200)), vec![(ValidatorIndex(5), valid)]);
		assert_eq!(
			tracker.pending_statements_for(ValidatorIndex(24)),
			vec![(ValidatorIndex(200), seconded), (ValidatorIndex(5), valid)],
		);

		tracker.note_sent(ValidatorIndex(24), ValidatorIndex(200), seconded);
		assert_eq!(tracker.pending_statements_for(ValidatorIndex(24)), vec![(ValidatorIndex(5), valid)]);
	}

	#[test]
	fn senders_only_for_members() {
		let tracker = ClusterTracker::new(group(), 2).expect("non-empty");

		assert_eq!(tracker.senders_for_originator(ValidatorIndex(24)), &group()[..]);
		assert!(tracker.senders_for_originator(ValidatorIndex(1)).is_empty());
		assert_eq!(tracker.targets().len(), 4);
	}
}
