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

//! A rolling window of sessions and cached session info, updated by the state of newly imported blocks.
//!
//! Session info is treated as an immutable snapshot: once cached for an index it is never
//! modified, only dropped when the window moves past it.

use polkadot_node_primitives::{Hash, SessionIndex, SessionInfo};
use std::fmt;

use crate::interfaces::{RuntimeApi, RuntimeApiError};

/// Sessions unavailable in state to cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionsUnavailableKind {
	/// The runtime API itself returned an error.
	#[error("runtime API error: {0}")]
	RuntimeApi(RuntimeApiError),
	/// Missing session info from runtime API.
	#[error("missing session info for session {0}")]
	Missing(SessionIndex),
}

/// Information about the sessions being fetched.
#[derive(Debug, Clone)]
pub struct SessionsUnavailableInfo {
	/// The desired window start.
	pub window_start: SessionIndex,
	/// The desired window end.
	pub window_end: SessionIndex,
	/// The block hash whose state the sessions were meant to be drawn from.
	pub block_hash: Hash,
}

impl fmt::Display for SessionsUnavailableInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"sessions {}..={} at block {:?}",
			self.window_start, self.window_end, self.block_hash
		)
	}
}

/// Sessions were unavailable to fetch from the state for some reason.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Sessions unavailable: {kind}{}", .info.as_ref().map(|i| format!(", {}", i)).unwrap_or_default())]
pub struct SessionsUnavailable {
	/// The error kind.
	kind: SessionsUnavailableKind,
	/// The info about the session window, if any.
	info: Option<SessionsUnavailableInfo>,
}

/// An indicated update of the rolling session window.
#[derive(Debug, PartialEq, Clone)]
pub enum SessionWindowUpdate {
	/// The session window was just advanced from one range to a new one.
	Advanced {
		/// The previous start of the window (inclusive).
		prev_window_start: SessionIndex,
		/// The previous end of the window (inclusive).
		prev_window_end: SessionIndex,
		/// The new start of the window (inclusive).
		new_window_start: SessionIndex,
		/// The new end of the window (inclusive).
		new_window_end: SessionIndex,
	},
	/// The session window was unchanged.
	Unchanged,
}

/// A rolling window of sessions and cached session info.
#[derive(Debug)]
pub struct RollingSessionWindow {
	earliest_session: SessionIndex,
	session_info: Vec<SessionInfo>,
	window_size: SessionIndex,
}

impl RollingSessionWindow {
	/// Initialize a new session info cache with the given window size.
	pub async fn new(
		runtime: &dyn RuntimeApi,
		window_size: SessionIndex,
		block_hash: Hash,
	) -> Result<Self, SessionsUnavailable> {
		let session_index = get_session_index_for_child(runtime, block_hash).await?;

		let window_start = session_index.saturating_sub(window_size.saturating_sub(1));

		match load_all_sessions(runtime, block_hash, window_start, session_index).await {
			Err(kind) => Err(SessionsUnavailable {
				kind,
				info: Some(SessionsUnavailableInfo {
					window_start,
					window_end: session_index,
					block_hash,
				}),
			}),
			Ok(s) => Ok(Self { earliest_session: window_start, session_info: s, window_size }),
		}
	}

	/// Initialize a new session info cache with the given window size and
	/// initial data.
	#[cfg(test)]
	pub fn with_session_info(
		window_size: SessionIndex,
		earliest_session: SessionIndex,
		session_info: Vec<SessionInfo>,
	) -> Self {
		RollingSessionWindow { earliest_session, session_info, window_size }
	}

	/// Access the session info for the given session index, if stored within the window.
	pub fn session_info(&self, index: SessionIndex) -> Option<&SessionInfo> {
		if index < self.earliest_session {
			None
		} else {
			self.session_info.get((index - self.earliest_session) as usize)
		}
	}

	/// Access the index of the earliest session.
	pub fn earliest_session(&self) -> SessionIndex {
		self.earliest_session
	}

	/// Access the index of the latest session.
	pub fn latest_session(&self) -> SessionIndex {
		self.earliest_session + (self.session_info.len() as SessionIndex).saturating_sub(1)
	}

	/// When inspecting a new import notification, updates the session info cache to match
	/// the session of the imported block's child.
	///
	/// this only needs to be called on heads where we are directly notified about import, as sessions do
	/// not change often and import notifications are expected to be typically increasing in session number.
	///
	/// some backwards drift in session index is acceptable.
	pub async fn cache_session_info_for_head(
		&mut self,
		runtime: &dyn RuntimeApi,
		block_hash: Hash,
	) -> Result<SessionWindowUpdate, SessionsUnavailable> {
		let session_index = get_session_index_for_child(runtime, block_hash).await?;

		let old_window_start = self.earliest_session;

		let latest = self.latest_session();

		// Either cached or ancient.
		if session_index <= latest {
			return Ok(SessionWindowUpdate::Unchanged)
		}

		let old_window_end = latest;

		let window_start = session_index.saturating_sub(self.window_size.saturating_sub(1));

		// keep some of the old window, if applicable.
		let overlap_start = window_start.saturating_sub(old_window_start);

		let fresh_start = if latest < window_start { window_start } else { latest + 1 };

		match load_all_sessions(runtime, block_hash, fresh_start, session_index).await {
			Err(kind) => Err(SessionsUnavailable {
				kind,
				info: Some(SessionsUnavailableInfo {
					window_start: fresh_start,
					window_end: session_index,
					block_hash,
				}),
			}),
			Ok(s) => {
				let update = SessionWindowUpdate::Advanced {
					prev_window_start: old_window_start,
					prev_window_end: old_window_end,
					new_window_start: window_start,
					new_window_end: session_index,
				};

				let outdated = std::cmp::min(overlap_start as usize, self.session_info.len());
				self.session_info.drain(..outdated);
				self.session_info.extend(s);
				// we need to account for this case:
				// window_start ................................... session_index
				//              old_window_start ........... latest
				let new_earliest = std::cmp::max(window_start, old_window_start);
				self.earliest_session = new_earliest;

				Ok(update)
			},
		}
	}
}

async fn get_session_index_for_child(
	runtime: &dyn RuntimeApi,
	block_hash: Hash,
) -> Result<SessionIndex, SessionsUnavailable> {
	runtime.session_index_for_child(block_hash).await.map_err(|e| SessionsUnavailable {
		kind: SessionsUnavailableKind::RuntimeApi(e),
		info: None,
	})
}

async fn load_all_sessions(
	runtime: &dyn RuntimeApi,
	block_hash: Hash,
	start: SessionIndex,
	end_inclusive: SessionIndex,
) -> Result<Vec<SessionInfo>, SessionsUnavailableKind> {
	let mut v = Vec::new();
	for i in start..=end_inclusive {
		let session_info = match runtime.session_info(block_hash, i).await {
			Ok(Some(s)) => s,
			Ok(None) => return Err(SessionsUnavailableKind::Missing(i)),
			Err(e) => return Err(SessionsUnavailableKind::RuntimeApi(e)),
		};

		v.push(session_info);
	}

	Ok(v)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::interfaces::{BabeEpoch, CandidateEvent};
	use polkadot_node_primitives::{ValidationCode, ValidationCodeHash};
	use assert_matches::assert_matches;
	use parking_lot::Mutex;

	const TEST_WINDOW_SIZE: SessionIndex = 6;

	fn dummy_session_info(index: SessionIndex) -> SessionInfo {
		SessionInfo {
			n_cores: index as _,
			zeroth_delay_tranche_width: index as _,
			relay_vrf_modulo_samples: index as _,
			n_delay_tranches: index as _,
			no_show_slots: index as _,
			needed_approvals: index as _,
			..Default::default()
		}
	}

	// Answers with a fixed session and records which session infos were requested.
	struct SessionRuntime {
		session: SessionIndex,
		requested: Mutex<Vec<SessionIndex>>,
		missing: Option<SessionIndex>,
	}

	impl SessionRuntime {
		fn new(session: SessionIndex) -> Self {
			SessionRuntime { session, requested: Mutex::new(Vec::new()), missing: None }
		}
	}

	#[async_trait::async_trait]
	impl RuntimeApi for SessionRuntime {
		async fn session_index_for_child(&self, _: Hash) -> Result<SessionIndex, RuntimeApiError> {
			Ok(self.session)
		}

		async fn session_info(
			&self,
			_: Hash,
			session: SessionIndex,
		) -> Result<Option<SessionInfo>, RuntimeApiError> {
			self.requested.lock().push(session);
			if self.missing == Some(session) {
				return Ok(None)
			}
			Ok(Some(dummy_session_info(session)))
		}

		async fn candidate_events(&self, _: Hash) -> Result<Vec<CandidateEvent>, RuntimeApiError> {
			unimplemented!()
		}

		async fn babe_epoch(&self, _: Hash) -> Result<BabeEpoch, RuntimeApiError> {
			unimplemented!()
		}

		async fn validation_code_by_hash(
			&self,
			_: Hash,
			_: ValidationCodeHash,
		) -> Result<Option<ValidationCode>, RuntimeApiError> {
			unimplemented!()
		}
	}

	fn cache_session_info_test(
		expected_start_session: SessionIndex,
		session: SessionIndex,
		window: Option<RollingSessionWindow>,
		expect_requests_from: SessionIndex,
	) {
		let runtime = SessionRuntime::new(session);
		let hash = Hash::repeat_byte(5);

		let window = futures::executor::block_on(async {
			match window {
				None => RollingSessionWindow::new(&runtime, TEST_WINDOW_SIZE, hash).await.unwrap(),
				Some(mut window) => {
					window.cache_session_info_for_head(&runtime, hash).await.unwrap();
					window
				},
			}
		});

		assert_eq!(window.earliest_session, expected_start_session);
		assert_eq!(
			window.session_info,
			(expected_start_session..=session).map(dummy_session_info).collect::<Vec<_>>(),
		);
		assert_eq!(
			*runtime.requested.lock(),
			(expect_requests_from..=session).collect::<Vec<_>>(),
		);
	}

	#[test]
	fn cache_session_info_first_early() {
		cache_session_info_test(0, 1, None, 0);
	}

	#[test]
	fn cache_session_info_does_not_underflow() {
		let window = RollingSessionWindow {
			earliest_session: 1,
			session_info: vec![dummy_session_info(1)],
			window_size: TEST_WINDOW_SIZE,
		};

		cache_session_info_test(1, 2, Some(window), 2);
	}

	#[test]
	fn cache_session_info_first_late() {
		cache_session_info_test(
			(100 as SessionIndex).saturating_sub(TEST_WINDOW_SIZE - 1),
			100,
			None,
			(100 as SessionIndex).saturating_sub(TEST_WINDOW_SIZE - 1),
		);
	}

	#[test]
	fn cache_session_info_jump() {
		let window = RollingSessionWindow {
			earliest_session: 50,
			session_info: vec![
				dummy_session_info(50),
				dummy_session_info(51),
				dummy_session_info(52),
			],
			window_size: TEST_WINDOW_SIZE,
		};

		cache_session_info_test(
			(100 as SessionIndex).saturating_sub(TEST_WINDOW_SIZE - 1),
			100,
			Some(window),
			(100 as SessionIndex).saturating_sub(TEST_WINDOW_SIZE - 1),
		);
	}

	#[test]
	fn cache_session_info_roll_full() {
		let start = 99 - (TEST_WINDOW_SIZE - 1);
		let window = RollingSessionWindow {
			earliest_session: start,
			session_info: (start..=99).map(dummy_session_info).collect(),
			window_size: TEST_WINDOW_SIZE,
		};

		cache_session_info_test(
			(100 as SessionIndex).saturating_sub(TEST_WINDOW_SIZE - 1),
			100,
			Some(window),
			100, // should only make one request.
		);
	}

	#[test]
	fn cache_session_info_roll_many_full() {
		let start = 97 - (TEST_WINDOW_SIZE - 1);
		let window = RollingSessionWindow {
			earliest_session: start,
			session_info: (start..=97).map(dummy_session_info).collect(),
			window_size: TEST_WINDOW_SIZE,
		};

		cache_session_info_test(
			(100 as SessionIndex).saturating_sub(TEST_WINDOW_SIZE - 1),
			100,
			Some(window),
			98,
		);
	}

	#[test]
	fn cache_session_info_roll_early() {
		let start = 0;
		let window = RollingSessionWindow {
			earliest_session: start,
			session_info: (0..=1).map(dummy_session_info).collect(),
			window_size: TEST_WINDOW_SIZE,
		};

		cache_session_info_test(
			0,
			2,
			Some(window),
			2, // should only make one request.
		);
	}

	#[test]
	fn cache_session_info_roll_many_early() {
		let start = 0;
		let window = RollingSessionWindow {
			earliest_session: start,
			session_info: (0..=1).map(dummy_session_info).collect(),
			window_size: TEST_WINDOW_SIZE,
		};

		cache_session_info_test(0, 3, Some(window), 2);
	}

	#[test]
	fn older_session_leaves_window_unchanged() {
		let runtime = SessionRuntime::new(3);
		let mut window = RollingSessionWindow::with_session_info(
			TEST_WINDOW_SIZE,
			2,
			(2..=5).map(dummy_session_info).collect(),
		);

		let update = futures::executor::block_on(
			window.cache_session_info_for_head(&runtime, Hash::repeat_byte(1)),
		)
		.unwrap();

		assert_eq!(update, SessionWindowUpdate::Unchanged);
		assert_eq!(window.latest_session(), 5);
		assert!(runtime.requested.lock().is_empty());
	}

	#[test]
	fn any_session_unavailable_for_caching_means_no_change() {
		let session: SessionIndex = 6;
		let start_session = session.saturating_sub(TEST_WINDOW_SIZE - 1);

		let mut runtime = SessionRuntime::new(session);
		runtime.missing = Some(start_session + 2);

		let res = futures::executor::block_on(RollingSessionWindow::new(
			&runtime,
			TEST_WINDOW_SIZE,
			Hash::repeat_byte(1),
		));

		assert_matches!(
			&res,
			Err(SessionsUnavailable { kind: SessionsUnavailableKind::Missing(s), info: Some(_) }) => {
				assert_eq!(*s, start_session + 2);
			}
		);

		let message = res.err().map(|e| e.to_string()).unwrap_or_default();
		assert!(message.contains(&format!("missing session info for session {}", start_session + 2)));
		assert!(message.contains(&format!("sessions {}..={}", start_session, session)));
	}
}
