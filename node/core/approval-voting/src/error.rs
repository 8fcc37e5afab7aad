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

//! Error types of the approval voting task.

use fatality::Nested;

use polkadot_node_primitives::{approval::ApprovalError, Hash, SessionIndex};

use crate::{
	interfaces::{ChainApiError, RuntimeApiError},
	rolling_session_window::SessionsUnavailable,
	LOG_TARGET,
};

pub type Result<T> = std::result::Result<T, Error>;
pub type FatalResult<T> = std::result::Result<T, FatalError>;

/// Errors of the approval voting task.
#[allow(missing_docs)]
#[fatality::fatality(splitable)]
pub enum Error {
	#[fatal]
	#[error("Incoming message channel closed")]
	MessageChannelClosed,

	#[error(transparent)]
	RuntimeApi(#[from] RuntimeApiError),

	#[error(transparent)]
	ChainApi(#[from] ChainApiError),

	#[error(transparent)]
	SessionsUnavailable(#[from] SessionsUnavailable),

	#[error(transparent)]
	Approval(#[from] ApprovalError),

	#[error("Block {0:?} is from ancient session {1}")]
	BlockFromAncientSession(Hash, SessionIndex),

	#[error("Session info unavailable for session {0}")]
	SessionInfoUnavailable(SessionIndex),

	#[error("BABE VRF info unavailable for block {0:?}")]
	VrfInfoUnavailable(Hash),
}

/// Utility for eating top level errors and log them.
///
/// We basically always want to try and continue on error. This utility function is meant to
/// consume top-level errors by simply logging them
pub fn log_error<T: Default>(result: Result<T>) -> FatalResult<T> {
	match result.into_nested()? {
		Ok(v) => Ok(v),
		Err(jfyi) => {
			jfyi.log();
			Ok(T::default())
		},
	}
}

impl JfyiError {
	/// Log a `JfyiError`.
	pub fn log(self) {
		tracing::debug!(target: LOG_TARGET, error = ?self);
	}
}
