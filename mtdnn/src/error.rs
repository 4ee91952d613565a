// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.ai).

use serde::{Deserialize, Serialize};
use std::{fmt, io, sync::Arc};
use thiserror::Error;

/// MT-DNN error kind.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MtdnnErrorKind {
	/// Io error.
	Io,
	/// Not found error.
	NotFound,
	/// PyTorch checkpoint error.
	PyTorch,
	/// Safetensors checkpoint error.
	SafeTensors,
	/// Tensor or model error.
	ModelError,
	/// Configuration rejected at construction.
	InvalidConfig,
	/// Forward inputs violate a precondition.
	InvalidInput,
	/// Task id does not select a head.
	UnknownTask,
}

/// Error type for model construction, loading and forward dispatch.
#[derive(Debug, Clone, Error)]
#[error("mtdnn error(kind={kind:?}, source={source})")]
#[allow(missing_docs)]
pub struct MtdnnError {
	/// The kind of error.
	pub kind: MtdnnErrorKind,
	/// The source of the error.
	#[source]
	pub source: Arc<anyhow::Error>,
}

/// A type alias for results returned by MT-DNN operations.
pub type MtdnnResult<T> = Result<T, MtdnnError>;

impl MtdnnError {
	/// Creates a new `MtdnnError` with the specified kind and source.
	pub fn new(kind: MtdnnErrorKind, source: Arc<anyhow::Error>) -> Self {
		MtdnnError { kind, source }
	}

	/// Shorthand for an error built from a message.
	pub fn msg<M>(kind: MtdnnErrorKind, message: M) -> Self
	where
		M: fmt::Display + fmt::Debug + Send + Sync + 'static,
	{
		MtdnnError::new(kind, Arc::new(anyhow::anyhow!(message)))
	}

	/// Adds some context to the existing error.
	pub fn add_context<C>(self, ctx: C) -> Self
	where
		C: fmt::Display + Send + Sync + 'static,
	{
		MtdnnError {
			kind: self.kind,
			source: Arc::new(anyhow::anyhow!("{ctx}: {:#}", self.source)),
		}
	}

	/// Returns the kind of this error.
	pub fn kind(&self) -> MtdnnErrorKind {
		self.kind.clone()
	}
}

impl From<io::Error> for MtdnnError {
	fn from(err: io::Error) -> MtdnnError {
		match err.kind() {
			io::ErrorKind::NotFound =>
				MtdnnError::new(MtdnnErrorKind::NotFound, Arc::new(err.into())),
			_ => MtdnnError::new(MtdnnErrorKind::Io, Arc::new(err.into())),
		}
	}
}

impl From<serde_json::Error> for MtdnnError {
	fn from(err: serde_json::Error) -> MtdnnError {
		MtdnnError::new(MtdnnErrorKind::InvalidConfig, Arc::new(err.into()))
	}
}

impl From<serde_yaml::Error> for MtdnnError {
	fn from(err: serde_yaml::Error) -> MtdnnError {
		MtdnnError::new(MtdnnErrorKind::InvalidConfig, Arc::new(err.into()))
	}
}

impl From<candle_core::Error> for MtdnnError {
	fn from(err: candle_core::Error) -> MtdnnError {
		MtdnnError::new(MtdnnErrorKind::ModelError, Arc::new(err.into()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_io_not_found_maps_to_not_found() {
		let err: MtdnnError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
		assert_eq!(err.kind(), MtdnnErrorKind::NotFound);
		let err: MtdnnError = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
		assert_eq!(err.kind(), MtdnnErrorKind::Io);
	}

	#[test]
	fn test_context_keeps_kind() {
		let err = MtdnnError::msg(MtdnnErrorKind::UnknownTask, "task 7")
			.add_context("while dispatching forward");
		assert_eq!(err.kind(), MtdnnErrorKind::UnknownTask);
		let rendered = format!("{err}");
		assert!(rendered.contains("while dispatching forward: task 7"));
	}
}
