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

use std::path::PathBuf;

/// Root of the local data directory used to cache pretrained checkpoints.
///
/// Falls back to the current directory when the platform exposes no data directory.
pub fn get_mtdnn_data_path() -> PathBuf {
	match dirs::data_dir() {
		Some(data_path) => data_path.join("mtdnn_data"),
		None => {
			tracing::warn!("could not resolve a platform data directory, using ./mtdnn_data");
			PathBuf::from("mtdnn_data")
		},
	}
}

/// Directory holding downloaded or manually placed checkpoint archives.
pub fn get_checkpoint_cache_path() -> PathBuf {
	get_mtdnn_data_path().join("checkpoints")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_checkpoint_cache_is_under_data_path() {
		let data_path = get_mtdnn_data_path();
		let cache_path = get_checkpoint_cache_path();
		assert!(cache_path.starts_with(&data_path));
		assert!(data_path.ends_with("mtdnn_data"));
	}
}
