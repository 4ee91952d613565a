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

use std::collections::HashMap;

/// Where a named pretrained archive lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
	/// A Hugging Face model repository.
	Hub { repo: String, revision: Option<String> },
	/// A remote archive; it must already sit in the checkpoint cache under its file name.
	Url(String),
}

impl ArchiveSource {
	pub fn hub(repo: &str) -> Self {
		ArchiveSource::Hub { repo: repo.to_string(), revision: None }
	}

	/// File name the archive is cached under.
	pub fn cache_file_name(&self) -> Option<&str> {
		match self {
			ArchiveSource::Hub { .. } => None,
			ArchiveSource::Url(url) => url.rsplit('/').next().filter(|name| !name.is_empty()),
		}
	}
}

const MTDNN_ARCHIVE_ROOT: &str = "https://mrc-mtdnn.blob.core.windows.net/mtdnn";

/// Names of known pretrained archives.
#[derive(Debug, Clone)]
pub struct PretrainedRegistry {
	archives: HashMap<String, ArchiveSource>,
}

impl Default for PretrainedRegistry {
	fn default() -> Self {
		let mut registry = Self::empty();
		for name in ["mtdnn-base-uncased", "mtdnn-large-uncased", "mtdnn-kd-large-cased"] {
			registry.register(name, ArchiveSource::Url(format!("{MTDNN_ARCHIVE_ROOT}/{name}.pt")));
		}
		for repo in ["bert-base-uncased", "bert-base-cased", "bert-large-uncased", "roberta-base", "roberta-large"]
		{
			registry.register(repo, ArchiveSource::hub(repo));
		}
		registry
	}
}

impl PretrainedRegistry {
	pub fn empty() -> Self {
		Self { archives: HashMap::new() }
	}

	/// Adds or replaces an entry, returning the previous source.
	pub fn register(&mut self, name: impl Into<String>, source: ArchiveSource) -> Option<ArchiveSource> {
		self.archives.insert(name.into(), source)
	}

	pub fn get(&self, name: &str) -> Option<&ArchiveSource> {
		self.archives.get(name)
	}

	pub fn contains(&self, name: &str) -> bool {
		self.archives.contains_key(name)
	}

	pub fn names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.archives.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_registry_entries() {
		let registry = PretrainedRegistry::default();
		assert!(registry.contains("mtdnn-base-uncased"));
		assert_eq!(
			registry.get("mtdnn-large-uncased"),
			Some(&ArchiveSource::Url(
				"https://mrc-mtdnn.blob.core.windows.net/mtdnn/mtdnn-large-uncased.pt".to_string()
			))
		);
		assert_eq!(registry.get("roberta-base"), Some(&ArchiveSource::hub("roberta-base")));
		assert!(registry.get("gpt2").is_none());
		assert_eq!(registry.names()[0], "bert-base-cased");
	}

	#[test]
	fn test_register_and_cache_name() {
		let mut registry = PretrainedRegistry::empty();
		let previous = registry.register("tiny", ArchiveSource::Url("https://host/models/tiny.pt".into()));
		assert!(previous.is_none());
		assert_eq!(registry.get("tiny").and_then(ArchiveSource::cache_file_name), Some("tiny.pt"));
		assert_eq!(ArchiveSource::hub("bert-base-uncased").cache_file_name(), None);
		assert_eq!(ArchiveSource::Url("https://host/".into()).cache_file_name(), None);
	}
}
