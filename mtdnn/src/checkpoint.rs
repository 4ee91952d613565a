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

//! Resolution and reading of pretrained checkpoints.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::Arc,
};

use candle_core::{Device, Tensor};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use serde::de::DeserializeOwned;

use crate::{
	registry::{ArchiveSource, PretrainedRegistry},
	MtdnnError, MtdnnErrorKind, MtdnnResult,
};

const CONFIG_FILE: &str = "config.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const PYTORCH_FILE: &str = "pytorch_model.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightSource {
	#[default]
	Safetensors,
	Pytorch,
}

impl WeightSource {
	fn from_path(path: &Path) -> Self {
		match path.extension().and_then(|ext| ext.to_str()) {
			Some("safetensors") => WeightSource::Safetensors,
			_ => WeightSource::Pytorch,
		}
	}
}

/// Files of a checkpoint found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCheckpoint {
	pub config_file: Option<PathBuf>,
	pub weights: PathBuf,
	pub source: WeightSource,
}

impl ResolvedCheckpoint {
	fn from_weights(weights: PathBuf) -> Self {
		let config_file = weights
			.parent()
			.map(|dir| dir.join(CONFIG_FILE))
			.filter(|config| config.is_file());
		let source = WeightSource::from_path(&weights);
		Self { config_file, weights, source }
	}

	fn from_dir(dir: &Path) -> MtdnnResult<Self> {
		let config = dir.join(CONFIG_FILE);
		let config_file = config.is_file().then_some(config);
		let safetensors_path = dir.join(SAFETENSORS_FILE);
		let pytorch_path = dir.join(PYTORCH_FILE);
		let (weights, source) = if safetensors_path.is_file() {
			(safetensors_path, WeightSource::Safetensors)
		} else if pytorch_path.is_file() {
			(pytorch_path, WeightSource::Pytorch)
		} else {
			return Err(MtdnnError::msg(
				MtdnnErrorKind::NotFound,
				format!("could not find model weights in {}", dir.display()),
			));
		};
		Ok(Self { config_file, weights, source })
	}

	/// Parses the checkpoint's `config.json`, if it has one.
	pub fn read_config<T: DeserializeOwned>(&self) -> MtdnnResult<Option<T>> {
		let Some(path) = &self.config_file else {
			return Ok(None);
		};
		let content = std::fs::read_to_string(path)
			.map_err(|err| MtdnnError::from(err).add_context(format!("reading {}", path.display())))?;
		let config = serde_json::from_str(&content)
			.map_err(|err| MtdnnError::from(err).add_context(format!("parsing {}", path.display())))?;
		Ok(Some(config))
	}

	/// Reads every tensor of the weights file onto `device`.
	pub fn load_tensors(&self, device: &Device) -> MtdnnResult<HashMap<String, Tensor>> {
		match self.source {
			WeightSource::Safetensors =>
				candle_core::safetensors::load(&self.weights, device).map_err(|err| {
					MtdnnError::new(
						MtdnnErrorKind::SafeTensors,
						Arc::new(anyhow::anyhow!("could not load SafeTensors weights: {}", err)),
					)
				}),
			WeightSource::Pytorch => {
				let tensors = candle_core::pickle::read_all(&self.weights).map_err(|err| {
					MtdnnError::new(
						MtdnnErrorKind::PyTorch,
						Arc::new(anyhow::anyhow!("could not load PyTorch weights: {}", err)),
					)
				})?;
				tensors
					.into_iter()
					.map(|(name, tensor)| -> MtdnnResult<(String, Tensor)> {
						Ok((name, tensor.to_device(device)?))
					})
					.collect()
			},
		}
	}
}

/// Names a checkpoint tensor may carry for the model variable `var_name`.
///
/// Encoder variables live under `bert.`; checkpoints may store them bare or
/// under `roberta.`, and older ones name layer norm parameters `gamma`/`beta`.
pub fn candidate_names(var_name: &str) -> Vec<String> {
	let mut names = vec![var_name.to_string()];
	if let Some(rest) = var_name.strip_prefix("bert.") {
		names.push(rest.to_string());
		names.push(format!("roberta.{rest}"));
	}
	let legacy: Vec<String> = names
		.iter()
		.filter_map(|name| {
			if let Some(stem) = name.strip_suffix("LayerNorm.weight") {
				Some(format!("{stem}LayerNorm.gamma"))
			} else {
				name.strip_suffix("LayerNorm.bias").map(|stem| format!("{stem}LayerNorm.beta"))
			}
		})
		.collect();
	names.extend(legacy);
	names
}

/// Turns checkpoint names and paths into files on disk.
#[derive(Debug, Clone)]
pub struct CheckpointLoader {
	registry: PretrainedRegistry,
	cache_dir: PathBuf,
}

impl Default for CheckpointLoader {
	fn default() -> Self {
		Self::new(PretrainedRegistry::default(), common::get_checkpoint_cache_path())
	}
}

impl CheckpointLoader {
	pub fn new(registry: PretrainedRegistry, cache_dir: PathBuf) -> Self {
		Self { registry, cache_dir }
	}

	pub fn registry(&self) -> &PretrainedRegistry {
		&self.registry
	}

	pub fn cache_dir(&self) -> &Path {
		&self.cache_dir
	}

	/// Resolves a local directory, a local weights file or a registered name.
	pub fn resolve(&self, name: &str) -> MtdnnResult<ResolvedCheckpoint> {
		let path = Path::new(name);
		if path.is_dir() {
			tracing::debug!("loading checkpoint from directory {}", path.display());
			return ResolvedCheckpoint::from_dir(path);
		}
		if path.is_file() {
			tracing::debug!("loading checkpoint from file {}", path.display());
			return Ok(ResolvedCheckpoint::from_weights(path.to_path_buf()));
		}
		match self.registry.get(name) {
			Some(ArchiveSource::Hub { repo, revision }) => self.fetch_hub(repo, revision.as_deref()),
			Some(source @ ArchiveSource::Url(url)) => {
				let cached = source.cache_file_name().map(|file| self.cache_dir.join(file));
				match cached {
					Some(cached) if cached.is_file() => Ok(ResolvedCheckpoint::from_weights(cached)),
					_ => Err(MtdnnError::msg(
						MtdnnErrorKind::NotFound,
						format!(
							"archive {url} for {name} is not in {}; download it there first",
							self.cache_dir.display()
						),
					)),
				}
			},
			None => Err(MtdnnError::msg(
				MtdnnErrorKind::NotFound,
				format!("{name} is neither a local path nor a known pretrained model"),
			)),
		}
	}

	fn fetch_hub(&self, repo: &str, revision: Option<&str>) -> MtdnnResult<ResolvedCheckpoint> {
		let repo = match revision {
			Some(revision) => Repo::with_revision(repo.to_string(), RepoType::Model, revision.to_string()),
			None => Repo::model(repo.to_string()),
		};
		tracing::info!("fetching {} from the Hugging Face hub", repo.url());
		let api = ApiBuilder::new().with_cache_dir(self.cache_dir.clone()).build().map_err(|e| {
			MtdnnError::new(
				MtdnnErrorKind::Io,
				Arc::new(anyhow::anyhow!("could not initialize Hugging Face API: {}", e)),
			)
		})?;
		let api = api.repo(repo);
		let config_file = api.get(CONFIG_FILE).ok();
		let (weights, source) = api
			.get(SAFETENSORS_FILE)
			.map(|filename| (filename, WeightSource::Safetensors))
			.or_else(|_| api.get(PYTORCH_FILE).map(|filename| (filename, WeightSource::Pytorch)))
			.map_err(|e| {
				MtdnnError::new(
					MtdnnErrorKind::Io,
					Arc::new(anyhow::anyhow!("could not fetch model weights: {}", e)),
				)
			})?;
		Ok(ResolvedCheckpoint { config_file, weights, source })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::DType;

	fn write_weights(path: &Path) -> anyhow::Result<()> {
		let mut tensors = HashMap::new();
		tensors.insert("scoring_list.0.weight".to_string(), Tensor::ones((3, 4), DType::F32, &Device::Cpu)?);
		tensors.insert("embeddings.LayerNorm.gamma".to_string(), Tensor::ones(4, DType::F32, &Device::Cpu)?);
		candle_core::safetensors::save(&tensors, path)?;
		Ok(())
	}

	#[test]
	fn test_candidate_names() {
		assert_eq!(candidate_names("scoring_list.0.weight"), vec!["scoring_list.0.weight"]);
		let names = candidate_names("bert.embeddings.LayerNorm.weight");
		assert_eq!(names[..3], [
			"bert.embeddings.LayerNorm.weight".to_string(),
			"embeddings.LayerNorm.weight".to_string(),
			"roberta.embeddings.LayerNorm.weight".to_string(),
		]);
		assert!(names.contains(&"embeddings.LayerNorm.gamma".to_string()));
		assert!(candidate_names("bert.pooler.dense.bias").iter().all(|name| !name.ends_with("beta")));
	}

	#[test]
	fn test_resolve_local_dir() -> anyhow::Result<()> {
		let dir = tempfile::tempdir()?;
		std::fs::write(dir.path().join(CONFIG_FILE), r#"{"hidden_size": 4}"#)?;
		write_weights(&dir.path().join(SAFETENSORS_FILE))?;

		let loader = CheckpointLoader::new(PretrainedRegistry::empty(), dir.path().to_path_buf());
		let resolved = loader.resolve(dir.path().to_str().unwrap())?;
		assert_eq!(resolved.source, WeightSource::Safetensors);
		let config: Option<serde_json::Value> = resolved.read_config()?;
		assert_eq!(config.unwrap()["hidden_size"], 4);

		let tensors = resolved.load_tensors(&Device::Cpu)?;
		assert_eq!(tensors.len(), 2);
		assert_eq!(tensors["scoring_list.0.weight"].dims(), &[3, 4]);
		Ok(())
	}

	#[test]
	fn test_dir_without_weights_is_not_found() -> anyhow::Result<()> {
		let dir = tempfile::tempdir()?;
		let loader = CheckpointLoader::new(PretrainedRegistry::empty(), dir.path().to_path_buf());
		let err = loader.resolve(dir.path().to_str().unwrap()).unwrap_err();
		assert_eq!(err.kind(), MtdnnErrorKind::NotFound);
		Ok(())
	}

	#[test]
	fn test_url_archive_needs_cache() -> anyhow::Result<()> {
		let cache = tempfile::tempdir()?;
		let mut registry = PretrainedRegistry::empty();
		registry.register("tiny", ArchiveSource::Url("https://host/tiny.safetensors".to_string()));
		let loader = CheckpointLoader::new(registry, cache.path().to_path_buf());

		let err = loader.resolve("tiny").unwrap_err();
		assert_eq!(err.kind(), MtdnnErrorKind::NotFound);

		write_weights(&cache.path().join("tiny.safetensors"))?;
		let resolved = loader.resolve("tiny")?;
		assert_eq!(resolved.source, WeightSource::Safetensors);
		assert!(resolved.config_file.is_none());

		let err = loader.resolve("no-such-model").unwrap_err();
		assert_eq!(err.kind(), MtdnnErrorKind::NotFound);
		Ok(())
	}
}
