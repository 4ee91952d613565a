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
use std::{fmt, path::Path};

use crate::{
	transformers::{BertConfig, HiddenAct},
	MtdnnError, MtdnnErrorKind, MtdnnResult,
};

/// Encoder family shared by every task.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderModelType {
	#[default]
	#[serde(alias = "BERT")]
	Bert,
	#[serde(alias = "ROBERTA")]
	Roberta,
}

/// Output structure of a task.
///
/// `Span` and `SequenceLabeling` have dedicated forward paths; every other
/// type produces one score vector per example.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
	#[serde(alias = "Classification")]
	Classification,
	#[serde(alias = "Regression")]
	Regression,
	#[serde(alias = "Ranking")]
	Ranking,
	#[serde(alias = "Span")]
	Span,
	#[serde(alias = "SequenceLabeling")]
	SequenceLabeling,
}

/// Decoder option of a task, serialized as its integer code.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DecoderOpt {
	/// Code 0: dropout and a linear projection.
	#[default]
	Linear,
	/// Code 1: pairwise premise/hypothesis scoring head.
	Pairwise,
}

impl TryFrom<u8> for DecoderOpt {
	type Error = String;

	fn try_from(code: u8) -> Result<Self, Self::Error> {
		match code {
			0 => Ok(DecoderOpt::Linear),
			1 => Ok(DecoderOpt::Pairwise),
			other => Err(format!("unknown decoder option code {other}, expected 0 or 1")),
		}
	}
}

impl From<DecoderOpt> for u8 {
	fn from(opt: DecoderOpt) -> u8 {
		match opt {
			DecoderOpt::Linear => 0,
			DecoderOpt::Pairwise => 1,
		}
	}
}

impl fmt::Display for DecoderOpt {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", u8::from(*self))
	}
}

/// Model configuration: encoder hyperparameters plus one entry per task in
/// `task_types`, `n_class`, `tasks_dropout_p` and `decoder_opts`.
///
/// An empty `tasks_dropout_p` means every task uses `dropout_p`; an empty
/// `decoder_opts` means every task uses [`DecoderOpt::Linear`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtdnnConfig {
	pub encoder_type: EncoderModelType,
	pub vocab_size: usize,
	pub hidden_size: usize,
	pub num_hidden_layers: usize,
	pub num_attention_heads: usize,
	pub intermediate_size: usize,
	pub hidden_act: HiddenAct,
	pub hidden_dropout_prob: f64,
	pub attention_probs_dropout_prob: f64,
	pub max_position_embeddings: usize,
	pub type_vocab_size: usize,
	pub initializer_range: f64,
	pub layer_norm_eps: f64,
	pub pad_token_id: usize,
	/// Scale applied to the base standard deviation of weight initialization.
	pub init_ratio: f64,
	pub dropout_p: f64,
	pub enable_variational_dropout: bool,
	/// Values above zero freeze every encoder parameter.
	pub update_bert_opt: i32,
	/// Skip head construction; only encoder features are available.
	pub dump_feature: bool,
	/// Checkpoint name or path loaded by `MtdnnModel::from_pretrained`.
	pub init_checkpoint: Option<String>,
	pub task_types: Vec<TaskType>,
	pub n_class: Vec<usize>,
	pub tasks_dropout_p: Vec<f64>,
	pub decoder_opts: Vec<DecoderOpt>,
}

impl Default for MtdnnConfig {
	fn default() -> Self {
		let bert = BertConfig::default();
		Self {
			encoder_type: EncoderModelType::Bert,
			vocab_size: bert.vocab_size,
			hidden_size: bert.hidden_size,
			num_hidden_layers: bert.num_hidden_layers,
			num_attention_heads: bert.num_attention_heads,
			intermediate_size: bert.intermediate_size,
			hidden_act: bert.hidden_act,
			hidden_dropout_prob: bert.hidden_dropout_prob,
			attention_probs_dropout_prob: bert.attention_probs_dropout_prob,
			max_position_embeddings: bert.max_position_embeddings,
			type_vocab_size: bert.type_vocab_size,
			initializer_range: bert.initializer_range,
			layer_norm_eps: bert.layer_norm_eps,
			pad_token_id: bert.pad_token_id,
			init_ratio: 1.0,
			dropout_p: 0.1,
			enable_variational_dropout: true,
			update_bert_opt: 0,
			dump_feature: false,
			init_checkpoint: None,
			task_types: Vec::new(),
			n_class: Vec::new(),
			tasks_dropout_p: Vec::new(),
			decoder_opts: Vec::new(),
		}
	}
}

fn invalid_config(message: String) -> MtdnnError {
	MtdnnError::msg(MtdnnErrorKind::InvalidConfig, format!("invalid MtdnnConfig: {message}"))
}

fn check_dropout(name: &str, p: f64) -> MtdnnResult<()> {
	if !(0.0..1.0).contains(&p) {
		return Err(invalid_config(format!("{name} must be in [0, 1), got {p}")));
	}
	Ok(())
}

impl MtdnnConfig {
	pub fn from_json_str(json: &str) -> MtdnnResult<Self> {
		let config: MtdnnConfig = serde_json::from_str(json)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads a JSON or YAML (`.yaml` / `.yml`) configuration file.
	pub fn from_file(path: impl AsRef<Path>) -> MtdnnResult<Self> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path)
			.map_err(|err| MtdnnError::from(err).add_context(format!("reading {}", path.display())))?;
		let config: MtdnnConfig = match path.extension().and_then(|ext| ext.to_str()) {
			Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
			_ => serde_json::from_str(&content)?,
		};
		config.validate()?;
		Ok(config)
	}

	pub fn to_json_string(&self) -> MtdnnResult<String> {
		Ok(serde_json::to_string_pretty(self)?)
	}

	pub fn num_tasks(&self) -> usize {
		self.n_class.len()
	}

	pub fn task_type(&self, task_id: usize) -> Option<TaskType> {
		self.task_types.get(task_id).copied()
	}

	pub fn decoder_opt(&self, task_id: usize) -> DecoderOpt {
		self.decoder_opts.get(task_id).copied().unwrap_or_default()
	}

	pub fn task_dropout_p(&self, task_id: usize) -> f64 {
		self.tasks_dropout_p.get(task_id).copied().unwrap_or(self.dropout_p)
	}

	pub fn encoder_frozen(&self) -> bool {
		self.update_bert_opt > 0
	}

	/// BERT hyperparameters carried by this configuration.
	pub fn bert_config(&self) -> BertConfig {
		BertConfig {
			vocab_size: self.vocab_size,
			hidden_size: self.hidden_size,
			num_hidden_layers: self.num_hidden_layers,
			num_attention_heads: self.num_attention_heads,
			intermediate_size: self.intermediate_size,
			hidden_act: self.hidden_act,
			hidden_dropout_prob: self.hidden_dropout_prob,
			attention_probs_dropout_prob: self.attention_probs_dropout_prob,
			max_position_embeddings: self.max_position_embeddings,
			type_vocab_size: self.type_vocab_size,
			initializer_range: self.initializer_range,
			layer_norm_eps: self.layer_norm_eps,
			pad_token_id: self.pad_token_id,
			model_type: Some("bert".to_string()),
		}
	}

	pub fn validate(&self) -> MtdnnResult<()> {
		let num_tasks = self.num_tasks();
		if self.task_types.len() != num_tasks {
			return Err(invalid_config(format!(
				"task_types has {} entries but n_class has {num_tasks}",
				self.task_types.len()
			)));
		}
		if !self.tasks_dropout_p.is_empty() && self.tasks_dropout_p.len() != num_tasks {
			return Err(invalid_config(format!(
				"tasks_dropout_p has {} entries but there are {num_tasks} tasks",
				self.tasks_dropout_p.len()
			)));
		}
		if !self.decoder_opts.is_empty() && self.decoder_opts.len() != num_tasks {
			return Err(invalid_config(format!(
				"decoder_opts has {} entries but there are {num_tasks} tasks",
				self.decoder_opts.len()
			)));
		}
		for (task_id, &n_class) in self.n_class.iter().enumerate() {
			if n_class == 0 && self.task_types[task_id] != TaskType::Span {
				return Err(invalid_config(format!("task {task_id} declares zero classes")));
			}
		}
		check_dropout("dropout_p", self.dropout_p)?;
		check_dropout("hidden_dropout_prob", self.hidden_dropout_prob)?;
		check_dropout("attention_probs_dropout_prob", self.attention_probs_dropout_prob)?;
		for (task_id, &p) in self.tasks_dropout_p.iter().enumerate() {
			check_dropout(&format!("tasks_dropout_p[{task_id}]"), p)?;
		}
		if self.init_ratio <= 0.0 || !self.init_ratio.is_finite() {
			return Err(invalid_config(format!("init_ratio must be positive, got {}", self.init_ratio)));
		}
		if self.encoder_type == EncoderModelType::Bert &&
			(self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0)
		{
			return Err(invalid_config(format!(
				"hidden_size {} is not a multiple of num_attention_heads {}",
				self.hidden_size, self.num_attention_heads
			)));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn two_task_config() -> MtdnnConfig {
		MtdnnConfig {
			task_types: vec![TaskType::Span, TaskType::Classification],
			n_class: vec![2, 3],
			tasks_dropout_p: vec![0.1, 0.2],
			decoder_opts: vec![DecoderOpt::Linear, DecoderOpt::Linear],
			..Default::default()
		}
	}

	#[test]
	fn test_decoder_opt_codes() {
		assert_eq!(DecoderOpt::try_from(0u8), Ok(DecoderOpt::Linear));
		assert_eq!(DecoderOpt::try_from(1u8), Ok(DecoderOpt::Pairwise));
		assert!(DecoderOpt::try_from(4u8).is_err());
		let parsed: Vec<DecoderOpt> = serde_json::from_str("[0, 1]").unwrap();
		assert_eq!(parsed, vec![DecoderOpt::Linear, DecoderOpt::Pairwise]);
		assert_eq!(serde_json::to_string(&parsed).unwrap(), "[0,1]");
		assert!(serde_json::from_str::<Vec<DecoderOpt>>("[2]").is_err());
	}

	#[test]
	fn test_json_round_trip_and_defaults() {
		let config = two_task_config();
		let json = config.to_json_string().unwrap();
		let restored = MtdnnConfig::from_json_str(&json).unwrap();
		assert_eq!(restored, config);

		let minimal = MtdnnConfig::from_json_str(
			r#"{"encoder_type": "roberta", "task_types": ["sequence_labeling"], "n_class": [9]}"#,
		)
		.unwrap();
		assert_eq!(minimal.encoder_type, EncoderModelType::Roberta);
		assert_eq!(minimal.task_dropout_p(0), minimal.dropout_p);
		assert_eq!(minimal.decoder_opt(0), DecoderOpt::Linear);
		assert_eq!(minimal.init_ratio, 1.0);
	}

	#[test]
	fn test_rejects_mismatched_task_lists() {
		let mut config = two_task_config();
		config.tasks_dropout_p = vec![0.1];
		let err = config.validate().unwrap_err();
		assert_eq!(err.kind(), MtdnnErrorKind::InvalidConfig);
		assert!(format!("{}", err.source).contains("MtdnnConfig"));

		let mut config = two_task_config();
		config.task_types.push(TaskType::Regression);
		assert!(config.validate().is_err());

		let mut config = two_task_config();
		config.tasks_dropout_p[1] = 1.0;
		assert!(config.validate().is_err());

		let mut config = two_task_config();
		config.n_class[1] = 0;
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_from_yaml_and_json_files() {
		let dir = tempfile::tempdir().unwrap();
		let yaml_path = dir.path().join("mtdnn.yaml");
		let mut yaml = std::fs::File::create(&yaml_path).unwrap();
		writeln!(
			yaml,
			"encoder_type: bert\nhidden_size: 64\nnum_attention_heads: 4\ntask_types: [Classification, Span]\nn_class: [3, 2]\ndecoder_opts: [1, 0]\nupdate_bert_opt: 1"
		)
		.unwrap();
		let config = MtdnnConfig::from_file(&yaml_path).unwrap();
		assert_eq!(config.hidden_size, 64);
		assert_eq!(config.decoder_opt(0), DecoderOpt::Pairwise);
		assert!(config.encoder_frozen());
		assert_eq!(config.bert_config().hidden_size, 64);

		let json_path = dir.path().join("mtdnn.json");
		std::fs::write(&json_path, two_task_config().to_json_string().unwrap()).unwrap();
		assert_eq!(MtdnnConfig::from_file(&json_path).unwrap(), two_task_config());

		let missing = MtdnnConfig::from_file(dir.path().join("absent.json")).unwrap_err();
		assert_eq!(missing.kind(), MtdnnErrorKind::NotFound);
		assert!(missing.to_string().contains("absent.json"));
	}
}
