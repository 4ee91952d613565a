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

//! The multi-task model: one shared encoder, one head per task.

use std::{collections::HashMap, sync::MutexGuard};

use candle_core::{DType, Device, IndexOp, Tensor, Var};
use candle_nn::{Module, VarBuilder, VarMap};
use common::AverageMeter;

use crate::{
	checkpoint::{candidate_names, CheckpointLoader, ResolvedCheckpoint},
	config::{DecoderOpt, EncoderModelType, MtdnnConfig, TaskType},
	dropout::DropoutWrapper,
	heads::ScoringHead,
	layers::WeightInit,
	pooler::LinearPooler,
	transformers::{
		BertModel, Encoder, EncoderConfig, EncoderOutput, RobertaConfig, RobertaModel, TaskOutput,
	},
	MtdnnError, MtdnnErrorKind, MtdnnResult,
};

/// Variable prefix of the shared encoder. Freezing excludes everything under it.
pub const ENCODER_PREFIX: &str = "bert";

/// Outcome of copying checkpoint tensors into the model variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
	pub loaded: usize,
	/// Model variables the checkpoint had no tensor for; they keep their initial values.
	pub missing: Vec<String>,
}

pub struct MtdnnModel {
	config: MtdnnConfig,
	encoder: Encoder,
	pooler: Option<LinearPooler>,
	dropout_list: Vec<DropoutWrapper>,
	scoring_list: Vec<ScoringHead>,
	varmap: VarMap,
	hidden_size: usize,
	device: Device,
	pub train_loss: AverageMeter,
	pub local_updates: u64,
	span: tracing::Span,
}

fn invalid_input(message: String) -> MtdnnError {
	MtdnnError::msg(MtdnnErrorKind::InvalidInput, message)
}

impl MtdnnModel {
	/// Builds a randomly initialized BERT-based model from the hyperparameters in `config`.
	///
	/// RoBERTa encoders take their hyperparameters from a checkpoint; use
	/// [`MtdnnModel::from_pretrained`] or [`MtdnnModel::with_encoder_config`] for them.
	pub fn new(config: MtdnnConfig, device: &Device) -> MtdnnResult<Self> {
		match config.encoder_type {
			EncoderModelType::Bert => {
				let encoder_config = EncoderConfig::Bert(config.bert_config());
				Self::with_encoder_config(config, encoder_config, device)
			},
			EncoderModelType::Roberta => Err(MtdnnError::msg(
				MtdnnErrorKind::InvalidConfig,
				"invalid MtdnnConfig: a roberta encoder needs the config.json of a checkpoint, use MtdnnModel::from_pretrained",
			)),
		}
	}

	pub fn with_encoder_config(
		config: MtdnnConfig,
		encoder_config: EncoderConfig,
		device: &Device,
	) -> MtdnnResult<Self> {
		config.validate()?;
		if encoder_config.model_type() != config.encoder_type {
			return Err(MtdnnError::msg(
				MtdnnErrorKind::InvalidConfig,
				format!(
					"invalid MtdnnConfig: encoder_type is {:?} but the encoder config is {:?}",
					config.encoder_type,
					encoder_config.model_type()
				),
			));
		}
		let settings = match &encoder_config {
			EncoderConfig::Bert(bert) => bert.encoder_settings(),
			EncoderConfig::Roberta(roberta) => roberta.encoder_settings(),
		};
		if settings.num_attention_heads == 0 || settings.hidden_size % settings.num_attention_heads != 0 {
			return Err(MtdnnError::msg(
				MtdnnErrorKind::InvalidConfig,
				format!(
					"invalid MtdnnConfig: hidden_size {} is not a multiple of num_attention_heads {}",
					settings.hidden_size, settings.num_attention_heads
				),
			));
		}

		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
		let init = WeightInit::from_ratio(config.init_ratio);
		let (encoder, pooler) = match &encoder_config {
			EncoderConfig::Bert(bert) =>
				(Encoder::Bert(BertModel::load(vb.pp(ENCODER_PREFIX), bert, init)?), None),
			EncoderConfig::Roberta(roberta) => (
				Encoder::Roberta(RobertaModel::load(vb.pp(ENCODER_PREFIX), roberta, init)?),
				Some(LinearPooler::load(roberta.hidden_size, init, vb.pp("pooler"))?),
			),
		};
		let hidden_size = encoder.hidden_size();

		let mut dropout_list = Vec::new();
		let mut scoring_list = Vec::new();
		if config.dump_feature {
			tracing::info!("dump_feature is set, skipping task heads");
		} else {
			let heads_vb = vb.pp("scoring_list");
			for task_id in 0..config.num_tasks() {
				let dropout =
					DropoutWrapper::new(config.task_dropout_p(task_id), config.enable_variational_dropout);
				let head =
					ScoringHead::for_task(&config, task_id, hidden_size, dropout, init, heads_vb.pp(task_id))?;
				dropout_list.push(dropout);
				scoring_list.push(head);
			}
		}
		if config.encoder_frozen() {
			tracing::info!("update_bert_opt={}, encoder parameters are frozen", config.update_bert_opt);
		}
		tracing::debug!(
			"built {:?} model with hidden size {} and {} task heads",
			encoder.model_type(),
			hidden_size,
			scoring_list.len()
		);

		Ok(Self {
			config,
			encoder,
			pooler,
			dropout_list,
			scoring_list,
			varmap,
			hidden_size,
			device: device.clone(),
			train_loss: AverageMeter::new(),
			local_updates: 0,
			span: tracing::span!(tracing::Level::TRACE, "mtdnn"),
		})
	}

	/// Builds the model and loads `config.init_checkpoint` through `loader`.
	///
	/// Without a checkpoint a BERT model stays randomly initialized.
	pub fn from_pretrained(
		config: MtdnnConfig,
		loader: &CheckpointLoader,
		device: &Device,
	) -> MtdnnResult<Self> {
		let Some(name) = config.init_checkpoint.clone() else {
			tracing::warn!("no init_checkpoint configured, weights are randomly initialized");
			return Self::new(config, device);
		};
		let resolved = loader.resolve(&name)?;
		let encoder_config = match config.encoder_type {
			EncoderModelType::Bert => EncoderConfig::Bert(config.bert_config()),
			EncoderModelType::Roberta => match resolved.read_config::<RobertaConfig>()? {
				Some(roberta) => EncoderConfig::Roberta(roberta),
				None =>
					return Err(MtdnnError::msg(
						MtdnnErrorKind::InvalidConfig,
						format!("invalid MtdnnConfig: roberta checkpoint {name} has no config.json"),
					)),
			},
		};
		let model = Self::with_encoder_config(config, encoder_config, device)?;
		let report = model.load_checkpoint(&resolved)?;
		tracing::info!(
			"loaded {} tensors from {}, {} variables left at their initial values",
			report.loaded,
			name,
			report.missing.len()
		);
		Ok(model)
	}

	pub fn load_checkpoint(&self, checkpoint: &ResolvedCheckpoint) -> MtdnnResult<LoadReport> {
		let tensors = checkpoint.load_tensors(&self.device)?;
		self.load_state(&tensors)
			.map_err(|err| err.add_context(format!("loading {}", checkpoint.weights.display())))
	}

	/// Copies every tensor whose name matches a model variable. Checkpoint
	/// tensors that match nothing are ignored; a shape mismatch is an error.
	pub fn load_state(&self, tensors: &HashMap<String, Tensor>) -> MtdnnResult<LoadReport> {
		let vars = self.lock_vars()?;
		let mut report = LoadReport::default();
		for (name, var) in vars.iter() {
			let found = candidate_names(name).into_iter().find_map(|candidate| tensors.get(&candidate));
			let Some(tensor) = found else {
				report.missing.push(name.clone());
				continue;
			};
			if tensor.dims() != var.dims() {
				return Err(MtdnnError::msg(
					MtdnnErrorKind::ModelError,
					format!(
						"shape mismatch for {name}: checkpoint has {:?}, model expects {:?}",
						tensor.dims(),
						var.dims()
					),
				));
			}
			var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
			report.loaded += 1;
		}
		report.missing.sort();
		for name in report.missing.iter() {
			tracing::debug!("no checkpoint tensor for {}", name);
		}
		Ok(report)
	}

	fn lock_vars(&self) -> MtdnnResult<MutexGuard<'_, HashMap<String, Var>>> {
		self.varmap
			.data()
			.lock()
			.map_err(|err| MtdnnError::msg(MtdnnErrorKind::ModelError, format!("variable map poisoned: {err}")))
	}

	fn is_frozen_var(&self, name: &str) -> bool {
		self.config.encoder_frozen() &&
			name.strip_prefix(ENCODER_PREFIX).is_some_and(|rest| rest.starts_with('.'))
	}

	/// Names of the variables an optimizer should update, sorted.
	pub fn trainable_var_names(&self) -> MtdnnResult<Vec<String>> {
		let vars = self.lock_vars()?;
		let mut names: Vec<String> = vars.keys().filter(|name| !self.is_frozen_var(name)).cloned().collect();
		names.sort();
		Ok(names)
	}

	/// Variables an optimizer should update. A frozen encoder contributes none.
	pub fn trainable_vars(&self) -> MtdnnResult<Vec<Var>> {
		let vars = self.lock_vars()?;
		let mut named: Vec<(&String, &Var)> =
			vars.iter().filter(|(name, _)| !self.is_frozen_var(name)).collect();
		named.sort_by(|a, b| a.0.cmp(b.0));
		Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
	}

	pub fn varmap(&self) -> &VarMap {
		&self.varmap
	}

	pub fn config(&self) -> &MtdnnConfig {
		&self.config
	}

	pub fn encoder(&self) -> &Encoder {
		&self.encoder
	}

	pub fn device(&self) -> &Device {
		&self.device
	}

	pub fn hidden_size(&self) -> usize {
		self.hidden_size
	}

	pub fn num_tasks(&self) -> usize {
		self.scoring_list.len()
	}

	pub fn dropout_list(&self) -> &[DropoutWrapper] {
		&self.dropout_list
	}

	pub fn scoring_list(&self) -> &[ScoringHead] {
		&self.scoring_list
	}

	/// Folds the loss of one optimizer step over `n` examples into `train_loss`.
	pub fn record_update(&mut self, loss: f64, n: u64) {
		self.train_loss.update(loss, n);
		self.local_updates += 1;
	}

	pub fn encode(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: &Tensor,
	) -> MtdnnResult<EncoderOutput> {
		self.encode_t(input_ids, token_type_ids, attention_mask, false)
	}

	/// Runs the shared encoder. RoBERTa derives its mask from the padding
	/// token and ignores `token_type_ids` and `attention_mask`. A frozen
	/// encoder's outputs are detached, so no gradient reaches its variables.
	pub fn encode_t(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: &Tensor,
		train: bool,
	) -> MtdnnResult<EncoderOutput> {
		let frozen = self.config.encoder_frozen();
		let detach = |layers: Vec<Tensor>| -> Vec<Tensor> {
			if frozen {
				layers.iter().map(Tensor::detach).collect()
			} else {
				layers
			}
		};
		let (all_encoder_layers, pooled_output) = match (&self.encoder, &self.pooler) {
			(Encoder::Bert(bert), _) => {
				let (all_encoder_layers, pooled_output) =
					bert.forward_t(input_ids, token_type_ids, attention_mask, train)?;
				let pooled_output = if frozen { pooled_output.detach() } else { pooled_output };
				(detach(all_encoder_layers), pooled_output)
			},
			(Encoder::Roberta(roberta), Some(pooler)) => {
				let all_encoder_layers = detach(roberta.extract_all_features(input_ids, train)?);
				let pooled_output = match all_encoder_layers.last() {
					Some(last) => pooler.forward(last)?,
					None => return Err(MtdnnError::msg(MtdnnErrorKind::ModelError, "encoder produced no layers")),
				};
				(all_encoder_layers, pooled_output)
			},
			(Encoder::Roberta(_), None) =>
				return Err(MtdnnError::msg(MtdnnErrorKind::ModelError, "roberta encoder built without a pooler")),
		};
		let sequence_output = match all_encoder_layers.last() {
			Some(last) => last.clone(),
			None => return Err(MtdnnError::msg(MtdnnErrorKind::ModelError, "encoder produced no layers")),
		};
		Ok(EncoderOutput { all_encoder_layers, sequence_output, pooled_output })
	}

	pub fn forward(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: &Tensor,
		premise_mask: Option<&Tensor>,
		hyp_mask: Option<&Tensor>,
		task_id: usize,
	) -> MtdnnResult<TaskOutput> {
		self.forward_t(input_ids, token_type_ids, attention_mask, premise_mask, hyp_mask, task_id, false)
	}

	/// Encodes the batch and scores it with the head of `task_id`.
	///
	/// Premise and hypothesis masks mark padding with 1 and are only read by
	/// pairwise heads.
	#[allow(clippy::too_many_arguments)]
	pub fn forward_t(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: &Tensor,
		premise_mask: Option<&Tensor>,
		hyp_mask: Option<&Tensor>,
		task_id: usize,
		train: bool,
	) -> MtdnnResult<TaskOutput> {
		let _enter = self.span.enter();
		let (task_type, dropout, head) = self.task_head(task_id)?;
		let output = self.encode_t(input_ids, token_type_ids, attention_mask, train)?;
		match (task_type, head) {
			(TaskType::Span, ScoringHead::Linear(proj)) => {
				if self.config.decoder_opt(task_id) == DecoderOpt::Pairwise {
					return Err(invalid_input(format!(
						"span task {task_id} cannot use the pairwise decoder"
					)));
				}
				let sequence_output = dropout.forward_t(&output.sequence_output, train)?;
				let logits = proj.forward(&sequence_output)?;
				let start_scores = logits.i((.., .., 0))?.contiguous()?;
				let end_scores = logits.i((.., .., 1))?.contiguous()?;
				Ok(TaskOutput::Span { start_scores, end_scores })
			},
			(TaskType::SequenceLabeling, ScoringHead::Linear(proj)) => {
				let sequence_output = dropout.forward_t(&output.sequence_output, train)?;
				let (batch, seq_len, hidden) = sequence_output.dims3()?;
				let flat = sequence_output.reshape((batch * seq_len, hidden))?;
				Ok(TaskOutput::SequenceLabeling { logits: proj.forward(&flat)? })
			},
			(_, ScoringHead::Pairwise(pairwise)) => {
				let (premise_mask, hyp_mask) = match (premise_mask, hyp_mask) {
					(Some(premise_mask), Some(hyp_mask)) => (premise_mask, hyp_mask),
					_ =>
						return Err(invalid_input(format!(
							"task {task_id} uses the pairwise decoder and needs premise_mask and hyp_mask"
						))),
				};
				let (batch, seq_len, _) = output.sequence_output.dims3()?;
				if premise_mask.dims() != [batch, seq_len] {
					return Err(invalid_input(format!(
						"premise_mask has shape {:?}, expected [{batch}, {seq_len}]",
						premise_mask.dims()
					)));
				}
				let max_query = match hyp_mask.dims() {
					&[hyp_batch, max_query] if hyp_batch == batch => max_query,
					dims =>
						return Err(invalid_input(format!(
							"hyp_mask has shape {dims:?}, expected [{batch}, max_query]"
						))),
				};
				if max_query == 0 || max_query > seq_len {
					return Err(invalid_input(format!(
						"hypothesis length must be in 1..={seq_len}, got {max_query}"
					)));
				}
				let hyp_mem = output.sequence_output.narrow(1, 0, max_query)?;
				let logits =
					pairwise.forward_t(&output.sequence_output, &hyp_mem, premise_mask, hyp_mask, train)?;
				Ok(TaskOutput::Classification { logits })
			},
			(_, ScoringHead::Linear(proj)) => {
				let pooled_output = dropout.forward_t(&output.pooled_output, train)?;
				Ok(TaskOutput::Classification { logits: proj.forward(&pooled_output)? })
			},
		}
	}

	fn task_head(&self, task_id: usize) -> MtdnnResult<(TaskType, &DropoutWrapper, &ScoringHead)> {
		let head = match (self.config.task_type(task_id), self.dropout_list.get(task_id), self.scoring_list.get(task_id))
		{
			(Some(task_type), Some(dropout), Some(head)) => (task_type, dropout, head),
			_ if self.config.dump_feature =>
				return Err(MtdnnError::msg(
					MtdnnErrorKind::UnknownTask,
					format!("task {task_id} has no head, the model was built with dump_feature"),
				)),
			_ =>
				return Err(MtdnnError::msg(
					MtdnnErrorKind::UnknownTask,
					format!("task {task_id} is out of range for {} tasks", self.scoring_list.len()),
				)),
		};
		Ok(head)
	}
}
