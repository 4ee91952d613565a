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

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Dropout, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::encoder::{extended_attention_mask, EncoderSettings, HiddenAct, TransformerEncoder};
use crate::layers::{embedding, layer_norm, Embedding, LayerNorm, WeightInit};

/// RoBERTa hyperparameters as found in a checkpoint's `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobertaConfig {
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
	pub bos_token_id: usize,
	pub eos_token_id: usize,
	pub model_type: Option<String>,
}

impl Default for RobertaConfig {
	fn default() -> Self {
		Self {
			vocab_size: 50265,
			hidden_size: 768,
			num_hidden_layers: 12,
			num_attention_heads: 12,
			intermediate_size: 3072,
			hidden_act: HiddenAct::Gelu,
			hidden_dropout_prob: 0.1,
			attention_probs_dropout_prob: 0.1,
			max_position_embeddings: 514,
			type_vocab_size: 1,
			initializer_range: 0.02,
			layer_norm_eps: 1e-5,
			pad_token_id: 1,
			bos_token_id: 0,
			eos_token_id: 2,
			model_type: Some("roberta".to_string()),
		}
	}
}

impl RobertaConfig {
	pub fn encoder_settings(&self) -> EncoderSettings {
		EncoderSettings {
			hidden_size: self.hidden_size,
			num_hidden_layers: self.num_hidden_layers,
			num_attention_heads: self.num_attention_heads,
			intermediate_size: self.intermediate_size,
			hidden_act: self.hidden_act,
			hidden_dropout_prob: self.hidden_dropout_prob,
			attention_probs_dropout_prob: self.attention_probs_dropout_prob,
			layer_norm_eps: self.layer_norm_eps,
		}
	}
}

/// Position ids that skip padding: real tokens are numbered from
/// `padding_idx + 1` in order, padding keeps `padding_idx`.
pub fn create_position_ids_from_input_ids(input_ids: &Tensor, padding_idx: u32) -> Result<Tensor> {
	let mask = input_ids.ne(padding_idx)?.to_dtype(DType::F32)?;
	let incremental_indices = (mask.cumsum(1)? * &mask)?;
	incremental_indices.affine(1.0, padding_idx as f64)?.to_dtype(DType::U32)
}

struct RobertaEmbeddings {
	word_embeddings: Embedding,
	position_embeddings: Embedding,
	token_type_embeddings: Embedding,
	layer_norm: LayerNorm,
	dropout: Dropout,
	padding_idx: u32,
	span: tracing::Span,
}

impl RobertaEmbeddings {
	fn load(vb: VarBuilder, config: &RobertaConfig, init: WeightInit) -> Result<Self> {
		Ok(Self {
			word_embeddings: embedding(
				config.vocab_size,
				config.hidden_size,
				init,
				vb.pp("word_embeddings"),
			)?,
			position_embeddings: embedding(
				config.max_position_embeddings,
				config.hidden_size,
				init,
				vb.pp("position_embeddings"),
			)?,
			token_type_embeddings: embedding(
				config.type_vocab_size.max(1),
				config.hidden_size,
				init,
				vb.pp("token_type_embeddings"),
			)?,
			layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, init, vb.pp("LayerNorm"))?,
			dropout: Dropout::new(config.hidden_dropout_prob as f32),
			padding_idx: config.pad_token_id as u32,
			span: tracing::span!(tracing::Level::TRACE, "embeddings"),
		})
	}

	fn forward_t(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
		let _enter = self.span.enter();
		let position_ids = create_position_ids_from_input_ids(input_ids, self.padding_idx)?;
		let token_type_ids = input_ids.zeros_like()?;
		let embeddings = (self.word_embeddings.forward(input_ids)? +
			self.token_type_embeddings.forward(&token_type_ids)?)?;
		let embeddings = (embeddings + self.position_embeddings.forward(&position_ids)?)?;
		let embeddings = self.layer_norm.forward(&embeddings)?;
		self.dropout.forward(&embeddings, train)
	}
}

/// RoBERTa encoder exposing feature extraction over token ids only.
///
/// There is no pooler here; the MT-DNN model pools the features itself.
pub struct RobertaModel {
	embeddings: RobertaEmbeddings,
	encoder: TransformerEncoder,
	hidden_size: usize,
	pub device: Device,
}

impl RobertaModel {
	pub fn load(vb: VarBuilder, config: &RobertaConfig, init: WeightInit) -> Result<Self> {
		let embeddings = RobertaEmbeddings::load(vb.pp("embeddings"), config, init)?;
		let encoder = TransformerEncoder::load(vb.pp("encoder"), &config.encoder_settings(), init)?;
		Ok(Self { embeddings, encoder, hidden_size: config.hidden_size, device: vb.device().clone() })
	}

	pub fn hidden_size(&self) -> usize {
		self.hidden_size
	}

	/// Output of every layer. Padding positions (`pad_token_id`) are masked
	/// out of attention.
	pub fn extract_all_features(&self, input_ids: &Tensor, train: bool) -> Result<Vec<Tensor>> {
		let attention_mask = input_ids.ne(self.embeddings.padding_idx)?;
		let mask = extended_attention_mask(&attention_mask)?;
		let embedding_output = self.embeddings.forward_t(input_ids, train)?;
		self.encoder.forward_t(&embedding_output, &mask, train)
	}

	/// Last layer features, `(batch, seq, hidden)`.
	pub fn extract_features(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
		match self.extract_all_features(input_ids, train)?.pop() {
			Some(features) => Ok(features),
			None => candle_core::bail!("encoder produced no layers"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::DType;
	use candle_nn::VarMap;

	#[test]
	fn test_position_ids_skip_padding() -> Result<()> {
		let input_ids = Tensor::new(&[[0u32, 31, 42, 2, 1, 1]], &Device::Cpu)?;
		let positions = create_position_ids_from_input_ids(&input_ids, 1)?.to_vec2::<u32>()?;
		assert_eq!(positions, vec![vec![2, 3, 4, 5, 1, 1]]);

		let wide_ids = Tensor::new(&[[0i64, 1, 9], [1, 1, 1]], &Device::Cpu)?;
		let positions = create_position_ids_from_input_ids(&wide_ids, 1)?.to_vec2::<u32>()?;
		assert_eq!(positions, vec![vec![2, 1, 3], vec![1, 1, 1]]);
		Ok(())
	}

	#[test]
	fn test_extract_features_shape() -> Result<()> {
		let config = RobertaConfig {
			vocab_size: 60,
			hidden_size: 12,
			num_hidden_layers: 2,
			num_attention_heads: 3,
			intermediate_size: 24,
			max_position_embeddings: 20,
			..Default::default()
		};
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let model = RobertaModel::load(vb, &config, WeightInit::default())?;
		let input_ids = Tensor::new(&[[0u32, 5, 6, 2], [0, 7, 2, 1]], &Device::Cpu)?;
		let features = model.extract_features(&input_ids, false)?;
		assert_eq!(features.dims(), &[2, 4, 12]);
		assert_eq!(model.extract_all_features(&input_ids, false)?.len(), 2);
		Ok(())
	}

	#[test]
	fn test_hub_config_parses() {
		let json = r#"{
			"architectures": ["RobertaForMaskedLM"],
			"hidden_size": 768,
			"layer_norm_eps": 1e-05,
			"max_position_embeddings": 514,
			"model_type": "roberta",
			"type_vocab_size": 1,
			"vocab_size": 50265
		}"#;
		let config: RobertaConfig = serde_json::from_str(json).unwrap();
		assert_eq!(config.pad_token_id, 1);
		assert_eq!(config.type_vocab_size, 1);
	}
}
