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

use candle_core::{DType, IndexOp, Result, Tensor};
use candle_nn::{Dropout, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::encoder::{extended_attention_mask, EncoderSettings, HiddenAct, TransformerEncoder};
use crate::layers::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, WeightInit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BertConfig {
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
	pub model_type: Option<String>,
}

impl Default for BertConfig {
	fn default() -> Self {
		Self {
			vocab_size: 30522,
			hidden_size: 768,
			num_hidden_layers: 12,
			num_attention_heads: 12,
			intermediate_size: 3072,
			hidden_act: HiddenAct::Gelu,
			hidden_dropout_prob: 0.1,
			attention_probs_dropout_prob: 0.1,
			max_position_embeddings: 512,
			type_vocab_size: 2,
			initializer_range: 0.02,
			layer_norm_eps: 1e-12,
			pad_token_id: 0,
			model_type: Some("bert".to_string()),
		}
	}
}

impl BertConfig {
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

struct BertEmbeddings {
	word_embeddings: Embedding,
	position_embeddings: Embedding,
	token_type_embeddings: Embedding,
	layer_norm: LayerNorm,
	dropout: Dropout,
	span: tracing::Span,
}

impl BertEmbeddings {
	fn load(vb: VarBuilder, config: &BertConfig, init: WeightInit) -> Result<Self> {
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
				config.type_vocab_size,
				config.hidden_size,
				init,
				vb.pp("token_type_embeddings"),
			)?,
			layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, init, vb.pp("LayerNorm"))?,
			dropout: Dropout::new(config.hidden_dropout_prob as f32),
			span: tracing::span!(tracing::Level::TRACE, "embeddings"),
		})
	}

	fn forward_t(&self, input_ids: &Tensor, token_type_ids: &Tensor, train: bool) -> Result<Tensor> {
		let _enter = self.span.enter();
		let (_, seq_len) = input_ids.dims2()?;
		let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;
		let inputs_embeds = self.word_embeddings.forward(input_ids)?;
		let token_type_embeddings = self.token_type_embeddings.forward(token_type_ids)?;
		let embeddings = (inputs_embeds + token_type_embeddings)?
			.broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;
		let embeddings = self.layer_norm.forward(&embeddings)?;
		self.dropout.forward(&embeddings, train)
	}
}

/// Dense + tanh over the first token of the last layer.
struct BertPooler {
	dense: Linear,
	span: tracing::Span,
}

impl BertPooler {
	fn load(vb: VarBuilder, config: &BertConfig, init: WeightInit) -> Result<Self> {
		Ok(Self {
			dense: linear(config.hidden_size, config.hidden_size, init, vb.pp("dense"))?,
			span: tracing::span!(tracing::Level::TRACE, "pooler"),
		})
	}

	fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
		let _enter = self.span.enter();
		let first_token = hidden_states.i((.., 0))?.contiguous()?;
		self.dense.forward(&first_token)?.tanh()
	}
}

/// BERT encoder with embeddings, layer stack and pooler, stored under
/// `embeddings`, `encoder` and `pooler`.
pub struct BertModel {
	embeddings: BertEmbeddings,
	encoder: TransformerEncoder,
	pooler: BertPooler,
	hidden_size: usize,
	span: tracing::Span,
}

impl BertModel {
	pub fn load(vb: VarBuilder, config: &BertConfig, init: WeightInit) -> Result<Self> {
		let embeddings = BertEmbeddings::load(vb.pp("embeddings"), config, init)?;
		let encoder = TransformerEncoder::load(vb.pp("encoder"), &config.encoder_settings(), init)?;
		let pooler = BertPooler::load(vb.pp("pooler"), config, init)?;
		Ok(Self {
			embeddings,
			encoder,
			pooler,
			hidden_size: config.hidden_size,
			span: tracing::span!(tracing::Level::TRACE, "model"),
		})
	}

	pub fn hidden_size(&self) -> usize {
		self.hidden_size
	}

	/// Returns the output of every encoder layer and the pooled output.
	pub fn forward_t(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: &Tensor,
		train: bool,
	) -> Result<(Vec<Tensor>, Tensor)> {
		let _enter = self.span.enter();
		let mask = extended_attention_mask(attention_mask)?;
		let embedding_output = self.embeddings.forward_t(input_ids, token_type_ids, train)?;
		let all_encoder_layers = self.encoder.forward_t(&embedding_output, &mask, train)?;
		let sequence_output = match all_encoder_layers.last() {
			Some(last) => last,
			None => candle_core::bail!("encoder produced no layers"),
		};
		let pooled_output = self.pooler.forward(sequence_output)?;
		Ok((all_encoder_layers, pooled_output))
	}

	pub fn forward(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: &Tensor,
	) -> Result<(Vec<Tensor>, Tensor)> {
		self.forward_t(input_ids, token_type_ids, attention_mask, false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::Device;
	use candle_nn::VarMap;

	fn tiny_config() -> BertConfig {
		BertConfig {
			vocab_size: 50,
			hidden_size: 16,
			num_hidden_layers: 2,
			num_attention_heads: 2,
			intermediate_size: 32,
			max_position_embeddings: 32,
			..Default::default()
		}
	}

	#[test]
	fn test_forward_shapes() -> Result<()> {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let model = BertModel::load(vb, &tiny_config(), WeightInit::default())?;
		let input_ids = Tensor::new(&[[2u32, 7, 9, 0], [3, 4, 0, 0]], &Device::Cpu)?;
		let token_type_ids = input_ids.zeros_like()?;
		let attention_mask = Tensor::new(&[[1u32, 1, 1, 0], [1, 1, 0, 0]], &Device::Cpu)?;
		let (layers, pooled) = model.forward(&input_ids, &token_type_ids, &attention_mask)?;
		assert_eq!(layers.len(), 2);
		assert_eq!(layers[1].dims(), &[2, 4, 16]);
		assert_eq!(pooled.dims(), &[2, 16]);
		let pooled = pooled.flatten_all()?.to_vec1::<f32>()?;
		assert!(pooled.iter().all(|v| v.abs() <= 1.0));
		Ok(())
	}

	#[test]
	fn test_config_from_hub_json() {
		let json = r#"{
			"vocab_size": 30522,
			"hidden_size": 384,
			"num_hidden_layers": 6,
			"num_attention_heads": 12,
			"intermediate_size": 1536,
			"hidden_act": "gelu",
			"max_position_embeddings": 512,
			"architectures": ["BertModel"]
		}"#;
		let config: BertConfig = serde_json::from_str(json).unwrap();
		assert_eq!(config.hidden_size, 384);
		assert_eq!(config.type_vocab_size, 2);
		assert_eq!(config.encoder_settings().num_hidden_layers, 6);
	}
}
