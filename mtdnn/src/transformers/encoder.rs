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

//! Transformer layer stack shared by the BERT and RoBERTa encoders.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Dropout, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::layers::{layer_norm, linear, LayerNorm, Linear, WeightInit};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
	#[default]
	Gelu,
	#[serde(alias = "gelu_new", alias = "gelu_pytorch_tanh")]
	GeluApproximate,
	Relu,
	Tanh,
}

struct HiddenActLayer {
	act: HiddenAct,
	span: tracing::Span,
}

impl HiddenActLayer {
	fn new(act: HiddenAct) -> Self {
		let span = tracing::span!(tracing::Level::TRACE, "hidden-act");
		Self { act, span }
	}

	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let _enter = self.span.enter();
		match self.act {
			HiddenAct::Gelu => xs.gelu_erf(),
			HiddenAct::GeluApproximate => xs.gelu(),
			HiddenAct::Relu => xs.relu(),
			HiddenAct::Tanh => xs.tanh(),
		}
	}
}

/// Hyperparameters of one encoder layer, common to every encoder family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderSettings {
	pub hidden_size: usize,
	pub num_hidden_layers: usize,
	pub num_attention_heads: usize,
	pub intermediate_size: usize,
	pub hidden_act: HiddenAct,
	pub hidden_dropout_prob: f64,
	pub attention_probs_dropout_prob: f64,
	pub layer_norm_eps: f64,
}

/// Turns a `(batch, seq)` mask with 1 for real tokens into an additive
/// `(batch, 1, 1, seq)` bias: 0 where attending, -10000 on padding.
pub fn extended_attention_mask(attention_mask: &Tensor) -> Result<Tensor> {
	let (batch, seq_len) = attention_mask.dims2()?;
	attention_mask
		.to_dtype(DType::F32)?
		.affine(10000.0, -10000.0)?
		.reshape((batch, 1, 1, seq_len))
}

struct SelfAttention {
	query: Linear,
	key: Linear,
	value: Linear,
	dropout: Dropout,
	num_attention_heads: usize,
	attention_head_size: usize,
	span: tracing::Span,
	span_softmax: tracing::Span,
}

impl SelfAttention {
	fn load(vb: VarBuilder, settings: &EncoderSettings, init: WeightInit) -> Result<Self> {
		let attention_head_size = settings.hidden_size / settings.num_attention_heads;
		let all_head_size = settings.num_attention_heads * attention_head_size;
		let hidden_size = settings.hidden_size;
		Ok(Self {
			query: linear(hidden_size, all_head_size, init, vb.pp("query"))?,
			key: linear(hidden_size, all_head_size, init, vb.pp("key"))?,
			value: linear(hidden_size, all_head_size, init, vb.pp("value"))?,
			dropout: Dropout::new(settings.attention_probs_dropout_prob as f32),
			num_attention_heads: settings.num_attention_heads,
			attention_head_size,
			span: tracing::span!(tracing::Level::TRACE, "self-attn"),
			span_softmax: tracing::span!(tracing::Level::TRACE, "softmax"),
		})
	}

	fn transpose_for_scores(&self, xs: &Tensor) -> Result<Tensor> {
		let (batch, seq_len, _) = xs.dims3()?;
		xs.reshape((batch, seq_len, self.num_attention_heads, self.attention_head_size))?
			.transpose(1, 2)?
			.contiguous()
	}

	fn forward_t(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
		let _enter = self.span.enter();
		let query_layer = self.transpose_for_scores(&self.query.forward(hidden_states)?)?;
		let key_layer = self.transpose_for_scores(&self.key.forward(hidden_states)?)?;
		let value_layer = self.transpose_for_scores(&self.value.forward(hidden_states)?)?;

		let attention_scores = query_layer.matmul(&key_layer.t()?)?;
		let attention_scores = (attention_scores / (self.attention_head_size as f64).sqrt())?;
		let attention_scores = attention_scores.broadcast_add(mask)?;
		let attention_probs = {
			let _enter_sm = self.span_softmax.enter();
			candle_nn::ops::softmax(&attention_scores, candle_core::D::Minus1)?
		};
		let attention_probs = self.dropout.forward(&attention_probs, train)?;
		let context_layer = attention_probs.matmul(&value_layer)?;
		let context_layer = context_layer.transpose(1, 2)?.contiguous()?;
		context_layer.flatten_from(candle_core::D::Minus2)
	}
}

/// Dense projection, dropout and residual layer norm. Used after attention
/// (`hidden -> hidden`) and after the intermediate block (`intermediate -> hidden`).
struct ResidualOutput {
	dense: Linear,
	layer_norm: LayerNorm,
	dropout: Dropout,
	span: tracing::Span,
}

impl ResidualOutput {
	fn load(
		vb: VarBuilder,
		in_dim: usize,
		settings: &EncoderSettings,
		init: WeightInit,
	) -> Result<Self> {
		Ok(Self {
			dense: linear(in_dim, settings.hidden_size, init, vb.pp("dense"))?,
			layer_norm: layer_norm(
				settings.hidden_size,
				settings.layer_norm_eps,
				init,
				vb.pp("LayerNorm"),
			)?,
			dropout: Dropout::new(settings.hidden_dropout_prob as f32),
			span: tracing::span!(tracing::Level::TRACE, "out"),
		})
	}

	fn forward_t(&self, hidden_states: &Tensor, input_tensor: &Tensor, train: bool) -> Result<Tensor> {
		let _enter = self.span.enter();
		let hidden_states = self.dense.forward(hidden_states)?;
		let hidden_states = self.dropout.forward(&hidden_states, train)?;
		self.layer_norm.forward(&(hidden_states + input_tensor)?)
	}
}

struct Intermediate {
	dense: Linear,
	intermediate_act: HiddenActLayer,
}

impl Intermediate {
	fn load(vb: VarBuilder, settings: &EncoderSettings, init: WeightInit) -> Result<Self> {
		Ok(Self {
			dense: linear(settings.hidden_size, settings.intermediate_size, init, vb.pp("dense"))?,
			intermediate_act: HiddenActLayer::new(settings.hidden_act),
		})
	}

	fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
		self.intermediate_act.forward(&self.dense.forward(hidden_states)?)
	}
}

struct TransformerLayer {
	self_attention: SelfAttention,
	attention_output: ResidualOutput,
	intermediate: Intermediate,
	output: ResidualOutput,
	span: tracing::Span,
}

impl TransformerLayer {
	fn load(vb: VarBuilder, settings: &EncoderSettings, init: WeightInit) -> Result<Self> {
		let attention = vb.pp("attention");
		Ok(Self {
			self_attention: SelfAttention::load(attention.pp("self"), settings, init)?,
			attention_output: ResidualOutput::load(
				attention.pp("output"),
				settings.hidden_size,
				settings,
				init,
			)?,
			intermediate: Intermediate::load(vb.pp("intermediate"), settings, init)?,
			output: ResidualOutput::load(
				vb.pp("output"),
				settings.intermediate_size,
				settings,
				init,
			)?,
			span: tracing::span!(tracing::Level::TRACE, "layer"),
		})
	}

	fn forward_t(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
		let _enter = self.span.enter();
		let self_outputs = self.self_attention.forward_t(hidden_states, mask, train)?;
		let attention_output = self.attention_output.forward_t(&self_outputs, hidden_states, train)?;
		let intermediate_output = self.intermediate.forward(&attention_output)?;
		self.output.forward_t(&intermediate_output, &attention_output, train)
	}
}

/// Stack of transformer layers stored under `layer.{index}`.
pub struct TransformerEncoder {
	layers: Vec<TransformerLayer>,
	span: tracing::Span,
}

impl TransformerEncoder {
	pub fn load(vb: VarBuilder, settings: &EncoderSettings, init: WeightInit) -> Result<Self> {
		if settings.num_attention_heads == 0 ||
			settings.hidden_size % settings.num_attention_heads != 0
		{
			candle_core::bail!(
				"hidden size {} is not a multiple of the number of attention heads {}",
				settings.hidden_size,
				settings.num_attention_heads
			)
		}
		let layers = (0..settings.num_hidden_layers)
			.map(|index| TransformerLayer::load(vb.pp(format!("layer.{index}")), settings, init))
			.collect::<Result<Vec<_>>>()?;
		Ok(Self { layers, span: tracing::span!(tracing::Level::TRACE, "encoder") })
	}

	pub fn num_layers(&self) -> usize {
		self.layers.len()
	}

	/// Runs every layer and returns each layer's output, first to last.
	/// `mask` is the additive mask from [`extended_attention_mask`].
	pub fn forward_t(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Vec<Tensor>> {
		let _enter = self.span.enter();
		let mut all_layers = Vec::with_capacity(self.layers.len());
		let mut hidden_states = hidden_states.clone();
		for layer in self.layers.iter() {
			hidden_states = layer.forward_t(&hidden_states, mask, train)?;
			all_layers.push(hidden_states.clone());
		}
		if all_layers.is_empty() {
			all_layers.push(hidden_states);
		}
		Ok(all_layers)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::Device;
	use candle_nn::VarMap;

	fn settings() -> EncoderSettings {
		EncoderSettings {
			hidden_size: 16,
			num_hidden_layers: 3,
			num_attention_heads: 4,
			intermediate_size: 32,
			hidden_act: HiddenAct::Gelu,
			hidden_dropout_prob: 0.1,
			attention_probs_dropout_prob: 0.1,
			layer_norm_eps: 1e-12,
		}
	}

	#[test]
	fn test_extended_mask_values() -> Result<()> {
		let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu)?;
		let extended = extended_attention_mask(&mask)?;
		assert_eq!(extended.dims(), &[1, 1, 1, 3]);
		let values = extended.flatten_all()?.to_vec1::<f32>()?;
		assert_eq!(values, vec![0.0, 0.0, -10000.0]);
		Ok(())
	}

	#[test]
	fn test_encoder_returns_every_layer() -> Result<()> {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let encoder = TransformerEncoder::load(vb, &settings(), WeightInit::default())?;
		assert_eq!(encoder.num_layers(), 3);
		let xs = Tensor::randn(0f32, 1f32, (2, 5, 16), &Device::Cpu)?;
		let mask = extended_attention_mask(&Tensor::ones((2, 5), DType::U32, &Device::Cpu)?)?;
		let layers = encoder.forward_t(&xs, &mask, false)?;
		assert_eq!(layers.len(), 3);
		for layer in layers.iter() {
			assert_eq!(layer.dims(), &[2, 5, 16]);
		}
		Ok(())
	}

	#[test]
	fn test_rejects_indivisible_heads() {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let mut bad = settings();
		bad.num_attention_heads = 5;
		assert!(TransformerEncoder::load(vb, &bad, WeightInit::default()).is_err());
	}
}
