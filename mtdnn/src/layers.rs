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

//! Traced building blocks whose parameters are created with the MT-DNN
//! initialization scheme.
//!
//! Each parameterised layer belongs to one [`LayerKind`]. The kind decides how
//! the weight and bias of a freshly created variable are initialized, so the
//! whole model is initialized at construction time without inspecting module
//! types afterwards. When the `VarBuilder` is backed by a checkpoint instead of
//! a `VarMap`, the hints are ignored and the stored tensors are used.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};

/// Base standard deviation of the normal initializer, scaled by `init_ratio`.
pub const BASE_INIT_STD: f64 = 0.02;

/// Closed set of layer kinds that own parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
	Linear,
	Embedding,
	LayerNorm,
}

/// Role of a parameter inside its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
	/// `weight` for linear and embedding layers, the scale for layer norm.
	Weight,
	/// `bias` for linear layers, the shift for layer norm.
	Bias,
}

/// Initialization scheme shared by every layer of a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightInit {
	pub std: f64,
}

impl WeightInit {
	pub fn from_ratio(init_ratio: f64) -> Self {
		Self { std: BASE_INIT_STD * init_ratio }
	}

	pub fn hint(&self, kind: LayerKind, role: ParamRole) -> Init {
		match (kind, role) {
			(LayerKind::Linear | LayerKind::Embedding, ParamRole::Weight) =>
				Init::Randn { mean: 0.0, stdev: self.std },
			(LayerKind::LayerNorm, ParamRole::Weight) => Init::Const(1.0),
			(_, ParamRole::Bias) => Init::Const(0.0),
		}
	}
}

impl Default for WeightInit {
	fn default() -> Self {
		Self::from_ratio(1.0)
	}
}

#[derive(Debug, Clone)]
pub struct Linear {
	inner: candle_nn::Linear,
	span: tracing::Span,
}

impl Linear {
	pub fn weight(&self) -> &Tensor {
		self.inner.weight()
	}
}

impl Module for Linear {
	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let _enter = self.span.enter();
		self.inner.forward(xs)
	}
}

pub fn linear(in_dim: usize, out_dim: usize, init: WeightInit, vb: VarBuilder) -> Result<Linear> {
	let weight = vb.get_with_hints(
		(out_dim, in_dim),
		"weight",
		init.hint(LayerKind::Linear, ParamRole::Weight),
	)?;
	let bias = vb.get_with_hints(out_dim, "bias", init.hint(LayerKind::Linear, ParamRole::Bias))?;
	Ok(Linear {
		inner: candle_nn::Linear::new(weight, Some(bias)),
		span: tracing::span!(tracing::Level::TRACE, "linear"),
	})
}

#[derive(Debug, Clone)]
pub struct Embedding {
	inner: candle_nn::Embedding,
	span: tracing::Span,
}

impl Embedding {
	pub fn embeddings(&self) -> &Tensor {
		self.inner.embeddings()
	}
}

impl Module for Embedding {
	fn forward(&self, ids: &Tensor) -> Result<Tensor> {
		let _enter = self.span.enter();
		self.inner.forward(ids)
	}
}

pub fn embedding(
	num_embeddings: usize,
	hidden_size: usize,
	init: WeightInit,
	vb: VarBuilder,
) -> Result<Embedding> {
	let embeddings = vb.get_with_hints(
		(num_embeddings, hidden_size),
		"weight",
		init.hint(LayerKind::Embedding, ParamRole::Weight),
	)?;
	Ok(Embedding {
		inner: candle_nn::Embedding::new(embeddings, hidden_size),
		span: tracing::span!(tracing::Level::TRACE, "embedding"),
	})
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
	inner: candle_nn::LayerNorm,
	span: tracing::Span,
}

impl Module for LayerNorm {
	fn forward(&self, xs: &Tensor) -> Result<Tensor> {
		let _enter = self.span.enter();
		self.inner.forward(xs)
	}
}

/// Layer norm stored under the `weight` / `bias` names. Checkpoints written
/// with the legacy `gamma` / `beta` names are renamed by the checkpoint loader.
pub fn layer_norm(size: usize, eps: f64, init: WeightInit, vb: VarBuilder) -> Result<LayerNorm> {
	let weight =
		vb.get_with_hints(size, "weight", init.hint(LayerKind::LayerNorm, ParamRole::Weight))?;
	let bias = vb.get_with_hints(size, "bias", init.hint(LayerKind::LayerNorm, ParamRole::Bias))?;
	Ok(LayerNorm {
		inner: candle_nn::LayerNorm::new(weight, bias, eps),
		span: tracing::span!(tracing::Level::TRACE, "layer-norm"),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::{DType, Device};
	use candle_nn::VarMap;

	#[test]
	fn test_hints_follow_layer_kind() {
		let init = WeightInit::from_ratio(2.0);
		assert!((init.std - 0.04).abs() < 1e-12);
		assert!(matches!(
			init.hint(LayerKind::Embedding, ParamRole::Weight),
			Init::Randn { mean, stdev } if mean == 0.0 && (stdev - 0.04).abs() < 1e-12
		));
		assert!(matches!(init.hint(LayerKind::Linear, ParamRole::Bias), Init::Const(v) if v == 0.0));
		assert!(matches!(
			init.hint(LayerKind::LayerNorm, ParamRole::Weight),
			Init::Const(v) if v == 1.0
		));
		assert!(matches!(
			init.hint(LayerKind::LayerNorm, ParamRole::Bias),
			Init::Const(v) if v == 0.0
		));
	}

	#[test]
	fn test_layer_norm_starts_as_identity_affine() -> Result<()> {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let norm = layer_norm(8, 1e-12, WeightInit::default(), vb.pp("norm"))?;
		let xs = Tensor::arange(0f32, 16f32, &Device::Cpu)?.reshape((2, 8))?;
		let ys = norm.forward(&xs)?;
		let row = ys.get(0)?.to_vec1::<f32>()?;
		let mean: f32 = row.iter().sum::<f32>() / row.len() as f32;
		assert!(mean.abs() < 1e-4);

		let data = varmap.data().lock().unwrap();
		let scale = data.get("norm.weight").unwrap().as_tensor().to_vec1::<f32>()?;
		let shift = data.get("norm.bias").unwrap().as_tensor().to_vec1::<f32>()?;
		assert!(scale.iter().all(|&v| v == 1.0));
		assert!(shift.iter().all(|&v| v == 0.0));
		Ok(())
	}

	#[test]
	fn test_linear_shapes() -> Result<()> {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let proj = linear(6, 3, WeightInit::default(), vb.pp("proj"))?;
		assert_eq!(proj.weight().dims(), &[3, 6]);
		let xs = Tensor::zeros((2, 4, 6), DType::F32, &Device::Cpu)?;
		assert_eq!(proj.forward(&xs)?.dims(), &[2, 4, 3]);
		Ok(())
	}
}
