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

use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::layers::{linear, Linear, WeightInit};

/// Pools encoder features that come without a pooler (RoBERTa) into a
/// `(batch, hidden)` vector: dense + tanh over the first token.
pub struct LinearPooler {
	dense: Linear,
	span: tracing::Span,
}

impl LinearPooler {
	pub fn load(hidden_size: usize, init: WeightInit, vb: VarBuilder) -> Result<Self> {
		Ok(Self {
			dense: linear(hidden_size, hidden_size, init, vb.pp("dense"))?,
			span: tracing::span!(tracing::Level::TRACE, "linear-pooler"),
		})
	}
}

impl Module for LinearPooler {
	fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
		let _enter = self.span.enter();
		let first_token = hidden_states.i((.., 0))?.contiguous()?;
		self.dense.forward(&first_token)?.tanh()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::{DType, Device};
	use candle_nn::VarMap;

	#[test]
	fn test_pools_first_token() -> Result<()> {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let pooler = LinearPooler::load(8, WeightInit::default(), vb.pp("pooler"))?;
		let features = Tensor::randn(0f32, 1f32, (3, 5, 8), &Device::Cpu)?;
		let pooled = pooler.forward(&features)?;
		assert_eq!(pooled.dims(), &[3, 8]);

		// only the first position contributes
		let shifted = Tensor::cat(&[&features.narrow(1, 0, 1)?, &features.narrow(1, 1, 4)?.zeros_like()?], 1)?;
		let diff = (pooler.forward(&shifted)? - pooled)?.abs()?.sum_all()?.to_scalar::<f32>()?;
		assert!(diff < 1e-5);
		Ok(())
	}
}
