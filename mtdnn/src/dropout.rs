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

use candle_core::{Result, Tensor};

/// Per-task dropout.
///
/// With `variational` set, a rank-3 input `(batch, seq, hidden)` shares one
/// mask across the sequence dimension, so every position of an example drops
/// the same hidden units. Other ranks fall back to element-wise dropout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutWrapper {
	dropout_p: f64,
	variational: bool,
}

impl DropoutWrapper {
	pub fn new(dropout_p: f64, variational: bool) -> Self {
		Self { dropout_p, variational }
	}

	pub fn dropout_p(&self) -> f64 {
		self.dropout_p
	}

	pub fn is_variational(&self) -> bool {
		self.variational
	}

	pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
		if !train || self.dropout_p == 0.0 {
			return Ok(xs.clone());
		}
		if self.variational && xs.rank() == 3 {
			let (batch, _, hidden) = xs.dims3()?;
			let keep = Tensor::rand(0f32, 1f32, (batch, 1, hidden), xs.device())?
				.ge(self.dropout_p as f32)?
				.to_dtype(xs.dtype())?;
			let mask = (keep * (1.0 / (1.0 - self.dropout_p)))?;
			xs.broadcast_mul(&mask)
		} else {
			candle_nn::ops::dropout(xs, self.dropout_p as f32)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::{DType, Device};

	#[test]
	fn test_identity_outside_training() -> Result<()> {
		let dropout = DropoutWrapper::new(0.5, true);
		let xs = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu)?;
		let ys = dropout.forward_t(&xs, false)?;
		assert_eq!(ys.to_vec3::<f32>()?, xs.to_vec3::<f32>()?);
		Ok(())
	}

	#[test]
	fn test_variational_mask_is_shared_across_sequence() -> Result<()> {
		let dropout = DropoutWrapper::new(0.5, true);
		let xs = Tensor::ones((4, 6, 16), DType::F32, &Device::Cpu)?;
		let ys = dropout.forward_t(&xs, true)?.to_vec3::<f32>()?;
		for example in ys.iter() {
			for position in example.iter() {
				assert_eq!(position, &example[0]);
				assert!(position.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
			}
		}
		Ok(())
	}

	#[test]
	fn test_zero_rate_is_identity_in_training() -> Result<()> {
		let dropout = DropoutWrapper::new(0.0, false);
		let xs = Tensor::ones((2, 5), DType::F32, &Device::Cpu)?;
		let ys = dropout.forward_t(&xs, true)?;
		assert_eq!(ys.to_vec2::<f32>()?, xs.to_vec2::<f32>()?);
		Ok(())
	}
}
