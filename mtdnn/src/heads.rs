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

//! Task heads selected by task type and decoder option.

use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

use crate::{
	config::{DecoderOpt, MtdnnConfig, TaskType},
	dropout::DropoutWrapper,
	layers::{linear, Linear, WeightInit},
};

/// Premise/hypothesis scorer used by tasks with [`DecoderOpt::Pairwise`].
///
/// Both sides are reduced with self-attentive pooling restricted to their
/// mask, then `[p, h, |p - h|, p * h]` is projected to the class scores.
/// Masks follow the MT-DNN convention: 1 marks padding.
pub struct PairwiseClassifier {
	premise_attn: Linear,
	hyp_attn: Linear,
	proj: Linear,
	dropout: DropoutWrapper,
	span: tracing::Span,
}

fn self_attn_pool(attn: &Linear, xs: &Tensor, pad_mask: &Tensor) -> Result<Tensor> {
	let scores = attn.forward(xs)?.squeeze(D::Minus1)?;
	let penalty = pad_mask.to_dtype(scores.dtype())?.affine(-10000.0, 0.0)?;
	let alpha = candle_nn::ops::softmax(&(scores + penalty)?, D::Minus1)?;
	alpha.unsqueeze(1)?.matmul(xs)?.squeeze(1)
}

impl PairwiseClassifier {
	pub fn load(
		hidden_size: usize,
		n_class: usize,
		dropout: DropoutWrapper,
		init: WeightInit,
		vb: VarBuilder,
	) -> Result<Self> {
		Ok(Self {
			premise_attn: linear(hidden_size, 1, init, vb.pp("premise_attn"))?,
			hyp_attn: linear(hidden_size, 1, init, vb.pp("hyp_attn"))?,
			proj: linear(4 * hidden_size, n_class, init, vb.pp("proj"))?,
			dropout,
			span: tracing::span!(tracing::Level::TRACE, "pairwise-head"),
		})
	}

	pub fn forward_t(
		&self,
		sequence_output: &Tensor,
		hyp_mem: &Tensor,
		premise_mask: &Tensor,
		hyp_mask: &Tensor,
		train: bool,
	) -> Result<Tensor> {
		let _enter = self.span.enter();
		let premise = self.dropout.forward_t(&sequence_output.contiguous()?, train)?;
		let hypothesis = self.dropout.forward_t(&hyp_mem.contiguous()?, train)?;
		let p = self_attn_pool(&self.premise_attn, &premise, premise_mask)?;
		let h = self_attn_pool(&self.hyp_attn, &hypothesis, hyp_mask)?;
		let features = Tensor::cat(&[&p, &h, &(&p - &h)?.abs()?, &(&p * &h)?], D::Minus1)?;
		self.proj.forward(&features)
	}
}

/// Output projection of one task.
pub enum ScoringHead {
	Linear(Linear),
	Pairwise(PairwiseClassifier),
}

impl ScoringHead {
	/// Builds the head of `task_id` under `vb`:
	/// span tasks project to 2 channels, sequence labeling and the other task
	/// types project to `n_class`, and the pairwise decoder builds a
	/// [`PairwiseClassifier`] for non-span tasks.
	pub fn for_task(
		config: &MtdnnConfig,
		task_id: usize,
		hidden_size: usize,
		dropout: DropoutWrapper,
		init: WeightInit,
		vb: VarBuilder,
	) -> Result<Self> {
		let task_type = match config.task_type(task_id) {
			Some(task_type) => task_type,
			None => candle_core::bail!("no task type declared for task {task_id}"),
		};
		let n_class = config.n_class.get(task_id).copied().unwrap_or_default();
		let head = match (task_type, config.decoder_opt(task_id)) {
			(TaskType::Span, _) => ScoringHead::Linear(linear(hidden_size, 2, init, vb)?),
			(TaskType::SequenceLabeling, _) =>
				ScoringHead::Linear(linear(hidden_size, n_class, init, vb)?),
			(_, DecoderOpt::Pairwise) => ScoringHead::Pairwise(PairwiseClassifier::load(
				hidden_size,
				n_class,
				dropout,
				init,
				vb,
			)?),
			(_, DecoderOpt::Linear) => ScoringHead::Linear(linear(hidden_size, n_class, init, vb)?),
		};
		Ok(head)
	}

	pub fn as_linear(&self) -> Option<&Linear> {
		match self {
			ScoringHead::Linear(proj) => Some(proj),
			ScoringHead::Pairwise(_) => None,
		}
	}

	pub fn is_pairwise(&self) -> bool {
		matches!(self, ScoringHead::Pairwise(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::{DType, Device};
	use candle_nn::VarMap;

	fn config() -> MtdnnConfig {
		MtdnnConfig {
			task_types: vec![TaskType::Span, TaskType::SequenceLabeling, TaskType::Ranking, TaskType::Classification],
			n_class: vec![0, 7, 1, 3],
			decoder_opts: vec![DecoderOpt::Linear, DecoderOpt::Linear, DecoderOpt::Linear, DecoderOpt::Pairwise],
			..Default::default()
		}
	}

	#[test]
	fn test_head_shapes_follow_task_type() -> Result<()> {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let config = config();
		let dropout = DropoutWrapper::new(0.1, false);
		let heads = (0..4)
			.map(|task_id| {
				ScoringHead::for_task(&config, task_id, 8, dropout, WeightInit::default(), vb.pp(task_id))
			})
			.collect::<Result<Vec<_>>>()?;
		assert_eq!(heads[0].as_linear().unwrap().weight().dims(), &[2, 8]);
		assert_eq!(heads[1].as_linear().unwrap().weight().dims(), &[7, 8]);
		assert_eq!(heads[2].as_linear().unwrap().weight().dims(), &[1, 8]);
		assert!(heads[3].is_pairwise());
		Ok(())
	}

	#[test]
	fn test_pairwise_ignores_padded_hypothesis_positions() -> Result<()> {
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
		let head =
			PairwiseClassifier::load(6, 3, DropoutWrapper::new(0.0, false), WeightInit::default(), vb)?;
		let sequence = Tensor::randn(0f32, 1f32, (2, 5, 6), &Device::Cpu)?;
		let hyp_mem = sequence.narrow(1, 0, 3)?;
		let premise_mask = Tensor::zeros((2, 5), DType::U8, &Device::Cpu)?;
		let hyp_mask = Tensor::new(&[[0u8, 0, 1], [0, 0, 1]], &Device::Cpu)?;
		let logits = head.forward_t(&sequence, &hyp_mem, &premise_mask, &hyp_mask, false)?;
		assert_eq!(logits.dims(), &[2, 3]);

		let noisy_tail = Tensor::randn(0f32, 5f32, (2, 1, 6), &Device::Cpu)?;
		let altered = Tensor::cat(&[&sequence.narrow(1, 0, 2)?, &noisy_tail], 1)?;
		let altered_logits = head.forward_t(&sequence, &altered, &premise_mask, &hyp_mask, false)?;
		let diff = (logits - altered_logits)?.abs()?.max_keepdim(1)?.flatten_all()?.to_vec1::<f32>()?;
		assert!(diff.iter().all(|&d| d < 1e-3));
		Ok(())
	}
}
