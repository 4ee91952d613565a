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

use candle_core::Tensor;

/// Representations produced by the shared encoder.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
	/// Output of every encoder layer, first to last.
	pub all_encoder_layers: Vec<Tensor>,
	/// Last layer, `(batch, seq, hidden)`.
	pub sequence_output: Tensor,
	/// Summary vector per example, `(batch, hidden)`.
	pub pooled_output: Tensor,
}

/// Output of one task head. The variant follows the task type.
#[derive(Debug, Clone)]
pub enum TaskOutput {
	/// Start and end scores, each `(batch, seq)`.
	Span { start_scores: Tensor, end_scores: Tensor },
	/// Per-token tag scores flattened to `(batch * seq, n_class)`.
	SequenceLabeling { logits: Tensor },
	/// Per-example scores, `(batch, n_class)`.
	Classification { logits: Tensor },
}

impl TaskOutput {
	/// Logits of a non-span task.
	pub fn logits(&self) -> Option<&Tensor> {
		match self {
			TaskOutput::Span { .. } => None,
			TaskOutput::SequenceLabeling { logits } | TaskOutput::Classification { logits } =>
				Some(logits),
		}
	}

	/// Start and end scores of a span task.
	pub fn span_scores(&self) -> Option<(&Tensor, &Tensor)> {
		match self {
			TaskOutput::Span { start_scores, end_scores } => Some((start_scores, end_scores)),
			_ => None,
		}
	}
}
