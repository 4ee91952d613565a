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

pub mod bert;
pub use bert::*;
pub mod encoder;
pub use encoder::{EncoderSettings, HiddenAct};
pub mod roberta;
pub use roberta::*;
pub mod modelling_outputs;
pub use modelling_outputs::*;

use crate::config::EncoderModelType;

/// Hyperparameters of the shared encoder, one variant per encoder family.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderConfig {
	Bert(BertConfig),
	Roberta(RobertaConfig),
}

impl EncoderConfig {
	pub fn model_type(&self) -> EncoderModelType {
		match self {
			EncoderConfig::Bert(_) => EncoderModelType::Bert,
			EncoderConfig::Roberta(_) => EncoderModelType::Roberta,
		}
	}

	pub fn hidden_size(&self) -> usize {
		match self {
			EncoderConfig::Bert(config) => config.hidden_size,
			EncoderConfig::Roberta(config) => config.hidden_size,
		}
	}
}

/// The shared encoder owned by the model.
pub enum Encoder {
	Bert(BertModel),
	Roberta(RobertaModel),
}

impl Encoder {
	pub fn model_type(&self) -> EncoderModelType {
		match self {
			Encoder::Bert(_) => EncoderModelType::Bert,
			Encoder::Roberta(_) => EncoderModelType::Roberta,
		}
	}

	pub fn hidden_size(&self) -> usize {
		match self {
			Encoder::Bert(model) => model.hidden_size(),
			Encoder::Roberta(model) => model.hidden_size(),
		}
	}
}
