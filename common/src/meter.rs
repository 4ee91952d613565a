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

use serde::{Deserialize, Serialize};

/// Running average of a scalar, typically the training loss.
///
/// `update` takes the value observed for a batch and the number of samples it
/// stands for, so the average is weighted by batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageMeter {
	/// Last observed value.
	pub val: f64,
	/// Weighted average over everything seen since the last reset.
	pub avg: f64,
	/// Weighted sum of observed values.
	pub sum: f64,
	/// Total weight (number of samples).
	pub count: u64,
}

impl AverageMeter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn reset(&mut self) {
		*self = Self::default();
	}

	pub fn update(&mut self, val: f64, n: u64) {
		self.val = val;
		self.sum += val * n as f64;
		self.count += n;
		if self.count > 0 {
			self.avg = self.sum / self.count as f64;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_weighted_average() {
		let mut meter = AverageMeter::new();
		meter.update(2.0, 1);
		meter.update(4.0, 3);
		assert_eq!(meter.val, 4.0);
		assert_eq!(meter.count, 4);
		assert!((meter.sum - 14.0).abs() < 1e-12);
		assert!((meter.avg - 3.5).abs() < 1e-12);
	}

	#[test]
	fn test_zero_weight_keeps_average() {
		let mut meter = AverageMeter::new();
		meter.update(1.5, 0);
		assert_eq!(meter.count, 0);
		assert_eq!(meter.avg, 0.0);
		assert_eq!(meter.val, 1.5);
	}

	#[test]
	fn test_reset_and_serde() {
		let mut meter = AverageMeter::new();
		meter.update(0.25, 8);
		let json = serde_json::to_string(&meter).unwrap();
		let restored: AverageMeter = serde_json::from_str(&json).unwrap();
		assert_eq!(restored, meter);

		meter.reset();
		assert_eq!(meter, AverageMeter::default());
	}
}
