// Copyright 2020 Parity Technologies (UK) Ltd.
// This file is part of Polkadot.

// Polkadot is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Polkadot is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Polkadot.  If not, see <http://www.gnu.org/licenses/>.

use prometheus::{
	core::Collector, Histogram, HistogramOpts, HistogramTimer, IntCounter, IntCounterVec, Opts,
	Registry,
};

use crate::time::Tick;

/// Approval Voting metrics.
#[derive(Default, Clone)]
pub struct Metrics(Option<MetricsInner>);

#[derive(Clone)]
struct MetricsInner {
	imported_candidates_total: IntCounter,
	assignments_produced: Histogram,
	approvals_produced_total: IntCounterVec,
	no_shows_total: IntCounter,
	wakeups_triggered_total: IntCounter,
	candidate_approval_time_ticks: Histogram,
	block_approval_time_ticks: Histogram,
	time_recover_and_approve: Histogram,
}

impl Metrics {
	/// Register the metrics with the given registry.
	pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
		let metrics = MetricsInner {
			imported_candidates_total: register(
				IntCounter::new(
					"polkadot_parachain_imported_candidates_total",
					"Number of candidates imported by the approval voting subsystem",
				)?,
				registry,
			)?,
			assignments_produced: register(
				Histogram::with_opts(
					HistogramOpts::new(
						"polkadot_parachain_assignments_produced",
						"Assignments and tranches produced by the approval voting subsystem",
					)
					.buckets(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 10.0, 15.0, 25.0, 40.0, 70.0]),
				)?,
				registry,
			)?,
			approvals_produced_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approvals_produced_total",
						"Number of approvals produced by the approval voting subsystem",
					),
					&["status"],
				)?,
				registry,
			)?,
			no_shows_total: register(
				IntCounter::new(
					"polkadot_parachain_approvals_no_shows_total",
					"Number of assignments which became no-shows in the approval voting subsystem",
				)?,
				registry,
			)?,
			wakeups_triggered_total: register(
				IntCounter::new(
					"polkadot_parachain_approvals_wakeups_total",
					"Number of times we woke up to process a candidate in the approval voting subsystem",
				)?,
				registry,
			)?,
			candidate_approval_time_ticks: register(
				Histogram::with_opts(
					HistogramOpts::new(
						"polkadot_parachain_approvals_candidate_approval_time_ticks",
						"Number of ticks (500ms) to approve candidates.",
					)
					.buckets(vec![6.0, 12.0, 18.0, 24.0, 30.0, 36.0, 72.0, 100.0, 144.0]),
				)?,
				registry,
			)?,
			block_approval_time_ticks: register(
				Histogram::with_opts(
					HistogramOpts::new(
						"polkadot_parachain_approvals_blockapproval_time_ticks",
						"Number of ticks (500ms) to approve blocks.",
					)
					.buckets(vec![6.0, 12.0, 18.0, 24.0, 30.0, 36.0, 72.0, 100.0, 144.0]),
				)?,
				registry,
			)?,
			time_recover_and_approve: register(
				Histogram::with_opts(
					HistogramOpts::new(
						"polkadot_parachain_time_recover_and_approve",
						"Time spent recovering and approving data in approval voting",
					)
					.buckets(vec![0.1, 0.5, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 24.0]),
				)?,
				registry,
			)?,
		};

		Ok(Metrics(Some(metrics)))
	}

	pub(crate) fn on_candidate_imported(&self) {
		if let Some(metrics) = &self.0 {
			metrics.imported_candidates_total.inc();
		}
	}

	pub(crate) fn on_assignment_produced(&self, tranche: u32) {
		if let Some(metrics) = &self.0 {
			metrics.assignments_produced.observe(tranche as f64);
		}
	}

	pub(crate) fn on_approval_stale(&self) {
		if let Some(metrics) = &self.0 {
			metrics.approvals_produced_total.with_label_values(&["stale"]).inc()
		}
	}

	pub(crate) fn on_approval_invalid(&self) {
		if let Some(metrics) = &self.0 {
			metrics.approvals_produced_total.with_label_values(&["invalid"]).inc()
		}
	}

	pub(crate) fn on_approval_unavailable(&self) {
		if let Some(metrics) = &self.0 {
			metrics.approvals_produced_total.with_label_values(&["unavailable"]).inc()
		}
	}

	pub(crate) fn on_approval_error(&self) {
		if let Some(metrics) = &self.0 {
			metrics.approvals_produced_total.with_label_values(&["internal error"]).inc()
		}
	}

	pub(crate) fn on_approval_produced(&self) {
		if let Some(metrics) = &self.0 {
			metrics.approvals_produced_total.with_label_values(&["success"]).inc()
		}
	}

	pub(crate) fn on_no_shows(&self, n: usize) {
		if let Some(metrics) = &self.0 {
			metrics.no_shows_total.inc_by(n as u64);
		}
	}

	pub(crate) fn on_wakeup(&self) {
		if let Some(metrics) = &self.0 {
			metrics.wakeups_triggered_total.inc();
		}
	}

	pub(crate) fn on_candidate_approved(&self, ticks: Tick) {
		if let Some(metrics) = &self.0 {
			metrics.candidate_approval_time_ticks.observe(ticks as f64);
		}
	}

	pub(crate) fn on_block_approved(&self, ticks: Tick) {
		if let Some(metrics) = &self.0 {
			metrics.block_approval_time_ticks.observe(ticks as f64);
		}
	}

	pub(crate) fn time_recover_and_approve(&self) -> Option<HistogramTimer> {
		self.0.as_ref().map(|metrics| metrics.time_recover_and_approve.start_timer())
	}
}

fn register<T: Collector + Clone + 'static>(
	metric: T,
	registry: &Registry,
) -> Result<T, prometheus::Error> {
	registry.register(Box::new(metric.clone()))?;
	Ok(metric)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn approvals_produced_are_labelled_by_outcome() {
		let registry = Registry::new();
		let metrics = Metrics::register(&registry).unwrap();

		metrics.on_approval_produced();
		metrics.on_approval_produced();
		metrics.on_approval_invalid();

		let families = registry.gather();
		let produced = families
			.iter()
			.find(|f| f.get_name() == "polkadot_parachain_approvals_produced_total")
			.unwrap();

		let value_for = |status: &str| {
			produced
				.get_metric()
				.iter()
				.find(|m| m.get_label().iter().any(|l| l.get_value() == status))
				.map(|m| m.get_counter().get_value())
		};

		assert_eq!(value_for("success"), Some(2.0));
		assert_eq!(value_for("invalid"), Some(1.0));
		assert_eq!(value_for("stale"), None);
	}

	#[test]
	fn unregistered_metrics_are_noops() {
		let metrics = Metrics::default();
		metrics.on_wakeup();
		metrics.on_no_shows(3);
		assert!(metrics.time_recover_and_approve().is_none());
	}

	#[test]
	fn does_not_clash_with_distribution_metrics() {
		let registry = Registry::new();
		assert!(Metrics::register(&registry).is_ok());
		assert!(polkadot_approval_distribution::Metrics::register(&registry).is_ok());
	}
}
