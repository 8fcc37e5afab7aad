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

/// Number of messages and packets handed to the network bridge by one code path.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SentMessagesStats {
	pub assignments: usize,
	pub assignment_packets: usize,
	pub approvals: usize,
	pub approval_packets: usize,
}

impl SentMessagesStats {
	pub(crate) fn note_assignments(&mut self, messages: usize, packets: usize) {
		self.assignments += messages;
		self.assignment_packets += packets;
	}

	pub(crate) fn note_approvals(&mut self, messages: usize, packets: usize) {
		self.approvals += messages;
		self.approval_packets += packets;
	}
}

/// Approval Distribution metrics.
#[derive(Default, Clone)]
pub struct Metrics(Option<MetricsInner>);

#[derive(Clone)]
struct MetricsInner {
	assignments_imported_total: IntCounter,
	approvals_imported_total: IntCounter,
	unified_with_peer_total: IntCounter,
	rejected_messages_total: IntCounterVec,

	time_unify_with_peer: Histogram,
	time_import_pending_now_known: Histogram,

	basic_circulation_messages_total: IntCounterVec,
	basic_circulation_packets_total: IntCounterVec,
	unify_with_peer_messages_total: IntCounterVec,
	unify_with_peer_packets_total: IntCounterVec,
	new_topology_messages_total: IntCounterVec,
	new_topology_packets_total: IntCounterVec,
}

impl Metrics {
	/// Register the metrics with the given registry.
	pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
		let metrics = MetricsInner {
			assignments_imported_total: register(
				IntCounter::new(
					"polkadot_parachain_assignments_imported_total",
					"Number of valid assignments imported locally or from other peers.",
				)?,
				registry,
			)?,
			approvals_imported_total: register(
				IntCounter::new(
					"polkadot_parachain_approvals_imported_total",
					"Number of valid approvals imported locally or from other peers.",
				)?,
				registry,
			)?,
			unified_with_peer_total: register(
				IntCounter::new(
					"polkadot_parachain_unified_with_peer_total",
					"Number of times `unify_with_peer` is called.",
				)?,
				registry,
			)?,
			rejected_messages_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approval_distribution_rejected_messages_total",
						"Number of assignments and approvals dropped, by reason.",
					),
					&["kind", "reason"],
				)?,
				registry,
			)?,
			time_unify_with_peer: register(
				Histogram::with_opts(HistogramOpts::new(
					"polkadot_parachain_time_unify_with_peer",
					"Time spent within fn `unify_with_peer`.",
				))?,
				registry,
			)?,
			time_import_pending_now_known: register(
				Histogram::with_opts(HistogramOpts::new(
					"polkadot_parachain_time_import_pending_now_known",
					"Time spent on importing pending assignments and approvals.",
				))?,
				registry,
			)?,
			basic_circulation_messages_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approval_basic_circulation_messages_total",
						"Number of assignments and approvals sent by basic circulation",
					),
					&["kind"],
				)?,
				registry,
			)?,
			basic_circulation_packets_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approval_basic_circulation_packets_total",
						"Number of packets sent by basic circulation",
					),
					&["kind"],
				)?,
				registry,
			)?,
			unify_with_peer_messages_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approval_unify_with_peer_messages_total",
						"Number of assignments and approvals sent when unifying with a peer",
					),
					&["kind"],
				)?,
				registry,
			)?,
			unify_with_peer_packets_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approval_unify_with_peer_packets_total",
						"Number of packets sent when unifying with a peer",
					),
					&["kind"],
				)?,
				registry,
			)?,
			new_topology_messages_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approval_new_topology_messages_total",
						"Number of assignments and approvals sent after a new gossip topology",
					),
					&["kind"],
				)?,
				registry,
			)?,
			new_topology_packets_total: register(
				IntCounterVec::new(
					Opts::new(
						"polkadot_parachain_approval_new_topology_packets_total",
						"Number of packets sent after a new gossip topology",
					),
					&["kind"],
				)?,
				registry,
			)?,
		};
		Ok(Metrics(Some(metrics)))
	}

	pub(crate) fn on_assignment_imported(&self) {
		if let Some(metrics) = &self.0 {
			metrics.assignments_imported_total.inc();
		}
	}

	pub(crate) fn on_approval_imported(&self) {
		if let Some(metrics) = &self.0 {
			metrics.approvals_imported_total.inc();
		}
	}

	pub(crate) fn on_assignment_rejected(&self, reason: &str) {
		if let Some(metrics) = &self.0 {
			metrics.rejected_messages_total.with_label_values(&["assignment", reason]).inc();
		}
	}

	pub(crate) fn on_approval_rejected(&self, reason: &str) {
		if let Some(metrics) = &self.0 {
			metrics.rejected_messages_total.with_label_values(&["approval", reason]).inc();
		}
	}

	pub(crate) fn on_unify_with_peer(&self) {
		if let Some(metrics) = &self.0 {
			metrics.unified_with_peer_total.inc();
		}
	}

	pub(crate) fn time_unify_with_peer(&self) -> Option<HistogramTimer> {
		self.0.as_ref().map(|metrics| metrics.time_unify_with_peer.start_timer())
	}

	pub(crate) fn time_import_pending_now_known(&self) -> Option<HistogramTimer> {
		self.0
			.as_ref()
			.map(|metrics| metrics.time_import_pending_now_known.start_timer())
	}

	pub(crate) fn note_basic_circulation_stats(&self, stats: SentMessagesStats) {
		if let Some(metrics) = &self.0 {
			note_sent_message_stats(
				stats,
				&metrics.basic_circulation_messages_total,
				&metrics.basic_circulation_packets_total,
			)
		}
	}

	pub(crate) fn note_unify_with_peer_stats(&self, stats: SentMessagesStats) {
		if let Some(metrics) = &self.0 {
			note_sent_message_stats(
				stats,
				&metrics.unify_with_peer_messages_total,
				&metrics.unify_with_peer_packets_total,
			)
		}
	}

	pub(crate) fn note_new_topology_stats(&self, stats: SentMessagesStats) {
		if let Some(metrics) = &self.0 {
			note_sent_message_stats(
				stats,
				&metrics.new_topology_messages_total,
				&metrics.new_topology_packets_total,
			)
		}
	}
}

fn note_sent_message_stats(
	stats: SentMessagesStats,
	message_counters: &IntCounterVec,
	packet_counters: &IntCounterVec,
) {
	message_counters.with_label_values(&["assignments"]).inc_by(stats.assignments as u64);
	message_counters.with_label_values(&["approvals"]).inc_by(stats.approvals as u64);

	packet_counters.with_label_values(&["assignments"]).inc_by(stats.assignment_packets as u64);
	packet_counters.with_label_values(&["approvals"]).inc_by(stats.approval_packets as u64);
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
	fn registered_metrics_count_imports() {
		let registry = Registry::new();
		let metrics = Metrics::register(&registry).unwrap();

		metrics.on_assignment_imported();
		metrics.on_assignment_imported();
		metrics.on_approval_rejected("unknown-assignment");

		let families = registry.gather();
		let imported = families
			.iter()
			.find(|f| f.get_name() == "polkadot_parachain_assignments_imported_total")
			.unwrap();
		assert_eq!(imported.get_metric()[0].get_counter().get_value(), 2.0);
	}

	#[test]
	fn registering_twice_fails() {
		let registry = Registry::new();
		assert!(Metrics::register(&registry).is_ok());
		assert!(Metrics::register(&registry).is_err());
	}
}
