// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! IP manager metrics.

use ipam_observability::metrics::MetricsRegistry;
use prometheus::{HistogramVec, IntCounter, IntCounterVec, IntGaugeVec};

const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Metrics of the reconciler and the controller.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Reconcile runs by trigger type and result.
    pub reconcile_total: IntCounterVec,
    pub reconcile_latency_seconds: HistogramVec,
    /// New reservations by network and subnet.
    pub reservations_total: IntCounterVec,
    /// Reservations released because their owner disappeared.
    pub released_total: IntCounter,
    pub pool_free_addresses: IntGaugeVec,
}

impl Metrics {
    /// Creates the metrics on `registry`.
    pub fn new(registry: &MetricsRegistry) -> Self {
        Self {
            reconcile_total: registry.int_counter_vec(
                "ipmanager_reconcile_total",
                "Total number of reconcile runs.",
                &["trigger", "result"],
            ),
            reconcile_latency_seconds: registry.histogram_vec(
                "ipmanager_reconcile_latency_seconds",
                "Duration of reconcile runs in seconds.",
                LATENCY_BUCKETS.to_vec(),
                &["trigger"],
            ),
            reservations_total: registry.int_counter_vec(
                "ipmanager_reservations_total",
                "Total number of addresses reserved.",
                &["network", "subnet"],
            ),
            released_total: registry.int_counter(
                "ipmanager_released_total",
                "Total number of reservations released.",
            ),
            pool_free_addresses: registry.int_gauge_vec(
                "ipmanager_pool_free_addresses",
                "Free addresses per subnet pool.",
                &["namespace", "network", "subnet"],
            ),
        }
    }
}
