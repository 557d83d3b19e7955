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
//! Prometheus metrics.
//!
//! Components create their metrics through a [MetricsRegistry] when they are constructed.
//! Metric names must be unique per registry; registering a name twice panics.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder, core::Collector,
};

/// Registry the metrics of one process (or one test) are created on.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    inner: Registry,
}

impl MetricsRegistry {
    /// Wraps prometheus' default registry, with process metrics where supported.
    pub fn new_global() -> Self {
        let inner = prometheus::default_registry().clone();
        // Fails if it was registered before, which is fine.
        #[cfg(target_os = "linux")]
        let _ = inner.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ));
        Self { inner }
    }

    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int_counter<S: Into<String>>(&self, name: S, help: S) -> IntCounter {
        self.register(IntCounter::with_opts(Opts::new(name, help)))
    }

    pub fn int_counter_vec<S: Into<String>>(
        &self,
        name: S,
        help: S,
        labels: &[&str],
    ) -> IntCounterVec {
        self.register(IntCounterVec::new(Opts::new(name, help), labels))
    }

    pub fn int_gauge_vec<S: Into<String>>(
        &self,
        name: S,
        help: S,
        labels: &[&str],
    ) -> IntGaugeVec {
        self.register(IntGaugeVec::new(Opts::new(name, help), labels))
    }

    /// A histogram with the given bucket upper bounds.
    pub fn histogram_vec<S: Into<String>>(
        &self,
        name: S,
        help: S,
        buckets: Vec<f64>,
        labels: &[&str],
    ) -> HistogramVec {
        self.register(HistogramVec::new(
            HistogramOpts::new(name, help).buckets(buckets),
            labels,
        ))
    }

    /// All metrics in the prometheus text exposition format.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Only fails on invalid metric families, which registration already rejects.
        let _ = TextEncoder::new().encode(&self.inner.gather(), &mut out);
        out
    }

    fn register<C>(&self, metric: prometheus::Result<C>) -> C
    where
        C: Collector + Clone + 'static,
    {
        let metric = metric.unwrap_or_else(|e| panic!("invalid metric definition: {e}"));
        if let Err(e) = self.inner.register(Box::new(metric.clone())) {
            panic!("failed to register metric: {e}");
        }
        metric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_render_registered_metrics() {
        let registry = MetricsRegistry::new();
        let counter = registry.int_counter_vec("test_total", "Test counter.", &["result"]);
        counter.with_label_values(&["ok"]).inc_by(3);

        let text = String::from_utf8(registry.render()).unwrap();
        assert!(text.contains("test_total{result=\"ok\"} 3"), "{text}");
    }
}
