//! Prometheus observability sink
//!
//! Metrics live in a registry owned by the sink, so several operators (or
//! tests) in one process never share state.

use anyhow::{Context, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tracing::trace;

use certman_common::{Observation, ObservabilitySink};

/// Sink exporting observations as Prometheus metrics
#[derive(Debug, Clone)]
pub struct PrometheusSink {
    registry: Registry,
    issuance_duration: HistogramVec,
    issuance_total: IntCounterVec,
    days_remaining: IntGaugeVec,
}

impl PrometheusSink {
    /// Create the metric families in a fresh registry
    pub fn new() -> Result<Self> {
        // Issuance is dominated by DNS propagation: seconds to many minutes
        let duration_buckets = vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0];

        let registry = Registry::new();

        let issuance_duration = HistogramVec::new(
            HistogramOpts::new(
                "certman_issuance_duration_seconds",
                "Duration of certificate issuance runs",
            )
            .buckets(duration_buckets),
            &["request", "result"],
        )
        .context("Failed to create issuance duration histogram")?;

        let issuance_total = IntCounterVec::new(
            Opts::new(
                "certman_issuance_total",
                "Certificate issuance runs by outcome",
            ),
            &["request", "result"],
        )
        .context("Failed to create issuance counter")?;

        let days_remaining = IntGaugeVec::new(
            Opts::new(
                "certman_certificate_days_remaining",
                "Whole days until the stored certificate expires, -1 if unknown",
            ),
            &["request", "base_domain"],
        )
        .context("Failed to create days-remaining gauge")?;

        registry
            .register(Box::new(issuance_duration.clone()))
            .context("Failed to register issuance duration histogram")?;
        registry
            .register(Box::new(issuance_total.clone()))
            .context("Failed to register issuance counter")?;
        registry
            .register(Box::new(days_remaining.clone()))
            .context("Failed to register days-remaining gauge")?;

        Ok(Self {
            registry,
            issuance_duration,
            issuance_total,
            days_remaining,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not UTF-8")
    }
}

impl ObservabilitySink for PrometheusSink {
    fn record(&self, observation: Observation) {
        trace!(kind = observation.kind(), "Recording observation");
        match observation {
            Observation::IssuanceDuration {
                request,
                seconds,
                success,
            } => {
                let result = if success { "success" } else { "failure" };
                self.issuance_duration
                    .with_label_values(&[request.as_str(), result])
                    .observe(seconds);
                self.issuance_total
                    .with_label_values(&[request.as_str(), result])
                    .inc();
            }
            Observation::DaysRemaining {
                request,
                base_domain,
                days,
            } => {
                self.days_remaining
                    .with_label_values(&[request.as_str(), base_domain.as_str()])
                    .set(days);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observations_are_exported() {
        let sink = PrometheusSink::new().unwrap();
        sink.record(Observation::DaysRemaining {
            request: "prod1-primary".to_string(),
            base_domain: "example.com".to_string(),
            days: 42,
        });
        sink.record(Observation::IssuanceDuration {
            request: "prod1-primary".to_string(),
            seconds: 75.0,
            success: true,
        });

        let text = sink.gather_text().unwrap();
        assert!(text.contains(
            "certman_certificate_days_remaining{base_domain=\"example.com\",request=\"prod1-primary\"} 42"
        ));
        assert!(text.contains(
            "certman_issuance_total{request=\"prod1-primary\",result=\"success\"} 1"
        ));
        assert!(text.contains("certman_issuance_duration_seconds_count"));
    }

    #[test]
    fn test_sinks_do_not_share_state() {
        let first = PrometheusSink::new().unwrap();
        let second = PrometheusSink::new().unwrap();
        first.record(Observation::DaysRemaining {
            request: "a".to_string(),
            base_domain: "example.com".to_string(),
            days: -1,
        });

        assert!(first.gather_text().unwrap().contains("request=\"a\""));
        assert!(!second.gather_text().unwrap().contains("request=\"a\""));
    }
}
