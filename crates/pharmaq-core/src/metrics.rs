//! Prometheus collectors for the pipeline

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use std::time::Duration;

#[derive(Clone)]
pub struct PipelineMetrics {
    answers: IntCounterVec,
    attempts: Histogram,
    guard_rejections: IntCounterVec,
    execution_seconds: Histogram,
}

impl PipelineMetrics {
    /// Create the collectors and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let answers = IntCounterVec::new(
            Opts::new("pharmaq_answers_total", "Pipeline invocations by outcome"),
            &["outcome"],
        )?;
        let attempts = Histogram::with_opts(
            HistogramOpts::new("pharmaq_attempts", "Translation attempts per invocation")
                .buckets(vec![1.0, 2.0, 3.0, 4.0, 5.0]),
        )?;
        let guard_rejections = IntCounterVec::new(
            Opts::new("pharmaq_guard_rejections_total", "Candidate SQL rejected by the guard"),
            &["reason"],
        )?;
        let execution_seconds = Histogram::with_opts(
            HistogramOpts::new("pharmaq_execution_seconds", "Time spent running accepted SQL")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(answers.clone()))?;
        registry.register(Box::new(attempts.clone()))?;
        registry.register(Box::new(guard_rejections.clone()))?;
        registry.register(Box::new(execution_seconds.clone()))?;

        Ok(Self {
            answers,
            attempts,
            guard_rejections,
            execution_seconds,
        })
    }

    /// `outcome` is `answered`, `degraded` or a failure code
    pub fn record_outcome(&self, outcome: &str, attempts: u32) {
        self.answers.with_label_values(&[outcome]).inc();
        self.attempts.observe(attempts as f64);
    }

    pub fn record_rejection(&self, reason: &str) {
        self.guard_rejections.with_label_values(&[reason]).inc();
    }

    pub fn observe_execution(&self, elapsed: Duration) {
        self.execution_seconds.observe(elapsed.as_secs_f64());
    }
}

/// Text exposition of everything in `registry`
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let mut buf = Vec::new();
    prometheus::TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_values() {
        let registry = Registry::new();
        let metrics = PipelineMetrics::new(&registry).unwrap();

        metrics.record_outcome("answered", 1);
        metrics.record_rejection("write-operation");
        metrics.record_rejection("write-operation");
        metrics.observe_execution(Duration::from_millis(12));

        let text = render(&registry).unwrap();
        assert!(text.contains("pharmaq_answers_total{outcome=\"answered\"} 1"));
        assert!(text.contains("pharmaq_guard_rejections_total{reason=\"write-operation\"} 2"));
        assert!(text.contains("pharmaq_execution_seconds_count 1"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PipelineMetrics::new(&registry).unwrap();
        assert!(PipelineMetrics::new(&registry).is_err());
    }
}
