use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Process-wide metrics registry, exposed at `GET /metrics` in Prometheus
/// exposition format.
pub struct Metrics {
    registry: Registry,
    pub emails_queued_total: IntCounter,
    pub emails_sent_total: IntCounter,
    pub emails_failed_total: IntCounter,
    pub rate_limited_total: IntCounterVec,
    pub suppressed_total: IntCounter,
    pub webhook_deliveries_total: IntCounterVec,
    pub smtp_verify_seconds: HistogramVec,
    pub smtp_send_seconds: Histogram,
    pub jobs_gauge: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let emails_queued_total =
            IntCounter::with_opts(Opts::new("mailroom_emails_queued_total", "Emails admitted"))
                .expect("metric opts");
        let emails_sent_total =
            IntCounter::with_opts(Opts::new("mailroom_emails_sent_total", "Emails sent via SMTP"))
                .expect("metric opts");
        let emails_failed_total = IntCounter::with_opts(Opts::new(
            "mailroom_emails_failed_total",
            "Emails that exhausted delivery",
        ))
        .expect("metric opts");
        let rate_limited_total = IntCounterVec::new(
            Opts::new("mailroom_rate_limited_total", "Submissions denied by rate limit"),
            &["scope"],
        )
        .expect("metric opts");
        let suppressed_total = IntCounter::with_opts(Opts::new(
            "mailroom_suppressed_total",
            "Submissions blocked by suppression",
        ))
        .expect("metric opts");
        let webhook_deliveries_total = IntCounterVec::new(
            Opts::new("mailroom_webhook_deliveries_total", "Webhook delivery outcomes"),
            &["status"],
        )
        .expect("metric opts");
        let smtp_verify_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mailroom_smtp_verify_seconds",
                "SMTP connection verification latency",
            ),
            &["host"],
        )
        .expect("metric opts");
        let smtp_send_seconds = Histogram::with_opts(HistogramOpts::new(
            "mailroom_smtp_send_seconds",
            "SMTP submission latency",
        ))
        .expect("metric opts");
        let jobs_gauge = IntGaugeVec::new(
            Opts::new("mailroom_jobs", "Broker job counts"),
            &["queue", "state"],
        )
        .expect("metric opts");

        for collector in [
            Box::new(emails_queued_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(emails_sent_total.clone()),
            Box::new(emails_failed_total.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(suppressed_total.clone()),
            Box::new(webhook_deliveries_total.clone()),
            Box::new(smtp_verify_seconds.clone()),
            Box::new(smtp_send_seconds.clone()),
            Box::new(jobs_gauge.clone()),
        ] {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            emails_queued_total,
            emails_sent_total,
            emails_failed_total,
            rate_limited_total,
            suppressed_total,
            webhook_deliveries_total,
            smtp_verify_seconds,
            smtp_send_seconds,
            jobs_gauge,
        }
    }

    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_families() {
        let metrics = Metrics::new();
        metrics.emails_queued_total.inc();
        metrics
            .webhook_deliveries_total
            .with_label_values(&["delivered"])
            .inc();

        let out = metrics.export();
        assert!(out.contains("mailroom_emails_queued_total 1"));
        assert!(out.contains("mailroom_webhook_deliveries_total"));
    }
}
