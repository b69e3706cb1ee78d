/// Prometheus export: a gauge registry fed by the stream coordinator,
/// rendered as text exposition and optionally pushed to a Pushgateway.
use crate::coordinator::MetricSink;
use crate::stats::{self, MetricSet};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::time::Duration;

/// Prefix of the per-block gauges.
const RSYNC_PREFIX: &str = "rsync_";

/// Labels that identify a block. Default labels may not reuse them.
pub const BLOCK_LABELS: &[&str] = &["src_host", "src_path", "dst_host", "dst_path"];

const RUN_GAUGES: &[(&str, &str)] = &[
    ("rsnapshot_start_time", "Timestamp rsnapshot started at"),
    ("rsnapshot_end_time", "Timestamp rsnapshot finished at"),
    ("rsnapshot_duration_seconds", "How long rsnapshot ran for"),
];

/// Errors from building, encoding or pushing metrics.
#[derive(Debug)]
pub enum ExportError {
    Registry(prometheus::Error),
    Encoding(String),
    Http(reqwest::Error),
    Rejected { status: u16, body: String },
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Registry(e) => write!(f, "metrics registry error: {e}"),
            ExportError::Encoding(msg) => write!(f, "failed to encode metrics: {msg}"),
            ExportError::Http(e) => write!(f, "push to gateway failed: {e}"),
            ExportError::Rejected { status, body } => {
                write!(f, "gateway rejected push with status {status}: {body}")
            }
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Registry(e) => Some(e),
            ExportError::Http(e) => Some(e),
            ExportError::Encoding(_) | ExportError::Rejected { .. } => None,
        }
    }
}

impl From<prometheus::Error> for ExportError {
    fn from(e: prometheus::Error) -> Self {
        ExportError::Registry(e)
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(e: reqwest::Error) -> Self {
        ExportError::Http(e)
    }
}

/// Where and how to push.
#[derive(Debug, Clone)]
pub struct PushTarget {
    pub gateway: String,
    pub job: String,
    pub timeout: Duration,
}

impl PushTarget {
    /// Pushgateway URL for this job's grouping key.
    pub fn url(&self) -> String {
        let base = self.gateway.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}/metrics/job/{}", self.job)
        } else {
            format!("http://{base}/metrics/job/{}", self.job)
        }
    }
}

/// Metric sink backed by a Prometheus registry.
pub struct PrometheusSink {
    registry: Registry,
    default_labels: BTreeMap<String, String>,
    block_gauges: BTreeMap<&'static str, GaugeVec>,
    run_gauges: Vec<GaugeVec>,
}

impl PrometheusSink {
    /// Register every gauge, labeled with the given default labels.
    pub fn new(default_labels: BTreeMap<String, String>) -> Result<Self, ExportError> {
        let registry = Registry::new();

        let basic: Vec<&str> = default_labels.keys().map(String::as_str).collect();
        let mut block_labels = basic.clone();
        block_labels.extend_from_slice(BLOCK_LABELS);

        let mut run_gauges = Vec::with_capacity(RUN_GAUGES.len());
        for (name, help) in RUN_GAUGES {
            let gauge = GaugeVec::new(Opts::new(*name, *help), &basic)?;
            registry.register(Box::new(gauge.clone()))?;
            run_gauges.push(gauge);
        }

        let described = stats::SYNTHESIZED
            .iter()
            .copied()
            .chain(stats::RSYNC_FIELDS.iter().map(|f| (f.name, f.label)));
        let mut block_gauges = BTreeMap::new();
        for (name, help) in described {
            let gauge = GaugeVec::new(
                Opts::new(format!("{RSYNC_PREFIX}{name}"), help),
                &block_labels,
            )?;
            registry.register(Box::new(gauge.clone()))?;
            block_gauges.insert(name, gauge);
        }

        Ok(Self {
            registry,
            default_labels,
            block_gauges,
            run_gauges,
        })
    }

    /// Record the whole-run timestamps.
    pub fn record_run(&self, start: f64, end: f64) -> Result<(), ExportError> {
        let values: Vec<&str> = self.default_labels.values().map(String::as_str).collect();
        let samples = [start, end, (end - start).max(0.0)];
        for (gauge, value) in self.run_gauges.iter().zip(samples) {
            gauge.get_metric_with_label_values(&values)?.set(value);
        }
        Ok(())
    }

    fn record_set(&self, set: &MetricSet) -> Result<(), ExportError> {
        let header = set.header();
        let mut values: Vec<&str> = self.default_labels.values().map(String::as_str).collect();
        values.extend_from_slice(&[
            header.source.host.as_str(),
            header.source.path.as_str(),
            header.destination.host.as_str(),
            header.destination.path.as_str(),
        ]);

        for (name, value) in set.samples() {
            match self.block_gauges.get(name) {
                Some(gauge) => gauge.get_metric_with_label_values(&values)?.set(value),
                None => tracing::warn!(metric = name, "no gauge registered for metric"),
            }
        }
        Ok(())
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, ExportError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ExportError::Encoding(e.to_string()))
    }

    /// Replace the job's metrics on the gateway with the current registry.
    pub async fn push(&self, target: &PushTarget) -> Result<(), ExportError> {
        let body = self.render()?;
        let url = target.url();
        tracing::info!(url = %url, bytes = body.len(), "pushing metrics to gateway");

        let client = reqwest::Client::builder().timeout(target.timeout).build()?;
        let resp = client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, TextEncoder::new().format_type())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl MetricSink for PrometheusSink {
    fn publish(&mut self, set: &MetricSet) {
        if let Err(e) = self.record_set(set) {
            tracing::error!(
                error = %e,
                src = %set.header().source,
                dst = %set.header().destination,
                "failed to record rsync metrics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{field_for_label, BlockHeader, OpenBlock};

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([("instance".to_string(), "backup01".to_string())])
    }

    fn sample_set(success: bool) -> MetricSet {
        let header =
            BlockHeader::from_invocation("/usr/bin/rsync -a root@web1:/etc /snap/web1", "backup01");
        let mut block = OpenBlock::new(header, 100.0);
        block.record(field_for_label("Number of files").unwrap(), 120.0);
        if !success {
            block.mark_failed();
        }
        block.finish(104.0)
    }

    #[test]
    fn test_publish_sets_block_gauges() {
        let mut sink = PrometheusSink::new(labels()).unwrap();
        sink.publish(&sample_set(true));
        let text = sink.render().unwrap();

        assert!(text.contains("# HELP rsync_num_files Number of files"));
        assert!(text.contains(
            r#"rsync_num_files{dst_host="backup01",dst_path="/snap/web1",instance="backup01",src_host="web1",src_path="/etc"} 120"#
        ));
        assert!(text.contains(r#"rsync_duration_seconds{"#));
        assert!(text.contains(r#"src_path="/etc"} 4"#));
        assert!(text.contains(r#"rsync_success{"#));
    }

    #[test]
    fn test_failed_block_exports_zero_success() {
        let mut sink = PrometheusSink::new(labels()).unwrap();
        sink.publish(&sample_set(false));
        let text = sink.render().unwrap();
        let line = text
            .lines()
            .find(|l| l.starts_with("rsync_success{"))
            .unwrap();
        assert!(line.ends_with(" 0"));
    }

    #[test]
    fn test_absent_fields_are_not_exported() {
        let mut sink = PrometheusSink::new(labels()).unwrap();
        sink.publish(&sample_set(true));
        let text = sink.render().unwrap();
        assert!(!text.contains("rsync_total_recv_bytes{"));
    }

    #[test]
    fn test_record_run_uses_default_labels_only() {
        let sink = PrometheusSink::new(labels()).unwrap();
        sink.record_run(10.0, 25.0).unwrap();
        let text = sink.render().unwrap();
        assert!(text.contains(r#"rsnapshot_start_time{instance="backup01"} 10"#));
        assert!(text.contains(r#"rsnapshot_end_time{instance="backup01"} 25"#));
        assert!(text.contains(r#"rsnapshot_duration_seconds{instance="backup01"} 15"#));
    }

    #[test]
    fn test_extra_default_labels() {
        let mut defaults = labels();
        defaults.insert("site".to_string(), "dc1".to_string());
        let mut sink = PrometheusSink::new(defaults).unwrap();
        sink.publish(&sample_set(true));
        sink.record_run(0.0, 1.0).unwrap();
        let text = sink.render().unwrap();
        assert!(text.contains(r#"rsnapshot_end_time{instance="backup01",site="dc1"} 1"#));
        assert!(text.contains(r#"site="dc1",src_host="web1""#));
    }

    #[test]
    fn test_push_url() {
        let mut target = PushTarget {
            gateway: "localhost:9091".into(),
            job: "rsnapshot".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(target.url(), "http://localhost:9091/metrics/job/rsnapshot");
        target.gateway = "https://pgw.example.org/".into();
        assert_eq!(target.url(), "https://pgw.example.org/metrics/job/rsnapshot");
    }

    #[tokio::test]
    async fn test_push_to_unreachable_gateway_fails() {
        let sink = PrometheusSink::new(labels()).unwrap();
        let target = PushTarget {
            gateway: "127.0.0.1:1".into(),
            job: "rsnapshot".into(),
            timeout: Duration::from_secs(2),
        };
        assert!(matches!(sink.push(&target).await, Err(ExportError::Http(_))));
    }
}
