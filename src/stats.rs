/// Transfer statistics: the field vocabulary rsync prints with `--stats`
/// and the per-block metric set built from it.
use crate::location::Location;
use std::collections::BTreeMap;

/// A numeric field rsync reports in its summary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsyncField {
    /// Label text as printed by rsync, before the `:`.
    pub label: &'static str,
    /// Canonical metric name, without the exporter prefix.
    pub name: &'static str,
}

/// Every summary field the parser understands.
pub const RSYNC_FIELDS: &[RsyncField] = &[
    RsyncField { label: "Number of files", name: "num_files" },
    RsyncField { label: "Number of regular files transferred", name: "num_xferred_files" },
    RsyncField { label: "Total file size", name: "total_file_bytes" },
    RsyncField { label: "Total transferred file size", name: "total_xferred_file_bytes" },
    RsyncField { label: "Literal data", name: "literal_data_bytes" },
    RsyncField { label: "Matched data", name: "matched_data_bytes" },
    RsyncField { label: "File list size", name: "file_list_bytes" },
    RsyncField { label: "File list generation time", name: "file_list_gen_seconds" },
    RsyncField { label: "File list transfer time", name: "file_list_xfer_seconds" },
    RsyncField { label: "Total bytes sent", name: "total_sent_bytes" },
    RsyncField { label: "Total bytes received", name: "total_recv_bytes" },
];

/// Label rsync uses when it reports a failure. Never stored as a field.
pub const ERROR_MARKER: &str = "rsync error";

pub const START_TIME: &str = "start_time";
pub const END_TIME: &str = "end_time";
pub const DURATION_SECONDS: &str = "duration_seconds";
pub const SUCCESS: &str = "success";

/// Metrics computed by the parser rather than read from rsync, with help text.
pub const SYNTHESIZED: &[(&str, &str)] = &[
    (START_TIME, "Time rsync started at"),
    (END_TIME, "Time rsync finished at"),
    (DURATION_SECONDS, "How long rsync ran for"),
    (SUCCESS, "1 if rsync encountered no errors, 0 otherwise"),
];

/// Look up a field by the label rsync printed.
pub fn field_for_label(label: &str) -> Option<&'static RsyncField> {
    RSYNC_FIELDS.iter().find(|f| f.label == label)
}

/// Source of wall-clock time, in fractional seconds since the Unix epoch.
pub type Clock = fn() -> f64;

/// The system clock.
pub fn wall_clock() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9
}

/// Where a block's data came from and went to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub source: Location,
    pub destination: Location,
}

impl BlockHeader {
    /// Build a header from an rsync invocation line: the last two
    /// whitespace-separated tokens are the source and destination.
    /// Missing tokens resolve to empty local paths.
    pub fn from_invocation(line: &str, local_host: &str) -> Self {
        let mut tokens = line.split_whitespace().rev();
        let dst = tokens.next().unwrap_or("");
        let src = tokens.next().unwrap_or("");
        BlockHeader {
            source: Location::resolve(src, local_host),
            destination: Location::resolve(dst, local_host),
        }
    }
}

/// A block that is still being read.
#[derive(Debug)]
pub struct OpenBlock {
    header: BlockHeader,
    start_time: f64,
    values: BTreeMap<&'static str, f64>,
    success: bool,
}

impl OpenBlock {
    pub fn new(header: BlockHeader, start_time: f64) -> Self {
        Self {
            header,
            start_time,
            values: BTreeMap::new(),
            success: true,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Store a field value; a repeated field overwrites the earlier one.
    pub fn record(&mut self, field: &RsyncField, value: f64) {
        self.values.insert(field.name, value);
    }

    pub fn mark_failed(&mut self) {
        self.success = false;
    }

    /// Close the block at `end_time`.
    pub fn finish(self, end_time: f64) -> MetricSet {
        let duration_seconds = (end_time - self.start_time).max(0.0);
        MetricSet {
            header: self.header,
            start_time: self.start_time,
            end_time,
            duration_seconds,
            values: self.values,
            success: self.success,
        }
    }
}

/// The finalized statistics of one rsync run.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSet {
    header: BlockHeader,
    start_time: f64,
    end_time: f64,
    duration_seconds: f64,
    values: BTreeMap<&'static str, f64>,
    success: bool,
}

impl MetricSet {
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Value of a field read from rsync, by canonical name.
    #[cfg(test)]
    pub fn field(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Number of rsync fields present (synthesized metrics excluded).
    pub fn field_count(&self) -> usize {
        self.values.len()
    }

    /// All metrics of the set, synthesized ones first, fields in name order.
    pub fn samples(&self) -> Vec<(&'static str, f64)> {
        let mut out = vec![
            (START_TIME, self.start_time),
            (END_TIME, self.end_time),
            (DURATION_SECONDS, self.duration_seconds),
            (SUCCESS, if self.success { 1.0 } else { 0.0 }),
        ];
        out.extend(self.values.iter().map(|(name, value)| (*name, *value)));
        out
    }
}
