/// Block recognition: a two-state machine that finds rsync summary blocks
/// in rsnapshot's log output and extracts their fields.
///
/// A block opens on an rsync invocation line (`/usr/bin/rsync ... SRC DST`)
/// and closes on the `sent N bytes  received M bytes ...` footer, or right
/// away when rsync reports an error. Everything outside a block is noise.
use crate::stats::{self, BlockHeader, Clock, MetricSet, OpenBlock};
use regex::Regex;
use std::sync::LazyLock;

/// A path-like token ending in the rsync binary.
static INVOCATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[/\w]+/rsync").unwrap());

/// `label: value`, where the value is the first token after the separator.
static FIELD_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<label>[^:]+): (?P<value>\S+)").unwrap());

const FOOTER_PREFIX: &str = "sent ";

/// Errors produced while reading a block.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// A known field carried a value that is not a number.
    InvalidValue { label: String, value: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidValue { label, value } => {
                write!(f, "invalid value {value:?} for field {label:?}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// What a single line did to the parser.
#[derive(Debug, PartialEq)]
pub enum LineEvent {
    /// Blank line, noise outside a block, or an unknown field.
    Ignored,
    /// A new block started. Carries the header of an open block that was
    /// abandoned because it never saw its footer.
    Opened { discarded: Option<BlockHeader> },
    /// A known field was stored.
    Field { name: &'static str, value: f64 },
    /// The block closed, normally or on an rsync error.
    Closed(MetricSet),
}

/// The block state machine. `None` in `open` is the idle state.
pub struct BlockParser {
    open: Option<OpenBlock>,
    local_host: String,
    clock: Clock,
}

impl BlockParser {
    pub fn new(local_host: impl Into<String>) -> Self {
        Self::with_clock(local_host, stats::wall_clock)
    }

    pub fn with_clock(local_host: impl Into<String>, clock: Clock) -> Self {
        Self {
            open: None,
            local_host: local_host.into(),
            clock,
        }
    }

    /// True while a block is being read.
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Feed one logical line.
    ///
    /// A field error leaves the block open; callers decide whether to
    /// [`abandon`](Self::abandon) it or give up on the stream.
    pub fn feed(&mut self, line: &str) -> Result<LineEvent, ParseError> {
        if line.is_empty() {
            return Ok(LineEvent::Ignored);
        }

        if INVOCATION.is_match(line) {
            let header = BlockHeader::from_invocation(line, &self.local_host);
            tracing::debug!(
                src = %header.source,
                dst = %header.destination,
                "rsync block started"
            );
            let block = OpenBlock::new(header, (self.clock)());
            let discarded = self.open.replace(block).map(|b| b.header().clone());
            return Ok(LineEvent::Opened { discarded });
        }

        let Some(block) = self.open.as_mut() else {
            return Ok(LineEvent::Ignored);
        };

        if line.starts_with(FOOTER_PREFIX) {
            return Ok(self.close());
        }

        let Some(caps) = FIELD_LINE.captures(line) else {
            return Ok(LineEvent::Ignored);
        };
        let label = &caps["label"];

        if label == stats::ERROR_MARKER {
            tracing::debug!(line, "rsync reported an error");
            block.mark_failed();
            return Ok(self.close());
        }

        let Some(field) = stats::field_for_label(label) else {
            return Ok(LineEvent::Ignored);
        };
        let raw = &caps["value"];
        let value = parse_number(raw).ok_or_else(|| ParseError::InvalidValue {
            label: label.to_string(),
            value: raw.to_string(),
        })?;
        block.record(field, value);
        Ok(LineEvent::Field {
            name: field.name,
            value,
        })
    }

    /// Drop the open block without emitting it, returning its header.
    pub fn abandon(&mut self) -> Option<BlockHeader> {
        self.open.take().map(|b| b.header().clone())
    }

    fn close(&mut self) -> LineEvent {
        match self.open.take() {
            Some(block) => LineEvent::Closed(block.finish((self.clock)())),
            None => LineEvent::Ignored,
        }
    }
}

/// Parse an rsync number. rsync 3.1+ groups digits with commas.
fn parse_number(raw: &str) -> Option<f64> {
    if raw.contains(',') {
        raw.replace(',', "").parse().ok()
    } else {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    const INVOKE: &str = "/usr/bin/rsync -a --stats --delete user@host:/a/b /snapshots/daily.0/host/";

    fn fixed_clock() -> f64 {
        1_000.0
    }

    fn parser() -> BlockParser {
        BlockParser::with_clock("local.example", fixed_clock)
    }

    fn closed(event: LineEvent) -> MetricSet {
        match event {
            LineEvent::Closed(set) => set,
            other => panic!("expected a closed block, got {other:?}"),
        }
    }

    #[test]
    fn test_lines_before_block_are_ignored() {
        let mut p = parser();
        assert_eq!(p.feed("echo 1234 > /var/run/rsnapshot.pid").unwrap(), LineEvent::Ignored);
        assert_eq!(p.feed("Number of files: 10").unwrap(), LineEvent::Ignored);
        assert_eq!(p.feed("sent 10 bytes  received 20 bytes").unwrap(), LineEvent::Ignored);
        assert!(!p.is_open());
    }

    #[test]
    fn test_invocation_opens_block() {
        let mut p = parser();
        assert_eq!(
            p.feed(INVOKE).unwrap(),
            LineEvent::Opened { discarded: None }
        );
        assert!(p.is_open());
    }

    #[test]
    fn test_invocation_requires_rsync_binary_path() {
        let mut p = parser();
        assert_eq!(p.feed("rsync -a a b").unwrap(), LineEvent::Ignored);
        assert_eq!(p.feed("/bin/cp -al daily.0 daily.1").unwrap(), LineEvent::Ignored);
        assert!(!p.is_open());
    }

    #[test]
    fn test_full_block() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert_eq!(
            p.feed("Number of files: 120").unwrap(),
            LineEvent::Field { name: "num_files", value: 120.0 }
        );
        p.feed("Total bytes sent: 4096").unwrap();
        let set = closed(p.feed("sent 4096 bytes  received 35 bytes  2752.67 bytes/sec").unwrap());

        assert_eq!(set.field("num_files"), Some(120.0));
        assert_eq!(set.field("total_sent_bytes"), Some(4096.0));
        assert!(set.success());
        assert_eq!(set.start_time(), 1_000.0);
        assert_eq!(set.duration_seconds(), 0.0);
        assert_eq!(set.header().source.host, "host");
        assert_eq!(set.header().destination.host, "local.example");
        assert_eq!(set.header().destination.path, "/snapshots/daily.0/host/");
        assert!(!p.is_open());
    }

    #[test]
    fn test_duration_spans_open_to_close() {
        static TICKS: AtomicU64 = AtomicU64::new(0);
        fn ticking() -> f64 {
            (TICKS.fetch_add(7, Ordering::SeqCst) + 7) as f64
        }
        let mut p = BlockParser::with_clock("local", ticking);
        p.feed(INVOKE).unwrap();
        let set = closed(p.feed("sent 1 bytes").unwrap());
        assert_eq!(set.duration_seconds(), set.end_time() - set.start_time());
        assert_eq!(set.duration_seconds(), 7.0);
    }

    #[test]
    fn test_error_marker_closes_as_failed() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        p.feed("Number of files: 3").unwrap();
        let set = closed(
            p.feed("rsync error: some files/attrs were not transferred (code 23) at main.c(1338)")
                .unwrap(),
        );
        assert!(!set.success());
        assert_eq!(set.field("num_files"), Some(3.0));
        assert_eq!(set.field("rsync error"), None);
        assert!(!p.is_open());
        // the trailing footer no longer belongs to a block
        assert_eq!(p.feed("sent 1 bytes").unwrap(), LineEvent::Ignored);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert_eq!(p.feed("Speedup is 2.5").unwrap(), LineEvent::Ignored);
        assert_eq!(p.feed("Number of created files: 4").unwrap(), LineEvent::Ignored);
        assert_eq!(p.feed("deleting old/file.txt").unwrap(), LineEvent::Ignored);
        let set = closed(p.feed("sent 1 bytes").unwrap());
        assert_eq!(set.field_count(), 0);
    }

    #[test]
    fn test_value_takes_first_token() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert_eq!(
            p.feed("Number of files: 5 (reg: 3, dir: 2)").unwrap(),
            LineEvent::Field { name: "num_files", value: 5.0 }
        );
        assert_eq!(
            p.feed("File list generation time: 0.001 seconds").unwrap(),
            LineEvent::Field { name: "file_list_gen_seconds", value: 0.001 }
        );
    }

    #[test]
    fn test_thousands_separators() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert_eq!(
            p.feed("Total file size: 1,234,567 bytes").unwrap(),
            LineEvent::Field { name: "total_file_bytes", value: 1_234_567.0 }
        );
    }

    #[test]
    fn test_known_field_with_bad_value_is_an_error() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        let err = p.feed("Literal data: lots").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidValue {
                label: "Literal data".into(),
                value: "lots".into(),
            }
        );
        assert!(err.to_string().contains("Literal data"));
        // the block stays open until the caller decides
        assert!(p.is_open());
        assert!(p.abandon().is_some());
        assert!(!p.is_open());
    }

    #[test]
    fn test_unknown_field_with_bad_value_is_not_an_error() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert_eq!(p.feed("Total bytes wasted: many").unwrap(), LineEvent::Ignored);
    }

    #[test]
    fn test_new_invocation_discards_open_block() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        p.feed("Number of files: 9").unwrap();
        match p.feed("/usr/bin/rsync -a other:/x /y").unwrap() {
            LineEvent::Opened { discarded: Some(h) } => assert_eq!(h.source.path, "/a/b"),
            other => panic!("unexpected {other:?}"),
        }
        let set = closed(p.feed("sent 1 bytes").unwrap());
        assert_eq!(set.header().source.host, "other");
        assert_eq!(set.field("num_files"), None);
    }

    #[test]
    fn test_invocation_wins_over_footer_and_fields() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert!(matches!(
            p.feed("/usr/local/bin/rsync a b").unwrap(),
            LineEvent::Opened { discarded: Some(_) }
        ));
    }

    #[test]
    fn test_blank_lines_inside_block() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert_eq!(p.feed("").unwrap(), LineEvent::Ignored);
        assert!(p.is_open());
    }

    #[test]
    fn test_footer_needs_trailing_space() {
        let mut p = parser();
        p.feed(INVOKE).unwrap();
        assert_eq!(p.feed("sending incremental file list").unwrap(), LineEvent::Ignored);
        assert!(p.is_open());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42"), Some(42.0));
        assert_eq!(parse_number("1,024"), Some(1024.0));
        assert_eq!(parse_number("0.5"), Some(0.5));
        assert_eq!(parse_number("5K"), None);
    }
}
