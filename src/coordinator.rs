/// Stream coordination: drive logical lines through the block parser and
/// hand every closed block to a metric sink, exactly once.
use crate::lines::logical_lines;
use crate::parser::{BlockParser, LineEvent, ParseError};
use crate::stats::MetricSet;
use std::io::BufRead;

/// Receives finished metric sets.
pub trait MetricSink {
    /// Publish one closed block. Called once per block, in stream order.
    fn publish(&mut self, set: &MetricSet);
}

/// What to do when a known field carries a malformed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorPolicy {
    /// Drop the block being read and keep going.
    SkipBlock,
    /// Stop processing and return the error.
    Abort,
}

/// Counters for one pass over an input stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Raw input lines read, before continuation folding.
    pub lines: u64,
    /// Blocks handed to the sink (including failed ones).
    pub published: u64,
    /// Published blocks that ended on an rsync error.
    pub failed: u64,
    /// Blocks that never reached a footer.
    pub discarded: u64,
    /// Blocks dropped because of a malformed field.
    pub rejected: u64,
}

/// Errors that end a run early.
#[derive(Debug)]
pub enum RunError {
    Io(std::io::Error),
    /// `line` is the raw input line that completed the offending logical line.
    Parse { line: u64, source: ParseError },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Io(e) => write!(f, "failed to read input: {e}"),
            RunError::Parse { line, source } => write!(f, "line {line}: {source}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Io(e) => Some(e),
            RunError::Parse { source, .. } => Some(source),
        }
    }
}

impl From<std::io::Error> for RunError {
    fn from(e: std::io::Error) -> Self {
        RunError::Io(e)
    }
}

/// Owns the parser for one stream and routes its output.
pub struct StreamCoordinator<'a> {
    parser: BlockParser,
    sink: &'a mut dyn MetricSink,
    policy: FieldErrorPolicy,
    summary: RunSummary,
}

impl<'a> StreamCoordinator<'a> {
    pub fn new(parser: BlockParser, sink: &'a mut dyn MetricSink, policy: FieldErrorPolicy) -> Self {
        Self {
            parser,
            sink,
            policy,
            summary: RunSummary::default(),
        }
    }

    /// Process every logical line of `reader`, then drop any block left open.
    pub fn run<R: BufRead>(mut self, reader: R) -> Result<RunSummary, RunError> {
        let mut lines = logical_lines(reader);
        while let Some(line) = lines.next() {
            let line = line?;
            self.summary.lines = lines.line_number();
            self.handle_line(&line)?;
        }
        self.summary.lines = lines.line_number();

        if let Some(header) = self.parser.abandon() {
            tracing::debug!(
                src = %header.source,
                dst = %header.destination,
                "input ended inside an rsync block, dropping it"
            );
            self.summary.discarded += 1;
        }

        Ok(self.summary)
    }

    fn handle_line(&mut self, line: &str) -> Result<(), RunError> {
        match self.parser.feed(line) {
            Ok(LineEvent::Opened {
                discarded: Some(header),
            }) => {
                tracing::debug!(
                    src = %header.source,
                    dst = %header.destination,
                    "rsync block never finished, dropping it"
                );
                self.summary.discarded += 1;
            }
            Ok(LineEvent::Closed(set)) => {
                tracing::info!(
                    success = set.success(),
                    fields = set.field_count(),
                    start = set.start_time(),
                    end = set.end_time(),
                    duration = set.duration_seconds(),
                    "Publishing {} -> {}",
                    set.header().source,
                    set.header().destination
                );
                self.summary.published += 1;
                if !set.success() {
                    self.summary.failed += 1;
                }
                self.sink.publish(&set);
            }
            Ok(LineEvent::Field { name, value }) => {
                tracing::trace!(name, value, "rsync field");
            }
            Ok(LineEvent::Opened { discarded: None }) | Ok(LineEvent::Ignored) => {}
            Err(source) => match self.policy {
                FieldErrorPolicy::Abort => {
                    return Err(RunError::Parse {
                        line: self.summary.lines,
                        source,
                    });
                }
                FieldErrorPolicy::SkipBlock => {
                    let header = self.parser.abandon();
                    tracing::warn!(
                        line = self.summary.lines,
                        error = %source,
                        src = ?header.as_ref().map(|h| h.source.to_string()),
                        "dropping rsync block with malformed field"
                    );
                    self.summary.rejected += 1;
                }
            },
        }
        Ok(())
    }
}

/// Process a whole stream into `sink` with a fresh parser.
pub fn process_stream<R: BufRead>(
    reader: R,
    local_host: &str,
    sink: &mut dyn MetricSink,
    policy: FieldErrorPolicy,
) -> Result<RunSummary, RunError> {
    StreamCoordinator::new(BlockParser::new(local_host), sink, policy).run(reader)
}
