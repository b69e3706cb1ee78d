/// Logical line assembly: folds backslash-continued raw lines into one line.
///
/// rsync wraps its command echo with a trailing `\` when rsnapshot logs
/// long invocations. Each raw line is trimmed, and a line ending in `\`
/// is glued directly onto the next one (no separator is inserted).
use std::borrow::Cow;
use std::io::BufRead;

const CONTINUATION: char = '\\';

/// Iterator over the logical lines of a reader.
///
/// Single-pass over the underlying reader. A stream that ends while a
/// continuation is pending drops the partial line. Bytes that are not
/// valid UTF-8 are replaced with U+FFFD rather than failing the stream.
pub struct LogicalLines<R> {
    reader: R,
    buf: String,
    raw: Vec<u8>,
    raw_line: u64,
}

impl<R: BufRead> LogicalLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
            raw: Vec::new(),
            raw_line: 0,
        }
    }

    /// 1-based number of the last raw line read; for a folded line this
    /// is the line that completed it.
    pub fn line_number(&self) -> u64 {
        self.raw_line
    }
}

impl<R: BufRead> Iterator for LogicalLines<R> {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.raw.clear();
            match self.reader.read_until(b'\n', &mut self.raw) {
                Ok(0) => {
                    if !self.buf.is_empty() {
                        tracing::debug!(
                            partial = %self.buf,
                            "input ended inside a continued line, dropping it"
                        );
                        self.buf.clear();
                    }
                    return None;
                }
                Ok(_) => self.raw_line += 1,
                Err(e) => return Some(Err(e)),
            }

            let text = String::from_utf8_lossy(&self.raw);
            if matches!(text, Cow::Owned(_)) {
                tracing::warn!(
                    line = self.raw_line,
                    "input line is not valid UTF-8, replacing bad bytes"
                );
            }
            self.buf.push_str(text.trim());
            if self.buf.ends_with(CONTINUATION) {
                let kept = self.buf.trim_end_matches(CONTINUATION).len();
                self.buf.truncate(kept);
                continue;
            }
            return Some(Ok(std::mem::take(&mut self.buf)));
        }
    }
}

/// Convenience constructor mirroring `BufRead::lines`.
pub fn logical_lines<R: BufRead>(reader: R) -> LogicalLines<R> {
    LogicalLines::new(reader)
}
