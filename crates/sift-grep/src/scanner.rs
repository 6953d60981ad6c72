//! The streaming line scanner.
//!
//! Matches are found with multi-line regex semantics over a single fixed
//! buffer that is reused across files. Indexed files are capped at 1 MiB by
//! the publisher, so a conforming file always fits; anything larger is
//! reported as an error for that file and skipped. After each match the scan
//! resumes at the start of the next line, imposing a one-match-per-line
//! limit and keeping `^` anchored correctly.

use std::io::Read;

use thiserror::Error;

/// Matches the publisher's large-file cutoff.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot search {0}: larger than {1} bytes")]
    TooLarge(String, usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Scanner {
    buf: Vec<u8>,
}

impl Scanner {
    pub fn new() -> Scanner {
        Scanner::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Scanner {
        Scanner {
            buf: vec![0; capacity],
        }
    }

    /// Scans `reader` and emits one formatted record per match:
    ///
    /// ```text
    /// <file> <lineno> <before> <after> <startCol> <endCol> <quoted-body>
    /// ```
    ///
    /// `lineno` is the 1-based line number of the first context line;
    /// columns are 1-based byte offsets within their lines. The sink returns
    /// `false` to abort (request cancelled). Returns the number of records
    /// emitted.
    pub fn scan<R: Read>(
        &mut self,
        mut reader: R,
        filename: &str,
        regex: &regex::bytes::Regex,
        context: usize,
        sink: &mut dyn FnMut(String) -> bool,
    ) -> Result<usize, ScanError> {
        let capacity = self.buf.len();
        let mut len = 0;
        let mut eof = false;
        while len < capacity && !eof {
            let read = reader.read(&mut self.buf[len..])?;
            if read == 0 {
                eof = true;
            } else {
                len += read;
            }
        }
        if !eof {
            return Err(ScanError::TooLarge(filename.to_string(), capacity));
        }

        let buf = &self.buf[..len];
        let mut chunk_start = 0;
        // 1-based line number of the line starting at chunk_start.
        let mut lineno = 1;
        let mut count = 0;

        while chunk_start < buf.len() {
            let found = match regex.find(&buf[chunk_start..]) {
                Some(found) => found,
                None => break,
            };
            let match_start = found.start() + chunk_start;
            let match_end = found.end() + chunk_start;

            let line_start = last_newline(&buf[..match_start]).map_or(0, |p| p + 1);
            let line_end = match first_newline(&buf[match_end..]) {
                // The last line of a file without a trailing newline.
                None => buf.len(),
                Some(p) => match_end + p,
            };

            let start_col = match_start - line_start + 1;
            let end_col = (match_end as i64 - last_newline(&buf[..match_end]).map_or(-1, |p| p as i64)) as usize;

            let mut context_start = line_start;
            let mut before = 0;
            for _ in 0..context {
                if context_start > 0 {
                    context_start = last_newline(&buf[..context_start - 1]).map_or(0, |p| p + 1);
                    before += 1;
                }
            }

            let mut context_end = line_end;
            let mut after = 0;
            for _ in 0..context {
                if context_end < buf.len() {
                    context_end = match first_newline(&buf[context_end + 1..]) {
                        None => buf.len(),
                        Some(p) => context_end + 1 + p,
                    };
                    after += 1;
                }
            }

            let context_line =
                lineno + count_newlines(&buf[chunk_start..line_start]) - before;

            let body = String::from_utf8_lossy(&buf[context_start..context_end]);
            let record = format!(
                "{filename} {context_line} {before} {after} {start_col} {end_col} {body:?}\n"
            );
            if !sink(record) {
                return Ok(count);
            }
            count += 1;

            // Advance past the first line containing the match so the next
            // search starts on a line boundary.
            let next_line = match first_newline(&buf[line_start..]) {
                None => buf.len(),
                Some(p) => line_start + p + 1,
            };
            lineno += count_newlines(&buf[chunk_start..next_line]);
            chunk_start = next_line;
        }

        Ok(count)
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Scanner::new()
    }
}

fn last_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().rposition(|&b| b == b'\n')
}

fn first_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn count_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == b'\n').count()
}
