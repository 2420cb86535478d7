//! Reply parsing for the control-channel line protocol.
//!
//! A reply is a sequence of `<code><sep><text>` lines where `sep` is `-`
//! (more lines follow), `+` (a data block follows, closed by a lone `.`) or
//! a space (last line of the reply). Text of the form `key=value` is split
//! into a typed entry; anything else is kept as free text.

use thiserror::Error;

/// Errors produced for individual reply lines.
///
/// A malformed line is reported to the caller and then skipped; it never
/// poisons the rest of the reply.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReplyParseError {
    #[error("reply line too short: {line:?}")]
    Truncated { line: String },

    #[error("reply line has non-numeric status code: {line:?}")]
    InvalidCode { line: String },

    #[error("reply line has invalid separator {sep:?}: {line:?}")]
    InvalidSeparator { sep: char, line: String },
}

/// Position of a line within its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `-`: more lines follow.
    Mid,
    /// `+`: a data block follows.
    Data,
    /// ` `: final line of the reply.
    End,
}

/// One parsed status line, plus its data block if it opened one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    pub sep: Separator,
    pub key: Option<String>,
    pub value: String,
    pub data: Vec<String>,
}

/// A complete reply to one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Status code of the final line.
    pub fn code(&self) -> u16 {
        self.lines.last().map(|l| l.code).unwrap_or(0)
    }

    /// True when every line carries a 2xx code.
    pub fn is_ok(&self) -> bool {
        !self.lines.is_empty() && self.lines.iter().all(|l| (200..300).contains(&l.code))
    }

    /// Human-readable text of the final line.
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.value.as_str()).unwrap_or("")
    }

    /// Value of the first entry with the given key.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entry(key).map(|l| l.value.as_str())
    }

    /// Inline value and data-block lines of the given key, in order.
    pub fn text_lines(&self, key: &str) -> Vec<&str> {
        match self.entry(key) {
            Some(line) => {
                let mut out = Vec::with_capacity(line.data.len() + 1);
                if !line.value.is_empty() {
                    out.push(line.value.as_str());
                }
                out.extend(line.data.iter().map(String::as_str));
                out
            }
            None => Vec::new(),
        }
    }

    /// All `key=value` entries in reply order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines
            .iter()
            .filter_map(|l| l.key.as_deref().map(|k| (k, l.value.as_str())))
    }

    fn entry(&self, key: &str) -> Option<&ReplyLine> {
        self.lines.iter().find(|l| l.key.as_deref() == Some(key))
    }
}

/// Incremental reply assembler fed one raw line at a time.
#[derive(Debug, Default)]
pub struct ReplyReader {
    lines: Vec<ReplyLine>,
    open_block: Option<ReplyLine>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line (with or without its CRLF).
    ///
    /// Returns `Ok(Some(reply))` when the line completes a reply.
    pub fn feed(&mut self, raw: &str) -> Result<Option<Reply>, ReplyParseError> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some(block) = self.open_block.as_mut() {
            if line == "." {
                if let Some(block) = self.open_block.take() {
                    self.lines.push(block);
                }
            } else {
                let unstuffed = line.strip_prefix('.').filter(|l| l.starts_with('.'));
                block.data.push(unstuffed.unwrap_or(line).to_string());
            }
            return Ok(None);
        }

        let parsed = parse_line(line)?;
        match parsed.sep {
            Separator::Data => {
                self.open_block = Some(parsed);
                Ok(None)
            }
            Separator::Mid => {
                self.lines.push(parsed);
                Ok(None)
            }
            Separator::End => {
                self.lines.push(parsed);
                Ok(Some(Reply {
                    lines: std::mem::take(&mut self.lines),
                }))
            }
        }
    }
}

/// Parse a single status line (not a data-block line).
pub fn parse_line(raw: &str) -> Result<ReplyLine, ReplyParseError> {
    let line = raw.trim();

    let mut chars = line.char_indices();
    let code_end = match chars.nth(3) {
        Some((idx, _)) => idx,
        None => {
            // "250" alone is accepted as a final line with no text.
            if line.len() == 3 && line.bytes().all(|b| b.is_ascii_digit()) {
                return Ok(ReplyLine {
                    code: line.parse().unwrap_or(0),
                    sep: Separator::End,
                    key: None,
                    value: String::new(),
                    data: Vec::new(),
                });
            }
            return Err(ReplyParseError::Truncated {
                line: line.to_string(),
            });
        }
    };

    let code_str = &line[..code_end];
    if !code_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ReplyParseError::InvalidCode {
            line: line.to_string(),
        });
    }
    let code: u16 = code_str.parse().map_err(|_| ReplyParseError::InvalidCode {
        line: line.to_string(),
    })?;

    let rest = &line[code_end..];
    let mut rest_chars = rest.chars();
    let sep = match rest_chars.next() {
        Some('-') => Separator::Mid,
        Some('+') => Separator::Data,
        Some(' ') => Separator::End,
        Some(other) => {
            return Err(ReplyParseError::InvalidSeparator {
                sep: other,
                line: line.to_string(),
            })
        }
        None => Separator::End,
    };

    let text = rest_chars.as_str().trim();
    let (key, value) = split_key_value(text);

    Ok(ReplyLine {
        code,
        sep,
        key,
        value,
        data: Vec::new(),
    })
}

fn split_key_value(text: &str) -> (Option<String>, String) {
    if let Some((k, v)) = text.split_once('=') {
        let k = k.trim();
        if !k.is_empty() && !k.contains(char::is_whitespace) {
            return (Some(k.to_string()), v.trim().to_string());
        }
    }
    (None, text.to_string())
}
