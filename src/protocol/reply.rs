//! Control-port reply parsing
//!
//! Reply grammar:
//!
//! ```text
//! 250-version=0.4.8.9        mid line   (more lines follow)
//! 250+circuit-status=        data line  (data block follows, ends with ".")
//! 1 BUILT $AAAA~relay,...
//! .
//! 250 OK                     end line   (reply complete)
//! ```

use std::collections::HashMap;

use crate::error::{HaError, Result};

/// How a reply line continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `NNN-`: more lines follow
    Mid,
    /// `NNN+`: a dot-terminated data block follows
    Data,
    /// `NNN `: last line of the reply
    End,
}

/// One status line, plus its data block for `NNN+` lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub status: u16,
    pub kind: LineKind,
    pub text: String,
    pub data: Vec<String>,
}

impl ReplyLine {
    /// Parse the status prefix of a raw line (CRLF already stripped)
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() < 4 || !raw.is_char_boundary(3) || !raw.is_char_boundary(4) {
            return Err(HaError::ControlProtocol(format!(
                "reply line too short: {:?}",
                raw
            )));
        }

        let status = raw[..3]
            .parse::<u16>()
            .map_err(|_| HaError::ControlProtocol(format!("bad status code in {:?}", raw)))?;

        let kind = match &raw[3..4] {
            "-" => LineKind::Mid,
            "+" => LineKind::Data,
            " " => LineKind::End,
            other => {
                return Err(HaError::ControlProtocol(format!(
                    "bad separator {:?} in {:?}",
                    other, raw
                )))
            }
        };

        Ok(Self {
            status,
            kind,
            text: raw[4..].to_string(),
            data: Vec::new(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A complete control-port reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Status of the final line
    pub fn status(&self) -> u16 {
        self.lines.last().map(|l| l.status).unwrap_or(0)
    }

    /// Every line is 2xx
    pub fn is_ok(&self) -> bool {
        !self.lines.is_empty() && self.lines.iter().all(ReplyLine::is_success)
    }

    /// First non-2xx line, if any
    pub fn first_error(&self) -> Option<&ReplyLine> {
        self.lines.iter().find(|l| !l.is_success())
    }

    /// Human-readable summary used in error messages
    pub fn summary(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{} {}", l.status, l.text))
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// `key=value` pairs from a GETINFO reply
    ///
    /// Data-block values are joined with `\n`.
    pub fn values(&self) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for line in &self.lines {
            let Some((key, value)) = line.text.split_once('=') else {
                continue;
            };
            let value = match line.kind {
                LineKind::Data => line.data.join("\n"),
                _ => value.to_string(),
            };
            values.insert(key.to_string(), value);
        }
        values
    }

    /// `ControlCommandFailed` unless every line is 2xx
    pub fn into_result(self, command: &str) -> Result<Reply> {
        if self.is_ok() {
            return Ok(self);
        }
        Err(HaError::ControlCommandFailed {
            command: command.to_string(),
            reply: self.summary(),
        })
    }
}

/// Count entries in a `circuit-status` data block
pub fn count_circuits(circuit_status: &str) -> usize {
    circuit_status
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .count()
}
