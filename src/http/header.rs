//! Streaming parser for response header lines.
//!
//! libcurl hands over every raw header line of every hop: the status line,
//! the `name: value` lines and the blank terminator, once per response in
//! a redirect chain. [`HeaderParser`] turns that stream into one [`Hop`] per
//! response, keeping only the last one as the primary result.

use thiserror::Error;

/// Headers of a single hop, in arrival order, names lower-cased.
pub type HeaderList = Vec<(String, String)>;

/// Non-fatal diagnostic for a header line that had to be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed header line ({reason}): {line:?}")]
pub struct MalformedHeaderLine {
    /// The offending line, decoded as ISO-8859-1.
    pub line: String,
    /// Why the line was rejected.
    pub reason: &'static str,
}

impl MalformedHeaderLine {
    fn new(line: &str, reason: &'static str) -> Self {
        Self {
            line: line.to_string(),
            reason,
        }
    }
}

/// Parser state between lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// The next line should be a status line opening a new hop.
    ExpectStatusLine,
    /// Inside a hop's header block.
    ExpectHeaderOrBlank,
}

/// One response in the redirect chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hop {
    /// Protocol version without the `HTTP/` prefix, e.g. `1.1` or `2`.
    pub version: String,
    /// Numeric status code; 0 if the status line carried none.
    pub status: u16,
    /// Reason phrase, empty for HTTP/2.
    pub reason: String,
    /// Headers of this hop.
    pub headers: HeaderList,
}

/// Header state machine fed one raw line at a time.
#[derive(Debug, Clone)]
pub struct HeaderParser {
    state: HeaderState,
    current: Option<Hop>,
    prior: Vec<HeaderList>,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderParser {
    /// Creates a parser waiting for the first status line.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: HeaderState::ExpectStatusLine,
            current: None,
            prior: Vec::new(),
        }
    }

    /// Returns the parser to its initial state.
    pub fn reset(&mut self) {
        self.state = HeaderState::ExpectStatusLine;
        self.current = None;
        self.prior.clear();
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HeaderState {
        self.state
    }

    /// The hop being filled (the final one once the transfer is over).
    #[must_use]
    pub fn current(&self) -> Option<&Hop> {
        self.current.as_ref()
    }

    /// Header lists of the hops before the current one.
    #[must_use]
    pub fn prior(&self) -> &[HeaderList] {
        &self.prior
    }

    /// Consumes one raw header line, CRLF included or not.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedHeaderLine`] for a line that was skipped. The parser
    /// stays usable; callers are expected to log and carry on.
    pub fn feed(&mut self, raw: &[u8]) -> Result<(), MalformedHeaderLine> {
        // Header bytes are ISO-8859-1: every byte is its own code point.
        let line: String = raw.iter().map(|&b| char::from(b)).collect();
        let line = line.trim_end_matches(['\r', '\n']);

        match self.state {
            HeaderState::ExpectStatusLine => self.status_line(line),
            HeaderState::ExpectHeaderOrBlank => self.header_line(line),
        }
    }

    /// Splits the parser into the final hop and the prior hops' headers.
    #[must_use]
    pub fn finish(self) -> (Option<Hop>, Vec<HeaderList>) {
        (self.current, self.prior)
    }

    fn status_line(&mut self, line: &str) -> Result<(), MalformedHeaderLine> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let mut parts = line.splitn(3, ' ');
        let protocol = parts.next().unwrap_or_default();
        let Some(version) = protocol.strip_prefix("HTTP/") else {
            return Err(MalformedHeaderLine::new(line, "expected status line"));
        };
        let status = parts
            .next()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .unwrap_or(0);
        let reason = parts.next().map(str::trim).unwrap_or_default();

        if let Some(previous) = self.current.take() {
            self.prior.push(previous.headers);
        }
        self.current = Some(Hop {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
        });
        self.state = HeaderState::ExpectHeaderOrBlank;
        Ok(())
    }

    fn header_line(&mut self, line: &str) -> Result<(), MalformedHeaderLine> {
        let Some(hop) = self.current.as_mut() else {
            return Err(MalformedHeaderLine::new(line, "no open hop"));
        };

        if line.starts_with([' ', '\t']) {
            let Some((_, value)) = hop.headers.last_mut() else {
                return Err(MalformedHeaderLine::new(
                    line,
                    "continuation without a preceding header",
                ));
            };
            value.push(' ');
            value.push_str(line.trim());
            return Ok(());
        }

        if line.trim().is_empty() {
            self.state = HeaderState::ExpectStatusLine;
            return Ok(());
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(MalformedHeaderLine::new(line, "missing colon"));
        };
        hop.headers
            .push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        Ok(())
    }
}
