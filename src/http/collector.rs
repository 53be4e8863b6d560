//! Per-transfer capture state living inside each pooled handle.

use curl::easy::{Handler, InfoType, WriteError};
use tracing::{trace, warn};

use super::constants::MAX_RESPONSE_SIZE;
use super::header::HeaderParser;
use super::response::Response;

/// libcurl callback target: feeds header lines to the state machine and
/// appends body chunks under the byte cap.
#[derive(Debug)]
pub(crate) struct Collector {
    url: String,
    headers: HeaderParser,
    body: Vec<u8>,
    received: usize,
    limit: usize,
    overflowed: bool,
}

impl Default for Collector {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HeaderParser::new(),
            body: Vec::new(),
            received: 0,
            limit: MAX_RESPONSE_SIZE,
            overflowed: false,
        }
    }
}

impl Collector {
    /// Prepares the collector for a new transfer.
    pub(crate) fn prepare(&mut self, url: &str, limit: usize) {
        self.clear();
        self.url.push_str(url);
        self.limit = limit;
    }

    /// Drops everything captured so far. The body buffer is released rather
    /// than kept, so an idle handle never pins a large response.
    pub(crate) fn clear(&mut self) {
        self.url.clear();
        self.headers.reset();
        self.body = Vec::new();
        self.received = 0;
        self.limit = MAX_RESPONSE_SIZE;
        self.overflowed = false;
    }

    /// True once the body cap was hit and the transfer aborted.
    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// Moves the captured response out, leaving the collector empty.
    pub(crate) fn take_response(&mut self, effective_url: String) -> Response {
        let headers = std::mem::take(&mut self.headers);
        let body = std::mem::take(&mut self.body);
        let (hop, prior) = headers.finish();
        Response::assemble(hop, prior, effective_url, body)
    }
}

impl Handler for Collector {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.received = self.received.saturating_add(data.len());
        if self.received > self.limit {
            self.overflowed = true;
            // A short count makes libcurl abort with a write error.
            return Ok(0);
        }
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if let Err(malformed) = self.headers.feed(data) {
            warn!(url = %self.url, line = %malformed.line, reason = malformed.reason, "skipping malformed header line");
        }
        true
    }

    fn debug(&mut self, kind: InfoType, data: &[u8]) {
        let kind = match kind {
            InfoType::Text => "text",
            InfoType::HeaderIn => "header-in",
            InfoType::HeaderOut => "header-out",
            _ => return,
        };
        trace!(url = %self.url, kind, "{}", String::from_utf8_lossy(data).trim_end());
    }
}
