//! Completed HTTP response.

use super::header::{HeaderList, Hop};

/// A response captured by a successful transfer.
///
/// Only the final hop of a redirect chain populates `status`, `reason` and
/// `headers`; earlier hops are kept in `prior_headers`.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Protocol version of the final hop, e.g. `1.1` or `2`.
    pub version: String,
    /// Status code of the final hop.
    pub status: u16,
    /// Reason phrase of the final hop.
    pub reason: String,
    /// Headers of the final hop, names lower-cased, arrival order.
    pub headers: HeaderList,
    /// Header lists of the redirect hops that preceded the final one.
    pub prior_headers: Vec<HeaderList>,
    /// URL after following redirects.
    pub effective_url: String,
    /// Captured body.
    pub body: Vec<u8>,
}

impl Response {
    pub(crate) fn assemble(
        hop: Option<Hop>,
        prior_headers: Vec<HeaderList>,
        effective_url: String,
        body: Vec<u8>,
    ) -> Self {
        let hop = hop.unwrap_or_default();
        Self {
            version: hop.version,
            status: hop.status,
            reason: hop.reason,
            headers: hop.headers,
            prior_headers,
            effective_url,
            body,
        }
    }

    /// Returns the first value of a header, matching the name case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value of a header, in arrival order.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of `content-type`, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Parsed `content-length`, if present and numeric.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }

    /// True for a 200 status.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Number of redirect hops before the final response.
    #[must_use]
    pub fn redirects(&self) -> usize {
        self.prior_headers.len()
    }
}
