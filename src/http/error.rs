//! Error types for the http module.
//!
//! [`HttpError`] is what a single transfer resolves with when it fails.
//! [`FetchError`] is the terminal outcome of the failover loop, the only
//! signal higher layers inspect once retries are over.

use thiserror::Error;

/// libcurl result codes that point at the proxy rather than the origin.
///
/// | Code | Meaning |
/// |------|---------|
/// | 5    | couldn't resolve proxy |
/// | 6    | couldn't resolve host (resolved through the proxy) |
/// | 7    | couldn't connect |
/// | 35   | SSL connect error |
/// | 58   | problem with the local client certificate |
/// | 60   | peer certificate failed verification |
/// | 97   | proxy handshake error |
const PROXY_ERROR_CODES: [i64; 7] = [5, 6, 7, 35, 58, 60, 97];

/// Errors a single transfer can fail with.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Low-level transfer failure not attributable to a proxy.
    #[error("transfer failed for {url}: {message} (curl error {code})")]
    Transport {
        /// The URL being transferred.
        url: String,
        /// The libcurl result code.
        code: i64,
        /// libcurl's description of the failure.
        message: String,
    },

    /// Transfer failure attributable to proxy resolution, connection or TLS.
    #[error("proxy failure for {url}: {message} (curl error {code})")]
    Proxy {
        /// The URL being transferred.
        url: String,
        /// The libcurl result code.
        code: i64,
        /// libcurl's description of the failure.
        message: String,
    },

    /// The body grew past the configured cap and the transfer was aborted.
    #[error("response from {url} exceeded {limit} bytes")]
    ResponseTooLarge {
        /// The URL being transferred.
        url: String,
        /// The cap that was exceeded.
        limit: usize,
    },

    /// `perform` was called on a request that is already performing or done.
    #[error("request for {url} cannot be performed again")]
    AlreadyPerforming {
        /// The URL of the misused request.
        url: String,
    },

    /// libcurl rejected a transfer option.
    #[error("invalid transfer option for {url}: {source}")]
    Setup {
        /// The URL being configured.
        url: String,
        /// The underlying libcurl error.
        #[source]
        source: curl::Error,
    },

    /// The multi handle itself failed.
    #[error("transfer engine error: {source}")]
    Engine {
        /// The underlying libcurl multi error.
        #[source]
        source: curl::MultiError,
    },

    /// The transfer was detached before it produced an outcome.
    #[error("transfer for {url} was abandoned before completion")]
    Abandoned {
        /// The URL of the abandoned transfer.
        url: String,
    },
}

impl HttpError {
    /// Maps a failed libcurl transfer to `Proxy` or `Transport`.
    pub fn from_curl(url: impl Into<String>, error: &curl::Error) -> Self {
        let code = i64::from(error.code());
        let message = error
            .extra_description()
            .map_or_else(|| error.description().to_string(), str::to_string);
        if PROXY_ERROR_CODES.contains(&code) {
            Self::Proxy {
                url: url.into(),
                code,
                message,
            }
        } else {
            Self::Transport {
                url: url.into(),
                code,
                message,
            }
        }
    }

    /// Creates a response-too-large error.
    pub fn too_large(url: impl Into<String>, limit: usize) -> Self {
        Self::ResponseTooLarge {
            url: url.into(),
            limit,
        }
    }

    /// Creates an option-rejected error.
    pub fn setup(url: impl Into<String>, source: curl::Error) -> Self {
        Self::Setup {
            url: url.into(),
            source,
        }
    }

    /// Creates an error for a second `perform` on the same request.
    pub fn already_performing(url: impl Into<String>) -> Self {
        Self::AlreadyPerforming { url: url.into() }
    }

    /// Creates an abandoned-transfer error.
    pub fn abandoned(url: impl Into<String>) -> Self {
        Self::Abandoned { url: url.into() }
    }

    /// Returns true for failures that mean "try another proxy".
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy { .. })
    }

    /// Returns true for caller misuse, which must never be retried.
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::AlreadyPerforming { .. })
    }
}

impl From<curl::MultiError> for HttpError {
    fn from(source: curl::MultiError) -> Self {
        Self::Engine { source }
    }
}

/// Terminal errors of the failover loop.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every proxy was tried with its full retry budget.
    #[error("unable to fetch {url} after {attempts} attempts")]
    Exhausted {
        /// The last URL attempted.
        url: String,
        /// Total attempts made across all proxies.
        attempts: u32,
    },

    /// The server signalled that the resource does not exist.
    #[error("not found: {url}")]
    NotFound {
        /// The URL that was not found.
        url: String,
    },

    /// The overall retry deadline passed before an attempt succeeded.
    #[error("deadline exceeded fetching {url} after {attempts} attempts")]
    DeadlineExceeded {
        /// The last URL attempted.
        url: String,
        /// Attempts made before the deadline passed.
        attempts: u32,
    },

    /// A failure that retrying cannot fix.
    #[error(transparent)]
    Fatal(#[from] HttpError),
}

impl FetchError {
    /// Creates a not-found error.
    pub fn not_found(url: impl Into<String>) -> Self {
        Self::NotFound { url: url.into() }
    }

    /// Creates an exhausted error.
    pub fn exhausted(url: impl Into<String>, attempts: u32) -> Self {
        Self::Exhausted {
            url: url.into(),
            attempts,
        }
    }
}
