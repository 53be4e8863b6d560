//! Page and resource fetchers built on the failover loop.
//!
//! Both classify every response into an [`Attempt`] so that the loop knows
//! whether to retry on the same proxy, move on, or give up.

use tracing::{debug, info, instrument};

use crate::http::{
    Attempt, FetchError, Method, RequestOptions, Response, RetryPolicy, Session, with_failover,
};

/// How much of the body start is searched for signatures.
const PAGE_HEAD_BYTES: usize = 512;

/// How much of the body end must contain the closing `</html>`.
const PAGE_TAIL_BYTES: usize = 256;

/// Body signatures that decide how a fetched page is treated.
///
/// Signatures are matched case-insensitively against the first 512 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRules {
    /// The proxy is banned; move to the next one.
    pub ban_signatures: Vec<String>,
    /// The page does not exist; stop.
    pub not_found_signatures: Vec<String>,
}

impl Default for PageRules {
    fn default() -> Self {
        Self {
            ban_signatures: vec!["it seems you are banned".to_string()],
            not_found_signatures: vec!["404 not found".to_string()],
        }
    }
}

/// A fully received HTML page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Page text.
    pub text: String,
    /// URL after redirects.
    pub effective_url: String,
}

/// Outcome of [`fetch_resource`].
#[derive(Debug)]
pub enum ResourceFetch {
    /// The server reports the same length as the local copy; nothing fetched.
    Unchanged,
    /// The resource was downloaded.
    Fetched(Response),
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

fn matches_any(haystack: &[u8], signatures: &[String]) -> bool {
    signatures
        .iter()
        .any(|signature| contains(haystack, signature.to_ascii_lowercase().as_bytes()))
}

/// Judges one page response.
#[must_use]
pub fn classify_page(rules: &PageRules, url: &str, response: Response) -> Attempt<Page> {
    if !response.is_ok() {
        return Attempt::Rotate(format!("status {}", response.status));
    }

    let body = &response.body;
    let head = body[..body.len().min(PAGE_HEAD_BYTES)].to_ascii_lowercase();
    if matches_any(&head, &rules.ban_signatures) {
        return Attempt::Rotate("ban page".to_string());
    }
    if matches_any(&head, &rules.not_found_signatures) {
        return Attempt::Fatal(FetchError::not_found(url));
    }
    if !contains(&head, b"<html") {
        return Attempt::Retry("page start missing".to_string());
    }
    let tail = body[body.len().saturating_sub(PAGE_TAIL_BYTES)..].to_ascii_lowercase();
    if !contains(&tail, b"</html>") {
        return Attempt::Retry("page truncated".to_string());
    }

    let effective_url = response.effective_url;
    match String::from_utf8(response.body) {
        Ok(text) => Attempt::Done(Page {
            text,
            effective_url,
        }),
        Err(_) => Attempt::Rotate("page is not valid UTF-8".to_string()),
    }
}

/// Fetches an HTML page, retrying partial pages and rotating away from
/// banned or failing proxies.
///
/// # Errors
///
/// - [`FetchError::NotFound`] if the page carries a not-found signature
/// - [`FetchError::Exhausted`] once every proxy failed
#[instrument(skip(session, policy, rules, options))]
pub async fn fetch_page(
    session: &mut Session,
    policy: &RetryPolicy,
    rules: &PageRules,
    url: &str,
    options: &RequestOptions,
) -> Result<Page, FetchError> {
    with_failover(session, policy, url, |client| async move {
        let response = client.fetch(Method::Get, url, options).await?;
        Ok(classify_page(rules, url, response))
    })
    .await
}

/// What [`fetch_resource`] expects of the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceCheck {
    /// Required `content-type` prefix, e.g. `image`. Empty accepts anything.
    pub content_type_prefix: String,
    /// Size of an existing local copy; enables the HEAD pre-check.
    pub known_length: Option<u64>,
}

/// Judges the HEAD pre-check. `None` means go on with the download.
fn classify_check(check: &ResourceCheck, response: &Response) -> Option<Attempt<ResourceFetch>> {
    if !response.is_ok() {
        return Some(Attempt::Retry(format!("check status {}", response.status)));
    }
    let known = check.known_length?;
    (response.content_length() == Some(known)).then_some(Attempt::Done(ResourceFetch::Unchanged))
}

/// Judges the download itself.
#[must_use]
pub fn classify_resource(check: &ResourceCheck, response: Response) -> Attempt<ResourceFetch> {
    if !response.is_ok() {
        return Attempt::Rotate(format!("status {}", response.status));
    }
    let content_type = response.content_type().unwrap_or_default();
    if !content_type.starts_with(&check.content_type_prefix) {
        return Attempt::Retry(format!("unexpected content type {content_type:?}"));
    }
    Attempt::Done(ResourceFetch::Fetched(response))
}

/// Downloads a binary resource, skipping it when a local copy of the same
/// length exists.
///
/// # Errors
///
/// Returns [`FetchError::Exhausted`] once every proxy failed.
#[instrument(skip(session, policy, check, options))]
pub async fn fetch_resource(
    session: &mut Session,
    policy: &RetryPolicy,
    check: &ResourceCheck,
    url: &str,
    options: &RequestOptions,
) -> Result<ResourceFetch, FetchError> {
    let outcome = with_failover(session, policy, url, |client| async move {
        if check.known_length.is_some() {
            let head = client.fetch(Method::Head, url, options).await?;
            if let Some(verdict) = classify_check(check, &head) {
                return Ok(verdict);
            }
            debug!(url, remote = ?head.content_length(), "local copy differs, downloading");
        }
        let response = client.fetch(Method::Get, url, options).await?;
        Ok(classify_resource(check, response))
    })
    .await?;

    if matches!(outcome, ResourceFetch::Unchanged) {
        info!(url, "already downloaded");
    }
    Ok(outcome)
}
