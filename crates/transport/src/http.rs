use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use tokio::time::timeout_at;
use tracing::{debug, warn};

use asherah_core::types::FetchedResponse;
use asherah_core::TransportError;

use crate::socks::{classify_io_error, classify_socks_error, ProxyConnector};

/// Fixed desktop browser identity; hidden services are hostile to obvious
/// crawlers.
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0";

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Stop reading the body at this many bytes and flag truncation.
    pub max_bytes: Option<usize>,
    /// Extra attempts after the first, transport failures only.
    pub retries: u32,
    /// Attempt k sleeps `retry_delay * k` before attempt k+1.
    pub retry_delay: Duration,
    /// Deadline for one attempt, headers through body.
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_bytes: None,
            retries: 2,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(45),
        }
    }
}

/// HTTP façade over the SOCKS5 relay. Error statuses come back as data;
/// only transport failures and deadlines are errors.
pub struct HttpClient {
    client: reqwest::Client,
    connector: Arc<ProxyConnector>,
}

impl HttpClient {
    /// `follow_redirects` is off for the dirscanner, which classifies the
    /// redirect itself.
    pub fn new(
        connector: Arc<ProxyConnector>,
        follow_redirects: bool,
    ) -> Result<Self, TransportError> {
        let proxy = reqwest::Proxy::all(format!("socks5h://{}", connector.socks_addr()))
            .map_err(|e| TransportError::ProxyUnavailable(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let redirect = if follow_redirects {
            reqwest::redirect::Policy::limited(5)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(redirect)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        Ok(Self { client, connector })
    }

    /// Fetch a URL with bounded body reads and transport-only retries.
    pub async fn fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
    ) -> Result<FetchedResponse, TransportError> {
        self.connector.ensure_reachable().await?;

        let attempts = opts.retries + 1;
        let mut last_err = TransportError::Io("no attempts made".into());
        for attempt in 1..=attempts {
            match self.fetch_once(url, opts).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(url, attempt, error = %e, "fetch attempt failed");
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(opts.retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_once(
        &self,
        url: &str,
        opts: &FetchOptions,
    ) -> Result<FetchedResponse, TransportError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + opts.timeout;
        debug!(url, "fetching");

        let response = timeout_at(
            deadline,
            self.client.get(url).timeout(opts.timeout).send(),
        )
        .await
        .map_err(|_| TransportError::TimedOut(opts.timeout.as_millis() as u64))?
        .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let content_type = headers.get("content-type").cloned();

        // Stream the body so an oversized response never lands in memory
        // beyond the cap.
        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = match timeout_at(deadline, stream.next()).await {
                Err(_) => return Err(TransportError::TimedOut(opts.timeout.as_millis() as u64)),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(classify_reqwest_error(e)),
                Ok(Some(Ok(chunk))) => chunk,
            };
            match opts.max_bytes {
                Some(max) => {
                    let remaining = max.saturating_sub(body.len());
                    if chunk.len() > remaining {
                        body.extend_from_slice(&chunk[..remaining]);
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                None => body.extend_from_slice(&chunk),
            }
        }

        Ok(FetchedResponse {
            final_url,
            status,
            headers,
            body,
            truncated,
            content_type,
            response_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Single mapping point from reqwest's wrapped errors onto the transport
/// taxonomy: walk the source chain for the SOCKS or I/O failure underneath.
fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::TimedOut(0);
    }
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(socks) = cause.downcast_ref::<tokio_socks::Error>() {
            return classify_socks_error(socks);
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return classify_io_error(io_err);
        }
        source = cause.source();
    }
    TransportError::Io(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_crawler_contract() {
        let opts = FetchOptions::default();
        assert_eq!(opts.retries, 2);
        assert_eq!(opts.timeout, Duration::from_secs(45));
        assert_eq!(opts.max_bytes, None);
    }

    #[test]
    fn retry_backoff_is_linear_in_attempt() {
        let opts = FetchOptions::default();
        assert_eq!(opts.retry_delay * 1, Duration::from_secs(1));
        assert_eq!(opts.retry_delay * 2, Duration::from_secs(2));
    }
}
