//! HTTP transport for the IVR writer.
//!
//! Thin wrapper over a shared reqwest pool with per-call timeouts and a
//! bounded retry loop. Only transport-level failures are retried: a hard
//! timeout aborts the attempt loop immediately, and HTTP status codes are
//! application-level outcomes that are never retried here.

use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, EXPECT};
use reqwest::Client;
use tracing as log;

use cseg_core::error::{Error, Result};

/// Shared HTTP client for all IVR requests (connection pooling).
static SHARED_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(4)
        .build()
        .expect("Failed to build IVR shared HTTP client")
});

/// One completed HTTP exchange. The status is reported as-is; mapping
/// non-2xx codes to errors is the caller's concern.
#[derive(Debug)]
pub struct HttpReply {
    pub status: u16,
    pub body: Bytes,
}

impl HttpReply {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

pub struct HttpTransport {
    client: Client,
    /// Attempt budget per call for transport failures.
    retries: u32,
}

impl HttpTransport {
    #[must_use]
    pub fn new(retries: u32) -> Self {
        Self {
            client: SHARED_CLIENT.clone(),
            retries: retries.max(1),
        }
    }

    /// POST a form-encoded body.
    pub async fn post_form(
        &self,
        uri: &str,
        body: String,
        timeout: Duration,
    ) -> Result<HttpReply> {
        self.perform(|| {
            self.client
                .post(uri)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .timeout(timeout)
                .body(body.clone())
        })
        .await
    }

    /// PUT raw bytes. The `Expect` header is explicitly blanked: the
    /// 100-continue round trip is mishandled by some object stores.
    pub async fn put_bytes(
        &self,
        uri: &str,
        content_type: &str,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpReply> {
        self.perform(|| {
            self.client
                .put(uri)
                .header(CONTENT_TYPE, content_type)
                .header(EXPECT, "")
                .timeout(timeout)
                .body(body.clone())
        })
        .await
    }

    async fn perform<F>(&self, build: F) -> Result<HttpReply>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut remaining = self.retries;
        loop {
            remaining -= 1;
            match build().send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| Error::Transport(format!("read response body: {e}")))?;
                    return Ok(HttpReply { status, body });
                }
                Err(err) if err.is_timeout() => {
                    return Err(Error::Transport(format!("request timed out: {err}")));
                }
                Err(err) if remaining > 0 => {
                    log::warn!(error = %err, remaining, "transport failure, retrying");
                }
                Err(err) => {
                    return Err(Error::Transport(err.to_string()));
                }
            }
        }
    }
}
