//! Network fetch: open a byte stream for a locator and copy it into a sink.
//!
//! The [`HttpClient`] trait abstracts the transport so tests can inject
//! scripted responses; [`ReqwestClient`] is the production implementation.
//! One attempt per call, no retries.

use std::io::{Read, Write};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Fixed buffer size for streaming copies (8 KiB).
pub const IO_BUF_SIZE: usize = 8 * 1024;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Some image hosts reject requests without a User-Agent.
const DEFAULT_USER_AGENT: &str = concat!("pixloader/", env!("CARGO_PKG_VERSION"));

/// A readable response body.
pub type ByteStream = Box<dyn Read + Send>;

/// Fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure or non-success status
    #[error("http error: {0}")]
    Http(String),

    /// I/O failure while streaming the body
    #[error("fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blocking HTTP transport.
///
/// Implementations open a single GET request and hand back the response
/// body as a stream. Injected into the loader for testability.
pub trait HttpClient: Send + Sync {
    /// Open a connection to `locator` and return its body stream.
    fn open(&self, locator: &str) -> Result<ByteStream, FetchError>;
}

/// Production HTTP client backed by `reqwest::blocking`.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Create a client with the default timeout.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    /// Create a client with a custom timeout in seconds.
    pub fn with_timeout(timeout_secs: u64) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| FetchError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new().expect("failed to create default HTTP client")
    }
}

impl HttpClient for ReqwestClient {
    fn open(&self, locator: &str) -> Result<ByteStream, FetchError> {
        let response = self
            .client
            .get(locator)
            .send()
            .map_err(|e| FetchError::Http(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(FetchError::Http(format!(
                "HTTP {} from {}",
                response.status(),
                locator
            )));
        }

        Ok(Box::new(response))
    }
}

/// Copy `reader` into `writer` through a fixed-size buffer.
///
/// Returns `false` on any I/O error instead of propagating; the failure is
/// logged and both ends are dropped (closed) on every exit path.
pub fn copy_stream(mut reader: impl Read, mut writer: impl Write, buf_size: usize) -> bool {
    let mut buf = vec![0u8; buf_size];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                if let Err(err) = writer.flush() {
                    warn!(error = %err, "sink flush failed");
                    return false;
                }
                return true;
            }
            Ok(n) => {
                if let Err(err) = writer.write_all(&buf[..n]) {
                    warn!(error = %err, "copy to sink failed");
                    return false;
                }
            }
            Err(err) => {
                warn!(error = %err, "read from stream failed");
                return false;
            }
        }
    }
}
