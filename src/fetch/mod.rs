// 🌐 Fetch Layer - the only code that talks to the filings source
//
// Every request goes through one shared FetchClient so the outbound rate
// ceiling and the breaker state are process-wide, not per worker.

pub mod circuit_breaker;
pub mod client;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker, Permit};
pub use client::{FetchClient, FetchConfig, ReqwestTransport};
pub use rate_limiter::{RateLimitExceeded, RateLimiter};

use std::time::Duration;
use thiserror::Error;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,

    /// Parsed `Retry-After` header (seconds form only)
    pub retry_after: Option<Duration>,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        FetchResponse {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ============================================================================
// TRANSPORT SEAM
// ============================================================================

/// Connection-level failure: nothing usable came back
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
            timed_out: false,
        }
    }
}

/// Raw HTTP GET. Production uses reqwest; tests script responses.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError>;
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("rate limited before requesting {url} (waited {waited:?})")]
    RateLimited { url: String, waited: Duration },

    #[error("circuit open; upstream calls suspended for another {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("network error fetching {url} after {attempts} attempt(s): {message}")]
    Network {
        url: String,
        message: String,
        attempts: u32,
    },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("response body from {url} is not valid UTF-8")]
    MalformedBody { url: String },
}

impl FetchError {
    /// Retrying this exact request later cannot succeed
    pub fn is_permanent(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => {
                (400..500).contains(status) && *status != 429
            }
            FetchError::MalformedBody { .. } => true,
            _ => false,
        }
    }
}
