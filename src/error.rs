// ⚠️ Pipeline Errors - one taxonomy for everything a tick can run into

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::fetch::FetchError;
use crate::parser::{DocumentError, ParseError};
use crate::persistence::PersistError;
use crate::watchlist::WatchlistError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Connection-level failure or upstream 5xx; retry on a later tick
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// Upstream answered, and the answer will not change (404, 403, ...)
    #[error("upstream rejected {url} with HTTP {status}")]
    UpstreamRejected { url: String, status: u16 },

    #[error("filing {accession} could not be parsed: {message}")]
    Parse { accession: String, message: String },

    #[error("filing {accession} violates a store constraint: {reason}")]
    ConstraintViolation { accession: String, reason: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watchlist(#[from] WatchlistError),
}

impl PipelineError {
    /// Cannot continue at all; the process should exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Config(_) | PipelineError::Watchlist(_))
    }

    /// Worth retrying later: the filing must stay eligible for rediscovery
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientNetwork(_)
                | PipelineError::RateLimited(_)
                | PipelineError::CircuitOpen { .. }
                | PipelineError::StoreUnavailable(_)
        )
    }

    /// Short label for logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientNetwork(_) => "transient_network",
            PipelineError::RateLimited(_) => "rate_limited",
            PipelineError::CircuitOpen { .. } => "circuit_open",
            PipelineError::UpstreamRejected { .. } => "upstream_rejected",
            PipelineError::Parse { .. } => "parse",
            PipelineError::ConstraintViolation { .. } => "constraint_violation",
            PipelineError::StoreUnavailable(_) => "store_unavailable",
            PipelineError::Config(_) => "config",
            PipelineError::Watchlist(_) => "watchlist",
        }
    }

    pub fn parse(accession: &str, err: &ParseError) -> Self {
        PipelineError::Parse {
            accession: accession.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::CircuitOpen { retry_in } => PipelineError::CircuitOpen { retry_in },
            FetchError::RateLimited { .. } => PipelineError::RateLimited(err.to_string()),
            FetchError::HttpStatus { ref url, status } if err.is_permanent() => {
                PipelineError::UpstreamRejected {
                    url: url.clone(),
                    status,
                }
            }
            FetchError::MalformedBody { ref url } => PipelineError::UpstreamRejected {
                url: url.clone(),
                status: 200,
            },
            FetchError::Network { .. } | FetchError::HttpStatus { .. } => {
                PipelineError::TransientNetwork(err.to_string())
            }
        }
    }
}

impl From<DiscoveryError> for PipelineError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Fetch(fetch) => fetch.into(),
            // a half-delivered feed page is retried next tick
            DiscoveryError::Feed { .. } => PipelineError::TransientNetwork(err.to_string()),
        }
    }
}

impl From<DocumentError> for PipelineError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::Fetch(fetch) => fetch.into(),
            DocumentError::Index { ref url, .. } => PipelineError::UpstreamRejected {
                url: url.clone(),
                status: 200,
            },
        }
    }
}

impl From<PersistError> for PipelineError {
    fn from(err: PersistError) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }
}
