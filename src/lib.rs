// Filing Ingest - Core Library
// Exposes the pipeline modules for the runner binary and integration tests

pub mod config;
pub mod db;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod liveness;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod persistence;
pub mod shutdown;
pub mod watchlist;
pub mod xml;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use db::{
    get_events_for_entity, setup_database, BatchOutcome, Event, Quarantined, Store,
};
pub use dedup::DedupCache;
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryError, DiscoveryPass};
pub use error::PipelineError;
pub use fetch::{
    BreakerConfig, BreakerState, CircuitBreaker, FetchClient, FetchConfig, FetchError,
    FetchRequest, FetchResponse, HttpTransport, RateLimiter, ReqwestTransport, TransportError,
};
pub use liveness::{HealthcheckPinger, LivenessReporter, NoLiveness};
pub use model::{
    normalize_cik, AmendmentType, Filing, FilingCandidate, FilingRecord, FormType, Holding,
    InvestmentDiscretion, PutCall, ShareType, VotingAuthority,
};
pub use orchestrator::{Pipeline, PipelineConfig, TickReport};
pub use parser::{
    fetch_document, FilingDocument, HoldingsParser, InformationTableParser, ParseError,
    ParsedFiling, SkippedRow,
};
pub use persistence::{Ack, AmendmentPolicy, BatchConfig, BatchWriter, FlushReport, PersistError};
pub use shutdown::ShutdownSignal;
pub use watchlist::{Watchlist, WatchlistError, WatchlistWatcher};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
