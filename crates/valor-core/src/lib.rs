//! # Valor Core
//!
//! Price discovery and position valuation for on-chain holdings.
//!
//! ## Overview
//!
//! Every position a holder has in a supported protocol is converted into a
//! single reference asset (a stablecoin) in integer minor units:
//!
//! - **Spot quotes** from a CoW-style quoting venue, paced by one shared
//!   rate limiter with exponential backoff and a circuit breaker
//! - **Market redemption quotes** from a Pendle-style routing venue, compared
//!   across several backends under a per-minute cost budget
//! - **Recursive decomposition** of composite instruments (pool shares, vault
//!   shares, principal tokens) into legs from on-chain totals
//! - **Reconciliation** of the direct and decomposed values
//! - **Protocol adapters** and a **portfolio aggregator** that mark unpriced
//!   positions instead of aborting
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapter`] | Protocol adapters producing valued positions |
//! | [`cancel`] | Caller-supplied cancellation |
//! | [`chain`] | Chain reader trait, retry wrapper, in-memory reader |
//! | [`comparator`] | Multi-backend comparison under a cost budget |
//! | [`config`] | Engine configuration and environment overrides |
//! | [`decomposer`] | Recursive valuation of composite instruments |
//! | [`domain`] | Networks, addresses, instruments, amounts |
//! | [`engine`] | Builder wiring every component together |
//! | [`error`] | Core error types |
//! | [`http_client`] | HTTP client abstraction |
//! | [`portfolio`] | Cross-protocol aggregation |
//! | [`quote_client`] | Spot quotes with identity and reference-amount fallback |
//! | [`rate_limiter`] | Shared pacing, backoff and circuit breaker |
//! | [`registry`] | Token and instrument registry |
//! | [`retry`] | Network and chain-read retry policies |
//! | [`routing_client`] | Routing venue client |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ PortfolioAggregator │
//! └──────────┬──────────┘
//!            │ join_all
//!            ▼
//! ┌─────────────────────┐     ┌──────────────────┐
//! │  ProtocolAdapter    │────▶│  ChainReader     │
//! └──────────┬──────────┘     │  (retrying)      │
//!            │                └──────────────────┘
//!            ▼
//! ┌─────────────────────┐     ┌──────────────────────┐
//! │ PositionDecomposer  │────▶│ AggregatorComparator │──▶ RoutingClient
//! └──────────┬──────────┘     └──────────────────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐     ┌──────────────────┐
//! │    QuoteClient      │────▶│   RateLimiter    │
//! └─────────────────────┘     └──────────────────┘
//! ```
//!
//! ## Logging
//!
//! Decisions (waits, backoff, breaker trips, fallbacks, reconciliation) are
//! emitted as `tracing` events with structured fields. The crate installs no
//! subscriber.

pub mod adapter;
pub mod cancel;
pub mod chain;
pub mod comparator;
pub mod config;
pub mod decomposer;
pub mod domain;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod portfolio;
pub mod quote_client;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod routing_client;

// Adapters and aggregation
pub use adapter::{AdapterError, BalancesFuture, ProtocolAdapter, RegistryAdapter};
pub use portfolio::{PortfolioAggregator, PortfolioSummary, PositionLine};

// Cancellation
pub use cancel::{CancelSignal, Cancelled};

// Chain access
pub use chain::{
    ChainFuture, ChainReadError, ChainReadErrorKind, ChainReader, EarnedReward,
    InMemoryChainReader, PoolReserves, RetryingChainReader,
};

// Comparison
pub use comparator::{
    AggregatorCandidate, AggregatorComparator, Backend, Comparison, ComparatorConfig,
    ComparatorError, CostBudget, RedemptionRouter,
};

// Configuration and wiring
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};

// Decomposition
pub use decomposer::{
    reconcile, DecomposeError, DecompositionStrategy, PositionDecomposer, SanityFloor,
    StrategyRegistry, Valuation,
};

// Domain models
pub use domain::{
    Address, AmountError, ConversionMethod, ConversionResult, Instrument, InstrumentClass,
    InstrumentKind, Leg, Network, NetworkBalances, Position, ProtocolBalances, Quote, RewardEntry,
    Token,
};

// Error types
pub use error::{CoreError, ValidationError};

// HTTP client types
pub use http_client::{
    HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, MockHttpClient,
    ReqwestHttpClient,
};

// Venue clients
pub use quote_client::{QuoteClient, QuoteError, QuoteRequest, QuoteVenueConfig, SpotPricer};
pub use routing_client::{
    RouteKind, RouteQuote, RouteRequest, RouteSource, RoutingClient, RoutingError,
    RoutingVenueConfig,
};

// Pacing and retry
pub use rate_limiter::{LoadTier, RateLimitError, RateLimiter, RateLimiterConfig, RateLimiterState};
pub use retry::{Backoff, ChainReadRetryPolicy, NetworkRetryPolicy, StatusClass};

// Registry
pub use registry::TokenRegistry;
