use std::env;
use std::time::Duration;

use crate::comparator::ComparatorConfig;
use crate::decomposer::{SanityFloor, DEFAULT_MAX_DEPTH};
use crate::domain::Address;
use crate::error::ValidationError;
use crate::quote_client::QuoteVenueConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::ChainReadRetryPolicy;
use crate::routing_client::RoutingVenueConfig;

/// Engine-wide settings. `Default` carries the production values.
///
/// # Environment Variables
///
/// | Variable | Overrides |
/// |----------|-----------|
/// | `VALOR_QUOTE_API_URL` | quote venue base URL |
/// | `VALOR_ROUTING_API_URL` | routing venue base URL |
/// | `VALOR_MIN_DELAY_MS` | rate limiter minimum spacing |
/// | `VALOR_HTTP_TIMEOUT_MS` | per-request timeout for both venues |
/// | `VALOR_TX_ORIGIN` | `receiver`/`txOrigin` sent to the routing venue |
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub rate_limiter: RateLimiterConfig,
    pub quote_venue: QuoteVenueConfig,
    pub routing_venue: RoutingVenueConfig,
    pub comparator: ComparatorConfig,
    pub chain_retry: ChainReadRetryPolicy,
    pub sanity_floors: Vec<SanityFloor>,
    pub max_depth: usize,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig::default(),
            quote_venue: QuoteVenueConfig::default(),
            routing_venue: RoutingVenueConfig::default(),
            comparator: ComparatorConfig::default(),
            chain_retry: ChainReadRetryPolicy::default(),
            sanity_floors: SanityFloor::defaults(),
            max_depth: DEFAULT_MAX_DEPTH,
            batch_size: 5,
            batch_delay: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `VALOR_*` environment variables.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `VALOR_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("VALOR_QUOTE_API_URL") {
            config.quote_venue.base_url = url;
        }
        if let Some(url) = lookup("VALOR_ROUTING_API_URL") {
            config.routing_venue.base_url = url;
        }
        if let Some(raw) = lookup("VALOR_MIN_DELAY_MS") {
            config.rate_limiter.min_delay = Duration::from_millis(parse_millis("VALOR_MIN_DELAY_MS", &raw)?);
        }
        if let Some(raw) = lookup("VALOR_HTTP_TIMEOUT_MS") {
            let timeout_ms = parse_millis("VALOR_HTTP_TIMEOUT_MS", &raw)?;
            if timeout_ms == 0 {
                return Err(ValidationError::NonPositiveValue {
                    field: "VALOR_HTTP_TIMEOUT_MS",
                });
            }
            config.quote_venue.timeout_ms = timeout_ms;
            config.routing_venue.timeout_ms = timeout_ms;
        }
        if let Some(raw) = lookup("VALOR_TX_ORIGIN") {
            config.routing_venue.tx_origin = Some(Address::parse(&raw)?);
        }

        Ok(config)
    }
}

fn parse_millis(key: &'static str, raw: &str) -> Result<u64, ValidationError> {
    raw.trim()
        .parse()
        .map_err(|_| ValidationError::InvalidConfig {
            key,
            value: raw.to_owned(),
        })
}
