use std::sync::Arc;

use tracing::info;

use crate::adapter::{ProtocolAdapter, RegistryAdapter};
use crate::cancel::CancelSignal;
use crate::chain::{ChainReader, RetryingChainReader};
use crate::comparator::AggregatorComparator;
use crate::config::EngineConfig;
use crate::decomposer::PositionDecomposer;
use crate::domain::ConversionResult;
use crate::error::ValidationError;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::portfolio::PortfolioAggregator;
use crate::quote_client::{QuoteClient, QuoteRequest};
use crate::rate_limiter::RateLimiter;
use crate::registry::TokenRegistry;
use crate::routing_client::RoutingClient;

/// Builder that wires one shared rate limiter, both venue clients, the
/// comparator and the decomposer around a registry and a chain reader.
///
/// # Example
///
/// ```rust,ignore
/// use valor_core::{EngineBuilder, EngineConfig, TokenRegistry};
///
/// let engine = EngineBuilder::new()
///     .with_config(EngineConfig::from_env()?)
///     .with_registry(TokenRegistry::from_path("tokens.json")?)
///     .with_chain_reader(Arc::new(my_reader))
///     .build()?;
///
/// let summary = engine.portfolio().aggregate(&holder, &CancelSignal::new()).await?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<TokenRegistry>>,
    chain: Option<Arc<dyn ChainReader>>,
    http: Option<Arc<dyn HttpClient>>,
    fixed_time: Option<i64>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: TokenRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Reads are wrapped with the configured chain-read retry policy at build time.
    pub fn with_chain_reader(mut self, chain: Arc<dyn ChainReader>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Replaces the reqwest transport, e.g. with a scripted client in tests.
    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Pins valuation time (unix seconds) for maturity checks.
    pub fn with_fixed_time(mut self, now: i64) -> Self {
        self.fixed_time = Some(now);
        self
    }

    pub fn build(self) -> Result<Engine, ValidationError> {
        let registry = self
            .registry
            .ok_or(ValidationError::MissingComponent { component: "token registry" })?;
        let raw_chain = self
            .chain
            .ok_or(ValidationError::MissingComponent { component: "chain reader" })?;
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()) as Arc<dyn HttpClient>);
        let config = self.config;

        let chain: Arc<dyn ChainReader> = Arc::new(RetryingChainReader::with_policy(
            raw_chain,
            config.chain_retry.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));
        let quote_client = Arc::new(QuoteClient::new(
            Arc::clone(&http),
            Arc::clone(&limiter),
            config.quote_venue.clone(),
        ));
        let routing_client = Arc::new(RoutingClient::new(http, config.routing_venue.clone()));
        let comparator = Arc::new(AggregatorComparator::new(routing_client, config.comparator.clone()));

        let mut decomposer = PositionDecomposer::new(
            Arc::clone(&registry),
            Arc::clone(&chain),
            quote_client.clone(),
            comparator.clone(),
        )
        .with_sanity_floors(config.sanity_floors.clone())
        .with_max_depth(config.max_depth);
        if let Some(now) = self.fixed_time {
            decomposer = decomposer.with_fixed_time(now);
        }

        info!(
            networks = registry.networks().count(),
            protocols = registry.protocols().len(),
            "valuation engine ready"
        );
        Ok(Engine {
            config,
            registry,
            chain,
            limiter,
            quote_client,
            comparator,
            decomposer: Arc::new(decomposer),
        })
    }
}

/// A wired valuation engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<TokenRegistry>,
    chain: Arc<dyn ChainReader>,
    limiter: Arc<RateLimiter>,
    quote_client: Arc<QuoteClient>,
    comparator: Arc<AggregatorComparator>,
    decomposer: Arc<PositionDecomposer>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    /// The single limiter shared by every venue-A call.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn quote_client(&self) -> &Arc<QuoteClient> {
        &self.quote_client
    }

    pub fn comparator(&self) -> &Arc<AggregatorComparator> {
        &self.comparator
    }

    pub fn decomposer(&self) -> &Arc<PositionDecomposer> {
        &self.decomposer
    }

    /// Adapter for a protocol tag declared in the registry.
    pub fn adapter(&self, protocol: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.registry.protocols().contains(protocol).then(|| {
            Arc::new(RegistryAdapter::new(
                protocol,
                Arc::clone(&self.decomposer),
                Arc::clone(&self.chain),
                self.quote_client.clone(),
            )) as Arc<dyn ProtocolAdapter>
        })
    }

    /// Aggregator over every protocol declared in the registry.
    pub fn portfolio(&self) -> PortfolioAggregator {
        let adapters = self
            .registry
            .protocols()
            .into_iter()
            .filter_map(|protocol| self.adapter(protocol))
            .collect();
        let reference_decimals = self
            .registry
            .networks()
            .find_map(|network| self.registry.reference_asset(network))
            .map_or(6, |token| token.decimals);
        PortfolioAggregator::new(adapters).with_reference_decimals(reference_decimals)
    }

    /// Batch-quotes with the configured batch size and inter-batch delay.
    pub async fn quote_all(&self, requests: &[QuoteRequest], cancel: &CancelSignal) -> Vec<ConversionResult> {
        self.quote_client
            .quote_batch(requests, self.config.batch_size, self.config.batch_delay, cancel)
            .await
    }
}
