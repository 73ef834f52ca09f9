//! Venue B: market-scoped routing quotes served through pluggable aggregator backends.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Address, Network};
use crate::http_client::{HttpClient, HttpError, HttpRequest, DEFAULT_TIMEOUT_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingVenueConfig {
    pub base_url: String,
    pub slippage: String,
    pub timeout_ms: u64,
    /// Overrides the request receiver as both `receiver` and `txOrigin`.
    pub tx_origin: Option<Address>,
}

impl Default for RoutingVenueConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api-v2.pendle.finance/core/v1"),
            slippage: String::from("0.01"),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tx_origin: None,
        }
    }
}

/// Market action being priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Burn pool shares for `token_out`.
    RemoveLiquidity,
    /// Swap `token_in` for `token_out` through the market.
    Swap,
}

impl RouteKind {
    pub const fn path(self) -> &'static str {
        match self {
            Self::RemoveLiquidity => "remove-liquidity",
            Self::Swap => "swap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub network: Network,
    pub market: Address,
    pub kind: RouteKind,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: u128,
    pub receiver: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteQuote {
    pub amount_out: u128,
    pub price_impact: Option<Decimal>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("transport error: {0}")]
    Transport(#[from] HttpError),
    #[error("routing venue returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed routing response: {0}")]
    Malformed(String),
}

pub type RouteFuture<'a> = Pin<Box<dyn Future<Output = Result<RouteQuote, RoutingError>> + Send + 'a>>;

/// One priced route through a named backend. `None` disables aggregation.
pub trait RouteSource: Send + Sync {
    fn route<'a>(&'a self, request: &'a RouteRequest, backend: Option<&'a str>) -> RouteFuture<'a>;
}

#[derive(Debug, Deserialize)]
struct RouteEnvelope {
    data: RoutePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutePayload {
    amount_out: String,
    #[serde(default)]
    price_impact: Option<Decimal>,
}

pub struct RoutingClient {
    http: Arc<dyn HttpClient>,
    config: RoutingVenueConfig,
}

impl RoutingClient {
    pub fn new(http: Arc<dyn HttpClient>, config: RoutingVenueConfig) -> Self {
        Self { http, config }
    }

    pub fn build_request(&self, request: &RouteRequest, backend: Option<&str>) -> HttpRequest {
        let url = format!(
            "{}/{}/markets/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            request.network.chain_id(),
            request.market,
            request.kind.path()
        );
        let origin = self
            .config
            .tx_origin
            .as_ref()
            .unwrap_or(&request.receiver)
            .to_string();

        let mut http_request = HttpRequest::get(url)
            .with_header("accept", "application/json")
            .with_query("receiver", origin.clone())
            .with_query("slippage", self.config.slippage.clone())
            .with_query("enableAggregator", if backend.is_some() { "true" } else { "false" })
            .with_query("amountIn", request.amount_in.to_string());
        if request.kind == RouteKind::Swap {
            http_request = http_request.with_query("tokenIn", request.token_in.to_string());
        }
        http_request = http_request
            .with_query("tokenOut", request.token_out.to_string())
            .with_query("txOrigin", origin);
        if let Some(backend) = backend {
            http_request = http_request.with_query("aggregators", backend);
        }
        http_request.with_timeout_ms(self.config.timeout_ms)
    }
}

impl RouteSource for RoutingClient {
    fn route<'a>(&'a self, request: &'a RouteRequest, backend: Option<&'a str>) -> RouteFuture<'a> {
        Box::pin(async move {
            let response = self.http.execute(self.build_request(request, backend)).await?;
            if !response.is_success() {
                return Err(RoutingError::Status {
                    status: response.status,
                    body: response.body,
                });
            }

            let envelope: RouteEnvelope = serde_json::from_str(&response.body)
                .map_err(|e| RoutingError::Malformed(e.to_string()))?;
            let amount_out = envelope.data.amount_out.parse::<u128>().map_err(|_| {
                RoutingError::Malformed(format!(
                    "amountOut is not an integer: '{}'",
                    envelope.data.amount_out
                ))
            })?;
            debug!(
                market = %request.market,
                route = request.kind.path(),
                backend = backend.unwrap_or("none"),
                amount_out = %amount_out,
                "routing quote"
            );

            Ok(RouteQuote {
                amount_out,
                price_impact: envelope.data.price_impact,
            })
        })
    }
}
