//! Venue A: single-backend sell quotes against the reference asset.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::domain::amount::{self, AmountError};
use crate::domain::{Address, ConversionMethod, ConversionResult, Network, Quote, Token};
use crate::http_client::{HttpClient, HttpError, HttpRequest, DEFAULT_TIMEOUT_MS};
use crate::rate_limiter::{RateLimitError, RateLimiter};
use crate::retry::{NetworkRetryPolicy, StatusClass};

const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

/// Venue error types that mean "the amount is too small to route", recovered by
/// re-quoting a reference amount.
const REFERENCE_FALLBACK_ERRORS: [&str; 2] = ["SellAmountDoesNotCoverFee", "NoLiquidity"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteVenueConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    /// Whole tokens sold when re-quoting for price discovery.
    pub reference_amount_tokens: u128,
    /// Seconds a quote order would stay valid.
    pub valid_for_secs: i64,
    pub retry: NetworkRetryPolicy,
}

impl Default for QuoteVenueConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.cow.fi"),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            reference_amount_tokens: 1_000,
            valid_for_secs: 3_600,
            retry: NetworkRetryPolicy::default(),
        }
    }
}

/// Sell `amount` of `sell` for `buy` on `network`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub network: Network,
    pub sell: Token,
    pub buy: Token,
    pub amount: u128,
}

impl QuoteRequest {
    pub fn new(sell: Token, buy: Token, amount: u128) -> Self {
        Self {
            network: sell.network,
            sell,
            buy,
            amount,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.sell.network == self.buy.network && self.sell.address == self.buy.address
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuoteError {
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error("venue kept throttling after {attempts} attempts")]
    ThrottlingExhausted { attempts: u32 },
    #[error("venue rejected quote with status {status}: {error_type}: {description}")]
    Rejected {
        status: u16,
        error_type: String,
        description: String,
    },
    #[error("transport error: {0}")]
    Transport(#[from] HttpError),
    #[error("malformed venue response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Amount(#[from] AmountError),
}

impl QuoteError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RateLimit(_) => "rate_limited",
            Self::ThrottlingExhausted { .. } => "throttled",
            Self::Rejected { .. } => "rejected",
            Self::Transport(_) => "transport",
            Self::Malformed(_) => "malformed_response",
            Self::Amount(_) => "amount",
        }
    }

    /// Whether a reference-amount quote may still price the position.
    pub fn triggers_reference_fallback(&self) -> bool {
        match self {
            Self::ThrottlingExhausted { .. } => true,
            Self::Rejected { error_type, .. } => {
                REFERENCE_FALLBACK_ERRORS.contains(&error_type.as_str())
            }
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBody<'a> {
    sell_token: &'a str,
    buy_token: &'a str,
    sell_amount_before_fee: String,
    from: &'static str,
    receiver: &'static str,
    valid_to: i64,
    app_data: &'static str,
    partially_fillable: bool,
    sell_token_balance: &'static str,
    buy_token_balance: &'static str,
    kind: &'static str,
    price_quality: &'static str,
}

#[derive(Debug, Deserialize)]
struct QuoteEnvelope {
    quote: QuotePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotePayload {
    buy_amount: String,
    sell_amount: String,
    #[serde(default)]
    fee_amount: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VenueErrorBody {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    description: String,
}

pub type PriceFuture<'a> = Pin<Box<dyn Future<Output = ConversionResult> + Send + 'a>>;

/// Values a plain token amount in another token. Never fails: an unpriced
/// amount comes back as [`ConversionMethod::Failed`].
pub trait SpotPricer: Send + Sync {
    fn price<'a>(&'a self, request: &'a QuoteRequest, cancel: &'a CancelSignal) -> PriceFuture<'a>;
}

pub struct QuoteClient {
    http: Arc<dyn HttpClient>,
    limiter: Arc<RateLimiter>,
    config: QuoteVenueConfig,
}

impl QuoteClient {
    pub fn new(http: Arc<dyn HttpClient>, limiter: Arc<RateLimiter>, config: QuoteVenueConfig) -> Self {
        Self {
            http,
            limiter,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &QuoteVenueConfig {
        &self.config
    }

    /// Values `request.amount` of the sell token in the buy token.
    pub async fn get_quote(&self, request: &QuoteRequest, cancel: &CancelSignal) -> ConversionResult {
        if request.is_identity() {
            return identity(request.amount);
        }
        if request.amount == 0 {
            return ConversionResult {
                note: String::from("zero amount"),
                ..identity(0)
            };
        }

        let error = match self.fetch(request, request.amount, cancel).await {
            Ok(quote) => match direct_result(request, &quote) {
                Ok(result) => return result,
                Err(error) => QuoteError::from(error),
            },
            Err(error) => error,
        };

        if !error.triggers_reference_fallback() {
            warn!(
                symbol = %request.sell.symbol,
                network = %request.network,
                code = error.code(),
                error = %error,
                "quote failed"
            );
            return ConversionResult::failed(error.to_string());
        }

        info!(
            symbol = %request.sell.symbol,
            network = %request.network,
            reason = %error,
            reference_tokens = self.config.reference_amount_tokens as u64,
            "re-quoting with reference amount for price discovery"
        );
        match self.reference_quote(request, cancel).await {
            Ok(result) => result,
            Err(fallback_error) => {
                warn!(
                    symbol = %request.sell.symbol,
                    network = %request.network,
                    error = %fallback_error,
                    "reference quote failed"
                );
                ConversionResult::failed(format!("{error}; reference quote: {fallback_error}"))
            }
        }
    }

    /// Quotes `requests` in batches with a pause between batches. Output order
    /// matches input order.
    pub async fn quote_batch(
        &self,
        requests: &[QuoteRequest],
        batch_size: usize,
        batch_delay: Duration,
        cancel: &CancelSignal,
    ) -> Vec<ConversionResult> {
        self.limiter.adjust_for_load(requests.len());
        let mut results = Vec::with_capacity(requests.len());

        for (index, batch) in requests.chunks(batch_size.max(1)).enumerate() {
            if index > 0 && cancel.sleep(batch_delay).await.is_err() {
                break;
            }
            debug!(batch = index, size = batch.len(), "quoting batch");
            let quotes = batch.iter().map(|request| self.get_quote(request, cancel));
            results.extend(futures::future::join_all(quotes).await);
        }

        while results.len() < requests.len() {
            results.push(ConversionResult::failed("cancelled before quoting"));
        }
        results
    }

    async fn reference_quote(
        &self,
        request: &QuoteRequest,
        cancel: &CancelSignal,
    ) -> Result<ConversionResult, QuoteError> {
        let quote = self.fetch_reference(request, cancel).await?;
        let rate = amount::realized_rate(
            quote.sell_amount,
            request.sell.decimals,
            quote.buy_amount,
            request.buy.decimals,
        )?;
        let value = amount::apply_rate(request.amount, request.sell.decimals, rate, request.buy.decimals)?;

        Ok(ConversionResult {
            amount: value,
            price_impact: quote.price_impact,
            method: ConversionMethod::Fallback,
            source: quote.source,
            rate,
            fee_percentage: None,
            note: format!(
                "approximate: rate from reference amount of {} tokens",
                self.config.reference_amount_tokens
            ),
        })
    }

    /// Quote for `reference_amount_tokens` whole sell tokens, flagged as a fallback.
    async fn fetch_reference(
        &self,
        request: &QuoteRequest,
        cancel: &CancelSignal,
    ) -> Result<Quote, QuoteError> {
        let reference_amount = 10_u128
            .checked_pow(request.sell.decimals)
            .and_then(|unit| unit.checked_mul(self.config.reference_amount_tokens))
            .ok_or(AmountError::Overflow {
                context: "reference amount",
            })?;
        let quote = self.fetch(request, reference_amount, cancel).await?;
        Ok(Quote { fallback: true, ..quote })
    }

    /// One logical venue call: paced, retried on throttling, bounded.
    async fn fetch(&self, request: &QuoteRequest, sell_amount: u128, cancel: &CancelSignal) -> Result<Quote, QuoteError> {
        let policy = &self.config.retry;
        let url = format!(
            "{}/{}/api/v1/quote",
            self.config.base_url.trim_end_matches('/'),
            request.network.quote_api_slug()
        );
        let body = QuoteBody {
            sell_token: request.sell.address.as_str(),
            buy_token: request.buy.address.as_str(),
            sell_amount_before_fee: sell_amount.to_string(),
            from: Address::ZERO,
            receiver: Address::ZERO,
            valid_to: time::OffsetDateTime::now_utc().unix_timestamp() + self.config.valid_for_secs,
            app_data: ZERO_HASH,
            partially_fillable: false,
            sell_token_balance: "erc20",
            buy_token_balance: "erc20",
            kind: "sell",
            price_quality: "fast",
        };
        let http_request = HttpRequest::post(url)
            .with_json_body(&body)
            .map_err(|e| QuoteError::Malformed(e.to_string()))?
            .with_timeout_ms(self.config.timeout_ms);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.wait_if_needed(cancel).await?;
            let response = self.http.execute(http_request.clone()).await?;

            match policy.classify(response.status) {
                StatusClass::Success => {
                    self.limiter.record_success();
                    return parse_quote(request, &response.body);
                }
                StatusClass::Throttled => {
                    debug!(status = response.status, attempt, "quote venue throttled");
                    self.limiter
                        .record_failure(cancel)
                        .await
                        .map_err(RateLimitError::from)?;
                    if !policy.should_retry(attempt) {
                        return Err(QuoteError::ThrottlingExhausted { attempts: attempt });
                    }
                }
                StatusClass::Terminal => {
                    let body: VenueErrorBody = serde_json::from_str(&response.body).unwrap_or_default();
                    return Err(QuoteError::Rejected {
                        status: response.status,
                        error_type: body.error_type,
                        description: body.description,
                    });
                }
            }
        }
    }
}

impl SpotPricer for QuoteClient {
    fn price<'a>(&'a self, request: &'a QuoteRequest, cancel: &'a CancelSignal) -> PriceFuture<'a> {
        Box::pin(self.get_quote(request, cancel))
    }
}

fn identity(amount: u128) -> ConversionResult {
    ConversionResult {
        amount,
        price_impact: Some(Decimal::ZERO),
        method: ConversionMethod::Direct,
        source: String::from("identity"),
        rate: Decimal::ONE,
        fee_percentage: Some(Decimal::ZERO),
        note: String::from("reference asset"),
    }
}

/// `sell_amount` is what the venue will actually sell after fees, not the requested amount.
fn parse_quote(request: &QuoteRequest, body: &str) -> Result<Quote, QuoteError> {
    let envelope: QuoteEnvelope =
        serde_json::from_str(body).map_err(|e| QuoteError::Malformed(e.to_string()))?;
    let parse = |field: &str, raw: &str| {
        raw.parse::<u128>()
            .map_err(|_| QuoteError::Malformed(format!("{field} is not an integer: '{raw}'")))
    };

    let buy_amount = parse("buyAmount", &envelope.quote.buy_amount)?;
    let sell_amount = parse("sellAmount", &envelope.quote.sell_amount)?;
    let fee_amount = match envelope.quote.fee_amount.as_deref() {
        Some(raw) => parse("feeAmount", raw)?,
        None => 0,
    };

    Ok(Quote {
        sell_token: request.sell.address.clone(),
        buy_token: request.buy.address.clone(),
        sell_amount,
        buy_amount,
        fee_amount,
        price_impact: None,
        source: String::from("cow"),
        fallback: false,
    })
}

fn direct_result(request: &QuoteRequest, quote: &Quote) -> Result<ConversionResult, AmountError> {
    let rate = amount::realized_rate(
        quote.sell_amount,
        request.sell.decimals,
        quote.buy_amount,
        request.buy.decimals,
    )?;
    debug!(
        symbol = %request.sell.symbol,
        network = %request.network,
        buy_amount = %quote.buy_amount,
        %rate,
        "direct quote"
    );

    Ok(ConversionResult {
        amount: quote.buy_amount,
        price_impact: quote.price_impact,
        method: ConversionMethod::Direct,
        source: quote.source.clone(),
        rate,
        fee_percentage: fee_percentage(quote.fee_amount, request.amount),
        note: String::new(),
    })
}

fn fee_percentage(fee: u128, sell_amount: u128) -> Option<Decimal> {
    amount::ratio(fee, sell_amount)
        .ok()
        .map(|share| share * Decimal::ONE_HUNDRED)
}
