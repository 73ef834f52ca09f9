//! Shared fixtures for the behaviour suites.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use valor_core::comparator::CompareFuture;
use valor_core::domain::amount;
use valor_core::quote_client::PriceFuture;
use valor_core::{
    Address, CancelSignal, Comparison, ComparatorError, ConversionMethod, ConversionResult,
    HttpRequest, HttpResponse, Network, QuoteRequest, RateLimiter, RateLimiterConfig,
    RedemptionRouter, RouteQuote, RouteRequest, SpotPricer, Token, TokenRegistry,
};

pub const USDC_ETH: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
pub const USDC_BASE: &str = "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913";

pub fn addr(byte: char) -> Address {
    Address::parse(&format!("0x{}", byte.to_string().repeat(40))).expect("valid address")
}

pub fn address(raw: &str) -> Address {
    Address::parse(raw).expect("valid address")
}

pub fn token(network: Network, symbol: &str, address: Address, decimals: u32) -> Token {
    Token {
        network,
        symbol: symbol.to_owned(),
        address,
        decimals,
    }
}

pub fn usdc() -> Token {
    token(Network::Ethereum, "USDC", address(USDC_ETH), 6)
}

pub fn units(whole: u128, decimals: u32) -> u128 {
    whole * 10_u128.pow(decimals)
}

/// Limiter without spacing or jitter, for tests that do not measure pacing.
pub fn quiet_limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimiterConfig {
        min_delay: Duration::ZERO,
        jitter_min: Duration::ZERO,
        jitter_max: Duration::ZERO,
        ..RateLimiterConfig::default()
    }))
}

pub fn quote_body(sell_amount: u128, buy_amount: u128) -> String {
    format!(
        r#"{{"quote":{{"sellAmount":"{sell_amount}","buyAmount":"{buy_amount}","feeAmount":"0"}}}}"#
    )
}

/// Quote where the venue keeps `fee` out of the amount it actually sells.
pub fn quote_body_with_fee(sell_amount: u128, buy_amount: u128, fee: u128) -> String {
    format!(
        r#"{{"quote":{{"sellAmount":"{sell_amount}","buyAmount":"{buy_amount}","feeAmount":"{fee}"}}}}"#
    )
}

pub fn venue_error(status: u16, error_type: &str) -> HttpResponse {
    HttpResponse::new(
        status,
        format!(r#"{{"errorType":"{error_type}","description":"scripted"}}"#),
    )
}

pub fn route_body(amount_out: u128) -> String {
    format!(r#"{{"data":{{"amountOut":"{amount_out}","priceImpact":-0.0012}}}}"#)
}

/// JSON field of a recorded POST body.
pub fn body_field(request: &HttpRequest, field: &str) -> Option<String> {
    let body: serde_json::Value = serde_json::from_str(request.body.as_deref()?).ok()?;
    body.get(field)?.as_str().map(str::to_owned)
}

/// Responder pricing every sell token at a fixed rate keyed by its address.
pub fn rate_responder(
    rates: HashMap<String, (u32, Decimal)>,
) -> impl Fn(&HttpRequest) -> Option<Result<HttpResponse, valor_core::HttpError>> + Send + Sync + 'static {
    move |request| {
        let sell_token = body_field(request, "sellToken")?;
        let sell_amount: u128 = body_field(request, "sellAmountBeforeFee")?.parse().ok()?;
        let Some((decimals, rate)) = rates.get(&sell_token) else {
            return Some(Ok(venue_error(400, "UnsupportedToken")));
        };
        let buy = amount::apply_rate(sell_amount, *decimals, *rate, 6).ok()?;
        Some(Ok(HttpResponse::ok_json(quote_body(sell_amount, buy))))
    }
}

/// Spot pricer with fixed per-symbol rates against a 6-decimal reference.
#[derive(Default)]
pub struct ScriptedPricer {
    rates: HashMap<(Network, String), Decimal>,
    calls: Mutex<Vec<(Network, String)>>,
}

impl ScriptedPricer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, network: Network, symbol: &str, rate: Decimal) -> Self {
        self.rates.insert((network, symbol.to_owned()), rate);
        self
    }

    pub fn calls(&self) -> Vec<(Network, String)> {
        self.calls.lock().expect("pricer call log").clone()
    }

    pub fn calls_for(&self, symbol: &str) -> usize {
        self.calls().iter().filter(|(_, s)| s == symbol).count()
    }
}

impl SpotPricer for ScriptedPricer {
    fn price<'a>(&'a self, request: &'a QuoteRequest, _cancel: &'a CancelSignal) -> PriceFuture<'a> {
        Box::pin(async move {
            if request.is_identity() {
                return ConversionResult {
                    amount: request.amount,
                    price_impact: None,
                    method: ConversionMethod::Direct,
                    source: String::from("identity"),
                    rate: Decimal::ONE,
                    fee_percentage: None,
                    note: String::new(),
                };
            }
            self.calls
                .lock()
                .expect("pricer call log")
                .push((request.network, request.sell.symbol.clone()));

            let Some(rate) = self.rates.get(&(request.network, request.sell.symbol.clone())) else {
                return ConversionResult::failed("no scripted rate");
            };
            let value = amount::apply_rate(request.amount, request.sell.decimals, *rate, request.buy.decimals)
                .expect("scripted amounts fit");
            ConversionResult {
                amount: value,
                price_impact: None,
                method: ConversionMethod::Direct,
                source: String::from("scripted"),
                rate: *rate,
                fee_percentage: None,
                note: String::new(),
            }
        })
    }
}

/// Redemption router returning a fixed amount, or failing when unset.
#[derive(Default)]
pub struct ScriptedRouter {
    amount_out: Option<u128>,
    calls: AtomicUsize,
}

impl ScriptedRouter {
    pub fn returning(amount_out: u128) -> Self {
        Self {
            amount_out: Some(amount_out),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RedemptionRouter for ScriptedRouter {
    fn redeem<'a>(&'a self, _request: &'a RouteRequest, _cancel: &'a CancelSignal) -> CompareFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.amount_out {
                Some(amount_out) => Ok(Comparison {
                    winner: String::from("kyberswap"),
                    quote: RouteQuote {
                        amount_out,
                        price_impact: None,
                    },
                    candidates: Vec::new(),
                    cost_charged: 5,
                }),
                None => Err(ComparatorError::NoBackends),
            }
        })
    }
}

/// Ethereum + base registry covering every instrument kind.
pub fn registry_json(maturity: i64) -> String {
    format!(
        r#"{{
        "networks": {{
            "ethereum": {{
                "reference_asset": "USDC",
                "instruments": [
                    {{"symbol": "USDC", "address": "{USDC_ETH}", "decimals": 6, "kind": "plain_token", "protocol": "spot"}},
                    {{"symbol": "GHO", "address": "{gho}", "decimals": 18, "kind": "plain_token", "protocol": "spot"}},
                    {{"symbol": "CRV", "address": "{crv}", "decimals": 18, "kind": "plain_token", "protocol": "spot"}},
                    {{"symbol": "USR", "address": "{usr_eth}", "decimals": 18, "kind": "plain_token"}},
                    {{"symbol": "USDe", "address": "{usde}", "decimals": 18, "kind": "plain_token"}},
                    {{"symbol": "SY-USDe", "address": "{sy}", "decimals": 18, "kind": "plain_token"}},
                    {{"symbol": "sGHO", "address": "{sgho}", "decimals": 18, "protocol": "savings",
                      "kind": "vault_share", "asset": "{gho}"}},
                    {{"symbol": "GHO-USDC", "address": "{pool}", "decimals": 18, "protocol": "liquidity",
                      "kind": "liquidity_pool_share", "direct_route": true, "staking_contract": "{gauge}"}},
                    {{"symbol": "GHO-CRV", "address": "{pool_crv}", "decimals": 18,
                      "kind": "liquidity_pool_share", "direct_route": false}},
                    {{"symbol": "PT-USDe", "address": "{pt}", "decimals": 18, "protocol": "fixed",
                      "kind": "principal_token", "underlying": "{usde}", "standardized_yield": "{sy}",
                      "market": "{market}", "maturity": {maturity}}}
                ]
            }},
            "base": {{
                "reference_asset": "USDC",
                "instruments": [
                    {{"symbol": "USDC", "address": "{USDC_BASE}", "decimals": 6, "kind": "plain_token"}},
                    {{"symbol": "USR", "address": "{usr_base}", "decimals": 18, "kind": "plain_token", "protocol": "spot"}}
                ]
            }}
        }}
    }}"#,
        gho = addr('1'),
        crv = addr('2'),
        usr_eth = addr('3'),
        usde = addr('4'),
        sy = addr('5'),
        sgho = addr('6'),
        pool = addr('7'),
        gauge = addr('8'),
        pool_crv = addr('9'),
        pt = addr('a'),
        market = addr('b'),
        usr_base = addr('c'),
    )
}

pub fn registry(maturity: i64) -> TokenRegistry {
    TokenRegistry::from_json_str(&registry_json(maturity)).expect("valid registry")
}

pub fn holder() -> Address {
    addr('d')
}
