mod support;

use std::sync::Arc;

use rust_decimal_macros::dec;
use support::*;
use valor_core::{
    CancelSignal, ConversionMethod, DecomposeError, InMemoryChainReader, Instrument, Network,
    PoolReserves, PositionDecomposer,
};

const NOW: i64 = 1_700_000_000;
const FUTURE: i64 = 1_800_000_000;
const PAST: i64 = 1_600_000_000;

struct Fixture {
    pricer: Arc<ScriptedPricer>,
    router: Arc<ScriptedRouter>,
    chain: Arc<InMemoryChainReader>,
    decomposer: PositionDecomposer,
}

impl Fixture {
    fn new(chain: InMemoryChainReader, pricer: ScriptedPricer, router: ScriptedRouter, maturity: i64) -> Self {
        let pricer = Arc::new(pricer);
        let router = Arc::new(router);
        let chain = Arc::new(chain);
        let decomposer = PositionDecomposer::new(
            Arc::new(registry(maturity)),
            chain.clone(),
            pricer.clone(),
            router.clone(),
        )
        .with_fixed_time(NOW);
        Self {
            pricer,
            router,
            chain,
            decomposer,
        }
    }

    fn instrument(&self, network: Network, symbol: &str) -> Instrument {
        self.decomposer
            .registry()
            .by_symbol(network, symbol)
            .cloned()
            .expect("instrument declared")
    }
}

fn stable_pricer() -> ScriptedPricer {
    ScriptedPricer::new()
        .with_rate(Network::Ethereum, "GHO", dec!(1))
        .with_rate(Network::Ethereum, "CRV", dec!(0.5))
        .with_rate(Network::Ethereum, "USDe", dec!(1))
        .with_rate(Network::Ethereum, "SY-USDe", dec!(0.98))
        .with_rate(Network::Ethereum, "sGHO", dec!(1.04))
}

/// GHO-USDC pool with 1,000,000 shares over 500,000 GHO and 500,000 USDC.
fn gho_usdc_pool() -> InMemoryChainReader {
    InMemoryChainReader::new().with_pool(
        Network::Ethereum,
        &addr('7'),
        PoolReserves {
            total_supply: units(1_000_000, 18),
            legs: vec![
                (addr('1'), units(500_000, 18)),
                (address(USDC_ETH), units(500_000, 6)),
            ],
        },
    )
}

// ============================================================================
// Share math
// ============================================================================

#[tokio::test]
async fn when_pool_share_is_decomposed_system_takes_exact_pro_rata_legs() {
    // Given: supply 1,000,000, leg outstanding 500,000, holder 100,000
    let chain = InMemoryChainReader::new().with_pool(
        Network::Ethereum,
        &addr('9'),
        PoolReserves {
            total_supply: 1_000_000,
            legs: vec![(addr('1'), 500_000), (addr('2'), 500_000)],
        },
    );
    let fixture = Fixture::new(chain, stable_pricer(), ScriptedRouter::failing(), FUTURE);
    let pool = fixture.instrument(Network::Ethereum, "GHO-CRV");

    // When: valuing the holder's shares
    let valuation = fixture
        .decomposer
        .value(&pool, 100_000, &holder(), &CancelSignal::new())
        .await
        .expect("legs priced");

    // Then: each leg is exactly 50,000
    let legs: Vec<(&str, u128)> = valuation
        .legs
        .iter()
        .map(|leg| (leg.token.symbol.as_str(), leg.amount))
        .collect();
    assert_eq!(legs, vec![("GHO", 50_000), ("CRV", 50_000)]);
    assert_eq!(fixture.router.calls(), 0);
}

#[tokio::test]
async fn when_pool_reserves_exceed_decimal_precision_system_still_splits_legs() {
    // Given: reserves of 10^29 per leg, past what a 96-bit decimal mantissa holds
    let reserve = 10_u128.pow(29);
    let chain = InMemoryChainReader::new().with_pool(
        Network::Ethereum,
        &addr('9'),
        PoolReserves {
            total_supply: 10_u128.pow(20),
            legs: vec![(addr('1'), reserve), (addr('2'), reserve)],
        },
    );
    let fixture = Fixture::new(chain, stable_pricer(), ScriptedRouter::failing(), FUTURE);
    let pool = fixture.instrument(Network::Ethereum, "GHO-CRV");

    // When: valuing 1% of the supply
    let valuation = fixture
        .decomposer
        .value(&pool, 10_u128.pow(18), &holder(), &CancelSignal::new())
        .await
        .expect("legs priced");

    // Then: each leg is exactly 10^27 and the legs are priced, not rejected
    let legs: Vec<u128> = valuation.legs.iter().map(|leg| leg.amount).collect();
    assert_eq!(legs, vec![10_u128.pow(27), 10_u128.pow(27)]);
    assert_eq!(valuation.result.method, ConversionMethod::Fallback);
    assert_eq!(valuation.result.amount, units(1_500_000_000, 6));
    assert_eq!(fixture.router.calls(), 0);
}

#[tokio::test]
async fn when_pool_direct_route_fails_system_sums_priced_legs() {
    // Given: 10% of the pool and a routing venue that cannot price it
    let fixture = Fixture::new(gho_usdc_pool(), stable_pricer(), ScriptedRouter::failing(), FUTURE);
    let pool = fixture.instrument(Network::Ethereum, "GHO-USDC");

    // When: valuing
    let valuation = fixture
        .decomposer
        .value(&pool, units(100_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("decomposition priced");

    // Then: 50,000 GHO + 50,000 USDC
    assert_eq!(valuation.result.amount, units(100_000, 6));
    assert_eq!(valuation.result.method, ConversionMethod::Fallback);
    assert_eq!(valuation.direct_amount, None);
    assert_eq!(valuation.decomposed_amount, Some(units(100_000, 6)));
    assert_eq!(fixture.router.calls(), 1);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn when_direct_quote_is_larger_system_reports_it_as_direct() {
    // Given: direct 101,000 vs decomposed 100,000
    let fixture = Fixture::new(
        gho_usdc_pool(),
        stable_pricer(),
        ScriptedRouter::returning(units(101_000, 6)),
        FUTURE,
    );
    let pool = fixture.instrument(Network::Ethereum, "GHO-USDC");

    // When: valuing
    let valuation = fixture
        .decomposer
        .value(&pool, units(100_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("both paths priced");

    // Then: direct kept, delta recorded
    assert_eq!(valuation.result.amount, units(101_000, 6));
    assert_eq!(valuation.result.method, ConversionMethod::Direct);
    assert_eq!(valuation.decomposed_amount, Some(units(100_000, 6)));
    assert_eq!(valuation.delta_pct, Some(dec!(1)));
    assert_eq!(valuation.legs.len(), 2);
}

#[tokio::test]
async fn when_decomposition_is_larger_system_reports_it_as_fallback() {
    // Given: direct 90,000 vs decomposed 100,000
    let fixture = Fixture::new(
        gho_usdc_pool(),
        stable_pricer(),
        ScriptedRouter::returning(units(90_000, 6)),
        FUTURE,
    );
    let pool = fixture.instrument(Network::Ethereum, "GHO-USDC");

    // When: valuing
    let valuation = fixture
        .decomposer
        .value(&pool, units(100_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("both paths priced");

    // Then: decomposition kept
    assert_eq!(valuation.result.amount, units(100_000, 6));
    assert_eq!(valuation.result.method, ConversionMethod::Fallback);
    assert_eq!(valuation.direct_amount, Some(units(90_000, 6)));
    assert_eq!(valuation.delta_pct, Some(dec!(-10)));
}

#[tokio::test]
async fn when_valuing_vault_share_system_reconciles_spot_against_conversion() {
    // Given: 1.05 GHO per sGHO on-chain, spot at 1.04
    let chain = InMemoryChainReader::new().with_vault_rate(Network::Ethereum, &addr('6'), 105, 100);
    let fixture = Fixture::new(chain, stable_pricer(), ScriptedRouter::failing(), FUTURE);
    let vault = fixture.instrument(Network::Ethereum, "sGHO");

    // When: valuing 1,000 sGHO
    let valuation = fixture
        .decomposer
        .value(&vault, units(1_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("priced");

    // Then: the on-chain conversion is larger and wins
    assert_eq!(valuation.legs[0].token.symbol, "GHO");
    assert_eq!(valuation.legs[0].amount, units(1_050, 18));
    assert_eq!(valuation.direct_amount, Some(units(1_040, 6)));
    assert_eq!(valuation.result.amount, units(1_050, 6));
    assert_eq!(valuation.result.method, ConversionMethod::Fallback);
}

#[tokio::test]
async fn when_decomposition_fails_system_keeps_the_direct_value() {
    // Given: legs nested deeper than the decomposer allows
    let chain = InMemoryChainReader::new().with_vault_rate(Network::Ethereum, &addr('6'), 105, 100);
    let fixture = Fixture::new(chain, stable_pricer(), ScriptedRouter::failing(), FUTURE);
    let decomposer = fixture.decomposer.with_max_depth(0);
    let vault = decomposer
        .registry()
        .by_symbol(Network::Ethereum, "sGHO")
        .cloned()
        .expect("declared");

    // When: valuing
    let valuation = decomposer
        .value(&vault, units(1_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("direct priced");

    // Then: spot value stands alone
    assert_eq!(valuation.result.amount, units(1_040, 6));
    assert_eq!(valuation.result.method, ConversionMethod::Direct);
    assert_eq!(valuation.decomposed_amount, None);
}

// ============================================================================
// Principal tokens
// ============================================================================

#[tokio::test]
async fn when_principal_token_is_unmatured_system_uses_market_quote_only() {
    // Given: a market quote of 990 USDC for 1,000 PT
    let fixture = Fixture::new(
        InMemoryChainReader::new(),
        stable_pricer(),
        ScriptedRouter::returning(units(990, 6)),
        FUTURE,
    );
    let pt = fixture.instrument(Network::Ethereum, "PT-USDe");

    // When: valuing
    let valuation = fixture
        .decomposer
        .value(&pt, units(1_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("market priced");

    // Then: par value never overrides the discount
    assert_eq!(valuation.result.amount, units(990, 6));
    assert_eq!(valuation.result.method, ConversionMethod::Direct);
    assert!(valuation.legs.is_empty());
    assert_eq!(fixture.pricer.calls_for("SY-USDe"), 0);
}

#[tokio::test]
async fn when_unmatured_market_quote_fails_system_falls_back_to_yield_wrapper() {
    // Given: the market cannot be quoted
    let fixture = Fixture::new(
        InMemoryChainReader::new(),
        stable_pricer(),
        ScriptedRouter::failing(),
        FUTURE,
    );
    let pt = fixture.instrument(Network::Ethereum, "PT-USDe");

    // When: valuing
    let valuation = fixture
        .decomposer
        .value(&pt, units(1_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("wrapper priced");

    // Then: 1:1 into SY-USDe at its spot rate
    assert_eq!(valuation.legs[0].token.symbol, "SY-USDe");
    assert_eq!(valuation.legs[0].amount, units(1_000, 18));
    assert_eq!(valuation.result.amount, units(980, 6));
    assert_eq!(valuation.result.method, ConversionMethod::Fallback);
}

#[tokio::test]
async fn when_principal_token_has_matured_system_redeems_into_underlying() {
    // Given: maturity already passed
    let fixture = Fixture::new(
        InMemoryChainReader::new(),
        stable_pricer(),
        ScriptedRouter::returning(units(1, 6)),
        PAST,
    );
    let pt = fixture.instrument(Network::Ethereum, "PT-USDe");

    // When: valuing
    let valuation = fixture
        .decomposer
        .value(&pt, units(1_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("underlying priced");

    // Then: no market quote; one underlying leg at the same amount
    assert_eq!(fixture.router.calls(), 0);
    assert_eq!(valuation.legs[0].token.symbol, "USDe");
    assert_eq!(valuation.legs[0].amount, units(1_000, 18));
    assert_eq!(valuation.result.amount, units(1_000, 6));
}

// ============================================================================
// Sanity floors
// ============================================================================

#[tokio::test]
async fn when_rate_is_below_floor_system_requotes_on_secondary_network() {
    // Given: USR quotes 0.5 on base but 0.99 on ethereum
    let pricer = stable_pricer()
        .with_rate(Network::Base, "USR", dec!(0.5))
        .with_rate(Network::Ethereum, "USR", dec!(0.99));
    let fixture = Fixture::new(InMemoryChainReader::new(), pricer, ScriptedRouter::failing(), FUTURE);
    let usr = fixture.instrument(Network::Base, "USR");

    // When: valuing 1,000 USR on base
    let valuation = fixture
        .decomposer
        .value(&usr, units(1_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("priced");

    // Then: the ethereum rate is applied to the base amount
    assert_eq!(valuation.result.amount, units(990, 6));
    assert_eq!(valuation.result.rate, dec!(0.99));
    assert!(valuation.result.note.contains("ethereum"));
    assert_eq!(fixture.pricer.calls_for("USR"), 2);
}

#[tokio::test]
async fn when_secondary_rate_is_worse_system_keeps_primary() {
    let pricer = stable_pricer()
        .with_rate(Network::Base, "USR", dec!(0.5))
        .with_rate(Network::Ethereum, "USR", dec!(0.4));
    let fixture = Fixture::new(InMemoryChainReader::new(), pricer, ScriptedRouter::failing(), FUTURE);
    let usr = fixture.instrument(Network::Base, "USR");

    let valuation = fixture
        .decomposer
        .value(&usr, units(1_000, 18), &holder(), &CancelSignal::new())
        .await
        .expect("priced");

    assert_eq!(valuation.result.amount, units(500, 6));
    assert_eq!(valuation.result.rate, dec!(0.5));
}

// ============================================================================
// Failures and edge cases
// ============================================================================

#[tokio::test]
async fn when_a_leg_is_unpriced_system_fails_every_path() {
    // Given: a pool without a direct route whose CRV leg cannot be priced
    let chain = InMemoryChainReader::new().with_pool(
        Network::Ethereum,
        &addr('9'),
        PoolReserves {
            total_supply: units(100, 18),
            legs: vec![(addr('1'), units(50, 18)), (addr('2'), units(50, 18))],
        },
    );
    let pricer = ScriptedPricer::new().with_rate(Network::Ethereum, "GHO", dec!(1));
    let fixture = Fixture::new(chain, pricer, ScriptedRouter::failing(), FUTURE);
    let pool = fixture.instrument(Network::Ethereum, "GHO-CRV");

    // When: valuing
    let error = fixture
        .decomposer
        .value(&pool, units(10, 18), &holder(), &CancelSignal::new())
        .await
        .expect_err("CRV has no price");

    // Then: reported, not panicked
    assert!(matches!(error, DecomposeError::AllPathsFailed { .. }));
    assert!(error.to_string().contains("no direct route"));
}

#[tokio::test]
async fn when_amount_is_zero_system_values_it_without_calls() {
    let fixture = Fixture::new(gho_usdc_pool(), stable_pricer(), ScriptedRouter::returning(1), FUTURE);
    let pool = fixture.instrument(Network::Ethereum, "GHO-USDC");

    let valuation = fixture
        .decomposer
        .value(&pool, 0, &holder(), &CancelSignal::new())
        .await
        .expect("zero is valid");

    assert_eq!(valuation.result.amount, 0);
    assert!(valuation.result.is_priced());
    assert_eq!(fixture.router.calls(), 0);
    assert!(fixture.pricer.calls().is_empty());
    assert_eq!(fixture.chain.read_count(), 0);
}

#[tokio::test]
async fn when_valuation_is_cancelled_system_returns_cancelled() {
    let fixture = Fixture::new(gho_usdc_pool(), stable_pricer(), ScriptedRouter::failing(), FUTURE);
    let pool = fixture.instrument(Network::Ethereum, "GHO-USDC");
    let cancel = CancelSignal::new();
    cancel.cancel();

    let error = fixture
        .decomposer
        .value(&pool, units(1, 18), &holder(), &cancel)
        .await
        .expect_err("cancelled up front");

    assert!(matches!(error, DecomposeError::Cancelled(_)));
    assert_eq!(fixture.router.calls(), 0);
}
