//! Read-only on-chain collaborator.
//!
//! The engine never talks to a node directly. Everything it needs from chain
//! state goes through [`ChainReader`], and [`RetryingChainReader`] layers the
//! chain-read retry policy on top of any implementation.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::cancel::{CancelSignal, Cancelled};
use crate::domain::{Address, Network};
use crate::retry::ChainReadRetryPolicy;

/// Provider error taxonomy used by [`ChainReadRetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainReadErrorKind {
    Timeout,
    Transport,
    /// Call reverted or the contract rejected the input.
    ContractLogic,
    /// Return data could not be decoded. Never retried.
    Decode,
    /// No such contract or state on this network.
    NotFound,
    /// Caller cancelled while the read was pending or backing off. Never retried.
    Cancelled,
}

impl ChainReadErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::ContractLogic => "contract_logic",
            Self::Decode => "decode",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Chain read error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReadError {
    kind: ChainReadErrorKind,
    message: String,
}

impl ChainReadError {
    pub fn new(kind: ChainReadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ChainReadErrorKind::Timeout, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ChainReadErrorKind::Transport, message)
    }

    pub fn contract_logic(message: impl Into<String>) -> Self {
        Self::new(ChainReadErrorKind::ContractLogic, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ChainReadErrorKind::Decode, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ChainReadErrorKind::NotFound, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ChainReadErrorKind::Cancelled, "cancelled by caller")
    }

    pub const fn kind(&self) -> ChainReadErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn code(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl Display for ChainReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "chain read failed ({}): {}", self.code(), self.message)
    }
}

impl std::error::Error for ChainReadError {}

impl From<Cancelled> for ChainReadError {
    fn from(_: Cancelled) -> Self {
        Self::cancelled()
    }
}

/// Outstanding reserves of a pool, keyed by leg token, plus its share supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReserves {
    pub total_supply: u128,
    /// In pool order.
    pub legs: Vec<(Address, u128)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarnedReward {
    pub token: Address,
    pub amount: u128,
}

pub type ChainFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ChainReadError>> + Send + 'a>>;

/// Read-only chain access.
pub trait ChainReader: Send + Sync {
    fn balance_of<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128>;

    fn total_supply<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128>;

    fn pool_reserves<'a>(
        &'a self,
        network: Network,
        pool: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, PoolReserves>;

    /// Vault share -> underlying asset conversion at current share price.
    fn convert_to_assets<'a>(
        &'a self,
        network: Network,
        vault: &'a Address,
        shares: u128,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128>;

    fn earned_rewards<'a>(
        &'a self,
        network: Network,
        staking_contract: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, Vec<EarnedReward>>;
}

impl<R: ChainReader + ?Sized> ChainReader for Arc<R> {
    fn balance_of<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        (**self).balance_of(network, token, holder, cancel)
    }

    fn total_supply<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        (**self).total_supply(network, token, cancel)
    }

    fn pool_reserves<'a>(
        &'a self,
        network: Network,
        pool: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, PoolReserves> {
        (**self).pool_reserves(network, pool, cancel)
    }

    fn convert_to_assets<'a>(
        &'a self,
        network: Network,
        vault: &'a Address,
        shares: u128,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        (**self).convert_to_assets(network, vault, shares, cancel)
    }

    fn earned_rewards<'a>(
        &'a self,
        network: Network,
        staking_contract: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, Vec<EarnedReward>> {
        (**self).earned_rewards(network, staking_contract, holder, cancel)
    }
}

/// Wraps a reader with [`ChainReadRetryPolicy`].
pub struct RetryingChainReader<R> {
    inner: R,
    policy: ChainReadRetryPolicy,
}

impl<R: ChainReader> RetryingChainReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_policy(inner, ChainReadRetryPolicy::default())
    }

    pub fn with_policy(inner: R, policy: ChainReadRetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn with_retry<'a, T, F>(
        &'a self,
        operation: &'static str,
        cancel: &'a CancelSignal,
        mut call: F,
    ) -> Result<T, ChainReadError>
    where
        F: FnMut() -> ChainFuture<'a, T>,
    {
        let mut retries = 0;
        loop {
            cancel.check()?;
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if self.policy.should_retry(error.kind(), retries) => {
                    let delay = self.policy.delay_for_retry(retries);
                    retries += 1;
                    warn!(
                        operation,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying chain read"
                    );
                    cancel.sleep(delay).await?;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl<R: ChainReader> ChainReader for RetryingChainReader<R> {
    fn balance_of<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        Box::pin(self.with_retry("balance_of", cancel, move || {
            self.inner.balance_of(network, token, holder, cancel)
        }))
    }

    fn total_supply<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        Box::pin(self.with_retry("total_supply", cancel, move || {
            self.inner.total_supply(network, token, cancel)
        }))
    }

    fn pool_reserves<'a>(
        &'a self,
        network: Network,
        pool: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, PoolReserves> {
        Box::pin(self.with_retry("pool_reserves", cancel, move || {
            self.inner.pool_reserves(network, pool, cancel)
        }))
    }

    fn convert_to_assets<'a>(
        &'a self,
        network: Network,
        vault: &'a Address,
        shares: u128,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        Box::pin(self.with_retry("convert_to_assets", cancel, move || {
            self.inner.convert_to_assets(network, vault, shares, cancel)
        }))
    }

    fn earned_rewards<'a>(
        &'a self,
        network: Network,
        staking_contract: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, Vec<EarnedReward>> {
        Box::pin(self.with_retry("earned_rewards", cancel, move || {
            self.inner.earned_rewards(network, staking_contract, holder, cancel)
        }))
    }
}

type Key = (Network, Address);

/// In-memory chain state for offline runs and tests.
///
/// Unset balances and rewards read as zero. Unset supplies, reserves and
/// vault rates fail with [`ChainReadErrorKind::NotFound`]. Vault rates are
/// stored as `(assets, shares)` and applied with truncation.
#[derive(Debug, Default)]
pub struct InMemoryChainReader {
    balances: HashMap<(Network, Address, Address), u128>,
    supplies: HashMap<Key, u128>,
    reserves: HashMap<Key, PoolReserves>,
    vault_rates: HashMap<Key, (u128, u128)>,
    rewards: HashMap<(Network, Address, Address), Vec<EarnedReward>>,
    failures: Mutex<HashMap<(&'static str, Address), Vec<ChainReadError>>>,
    reads: Mutex<u32>,
}

impl InMemoryChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(mut self, network: Network, token: &Address, holder: &Address, amount: u128) -> Self {
        self.balances
            .insert((network, token.clone(), holder.clone()), amount);
        self
    }

    pub fn with_total_supply(mut self, network: Network, token: &Address, supply: u128) -> Self {
        self.supplies.insert((network, token.clone()), supply);
        self
    }

    pub fn with_pool(mut self, network: Network, pool: &Address, reserves: PoolReserves) -> Self {
        self.supplies
            .insert((network, pool.clone()), reserves.total_supply);
        self.reserves.insert((network, pool.clone()), reserves);
        self
    }

    pub fn with_vault_rate(mut self, network: Network, vault: &Address, assets: u128, shares: u128) -> Self {
        self.vault_rates
            .insert((network, vault.clone()), (assets, shares));
        self
    }

    pub fn with_rewards(
        mut self,
        network: Network,
        staking_contract: &Address,
        holder: &Address,
        rewards: Vec<EarnedReward>,
    ) -> Self {
        self.rewards
            .insert((network, staking_contract.clone(), holder.clone()), rewards);
        self
    }

    /// Queues errors returned by the next calls of `operation` for `target`.
    pub fn fail_next(&self, operation: &'static str, target: &Address, errors: Vec<ChainReadError>) {
        self.failures
            .lock()
            .expect("chain failure script lock is not poisoned")
            .insert((operation, target.clone()), errors);
    }

    /// Scripted errors for `operation` on `target` not yet returned.
    pub fn fail_next_remaining(&self, operation: &'static str, target: &Address) -> usize {
        self.failures
            .lock()
            .expect("chain failure script lock is not poisoned")
            .get(&(operation, target.clone()))
            .map_or(0, Vec::len)
    }

    pub fn read_count(&self) -> u32 {
        *self.reads.lock().expect("chain read counter lock is not poisoned")
    }

    fn begin(
        &self,
        operation: &'static str,
        target: &Address,
        cancel: &CancelSignal,
    ) -> Result<(), ChainReadError> {
        cancel.check()?;
        *self.reads.lock().expect("chain read counter lock is not poisoned") += 1;
        let mut failures = self
            .failures
            .lock()
            .expect("chain failure script lock is not poisoned");
        match failures.get_mut(&(operation, target.clone())) {
            Some(queue) if !queue.is_empty() => Err(queue.remove(0)),
            _ => Ok(()),
        }
    }
}

impl ChainReader for InMemoryChainReader {
    fn balance_of<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        Box::pin(async move {
            self.begin("balance_of", token, cancel)?;
            Ok(self
                .balances
                .get(&(network, token.clone(), holder.clone()))
                .copied()
                .unwrap_or(0))
        })
    }

    fn total_supply<'a>(
        &'a self,
        network: Network,
        token: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        Box::pin(async move {
            self.begin("total_supply", token, cancel)?;
            self.supplies
                .get(&(network, token.clone()))
                .copied()
                .ok_or_else(|| ChainReadError::not_found(format!("no supply for {token} on {network}")))
        })
    }

    fn pool_reserves<'a>(
        &'a self,
        network: Network,
        pool: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, PoolReserves> {
        Box::pin(async move {
            self.begin("pool_reserves", pool, cancel)?;
            self.reserves
                .get(&(network, pool.clone()))
                .cloned()
                .ok_or_else(|| ChainReadError::not_found(format!("no pool {pool} on {network}")))
        })
    }

    fn convert_to_assets<'a>(
        &'a self,
        network: Network,
        vault: &'a Address,
        shares: u128,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, u128> {
        Box::pin(async move {
            self.begin("convert_to_assets", vault, cancel)?;
            let (assets, total_shares) = self
                .vault_rates
                .get(&(network, vault.clone()))
                .copied()
                .ok_or_else(|| ChainReadError::not_found(format!("no vault {vault} on {network}")))?;
            crate::domain::amount::pro_rata(assets, shares, total_shares)
                .map_err(|e| ChainReadError::contract_logic(e.to_string()))
        })
    }

    fn earned_rewards<'a>(
        &'a self,
        network: Network,
        staking_contract: &'a Address,
        holder: &'a Address,
        cancel: &'a CancelSignal,
    ) -> ChainFuture<'a, Vec<EarnedReward>> {
        Box::pin(async move {
            self.begin("earned_rewards", staking_contract, cancel)?;
            Ok(self
                .rewards
                .get(&(network, staking_contract.clone(), holder.clone()))
                .cloned()
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn addr(byte: char) -> Address {
        Address::parse(&format!("0x{}", byte.to_string().repeat(40))).expect("valid address")
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_with_exponential_backoff() {
        let pool = addr('a');
        let reader = InMemoryChainReader::new().with_total_supply(Network::Ethereum, &pool, 42);
        reader.fail_next(
            "total_supply",
            &pool,
            vec![
                ChainReadError::timeout("slow node"),
                ChainReadError::transport("connection reset"),
            ],
        );
        let retrying = RetryingChainReader::new(reader);

        let started = tokio::time::Instant::now();
        let supply = retrying
            .total_supply(Network::Ethereum, &pool, &CancelSignal::new())
            .await
            .expect("third attempt succeeds");

        assert_eq!(supply, 42);
        assert_eq!(retrying.inner().read_count(), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn decode_errors_surface_immediately() {
        let vault = addr('b');
        let reader = InMemoryChainReader::new().with_vault_rate(Network::Base, &vault, 2, 1);
        reader.fail_next("convert_to_assets", &vault, vec![ChainReadError::decode("bad abi")]);
        let retrying = RetryingChainReader::new(reader);

        let error = retrying
            .convert_to_assets(Network::Base, &vault, 10, &CancelSignal::new())
            .await
            .expect_err("decode is terminal");

        assert_eq!(error.kind(), ChainReadErrorKind::Decode);
        assert_eq!(retrying.inner().read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let pool = addr('c');
        let reader = InMemoryChainReader::new();
        reader.fail_next(
            "pool_reserves",
            &pool,
            vec![ChainReadError::contract_logic("revert"); 5],
        );
        let retrying = RetryingChainReader::new(reader);

        let error = retrying
            .pool_reserves(Network::Arbitrum, &pool, &CancelSignal::new())
            .await
            .expect_err("retries exhausted");

        assert_eq!(error.kind(), ChainReadErrorKind::ContractLogic);
        assert_eq!(retrying.inner().read_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_during_backoff_stops_retrying() {
        let pool = addr('e');
        let reader = InMemoryChainReader::new().with_total_supply(Network::Ethereum, &pool, 42);
        reader.fail_next("total_supply", &pool, vec![ChainReadError::timeout("slow node"); 3]);
        let retrying = Arc::new(RetryingChainReader::new(reader));
        let cancel = CancelSignal::new();

        let task = {
            let retrying = Arc::clone(&retrying);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                retrying
                    .total_supply(Network::Ethereum, &pool, &cancel)
                    .await
            })
        };
        // First attempt failed; the reader is now inside its 1s backoff.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();

        let error = task
            .await
            .expect("task completes")
            .expect_err("cancelled during backoff");

        assert_eq!(error.kind(), ChainReadErrorKind::Cancelled);
        assert_eq!(retrying.inner().read_count(), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancelled_reads_are_never_attempted() {
        let reader = InMemoryChainReader::new();
        let cancel = CancelSignal::new();
        cancel.cancel();

        let error = RetryingChainReader::new(reader)
            .balance_of(Network::Ethereum, &addr('f'), &addr('1'), &cancel)
            .await
            .expect_err("cancelled before the first read");

        assert_eq!(error.code(), "cancelled");
    }

    #[tokio::test]
    async fn vault_conversion_truncates() {
        let vault = addr('d');
        let reader = InMemoryChainReader::new().with_vault_rate(Network::Ethereum, &vault, 3, 2);

        let assets = reader
            .convert_to_assets(Network::Ethereum, &vault, 5, &CancelSignal::new())
            .await
            .expect("configured vault");
        assert_eq!(assets, 7);
    }
}
