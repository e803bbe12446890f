//! Gap limit scanning of an account's receive and change chains.
//!
//! Each cycle derives `batch_size` addresses per chain starting at
//! `cycle * batch_size`, asks the provider for their histories and folds the
//! answers into the scan state. Chains are classified in derivation order
//! and stop independently once `gap_limit` consecutive unused addresses have
//! been seen; a finished chain is not queried again. A cycle is applied only
//! after every query in it has succeeded.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bitcoin::Txid;
use key_wallet::{
    AccountDescriptor, AddressDeriver, ChainKind, DerivedAddress, GapLimitManager, ScriptHash,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{ProviderError, ProviderResult, SyncError, SyncResult};
use crate::provider::ChainProvider;
use crate::retry::{Attempt, ExhaustedPolicy, RetryGovernor};

/// Addresses of one chain, in derivation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainScan {
    pub used: Vec<DerivedAddress>,
    pub unused: Vec<DerivedAddress>,
}

/// A cycle that was counted as empty after its retries ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedCycle {
    pub cycle: u32,
    pub error: ProviderError,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub receive: ChainScan,
    pub change: ChainScan,
    /// Txids per used address
    pub history: BTreeMap<ScriptHash, Vec<Txid>>,
    /// Every txid touching a used address
    pub txids: BTreeSet<Txid>,
    pub gaps: GapLimitManager,
    /// Cycles executed, degraded ones included
    pub cycles: u32,
    pub degraded: Vec<DegradedCycle>,
}

impl ScanResult {
    pub fn chain(&self, chain: ChainKind) -> &ChainScan {
        match chain {
            ChainKind::Receive => &self.receive,
            ChainKind::Change => &self.change,
        }
    }

    /// Every classified address of both chains.
    pub fn addresses(&self) -> impl Iterator<Item = &DerivedAddress> {
        [&self.receive, &self.change]
            .into_iter()
            .flat_map(|scan| scan.used.iter().chain(scan.unused.iter()))
    }

    pub fn used_addresses(&self) -> impl Iterator<Item = &DerivedAddress> {
        self.receive.used.iter().chain(self.change.used.iter())
    }
}

/// History answers of one cycle, `None` for a chain that was not queried.
type CycleHistories = (Option<Vec<Vec<Txid>>>, Option<Vec<Vec<Txid>>>);

struct ScanState {
    gaps: GapLimitManager,
    receive: ChainScan,
    change: ChainScan,
    history: BTreeMap<ScriptHash, Vec<Txid>>,
    txids: BTreeSet<Txid>,
    cycle: u32,
    cycles_run: u32,
    degraded: Vec<DegradedCycle>,
}

impl ScanState {
    fn new(gap_limit: u32) -> Self {
        Self {
            gaps: GapLimitManager::new(gap_limit),
            receive: ChainScan::default(),
            change: ChainScan::default(),
            history: BTreeMap::new(),
            txids: BTreeSet::new(),
            cycle: 0,
            cycles_run: 0,
            degraded: Vec::new(),
        }
    }

    fn chain_mut(&mut self, chain: ChainKind) -> &mut ChainScan {
        match chain {
            ChainKind::Receive => &mut self.receive,
            ChainKind::Change => &mut self.change,
        }
    }

    /// Classify one cycle's addresses and move on to the next cycle.
    fn apply(
        mut self,
        receive: Option<Vec<(DerivedAddress, Vec<Txid>)>>,
        change: Option<Vec<(DerivedAddress, Vec<Txid>)>>,
    ) -> Self {
        for (chain, batch) in [(ChainKind::Receive, receive), (ChainKind::Change, change)] {
            for (address, txids) in batch.into_iter().flatten() {
                let gap = self.gaps.get_mut(chain);
                if gap.limit_reached() {
                    break;
                }
                if txids.is_empty() {
                    gap.mark_unused();
                    self.chain_mut(chain).unused.push(address);
                } else {
                    gap.mark_used(address.index);
                    self.txids.extend(txids.iter().copied());
                    self.history.insert(address.script_hash(), txids);
                    self.chain_mut(chain).used.push(address.mark_used(true));
                }
            }
        }
        self.cycle += 1;
        self.cycles_run += 1;
        self
    }

    /// Count the current cycle as empty; it is attempted again.
    fn degrade(mut self, error: ProviderError) -> Self {
        self.gaps.record_failed_batch();
        self.degraded.push(DegradedCycle {
            cycle: self.cycle,
            error,
        });
        self.cycles_run += 1;
        self
    }

    fn finish(self) -> ScanResult {
        ScanResult {
            receive: self.receive,
            change: self.change,
            history: self.history,
            txids: self.txids,
            gaps: self.gaps,
            cycles: self.cycles_run,
            degraded: self.degraded,
        }
    }
}

pub struct GapLimitScanner<'a> {
    descriptor: &'a AccountDescriptor,
    provider: &'a dyn ChainProvider,
    config: &'a SyncConfig,
    cancel: CancellationToken,
}

impl<'a> GapLimitScanner<'a> {
    pub fn new(
        descriptor: &'a AccountDescriptor,
        provider: &'a dyn ChainProvider,
        config: &'a SyncConfig,
    ) -> Self {
        Self {
            descriptor,
            provider,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between cycles once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn scan(&self) -> SyncResult<ScanResult> {
        let deriver = AddressDeriver::new(self.descriptor);
        let governor = RetryGovernor::new(self.provider, &self.config.retry);
        let batch_size = self.config.batch_size;
        let mut state = ScanState::new(self.config.gap_limit);

        while !state.gaps.is_discovery_complete() {
            if self.cancel.is_cancelled() {
                debug!("Scan of '{}' cancelled before cycle {}", self.descriptor.name(), state.cycle);
                return Err(SyncError::Cancelled);
            }

            let start = state.cycle.checked_mul(batch_size).ok_or_else(|| {
                key_wallet::Error::InvalidDerivationPath(format!(
                    "cycle {} overflows the index space",
                    state.cycle
                ))
            })?;
            let receive = self.derive_if_scanning(&deriver, &state, ChainKind::Receive, start)?;
            let change = self.derive_if_scanning(&deriver, &state, ChainKind::Change, start)?;

            debug!(
                "Cycle {} of '{}': indices {}..{}, receive gap {}/{}, change gap {}/{}",
                state.cycle,
                self.descriptor.name(),
                start,
                start.saturating_add(batch_size),
                state.gaps.receive.current_unused_count,
                state.gaps.receive.limit,
                state.gaps.change.current_unused_count,
                state.gaps.change.limit
            );

            let provider = self.provider;
            let receive_batch = receive.as_deref();
            let change_batch = change.as_deref();
            let label = format!("history cycle {}", state.cycle);
            let outcome = governor
                .attempt(&label, move || query_cycle(provider, receive_batch, change_batch))
                .await?;

            state = match outcome {
                Attempt::Completed((receive_history, change_history)) => state.apply(
                    pair_up(receive, receive_history),
                    pair_up(change, change_history),
                ),
                Attempt::Exhausted(error) => match governor.policy().on_exhausted {
                    ExhaustedPolicy::Fail => return Err(SyncError::ProviderUnavailable(error)),
                    ExhaustedPolicy::AdvanceGap => {
                        warn!(
                            "Cycle {} of '{}' treated as empty after retries: {}",
                            state.cycle,
                            self.descriptor.name(),
                            error
                        );
                        state.degrade(error)
                    }
                },
            };
        }

        let result = state.finish();
        info!(
            "Scanned '{}' in {} cycles: {} used receive, {} used change, {} transactions",
            self.descriptor.name(),
            result.cycles,
            result.receive.used.len(),
            result.change.used.len(),
            result.txids.len()
        );
        Ok(result)
    }

    fn derive_if_scanning(
        &self,
        deriver: &AddressDeriver<'_>,
        state: &ScanState,
        chain: ChainKind,
        start: u32,
    ) -> SyncResult<Option<Vec<DerivedAddress>>> {
        if !state.gaps.get(chain).should_query() {
            return Ok(None);
        }
        Ok(Some(deriver.derive_range(chain, start, self.config.batch_size)?))
    }
}

fn pair_up(
    addresses: Option<Vec<DerivedAddress>>,
    histories: Option<Vec<Vec<Txid>>>,
) -> Option<Vec<(DerivedAddress, Vec<Txid>)>> {
    let (addresses, histories) = addresses.zip(histories)?;
    Some(addresses.into_iter().zip(histories).collect())
}

/// Query both chains concurrently. Either failure fails the cycle.
async fn query_cycle(
    provider: &dyn ChainProvider,
    receive: Option<&[DerivedAddress]>,
    change: Option<&[DerivedAddress]>,
) -> ProviderResult<CycleHistories> {
    let (receive, change) =
        tokio::join!(query_chain(provider, receive), query_chain(provider, change));
    Ok((receive?, change?))
}

/// Histories in the order of `addresses`, matched by script hash.
async fn query_chain(
    provider: &dyn ChainProvider,
    addresses: Option<&[DerivedAddress]>,
) -> ProviderResult<Option<Vec<Vec<Txid>>>> {
    let Some(addresses) = addresses else {
        return Ok(None);
    };
    let keys: Vec<ScriptHash> = addresses.iter().map(DerivedAddress::script_hash).collect();
    let mut by_key: HashMap<ScriptHash, Vec<Txid>> = HashMap::with_capacity(keys.len());
    for entry in provider.get_history_batch(&keys).await? {
        by_key.entry(entry.script_hash).or_default().extend(entry.txids);
    }

    keys.iter()
        .map(|key| {
            by_key.remove(key).map(dedup).ok_or_else(|| {
                ProviderError::Protocol(format!("no history returned for script hash {}", key))
            })
        })
        .collect::<ProviderResult<Vec<_>>>()
        .map(Some)
}

fn dedup(mut txids: Vec<Txid>) -> Vec<Txid> {
    let mut seen = BTreeSet::new();
    txids.retain(|txid| seen.insert(*txid));
    txids
}
