//! Esplora REST provider.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use futures::future::try_join_all;
use key_wallet::{ScriptHash, TxStatus};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{ChainProvider, ProviderUtxo, ScriptHistory, ScriptUtxos, TransactionEntry};
use crate::error::{ProviderError, ProviderResult, SyncError};

/// Confirmed transactions per page of `/scripthash/:hash/txs/chain`
const CHAIN_PAGE_SIZE: usize = 25;

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u32>,
    block_hash: Option<String>,
    block_time: Option<u64>,
}

impl EsploraStatus {
    fn to_tx_status(&self) -> ProviderResult<TxStatus> {
        if !self.confirmed {
            return Ok(TxStatus::Unconfirmed);
        }
        let height = self.block_height.ok_or_else(|| {
            ProviderError::Protocol("confirmed status without block height".to_string())
        })?;
        let block_hash = self
            .block_hash
            .as_deref()
            .map(BlockHash::from_str)
            .transpose()
            .map_err(|e| ProviderError::Protocol(format!("invalid block hash: {}", e)))?;
        Ok(TxStatus::Confirmed {
            height,
            block_hash,
            block_time: self.block_time,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraStatus,
}

/// Esplora HTTP API client.
pub struct EsploraProvider {
    base_url: String,
    client: Client,
    tip: AtomicU32,
}

impl EsploraProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("wallet-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            tip: AtomicU32::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get(&self, path: &str) -> ProviderResult<reqwest::Response> {
        let url = self.url(path);
        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;
        check_status(&url, response).await
    }

    async fn get_text(&self, path: &str) -> ProviderResult<String> {
        self.get(path).await?.text().await.map_err(map_reqwest)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ProviderResult<T> {
        let body = self.get_text(path).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn script_history(&self, key: ScriptHash) -> ProviderResult<ScriptHistory> {
        let hex = key.to_forward_hex();
        let mut seen = HashSet::new();
        let mut txids = Vec::new();
        let mut page: Vec<EsploraTx> = self.get_json(&format!("scripthash/{}/txs", hex)).await?;

        loop {
            let mut confirmed = 0;
            let mut last_confirmed = None;
            for tx in &page {
                let txid = parse_txid(&tx.txid)?;
                if tx.status.confirmed {
                    confirmed += 1;
                    last_confirmed = Some(txid);
                }
                if seen.insert(txid) {
                    txids.push(txid);
                }
            }

            match last_confirmed {
                Some(last) if confirmed >= CHAIN_PAGE_SIZE => {
                    page = self.get_json(&format!("scripthash/{}/txs/chain/{}", hex, last)).await?;
                }
                _ => break,
            }
        }

        Ok(ScriptHistory {
            script_hash: key,
            txids,
        })
    }

    async fn script_utxos(&self, key: ScriptHash) -> ProviderResult<ScriptUtxos> {
        let items: Vec<EsploraUtxo> =
            self.get_json(&format!("scripthash/{}/utxo", key.to_forward_hex())).await?;
        let utxos = items
            .into_iter()
            .map(|item| {
                Ok(ProviderUtxo {
                    outpoint: OutPoint::new(parse_txid(&item.txid)?, item.vout),
                    value: item.value,
                    height: item.status.block_height.filter(|_| item.status.confirmed),
                })
            })
            .collect::<ProviderResult<Vec<_>>>()?;
        Ok(ScriptUtxos {
            script_hash: key,
            utxos,
        })
    }

    /// `None` when the transaction is unknown.
    async fn transaction(&self, txid: Txid) -> ProviderResult<Option<TransactionEntry>> {
        let raw = match self.get_text(&format!("tx/{}/hex", txid)).await {
            Ok(raw) => raw,
            Err(ProviderError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let transaction = decode_transaction(raw.trim())?;
        if transaction.compute_txid() != txid {
            return Err(ProviderError::Protocol(format!(
                "server returned transaction {} for {}",
                transaction.compute_txid(),
                txid
            )));
        }

        let status: EsploraStatus = match self.get_json(&format!("tx/{}/status", txid)).await {
            Ok(status) => status,
            // evicted between the two requests
            Err(ProviderError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(TransactionEntry {
            txid,
            transaction,
            status: status.to_tx_status()?,
        }))
    }
}

async fn check_status(url: &str, response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(url.to_string()),
        StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::Connection(format!("{} rate limited the request", url))
        }
        s if s.is_server_error() => ProviderError::Connection(format!("{} returned {}", url, s)),
        s => ProviderError::Protocol(format!("{} returned {}: {}", url, s, body.trim())),
    })
}

fn map_reqwest(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_decode() || err.is_body() {
        ProviderError::Protocol(err.to_string())
    } else {
        ProviderError::Connection(err.to_string())
    }
}

fn parse_txid(s: &str) -> ProviderResult<Txid> {
    Txid::from_str(s.trim())
        .map_err(|e| ProviderError::Protocol(format!("invalid txid '{}': {}", s, e)))
}

fn decode_transaction(raw: &str) -> ProviderResult<Transaction> {
    let bytes = hex::decode(raw)
        .map_err(|e| ProviderError::Protocol(format!("invalid transaction hex: {}", e)))?;
    bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| ProviderError::Protocol(format!("invalid transaction: {}", e)))
}

/// Estimate for `target`, or for the nearest slower target the server
/// publishes.
fn pick_fee_estimate(estimates: &BTreeMap<u16, f64>, target: u16) -> Option<f64> {
    estimates.range(target..).next().map(|(_, rate)| *rate)
}

#[async_trait]
impl ChainProvider for EsploraProvider {
    fn name(&self) -> &str {
        "esplora"
    }

    async fn initialize(&self) -> ProviderResult<()> {
        let tip = self.tip_height().await?;
        tracing::info!("Using Esplora API at {}, tip {}", self.base_url, tip);
        Ok(())
    }

    async fn tip_height(&self) -> ProviderResult<u32> {
        let text = self.get_text("blocks/tip/height").await?;
        let tip = text
            .trim()
            .parse::<u32>()
            .map_err(|e| ProviderError::Protocol(format!("invalid tip height '{}': {}", text, e)))?;
        self.tip.fetch_max(tip, Ordering::Relaxed);
        Ok(tip)
    }

    async fn get_history_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptHistory>> {
        try_join_all(keys.iter().map(|key| self.script_history(*key))).await
    }

    async fn get_transaction_batch(
        &self,
        txids: &[Txid],
    ) -> ProviderResult<Vec<TransactionEntry>> {
        let entries = try_join_all(txids.iter().map(|txid| self.transaction(*txid))).await?;
        Ok(entries.into_iter().flatten().collect())
    }

    async fn get_utxo_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptUtxos>> {
        try_join_all(keys.iter().map(|key| self.script_utxos(*key))).await
    }

    async fn estimate_fee(&self, target_blocks: u16) -> ProviderResult<Option<f64>> {
        let raw: BTreeMap<String, f64> = self.get_json("fee-estimates").await?;
        let estimates: BTreeMap<u16, f64> = raw
            .into_iter()
            .filter_map(|(target, rate)| target.parse().ok().map(|target| (target, rate)))
            .collect();
        Ok(pick_fee_estimate(&estimates, target_blocks))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> ProviderResult<Txid> {
        let url = self.url("tx");
        let response = self
            .client
            .post(&url)
            .body(raw_tx_hex.to_string())
            .send()
            .await
            .map_err(map_reqwest)?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.map_err(map_reqwest)?;
            return Err(ProviderError::Rejected(body.trim().to_string()));
        }
        let body = check_status(&url, response).await?.text().await.map_err(map_reqwest)?;
        parse_txid(&body)
    }

    async fn is_confirmed(&self, txid: &Txid) -> ProviderResult<bool> {
        match self.get_json::<EsploraStatus>(&format!("tx/{}/status", txid)).await {
            Ok(status) => Ok(status.confirmed),
            Err(ProviderError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
