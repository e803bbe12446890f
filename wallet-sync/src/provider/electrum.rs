//! Electrum protocol provider.
//!
//! Speaks newline-delimited JSON-RPC over TCP or TLS, optionally through a
//! SOCKS5 proxy. Onion hosts always go through one. Batches go out as a
//! single JSON array and responses are matched back by request id, so the
//! order in which the server answers does not matter. Subscription
//! notifications interleaved on the stream are consumed only to keep the
//! tip height current.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use key_wallet::{ScriptHash, TxStatus};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_socks::tcp::Socks5Stream;

use super::{ChainProvider, ProviderUtxo, ScriptHistory, ScriptUtxos, TransactionEntry};
use crate::error::{ProviderError, ProviderResult};

const PROTOCOL_VERSION: &str = "1.4";
const CLIENT_NAME: &str = concat!("wallet-sync/", env!("CARGO_PKG_VERSION"));
const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";

/// Satoshis per BTC divided by bytes per kvB.
const BTC_PER_KVB_TO_SAT_PER_VB: f64 = 100_000_000.0 / 1_000.0;

/// Local Tor daemon used for onion hosts when no proxy is configured.
pub const DEFAULT_TOR_PROXY: &str = "127.0.0.1:9050";

/// Transport under the JSON-RPC framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectrumProtocol {
    #[default]
    Tcp,
    Tls,
}

impl FromStr for ElectrumProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ElectrumProtocol::Tcp),
            "tls" | "ssl" => Ok(ElectrumProtocol::Tls),
            other => Err(format!("unknown electrum protocol '{}'", other)),
        }
    }
}

impl fmt::Display for ElectrumProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectrumProtocol::Tcp => write!(f, "tcp"),
            ElectrumProtocol::Tls => write!(f, "tls"),
        }
    }
}

/// Proxy to dial `host` through: the configured one, or the local Tor
/// daemon for onion hosts.
pub fn proxy_for(host: &str, configured: Option<&str>) -> Option<String> {
    match configured {
        Some(proxy) => Some(proxy.to_string()),
        None if host.ends_with(".onion") => Some(DEFAULT_TOR_PROXY.to_string()),
        None => None,
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type BoxedStream = Box<dyn Stream>;

struct Connection {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
}

impl Connection {
    fn new(stream: BoxedStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }
}

fn tls_connector() -> ProviderResult<TlsConnector> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProviderError::Connection(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn split_host_port(address: &str) -> ProviderResult<(&str, u16)> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        ProviderError::Connection(format!("'{}' is not host:port", address))
    })?;
    let port = port
        .parse()
        .map_err(|_| ProviderError::Connection(format!("invalid port in '{}'", address)))?;
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}

/// Error object returned for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn is_not_found(&self) -> bool {
        let message = self.message.to_ascii_lowercase();
        message.contains("no such mempool or blockchain transaction")
            || message.contains("not found")
    }
}

#[derive(Debug, Deserialize)]
struct HistoryItem {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct UnspentItem {
    tx_hash: String,
    tx_pos: u32,
    height: i64,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct HeaderInfo {
    height: u32,
}

#[derive(Debug, Deserialize)]
struct VerboseTransaction {
    hex: String,
    confirmations: Option<u32>,
    blockhash: Option<String>,
    blocktime: Option<u64>,
}

impl VerboseTransaction {
    /// Status relative to `tip`. A transaction with `n` confirmations was
    /// mined `n - 1` blocks below the tip.
    fn status(&self, tip: u32) -> ProviderResult<TxStatus> {
        let confirmations = self.confirmations.unwrap_or(0);
        if confirmations == 0 {
            return Ok(TxStatus::Unconfirmed);
        }
        let block_hash = self
            .blockhash
            .as_deref()
            .map(BlockHash::from_str)
            .transpose()
            .map_err(|e| ProviderError::Protocol(format!("invalid block hash: {}", e)))?;
        Ok(TxStatus::Confirmed {
            height: tip.saturating_add(1).saturating_sub(confirmations),
            block_hash,
            block_time: self.blocktime,
        })
    }
}

/// Electrum server client.
pub struct ElectrumProvider {
    address: String,
    protocol: ElectrumProtocol,
    proxy: Option<String>,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    tip: AtomicU32,
}

impl ElectrumProvider {
    /// Create a provider for `host:port`. Nothing is opened until
    /// [`ChainProvider::initialize`] runs.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            protocol: ElectrumProtocol::Tcp,
            proxy: None,
            timeout,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(0),
            tip: AtomicU32::new(0),
        }
    }

    pub fn with_protocol(mut self, protocol: ElectrumProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// SOCKS5 proxy as `host:port`.
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> ElectrumProtocol {
        self.protocol
    }

    async fn connect(&self) -> ProviderResult<Connection> {
        timeout(self.timeout, self.open_stream())
            .await
            .map_err(|_| ProviderError::Timeout(format!("connecting to {}", self.address)))?
            .map(Connection::new)
    }

    async fn open_stream(&self) -> ProviderResult<BoxedStream> {
        let (host, port) = split_host_port(&self.address)?;
        let tcp = match proxy_for(host, self.proxy.as_deref()) {
            Some(proxy) => {
                tracing::debug!("Dialing {} through SOCKS5 proxy {}", self.address, proxy);
                Socks5Stream::connect(proxy.as_str(), (host, port))
                    .await
                    .map_err(|e| {
                        ProviderError::Connection(format!("proxy {} failed: {}", proxy, e))
                    })?
                    .into_inner()
            }
            None => TcpStream::connect((host, port)).await?,
        };
        tcp.set_nodelay(true)?;

        match self.protocol {
            ElectrumProtocol::Tcp => Ok(Box::new(tcp)),
            ElectrumProtocol::Tls => {
                let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                    ProviderError::Connection(format!("invalid TLS server name '{}': {}", host, e))
                })?;
                let tls = tls_connector()?.connect(server_name, tcp).await?;
                Ok(Box::new(tls))
            }
        }
    }

    /// Send `requests` as one batch. Per-request errors are returned in
    /// place; transport failures drop the connection.
    async fn call_batch(
        &self,
        requests: Vec<(&'static str, Value)>,
    ) -> ProviderResult<Vec<Result<Value, RpcError>>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or_else(|| {
            ProviderError::Connection(format!("not connected to {}", self.address))
        })?;

        let first_id = self.next_id.fetch_add(requests.len() as u64, Ordering::Relaxed);
        let payload: Vec<Value> = requests
            .iter()
            .enumerate()
            .map(|(i, (method, params))| {
                json!({
                    "jsonrpc": "2.0",
                    "id": first_id + i as u64,
                    "method": method,
                    "params": params,
                })
            })
            .collect();

        match timeout(self.timeout, exchange(connection, &payload, first_id, &self.tip)).await {
            Ok(Ok(responses)) => Ok(responses),
            Ok(Err(e)) => {
                tracing::warn!("Electrum connection to {} failed: {}", self.address, e);
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(ProviderError::Timeout(format!(
                    "{} request(s) to {} after {:?}",
                    requests.len(),
                    self.address,
                    self.timeout
                )))
            }
        }
    }

    async fn call(&self, method: &'static str, params: Value) -> ProviderResult<Value> {
        let mut responses = self.call_batch(vec![(method, params)]).await?;
        match responses.pop() {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => Err(rpc_failure(method, e)),
            None => Err(ProviderError::Protocol(format!("no response to {}", method))),
        }
    }

    async fn verbose_transactions(
        &self,
        txids: &[Txid],
    ) -> ProviderResult<Vec<(Txid, Result<Value, RpcError>)>> {
        let requests = txids
            .iter()
            .map(|txid| ("blockchain.transaction.get", json!([txid.to_string(), true])))
            .collect();
        let responses = self.call_batch(requests).await?;
        Ok(txids.iter().copied().zip(responses).collect())
    }
}

/// Write one batch and read lines until every id in it has been answered.
async fn exchange(
    connection: &mut Connection,
    payload: &[Value],
    first_id: u64,
    tip: &AtomicU32,
) -> ProviderResult<Vec<Result<Value, RpcError>>> {
    let mut line = serde_json::to_string(payload)?;
    line.push('\n');
    connection.writer.write_all(line.as_bytes()).await?;
    connection.writer.flush().await?;

    let mut slots: Vec<Option<Result<Value, RpcError>>> = (0..payload.len()).map(|_| None).collect();
    let mut remaining = payload.len();
    let mut buf = String::new();

    while remaining > 0 {
        buf.clear();
        if connection.reader.read_line(&mut buf).await? == 0 {
            return Err(ProviderError::Connection("server closed the connection".to_string()));
        }
        if buf.trim().is_empty() {
            continue;
        }

        let items = match serde_json::from_str::<Value>(buf.trim())? {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in items {
            let Some(id) = item.get("id").and_then(Value::as_u64) else {
                handle_notification(&item, tip);
                continue;
            };
            let slot = id
                .checked_sub(first_id)
                .and_then(|offset| slots.get_mut(offset as usize))
                .filter(|slot| slot.is_none());
            match slot {
                Some(slot) => {
                    *slot = Some(parse_response(item));
                    remaining -= 1;
                }
                None => tracing::trace!("Ignoring Electrum response with unexpected id {}", id),
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

fn parse_response(item: Value) -> Result<Value, RpcError> {
    let Value::Object(mut fields) = item else {
        return Err(RpcError {
            code: 0,
            message: "response is not an object".to_string(),
        });
    };
    match fields.remove("error") {
        Some(Value::Null) | None => Ok(fields.remove("result").unwrap_or(Value::Null)),
        Some(error) => Err(RpcError {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        }),
    }
}

fn handle_notification(item: &Value, tip: &AtomicU32) {
    if item.get("method").and_then(Value::as_str) != Some(HEADERS_SUBSCRIBE) {
        return;
    }
    let header = item
        .get("params")
        .and_then(|params| params.get(0))
        .and_then(|header| serde_json::from_value::<HeaderInfo>(header.clone()).ok());
    if let Some(header) = header {
        tracing::debug!("New Electrum tip at height {}", header.height);
        tip.fetch_max(header.height, Ordering::Relaxed);
    }
}

fn rpc_failure(method: &str, error: RpcError) -> ProviderError {
    ProviderError::Protocol(format!("{} failed ({}): {}", method, error.code, error.message))
}

fn parse_txid(s: &str) -> ProviderResult<Txid> {
    Txid::from_str(s).map_err(|e| ProviderError::Protocol(format!("invalid txid '{}': {}", s, e)))
}

fn decode_transaction(raw: &str) -> ProviderResult<Transaction> {
    let bytes = hex::decode(raw)
        .map_err(|e| ProviderError::Protocol(format!("invalid transaction hex: {}", e)))?;
    bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| ProviderError::Protocol(format!("invalid transaction: {}", e)))
}

fn fee_rate_from_btc_per_kvb(value: f64) -> Option<f64> {
    (value >= 0.0).then(|| value * BTC_PER_KVB_TO_SAT_PER_VB)
}

#[async_trait]
impl ChainProvider for ElectrumProvider {
    fn name(&self) -> &str {
        "electrum"
    }

    async fn initialize(&self) -> ProviderResult<()> {
        let connection = self.connect().await?;
        *self.connection.lock().await = Some(connection);

        let version = self.call("server.version", json!([CLIENT_NAME, PROTOCOL_VERSION])).await?;
        let header: HeaderInfo =
            serde_json::from_value(self.call(HEADERS_SUBSCRIBE, json!([])).await?)?;
        self.tip.store(header.height, Ordering::Relaxed);

        tracing::info!(
            "Connected to Electrum server {} over {} ({}), tip {}",
            self.address,
            self.protocol,
            version,
            header.height
        );
        Ok(())
    }

    async fn tip_height(&self) -> ProviderResult<u32> {
        if self.connection.lock().await.is_none() {
            return Err(ProviderError::Connection(format!("not connected to {}", self.address)));
        }
        Ok(self.tip.load(Ordering::Relaxed))
    }

    async fn get_history_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptHistory>> {
        const METHOD: &str = "blockchain.scripthash.get_history";
        let requests = keys.iter().map(|key| (METHOD, json!([key.to_hex()]))).collect();
        let responses = self.call_batch(requests).await?;

        keys.iter()
            .zip(responses)
            .map(|(key, response)| {
                let value = response.map_err(|e| rpc_failure(METHOD, e))?;
                let items: Vec<HistoryItem> = serde_json::from_value(value)?;
                let txids = items
                    .iter()
                    .map(|item| parse_txid(&item.tx_hash))
                    .collect::<ProviderResult<Vec<_>>>()?;
                Ok(ScriptHistory {
                    script_hash: *key,
                    txids,
                })
            })
            .collect()
    }

    async fn get_transaction_batch(
        &self,
        txids: &[Txid],
    ) -> ProviderResult<Vec<TransactionEntry>> {
        let tip = self.tip.load(Ordering::Relaxed);
        let mut entries = Vec::with_capacity(txids.len());

        for (txid, response) in self.verbose_transactions(txids).await? {
            let value = match response {
                Ok(value) => value,
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Electrum server does not know transaction {}", txid);
                    continue;
                }
                Err(e) => return Err(rpc_failure("blockchain.transaction.get", e)),
            };

            let verbose: VerboseTransaction = serde_json::from_value(value)?;
            let transaction = decode_transaction(&verbose.hex)?;
            if transaction.compute_txid() != txid {
                return Err(ProviderError::Protocol(format!(
                    "server returned transaction {} for {}",
                    transaction.compute_txid(),
                    txid
                )));
            }
            entries.push(TransactionEntry {
                txid,
                transaction,
                status: verbose.status(tip)?,
            });
        }

        Ok(entries)
    }

    async fn get_utxo_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptUtxos>> {
        const METHOD: &str = "blockchain.scripthash.listunspent";
        let requests = keys.iter().map(|key| (METHOD, json!([key.to_hex()]))).collect();
        let responses = self.call_batch(requests).await?;

        keys.iter()
            .zip(responses)
            .map(|(key, response)| {
                let value = response.map_err(|e| rpc_failure(METHOD, e))?;
                let items: Vec<UnspentItem> = serde_json::from_value(value)?;
                let utxos = items
                    .into_iter()
                    .map(|item| {
                        Ok(ProviderUtxo {
                            outpoint: OutPoint::new(parse_txid(&item.tx_hash)?, item.tx_pos),
                            value: item.value,
                            // 0 and -1 both mean mempool
                            height: u32::try_from(item.height).ok().filter(|h| *h > 0),
                        })
                    })
                    .collect::<ProviderResult<Vec<_>>>()?;
                Ok(ScriptUtxos {
                    script_hash: *key,
                    utxos,
                })
            })
            .collect()
    }

    async fn estimate_fee(&self, target_blocks: u16) -> ProviderResult<Option<f64>> {
        let value = self.call("blockchain.estimatefee", json!([target_blocks])).await?;
        let btc_per_kvb = value.as_f64().ok_or_else(|| {
            ProviderError::Protocol(format!("fee estimate is not a number: {}", value))
        })?;
        Ok(fee_rate_from_btc_per_kvb(btc_per_kvb))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> ProviderResult<Txid> {
        let mut responses = self
            .call_batch(vec![("blockchain.transaction.broadcast", json!([raw_tx_hex]))])
            .await?;
        match responses.pop() {
            Some(Ok(Value::String(txid))) => parse_txid(&txid),
            Some(Ok(other)) => Err(ProviderError::Protocol(format!(
                "unexpected broadcast result: {}",
                other
            ))),
            Some(Err(e)) => Err(ProviderError::Rejected(e.message)),
            None => Err(ProviderError::Protocol("no response to broadcast".to_string())),
        }
    }

    async fn is_confirmed(&self, txid: &Txid) -> ProviderResult<bool> {
        let tip = self.tip.load(Ordering::Relaxed);
        match self.verbose_transactions(std::slice::from_ref(txid)).await?.pop() {
            Some((_, Ok(value))) => {
                let verbose: VerboseTransaction = serde_json::from_value(value)?;
                Ok(verbose.status(tip)?.is_confirmed())
            }
            Some((_, Err(e))) if e.is_not_found() => Ok(false),
            Some((_, Err(e))) => Err(rpc_failure("blockchain.transaction.get", e)),
            None => Err(ProviderError::Protocol("no response to transaction.get".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, ScriptBuf, TxIn, TxOut, WPubkeyHash};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const TIP: u32 = 800_000;
    const BLOCK_TIME: u64 = 1_700_000_000;

    struct FakeChain {
        tx_hex: String,
        txid: String,
        used_key: String,
    }

    fn sample_transaction() -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([9; 32]), 1),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: Amount::from_sat(42_000),
                script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([3; 20])),
            }],
        }
    }

    fn answer(request: &Value, chain: &FakeChain) -> Value {
        let id = request["id"].clone();
        let params = &request["params"];
        let result = match request["method"].as_str().unwrap_or_default() {
            "server.version" => json!(["FakeElectrum 1.0", "1.4"]),
            "blockchain.headers.subscribe" => json!({"height": TIP, "hex": "00"}),
            "blockchain.scripthash.get_history" => {
                if params[0] == json!(chain.used_key) {
                    json!([{"tx_hash": chain.txid, "height": TIP - 10}])
                } else {
                    json!([])
                }
            }
            "blockchain.transaction.get" if params[0] == json!(chain.txid) => json!({
                "hex": chain.tx_hex,
                "confirmations": 11,
                "blockhash": "00000000000000000001c8a5d37f3b0cd5e1b4fbb1e7c1b0b0a0a0a0a0a0a0a0",
                "blocktime": BLOCK_TIME,
            }),
            "blockchain.transaction.get" => {
                return json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": 2, "message": "daemon error: No such mempool or blockchain transaction. Use gettransaction for wallet transactions."}
                });
            }
            "blockchain.estimatefee" => json!(0.00012),
            "blockchain.transaction.broadcast" => {
                return json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": 1, "message": "min relay fee not met"}
                });
            }
            _ => Value::Null,
        };
        json!({"jsonrpc": "2.0", "id": id, "result": result})
    }

    /// Answers batches in reverse order and prefixes every reply with a
    /// header notification.
    async fn serve(listener: TcpListener, chain: Arc<FakeChain>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let notification = json!({
                "jsonrpc": "2.0",
                "method": HEADERS_SUBSCRIBE,
                "params": [{"height": TIP, "hex": "00"}],
            });
            let response = match request {
                Value::Array(items) => {
                    Value::Array(items.iter().rev().map(|r| answer(r, &chain)).collect())
                }
                single => answer(&single, &chain),
            };
            let out = format!("{}\n{}\n", notification, response);
            if write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn connected_provider() -> (ElectrumProvider, Transaction, ScriptHash) {
        let tx = sample_transaction();
        let used_key = ScriptHash::from_script(&tx.output[0].script_pubkey);
        let chain = Arc::new(FakeChain {
            tx_hex: hex::encode(bitcoin::consensus::serialize(&tx)),
            txid: tx.compute_txid().to_string(),
            used_key: used_key.to_hex(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, chain));

        let provider = ElectrumProvider::new(address, Duration::from_secs(5));
        provider.initialize().await.unwrap();
        (provider, tx, used_key)
    }

    #[tokio::test]
    async fn test_requires_initialize() {
        let provider = ElectrumProvider::new("127.0.0.1:1", Duration::from_millis(200));
        let err = provider.get_history_batch(&[ScriptHash::from_script(&ScriptBuf::new())]).await;
        assert!(matches!(err, Err(ProviderError::Connection(_))));
        assert!(provider.tip_height().await.is_err());
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!("tcp".parse::<ElectrumProtocol>().unwrap(), ElectrumProtocol::Tcp);
        assert_eq!("TLS".parse::<ElectrumProtocol>().unwrap(), ElectrumProtocol::Tls);
        assert_eq!("ssl".parse::<ElectrumProtocol>().unwrap(), ElectrumProtocol::Tls);
        assert!("udp".parse::<ElectrumProtocol>().is_err());
        assert_eq!(ElectrumProtocol::Tls.to_string(), "tls");
    }

    #[test]
    fn test_onion_hosts_use_tor_proxy() {
        let onion = "explorerzydxu5ecjrkwceayqybizmpjjznk5izmitf2modhcusuqlid.onion";
        assert_eq!(proxy_for(onion, None).as_deref(), Some(DEFAULT_TOR_PROXY));
        assert_eq!(proxy_for(onion, Some("10.0.0.2:9150")).as_deref(), Some("10.0.0.2:9150"));
        assert_eq!(proxy_for("electrum.blockstream.info", None), None);
        assert_eq!(
            proxy_for("electrum.blockstream.info", Some("127.0.0.1:9050")).as_deref(),
            Some("127.0.0.1:9050")
        );
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com:50002").unwrap(), ("example.com", 50002));
        assert_eq!(split_host_port("[::1]:50001").unwrap(), ("::1", 50001));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("example.com:port").is_err());
    }

    #[tokio::test]
    async fn test_tls_waits_for_handshake() {
        // Accepts but never speaks TLS
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let provider = ElectrumProvider::new(address, Duration::from_millis(300))
            .with_protocol(ElectrumProtocol::Tls);
        assert_eq!(provider.protocol(), ElectrumProtocol::Tls);
        assert!(matches!(provider.initialize().await, Err(ProviderError::Timeout(_))));
        assert!(provider.tip_height().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_proxy_fails_connect() {
        let provider = ElectrumProvider::new("example.com:50001", Duration::from_secs(2))
            .with_proxy(Some("127.0.0.1:1".to_string()));
        match provider.initialize().await {
            Err(ProviderError::Connection(message)) => assert!(message.contains("proxy")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batches_are_matched_by_id() {
        let (provider, tx, used_key) = connected_provider().await;
        assert_eq!(provider.tip_height().await.unwrap(), TIP);

        let empty_key = ScriptHash::from_script(&ScriptBuf::new());
        let history = provider.get_history_batch(&[used_key, empty_key]).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].script_hash, used_key);
        assert_eq!(history[0].txids, vec![tx.compute_txid()]);
        assert_eq!(history[1].script_hash, empty_key);
        assert!(history[1].txids.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_status_and_unknown_txids() {
        let (provider, tx, _) = connected_provider().await;
        let unknown = Txid::from_byte_array([0xee; 32]);

        let entries = provider.get_transaction_batch(&[unknown, tx.compute_txid()]).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transaction, tx);
        match entries[0].status {
            TxStatus::Confirmed {
                height,
                block_hash,
                block_time,
            } => {
                assert_eq!(height, TIP - 10);
                assert!(block_hash.is_some());
                assert_eq!(block_time, Some(BLOCK_TIME));
            }
            TxStatus::Unconfirmed => panic!("expected a confirmed transaction"),
        }

        assert!(provider.is_confirmed(&tx.compute_txid()).await.unwrap());
        assert!(!provider.is_confirmed(&unknown).await.unwrap());
    }

    #[tokio::test]
    async fn test_fee_estimate_and_broadcast_rejection() {
        let (provider, _, _) = connected_provider().await;
        let rate = provider.estimate_fee(2).await.unwrap().unwrap();
        assert!((rate - 12.0).abs() < 1e-9);

        let err = provider.broadcast("00").await.unwrap_err();
        assert_eq!(err, ProviderError::Rejected("min relay fee not met".to_string()));
    }

    #[test]
    fn test_fee_conversion() {
        assert_eq!(fee_rate_from_btc_per_kvb(-1.0), None);
        let rate = fee_rate_from_btc_per_kvb(0.0001).unwrap();
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_response_error_forms() {
        let err = parse_response(json!({"id": 1, "error": {"code": -5, "message": "not found"}}))
            .unwrap_err();
        assert_eq!(err.code, -5);
        assert!(err.is_not_found());

        let err = parse_response(json!({"id": 1, "error": "bad request"})).unwrap_err();
        assert_eq!(err.message, "\"bad request\"");

        assert_eq!(parse_response(json!({"id": 1, "result": 5, "error": null})), Ok(json!(5)));
    }

    #[test]
    fn test_mempool_status() {
        let verbose = VerboseTransaction {
            hex: String::new(),
            confirmations: None,
            blockhash: None,
            blocktime: None,
        };
        assert_eq!(verbose.status(TIP).unwrap(), TxStatus::Unconfirmed);
    }
}
