//! Command-line interface for the wallet sync engine.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use tokio::signal;

use wallet_sync::config::{load_accounts, parse_network};
use wallet_sync::logging::parse_level;
use wallet_sync::{
    AccountSnapshot, ElectrumProtocol, InMemoryLabelStore, LabelStore, LogFileConfig,
    LoggingConfig, NoLabels, ProviderConfig, SyncConfig, SyncEngine, provider,
};

const MAX_LOG_FILES: usize = 10;

fn build_cli() -> Command {
    Command::new("wallet-sync")
        .version(wallet_sync::VERSION)
        .about("Watch-only Bitcoin account synchronization")
        .arg(
            Arg::new("account")
                .short('a')
                .long("account")
                .value_name("FILE")
                .help("JSON file with one account or a list of accounts"),
        )
        .arg(
            Arg::new("provider")
                .short('p')
                .long("provider")
                .value_name("KIND")
                .help("Blockchain data provider")
                .value_parser(["electrum", "esplora"])
                .default_value("electrum"),
        )
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .value_name("SERVER")
                .help("Electrum host:port or Esplora base URL"),
        )
        .arg(
            Arg::new("electrum-protocol")
                .long("electrum-protocol")
                .value_name("PROTOCOL")
                .help("Electrum transport")
                .value_parser(["tcp", "tls"])
                .default_value("tcp"),
        )
        .arg(
            Arg::new("proxy")
                .long("proxy")
                .value_name("HOST:PORT")
                .help("SOCKS5 proxy for Electrum (onion hosts default to 127.0.0.1:9050)"),
        )
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Network to use")
                .value_parser(["mainnet", "testnet", "signet", "regtest"])
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("gap-limit")
                .long("gap-limit")
                .value_name("N")
                .help("Consecutive unused addresses that end a chain")
                .value_parser(clap::value_parser!(u32))
                .default_value("10"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .value_name("N")
                .help("Addresses queried per chain per round trip")
                .value_parser(clap::value_parser!(u32))
                .default_value("10"),
        )
        .arg(
            Arg::new("labels")
                .long("labels")
                .value_name("FILE")
                .help("BIP-329 label file (JSON lines)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Also write logs to this directory"),
        )
        .arg(
            Arg::new("fee-estimates")
                .long("fee-estimates")
                .help("Print fee rate estimates")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("broadcast")
                .long("broadcast")
                .value_name("HEX")
                .help("Broadcast a raw transaction and exit"),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = build_cli().get_matches();

    let logging = LoggingConfig {
        level: matches.get_one::<String>("log-level").and_then(|level| parse_level(level)),
        console: true,
        file: matches.get_one::<String>("log-dir").map(|dir| LogFileConfig {
            log_dir: PathBuf::from(dir),
            max_files: MAX_LOG_FILES,
        }),
    };
    let _logging_guard = wallet_sync::init_logging(logging)?;

    let network_name = matches.get_one::<String>("network").map(String::as_str).unwrap_or("mainnet");
    let network = parse_network(network_name)?;
    let provider_kind =
        matches.get_one::<String>("provider").map(String::as_str).unwrap_or("electrum");
    let electrum_protocol = matches
        .get_one::<String>("electrum-protocol")
        .map(|name| name.parse::<ElectrumProtocol>())
        .transpose()?
        .unwrap_or_default();
    let provider_config = ProviderConfig::from_args(
        provider_kind,
        matches.get_one::<String>("server").map(String::as_str),
        network,
    )?
    .with_electrum_protocol(network, electrum_protocol)
    .with_proxy(matches.get_one::<String>("proxy").cloned());

    let mut config = SyncConfig::new();
    if let Some(gap_limit) = matches.get_one::<u32>("gap-limit") {
        config = config.with_gap_limit(*gap_limit);
    }
    if let Some(batch_size) = matches.get_one::<u32>("batch-size") {
        config = config.with_batch_size(*batch_size);
    }

    let labels: Arc<dyn LabelStore> = match matches.get_one::<String>("labels") {
        Some(path) => match InMemoryLabelStore::load(&PathBuf::from(path)) {
            Ok(store) => {
                tracing::info!("Loaded {} labels from {}", store.len(), path);
                Arc::new(store)
            }
            Err(e) => {
                eprintln!("Failed to load labels: {}", e);
                process::exit(1);
            }
        },
        None => Arc::new(NoLabels),
    };

    let provider = provider::from_config(&provider_config)?;
    let engine = match SyncEngine::with_label_store(provider, config, labels) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    if let Some(raw_tx) = matches.get_one::<String>("broadcast") {
        match engine.broadcast(raw_tx).await {
            Ok(txid) => println!("{}", txid),
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
        return Ok(());
    }

    if matches.get_flag("fee-estimates") {
        let rates = engine.estimate_fees().await?;
        let show = |rate: Option<f64>| match rate {
            Some(rate) => format!("{:.1} sat/vB", rate),
            None => "unavailable".to_string(),
        };
        println!("next block: {}", show(rates.fastest));
        println!("30 minutes: {}", show(rates.half_hour));
        println!("1 hour:     {}", show(rates.hour));
    }

    let Some(account_file) = matches.get_one::<String>("account") else {
        if !matches.get_flag("fee-estimates") {
            eprintln!("Nothing to do: pass --account, --fee-estimates or --broadcast");
            process::exit(2);
        }
        return Ok(());
    };

    let accounts = match load_accounts(&PathBuf::from(account_file)) {
        Ok(accounts) => accounts,
        Err(e) => {
            eprintln!("Failed to load accounts: {}", e);
            process::exit(1);
        }
    };
    let accounts: Vec<_> = accounts
        .into_iter()
        .filter(|account| {
            let matches_network = account.network() == network;
            if !matches_network {
                tracing::warn!(
                    "Skipping '{}': account is for {}, not {}",
                    account.name(),
                    account.network(),
                    network
                );
            }
            matches_network
        })
        .collect();

    let results = tokio::select! {
        results = engine.sync_all(&accounts) => results,
        _ = signal::ctrl_c() => {
            tracing::info!("Received shutdown signal (Ctrl-C)");
            engine.shutdown();
            process::exit(130);
        }
    };

    let mut failed = false;
    for (account, result) in accounts.iter().zip(results) {
        match result {
            Ok(snapshot) => print_snapshot(&snapshot),
            Err(e) => {
                failed = true;
                eprintln!("{}: sync failed: {}", account.name(), e);
            }
        }
    }
    if failed {
        process::exit(1);
    }
    Ok(())
}

fn print_snapshot(snapshot: &AccountSnapshot) {
    println!("== {} ({})", snapshot.account_name, snapshot.account_id);
    println!(
        "balance: {} sat confirmed, {} sat unconfirmed",
        snapshot.balance.confirmed, snapshot.balance.unconfirmed
    );
    println!(
        "addresses: {} used receive, {} used change",
        snapshot.receive.used.len(),
        snapshot.change.used.len()
    );
    if let Some(next) = snapshot.next_receive_address() {
        println!("next receive address: {} ({})", next.address, next.index);
    }
    for record in &snapshot.transactions {
        println!(
            "  {} {:>8} {:>12} sat  fee {:>6}  {}",
            record.txid, record.direction, record.net_amount, record.fee, record.status
        );
    }
    for warning in &snapshot.warnings {
        println!("  warning: {}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_electrum_transport_flags() {
        let matches = build_cli()
            .try_get_matches_from([
                "wallet-sync",
                "--electrum-protocol",
                "tls",
                "--proxy",
                "127.0.0.1:9050",
            ])
            .unwrap();
        assert_eq!(matches.get_one::<String>("electrum-protocol").unwrap(), "tls");
        assert_eq!(matches.get_one::<String>("proxy").unwrap(), "127.0.0.1:9050");

        let defaults = build_cli().try_get_matches_from(["wallet-sync"]).unwrap();
        assert_eq!(defaults.get_one::<String>("electrum-protocol").unwrap(), "tcp");
        assert!(defaults.get_one::<String>("proxy").is_none());

        assert!(build_cli().try_get_matches_from(["wallet-sync", "--electrum-protocol", "udp"]).is_err());
    }
}
