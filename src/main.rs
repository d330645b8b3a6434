//! WolfElect - Leader Election on a Coordination Service
//!
//! Joins a ZooKeeper election group and reports leader/follower changes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfelect::config::ElectConfig;
use wolfelect::coordination::{MemoryEnsemble, MemorySession, ZkConnector};
use wolfelect::election::{ElectionParticipant, ElectionStatus, ParticipantHandle};
use wolfelect::error::{Error, Result};

/// WolfElect - Leader Election on a Coordination Service
#[derive(Parser)]
#[command(name = "wolfelect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = ElectConfig::default_path())]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election and stay in it until Ctrl+C or session loss
    Run {
        /// Coordination servers (host[:port],...), overrides the config file
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value_os_t = ElectConfig::default_path())]
        output: PathBuf,

        /// Coordination servers
        #[arg(long, default_value = "localhost:2181")]
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show election settings
    Info,

    /// Run an election among in-process participants and fail leaders over
    Simulate {
        /// Number of participants
        #[arg(short, long, default_value_t = 5)]
        participants: usize,

        /// Number of leader failures to inject
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read
    let config = ElectConfig::from_file(&cli.config).ok();
    let logging = config.as_ref().map(|c| c.logging.clone()).unwrap_or_default();
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    init_logging(level, &logging.format);

    match cli.command {
        Commands::Run { address } => run_election(cli.config, address).await,
        Commands::Init { output, address } => run_init(output, address),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Simulate {
            participants,
            rounds,
        } => run_simulate(config.unwrap_or_default(), participants, rounds).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Join the election on the configured ZooKeeper ensemble
async fn run_election(config_path: PathBuf, address: Option<String>) -> Result<()> {
    tracing::info!("Starting WolfElect participant...");

    let mut config = match ElectConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Run `wolfelect init` to create one");
            return Err(e);
        }
    };
    if let Some(address) = address {
        config.session.address = address;
        config.validate()?;
    }

    tracing::info!("Coordination servers: {}", config.session.address);
    tracing::info!("Election root: {}", config.election.root);

    let connector = ZkConnector::new(&config.session.address);
    let handle = ElectionParticipant::start(&connector, &config).await?;
    let mut updates = handle.subscribe();

    tracing::info!(
        "Joined as {} in session 0x{:x}",
        handle.status().state,
        handle.session_id()
    );

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    // Worker gone; its result says why
                    break;
                }
                let status = updates.borrow_and_update().clone();
                tracing::debug!(
                    "Status: {} (leader {})",
                    status.state,
                    status.leader.as_deref().unwrap_or("unknown")
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                return handle.shutdown().await;
            }
        }
    }

    handle.wait().await
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, address: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfElect Configuration
# Generated configuration file

[session]
address = "{address}"
# address = "zk-1.example.com:2181,zk-2.example.com:2181,zk-3.example.com:2181"
timeout_ms = 5000

[election]
root = "/ELECTION"
node_prefix = "NODE-"
root_payload = "This node is used for election."
leader_payload = "LEADER"
follower_payload = "FOLLOWER"
retry_backoff_min_ms = 100
retry_backoff_max_ms = 2000

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your ZooKeeper ensemble.");
    println!("Then start with: wolfelect --config {} run", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ElectConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Servers: {}", ZkConnector::new(&config.session.address).addresses().join(", "));
            println!("  Candidates: {}<sequence>", config.election.candidate_prefix());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show election settings
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = ElectConfig::from_file(&config_path)?;
    let (backoff_min, backoff_max) = config.retry_backoff();

    println!("WolfElect Participant Information");
    println!("=================================");
    println!();
    println!("Session Configuration:");
    for server in ZkConnector::new(&config.session.address).addresses() {
        println!("  Server:         {}", server);
    }
    println!("  Timeout:        {} ms", config.session.timeout_ms);
    println!();
    println!("Election Configuration:");
    println!("  Root:           {}", config.election.root);
    println!("  Node Prefix:    {}", config.election.node_prefix);
    println!("  Leader Tag:     {}", config.election.leader_payload);
    println!("  Follower Tag:   {}", config.election.follower_payload);
    println!("  Retry Backoff:  {:?} - {:?}", backoff_min, backoff_max);
    println!();
    println!("Logging:");
    println!("  Level:          {}", config.logging.level);
    println!("  Format:         {}", config.logging.format);

    Ok(())
}

/// Wait until `handle` satisfies `done`, bounded by `limit`
async fn await_status<F>(handle: &ParticipantHandle<MemorySession>, limit: Duration, done: F) -> Result<()>
where
    F: Fn(&ElectionStatus) -> bool,
{
    let mut rx = handle.subscribe();
    let result = match tokio::time::timeout(limit, rx.wait_for(|s| done(s))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(Error::Internal("participant stopped while settling".into())),
        Err(_) => Err(Error::Internal(format!(
            "{} did not settle within {:?}",
            handle.node_path().unwrap_or_default(),
            limit
        ))),
    };
    result
}

/// The item with the lowest node path. Items between registrations have no
/// node and cannot lead.
fn lowest_registered<'a, T>(items: &'a [T], node_path: impl Fn(&T) -> Option<String>) -> Option<&'a T> {
    items
        .iter()
        .filter_map(|item| node_path(item).map(|path| (path, item)))
        .min_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, item)| item)
}

/// Wait for the lowest candidate to lead and everyone else to follow
async fn settle_group(handles: &[ParticipantHandle<MemorySession>], limit: Duration) -> Result<()> {
    let lowest = lowest_registered(handles, |h| h.node_path())
        .ok_or_else(|| Error::Internal("no registered participants left".into()))?;
    await_status(lowest, limit, |s| s.is_leader() && s.is_settled()).await?;

    for handle in handles {
        await_status(handle, limit, |s| s.is_settled()).await?;
    }
    Ok(())
}

fn print_group(round: usize, handles: &[ParticipantHandle<MemorySession>]) -> Result<()> {
    let statuses: Vec<_> = handles.iter().map(|h| h.status()).collect();
    let leader = statuses.iter().find(|s| s.is_leader()).and_then(|s| s.node_path.clone());
    let report = serde_json::json!({
        "round": round,
        "leader": leader,
        "participants": statuses,
    });
    let text = serde_json::to_string_pretty(&report)
        .map_err(|e| Error::Internal(format!("failed to encode status: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// Run an election among in-process participants
async fn run_simulate(config: ElectConfig, participants: usize, rounds: usize) -> Result<()> {
    if participants == 0 {
        return Err(Error::Config("simulate needs at least one participant".into()));
    }

    let ensemble = MemoryEnsemble::new();
    let limit = config.session_timeout();
    let mut handles = Vec::with_capacity(participants);
    for _ in 0..participants {
        handles.push(ElectionParticipant::start(&ensemble, &config).await?);
    }

    settle_group(&handles, limit).await?;
    print_group(0, &handles)?;

    for round in 1..=rounds {
        if handles.len() < 2 {
            tracing::info!("One participant left, stopping after {} rounds", round - 1);
            break;
        }

        let Some(idx) = handles.iter().position(|h| h.is_leader()) else {
            return Err(Error::Internal("no leader in a settled group".into()));
        };
        let leader = handles.remove(idx);
        tracing::info!(
            "Round {}: expiring leader {}",
            round,
            leader.node_path().unwrap_or_default()
        );
        ensemble.expire_session(leader.session_id())?;
        if let Err(e) = leader.wait().await {
            tracing::debug!("Former leader stopped: {}", e);
        }

        settle_group(&handles, limit).await?;
        print_group(round, &handles)?;
    }

    for handle in handles {
        handle.shutdown().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_registered_skips_unregistered() {
        let paths = vec![
            None,
            Some("/ELECTION/NODE-0000000004".to_string()),
            Some("/ELECTION/NODE-0000000002".to_string()),
        ];
        let lowest = lowest_registered(&paths, |p| p.clone());
        assert_eq!(lowest, Some(&paths[2]));

        let none: Vec<Option<String>> = vec![None, None];
        assert!(lowest_registered(&none, |p| p.clone()).is_none());
    }
}
