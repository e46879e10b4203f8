//! Dispersy node CLI
//!
//! Run a long-lived Dispersy node that walks, syncs and answers peers.
//!
//! Usage:
//!   dispersy-node                                   # Load saved communities
//!   dispersy-node --create                          # Found a new simple community
//!   dispersy-node --join <master-public-key-hex>    # Join a simple community
//!   dispersy-node --bootstrap bootstrap.txt         # Walk to these peers first

use std::env;
use std::path::PathBuf;

use tracing::info;

use dispersy_core::communities::{BarterCommunity, SimpleCommunity};
use dispersy_core::protocol::load_bootstrap_file;
use dispersy_core::{Dispersy, DispersyConfig, DispersyError, Session};

fn print_usage() {
    println!("Dispersy Node v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage:");
    println!("  dispersy-node [options]");
    println!();
    println!("Options:");
    println!("  --port <PORT>               UDP port (default: 6421)");
    println!("  --statedir <DIR>            State directory holding dispersy.db");
    println!("  --nickname <NAME>           Name shown in logs");
    println!("  --bootstrap <FILE>          Bootstrap peers, one 'host, port' per line");
    println!("  --create                    Found a new simple community");
    println!("  --join <KEY>                Join the simple community with this master public key (hex)");
    println!("  --help, -h                  Show this help");
    println!();
    println!("Environment:");
    println!("  RUST_LOG                    Set log level (e.g., info, debug)");
}

/// Value following `flag`, if any
fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(e) = run(&args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: &[String]) -> Result<(), DispersyError> {
    let mut config = DispersyConfig::default();
    if let Some(port) = flag_value(args, "--port") {
        let port = port
            .parse()
            .map_err(|_| DispersyError::InvalidInput(format!("invalid port {}", port)))?;
        config = config.with_port(port);
    }
    if let Some(dir) = flag_value(args, "--statedir") {
        config = config.with_state_dir(PathBuf::from(dir));
    }
    if let Some(path) = flag_value(args, "--bootstrap") {
        let bootstrap = load_bootstrap_file(&PathBuf::from(path))?;
        println!("Bootstrap: {} peers from {}", bootstrap.len(), path);
        config = config.with_bootstrap(bootstrap);
    }
    let nickname = flag_value(args, "--nickname").unwrap_or("dispersy").to_string();
    let join = flag_value(args, "--join")
        .map(|key| hex::decode(key).map_err(|_| DispersyError::InvalidInput("master key is not hex".to_string())))
        .transpose()?;
    let create = args.iter().any(|a| a == "--create");

    println!("Dispersy Node v{}", env!("CARGO_PKG_VERSION"));
    println!("Database: {}", config.resolved_db_path().display());

    let mut dispersy = Dispersy::open(config)?;
    dispersy.register_classification(SimpleCommunity::CLASSIFICATION, SimpleCommunity::factory());
    dispersy.register_classification(BarterCommunity::CLASSIFICATION, BarterCommunity::factory());

    let session = Session::start(dispersy).await?;
    println!();
    println!("=== Local Node ===");
    println!("Nickname: {}", nickname);
    println!("Address: {}", session.local_addr());

    let member = session
        .call(|d, _| hex::encode(&d.my_member().member.public_key))
        .await?;
    println!("Member: {}", member);

    if create {
        let master = session
            .call(|d, now| {
                let cid = d.create_community(Box::new(SimpleCommunity::new()), now)?;
                Ok::<_, DispersyError>(d.community(&cid).map(|c| hex::encode(&c.master().public_key)))
            })
            .await??;
        if let Some(master) = master {
            println!("Created community, join with:");
            println!("  --join {}", master);
        }
    }
    if let Some(master) = join {
        let cid = session
            .call(move |d, now| d.join_community(&master, Box::new(SimpleCommunity::new()), now))
            .await??;
        println!("Joined community {}", hex::encode(cid));
    }

    let summaries = session.call(|d, _| d.community_summaries()).await??;
    println!();
    println!("=== Communities ===");
    for summary in &summaries {
        println!(
            "{} {} (global time {}, {} packets)",
            summary.cid, summary.classification, summary.global_time, summary.stored_packets
        );
    }

    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl+C");
    }
    println!();
    info!(%nickname, "Received shutdown signal");

    println!("Shutting down...");
    session.stop().await?;
    println!("Done");
    Ok(())
}
