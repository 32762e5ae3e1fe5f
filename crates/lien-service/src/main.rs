use clap::{Parser, ValueEnum};
use lien_adapters::{
    ScriptedKioskBridge, SimulatedLedger, SimulatedLedgerConfig, SimulatedLoan,
    UnsupportedKioskBridge,
};
use lien_core::capability::KioskBridge;
use lien_core::{Borrower, ChainProfile, EngineConfig, LienEngine, PollerConfig};
use lien_service::{build_router, ServiceState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceMode {
    /// In-memory device bridge with full pin support.
    Simulated,
    /// No kiosk capability; enforcement is display-only.
    Unsupported,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SeedLoan {
    None,
    Active,
    Overdue,
    Defaulted,
}

#[derive(Debug, Parser)]
#[command(name = "liend", version, about = "Lien enforcement REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8094
    #[arg(long, default_value = "127.0.0.1:8094")]
    listen: SocketAddr,
    /// Chain id loan reads are validated against.
    #[arg(long, default_value_t = 10_143, env = "LIEN_CHAIN_ID")]
    chain_id: u64,
    /// Display name of the expected network.
    #[arg(long, default_value = "Monad Testnet")]
    chain_name: String,
    /// Recurring poll period in seconds.
    #[arg(long, default_value_t = 30, env = "LIEN_POLL_INTERVAL_SECS")]
    poll_interval_secs: u64,
    /// Device bridge backing kiosk control.
    #[arg(long, value_enum, default_value_t = DeviceMode::Simulated)]
    device: DeviceMode,
    /// Borrower identity to enforce from startup.
    #[arg(long, env = "LIEN_BORROWER")]
    borrower: Option<String>,
    /// Demo loan seeded into the simulated ledger.
    #[arg(long, value_enum, default_value_t = SeedLoan::None)]
    seed_loan: SeedLoan,
    /// Principal of the seeded demo loan, in minor units.
    #[arg(long, default_value_t = 500_000)]
    seed_principal: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "lien_service=info,lien_core=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    let ledger = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig {
        chain_id: cli.chain_id,
        ..SimulatedLedgerConfig::default()
    }));
    match cli.seed_loan {
        SeedLoan::None => {}
        SeedLoan::Active => ledger.seed_loan(SimulatedLoan::active(cli.seed_principal)),
        SeedLoan::Overdue => ledger.seed_loan(SimulatedLoan::overdue(cli.seed_principal)),
        SeedLoan::Defaulted => ledger.seed_loan(SimulatedLoan::defaulted(cli.seed_principal)),
    }

    let bridge: Arc<dyn KioskBridge> = match cli.device {
        DeviceMode::Simulated => Arc::new(ScriptedKioskBridge::new()),
        DeviceMode::Unsupported => Arc::new(UnsupportedKioskBridge),
    };

    let config = EngineConfig {
        poller: PollerConfig {
            interval: Duration::from_secs(cli.poll_interval_secs),
            chain: ChainProfile {
                chain_id: cli.chain_id,
                name: cli.chain_name.clone(),
            },
            ..PollerConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Arc::new(LienEngine::new(config, ledger, bridge));

    if let Some(account) = cli.borrower.clone() {
        engine.start(Borrower::new(account)).await;
    }

    let state = ServiceState::new(engine);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("lien-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
