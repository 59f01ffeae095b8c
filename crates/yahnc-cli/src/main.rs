use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yahnc_sync::{SyncConfig, SyncRuntime};
use yahnc_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "yahnc")]
#[command(about = "Mirror Hacker News top stories into a Telegram channel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Web triggers, delivery workers and, when enabled, the cron scheduler.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one poll tick and print its summary.
    Poll {
        /// Also execute the enqueued tasks before exiting.
        #[arg(long)]
        drain: bool,
    },
    /// Run one cleanup tick and print its summary.
    Cleanup {
        #[arg(long)]
        drain: bool,
    },
    /// Execute every claimable task once.
    Work,
    /// Create the Postgres tables.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,yahnc=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Serve { port: None });
    if let Commands::Migrate = command {
        // Needs only DATABASE_URL, not the bot credentials.
        yahnc_sync::migrate_from_config(&config).await?;
        println!("migrations applied");
        return Ok(());
    }

    let runtime = SyncRuntime::from_config(config).await?;
    match command {
        Commands::Serve { port } => serve(runtime, port).await?,
        Commands::Poll { drain } => {
            let summary = runtime.reconciler().run_tick().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if drain {
                print_drain(&runtime).await?;
            }
        }
        Commands::Cleanup { drain } => {
            let summary = runtime.expirer().run_tick().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if drain {
                print_drain(&runtime).await?;
            }
        }
        Commands::Work => print_drain(&runtime).await?,
        Commands::Migrate => runtime.migrate().await?,
    }

    Ok(())
}

async fn print_drain(runtime: &SyncRuntime) -> Result<()> {
    let drained = runtime.drain().await?;
    println!(
        "drain complete: executed={} stored={} removed={} ineligible={} failed={}",
        drained.executed, drained.stored, drained.removed, drained.ineligible, drained.failed
    );
    Ok(())
}

async fn serve(runtime: SyncRuntime, port: Option<u16>) -> Result<()> {
    runtime.migrate().await?;

    let scheduler = runtime.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(
            poll = %runtime.config().poll_cron,
            cleanup = %runtime.config().cleanup_cron,
            "scheduler started"
        );
    }

    let workers = runtime.spawn_workers();
    let port = port.unwrap_or_else(yahnc_web::port_from_env);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;

    let state = AppState::from_runtime(&runtime);
    tokio::select! {
        served = yahnc_web::serve(listener, state) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    workers.shutdown_and_join().await;
    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
