//! pterm: decentralized terminal node entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Init logger at the configured level
//!   4. Open the node (asks for a node name on first run)
//!   5. Spawn the background relay ticker
//!   6. Run the shell until `exit`, EOF or Ctrl-C

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use pterm::{
    config::{self, Config},
    error::AppError,
    logger,
    node::NodeFacade,
    shell::{self, Shell},
    ticker::RelayTicker,
};

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    // .env is optional.
    let _ = dotenvy::dotenv();

    let config = config::load()?;
    logger::init(&config.log_level)?;

    info!(
        work_dir = %config.work_dir.display(),
        db = %config.db_path.display(),
        log_level = %config.log_level,
        "config loaded"
    );

    let node = NodeFacade::open(&config, || {
        println!("No identity found, creating one...");
        shell::ask_line(
            &mut io::stdin().lock(),
            &mut io::stdout(),
            "Enter a name for this node: ",
        )
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(Arc::new(node), config));
    // the shell thread may still be parked on stdin after Ctrl-C
    runtime.shutdown_background();
    result
}

async fn serve(node: Arc<NodeFacade>, config: Config) -> Result<(), AppError> {
    let shutdown = CancellationToken::new();

    let ticker = config
        .relay
        .tick_interval
        .map(|every| tokio::spawn(RelayTicker::new(node.clone(), every, shutdown.clone()).run()));

    let shell_node = node.clone();
    let mut shell_task = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        Shell::new(&shell_node, stdin.lock(), io::stdout()).run()
    });

    let result = tokio::select! {
        joined = &mut shell_task => joined
            .map_err(|e| AppError::Io(io::Error::other(format!("shell task: {e}"))))
            .and_then(|r| r),
        _ = tokio::signal::ctrl_c() => {
            println!("\nExiting...");
            info!("interrupt received");
            Ok(())
        }
    };

    shutdown.cancel();
    if let Some(ticker) = ticker {
        let _ = ticker.await;
    }
    result
}
