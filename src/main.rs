use abci_chain_adapter::config::{AppConfig, StrategyKind};
use abci_chain_adapter::validators::{CompensationStrategy, StaticStrategy, Strategy};
use abci_chain_adapter::{log_with_context, logger, network, Application, LedgerBackend};
use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

fn strategy(kind: StrategyKind) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::Static => Arc::new(StaticStrategy),
        StrategyKind::Compensation => Arc::new(CompensationStrategy::new()),
    }
}

#[actix_rt::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut config = AppConfig::from_env()?;
    if let Some(arg) = env::args().nth(1) {
        let addr: SocketAddr = arg
            .parse()
            .map_err(|e| format!("invalid listen address '{}': {}", arg, e))?;
        config = config.with_listen_addr(addr);
    }

    logger::init_logger(config.log_format);
    log_with_context!(
        info,
        listen_addr = %config.listen_addr,
        ledger_db_path = %config.ledger_db_path,
        "Starting ABCI adapter"
    );

    let backend = LedgerBackend::open(&config.ledger_db_path, config.query_timeout)?;
    let mut app = Application::new(strategy(config.strategy), &config);
    app.init(Arc::new(backend))?;

    let info = app.info().await?;
    info!(
        height = info.last_block_height,
        state = %app.state().await,
        "Resuming from committed state"
    );

    network::start_server(config.listen_addr, Arc::new(app)).await?;
    Ok(())
}
