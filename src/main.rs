use anyhow::{Context, Result};
use clap::Parser;
use eventchain_indexer::{
    chain::ethrpc::EthRpc, config::Config, contract::Contract, database, indexer::Indexer,
};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Arguments {
    #[clap(short, long, env = "EVENTCHAIN_CONFIG", default_value = "indexer.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Arguments::parse();
    let config = Config::load(&args.config).context("failed to load configuration")?;
    tracing::info!("{config:#?}");

    let database = database::open(&config.database)
        .await
        .context("failed to open database")?;
    let chain = Arc::new(EthRpc::new(config.ethrpc.clone(), config.contract));
    let contract = Arc::new(Contract::new(chain.clone())?);
    let indexer = Indexer::new(chain, database, contract, config.settings())?;

    tokio::select! {
        result = indexer.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted during catch-up");
            indexer.stop().await;
            return Ok(());
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    indexer.stop().await;
    Ok(())
}
