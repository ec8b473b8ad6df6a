mod admin;
mod builder;
mod cli;
mod config;
mod control;
mod engine;
mod error;
mod events;
mod ledger;
mod log;
mod registry;
mod router;
mod store;
mod traits;
mod transport;
mod types;

use std::sync::Arc;

use builder::ManagerBuilder;
use clap::Parser;
use cli::{Cli, Commands};
use config::run_config;
use error::Result;
use traits::ManagerInteractor;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Match on the provided subcommand and execute the corresponding action.
    match &cli.command {
        Some(Commands::StartManager(args)) => {
            run_config(args);

            log::init_logger()?;

            let config = config::get_config()?.clone();
            let private_key = config.private_key.clone();

            // Build the manager from the resolved configuration and signing
            // key, then run it until a shutdown signal drains it.
            let manager = Arc::new(
                ManagerBuilder::default()
                    .config(config)
                    .keypair(private_key.as_deref())?
                    .build()
                    .await?,
            );

            manager.start_manager().await?;
        }

        _ => {
            println!("No command provided. Exiting.");
        }
    }
    Ok(())
}
