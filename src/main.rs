//! todoat entry point: load configuration, wire the dispatcher, hand off
//! to the CLI command handlers.

use std::sync::Arc;

use clap::Parser;

use todoat::backends::CredentialFn;
use todoat::cli::{self, Cli};
use todoat::dispatch::Dispatcher;
use todoat::utils::config::TodoConfig;
use todoat::utils::error::TodoError;
use todoat::utils::logging;

/// Default credential lookup: `TODOAT_CREDENTIAL_<KEY>` from the
/// environment. Deployments wanting a keyring inject their own function
/// through the library API instead.
fn env_credentials() -> CredentialFn {
    Arc::new(|key: &str| {
        let var = format!(
            "TODOAT_CREDENTIAL_{}",
            key.to_uppercase().replace(['-', '.'], "_")
        );
        std::env::var(&var).map_err(|_| TodoError::Auth {
            backend: key.to_string(),
            reason: format!("credential {var} is not set"),
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TodoConfig::load().unwrap_or_else(|e| {
        eprintln!("configuration error: {e}");
        if let Some(hint) = e.suggestion() {
            eprintln!("hint: {hint}");
        }
        std::process::exit(2);
    });

    logging::init(&config.logging);

    let dispatcher = Dispatcher::new(config, env_credentials());
    if let Err(e) = cli::run(cli, &dispatcher).await {
        eprintln!("error: {e}");
        if let Some(hint) = e.suggestion() {
            eprintln!("hint: {hint}");
        }
        std::process::exit(1);
    }
    Ok(())
}
