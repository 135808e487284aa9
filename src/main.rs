use colored::Colorize;
use log::{error, info};
use thiserror::Error;
use tokio::runtime;

use soundbooth::{config::ConfigError, gateway, logging, Config, Server};

#[derive(Debug, Error)]
enum BoothError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl BoothError {
    fn hint(&self) -> String {
        match self {
            BoothError::Config(_) => {
                "Check the environment: JWT_SECRET is required, and SOUNDBOOTH_PORT must be a valid port number.".to_string()
            }
            BoothError::Fatal(_) => "This error is fatal, and should not happen.".to_string(),
        }
    }
}

fn run() -> Result<(), BoothError> {
    let config = Config::from_env()?;

    info!("Building async runtime...");
    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("soundbooth-async")
        .build()
        .map_err(|e| BoothError::Fatal(e.to_string()))?;

    let server = Server::new(&config);

    info!("Server {} is up as {}", server.name, server.id);
    info!("Join invite: {}", server.auth.sign_invite());

    runtime.block_on(gateway::run(server, config.port));

    Ok(())
}

fn main() {
    logging::init_logger();

    if let Err(error) = run() {
        error!(
            "{} Read the error below to troubleshoot the issue.",
            "Soundbooth failed to start!".bold().color("red")
        );
        error!("{}", error);
        error!(
            "{}",
            format!("Hint: {}", error.hint()).bright_black().italic()
        );
    }
}
