use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use hr_panel::comms::local_api::{self, AppState};
use hr_panel::config::Config;
use hr_panel::startup;
use hr_panel::utils;

#[derive(Parser)]
#[command(name = "hr-panel", version, about = "HR panel for Microsoft Graph directory users")]
struct AppCli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTPS server
    Serve(ServeArgs),
    /// Validate environment configuration and exit
    CheckConfig,
}

#[derive(Args)]
struct ServeArgs {
    /// Listening port; when omitted the port secret is read from Key Vault
    #[arg(long)]
    port: Option<u16>,
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
    /// Directory holding the HTML templates
    #[arg(long, default_value = "templates")]
    templates: String,
    /// Directory served under /static
    #[arg(long, default_value = "static")]
    static_dir: String,
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let boot = startup::bootstrap_from_lookup(|key| std::env::var(key).ok(), args.port).await?;

    let state = Arc::new(AppState::new(
        boot.config.clone(),
        boot.http_client.clone(),
        &args.templates,
        &args.static_dir,
    ));
    let addr = SocketAddr::new(args.bind, boot.port);

    let result = local_api::serve(state, addr, &boot.certificate).await;
    boot.certificate.remove();
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; the process environment wins over it
    let dotenv = dotenvy::dotenv();
    utils::logging::init();
    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "could not load .env"),
    }

    let args = AppCli::parse();
    match args.command {
        Commands::Serve(serve) => run_serve(serve).await?,
        Commands::CheckConfig => {
            let config = Config::from_env().context("loading configuration")?;
            info!(?config, "configuration ok");
        }
    }

    Ok(())
}
