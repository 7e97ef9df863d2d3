use std::path::PathBuf;

use clap::Parser;

use call_net::telemetry;
use pairsim::{BoxError, RelayMode, SimConfig, SimSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Fleet simulator for the call pairing service")]
struct SimCli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    users: Option<usize>,

    #[arg(long, value_enum, value_name = "MODE")]
    relay: Option<CliRelayMode>,

    #[arg(long, value_name = "URL")]
    relay_url: Option<String>,

    #[arg(long, value_name = "ADDR")]
    metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliRelayMode {
    Memory,
    Http,
}

impl SimCli {
    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        std::env::var("PAIRSIM_CONFIG_PATH").ok().map(PathBuf::from)
    }

    fn apply_overrides(&self, settings: &mut SimSettings) {
        if let Some(users) = self.users {
            settings.users = users;
        }
        if let Some(mode) = self.relay {
            settings.relay = match mode {
                CliRelayMode::Memory => RelayMode::Memory,
                CliRelayMode::Http => RelayMode::Http,
            };
        }
        if let Some(url) = &self.relay_url {
            settings.relay_url = Some(url.clone());
        }
        if let Some(addr) = &self.metrics_addr {
            settings.metrics_addr = Some(addr.clone());
        }
    }
}

fn build_config(cli: &SimCli) -> Result<SimConfig, BoxError> {
    let mut settings = if let Some(path) = cli.resolve_config_path() {
        SimSettings::from_file(&path)?
    } else {
        SimSettings::from_env()?
    };

    cli.apply_overrides(&mut settings);

    Ok(settings.into_config())
}

#[tokio::main]
async fn main() {
    telemetry::init("pairsim");

    let cli = SimCli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "pairsim: cannot build configuration");
            return;
        }
    };

    match pairsim::run_with_ctrl_c(config).await {
        Ok(report) => {
            tracing::info!(
                connected = report.connected,
                users = report.users,
                "simulation finished"
            );
        }
        Err(err) => tracing::error!(%err, "simulation ended with an error"),
    }
}
