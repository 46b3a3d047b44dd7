use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use co2_device::config::LoaderSettings;
use co2_device::logging;
use co2_device::net::HttpUpdateServer;
use co2_device::ota::Loader;
use co2_device::process::TokioLauncher;
use co2_device::storage::BOOTSTRAP_LOG;

#[derive(Parser, Debug)]
#[command(author, version, about = "OTA bootstrap loader for the CO2 monitor", long_about = None)]
struct Args {
    /// Update server base URL (overrides UPDATE_SERVER_URL)
    #[arg(long)]
    server_url: Option<String>,

    /// Installation directory (overrides INSTALL_DIR)
    #[arg(long)]
    install_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = LoaderSettings::from_env();
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }
    if let Some(dir) = args.install_dir {
        settings.install_dir = dir;
    }

    let layout = settings.layout();
    let logging_ready = layout
        .ensure_root()
        .and_then(|()| logging::init(Some(&layout.log_file(BOOTSTRAP_LOG))));
    if let Err(e) = logging_ready {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    info!(
        server = %settings.server_url,
        install_dir = %settings.install_dir.display(),
        program = %settings.main_program,
        "Bootstrap starting"
    );

    let server = match HttpUpdateServer::new(&settings.server_url) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Cannot build HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let loader = Loader::new(Arc::new(server), Arc::new(TokioLauncher), settings);
    match loader.run().await {
        Ok(()) => {
            info!("Bootstrap finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Bootstrap stopped");
            ExitCode::FAILURE
        }
    }
}
