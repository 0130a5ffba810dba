//! Study Agent - Entry Point
//!
//! Runs either the deployment host (`--host`) or a device agent taking part in
//! the studies listed in its settings file.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use study_agent::app::options::{AppOptions, Mode};
use study_agent::app::run::run;
use study_agent::logs::{init_logging, LogOptions};
use study_agent::storage::layout::StorageLayout;
use study_agent::storage::settings::Settings;
use study_agent::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();
    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            cli_args.insert(key.trim_start_matches('-').to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            cli_args.insert(arg.trim_start_matches('-').to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("Failed to print version: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("base-dir") {
        Some(base_dir) => StorageLayout::new(base_dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings = match Settings::load(&layout.settings_file()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        json_format: settings.json_logs,
        log_dir: settings.log_to_file.then(|| layout.logs_dir().path().to_path_buf()),
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let mode = if cli_args.contains_key("host") {
        Mode::Host
    } else {
        Mode::Device
    };
    let options = AppOptions::from_settings(mode, layout, &settings);

    info!("Running study agent with options: {:?}", options);
    match run(options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run the study agent: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
        info!("Ctrl+C received, shutting down...");
    }
}
