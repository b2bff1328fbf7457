//! argoflow - Entry Point
//!
//! `argoflow controller` runs the workflow controller; `argoflow exec <mode>`
//! runs the in-pod executor.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use argoflow::app::env::ControllerEnv;
use argoflow::app::options::ControllerOptions;
use argoflow::app::run::{await_shutdown_signal, run};
use argoflow::cluster::{KubeRestClient, SharedClient};
use argoflow::executor::{run_mode, MODES};
use argoflow::logs::init::{init_logger, setup_signal_flush};
use argoflow::logs::{init_logging, LogLevel, LogOptions};
use argoflow::storage::settings::Settings;
use argoflow::utils::version_info;

use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "/etc/argoflow/config.yaml";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().skip(1).collect();
    let mut positional: Vec<String> = Vec::new();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    let mut raw = args.iter();
    while let Some(arg) = raw.next() {
        // Everything after `exec <mode>` belongs to the executor
        if positional.len() == 2 && positional[0] == "exec" {
            positional.push(arg.clone());
            positional.extend(raw.by_ref().cloned());
            break;
        }
        if let Some(flag) = arg.strip_prefix("--") {
            // Handle --key=value format and standalone flags like --version
            match flag.split_once('=') {
                Some((key, value)) => cli_args.insert(key.to_string(), value.to_string()),
                None => cli_args.insert(flag.to_string(), "true".to_string()),
            };
        } else {
            positional.push(arg.clone());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") || positional.first().map(String::as_str) == Some("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(rendered) => println!("{}", rendered),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let code = match positional.first().map(String::as_str) {
        Some("controller") => run_controller(&cli_args).await,
        Some("exec") => run_executor(&positional[1..], &cli_args).await,
        _ => {
            eprintln!("usage: argoflow controller [--config=<path>] | argoflow exec <mode> | argoflow version");
            eprintln!("executor modes: {}", MODES.join(", "));
            2
        }
    };
    std::process::exit(code);
}

async fn run_controller(cli_args: &HashMap<String, String>) -> i32 {
    setup_signal_flush();

    // Retrieve the settings file
    let config_path = cli_args
        .get("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let mut settings = if Path::new(config_path).exists() {
        match Settings::load(Path::new(config_path)).await {
            Ok(settings) => settings,
            Err(e) => {
                init_logger()
                    .with_field("path", config_path)
                    .with_error(&e)
                    .with_fatal()
                    .error("Unable to read settings file");
                return 1;
            }
        }
    } else {
        Settings::default()
    };
    if let Some(namespace) = cli_args.get("namespace") {
        settings.namespace = namespace.clone();
    }
    if let Some(level) = cli_args.get("loglevel").and_then(|l| l.parse::<LogLevel>().ok()) {
        settings.log_level = level;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        format: settings.log_format,
        log_dir: cli_args.get("log-dir").map(Into::into),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let client: SharedClient = match KubeRestClient::from_settings(&settings.cluster).await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create cluster client: {}", e);
            return 1;
        }
    };

    // Run the controller
    let options = ControllerOptions::new(settings, ControllerEnv::from_env());
    info!("Running workflow controller with options: {:?}", options);
    match run(options, client, await_shutdown_signal()).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Failed to run the controller: {e}");
            1
        }
    }
}

async fn run_executor(args: &[String], cli_args: &HashMap<String, String>) -> i32 {
    let Some(mode) = args.first() else {
        eprintln!("usage: argoflow exec <mode>, one of: {}", MODES.join(", "));
        return 2;
    };

    let log_level = cli_args
        .get("loglevel")
        .and_then(|l| l.parse::<LogLevel>().ok())
        .unwrap_or(LogLevel::Info);
    let _log_guard = match init_logging(LogOptions {
        log_level,
        ..Default::default()
    }) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    match run_mode(mode, &args[1..]).await {
        Ok(code) => code,
        Err(e) => {
            error!(mode = %mode, "executor failed: {}", e);
            e.exit_code()
        }
    }
}
