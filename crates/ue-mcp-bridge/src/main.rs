use clap::Parser;
use serde_json::{Map, Value};
use tracing::info;

mod app;
mod cli;
mod dispatch;
mod stdio;

#[cfg(test)]
mod dispatch_tests;
#[cfg(test)]
mod stdio_tests;

use app::RunMode;
use cli::Cli;
use uemcp_config::AppConfig;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(config_error) => {
            eprintln!("Config error: {config_error}");
            return 2;
        }
    };

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.server.log_level.clone());
    init_tracing(&log_level, config.server.json_logs);

    let params = match parse_json_object_arg(&cli.params_json, "--params-json") {
        Ok(params) => params,
        Err(message) => {
            eprintln!("Argument error: {message}");
            return 2;
        }
    };
    let context = match parse_json_object_arg(&cli.context_json, "--context-json") {
        Ok(context) => context,
        Err(message) => {
            eprintln!("Argument error: {message}");
            return 2;
        }
    };

    let selector = cli.endpoint_selector();

    if cli.once_endpoints {
        return app::run_once_endpoints(&config, selector.as_ref());
    }

    let mode = if cli.once_health {
        RunMode::OnceHealth
    } else if cli.once_tools {
        RunMode::OnceTools
    } else if let Some(tool) = cli.call_tool.clone() {
        RunMode::CallTool {
            tool,
            params,
            context,
            timeout_ms: cli.timeout_ms,
            stream_events: cli.stream_events,
        }
    } else {
        RunMode::Stdio
    };

    tokio::select! {
        exit_code = app::run(config, selector.as_ref(), mode, cli.print_metrics) => exit_code,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted by user.");
            130
        }
    }
}

fn init_tracing(level: &str, json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);
    if json_logs {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}

fn parse_json_object_arg(raw: &str, arg_name: &str) -> Result<Map<String, Value>, String> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|e| format!("{arg_name} must be valid JSON object: {e}"))?;
    match parsed {
        Value::Null => Ok(Map::new()),
        Value::Object(object) => Ok(object),
        _ => Err(format!("{arg_name} must be a JSON object.")),
    }
}
