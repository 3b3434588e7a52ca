use std::path::PathBuf;

use clap::Parser;

use uemcp_endpoint::EndpointSelector;

/// MCP stdio bridge for an embedded Unreal tool host.
///
/// With no mode flag the process runs the stdio JSON-RPC server. The
/// `--once-*` / `--call-tool` flags are mutually exclusive one-shot modes.
#[derive(Parser, Debug)]
#[command(name = "ue-mcp", version, about)]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Connect, run one system.health call, print the snapshot, exit
    #[arg(long, conflicts_with_all = ["once_tools", "once_endpoints", "call_tool"])]
    pub once_health: bool,

    /// Connect, refresh the tool catalog, print it, exit
    #[arg(long, conflicts_with_all = ["once_endpoints", "call_tool"])]
    pub once_tools: bool,

    /// List discovered UE endpoint candidates and exit (no connection)
    #[arg(long, conflicts_with = "call_tool")]
    pub once_endpoints: bool,

    /// Call one downstream tool by name, print the result, exit
    #[arg(long, value_name = "NAME")]
    pub call_tool: Option<String>,

    /// JSON object passed as tool params with --call-tool
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub params_json: String,

    /// JSON object passed as tool context with --call-tool
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub context_json: String,

    /// Per-request timeout override for --call-tool
    #[arg(long, value_name = "N")]
    pub timeout_ms: Option<u64>,

    /// Stream event.* notifications while --call-tool runs
    #[arg(long, requires = "call_tool")]
    pub stream_events: bool,

    /// Print the runtime metrics snapshot at the end of a one-shot mode
    #[arg(long)]
    pub print_metrics: bool,

    /// Prefer the UE endpoint with this instance_id
    #[arg(long, value_name = "ID")]
    pub ue_instance_id: Option<String>,

    /// Prefer the UE endpoint with this project_dir
    #[arg(long, value_name = "DIR")]
    pub ue_project_dir: Option<String>,

    /// Prefer the UE endpoint with this process_id
    #[arg(long, value_name = "PID")]
    pub ue_process_id: Option<u32>,
}

impl Cli {
    /// CLI selector hints, or `None` so env-var hints apply.
    pub fn endpoint_selector(&self) -> Option<EndpointSelector> {
        let selector = EndpointSelector {
            instance_id: self
                .ue_instance_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            project_dir: self
                .ue_project_dir
                .as_deref()
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(str::to_string),
            process_id: self.ue_process_id.filter(|pid| *pid > 0),
        };
        selector.has_any().then_some(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["ue-mcp", "--once-health", "--once-tools"]).is_err());
        assert!(
            Cli::try_parse_from(["ue-mcp", "--once-endpoints", "--call-tool", "system.health"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["ue-mcp", "--once-health"]).is_ok());
    }

    #[test]
    fn stream_events_requires_call_tool() {
        assert!(Cli::try_parse_from(["ue-mcp", "--stream-events"]).is_err());
        assert!(
            Cli::try_parse_from(["ue-mcp", "--call-tool", "system.health", "--stream-events"])
                .is_ok()
        );
    }

    #[test]
    fn selector_is_none_without_hints() {
        let cli = Cli::try_parse_from(["ue-mcp"]).unwrap();
        assert!(cli.endpoint_selector().is_none());

        let cli = Cli::try_parse_from(["ue-mcp", "--ue-instance-id", "inst-1"]).unwrap();
        let selector = cli.endpoint_selector().unwrap();
        assert_eq!(selector.instance_id.as_deref(), Some("inst-1"));
    }
}
