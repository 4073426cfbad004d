//! Command-line configuration, parsed with `clap`'s derive API with an
//! `SHIBA_` environment variable fallback for every field.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "shiba-agent", about = "Per-node IPv6-over-IPv6 pod network agent")]
pub struct Config {
    /// This node's name as registered with the cluster control plane.
    #[arg(long, env = "SHIBA_NODE_NAME")]
    pub node_name: String,

    /// Directory CNI configuration files are written to.
    #[arg(long, env = "SHIBA_CNI_CONFIG_PATH", default_value = "/etc/cni/net.d")]
    pub cni_config_path: PathBuf,

    /// Comma-separated cluster-wide pod CIDRs. When omitted, the agent
    /// falls back to the node's own advertised subnets, then to the
    /// cluster client's cluster-wide pool.
    #[arg(long, env = "SHIBA_CLUSTER_POD_CIDRS", value_delimiter = ',')]
    pub cluster_pod_cidrs: Option<Vec<String>>,

    /// Timeout for individual cluster API calls.
    #[arg(long, env = "SHIBA_API_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub api_timeout: Duration,

    /// MTU assigned to every ip6tnl tunnel link this agent creates.
    #[arg(long, env = "SHIBA_IP6TNL_MTU", default_value_t = 1450)]
    pub ip6tnl_mtu: u32,

    /// Path to a kubeconfig file. Empty means "use in-cluster config".
    /// Kept as an interface-only field: the concrete cluster client is
    /// out of scope here.
    #[arg(long, env = "SHIBA_KUBE_CONFIG_PATH")]
    pub kube_config_path: Option<PathBuf>,

    /// Base URL of the cluster control-plane REST+NDJSON endpoint used
    /// by the built-in HTTP cluster client.
    #[arg(long, env = "SHIBA_CLUSTER_API_URL")]
    pub cluster_api_url: String,

    /// TCP port for the debug HTTP endpoint (/healthz, /debug/peers).
    /// Non-positive disables it.
    #[arg(long, env = "SHIBA_DEBUG_PORT", default_value_t = 0)]
    pub debug_port: u16,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "SHIBA_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_parse(s).map_err(|e| format!("invalid duration [{s}]: {e}"))
}

/// A small duration parser accepting a bare integer (seconds) or a
/// `<n>s`/`<n>m`/`<n>h` suffix, avoiding a dependency on a full
/// humantime-style crate for this one CLI field.
fn humantime_parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let value: u64 = num.parse().map_err(|_| format!("not a number: {num}"))?;
    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit [{other}]")),
    }
}
