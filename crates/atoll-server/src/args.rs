use clap::Parser;

#[derive(Debug, Parser)]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0:8820")]
    pub listen_addr: String,

    /// etcd endpoint for the metadata store. Omit to run on the
    /// in-memory store (single-node dev mode).
    #[arg(long, env = "ATOLL_ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    /// Base URL of the cluster agent. Omit to run against the
    /// in-process cluster simulator.
    #[arg(long, env = "ATOLL_CLUSTER_AGENT_URL")]
    pub cluster_agent_url: Option<String>,

    /// Bottom of the node-port range (inclusive).
    #[arg(long, default_value_t = 30100)]
    pub port_range_start: u16,

    /// Top of the node-port range (inclusive).
    #[arg(long, default_value_t = 30899)]
    pub port_range_end: u16,

    /// Readiness poll interval in seconds.
    #[arg(long, default_value_t = 2)]
    pub poll_interval_secs: u64,

    /// Wall-clock budget per deployment attempt in seconds.
    #[arg(long, default_value_t = 300)]
    pub readiness_timeout_secs: u64,

    /// Apply attempts per resource before a deployment is failed.
    #[arg(long, default_value_t = 3)]
    pub apply_attempts: u32,
}
