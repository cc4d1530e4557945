use std::time::Duration;

/// Knobs for the executor and its session. All other configuration
/// (per-source quotas, output paths, key material) lives with the caller.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of each daemon's input-domain channel.
    pub input_buffer_size: usize,
    /// Capacity of the merged task channel; provides backpressure so one
    /// fast source cannot starve memory.
    pub task_buffer_size: usize,
    /// Maximum number of concurrently executing task bodies.
    pub max_tasks: usize,
    /// Optional HTTP(S)/SOCKS proxy URL for all outbound requests.
    pub proxy: Option<String>,
    /// Token allowance per minute for the shared `"default"` bucket used by
    /// sources with unknown or unenforceable quotas. Zero disables rate
    /// limiting entirely.
    pub rate_limit: u64,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_buffer_size: 10,
            task_buffer_size: 10,
            max_tasks: 10,
            proxy: None,
            rate_limit: 0,
            timeout: Duration::from_secs(30),
        }
    }
}
