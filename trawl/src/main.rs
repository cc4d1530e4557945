//! Passive subdomain enumeration CLI.

use std::path::PathBuf;

use argh::FromArgs;

mod logger;
mod output;
mod runner;

/// Enumerate subdomains of the given apex domains by querying passive
/// third-party data providers.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// apex domains to enumerate
    #[argh(positional)]
    pub domains: Vec<String>,

    /// newline-delimited file of apex domains
    #[argh(option, short = 'l')]
    pub domains_file: Option<PathBuf>,

    /// read apex domains from stdin
    #[argh(switch)]
    pub stdin: bool,

    /// comma-separated sources to use instead of the default set
    #[argh(option, short = 's')]
    pub sources: Option<String>,

    /// comma-separated sources to exclude
    #[argh(option)]
    pub exclude_sources: Option<String>,

    /// use every available source, not just the default set
    #[argh(switch)]
    pub all: bool,

    /// list the available sources and exit
    #[argh(switch)]
    pub list_sources: bool,

    /// credential file with one `source=key` per line; composite keys use
    /// `source=user:pass`
    #[argh(option)]
    pub provider_config: Option<PathBuf>,

    /// per-source quota overrides as comma-separated `source=count`
    /// (count per minute); applied before the run starts
    #[argh(option)]
    pub rate_limits: Option<String>,

    /// requests per minute for sources without a known quota; 0 disables
    /// rate limiting
    #[argh(option, default = "0")]
    pub rate_limit: u64,

    /// maximum number of concurrently executing tasks
    #[argh(option, default = "10")]
    pub max_tasks: usize,

    /// per-request timeout in seconds
    #[argh(option, default = "30")]
    pub timeout: u64,

    /// HTTP(S)/SOCKS proxy URL for all outbound requests
    #[argh(option)]
    pub proxy: Option<String>,

    /// also write results to this file
    #[argh(option, short = 'o')]
    pub output: Option<PathBuf>,

    /// emit JSON lines instead of plain hosts
    #[argh(switch)]
    pub json: bool,

    /// annotate each host with every source that reported it
    #[argh(switch)]
    pub collect_sources: bool,

    /// drop input lines that look like bare IP addresses
    #[argh(switch)]
    pub exclude_ips: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let args: Args = argh::from_env();

    if args.list_sources {
        list_sources();
        return Ok(());
    }

    runner::run(args).await
}

fn list_sources() {
    for source in trawl_sources::all_sources() {
        let mut flags = Vec::new();
        if source.is_default {
            flags.push("default");
        }
        if source.needs_key {
            flags.push("needs-key");
        }
        if source.recursive {
            flags.push("recursive");
        }
        println!("{} [{}]", source.name, flags.join(","));
    }
}
