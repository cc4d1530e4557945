//! Wires input, the passive fabric, and the result sinks together for one
//! enumeration run.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs,
    io::{self, BufRead, Write},
    path::Path,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trawl_core::{
    agent::Agent,
    cancel::{CancelHandle, CancelReason},
    config::Config,
    executor::Executor,
    extractor::Extractor,
    ratelimit::{RatePolicy, default_rate_limits},
    session::Session,
    source::Source,
    spawn::NamedTask,
    task::ResultKind,
};

use crate::{Args, output::OutputWriter};

static IP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9.]+$").expect("ip pattern compiles"));

/// What we remember about a host the first time it is seen.
struct Found {
    input: String,
    source: &'static str,
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let started = Instant::now();

    let domains = read_domains(&args)?;

    // Compile every input domain's pattern up front: a malformed domain is
    // an input error and aborts the run before anything is dispatched.
    let extractor = Arc::new(Extractor::new());
    for domain in &domains {
        extractor
            .get(domain)
            .with_context(|| format!("invalid input domain '{domain}'"))?;
    }

    let sources = select_sources(&args)?;
    if sources.is_empty() {
        bail!("no sources selected");
    }
    info!("Running {} sources", sources.len());

    let config = Config {
        max_tasks: args.max_tasks,
        rate_limit: args.rate_limit,
        timeout: Duration::from_secs(args.timeout),
        proxy: args.proxy.clone(),
        ..Default::default()
    };
    let rate_limits = effective_rate_limits(args.rate_limits.as_deref());
    let session = Arc::new(Session::new(&config, rate_limits)?);

    let global_cancel = CancelHandle::new();
    {
        let cancel = global_cancel.clone();
        NamedTask::spawn("ctrl-c", async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling the run");
                cancel.cancel(CancelReason::Interrupted);
            }
        })
        .detach();
    }

    let (executor, mut results) = Executor::new(
        &config,
        session,
        extractor.clone(),
        global_cancel.clone(),
    );
    let agent = Agent::new(sources);
    let (input_tx, input_rx) =
        mpsc::channel(config.input_buffer_size.max(1));
    let mut fabric = agent.start(&config, &executor, input_rx);
    fabric.push(executor.start());
    fabric.push({
        let domains = domains.clone();
        NamedTask::spawn("input-feeder", async move {
            for domain in domains {
                if input_tx.send(domain).await.is_err() {
                    break;
                }
            }
        })
    });

    // Drain the result stream until the fabric quiesces. Deduplication and
    // the host->sources map both key on the normalized host.
    let mut found: BTreeMap<String, Found> = BTreeMap::new();
    let mut sources_by_host: BTreeMap<String, BTreeSet<&'static str>> =
        BTreeMap::new();

    while let Some(result) = results.recv().await {
        match result.kind {
            ResultKind::Error(err) => {
                warn!(
                    "Could not run source '{}': {err:#}",
                    result.source
                );
            }
            ResultKind::Subdomain(value) => {
                let host = value.to_lowercase().replace("*.", "");
                let Ok(re) = extractor.get(&result.input) else {
                    continue;
                };
                if !re.is_match(&host) {
                    continue;
                }
                let reporters =
                    sources_by_host.entry(host.clone()).or_default();
                if reporters.insert(result.source) {
                    debug!("[{}] {host}", result.source);
                }
                found.entry(host).or_insert(Found {
                    input: result.input,
                    source: result.source,
                });
            }
        }
    }

    for task in fabric {
        if let Err(err) = task.await {
            warn!("fabric task failed: {err:#}");
        }
    }

    write_output(&args, &found, &sources_by_host)?;

    let elapsed = started.elapsed();
    for domain in &domains {
        let count = found
            .values()
            .filter(|entry| entry.input == *domain)
            .count();
        info!(
            "Found {count} subdomains for {domain} in {:.2}s",
            elapsed.as_secs_f64()
        );
    }

    Ok(())
}

fn write_output(
    args: &Args,
    found: &BTreeMap<String, Found>,
    sources_by_host: &BTreeMap<String, BTreeSet<&'static str>>,
) -> anyhow::Result<()> {
    let writer = OutputWriter::new(args.json);
    let hosts: BTreeMap<String, String> = found
        .iter()
        .map(|(host, entry)| (host.clone(), entry.source.to_owned()))
        .collect();

    let mut sinks: Vec<Box<dyn Write>> = vec![Box::new(io::stdout())];
    if let Some(path) = &args.output {
        let file = fs::File::create(path).with_context(|| {
            format!("failed to create output file {}", path.display())
        })?;
        sinks.push(Box::new(file));
    }

    for sink in &mut sinks {
        if args.collect_sources {
            writer.write_hosts_with_sources(sources_by_host, sink)?;
        } else {
            writer.write_hosts(&hosts, sink)?;
        }
    }
    Ok(())
}

/// Gathers apex domains from argv, an input file and/or stdin; sanitizes
/// and dedups them preserving arrival order.
fn read_domains(args: &Args) -> anyhow::Result<Vec<String>> {
    if args.domains.is_empty()
        && args.domains_file.is_none()
        && !args.stdin
    {
        bail!("no input: pass domains, --domains-file or --stdin");
    }

    let mut raw: Vec<String> = args.domains.clone();
    if let Some(path) = &args.domains_file {
        let file = fs::File::open(path).with_context(|| {
            format!("failed to open {}", path.display())
        })?;
        for line in io::BufReader::new(file).lines() {
            raw.push(line.context("failed to read domains file")?);
        }
    }
    if args.stdin {
        for line in io::stdin().lock().lines() {
            raw.push(line.context("failed to read stdin")?);
        }
    }

    let mut seen = HashSet::new();
    let mut domains = Vec::new();
    for line in raw {
        let Some(domain) = sanitize(&line) else { continue };
        if args.exclude_ips && IP_LINE.is_match(&domain) {
            continue;
        }
        if seen.insert(domain.clone()) {
            domains.push(domain);
        }
    }
    Ok(domains)
}

fn sanitize(line: &str) -> Option<String> {
    let domain = line.trim().to_lowercase();
    if domain.is_empty() { None } else { Some(domain) }
}

/// Applies key material and enablement filtering to the full roster.
fn select_sources(args: &Args) -> anyhow::Result<Vec<Source>> {
    let mut sources = trawl_sources::all_sources();

    if let Some(path) = &args.provider_config {
        let keys = read_provider_keys(path)?;
        for source in &mut sources {
            let matching: Vec<_> = keys
                .iter()
                .filter(|(name, _)| name == source.name)
                .map(|(_, key)| key.clone())
                .collect();
            source.add_keys(matching);
        }
    }

    let include: Option<HashSet<String>> =
        args.sources.as_deref().map(split_names);
    let exclude: HashSet<String> = args
        .exclude_sources
        .as_deref()
        .map(split_names)
        .unwrap_or_default();

    sources.retain(|source| {
        let selected = match &include {
            Some(names) => names.contains(source.name),
            None => args.all || source.is_default,
        };
        selected && !exclude.contains(source.name)
    });

    for source in &sources {
        if source.missing_keys() {
            debug!(
                source = source.name,
                "selected but no key configured; it will be skipped"
            );
        }
    }
    Ok(sources)
}

fn split_names(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

fn read_provider_keys(
    path: &Path,
) -> anyhow::Result<Vec<(String, String)>> {
    let raw = fs::read_to_string(path).with_context(|| {
        format!("failed to read provider config {}", path.display())
    })?;
    Ok(parse_provider_keys(&raw))
}

/// One `source=key` per line; blank lines and `#` comments are skipped.
fn parse_provider_keys(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(source, key)| {
            (source.trim().to_lowercase(), key.trim().to_owned())
        })
        .filter(|(_, key)| !key.is_empty())
        .collect()
}

/// The static quota table with user overrides applied on top. Overrides of
/// zero are ignored, mirroring the sentinel meaning of zero in the table
/// itself.
fn effective_rate_limits(
    overrides: Option<&str>,
) -> HashMap<String, RatePolicy> {
    let mut table = default_rate_limits();
    let Some(overrides) = overrides else {
        return table;
    };
    for part in overrides.split(',') {
        let Some((source, count)) = part.split_once('=') else {
            continue;
        };
        let count: u64 = count.trim().parse().unwrap_or(0);
        if count == 0 {
            continue;
        }
        table.insert(
            source.trim().to_lowercase(),
            RatePolicy::per_minute(count),
        );
    }
    table
}
