use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use futures::StreamExt;
use http::{StatusCode, header};
use rand::seq::IndexedRandom;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    cancel::{CancelHandle, CancelReason},
    config::Config,
    ratelimit::{MultiLimiter, RatePolicy},
    task::RequestOpts,
};

/// A remote backoff longer than this means the source is too slow to be
/// useful in this run, so it is cancelled instead of waited for.
pub const MAX_REMOTE_BACKOFF: Duration = Duration::from_secs(5);

/// Bucket shared by sources with unknown or unenforceable quotas.
const DEFAULT_BUCKET: &str = "default";

/// Rotated per request; providers that fingerprint clients get a plausible
/// browser rather than a library default.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{source_name}: request cancelled")]
    Cancelled { source_name: &'static str },
    #[error("{source_name}: got status {status}, stopping source")]
    AuthFailed {
        source_name: &'static str,
        status: StatusCode,
    },
    #[error("{source_name}: remote rate limit hit (status {status})")]
    RateLimited {
        source_name: &'static str,
        status: StatusCode,
    },
    #[error("unexpected status code {status} received from '{url}'")]
    UnexpectedStatus {
        status: StatusCode,
        url: String,
        response: reqwest::Response,
    },
    #[error("request to '{url}' failed: {err}")]
    Transport {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("failed to build request: {0}")]
    Build(#[source] reqwest::Error),
}

impl SessionError {
    /// For status errors that still produced a response, hand the response
    /// back so the caller's handler can screen it itself.
    pub fn into_response(self) -> Result<reqwest::Response, Self> {
        match self {
            Self::UnexpectedStatus { response, .. } => Ok(response),
            other => Err(other),
        }
    }
}

/// The single network entry point shared by all workers.
///
/// Owns one connection-pooled HTTP client (TLS verification disabled,
/// optional proxy, per-request timeout) and the multi-keyed rate limiter;
/// every outbound request passes through the rate-limit decision point and
/// the status classification below. Lives for the full run.
pub struct Session {
    client: reqwest::Client,
    /// `None` when the user disabled rate limiting (allowance of zero).
    limiter: Option<MultiLimiter>,
    /// The effective per-source quota table: static defaults merged with
    /// user overrides at configuration time.
    rate_limits: HashMap<String, RatePolicy>,
    default_per_minute: u64,
}

impl Session {
    pub fn new(
        config: &Config,
        rate_limits: HashMap<String, RatePolicy>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(100)
            .connect_timeout(config.timeout)
            .timeout(config.timeout);

        if let Some(proxy) = &config.proxy {
            match reqwest::Proxy::all(proxy) {
                Ok(proxy) => builder = builder.proxy(proxy),
                // Log warning but continue anyway
                Err(err) => {
                    warn!("Invalid proxy provided: '{proxy}': {err:#}")
                }
            }
        }

        let client =
            builder.build().context("failed to build HTTP client")?;
        let limiter = (config.rate_limit != 0).then(MultiLimiter::new);

        Ok(Self {
            client,
            limiter,
            rate_limits,
            default_per_minute: config.rate_limit,
        })
    }

    /// Build, rate-limit and send the request described by `opts`, then
    /// classify the response status:
    ///
    /// - `401`/`403`: fire `opts.cancel` (stops the originating source) and
    ///   fail with [`SessionError::AuthFailed`].
    /// - `429` (and `204` for censys, which signals quota exhaustion that
    ///   way): apply the remote backoff policy and fail with
    ///   [`SessionError::RateLimited`].
    /// - other non-success: fail with [`SessionError::UnexpectedStatus`],
    ///   which still carries the response for handlers that screen statuses
    ///   themselves.
    /// - success: return the response; the caller consumes the body.
    pub async fn send(
        &self,
        global_cancel: &CancelHandle,
        opts: &RequestOpts,
    ) -> Result<reqwest::Response, SessionError> {
        let source = opts.source;
        if global_cancel.is_cancelled() || opts.cancel.is_cancelled() {
            return Err(SessionError::Cancelled { source_name: source });
        }

        let request = self.build_request(opts)?;

        // Token acquisition may block for a full window; keep it
        // interruptible from both cancellation planes.
        if let Some(limiter) = &self.limiter {
            let (key, policy) = self.rate_key(opts);
            let mut global = global_cancel.clone();
            let mut per_source = opts.cancel.clone();
            tokio::select! {
                biased;
                _ = global.recv() =>
                    return Err(SessionError::Cancelled { source_name: source }),
                _ = per_source.recv() =>
                    return Err(SessionError::Cancelled { source_name: source }),
                () = limiter.add_and_take(&key, policy) => (),
            }
        }

        let mut global = global_cancel.clone();
        let mut per_source = opts.cancel.clone();
        let response = tokio::select! {
            biased;
            _ = global.recv() =>
                return Err(SessionError::Cancelled { source_name: source }),
            _ = per_source.recv() =>
                return Err(SessionError::Cancelled { source_name: source }),
            result = self.client.execute(request) => result.map_err(|err| {
                SessionError::Transport { url: opts.url.clone(), err }
            })?,
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            // Possibly missing or bad credentials; stop the source from
            // sending more tasks.
            opts.cancel.cancel(CancelReason::AuthFailed);
            return Err(SessionError::AuthFailed { source_name: source, status });
        }

        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::NO_CONTENT && source == "censys")
        {
            debug!(source, %status, "hit remote rate limit");
            self.remote_backoff(&response, opts).await;
            return Err(SessionError::RateLimited { source_name: source, status });
        }

        if !status.is_success() {
            debug!(source, %status, url = %opts.url, "request failed");
            return Err(SessionError::UnexpectedStatus {
                status,
                url: opts.url.clone(),
                response,
            });
        }

        Ok(response)
    }

    /// Discards the response content by demand, letting the pool reuse the
    /// connection.
    pub async fn discard(response: reqwest::Response) {
        if let Err(err) = response.bytes().await {
            warn!("Could not discard response body: {err:#}");
        }
    }

    fn build_request(
        &self,
        opts: &RequestOpts,
    ) -> Result<reqwest::Request, SessionError> {
        let mut request = self
            .client
            .request(opts.method.clone(), &opts.url)
            .header(header::USER_AGENT, random_user_agent())
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, "en")
            .header(header::CONNECTION, "close");

        if let Some(auth) = &opts.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(cookies) = &opts.cookies {
            request = request.header(header::COOKIE, cookies);
        }
        for (name, value) in &opts.headers {
            request = request.header(name, value);
        }
        if let Some(content_type) = &opts.content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = &opts.body {
            request = request.body(body.clone());
        }

        request.build().map_err(SessionError::Build)
    }

    /// Selects the bucket and policy for a request: a source with a known
    /// nonzero quota gets its own bucket, sharded by credential when one is
    /// in use; everything else (unknown sources, zero-quota sentinels)
    /// shares the default bucket under the user-supplied allowance.
    fn rate_key(&self, opts: &RequestOpts) -> (String, RatePolicy) {
        match self.rate_limits.get(opts.source) {
            Some(policy) if policy.max_count > 0 => {
                let key = match &opts.uid {
                    Some(uid) => format!("{}-{uid}", opts.source),
                    None => opts.source.to_owned(),
                };
                (key, *policy)
            }
            _ => (
                DEFAULT_BUCKET.to_owned(),
                RatePolicy::per_minute(self.default_per_minute),
            ),
        }
    }

    /// Remote backoff: prefer the `Retry-After` header, fall back to the
    /// source's configured window. A zero or over-threshold backoff cancels
    /// the source; a short one is slept out, after which the source's
    /// bucket is replaced with a conservative 1-per-second profile.
    async fn remote_backoff(
        &self,
        response: &reqwest::Response,
        opts: &RequestOpts,
    ) {
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let configured = self
            .rate_limits
            .get(opts.source)
            .map(|policy| policy.duration)
            .filter(|duration| !duration.is_zero());
        let backoff = retry_after.or(configured).unwrap_or(Duration::ZERO);

        let limiter = match &self.limiter {
            Some(limiter) => limiter,
            None => {
                opts.cancel.cancel(CancelReason::RateLimited);
                return;
            }
        };

        if backoff.is_zero() || backoff > MAX_REMOTE_BACKOFF {
            opts.cancel.cancel(CancelReason::RateLimited);
            return;
        }

        let (key, _) = self.rate_key(opts);
        limiter
            .sleep_and_reset(backoff, &key, RatePolicy::per_second(1))
            .await;
    }
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Stream a line-oriented response body, invoking `f` once per non-empty
/// line. Bodies are read incrementally so large index responses never sit
/// in memory whole.
pub async fn each_line(
    response: reqwest::Response,
    mut f: impl FnMut(&str),
) -> anyhow::Result<()> {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("error while streaming response body")?;
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            emit_line(&line, &mut f);
        }
    }
    emit_line(&buf, &mut f);
    Ok(())
}

fn emit_line(raw: &[u8], f: &mut impl FnMut(&str)) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\r', '\n']);
    if !line.is_empty() {
        f(line);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn session(rate_limit: u64) -> Session {
        let config = Config {
            rate_limit,
            ..Default::default()
        };
        Session::new(&config, crate::ratelimit::default_rate_limits())
            .expect("session builds")
    }

    fn opts(source: &'static str, uid: Option<&str>) -> RequestOpts {
        RequestOpts {
            source,
            uid: uid.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn known_source_gets_its_own_bucket() {
        let session = session(10);
        let (key, policy) = session.rate_key(&opts("shodan", None));
        assert_eq!(key, "shodan");
        assert_eq!(policy, RatePolicy::per_second(1));
    }

    #[test]
    fn credentials_shard_the_bucket() {
        let session = session(10);
        let (k1, _) = session.rate_key(&opts("shodan", Some("key1")));
        let (k2, _) = session.rate_key(&opts("shodan", Some("key2")));
        assert_eq!(k1, "shodan-key1");
        assert_eq!(k2, "shodan-key2");
        assert_ne!(k1, k2);
    }

    #[test]
    fn unknown_and_zero_quota_sources_share_the_default_bucket() {
        let session = session(42);
        let (unknown_key, unknown_policy) =
            session.rate_key(&opts("brandnew", None));
        // `bufferover` has a documented quota that cannot be enforced here.
        let (zero_key, zero_policy) =
            session.rate_key(&opts("bufferover", Some("k")));

        assert_eq!(unknown_key, "default");
        assert_eq!(zero_key, "default");
        assert_eq!(unknown_policy, RatePolicy::per_minute(42));
        assert_eq!(zero_policy, RatePolicy::per_minute(42));
    }

    #[tokio::test]
    async fn each_line_splits_across_chunk_boundaries() {
        let body = reqwest::Body::from("a.example.com\r\nb.exa");
        // A body delivered as one chunk with a dangling partial line still
        // yields the partial line at end-of-stream.
        let response =
            reqwest::Response::from(http::Response::new(body));

        let mut lines = Vec::new();
        each_line(response, |line| lines.push(line.to_owned()))
            .await
            .expect("streams");
        assert_eq!(lines, vec!["a.example.com", "b.exa"]);
    }

    #[tokio::test]
    async fn each_line_skips_empty_lines() {
        let body = reqwest::Body::from("one\n\n\ntwo\n");
        let response =
            reqwest::Response::from(http::Response::new(body));

        let mut lines = Vec::new();
        each_line(response, |line| lines.push(line.to_owned()))
            .await
            .expect("streams");
        assert_eq!(lines, vec!["one", "two"]);
    }
}
