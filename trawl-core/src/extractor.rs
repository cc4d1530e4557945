use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use regex::Regex;

/// Extracts valid subdomains of an apex domain from arbitrary text.
///
/// One pattern is compiled per apex on first request and memoized for the
/// rest of the run; the registry is shared by every source and worker. Hits
/// take the read lock only, so the exclusive section is limited to the
/// first request for each domain.
///
/// The pattern is anchored against the apex but not against word
/// boundaries; callers are expected to post-process leading `.` and case.
#[derive(Debug, Default)]
pub struct Extractor {
    patterns: RwLock<HashMap<String, Arc<Regex>>>,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the subdomain pattern for `domain`, compiling and caching it
    /// on first use.
    ///
    /// The apex is regex-escaped, so compilation cannot fail for any domain
    /// that survived input sanitization; an error here means sanitization
    /// was bypassed and the run should abort.
    pub fn get(&self, domain: &str) -> anyhow::Result<Arc<Regex>> {
        if let Some(re) = self
            .patterns
            .read()
            .expect("extractor lock poisoned")
            .get(domain)
        {
            return Ok(re.clone());
        }

        let mut patterns =
            self.patterns.write().expect("extractor lock poisoned");
        // Another caller may have compiled it while we waited for the lock.
        if let Some(re) = patterns.get(domain) {
            return Ok(re.clone());
        }

        let re = Regex::new(&format!(
            r"[a-zA-Z0-9*_.-]+\.{}",
            regex::escape(domain)
        ))
        .with_context(|| {
            format!("failed to create subdomain extractor for {domain}")
        })?;
        let re = Arc::new(re);
        patterns.insert(domain.to_owned(), re.clone());
        Ok(re)
    }
}
