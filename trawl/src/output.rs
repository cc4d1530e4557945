//! Result sinks: plain or JSON lines, host-only or host-with-sources.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Write},
};

/// Writes the deduplicated host set in the configured format.
pub struct OutputWriter {
    json: bool,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// One line per host; JSON mode includes the first source that
    /// reported it.
    pub fn write_hosts(
        &self,
        hosts: &BTreeMap<String, String>,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        for (host, source) in hosts {
            if self.json {
                let line = serde_json::json!({
                    "host": host,
                    "source": source,
                });
                writeln!(writer, "{line}")?;
            } else {
                writeln!(writer, "{host}")?;
            }
        }
        Ok(())
    }

    /// One line per host with every source that reported it.
    pub fn write_hosts_with_sources(
        &self,
        hosts: &BTreeMap<String, BTreeSet<&'static str>>,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        for (host, sources) in hosts {
            if self.json {
                let line = serde_json::json!({
                    "host": host,
                    "sources": sources,
                });
                writeln!(writer, "{line}")?;
            } else {
                let sources: Vec<&str> = sources.iter().copied().collect();
                writeln!(writer, "{host},[{}]", sources.join(","))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hosts() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("a.example.com".to_owned(), "anubis".to_owned()),
            ("b.example.com".to_owned(), "crtsh".to_owned()),
        ])
    }

    #[test]
    fn plain_hosts_one_per_line() {
        let mut out = Vec::new();
        OutputWriter::new(false)
            .write_hosts(&hosts(), &mut out)
            .expect("writes");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "a.example.com\nb.example.com\n",
        );
    }

    #[test]
    fn json_hosts_carry_the_source() {
        let mut out = Vec::new();
        OutputWriter::new(true)
            .write_hosts(&hosts(), &mut out)
            .expect("writes");
        let first = String::from_utf8(out)
            .expect("utf8")
            .lines()
            .next()
            .expect("one line")
            .to_owned();
        let parsed: serde_json::Value =
            serde_json::from_str(&first).expect("valid json");
        assert_eq!(parsed["host"], "a.example.com");
        assert_eq!(parsed["source"], "anubis");
    }

    #[test]
    fn source_map_lines_list_every_reporter() {
        let map = BTreeMap::from([(
            "a.example.com".to_owned(),
            BTreeSet::from(["anubis", "crtsh"]),
        )]);
        let mut out = Vec::new();
        OutputWriter::new(false)
            .write_hosts_with_sources(&map, &mut out)
            .expect("writes");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "a.example.com,[anubis,crtsh]\n",
        );
    }
}
