//! GitHub code search. Two-stage: the search endpoint yields item URLs
//! whose raw content is scanned in follow-up subtasks, and `Link`-header
//! pagination re-enters the executor as subtasks rather than recursing.
//!
//! Based on gwen001's github-search approach.

use std::{collections::HashMap, sync::Arc};

use http::StatusCode;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tracing::debug;
use trawl_core::{
    session,
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Deserialize)]
struct Item {
    html_url: String,
}

pub fn source() -> Source {
    Source {
        name: "github",
        is_default: false,
        recursive: false,
        needs_key: true,
        keys: KeyRing::new(),
        dispatch: Box::new(dispatch),
    }
}

fn dispatch(source: &Arc<Source>, domain: &str) -> Task {
    let api_key = source.next_key().unwrap_or_default().to_owned();
    let mut task = Task::new(
        domain,
        RequestOpts {
            url: format!(
                "https://api.github.com/search/code?per_page=100&q={domain}&sort=created&order=asc"
            ),
            headers: HashMap::from([
                (
                    "Accept".to_owned(),
                    "application/vnd.github.v3.text-match+json".to_owned(),
                ),
                ("Authorization".to_owned(), format!("token {api_key}")),
            ]),
            source: "github",
            uid: Some(api_key),
            ..Default::default()
        },
    );
    task.on_response = Some(on_search_response());
    task.has_subtasks = true;
    task
}

fn on_search_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            // Link header, first, next, last... grab it before the body
            // consumes the response.
            let next_url = response
                .headers()
                .get("Link")
                .and_then(|value| value.to_str().ok())
                .and_then(next_link);

            let search: SearchResponse = response.json().await?;
            for item in search.items {
                handle.submit(raw_file_task(&item.html_url, &task)).await;
            }

            if let Some(next_url) = next_url {
                match percent_decode_str(&next_url).decode_utf8() {
                    Ok(next_url) => {
                        let mut next_page = task.clone();
                        next_page.opts.url = next_url.into_owned();
                        handle.submit(next_page).await;
                    }
                    Err(err) => {
                        debug!(source = "github", "bad next link: {err:#}")
                    }
                }
            }
            Ok(())
        })
    })
}

fn raw_file_task(html_url: &str, parent: &Task) -> Task {
    let mut task = parent.clone();
    // Note: the public raw URL is used to fetch content and is fairly
    // slow; the API endpoint would need another authenticated call.
    task.opts = RequestOpts {
        url: raw_url(html_url),
        source: "github",
        uid: Some("unauth".to_owned()),
        cancel: parent.opts.cancel.clone(),
        ..Default::default()
    };
    task.on_response = Some(on_raw_response());
    task
}

fn on_raw_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            // Files move and repos vanish; anything but a 200 is skipped
            // without noise.
            if response.status() != StatusCode::OK {
                return Ok(());
            }
            let re = handle.extractor.get(&task.domain)?;
            let mut found = Vec::new();
            session::each_line(response, |line| {
                let line = normalize_content(line);
                for name in re.find_iter(&line) {
                    found.push(name.as_str().to_owned());
                }
            })
            .await?;
            for name in found {
                handle
                    .subdomain(&task.domain, task.opts.source, name)
                    .await;
            }
            Ok(())
        })
    })
}

/// Rewrite a search-hit HTML URL to the raw file it points at.
fn raw_url(html_url: &str) -> String {
    html_url
        .replace("https://github.com/", "https://raw.githubusercontent.com/")
        .replace("/blob/", "/")
}

/// Normalize content before matching: query-unescape and remove escaped
/// tabs and newlines so hostnames split across them still match.
fn normalize_content(content: &str) -> String {
    let decoded = percent_decode_str(content).decode_utf8_lossy();
    decoded.replace("\\t", "").replace("\\n", "")
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut sections = part.split(';');
        let url = sections
            .next()?
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');
        let is_next = sections.any(|section| {
            section.trim().trim_start_matches("rel=").trim_matches('"')
                == "next"
        });
        if is_next {
            return Some(url.to_owned());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn html_urls_rewrite_to_raw_urls() {
        assert_eq!(
            raw_url("https://github.com/org/repo/blob/main/conf.yaml"),
            "https://raw.githubusercontent.com/org/repo/main/conf.yaml",
        );
    }

    #[test]
    fn next_link_finds_the_next_relation() {
        let header = r#"<https://api.github.com/search/code?q=x&page=2>; rel="next", <https://api.github.com/search/code?q=x&page=5>; rel="last""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://api.github.com/search/code?q=x&page=2"),
        );
    }

    #[test]
    fn next_link_is_none_on_the_last_page() {
        let header = r#"<https://api.github.com/search/code?q=x&page=1>; rel="prev""#;
        assert_eq!(next_link(header), None);
        assert_eq!(next_link(""), None);
    }

    #[test]
    fn normalization_unsplits_escaped_hostnames() {
        assert_eq!(
            normalize_content("api\\t.example\\n.com"),
            "api.example.com"
        );
        assert_eq!(
            normalize_content("host%2eexample.com"),
            "host.example.com"
        );
    }
}
