//! Common Crawl index. Two-stage: discover the active CDX indices for the
//! last few years, then query each as a subtask.

use std::{collections::HashMap, sync::Arc};

use chrono::Datelike;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use trawl_core::{
    session,
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

const INDEX_URL: &str = "https://index.commoncrawl.org/collinfo.json";
const MAX_YEARS_BACK: i32 = 5;

#[derive(Deserialize)]
struct IndexEntry {
    id: String,
    #[serde(rename = "cdx-api")]
    api_url: String,
}

pub fn source() -> Source {
    Source {
        name: "commoncrawl",
        is_default: false,
        recursive: false,
        needs_key: false,
        keys: KeyRing::new(),
        dispatch: Box::new(dispatch),
    }
}

fn dispatch(_source: &Arc<Source>, domain: &str) -> Task {
    let mut task = Task::new(
        domain,
        RequestOpts {
            url: INDEX_URL.to_owned(),
            source: "commoncrawl",
            ..Default::default()
        },
    );
    task.on_response = Some(on_index_response());
    task.has_subtasks = true;
    task
}

fn on_index_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let indexes: Vec<IndexEntry> = response.json().await?;
            let this_year = chrono::Utc::now().year();

            // One index per year, newest first; index ids embed the year.
            for year in (this_year - MAX_YEARS_BACK + 1)..=this_year {
                let year = year.to_string();
                if let Some(index) = indexes
                    .iter()
                    .find(|index| index.id.contains(&year))
                {
                    handle
                        .submit(cdx_task(&index.api_url, &task))
                        .await;
                }
            }
            Ok(())
        })
    })
}

fn cdx_task(api_url: &str, parent: &Task) -> Task {
    let mut task = parent.clone();
    task.opts = RequestOpts {
        url: format!("{api_url}?url=*.{}", parent.domain),
        headers: HashMap::from([(
            "Host".to_owned(),
            "index.commoncrawl.org".to_owned(),
        )]),
        source: "commoncrawl",
        cancel: parent.opts.cancel.clone(),
        ..Default::default()
    };
    task.on_response = Some(on_cdx_response());
    task
}

fn on_cdx_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let re = handle.extractor.get(&task.domain)?;
            let mut found = Vec::new();
            session::each_line(response, |line| {
                let line = percent_decode_str(line)
                    .decode_utf8_lossy()
                    .into_owned();
                if let Some(name) = re.find(&line) {
                    found.push(clean_encoded_host(name.as_str()));
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

/// CDX lines are sometimes double or triple URL-encoded; after decoding,
/// stray `25`/`2f` fragments can prefix the host.
fn clean_encoded_host(host: &str) -> String {
    let host = host.to_lowercase();
    let host = host.strip_prefix("25").unwrap_or(&host);
    let host = host.strip_prefix("2f").unwrap_or(host);
    host.to_owned()
}
