//! Qianxin Hunter search API. Paginated by total count, 1000 results per
//! page, with a fresh key rotated in for every page.

use std::sync::Arc;

use anyhow::bail;
use base64::{Engine, engine::general_purpose::URL_SAFE};
use serde::Deserialize;
use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

const PAGE_SIZE: u64 = 1000;

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    data: ApiData,
    #[serde(default)]
    message: String,
}

#[derive(Default, Deserialize)]
struct ApiData {
    #[serde(rename = "arr", default)]
    info: Vec<Info>,
    #[serde(default)]
    total: u64,
}

#[derive(Deserialize)]
struct Info {
    domain: String,
}

pub fn source() -> Source {
    Source {
        name: "hunter",
        is_default: true,
        recursive: false,
        needs_key: true,
        keys: KeyRing::new(),
        dispatch: Box::new(dispatch),
    }
}

fn search_url(api_key: &str, query: &str, page: u64) -> String {
    format!(
        "https://hunter.qianxin.com/openApi/search?api-key={api_key}&search={query}&page={page}&page_size=100&is_web=3"
    )
}

fn encoded_query(domain: &str) -> String {
    URL_SAFE.encode(format!("domain=\"{domain}\""))
}

fn dispatch(source: &Arc<Source>, domain: &str) -> Task {
    let api_key = source.next_key().unwrap_or_default().to_owned();
    let query = encoded_query(domain);

    let keyed_source = source.clone();
    let mut task = Task::new(
        domain,
        RequestOpts {
            url: search_url(&api_key, &query, 1),
            source: "hunter",
            uid: Some(api_key),
            ..Default::default()
        },
    )
    .with_metadata(Arc::new(1u64));
    task.on_response = Some(on_response(keyed_source, query));
    task.has_subtasks = true;
    task
}

fn on_response(source: Arc<Source>, query: String) -> OnResponse {
    Arc::new(move |task, response, handle| {
        let source = source.clone();
        let query = query.clone();
        Box::pin(async move {
            let api_response: ApiResponse = response.json().await?;
            if api_response.code == 401 || api_response.code == 400 {
                bail!("{}", api_response.message);
            }
            for info in api_response.data.info {
                handle
                    .subdomain(&task.domain, task.opts.source, info.domain)
                    .await;
            }

            let current = task.metadata::<u64>().copied().unwrap_or(1);
            let pages = api_response.data.total / PAGE_SIZE + 1;
            if current == 1 && pages > 1 {
                for page in 2..pages {
                    let api_key =
                        source.next_key().unwrap_or_default().to_owned();
                    let mut subtask =
                        task.clone().with_metadata(Arc::new(page));
                    subtask.opts.url = search_url(&api_key, &query, page);
                    subtask.opts.uid = Some(api_key);
                    handle.submit(subtask).await;
                }
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_is_urlsafe_base64() {
        let query = encoded_query("example.com");
        let decoded = URL_SAFE.decode(&query).expect("round trips");
        assert_eq!(decoded, b"domain=\"example.com\"");
    }

    #[test]
    fn search_url_carries_key_and_page() {
        let url = search_url("k1", "cXVlcnk=", 4);
        assert!(url.contains("api-key=k1"));
        assert!(url.contains("page=4"));
    }
}
