//! ZoomEye domain search API. Paginated by total count with a fresh key
//! rotated in for every page.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

const PAGE_SIZE: u64 = 1000;

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    list: Vec<Entry>,
}

#[derive(Deserialize)]
struct Entry {
    name: String,
}

pub fn source() -> Source {
    Source {
        name: "zoomeyeapi",
        is_default: false,
        recursive: false,
        needs_key: true,
        keys: KeyRing::new(),
        dispatch: Box::new(dispatch),
    }
}

fn search_url(domain: &str, page: u64) -> String {
    format!(
        "https://api.zoomeye.org/domain/search?q={domain}&type=1&s=1000&page={page}"
    )
}

fn headers(api_key: &str) -> HashMap<String, String> {
    HashMap::from([
        ("API-KEY".to_owned(), api_key.to_owned()),
        ("Accept".to_owned(), "application/json".to_owned()),
        ("Content-Type".to_owned(), "application/json".to_owned()),
    ])
}

fn dispatch(source: &Arc<Source>, domain: &str) -> Task {
    let api_key = source.next_key().unwrap_or_default().to_owned();
    let mut task = Task::new(
        domain,
        RequestOpts {
            url: search_url(domain, 1),
            headers: headers(&api_key),
            source: "zoomeyeapi",
            uid: Some(api_key),
            ..Default::default()
        },
    )
    .with_metadata(Arc::new(1u64));
    task.on_response = Some(on_response(source.clone()));
    task.has_subtasks = true;
    task
}

fn on_response(source: Arc<Source>) -> OnResponse {
    Arc::new(move |task, response, handle| {
        let source = source.clone();
        Box::pin(async move {
            let api_response: ApiResponse = response.json().await?;
            for entry in api_response.list {
                handle
                    .subdomain(&task.domain, task.opts.source, entry.name)
                    .await;
            }

            let current = task.metadata::<u64>().copied().unwrap_or(1);
            let pages = api_response.total / PAGE_SIZE + 1;
            if current == 1 && pages > 1 {
                for page in 2..pages {
                    let api_key =
                        source.next_key().unwrap_or_default().to_owned();
                    let mut subtask =
                        task.clone().with_metadata(Arc::new(page));
                    subtask.opts.url = search_url(&task.domain, page);
                    subtask.opts.headers = headers(&api_key);
                    subtask.opts.uid = Some(api_key);
                    handle.submit(subtask).await;
                }
            }
            Ok(())
        })
    })
}
