//! Censys certificate search. Paginated: page 1 reports the total page
//! count and the handler fans out one subtask per remaining page, capped.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use trawl_core::{
    source::{KeyRing, Source, split_multipart_key},
    task::{BasicAuth, OnResponse, RequestOpts, Task},
};

const SEARCH_URL: &str = "https://search.censys.io/api/v1/search/certificates";
const MAX_PAGES: u32 = 10;

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    results: Vec<CertResult>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Deserialize)]
struct CertResult {
    #[serde(rename = "parsed.names", default)]
    names: Vec<String>,
    #[serde(
        rename = "parsed.extensions.subject_alt_name.dns_names",
        default
    )]
    dns_names: Vec<String>,
}

#[derive(Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    pages: u32,
}

pub fn source() -> Source {
    Source {
        name: "censys",
        is_default: true,
        recursive: false,
        needs_key: true,
        keys: KeyRing::new(),
        dispatch: Box::new(dispatch),
    }
}

fn dispatch(source: &Arc<Source>, domain: &str) -> Task {
    let key = source.next_key().unwrap_or_default().to_owned();
    let (api_token, api_secret) =
        split_multipart_key(&key).unwrap_or_default();

    let mut task = Task::new(
        domain,
        RequestOpts {
            method: http::Method::POST,
            url: SEARCH_URL.to_owned(),
            headers: HashMap::from([(
                "Accept".to_owned(),
                "application/json".to_owned(),
            )]),
            content_type: Some("application/json".to_owned()),
            body: Some(request_body(domain, 1)),
            basic_auth: Some(BasicAuth {
                username: api_token.to_owned(),
                password: api_secret.to_owned(),
            }),
            source: "censys",
            uid: Some(api_token.to_owned()),
            ..Default::default()
        },
    )
    .with_metadata(Arc::new(1u32));
    task.on_response = Some(on_response());
    task.has_subtasks = true;
    task
}

fn on_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let api_response: ApiResponse = response.json().await?;

            let re = handle.extractor.get(&task.domain)?;
            for result in &api_response.results {
                for name in
                    result.names.iter().chain(result.dns_names.iter())
                {
                    if let Some(found) = re.find(name) {
                        handle
                            .subdomain(
                                &task.domain,
                                task.opts.source,
                                found.as_str(),
                            )
                            .await;
                    }
                }
            }

            // Only page 1 fans out; subtask pages carry their own page
            // number in metadata and stop here.
            let current = task.metadata::<u32>().copied().unwrap_or(1);
            let last = api_response.metadata.pages.min(MAX_PAGES);
            if current == 1 {
                for page in 2..=last {
                    let mut subtask =
                        task.clone().with_metadata(Arc::new(page));
                    subtask.opts.body =
                        Some(request_body(&task.domain, page));
                    handle.submit(subtask).await;
                }
            }
            Ok(())
        })
    })
}

fn request_body(domain: &str, page: u32) -> Vec<u8> {
    serde_json::json!({
        "query": domain,
        "page": page,
        "fields": [
            "parsed.names",
            "parsed.extensions.subject_alt_name.dns_names",
        ],
        "flatten": true,
    })
    .to_string()
    .into_bytes()
}
