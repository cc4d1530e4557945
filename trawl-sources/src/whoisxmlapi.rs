//! WhoisXML API subdomain lookup.

use std::sync::Arc;

use serde::Deserialize;
use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    result: ApiResult,
}

#[derive(Default, Deserialize)]
struct ApiResult {
    #[serde(default)]
    records: Vec<Record>,
}

#[derive(Deserialize)]
struct Record {
    domain: String,
}

pub fn source() -> Source {
    Source {
        name: "whoisxmlapi",
        is_default: true,
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
                "https://subdomains.whoisxmlapi.com/api/v1?apiKey={api_key}&domainName={domain}"
            ),
            source: "whoisxmlapi",
            uid: Some(api_key),
            ..Default::default()
        },
    );
    task.on_response = Some(on_response());
    task
}

fn on_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let api_response: ApiResponse = response.json().await?;
            for record in api_response.result.records {
                handle
                    .subdomain(&task.domain, task.opts.source, record.domain)
                    .await;
            }
            Ok(())
        })
    })
}
