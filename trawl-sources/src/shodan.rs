//! Shodan DNS database.

use std::sync::Arc;

use anyhow::bail;
use serde::Deserialize;
use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    subdomains: Vec<String>,
    #[serde(default)]
    error: String,
}

pub fn source() -> Source {
    Source {
        name: "shodan",
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
                "https://api.shodan.io/dns/domain/{domain}?key={api_key}"
            ),
            source: "shodan",
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
            if !api_response.error.is_empty() {
                bail!("{}", api_response.error);
            }
            // Shodan returns bare labels.
            for label in api_response.subdomains {
                handle
                    .subdomain(
                        &task.domain,
                        task.opts.source,
                        format!("{label}.{}", task.domain),
                    )
                    .await;
            }
            Ok(())
        })
    })
}
