//! FullHunt attack-surface API.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    hosts: Vec<String>,
}

pub fn source() -> Source {
    Source {
        name: "fullhunt",
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
                "https://fullhunt.io/api/v1/domain/{domain}/subdomains"
            ),
            headers: HashMap::from([(
                "X-API-KEY".to_owned(),
                api_key.clone(),
            )]),
            source: "fullhunt",
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
            for host in api_response.hosts {
                handle
                    .subdomain(&task.domain, task.opts.source, host)
                    .await;
            }
            Ok(())
        })
    })
}
