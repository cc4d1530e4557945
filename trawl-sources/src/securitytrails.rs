//! SecurityTrails domain intelligence API.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    subdomains: Vec<String>,
}

pub fn source() -> Source {
    Source {
        name: "securitytrails",
        is_default: true,
        recursive: true,
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
                "https://api.securitytrails.com/v1/domain/{domain}/subdomains"
            ),
            headers: HashMap::from([(
                "APIKEY".to_owned(),
                api_key.clone(),
            )]),
            source: "securitytrails",
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
            for subdomain in api_response.subdomains {
                let host = join_label(&subdomain, &task.domain);
                handle
                    .subdomain(&task.domain, task.opts.source, host)
                    .await;
            }
            Ok(())
        })
    })
}

/// The API returns bare labels; some already carry a trailing dot.
fn join_label(label: &str, domain: &str) -> String {
    if label.ends_with('.') {
        format!("{label}{domain}")
    } else {
        format!("{label}.{domain}")
    }
}
