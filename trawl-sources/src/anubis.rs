//! Anubis subdomain database (jonlu.ca).

use std::sync::Arc;

use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

pub fn source() -> Source {
    Source {
        name: "anubis",
        is_default: true,
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
            url: format!("https://jonlu.ca/anubis/subdomains/{domain}"),
            source: "anubis",
            ..Default::default()
        },
    );
    task.on_response = Some(on_response());
    task
}

fn on_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let subdomains: Vec<String> = response.json().await?;
            for record in subdomains {
                handle
                    .subdomain(&task.domain, task.opts.source, record)
                    .await;
            }
            Ok(())
        })
    })
}
