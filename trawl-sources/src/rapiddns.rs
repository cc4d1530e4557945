//! RapidDNS same-IP/subdomain scrape.

use std::sync::Arc;

use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

pub fn source() -> Source {
    Source {
        name: "rapiddns",
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
            url: format!("https://rapiddns.io/subdomain/{domain}?full=1"),
            source: "rapiddns",
            ..Default::default()
        },
    );
    task.on_response = Some(on_response());
    task
}

fn on_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            // The response is an HTML table; match anywhere in the page.
            let re = handle.extractor.get(&task.domain)?;
            let body = response.text().await?;
            for name in re.find_iter(&body) {
                handle
                    .subdomain(&task.domain, task.opts.source, name.as_str())
                    .await;
            }
            Ok(())
        })
    })
}
