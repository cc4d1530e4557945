//! HackerTarget hostsearch, a line-oriented unauthenticated endpoint.

use std::sync::Arc;

use trawl_core::{
    session,
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

pub fn source() -> Source {
    Source {
        name: "hackertarget",
        is_default: true,
        recursive: true,
        needs_key: false,
        keys: KeyRing::new(),
        dispatch: Box::new(dispatch),
    }
}

fn dispatch(_source: &Arc<Source>, domain: &str) -> Task {
    let mut task = Task::new(
        domain,
        RequestOpts {
            url: format!(
                "https://api.hackertarget.com/hostsearch/?q={domain}"
            ),
            source: "hackertarget",
            ..Default::default()
        },
    );
    task.on_response = Some(on_response());
    task
}

fn on_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let re = handle.extractor.get(&task.domain)?;
            let mut found = Vec::new();
            session::each_line(response, |line| {
                for name in re.find_iter(line) {
                    found.push(name.as_str().to_owned());
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
