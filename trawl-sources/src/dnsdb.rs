//! Farsight DNSDB passive DNS, an NDJSON streaming endpoint.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use trawl_core::{
    session,
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

#[derive(Deserialize)]
struct RrsetRecord {
    rrname: String,
}

pub fn source() -> Source {
    Source {
        name: "dnsdb",
        is_default: false,
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
                "https://api.dnsdb.info/lookup/rrset/name/*.{domain}?limit=1000000000000"
            ),
            headers: HashMap::from([
                ("X-API-KEY".to_owned(), api_key.clone()),
                ("Accept".to_owned(), "application/json".to_owned()),
            ]),
            source: "dnsdb",
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
            let mut names = Vec::new();
            let mut parse_err = None;
            session::each_line(response, |line| {
                match serde_json::from_str::<RrsetRecord>(line) {
                    Ok(record) => names.push(
                        record.rrname.trim_end_matches('.').to_owned(),
                    ),
                    Err(err) => parse_err = Some(err),
                }
            })
            .await?;
            if let Some(err) = parse_err {
                return Err(err.into());
            }
            for name in names {
                handle
                    .subdomain(&task.domain, task.opts.source, name)
                    .await;
            }
            Ok(())
        })
    })
}
