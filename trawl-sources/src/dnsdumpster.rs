//! DNSDumpster. Two-stage: fetch the landing page for a CSRF token, then
//! post the search form as a subtask.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use anyhow::bail;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use trawl_core::{
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, Task},
};

const PAGE_URL: &str = "https://dnsdumpster.com/";

static CSRF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "<input type=\"hidden\" name=\"csrfmiddlewaretoken\" value=\"(.*)\">",
    )
    .expect("csrf pattern compiles")
});

pub fn source() -> Source {
    Source {
        name: "dnsdumpster",
        is_default: false,
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
            url: PAGE_URL.to_owned(),
            source: "dnsdumpster",
            ..Default::default()
        },
    );
    task.on_response = Some(on_page_response());
    task.has_subtasks = true;
    task
}

fn on_page_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let page = response.text().await?;
            match csrf_token(&page) {
                Some(token) => {
                    handle.submit(form_task(&token, &task)).await;
                    Ok(())
                }
                None => bail!("failed to fetch csrf token"),
            }
        })
    })
}

fn form_task(token: &str, parent: &Task) -> Task {
    let mut task = parent.clone();
    task.opts = RequestOpts {
        method: http::Method::POST,
        url: PAGE_URL.to_owned(),
        cookies: Some(format!(
            "csrftoken={token}; Domain=dnsdumpster.com"
        )),
        headers: HashMap::from([
            ("Referer".to_owned(), "https://dnsdumpster.com".to_owned()),
            ("X-CSRF-Token".to_owned(), token.to_owned()),
        ]),
        content_type: Some("application/x-www-form-urlencoded".to_owned()),
        body: Some(form_body(token, &parent.domain).into_bytes()),
        source: "dnsdumpster",
        cancel: parent.opts.cancel.clone(),
        ..Default::default()
    };
    task.on_response = Some(on_form_response());
    task
}

fn on_form_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let re = handle.extractor.get(&task.domain)?;
            let page = response.text().await?;
            for name in re.find_iter(&page) {
                handle
                    .subdomain(&task.domain, task.opts.source, name.as_str())
                    .await;
            }
            Ok(())
        })
    })
}

fn csrf_token(page: &str) -> Option<String> {
    CSRF_RE
        .captures(page)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().trim().to_owned())
        .filter(|token| !token.is_empty())
}

fn form_body(token: &str, domain: &str) -> String {
    let encode = |value: &str| {
        utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
    };
    format!(
        "csrfmiddlewaretoken={}&targetip={}&user=free",
        encode(token),
        encode(domain),
    )
}
