//! End-to-end fabric scenarios against loopback mock providers: daemons,
//! fan-out, pagination quiescence and per-source cancellation.

use std::{
    collections::BTreeSet,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{
    Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::get,
};
use serde_json::json;
use tokio::sync::mpsc;
use trawl_core::{
    agent::Agent,
    cancel::CancelHandle,
    config::Config,
    executor::Executor,
    extractor::Extractor,
    ratelimit::default_rate_limits,
    session::Session,
    source::{KeyRing, Source},
    task::{OnResponse, RequestOpts, ResultKind, SourceResult, Task},
};

struct MockProvider {
    addr: SocketAddr,
    auth_hits: Arc<AtomicUsize>,
    page_hits: Arc<AtomicUsize>,
    raw_hits: Arc<AtomicUsize>,
}

impl MockProvider {
    fn base(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn spawn_mock_provider() -> MockProvider {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let page_hits = Arc::new(AtomicUsize::new(0));
    let raw_hits = Arc::new(AtomicUsize::new(0));

    let auth = auth_hits.clone();
    let pages = page_hits.clone();
    let raws = raw_hits.clone();

    let app = Router::new()
        .route(
            "/list/{domain}",
            get(|Path(domain): Path<String>| async move {
                Json(json!([
                    format!("a.{domain}"),
                    format!("b.{domain}"),
                ]))
            }),
        )
        .route(
            "/empty/{domain}",
            get(|Path(_): Path<String>| async move {
                Json(json!([]))
            }),
        )
        .route(
            "/pages/{n}",
            get(move |Path(n): Path<u32>| {
                let pages = pages.clone();
                async move {
                    pages.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "names": [format!("page{n}.example.com")],
                        "pages": 5,
                    }))
                }
            }),
        )
        .route(
            "/auth",
            get(move || {
                let auth = auth.clone();
                async move {
                    auth.fetch_add(1, Ordering::SeqCst);
                    StatusCode::UNAUTHORIZED
                }
            }),
        )
        .route(
            "/search",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert(
                    "Link",
                    "</search2>; rel=\"next\"".parse().unwrap(),
                );
                (headers, Json(json!({ "items": ["/raw/1"] })))
            }),
        )
        .route(
            "/search2",
            get(|| async { Json(json!({ "items": ["/raw/2"] })) }),
        )
        .route(
            "/raw/1",
            get(move || {
                let raws = raws.clone();
                async move {
                    raws.fetch_add(1, Ordering::SeqCst);
                    "found x.example.com here\n"
                }
            }),
        )
        .route(
            "/raw/2",
            get(|| async { "and y.example.com there\n" }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock provider");
    });

    MockProvider {
        addr,
        auth_hits,
        page_hits,
        raw_hits,
    }
}

/// Wires session + executor + agent, feeds `domains`, and drains results
/// until the fabric quiesces on its own.
async fn run_fabric(
    sources: Vec<Source>,
    domains: &[&str],
) -> Vec<SourceResult> {
    let config = Config::default();
    let session = Arc::new(
        Session::new(&config, default_rate_limits())
            .expect("session builds"),
    );
    let (executor, mut results) = Executor::new(
        &config,
        session,
        Arc::new(Extractor::new()),
        CancelHandle::new(),
    );

    let agent = Agent::new(sources);
    let (input_tx, input_rx) = mpsc::channel(config.input_buffer_size);
    let mut tasks = agent.start(&config, &executor, input_rx);
    tasks.push(executor.start());

    for domain in domains {
        input_tx
            .send((*domain).to_owned())
            .await
            .expect("input channel open");
    }
    drop(input_tx);

    let collector = tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Some(result) = results.recv().await {
            collected.push(result);
        }
        collected
    });

    for task in tasks {
        task.await.expect("fabric task finishes cleanly");
    }
    collector.await.expect("collector finishes")
}

fn subdomains_of<'r>(
    results: &'r [SourceResult],
    source: &str,
) -> BTreeSet<&'r str> {
    results
        .iter()
        .filter(|result| result.source == source)
        .filter_map(|result| match &result.kind {
            ResultKind::Subdomain(name) => Some(name.as_str()),
            ResultKind::Error(_) => None,
        })
        .collect()
}

fn errors_of(results: &[SourceResult], source: &str) -> usize {
    results
        .iter()
        .filter(|result| result.source == source)
        .filter(|result| matches!(result.kind, ResultKind::Error(_)))
        .count()
}

/// A single-request list source pointed at the mock provider.
fn list_source(name: &'static str, base: String, path: &'static str) -> Source {
    let on_response: OnResponse = Arc::new(|task, response, handle| {
        Box::pin(async move {
            let names: Vec<String> = response.json().await?;
            for name in names {
                handle
                    .subdomain(&task.domain, task.opts.source, name)
                    .await;
            }
            Ok(())
        })
    });

    Source {
        name,
        is_default: true,
        recursive: false,
        needs_key: false,
        keys: KeyRing::new(),
        dispatch: Box::new(move |_source, domain| {
            let mut task = Task::new(
                domain,
                RequestOpts {
                    url: format!("{base}{path}/{domain}"),
                    source: name,
                    ..Default::default()
                },
            );
            task.on_response = Some(on_response.clone());
            task
        }),
    }
}

/// A source whose provider rejects every request with 401.
fn auth_failing_source(base: String) -> Source {
    let on_response: OnResponse = Arc::new(|_task, _response, _handle| {
        Box::pin(async move { Ok(()) })
    });

    Source {
        name: "authsource",
        is_default: true,
        recursive: false,
        needs_key: false,
        keys: KeyRing::new(),
        dispatch: Box::new(move |_source, domain| {
            let mut task = Task::new(
                domain,
                RequestOpts {
                    url: format!("{base}/auth"),
                    source: "authsource",
                    ..Default::default()
                },
            );
            task.on_response = Some(on_response.clone());
            task
        }),
    }
}

#[tokio::test]
async fn single_domain_single_source_happy_path() {
    let mock = spawn_mock_provider().await;
    let results = run_fabric(
        vec![list_source("listsource", mock.base(), "/list")],
        &["example.com"],
    )
    .await;

    let names = subdomains_of(&results, "listsource");
    assert_eq!(
        names,
        BTreeSet::from(["a.example.com", "b.example.com"]),
    );
    assert_eq!(errors_of(&results, "listsource"), 0);
}

#[tokio::test]
async fn empty_input_completes_with_zero_results() {
    let mock = spawn_mock_provider().await;
    let results = run_fabric(
        vec![list_source("listsource", mock.base(), "/list")],
        &[],
    )
    .await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn empty_provider_response_yields_no_results_and_no_error() {
    let mock = spawn_mock_provider().await;
    let results = run_fabric(
        vec![list_source("emptysource", mock.base(), "/empty")],
        &["example.com"],
    )
    .await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn keyed_source_without_keys_emits_nothing() {
    let mock = spawn_mock_provider().await;
    let mut source = list_source("keyedsource", mock.base(), "/list");
    source.needs_key = true;
    let results = run_fabric(vec![source], &["example.com"]).await;
    assert!(results.is_empty());
}

/// Pagination: page 1 reports five pages total; the handler emits one
/// subtask per remaining page and the run must not finish until all five
/// handlers completed.
#[tokio::test]
async fn paginated_source_quiesces_after_all_pages() {
    let mock = spawn_mock_provider().await;
    let base = mock.base();

    let on_response: OnResponse = Arc::new(move |task, response, handle| {
        Box::pin(async move {
            #[derive(serde::Deserialize)]
            struct PageResponse {
                names: Vec<String>,
                pages: u32,
            }
            let page_response: PageResponse = response.json().await?;
            for name in page_response.names {
                handle
                    .subdomain(&task.domain, task.opts.source, name)
                    .await;
            }

            let current = task.metadata::<u32>().copied().unwrap_or(1);
            let last = page_response.pages.min(10);
            if current == 1 {
                let base = task
                    .opts
                    .url
                    .rsplit_once("/pages/")
                    .map(|(base, _)| base.to_owned())
                    .expect("page url shape");
                for next in (current + 1)..=last {
                    let mut subtask = task.clone();
                    subtask.opts.url = format!("{base}/pages/{next}");
                    let subtask =
                        subtask.with_metadata(Arc::new(next));
                    handle.submit(subtask).await;
                }
            }
            Ok(())
        })
    });

    let source = Source {
        name: "pagedsource",
        is_default: true,
        recursive: false,
        needs_key: false,
        keys: KeyRing::new(),
        dispatch: Box::new(move |_source, domain| {
            let mut task = Task::new(
                domain,
                RequestOpts {
                    url: format!("{base}/pages/1"),
                    source: "pagedsource",
                    ..Default::default()
                },
            )
            .with_metadata(Arc::new(1u32));
            task.on_response = Some(on_response.clone());
            task.has_subtasks = true;
            task
        }),
    };

    let results = run_fabric(vec![source], &["example.com"]).await;

    assert_eq!(mock.page_hits.load(Ordering::SeqCst), 5);
    let names = subdomains_of(&results, "pagedsource");
    assert_eq!(
        names,
        BTreeSet::from([
            "page1.example.com",
            "page2.example.com",
            "page3.example.com",
            "page4.example.com",
            "page5.example.com",
        ]),
    );
}

/// A 401 from one provider cancels that source only; the other source's
/// results are unaffected, and exactly one request went out before the
/// daemon closed.
#[tokio::test]
async fn per_source_cancel_on_auth_failure_leaves_others_running() {
    let mock = spawn_mock_provider().await;
    let results = run_fabric(
        vec![
            auth_failing_source(mock.base()),
            list_source("listsource", mock.base(), "/list"),
        ],
        &["example.com"],
    )
    .await;

    assert_eq!(mock.auth_hits.load(Ordering::SeqCst), 1);
    assert_eq!(errors_of(&results, "authsource"), 1);
    assert!(subdomains_of(&results, "authsource").is_empty());
    assert_eq!(
        subdomains_of(&results, "listsource"),
        BTreeSet::from(["a.example.com", "b.example.com"]),
    );
}

/// Two-stage search: the first response yields a raw-file subtask plus a
/// `rel="next"` page subtask; the chain terminates on the page without a
/// Link header.
#[tokio::test]
async fn link_header_pagination_executes_all_stages() {
    let mock = spawn_mock_provider().await;
    let base = mock.base();

    let raw_handler: OnResponse = Arc::new(|task, response, handle| {
        Box::pin(async move {
            let re = handle.extractor.get(&task.domain)?;
            let body = response.text().await?;
            for line in body.lines() {
                for found in re.find_iter(line) {
                    handle
                        .subdomain(
                            &task.domain,
                            task.opts.source,
                            found.as_str(),
                        )
                        .await;
                }
            }
            Ok(())
        })
    });

    let search_handler: OnResponse = {
        let base = base.clone();
        let raw_handler = raw_handler.clone();
        Arc::new(move |task, response, handle| {
            let base = base.clone();
            let raw_handler = raw_handler.clone();
            Box::pin(async move {
                let next_path = response
                    .headers()
                    .get("Link")
                    .and_then(|value| value.to_str().ok())
                    .filter(|value| value.contains("rel=\"next\""))
                    .and_then(|value| {
                        Some(
                            value
                                .split_once('<')?
                                .1
                                .split_once('>')?
                                .0
                                .to_owned(),
                        )
                    });

                #[derive(serde::Deserialize)]
                struct SearchResponse {
                    items: Vec<String>,
                }
                let search: SearchResponse = response.json().await?;

                for item in search.items {
                    let mut raw_task = task.clone();
                    raw_task.opts.url = format!("{base}{item}");
                    raw_task.on_response = Some(raw_handler.clone());
                    handle.submit(raw_task).await;
                }

                if let Some(path) = next_path {
                    let mut next_page = task.clone();
                    next_page.opts.url = format!("{base}{path}");
                    handle.submit(next_page).await;
                }
                Ok(())
            })
        })
    };

    let source = Source {
        name: "searchsource",
        is_default: true,
        recursive: false,
        needs_key: false,
        keys: KeyRing::new(),
        dispatch: Box::new(move |_source, domain| {
            let mut task = Task::new(
                domain,
                RequestOpts {
                    url: format!("{base}/search"),
                    source: "searchsource",
                    ..Default::default()
                },
            );
            task.on_response = Some(search_handler.clone());
            task.has_subtasks = true;
            task
        }),
    };

    let results = run_fabric(vec![source], &["example.com"]).await;

    assert_eq!(mock.raw_hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        subdomains_of(&results, "searchsource"),
        BTreeSet::from(["x.example.com", "y.example.com"]),
    );
}
