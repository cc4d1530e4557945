//! crt.sh certificate transparency. Tries the public certwatch Postgres
//! database first (it returns far more rows than the web endpoint) and
//! falls back to the HTTP JSON export when the SQL path errors or comes
//! back empty.

use std::sync::Arc;

use anyhow::{Context, bail};
use serde::Deserialize;
use tokio_postgres::NoTls;
use tracing::debug;
use trawl_core::{
    source::{KeyRing, Source},
    task::{Bypass, ExecHandle, OnResponse, RequestOpts, Task},
};

const CERTWATCH_DB: &str =
    "host=crt.sh user=guest dbname=certwatch sslmode=disable";

const CERTWATCH_QUERY: &str = r#"WITH ci AS (
    SELECT min(sub.CERTIFICATE_ID) ID,
        min(sub.ISSUER_CA_ID) ISSUER_CA_ID,
        array_agg(DISTINCT sub.NAME_VALUE) NAME_VALUES,
        x509_commonName(sub.CERTIFICATE) COMMON_NAME,
        x509_notBefore(sub.CERTIFICATE) NOT_BEFORE,
        x509_notAfter(sub.CERTIFICATE) NOT_AFTER,
        encode(x509_serialNumber(sub.CERTIFICATE), 'hex') SERIAL_NUMBER
        FROM (SELECT *
                FROM certificate_and_identities cai
                WHERE plainto_tsquery('certwatch', $1) @@ identities(cai.CERTIFICATE)
                    AND cai.NAME_VALUE ILIKE ('%' || $1 || '%')
                LIMIT 10000
            ) sub
        GROUP BY sub.CERTIFICATE
)
SELECT array_to_string(ci.NAME_VALUES, chr(10)) NAME_VALUE
    FROM ci
            LEFT JOIN LATERAL (
                SELECT min(ctle.ENTRY_TIMESTAMP) ENTRY_TIMESTAMP
                    FROM ct_log_entry ctle
                    WHERE ctle.CERTIFICATE_ID = ci.ID
            ) le ON TRUE,
        ca
    WHERE ci.ISSUER_CA_ID = ca.ID
    ORDER BY le.ENTRY_TIMESTAMP DESC NULLS LAST;"#;

#[derive(Deserialize)]
struct CertEntry {
    name_value: String,
}

pub fn source() -> Source {
    Source {
        name: "crtsh",
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
            url: format!("https://crt.sh/?q=%25.{domain}&output=json"),
            source: "crtsh",
            ..Default::default()
        },
    );
    task.bypass = Some(sql_bypass());
    task.on_response = Some(on_response());
    task
}

/// The SQL path. Returning an error routes the task through the normal
/// HTTP path instead.
fn sql_bypass() -> Bypass {
    Arc::new(|task, handle| {
        Box::pin(async move {
            let count = query_certwatch(&task, &handle).await?;
            if count == 0 {
                bail!("certwatch returned no rows, falling back");
            }
            Ok(())
        })
    })
}

async fn query_certwatch(
    task: &Task,
    handle: &ExecHandle,
) -> anyhow::Result<usize> {
    let (client, connection) = tokio_postgres::connect(CERTWATCH_DB, NoTls)
        .await
        .context("connecting to certwatch")?;
    // The connection future drives the socket; it ends when the client
    // drops.
    let driver = tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(source = "crtsh", "certwatch connection error: {err:#}");
        }
    });

    let re = handle.extractor.get(&task.domain)?;
    let rows = client
        .query(CERTWATCH_QUERY, &[&task.domain])
        .await
        .context("querying certwatch")?;

    let mut count = 0;
    for row in &rows {
        let name_values: String = row.get(0);
        count += 1;
        for entry in name_values.lines() {
            if let Some(name) = re.find(entry) {
                handle
                    .subdomain(&task.domain, task.opts.source, name.as_str())
                    .await;
            }
        }
    }

    drop(client);
    let _ = driver.await;
    Ok(count)
}

fn on_response() -> OnResponse {
    Arc::new(|task, response, handle| {
        Box::pin(async move {
            let entries: Vec<CertEntry> = response.json().await?;
            let re = handle.extractor.get(&task.domain)?;
            for entry in entries {
                // One certificate row carries newline-separated SANs.
                for candidate in entry.name_value.lines() {
                    if let Some(name) = re.find(candidate) {
                        handle
                            .subdomain(
                                &task.domain,
                                task.opts.source,
                                name.as_str(),
                            )
                            .await;
                    }
                }
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cert_entries_decode_with_embedded_newlines() {
        let raw = r#"[{"id":1,"name_value":"x.example.com\ny.example.com"}]"#;
        let decoded: Vec<CertEntry> =
            serde_json::from_str(raw).expect("decodes");
        let names: Vec<&str> = decoded[0].name_value.lines().collect();
        assert_eq!(names, vec!["x.example.com", "y.example.com"]);
    }
}
