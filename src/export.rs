// Export module - writes captured interactions as JSON or JSON Lines
//
// JSON emits one array with chunks embedded in every interaction. JSONL
// writes one interaction per line - easy to stream, grep, and feed to jq -
// and leaves chunks out unless verbose output is requested.

use std::io::Write;

use anyhow::{Context, Result};

use crate::store::query::{InteractionFilter, StoreQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Jsonl,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Embed chunks in JSONL output (JSON always embeds them)
    pub verbose: bool,
    pub filter: InteractionFilter,
}

/// Page size for walking the store during export
const PAGE: u32 = 500;

/// Write all matching interactions to `out` in the requested format
pub fn export_interactions(
    query: &StoreQuery,
    opts: &ExportOptions,
    out: &mut dyn Write,
) -> Result<u64> {
    match opts.format {
        ExportFormat::Json => export_json(query, opts, out),
        ExportFormat::Jsonl => export_jsonl(query, opts, out),
    }
}

fn export_json(query: &StoreQuery, opts: &ExportOptions, out: &mut dyn Write) -> Result<u64> {
    let mut all = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = query.list_interactions(PAGE, offset, &opts.filter)?;
        let page_len = page.len() as u32;
        for row in page {
            // Re-fetch by id to embed the chunk trail
            if let Some(full) = query.get_interaction(&row.id)? {
                all.push(full);
            }
        }
        if page_len < PAGE {
            break;
        }
        offset += PAGE;
    }

    let count = all.len() as u64;
    serde_json::to_writer_pretty(&mut *out, &all).context("Failed to serialize export")?;
    writeln!(out)?;
    Ok(count)
}

fn export_jsonl(query: &StoreQuery, opts: &ExportOptions, out: &mut dyn Write) -> Result<u64> {
    let mut count = 0u64;
    let mut offset = 0u32;
    loop {
        let page = query.list_interactions(PAGE, offset, &opts.filter)?;
        let page_len = page.len() as u32;
        for row in page {
            let interaction = if opts.verbose {
                query.get_interaction(&row.id)?.unwrap_or(row)
            } else {
                row
            };
            let line =
                serde_json::to_string(&interaction).context("Failed to serialize export")?;
            writeln!(out, "{}", line)?;
            count += 1;
        }
        if page_len < PAGE {
            break;
        }
        offset += PAGE;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InteractionOutcome, PendingInteraction, Provider, RequestCapture, Usage};
    use crate::store::{InteractionStore, StoreConfig};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn seeded_query(dir: &tempfile::TempDir) -> StoreQuery {
        let db_path = dir.path().join("tap.db");
        let store = InteractionStore::open(StoreConfig {
            db_path: db_path.clone(),
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap();
        for (id, session) in [("e-1", Some("s")), ("e-2", None)] {
            store.insert_pending(PendingInteraction {
                id: id.to_string(),
                session_id: session.map(String::from),
                started_at: Utc::now(),
                provider: Provider::Ollama,
                method: "POST".to_string(),
                path: "/api/generate".to_string(),
                model: Some("llama3.2".to_string()),
                request: RequestCapture {
                    headers: BTreeMap::new(),
                    body: "{}".to_string(),
                    client_addr: None,
                    summary: Default::default(),
                },
            });
            store.complete(InteractionOutcome {
                id: id.to_string(),
                completed_at: Utc::now(),
                status_code: Some(200),
                model: None,
                response: Default::default(),
                usage: Usage::default(),
                cost_estimate: None,
                ttfb_ms: None,
                ttft_ms: None,
                total_latency_ms: Some(9),
                chunk_count: 0,
                error: None,
            });
        }
        store.shutdown();
        StoreQuery::new(&db_path).unwrap()
    }

    #[test]
    fn json_export_is_a_single_array() {
        let dir = tempfile::tempdir().unwrap();
        let query = seeded_query(&dir);
        let mut buf = Vec::new();
        let count = export_interactions(
            &query,
            &ExportOptions {
                format: ExportFormat::Json,
                verbose: false,
                filter: InteractionFilter::default(),
            },
            &mut buf,
        )
        .unwrap();
        assert_eq!(count, 2);
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }

    #[test]
    fn jsonl_export_is_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let query = seeded_query(&dir);
        let mut buf = Vec::new();
        export_interactions(
            &query,
            &ExportOptions {
                format: ExportFormat::Jsonl,
                verbose: false,
                filter: InteractionFilter::default(),
            },
            &mut buf,
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("id").is_some());
        }
    }

    #[test]
    fn filters_narrow_the_export() {
        let dir = tempfile::tempdir().unwrap();
        let query = seeded_query(&dir);
        let mut buf = Vec::new();
        let count = export_interactions(
            &query,
            &ExportOptions {
                format: ExportFormat::Jsonl,
                verbose: false,
                filter: InteractionFilter {
                    session_id: Some("s".to_string()),
                    ..Default::default()
                },
            },
            &mut buf,
        )
        .unwrap();
        assert_eq!(count, 1);
    }
}
