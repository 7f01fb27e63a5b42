//! Query interface for the interaction database
//!
//! Read-only connection pool over the same WAL-mode file the writer thread
//! appends to. WAL allows these readers to run concurrently with the writer;
//! the pool caps out at 4 connections for query parallelism.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params_from_iter, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::{
    Interaction, Provider, RequestCapture, ResponseCapture, SessionSummary, StreamChunk, Usage,
};

/// Filters for listing interactions
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractionFilter {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
}

/// Aggregates for the stats endpoint and CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_interactions: u64,
    pub total_errors: u64,
    /// Failed or upstream-errored share of all interactions, 0.0 - 1.0
    pub error_rate: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub by_provider: Vec<CountByKey>,
    pub by_model: Vec<CountByKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountByKey {
    pub key: String,
    pub count: u64,
}

pub struct StoreQuery {
    pool: Pool<SqliteConnectionManager>,
}

impl StoreQuery {
    /// Open the reader pool. The writer must have created the schema first.
    /// Connections are read-write at the SQLite level (WAL readers need the
    /// shared-memory file) but nothing in this type ever writes.
    pub fn new<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::file(db_path.as_ref()).with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );
        let pool = Pool::builder().max_size(4).build(manager)?;
        Ok(Self { pool })
    }

    /// List interactions newest-first, without their chunks
    pub fn list_interactions(
        &self,
        limit: u32,
        offset: u32,
        filter: &InteractionFilter,
    ) -> anyhow::Result<Vec<Interaction>> {
        let conn = self.pool.get()?;

        let (where_clause, args) = build_filter(filter);
        // limit/offset are typed integers, safe to inline
        let sql = format!(
            "SELECT {} FROM interactions {} ORDER BY started_at DESC LIMIT {} OFFSET {}",
            INTERACTION_COLUMNS, where_clause, limit, offset,
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), row_to_interaction)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Total rows matching a filter, for pagination
    pub fn count_interactions(&self, filter: &InteractionFilter) -> anyhow::Result<u64> {
        let conn = self.pool.get()?;
        let (where_clause, args) = build_filter(filter);
        let sql = format!("SELECT COUNT(*) FROM interactions {}", where_clause);
        let count: u64 =
            conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
        Ok(count)
    }

    /// One interaction with all its chunks in seq order, or None
    pub fn get_interaction(&self, id: &str) -> anyhow::Result<Option<Interaction>> {
        let conn = self.pool.get()?;

        let sql = format!(
            "SELECT {} FROM interactions WHERE id = ?1",
            INTERACTION_COLUMNS
        );
        let mut interaction = match conn
            .query_row(&sql, [id], row_to_interaction)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })? {
            Some(i) => i,
            None => return Ok(None),
        };

        let mut stmt = conn.prepare(
            "SELECT interaction_id, seq, received_at, event_type, raw, decoded_json
             FROM stream_chunks WHERE interaction_id = ?1 ORDER BY seq",
        )?;
        interaction.chunks = stmt
            .query_map([id], row_to_chunk)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(interaction))
    }

    /// Derived session aggregates, most recently active first
    pub fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT session_id,
                    COUNT(*),
                    MIN(started_at),
                    MAX(started_at),
                    GROUP_CONCAT(DISTINCT model)
             FROM interactions
             WHERE session_id IS NOT NULL
             GROUP BY session_id
             ORDER BY MAX(started_at) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let models: Option<String> = row.get(4)?;
            Ok(SessionSummary {
                session_id: row.get(0)?,
                interactions: row.get(1)?,
                first_seen: parse_ts(row.get::<_, Option<String>>(2)?),
                last_seen: parse_ts(row.get::<_, Option<String>>(3)?),
                models: models
                    .map(|m| m.split(',').map(String::from).collect())
                    .unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Aggregates across the whole store
    pub fn stats(&self) -> anyhow::Result<StoreStats> {
        let conn = self.pool.get()?;

        let (total, errors, prompt, completion, tokens): (u64, u64, u64, u64, u64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COUNT(CASE WHEN error IS NOT NULL OR status_code >= 400 THEN 1 END),
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        COALESCE(SUM(total_tokens), 0)
                 FROM interactions",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )?;

        let by_provider = self.count_by(&conn, "provider")?;
        let by_model = self.count_by(&conn, "model")?;

        Ok(StoreStats {
            total_interactions: total,
            total_errors: errors,
            error_rate: if total > 0 {
                errors as f64 / total as f64
            } else {
                0.0
            },
            total_prompt_tokens: prompt,
            total_completion_tokens: completion,
            total_tokens: tokens,
            by_provider,
            by_model,
        })
    }

    fn count_by(
        &self,
        conn: &rusqlite::Connection,
        column: &str,
    ) -> anyhow::Result<Vec<CountByKey>> {
        // Column name comes from a fixed internal set, never user input
        let sql = format!(
            "SELECT {col}, COUNT(*) FROM interactions
             WHERE {col} IS NOT NULL GROUP BY {col} ORDER BY COUNT(*) DESC",
            col = column
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(CountByKey {
                key: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

const INTERACTION_COLUMNS: &str = "id, session_id, started_at, completed_at, provider, method, \
     path, model, status_code, prompt_tokens, completion_tokens, total_tokens, tokens_heuristic, \
     cost_estimate, ttfb_ms, ttft_ms, total_latency_ms, chunk_count, error, request_json, \
     response_json";

fn build_filter(filter: &InteractionFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(provider) = &filter.provider {
        args.push(provider.clone());
        clauses.push(format!("provider = ?{}", args.len()));
    }
    if let Some(model) = &filter.model {
        args.push(model.clone());
        clauses.push(format!("model = ?{}", args.len()));
    }
    if let Some(session_id) = &filter.session_id {
        args.push(session_id.clone());
        clauses.push(format!("session_id = ?{}", args.len()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

fn row_to_interaction(row: &Row<'_>) -> rusqlite::Result<Interaction> {
    let provider: String = row.get(4)?;
    let request_json: Option<String> = row.get(19)?;
    let response_json: Option<String> = row.get(20)?;
    let heuristic: i64 = row.get::<_, Option<i64>>(12)?.unwrap_or(0);

    Ok(Interaction {
        id: row.get(0)?,
        session_id: row.get(1)?,
        started_at: parse_ts(row.get::<_, Option<String>>(2)?).unwrap_or_default(),
        completed_at: parse_ts(row.get::<_, Option<String>>(3)?),
        provider: Provider::parse(&provider).unwrap_or(Provider::Passthrough),
        method: row.get(5)?,
        path: row.get(6)?,
        model: row.get(7)?,
        status_code: row.get(8)?,
        usage: Usage {
            prompt_tokens: row.get(9)?,
            completion_tokens: row.get(10)?,
            total_tokens: row.get(11)?,
            heuristic: heuristic != 0,
        },
        cost_estimate: row.get(13)?,
        ttfb_ms: row.get(14)?,
        ttft_ms: row.get(15)?,
        total_latency_ms: row.get(16)?,
        chunk_count: row.get(17)?,
        error: row.get(18)?,
        request: request_json.and_then(|j| serde_json::from_str::<RequestCapture>(&j).ok()),
        response: response_json.and_then(|j| serde_json::from_str::<ResponseCapture>(&j).ok()),
        chunks: Vec::new(),
    })
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<StreamChunk> {
    let decoded_json: Option<String> = row.get(5)?;
    Ok(StreamChunk {
        interaction_id: row.get(0)?,
        seq: row.get(1)?,
        received_at: parse_ts(row.get::<_, Option<String>>(2)?).unwrap_or_default(),
        event_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        raw: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
        decoded: decoded_json.and_then(|j| serde_json::from_str(&j).ok()),
    })
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
