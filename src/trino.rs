//! Paginated extraction from Trino's `system.runtime.queries` runtime view.
//!
//! Batches are read through a stable `ROW_NUMBER()` window ordered by
//! `query_id`. The view is live: rows can appear or disappear between the
//! count query and later windows, so a scan may skip or duplicate rows. That
//! is a known property of offset windows over a moving source. Duplicates
//! are absorbed by the idempotent sink writes, and skipped rows are picked up
//! by the next scheduled run. Resuming a scan means starting a new one from
//! offset 0, never continuing a half-consumed iterator.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::config::TrinoConfig;
use crate::models::QueryRecord;

/// One pagination step: rows with `offset < row_num <= offset + limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub offset: u64,
    pub limit: u64,
}

impl BatchWindow {
    pub fn end(&self) -> u64 {
        self.offset + self.limit
    }
}

/// Explicit offset cursor over `[0, total)`. Yields windows of at most
/// `batch_size` rows; the final window may be short.
#[derive(Debug, Clone)]
pub struct BatchWindows {
    total: u64,
    batch_size: u64,
    offset: u64,
}

impl BatchWindows {
    pub fn new(total: u64, batch_size: u64) -> Self {
        Self {
            total,
            batch_size: batch_size.max(1),
            offset: 0,
        }
    }
}

impl Iterator for BatchWindows {
    type Item = BatchWindow;

    fn next(&mut self) -> Option<BatchWindow> {
        if self.offset >= self.total {
            return None;
        }
        let limit = self.batch_size.min(self.total - self.offset);
        let window = BatchWindow {
            offset: self.offset,
            limit,
        };
        self.offset += limit;
        Some(window)
    }
}

/// Read side of the pipeline. Not safe for concurrent use; the batch loop
/// drives it from a single logical worker.
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Total rows currently visible in the source. Failure is fatal for the
    /// run: without a sizing target no partial scan is meaningful.
    async fn count(&self) -> Result<u64>;

    /// Fetch one window of records, ordered by `query_id`. May return fewer
    /// rows than `window.limit` if the source shrank mid-scan.
    async fn fetch_window(&self, window: BatchWindow) -> Result<Vec<QueryRecord>>;
}

#[async_trait]
impl<T: QuerySource + ?Sized> QuerySource for std::sync::Arc<T> {
    async fn count(&self) -> Result<u64> {
        (**self).count().await
    }

    async fn fetch_window(&self, window: BatchWindow) -> Result<Vec<QueryRecord>> {
        (**self).fetch_window(window).await
    }
}

const RUNTIME_QUERIES_COLUMNS: &str = r#"query_id, state, "user", "source", query, resource_group_id, queued_time_ms, analysis_time_ms, planning_time_ms, created, started, last_heartbeat, "end", error_type, error_code"#;

/// Client for the Trino REST statement protocol: POST the SQL to
/// `/v1/statement`, then follow `nextUri` until the result set is drained.
pub struct TrinoClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResults {
    #[serde(default)]
    next_uri: Option<String>,
    #[serde(default)]
    data: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_name: Option<String>,
}

impl TrinoClient {
    pub fn new(config: &TrinoConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build Trino HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.header("X-Trino-User", &self.user);
        match &self.password {
            Some(password) => req.basic_auth(&self.user, Some(password)),
            None => req,
        }
    }

    /// Run a statement to completion and collect all data pages.
    async fn execute(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
        let url = format!("{}/v1/statement", self.base_url);
        let mut page: StatementResults = self
            .authorize(self.http.post(&url))
            .body(sql.to_string())
            .send()
            .await
            .with_context(|| format!("Failed to submit statement to {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("Failed to decode Trino statement response")?;

        let mut rows: Vec<Vec<Value>> = Vec::new();
        loop {
            if let Some(error) = page.error.take() {
                bail!(
                    "Trino statement failed: {} ({})",
                    error.message.as_deref().unwrap_or("unknown error"),
                    error.error_name.as_deref().unwrap_or("UNKNOWN")
                );
            }
            if let Some(data) = page.data.take() {
                rows.extend(data);
            }
            let Some(next) = page.next_uri.take() else {
                break;
            };
            page = self
                .authorize(self.http.get(&next))
                .send()
                .await
                .with_context(|| format!("Failed to poll {next}"))?
                .error_for_status()?
                .json()
                .await
                .context("Failed to decode Trino statement page")?;
        }
        Ok(rows)
    }
}

#[async_trait]
impl QuerySource for TrinoClient {
    async fn count(&self) -> Result<u64> {
        tracing::info!("Counting rows in system.runtime.queries");
        let rows = self
            .execute("SELECT count(1) FROM system.runtime.queries")
            .await?;
        let count = rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("No answer from system.runtime.queries while counting rows"))?;
        tracing::info!("Counted {count} rows");
        Ok(count)
    }

    async fn fetch_window(&self, window: BatchWindow) -> Result<Vec<QueryRecord>> {
        let sql = format!(
            "SELECT {RUNTIME_QUERIES_COLUMNS} FROM ( \
                SELECT *, ROW_NUMBER() OVER (ORDER BY query_id) AS row_num \
                FROM system.runtime.queries \
            ) q WHERE row_num > {} AND row_num <= {}",
            window.offset,
            window.end()
        );
        let rows = self.execute(&sql).await?;
        tracing::info!(
            "Fetched rows {} - {} from source",
            window.offset,
            window.offset + rows.len() as u64
        );
        rows.iter().map(|row| record_from_row(row)).collect()
    }
}

fn record_from_row(row: &[Value]) -> Result<QueryRecord> {
    let query_id = row
        .first()
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("Row from system.runtime.queries is missing query_id"))?;

    Ok(QueryRecord {
        query_id,
        state: str_at(row, 1),
        user: str_at(row, 2),
        source: str_at(row, 3),
        query: str_at(row, 4),
        resource_group_id: str_array_at(row, 5),
        queued_time_ms: i64_at(row, 6),
        analysis_time_ms: i64_at(row, 7),
        planning_time_ms: i64_at(row, 8),
        created: timestamp_at(row, 9),
        started: timestamp_at(row, 10),
        last_heartbeat: timestamp_at(row, 11),
        end_time: timestamp_at(row, 12),
        error_type: str_at(row, 13),
        error_code: str_at(row, 14),
    })
}

fn str_at(row: &[Value], idx: usize) -> Option<String> {
    row.get(idx).and_then(Value::as_str).map(str::to_owned)
}

fn i64_at(row: &[Value], idx: usize) -> Option<i64> {
    row.get(idx).and_then(Value::as_i64)
}

fn str_array_at(row: &[Value], idx: usize) -> Option<Vec<String>> {
    row.get(idx).and_then(Value::as_array).map(|values| {
        values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect()
    })
}

fn timestamp_at(row: &[Value], idx: usize) -> Option<DateTime<Utc>> {
    let text = row.get(idx)?.as_str()?;
    let parsed = parse_trino_timestamp(text);
    if parsed.is_none() {
        tracing::debug!("Unparsable timestamp from source: {text:?}");
    }
    parsed
}

/// Trino serializes `timestamp with time zone` values as text. Accept
/// RFC 3339, an explicit numeric offset, or the common `... UTC` suffix;
/// anything else degrades to NULL rather than failing the batch.
fn parse_trino_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f %:z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(naive) = text
        .strip_suffix(" UTC")
        .and_then(|p| NaiveDateTime::parse_from_str(p, "%Y-%m-%d %H:%M:%S%.f").ok())
    {
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_windows_cover_range_without_gaps() {
        for (total, batch_size) in [(0u64, 5u64), (3, 2), (10, 3), (10, 10), (1, 100), (7, 1)] {
            let windows: Vec<BatchWindow> = BatchWindows::new(total, batch_size).collect();
            let mut expected_offset = 0;
            for window in &windows {
                assert_eq!(window.offset, expected_offset);
                assert!(window.limit >= 1 && window.limit <= batch_size);
                expected_offset = window.end();
            }
            assert_eq!(expected_offset, total, "total={total} batch={batch_size}");
        }
    }

    #[test]
    fn test_three_rows_batch_two() {
        let windows: Vec<BatchWindow> = BatchWindows::new(3, 2).collect();
        assert_eq!(
            windows,
            vec![
                BatchWindow { offset: 0, limit: 2 },
                BatchWindow { offset: 2, limit: 1 },
            ]
        );
    }

    #[test]
    fn test_empty_source_yields_no_windows() {
        assert_eq!(BatchWindows::new(0, 100).count(), 0);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let windows: Vec<BatchWindow> = BatchWindows::new(2, 0).collect();
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().all(|w| w.limit == 1));
    }

    #[test]
    fn test_record_from_row() {
        let row = vec![
            json!("20240505_100000_00001_abcde"),
            json!("FINISHED"),
            json!("etl"),
            json!("dbt"),
            json!("SELECT * FROM sales.orders"),
            json!(["global", "etl"]),
            json!(12),
            json!(34),
            json!(56),
            json!("2024-05-05 10:00:00.000 UTC"),
            json!("2024-05-05 10:00:01.000 UTC"),
            json!("2024-05-05 10:00:02.000 UTC"),
            json!("2024-05-05 10:00:03.500 UTC"),
            Value::Null,
            Value::Null,
        ];

        let record = record_from_row(&row).unwrap();
        assert_eq!(record.query_id, "20240505_100000_00001_abcde");
        assert_eq!(record.state.as_deref(), Some("FINISHED"));
        assert_eq!(
            record.resource_group_id,
            Some(vec!["global".to_string(), "etl".to_string()])
        );
        assert_eq!(record.queued_time_ms, Some(12));
        assert_eq!(record.duration_ms(), 2500);
        assert_eq!(record.error_type, None);
    }

    #[test]
    fn test_record_without_query_id_is_rejected() {
        assert!(record_from_row(&[Value::Null, json!("RUNNING")]).is_err());
        assert!(record_from_row(&[]).is_err());
    }

    #[test]
    fn test_parse_trino_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 5, 10, 0, 0).unwrap();
        assert_eq!(
            parse_trino_timestamp("2024-05-05T10:00:00Z"),
            Some(expected)
        );
        assert_eq!(
            parse_trino_timestamp("2024-05-05 10:00:00.000 +00:00"),
            Some(expected)
        );
        assert_eq!(
            parse_trino_timestamp("2024-05-05 10:00:00.000 UTC"),
            Some(expected)
        );
        assert_eq!(
            parse_trino_timestamp("2024-05-05 13:00:00.000 +03:00"),
            Some(expected)
        );
        assert_eq!(parse_trino_timestamp("not a timestamp"), None);
    }
}
