use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::lineage::Lineage;

/// One finished (or running) query as seen in `system.runtime.queries`.
///
/// Immutable once ingested, except `state`: re-ingesting the same `query_id`
/// overwrites only the state column.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::trino_queries_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct QueryRecord {
    pub query_id: String,
    pub state: Option<String>,
    pub user: Option<String>,
    pub source: Option<String>,
    pub query: Option<String>,
    pub resource_group_id: Option<Vec<String>>,
    pub queued_time_ms: Option<i64>,
    pub analysis_time_ms: Option<i64>,
    pub planning_time_ms: Option<i64>,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_type: Option<String>,
    pub error_code: Option<String>,
}

/// A table name discovered by lineage extraction, one row per distinct name.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::trino_query_objects)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct QueryObject {
    pub id: i32,
    pub name: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::trino_query_objects)]
pub struct NewQueryObject {
    pub name: String,
}

/// Many-to-many link between a discovered table and a query referencing it.
#[derive(Queryable, Insertable, Debug, Clone, PartialEq, Eq, Hash)]
#[diesel(table_name = crate::schema::trino_queries_and_query_objects_lnk)]
pub struct QueryObjectLink {
    pub object_id: i32,
    pub query_id: String,
}

/// A query record together with its extraction result.
#[derive(Debug, Clone)]
pub struct QueryWithLineage {
    pub record: QueryRecord,
    pub lineage: Lineage,
}

impl QueryRecord {
    /// Elapsed execution time in milliseconds, 0 when the query never ended.
    pub fn duration_ms(&self) -> i64 {
        match (self.started, self.end_time) {
            (Some(started), Some(end)) => (end - started).num_milliseconds(),
            _ => 0,
        }
    }

    pub fn started_epoch_ms(&self) -> i64 {
        self.started.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}
