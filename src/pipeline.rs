//! The batch loop driving one full sync run.
//!
//! Batches are strictly sequential: a batch is extracted, parsed, persisted,
//! and pushed to the catalog before the next one starts, so history, object,
//! and link writes stay ordered. Catalog failures are absorbed inside the
//! catalog client; persistence and extraction failures propagate and abort
//! the remaining batches. Completed batches stay committed, and because every
//! write is idempotent a re-run from offset 0 converges to the same state.

use anyhow::{Context, Result};
use std::collections::BTreeSet;

use crate::catalog::CatalogApi;
use crate::db::LineageStore;
use crate::lineage::extract_source_tables;
use crate::models::{QueryObjectLink, QueryRecord, QueryWithLineage};
use crate::trino::{BatchWindows, QuerySource};

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub source_rows: u64,
    pub batches: usize,
    pub records: usize,
    pub parse_failures: usize,
    pub links_written: usize,
    pub pushed: usize,
    pub push_conflicts: usize,
    pub push_failures: usize,
}

pub struct SyncPipeline<S, St, C> {
    source: S,
    store: St,
    catalog: C,
    batch_size: u64,
}

impl<S, St, C> SyncPipeline<S, St, C>
where
    S: QuerySource,
    St: LineageStore,
    C: CatalogApi,
{
    pub fn new(source: S, store: St, catalog: C, batch_size: u64) -> Self {
        Self {
            source,
            store,
            catalog,
            batch_size,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        self.store.init_schema()?;

        let total = self
            .source
            .count()
            .await
            .context("Source row count unavailable, aborting run")?;

        let mut summary = RunSummary {
            source_rows: total,
            ..RunSummary::default()
        };

        for window in BatchWindows::new(total, self.batch_size) {
            tracing::info!(
                "Processing rows {} - {} of {}",
                window.offset,
                window.end(),
                total
            );

            let records = self
                .source
                .fetch_window(window)
                .await
                .context("Failed to fetch batch from source")?;
            if records.is_empty() {
                tracing::warn!("Window returned no rows; source shrank mid-scan");
                continue;
            }

            let batch: Vec<QueryWithLineage> = records
                .into_iter()
                .map(|record| {
                    let lineage = extract_source_tables(record.query.as_deref().unwrap_or(""));
                    QueryWithLineage { record, lineage }
                })
                .collect();
            summary.parse_failures += batch.iter().filter(|i| !i.lineage.is_parsed()).count();

            let rows: Vec<QueryRecord> = batch.iter().map(|i| i.record.clone()).collect();
            let upserted = self.store.upsert_history(&rows)?;
            tracing::info!("Upserted {} rows into query history", upserted);
            summary.records += rows.len();

            let names: BTreeSet<String> = batch
                .iter()
                .flat_map(|i| i.lineage.table_names())
                .collect();
            if names.is_empty() {
                summary.batches += 1;
                continue;
            }

            let table_ids = self.catalog.resolve_table_ids(&names).await;

            self.store.ensure_objects(&names)?;
            let object_ids = self.store.resolve_object_ids(&names)?;
            let links = build_links(&batch, &object_ids);
            summary.links_written += self.store.link(&links)?;

            let stats = self.catalog.upsert_queries(&batch, &table_ids).await;
            summary.pushed += stats.pushed;
            summary.push_conflicts += stats.conflicts;
            summary.push_failures += stats.failed;

            summary.batches += 1;
        }

        tracing::info!(
            "Run complete: {} batches, {} records, {} parse failures, {} links, {} pushed",
            summary.batches,
            summary.records,
            summary.parse_failures,
            summary.links_written,
            summary.pushed
        );
        Ok(summary)
    }
}

fn build_links(
    batch: &[QueryWithLineage],
    object_ids: &std::collections::HashMap<String, i32>,
) -> Vec<QueryObjectLink> {
    let mut links = Vec::new();
    for item in batch {
        for name in item.lineage.table_names() {
            if let Some(&object_id) = object_ids.get(&name) {
                links.push(QueryObjectLink {
                    object_id,
                    query_id: item.record.query_id.clone(),
                });
            }
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{qualify_table_name, CatalogPushStats};
    use crate::trino::BatchWindow;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    fn record(query_id: &str, sql: &str, state: &str, user: &str) -> QueryRecord {
        QueryRecord {
            query_id: query_id.to_string(),
            state: Some(state.to_string()),
            user: Some(user.to_string()),
            source: None,
            query: Some(sql.to_string()),
            resource_group_id: None,
            queued_time_ms: None,
            analysis_time_ms: None,
            planning_time_ms: None,
            created: None,
            started: None,
            last_heartbeat: None,
            end_time: None,
            error_type: None,
            error_code: None,
        }
    }

    struct FakeSource {
        records: Vec<QueryRecord>,
        windows_served: Mutex<Vec<BatchWindow>>,
    }

    impl FakeSource {
        fn new(mut records: Vec<QueryRecord>) -> Self {
            records.sort_by(|a, b| a.query_id.cmp(&b.query_id));
            Self {
                records,
                windows_served: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QuerySource for FakeSource {
        async fn count(&self) -> Result<u64> {
            Ok(self.records.len() as u64)
        }

        async fn fetch_window(&self, window: BatchWindow) -> Result<Vec<QueryRecord>> {
            self.windows_served.lock().unwrap().push(window);
            let start = (window.offset as usize).min(self.records.len());
            let end = (window.end() as usize).min(self.records.len());
            Ok(self.records[start..end].to_vec())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        history: Mutex<HashMap<String, QueryRecord>>,
        objects: Mutex<HashMap<String, i32>>,
        links: Mutex<HashSet<(i32, String)>>,
    }

    impl LineageStore for FakeStore {
        fn init_schema(&self) -> Result<()> {
            Ok(())
        }

        fn upsert_history(&self, records: &[QueryRecord]) -> Result<usize> {
            let mut history = self.history.lock().unwrap();
            for record in records {
                match history.get_mut(&record.query_id) {
                    // Conflict: only state is overwritten.
                    Some(existing) => existing.state = record.state.clone(),
                    None => {
                        history.insert(record.query_id.clone(), record.clone());
                    }
                }
            }
            Ok(records.len())
        }

        fn ensure_objects(&self, names: &BTreeSet<String>) -> Result<usize> {
            let mut objects = self.objects.lock().unwrap();
            let mut inserted = 0;
            for name in names {
                let next_id = objects.len() as i32 + 1;
                if !objects.contains_key(name) {
                    objects.insert(name.clone(), next_id);
                    inserted += 1;
                }
            }
            Ok(inserted)
        }

        fn resolve_object_ids(&self, names: &BTreeSet<String>) -> Result<HashMap<String, i32>> {
            let objects = self.objects.lock().unwrap();
            Ok(names
                .iter()
                .filter_map(|name| objects.get(name).map(|id| (name.clone(), *id)))
                .collect())
        }

        fn link(&self, links: &[QueryObjectLink]) -> Result<usize> {
            let mut stored = self.links.lock().unwrap();
            let mut inserted = 0;
            for link in links {
                if stored.insert((link.object_id, link.query_id.clone())) {
                    inserted += 1;
                }
            }
            Ok(inserted)
        }
    }

    struct FakeCatalog {
        table_ids: HashMap<String, String>,
    }

    #[async_trait]
    impl CatalogApi for FakeCatalog {
        async fn resolve_table_ids(&self, names: &BTreeSet<String>) -> HashMap<String, String> {
            names
                .iter()
                .filter_map(|name| qualify_table_name(name, "svc", "db"))
                .filter_map(|fqn| {
                    self.table_ids
                        .get(&fqn)
                        .map(|id| (fqn.clone(), id.clone()))
                })
                .collect()
        }

        async fn upsert_queries(
            &self,
            batch: &[QueryWithLineage],
            table_ids: &HashMap<String, String>,
        ) -> CatalogPushStats {
            let mut stats = CatalogPushStats::default();
            for item in batch {
                let resolvable = item
                    .lineage
                    .table_names()
                    .iter()
                    .filter_map(|name| qualify_table_name(name, "svc", "db"))
                    .any(|fqn| table_ids.contains_key(&fqn));
                if resolvable {
                    stats.pushed += 1;
                } else {
                    stats.skipped += 1;
                }
            }
            stats
        }
    }

    fn three_row_source() -> FakeSource {
        FakeSource::new(vec![
            record("q1", "SELECT * FROM sales.orders", "FINISHED", "etl"),
            record(
                "q2",
                "SELECT count(*) FROM sales.orders WHERE id > 10",
                "FINISHED",
                "etl",
            ),
            record("q3", "SELECT 1", "FAILED", "adhoc"),
        ])
    }

    fn catalog_with_orders() -> FakeCatalog {
        FakeCatalog {
            table_ids: HashMap::from([(
                "svc.db.sales.orders".to_string(),
                "uuid-1".to_string(),
            )]),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_three_rows_batch_two() {
        let store = Arc::new(FakeStore::default());
        let pipeline = SyncPipeline::new(three_row_source(), Arc::clone(&store), catalog_with_orders(), 2);

        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.source_rows, 3);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.records, 3);
        assert_eq!(summary.parse_failures, 0);
        // q1 and q2 each link to the one shared table; q3 reads nothing.
        assert_eq!(summary.links_written, 2);
        assert_eq!(summary.pushed, 2);

        assert_eq!(store.history.lock().unwrap().len(), 3);
        assert_eq!(store.objects.lock().unwrap().len(), 1);
        assert_eq!(store.links.lock().unwrap().len(), 2);
        assert!(store
            .objects
            .lock()
            .unwrap()
            .contains_key("sales.orders"));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_and_updates_state_only() {
        let store = Arc::new(FakeStore::default());

        let first = SyncPipeline::new(three_row_source(), Arc::clone(&store), catalog_with_orders(), 2);
        first.run().await.unwrap();

        // Same rows again: q3 finished, and q1 claims a different user, which
        // must not overwrite the original insert.
        let mut rerun_rows = vec![
            record("q1", "SELECT * FROM sales.orders", "FINISHED", "someone-else"),
            record(
                "q2",
                "SELECT count(*) FROM sales.orders WHERE id > 10",
                "FINISHED",
                "etl",
            ),
            record("q3", "SELECT 1", "FINISHED", "adhoc"),
        ];
        rerun_rows.sort_by(|a, b| a.query_id.cmp(&b.query_id));
        let second = SyncPipeline::new(
            FakeSource::new(rerun_rows),
            Arc::clone(&store),
            catalog_with_orders(),
            2,
        );
        second.run().await.unwrap();

        let history = store.history.lock().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history["q3"].state.as_deref(), Some("FINISHED"));
        assert_eq!(history["q1"].user.as_deref(), Some("etl"));
        assert_eq!(store.objects.lock().unwrap().len(), 1);
        assert_eq!(store.links.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_windows_follow_batch_size() {
        let source = Arc::new(FakeSource::new(vec![
            record("q1", "SELECT 1", "FINISHED", "a"),
            record("q2", "SELECT 1", "FINISHED", "a"),
            record("q3", "SELECT 1", "FINISHED", "a"),
        ]));
        let pipeline = SyncPipeline::new(
            Arc::clone(&source),
            Arc::new(FakeStore::default()),
            catalog_with_orders(),
            2,
        );
        pipeline.run().await.unwrap();

        let served = source.windows_served.lock().unwrap();
        assert_eq!(
            *served,
            vec![
                BatchWindow { offset: 0, limit: 2 },
                BatchWindow { offset: 2, limit: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_unparsable_query_lands_in_objects_as_sentinel() {
        let store = Arc::new(FakeStore::default());
        let source = FakeSource::new(vec![record(
            "q1",
            "SELECT FROM FROM WHERE ((",
            "FINISHED",
            "etl",
        )]);
        let pipeline = SyncPipeline::new(source, Arc::clone(&store), catalog_with_orders(), 10);

        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.parse_failures, 1);
        let objects = store.objects.lock().unwrap();
        assert_eq!(objects.len(), 1);
        assert!(objects.contains_key(crate::lineage::PARSE_FAILURE_SENTINEL));
        // The sentinel cannot be qualified, so nothing reaches the catalog,
        // but the local link is still recorded.
        assert_eq!(store.links.lock().unwrap().len(), 1);
        assert_eq!(summary.pushed, 0);
    }
}
