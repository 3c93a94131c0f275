use anyhow::{Context, Result};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, Pool, PooledConnection};
use diesel::upsert::excluded;
use std::collections::{BTreeSet, HashMap};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<PgConnection>>;

use crate::models::{NewQueryObject, QueryObjectLink, QueryRecord};
use crate::schema::{trino_queries_and_query_objects_lnk, trino_queries_history, trino_query_objects};

/// All sink tables, created on every run. Safe to re-execute.
const SCHEMA_DDL: &str = r#"
    CREATE SCHEMA IF NOT EXISTS omd;

    CREATE TABLE IF NOT EXISTS omd.trino_queries_history (
        query_id VARCHAR PRIMARY KEY,
        state VARCHAR,
        "user" VARCHAR,
        "source" VARCHAR,
        query VARCHAR,
        resource_group_id VARCHAR[],
        queued_time_ms BIGINT,
        analysis_time_ms BIGINT,
        planning_time_ms BIGINT,
        created TIMESTAMP(3) WITH TIME ZONE,
        started TIMESTAMP(3) WITH TIME ZONE,
        last_heartbeat TIMESTAMP(3) WITH TIME ZONE,
        "end" TIMESTAMP(3) WITH TIME ZONE,
        error_type VARCHAR,
        error_code VARCHAR
    );

    CREATE TABLE IF NOT EXISTS omd.trino_query_objects (
        id SERIAL PRIMARY KEY,
        "name" VARCHAR NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS omd.trino_queries_and_query_objects_lnk (
        object_id INT REFERENCES omd.trino_query_objects(id),
        query_id VARCHAR REFERENCES omd.trino_queries_history(query_id),
        PRIMARY KEY (object_id, query_id)
    );
"#;

/// Create database connection pool with configurable size
pub fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool, r2d2::PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().max_size(max_size).build(manager)
}

/// Create the omd schema and the three sink tables if they do not exist.
pub fn create_schema(conn: &mut PgConnection) -> QueryResult<()> {
    conn.batch_execute(SCHEMA_DDL)
}

/// Insert a batch of query records in one statement. An already known
/// `query_id` gets only its `state` overwritten; every other column keeps the
/// value from the original insert. Commits as a single transaction.
pub fn upsert_query_history(
    conn: &mut PgConnection,
    records: &[QueryRecord],
) -> QueryResult<usize> {
    use trino_queries_history::dsl;

    conn.transaction(|conn| {
        diesel::insert_into(dsl::trino_queries_history)
            .values(records)
            .on_conflict(dsl::query_id)
            .do_update()
            .set(dsl::state.eq(excluded(dsl::state)))
            .execute(conn)
    })
}

/// Insert discovered table names, ignoring names already stored.
pub fn insert_query_objects(
    conn: &mut PgConnection,
    names: &BTreeSet<String>,
) -> QueryResult<usize> {
    use trino_query_objects::dsl;

    let rows: Vec<NewQueryObject> = names
        .iter()
        .map(|name| NewQueryObject { name: name.clone() })
        .collect();

    diesel::insert_into(dsl::trino_query_objects)
        .values(&rows)
        .on_conflict(dsl::name)
        .do_nothing()
        .execute(conn)
}

/// Look up ids for the given object names. Names not yet stored are absent
/// from the returned map.
pub fn resolve_object_ids(
    conn: &mut PgConnection,
    names: &BTreeSet<String>,
) -> QueryResult<HashMap<String, i32>> {
    use trino_query_objects::dsl;

    let name_list: Vec<&String> = names.iter().collect();
    let rows: Vec<(i32, String)> = dsl::trino_query_objects
        .filter(dsl::name.eq_any(name_list))
        .select((dsl::id, dsl::name))
        .load(conn)?;

    Ok(rows.into_iter().map(|(id, name)| (name, id)).collect())
}

/// Insert (object_id, query_id) links, ignoring pairs already present.
/// Both sides must already exist; the link table carries foreign keys.
pub fn link_queries_to_objects(
    conn: &mut PgConnection,
    links: &[QueryObjectLink],
) -> QueryResult<usize> {
    use trino_queries_and_query_objects_lnk::dsl;

    diesel::insert_into(dsl::trino_queries_and_query_objects_lnk)
        .values(links)
        .on_conflict_do_nothing()
        .execute(conn)
}

/// Persistence seam for the sync pipeline. A failure in any of these is fatal
/// for the remainder of the run: catalog sync depends on consistent local
/// state, so persistence errors are propagated rather than isolated.
pub trait LineageStore: Send + Sync {
    fn init_schema(&self) -> Result<()>;
    fn upsert_history(&self, records: &[QueryRecord]) -> Result<usize>;
    fn ensure_objects(&self, names: &BTreeSet<String>) -> Result<usize>;
    fn resolve_object_ids(&self, names: &BTreeSet<String>) -> Result<HashMap<String, i32>>;
    fn link(&self, links: &[QueryObjectLink]) -> Result<usize>;
}

impl<T: LineageStore + ?Sized> LineageStore for std::sync::Arc<T> {
    fn init_schema(&self) -> Result<()> {
        (**self).init_schema()
    }

    fn upsert_history(&self, records: &[QueryRecord]) -> Result<usize> {
        (**self).upsert_history(records)
    }

    fn ensure_objects(&self, names: &BTreeSet<String>) -> Result<usize> {
        (**self).ensure_objects(names)
    }

    fn resolve_object_ids(&self, names: &BTreeSet<String>) -> Result<HashMap<String, i32>> {
        (**self).resolve_object_ids(names)
    }

    fn link(&self, links: &[QueryObjectLink]) -> Result<usize> {
        (**self).link(links)
    }
}

/// Postgres-backed store over a diesel r2d2 pool.
pub struct PgLineageStore {
    pool: DbPool,
}

impl PgLineageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool
            .get()
            .context("Failed to get database connection from pool")
    }
}

impl LineageStore for PgLineageStore {
    fn init_schema(&self) -> Result<()> {
        create_schema(&mut *self.conn()?).context("Failed to create omd schema tables")?;
        Ok(())
    }

    fn upsert_history(&self, records: &[QueryRecord]) -> Result<usize> {
        upsert_query_history(&mut *self.conn()?, records)
            .context("Failed to upsert query history batch")
    }

    fn ensure_objects(&self, names: &BTreeSet<String>) -> Result<usize> {
        insert_query_objects(&mut *self.conn()?, names).context("Failed to insert query objects")
    }

    fn resolve_object_ids(&self, names: &BTreeSet<String>) -> Result<HashMap<String, i32>> {
        resolve_object_ids(&mut *self.conn()?, names).context("Failed to resolve object ids")
    }

    fn link(&self, links: &[QueryObjectLink]) -> Result<usize> {
        link_queries_to_objects(&mut *self.conn()?, links)
            .context("Failed to link queries to objects")
    }
}
