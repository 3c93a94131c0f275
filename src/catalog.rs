//! Authenticated sync with the external metadata catalog.
//!
//! Two concerns live here: [`TokenManager`] keeps a process-scoped bearer
//! token alive across batches, and [`CatalogClient`] fans out table lookups
//! and query upserts as bounded concurrent HTTP calls. A single failed
//! request is logged and recorded for that item only; it never aborts the
//! sibling requests or the batch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures_util::future::join_all;
use itertools::Itertools;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

use crate::config::CatalogConfig;
use crate::models::QueryWithLineage;

/// Refresh the token this many seconds before its expiry claim.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 10;

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: i64,
}

impl CachedToken {
    fn is_fresh(&self, now: i64) -> bool {
        now + TOKEN_EXPIRY_BUFFER_SECS < self.expires_at
    }
}

/// Caches the catalog bearer token and refreshes it through the login
/// endpoint when it nears expiry. The cache sits behind an async mutex so
/// concurrent callers cannot race two logins.
pub struct TokenManager {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    cache: Mutex<Option<CachedToken>>,
    now: fn() -> i64,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ExpClaim {
    exp: i64,
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

impl TokenManager {
    pub fn new(http: reqwest::Client, config: &CatalogConfig) -> Self {
        Self::with_clock(http, config, unix_now)
    }

    fn with_clock(http: reqwest::Client, config: &CatalogConfig, now: fn() -> i64) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            email: config.email.clone(),
            password: config.password.clone(),
            cache: Mutex::new(None),
            now,
        }
    }

    /// Current bearer token, refreshed through a login exchange when the
    /// cached one is missing or within the expiry buffer.
    pub async fn bearer(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if token.is_fresh((self.now)()) {
                return Ok(token.value.clone());
            }
        }

        tracing::info!("Catalog token missing or near expiry, logging in");
        let token = self.login().await?;
        let value = token.value.clone();
        *cache = Some(token);
        Ok(value)
    }

    async fn login(&self) -> Result<CachedToken> {
        let url = format!("{}/api/v1/users/login", self.base_url);
        let body = json!({
            "email": self.email,
            "password": BASE64.encode(self.password.as_bytes()),
        });

        let response: LoginResponse = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Login request to {url} failed"))?
            .error_for_status()
            .context("Catalog rejected login credentials")?
            .json()
            .await
            .context("Failed to decode login response")?;

        let expires_at =
            decode_expiry(&response.access_token).context("Failed to read token expiry claim")?;
        Ok(CachedToken {
            value: response.access_token,
            expires_at,
        })
    }
}

/// Read the `exp` claim without verifying the signature. The token was just
/// issued to us by the catalog over the login exchange; the catalog is the
/// trust boundary, not a third party.
fn decode_expiry(token: &str) -> Result<i64> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    let data = jsonwebtoken::decode::<ExpClaim>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims.exp)
}

/// Rewrite a parsed table name to the catalog's fully qualified form.
/// `schema.table` gains both the service and the target database;
/// `db.schema.table` gains only the service. Any other part count cannot be
/// qualified and is dropped from catalog consideration.
pub fn qualify_table_name(name: &str, service: &str, database: &str) -> Option<String> {
    match name.split('.').count() {
        2 => Some(format!("{service}.{database}.{name}")),
        3 => Some(format!("{service}.{name}")),
        _ => None,
    }
}

/// Per-batch outcome counts for the catalog push phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CatalogPushStats {
    pub pushed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Updated,
    Created,
    Conflict,
    Failed,
}

/// The catalog upsert matrix: same name with new text updates in place (200),
/// a new name with new text creates (201), and a new name with identical text
/// conflicts (409). A conflict is a tolerated outcome, not a failure.
fn classify_upsert(status: reqwest::StatusCode) -> UpsertOutcome {
    match status.as_u16() {
        200 => UpsertOutcome::Updated,
        201 => UpsertOutcome::Created,
        409 => UpsertOutcome::Conflict,
        _ => UpsertOutcome::Failed,
    }
}

/// Catalog seam for the sync pipeline. Implementations never propagate
/// request failures; they log and account for them instead.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Resolve catalog ids for the given table names. The returned map is
    /// keyed by fully qualified name and holds only successful resolutions.
    async fn resolve_table_ids(&self, names: &BTreeSet<String>) -> HashMap<String, String>;

    /// Push lineage-annotated query metadata. Records with no resolvable
    /// source tables are skipped.
    async fn upsert_queries(
        &self,
        batch: &[QueryWithLineage],
        table_ids: &HashMap<String, String>,
    ) -> CatalogPushStats;
}

/// HTTP client for the catalog REST API with bounded concurrent fan-out.
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    service: String,
    database: String,
    tokens: TokenManager,
    in_flight: Arc<Semaphore>,
}

impl CatalogClient {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
            .build()
            .context("Failed to build catalog HTTP client")?;

        Ok(Self {
            tokens: TokenManager::new(http.clone(), config),
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service: config.target_db_service.clone(),
            database: config.target_db.clone(),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }

    /// A login failure marks the whole phase failed without aborting the
    /// batch; local persistence does not depend on the catalog being up.
    async fn bearer_or_log(&self) -> Option<String> {
        match self.tokens.bearer().await {
            Ok(bearer) => Some(bearer),
            Err(e) => {
                tracing::error!("Catalog login failed, skipping catalog sync for this batch: {e:#}");
                None
            }
        }
    }
}

async fn send_json(request: reqwest::RequestBuilder, url: &str) -> Result<Value> {
    let response = request
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("Request to {url} was rejected"))?;
    response
        .json()
        .await
        .with_context(|| format!("Failed to decode response from {url}"))
}

fn upsert_body(
    item: &QueryWithLineage,
    table_ids: &HashMap<String, String>,
    service: &str,
    database: &str,
) -> Option<Value> {
    let used_in: Vec<Value> = item
        .lineage
        .table_names()
        .iter()
        .filter_map(|name| qualify_table_name(name, service, database))
        .filter_map(|fqn| table_ids.get(&fqn))
        .map(|id| json!({ "id": id, "type": "table" }))
        .collect();

    if used_in.is_empty() {
        return None;
    }

    let record = &item.record;
    Some(json!({
        "name": record.query_id,
        "query": record.query,
        "description": format!(
            "user=`{}`, state={}",
            record.user.as_deref().unwrap_or(""),
            record.state.as_deref().unwrap_or("")
        ),
        "service": service,
        "queryUsedIn": used_in,
        "duration": record.duration_ms(),
        "queryDate": record.started_epoch_ms(),
    }))
}

#[async_trait]
impl CatalogApi for CatalogClient {
    async fn resolve_table_ids(&self, names: &BTreeSet<String>) -> HashMap<String, String> {
        let fqns: Vec<String> = names
            .iter()
            .filter_map(|name| qualify_table_name(name, &self.service, &self.database))
            .collect();
        if fqns.is_empty() {
            return HashMap::new();
        }

        let Some(bearer) = self.bearer_or_log().await else {
            return HashMap::new();
        };

        tracing::info!("Looking up {} table ids in the catalog", fqns.len());
        let lookups = fqns.iter().map(|fqn| {
            let url = format!("{}/api/v1/tables/name/{fqn}", self.base_url);
            let request = self.http.get(&url).bearer_auth(&bearer);
            let in_flight = Arc::clone(&self.in_flight);
            async move {
                let Ok(_permit) = in_flight.acquire().await else {
                    return None;
                };
                match send_json(request, &url).await {
                    Ok(body) => Some(body),
                    Err(e) => {
                        tracing::warn!("Table lookup failed for {url}: {e:#}");
                        None
                    }
                }
            }
        });

        let mut resolved: HashMap<String, String> = HashMap::new();
        for body in join_all(lookups).await.into_iter().flatten() {
            let fqn = body.get("fullyQualifiedName").and_then(Value::as_str);
            let id = body.get("id").and_then(Value::as_str);
            if let (Some(fqn), Some(id)) = (fqn, id) {
                resolved.insert(fqn.to_string(), id.to_string());
            }
        }

        let missing: Vec<&String> = fqns.iter().filter(|f| !resolved.contains_key(*f)).collect();
        if missing.is_empty() {
            tracing::info!("Resolved all {} tables in the catalog", resolved.len());
        } else {
            tracing::info!(
                "Resolved {} of {} tables; not found: {}",
                resolved.len(),
                fqns.len(),
                missing.iter().join(", ")
            );
        }
        resolved
    }

    async fn upsert_queries(
        &self,
        batch: &[QueryWithLineage],
        table_ids: &HashMap<String, String>,
    ) -> CatalogPushStats {
        let mut stats = CatalogPushStats::default();

        let mut bodies: Vec<(String, Value)> = Vec::new();
        for item in batch {
            match upsert_body(item, table_ids, &self.service, &self.database) {
                Some(body) => bodies.push((item.record.query_id.clone(), body)),
                None => stats.skipped += 1,
            }
        }
        if bodies.is_empty() {
            return stats;
        }

        let Some(bearer) = self.bearer_or_log().await else {
            stats.failed = bodies.len();
            return stats;
        };

        let url = format!("{}/api/v1/queries", self.base_url);
        tracing::info!("Pushing {} queries to the catalog", bodies.len());
        let puts = bodies.iter().map(|(query_id, body)| {
            let request = self.http.put(&url).bearer_auth(&bearer).json(body);
            let in_flight = Arc::clone(&self.in_flight);
            let url = url.clone();
            async move {
                let Ok(_permit) = in_flight.acquire().await else {
                    return UpsertOutcome::Failed;
                };
                match request.send().await {
                    Ok(response) => {
                        let outcome = classify_upsert(response.status());
                        if outcome == UpsertOutcome::Failed {
                            let status = response.status();
                            let text = response.text().await.unwrap_or_default();
                            tracing::warn!(
                                "Query upsert failed for {query_id}: {status} {text}"
                            );
                        } else {
                            tracing::debug!("Query upsert for {query_id}: {outcome:?}");
                        }
                        outcome
                    }
                    Err(e) => {
                        tracing::warn!("Query upsert failed for {query_id} at {url}: {e}");
                        UpsertOutcome::Failed
                    }
                }
            }
        });

        for outcome in join_all(puts).await {
            match outcome {
                UpsertOutcome::Updated | UpsertOutcome::Created => stats.pushed += 1,
                UpsertOutcome::Conflict => stats.conflicts += 1,
                UpsertOutcome::Failed => stats.failed += 1,
            }
        }
        tracing::info!(
            "Catalog push done: {} upserted, {} skipped, {} conflicts, {} failed",
            stats.pushed,
            stats.skipped,
            stats.conflicts,
            stats.failed
        );
        stats
    }
}
