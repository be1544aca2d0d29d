//! Catalogue record store: the trait the reconciliation pipeline consumes,
//! a PostgREST-style REST implementation, and an in-memory store for tests
//! and dry runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use unirank_core::{Institution, JobCounters, JobRecord, JobStatus};
use unirank_fetch::{FetchError, RateLimitedTransport};
use uuid::Uuid;

pub const ENTITY_TABLE: &str = "unreviewed_institutions";
pub const JOB_TABLE: &str = "crawl_jobs";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("store rejected write: http {status}")]
    Write { status: u16 },
    #[error("decoding store response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("store returned no id for inserted row")]
    MissingId,
    #[error("invalid store configuration: {0}")]
    Config(String),
}

/// Filter predicates for locating one catalogue row. Substring filters are
/// case-insensitive, matching the REST surface's `ilike` semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    Id(Uuid),
    WebsiteContains(String),
    NameContains(String),
}

/// Read/insert/patch surface of the persistent catalogue. `find` returns
/// the first matching row; which row is first is up to the backend.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find(&self, filter: &EntityFilter) -> Result<Option<Institution>, StoreError>;
    async fn insert(&self, fields: Map<String, Value>) -> Result<Uuid, StoreError>;
    async fn patch(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), StoreError>;
    async fn create_job(&self, name: &str, metadata: Value) -> Result<Uuid, StoreError>;
    async fn update_job(
        &self,
        id: Uuid,
        status: JobStatus,
        counters: JobCounters,
    ) -> Result<(), StoreError>;
}

fn filter_query(filter: &EntityFilter) -> String {
    match filter {
        EntityFilter::Id(id) => format!("select=*&id=eq.{id}&limit=1"),
        EntityFilter::WebsiteContains(needle) => {
            format!("select=*&website_url=ilike.*{needle}*&limit=1")
        }
        EntityFilter::NameContains(needle) => format!("select=*&name=ilike.*{needle}*&limit=1"),
    }
}

/// REST client for the catalogue service. All traffic goes through the
/// rate-limited transport, so catalogue reads and writes obey the same
/// pacing as upstream fetches.
pub struct RestStore {
    transport: Arc<RateLimitedTransport>,
    base: String,
    headers: HeaderMap,
}

impl RestStore {
    pub fn new(
        transport: Arc<RateLimitedTransport>,
        base_url: &str,
        service_key: &str,
    ) -> Result<Self, StoreError> {
        let key_value = HeaderValue::from_str(service_key)
            .map_err(|_| StoreError::Config("service key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {service_key}"))
            .map_err(|_| StoreError::Config("service key is not a valid header value".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert("apikey", key_value);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        Ok(Self {
            transport,
            base: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            headers,
        })
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        format!("{}/{}?{}", self.base, table, query)
    }

    fn table_root(&self, table: &str) -> String {
        format!("{}/{}", self.base, table)
    }

    /// Cheap authenticated probe against the catalogue table. `Ok(false)`
    /// means the service answered but rejected the credentials or table.
    pub async fn health_check(&self) -> Result<bool, StoreError> {
        let url = self.table_url(ENTITY_TABLE, "select=count");
        match self.transport.fetch(&url, self.headers.clone()).await {
            Ok(resp) => Ok(resp.status.is_success()),
            Err(FetchError::HttpStatus { .. }) | Err(FetchError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(
        &self,
        method: Method,
        url: &str,
        body: &Value,
    ) -> Result<Vec<u8>, StoreError> {
        let bytes = serde_json::to_vec(body)?;
        match self
            .transport
            .request(method, url, self.headers.clone(), Some(bytes))
            .await
        {
            Ok(resp) => Ok(resp.body),
            Err(FetchError::HttpStatus { status, .. }) => Err(StoreError::Write { status }),
            Err(FetchError::NotFound { .. }) => Err(StoreError::Write { status: 404 }),
            Err(err) => Err(err.into()),
        }
    }

    fn id_from_representation(body: &[u8]) -> Result<Uuid, StoreError> {
        let rows: Vec<Value> = serde_json::from_slice(body)?;
        rows.first()
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or(StoreError::MissingId)
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn find(&self, filter: &EntityFilter) -> Result<Option<Institution>, StoreError> {
        let url = self.table_url(ENTITY_TABLE, &filter_query(filter));
        let resp = self.transport.fetch(&url, self.headers.clone()).await?;
        let rows: Vec<Institution> = serde_json::from_slice(&resp.body)?;
        Ok(rows.into_iter().next())
    }

    async fn insert(&self, fields: Map<String, Value>) -> Result<Uuid, StoreError> {
        let url = self.table_root(ENTITY_TABLE);
        let body = self.write(Method::POST, &url, &Value::Object(fields)).await?;
        let id = Self::id_from_representation(&body)?;
        debug!(%id, "inserted catalogue row");
        Ok(id)
    }

    async fn patch(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), StoreError> {
        let url = self.table_url(ENTITY_TABLE, &format!("id=eq.{id}"));
        self.write(Method::PATCH, &url, &Value::Object(fields))
            .await?;
        Ok(())
    }

    async fn create_job(&self, name: &str, metadata: Value) -> Result<Uuid, StoreError> {
        let url = self.table_root(JOB_TABLE);
        let body = json!({
            "name": name,
            "status": JobStatus::Running,
            "metadata": metadata,
            "started_at": Utc::now(),
        });
        let response = self.write(Method::POST, &url, &body).await?;
        Self::id_from_representation(&response)
    }

    async fn update_job(
        &self,
        id: Uuid,
        status: JobStatus,
        counters: JobCounters,
    ) -> Result<(), StoreError> {
        let url = self.table_url(JOB_TABLE, &format!("id=eq.{id}"));
        let mut body = json!({
            "status": status,
            "total_items": counters.total_items,
            "successful_items": counters.successful_items,
            "failed_items": counters.failed_items,
        });
        if matches!(status, JobStatus::Completed | JobStatus::Failed) {
            body["completed_at"] = json!(Utc::now());
        }
        self.write(Method::PATCH, &url, &body).await?;
        Ok(())
    }
}

/// In-memory store with the same matching semantics as the REST backend.
/// Used by unit tests and `--dry-run` crawls.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rows: Vec<Institution>,
    jobs: Vec<JobRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, in insertion order.
    pub async fn rows(&self) -> Vec<Institution> {
        self.inner.lock().await.rows.clone()
    }

    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.inner.lock().await.jobs.clone()
    }
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

fn matches_filter(row: &Institution, filter: &EntityFilter) -> bool {
    match filter {
        EntityFilter::Id(id) => row.id == *id,
        EntityFilter::WebsiteContains(needle) => contains_ci(row.website_url.as_deref(), needle),
        EntityFilter::NameContains(needle) => contains_ci(Some(row.name.as_str()), needle),
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find(&self, filter: &EntityFilter) -> Result<Option<Institution>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter()
            .find(|row| matches_filter(row, filter))
            .cloned())
    }

    async fn insert(&self, fields: Map<String, Value>) -> Result<Uuid, StoreError> {
        let mut row: Institution = serde_json::from_value(Value::Object(fields))?;
        row.id = Uuid::new_v4();
        let id = row.id;
        self.inner.lock().await.rows.push(row);
        Ok(id)
    }

    async fn patch(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::Write { status: 404 })?;

        let mut doc = serde_json::to_value(&*row)?;
        if let Value::Object(target) = &mut doc {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        *row = serde_json::from_value(doc)?;
        Ok(())
    }

    async fn create_job(&self, name: &str, metadata: Value) -> Result<Uuid, StoreError> {
        let record = JobRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: JobStatus::Running,
            metadata,
            started_at: Utc::now(),
            completed_at: None,
            counters: JobCounters::default(),
        };
        let id = record.id;
        self.inner.lock().await.jobs.push(record);
        Ok(id)
    }

    async fn update_job(
        &self,
        id: Uuid,
        status: JobStatus,
        counters: JobCounters,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.iter_mut().find(|job| job.id == id) else {
            warn!(%id, "job record vanished before final update");
            return Err(StoreError::Write { status: 404 });
        };
        job.status = status;
        job.counters = counters;
        if matches!(status, JobStatus::Completed | JobStatus::Failed) {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}
