//! REST store for a hosted Postgres behind a PostgREST-compatible API.
//!
//! Rows live at `{base_url}/rest/v1/{collection}`. The change channel is a
//! polling feed: it reads the whole collection every `poll_interval_ms`,
//! diffs the result against the previous read by id and emits the
//! differences as raw change payloads.

use crate::error::{SyncError, SyncResult};
use crate::store::{ChannelMessage, ChannelSink, ChannelStatus, RemoteChannel, RemoteStore};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use trailbook_types::{ChangeKind, Collection, RawChange, Record, RecordId};

/// Configuration for [`RestStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestStoreConfig {
    /// Project URL, e.g. `https://example.supabase.co`.
    pub base_url: String,
    /// Public API key, sent as the `apikey` header.
    pub api_key: String,
    /// User access token. Falls back to the API key when absent.
    pub access_token: Option<String>,
    /// Per-request timeout (ms).
    pub request_timeout_ms: u64,
    /// Change feed polling interval (ms).
    pub poll_interval_ms: u64,
}

impl Default for RestStoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            request_timeout_ms: 10_000,
            poll_interval_ms: 5_000,
        }
    }
}

impl RestStoreConfig {
    /// Config for `base_url` with `api_key` and default timings.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }
}

/// Error body returned by PostgREST.
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    code: Option<String>,
    message: Option<String>,
}

/// Store talking to a PostgREST endpoint.
#[derive(Clone)]
pub struct RestStore {
    config: RestStoreConfig,
    client: Client,
}

impl RestStore {
    /// Creates a store. Fails with `NotConfigured` when no URL is set.
    pub fn new(config: RestStoreConfig) -> SyncResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(SyncError::NotConfigured("no backend URL set".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SyncError::NotConfigured(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    /// The configuration in use.
    pub fn config(&self) -> &RestStoreConfig {
        &self.config
    }

    fn table_url(&self, collection: &Collection) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            collection
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(token)
    }

    async fn send(
        &self,
        collection: Option<&Collection>,
        request: RequestBuilder,
    ) -> SyncResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_response(collection, status, &body))
    }

    async fn rows(response: Response) -> SyncResult<Vec<Record>> {
        let values: Vec<Value> = response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("failed to read response: {e}")))?;
        values
            .into_iter()
            .map(|v| Record::from_value(v).map_err(SyncError::from))
            .collect()
    }

    async fn single_row(
        collection: &Collection,
        id: &str,
        response: Response,
    ) -> SyncResult<Record> {
        Self::rows(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::NotFound(format!("{collection}/{id}")))
    }
}

/// Maps a reqwest failure to a sync error.
fn transport_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Network(error.to_string())
    }
}

/// Maps a non-success HTTP response to a sync error.
pub fn classify_response(
    collection: Option<&Collection>,
    status: StatusCode,
    body: &str,
) -> SyncError {
    let api: ApiError = serde_json::from_str(body).unwrap_or_default();
    let message = api.message.unwrap_or_else(|| body.trim().to_string());
    let code = api.code.unwrap_or_default();

    let schema_missing = code == "42P01"
        || code == "PGRST205"
        || message.contains("does not exist")
        || message.contains("schema cache")
        || status == StatusCode::NOT_FOUND;
    if schema_missing {
        if let Some(collection) = collection {
            return SyncError::SchemaMissing {
                collection: collection.to_string(),
            };
        }
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::NotConfigured(format!(
            "credentials rejected ({}): {message}",
            status.as_u16()
        )),
        StatusCode::REQUEST_TIMEOUT => SyncError::Timeout,
        _ => SyncError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    fn name(&self) -> &str {
        "rest"
    }

    fn open_channel(
        &self,
        collection: &Collection,
        sink: ChannelSink,
    ) -> SyncResult<Box<dyn RemoteChannel>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::NotConfigured("change feed needs a tokio runtime".into()))?;
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let task = runtime.spawn(poll_changes(self.clone(), collection.clone(), sink, interval));
        info!("Polling {} every {:?}", collection, interval);
        Ok(Box::new(RestChannel {
            collection: collection.clone(),
            task: task.abort_handle(),
        }))
    }

    async fn fetch_all(&self, collection: &Collection) -> SyncResult<Vec<Record>> {
        let request = self
            .client
            .get(self.table_url(collection))
            .query(&[("select", "*")]);
        let response = self.send(Some(collection), request).await?;
        Self::rows(response).await
    }

    async fn insert(&self, collection: &Collection, record: Record) -> SyncResult<Record> {
        // Local ids never reach the backend; it assigns its own.
        let body = if record.id().is_local() {
            record.fields_value()
        } else {
            record.clone().into_value()
        };
        let request = self
            .client
            .post(self.table_url(collection))
            .header("Prefer", "return=representation")
            .json(&body);
        let response = self.send(Some(collection), request).await?;
        let canonical = Self::single_row(collection, record.id().as_str(), response).await?;
        debug!("Inserted {} into {}", canonical.id(), collection);
        Ok(canonical)
    }

    async fn update(&self, collection: &Collection, record: Record) -> SyncResult<Record> {
        let filter = format!("eq.{}", record.id());
        let request = self
            .client
            .patch(self.table_url(collection))
            .query(&[("id", filter.as_str())])
            .header("Prefer", "return=representation")
            .json(&record.fields_value());
        let response = self.send(Some(collection), request).await?;
        Self::single_row(collection, record.id().as_str(), response).await
    }

    async fn delete(&self, collection: &Collection, id: &RecordId) -> SyncResult<()> {
        let filter = format!("eq.{id}");
        let request = self
            .client
            .delete(self.table_url(collection))
            .query(&[("id", filter.as_str())]);
        self.send(Some(collection), request).await?;
        Ok(())
    }

    async fn ping(&self) -> SyncResult<()> {
        let url = format!("{}/rest/v1/", self.config.base_url.trim_end_matches('/'));
        self.send(None, self.client.get(url)).await?;
        Ok(())
    }
}

/// Polling change channel.
pub struct RestChannel {
    collection: Collection,
    task: AbortHandle,
}

impl RemoteChannel for RestChannel {
    fn collection(&self) -> &Collection {
        &self.collection
    }

    fn close(&self) {
        self.task.abort();
    }
}

impl Drop for RestChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_changes(
    store: RestStore,
    collection: Collection,
    sink: ChannelSink,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous: Option<Vec<Record>> = None;

    loop {
        ticker.tick().await;
        match store.fetch_all(&collection).await {
            Ok(rows) => {
                match &previous {
                    None => sink(ChannelMessage::Status(ChannelStatus::Subscribed)),
                    Some(prev) => {
                        for change in diff_snapshots(prev, &rows) {
                            sink(ChannelMessage::Change(change));
                        }
                    }
                }
                previous = Some(rows);
            }
            Err(e) => {
                warn!("Change feed for {} stopped: {}", collection, e);
                sink(ChannelMessage::Status(ChannelStatus::Error(e.to_string())));
                return;
            }
        }
    }
}

/// Computes the change payloads that turn `previous` into `current`.
///
/// Inserts and updates come first, in the order of `current`; deletes
/// follow, sorted by id. Rows are matched by id.
pub fn diff_snapshots(previous: &[Record], current: &[Record]) -> Vec<RawChange> {
    let before: HashMap<&RecordId, &Record> = previous.iter().map(|r| (r.id(), r)).collect();
    let mut changes = Vec::new();

    for row in current {
        match before.get(row.id()) {
            None => changes.push(RawChange::new(
                ChangeKind::Insert,
                Some(row.clone().into_value()),
                None,
            )),
            Some(old) if *old != row => changes.push(RawChange::new(
                ChangeKind::Update,
                Some(row.clone().into_value()),
                Some((*old).clone().into_value()),
            )),
            Some(_) => {}
        }
    }

    let still_there: HashSet<&RecordId> = current.iter().map(Record::id).collect();
    let mut gone: Vec<&Record> = previous
        .iter()
        .filter(|r| !still_there.contains(r.id()))
        .collect();
    gone.sort_by(|a, b| a.id().cmp(b.id()));
    changes.extend(
        gone.into_iter()
            .map(|old| RawChange::new(ChangeKind::Delete, None, Some(old.clone().into_value()))),
    );
    changes
}
