//! Remote Zotero Client (C6): rate-limited, retrying HTTP client against the
//! Zotero Web API. Ported in meaning from
//! `infrastructure/adapters/zotero_importer.py`'s remote path.

use crate::port::{ResolvedSource, ZoteroError, ZoteroSource};
use crate::types::{ZoteroAttachment, ZoteroCollection, ZoteroItem, ZoteroItemMetadata, ZoteroTag};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

/// Minimum interval between requests: two requests per second ceiling (§4.6).
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(500);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

struct ApiCallTracker {
    count: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl ApiCallTracker {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    fn record_call(&self) {
        let mut started_at = self.started_at.lock().unwrap();
        if started_at.is_none() {
            *started_at = Some(Instant::now());
        }
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn summary(&self) -> Option<(u64, Duration)> {
        let count = self.count.load(Ordering::SeqCst);
        let started_at = (*self.started_at.lock().unwrap())?;
        if count == 0 {
            return None;
        }
        Some((count, started_at.elapsed()))
    }
}

/// Per-batch cache of a collection's item listing, keyed by
/// `(collection_key, include_subcollections)` so one command that revisits
/// the same collection (e.g. a retry, or a recursive subcollection walk that
/// loops back) makes one `/collections/{key}/items` call instead of one per
/// visit (§4.6).
type CollectionCache = Mutex<HashMap<(String, bool), Vec<ZoteroItem>>>;

pub struct RemoteZoteroClient {
    http: reqwest::Client,
    base_url: String,
    library_id: String,
    library_type: String,
    api_key: String,
    last_request_at: AsyncMutex<Option<Instant>>,
    tracker: ApiCallTracker,
    collection_cache: CollectionCache,
}

impl RemoteZoteroClient {
    pub fn new(library_id: impl Into<String>, library_type: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://api.zotero.org".to_string(),
            library_id: library_id.into(),
            library_type: library_type.into(),
            api_key: api_key.into(),
            last_request_at: AsyncMutex::new(None),
            tracker: ApiCallTracker::new(),
            collection_cache: Mutex::new(HashMap::new()),
        }
    }

    fn library_prefix(&self) -> String {
        let kind = if self.library_type == "group" { "groups" } else { "users" };
        format!("{kind}/{}", self.library_id)
    }

    async fn rate_limit(&self) {
        self.tracker.record_call();
        let mut last = self.last_request_at.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt)).min(BACKOFF_CAP);
        let mut rng = rand::thread_rng();
        let jitter_frac: f64 = rng.gen_range(-0.25..0.25);
        let millis = (exp.as_millis() as f64) * (1.0 + jitter_frac);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ZoteroError> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            self.rate_limit().await;
            let url = format!("{}/{}{path}", self.base_url, self.library_prefix());
            let result = self.http.get(&url).header("Zotero-API-Key", &self.api_key).send().await;

            match result {
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(60);
                    last_err = Some(ZoteroError::RateLimit { retry_after_secs: retry_after });
                }
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.map_err(|e| ZoteroError::Api(e.to_string()));
                }
                Ok(resp) => {
                    last_err = Some(ZoteroError::Api(format!("HTTP {}", resp.status())));
                }
                Err(e) => last_err = Some(ZoteroError::Api(e.to_string())),
            }

            if attempt + 1 < MAX_ATTEMPTS {
                let delay = Self::backoff_delay(attempt);
                tracing::warn!(attempt, ?delay, "zotero web api call failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| ZoteroError::Api("exhausted retries".to_string())))
    }

    /// Emitted by the orchestrator at the end of a batch (§4.6).
    pub fn log_api_call_summary(&self) {
        if let Some((count, elapsed)) = self.tracker.summary() {
            tracing::info!(count, duration_secs = elapsed.as_secs_f64(), "made zotero web api calls");
        }
    }
}

#[async_trait::async_trait]
impl ZoteroSource for RemoteZoteroClient {
    async fn list_collections(&self) -> Result<Vec<ZoteroCollection>, ZoteroError> {
        let body = self.get_json("/collections").await?;
        parse_collections(&body)
    }

    async fn get_collection_items(
        &self,
        collection_key: &str,
        include_subcollections: bool,
    ) -> Result<Vec<ZoteroItem>, ZoteroError> {
        let cache_key = (collection_key.to_string(), include_subcollections);
        if let Some(cached) = self.collection_cache.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let body = self.get_json(&format!("/collections/{collection_key}/items")).await?;
        let mut items = parse_items(&body)?;

        if include_subcollections {
            let subs = self.get_json(&format!("/collections/{collection_key}/collections")).await?;
            for sub in subs.as_array().into_iter().flatten() {
                if let Some(sub_key) = sub.pointer("/data/key").and_then(|v| v.as_str()) {
                    let nested = Box::pin(self.get_collection_items(sub_key, true)).await;
                    match nested {
                        Ok(sub_items) => items.extend(sub_items),
                        Err(e) => tracing::warn!(collection_key, sub_key, error = %e, "failed to fetch subcollection items"),
                    }
                }
            }
        }

        self.collection_cache.lock().unwrap().insert(cache_key, items.clone());
        Ok(items)
    }

    async fn get_item_attachments(&self, item_key: &str) -> Result<Vec<ZoteroAttachment>, ZoteroError> {
        let body = self.get_json(&format!("/items/{item_key}/children")).await?;
        parse_attachments(&body, item_key)
    }

    async fn download_attachment(
        &self,
        item_key: &str,
        attachment_key: &str,
        output_path: &Path,
    ) -> Result<(PathBuf, ResolvedSource), ZoteroError> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ZoteroError::Api(e.to_string()))?;
        }

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            self.rate_limit().await;
            let url = format!(
                "{}/{}/items/{attachment_key}/file",
                self.base_url,
                self.library_prefix()
            );
            let result = self.http.get(&url).header("Zotero-API-Key", &self.api_key).send().await;

            match result {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    return Err(ZoteroError::AttachmentNotFound {
                        item_key: item_key.to_string(),
                        attachment_key: attachment_key.to_string(),
                    });
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    last_err = Some(ZoteroError::RateLimit { retry_after_secs: 60 });
                }
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(|e| ZoteroError::Api(e.to_string()))?;
                    tokio::fs::write(output_path, &bytes)
                        .await
                        .map_err(|e| ZoteroError::Api(e.to_string()))?;
                    return Ok((output_path.to_path_buf(), ResolvedSource::Web));
                }
                Ok(resp) => last_err = Some(ZoteroError::Api(format!("HTTP {}", resp.status()))),
                Err(e) => last_err = Some(ZoteroError::Api(e.to_string())),
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Self::backoff_delay(attempt)).await;
            }
        }
        Err(last_err.unwrap_or_else(|| ZoteroError::Api("exhausted retries".to_string())))
    }

    async fn get_item_metadata(&self, item_key: &str) -> Result<ZoteroItemMetadata, ZoteroError> {
        let body = self.get_json(&format!("/items/{item_key}")).await?;
        parse_item_metadata(&body)
    }

    async fn list_tags(&self) -> Result<Vec<ZoteroTag>, ZoteroError> {
        let body = self.get_json("/tags").await?;
        let mut tags = Vec::new();
        for entry in body.as_array().into_iter().flatten() {
            match entry {
                serde_json::Value::String(tag) => tags.push(ZoteroTag { tag: tag.clone(), num_items: 0 }),
                serde_json::Value::Object(_) => {
                    let tag = entry.pointer("/tag").and_then(|v| v.as_str()).unwrap_or_default();
                    let num_items = entry.pointer("/meta/numItems").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    tags.push(ZoteroTag { tag: tag.to_string(), num_items });
                }
                _ => {}
            }
        }
        Ok(tags)
    }

    async fn get_recent_items(&self, limit: usize) -> Result<Vec<ZoteroItem>, ZoteroError> {
        let body = self
            .get_json(&format!("/items?sort=dateAdded&direction=desc&limit={limit}"))
            .await?;
        parse_items(&body)
    }

    async fn find_collection_by_name(&self, name: &str) -> Result<Option<ZoteroCollection>, ZoteroError> {
        let collections = self.list_collections().await?;
        let needle = name.to_ascii_lowercase();
        Ok(collections.into_iter().find(|c| c.name.to_ascii_lowercase().contains(&needle)))
    }
}

fn parse_collections(body: &serde_json::Value) -> Result<Vec<ZoteroCollection>, ZoteroError> {
    let mut out = Vec::new();
    for entry in body.as_array().into_iter().flatten() {
        let data = entry.pointer("/data").cloned().unwrap_or_default();
        out.push(ZoteroCollection {
            key: data.get("key").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            name: data.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            parent_collection: data.get("parentCollection").and_then(|v| v.as_str()).map(str::to_string),
        });
    }
    Ok(out)
}

fn parse_items(body: &serde_json::Value) -> Result<Vec<ZoteroItem>, ZoteroError> {
    let mut out = Vec::new();
    for entry in body.as_array().into_iter().flatten() {
        let key = entry.get("key").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let metadata = parse_item_metadata(entry)?;
        out.push(ZoteroItem { key, data: metadata });
    }
    Ok(out)
}

fn parse_item_metadata(entry: &serde_json::Value) -> Result<ZoteroItemMetadata, ZoteroError> {
    let data = entry.pointer("/data").cloned().unwrap_or_else(|| entry.clone());
    let date = data.get("date").and_then(|v| v.as_str()).map(str::to_string);
    let year = date.as_ref().and_then(|d| d.split('-').next()).and_then(|y| y.parse::<i32>().ok());

    let tags = data
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.get("tag").and_then(|v| v.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let collections = data
        .get("collections")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    Ok(ZoteroItemMetadata {
        title: data.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        creators: Vec::new(),
        date,
        year,
        doi: data
            .get("DOI")
            .or_else(|| data.get("doi"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        tags,
        collections,
        url: data.get("url").and_then(|v| v.as_str()).map(str::to_string),
        language: data.get("language").and_then(|v| v.as_str()).map(str::to_string),
        item_type: data.get("itemType").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        extra: data.get("extra").and_then(|v| v.as_str()).map(str::to_string),
    })
}

fn parse_attachments(body: &serde_json::Value, item_key: &str) -> Result<Vec<ZoteroAttachment>, ZoteroError> {
    use crate::types::LinkMode;
    let mut out = Vec::new();
    for entry in body.as_array().into_iter().flatten() {
        let data = entry.pointer("/data").cloned().unwrap_or_default();
        let link_mode_str = data.get("linkMode").and_then(|v| v.as_str()).unwrap_or_default();
        let link_mode = match link_mode_str {
            "imported_file" => LinkMode::ImportedFile,
            "linked_file" => LinkMode::LinkedFile,
            "imported_url" => LinkMode::ImportedUrl,
            "linked_url" => LinkMode::LinkedUrl,
            _ => continue,
        };
        out.push(ZoteroAttachment {
            key: data.get("key").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            parent_item_key: item_key.to_string(),
            filename: data.get("filename").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            content_type: data.get("contentType").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            link_mode,
            linked_path: data.get("path").and_then(|v| v.as_str()).map(str::to_string),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_respects_cap() {
        let delay = RemoteZoteroClient::backoff_delay(10);
        assert!(delay <= BACKOFF_CAP + BACKOFF_CAP / 4);
    }

    #[test]
    fn library_prefix_uses_groups_for_group_libraries() {
        let client = RemoteZoteroClient::new("123", "group", "key");
        assert_eq!(client.library_prefix(), "groups/123");
    }

    #[test]
    fn library_prefix_uses_users_for_user_libraries() {
        let client = RemoteZoteroClient::new("123", "user", "key");
        assert_eq!(client.library_prefix(), "users/123");
    }
}
