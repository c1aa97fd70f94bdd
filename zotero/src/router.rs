//! Zotero Source Router (C4): picks between a local SQLite reader and the
//! remote Web API per a configured strategy, falling back per a fixed matrix.
//! Ported in meaning from `zotero_source_router.py`'s `ZoteroSourceRouter`.

use crate::port::{LocalResolutionProbe, ResolvedSource, ZoteroError, ZoteroSource};
use crate::types::{ZoteroAttachment, ZoteroCollection, ZoteroItem, ZoteroItemMetadata, ZoteroTag};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LocalOnly,
    WebOnly,
    LocalFirst,
    WebFirst,
    Auto,
}

/// Local adapter capability: both the data source and the cheap
/// resolvability probe the router consults before committing to it for
/// `download_attachment`.
pub trait LocalZoteroSource: ZoteroSource + LocalResolutionProbe {}
impl<T: ZoteroSource + LocalResolutionProbe> LocalZoteroSource for T {}

pub struct ZoteroSourceRouter {
    local: Option<Arc<dyn LocalZoteroSource>>,
    web: Option<Arc<dyn ZoteroSource>>,
    strategy: Strategy,
}

impl ZoteroSourceRouter {
    pub fn new(
        local: Option<Arc<dyn LocalZoteroSource>>,
        web: Option<Arc<dyn ZoteroSource>>,
        strategy: Strategy,
    ) -> Result<Self, ZoteroError> {
        match strategy {
            Strategy::LocalOnly if local.is_none() => return Err(ZoteroError::LocalUnavailable),
            Strategy::WebOnly if web.is_none() => {
                return Err(ZoteroError::Connection("web adapter required for web-only strategy".into()))
            }
            _ => {}
        }
        Ok(Self { local, web, strategy })
    }

    /// Ordered list of adapters to try for a generic (non-download) call,
    /// per the strategy's fallback table (§4.4).
    fn order(&self) -> Vec<(&'static str, &dyn ZoteroSource)> {
        let local_ref = self.local.as_deref().map(|l| ("local", l as &dyn ZoteroSource));
        let web_ref = self.web.as_deref().map(|w| ("web", w));

        match self.strategy {
            Strategy::LocalOnly => local_ref.into_iter().collect(),
            Strategy::WebOnly => web_ref.into_iter().collect(),
            Strategy::LocalFirst | Strategy::Auto => local_ref.into_iter().chain(web_ref).collect(),
            Strategy::WebFirst => web_ref.into_iter().chain(local_ref).collect(),
        }
    }

    async fn with_fallback<T, F, Fut>(&self, op_name: &str, call: F) -> Result<T, ZoteroError>
    where
        F: Fn(&'static str, &dyn ZoteroSource) -> Fut,
        Fut: std::future::Future<Output = Result<T, ZoteroError>>,
    {
        let order = self.order();
        if order.is_empty() {
            return Err(ZoteroError::LocalUnavailable);
        }

        let mut last_err = None;
        for (idx, (name, adapter)) in order.iter().enumerate() {
            match call(name, *adapter).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let is_last = idx + 1 == order.len();
                    if !is_last {
                        warn!(op = op_name, source = name, error = %e, "falling back to next zotero source");
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("order is non-empty"))
    }
}

#[async_trait::async_trait]
impl ZoteroSource for ZoteroSourceRouter {
    async fn list_collections(&self) -> Result<Vec<ZoteroCollection>, ZoteroError> {
        self.with_fallback("list_collections", |_, a| a.list_collections()).await
    }

    async fn get_collection_items(
        &self,
        collection_key: &str,
        include_subcollections: bool,
    ) -> Result<Vec<ZoteroItem>, ZoteroError> {
        self.with_fallback("get_collection_items", |_, a| {
            a.get_collection_items(collection_key, include_subcollections)
        })
        .await
    }

    async fn get_item_attachments(&self, item_key: &str) -> Result<Vec<ZoteroAttachment>, ZoteroError> {
        self.with_fallback("get_item_attachments", |_, a| a.get_item_attachments(item_key)).await
    }

    /// Download is special: before committing to a source, probe the local
    /// reader's cheap `can_resolve_locally` check so we don't silently fetch
    /// over the network when `local-first`/`auto` would have found the file
    /// on disk (§4.4).
    async fn download_attachment(
        &self,
        item_key: &str,
        attachment_key: &str,
        output_path: &Path,
    ) -> Result<(PathBuf, ResolvedSource), ZoteroError> {
        match self.strategy {
            Strategy::LocalOnly => {
                let local = self.local.as_ref().ok_or(ZoteroError::LocalUnavailable)?;
                local.download_attachment(item_key, attachment_key, output_path).await
            }
            Strategy::WebOnly => {
                let web = self
                    .web
                    .as_ref()
                    .ok_or_else(|| ZoteroError::Connection("no web adapter configured".into()))?;
                web.download_attachment(item_key, attachment_key, output_path).await
            }
            Strategy::LocalFirst | Strategy::Auto => {
                if let Some(local) = &self.local {
                    if local.can_resolve_locally(attachment_key).await {
                        match local.download_attachment(item_key, attachment_key, output_path).await {
                            Ok(resolved) => return Ok(resolved),
                            Err(e) => warn!(attachment_key, error = %e, "local resolve probe succeeded but download failed, falling back to web"),
                        }
                    }
                }
                let web = self
                    .web
                    .as_ref()
                    .ok_or_else(|| ZoteroError::Connection("no web adapter configured".into()))?;
                web.download_attachment(item_key, attachment_key, output_path).await
            }
            Strategy::WebFirst => {
                if let Some(web) = &self.web {
                    match web.download_attachment(item_key, attachment_key, output_path).await {
                        Ok(resolved) => return Ok(resolved),
                        Err(e) => warn!(attachment_key, error = %e, "web download failed, falling back to local"),
                    }
                }
                let local = self.local.as_ref().ok_or(ZoteroError::LocalUnavailable)?;
                local.download_attachment(item_key, attachment_key, output_path).await
            }
        }
    }

    async fn get_item_metadata(&self, item_key: &str) -> Result<ZoteroItemMetadata, ZoteroError> {
        self.with_fallback("get_item_metadata", |_, a| a.get_item_metadata(item_key)).await
    }

    async fn list_tags(&self) -> Result<Vec<ZoteroTag>, ZoteroError> {
        self.with_fallback("list_tags", |_, a| a.list_tags()).await
    }

    async fn get_recent_items(&self, limit: usize) -> Result<Vec<ZoteroItem>, ZoteroError> {
        self.with_fallback("get_recent_items", |_, a| a.get_recent_items(limit)).await
    }

    async fn find_collection_by_name(&self, name: &str) -> Result<Option<ZoteroCollection>, ZoteroError> {
        self.with_fallback("find_collection_by_name", |_, a| a.find_collection_by_name(name)).await
    }

    /// Only the local reader ever caches full-text; forward to it directly
    /// rather than going through the web-fallback order (§4.5).
    async fn get_cached_fulltext(&self, item_key: &str) -> Result<Option<String>, ZoteroError> {
        if let Some(local) = &self.local {
            return local.get_cached_fulltext(item_key).await;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_without_local_adapter_is_rejected_at_construction() {
        let router = ZoteroSourceRouter::new(None, None, Strategy::LocalOnly);
        assert!(matches!(router, Err(ZoteroError::LocalUnavailable)));
    }

    #[test]
    fn web_only_without_web_adapter_is_rejected_at_construction() {
        let router = ZoteroSourceRouter::new(None, None, Strategy::WebOnly);
        assert!(router.is_err());
    }
}
