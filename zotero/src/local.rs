//! Local Zotero Reader (C5): read-only SQLite snapshot of the Zotero library.
//! Ported in meaning from
//! `infrastructure/adapters/zotero_local_db.py`'s `LocalZoteroDbAdapter`.

use crate::port::{LocalResolutionProbe, ResolvedSource, ZoteroError, ZoteroSource};
use crate::types::{LinkMode, ZoteroAttachment, ZoteroCollection, ZoteroItem, ZoteroItemMetadata, ZoteroTag};
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Excludes `attachment` and `annotation` rows when listing items (§4.5).
const ITEM_TYPE_EXCLUSIONS: [&str; 2] = ["attachment", "annotation"];

pub struct LocalZoteroReader {
    conn: Mutex<Connection>,
    storage_dir: PathBuf,
}

impl LocalZoteroReader {
    /// Opens `db_path` in immutable read-only URI mode so it is safe to read
    /// while Zotero itself holds write locks (§4.5).
    pub fn open(db_path: impl AsRef<Path>, storage_dir: impl AsRef<Path>) -> Result<Self, ZoteroError> {
        let abs_path = db_path
            .as_ref()
            .canonicalize()
            .map_err(|e| ZoteroError::Connection(e.to_string()))?;
        let uri = format!("file:{}?immutable=1&mode=ro", abs_path.display());

        let conn = Connection::open_with_flags(
            uri,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| {
            let msg = e.to_string();
            if msg.to_ascii_lowercase().contains("locked") {
                ZoteroError::DatabaseLocked
            } else {
                ZoteroError::Connection(msg)
            }
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
            storage_dir: storage_dir.as_ref().to_path_buf(),
        })
    }

    /// Resolves the on-disk path for an attachment by `linkMode` (§4.5).
    fn resolve_attachment_path(
        &self,
        attachment_key: &str,
        parent_item_key: &str,
        filename: &str,
        link_mode: LinkMode,
        linked_path: Option<&str>,
    ) -> Result<PathBuf, ZoteroError> {
        match link_mode {
            LinkMode::LinkedFile | LinkMode::LinkedUrl => linked_path
                .map(PathBuf::from)
                .ok_or_else(|| ZoteroError::PathResolution { attempted: vec![] }),
            LinkMode::ImportedFile | LinkMode::ImportedUrl => {
                let primary = self.storage_dir.join(attachment_key).join(filename);
                if primary.is_file() {
                    return Ok(primary);
                }
                let fallback = self.storage_dir.join(parent_item_key).join(filename);
                if fallback.is_file() {
                    return Ok(fallback);
                }
                Err(ZoteroError::PathResolution {
                    attempted: vec![primary, fallback],
                })
            }
        }
    }

    /// Cached full-text for an item, if the `fulltext` table has an entry (§4.5, §4.8).
    pub fn get_cached_fulltext(&self, item_key: &str) -> Result<Option<String>, ZoteroError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT ft.content \
             FROM fulltextItems ft \
             JOIN items i ON i.itemID = ft.itemID \
             JOIN itemAttachments ia ON ia.itemID = i.itemID \
             WHERE ia.key = ?1",
            [item_key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| ZoteroError::Api(e.to_string()))
    }
}

#[async_trait::async_trait]
impl LocalResolutionProbe for LocalZoteroReader {
    async fn can_resolve_locally(&self, attachment_key: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT 1 FROM itemAttachments WHERE key = ?1",
            [attachment_key],
            |_| Ok(()),
        )
        .optional()
        .unwrap_or(None)
        .is_some()
    }
}

#[async_trait::async_trait]
impl ZoteroSource for LocalZoteroReader {
    async fn list_collections(&self) -> Result<Vec<ZoteroCollection>, ZoteroError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.key, c.collectionName, parent.key \
                 FROM collections c \
                 LEFT JOIN collections parent ON parent.collectionID = c.parentCollectionID",
            )
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ZoteroCollection {
                    key: row.get(0)?,
                    name: row.get(1)?,
                    parent_collection: row.get(2)?,
                })
            })
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>().map_err(|e| ZoteroError::Api(e.to_string()))
    }

    async fn get_collection_items(
        &self,
        collection_key: &str,
        include_subcollections: bool,
    ) -> Result<Vec<ZoteroItem>, ZoteroError> {
        let conn = self.conn.lock().unwrap();

        let collection_keys: Vec<String> = if include_subcollections {
            let mut stmt = conn
                .prepare(
                    "WITH RECURSIVE sub(collectionID) AS ( \
                        SELECT collectionID FROM collections WHERE key = ?1 \
                        UNION ALL \
                        SELECT c.collectionID FROM collections c JOIN sub ON c.parentCollectionID = sub.collectionID \
                     ) SELECT c.key FROM collections c JOIN sub ON c.collectionID = sub.collectionID",
                )
                .map_err(|e| ZoteroError::Api(e.to_string()))?;
            let rows = stmt
                .query_map([collection_key], |row| row.get::<_, String>(0))
                .map_err(|e| ZoteroError::Api(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| ZoteroError::Api(e.to_string()))?
        } else {
            vec![collection_key.to_string()]
        };

        let mut items = Vec::new();
        for key in &collection_keys {
            let mut stmt = conn
                .prepare(
                    "SELECT i.key, it.typeName, i.dateAdded \
                     FROM items i \
                     JOIN collectionItems ci ON ci.itemID = i.itemID \
                     JOIN collections c ON c.collectionID = ci.collectionID \
                     JOIN itemTypes it ON it.itemTypeID = i.itemTypeID \
                     WHERE c.key = ?1",
                )
                .map_err(|e| ZoteroError::Api(e.to_string()))?;

            let rows = stmt
                .query_map([key], |row| {
                    let item_key: String = row.get(0)?;
                    let item_type: String = row.get(1)?;
                    Ok((item_key, item_type))
                })
                .map_err(|e| ZoteroError::Api(e.to_string()))?;

            for row in rows {
                let (item_key, item_type) = row.map_err(|e| ZoteroError::Api(e.to_string()))?;
                if ITEM_TYPE_EXCLUSIONS.contains(&item_type.as_str()) {
                    continue;
                }
                items.push(ZoteroItem {
                    key: item_key,
                    data: ZoteroItemMetadata {
                        item_type,
                        ..Default::default()
                    },
                });
            }
        }

        Ok(items)
    }

    async fn get_item_attachments(&self, item_key: &str) -> Result<Vec<ZoteroAttachment>, ZoteroError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT ia.key, ia.path, ia.linkMode, ia.contentType, ia.filename \
                 FROM itemAttachments ia \
                 JOIN items parent_item ON parent_item.itemID = ia.parentItemID \
                 WHERE parent_item.key = ?1",
            )
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        let rows = stmt
            .query_map([item_key], |row| {
                let key: String = row.get(0)?;
                let path: Option<String> = row.get(1)?;
                let link_mode_raw: i64 = row.get(2)?;
                let content_type: Option<String> = row.get(3)?;
                let filename: Option<String> = row.get(4)?;
                Ok((key, path, link_mode_raw, content_type, filename))
            })
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (key, path, link_mode_raw, content_type, filename) = row.map_err(|e| ZoteroError::Api(e.to_string()))?;
            let link_mode = match link_mode_raw {
                0 => LinkMode::ImportedFile,
                1 => LinkMode::LinkedFile,
                2 => LinkMode::ImportedUrl,
                3 => LinkMode::LinkedUrl,
                _ => continue,
            };
            out.push(ZoteroAttachment {
                key,
                parent_item_key: item_key.to_string(),
                filename: filename.unwrap_or_default(),
                content_type: content_type.unwrap_or_default(),
                link_mode,
                linked_path: path,
            });
        }
        Ok(out.into_iter().filter(|a| a.is_pdf()).collect())
    }

    async fn download_attachment(
        &self,
        item_key: &str,
        attachment_key: &str,
        output_path: &Path,
    ) -> Result<(PathBuf, ResolvedSource), ZoteroError> {
        let attachments = self.get_item_attachments(item_key).await?;
        let attachment = attachments
            .into_iter()
            .find(|a| a.key == attachment_key)
            .ok_or_else(|| ZoteroError::AttachmentNotFound {
                item_key: item_key.to_string(),
                attachment_key: attachment_key.to_string(),
            })?;

        let source = self.resolve_attachment_path(
            &attachment.key,
            &attachment.parent_item_key,
            &attachment.filename,
            attachment.link_mode,
            attachment.linked_path.as_deref(),
        )?;

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ZoteroError::Api(e.to_string()))?;
        }
        std::fs::copy(&source, output_path).map_err(|e| ZoteroError::Api(e.to_string()))?;
        Ok((output_path.to_path_buf(), ResolvedSource::Local))
    }

    async fn get_item_metadata(&self, item_key: &str) -> Result<ZoteroItemMetadata, ZoteroError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT idv.value \
             FROM items i \
             JOIN itemData id ON id.itemID = i.itemID \
             JOIN itemDataValues idv ON idv.valueID = id.valueID \
             JOIN fields f ON f.fieldID = id.fieldID \
             WHERE i.key = ?1 AND f.fieldName = 'title'",
            [item_key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| ZoteroError::Api(e.to_string()))
        .map(|title| ZoteroItemMetadata {
            title: title.unwrap_or_default(),
            ..Default::default()
        })
    }

    async fn list_tags(&self) -> Result<Vec<ZoteroTag>, ZoteroError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT t.name, COUNT(it.itemID) \
                 FROM tags t \
                 LEFT JOIN itemTags it ON it.tagID = t.tagID \
                 GROUP BY t.tagID",
            )
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ZoteroTag {
                    tag: row.get(0)?,
                    num_items: row.get(1)?,
                })
            })
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>().map_err(|e| ZoteroError::Api(e.to_string()))
    }

    async fn get_recent_items(&self, limit: usize) -> Result<Vec<ZoteroItem>, ZoteroError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key FROM items ORDER BY dateAdded DESC LIMIT ?1")
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        let rows = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| ZoteroError::Api(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let key = row.map_err(|e| ZoteroError::Api(e.to_string()))?;
            out.push(ZoteroItem { key, data: ZoteroItemMetadata::default() });
        }
        Ok(out)
    }

    async fn find_collection_by_name(&self, name: &str) -> Result<Option<ZoteroCollection>, ZoteroError> {
        let collections = self.list_collections().await?;
        let needle = name.to_ascii_lowercase();
        Ok(collections.into_iter().find(|c| c.name.to_ascii_lowercase().contains(&needle)))
    }

    async fn get_cached_fulltext(&self, item_key: &str) -> Result<Option<String>, ZoteroError> {
        LocalZoteroReader::get_cached_fulltext(self, item_key)
    }
}

/// Locates the reference manager's profile directory per-platform by
/// parsing `profiles.ini` (§4.5). Returns `None` when no default profile is
/// marked and no profile section exists at all.
pub fn detect_profile_dir(zotero_base_dir: &Path) -> Option<PathBuf> {
    let profiles_ini = zotero_base_dir.join("Profiles").join("profiles.ini");
    let content = std::fs::read_to_string(&profiles_ini).ok()?;

    let mut sections: Vec<(bool, Option<String>)> = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_is_default = false;
    let mut in_profile_section = false;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            if in_profile_section {
                sections.push((current_is_default, current_path.take()));
            }
            in_profile_section = line.starts_with("[Profile");
            current_is_default = false;
            current_path = None;
            continue;
        }
        if !in_profile_section {
            continue;
        }
        if let Some(value) = line.strip_prefix("Default=") {
            current_is_default = value.trim() == "1";
        } else if let Some(value) = line.strip_prefix("Path=") {
            current_path = Some(value.trim().to_string());
        }
    }
    if in_profile_section {
        sections.push((current_is_default, current_path.take()));
    }

    sections
        .iter()
        .find(|(is_default, path)| *is_default && path.is_some())
        .or_else(|| sections.iter().find(|(_, path)| path.is_some()))
        .and_then(|(_, path)| path.clone())
        .map(|relative| zotero_base_dir.join("Profiles").join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detect_profile_dir_picks_marked_default() {
        let dir = tempdir().unwrap();
        let profiles_dir = dir.path().join("Profiles");
        std::fs::create_dir_all(&profiles_dir).unwrap();
        std::fs::write(
            profiles_dir.join("profiles.ini"),
            "[Profile0]\nPath=abc.default\nDefault=0\n\n[Profile1]\nPath=xyz.default\nDefault=1\n",
        )
        .unwrap();

        let resolved = detect_profile_dir(dir.path()).unwrap();
        assert_eq!(resolved, profiles_dir.join("xyz.default"));
    }

    #[test]
    fn detect_profile_dir_falls_back_to_first_when_no_default_marked() {
        let dir = tempdir().unwrap();
        let profiles_dir = dir.path().join("Profiles");
        std::fs::create_dir_all(&profiles_dir).unwrap();
        std::fs::write(profiles_dir.join("profiles.ini"), "[Profile0]\nPath=only.default\n").unwrap();

        let resolved = detect_profile_dir(dir.path()).unwrap();
        assert_eq!(resolved, profiles_dir.join("only.default"));
    }
}
