//! Wire/domain types for the Zotero capability set, shared by the local (C5)
//! and remote (C6) adapters and the router (C4). Field sets mirror the shapes
//! returned by `zotero_importer.py`'s adapter methods.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoteroCollection {
    pub key: String,
    pub name: String,
    pub parent_collection: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    ImportedFile,
    LinkedFile,
    ImportedUrl,
    LinkedUrl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoteroAttachment {
    pub key: String,
    pub parent_item_key: String,
    pub filename: String,
    pub content_type: String,
    pub link_mode: LinkMode,
    /// For `LinkMode::LinkedFile`: the absolute path the user's library points at.
    pub linked_path: Option<String>,
}

impl ZoteroAttachment {
    pub fn is_pdf(&self) -> bool {
        self.content_type == "application/pdf" || self.filename.to_ascii_lowercase().ends_with(".pdf")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoteroCreator {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub name: Option<String>,
}

impl ZoteroCreator {
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (None, Some(last)) => last.clone(),
            (Some(first), None) => first.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Raw item metadata as returned by the library API, prior to C7 resolution
/// into `citeloom_core::model::CitationMetadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ZoteroItemMetadata {
    pub title: String,
    #[serde(default)]
    pub creators: Vec<ZoteroCreator>,
    pub date: Option<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub collections: Vec<String>,
    pub url: Option<String>,
    pub language: Option<String>,
    pub item_type: String,
    pub extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoteroItem {
    pub key: String,
    pub data: ZoteroItemMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoteroTag {
    pub tag: String,
    pub num_items: u32,
}
