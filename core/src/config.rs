use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Chunking policy (§3). `version` participates in the content fingerprint hash,
/// so any change here invalidates prior fingerprints.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingPolicyConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub heading_context_depth: usize,
    pub tokenizer_family: String,
    pub version: String,
}

impl Default for ChunkingPolicyConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 64,
            heading_context_depth: 2,
            tokenizer_family: "cl100k_base".to_string(),
            version: "1.0".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QdrantConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub raw_documents_dir: String,
    pub audit_dir: String,
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: String,
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: String,
    #[serde(default = "default_bindings_dir")]
    pub bindings_dir: String,
}

fn default_checkpoints_dir() -> String {
    "var/checkpoints".to_string()
}

fn default_downloads_dir() -> String {
    "var/zotero_downloads".to_string()
}

fn default_bindings_dir() -> String {
    "var/bindings".to_string()
}

/// One entry of `[project.<id>]`: the binding between a project namespace and a
/// vector-store collection plus the embedding models it is bound to (§3, §4.11).
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub collection: String,
    pub embedding_model: String,
    #[serde(default)]
    pub sparse_model: Option<String>,
    #[serde(default)]
    pub hybrid_enabled: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ZoteroEnvConfig {
    pub library_id: Option<String>,
    pub library_type: Option<String>,
    pub api_key: Option<String>,
    pub local: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub chunking: ChunkingPolicyConfig,
    pub qdrant: QdrantConfig,
    pub paths: PathsConfig,
    #[serde(rename = "project", default)]
    pub projects: HashMap<String, ProjectConfig>,
    #[serde(skip)]
    pub zotero: ZoteroEnvConfig,
    #[serde(skip)]
    pub openai_api_key: Option<String>,
}

impl AppConfig {
    /// Loads configuration: `.env` discovery (cwd + up to 3 ancestors, system env
    /// always wins), a TOML file source, then `CITELOOM_`-prefixed environment
    /// overrides, finished off with the handful of recognized bare env vars
    /// (`ZOTERO_*`, `QDRANT_*`, `OPENAI_API_KEY`) that don't follow that prefix
    /// convention (§6).
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        discover_dotenv();

        let config_path = explicit_path
            .map(|p| p.to_path_buf())
            .or_else(|| env::var("CITELOOM_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/citeloom"));

        let builder = Config::builder()
            .add_source(File::from(config_path).required(explicit_path.is_some()))
            .add_source(Environment::with_prefix("CITELOOM").separator("__"));

        let mut app: AppConfig = builder.build()?.try_deserialize()?;
        apply_recognized_env_vars(&mut app);
        Ok(app)
    }
}

/// Walks the working directory and up to three ancestors looking for a `.env`
/// file, loading the first one found. System environment variables already set
/// are never overwritten (`dotenvy::from_path` semantics).
fn discover_dotenv() {
    let mut dir = env::current_dir().ok();
    for _ in 0..=3 {
        let Some(candidate_dir) = dir.as_ref() else {
            break;
        };
        let candidate = candidate_dir.join(".env");
        if candidate.is_file() {
            let _ = dotenvy::from_path(&candidate);
            return;
        }
        dir = candidate_dir.parent().map(Path::to_path_buf);
    }
}

fn apply_recognized_env_vars(app: &mut AppConfig) {
    app.zotero = ZoteroEnvConfig {
        library_id: env::var("ZOTERO_LIBRARY_ID").ok(),
        library_type: env::var("ZOTERO_LIBRARY_TYPE").ok(),
        api_key: env::var("ZOTERO_API_KEY").ok(),
        local: env::var("ZOTERO_LOCAL")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    };
    app.openai_api_key = env::var("OPENAI_API_KEY").ok();
    if let Ok(url) = env::var("QDRANT_URL") {
        app.qdrant.url = url;
    }
    if let Ok(key) = env::var("QDRANT_API_KEY") {
        app.qdrant.api_key = Some(key);
    }
}
