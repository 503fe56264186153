use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FerretError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub views: ViewsConfig,
}

impl Config {
    pub fn load(explicit_path: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let mut config = Self::default();

        let explicit = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("FERRET_CONFIG").ok().map(PathBuf::from));

        if let Some(path) = explicit {
            if let Some(patch) = Self::load_patch(&path)? {
                config.merge_patch(patch);
            }
        } else {
            if let Some(global) = Self::load_global()? {
                config.merge_patch(global);
            }
            if let Some(local) = Self::load_patch(&data_dir.join("config.toml"))? {
                config.merge_patch(local);
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Default data directory (`~/.local/share/ferret` on Linux).
    pub fn default_data_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("ferret"))
            .ok_or_else(|| FerretError::MissingConfig("data directory not found".to_string()))
    }

    /// Database path, relative paths resolved against `data_dir`.
    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        match self.storage.db_path.as_deref() {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => data_dir.join(path),
            None => data_dir.join("ferret.db"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        for (key, value) in [
            ("cache.hit_threshold", cache.hit_threshold),
            ("cache.suggest_threshold", cache.suggest_threshold),
            ("search.min_cosine", self.search.min_cosine),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(FerretError::Config(format!(
                    "{key} must be within [-1, 1], got {value}"
                )));
            }
        }
        if cache.suggest_threshold > cache.hit_threshold {
            return Err(FerretError::Config(format!(
                "cache.suggest_threshold ({}) must not exceed cache.hit_threshold ({})",
                cache.suggest_threshold, cache.hit_threshold
            )));
        }
        if self.backend.embedding_dims == 0 {
            return Err(FerretError::Config(
                "backend.embedding_dims must be greater than 0".to_string(),
            ));
        }
        if self.history.max_unpinned == 0 {
            return Err(FerretError::Config(
                "history.max_unpinned must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn load_global() -> Result<Option<ConfigPatch>> {
        let Some(dir) = dirs::config_dir() else {
            return Ok(None);
        };
        Self::load_patch(&dir.join("ferret/config.toml"))
    }

    fn load_patch(path: &Path) -> Result<Option<ConfigPatch>> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|err| FerretError::Config(format!("read config {}: {err}", path.display())))?;
        let patch = toml::from_str(&raw).map_err(|err| {
            FerretError::Config(format!("parse config {}: {err}", path.display()))
        })?;
        Ok(Some(patch))
    }

    fn merge_patch(&mut self, patch: ConfigPatch) {
        if let Some(patch) = patch.storage {
            self.storage.merge(patch);
        }
        if let Some(patch) = patch.search {
            self.search.merge(patch);
        }
        if let Some(patch) = patch.cache {
            self.cache.merge(patch);
        }
        if let Some(patch) = patch.history {
            self.history.merge(patch);
        }
        if let Some(patch) = patch.backend {
            self.backend.merge(patch);
        }
        if let Some(patch) = patch.views {
            self.views.merge(patch);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_string("FERRET_DB") {
            self.storage.db_path = Some(value);
        }
        if env_bool("FERRET_CACHE_DISABLED").unwrap_or(false) {
            self.cache.enabled = false;
        }
        if let Some(value) = env_f32("FERRET_CACHE_HIT_THRESHOLD")? {
            self.cache.hit_threshold = value;
        }
        if let Some(value) = env_f32("FERRET_CACHE_SUGGEST_THRESHOLD")? {
            self.cache.suggest_threshold = value;
        }
        if let Some(value) = env_u32("FERRET_HISTORY_MAX_UNPINNED")? {
            self.history.max_unpinned = value;
        }

        if let Some(value) = env_string("FERRET_EMBEDDER") {
            self.backend.embedder = value;
        }
        if let Some(value) = env_string("FERRET_EMBEDDING_URL") {
            self.backend.embedding_url = value;
        }
        if let Some(value) = env_string("FERRET_EMBEDDING_MODEL") {
            self.backend.embedding_model = value;
        }
        if let Some(value) = env_u32("FERRET_EMBEDDING_DIMS")? {
            self.backend.embedding_dims = value;
        }
        if let Some(value) = env_string("FERRET_RERANKER") {
            self.backend.reranker = value;
        }
        if let Some(value) = env_string("FERRET_RERANK_URL") {
            self.backend.rerank_url = value;
        }
        if let Some(value) = env_string("FERRET_RERANK_POLICY") {
            self.backend.rerank_policy = value;
        }
        if let Some(value) = env_u64("FERRET_RERANK_DELAY_MS")? {
            self.backend.rerank_delay_ms = value;
        }

        if let Some(value) = env_u32("FERRET_VIEWS_CONCURRENCY")? {
            self.views.refresh_concurrency = value;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<String>,
    #[serde(default)]
    pub read_pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            read_pool_size: 4,
        }
    }
}

impl StorageConfig {
    fn merge(&mut self, patch: StoragePatch) {
        if let Some(value) = patch.db_path {
            self.db_path = Some(value);
        }
        if let Some(value) = patch.read_pool_size {
            self.read_pool_size = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum lexical hits per query.
    #[serde(default)]
    pub lexical_limit: u32,
    /// Maximum corpus items admitted by the cosine stage.
    #[serde(default)]
    pub semantic_limit: u32,
    /// Cosine floor for items that did not already match lexically.
    #[serde(default)]
    pub min_cosine: f32,
    #[serde(default)]
    pub rrf_k: f32,
    #[serde(default)]
    pub lexical_weight: f32,
    #[serde(default)]
    pub semantic_weight: f32,
    /// Top-N of the fused list sent to the reranker.
    #[serde(default)]
    pub rerank_candidates: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            lexical_limit: 100,
            semantic_limit: 50,
            min_cosine: 0.25,
            rrf_k: 60.0,
            lexical_weight: 1.0,
            semantic_weight: 1.0,
            rerank_candidates: 30,
        }
    }
}

impl SearchConfig {
    fn merge(&mut self, patch: SearchPatch) {
        if let Some(value) = patch.lexical_limit {
            self.lexical_limit = value;
        }
        if let Some(value) = patch.semantic_limit {
            self.semantic_limit = value;
        }
        if let Some(value) = patch.min_cosine {
            self.min_cosine = value;
        }
        if let Some(value) = patch.rrf_k {
            self.rrf_k = value;
        }
        if let Some(value) = patch.lexical_weight {
            self.lexical_weight = value;
        }
        if let Some(value) = patch.semantic_weight {
            self.semantic_weight = value;
        }
        if let Some(value) = patch.rerank_candidates {
            self.rerank_candidates = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Similarity at or above which a prior search is used as a placeholder.
    #[serde(default)]
    pub hit_threshold: f32,
    /// Similarity at or above which a prior search is only suggested.
    #[serde(default)]
    pub suggest_threshold: f32,
    /// How many recently used history entries the similarity probe scans.
    #[serde(default)]
    pub recent_window: u32,
    #[serde(default)]
    pub memory_entries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hit_threshold: 0.95,
            suggest_threshold: 0.80,
            recent_window: 200,
            memory_entries: 64,
        }
    }
}

impl CacheConfig {
    fn merge(&mut self, patch: CachePatch) {
        if let Some(value) = patch.enabled {
            self.enabled = value;
        }
        if let Some(value) = patch.hit_threshold {
            self.hit_threshold = value;
        }
        if let Some(value) = patch.suggest_threshold {
            self.suggest_threshold = value;
        }
        if let Some(value) = patch.recent_window {
            self.recent_window = value;
        }
        if let Some(value) = patch.memory_entries {
            self.memory_entries = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Unpinned entries kept before least-recently-used eviction.
    #[serde(default)]
    pub max_unpinned: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_unpinned: 200 }
    }
}

impl HistoryConfig {
    fn merge(&mut self, patch: HistoryPatch) {
        if let Some(value) = patch.max_unpinned {
            self.max_unpinned = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `hash` (offline) or `ollama`.
    #[serde(default)]
    pub embedder: String,
    #[serde(default)]
    pub embedding_url: String,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_dims: u32,
    #[serde(default)]
    pub embed_timeout_ms: u64,
    #[serde(default)]
    pub corpus_timeout_ms: u64,
    /// `none`, `overlap` (offline) or `http`.
    #[serde(default)]
    pub reranker: String,
    #[serde(default)]
    pub rerank_url: String,
    #[serde(default)]
    pub rerank_model: String,
    /// `batch` reranks automatically, `sequential` waits for the user.
    #[serde(default)]
    pub rerank_policy: String,
    #[serde(default)]
    pub rerank_timeout_ms: u64,
    /// Artificial per-candidate delay for the offline sequential reranker.
    #[serde(default)]
    pub rerank_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            embedder: "hash".to_string(),
            embedding_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dims: 384,
            embed_timeout_ms: 10_000,
            corpus_timeout_ms: 10_000,
            reranker: "overlap".to_string(),
            rerank_url: "http://localhost:8080".to_string(),
            rerank_model: "bge-reranker-base".to_string(),
            rerank_policy: "batch".to_string(),
            rerank_timeout_ms: 30_000,
            rerank_delay_ms: 0,
        }
    }
}

impl BackendConfig {
    pub const fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub const fn corpus_timeout(&self) -> Duration {
        Duration::from_millis(self.corpus_timeout_ms)
    }

    pub const fn rerank_timeout(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }

    fn merge(&mut self, patch: BackendPatch) {
        if let Some(value) = patch.embedder {
            self.embedder = value;
        }
        if let Some(value) = patch.embedding_url {
            self.embedding_url = value;
        }
        if let Some(value) = patch.embedding_model {
            self.embedding_model = value;
        }
        if let Some(value) = patch.embedding_dims {
            self.embedding_dims = value;
        }
        if let Some(value) = patch.embed_timeout_ms {
            self.embed_timeout_ms = value;
        }
        if let Some(value) = patch.corpus_timeout_ms {
            self.corpus_timeout_ms = value;
        }
        if let Some(value) = patch.reranker {
            self.reranker = value;
        }
        if let Some(value) = patch.rerank_url {
            self.rerank_url = value;
        }
        if let Some(value) = patch.rerank_model {
            self.rerank_model = value;
        }
        if let Some(value) = patch.rerank_policy {
            self.rerank_policy = value;
        }
        if let Some(value) = patch.rerank_timeout_ms {
            self.rerank_timeout_ms = value;
        }
        if let Some(value) = patch.rerank_delay_ms {
            self.rerank_delay_ms = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsConfig {
    #[serde(default)]
    pub refresh_concurrency: u32,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            refresh_concurrency: 2,
        }
    }
}

impl ViewsConfig {
    fn merge(&mut self, patch: ViewsPatch) {
        if let Some(value) = patch.refresh_concurrency {
            self.refresh_concurrency = value;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigPatch {
    pub storage: Option<StoragePatch>,
    pub search: Option<SearchPatch>,
    pub cache: Option<CachePatch>,
    pub history: Option<HistoryPatch>,
    pub backend: Option<BackendPatch>,
    pub views: Option<ViewsPatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StoragePatch {
    pub db_path: Option<String>,
    pub read_pool_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SearchPatch {
    pub lexical_limit: Option<u32>,
    pub semantic_limit: Option<u32>,
    pub min_cosine: Option<f32>,
    pub rrf_k: Option<f32>,
    pub lexical_weight: Option<f32>,
    pub semantic_weight: Option<f32>,
    pub rerank_candidates: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CachePatch {
    pub enabled: Option<bool>,
    pub hit_threshold: Option<f32>,
    pub suggest_threshold: Option<f32>,
    pub recent_window: Option<u32>,
    pub memory_entries: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HistoryPatch {
    pub max_unpinned: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BackendPatch {
    pub embedder: Option<String>,
    pub embedding_url: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dims: Option<u32>,
    pub embed_timeout_ms: Option<u64>,
    pub corpus_timeout_ms: Option<u64>,
    pub reranker: Option<String>,
    pub rerank_url: Option<String>,
    pub rerank_model: Option<String>,
    pub rerank_policy: Option<String>,
    pub rerank_timeout_ms: Option<u64>,
    pub rerank_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ViewsPatch {
    pub refresh_concurrency: Option<u32>,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u32>()
            .map(Some)
            .map_err(|err| FerretError::Config(format!("invalid {key} value {value}: {err}"))),
        Err(_) => Ok(None),
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|err| FerretError::Config(format!("invalid {key} value {value}: {err}"))),
        Err(_) => Ok(None),
    }
}

fn env_f32(key: &str) -> Result<Option<f32>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<f32>()
            .map(Some)
            .map_err(|err| FerretError::Config(format!("invalid {key} value {value}: {err}"))),
        Err(_) => Ok(None),
    }
}
