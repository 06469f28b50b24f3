//! Model loading utilities.
//!
//! This module provides:
//! - Downloading models from HuggingFace Hub
//! - `ModelLoader`, a weight source over a local model directory
//! - `HfTokenizer`, the `tokenizers` crate behind the [`Tokenizer`] interface
//! - `InMemoryWeights`, a weight source over shards already in memory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{StateDict, Tokenizer, WeightSource};

/// Downloads model files from HuggingFace Hub.
///
/// # Arguments
///
/// * `model_id` - HuggingFace model ID (e.g., "Qwen/Qwen3-0.6B")
/// * `revision` - Git revision (branch, tag, or commit hash). Use "main" for latest.
///
/// # Returns
///
/// Paths to downloaded files: (config.json, model weights, tokenizer files)
pub fn download_model(model_id: &str, revision: &str) -> Result<ModelFiles> {
    let api = Api::new().map_err(|e| Error::ModelLoad(format!("Failed to create HF API: {e}")))?;

    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config_path = repo
        .get("config.json")
        .map_err(|e| Error::ModelLoad(format!("Failed to download config.json: {e}")))?;

    let weights_paths = download_weights(&repo)?;

    let tokenizer_path = repo
        .get("tokenizer.json")
        .map_err(|e| Error::ModelLoad(format!("Failed to download tokenizer.json: {e}")))?;

    Ok(ModelFiles {
        config: config_path,
        weights: weights_paths,
        tokenizer: tokenizer_path,
    })
}

/// Downloads model weight files.
fn download_weights(repo: &hf_hub::api::sync::ApiRepo) -> Result<Vec<PathBuf>> {
    // Single file first
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    // Sharded checkpoints list their files in the index
    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        let index_content = std::fs::read_to_string(&index_path)
            .map_err(|e| Error::ModelLoad(format!("Failed to read safetensors index: {e}")))?;

        let index: serde_json::Value = serde_json::from_str(&index_content)
            .map_err(|e| Error::ModelLoad(format!("Failed to parse safetensors index: {e}")))?;

        let weight_map = index["weight_map"].as_object().ok_or_else(|| {
            Error::ModelLoad("Invalid safetensors index: missing weight_map".into())
        })?;

        let mut shard_files: Vec<String> = weight_map
            .values()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect();
        shard_files.sort();
        shard_files.dedup();

        let mut paths = Vec::new();
        for filename in shard_files {
            let path = repo
                .get(&filename)
                .map_err(|e| Error::ModelLoad(format!("Failed to download {filename}: {e}")))?;
            paths.push(path);
        }
        return Ok(paths);
    }

    Err(Error::ModelLoad(
        "No SafeTensors weights found. Only the SafeTensors format is supported.".into(),
    ))
}

/// Paths to model files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors), in load order.
    pub weights: Vec<PathBuf>,
    /// Path to tokenizer.json.
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    /// Locate the files of a model stored in `dir`.
    ///
    /// Weight files are every `*.safetensors` in the directory, sorted by name.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut weights: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| Error::ModelLoad(format!("Failed to read {}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        weights.sort();

        if weights.is_empty() {
            return Err(Error::ModelLoad(format!(
                "No SafeTensors weights found in {}",
                dir.display()
            )));
        }

        Ok(Self {
            config: dir.join("config.json"),
            weights,
            tokenizer: dir.join("tokenizer.json"),
        })
    }
}

/// Weight source reading a model from disk, one safetensors file per shard.
#[derive(Debug, Clone)]
pub struct ModelLoader {
    files: ModelFiles,
}

impl ModelLoader {
    /// Load from a local model directory.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(ModelFiles::from_dir(dir)?))
    }

    /// Download from the HuggingFace Hub, then load.
    pub fn from_hub(model_id: &str, revision: &str) -> Result<Self> {
        Ok(Self::new(download_model(model_id, revision)?))
    }

    /// Load a local directory if `model` names one, otherwise treat it as a Hub id.
    pub fn from_path_or_hub(model: &str) -> Result<Self> {
        if Path::new(model).is_dir() {
            Self::from_dir(model)
        } else {
            Self::from_hub(model, "main")
        }
    }

    pub fn new(files: ModelFiles) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &ModelFiles {
        &self.files
    }
}

impl WeightSource for ModelLoader {
    fn config(&self) -> Result<serde_json::Value> {
        let content = std::fs::read_to_string(&self.files.config)
            .map_err(|e| Error::ModelLoad(format!("Failed to read config.json: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::ModelLoad(format!("Failed to parse config.json: {e}")))
    }

    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::new(HfTokenizer::from_file(&self.files.tokenizer)?))
    }

    fn into_state_dicts(self) -> Box<dyn Iterator<Item = Result<StateDict>>> {
        let total = self.files.weights.len();
        Box::new(
            self.files
                .weights
                .into_iter()
                .enumerate()
                .map(move |(i, path)| {
                    info!("Loading weights {}/{}: {}", i + 1, total, path.display());
                    StateDict::from_safetensors(&path)
                }),
        )
    }
}

/// Tokenizer backed by a HuggingFace `tokenizer.json`.
#[derive(Debug, Clone)]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::Tokenization(format!("Failed to load {}: {e}", path.display()))
        })?;
        Ok(Self { inner })
    }

    /// Id of `token`, if it is in the vocabulary.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Weight source over a config, a tokenizer and shards that are already in memory.
pub struct InMemoryWeights {
    config: serde_json::Value,
    tokenizer: Arc<dyn Tokenizer>,
    shards: Vec<StateDict>,
}

impl InMemoryWeights {
    pub fn new(
        config: serde_json::Value,
        tokenizer: Arc<dyn Tokenizer>,
        shards: Vec<StateDict>,
    ) -> Self {
        Self {
            config,
            tokenizer,
            shards,
        }
    }
}

impl WeightSource for InMemoryWeights {
    fn config(&self) -> Result<serde_json::Value> {
        Ok(self.config.clone())
    }

    fn tokenizer(&self) -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::clone(&self.tokenizer))
    }

    fn into_state_dicts(self) -> Box<dyn Iterator<Item = Result<StateDict>>> {
        Box::new(self.shards.into_iter().map(Ok))
    }
}
