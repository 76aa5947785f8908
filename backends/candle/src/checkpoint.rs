use crate::models::{BertModel, ClassifierConfig, Config, RelationClassifyHead, Tower};
use crate::WrapErr;
use candle::{DType, Device};
use candle_nn::VarBuilder;
use code_relevance_backend_core::BackendError;
use hf_hub::api::sync::{ApiBuilder, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer};

/// Prefix of the classification head in checkpoints saved by the relevance classifier
pub const HEAD_PREFIX: &str = "cls";

/// Resolves a checkpoint identifier into an encoder tower.
///
/// The classifier only talks to this trait, so where weights come from (a local directory,
/// the Hugging Face Hub, a test fixture) stays outside of the model code.
pub trait CheckpointLoader {
    fn load(&self, identifier: &str, device: &Device, dtype: DType) -> Result<Tower, BackendError>;

    /// Fine-tuned classification head stored next to the encoder, if any
    fn load_head(
        &self,
        _identifier: &str,
        _config: &ClassifierConfig,
        _device: &Device,
        _dtype: DType,
    ) -> Result<Option<RelationClassifyHead>, BackendError> {
        Ok(None)
    }
}

/// Loads a directory laid out like `save_pretrained(...)` output: `config.json`,
/// `tokenizer.json` and `model.safetensors` (or `pytorch_model.bin`)
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCheckpoint;

impl CheckpointLoader for LocalCheckpoint {
    fn load(&self, identifier: &str, device: &Device, dtype: DType) -> Result<Tower, BackendError> {
        let model_path = Path::new(identifier);
        let config = load_config(model_path)?;
        let tokenizer = load_tokenizer(model_path, config.pad_token_id as u32)?;
        let vb = var_builder(model_path, dtype, device)?;

        tracing::info!("Starting Bert encoder on {device:?}");
        let encoder = BertModel::load(vb, &config).s()?;

        Ok(Tower::new(Box::new(encoder), tokenizer))
    }

    fn load_head(
        &self,
        identifier: &str,
        config: &ClassifierConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Option<RelationClassifyHead>, BackendError> {
        let vb = var_builder(Path::new(identifier), dtype, device)?;
        if !vb.contains_tensor(&format!("{HEAD_PREFIX}.dense.weight")) {
            return Ok(None);
        }

        tracing::info!("Loading classification head from `{identifier}`");
        RelationClassifyHead::load(vb.pp(HEAD_PREFIX), config)
            .map(Some)
            .s()
    }
}

/// Downloads checkpoints from the Hugging Face Hub, then loads them like [`LocalCheckpoint`].
///
/// Identifiers that are existing local directories are loaded without downloading.
#[derive(Debug, Clone, Default)]
pub struct HubCheckpoint {
    pub revision: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub token: Option<String>,
}

impl HubCheckpoint {
    pub fn new(revision: Option<String>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            revision,
            cache_dir,
            token: None,
        }
    }

    fn api_repo(&self, model_id: &str) -> Result<ApiRepo, ApiError> {
        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(self.token.clone());

        if let Some(cache_dir) = &self.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        } else if let Some(cache_dir) = std::env::var_os("HUGGINGFACE_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        }

        let api = builder.build()?;
        Ok(match &self.revision {
            Some(revision) => api.repo(Repo::with_revision(
                model_id.to_string(),
                RepoType::Model,
                revision.clone(),
            )),
            None => api.repo(Repo::new(model_id.to_string(), RepoType::Model)),
        })
    }

    /// Local directory holding the checkpoint files, downloading them when needed
    pub fn download_artifacts(&self, identifier: &str) -> Result<PathBuf, BackendError> {
        let local = Path::new(identifier);
        if local.is_dir() {
            return Ok(local.to_path_buf());
        }

        let start = std::time::Instant::now();
        tracing::info!("Starting download of `{identifier}`");

        let api_repo = self.api_repo(identifier).map_err(download_error)?;
        let config_path = download_file(&api_repo, "config.json")?;
        download_file(&api_repo, "tokenizer.json")?;

        if let Err(err) = download_file(&api_repo, "model.safetensors") {
            tracing::warn!("safetensors weights not found ({err}). Using `pytorch_model.bin` instead. Model loading will be significantly slower.");
            download_file(&api_repo, "pytorch_model.bin")?;
        }

        tracing::info!("Model artifacts downloaded in {:?}", start.elapsed());

        config_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BackendError::Start(format!("invalid download path for `{identifier}`")))
    }
}

impl CheckpointLoader for HubCheckpoint {
    fn load(&self, identifier: &str, device: &Device, dtype: DType) -> Result<Tower, BackendError> {
        let model_root = self.download_artifacts(identifier)?;
        LocalCheckpoint.load(&model_root.to_string_lossy(), device, dtype)
    }

    fn load_head(
        &self,
        identifier: &str,
        config: &ClassifierConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Option<RelationClassifyHead>, BackendError> {
        let model_root = self.download_artifacts(identifier)?;
        LocalCheckpoint.load_head(&model_root.to_string_lossy(), config, device, dtype)
    }
}

fn download_file(api: &ApiRepo, file_path: &str) -> Result<PathBuf, BackendError> {
    tracing::info!("Downloading `{}`", file_path);
    api.get(file_path).map_err(download_error)
}

fn download_error(err: ApiError) -> BackendError {
    BackendError::Start(format!("download failed: {err}"))
}

pub fn load_config(model_path: &Path) -> Result<Config, BackendError> {
    let config = std::fs::read_to_string(model_path.join("config.json"))
        .map_err(|err| BackendError::Start(format!("could not read `config.json`: {err}")))?;
    serde_json::from_str(&config)
        .map_err(|err| BackendError::Start(format!("invalid `config.json`: {err}")))
}

/// Load `tokenizer.json`, padding every batch to its longest member with `pad_token_id`
pub fn load_tokenizer(model_path: &Path, pad_token_id: u32) -> Result<Tokenizer, BackendError> {
    let mut tokenizer = Tokenizer::from_file(model_path.join("tokenizer.json"))
        .map_err(|err| BackendError::Start(format!("could not load `tokenizer.json`: {err}")))?;

    let pad_token = tokenizer
        .id_to_token(pad_token_id)
        .unwrap_or_else(|| "<pad>".to_string());
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        pad_id: pad_token_id,
        pad_token,
        ..Default::default()
    }));

    Ok(tokenizer)
}

fn var_builder(
    model_path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>, BackendError> {
    let safetensors_path = model_path.join("model.safetensors");
    if safetensors_path.exists() {
        // SAFETY: the file is only read, never mutated while mapped
        return unsafe { VarBuilder::from_mmaped_safetensors(&[safetensors_path], dtype, device) }
            .s();
    }

    let pth_path = model_path.join("pytorch_model.bin");
    if pth_path.exists() {
        tracing::warn!("Loading weights from `pytorch_model.bin`, consider converting them to safetensors");
        return VarBuilder::from_pth(pth_path, dtype, device).s();
    }

    Err(BackendError::Start(format!(
        "no `model.safetensors` or `pytorch_model.bin` in {}",
        model_path.display()
    )))
}
