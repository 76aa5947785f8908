#[cfg(feature = "clap")]
use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// A batch of (code, text) pairs, already tokenized and padded.
///
/// Every field is stored row-major: row `i` of `code_ids` is
/// `code_ids[i * code_length..(i + 1) * code_length]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairBatch {
    pub code_ids: Vec<u32>,
    pub code_attention_mask: Vec<u32>,
    pub text_ids: Vec<u32>,
    pub text_attention_mask: Vec<u32>,
    pub batch_size: usize,
    pub code_length: usize,
    pub text_length: usize,
}

impl PairBatch {
    pub fn new(
        code_ids: Vec<u32>,
        code_attention_mask: Vec<u32>,
        text_ids: Vec<u32>,
        text_attention_mask: Vec<u32>,
        batch_size: usize,
    ) -> Result<Self, BackendError> {
        if batch_size == 0 {
            return Err(BackendError::Validation(
                "`batch_size` must be at least 1".to_string(),
            ));
        }
        if code_ids.is_empty() || text_ids.is_empty() {
            return Err(BackendError::Validation(
                "`code_ids` and `text_ids` cannot be empty".to_string(),
            ));
        }

        let code_length = code_ids.len() / batch_size;
        let text_length = text_ids.len() / batch_size;

        for (name, len, expected) in [
            ("code_ids", code_ids.len(), batch_size * code_length),
            ("code_attention_mask", code_attention_mask.len(), batch_size * code_length),
            ("text_ids", text_ids.len(), batch_size * text_length),
            ("text_attention_mask", text_attention_mask.len(), batch_size * text_length),
        ] {
            if len != expected || expected == 0 {
                return Err(BackendError::Validation(format!(
                    "`{name}` has {len} elements, expected {expected} for a batch of {batch_size}"
                )));
            }
        }

        Ok(Self {
            code_ids,
            code_attention_mask,
            text_ids,
            text_attention_mask,
            batch_size,
            code_length,
            text_length,
        })
    }

    pub fn len(&self) -> usize {
        self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size == 0
    }
}

/// Output of a backend for a single (code, text) pair
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Raw logits for `[not-relevant, relevant]`
    pub logits: [f32; 2],
    /// Softmax probability of the relevant class
    pub score: f32,
    /// Pre-logit features, only filled when requested
    pub features: Option<Vec<f32>>,
}

pub type Predictions = Vec<Prediction>;

pub trait Backend {
    fn health(&self) -> Result<(), BackendError>;

    fn predict(&self, batch: PairBatch, features: bool) -> Result<Predictions, BackendError>;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    /// Average every position of the sequence, padding included
    #[default]
    Mean,
    /// Average only the positions selected by the attention mask
    MaskedMean,
    /// Select the first token as embedding
    Cls,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pool::Mean => write!(f, "mean"),
            Pool::MaskedMean => write!(f, "masked_mean"),
            Pool::Cls => write!(f, "cls"),
        }
    }
}

/// How the code and natural-language encoder towers relate to each other
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum TowerMode {
    /// One encoder and tokenizer serve both roles
    #[default]
    Shared,
    /// Each role owns its own encoder and tokenizer
    Independent,
}

impl fmt::Display for TowerMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TowerMode::Shared => write!(f, "shared"),
            TowerMode::Independent => write!(f, "independent"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum DType {
    Float16,
    #[default]
    Float32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DType::Float16 => write!(f, "float16"),
            DType::Float32 => write!(f, "float32"),
        }
    }
}

/// Train mode enables dropout, eval mode makes every forward pass deterministic
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

impl Mode {
    pub fn is_train(&self) -> bool {
        matches!(self, Mode::Train)
    }
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Input validation error: {0}")]
    Validation(String),
}
