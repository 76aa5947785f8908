#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use candle::{Device, Result, Tensor};

mod bert;
mod classifier;
mod head;
mod pooler;

pub use bert::{BertModel, Config, PositionEmbeddingType};
pub use classifier::{ClassifierConfig, ClassifierOutput, DualEncoderClassifier, Tower, Towers};
pub use head::{RelationClassifyHead, NUM_LABELS};
pub use pooler::Pooler;

/// A transformer encoder mapping token ids and an attention mask to per-token hidden states
pub trait Encoder: Send + Sync {
    fn hidden_size(&self) -> usize;

    fn device(&self) -> &Device;

    /// `input_ids` and `attention_mask` are `(batch, seq_len)`, the result is
    /// `(batch, seq_len, hidden_size)`
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;
}
