pub mod checkpoint;
mod layers;
mod models;

pub use crate::checkpoint::{CheckpointLoader, HubCheckpoint, LocalCheckpoint};
pub use crate::layers::{HiddenAct, Linear};
pub use crate::models::{
    BertModel, ClassifierConfig, ClassifierOutput, Config, DualEncoderClassifier, Encoder,
    Pooler, RelationClassifyHead, Tower, Towers, NUM_LABELS,
};
use candle::{DType, Device};
use code_relevance_backend_core::{
    Backend, BackendError, PairBatch, Pool, Prediction, Predictions, TowerMode,
};
use std::path::Path;

pub struct CandleBackend {
    classifier: DualEncoderClassifier,
}

impl CandleBackend {
    pub fn new(
        model_path: &Path,
        dtype: String,
        pool: Option<Pool>,
        towers: TowerMode,
    ) -> Result<Self, BackendError> {
        let config = checkpoint::load_config(model_path)?;

        // Get candle device
        let device = if cfg!(feature = "cuda") {
            Device::new_cuda(0).s()?
        } else if cfg!(feature = "metal") {
            Device::new_metal(0).s()?
        } else {
            Device::Cpu
        };

        let dtype = match dtype.as_str() {
            "float32" => DType::F32,
            "float16" => DType::F16,
            _ => {
                return Err(BackendError::Start(format!(
                    "dtype {dtype} is not supported"
                )))
            }
        };

        let mut classifier_config = ClassifierConfig::from_encoder_config(&config);
        classifier_config.towers = towers;
        if let Some(pool) = pool {
            classifier_config.pool = pool;
        }

        tracing::info!("Starting relevance classifier on {device:?}");
        let classifier = DualEncoderClassifier::from_pretrained(
            classifier_config,
            &model_path.to_string_lossy(),
            &LocalCheckpoint,
            &device,
            dtype,
        )?;

        Ok(Self { classifier })
    }

    pub fn from_classifier(classifier: DualEncoderClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &DualEncoderClassifier {
        &self.classifier
    }
}

impl Backend for CandleBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn predict(&self, batch: PairBatch, features: bool) -> Result<Predictions, BackendError> {
        let output = self.classifier.forward_t(&batch, features).e()?;

        let logits = output.logits().to_dtype(DType::F32).e()?;
        let scores = candle_nn::ops::softmax(&logits, 1).e()?.to_vec2::<f32>().e()?;
        let logits = logits.to_vec2::<f32>().e()?;
        let features = match output.features() {
            Some(features) => Some(features.to_dtype(DType::F32).e()?.to_vec2::<f32>().e()?),
            None => None,
        };

        let mut predictions = Vec::with_capacity(logits.len());
        for (i, (logits, scores)) in logits.into_iter().zip(scores).enumerate() {
            let (&[not_relevant, relevant], &[_, score]) = (logits.as_slice(), scores.as_slice())
            else {
                return Err(BackendError::Inference(format!(
                    "expected 2 logits per pair, got {}",
                    logits.len()
                )));
            };
            predictions.push(Prediction {
                logits: [not_relevant, relevant],
                score,
                features: features.as_ref().map(|f| f[i].clone()),
            });
        }

        Ok(predictions)
    }
}

pub trait WrapErr<O> {
    fn s(self) -> Result<O, BackendError>;
    fn e(self) -> Result<O, BackendError>;
}

impl<O> WrapErr<O> for Result<O, candle::Error> {
    fn s(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Start(e.to_string()))
    }
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}
