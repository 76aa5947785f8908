use crate::checkpoint::CheckpointLoader;
use crate::models::{Config, Encoder, RelationClassifyHead};
use crate::WrapErr;
use candle::{DType, Device, IndexOp, Result, Tensor};
use code_relevance_backend_core::{BackendError, Mode, PairBatch, Pool, TowerMode};
use serde::Deserialize;
use tokenizers::Tokenizer;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifierConfig {
    pub hidden_size: usize,
    pub hidden_dropout_prob: f64,
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub towers: TowerMode,
}

impl ClassifierConfig {
    pub fn new(hidden_size: usize, hidden_dropout_prob: f64) -> Self {
        Self {
            hidden_size,
            hidden_dropout_prob,
            pool: Pool::default(),
            towers: TowerMode::default(),
        }
    }

    pub fn from_encoder_config(config: &Config) -> Self {
        Self::new(config.hidden_size, config.hidden_dropout_prob)
    }
}

/// An encoder and the tokenizer that produces its input ids
pub struct Tower {
    encoder: Box<dyn Encoder>,
    tokenizer: Tokenizer,
}

impl Tower {
    pub fn new(encoder: Box<dyn Encoder>, tokenizer: Tokenizer) -> Self {
        Self { encoder, tokenizer }
    }

    pub fn encoder(&self) -> &dyn Encoder {
        self.encoder.as_ref()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

/// Encoder towers by role.
///
/// `Shared` owns a single tower reachable as both the code and the natural-language tower,
/// so both roles always see the same weights and vocabulary.
pub enum Towers {
    Shared(Tower),
    Independent { code: Tower, text: Tower },
}

impl Towers {
    pub fn mode(&self) -> TowerMode {
        match self {
            Towers::Shared(_) => TowerMode::Shared,
            Towers::Independent { .. } => TowerMode::Independent,
        }
    }

    pub fn code(&self) -> &Tower {
        match self {
            Towers::Shared(tower) => tower,
            Towers::Independent { code, .. } => code,
        }
    }

    pub fn text(&self) -> &Tower {
        match self {
            Towers::Shared(tower) => tower,
            Towers::Independent { text, .. } => text,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClassifierOutput {
    Logits(Tensor),
    LogitsAndFeatures(Tensor, Tensor),
}

impl ClassifierOutput {
    pub fn logits(&self) -> &Tensor {
        match self {
            ClassifierOutput::Logits(logits) | ClassifierOutput::LogitsAndFeatures(logits, _) => {
                logits
            }
        }
    }

    pub fn features(&self) -> Option<&Tensor> {
        match self {
            ClassifierOutput::Logits(_) => None,
            ClassifierOutput::LogitsAndFeatures(_, features) => Some(features),
        }
    }
}

/// Scores (code, natural-language) pairs with two encoder towers and a
/// [`RelationClassifyHead`].
///
/// Logits are `[not-relevant, relevant]`.
pub struct DualEncoderClassifier {
    towers: Towers,
    head: RelationClassifyHead,
    config: ClassifierConfig,
    mode: Mode,
    device: Device,
    span: tracing::Span,
}

impl DualEncoderClassifier {
    pub fn new(config: ClassifierConfig, towers: Towers, head: RelationClassifyHead) -> Result<Self> {
        for (role, tower) in [("code", towers.code()), ("natural-language", towers.text())] {
            let encoder_size = tower.encoder().hidden_size();
            if encoder_size != config.hidden_size {
                candle::bail!(
                    "{role} encoder outputs {encoder_size} features but `hidden_size` is {}",
                    config.hidden_size
                );
            }
        }
        if head.hidden_size() != config.hidden_size {
            candle::bail!(
                "classification head expects {} features but `hidden_size` is {}",
                head.hidden_size(),
                config.hidden_size
            );
        }

        let device = towers.code().encoder().device().clone();
        let mut classifier = Self {
            towers,
            head,
            config,
            mode: Mode::default(),
            device,
            span: tracing::span!(tracing::Level::TRACE, "classifier"),
        };
        classifier.set_mode(Mode::default());
        Ok(classifier)
    }

    /// Load the encoder and tokenizer named by `identifier` through `loader`.
    ///
    /// With [`TowerMode::Shared`] a single tower serves both roles. With
    /// [`TowerMode::Independent`] the checkpoint is loaded twice so each role owns its weights.
    /// The head comes from the checkpoint when it ships one, otherwise it is freshly initialised.
    pub fn from_pretrained<L: CheckpointLoader + ?Sized>(
        config: ClassifierConfig,
        identifier: &str,
        loader: &L,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, BackendError> {
        let code = loader.load(identifier, device, dtype)?;
        let towers = match config.towers {
            TowerMode::Shared => Towers::Shared(code),
            TowerMode::Independent => Towers::Independent {
                code,
                text: loader.load(identifier, device, dtype)?,
            },
        };

        let head = match loader.load_head(identifier, &config, device, dtype)? {
            Some(head) => head,
            None => {
                tracing::warn!(
                    "`{identifier}` has no classification head weights, initialising a new head"
                );
                RelationClassifyHead::init(&config, device, dtype).s()?
            }
        };

        tracing::info!(
            "Loaded relevance classifier from `{identifier}` ({} towers, {} pooling)",
            config.towers,
            config.pool
        );
        Self::new(config, towers, head).s()
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn towers(&self) -> &Towers {
        &self.towers
    }

    pub fn head(&self) -> &RelationClassifyHead {
        &self.head
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch every component between training (dropout active) and evaluation
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.head.set_mode(mode);
    }

    fn batch_tensors(&self, batch: &PairBatch) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let code_shape = (batch.batch_size, batch.code_length);
        let text_shape = (batch.batch_size, batch.text_length);

        Ok((
            Tensor::from_slice(&batch.code_ids, code_shape, &self.device)?,
            Tensor::from_slice(&batch.code_attention_mask, code_shape, &self.device)?,
            Tensor::from_slice(&batch.text_ids, text_shape, &self.device)?,
            Tensor::from_slice(&batch.text_attention_mask, text_shape, &self.device)?,
        ))
    }

    /// Logits of shape `(batch, 2)`
    pub fn forward(&self, batch: &PairBatch) -> Result<Tensor> {
        match self.forward_t(batch, false)? {
            ClassifierOutput::Logits(logits) | ClassifierOutput::LogitsAndFeatures(logits, _) => {
                Ok(logits)
            }
        }
    }

    /// Logits of shape `(batch, 2)` and features of shape `(batch, hidden_size)`
    pub fn forward_with_features(&self, batch: &PairBatch) -> Result<(Tensor, Tensor)> {
        match self.forward_t(batch, true)? {
            ClassifierOutput::LogitsAndFeatures(logits, features) => Ok((logits, features)),
            ClassifierOutput::Logits(_) => candle::bail!("features were not computed"),
        }
    }

    pub fn forward_t(&self, batch: &PairBatch, features: bool) -> Result<ClassifierOutput> {
        let _enter = self.span.enter();

        let (code_ids, code_attention_mask, text_ids, text_attention_mask) =
            self.batch_tensors(batch)?;

        let code_hidden = self.create_pl_embd(&code_ids, &code_attention_mask)?;
        let text_hidden = self.create_nl_embd(&text_ids, &text_attention_mask)?;

        let (logits, feats) = self.head.forward_masked(
            &code_hidden,
            Some(&code_attention_mask),
            &text_hidden,
            Some(&text_attention_mask),
        )?;

        Ok(if features {
            ClassifierOutput::LogitsAndFeatures(logits, feats)
        } else {
            ClassifierOutput::Logits(logits)
        })
    }

    /// Probability of the relevant class for already encoded hidden states
    pub fn get_sim_score(&self, text_hidden: &Tensor, code_hidden: &Tensor) -> Result<Vec<f32>> {
        let _enter = self.span.enter();

        let (logits, _) = self.head.forward(code_hidden, text_hidden)?;
        let probabilities = candle_nn::ops::softmax(&logits.to_dtype(DType::F32)?, 1)?;
        probabilities.i((.., 1))?.to_vec1::<f32>()
    }

    pub fn nl_tokenizer(&self) -> &Tokenizer {
        self.towers.text().tokenizer()
    }

    pub fn pl_tokenizer(&self) -> &Tokenizer {
        self.towers.code().tokenizer()
    }

    /// Hidden states `(batch, seq_len, hidden_size)` of the natural-language tower
    pub fn create_nl_embd(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        self.towers.text().encoder().forward(input_ids, attention_mask)
    }

    /// Hidden states `(batch, seq_len, hidden_size)` of the code tower
    pub fn create_pl_embd(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        self.towers.code().encoder().forward(input_ids, attention_mask)
    }

    pub fn nl_sub_model(&self) -> &dyn Encoder {
        self.towers.text().encoder()
    }

    pub fn pl_sub_model(&self) -> &dyn Encoder {
        self.towers.code().encoder()
    }
}
