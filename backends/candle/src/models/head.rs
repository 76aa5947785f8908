use crate::layers::Linear;
use crate::models::{ClassifierConfig, Pooler};
use candle::{DType, Device, Result, Tensor};
use candle_nn::{Dropout, VarBuilder, VarMap};
use code_relevance_backend_core::Mode;

/// `[not-relevant, relevant]`
pub const NUM_LABELS: usize = 2;

/// Fuses pooled code and text representations and classifies the pair.
///
/// The fused vector is `[code, text, |code - text|]`, always in that order. It goes through
/// dropout, a `3 * hidden -> hidden` dense layer, tanh, dropout again, and a
/// `hidden -> 2` output layer.
#[derive(Debug)]
pub struct RelationClassifyHead {
    pooler: Pooler,
    dense: Linear,
    output_layer: Linear,
    dropout: Dropout,
    mode: Mode,
    span: tracing::Span,
}

impl RelationClassifyHead {
    pub fn new(config: &ClassifierConfig, dense: Linear, output_layer: Linear) -> Result<Self> {
        let hidden_size = config.hidden_size;
        if (dense.in_features(), dense.out_features()) != (3 * hidden_size, hidden_size) {
            candle::bail!(
                "dense layer must map {} -> {hidden_size}, got {} -> {}",
                3 * hidden_size,
                dense.in_features(),
                dense.out_features()
            );
        }
        if (output_layer.in_features(), output_layer.out_features()) != (hidden_size, NUM_LABELS)
        {
            candle::bail!(
                "output layer must map {hidden_size} -> {NUM_LABELS}, got {} -> {}",
                output_layer.in_features(),
                output_layer.out_features()
            );
        }
        if !(0.0..1.0).contains(&config.hidden_dropout_prob) {
            candle::bail!(
                "`hidden_dropout_prob` must be in [0, 1), got {}",
                config.hidden_dropout_prob
            );
        }

        Ok(Self {
            pooler: Pooler::new(config.pool, hidden_size),
            dense,
            output_layer,
            dropout: Dropout::new(config.hidden_dropout_prob as f32),
            mode: Mode::default(),
            span: tracing::span!(tracing::Level::TRACE, "relation-head"),
        })
    }

    /// Load `dense.*` and `output_layer.*` from `vb`
    pub fn load(vb: VarBuilder, config: &ClassifierConfig) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let dense = Linear::load(vb.pp("dense"), 3 * hidden_size, hidden_size)?;
        let output_layer = Linear::load(vb.pp("output_layer"), hidden_size, NUM_LABELS)?;

        Self::new(config, dense, output_layer)
    }

    /// Freshly initialised head, for checkpoints that only ship encoder weights
    pub fn init(config: &ClassifierConfig, device: &Device, dtype: DType) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        Self::load(vb, config)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn hidden_size(&self) -> usize {
        self.output_layer.in_features()
    }

    /// `[pooled_code, pooled_text, |pooled_code - pooled_text|]` along the feature axis
    pub fn fuse(pooled_code: &Tensor, pooled_text: &Tensor) -> Result<Tensor> {
        let diff = (pooled_code - pooled_text)?.abs()?;
        Tensor::cat(&[pooled_code, pooled_text, &diff], 1)
    }

    /// Returns `(logits, features)`, `features` being the input of the output layer
    pub fn forward(&self, code_hidden: &Tensor, text_hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        self.forward_masked(code_hidden, None, text_hidden, None)
    }

    pub fn forward_masked(
        &self,
        code_hidden: &Tensor,
        code_attention_mask: Option<&Tensor>,
        text_hidden: &Tensor,
        text_attention_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();

        let pooled_code = self.pooler.forward(code_hidden, code_attention_mask)?;
        let pooled_text = self.pooler.forward(text_hidden, text_attention_mask)?;
        let fused = Self::fuse(&pooled_code, &pooled_text)?;

        let train = self.mode.is_train();
        let x = self.dropout.forward(&fused, train)?;
        let x = self.dense.forward(&x)?.tanh()?;
        let features = self.dropout.forward(&x, train)?;
        let logits = self.output_layer.forward(&features)?;

        Ok((logits, features))
    }
}
