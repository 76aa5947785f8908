use crate::layers::{HiddenAct, LayerNorm, Linear};
use crate::models::Encoder;
use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, VarBuilder};
use serde::Deserialize;

/// Masked positions get this bias added to their attention scores
const ATTENTION_MASK_VALUE: f64 = -10000.0;

// https://github.com/huggingface/transformers/blob/6eedfa6dd15dc1e22a55ae036f681914e5a0d9a1/src/transformers/models/bert/configuration_bert.py#L1
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: HiddenAct,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: usize,
    #[serde(default)]
    pub position_embedding_type: PositionEmbeddingType,
    pub model_type: Option<String>,
}

fn default_dropout() -> f64 {
    0.1
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl Config {
    /// RoBERTa style checkpoints offset positions by `pad_token_id + 1`
    pub fn uses_padding_offset(&self) -> bool {
        matches!(
            self.model_type.as_deref(),
            Some("roberta") | Some("xlm-roberta") | Some("camembert")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    #[default]
    Absolute,
    RelativeKey,
    RelativeKeyQuery,
}

#[derive(Debug)]
struct BertEmbeddings {
    word_embeddings: Embedding,
    token_type_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
    span: tracing::Span,
}

impl BertEmbeddings {
    pub fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        if config.position_embedding_type != PositionEmbeddingType::Absolute {
            candle::bail!("Bert only supports absolute position embeddings");
        }

        Ok(Self {
            word_embeddings: Embedding::new(
                vb.pp("word_embeddings")
                    .get((config.vocab_size, config.hidden_size), "weight")?,
                config.hidden_size,
            ),
            token_type_embeddings: Embedding::new(
                vb.pp("token_type_embeddings")
                    .get((config.type_vocab_size, config.hidden_size), "weight")?,
                config.hidden_size,
            ),
            position_embeddings: Embedding::new(
                vb.pp("position_embeddings").get(
                    (config.max_position_embeddings, config.hidden_size),
                    "weight",
                )?,
                config.hidden_size,
            ),
            layer_norm: LayerNorm::load(
                vb.pp("LayerNorm"),
                config.hidden_size,
                config.layer_norm_eps,
            )?,
            span: tracing::span!(tracing::Level::TRACE, "embeddings"),
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        position_ids: &Tensor,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();

        let input_embeddings = self.word_embeddings.forward(input_ids)?;
        let token_type_embeddings = self.token_type_embeddings.forward(token_type_ids)?;
        let position_embeddings = self.position_embeddings.forward(position_ids)?;

        let embeddings = input_embeddings
            .add(&token_type_embeddings)?
            .add(&position_embeddings)?;
        let embeddings = self.layer_norm.forward(&embeddings)?;

        Ok(embeddings)
    }
}

struct BertAttention {
    qkv_linear: Linear,

    dense: Linear,
    layer_norm: LayerNorm,

    num_attention_heads: usize,
    attention_head_size: usize,
    softmax_scale: f64,

    span: tracing::Span,
}

impl BertAttention {
    pub fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        if config.hidden_size % config.num_attention_heads != 0 {
            candle::bail!(
                "`hidden_size` ({}) is not a multiple of `num_attention_heads` ({})",
                config.hidden_size,
                config.num_attention_heads
            );
        }

        let attention_head_size = config.hidden_size / config.num_attention_heads;
        let all_head_size = config.num_attention_heads * attention_head_size;
        let hidden_size = config.hidden_size;

        let query_weight = vb
            .pp("self.query")
            .get((all_head_size, hidden_size), "weight")?;
        let query_bias = vb.pp("self.query").get(all_head_size, "bias")?;

        let key_weight = vb
            .pp("self.key")
            .get((all_head_size, hidden_size), "weight")?;
        let key_bias = vb.pp("self.key").get(all_head_size, "bias")?;

        let value_weight = vb
            .pp("self.value")
            .get((all_head_size, hidden_size), "weight")?;
        let value_bias = vb.pp("self.value").get(all_head_size, "bias")?;

        let qkv_weight = Tensor::cat(&[&query_weight, &key_weight, &value_weight], 0)?;
        let qkv_bias = Tensor::cat(&[&query_bias, &key_bias, &value_bias], 0)?;

        let qkv_linear = Linear::new(qkv_weight, Some(qkv_bias), None);

        let dense_weight = vb
            .pp("output")
            .pp("dense")
            .get((hidden_size, hidden_size), "weight")?;
        let dense_bias = vb.pp("output").pp("dense").get(hidden_size, "bias")?;

        let dense = Linear::new(dense_weight, Some(dense_bias), None);

        let layer_norm = LayerNorm::load(
            vb.pp("output").pp("LayerNorm"),
            config.hidden_size,
            config.layer_norm_eps,
        )?;

        let softmax_scale = 1. / (attention_head_size as f64).sqrt();

        Ok(Self {
            qkv_linear,
            dense,
            layer_norm,
            num_attention_heads: config.num_attention_heads,
            attention_head_size,
            softmax_scale,
            span: tracing::span!(tracing::Level::TRACE, "attention"),
        })
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();

        let residual = hidden_states.clone();

        let qkv = self.qkv_linear.forward(hidden_states)?;

        let mut new_qkv_shape = qkv.dims().to_vec();
        new_qkv_shape.pop();
        new_qkv_shape.push(self.num_attention_heads * 3);
        new_qkv_shape.push(self.attention_head_size);
        let qkv = qkv.reshape(new_qkv_shape.as_slice())?.transpose(1, 2)?;

        let qkv = qkv.chunk(3, 1)?;
        let query_layer = &qkv[0].contiguous()?;
        let key_layer = &qkv[1].contiguous()?;
        let value_layer = &qkv[2].contiguous()?;

        let attention_scores = query_layer.matmul(&key_layer.t()?)?;
        let mut attention_scores = (attention_scores * self.softmax_scale)?;

        if let Some(attention_mask) = attention_mask {
            attention_scores = attention_scores.add(attention_mask)?;
        }

        let attention_probs = candle_nn::ops::softmax_last_dim(&attention_scores)?;

        let context_layer = attention_probs.matmul(value_layer)?;
        let context_layer = context_layer.transpose(1, 2)?.flatten_from(D::Minus2)?;

        let hidden_states = self.dense.forward(&context_layer)?.add(&residual)?;
        let hidden_states = self.layer_norm.forward(&hidden_states)?;

        Ok(hidden_states)
    }
}

struct BertLayer {
    attention: BertAttention,
    intermediate: Linear,
    output: Linear,
    layer_norm: LayerNorm,
    span: tracing::Span,
}

impl BertLayer {
    pub fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        let attention = BertAttention::load(vb.pp("attention"), config)?;

        let intermediate_weight = vb
            .pp("intermediate")
            .pp("dense")
            .get((config.intermediate_size, config.hidden_size), "weight")?;
        let intermediate_bias = vb
            .pp("intermediate")
            .pp("dense")
            .get(config.intermediate_size, "bias")?;
        let intermediate = Linear::new(
            intermediate_weight,
            Some(intermediate_bias),
            Some(config.hidden_act.clone()),
        );

        let output_weight = vb
            .pp("output")
            .pp("dense")
            .get((config.hidden_size, config.intermediate_size), "weight")?;
        let output_bias = vb
            .pp("output")
            .pp("dense")
            .get(config.hidden_size, "bias")?;
        let output = Linear::new(output_weight, Some(output_bias), None);

        let layer_norm = LayerNorm::load(
            vb.pp("output").pp("LayerNorm"),
            config.hidden_size,
            config.layer_norm_eps,
        )?;

        Ok(Self {
            attention,
            intermediate,
            output,
            layer_norm,
            span: tracing::span!(tracing::Level::TRACE, "layer"),
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();

        let hidden_states = self.attention.forward(hidden_states, attention_mask)?;
        let residual = hidden_states.clone();

        let hidden_states = self.intermediate.forward(&hidden_states)?;
        let hidden_states = self.output.forward(&hidden_states)?.add(&residual)?;
        let hidden_states = self.layer_norm.forward(&hidden_states)?;

        Ok(hidden_states)
    }
}

struct BertEncoder {
    layers: Vec<BertLayer>,
    span: tracing::Span,
}

impl BertEncoder {
    pub fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        let layers = (0..config.num_hidden_layers)
            .map(|index| BertLayer::load(vb.pp(format!("layer.{index}")), config))
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "encoder");

        Ok(BertEncoder { layers, span })
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();

        let mut hidden_states = hidden_states.clone();

        // Use a loop rather than a fold as it's easier to modify when adding debug/...
        for layer in self.layers.iter() {
            hidden_states = layer.forward(&hidden_states, attention_mask)?;
        }

        Ok(hidden_states)
    }
}

/// BERT-family encoder returning the last hidden state of every token.
///
/// Loads BERT, RoBERTa, XLM-RoBERTa and CamemBERT checkpoints such as
/// `microsoft/codebert-base`.
pub struct BertModel {
    embeddings: BertEmbeddings,
    encoder: BertEncoder,

    hidden_size: usize,
    num_attention_heads: usize,
    max_position_embeddings: usize,
    padding_offset: Option<u32>,

    pub device: Device,

    span: tracing::Span,
}

impl BertModel {
    pub fn load(vb: VarBuilder, config: &Config) -> Result<Self> {
        let (embeddings, encoder) = match (
            BertEmbeddings::load(vb.pp("embeddings"), config),
            BertEncoder::load(vb.pp("encoder"), config),
        ) {
            (Ok(embeddings), Ok(encoder)) => (embeddings, encoder),
            (Err(err), _) | (_, Err(err)) => {
                let model_type = config.model_type.clone().unwrap_or("bert".to_string());

                // `cbert` is where fine-tuned relevance classifiers keep their encoder
                let prefixes = [model_type.as_str(), "bert", "cbert"];
                prefixes
                    .iter()
                    .find_map(|prefix| {
                        match (
                            BertEmbeddings::load(vb.pp(format!("{prefix}.embeddings")), config),
                            BertEncoder::load(vb.pp(format!("{prefix}.encoder")), config),
                        ) {
                            (Ok(embeddings), Ok(encoder)) => Some((embeddings, encoder)),
                            _ => None,
                        }
                    })
                    .ok_or(err)?
            }
        };

        let padding_offset = config
            .uses_padding_offset()
            .then_some(config.pad_token_id as u32);

        Ok(Self {
            embeddings,
            encoder,
            hidden_size: config.hidden_size,
            num_attention_heads: config.num_attention_heads,
            max_position_embeddings: config.max_position_embeddings,
            padding_offset,
            device: vb.device().clone(),
            span: tracing::span!(tracing::Level::TRACE, "model"),
        })
    }

    /// Position ids for every row of the mask.
    ///
    /// BERT counts positions from 0. RoBERTa counts non padding tokens from
    /// `pad_token_id + 1` and gives padding tokens `pad_token_id`.
    fn position_ids(&self, attention_mask: &[Vec<u32>]) -> Result<Vec<u32>> {
        let seq_len = attention_mask.first().map(|row| row.len()).unwrap_or(0);
        let mut position_ids = Vec::with_capacity(attention_mask.len() * seq_len);

        for row in attention_mask {
            match self.padding_offset {
                None => position_ids.extend(0..row.len() as u32),
                Some(pad) => {
                    let mut position = pad;
                    for &m in row {
                        if m != 0 {
                            position += 1;
                            position_ids.push(position);
                        } else {
                            position_ids.push(pad);
                        }
                    }
                }
            }
        }

        if let Some(max) = position_ids.iter().max() {
            if *max as usize >= self.max_position_embeddings {
                candle::bail!(
                    "sequence needs position {max} but the model only supports {} positions",
                    self.max_position_embeddings
                );
            }
        }
        Ok(position_ids)
    }

    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();

        let (batch_size, max_length) = input_ids.dims2()?;
        if attention_mask.dims2()? != (batch_size, max_length) {
            candle::bail!(
                "attention mask shape {:?} does not match input ids shape {:?}",
                attention_mask.dims(),
                input_ids.dims()
            );
        }

        let input_ids = input_ids.to_device(&self.device)?.to_dtype(DType::U32)?;
        let mask = attention_mask.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let masking = mask.iter().flatten().any(|m| *m == 0);

        let shape = (batch_size, max_length);
        let position_ids = Tensor::from_vec(self.position_ids(&mask)?, shape, &self.device)?;
        let type_ids = Tensor::zeros(shape, DType::U32, &self.device)?;

        let embedding_output = self
            .embeddings
            .forward(&input_ids, &type_ids, &position_ids)?;

        let attention_mask = match masking {
            true => {
                let attention_mask = attention_mask
                    .to_device(&self.device)?
                    .to_dtype(embedding_output.dtype())?
                    .reshape((batch_size, 1, 1, max_length))?;
                // (1 - mask) * ATTENTION_MASK_VALUE
                let attention_mask =
                    attention_mask.affine(-ATTENTION_MASK_VALUE, ATTENTION_MASK_VALUE)?;
                // Broadcast once instead of at every layer
                let attention_mask = attention_mask
                    .broadcast_as((
                        batch_size,
                        self.num_attention_heads,
                        max_length,
                        max_length,
                    ))?
                    .contiguous()?;
                Some(attention_mask)
            }
            false => None,
        };

        self.encoder
            .forward(&embedding_output, attention_mask.as_ref())
    }
}

impl Encoder for BertModel {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        BertModel::forward(self, input_ids, attention_mask)
    }
}
