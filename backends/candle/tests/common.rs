#![allow(dead_code)]

use anyhow::Result;
use candle::{DType, Device, Tensor};
use code_relevance_backend_candle::DualEncoderClassifier;
use code_relevance_backend_core::PairBatch;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tempfile::TempDir;

pub const HIDDEN_SIZE: usize = 8;
pub const INTERMEDIATE_SIZE: usize = 16;
pub const NUM_LAYERS: usize = 2;
pub const MAX_POSITION_EMBEDDINGS: usize = 32;

pub const VOCAB: [&str; 20] = [
    "<pad>", "<unk>", "def", "return", "sort", "list", "how", "to", "a", "reverse", "string",
    "(", ")", ":", "x", "in", "for", "read", "file", "open",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fixture {
    /// Encoder weights at the root, as `AutoModel.save_pretrained` writes them
    Bert,
    /// RoBERTa config with `pad_token_id = 1` and offset positions
    Roberta,
    /// Encoder under `cbert.` and a trained `cls.` head
    FineTuned,
}

pub fn is_close(a: f32, b: f32, abs_tol: f32) -> bool {
    is_close::default().abs_tol(abs_tol).is_close(a, b)
}

/// Deterministic, non trivial values in `[-scale, scale]`
pub fn values(shape: &[usize], seed: usize, scale: f64) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    Ok(Tensor::arange(0u32, n as u32, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.37 + 0.013 * seed as f64, 0.1 * seed as f64)?
        .sin()?
        .affine(scale, 0.)?
        .reshape(shape)?)
}

fn encoder_tensors(prefix: &str, vocab_size: usize) -> Result<HashMap<String, Tensor>> {
    let h = HIDDEN_SIZE;
    let i = INTERMEDIATE_SIZE;
    let mut shapes: Vec<(String, Vec<usize>)> = vec![
        ("embeddings.word_embeddings.weight".into(), vec![vocab_size, h]),
        ("embeddings.token_type_embeddings.weight".into(), vec![1, h]),
        (
            "embeddings.position_embeddings.weight".into(),
            vec![MAX_POSITION_EMBEDDINGS, h],
        ),
    ];
    for layer in 0..NUM_LAYERS {
        let p = format!("encoder.layer.{layer}");
        for name in ["query", "key", "value"] {
            shapes.push((format!("{p}.attention.self.{name}.weight"), vec![h, h]));
            shapes.push((format!("{p}.attention.self.{name}.bias"), vec![h]));
        }
        shapes.push((format!("{p}.attention.output.dense.weight"), vec![h, h]));
        shapes.push((format!("{p}.attention.output.dense.bias"), vec![h]));
        shapes.push((format!("{p}.intermediate.dense.weight"), vec![i, h]));
        shapes.push((format!("{p}.intermediate.dense.bias"), vec![i]));
        shapes.push((format!("{p}.output.dense.weight"), vec![h, i]));
        shapes.push((format!("{p}.output.dense.bias"), vec![h]));
    }

    let mut tensors = HashMap::new();
    for (seed, (name, shape)) in shapes.into_iter().enumerate() {
        tensors.insert(format!("{prefix}{name}"), values(&shape, seed, 0.5)?);
    }

    let mut layer_norms = vec!["embeddings.LayerNorm".to_string()];
    for layer in 0..NUM_LAYERS {
        layer_norms.push(format!("encoder.layer.{layer}.attention.output.LayerNorm"));
        layer_norms.push(format!("encoder.layer.{layer}.output.LayerNorm"));
    }
    for name in layer_norms {
        tensors.insert(
            format!("{prefix}{name}.weight"),
            Tensor::ones(HIDDEN_SIZE, DType::F32, &Device::Cpu)?,
        );
        tensors.insert(
            format!("{prefix}{name}.bias"),
            Tensor::zeros(HIDDEN_SIZE, DType::F32, &Device::Cpu)?,
        );
    }

    Ok(tensors)
}

fn head_tensors() -> Result<HashMap<String, Tensor>> {
    let h = HIDDEN_SIZE;
    Ok(HashMap::from([
        ("cls.dense.weight".to_string(), values(&[h, 3 * h], 101, 0.3)?),
        ("cls.dense.bias".to_string(), values(&[h], 102, 0.1)?),
        ("cls.output_layer.weight".to_string(), values(&[2, h], 103, 0.8)?),
        ("cls.output_layer.bias".to_string(), values(&[2], 104, 0.1)?),
    ]))
}

pub fn write_checkpoint(dir: &Path, fixture: Fixture) -> Result<()> {
    let (model_type, pad_token_id) = match fixture {
        Fixture::Roberta => ("roberta", 1),
        Fixture::Bert | Fixture::FineTuned => ("bert", 0),
    };

    let config = json!({
        "vocab_size": VOCAB.len(),
        "hidden_size": HIDDEN_SIZE,
        "num_hidden_layers": NUM_LAYERS,
        "num_attention_heads": 2,
        "intermediate_size": INTERMEDIATE_SIZE,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.1,
        "max_position_embeddings": MAX_POSITION_EMBEDDINGS,
        "type_vocab_size": 1,
        "layer_norm_eps": 1e-5,
        "pad_token_id": pad_token_id,
        "model_type": model_type,
    });
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config)?)?;

    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, token)| (token.to_string(), json!(id)))
        .collect();
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" },
    });
    std::fs::write(dir.join("tokenizer.json"), serde_json::to_string(&tokenizer)?)?;

    let tensors = match fixture {
        Fixture::Bert | Fixture::Roberta => encoder_tensors("", VOCAB.len())?,
        Fixture::FineTuned => {
            let mut tensors = encoder_tensors("cbert.", VOCAB.len())?;
            tensors.extend(head_tensors()?);
            tensors
        }
    };
    candle::safetensors::save(&tensors, dir.join("model.safetensors"))?;

    Ok(())
}

pub fn checkpoint(fixture: Fixture) -> Result<TempDir> {
    let dir = tempfile::tempdir()?;
    write_checkpoint(dir.path(), fixture)?;
    Ok(dir)
}

/// Tokenize `(code, text)` pairs with the classifier's own tokenizers
pub fn pair_batch(classifier: &DualEncoderClassifier, pairs: &[(&str, &str)]) -> Result<PairBatch> {
    let code = classifier
        .pl_tokenizer()
        .encode_batch(pairs.iter().map(|(code, _)| *code).collect::<Vec<_>>(), true)
        .map_err(anyhow::Error::msg)?;
    let text = classifier
        .nl_tokenizer()
        .encode_batch(pairs.iter().map(|(_, text)| *text).collect::<Vec<_>>(), true)
        .map_err(anyhow::Error::msg)?;

    let flatten = |encodings: &[tokenizers::Encoding]| {
        let ids = encodings.iter().flat_map(|e| e.get_ids().to_vec()).collect::<Vec<_>>();
        let mask = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().to_vec())
            .collect::<Vec<_>>();
        (ids, mask)
    };
    let (code_ids, code_attention_mask) = flatten(&code);
    let (text_ids, text_attention_mask) = flatten(&text);

    Ok(PairBatch::new(
        code_ids,
        code_attention_mask,
        text_ids,
        text_attention_mask,
        pairs.len(),
    )?)
}
