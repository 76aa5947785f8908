#![allow(dead_code)]

use anyhow::Result;
use candle::{DType, Device, Tensor};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tempfile::TempDir;

pub const HIDDEN_SIZE: usize = 4;
const INTERMEDIATE_SIZE: usize = 8;
const VOCAB: [&str; 10] = [
    "<pad>", "<unk>", "def", "sort", "(", ")", "x", "how", "to", "list",
];

fn values(shape: &[usize], seed: usize) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    Ok(Tensor::arange(0u32, n as u32, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.41 + 0.017 * seed as f64, 0.2 * seed as f64)?
        .sin()?
        .affine(0.5, 0.)?
        .reshape(shape)?)
}

/// One layer BERT with a word-level tokenizer and no classification head
pub fn write_checkpoint(dir: &Path) -> Result<()> {
    let (h, i) = (HIDDEN_SIZE, INTERMEDIATE_SIZE);

    let config = json!({
        "vocab_size": VOCAB.len(),
        "hidden_size": h,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "intermediate_size": i,
        "hidden_act": "gelu",
        "max_position_embeddings": 16,
        "type_vocab_size": 1,
        "model_type": "bert",
    });
    std::fs::write(dir.join("config.json"), config.to_string())?;

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
    std::fs::write(dir.join("tokenizer.json"), tokenizer.to_string())?;

    let shapes: Vec<(&str, Vec<usize>)> = vec![
        ("embeddings.word_embeddings.weight", vec![VOCAB.len(), h]),
        ("embeddings.token_type_embeddings.weight", vec![1, h]),
        ("embeddings.position_embeddings.weight", vec![16, h]),
        ("encoder.layer.0.attention.self.query.weight", vec![h, h]),
        ("encoder.layer.0.attention.self.query.bias", vec![h]),
        ("encoder.layer.0.attention.self.key.weight", vec![h, h]),
        ("encoder.layer.0.attention.self.key.bias", vec![h]),
        ("encoder.layer.0.attention.self.value.weight", vec![h, h]),
        ("encoder.layer.0.attention.self.value.bias", vec![h]),
        ("encoder.layer.0.attention.output.dense.weight", vec![h, h]),
        ("encoder.layer.0.attention.output.dense.bias", vec![h]),
        ("encoder.layer.0.intermediate.dense.weight", vec![i, h]),
        ("encoder.layer.0.intermediate.dense.bias", vec![i]),
        ("encoder.layer.0.output.dense.weight", vec![h, i]),
        ("encoder.layer.0.output.dense.bias", vec![h]),
    ];
    let mut tensors = HashMap::new();
    for (seed, (name, shape)) in shapes.into_iter().enumerate() {
        tensors.insert(name.to_string(), values(&shape, seed)?);
    }
    for name in [
        "embeddings.LayerNorm",
        "encoder.layer.0.attention.output.LayerNorm",
        "encoder.layer.0.output.LayerNorm",
    ] {
        tensors.insert(format!("{name}.weight"), Tensor::ones(h, DType::F32, &Device::Cpu)?);
        tensors.insert(format!("{name}.bias"), Tensor::zeros(h, DType::F32, &Device::Cpu)?);
    }
    candle::safetensors::save(&tensors, dir.join("model.safetensors"))?;

    Ok(())
}

pub fn checkpoint() -> Result<TempDir> {
    let dir = tempfile::tempdir()?;
    write_checkpoint(dir.path())?;
    Ok(dir)
}
