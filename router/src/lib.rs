//! Code search relevance scoring
mod logging;
pub mod tokenization;

pub use logging::init_logging;

use code_relevance_backend_candle::{CandleBackend, HubCheckpoint};
use code_relevance_backend_core::{Backend, BackendError, DType, Pool, Prediction, TowerMode};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("tokenizer error {0}")]
    Tokenizer(#[from] tokenizers::Error),
    #[error("Input validation error: {0}")]
    Validation(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A natural-language query and the code snippet it is scored against
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Pair {
    pub query: String,
    pub code: String,
}

/// One line of output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub features: Option<Vec<f32>>,
}

impl From<Prediction> for ScoreResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            score: prediction.score,
            features: prediction.features,
        }
    }
}

fn non_empty(pairs: Vec<Pair>) -> Result<Vec<Pair>, RouterError> {
    if pairs.is_empty() {
        return Err(RouterError::Validation(
            "at least one (query, code) pair is required".to_string(),
        ));
    }
    Ok(pairs)
}

/// Zip repeated `--query` and `--code` values by position
pub fn pairs_from_args(queries: Vec<String>, codes: Vec<String>) -> Result<Vec<Pair>, RouterError> {
    if queries.len() != codes.len() {
        return Err(RouterError::Validation(format!(
            "got {} queries but {} code snippets, they are paired by position",
            queries.len(),
            codes.len()
        )));
    }
    non_empty(
        queries
            .into_iter()
            .zip(codes)
            .map(|(query, code)| Pair { query, code })
            .collect(),
    )
}

/// Read one `{"query": ..., "code": ...}` object per line, skipping blank lines
pub fn read_pairs<R: BufRead>(reader: R) -> Result<Vec<Pair>, RouterError> {
    let mut pairs = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let pair = serde_json::from_str(&line).map_err(|err| {
            RouterError::Validation(format!("line {}: invalid pair: {err}", i + 1))
        })?;
        pairs.push(pair);
    }
    non_empty(pairs)
}

/// Resolve `model_id` into a local checkpoint directory, downloading it from the hub if needed
pub fn resolve_model(
    model_id: &str,
    revision: Option<String>,
    huggingface_hub_cache: Option<String>,
    hf_token: Option<String>,
) -> Result<PathBuf, RouterError> {
    let hub = HubCheckpoint {
        token: hf_token,
        ..HubCheckpoint::new(revision, huggingface_hub_cache.map(PathBuf::from))
    };
    Ok(hub.download_artifacts(model_id)?)
}

/// Score `pairs` against the model in `model_root` and write one JSON line per pair
#[allow(clippy::too_many_arguments)]
pub fn run<W: Write>(
    model_root: &Path,
    dtype: Option<DType>,
    pooling: Option<Pool>,
    towers: TowerMode,
    max_input_length: usize,
    pairs: &[Pair],
    features: bool,
    writer: &mut W,
) -> Result<(), RouterError> {
    let dtype = dtype.unwrap_or_default();
    let backend = CandleBackend::new(model_root, dtype.to_string(), pooling, towers)?;
    backend.health()?;

    let classifier = backend.classifier();
    let batch = tokenization::tokenize_pairs(
        classifier.pl_tokenizer(),
        classifier.nl_tokenizer(),
        pairs,
        max_input_length,
    )?;

    let start = Instant::now();
    let predictions = backend.predict(batch, features)?;
    tracing::info!("Scored {} pairs in {:?}", pairs.len(), start.elapsed());

    for prediction in predictions {
        serde_json::to_writer(&mut *writer, &ScoreResponse::from(prediction))?;
        writeln!(writer)?;
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_from_args() {
        let pairs = pairs_from_args(
            vec!["sort a list".to_string(), "read a file".to_string()],
            vec!["sorted(x)".to_string(), "open(path)".to_string()],
        )
        .unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].query, "read a file");
        assert_eq!(pairs[1].code, "open(path)");
    }

    #[test]
    fn test_pairs_from_args_mismatch() {
        let err = pairs_from_args(vec!["sort a list".to_string()], vec![]).unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
    }

    #[test]
    fn test_pairs_from_args_empty() {
        let err = pairs_from_args(vec![], vec![]).unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
    }

    #[test]
    fn test_read_pairs_empty() {
        let err = read_pairs("\n  \n".as_bytes()).unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
    }

    #[test]
    fn test_read_pairs() {
        let input = "{\"query\": \"sort a list\", \"code\": \"sorted(x)\"}\n\n{\"code\": \"open(p)\", \"query\": \"read a file\"}\n";
        let pairs = read_pairs(input.as_bytes()).unwrap();

        assert_eq!(
            pairs,
            vec![
                Pair {
                    query: "sort a list".to_string(),
                    code: "sorted(x)".to_string()
                },
                Pair {
                    query: "read a file".to_string(),
                    code: "open(p)".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_read_pairs_reports_line() {
        let input = "{\"query\": \"sort a list\", \"code\": \"sorted(x)\"}\n{\"query\": 1}\n";
        let err = read_pairs(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_score_response_skips_missing_features() {
        let response = ScoreResponse {
            score: 0.5,
            features: None,
        };
        assert_eq!(serde_json::to_string(&response).unwrap(), "{\"score\":0.5}");

        let response = ScoreResponse {
            score: 0.25,
            features: Some(vec![1.0, -1.0]),
        };
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            "{\"score\":0.25,\"features\":[1.0,-1.0]}"
        );
    }
}
