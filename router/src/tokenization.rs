use crate::{Pair, RouterError};
use code_relevance_backend_core::PairBatch;
use tokenizers::{
    PaddingParams, PaddingStrategy, PostProcessor, Tokenizer, TruncationDirection,
    TruncationParams, TruncationStrategy,
};

/// Token ids and attention mask of one side of a batch, padded to its longest member
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedEncodings {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub seq_len: usize,
}

/// Encode `inputs` with truncation to `max_input_length` tokens and pad them to the longest
pub fn encode_padded(
    tokenizer: &Tokenizer,
    inputs: Vec<&str>,
    max_input_length: usize,
) -> Result<PaddedEncodings, RouterError> {
    if inputs.is_empty() {
        return Err(RouterError::Validation("`inputs` cannot be empty".to_string()));
    }
    // Truncation keeps room for the special tokens of the post processor
    let special_tokens = tokenizer
        .get_post_processor()
        .map_or(0, |processor| processor.added_tokens(false));
    if max_input_length <= special_tokens {
        return Err(RouterError::Validation(format!(
            "`max_input_length` must be greater than the {special_tokens} special tokens added by the tokenizer. Given: {max_input_length}"
        )));
    }

    let mut tokenizer = tokenizer.clone();
    let padding = tokenizer.get_padding().cloned().unwrap_or_default();
    tokenizer
        .with_truncation(Some(TruncationParams {
            direction: TruncationDirection::Right,
            max_length: max_input_length,
            strategy: TruncationStrategy::LongestFirst,
            stride: 0,
        }))?
        .with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..padding
        }));

    let encodings = tokenizer.encode_batch(inputs, true)?;
    let seq_len = encodings.first().map(|e| e.len()).unwrap_or_default();
    if seq_len == 0 {
        return Err(RouterError::Validation(
            "every input encoded to zero tokens".to_string(),
        ));
    }

    let mut input_ids = Vec::with_capacity(encodings.len() * seq_len);
    let mut attention_mask = Vec::with_capacity(encodings.len() * seq_len);
    for encoding in encodings.iter() {
        input_ids.extend_from_slice(encoding.get_ids());
        attention_mask.extend_from_slice(encoding.get_attention_mask());
    }

    Ok(PaddedEncodings {
        input_ids,
        attention_mask,
        seq_len,
    })
}

/// Tokenize each side of `pairs` with its own tokenizer and assemble a [`PairBatch`]
pub fn tokenize_pairs(
    code_tokenizer: &Tokenizer,
    text_tokenizer: &Tokenizer,
    pairs: &[Pair],
    max_input_length: usize,
) -> Result<PairBatch, RouterError> {
    if pairs.is_empty() {
        return Err(RouterError::Validation(
            "at least one (query, code) pair is required".to_string(),
        ));
    }

    let code = encode_padded(
        code_tokenizer,
        pairs.iter().map(|p| p.code.as_str()).collect(),
        max_input_length,
    )?;
    let text = encode_padded(
        text_tokenizer,
        pairs.iter().map(|p| p.query.as_str()).collect(),
        max_input_length,
    )?;

    Ok(PairBatch::new(
        code.input_ids,
        code.attention_mask,
        text.input_ids,
        text.attention_mask,
        pairs.len(),
    )?)
}
