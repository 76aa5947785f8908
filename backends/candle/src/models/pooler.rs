use candle::{IndexOp, Result, Tensor};
use code_relevance_backend_core::Pool;

/// Reduces `(batch, seq_len, hidden_size)` hidden states to `(batch, hidden_size)`
#[derive(Debug, Clone)]
pub struct Pooler {
    pool: Pool,
    hidden_size: usize,
    span: tracing::Span,
}

impl Pooler {
    pub fn new(pool: Pool, hidden_size: usize) -> Self {
        Self {
            pool,
            hidden_size,
            span: tracing::span!(tracing::Level::TRACE, "pooler"),
        }
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    /// `attention_mask` is only read by [`Pool::MaskedMean`]. Without a mask, masked mean
    /// pooling treats every position as a real token.
    pub fn forward(&self, hidden_states: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();

        let (batch_size, seq_len, hidden_size) = hidden_states.dims3()?;
        if hidden_size != self.hidden_size {
            candle::bail!(
                "hidden states have size {hidden_size} but the pooler expects {}",
                self.hidden_size
            );
        }
        if seq_len == 0 {
            candle::bail!("cannot pool an empty sequence");
        }

        match (self.pool, attention_mask) {
            (Pool::Mean, _) | (Pool::MaskedMean, None) => hidden_states.mean(1),
            (Pool::MaskedMean, Some(attention_mask)) => {
                if attention_mask.dims2()? != (batch_size, seq_len) {
                    candle::bail!(
                        "attention mask shape {:?} does not match hidden states {:?}",
                        attention_mask.dims(),
                        hidden_states.dims()
                    );
                }
                let mask = attention_mask
                    .to_dtype(hidden_states.dtype())?
                    .unsqueeze(2)?;
                let summed = hidden_states.broadcast_mul(&mask)?.sum(1)?;
                // A row without any real token pools to zeros
                let counts = mask.sum(1)?.maximum(1.0)?;
                summed.broadcast_div(&counts)
            }
            (Pool::Cls, _) => hidden_states.i((.., 0))?.contiguous(),
        }
    }
}
