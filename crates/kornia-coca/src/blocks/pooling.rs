use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use super::attention::MultiHeadAttention;
use crate::shape::SequenceShape;

/// Reduces an encoded image sequence to a fixed number of query-conditioned
/// feature vectors.
///
/// Queries are laid out as `[B, width, query_length]` and so is the pooled
/// output; the key/value sequence is `[B, S, width]`.
#[derive(Debug, Clone)]
pub struct AttentionPooling {
    attn: MultiHeadAttention,
    layer_norm: LayerNorm,
    kv_shape: SequenceShape,
    query_length: usize,
}

impl AttentionPooling {
    pub fn new(
        kv_shape: SequenceShape,
        query_length: usize,
        num_heads: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let width = kv_shape.width;
        Ok(Self {
            attn: MultiHeadAttention::new(width, width, num_heads, vb.pp("attn"))?,
            layer_norm: candle_nn::layer_norm(kv_shape.width, eps, vb.pp("layer_norm"))?,
            kv_shape,
            query_length,
        })
    }

    /// Shape of the pooled feature, `[B, width, query_length]`.
    pub fn output_shape(&self) -> SequenceShape {
        SequenceShape::new(self.kv_shape.batch, self.kv_shape.width, self.query_length)
    }

    pub fn forward(&self, query: &Tensor, kv: &Tensor) -> Result<Tensor> {
        let query = query.transpose(1, 2)?.contiguous()?;
        let pooled = self.attn.forward(&query, kv, None)?;
        self.layer_norm.forward(&pooled)?.transpose(1, 2)?.contiguous()
    }
}
