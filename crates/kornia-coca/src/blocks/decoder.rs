use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::attention::{causal_attention_mask, Mlp, MultiHeadAttention};
use crate::shape::SequenceShape;

#[derive(Debug, Clone)]
struct CrossAttention {
    layer_norm: LayerNorm,
    attn: MultiHeadAttention,
}

/// Pre-norm causal decoder block, optionally cross-attending to an encoder
/// sequence.
#[derive(Debug, Clone)]
struct DecoderBlock {
    self_attn_layer_norm: LayerNorm,
    self_attn: MultiHeadAttention,
    cross_attn: Option<CrossAttention>,
    mlp_layer_norm: LayerNorm,
    mlp: Mlp,
}

impl DecoderBlock {
    fn new(
        width: usize,
        context_width: Option<usize>,
        num_heads: usize,
        intermediate_dim: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cross_attn = context_width
            .map(|kv_dim| -> Result<CrossAttention> {
                Ok(CrossAttention {
                    layer_norm: candle_nn::layer_norm(width, eps, vb.pp("cross_attn_layer_norm"))?,
                    attn: MultiHeadAttention::new(width, kv_dim, num_heads, vb.pp("cross_attn"))?,
                })
            })
            .transpose()?;

        Ok(Self {
            self_attn_layer_norm: candle_nn::layer_norm(width, eps, vb.pp("self_attn_layer_norm"))?,
            self_attn: MultiHeadAttention::new(width, width, num_heads, vb.pp("self_attn"))?,
            cross_attn,
            mlp_layer_norm: candle_nn::layer_norm(width, eps, vb.pp("mlp_layer_norm"))?,
            mlp: Mlp::new(width, intermediate_dim, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder_sequence: Option<&Tensor>,
        attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let residual = xs;
        let x = self.self_attn_layer_norm.forward(xs)?;
        let x = self.self_attn.forward(&x, &x, Some(attention_mask))?;
        let mut x = (residual + x)?;

        if let (Some(cross), Some(context)) = (&self.cross_attn, encoder_sequence) {
            let residual = &x;
            let y = cross.layer_norm.forward(&x)?;
            let y = cross.attn.forward(&y, context, None)?;
            x = (residual + y)?;
        }

        let residual = &x;
        let y = self.mlp_layer_norm.forward(&x)?;
        let y = self.mlp.forward(&y)?;
        residual + y
    }
}

/// Self-attention only text decoder.
#[derive(Debug, Clone)]
pub struct UnimodalTextDecoder {
    blocks: Vec<DecoderBlock>,
}

impl UnimodalTextDecoder {
    /// `shape` is the shape of the augmented text sequence.
    pub fn new(
        shape: SequenceShape,
        depth: usize,
        num_heads: usize,
        intermediate_dim: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let blocks = (0..depth)
            .map(|i| {
                DecoderBlock::new(shape.width, None, num_heads, intermediate_dim, eps, vb.pp(i))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    /// Decode `[B, T, width]` under a `[B, T]` padding mask (ones attendable).
    pub fn forward(&self, xs: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let mask = causal_attention_mask(attention_mask)?.to_dtype(xs.dtype())?;
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward(&xs, None, &mask)?;
        }
        Ok(xs)
    }
}

/// Text decoder cross-attending to pooled image features, followed by a
/// projection to the captioning output width.
///
/// The encoder sequence is `[B, S, context_width]`; the output is
/// `[B, T, output_width]`.
#[derive(Debug, Clone)]
pub struct MultimodalTextDecoder {
    blocks: Vec<DecoderBlock>,
    output_projection: Linear,
    query_shape: SequenceShape,
    output_width: usize,
}

impl MultimodalTextDecoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_shape: SequenceShape,
        context_shape: SequenceShape,
        output_width: usize,
        depth: usize,
        num_heads: usize,
        intermediate_dim: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let blocks = (0..depth)
            .map(|i| {
                DecoderBlock::new(
                    query_shape.width,
                    Some(context_shape.width),
                    num_heads,
                    intermediate_dim,
                    eps,
                    vb.pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let output_projection =
            candle_nn::linear(query_shape.width, output_width, vb.pp("output_projection"))?;

        Ok(Self {
            blocks,
            output_projection,
            query_shape,
            output_width,
        })
    }

    pub fn output_shape(&self) -> SequenceShape {
        SequenceShape::new(self.query_shape.batch, self.query_shape.seq_len, self.output_width)
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        encoder_sequence: &Tensor,
        decoder_attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let mask = causal_attention_mask(decoder_attention_mask)?.to_dtype(xs.dtype())?;
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward(&xs, Some(encoder_sequence), &mask)?;
        }
        self.output_projection.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_unimodal_decoder_is_causal() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let decoder = UnimodalTextDecoder::new(SequenceShape::new(1, 4, 8), 2, 2, 16, 1e-6, vb)?;
        let mask = Tensor::ones((1, 4), DType::F32, &device)?;

        let xs = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;
        let ys = decoder.forward(&xs, &mask)?;
        assert_eq!(ys.dims(), &[1, 4, 8]);

        // changing the last token must not change the earlier outputs
        let tail = Tensor::randn(0f32, 1., (1, 1, 8), &device)?;
        let xs2 = Tensor::cat(&[&xs.narrow(1, 0, 3)?, &tail], 1)?;
        let ys2 = decoder.forward(&xs2, &mask)?;

        let head = ys.narrow(1, 0, 3)?.flatten_all()?.to_vec1::<f32>()?;
        let head2 = ys2.narrow(1, 0, 3)?.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in head.iter().zip(head2.iter()) {
            approx::assert_relative_eq!(a, b, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_multimodal_decoder_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let decoder = MultimodalTextDecoder::new(
            SequenceShape::new(2, 3, 8),
            SequenceShape::new(2, 12, 6),
            6,
            2,
            2,
            16,
            1e-6,
            vb.pp("multimodal_decoder"),
        )?;
        assert_eq!(decoder.output_shape().dims(), [2, 3, 6]);

        let xs = Tensor::randn(0f32, 1., (2, 3, 8), &device)?;
        let context = Tensor::randn(0f32, 1., (2, 12, 6), &device)?;
        let mask = Tensor::ones((2, 3), DType::F32, &device)?;
        let ys = decoder.forward(&xs, &context, &mask)?;
        assert_eq!(ys.dims(), &[2, 3, 6]);

        let names = varmap.data().lock().unwrap();
        assert!(names.contains_key("multimodal_decoder.1.cross_attn.k_proj.weight"));
        assert!(names.contains_key("multimodal_decoder.output_projection.weight"));
        Ok(())
    }
}
