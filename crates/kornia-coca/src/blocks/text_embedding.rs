use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{rotary_emb::rope, Embedding, VarBuilder};

use crate::shape::SequenceShape;

fn rotary_frequencies(
    width: usize,
    seq_len: usize,
    theta: f64,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let inv_freq: Vec<f32> = (0..width)
        .step_by(2)
        .map(|i| 1f32 / (theta as f32).powf(i as f32 / width as f32))
        .collect();
    let inv_freq = Tensor::new(inv_freq, device)?;

    // 0 -> seq_len
    let idx_theta = Tensor::arange(0, seq_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((seq_len, 1))?
        .matmul(&inv_freq.reshape((1, inv_freq.elem_count()))?)?;

    Ok((idx_theta.cos()?, idx_theta.sin()?))
}

/// Token lookup plus rotary position encoding of the text sequence.
///
/// The lookup maps `[B, L]` token ids to `[B, L, width]` vectors; the rotary
/// encoding is applied to the sequence once the classification token has been
/// appended, so it covers `L + 1` positions.
#[derive(Debug, Clone)]
pub struct TextEmbedding {
    token_embedding: Embedding,
    cos: Tensor,
    sin: Tensor,
}

impl TextEmbedding {
    /// `shape` is the shape of the augmented sequence, `[B, L + 1, width]`.
    pub fn new(
        shape: SequenceShape,
        vocab_size: usize,
        theta: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if shape.width % 2 != 0 {
            candle_core::bail!("rotary embedding needs an even width, got {}", shape.width)
        }
        let token_embedding =
            candle_nn::embedding(vocab_size, shape.width, vb.pp("token_embedding"))?;
        let (cos, sin) = rotary_frequencies(shape.width, shape.seq_len, theta, vb.device())?;

        Ok(Self {
            token_embedding,
            cos: cos.to_dtype(vb.dtype())?,
            sin: sin.to_dtype(vb.dtype())?,
        })
    }

    /// Look up the vectors of `[B, L]` token ids.
    pub fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        self.token_embedding.forward(ids)
    }
}

impl Module for TextEmbedding {
    /// Rotate the `[B, T, width]` sequence by its positions.
    fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (_, seq_len, _) = tokens.dims3()?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;

        // a single "head" spanning the full width
        rope(&tokens.unsqueeze(1)?.contiguous()?, &cos, &sin)?.squeeze(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_nn::VarMap;

    #[test]
    fn test_text_embedding_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let embedding = TextEmbedding::new(SequenceShape::new(2, 5, 8), 32, 10000.0, vb)?;
        let ids = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &device)?;
        let tokens = embedding.embed_tokens(&ids)?;
        assert_eq!(tokens.dims(), &[2, 4, 8]);

        let token = Tensor::zeros((2, 1, 8), DType::F32, &device)?;
        let augmented = Tensor::cat(&[&tokens, &token], 1)?;
        let rotated = embedding.forward(&augmented)?;
        assert_eq!(rotated.dims(), &[2, 5, 8]);
        Ok(())
    }

    #[test]
    fn test_first_position_is_not_rotated() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let embedding = TextEmbedding::new(SequenceShape::new(1, 3, 4), 8, 10000.0, vb)?;
        let tokens = Tensor::randn(0f32, 1., (1, 3, 4), &device)?;
        let rotated = embedding.forward(&tokens)?;

        let before = tokens.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        let after = rotated.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in before.iter().zip(after.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }

        // rotations keep the norm of every position
        let norm_before = tokens.sqr()?.sum_keepdim(2)?.flatten_all()?.to_vec1::<f32>()?;
        let norm_after = rotated.sqr()?.sum_keepdim(2)?.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in norm_before.iter().zip(norm_after.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_odd_width_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        assert!(TextEmbedding::new(SequenceShape::new(1, 3, 5), 8, 10000.0, vb).is_err());
    }
}
