use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use super::attention::{Mlp, MultiHeadAttention};
use crate::shape::SequenceShape;

/// Pre-norm self-attention encoder block.
#[derive(Debug, Clone)]
struct EncoderBlock {
    layer_norm1: LayerNorm,
    self_attn: MultiHeadAttention,
    layer_norm2: LayerNorm,
    mlp: Mlp,
}

impl EncoderBlock {
    fn new(
        width: usize,
        num_heads: usize,
        intermediate_dim: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            layer_norm1: candle_nn::layer_norm(width, eps, vb.pp("layer_norm1"))?,
            self_attn: MultiHeadAttention::new(width, width, num_heads, vb.pp("self_attn"))?,
            layer_norm2: candle_nn::layer_norm(width, eps, vb.pp("layer_norm2"))?,
            mlp: Mlp::new(width, intermediate_dim, vb.pp("mlp"))?,
        })
    }
}

impl Module for EncoderBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let x = self.layer_norm1.forward(xs)?;
        let x = self.self_attn.forward(&x, &x, None)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.layer_norm2.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        residual + x
    }
}

/// Stack of `depth` encoder blocks applied to the patch sequence.
///
/// The sequence length and width are preserved.
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    blocks: Vec<EncoderBlock>,
    shape: SequenceShape,
}

impl ImageEncoder {
    pub fn new(
        shape: SequenceShape,
        depth: usize,
        num_heads: usize,
        intermediate_dim: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let blocks = (0..depth)
            .map(|i| EncoderBlock::new(shape.width, num_heads, intermediate_dim, eps, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks, shape })
    }

    pub fn output_shape(&self) -> SequenceShape {
        self.shape
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }
}

impl Module for ImageEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_image_encoder_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let shape = SequenceShape::new(2, 5, 8);
        let encoder = ImageEncoder::new(shape, 3, 2, 16, 1e-6, vb.pp("image_encoder"))?;
        assert_eq!(encoder.depth(), 3);

        let xs = Tensor::randn(0f32, 1., (2, 5, 8), &device)?;
        let ys = encoder.forward(&xs)?;
        assert_eq!(ys.dims(), &[2, 5, 8]);

        // every block owns its own weights
        let names = varmap.data().lock().unwrap();
        assert!(names.contains_key("image_encoder.0.self_attn.q_proj.weight"));
        assert!(names.contains_key("image_encoder.2.mlp.fc2.bias"));
        Ok(())
    }

    #[test]
    fn test_empty_encoder_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let encoder = ImageEncoder::new(SequenceShape::new(1, 4, 8), 0, 2, 16, 1e-6, vb)?;
        let xs = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;
        let ys = encoder.forward(&xs)?;
        assert_eq!(xs.to_vec3::<f32>()?, ys.to_vec3::<f32>()?);
        Ok(())
    }
}
