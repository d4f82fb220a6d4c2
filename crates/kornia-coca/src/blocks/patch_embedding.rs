use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

use crate::shape::{ImageShape, SequenceShape};

/// Splits `[B, H, W, C]` images into square patches and projects every patch
/// to `width` features.
///
/// A learnable class embedding is prepended to the patch sequence and a
/// learned position embedding is added, so the output has `num_patches + 1`
/// positions.
#[derive(Debug, Clone)]
pub struct PatchEmbedding {
    patch_embedding: Conv2d,
    class_embedding: Tensor,
    position_embedding: Tensor,
    output_shape: SequenceShape,
}

impl PatchEmbedding {
    pub fn new(
        image_shape: ImageShape,
        patch_size: usize,
        width: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_patches = image_shape
            .num_patches(patch_size)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        if num_patches == 0 {
            candle_core::bail!(
                "image of size {}x{} is smaller than the patch size {patch_size}",
                image_shape.height,
                image_shape.width
            )
        }

        let conv_cfg = Conv2dConfig {
            stride: patch_size,
            ..Default::default()
        };
        let patch_embedding = candle_nn::conv2d(
            image_shape.channels,
            width,
            patch_size,
            conv_cfg,
            vb.pp("patch_embedding"),
        )?;

        let init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        let class_embedding = vb.get_with_hints(width, "class_embedding", init)?;
        let position_embedding =
            vb.get_with_hints((1, num_patches + 1, width), "position_embedding", init)?;

        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            output_shape: SequenceShape::new(image_shape.batch, num_patches + 1, width),
        })
    }

    /// Shape of the produced patch sequence, `[B, num_patches + 1, width]`.
    pub fn output_shape(&self) -> SequenceShape {
        self.output_shape
    }

    pub fn num_patches(&self) -> usize {
        self.output_shape.seq_len - 1
    }
}

impl Module for PatchEmbedding {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let (batches, _, _, _) = images.dims4()?;
        let width = self.output_shape.width;

        // [B, H, W, C] -> [B, C, H, W]
        let pixels = images.permute((0, 3, 1, 2))?.contiguous()?;

        // [B, D, H / P, W / P] -> [B, N, D]
        let patches = self
            .patch_embedding
            .forward(&pixels)?
            .flatten_from(2)?
            .transpose(1, 2)?;

        let class_embedding = self
            .class_embedding
            .reshape((1, 1, width))?
            .broadcast_as((batches, 1, width))?
            .to_dtype(patches.dtype())?;

        Tensor::cat(&[&class_embedding, &patches], 1)?
            .broadcast_add(&self.position_embedding)
    }
}
