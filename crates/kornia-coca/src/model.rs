use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use log::{debug, info};
use serde_json::{Map, Value};

use crate::blocks::{
    AttentionPooling, ImageEncoder, MultimodalTextDecoder, PatchEmbedding, TextEmbedding,
    UnimodalTextDecoder,
};
use crate::config::CocaConfig;
use crate::error::CocaError;
use crate::shape::{parse_input_shapes, ImageShape, SequenceShape, TextShape};

const AUX_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

/// Pooled features consumed by an external contrastive loss.
#[derive(Debug, Clone)]
pub struct ContrastiveFeatures {
    /// Contrastive image feature, `[B, encoder_width, contrastive_query_length]`.
    pub image: Tensor,
    /// Output of the unimodal decoder at the classification position, `[B, text_width]`.
    pub text: Tensor,
}

/// Outputs of a CoCa forward pass.
#[derive(Debug, Clone)]
pub struct CocaOutput {
    /// Captioning output, `[B, sequence_length, captioning_query_length]`.
    pub captioning: Tensor,
    /// Only computed when requested.
    pub contrastive: Option<ContrastiveFeatures>,
}

/// Every block and learnable tensor of a built model.
struct CocaLayers {
    varmap: VarMap,
    images_shape: ImageShape,
    text_shape: TextShape,

    patch_embedding: PatchEmbedding,
    image_encoder: ImageEncoder,
    text_embedding: TextEmbedding,
    unimodal_decoder: UnimodalTextDecoder,
    multimodal_decoder: MultimodalTextDecoder,
    contrastive_pooling: AttentionPooling,
    captioning_pooling: AttentionPooling,

    classification_token: Tensor,
    contrastive_query: Tensor,
    captioning_query: Tensor,
    // ones for the text positions, zero for the classification position
    text_mask: Tensor,
}

impl CocaLayers {
    fn new(
        config: &CocaConfig,
        images_shape: ImageShape,
        text_shape: TextShape,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, CocaError> {
        // all the weights go to a fresh store, nothing is kept if a block fails
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let batch = images_shape.batch;
        let eps = config.layer_norm_eps;
        let num_patches = images_shape.num_patches(config.img_patch_size)?;
        let augmented_len = text_shape.augmented_len()?;
        debug!(
            "Building CoCa: images {:?} -> {num_patches} patches, texts {:?} -> {augmented_len} \
             positions",
            images_shape.dims(),
            text_shape.dims(),
        );

        let patch_embedding = PatchEmbedding::new(
            images_shape,
            config.img_patch_size,
            config.encoder_width,
            vb.pp("patch_embedding"),
        )?;

        let image_encoder = ImageEncoder::new(
            patch_embedding.output_shape(),
            config.encoder_depth,
            config.encoder_heads,
            config.encoder_intermediate_dim,
            eps,
            vb.pp("image_encoder"),
        )?;

        let augmented_text = SequenceShape::new(batch, augmented_len, config.text_width);
        let text_embedding = TextEmbedding::new(
            augmented_text,
            config.vocab_size,
            config.rope_theta,
            vb.pp("text_embedding"),
        )?;

        let unimodal_decoder = UnimodalTextDecoder::new(
            augmented_text,
            config.unimodal_decoder_depth,
            config.unimodal_decoder_heads,
            config.decoder_intermediate_dim,
            eps,
            vb.pp("unimodal_decoder"),
        )?;

        let contrastive_pooling = AttentionPooling::new(
            image_encoder.output_shape(),
            config.contrastive_query_length,
            config.contrastive_attn_heads,
            eps,
            vb.pp("contrastive_pooling"),
        )?;

        let captioning_pooling = AttentionPooling::new(
            image_encoder.output_shape(),
            config.captioning_query_length,
            config.captioning_attn_heads,
            eps,
            vb.pp("captioning_pooling"),
        )?;

        // the pooled captioning feature is read as `encoder_width` positions of
        // `captioning_query_length` features
        let multimodal_decoder = MultimodalTextDecoder::new(
            SequenceShape::new(batch, text_shape.seq_len, config.text_width),
            captioning_pooling.output_shape(),
            config.captioning_query_length,
            config.multimodal_decoder_depth,
            config.multimodal_decoder_heads,
            config.decoder_intermediate_dim,
            eps,
            vb.pp("multimodal_decoder"),
        )?;

        let classification_token =
            vb.get_with_hints((batch, 1, config.text_width), "classification_token", AUX_INIT)?;
        let contrastive_query = vb.get_with_hints(
            (batch, config.encoder_width, config.contrastive_query_length),
            "contrastive_query",
            AUX_INIT,
        )?;
        let captioning_query = vb.get_with_hints(
            (batch, config.encoder_width, config.captioning_query_length),
            "captioning_query",
            AUX_INIT,
        )?;

        let text_mask = Tensor::cat(
            &[
                &Tensor::ones((batch, text_shape.seq_len), dtype, device)?,
                &Tensor::zeros((batch, 1), dtype, device)?,
            ],
            1,
        )?;

        info!(
            "CoCa built with {} trainable tensors, output shape {:?}",
            varmap.all_vars().len(),
            multimodal_decoder.output_shape().dims(),
        );

        Ok(Self {
            varmap,
            images_shape,
            text_shape,
            patch_embedding,
            image_encoder,
            text_embedding,
            unimodal_decoder,
            multimodal_decoder,
            contrastive_pooling,
            captioning_pooling,
            classification_token,
            contrastive_query,
            captioning_query,
            text_mask,
        })
    }

    fn check_images(&self, images: &Tensor) -> Result<(), CocaError> {
        let expected = self.images_shape.dims();
        if images.dims() != expected {
            return Err(CocaError::InputShapeMismatch {
                name: "Images",
                expected: format!("{expected:?}"),
                actual: images.dims().to_vec(),
            });
        }
        Ok(())
    }

    fn check_texts(&self, texts: &Tensor, text_width: usize) -> Result<(), CocaError> {
        let TextShape { batch, seq_len } = self.text_shape;
        let valid = match *texts.dims() {
            [b, l] => texts.dtype().is_int() && (b, l) == (batch, seq_len),
            [b, l, w] => {
                texts.dtype().is_float() && (b, l, w) == (batch, seq_len, text_width)
            }
            _ => false,
        };
        if !valid {
            return Err(CocaError::InputShapeMismatch {
                name: "Texts",
                expected: format!(
                    "[{batch}, {seq_len}] token ids or [{batch}, {seq_len}, {text_width}] \
                     embeddings"
                ),
                actual: texts.dims().to_vec(),
            });
        }
        Ok(())
    }
}

enum Lifecycle {
    Unbuilt,
    Built(Box<CocaLayers>),
}

/// Contrastive Captioner (CoCa) model.
///
/// The model is created from its hyperparameters only. Blocks and learnable
/// tensors depend on the input shapes and are allocated by [`Coca::build`],
/// which must run exactly once before the model can be called.
///
/// Reference: <https://arxiv.org/abs/2205.01917>
pub struct Coca {
    config: CocaConfig,
    device: Device,
    dtype: DType,
    state: Lifecycle,
}

impl Coca {
    /// Create an unbuilt CoCa model running in `f32`.
    ///
    /// # Arguments
    ///
    /// * `config` - The hyperparameters of the model
    /// * `device` - The device the weights are allocated on
    pub fn new(config: CocaConfig, device: &Device) -> Result<Self, CocaError> {
        Self::with_dtype(config, device, DType::F32)
    }

    /// Create an unbuilt CoCa model with weights of the given floating point type.
    pub fn with_dtype(
        config: CocaConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, CocaError> {
        config.validate()?;
        if !dtype.is_float() {
            return Err(CocaError::Config(format!(
                "weights must use a floating point dtype, got {dtype:?}"
            )));
        }
        Ok(Self {
            config,
            device: device.clone(),
            dtype,
            state: Lifecycle::Unbuilt,
        })
    }

    /// Create an unbuilt model from a mapping produced by [`Coca::get_config`].
    pub fn from_config(config: Map<String, Value>, device: &Device) -> Result<Self, CocaError> {
        Self::new(CocaConfig::from_map(config)?, device)
    }

    /// Flat key/value view of the hyperparameters.
    ///
    /// Weights are not part of the configuration, see [`Coca::save_weights`].
    pub fn get_config(&self) -> Result<Map<String, Value>, CocaError> {
        self.config.to_map()
    }

    pub fn config(&self) -> &CocaConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, Lifecycle::Built(_))
    }

    /// Shapes the model was built with.
    pub fn input_shapes(&self) -> Option<(ImageShape, TextShape)> {
        match &self.state {
            Lifecycle::Built(layers) => Some((layers.images_shape, layers.text_shape)),
            Lifecycle::Unbuilt => None,
        }
    }

    /// Allocate every block and learnable tensor for the given input shapes.
    ///
    /// # Arguments
    ///
    /// * `input_shapes` - `[images_shape, text_shape]` with images laid out as
    ///   `[batch, height, width, channels]` and texts as `[batch, sequence_length]`.
    ///
    /// On error the model is left untouched.
    pub fn build<S: AsRef<[usize]>>(&mut self, input_shapes: &[S]) -> Result<(), CocaError> {
        if let Lifecycle::Built(layers) = &self.state {
            return Err(CocaError::AlreadyBuilt {
                images: layers.images_shape.dims().to_vec(),
                texts: layers.text_shape.dims().to_vec(),
            });
        }

        let (images_shape, text_shape) = parse_input_shapes(input_shapes)?;

        let patch_size = self.config.img_patch_size;
        if images_shape.height < patch_size || images_shape.width < patch_size {
            return Err(CocaError::ImageTooSmall {
                height: images_shape.height,
                width: images_shape.width,
                patch_size,
            });
        }

        let layers = CocaLayers::new(
            &self.config,
            images_shape,
            text_shape,
            self.dtype,
            &self.device,
        )?;
        self.state = Lifecycle::Built(Box::new(layers));

        Ok(())
    }

    /// Run the captioning branch of the model.
    ///
    /// # Arguments
    ///
    /// * `images` - Images with the exact shape the model was built with
    /// * `texts` - `[B, L]` token ids or `[B, L, text_width]` token embeddings
    ///
    /// # Returns
    ///
    /// The captioning output with shape `[B, L, captioning_query_length]`.
    pub fn call(&self, images: &Tensor, texts: &Tensor) -> Result<Tensor, CocaError> {
        Ok(self.forward(images, texts, false)?.captioning)
    }

    /// Run the model, optionally also computing the contrastive features.
    pub fn forward(
        &self,
        images: &Tensor,
        texts: &Tensor,
        with_contrastive: bool,
    ) -> Result<CocaOutput, CocaError> {
        let layers = self.layers()?;
        layers.check_images(images)?;
        layers.check_texts(texts, self.config.text_width)?;

        let seq_len = layers.text_shape.seq_len;

        // image branch
        let patches = layers
            .patch_embedding
            .forward(&images.to_dtype(self.dtype)?)?;
        let encoded_image = layers.image_encoder.forward(&patches)?;

        let captioning_feature = layers
            .captioning_pooling
            .forward(&layers.captioning_query, &encoded_image)?;
        let contrastive_image = if with_contrastive {
            Some(
                layers
                    .contrastive_pooling
                    .forward(&layers.contrastive_query, &encoded_image)?,
            )
        } else {
            None
        };

        // text branch, the classification token goes after the text
        let token_embeddings = if texts.rank() == 2 {
            layers.text_embedding.embed_tokens(texts)?
        } else {
            texts.to_dtype(self.dtype)?
        };
        let text_tokens = Tensor::cat(&[&token_embeddings, &layers.classification_token], 1)?;

        let embedded_text = layers.text_embedding.forward(&text_tokens)?;
        let unimodal_output = layers
            .unimodal_decoder
            .forward(&embedded_text, &layers.text_mask)?;

        // fusion without the classification position
        let trimmed = unimodal_output.narrow(1, 0, seq_len)?;
        let captioning = layers.multimodal_decoder.forward(
            &trimmed,
            &captioning_feature,
            &layers.text_mask.narrow(1, 0, seq_len)?,
        )?;

        let contrastive = match contrastive_image {
            Some(image) => Some(ContrastiveFeatures {
                image,
                text: unimodal_output.narrow(1, seq_len, 1)?.squeeze(1)?,
            }),
            None => None,
        };

        Ok(CocaOutput {
            captioning,
            contrastive,
        })
    }

    /// Combine externally computed losses with the configured weights.
    pub fn weighted_loss(
        &self,
        contrastive_loss: &Tensor,
        captioning_loss: &Tensor,
    ) -> Result<Tensor, CocaError> {
        let contrastive = contrastive_loss.affine(self.config.contrastive_loss_weight, 0.0)?;
        let captioning = captioning_loss.affine(self.config.captioning_loss_weight, 0.0)?;
        Ok((contrastive + captioning)?)
    }

    /// The learnable classification token, `[B, 1, text_width]`.
    pub fn classification_token(&self) -> Result<&Tensor, CocaError> {
        Ok(&self.layers()?.classification_token)
    }

    /// The learnable contrastive pooling query, `[B, encoder_width, contrastive_query_length]`.
    pub fn contrastive_query(&self) -> Result<&Tensor, CocaError> {
        Ok(&self.layers()?.contrastive_query)
    }

    /// The learnable captioning pooling query, `[B, encoder_width, captioning_query_length]`.
    pub fn captioning_query(&self) -> Result<&Tensor, CocaError> {
        Ok(&self.layers()?.captioning_query)
    }

    /// Store holding every trainable tensor of the built model.
    pub fn varmap(&self) -> Result<&VarMap, CocaError> {
        Ok(&self.layers()?.varmap)
    }

    /// Sorted names of every trainable tensor.
    pub fn weight_names(&self) -> Result<Vec<String>, CocaError> {
        let data = self
            .layers()?
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("weights lock poisoned: {e}")))?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Write every trainable tensor to a safetensors file.
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<(), CocaError> {
        self.layers()?.varmap.save(path.as_ref())?;
        debug!("Saved CoCa weights to {}", path.as_ref().display());
        Ok(())
    }

    /// Overwrite the trainable tensors with the ones of a safetensors file.
    ///
    /// Every tensor of the model must be present in the file.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<(), CocaError> {
        match &mut self.state {
            Lifecycle::Built(layers) => layers.varmap.load(path.as_ref())?,
            Lifecycle::Unbuilt => return Err(CocaError::NotBuilt),
        }
        debug!("Loaded CoCa weights from {}", path.as_ref().display());
        Ok(())
    }

    fn layers(&self) -> Result<&CocaLayers, CocaError> {
        match &self.state {
            Lifecycle::Built(layers) => Ok(layers),
            Lifecycle::Unbuilt => Err(CocaError::NotBuilt),
        }
    }
}
