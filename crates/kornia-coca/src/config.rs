use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CocaError;

/// Version of the configuration schema written by [`CocaConfig::to_map`].
pub const CONFIG_VERSION: u32 = 1;

/// Hyperparameters of the CoCa model.
///
/// Every field is persisted by [`CocaConfig::to_map`] and required by
/// [`CocaConfig::from_map`]; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CocaConfig {
    /// Schema version, must be [`CONFIG_VERSION`].
    pub version: u32,
    /// Side of the square image patches.
    pub img_patch_size: usize,
    /// Number of image encoder blocks.
    pub encoder_depth: usize,
    /// Number of attention heads in every image encoder block.
    pub encoder_heads: usize,
    /// Feature width of the encoded image sequence.
    pub encoder_width: usize,
    /// Hidden width of the image encoder MLPs.
    pub encoder_intermediate_dim: usize,
    /// Size of the text token vocabulary.
    pub vocab_size: usize,
    /// Feature width of the text embeddings and the text decoders.
    pub text_width: usize,
    /// Base of the rotary position frequencies.
    pub rope_theta: f64,
    /// Number of self-attention only text decoder blocks.
    pub unimodal_decoder_depth: usize,
    /// Number of cross-attending text decoder blocks.
    pub multimodal_decoder_depth: usize,
    /// Hidden width of the text decoder MLPs.
    pub decoder_intermediate_dim: usize,
    /// Number of attention heads in the unimodal decoder.
    pub unimodal_decoder_heads: usize,
    /// Number of attention heads in the multimodal decoder.
    pub multimodal_decoder_heads: usize,
    /// Number of queries of the contrastive attention pooling.
    pub contrastive_query_length: usize,
    /// Number of queries of the captioning attention pooling.
    ///
    /// This is also the key/value width of the multimodal cross-attention and
    /// the trailing dimension of the captioning output.
    pub captioning_query_length: usize,
    /// Number of heads of the contrastive attention pooling.
    pub contrastive_attn_heads: usize,
    /// Number of heads of the captioning attention pooling.
    pub captioning_attn_heads: usize,
    /// Weight of the contrastive objective.
    pub contrastive_loss_weight: f64,
    /// Weight of the captioning objective.
    pub captioning_loss_weight: f64,
    /// Epsilon of every layer normalization.
    pub layer_norm_eps: f64,
}

impl Default for CocaConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            img_patch_size: 18,
            encoder_depth: 40,
            encoder_heads: 16,
            encoder_width: 1408,
            encoder_intermediate_dim: 6144,
            vocab_size: 64000,
            text_width: 1408,
            rope_theta: 10000.0,
            unimodal_decoder_depth: 18,
            multimodal_decoder_depth: 18,
            decoder_intermediate_dim: 5632,
            unimodal_decoder_heads: 16,
            multimodal_decoder_heads: 16,
            contrastive_query_length: 1,
            captioning_query_length: 256,
            contrastive_attn_heads: 16,
            captioning_attn_heads: 16,
            contrastive_loss_weight: 0.5,
            captioning_loss_weight: 0.5,
            layer_norm_eps: 1e-6,
        }
    }
}

impl CocaConfig {
    /// Check that the hyperparameters describe a model that can be built.
    pub fn validate(&self) -> Result<(), CocaError> {
        if self.version != CONFIG_VERSION {
            return Err(CocaError::Config(format!(
                "unsupported config version {}, expected {CONFIG_VERSION}",
                self.version
            )));
        }

        positive("img_patch_size", self.img_patch_size)?;
        positive("encoder_intermediate_dim", self.encoder_intermediate_dim)?;
        positive("decoder_intermediate_dim", self.decoder_intermediate_dim)?;
        positive("vocab_size", self.vocab_size)?;
        positive("contrastive_query_length", self.contrastive_query_length)?;
        positive("captioning_query_length", self.captioning_query_length)?;

        divisible("encoder_width", self.encoder_width, "encoder_heads", self.encoder_heads)?;
        divisible(
            "encoder_width",
            self.encoder_width,
            "contrastive_attn_heads",
            self.contrastive_attn_heads,
        )?;
        divisible(
            "encoder_width",
            self.encoder_width,
            "captioning_attn_heads",
            self.captioning_attn_heads,
        )?;
        divisible(
            "text_width",
            self.text_width,
            "unimodal_decoder_heads",
            self.unimodal_decoder_heads,
        )?;
        divisible(
            "text_width",
            self.text_width,
            "multimodal_decoder_heads",
            self.multimodal_decoder_heads,
        )?;

        // rotary embeddings rotate pairs of features
        if self.text_width % 2 != 0 {
            return Err(CocaError::Config(format!(
                "text_width must be even, got {}",
                self.text_width
            )));
        }

        for (name, value) in [
            ("contrastive_loss_weight", self.contrastive_loss_weight),
            ("captioning_loss_weight", self.captioning_loss_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(CocaError::Config(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
        }

        for (name, value) in [
            ("rope_theta", self.rope_theta),
            ("layer_norm_eps", self.layer_norm_eps),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(CocaError::Config(format!(
                    "{name} must be a finite positive number, got {value}"
                )));
            }
        }

        Ok(())
    }

    /// Flatten the configuration into a key/value mapping.
    pub fn to_map(&self) -> Result<Map<String, Value>, CocaError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(CocaError::Config(format!(
                "configuration serialized to {other} instead of an object"
            ))),
        }
    }

    /// Rebuild a configuration from a mapping produced by [`CocaConfig::to_map`].
    ///
    /// Unknown keys, missing keys and values of the wrong type are rejected, as
    /// is any hyperparameter set that does not pass [`CocaConfig::validate`].
    pub fn from_map(map: Map<String, Value>) -> Result<Self, CocaError> {
        let config: Self = serde_json::from_value(Value::Object(map))
            .map_err(|e| CocaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CocaError> {
        let contents = std::fs::read_to_string(path)?;
        let map: Map<String, Value> = serde_json::from_str(&contents)?;
        Self::from_map(map)
    }

    /// Write the configuration to a JSON file.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<(), CocaError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn positive(name: &str, value: usize) -> Result<(), CocaError> {
    if value == 0 {
        return Err(CocaError::Config(format!("{name} must be greater than 0")));
    }
    Ok(())
}

fn divisible(
    width_name: &str,
    width: usize,
    heads_name: &str,
    heads: usize,
) -> Result<(), CocaError> {
    positive(width_name, width)?;
    positive(heads_name, heads)?;
    if width % heads != 0 {
        return Err(CocaError::Config(format!(
            "{width_name} ({width}) must be divisible by {heads_name} ({heads})"
        )));
    }
    Ok(())
}
