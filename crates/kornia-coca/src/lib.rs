//! # Kornia CoCa
//!
//! Contrastive Captioner (CoCa) image-text foundation model built on top of candle.
//!
//! CoCa encodes images with a vision transformer, pools the encoded patches
//! twice with learnable queries (once for a contrastive objective, once as
//! context for captioning) and decodes text in two stages: a causal unimodal
//! decoder followed by a multimodal decoder cross-attending to the pooled
//! image features.
//!
//! # Example
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Tensor};
//! use kornia_coca::{Coca, CocaConfig};
//!
//! # fn main() -> Result<(), kornia_coca::CocaError> {
//! let device = Device::Cpu;
//! let mut model = Coca::new(CocaConfig::default(), &device)?;
//!
//! // blocks and learnable tensors are allocated once the shapes are known
//! model.build(&[vec![2, 224, 224, 3], vec![2, 32]])?;
//!
//! let images = Tensor::zeros((2, 224, 224, 3), DType::F32, &device)?;
//! let texts = Tensor::zeros((2, 32), DType::U32, &device)?;
//! let captioning = model.call(&images, &texts)?;
//! assert_eq!(captioning.dims(), &[2, 32, 256]);
//! # Ok(())
//! # }
//! ```

/// Neural network blocks of the model.
pub mod blocks;

/// Hyperparameters and their serialization.
pub mod config;

/// Error types of the crate.
pub mod error;

/// Input shape descriptors and their validation.
pub mod shape;

mod model;

pub use config::{CocaConfig, CONFIG_VERSION};
pub use error::CocaError;
pub use model::{Coca, CocaOutput, ContrastiveFeatures};
pub use shape::{ImageShape, SequenceShape, TextShape};
