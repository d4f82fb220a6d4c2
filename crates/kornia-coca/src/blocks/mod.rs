//! Neural network blocks wired together by the CoCa model.

mod attention;
mod decoder;
mod encoder;
mod patch_embedding;
mod pooling;
mod text_embedding;

pub use attention::{causal_attention_mask, Mlp, MultiHeadAttention};
pub use decoder::{MultimodalTextDecoder, UnimodalTextDecoder};
pub use encoder::ImageEncoder;
pub use patch_embedding::PatchEmbedding;
pub use pooling::AttentionPooling;
pub use text_embedding::TextEmbedding;
