use candle_core::{DType, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// Additive value for attention logits that must be ignored.
const MASKED_LOGIT: f64 = -1e9;

/// Multi-head attention with independent query and key/value widths.
///
/// The query sequence `[B, Tq, query_dim]` attends to the key/value sequence
/// `[B, Tk, kv_dim]`; the output has the shape of the query sequence.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        query_dim: usize,
        kv_dim: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_heads == 0 || query_dim % num_heads != 0 {
            candle_core::bail!("query dim {query_dim} must be divisible by {num_heads} heads")
        }
        Ok(Self {
            q_proj: candle_nn::linear(query_dim, query_dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(kv_dim, query_dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(kv_dim, query_dim, vb.pp("v_proj"))?,
            o_proj: candle_nn::linear(query_dim, query_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim: query_dim / num_heads,
        })
    }

    /// Attend `xs` to `kv`.
    ///
    /// `attention_mask` is additive and must broadcast to `[B, heads, Tq, Tk]`.
    pub fn forward(
        &self,
        xs: &Tensor,
        kv: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batches, q_len, hidden_size) = xs.dims3()?;
        let (_, kv_len, _) = kv.dims3()?;

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((batches, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(kv)?
            .reshape((batches, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(kv)?
            .reshape((batches, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let y = {
            let in_dtype = q.dtype();
            let q = q.to_dtype(DType::F32)?;
            let k = k.to_dtype(DType::F32)?;
            let v = v.to_dtype(DType::F32)?;

            let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
            let att = match attention_mask {
                Some(mask) => att.broadcast_add(&mask.to_dtype(DType::F32)?)?,
                None => att,
            };
            let att = candle_nn::ops::softmax_last_dim(&att)?;
            att.matmul(&v)?.contiguous()?.to_dtype(in_dtype)?
        };

        let y = y
            .transpose(1, 2)?
            .reshape((batches, q_len, hidden_size))?;
        self.o_proj.forward(&y)
    }
}

/// Two layer feed-forward network with a GELU in between.
#[derive(Debug, Clone)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(dim: usize, intermediate_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(dim, intermediate_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(intermediate_dim, dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(xs)?.gelu()?;
        self.fc2.forward(&x)
    }
}

/// Build the additive self-attention mask of a causal decoder.
///
/// `padding_mask` is `[B, T]` with ones for attendable positions and zeros for
/// positions that other tokens must not attend to. A position is always
/// visible to itself so no row of the mask is fully masked. The result has
/// shape `[B, 1, T, T]`.
pub fn causal_attention_mask(padding_mask: &Tensor) -> Result<Tensor> {
    let (_batches, seq_len) = padding_mask.dims2()?;
    let device = padding_mask.device();

    let causal: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 1.0 } else { 0.0 }))
        .collect();
    let causal = Tensor::from_vec(causal, (seq_len, seq_len), device)?;
    let eye: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j == i { 1.0 } else { 0.0 }))
        .collect();
    let eye = Tensor::from_vec(eye, (seq_len, seq_len), device)?;

    let keys = padding_mask.to_dtype(DType::F32)?.unsqueeze(1)?;
    let visible = keys.broadcast_maximum(&eye)?.broadcast_mul(&causal)?;

    ((visible - 1.0)? * -MASKED_LOGIT)?.unsqueeze(1)
}
