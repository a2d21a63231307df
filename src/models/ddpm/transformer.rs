//! Transformer encoder stack used as a delta-block inner transform
//!
//! Mirrors `torch.nn.TransformerEncoder` as built by `nn.Transformer`: post-norm layers
//! (self-attention, ReLU feed-forward), fused `in_proj` weights and a final LayerNorm.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder, layer_norm, linear};

use crate::common::scaled_dot_product_attention;

/// Multi-head self-attention with a fused QKV projection
#[derive(Debug)]
struct MultiheadAttention {
    in_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiheadAttention {
    fn new(vb: VarBuilder, d_model: usize, num_heads: usize) -> Result<Self> {
        let in_proj_weight = vb.get_with_hints(
            (3 * d_model, d_model),
            "in_proj_weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let in_proj_bias = vb.get_with_hints(3 * d_model, "in_proj_bias", candle_nn::init::ZERO)?;
        let out_proj = linear(d_model, d_model, vb.pp("out_proj"))?;
        Ok(Self {
            in_proj: Linear::new(in_proj_weight, Some(in_proj_bias)),
            out_proj,
            num_heads,
            head_dim: d_model / num_heads,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, d_model) = x.dims3()?;
        let qkv = self.in_proj.forward(x)?;

        let heads = |i: usize| -> Result<Tensor> {
            qkv.narrow(2, i * d_model, d_model)?
                .reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let (q, k, v) = (heads(0)?, heads(1)?, heads(2)?);

        let out = scaled_dot_product_attention(&q, &k, &v, (self.head_dim as f64).powf(-0.5))?;
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, d_model))?;
        self.out_proj.forward(&out)
    }
}

#[derive(Debug)]
struct EncoderLayer {
    self_attn: MultiheadAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    fn new(
        vb: VarBuilder,
        d_model: usize,
        num_heads: usize,
        dim_feedforward: usize,
        dropout: f64,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::new(vb.pp("self_attn"), d_model, num_heads)?,
            linear1: linear(d_model, dim_feedforward, vb.pp("linear1"))?,
            linear2: linear(dim_feedforward, d_model, vb.pp("linear2"))?,
            norm1: layer_norm(d_model, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(d_model, 1e-5, vb.pp("norm2"))?,
            dropout: Dropout::new(dropout as f32),
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let attn = self.self_attn.forward(x)?;
        let x = self.norm1.forward(&(x + self.dropout.forward_t(&attn, train)?)?)?;

        let ff = self.linear1.forward(&x)?.relu()?;
        let ff = self.linear2.forward(&self.dropout.forward_t(&ff, train)?)?;
        self.norm2.forward(&(x + self.dropout.forward_t(&ff, train)?)?)
    }
}

/// Stack of encoder layers over `[B, seq_len, d_model]` sequences
#[derive(Debug)]
pub struct TransformerEncoder {
    layers: Vec<EncoderLayer>,
    norm: LayerNorm,
    span: tracing::Span,
}

impl TransformerEncoder {
    pub fn new(
        vb: VarBuilder,
        d_model: usize,
        num_heads: usize,
        num_layers: usize,
        dim_feedforward: usize,
        dropout: f64,
    ) -> Result<Self> {
        #[allow(clippy::manual_is_multiple_of)]
        if num_heads == 0 || d_model % num_heads != 0 {
            candle_core::bail!("d_model {d_model} is not divisible by {num_heads} heads");
        }
        let layers = (0..num_layers)
            .map(|i| {
                EncoderLayer::new(
                    vb.pp("layers").pp(i),
                    d_model,
                    num_heads,
                    dim_feedforward,
                    dropout,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = layer_norm(d_model, 1e-5, vb.pp("norm"))?;
        Ok(Self {
            layers,
            norm,
            span: tracing::span!(tracing::Level::TRACE, "transformer-encoder"),
        })
    }
}

impl Module for TransformerEncoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward_t(&x, false)?;
        }
        self.norm.forward(&x)
    }
}
