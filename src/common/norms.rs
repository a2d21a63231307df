//! Normalization layers used by the delta blocks
//!
//! - GroupNormNoParams: group normalization without learnable affine parameters
//! - AdaGroupNorm: group normalization modulated by an embedding vector

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear};

use crate::config::Activation;

/// GroupNorm without learnable parameters (affine=False)
///
/// Matches `torch.nn.functional.group_norm(x, num_groups, eps=eps)` for (B, C, H, W) inputs.
#[derive(Debug, Clone)]
pub struct GroupNormNoParams {
    num_groups: usize,
    eps: f64,
}

impl GroupNormNoParams {
    pub fn new(num_groups: usize, eps: f64) -> Self {
        Self { num_groups, eps }
    }
}

impl Module for GroupNormNoParams {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let internal_dtype = match x_dtype {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };

        let (b, c, h, w) = x.dims4()?;
        #[allow(clippy::manual_is_multiple_of)]
        if c % self.num_groups != 0 {
            candle_core::bail!(
                "GroupNorm: {c} channels not divisible into {} groups",
                self.num_groups
            );
        }
        let group_size = (c / self.num_groups) * h * w;
        let x = x
            .to_dtype(internal_dtype)?
            .reshape((b, self.num_groups, group_size))?;

        let mean_x = (x.sum_keepdim(2)? / group_size as f64)?;
        let x = x.broadcast_sub(&mean_x)?;
        let var_x = (x.sqr()?.sum_keepdim(2)? / group_size as f64)?;
        let x_normed = x.broadcast_div(&(var_x + self.eps)?.sqrt()?)?;

        x_normed.reshape((b, c, h, w))?.to_dtype(x_dtype)
    }
}

/// Group normalization whose scale and shift come from an embedding
///
/// `x * (1 + scale) + shift` where `(scale, shift) = linear(act(emb))` split on the channel axis.
#[derive(Debug, Clone)]
pub struct AdaGroupNorm {
    linear: Linear,
    norm: GroupNormNoParams,
    act: Option<Activation>,
    out_dim: usize,
}

impl AdaGroupNorm {
    pub fn new(
        vb: VarBuilder,
        embedding_dim: usize,
        out_dim: usize,
        num_groups: usize,
        act: Option<Activation>,
    ) -> Result<Self> {
        let linear = linear(embedding_dim, out_dim * 2, vb.pp("linear"))?;
        Ok(Self {
            linear,
            norm: GroupNormNoParams::new(num_groups, 1e-5),
            act,
            out_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let emb = match self.act {
            Some(act) => act.forward(emb)?,
            None => emb.clone(),
        };
        // [B, 2C] -> [B, 2C, 1, 1]
        let emb = self.linear.forward(&emb)?.unsqueeze(2)?.unsqueeze(3)?;
        let scale = emb.narrow(1, 0, self.out_dim)?;
        let shift = emb.narrow(1, self.out_dim, self.out_dim)?;

        let x = self.norm.forward(x)?;
        x.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(&shift)
    }
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Silu => candle_nn::ops::silu(x),
            Self::Relu => x.relu(),
            Self::Gelu => x.gelu_erf(),
        }
    }
}
