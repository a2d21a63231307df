//! Spatial self-attention block

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, GroupNorm, VarBuilder, conv2d};

use super::resnet::normalize;
use crate::common::scaled_dot_product_attention;

/// Single-head self-attention over all spatial positions of a feature map
///
/// Channels are the feature axis, scale is `channels^-0.5`, output is `x + proj_out(attn)`.
#[derive(Debug)]
pub struct AttnBlock {
    norm: GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
    span: tracing::Span,
}

impl AttnBlock {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv1x1 = |name: &str| conv2d(channels, channels, 1, Default::default(), vb.pp(name));
        Ok(Self {
            norm: normalize(channels, vb.pp("norm"))?,
            q: conv1x1("q")?,
            k: conv1x1("k")?,
            v: conv1x1("v")?,
            proj_out: conv1x1("proj_out")?,
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, c, h, w) = x.dims4()?;

        let h_ = self.norm.forward(x)?;
        // [B, C, H, W] -> [B, 1, HW, C]
        let to_tokens = |t: Tensor| -> Result<Tensor> {
            t.reshape((b, c, h * w))?
                .transpose(1, 2)?
                .unsqueeze(1)?
                .contiguous()
        };
        let q = to_tokens(self.q.forward(&h_)?)?;
        let k = to_tokens(self.k.forward(&h_)?)?;
        let v = to_tokens(self.v.forward(&h_)?)?;

        let out = scaled_dot_product_attention(&q, &k, &v, (c as f64).powf(-0.5))?;
        let out = out
            .squeeze(1)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, c, h, w))?;

        x + self.proj_out.forward(&out)?
    }
}
