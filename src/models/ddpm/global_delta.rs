//! Direction-conditioned delta block
//!
//! The external direction vector is injected twice: as a per-channel bias next to the
//! timestep embedding, and as a full `[C, H, W]` map after the first 1x1 convolution.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder, conv2d, linear};

use super::resnet::normalize;
use crate::config::GlobalDeltaConfig;

#[derive(Debug)]
pub struct GlobalDeltaBlock {
    conv1: Conv2d,
    temb_proj: Linear,
    clip_proj: Linear,
    clip_proj_2: Linear,
    norm2: GroupNorm,
    conv2: Conv2d,
    norm3: GroupNorm,
    conv3: Conv2d,
    norm4: GroupNorm,
    conv4: Conv2d,
    channels: usize,
    size: usize,
    clip_channels: usize,
    span: tracing::Span,
}

impl GlobalDeltaBlock {
    pub fn new(
        vb: VarBuilder,
        config: &GlobalDeltaConfig,
        channels: usize,
        size: usize,
        temb_channels: usize,
    ) -> Result<Self> {
        let conv1x1 = |name: &str| conv2d(channels, channels, 1, Default::default(), vb.pp(name));
        let clip_channels = config.clip_channels;
        Ok(Self {
            conv1: conv2d(
                channels,
                channels,
                3,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
                vb.pp("conv1"),
            )?,
            temb_proj: linear(temb_channels, channels, vb.pp("temb_proj"))?,
            clip_proj: linear(clip_channels, channels, vb.pp("clip_proj"))?,
            clip_proj_2: linear(clip_channels, channels * size * size, vb.pp("clip_proj_2"))?,
            norm2: normalize(channels, vb.pp("norm2"))?,
            conv2: conv1x1("conv2")?,
            norm3: normalize(channels, vb.pp("norm3"))?,
            conv3: conv1x1("conv3")?,
            norm4: normalize(channels, vb.pp("norm4"))?,
            conv4: conv1x1("conv4")?,
            channels,
            size,
            clip_channels,
            span: tracing::span!(tracing::Level::TRACE, "global-delta"),
        })
    }

    pub fn clip_channels(&self) -> usize {
        self.clip_channels
    }

    /// `x: [B, C, H, W]`, `temb: [B, T]`, `direction: [1 | B, clip_channels]`
    pub fn forward(&self, x: &Tensor, temb: &Tensor, direction: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (dir_batch, dir_channels) = direction.dims2()?;
        if dir_channels != self.clip_channels {
            candle_core::bail!(
                "direction width {dir_channels} does not match clip_channels {}",
                self.clip_channels
            );
        }

        let temb = self.temb_proj.forward(&candle_nn::ops::silu(temb)?)?;
        let clip = self.clip_proj.forward(direction)?;

        let mut h = self.conv1.forward(x)?;
        h = h
            .broadcast_add(&temb.unsqueeze(2)?.unsqueeze(3)?)?
            .broadcast_add(&clip.unsqueeze(2)?.unsqueeze(3)?)?;
        h = self.conv2.forward(&candle_nn::ops::silu(&self.norm2.forward(&h)?)?)?;

        let clip_map = self.clip_proj_2.forward(direction)?.reshape((
            dir_batch,
            self.channels,
            self.size,
            self.size,
        ))?;
        h = h.broadcast_add(&clip_map)?;

        h = self.conv3.forward(&candle_nn::ops::silu(&self.norm3.forward(&h)?)?)?;
        self.conv4.forward(&candle_nn::ops::silu(&self.norm4.forward(&h)?)?)
    }
}
