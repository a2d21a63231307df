//! Residual and resampling blocks for the DDPM U-Net

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, GroupNorm, Linear, VarBuilder, conv2d};

use crate::config::NORM_GROUPS;

/// GroupNorm(32, eps=1e-6) with affine parameters, used throughout the trunk
pub fn normalize(channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(NORM_GROUPS, channels, 1e-6, vb)
}

fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(
        in_channels,
        out_channels,
        3,
        Conv2dConfig {
            padding: 1,
            ..Default::default()
        },
        vb,
    )
}

/// Residual block with timestep conditioning
///
/// norm -> silu -> conv -> + proj(silu(temb)) -> norm -> silu -> dropout -> conv, added to
/// the input (projected on the shortcut path when the channel counts differ).
#[derive(Debug)]
pub struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    temb_proj: Linear,
    norm2: GroupNorm,
    dropout: Dropout,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
    span: tracing::Span,
}

impl ResnetBlock {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        temb_channels: usize,
        dropout: f64,
        conv_shortcut: bool,
    ) -> Result<Self> {
        let norm1 = normalize(in_channels, vb.pp("norm1"))?;
        let conv1 = conv3x3(in_channels, out_channels, vb.pp("conv1"))?;
        let temb_proj = candle_nn::linear(temb_channels, out_channels, vb.pp("temb_proj"))?;
        let norm2 = normalize(out_channels, vb.pp("norm2"))?;
        let conv2 = conv3x3(out_channels, out_channels, vb.pp("conv2"))?;

        let shortcut = if in_channels == out_channels {
            None
        } else if conv_shortcut {
            Some(conv3x3(in_channels, out_channels, vb.pp("conv_shortcut"))?)
        } else {
            Some(conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("nin_shortcut"),
            )?)
        };

        Ok(Self {
            norm1,
            conv1,
            temb_proj,
            norm2,
            dropout: Dropout::new(dropout as f32),
            conv2,
            shortcut,
            span: tracing::span!(tracing::Level::TRACE, "resnet"),
        })
    }

    /// Inference forward pass (dropout disabled)
    pub fn forward(&self, x: &Tensor, temb: &Tensor) -> Result<Tensor> {
        self.forward_t(x, temb, false)
    }

    pub fn forward_t(&self, x: &Tensor, temb: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();

        let mut h = self.norm1.forward(x)?;
        h = candle_nn::ops::silu(&h)?;
        h = self.conv1.forward(&h)?;

        // temb: [B, T] -> [B, C, 1, 1]
        let temb = self.temb_proj.forward(&candle_nn::ops::silu(temb)?)?;
        h = h.broadcast_add(&temb.unsqueeze(2)?.unsqueeze(3)?)?;

        h = self.norm2.forward(&h)?;
        h = candle_nn::ops::silu(&h)?;
        h = self.dropout.forward_t(&h, train)?;
        h = self.conv2.forward(&h)?;

        let residual = match &self.shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        residual + h
    }
}

/// Halves the spatial resolution
#[derive(Debug)]
pub struct Downsample {
    conv: Option<Conv2d>,
}

impl Downsample {
    pub fn new(vb: VarBuilder, channels: usize, with_conv: bool) -> Result<Self> {
        let conv = if with_conv {
            Some(conv2d(
                channels,
                channels,
                3,
                Conv2dConfig {
                    stride: 2,
                    ..Default::default()
                },
                vb.pp("conv"),
            )?)
        } else {
            None
        };
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.conv {
            Some(conv) => {
                // Asymmetric padding: one column right, one row bottom
                let x = x.pad_with_zeros(3, 0, 1)?.pad_with_zeros(2, 0, 1)?;
                conv.forward(&x)
            }
            None => x.avg_pool2d(2),
        }
    }
}

/// Doubles the spatial resolution (nearest neighbour, optional 3x3 conv)
#[derive(Debug)]
pub struct Upsample {
    conv: Option<Conv2d>,
}

impl Upsample {
    pub fn new(vb: VarBuilder, channels: usize, with_conv: bool) -> Result<Self> {
        let conv = if with_conv {
            Some(conv3x3(channels, channels, vb.pp("conv"))?)
        } else {
            None
        };
        Ok(Self { conv })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(h * 2, w * 2)?;
        match &self.conv {
            Some(conv) => conv.forward(&x),
            None => Ok(x),
        }
    }
}
