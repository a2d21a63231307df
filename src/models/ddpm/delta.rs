//! Delta blocks: learned perturbations of the bottleneck feature map
//!
//! A delta block runs an inner transform, fuses the timestep embedding, and runs a second
//! inner transform. The inner transform and the fusion mode are chosen independently so the
//! same trunk can be edited by different mechanisms.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, GroupNorm, Linear, VarBuilder, conv2d, linear};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
};

use super::resnet::normalize;
use super::transformer::TransformerEncoder;
use crate::common::AdaGroupNorm;
use crate::config::{
    Activation, DeltaLayerConfig, DeltaLayerType, EmbeddingFusion, NORM_GROUPS, TransformerOrder,
};

/// Feature-to-feature transform over the bottleneck `[B, C, H, W]`
#[derive(Debug)]
pub enum InnerTransform {
    Conv(Conv2d),
    /// Tokens are pixels, features are channels
    Pixel(TransformerEncoder),
    /// Tokens are channels, features are pixels
    Channel(TransformerEncoder),
    Dual {
        pixel: TransformerEncoder,
        channel: TransformerEncoder,
        order: TransformerOrder,
    },
}

impl InnerTransform {
    pub fn new(
        vb: VarBuilder,
        config: &DeltaLayerConfig,
        channels: usize,
        size: usize,
    ) -> Result<Self> {
        let encoder = |vb: VarBuilder, d_model: usize| {
            TransformerEncoder::new(
                vb,
                d_model,
                config.nheads,
                config.num_layers,
                config.dim_feedforward,
                config.dropout,
            )
        };
        let pixels = size * size;
        Ok(match config.layer_type {
            DeltaLayerType::Conv => Self::Conv(conv2d(channels, channels, 1, Default::default(), vb)?),
            DeltaLayerType::PixelTransformer => Self::Pixel(encoder(vb.pp("t_layer"), channels)?),
            DeltaLayerType::ChannelTransformer => Self::Channel(encoder(vb.pp("t_layer"), pixels)?),
            DeltaLayerType::DualTransformer(order) => Self::Dual {
                pixel: encoder(vb.pp("t_pixel"), channels)?,
                channel: encoder(vb.pp("t_channel"), pixels)?,
                order,
            },
        })
    }
}

/// `[B, C, HW]` through a pixel-axis transformer
fn pixel_pass(encoder: &TransformerEncoder, h: &Tensor) -> Result<Tensor> {
    encoder
        .forward(&h.transpose(1, 2)?.contiguous()?)?
        .transpose(1, 2)?
        .contiguous()
}

impl Module for InnerTransform {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, hh, ww) = x.dims4()?;
        let h = x.reshape((b, c, hh * ww))?;
        let h = match self {
            Self::Conv(conv) => return conv.forward(x),
            Self::Pixel(encoder) => pixel_pass(encoder, &h)?,
            Self::Channel(encoder) => encoder.forward(&h)?,
            Self::Dual {
                pixel,
                channel,
                order: TransformerOrder::PixelChannel,
            } => channel.forward(&pixel_pass(pixel, &h)?)?,
            Self::Dual {
                pixel,
                channel,
                order: TransformerOrder::ChannelPixel,
            } => pixel_pass(pixel, &channel.forward(&h)?)?,
        };
        h.reshape((b, c, hh, ww))
    }
}

/// Timestep fusion between the two inner-transform passes
#[derive(Debug)]
enum Fusion {
    Add { temb_proj: Linear, norm: GroupNorm },
    Mult { temb_proj: Linear, norm: GroupNorm },
    AdaGn(AdaGroupNorm),
}

#[derive(Debug)]
enum DeltaBackbone {
    Layers {
        in_layer: InnerTransform,
        fusion: Fusion,
        out_layer: InnerTransform,
        nonlinearity: Activation,
    },
    MidBlock(UNetMidBlock2DCrossAttn),
}

/// Bottleneck editing block producing a delta with the shape of its input
#[derive(Debug)]
pub struct DeltaBlock {
    backbone: DeltaBackbone,
    span: tracing::Span,
}

impl DeltaBlock {
    pub fn new(
        vb: VarBuilder,
        config: &DeltaLayerConfig,
        channels: usize,
        size: usize,
        temb_channels: usize,
    ) -> Result<Self> {
        config
            .validate(channels, size)
            .map_err(candle_core::Error::wrap)?;

        let backbone = if config.use_midblock {
            let mid_config = UNetMidBlock2DCrossAttnConfig {
                cross_attn_dim: channels,
                attn_num_head_channels: 1,
                ..Default::default()
            };
            DeltaBackbone::MidBlock(UNetMidBlock2DCrossAttn::new(
                vb.pp("model"),
                channels,
                Some(temb_channels),
                false,
                mid_config,
            )?)
        } else {
            let in_layer = InnerTransform::new(vb.pp("in_layer"), config, channels, size)?;
            let fusion = match config.emb_type {
                EmbeddingFusion::Add => Fusion::Add {
                    temb_proj: linear(temb_channels, channels, vb.pp("temb_proj"))?,
                    norm: normalize(channels, vb.pp("norm2"))?,
                },
                EmbeddingFusion::Mult => Fusion::Mult {
                    temb_proj: linear(temb_channels, channels, vb.pp("temb_proj"))?,
                    norm: normalize(channels, vb.pp("norm2"))?,
                },
                EmbeddingFusion::AdaGn => Fusion::AdaGn(AdaGroupNorm::new(
                    vb.pp("adagn"),
                    temb_channels,
                    channels,
                    NORM_GROUPS,
                    None,
                )?),
            };
            let out_layer = InnerTransform::new(vb.pp("out_layer"), config, channels, size)?;
            DeltaBackbone::Layers {
                in_layer,
                fusion,
                out_layer,
                nonlinearity: config.nonlinearity,
            }
        };

        Ok(Self {
            backbone,
            span: tracing::span!(tracing::Level::TRACE, "delta"),
        })
    }

    /// Compute the delta for bottleneck `x`
    ///
    /// Without `temb` the embedding fusion is skipped and the delta is timestep independent.
    pub fn forward(&self, x: &Tensor, temb: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        match &self.backbone {
            DeltaBackbone::MidBlock(model) => model.forward(x, temb, None),
            DeltaBackbone::Layers {
                in_layer,
                fusion,
                out_layer,
                nonlinearity,
            } => {
                let mut h = in_layer.forward(x)?;
                if let Some(temb) = temb {
                    h = match fusion {
                        Fusion::Add { temb_proj, norm } => {
                            let emb = project(temb_proj, temb)?;
                            norm.forward(&h.broadcast_add(&emb)?)?
                        }
                        Fusion::Mult { temb_proj, norm } => {
                            let emb = project(temb_proj, temb)?;
                            norm.forward(&h.broadcast_mul(&emb)?)?
                        }
                        Fusion::AdaGn(adagn) => adagn.forward(&h, temb)?,
                    };
                    h = nonlinearity.forward(&h)?;
                }
                out_layer.forward(&h)
            }
        }
    }
}

/// silu(temb) -> linear -> [B, C, 1, 1]
fn project(temb_proj: &Linear, temb: &Tensor) -> Result<Tensor> {
    temb_proj
        .forward(&candle_nn::ops::silu(temb)?)?
        .unsqueeze(2)?
        .unsqueeze(3)
}
