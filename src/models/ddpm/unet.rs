//! DDPM U-Net trunk with bottleneck delta editing
//!
//! The encoder pushes every intermediate feature map on a [`SkipStack`]; the decoder pops
//! them in reverse, concatenating each onto the running feature map before a residual block.
//! An optional edit branch derives a second bottleneck from the canonical one and decodes it
//! against its own copy of the stack.

use candle_core::{DType, IndexOp, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder, conv2d};
use tracing::{debug, info};

use super::attention::AttnBlock;
use super::delta::DeltaBlock;
use super::edit::{EditMode, EditRequest, EditedBottleneck, SkipStack, sample_norm, slerp};
use super::embeddings::TimestepEmbedding;
use super::global_delta::GlobalDeltaBlock;
use super::resnet::{Downsample, ResnetBlock, Upsample, normalize};
use crate::config::{ConfigError, DeltaLayerConfig, GlobalDeltaConfig, UNetConfig};

#[derive(Debug)]
struct DownLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    downsample: Option<Downsample>,
}

#[derive(Debug)]
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Upsample>,
}

#[derive(Debug)]
struct MidBlock {
    block_1: ResnetBlock,
    attn_1: AttnBlock,
    block_2: ResnetBlock,
}

impl MidBlock {
    fn forward(&self, x: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let h = self.block_1.forward(x, temb)?;
        let h = self.attn_1.forward(&h)?;
        self.block_2.forward(&h, temb)
    }
}

/// Editing layers owned by the trunk
#[derive(Debug)]
enum DeltaLayers {
    None,
    Local(Vec<DeltaBlock>),
    Global(GlobalDeltaBlock),
}

/// Encoder output: everything the decoders need
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Conditioning vector `[B, 4 * ch]`
    pub temb: Tensor,
    pub skips: SkipStack,
    /// Canonical bottleneck feature map
    pub middle: Tensor,
}

/// Result of a full forward call
#[derive(Debug, Clone)]
pub struct UNetOutput {
    /// Canonical (unedited) prediction
    pub sample: Tensor,
    /// Prediction decoded from the edited bottleneck, when an edit was requested
    pub edited: Option<Tensor>,
    /// Delta applied to the bottleneck, when the policy produced one
    pub delta: Option<Tensor>,
    /// Unedited bottleneck feature map
    pub middle: Tensor,
}

#[derive(Debug)]
pub struct DiffusionUNet {
    config: UNetConfig,
    temb: TimestepEmbedding,
    conv_in: Conv2d,
    down: Vec<DownLevel>,
    mid: MidBlock,
    /// Indexed by resolution level, decoded from the last level to the first
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    delta_layers: DeltaLayers,
    span: tracing::Span,
}

impl DiffusionUNet {
    pub fn new(vb: VarBuilder, config: &UNetConfig) -> Result<Self> {
        config.validate().map_err(candle_core::Error::wrap)?;

        let ch = config.ch;
        let temb_ch = config.temb_channels();
        let levels = config.num_resolutions();
        let conv3x3 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let temb = TimestepEmbedding::new(vb.pp("temb"), ch, temb_ch)?;
        let conv_in = conv2d(config.in_channels, ch, 3, conv3x3, vb.pp("conv_in"))?;

        // Encoder
        let in_ch_mult: Vec<usize> = std::iter::once(1).chain(config.ch_mult.iter().copied()).collect();
        let mut curr_res = config.resolution;
        let mut block_in = ch;
        let mut down = Vec::with_capacity(levels);
        for level in 0..levels {
            let vb_level = vb.pp("down").pp(level);
            block_in = ch * in_ch_mult[level];
            let block_out = ch * config.ch_mult[level];
            let mut blocks = Vec::with_capacity(config.num_res_blocks);
            let mut attns = Vec::new();
            for i in 0..config.num_res_blocks {
                blocks.push(ResnetBlock::new(
                    vb_level.pp("block").pp(i),
                    block_in,
                    block_out,
                    temb_ch,
                    config.dropout,
                    false,
                )?);
                block_in = block_out;
                if config.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(vb_level.pp("attn").pp(i), block_in)?);
                }
            }
            let downsample = if level != levels - 1 {
                curr_res /= 2;
                Some(Downsample::new(
                    vb_level.pp("downsample"),
                    block_in,
                    config.resamp_with_conv,
                )?)
            } else {
                None
            };
            down.push(DownLevel {
                blocks,
                attns,
                downsample,
            });
        }

        // Bottleneck
        let vb_mid = vb.pp("mid");
        let mid = MidBlock {
            block_1: ResnetBlock::new(vb_mid.pp("block_1"), block_in, block_in, temb_ch, config.dropout, false)?,
            attn_1: AttnBlock::new(vb_mid.pp("attn_1"), block_in)?,
            block_2: ResnetBlock::new(vb_mid.pp("block_2"), block_in, block_in, temb_ch, config.dropout, false)?,
        };

        // Decoder, built from the bottleneck outwards
        let mut up_rev = Vec::with_capacity(levels);
        for level in (0..levels).rev() {
            let vb_level = vb.pp("up").pp(level);
            let block_out = ch * config.ch_mult[level];
            let mut skip_in = ch * config.ch_mult[level];
            let mut blocks = Vec::with_capacity(config.num_res_blocks + 1);
            let mut attns = Vec::new();
            for i in 0..=config.num_res_blocks {
                if i == config.num_res_blocks {
                    skip_in = ch * in_ch_mult[level];
                }
                blocks.push(ResnetBlock::new(
                    vb_level.pp("block").pp(i),
                    block_in + skip_in,
                    block_out,
                    temb_ch,
                    config.dropout,
                    false,
                )?);
                block_in = block_out;
                if config.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(vb_level.pp("attn").pp(i), block_in)?);
                }
            }
            let upsample = if level != 0 {
                curr_res *= 2;
                Some(Upsample::new(
                    vb_level.pp("upsample"),
                    block_in,
                    config.resamp_with_conv,
                )?)
            } else {
                None
            };
            up_rev.push(UpLevel {
                blocks,
                attns,
                upsample,
            });
        }
        up_rev.reverse();

        let norm_out = normalize(block_in, vb.pp("norm_out"))?;
        let conv_out = conv2d(block_in, config.out_ch, 3, conv3x3, vb.pp("conv_out"))?;

        Ok(Self {
            config: config.clone(),
            temb,
            conv_in,
            down,
            mid,
            up: up_rev,
            norm_out,
            conv_out,
            delta_layers: DeltaLayers::None,
            span: tracing::span!(tracing::Level::TRACE, "unet"),
        })
    }

    /// Create `count` delta layers named `layer_0 .. layer_{count-1}`
    pub fn setup_delta_layers(
        &mut self,
        vb: VarBuilder,
        count: usize,
        config: &DeltaLayerConfig,
    ) -> Result<()> {
        if !matches!(self.delta_layers, DeltaLayers::None) {
            return Err(candle_core::Error::wrap(ConfigError::DeltaLayersExist));
        }
        if count == 0 {
            candle_core::bail!("at least one delta layer is required");
        }
        let channels = self.bottleneck_channels();
        let size = self.bottleneck_size();
        let temb_ch = self.config.temb_channels();
        let layers = (0..count)
            .map(|i| DeltaBlock::new(vb.pp(format!("layer_{i}")), config, channels, size, temb_ch))
            .collect::<Result<Vec<_>>>()?;
        info!(
            count,
            layer_type = %config.layer_type,
            emb_type = %config.emb_type,
            use_midblock = config.use_midblock,
            channels,
            size,
            "delta layers created"
        );
        self.delta_layers = DeltaLayers::Local(layers);
        Ok(())
    }

    /// Create the single direction-conditioned delta layer `layer_0`
    pub fn setup_global_layer(&mut self, vb: VarBuilder, config: &GlobalDeltaConfig) -> Result<()> {
        if !matches!(self.delta_layers, DeltaLayers::None) {
            return Err(candle_core::Error::wrap(ConfigError::DeltaLayersExist));
        }
        let channels = self.bottleneck_channels();
        let size = self.bottleneck_size();
        let layer = GlobalDeltaBlock::new(
            vb.pp("layer_0"),
            config,
            channels,
            size,
            self.config.temb_channels(),
        )?;
        info!(
            clip_channels = config.clip_channels,
            channels, size, "global delta layer created"
        );
        self.delta_layers = DeltaLayers::Global(layer);
        Ok(())
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    pub fn bottleneck_channels(&self) -> usize {
        self.config.bottleneck_channels()
    }

    pub fn bottleneck_size(&self) -> usize {
        self.config.bottleneck_size()
    }

    pub fn num_skip_connections(&self) -> usize {
        self.config.num_skip_connections()
    }

    pub fn num_delta_layers(&self) -> usize {
        match &self.delta_layers {
            DeltaLayers::None => 0,
            DeltaLayers::Local(layers) => layers.len(),
            DeltaLayers::Global(_) => 1,
        }
    }

    pub fn delta_layer(&self, index: usize) -> Option<&DeltaBlock> {
        match &self.delta_layers {
            DeltaLayers::Local(layers) => layers.get(index),
            _ => None,
        }
    }

    pub fn global_layer(&self) -> Option<&GlobalDeltaBlock> {
        match &self.delta_layers {
            DeltaLayers::Global(layer) => Some(layer),
            _ => None,
        }
    }

    fn local_layers(&self, mode: &EditMode) -> Result<&[DeltaBlock]> {
        match &self.delta_layers {
            DeltaLayers::Local(layers) => Ok(layers),
            _ => candle_core::bail!(
                "{} edit requires delta layers, call setup_delta_layers first",
                mode.name()
            ),
        }
    }

    /// Conditioning vector for integer timesteps `[B]`
    pub fn time_embedding(&self, timesteps: &Tensor) -> Result<Tensor> {
        self.temb.forward(timesteps)
    }

    /// Run the encoder and the bottleneck
    pub fn encode(&self, x: &Tensor, timesteps: &Tensor) -> Result<Encoded> {
        let _enter = self.span.enter();
        let (b, c, h, w) = x.dims4()?;
        if h != self.config.resolution || w != self.config.resolution {
            candle_core::bail!(
                "input is {h}x{w}, model resolution is {}",
                self.config.resolution
            );
        }
        if c != self.config.in_channels {
            candle_core::bail!(
                "input has {c} channels, model expects {}",
                self.config.in_channels
            );
        }
        let t_batch = timesteps.dims1()?;
        if t_batch != b {
            candle_core::bail!("got {t_batch} timesteps for a batch of {b}");
        }

        let temb = self.time_embedding(timesteps)?.to_dtype(x.dtype())?;

        let mut skips = SkipStack::new();
        skips.push(self.conv_in.forward(x)?);
        for (level, down) in self.down.iter().enumerate() {
            for (i, block) in down.blocks.iter().enumerate() {
                let mut h = block.forward(skips.last()?, &temb)?;
                if let Some(attn) = down.attns.get(i) {
                    h = attn.forward(&h)?;
                }
                skips.push(h);
            }
            if let Some(downsample) = &down.downsample {
                let h = downsample.forward(skips.last()?)?;
                skips.push(h);
            }
            let top = skips.last()?;
            debug!(level, shape = ?top.dims(), "encoder level");
        }

        let middle = self.mid.forward(skips.last()?, &temb)?;
        debug!(shape = ?middle.dims(), skips = skips.len(), "bottleneck");
        Ok(Encoded {
            temb,
            skips,
            middle,
        })
    }

    /// Decode `h` against `skips`, which must be drained exactly
    pub fn decode(&self, h: &Tensor, skips: &mut SkipStack, temb: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut h = h.clone();
        for (level, up) in self.up.iter().enumerate().rev() {
            for (i, block) in up.blocks.iter().enumerate() {
                let skip = skips.pop()?;
                h = block.forward(&Tensor::cat(&[&h, &skip], 1)?, temb)?;
                if let Some(attn) = up.attns.get(i) {
                    h = attn.forward(&h)?;
                }
            }
            if let Some(upsample) = &up.upsample {
                h = upsample.forward(&h)?;
            }
            debug!(level, shape = ?h.dims(), "decoder level");
        }
        if !skips.is_empty() {
            candle_core::bail!("{} skip connections left after decode", skips.len());
        }

        let h = candle_nn::ops::silu(&self.norm_out.forward(&h)?)?;
        self.conv_out.forward(&h)
    }

    /// Derive the edited bottleneck for `request`
    ///
    /// `timestep` is the gate value; gated policies below `request.t_edit` return `middle`
    /// unchanged. The request is checked against the trunk before gating.
    pub fn edit_bottleneck(
        &self,
        middle: &Tensor,
        temb: &Tensor,
        timestep: f64,
        request: &EditRequest,
    ) -> Result<EditedBottleneck> {
        self.check_edit(middle, &request.mode)?;
        if !request.is_active(timestep) {
            debug!(timestep, t_edit = request.t_edit, mode = request.mode.name(), "edit gated off");
            return Ok(EditedBottleneck {
                h: middle.clone(),
                delta: None,
            });
        }
        debug!(timestep, mode = request.mode.name(), "editing bottleneck");

        match &request.mode {
            EditMode::Asyrp {
                index,
                coeffs,
                ignore_timestep,
            } => {
                let layers = self.local_layers(&request.mode)?;
                let temb = (!ignore_timestep).then_some(temb);
                let mut h = (middle * coeffs[0])?;
                let mut delta = None;
                for (i, layer) in layers.iter().enumerate().take(index + 1) {
                    let d = layer.forward(middle, temb)?;
                    h = (h + (&d * coeffs[i + 1])?)?;
                    delta = Some(d);
                }
                Ok(EditedBottleneck { h, delta })
            }
            EditMode::DirectDelta { delta, coeff, mask } => {
                let fraction = 1.0 - coeff;
                let h = match mask {
                    None => {
                        let matched = delta
                            .broadcast_div(&sample_norm(delta)?)?
                            .broadcast_mul(&sample_norm(middle)?)?;
                        slerp(fraction, middle, &matched)?
                    }
                    Some(mask) => {
                        let (_, _, hh, ww) = middle.dims4()?;
                        let m = mask.to_tensor(hh, ww, middle.dtype(), middle.device())?;
                        let inside = slerp(
                            fraction,
                            &middle.broadcast_mul(&m)?,
                            &delta.broadcast_mul(&m)?,
                        )?;
                        let outside = middle.broadcast_mul(&m.affine(-1.0, 1.0)?)?;
                        (inside.broadcast_mul(&m)? + outside)?
                    }
                };
                Ok(EditedBottleneck {
                    h,
                    delta: Some(delta.clone()),
                })
            }
            EditMode::MultiAttribute { count, weights } => {
                let layers = self.local_layers(&request.mode)?;
                let mut sum = middle.zeros_like()?;
                for (layer, &weight) in layers.iter().zip(weights).take(*count) {
                    sum = (sum + (layer.forward(middle, Some(temb))? * weight)?)?;
                }
                let delta = (sum / (*count as f64).sqrt())?;
                Ok(EditedBottleneck {
                    h: (middle + &delta)?,
                    delta: Some(delta),
                })
            }
            EditMode::BatchInterpolation { alpha } => {
                let b = middle.dim(0)?;
                let alpha = alpha.to_dtype(middle.dtype())?.reshape((b, 1, 1, 1))?;
                let first = middle.i(0..1)?;
                let last = middle.i(b - 1..b)?;
                let h = (first.broadcast_mul(&alpha.affine(-1.0, 1.0)?)?
                    + last.broadcast_mul(&alpha)?)?;
                Ok(EditedBottleneck { h, delta: None })
            }
            EditMode::SingleLayer { index } => {
                let layers = self.local_layers(&request.mode)?;
                let delta = layers[*index].forward(middle, Some(temb))?;
                Ok(EditedBottleneck {
                    h: (middle + &delta)?,
                    delta: Some(delta),
                })
            }
            EditMode::Global { direction } => {
                let layer = match &self.delta_layers {
                    DeltaLayers::Global(layer) => layer,
                    _ => candle_core::bail!("global edit requires setup_global_layer"),
                };
                let delta = layer.forward(middle, temb, &direction.to_dtype(middle.dtype())?)?;
                Ok(EditedBottleneck {
                    h: (middle + &delta)?,
                    delta: Some(delta),
                })
            }
        }
    }

    fn check_edit(&self, middle: &Tensor, mode: &EditMode) -> Result<()> {
        let available = self.num_delta_layers();
        match mode {
            EditMode::Asyrp { index, coeffs, .. } => {
                let layers = self.local_layers(mode)?;
                if *index >= layers.len() {
                    candle_core::bail!("edit index {index} out of range for {} delta layers", layers.len());
                }
                if coeffs.len() < index + 2 {
                    candle_core::bail!(
                        "edit index {index} needs {} blend coefficients, got {}",
                        index + 2,
                        coeffs.len()
                    );
                }
            }
            EditMode::DirectDelta { delta, .. } => {
                if delta.dims() != middle.dims() {
                    candle_core::bail!(
                        "supplied delta has shape {:?}, bottleneck is {:?}",
                        delta.dims(),
                        middle.dims()
                    );
                }
            }
            EditMode::MultiAttribute { count, weights } => {
                let layers = self.local_layers(mode)?;
                if *count == 0 || *count > layers.len() {
                    candle_core::bail!("cannot blend {count} of {available} delta layers");
                }
                if weights.len() < *count {
                    candle_core::bail!("blending {count} layers needs {count} weights, got {}", weights.len());
                }
            }
            EditMode::BatchInterpolation { alpha } => {
                let n = alpha.dims1()?;
                let b = middle.dim(0)?;
                if n != b {
                    candle_core::bail!("{n} interpolation coefficients for a batch of {b}");
                }
            }
            EditMode::SingleLayer { index } => {
                let layers = self.local_layers(mode)?;
                if *index >= layers.len() {
                    candle_core::bail!("edit index {index} out of range for {} delta layers", layers.len());
                }
            }
            EditMode::Global { direction } => {
                let Some(layer) = self.global_layer() else {
                    candle_core::bail!("global edit requires setup_global_layer");
                };
                let (_, width) = direction.dims2()?;
                if width != layer.clip_channels() {
                    candle_core::bail!(
                        "direction has width {width}, global layer expects {}",
                        layer.clip_channels()
                    );
                }
            }
        }
        Ok(())
    }

    /// Full forward pass: encode, optionally edit and decode the edited bottleneck, decode
    pub fn forward(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        edit: Option<&EditRequest>,
    ) -> Result<UNetOutput> {
        let Encoded {
            temb,
            mut skips,
            middle,
        } = self.encode(x, timesteps)?;

        let (edited, delta) = match edit {
            Some(request) => {
                let timestep = timesteps.i(0)?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                let EditedBottleneck { h, delta } =
                    self.edit_bottleneck(&middle, &temb, timestep, request)?;
                let mut edit_skips = skips.clone();
                (Some(self.decode(&h, &mut edit_skips, &temb)?), delta)
            }
            None => (None, None),
        };

        let sample = self.decode(&middle, &mut skips, &temb)?;
        Ok(UNetOutput {
            sample,
            edited,
            delta,
            middle,
        })
    }
}
