//! Configuration structures for the diffusion U-Net and its delta layers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of groups used by every group normalisation in the trunk.
pub const NORM_GROUPS: usize = 32;

/// U-Net trunk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UNetConfig {
    /// Base channel count (also the sinusoidal embedding width)
    pub ch: usize,
    /// Output channels
    pub out_ch: usize,
    /// Channel multiplier per resolution level
    pub ch_mult: Vec<usize>,
    /// Residual blocks per level on the encoder side (decoder uses one more)
    pub num_res_blocks: usize,
    /// Spatial resolutions at which attention blocks are inserted
    #[serde(default)]
    pub attn_resolutions: Vec<usize>,
    /// Dropout probability inside residual blocks
    #[serde(default)]
    pub dropout: f64,
    /// Input channels (usually 3 for RGB)
    pub in_channels: usize,
    /// Input height and width
    pub resolution: usize,
    /// Learned convolution for down/upsampling instead of pooling/nearest
    #[serde(default = "default_resamp_with_conv")]
    pub resamp_with_conv: bool,
}

fn default_resamp_with_conv() -> bool {
    true
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            ch: 128,
            out_ch: 3,
            ch_mult: vec![1, 1, 2, 2, 4, 4],
            num_res_blocks: 2,
            attn_resolutions: vec![16],
            dropout: 0.0,
            in_channels: 3,
            resolution: 256,
            resamp_with_conv: true,
        }
    }
}

impl UNetConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_ch(mut self, ch: usize) -> Self {
        self.ch = ch;
        self
    }

    pub fn with_ch_mult(mut self, ch_mult: Vec<usize>) -> Self {
        self.ch_mult = ch_mult;
        self
    }

    pub fn with_num_res_blocks(mut self, num_res_blocks: usize) -> Self {
        self.num_res_blocks = num_res_blocks;
        self
    }

    pub fn with_attn_resolutions(mut self, attn_resolutions: Vec<usize>) -> Self {
        self.attn_resolutions = attn_resolutions;
        self
    }

    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_resamp_with_conv(mut self, resamp_with_conv: bool) -> Self {
        self.resamp_with_conv = resamp_with_conv;
        self
    }

    pub fn num_resolutions(&self) -> usize {
        self.ch_mult.len()
    }

    /// Time embedding width fed to every residual block
    pub fn temb_channels(&self) -> usize {
        self.ch * 4
    }

    /// Channel count of the bottleneck feature map
    pub fn bottleneck_channels(&self) -> usize {
        self.ch * self.ch_mult.last().copied().unwrap_or(1)
    }

    /// Height/width of the bottleneck feature map
    pub fn bottleneck_size(&self) -> usize {
        u32::try_from(self.num_resolutions().saturating_sub(1))
            .ok()
            .and_then(|shift| self.resolution.checked_shr(shift))
            .unwrap_or(0)
    }

    /// Number of feature maps the encoder pushes on the skip stack
    pub fn num_skip_connections(&self) -> usize {
        let levels = self.num_resolutions();
        1 + levels * self.num_res_blocks + levels.saturating_sub(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ch_mult.is_empty() {
            return Err(ConfigError::EmptyChannelMultipliers);
        }
        if self.num_res_blocks == 0 {
            return Err(ConfigError::NoResidualBlocks);
        }
        if self.ch < 4 {
            return Err(ConfigError::EmbeddingTooNarrow(self.ch));
        }
        let levels = self.num_resolutions();
        let factor = u32::try_from(levels - 1)
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift));
        #[allow(clippy::manual_is_multiple_of)]
        if self.resolution == 0 || factor.is_none_or(|factor| self.resolution % factor != 0) {
            return Err(ConfigError::InvalidResolution {
                resolution: self.resolution,
                levels,
            });
        }
        for &mult in std::iter::once(&1).chain(self.ch_mult.iter()) {
            let channels = self.ch * mult;
            #[allow(clippy::manual_is_multiple_of)]
            if channels == 0 || channels % NORM_GROUPS != 0 {
                return Err(ConfigError::InvalidGroupChannels(channels));
            }
        }
        Ok(())
    }
}

/// Ordering of the two passes of a dual-axis transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformerOrder {
    /// Pixel axis first, then channel axis
    PixelChannel,
    /// Channel axis first, then pixel axis
    ChannelPixel,
}

impl FromStr for TransformerOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pc" => Ok(Self::PixelChannel),
            "cp" => Ok(Self::ChannelPixel),
            other => Err(ConfigError::UnsupportedOrder(other.to_string())),
        }
    }
}

impl fmt::Display for TransformerOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PixelChannel => write!(f, "pc"),
            Self::ChannelPixel => write!(f, "cp"),
        }
    }
}

/// Inner transform used by a delta block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeltaLayerType {
    /// 1x1 convolution over the bottleneck
    Conv,
    /// Transformer encoder over pixel positions (features = channels)
    PixelTransformer,
    /// Transformer encoder over channels (features = pixels)
    ChannelTransformer,
    /// Both transformers in sequence
    DualTransformer(TransformerOrder),
}

impl FromStr for DeltaLayerType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conv" => Ok(Self::Conv),
            "p_transformer_simple" => Ok(Self::PixelTransformer),
            "c_transformer_simple" => Ok(Self::ChannelTransformer),
            other => match other.strip_suffix("_transformer_simple") {
                Some(order @ ("pc" | "cp")) => Ok(Self::DualTransformer(order.parse()?)),
                _ => Err(ConfigError::UnsupportedLayerType(other.to_string())),
            },
        }
    }
}

impl fmt::Display for DeltaLayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv => write!(f, "conv"),
            Self::PixelTransformer => write!(f, "p_transformer_simple"),
            Self::ChannelTransformer => write!(f, "c_transformer_simple"),
            Self::DualTransformer(order) => write!(f, "{order}_transformer_simple"),
        }
    }
}

/// How the timestep embedding is fused between the two inner-transform passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EmbeddingFusion {
    Add,
    Mult,
    AdaGn,
}

impl FromStr for EmbeddingFusion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "mult" => Ok(Self::Mult),
            "adagn" => Ok(Self::AdaGn),
            other => Err(ConfigError::UnsupportedFusion(other.to_string())),
        }
    }
}

impl fmt::Display for EmbeddingFusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Mult => write!(f, "mult"),
            Self::AdaGn => write!(f, "adagn"),
        }
    }
}

/// Nonlinearity applied after the embedding fusion in a delta block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Silu,
    Relu,
    Gelu,
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "silu" => Ok(Self::Silu),
            "relu" => Ok(Self::Relu),
            "gelu" => Ok(Self::Gelu),
            other => Err(ConfigError::UnsupportedActivation(other.to_string())),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silu => write!(f, "silu"),
            Self::Relu => write!(f, "relu"),
            Self::Gelu => write!(f, "gelu"),
        }
    }
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = ConfigError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }

            impl From<$ty> for String {
                fn from(value: $ty) -> Self {
                    value.to_string()
                }
            }
        )*
    };
}

string_conversions!(DeltaLayerType, EmbeddingFusion, Activation);

/// Delta layer configuration, shared by every layer created in one setup call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaLayerConfig {
    pub layer_type: DeltaLayerType,
    #[serde(default = "default_nheads")]
    pub nheads: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_dim_feedforward")]
    pub dim_feedforward: usize,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default = "default_emb_type")]
    pub emb_type: EmbeddingFusion,
    /// Replace the whole block with a pretrained cross-attention mid-block
    #[serde(default)]
    pub use_midblock: bool,
    #[serde(default = "default_nonlinearity")]
    pub nonlinearity: Activation,
}

fn default_nheads() -> usize {
    1
}

fn default_num_layers() -> usize {
    1
}

fn default_dim_feedforward() -> usize {
    2048
}

fn default_emb_type() -> EmbeddingFusion {
    EmbeddingFusion::Add
}

fn default_nonlinearity() -> Activation {
    Activation::Silu
}

impl Default for DeltaLayerConfig {
    fn default() -> Self {
        Self {
            layer_type: DeltaLayerType::Conv,
            nheads: default_nheads(),
            num_layers: default_num_layers(),
            dim_feedforward: default_dim_feedforward(),
            dropout: 0.0,
            emb_type: default_emb_type(),
            use_midblock: false,
            nonlinearity: default_nonlinearity(),
        }
    }
}

impl DeltaLayerConfig {
    pub fn new(layer_type: DeltaLayerType) -> Self {
        Self {
            layer_type,
            ..Default::default()
        }
    }

    pub fn with_heads(mut self, nheads: usize) -> Self {
        self.nheads = nheads;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_dim_feedforward(mut self, dim_feedforward: usize) -> Self {
        self.dim_feedforward = dim_feedforward;
        self
    }

    pub fn with_emb_type(mut self, emb_type: EmbeddingFusion) -> Self {
        self.emb_type = emb_type;
        self
    }

    pub fn with_midblock(mut self, use_midblock: bool) -> Self {
        self.use_midblock = use_midblock;
        self
    }

    pub fn with_nonlinearity(mut self, nonlinearity: Activation) -> Self {
        self.nonlinearity = nonlinearity;
        self
    }

    /// Check the head count against the bottleneck geometry
    pub fn validate(&self, channels: usize, size: usize) -> Result<(), ConfigError> {
        if self.use_midblock {
            return Ok(());
        }
        let widths: &[usize] = match self.layer_type {
            DeltaLayerType::Conv => &[],
            DeltaLayerType::PixelTransformer => &[channels],
            DeltaLayerType::ChannelTransformer => &[size * size],
            DeltaLayerType::DualTransformer(_) => &[channels, size * size],
        };
        for &width in widths {
            #[allow(clippy::manual_is_multiple_of)]
            if self.nheads == 0 || width % self.nheads != 0 {
                return Err(ConfigError::InvalidHeads {
                    nheads: self.nheads,
                    width,
                });
            }
        }
        Ok(())
    }
}

/// Global (direction-conditioned) delta layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDeltaConfig {
    /// Width of the external semantic direction vector
    #[serde(default = "default_clip_channels")]
    pub clip_channels: usize,
}

fn default_clip_channels() -> usize {
    512
}

impl Default for GlobalDeltaConfig {
    fn default() -> Self {
        Self {
            clip_channels: default_clip_channels(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported delta layer type: {0}")]
    UnsupportedLayerType(String),
    #[error("Unsupported embedding fusion: {0}")]
    UnsupportedFusion(String),
    #[error("Unsupported transformer order: {0}. Must be 'pc' or 'cp'")]
    UnsupportedOrder(String),
    #[error("Unsupported nonlinearity: {0}")]
    UnsupportedActivation(String),
    #[error("Channel multiplier schedule is empty")]
    EmptyChannelMultipliers,
    #[error("At least one residual block per level is required")]
    NoResidualBlocks,
    #[error("Base channel count {0} is too small for the timestep embedding")]
    EmbeddingTooNarrow(usize),
    #[error("Resolution {resolution} cannot be halved evenly across {levels} levels")]
    InvalidResolution { resolution: usize, levels: usize },
    #[error("Channel count {0} is not divisible by the normalisation group count")]
    InvalidGroupChannels(usize),
    #[error("Head count {nheads} does not divide feature width {width}")]
    InvalidHeads { nheads: usize, width: usize },
    #[error("Delta layers are already set up on this model")]
    DeltaLayersExist,
    #[error("Failed to parse JSON config")]
    Json(#[source] serde_json::Error),
}
