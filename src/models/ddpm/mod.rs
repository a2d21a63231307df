//! DDPM U-Net with bottleneck delta editing
//!
//! - **embeddings**: sinusoidal timestep embedding and its projection
//! - **resnet**: residual block, down/upsampling
//! - **attention**: spatial self-attention block
//! - **transformer**: post-norm transformer encoder used by the delta transforms
//! - **delta**: timestep-conditioned delta blocks
//! - **global_delta**: direction-conditioned delta block
//! - **edit**: skip stack, slerp and edit policies
//! - **unet**: the trunk

pub mod attention;
pub mod delta;
pub mod edit;
pub mod embeddings;
pub mod global_delta;
pub mod resnet;
pub mod transformer;
pub mod unet;

pub use attention::AttnBlock;
pub use delta::{DeltaBlock, InnerTransform};
pub use edit::{EditMode, EditRequest, EditedBottleneck, SkipStack, SpatialMask, slerp};
pub use embeddings::{TimestepEmbedding, get_timestep_embedding};
pub use global_delta::GlobalDeltaBlock;
pub use resnet::{Downsample, ResnetBlock, Upsample};
pub use transformer::TransformerEncoder;
pub use unet::{DiffusionUNet, Encoded, UNetOutput};
