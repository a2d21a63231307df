//! Candle-Asyrp: a DDPM U-Net with Asyrp/DiffStyle bottleneck editing for Candle.
//!
//! The trunk is built once from a [`UNetConfig`](config::UNetConfig); delta layers are added
//! with a separate setup call and selected per forward call through an
//! [`EditRequest`](models::ddpm::EditRequest).

pub mod common;
pub mod config;
pub mod models;
pub mod utils;

pub use config::{
    Activation, ConfigError, DeltaLayerConfig, DeltaLayerType, EmbeddingFusion,
    GlobalDeltaConfig, TransformerOrder, UNetConfig,
};
pub use models::ddpm::{
    DiffusionUNet, EditMode, EditRequest, Encoded, SkipStack, SpatialMask, UNetOutput,
    get_timestep_embedding, slerp,
};
