//! Shared building blocks
//!
//! - **attention**: scaled dot-product attention
//! - **norms**: parameter-free and embedding-modulated group normalization

pub mod attention;
pub mod norms;

pub use attention::scaled_dot_product_attention;
pub use norms::{AdaGroupNorm, GroupNormNoParams};
