//! Timestep embeddings for the diffusion U-Net

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear};

/// Sinusoidal timestep embeddings
///
/// Log-spaced frequencies over `embedding_dim / 2` dimensions, `[sin, cos]` halves,
/// zero-padded by one column when `embedding_dim` is odd. Output is F32 `[B, embedding_dim]`.
pub fn get_timestep_embedding(timesteps: &Tensor, embedding_dim: usize) -> Result<Tensor> {
    if timesteps.rank() != 1 {
        candle_core::bail!(
            "timesteps must be rank 1 (one value per sample), got shape {:?}",
            timesteps.dims()
        );
    }
    let half_dim = embedding_dim / 2;
    if half_dim < 2 {
        candle_core::bail!("embedding_dim must be at least 4, got {embedding_dim}");
    }

    let exponent = Tensor::arange(0u32, half_dim as u32, timesteps.device())?.to_dtype(DType::F32)?;
    let exponent = (exponent * (-f64::ln(10000.0) / (half_dim as f64 - 1.0)))?.exp()?;

    let timesteps = timesteps.to_dtype(DType::F32)?.unsqueeze(1)?;
    let emb = timesteps.broadcast_mul(&exponent.unsqueeze(0)?)?;
    let emb = Tensor::cat(&[emb.sin()?, emb.cos()?], 1)?;

    if embedding_dim % 2 == 1 {
        emb.pad_with_zeros(D::Minus1, 0, 1)
    } else {
        Ok(emb)
    }
}

/// Timestep embedding projection (Linear -> SiLU -> Linear)
#[derive(Debug)]
pub struct TimestepEmbedding {
    dense_0: Linear,
    dense_1: Linear,
    in_channels: usize,
}

impl TimestepEmbedding {
    pub fn new(vb: VarBuilder, in_channels: usize, time_embed_dim: usize) -> Result<Self> {
        let dense_0 = linear(in_channels, time_embed_dim, vb.pp("dense").pp("0"))?;
        let dense_1 = linear(time_embed_dim, time_embed_dim, vb.pp("dense").pp("1"))?;
        Ok(Self {
            dense_0,
            dense_1,
            in_channels,
        })
    }

    /// Integer timesteps `[B]` -> conditioning vector `[B, time_embed_dim]`
    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let emb = get_timestep_embedding(timesteps, self.in_channels)?
            .to_dtype(self.dense_0.weight().dtype())?;
        let emb = self.dense_0.forward(&emb)?;
        let emb = candle_nn::ops::silu(&emb)?;
        self.dense_1.forward(&emb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};

    #[test]
    fn test_timestep_embedding_shape() -> Result<()> {
        let device = Device::Cpu;
        let timesteps = Tensor::new(&[1u32, 10, 100], &device)?;
        let emb = get_timestep_embedding(&timesteps, 64)?;
        assert_eq!(emb.dims(), &[3, 64]);
        Ok(())
    }

    #[test]
    fn test_timestep_embedding_values() -> Result<()> {
        let device = Device::Cpu;
        let timesteps = Tensor::new(&[0u32, 500], &device)?;
        let emb = get_timestep_embedding(&timesteps, 8)?;

        // t = 0 -> sin half is 0, cos half is 1
        let row0 = emb.i(0)?.to_vec1::<f32>()?;
        assert_eq!(&row0[..4], &[0.0, 0.0, 0.0, 0.0]);
        assert_eq!(&row0[4..], &[1.0, 1.0, 1.0, 1.0]);

        // First frequency is always 1, last is 1/10000
        let row1 = emb.i(1)?.to_vec1::<f32>()?;
        assert!((row1[0] - 500f32.sin()).abs() < 1e-4);
        assert!((row1[4] - 500f32.cos()).abs() < 1e-4);
        assert!((row1[3] - 0.05f32.sin()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_timestep_embedding_odd_dim_zero_pads() -> Result<()> {
        let device = Device::Cpu;
        let timesteps = Tensor::new(&[7u32, 300], &device)?;
        let emb = get_timestep_embedding(&timesteps, 9)?;
        assert_eq!(emb.dims(), &[2, 9]);
        let last = emb.i((.., 8))?.to_vec1::<f32>()?;
        assert_eq!(last, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_timestep_embedding_rejects_rank_2() -> Result<()> {
        let device = Device::Cpu;
        let timesteps = Tensor::new(&[[1u32], [2]], &device)?;
        assert!(get_timestep_embedding(&timesteps, 16).is_err());
        Ok(())
    }
}
