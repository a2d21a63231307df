//! Scaled dot-product attention shared by the spatial attention block and the
//! delta-layer transformer encoders.

use candle_core::{DType, Result, Tensor};

/// Basic scaled dot-product attention
///
/// # Arguments
/// * `q` - Query tensor (B, n_heads, seq_len, head_dim)
/// * `k` - Key tensor (B, n_heads, seq_len, head_dim)
/// * `v` - Value tensor (B, n_heads, seq_len, head_dim)
/// * `scale` - Attention scale factor (typically 1/sqrt(head_dim))
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
) -> Result<Tensor> {
    let attn_weights = (q.matmul(&k.t()?)? * scale)?;

    // Softmax in F32 for stability
    let attn_probs = candle_nn::ops::softmax_last_dim(&attn_weights.to_dtype(DType::F32)?)?;
    attn_probs.to_dtype(v.dtype())?.matmul(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_attention_basic() -> Result<()> {
        let device = Device::Cpu;
        let batch = 2;
        let heads = 4;
        let seq_len = 8;
        let head_dim = 32;

        let q = Tensor::randn(0f32, 1.0, (batch, heads, seq_len, head_dim), &device)?;
        let k = Tensor::randn(0f32, 1.0, (batch, heads, seq_len, head_dim), &device)?;
        let v = Tensor::randn(0f32, 1.0, (batch, heads, seq_len, head_dim), &device)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let output = scaled_dot_product_attention(&q, &k, &v, scale)?;

        assert_eq!(output.dims(), &[batch, heads, seq_len, head_dim]);
        Ok(())
    }

    #[test]
    fn test_attention_uniform_keys_average_values() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 1, 4, 8), &device)?;
        let k = Tensor::zeros((1, 1, 4, 8), DType::F32, &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 1, 4, 8), &device)?;

        // Equal logits -> every query gets the mean of the values
        let output = scaled_dot_product_attention(&q, &k, &v, 1.0)?;
        let expected = v.mean_keepdim(2)?.broadcast_as((1, 1, 4, 8))?;
        let diff = (output - expected)?.abs()?.flatten_all()?.max(0)?;
        assert!(diff.to_scalar::<f32>()? < 1e-5);
        Ok(())
    }
}
