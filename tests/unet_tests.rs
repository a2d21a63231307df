//! Tests for the DDPM U-Net trunk
//!
//! Shapes, skip bookkeeping, embeddings and the end-to-end edit scenarios.

use candle_asyrp::utils::deterministic_rng::Pcg32;
use candle_asyrp::{
    DeltaLayerConfig, DeltaLayerType, DiffusionUNet, EditMode, EditRequest, UNetConfig,
    get_timestep_embedding,
};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

// =============================================================================
// Helper functions
// =============================================================================

fn create_test_device() -> Device {
    Device::Cpu
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

/// Two-level trunk: ch_mult [1, 2], one residual block per level, 16x16 RGB input
fn two_level_config() -> UNetConfig {
    UNetConfig::default()
        .with_ch_mult(vec![1, 2])
        .with_num_res_blocks(1)
        .with_resolution(16)
}

fn build(config: &UNetConfig, varmap: &VarMap, device: &Device) -> Result<DiffusionUNet> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    DiffusionUNet::new(vb, config)
}

// =============================================================================
// Shape Tests
// =============================================================================

#[test]
fn test_output_shape_matches_input() -> Result<()> {
    let device = create_test_device();
    let configs = [
        UNetConfig::default()
            .with_ch(32)
            .with_ch_mult(vec![1, 2, 2])
            .with_num_res_blocks(2)
            .with_attn_resolutions(vec![8])
            .with_resolution(16),
        UNetConfig::default()
            .with_ch(32)
            .with_ch_mult(vec![1, 2])
            .with_num_res_blocks(1)
            .with_attn_resolutions(vec![])
            .with_resolution(8)
            .with_resamp_with_conv(false),
        UNetConfig {
            out_ch: 6,
            in_channels: 1,
            ..UNetConfig::default()
                .with_ch(32)
                .with_ch_mult(vec![2])
                .with_num_res_blocks(1)
                .with_resolution(4)
        },
    ];

    let mut rng = Pcg32::new(3, 7);
    for config in &configs {
        let varmap = VarMap::new();
        let unet = build(config, &varmap, &device)?;
        let res = config.resolution;
        let x = rng.randn((2, config.in_channels, res, res), &device)?;
        let t = Tensor::new(&[0u32, 999], &device)?;

        let output = unet.forward(&x, &t, None)?;
        assert_eq!(output.sample.dims(), &[2, config.out_ch, res, res]);
        assert_eq!(
            output.middle.dims(),
            &[
                2,
                config.bottleneck_channels(),
                config.bottleneck_size(),
                config.bottleneck_size()
            ]
        );
        assert!(output.edited.is_none());
        assert!(output.delta.is_none());
    }
    Ok(())
}

#[test]
fn test_skip_count_matches_schedule() -> Result<()> {
    let device = create_test_device();
    for (levels, blocks) in [(1, 1), (2, 1), (3, 2)] {
        let config = UNetConfig::default()
            .with_ch(32)
            .with_ch_mult(vec![1; levels])
            .with_num_res_blocks(blocks)
            .with_attn_resolutions(vec![])
            .with_resolution(16);
        let varmap = VarMap::new();
        let unet = build(&config, &varmap, &device)?;

        let x = Tensor::zeros((1, 3, 16, 16), DType::F32, &device)?;
        let t = Tensor::new(&[1u32], &device)?;
        let encoded = unet.encode(&x, &t)?;
        assert_eq!(encoded.skips.len(), 1 + levels * blocks + (levels - 1));
        assert_eq!(encoded.skips.len(), unet.num_skip_connections());

        // The decoder consumes exactly what the encoder produced
        let mut skips = encoded.skips.clone();
        unet.decode(&encoded.middle, &mut skips, &encoded.temb)?;
        assert!(skips.is_empty());
    }
    Ok(())
}

#[test]
fn test_decode_underflow_fails_fast() -> Result<()> {
    let device = create_test_device();
    let varmap = VarMap::new();
    let unet = build(&two_level_config(), &varmap, &device)?;

    let x = Tensor::zeros((1, 3, 16, 16), DType::F32, &device)?;
    let t = Tensor::new(&[1u32], &device)?;
    let mut encoded = unet.encode(&x, &t)?;
    encoded.skips.pop()?;

    let err = unet
        .decode(&encoded.middle, &mut encoded.skips, &encoded.temb)
        .unwrap_err();
    assert!(err.to_string().contains("underflow"));
    Ok(())
}

#[test]
fn test_half_precision_weights() -> Result<()> {
    let device = create_test_device();
    let config = UNetConfig::default()
        .with_ch(32)
        .with_ch_mult(vec![1, 2])
        .with_num_res_blocks(1)
        .with_attn_resolutions(vec![8])
        .with_resolution(16);
    let t = Tensor::new(&[500u32], &device)?;

    for dtype in [DType::BF16, DType::F16] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
        let mut unet = DiffusionUNet::new(vb.clone(), &config)?;
        unet.setup_delta_layers(vb, 1, &DeltaLayerConfig::new(DeltaLayerType::Conv))?;

        let x = Pcg32::new(21, 1).randn((1, 3, 16, 16), &device)?.to_dtype(dtype)?;
        assert_eq!(unet.time_embedding(&t)?.dtype(), dtype);

        let request = EditRequest::new(EditMode::asyrp(0, vec![1.0, 1.0]));
        let output = unet.forward(&x, &t, Some(&request))?;
        assert_eq!(output.sample.dtype(), dtype);
        assert_eq!(output.sample.dims(), &[1, config.out_ch, 16, 16]);
        assert_eq!(output.edited.expect("edited output").dims(), &[1, config.out_ch, 16, 16]);
    }
    Ok(())
}

// =============================================================================
// Embedding Tests
// =============================================================================

#[test]
fn test_embedding_is_deterministic() -> Result<()> {
    let device = create_test_device();
    let t = Tensor::new(&[0u32, 17, 500, 999], &device)?;
    let a = get_timestep_embedding(&t, 128)?.to_vec2::<f32>()?;
    let b = get_timestep_embedding(&t, 128)?.to_vec2::<f32>()?;
    assert_eq!(a, b);

    // t = 0: sines are zero, cosines are one
    assert!(a[0][..64].iter().all(|&v| v == 0.0));
    assert!(a[0][64..].iter().all(|&v| v == 1.0));
    Ok(())
}

#[test]
fn test_time_embedding_is_pure() -> Result<()> {
    let device = create_test_device();
    let varmap = VarMap::new();
    let unet = build(&two_level_config(), &varmap, &device)?;
    let t = Tensor::new(&[250u32], &device)?;

    let a = unet.time_embedding(&t)?;
    let b = unet.time_embedding(&t)?;
    assert_eq!(a.dims(), &[1, 512]);
    assert_eq!(max_abs_diff(&a, &b)?, 0.0);
    Ok(())
}

// =============================================================================
// End-to-End Scenarios
// =============================================================================

fn two_level_with_conv_delta(varmap: &VarMap, device: &Device) -> Result<DiffusionUNet> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let mut unet = DiffusionUNet::new(vb.clone(), &two_level_config())?;
    unet.setup_delta_layers(vb, 1, &DeltaLayerConfig::new(DeltaLayerType::Conv))?;
    Ok(unet)
}

#[test]
fn test_edit_above_threshold_changes_output() -> Result<()> {
    let device = create_test_device();
    let varmap = VarMap::new();
    let unet = two_level_with_conv_delta(&varmap, &device)?;

    let x = Pcg32::new(11, 1).randn((1, 3, 16, 16), &device)?;
    let t = Tensor::new(&[500u32], &device)?;
    let request = EditRequest::new(EditMode::asyrp(0, vec![1.0, 1.0])).with_t_edit(400.0);

    let output = unet.forward(&x, &t, Some(&request))?;
    let out_ch = unet.config().out_ch;
    assert_eq!(output.sample.dims(), &[1, out_ch, 16, 16]);

    let edited = output.edited.expect("edited output");
    assert_eq!(edited.dims(), &[1, out_ch, 16, 16]);
    assert!(max_abs_diff(&edited, &output.sample)? > 1e-6);

    let delta = output.delta.expect("delta");
    assert_eq!(delta.dims(), output.middle.dims());
    Ok(())
}

#[test]
fn test_edit_below_threshold_is_plain_decode() -> Result<()> {
    let device = create_test_device();
    let varmap = VarMap::new();
    let unet = two_level_with_conv_delta(&varmap, &device)?;

    let x = Pcg32::new(11, 1).randn((1, 3, 16, 16), &device)?;
    let t = Tensor::new(&[100u32], &device)?;
    let request = EditRequest::new(EditMode::asyrp(0, vec![1.0, 1.0])).with_t_edit(400.0);

    let output = unet.forward(&x, &t, Some(&request))?;
    let edited = output.edited.expect("edited output");
    assert!(output.delta.is_none());

    let encoded = unet.encode(&x, &t)?;
    let direct = unet.decode(&encoded.middle, &mut encoded.skips.clone(), &encoded.temb)?;
    assert!(max_abs_diff(&edited, &direct)? < 1e-6);
    assert!(max_abs_diff(&edited, &output.sample)? < 1e-6);
    Ok(())
}

#[test]
fn test_edit_does_not_disturb_canonical_branch() -> Result<()> {
    let device = create_test_device();
    let varmap = VarMap::new();
    let unet = two_level_with_conv_delta(&varmap, &device)?;

    let x = Pcg32::new(5, 2).randn((2, 3, 16, 16), &device)?;
    let t = Tensor::new(&[700u32, 700], &device)?;
    let request = EditRequest::new(EditMode::asyrp(0, vec![0.5, 2.0]));

    let plain = unet.forward(&x, &t, None)?;
    let edited = unet.forward(&x, &t, Some(&request))?;
    assert!(max_abs_diff(&plain.sample, &edited.sample)? < 1e-6);
    assert!(max_abs_diff(&plain.middle, &edited.middle)? < 1e-6);
    Ok(())
}

#[test]
fn test_gate_uses_first_timestep() -> Result<()> {
    let device = create_test_device();
    let varmap = VarMap::new();
    let unet = two_level_with_conv_delta(&varmap, &device)?;

    let x = Pcg32::new(9, 9).randn((2, 3, 16, 16), &device)?;
    let request = EditRequest::new(EditMode::asyrp(0, vec![1.0, 1.0]));

    // First sample below the threshold: the whole batch is unedited
    let t = Tensor::new(&[100u32, 900], &device)?;
    let output = unet.forward(&x, &t, Some(&request))?;
    assert!(max_abs_diff(&output.edited.expect("edited"), &output.sample)? < 1e-6);

    let t = Tensor::new(&[900u32, 100], &device)?;
    let output = unet.forward(&x, &t, Some(&request))?;
    assert!(max_abs_diff(&output.edited.expect("edited"), &output.sample)? > 1e-6);
    Ok(())
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_forward_calls() -> Result<()> {
    let device = create_test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let config = UNetConfig::default()
        .with_ch(32)
        .with_ch_mult(vec![1, 2])
        .with_num_res_blocks(1)
        .with_attn_resolutions(vec![8])
        .with_resolution(16);
    let mut unet = DiffusionUNet::new(vb.clone(), &config)?;
    unet.setup_delta_layers(vb, 3, &DeltaLayerConfig::new(DeltaLayerType::Conv))?;

    let x = Pcg32::new(1, 1).randn((1, 3, 16, 16), &device)?;
    let t = Tensor::new(&[600u32], &device)?;
    let requests: Vec<EditRequest> = (0..3)
        .map(|index| EditRequest::new(EditMode::asyrp(index, vec![1.0; index + 2])))
        .collect();

    let sequential = requests
        .iter()
        .map(|request| unet.forward(&x, &t, Some(request)))
        .collect::<Result<Vec<_>>>()?;

    let concurrent = std::thread::scope(|scope| {
        let handles: Vec<_> = requests
            .iter()
            .map(|request| {
                let (unet, x, t) = (&unet, &x, &t);
                scope.spawn(move || unet.forward(x, t, Some(request)))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    for (a, b) in sequential.iter().zip(&concurrent) {
        let (ea, eb) = (a.edited.as_ref().expect("edited"), b.edited.as_ref().expect("edited"));
        assert!(max_abs_diff(ea, eb)? < 1e-5);
    }
    Ok(())
}
