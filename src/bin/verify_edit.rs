//! Runs one edited forward pass and reports how far the edited prediction moved
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin verify_edit -- --timestep 500 --t-edit 400 --index 0
//! cargo run --release --bin verify_edit -- --config unet.json --weights asyrp.safetensors
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_asyrp::utils::deterministic_rng::Pcg32;
use candle_asyrp::{
    DeltaLayerConfig, DeltaLayerType, DiffusionUNet, EditMode, EditRequest, EmbeddingFusion,
    UNetConfig,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Verify Asyrp bottleneck editing on a DDPM U-Net")]
struct Args {
    /// JSON U-Net config (defaults to the 256x256 reference model)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors checkpoint with trunk and `layer_{i}` weights (random weights if omitted)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Number of delta layers to create
    #[arg(long, default_value = "1")]
    delta_layers: usize,

    /// Delta layer type (conv, p_transformer_simple, c_transformer_simple, ...)
    #[arg(long, default_value = "conv")]
    layer_type: DeltaLayerType,

    /// Timestep fusion mode (add, mult, adagn)
    #[arg(long, default_value = "add")]
    emb_type: EmbeddingFusion,

    #[arg(long, default_value = "1")]
    nheads: usize,

    /// Edit index (layers 0..=index are accumulated)
    #[arg(long, default_value = "0")]
    index: usize,

    /// Blend coefficients, the first weights the bottleneck
    #[arg(long, value_delimiter = ',', default_value = "1.0,1.0")]
    coeffs: Vec<f64>,

    #[arg(long, default_value = "500")]
    timestep: u32,

    #[arg(long, default_value = "400")]
    t_edit: f64,

    #[arg(long, default_value = "1")]
    batch: usize,

    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_asyrp=info".parse()?)
                .add_directive("verify_edit=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        match Device::cuda_if_available(0) {
            Ok(device) => device,
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Device::Cpu
            }
        }
    };

    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            UNetConfig::from_json(&json)?
        }
        None => UNetConfig::default(),
    };
    info!(
        "U-Net: ch {} x {:?}, {} res blocks, resolution {}",
        config.ch, config.ch_mult, config.num_res_blocks, config.resolution
    );

    let varmap = VarMap::new();
    let vb = match &args.weights {
        Some(path) => {
            info!("Loading weights from {}", path.display());
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? }
        }
        None => {
            info!("Using randomly initialised weights");
            VarBuilder::from_varmap(&varmap, DType::F32, &device)
        }
    };

    let mut unet = DiffusionUNet::new(vb.clone(), &config)?;
    let delta_config = DeltaLayerConfig::new(args.layer_type)
        .with_heads(args.nheads)
        .with_emb_type(args.emb_type);
    unet.setup_delta_layers(vb, args.delta_layers, &delta_config)?;

    let mut rng = Pcg32::new(args.seed, 1442695040888963407);
    let x = rng.randn(
        (args.batch, config.in_channels, config.resolution, config.resolution),
        &device,
    )?;
    let t = Tensor::from_vec(vec![args.timestep; args.batch], args.batch, &device)?;

    let request = EditRequest::new(EditMode::asyrp(args.index, args.coeffs.clone()))
        .with_t_edit(args.t_edit);

    let start = std::time::Instant::now();
    let output = unet.forward(&x, &t, Some(&request))?;
    info!("Forward pass took {:.2?}", start.elapsed());

    info!("sample: {:?}", output.sample.dims());
    info!("middle: {:?}", output.middle.dims());
    if let Some(delta) = &output.delta {
        let norm = delta.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        info!("delta: {:?} (L2 norm {:.6})", delta.dims(), norm);
    }
    let edited = output
        .edited
        .context("Edited output missing for an edit request")?;
    info!("edited: {:?}", edited.dims());

    let diff = (&edited - &output.sample)?.abs()?;
    let max_diff = diff.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    let mean_diff = diff.mean_all()?.to_scalar::<f32>()?;
    info!("edited vs canonical: max {:.6}, mean {:.6}", max_diff, mean_diff);

    if f64::from(args.timestep) >= args.t_edit {
        if max_diff == 0.0 {
            warn!("Edit was active but the edited output equals the canonical output");
        }
    } else if max_diff != 0.0 {
        anyhow::bail!("Edit gated off but outputs differ by {max_diff}");
    }

    println!("\nVERIFICATION COMPLETE");
    Ok(())
}
