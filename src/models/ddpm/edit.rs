//! Edit policies applied at the bottleneck, plus the skip-connection stack they share
//! with the decoder.

use std::ops::Range;

use candle_core::{DType, Device, Result, Tensor};
use tracing::warn;

/// Default edit-start threshold
pub const DEFAULT_T_EDIT: f64 = 400.0;

/// LIFO stack of encoder feature maps consumed by the decoder
///
/// Cloning is cheap (tensors are reference counted) and gives an independent cursor, so an
/// edited decode and the main decode can each drain their own copy.
#[derive(Debug, Clone, Default)]
pub struct SkipStack {
    entries: Vec<Tensor>,
}

impl SkipStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tensor: Tensor) {
        self.entries.push(tensor);
    }

    pub fn pop(&mut self) -> Result<Tensor> {
        match self.entries.pop() {
            Some(tensor) => Ok(tensor),
            None => candle_core::bail!("skip stack underflow: decoder popped more than the encoder pushed"),
        }
    }

    /// Most recently pushed entry
    pub fn last(&self) -> Result<&Tensor> {
        match self.entries.last() {
            Some(tensor) => Ok(tensor),
            None => candle_core::bail!("skip stack is empty"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rectangular spatial region of the bottleneck, in bottleneck pixels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialMask {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl SpatialMask {
    pub fn new(rows: Range<usize>, cols: Range<usize>) -> Self {
        Self { rows, cols }
    }

    /// Rows `4..size-1`, columns `3..5`: the region used by the DiffStyle experiments
    pub fn diffstyle(size: usize) -> Self {
        Self {
            rows: 4..size.saturating_sub(1),
            cols: 3..5,
        }
    }

    /// `[1, 1, height, width]` tensor with ones inside the rectangle
    pub fn to_tensor(&self, height: usize, width: usize, dtype: DType, device: &Device) -> Result<Tensor> {
        if self.rows.is_empty()
            || self.cols.is_empty()
            || self.rows.end > height
            || self.cols.end > width
        {
            candle_core::bail!(
                "mask rows {:?} cols {:?} do not fit a {height}x{width} bottleneck",
                self.rows,
                self.cols
            );
        }
        let mut data = vec![0f32; height * width];
        for row in self.rows.clone() {
            for col in self.cols.clone() {
                data[row * width + col] = 1.0;
            }
        }
        Tensor::from_vec(data, (1, 1, height, width), device)?.to_dtype(dtype)
    }
}

/// Per-sample L2 norm of the flattened tensor, shaped `[B, 1, .., 1]`
pub(crate) fn sample_norm(x: &Tensor) -> Result<Tensor> {
    let mut shape = vec![1; x.rank()];
    shape[0] = x.dim(0)?;
    x.flatten_from(1)?.sqr()?.sum_keepdim(1)?.sqrt()?.reshape(shape)
}

/// Spherical linear interpolation between two batches, one arc per sample
///
/// The angle is measured between the normalised flattened samples; the weights
/// `sin((1-t)θ)/sin θ` and `sin(tθ)/sin θ` are applied to the original vectors.
///
/// Parallel (or anti-parallel) samples make `sin θ` vanish and the result non-finite. This is
/// not special-cased: callers must not pass parallel inputs. A warning is logged when it happens.
pub fn slerp(t: f64, v0: &Tensor, v1: &Tensor) -> Result<Tensor> {
    if v0.dims() != v1.dims() {
        candle_core::bail!(
            "slerp operands differ in shape: {:?} vs {:?}",
            v0.dims(),
            v1.dims()
        );
    }
    let batch = v0.dim(0)?;

    let n0 = v0.broadcast_div(&sample_norm(v0)?)?.flatten_from(1)?;
    let n1 = v1.broadcast_div(&sample_norm(v1)?)?.flatten_from(1)?;
    let dots = (n0 * n1)?.sum(1)?.to_dtype(DType::F64)?.to_vec1::<f64>()?;

    let mut s0 = Vec::with_capacity(batch);
    let mut s1 = Vec::with_capacity(batch);
    for (i, dot) in dots.into_iter().enumerate() {
        let theta_0 = dot.acos();
        let sin_theta_0 = theta_0.sin();
        if sin_theta_0.is_nan() || sin_theta_0.abs() < 1e-6 {
            warn!(sample = i, dot, "slerp operands are (nearly) parallel, result is unstable");
        }
        let theta_t = theta_0 * t;
        s0.push((theta_0 - theta_t).sin() / sin_theta_0);
        s1.push(theta_t.sin() / sin_theta_0);
    }

    let mut shape = vec![1; v0.rank()];
    shape[0] = batch;
    let s0 = Tensor::from_vec(s0, shape.clone(), v0.device())?.to_dtype(v0.dtype())?;
    let s1 = Tensor::from_vec(s1, shape, v0.device())?.to_dtype(v0.dtype())?;
    v0.broadcast_mul(&s0)? + v1.broadcast_mul(&s1)?
}

/// How the edited bottleneck is derived from the canonical one
#[derive(Debug, Clone)]
pub enum EditMode {
    /// `coeffs[0] * h + sum_{i=0..=index} coeffs[i + 1] * layer_i(h)`
    Asyrp {
        index: usize,
        coeffs: Vec<f64>,
        /// Run the delta layers without the timestep embedding
        ignore_timestep: bool,
    },
    /// Slerp from `h` towards a caller-supplied delta by `1 - coeff`
    DirectDelta {
        delta: Tensor,
        coeff: f64,
        mask: Option<SpatialMask>,
    },
    /// `h + sum_{i<count} weights[i] * layer_i(h) / sqrt(count)`
    MultiAttribute { count: usize, weights: Vec<f64> },
    /// `(1 - alpha_b) * h[0] + alpha_b * h[last]` for every sample `b`
    BatchInterpolation { alpha: Tensor },
    /// `h + layer_index(h)`, applied regardless of the timestep
    SingleLayer { index: usize },
    /// `h + global_layer(h, temb, direction)`
    Global { direction: Tensor },
}

impl EditMode {
    pub fn asyrp(index: usize, coeffs: Vec<f64>) -> Self {
        Self::Asyrp {
            index,
            coeffs,
            ignore_timestep: false,
        }
    }

    /// Whether the policy is gated by the edit-start threshold
    pub fn is_gated(&self) -> bool {
        !matches!(self, Self::SingleLayer { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Asyrp { .. } => "asyrp",
            Self::DirectDelta { .. } => "direct-delta",
            Self::MultiAttribute { .. } => "multi-attribute",
            Self::BatchInterpolation { .. } => "batch-interpolation",
            Self::SingleLayer { .. } => "single-layer",
            Self::Global { .. } => "global",
        }
    }
}

/// Edit request for one forward call
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub mode: EditMode,
    /// Policies activate when the first sample's timestep is `>= t_edit`
    pub t_edit: f64,
}

impl EditRequest {
    pub fn new(mode: EditMode) -> Self {
        Self {
            mode,
            t_edit: DEFAULT_T_EDIT,
        }
    }

    pub fn with_t_edit(mut self, t_edit: f64) -> Self {
        self.t_edit = t_edit;
        self
    }

    pub fn is_active(&self, timestep: f64) -> bool {
        !self.mode.is_gated() || timestep >= self.t_edit
    }
}

/// Result of applying an edit policy to the bottleneck
#[derive(Debug, Clone)]
pub struct EditedBottleneck {
    pub h: Tensor,
    /// Delta that was applied, if any
    pub delta: Option<Tensor>,
}
