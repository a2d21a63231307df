use candle_core::{Device, Result, Tensor};

/// PCG32 Random Number Generator
///
/// The CPU backend cannot be seeded, so seeded inputs (test images, directions,
/// interpolation coefficients) are drawn from this generator instead.
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, inc: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (inc << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        // XSH-RR output function
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform float in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        // 2^{-24}
        (self.next_u32() >> 8) as f32 * 5.9604645e-8
    }

    /// Two standard normal samples (Box-Muller)
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }

    /// F32 tensor of standard normal samples
    pub fn randn(&mut self, shape: impl Into<candle_core::Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count + 1);
        while data.len() < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(elem_count);
        Tensor::from_vec(data, shape, device)
    }

    /// F32 tensor of uniform samples in `[lo, hi)`
    pub fn rand_uniform(
        &mut self,
        shape: impl Into<candle_core::Shape>,
        lo: f32,
        hi: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| lo + (hi - lo) * self.next_f32())
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Integer timesteps in `[0, num_train_timesteps)`, as a rank-1 U32 tensor
    pub fn timesteps(&mut self, batch: usize, num_train_timesteps: u32, device: &Device) -> Result<Tensor> {
        let data: Vec<u32> = (0..batch)
            .map(|_| self.next_u32() % num_train_timesteps)
            .collect();
        Tensor::from_vec(data, batch, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() -> Result<()> {
        let device = Device::Cpu;
        let a = Pcg32::new(42, 54).randn((3, 5), &device)?.to_vec2::<f32>()?;
        let b = Pcg32::new(42, 54).randn((3, 5), &device)?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        let c = Pcg32::new(43, 54).randn((3, 5), &device)?.to_vec2::<f32>()?;
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn test_uniform_range() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = Pcg32::new(1, 1);
        let values = rng.rand_uniform(1000, -2.0, 3.0, &device)?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (-2.0..3.0).contains(v)));

        let t = rng.timesteps(16, 1000, &device)?.to_vec1::<u32>()?;
        assert!(t.iter().all(|&v| v < 1000));
        Ok(())
    }
}
