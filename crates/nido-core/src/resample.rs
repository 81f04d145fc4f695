//! Integer-ratio resampling for interface bridges.
//!
//! A nested context may run at an integer multiple `F` of its parent's rate.
//! Audio entering the child is upsampled ×F; audio leaving it is band-limited
//! and decimated ÷F.
//!
//! ```text
//! parent → hold | linear ramp (×F) → child graph → windowed-sinc FIR → keep every F-th → parent
//! ```
//!
//! The decimation filter is a Blackman-windowed sinc designed on the control
//! thread when a bridge port is linked, with the cutoff at 0.45 of the parent
//! Nyquist. The real-time path only convolves against the stored kernel.

use crate::config::UpsampleMode;
use core::f32::consts::PI;

/// Number of taps in the decimation filter.
pub const DECIMATION_TAPS: usize = 32;

/// Designs a unity-DC-gain lowpass kernel for decimation by `factor`.
fn design_kernel(factor: usize) -> [f32; DECIMATION_TAPS] {
    let mut kernel = [0.0; DECIMATION_TAPS];
    let cutoff = 0.45 / factor as f32;
    let center = (DECIMATION_TAPS - 1) as f32 / 2.0;
    let span = (DECIMATION_TAPS - 1) as f32;

    for (n, tap) in kernel.iter_mut().enumerate() {
        let x = n as f32 - center;
        let sinc = if x == 0.0 {
            2.0 * cutoff
        } else {
            libm::sinf(2.0 * PI * cutoff * x) / (PI * x)
        };
        let phase = 2.0 * PI * n as f32 / span;
        let window = 0.42 - 0.5 * libm::cosf(phase) + 0.08 * libm::cosf(2.0 * phase);
        *tap = sinc * window;
    }

    let sum: f32 = kernel.iter().sum();
    if sum != 0.0 {
        for tap in &mut kernel {
            *tap /= sum;
        }
    }
    kernel
}

/// Per-port resampling state.
#[derive(Debug, Clone)]
pub struct Resampler {
    factor: usize,
    mode: UpsampleMode,
    prev: f32,
    history: [f32; DECIMATION_TAPS],
    pos: usize,
    kernel: [f32; DECIMATION_TAPS],
}

impl Resampler {
    /// Creates a resampler for ratio `factor` (clamped to at least 1).
    pub fn new(factor: usize, mode: UpsampleMode) -> Self {
        let factor = factor.max(1);
        Self {
            factor,
            mode,
            prev: 0.0,
            history: [0.0; DECIMATION_TAPS],
            pos: 0,
            kernel: design_kernel(factor),
        }
    }

    /// The resampling ratio.
    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Clears filter and interpolation state.
    pub fn reset(&mut self) {
        self.prev = 0.0;
        self.history = [0.0; DECIMATION_TAPS];
        self.pos = 0;
    }

    /// Writes `input.len() * factor` samples into `output`.
    ///
    /// Stops early if `output` is shorter.
    pub fn upsample(&mut self, input: &[f32], output: &mut [f32]) {
        let factor = self.factor;
        if factor == 1 {
            let n = input.len().min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            return;
        }
        let step = 1.0 / factor as f32;
        for (chunk, &x) in output.chunks_mut(factor).zip(input.iter()) {
            match self.mode {
                UpsampleMode::Hold => chunk.fill(x),
                UpsampleMode::Linear => {
                    for (i, y) in chunk.iter_mut().enumerate() {
                        let t = (i as f32 + 1.0) * step;
                        *y = self.prev + t * (x - self.prev);
                    }
                }
            }
            self.prev = x;
        }
    }

    /// Filters `input` and keeps every `factor`-th sample into `output`.
    pub fn downsample(&mut self, input: &[f32], output: &mut [f32]) {
        let factor = self.factor;
        if factor == 1 {
            let n = input.len().min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            return;
        }
        for (y, chunk) in output.iter_mut().zip(input.chunks_exact(factor)) {
            for &x in chunk {
                self.pos = (self.pos + 1) % DECIMATION_TAPS;
                self.history[self.pos] = x;
            }
            *y = self.convolve();
        }
    }

    #[inline]
    fn convolve(&self) -> f32 {
        let mut acc = 0.0;
        for (k, &c) in self.kernel.iter().enumerate() {
            let idx = (self.pos + DECIMATION_TAPS - k) % DECIMATION_TAPS;
            acc += c * self.history[idx];
        }
        acc
    }
}
