// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Second-order filter sections used by the note filter and the equalizer.
//!
//! Coefficients are computed once per tick at the tick-start and tick-end
//! parameter values, then linearly interpolated per sample across the run,
//! so automated sweeps glide instead of stepping. The interpolation is on
//! the coefficients rather than the frequency, which is inaudibly different
//! at tick granularity and much cheaper.

use std::f64::consts::PI;

/// One set of biquad coefficients in direct form I.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct FilterCoefficients {
    pub a1: f64,
    pub a2: f64,
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
}
impl FilterCoefficients {
    /// A second-order low-pass at the given corner (radians per sample).
    /// The control point's linear gain sets the corner resonance.
    pub fn low_pass(corner_radians_per_sample: f64, peak_linear_gain: f64) -> Self {
        let radians = corner_radians_per_sample.clamp(1e-4, PI - 1e-4);
        let q = peak_linear_gain.sqrt().max(0.05);
        let alpha = radians.sin() / (2.0 * q);
        let cos = radians.cos();
        let a0 = 1.0 + alpha;
        Self {
            a1: (-2.0 * cos) / a0,
            a2: (1.0 - alpha) / a0,
            b0: ((1.0 - cos) / 2.0) / a0,
            b1: (1.0 - cos) / a0,
            b2: ((1.0 - cos) / 2.0) / a0,
        }
    }

    /// A second-order high-pass at the given corner.
    pub fn high_pass(corner_radians_per_sample: f64, peak_linear_gain: f64) -> Self {
        let radians = corner_radians_per_sample.clamp(1e-4, PI - 1e-4);
        let q = peak_linear_gain.sqrt().max(0.05);
        let alpha = radians.sin() / (2.0 * q);
        let cos = radians.cos();
        let a0 = 1.0 + alpha;
        Self {
            a1: (-2.0 * cos) / a0,
            a2: (1.0 - alpha) / a0,
            b0: ((1.0 + cos) / 2.0) / a0,
            b1: -(1.0 + cos) / a0,
            b2: ((1.0 + cos) / 2.0) / a0,
        }
    }

    /// A peaking section that boosts or cuts around the center frequency by
    /// the given linear gain, with a fixed one-octave-ish bandwidth.
    pub fn peak(center_radians_per_sample: f64, linear_gain: f64) -> Self {
        let radians = center_radians_per_sample.clamp(1e-4, PI - 1e-4);
        let sqrt_gain = linear_gain.sqrt().max(1e-3);
        let alpha = radians.sin() / 2.0;
        let cos = radians.cos();
        let a0 = 1.0 + alpha / sqrt_gain;
        Self {
            a1: (-2.0 * cos) / a0,
            a2: (1.0 - alpha / sqrt_gain) / a0,
            b0: (1.0 + alpha * sqrt_gain) / a0,
            b1: (-2.0 * cos) / a0,
            b2: (1.0 - alpha * sqrt_gain) / a0,
        }
    }
}

/// A biquad whose coefficients ramp linearly across a run of samples.
/// Holds its own state, so it survives from run to run inside a tone or an
/// instrument's effect state.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct DynamicBiquad {
    coefficients: FilterCoefficients,
    deltas: FilterCoefficients,
    input1: f64,
    input2: f64,
    output1: f64,
    output2: f64,
}
impl DynamicBiquad {
    /// Sets this run's start coefficients and the per-sample ramp toward
    /// the end coefficients.
    pub fn load(&mut self, start: FilterCoefficients, end: FilterCoefficients, run_length: usize) {
        let scale = 1.0 / run_length.max(1) as f64;
        self.coefficients = start;
        self.deltas = FilterCoefficients {
            a1: (end.a1 - start.a1) * scale,
            a2: (end.a2 - start.a2) * scale,
            b0: (end.b0 - start.b0) * scale,
            b1: (end.b1 - start.b1) * scale,
            b2: (end.b2 - start.b2) * scale,
        };
    }

    /// Filters the buffer in place, ramping the coefficients as loaded.
    pub fn process(&mut self, buffer: &mut [f64]) {
        let mut c = self.coefficients;
        for sample in buffer.iter_mut() {
            let input = *sample;
            let output = c.b0 * input + c.b1 * self.input1 + c.b2 * self.input2
                - c.a1 * self.output1
                - c.a2 * self.output2;
            self.input2 = self.input1;
            self.input1 = input;
            self.output2 = self.output1;
            self.output1 = output;
            *sample = output;
            c.a1 += self.deltas.a1;
            c.a2 += self.deltas.a2;
            c.b0 += self.deltas.b0;
            c.b1 += self.deltas.b1;
            c.b2 += self.deltas.b2;
        }
        self.coefficients = c;
        self.sanitize();
    }

    /// Flushes denormal-range state to exact zero and resets state that has
    /// gone non-finite or absurd instead of letting it propagate.
    pub fn sanitize(&mut self) {
        for state in [
            &mut self.input1,
            &mut self.input2,
            &mut self.output1,
            &mut self.output2,
        ] {
            if !state.is_finite() || state.abs() > 1.0e6 || state.abs() < 1.0e-24 {
                *state = 0.0;
            }
        }
    }

    /// Clears filter memory, as when a tone restarts from silence.
    pub fn reset(&mut self) {
        self.input1 = 0.0;
        self.input2 = 0.0;
        self.output1 = 0.0;
        self.output2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_gt, assert_lt};

    fn rms(buffer: &[f64]) -> f64 {
        (buffer.iter().map(|s| s * s).sum::<f64>() / buffer.len() as f64).sqrt()
    }

    fn tone_buffer(radians_per_sample: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| (radians_per_sample * i as f64).sin())
            .collect()
    }

    #[test]
    fn low_pass_attenuates_high_frequencies() {
        let corner = 0.1;
        let coefficients = FilterCoefficients::low_pass(corner, 1.0);
        let mut filter = DynamicBiquad::default();
        filter.load(coefficients, coefficients, 2048);
        let mut low = tone_buffer(corner * 0.1, 2048);
        filter.process(&mut low);
        let mut filter = DynamicBiquad::default();
        filter.load(coefficients, coefficients, 2048);
        let mut high = tone_buffer(corner * 10.0, 2048);
        filter.process(&mut high);
        assert_gt!(rms(&low[1024..]), 0.5);
        assert_lt!(rms(&high[1024..]), 0.1);
    }

    #[test]
    fn high_pass_attenuates_low_frequencies() {
        let corner = 0.5;
        let coefficients = FilterCoefficients::high_pass(corner, 1.0);
        let mut filter = DynamicBiquad::default();
        filter.load(coefficients, coefficients, 2048);
        let mut low = tone_buffer(corner * 0.05, 2048);
        filter.process(&mut low);
        assert_lt!(rms(&low[1024..]), 0.1);
    }

    #[test]
    fn peak_boost_raises_center_band() {
        let center = 0.3;
        let boosted = FilterCoefficients::peak(center, 4.0);
        let mut filter = DynamicBiquad::default();
        filter.load(boosted, boosted, 2048);
        let mut band = tone_buffer(center, 2048);
        filter.process(&mut band);
        assert_gt!(rms(&band[1024..]), 0.8);
    }

    #[test]
    fn sanitize_resets_runaway_state() {
        let mut filter = DynamicBiquad::default();
        filter.output1 = f64::NAN;
        filter.output2 = 1.0e9;
        filter.input1 = 1.0e-30;
        filter.sanitize();
        assert_eq!(filter.output1, 0.0);
        assert_eq!(filter.output2, 0.0);
        assert_eq!(filter.input1, 0.0);
    }

    #[test]
    fn coefficient_ramp_lands_on_end_values() {
        let start = FilterCoefficients::low_pass(0.1, 1.0);
        let end = FilterCoefficients::low_pass(0.4, 1.0);
        let mut filter = DynamicBiquad::default();
        filter.load(start, end, 100);
        let mut buffer = vec![0.0; 100];
        filter.process(&mut buffer);
        assert!((filter.coefficients.b0 - end.b0).abs() < 1e-9);
    }
}
