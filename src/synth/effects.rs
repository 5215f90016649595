// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The per-instrument effects chain and the master limiter.
//!
//! Each instrument owns one [EffectsState] holding every delay line and
//! filter memory its enabled stages need. Stages run in
//! [crate::song::EFFECT_PIPELINE_ORDER]; disabled stages are skipped
//! entirely. The chain is mono until the panning stage, stereo after it.
//!
//! Delay state is flushed to exact zero once an instrument has been silent
//! long enough for its longest delay to drain, which both guarantees
//! silence and keeps denormals out of the feedback paths.

use std::f64::consts::{FRAC_PI_4, TAU};

use crate::{
    config,
    song::{EffectKind, FilterType, Instrument, EFFECT_PIPELINE_ORDER},
};

use super::{
    envelope::EnvelopeValues,
    filtering::{DynamicBiquad, FilterCoefficients},
};

const PAN_DELAY_BUFFER_SIZE: usize = 1 << 8;

/// Everything the chain needs to know about the world outside the
/// instrument for one run.
#[derive(Clone, Copy, Debug)]
pub(super) struct EffectsContext {
    pub sample_rate: f64,
    pub samples_per_part: f64,
    /// The song key's base frequency; the bitcrusher latch rate tracks it
    /// so crushing stays harmonically related to the material.
    pub key_base_freq: f64,
}

/// Runtime state for one instrument's effect stages.
#[derive(Debug)]
pub(super) struct EffectsState {
    distortion_prev_input: f64,
    bitcrusher_phase: f64,
    bitcrusher_value: f64,
    eq_filters: [DynamicBiquad; config::FILTER_MAX_POINTS],
    pan_delay_lines: [Vec<f32>; 2],
    pan_delay_index: usize,
    chorus_delay_lines: [Vec<f32>; 2],
    chorus_delay_index: usize,
    chorus_phase: f64,
    echo_delay_lines: [Vec<f32>; 2],
    echo_delay_index: usize,
    echo_shelf_samples: [f64; 2],
    reverb_delay_line: Vec<f32>,
    reverb_delay_index: usize,
    reverb_shelf_samples: [f64; 4],
    /// Samples of silence remaining before the delay state is declared
    /// drained and flushed.
    drain_countdown: usize,
    scratch_left: Vec<f64>,
    scratch_right: Vec<f64>,
}
impl Default for EffectsState {
    fn default() -> Self {
        Self {
            distortion_prev_input: 0.0,
            bitcrusher_phase: 0.0,
            bitcrusher_value: 0.0,
            eq_filters: [DynamicBiquad::default(); config::FILTER_MAX_POINTS],
            pan_delay_lines: [
                vec![0.0; PAN_DELAY_BUFFER_SIZE],
                vec![0.0; PAN_DELAY_BUFFER_SIZE],
            ],
            pan_delay_index: 0,
            chorus_delay_lines: [
                vec![0.0; config::CHORUS_DELAY_BUFFER_SIZE],
                vec![0.0; config::CHORUS_DELAY_BUFFER_SIZE],
            ],
            chorus_delay_index: 0,
            chorus_phase: 0.0,
            echo_delay_lines: [Vec::default(), Vec::default()],
            echo_delay_index: 0,
            echo_shelf_samples: [0.0; 2],
            reverb_delay_line: vec![0.0; config::REVERB_DELAY_BUFFER_SIZE],
            reverb_delay_index: 0,
            reverb_shelf_samples: [0.0; 4],
            drain_countdown: 0,
            scratch_left: Vec::default(),
            scratch_right: Vec::default(),
        }
    }
}
impl EffectsState {
    /// Clears every delay line and filter memory, as on pause or seek.
    pub fn reset(&mut self) {
        self.distortion_prev_input = 0.0;
        self.bitcrusher_phase = 0.0;
        self.bitcrusher_value = 0.0;
        for filter in self.eq_filters.iter_mut() {
            filter.reset();
        }
        for line in self.pan_delay_lines.iter_mut() {
            line.fill(0.0);
        }
        self.pan_delay_index = 0;
        for line in self.chorus_delay_lines.iter_mut() {
            line.fill(0.0);
        }
        self.chorus_delay_index = 0;
        self.chorus_phase = 0.0;
        for line in self.echo_delay_lines.iter_mut() {
            line.fill(0.0);
        }
        self.echo_delay_index = 0;
        self.echo_shelf_samples = [0.0; 2];
        self.reverb_delay_line.fill(0.0);
        self.reverb_delay_index = 0;
        self.reverb_shelf_samples = [0.0; 4];
        self.drain_countdown = 0;
    }

    /// Whether the chain still carries audible delay state and must keep
    /// running even though no tone is feeding it.
    pub fn is_draining(&self) -> bool {
        self.drain_countdown > 0
    }

    /// Runs the enabled stages over `dry` and accumulates stereo output
    /// into `out_left`/`out_right`.
    pub fn process(
        &mut self,
        instrument: &Instrument,
        envelopes: &EnvelopeValues,
        context: &EffectsContext,
        dry: &mut [f64],
        out_left: &mut [f64],
        out_right: &mut [f64],
    ) {
        let run_length = dry.len();
        let has_input = dry.iter().any(|sample| *sample != 0.0);
        if has_input {
            self.drain_countdown = self.longest_delay(instrument, context) * 2 + run_length;
        } else if self.drain_countdown == 0 {
            return;
        } else {
            self.drain_countdown = self.drain_countdown.saturating_sub(run_length);
            if self.drain_countdown == 0 {
                self.reset();
                return;
            }
        }

        self.scratch_left.clear();
        self.scratch_left.resize(run_length, 0.0);
        self.scratch_right.clear();
        self.scratch_right.resize(run_length, 0.0);
        let mut stereo = false;

        for effect in EFFECT_PIPELINE_ORDER {
            if !instrument.effect_enabled(effect) {
                continue;
            }
            match effect {
                EffectKind::Distortion => self.distortion(instrument, dry),
                EffectKind::Bitcrusher => self.bitcrusher(instrument, envelopes, context, dry),
                EffectKind::Eq => self.eq(instrument, context, dry),
                EffectKind::Panning => {
                    self.pan(instrument, context, dry);
                    stereo = true;
                }
                EffectKind::Chorus => {
                    if !stereo {
                        self.center(dry);
                        stereo = true;
                    }
                    self.chorus(instrument, envelopes, context);
                }
                EffectKind::Echo => {
                    if !stereo {
                        self.center(dry);
                        stereo = true;
                    }
                    self.echo(instrument, envelopes, context);
                }
                EffectKind::Reverb => {
                    if !stereo {
                        self.center(dry);
                        stereo = true;
                    }
                    self.reverb(instrument, envelopes);
                }
            }
        }
        if !stereo {
            self.center(dry);
        }

        for (out, sample) in out_left.iter_mut().zip(&self.scratch_left) {
            *out += sample;
        }
        for (out, sample) in out_right.iter_mut().zip(&self.scratch_right) {
            *out += sample;
        }
        self.sanitize();
    }

    /// The longest enabled delay in samples, used to size the drain window.
    fn longest_delay(&self, instrument: &Instrument, context: &EffectsContext) -> usize {
        let mut longest = 0;
        if instrument.effect_enabled(EffectKind::Reverb) {
            longest = longest.max(config::REVERB_DELAY_BUFFER_SIZE);
        }
        if instrument.effect_enabled(EffectKind::Echo) {
            longest = longest.max(
                ((instrument.echo_delay + 1) as f64
                    * config::ECHO_DELAY_STEP_PARTS as f64
                    * context.samples_per_part) as usize,
            );
        }
        if instrument.effect_enabled(EffectKind::Chorus) {
            longest = longest.max(config::CHORUS_DELAY_BUFFER_SIZE);
        }
        longest
    }

    /// Splits the mono signal into both stereo scratch buffers.
    fn center(&mut self, dry: &[f64]) {
        self.scratch_left.copy_from_slice(dry);
        self.scratch_right.copy_from_slice(dry);
    }

    /// Oversampled soft clip. The input is linearly interpolated to 4x
    /// rate, clipped at each subsample, and averaged back down, which
    /// pushes the clipper's aliases mostly above the audible band.
    fn distortion(&mut self, instrument: &Instrument, dry: &mut [f64]) {
        let amount = instrument.distortion as f64 / (config::DISTORTION_RANGE - 1) as f64;
        let drive = 1.0 + amount * amount * 30.0;
        let makeup = 1.0 / (1.0 + amount * 0.7);
        let mut prev = self.distortion_prev_input;
        for sample in dry.iter_mut() {
            let input = *sample;
            let mut sum = 0.0;
            for step in 1..=4 {
                let sub = prev + (input - prev) * step as f64 / 4.0;
                sum += (1.0 + drive) * sub / (1.0 + drive * sub.abs());
            }
            prev = input;
            *sample = sum * 0.25 * makeup;
        }
        self.distortion_prev_input = prev;
    }

    /// Simultaneous rate reduction (a free-running latch) and depth
    /// reduction (a folding quantizer).
    fn bitcrusher(
        &mut self,
        instrument: &Instrument,
        envelopes: &EnvelopeValues,
        context: &EffectsContext,
        dry: &mut [f64],
    ) {
        let octaves = (config::BITCRUSHER_FREQ_RANGE - 1 - instrument.bitcrusher_freq) as f64
            * config::BITCRUSHER_OCTAVE_STEP;
        let latch_freq =
            context.key_base_freq * 2.0_f64.powf(octaves) * envelopes.bitcrusher_frequency;
        let phase_delta = (latch_freq / context.sample_rate).min(1.0);
        let depth = (config::BITCRUSHER_QUANTIZATION_RANGE - 1 - instrument.bitcrusher_quantization)
            as f64
            * envelopes.bitcrusher_quantization;
        let levels = 2.0_f64.powf(1.0 + depth * 0.5);

        let fold = |value: f64| -> f64 {
            let wrapped = (value + 1.0).rem_euclid(4.0);
            if wrapped < 2.0 {
                wrapped - 1.0
            } else {
                3.0 - wrapped
            }
        };

        for sample in dry.iter_mut() {
            self.bitcrusher_phase += phase_delta;
            if self.bitcrusher_phase >= 1.0 {
                self.bitcrusher_phase -= self.bitcrusher_phase.floor();
                self.bitcrusher_value = (fold(*sample) * levels).round() / levels;
            }
            *sample = self.bitcrusher_value;
        }
    }

    /// The equalizer cascade. Eq settings are not envelope targets, so the
    /// coefficients hold steady across the run.
    fn eq(&mut self, instrument: &Instrument, context: &EffectsContext, dry: &mut [f64]) {
        let radians_per_hz = TAU / context.sample_rate;
        for (index, point) in instrument.eq_filter.points.iter().enumerate() {
            if index >= config::FILTER_MAX_POINTS {
                break;
            }
            let radians = point.hz() * radians_per_hz;
            let gain = point.linear_gain();
            let coefficients = match point.kind {
                FilterType::LowPass => FilterCoefficients::low_pass(radians, gain),
                FilterType::HighPass => FilterCoefficients::high_pass(radians, gain),
                FilterType::Peak => FilterCoefficients::peak(radians, gain),
            };
            self.eq_filters[index].load(coefficients, coefficients, dry.len());
            self.eq_filters[index].process(dry);
        }
    }

    /// Stereo placement: constant-power gain curves plus a fractional
    /// inter-aural delay on the far ear.
    fn pan(&mut self, instrument: &Instrument, context: &EffectsContext, dry: &[f64]) {
        let pan =
            (instrument.pan as f64 - config::PAN_CENTER as f64) / config::PAN_CENTER as f64;
        let volume_left = ((1.0 + pan) * FRAC_PI_4).cos() * std::f64::consts::SQRT_2;
        let volume_right = ((1.0 - pan) * FRAC_PI_4).cos() * std::f64::consts::SQRT_2;
        let delay_samples = pan.abs() * config::PAN_DELAY_SECONDS_MAX * context.sample_rate;
        let (delay_left, delay_right) = if pan > 0.0 {
            (delay_samples, 0.0)
        } else {
            (0.0, delay_samples)
        };
        let mask = PAN_DELAY_BUFFER_SIZE - 1;
        let mut index = self.pan_delay_index;
        for (i, &input) in dry.iter().enumerate() {
            self.pan_delay_lines[0][index] = input as f32;
            self.pan_delay_lines[1][index] = input as f32;
            let tap = |line: &[f32], delay: f64| -> f64 {
                let position = index as f64 - delay;
                let tap_index = position.floor() as isize as usize;
                let fraction = position - position.floor();
                let tap0 = line[tap_index & mask] as f64;
                let tap1 = line[tap_index.wrapping_add(1) & mask] as f64;
                tap0 + (tap1 - tap0) * fraction
            };
            self.scratch_left[i] = tap(&self.pan_delay_lines[0], delay_left) * volume_left;
            self.scratch_right[i] = tap(&self.pan_delay_lines[1], delay_right) * volume_right;
            index = (index + 1) & mask;
        }
        self.pan_delay_index = index;
    }

    /// Three modulated taps per side into a shared delay line, mixed with
    /// the dry signal.
    fn chorus(
        &mut self,
        instrument: &Instrument,
        envelopes: &EnvelopeValues,
        context: &EffectsContext,
    ) {
        let wet = (instrument.chorus as f64 / (config::CHORUS_RANGE - 1) as f64
            * envelopes.chorus)
            .clamp(0.0, 1.0);
        let range = config::CHORUS_DELAY_RANGE * context.sample_rate;
        let phase_delta = TAU / (config::CHORUS_PERIOD_SECONDS * context.sample_rate);
        let mask = config::CHORUS_DELAY_BUFFER_SIZE - 1;
        let mut index = self.chorus_delay_index;
        let mut phase = self.chorus_phase;

        for i in 0..self.scratch_left.len() {
            let inputs = [self.scratch_left[i], self.scratch_right[i]];
            for (side, input) in inputs.iter().enumerate() {
                self.chorus_delay_lines[side][index] = *input as f32;
            }
            for side in 0..2 {
                let mut taps = 0.0;
                for tap in 0..3 {
                    let delay = (config::CHORUS_DELAY_OFFSETS[side][tap]
                        + 0.4 * (phase + config::CHORUS_PHASE_OFFSETS[side][tap]).sin())
                        * range;
                    let position = index as f64 - delay;
                    let tap_index = position.floor() as isize as usize;
                    let fraction = position - position.floor();
                    let line = &self.chorus_delay_lines[side];
                    let tap0 = line[tap_index & mask] as f64;
                    let tap1 = line[tap_index.wrapping_add(1) & mask] as f64;
                    taps += tap0 + (tap1 - tap0) * fraction;
                }
                let output = inputs[side] * (1.0 - wet) + taps * 0.5 * wet;
                if side == 0 {
                    self.scratch_left[i] = output;
                } else {
                    self.scratch_right[i] = output;
                }
            }
            index = (index + 1) & mask;
            phase += phase_delta;
        }
        self.chorus_delay_index = index;
        self.chorus_phase = phase % TAU;
    }

    /// A tempo-synced feedback tap with a high shelf in the feedback path,
    /// so each repeat is darker than the last.
    fn echo(
        &mut self,
        instrument: &Instrument,
        envelopes: &EnvelopeValues,
        context: &EffectsContext,
    ) {
        let delay_samples = (((instrument.echo_delay + 1)
            * config::ECHO_DELAY_STEP_PARTS) as f64
            * context.samples_per_part)
            .round()
            .max(1.0) as usize;
        let needed = delay_samples.next_power_of_two();
        for line in self.echo_delay_lines.iter_mut() {
            if line.len() < needed {
                line.resize(needed, 0.0);
            }
        }
        let mask = self.echo_delay_lines[0].len() - 1;
        let feedback = ((instrument.echo_sustain + 1) as f64
            / config::ECHO_SUSTAIN_RANGE as f64
            * 0.9
            * envelopes.echo_sustain)
            .clamp(0.0, 0.95);
        let shelf_radians = TAU * config::ECHO_SHELF_HZ / context.sample_rate;
        let shelf_coefficient = (1.0 - (-shelf_radians).exp()).min(1.0);
        let mut index = self.echo_delay_index;

        for i in 0..self.scratch_left.len() {
            for side in 0..2 {
                let input = if side == 0 {
                    self.scratch_left[i]
                } else {
                    self.scratch_right[i]
                };
                let tap =
                    self.echo_delay_lines[side][(index.wrapping_sub(delay_samples)) & mask] as f64;
                // High shelf: keep lows, attenuate highs by the shelf gain.
                let shelf = &mut self.echo_shelf_samples[side];
                *shelf += (tap - *shelf) * shelf_coefficient;
                let damped = *shelf + (tap - *shelf) * config::ECHO_SHELF_GAIN;
                self.echo_delay_lines[side][index & mask] = (input + damped * feedback) as f32;
                let output = input + tap;
                if side == 0 {
                    self.scratch_left[i] = output;
                } else {
                    self.scratch_right[i] = output;
                }
            }
            index = (index + 1) & mask;
        }
        self.echo_delay_index = index & mask;
    }

    /// A 4-tap feedback delay network: taps spread across a shared ring,
    /// cross-mixed each sample through a normalized Hadamard matrix with
    /// per-tap damping.
    fn reverb(&mut self, instrument: &Instrument, envelopes: &EnvelopeValues) {
        let send = (instrument.reverb as f64 / config::REVERB_RANGE as f64).powf(0.667)
            * 0.425
            * envelopes.reverb;
        if send <= 0.0 {
            return;
        }
        let mask = config::REVERB_DELAY_BUFFER_MASK;
        let decay = 0.85;
        let damping = 0.6;
        let mut index = self.reverb_delay_index;

        for i in 0..self.scratch_left.len() {
            let input = (self.scratch_left[i] + self.scratch_right[i]) * send;
            let index1 = (index + 3041) & mask;
            let index2 = (index + 6426) & mask;
            let index3 = (index + 10907) & mask;
            let sample0 = self.reverb_delay_line[index] as f64 + input;
            let sample1 = self.reverb_delay_line[index1] as f64;
            let sample2 = self.reverb_delay_line[index2] as f64;
            let sample3 = self.reverb_delay_line[index3] as f64;
            // Normalized Hadamard cross-mix; the decay factor sets the
            // tail length.
            let temp0 = (sample0 + sample1 + sample2 + sample3) * 0.5;
            let temp1 = (sample0 - sample1 + sample2 - sample3) * 0.5;
            let temp2 = (sample0 + sample1 - sample2 - sample3) * 0.5;
            let temp3 = (sample0 - sample1 - sample2 + sample3) * 0.5;
            let mixed = [temp0, temp1, temp2, temp3];
            let targets = [index, index1, index2, index3];
            for tap in 0..4 {
                let shelf = &mut self.reverb_shelf_samples[tap];
                *shelf += (mixed[tap] - *shelf) * damping;
                self.reverb_delay_line[targets[tap]] = (*shelf * decay) as f32;
            }
            self.scratch_left[i] += sample1;
            self.scratch_right[i] += sample2;
            index = (index + 1) & mask;
        }
        self.reverb_delay_index = index;
    }

    /// Flushes denormal-range state and resets anything non-finite.
    fn sanitize(&mut self) {
        for state in [
            &mut self.distortion_prev_input,
            &mut self.bitcrusher_value,
        ]
        .into_iter()
        .chain(self.echo_shelf_samples.iter_mut())
        .chain(self.reverb_shelf_samples.iter_mut())
        {
            if !state.is_finite() || state.abs() > 1.0e6 || state.abs() < 1.0e-24 {
                *state = 0.0;
            }
        }
        for filter in self.eq_filters.iter_mut() {
            filter.sanitize();
        }
    }
}

/// The master limiter: tracks a smoothed stereo peak and divides by it,
/// with a fast rise and slow fall, bounding output without hard clipping.
#[derive(Debug)]
pub(super) struct Limiter {
    limit: f64,
    decay: f64,
    rise: f64,
}
impl Limiter {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            limit: 0.0,
            decay: 1.0 - 0.5_f64.powf(4.0 / sample_rate),
            rise: 1.0 - 0.5_f64.powf(4000.0 / sample_rate),
        }
    }

    pub fn reset(&mut self) {
        self.limit = 0.0;
    }

    /// Scales the stereo pair in place by the current limiter gain.
    pub fn process(&mut self, volume: f64, left: &mut f64, right: &mut f64) {
        let peak = left.abs().max(right.abs());
        let coefficient = if peak > self.limit {
            self.rise
        } else {
            self.decay
        };
        self.limit += (peak - self.limit) * coefficient;
        let divisor = if self.limit >= 1.0 {
            self.limit * 1.05
        } else {
            self.limit * 0.8 + 0.25
        };
        let gain = volume / divisor;
        *left *= gain;
        *right *= gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::InstrumentKind;
    use more_asserts::{assert_gt, assert_lt};

    fn context() -> EffectsContext {
        EffectsContext {
            sample_rate: 44100.0,
            samples_per_part: 441.0,
            key_base_freq: 440.0,
        }
    }

    fn impulse(len: usize) -> Vec<f64> {
        let mut dry = vec![0.0; len];
        dry[0] = 1.0;
        dry
    }

    #[test]
    fn disabled_effects_pass_dry_signal_centered() {
        let mut instrument = Instrument::new(InstrumentKind::Chip, false);
        instrument.effects = 0;
        let mut state = EffectsState::default();
        let mut dry = impulse(64);
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        state.process(
            &instrument,
            &EnvelopeValues::default(),
            &context(),
            &mut dry,
            &mut left,
            &mut right,
        );
        assert_eq!(left[0], 1.0);
        assert_eq!(right[0], 1.0);
        assert!(left[1..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn silent_input_with_no_state_is_skipped() {
        let instrument = Instrument::new(InstrumentKind::Chip, false);
        let mut state = EffectsState::default();
        let mut dry = vec![0.0; 64];
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        state.process(
            &instrument,
            &EnvelopeValues::default(),
            &context(),
            &mut dry,
            &mut left,
            &mut right,
        );
        assert!(!state.is_draining());
        assert!(left.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn reverb_leaves_a_draining_tail() {
        let mut instrument = Instrument::new(InstrumentKind::Chip, false);
        instrument.set_effect_enabled(EffectKind::Reverb, true);
        instrument.reverb = config::REVERB_RANGE;
        let mut state = EffectsState::default();
        let mut dry = impulse(1024);
        let mut left = vec![0.0; 1024];
        let mut right = vec![0.0; 1024];
        state.process(
            &instrument,
            &EnvelopeValues::default(),
            &context(),
            &mut dry,
            &mut left,
            &mut right,
        );
        assert!(state.is_draining());
        // Feed silence: the tail keeps sounding once the taps come around.
        let mut tail_energy = 0.0;
        for _ in 0..8 {
            let mut silence = vec![0.0; 1024];
            let mut tail_left = vec![0.0; 1024];
            let mut tail_right = vec![0.0; 1024];
            state.process(
                &instrument,
                &EnvelopeValues::default(),
                &context(),
                &mut silence,
                &mut tail_left,
                &mut tail_right,
            );
            tail_energy += tail_left.iter().map(|s| s * s).sum::<f64>();
        }
        assert_gt!(tail_energy, 0.0);
    }

    #[test]
    fn panning_sends_more_level_to_the_near_side() {
        let mut instrument = Instrument::new(InstrumentKind::Chip, false);
        instrument.effects = EffectKind::Panning.bit();
        instrument.pan = config::PAN_MAX; // hard right
        let mut state = EffectsState::default();
        let mut dry: Vec<f64> = (0..256).map(|i| (i as f64 * 0.3).sin()).collect();
        let mut left = vec![0.0; 256];
        let mut right = vec![0.0; 256];
        state.process(
            &instrument,
            &EnvelopeValues::default(),
            &context(),
            &mut dry,
            &mut left,
            &mut right,
        );
        let energy = |buffer: &[f64]| buffer.iter().map(|s| s * s).sum::<f64>();
        assert_gt!(energy(&right), energy(&left) * 100.0);
    }

    #[test]
    fn echo_repeats_at_the_configured_delay() {
        let mut instrument = Instrument::new(InstrumentKind::Chip, false);
        instrument.effects = EffectKind::Echo.bit();
        instrument.echo_delay = 0; // one step = 2 parts
        instrument.echo_sustain = config::ECHO_SUSTAIN_RANGE - 1;
        let mut state = EffectsState::default();
        let ctx = EffectsContext {
            sample_rate: 44100.0,
            samples_per_part: 50.0,
            key_base_freq: 440.0,
        };
        // Delay is 2 parts * 50 samples = 100 samples.
        let mut dry = impulse(512);
        let mut left = vec![0.0; 512];
        let mut right = vec![0.0; 512];
        state.process(
            &instrument,
            &EnvelopeValues::default(),
            &ctx,
            &mut dry,
            &mut left,
            &mut right,
        );
        assert_eq!(left[0], 1.0);
        assert_gt!(left[100].abs(), 0.1);
        assert_lt!(left[50].abs(), 1e-9);
    }

    #[test]
    fn distortion_compresses_peaks() {
        let mut instrument = Instrument::new(InstrumentKind::Chip, false);
        instrument.effects = EffectKind::Distortion.bit();
        instrument.distortion = config::DISTORTION_RANGE - 1;
        let mut state = EffectsState::default();
        let mut dry: Vec<f64> = (0..256).map(|i| (i as f64 * 0.2).sin() * 2.0).collect();
        let mut left = vec![0.0; 256];
        let mut right = vec![0.0; 256];
        state.process(
            &instrument,
            &EnvelopeValues::default(),
            &context(),
            &mut dry,
            &mut left,
            &mut right,
        );
        let peak = left.iter().cloned().fold(0.0f64, |a, b| a.max(b.abs()));
        assert_lt!(peak, 1.2);
        assert_gt!(peak, 0.5);
    }

    #[test]
    fn bitcrusher_latches_between_updates() {
        let mut instrument = Instrument::new(InstrumentKind::Chip, false);
        instrument.effects = EffectKind::Bitcrusher.bit();
        instrument.bitcrusher_freq = 0; // slowest latch rate
        let mut state = EffectsState::default();
        let mut dry: Vec<f64> = (0..64).map(|i| (i as f64 * 0.7).sin()).collect();
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        state.process(
            &instrument,
            &EnvelopeValues::default(),
            &context(),
            &mut dry,
            &mut left,
            &mut right,
        );
        // With a slow latch the output holds values over several samples.
        let distinct: std::collections::BTreeSet<u64> =
            left.iter().map(|s| s.to_bits()).collect();
        assert_lt!(distinct.len(), 64);
    }

    #[test]
    fn limiter_bounds_hot_signals() {
        let mut limiter = Limiter::new(44100.0);
        // The tracked limit starts at zero and overshoots while it rises,
        // so only measure the peak after the rise window.
        let mut peak = 0.0f64;
        for i in 0..44100 {
            let mut left = 10.0;
            let mut right = -10.0;
            limiter.process(1.0, &mut left, &mut right);
            if i >= 4410 {
                peak = peak.max(left.abs()).max(right.abs());
            }
        }
        assert_lt!(peak, 1.1);
        let mut settled_left = 10.0;
        let mut settled_right = -10.0;
        limiter.process(1.0, &mut settled_left, &mut settled_right);
        assert_lt!(settled_left.abs(), 1.1);
    }

    #[test]
    fn sanitize_flushes_denormal_effect_state() {
        let mut state = EffectsState::default();
        state.distortion_prev_input = 1.0e-30;
        state.bitcrusher_value = f64::INFINITY;
        state.reverb_shelf_samples[0] = -1.0e-30;
        state.sanitize();
        assert_eq!(state.distortion_prev_input, 0.0);
        assert_eq!(state.bitcrusher_value, 0.0);
        assert_eq!(state.reverb_shelf_samples[0], 0.0);
    }
}
