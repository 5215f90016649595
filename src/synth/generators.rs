// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The signal generators: one mono sample loop per instrument algorithm.
//!
//! Each generator reads the interpolation state that `compute_tone` set up
//! (phase deltas, expression ramps) and adds `buffer.len()` samples into
//! the instrument's dry buffer. Phases and ramp state are written back to
//! the tone so the next run continues where this one stopped. The note
//! filter runs afterward over the whole buffer, not inside these loops.
//!
//! Pitched wavetables store a running integral of the waveform; the reader
//! takes the difference across each output step divided by the step, which
//! averages the wave over the step and suppresses aliasing at high phase
//! increments. The analytic generators (pwm, supersaw) instead correct each
//! discontinuity with a two-sample polynomial (PolyBLEP).

use crate::{config, util::Rng};

use super::tone::Tone;

/// Chip and harmonics: an antialiasing wavetable reader with two unison
/// voices. `wave` holds the integrated table with a guard sample.
pub(super) fn render_wavetable(tone: &mut Tone, wave: &[f32], unison_sign: f64, buffer: &mut [f64]) {
    let wave_length = (wave.len() - 1) as f64;
    let mut phase_delta_a = tone.phase_deltas[0] * wave_length;
    let mut phase_delta_b = tone.phase_deltas[1] * wave_length;
    let phase_delta_scale = tone.phase_delta_scale;
    let mut expression = tone.expression_start;
    let expression_delta = tone.expression_delta;
    let mut phase_a = tone.phases[0].rem_euclid(1.0) * wave_length;
    let mut phase_b = tone.phases[1].rem_euclid(1.0) * wave_length;

    let integral_at = |phase: f64| -> f64 {
        let index = phase as usize % (wave.len() - 1);
        let fraction = phase - phase.floor();
        wave[index] as f64 + (wave[index + 1] as f64 - wave[index] as f64) * fraction
    };
    let mut prev_integral_a = integral_at(phase_a);
    let mut prev_integral_b = integral_at(phase_b);

    for sample in buffer.iter_mut() {
        phase_a = (phase_a + phase_delta_a) % wave_length;
        phase_b = (phase_b + phase_delta_b) % wave_length;
        let next_integral_a = integral_at(phase_a);
        let next_integral_b = integral_at(phase_b);
        let wave_a = (next_integral_a - prev_integral_a) / phase_delta_a;
        let wave_b = (next_integral_b - prev_integral_b) / phase_delta_b;
        prev_integral_a = next_integral_a;
        prev_integral_b = next_integral_b;
        *sample += (wave_a + wave_b * unison_sign) * expression;
        expression += expression_delta;
        phase_delta_a *= phase_delta_scale;
        phase_delta_b *= phase_delta_scale;
    }

    tone.phases[0] = phase_a / wave_length;
    tone.phases[1] = phase_b / wave_length;
    tone.phase_deltas[0] = phase_delta_a / wave_length;
    tone.phase_deltas[1] = phase_delta_b / wave_length;
    tone.expression_start = expression;
}

/// Band-limited pulse wave: the difference of two sawtooth readers offset
/// by the pulse width, each with PolyBLEP edge correction.
pub(super) fn render_pwm(tone: &mut Tone, buffer: &mut [f64]) {
    let mut phase_delta = tone.phase_deltas[0];
    let phase_delta_scale = tone.phase_delta_scale;
    let mut expression = tone.expression_start;
    let expression_delta = tone.expression_delta;
    let mut phase = tone.phases[0].rem_euclid(1.0);
    let mut pulse_width = tone.pulse_width;
    let pulse_width_delta = tone.pulse_width_delta;

    for sample in buffer.iter_mut() {
        let saw_phase_a = phase % 1.0;
        let saw_phase_b = (phase + pulse_width) % 1.0;
        let mut pulse_wave = saw_phase_b - saw_phase_a;
        if saw_phase_a < phase_delta {
            let t = saw_phase_a / phase_delta;
            pulse_wave += (t + t - t * t - 1.0) * 0.5;
        } else if saw_phase_a > 1.0 - phase_delta {
            let t = (saw_phase_a - 1.0) / phase_delta;
            pulse_wave += (t + t + t * t + 1.0) * 0.5;
        }
        if saw_phase_b < phase_delta {
            let t = saw_phase_b / phase_delta;
            pulse_wave -= (t + t - t * t - 1.0) * 0.5;
        } else if saw_phase_b > 1.0 - phase_delta {
            let t = (saw_phase_b - 1.0) / phase_delta;
            pulse_wave -= (t + t + t * t + 1.0) * 0.5;
        }
        *sample += pulse_wave * expression;
        phase += phase_delta;
        pulse_width += pulse_width_delta;
        expression += expression_delta;
        phase_delta *= phase_delta_scale;
    }

    tone.phases[0] = phase.rem_euclid(1.0);
    tone.phase_deltas[0] = phase_delta;
    tone.pulse_width = pulse_width;
    tone.expression_start = expression;
}

/// Four-operator phase modulation, driven by the algorithm and feedback
/// wiring tables instead of generated code. Operators are evaluated from
/// the highest index down, so every modulator's output exists before the
/// operator it modulates.
pub(super) fn render_fm(
    tone: &mut Tone,
    algorithm: &config::Algorithm,
    feedback: &config::Feedback,
    buffer: &mut [f64],
) {
    let sine = &*config::SINE_WAVE;
    let sine_length = config::SINE_WAVE_LENGTH as f64;
    let mut phases = tone.phases.map(|phase| phase.rem_euclid(1.0) * sine_length);
    let mut phase_deltas = tone.phase_deltas.map(|delta| delta * sine_length);
    let mut expressions = tone.expression_starts;
    let expression_deltas = tone.expression_deltas;
    let mut feedback_mult = tone.feedback_mult;
    let feedback_delta = tone.feedback_delta;
    let phase_delta_scale = tone.phase_delta_scale;
    let mut feedback_outputs = tone.feedback_outputs;

    let lookup = |phase_mix: f64| -> f64 {
        let wrapped = phase_mix.rem_euclid(sine_length);
        let index = wrapped as usize & config::SINE_WAVE_MASK;
        let fraction = wrapped - wrapped.floor();
        sine[index] as f64 + (sine[index + 1] as f64 - sine[index] as f64) * fraction
    };

    for sample in buffer.iter_mut() {
        let mut outputs = [0.0; config::OPERATOR_COUNT];
        let mut carrier_sum = 0.0;
        for op in (0..config::OPERATOR_COUNT).rev() {
            let mut phase_mix = phases[op];
            for &modulator in algorithm.modulated_by[op] {
                phase_mix += outputs[modulator - 1];
            }
            for &source in feedback.indices[op] {
                phase_mix += feedback_outputs[source - 1] * feedback_mult;
            }
            outputs[op] = lookup(phase_mix) * expressions[op];
            if op < algorithm.carrier_count {
                carrier_sum += outputs[op];
            }
            phases[op] = (phases[op] + phase_deltas[op]) % sine_length;
            phase_deltas[op] *= phase_delta_scale;
            expressions[op] += expression_deltas[op];
        }
        feedback_outputs = outputs;
        feedback_mult += feedback_delta;
        *sample += carrier_sum;
    }

    for op in 0..config::OPERATOR_COUNT {
        tone.phases[op] = phases[op] / sine_length;
        tone.phase_deltas[op] = phase_deltas[op] / sine_length;
        tone.expression_starts[op] = expressions[op];
    }
    tone.feedback_outputs = feedback_outputs;
    tone.feedback_mult = feedback_mult;
}

/// Basic wavetable noise with a one-pole filter whose cutoff tracks the
/// playback pitch, so low drums rumble instead of hissing.
pub(super) fn render_noise(
    tone: &mut Tone,
    wave: &[f32],
    pitch_filter_mult: f64,
    buffer: &mut [f64],
) {
    let mask = config::CHIP_NOISE_LENGTH - 1;
    let mut phase_delta = tone.phase_deltas[0];
    let phase_delta_scale = tone.phase_delta_scale;
    let mut expression = tone.expression_start;
    let expression_delta = tone.expression_delta;
    let mut phase = tone.phases[0];
    let mut filter_sample = tone.sample;
    let pitch_relative_filter = (phase_delta * pitch_filter_mult).min(1.0);

    for sample in buffer.iter_mut() {
        let wave_sample = wave[phase as usize & mask] as f64;
        filter_sample += (wave_sample - filter_sample) * pitch_relative_filter;
        *sample += filter_sample * expression;
        phase += phase_delta;
        expression += expression_delta;
        phase_delta *= phase_delta_scale;
    }

    tone.phases[0] = phase % config::CHIP_NOISE_LENGTH as f64;
    tone.phase_deltas[0] = phase_delta;
    tone.expression_start = expression;
    tone.sample = filter_sample;
}

/// Spectrum and drumset: an interpolating reader over a rendered noise
/// table. Spectrum tones additionally low-pass relative to pitch; drumset
/// tones play their table unfiltered.
pub(super) fn render_spectrum(
    tone: &mut Tone,
    wave: &[f32],
    apply_pitch_filter: bool,
    buffer: &mut [f64],
) {
    let wave_length = (wave.len() - 1) as f64;
    let mut phase_delta = tone.phase_deltas[0];
    let phase_delta_scale = tone.phase_delta_scale;
    let mut expression = tone.expression_start;
    let expression_delta = tone.expression_delta;
    let mut phase = tone.phases[0];
    let mut filter_sample = tone.sample;
    let pitch_relative_filter = if apply_pitch_filter {
        phase_delta.min(1.0)
    } else {
        1.0
    };

    for sample in buffer.iter_mut() {
        let index = phase as usize % (wave.len() - 1);
        let fraction = phase - phase.floor();
        let wave_sample =
            wave[index] as f64 + (wave[index + 1] as f64 - wave[index] as f64) * fraction;
        filter_sample += (wave_sample - filter_sample) * pitch_relative_filter;
        *sample += filter_sample * expression;
        phase = (phase + phase_delta) % wave_length;
        expression += expression_delta;
        phase_delta *= phase_delta_scale;
    }

    tone.phases[0] = phase;
    tone.phase_deltas[0] = phase_delta;
    tone.expression_start = expression;
    tone.sample = filter_sample;
}

/// Several detuned PolyBLEP sawtooths. The center voice is always at full
/// strength; dynamism brings the side voices in. The summed stack feeds a
/// short delay line whose delayed copy is subtracted according to the shape
/// setting, morphing the saw stack toward a comb-filtered pulse.
pub(super) fn render_supersaw(tone: &mut Tone, buffer: &mut [f64]) {
    let base_delta = tone.phase_deltas[0];
    let phase_delta_scale = tone.phase_delta_scale;
    let mut expression = tone.expression_start;
    let expression_delta = tone.expression_delta;
    let mut dynamism = tone.supersaw_dynamism;
    let dynamism_delta = tone.supersaw_dynamism_delta;
    let mut shape = tone.supersaw_shape;
    let shape_delta = tone.supersaw_shape_delta;
    let mut delay_length = tone.supersaw_delay_length;
    let delay_length_delta = tone.supersaw_delay_length_delta;
    let mask = tone.supersaw_delay_line.len() - 1;
    let mut delay_index = tone.supersaw_delay_index;
    let mut phase_delta_mult = 1.0;

    for sample in buffer.iter_mut() {
        let mut saw_sum = 0.0;
        for voice in 0..config::SUPERSAW_VOICE_COUNT {
            let delta = base_delta * phase_delta_mult * (1.0 + tone.supersaw_unison_detunes[voice]);
            let mut phase = tone.supersaw_phases[voice] % 1.0;
            let mut saw = phase + phase - 1.0;
            if phase < delta {
                let t = phase / delta;
                saw -= t + t - t * t - 1.0;
            } else if phase > 1.0 - delta {
                let t = (phase - 1.0) / delta;
                saw -= t + t + t * t + 1.0;
            }
            phase += delta;
            tone.supersaw_phases[voice] = phase;
            saw_sum += if voice == 0 { saw } else { saw * dynamism };
        }
        // Normalize so full dynamism is no louder than a single saw.
        let normalized =
            saw_sum / (1.0 + (config::SUPERSAW_VOICE_COUNT - 1) as f64 * dynamism * 0.5);

        tone.supersaw_delay_line[delay_index] = normalized as f32;
        let read_position = delay_index as f64 - delay_length;
        let read_index = read_position.floor() as isize;
        let read_fraction = read_position - read_position.floor();
        let tap0 = tone.supersaw_delay_line[(read_index as usize) & mask] as f64;
        let tap1 = tone.supersaw_delay_line[(read_index as usize).wrapping_add(1) & mask] as f64;
        let delayed = tap0 + (tap1 - tap0) * read_fraction;
        delay_index = (delay_index + 1) & mask;

        *sample += (normalized - shape * delayed) * expression;
        expression += expression_delta;
        dynamism += dynamism_delta;
        shape += shape_delta;
        delay_length += delay_length_delta;
        phase_delta_mult *= phase_delta_scale;
    }

    tone.phase_deltas[0] = base_delta * phase_delta_mult;
    tone.expression_start = expression;
    tone.supersaw_dynamism = dynamism;
    tone.supersaw_shape = shape;
    tone.supersaw_delay_length = delay_length;
    tone.supersaw_delay_index = delay_index;
}

/// The picked string: a fractional-delay feedback loop with an all-pass
/// for dispersion and a one-pole shelf plus sustain gain for decay. The
/// pluck itself is injected into the delay line by `compute_tone` at
/// genuine attacks, so this loop only circulates and reads.
pub(super) fn render_string(
    tone: &mut Tone,
    sustain_gain: f64,
    shelf_coefficient: f64,
    all_pass_coefficient: f64,
    buffer: &mut [f64],
) {
    let mask = tone.string.delay_line.len() - 1;
    let delay_length = tone.string.delay_length;
    let mut expression = tone.expression_start;
    let expression_delta = tone.expression_delta;
    let mut delay_index = tone.string.delay_index;
    let mut all_pass_sample = tone.string.all_pass_sample;
    let mut all_pass_prev_input = tone.string.all_pass_prev_input;
    let mut shelf_sample = tone.string.shelf_sample;

    for sample in buffer.iter_mut() {
        let read_position = delay_index as f64 - delay_length;
        let read_index = read_position.floor() as isize;
        let read_fraction = read_position - read_position.floor();
        let tap0 = tone.string.delay_line[(read_index as usize) & mask] as f64;
        let tap1 = tone.string.delay_line[(read_index as usize).wrapping_add(1) & mask] as f64;
        let delayed = tap0 + (tap1 - tap0) * read_fraction;

        // First-order all-pass smears high partials slightly out of tune,
        // which reads as stiffness in the string.
        let dispersed =
            all_pass_coefficient * delayed + all_pass_prev_input - all_pass_coefficient * all_pass_sample;
        all_pass_prev_input = delayed;
        all_pass_sample = dispersed;

        shelf_sample += (dispersed - shelf_sample) * shelf_coefficient;
        tone.string.delay_line[delay_index] = (shelf_sample * sustain_gain) as f32;
        delay_index = (delay_index + 1) & mask;

        *sample += delayed * expression;
        expression += expression_delta;
    }

    tone.string.delay_index = delay_index;
    tone.string.all_pass_sample = all_pass_sample;
    tone.string.all_pass_prev_input = all_pass_prev_input;
    tone.string.shelf_sample = shelf_sample;
    tone.expression_start = expression;
}

/// Picks a starting phase for a noise table at a zero crossing, so attacks
/// do not click. Scans with a wide stride first, then refines linearly and
/// intersects the final segment.
pub(super) fn find_random_zero_crossing(wave: &[f32], wave_length: usize, rng: &mut Rng) -> f64 {
    let mut phase = rng.rand_float() * wave_length as f64;
    let mask = wave_length - 1;
    let mut wave_prev = wave[phase as usize & mask];
    let was_positive = wave_prev > 0.0;
    let stride = 16;
    let mut found = false;
    for _ in 0..128 {
        let next_phase = phase + stride as f64;
        let wave_next = wave[next_phase as usize & mask];
        if (wave_next > 0.0) != was_positive {
            found = true;
            break;
        }
        phase = next_phase;
        wave_prev = wave_next;
    }
    if !found {
        return phase;
    }
    for _ in 0..stride {
        let next_phase = phase + 1.0;
        let wave_next = wave[next_phase as usize & mask];
        if (wave_next > 0.0) != was_positive {
            // Linear intersection within the final one-sample segment.
            let slope = wave_next - wave_prev;
            if slope.abs() > 1e-9 {
                phase += (-wave_prev / slope) as f64;
            }
            break;
        }
        phase = next_phase;
        wave_prev = wave_next;
    }
    phase % wave_length as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_gt, assert_lt};

    fn run_tone() -> Tone {
        let mut tone = Tone::default();
        tone.expression_start = 1.0;
        tone.expression_delta = 0.0;
        tone.phase_delta_scale = 1.0;
        tone
    }

    #[test]
    fn wavetable_reader_recovers_the_wave() {
        // A pure saw integral read slowly reproduces a saw ramp.
        let square = &config::CHIP_WAVES[2].samples;
        let mut tone = run_tone();
        tone.phase_deltas[0] = 0.01;
        tone.phase_deltas[1] = 0.01;
        let mut buffer = vec![0.0; 400];
        render_wavetable(&mut tone, square, 0.0, &mut buffer);
        let max = buffer.iter().cloned().fold(f64::MIN, f64::max);
        let min = buffer.iter().cloned().fold(f64::MAX, f64::min);
        assert_gt!(max, 0.5);
        assert_lt!(min, -0.5);
        // Zero-mean over whole cycles.
        let mean: f64 = buffer.iter().sum::<f64>() / buffer.len() as f64;
        assert_lt!(mean.abs(), 0.05);
    }

    #[test]
    fn pwm_output_is_bounded_and_bipolar() {
        let mut tone = run_tone();
        tone.phase_deltas[0] = 440.0 / 44100.0;
        tone.pulse_width = 0.25;
        let mut buffer = vec![0.0; 2048];
        render_pwm(&mut tone, &mut buffer);
        assert!(buffer.iter().all(|s| s.abs() < 1.5));
        assert_gt!(buffer.iter().cloned().fold(f64::MIN, f64::max), 0.2);
        assert_lt!(buffer.iter().cloned().fold(f64::MAX, f64::min), -0.2);
    }

    #[test]
    fn fm_without_modulators_is_a_sine() {
        let mut tone = run_tone();
        // Single carrier, no modulation, no feedback.
        tone.phase_deltas[0] = 1.0 / 256.0;
        tone.expression_starts[0] = 1.0;
        let algorithm = &config::ALGORITHMS[12]; // "1 2 3 4"
        let feedback = &config::FEEDBACKS[0];
        let mut buffer = vec![0.0; 256];
        render_fm(&mut tone, algorithm, feedback, &mut buffer);
        // One full cycle of a sine: peak near 1, mean near 0.
        let max = buffer.iter().cloned().fold(f64::MIN, f64::max);
        assert!((max - 1.0).abs() < 0.01);
        let mean: f64 = buffer.iter().sum::<f64>() / buffer.len() as f64;
        assert_lt!(mean.abs(), 0.01);
    }

    #[test]
    fn fm_modulation_adds_harmonics() {
        let mut carrier_only = run_tone();
        carrier_only.phase_deltas[0] = 1.0 / 64.0;
        carrier_only.expression_starts[0] = 1.0;
        let mut modulated = run_tone();
        modulated.phase_deltas[0] = 1.0 / 64.0;
        modulated.phase_deltas[1] = 2.0 / 64.0;
        modulated.expression_starts[0] = 1.0;
        modulated.expression_starts[1] = config::SINE_WAVE_LENGTH as f64 * 1.5;
        let algorithm = &config::ALGORITHMS[4]; // "1←2←3←4"
        let feedback = &config::FEEDBACKS[0];
        let mut plain = vec![0.0; 512];
        let mut rich = vec![0.0; 512];
        render_fm(&mut carrier_only, algorithm, feedback, &mut plain);
        render_fm(&mut modulated, algorithm, feedback, &mut rich);
        assert_ne!(plain, rich);
    }

    #[test]
    fn noise_filter_tracks_pitch() {
        let wave = config::chip_noise_samples(1);
        let mut slow = run_tone();
        slow.phase_deltas[0] = 0.01;
        let mut fast = run_tone();
        fast.phase_deltas[0] = 4.0;
        let mut low_buffer = vec![0.0; 4096];
        let mut high_buffer = vec![0.0; 4096];
        render_noise(&mut slow, wave, 8.0, &mut low_buffer);
        render_noise(&mut fast, wave, 8.0, &mut high_buffer);
        // The low tone's one-pole filter smooths adjacent samples far more.
        let roughness = |buffer: &[f64]| {
            buffer
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).abs())
                .sum::<f64>()
        };
        assert_lt!(roughness(&low_buffer), roughness(&high_buffer));
    }

    #[test]
    fn supersaw_shape_subtracts_delayed_copy() {
        let mut saw = run_tone();
        saw.phase_deltas[0] = 0.01;
        saw.supersaw_delay_line = vec![0.0; 1024];
        saw.supersaw_dynamism = 1.0;
        saw.supersaw_delay_length = 30.0;
        let mut pulse = run_tone();
        pulse.phase_deltas[0] = 0.01;
        pulse.supersaw_delay_line = vec![0.0; 1024];
        pulse.supersaw_dynamism = 1.0;
        pulse.supersaw_delay_length = 30.0;
        pulse.supersaw_shape = 1.0;
        let mut saw_buffer = vec![0.0; 512];
        let mut pulse_buffer = vec![0.0; 512];
        render_supersaw(&mut saw, &mut saw_buffer);
        render_supersaw(&mut pulse, &mut pulse_buffer);
        assert_ne!(saw_buffer, pulse_buffer);
        assert!(pulse_buffer.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn string_loop_decays() {
        let mut tone = run_tone();
        tone.expression_start = 1.0;
        tone.string.delay_line = vec![0.0; 256];
        tone.string.delay_length = 100.0;
        // A crude pluck.
        for i in 0..100 {
            tone.string.delay_line[i] = if i < 50 { 0.5 } else { -0.5 };
        }
        let mut early = vec![0.0; 512];
        render_string(&mut tone, 0.9, 0.5, -0.5, &mut early);
        let mut late = vec![0.0; 512];
        render_string(&mut tone, 0.9, 0.5, -0.5, &mut late);
        let energy = |buffer: &[f64]| buffer.iter().map(|s| s * s).sum::<f64>();
        assert_gt!(energy(&early), energy(&late));
        assert_gt!(energy(&early), 0.0);
    }

    #[test]
    fn zero_crossing_start_is_quiet() {
        let wave = config::chip_noise_samples(0);
        let mut rng = Rng::new_with_seed(11);
        for _ in 0..8 {
            let phase = find_random_zero_crossing(wave, config::CHIP_NOISE_LENGTH, &mut rng);
            let index = phase as usize & (config::CHIP_NOISE_LENGTH - 1);
            let fraction = phase - phase.floor();
            let next = (index + 1) & (config::CHIP_NOISE_LENGTH - 1);
            let value =
                wave[index] as f64 + (wave[next] as f64 - wave[index] as f64) * fraction;
            assert_lt!(value.abs(), 1.01);
            assert!((0.0..config::CHIP_NOISE_LENGTH as f64).contains(&phase));
        }
    }
}
