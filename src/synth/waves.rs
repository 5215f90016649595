// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Wavetables rendered from user-designed spectra and harmonic series.
//!
//! Unlike the fixed chip tables in [crate::config], these depend on
//! instrument settings, so they are rendered on demand and cached alongside
//! the instrument's runtime state. The cache key is the design itself: when
//! an editor mutates the design, the next render notices the difference and
//! rebuilds, so edits land at the next buffer boundary without a dirty
//! flag.

use crate::{
    config,
    song::{HarmonicsWave, SpectrumWave},
    util::fft,
};

/// Renders a spectrum design into a noise wavetable. `lowest_octave`
/// positions the first control point within the frequency space of the
/// table.
pub(super) fn render_spectrum_wave(design: &SpectrumWave, lowest_octave: f64) -> Vec<f32> {
    let wave_length = config::SPECTRUM_NOISE_LENGTH;
    let mut wave = vec![0.0f32; wave_length];
    let highest_octave = 14.0;
    let falloff_ratio = 0.25;
    // Tweak the spacing so some control points land on consonant intervals
    // instead of an even grid.
    let pitch_tweak = [
        0.0,
        1.0 / 7.0,
        (5.0f64 / 4.0).log2(),
        3.0 / 7.0,
        (3.0f64 / 2.0).log2(),
        5.0 / 7.0,
        6.0 / 7.0,
    ];
    let control_point_octave = |index: i32| -> f64 {
        lowest_octave
            + (index.div_euclid(config::SPECTRUM_CONTROL_POINTS_PER_OCTAVE as i32)) as f64
            + pitch_tweak[index.rem_euclid(config::SPECTRUM_CONTROL_POINTS_PER_OCTAVE as i32)
                as usize]
    };
    let point = |index: usize| -> f64 {
        design
            .spectrum
            .get(index)
            .copied()
            .unwrap_or(0)
            .min(config::SPECTRUM_MAX) as f64
            / config::SPECTRUM_MAX as f64
    };

    let mut combined_amplitude = 1.0;
    for i in 0..=config::SPECTRUM_CONTROL_POINTS {
        let value1 = if i > 0 { point(i - 1) } else { 0.0 };
        let value2 = if i < config::SPECTRUM_CONTROL_POINTS {
            point(i)
        } else {
            point(config::SPECTRUM_CONTROL_POINTS - 1)
        };
        let octave1 = control_point_octave(i as i32 - 1);
        let mut octave2 = control_point_octave(i as i32);
        if i >= config::SPECTRUM_CONTROL_POINTS {
            octave2 = highest_octave + (octave2 - highest_octave) * falloff_ratio;
        }
        if value1 == 0.0 && value2 == 0.0 {
            continue;
        }
        combined_amplitude +=
            0.02 * config::draw_noise_spectrum(&mut wave, octave1, octave2, value1, value2, -0.5);
    }
    // The last control point trails off toward the top of the spectrum.
    if point(config::SPECTRUM_CONTROL_POINTS - 1) > 0.0 {
        let last = point(config::SPECTRUM_CONTROL_POINTS - 1);
        let octave1 = highest_octave
            + (control_point_octave(config::SPECTRUM_CONTROL_POINTS as i32) - highest_octave)
                * falloff_ratio;
        combined_amplitude +=
            0.02 * config::draw_noise_spectrum(&mut wave, octave1, highest_octave, last, last, -0.5);
    }

    fft::inverse_real_fourier_transform(&mut wave);
    fft::scale_elements_by_factor(
        &mut wave,
        (5.0 / ((wave_length as f64).sqrt() * combined_amplitude.powf(0.75))) as f32,
    );
    wave.push(wave[0]);
    wave
}

/// Renders a harmonic series into an integrated wavetable ready for the
/// antialiasing wavetable reader, like the chip tables.
pub(super) fn render_harmonics_wave(design: &HarmonicsWave) -> Vec<f32> {
    let wave_length = config::HARMONICS_WAVELENGTH;
    let mut wave = vec![0.0f32; wave_length];
    let retro = config::chip_noise_samples(0);
    let overall_slope = -0.25;
    let mut combined_control_point_amplitude = 1.0f64;

    for harmonic_index in 0..config::HARMONICS_RENDERED {
        let harmonic_freq = harmonic_index + 1;
        let mut control_value = if harmonic_index < config::HARMONICS_CONTROL_POINTS {
            design.harmonics.get(harmonic_index).copied().unwrap_or(0) as f64
        } else {
            // Partials past the designed range carry on from the last
            // control point, fading toward nothing.
            let last = design
                .harmonics
                .get(config::HARMONICS_CONTROL_POINTS - 1)
                .copied()
                .unwrap_or(0) as f64;
            last * (1.0
                - (harmonic_index - config::HARMONICS_CONTROL_POINTS) as f64
                    / (config::HARMONICS_RENDERED - config::HARMONICS_CONTROL_POINTS) as f64)
        };
        control_value = control_value.min(config::HARMONICS_MAX as f64);
        let normalized = control_value / config::HARMONICS_MAX as f64;
        let mut amplitude =
            2.0f64.powf(control_value - config::HARMONICS_MAX as f64 + 1.0) * normalized.sqrt();
        if harmonic_index < config::HARMONICS_CONTROL_POINTS {
            combined_control_point_amplitude += amplitude;
        }
        amplitude *= (harmonic_freq as f64).powf(overall_slope);
        // Deterministic sign flips keep the summed partials from all
        // peaking at phase zero.
        amplitude *= retro[harmonic_index + 589] as f64;
        wave[wave_length - harmonic_freq] = amplitude as f32;
    }

    fft::inverse_real_fourier_transform(&mut wave);
    let mult = (1.0 / combined_control_point_amplitude.powf(0.7)) as f32;
    fft::scale_elements_by_factor(&mut wave, mult);
    config::perform_integral(&mut wave);
    wave.push(wave[0]);
    wave
}

/// Per-instrument cache of rendered design wavetables.
#[derive(Debug, Default)]
pub(super) struct RenderedWaves {
    spectrum: Option<(SpectrumWave, Vec<f32>)>,
    harmonics: Option<(HarmonicsWave, Vec<f32>)>,
    drumset: Vec<Option<(SpectrumWave, Vec<f32>)>>,
}
impl RenderedWaves {
    /// The wavetable for a spectrum instrument, rebuilt if the design has
    /// changed since the last render.
    pub fn spectrum(&mut self, design: &SpectrumWave) -> &[f32] {
        let stale = match &self.spectrum {
            Some((cached, _)) => cached != design,
            None => true,
        };
        if stale {
            self.spectrum = Some((design.clone(), render_spectrum_wave(design, 3.0)));
        }
        &self.spectrum.as_ref().unwrap().1
    }

    /// The integrated wavetable for a harmonics (or picked string)
    /// instrument.
    pub fn harmonics(&mut self, design: &HarmonicsWave) -> &[f32] {
        let stale = match &self.harmonics {
            Some((cached, _)) => cached != design,
            None => true,
        };
        if stale {
            self.harmonics = Some((design.clone(), render_harmonics_wave(design)));
        }
        &self.harmonics.as_ref().unwrap().1
    }

    /// The wavetable for one drum of a drumset. Higher drums position their
    /// spectrum higher in the frequency space.
    pub fn drumset(&mut self, drum: usize, design: &SpectrumWave) -> &[f32] {
        if self.drumset.len() < config::DRUM_COUNT {
            self.drumset.resize_with(config::DRUM_COUNT, || None);
        }
        let drum = drum.min(config::DRUM_COUNT - 1);
        let stale = match &self.drumset[drum] {
            Some((cached, _)) => cached != design,
            None => true,
        };
        if stale {
            let lowest_octave = 2.0 + drum as f64 / 6.0;
            self.drumset[drum] = Some((design.clone(), render_spectrum_wave(design, lowest_octave)));
        }
        &self.drumset[drum].as_ref().unwrap().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_gt, assert_lt};

    #[test]
    fn spectrum_wave_has_guard_sample_and_energy() {
        let design = SpectrumWave::default_for_channel(true);
        let wave = render_spectrum_wave(&design, 3.0);
        assert_eq!(wave.len(), config::SPECTRUM_NOISE_LENGTH + 1);
        assert_eq!(wave[0], wave[config::SPECTRUM_NOISE_LENGTH]);
        let rms = (wave.iter().map(|s| (*s as f64).powi(2)).sum::<f64>()
            / wave.len() as f64)
            .sqrt();
        assert_gt!(rms, 0.01);
        assert_lt!(rms, 10.0);
    }

    #[test]
    fn silent_spectrum_renders_silence() {
        let design = SpectrumWave {
            spectrum: vec![0; config::SPECTRUM_CONTROL_POINTS],
        };
        let wave = render_spectrum_wave(&design, 3.0);
        assert!(wave.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn harmonics_wave_is_integrated() {
        let wave = render_harmonics_wave(&HarmonicsWave::default());
        assert_eq!(wave.len(), config::HARMONICS_WAVELENGTH + 1);
        // An integral of a zero-mean wave wraps around to its start value.
        assert!((wave[0] - wave[config::HARMONICS_WAVELENGTH]).abs() < 1e-3);
        // The underlying (differentiated) wave has energy.
        let energy: f64 = wave
            .windows(2)
            .map(|pair| ((pair[1] - pair[0]) as f64).powi(2))
            .sum();
        assert_gt!(energy, 0.0);
    }

    #[test]
    fn cache_rebuilds_only_on_change() {
        let mut waves = RenderedWaves::default();
        let design = HarmonicsWave::default();
        let first = waves.harmonics(&design).as_ptr();
        let second = waves.harmonics(&design).as_ptr();
        assert_eq!(first, second);
        let mut changed = design.clone();
        changed.harmonics[1] = config::HARMONICS_MAX;
        let rebuilt = waves.harmonics(&changed).to_vec();
        assert_ne!(rebuilt, render_harmonics_wave(&design));
    }

    #[test]
    fn drumset_drums_render_independently() {
        let mut waves = RenderedWaves::default();
        let design = SpectrumWave::default_for_channel(true);
        let low: Vec<f32> = waves.drumset(0, &design).to_vec();
        let high: Vec<f32> = waves.drumset(11, &design).to_vec();
        assert_ne!(low, high);
    }
}
