// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Instruments: the per-channel sound design half of the composition model.
//!
//! An [Instrument] is a bundle of settings discriminated by its
//! [InstrumentKind]. All settings are plain table indices or slider values
//! in the ranges declared in [crate::config]; nothing here allocates
//! runtime audio state. The synthesis engine derives its per-tick state
//! from these settings and the codec round-trips them.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumCount, EnumIter, FromRepr};

use crate::config;

/// The synthesis algorithm an instrument uses.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    EnumCount,
    EnumIter,
    FromRepr,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum InstrumentKind {
    /// Wavetable playback of a small set of classic waveforms.
    #[default]
    Chip,
    /// Four-operator phase modulation.
    Fm,
    /// Basic wavetable noise.
    Noise,
    /// Noise with a user-designed spectrum.
    Spectrum,
    /// Twelve spectrum-designed drums, one per pitch row.
    Drumset,
    /// Additive synthesis from harmonic amplitudes.
    Harmonics,
    /// Band-limited pulse wave with adjustable width.
    Pwm,
    /// A plucked-string physical model.
    PickedString,
    /// Several detuned sawtooths through a comb filter.
    Supersaw,
}
impl InstrumentKind {
    /// Whether this kind is selectable in a noise channel.
    pub fn fits_noise_channel(&self) -> bool {
        matches!(self, Self::Noise | Self::Spectrum | Self::Drumset)
    }

    /// Whether this kind is selectable in a pitched channel.
    pub fn fits_pitch_channel(&self) -> bool {
        !matches!(self, Self::Noise | Self::Drumset)
    }

    /// Baseline output level for this kind.
    pub fn base_expression(&self) -> f64 {
        match self {
            Self::Chip => config::CHIP_BASE_EXPRESSION,
            Self::Fm => config::FM_BASE_EXPRESSION,
            Self::Noise => config::NOISE_BASE_EXPRESSION,
            Self::Spectrum => config::SPECTRUM_BASE_EXPRESSION,
            Self::Drumset => config::DRUMSET_BASE_EXPRESSION,
            Self::Harmonics => config::HARMONICS_BASE_EXPRESSION,
            Self::Pwm => config::PWM_BASE_EXPRESSION,
            Self::PickedString => config::STRING_BASE_EXPRESSION,
            Self::Supersaw => config::SUPERSAW_BASE_EXPRESSION,
        }
    }
}

/// One bypassable stage of the effects chain. The discriminant is the
/// stage's bit in the enabled-effects mask.
#[derive(
    Clone, Copy, Debug, Display, EnumCount, EnumIter, FromRepr, PartialEq, Eq, Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum EffectKind {
    /// Feedback-delay-network reverb.
    Reverb,
    /// Modulated multi-tap chorus.
    Chorus,
    /// Stereo pan with inter-aural delay.
    Panning,
    /// Oversampled soft-clip distortion.
    Distortion,
    /// Sample-rate and depth reduction.
    Bitcrusher,
    /// Tempo-synced feedback echo.
    Echo,
    /// The equalizer biquad cascade.
    Eq,
}
impl EffectKind {
    /// This effect's bit in an instrument's enabled-effects mask.
    pub fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

/// The order effects run in when enabled. Distortion first so later stages
/// smear its harmonics; the delay effects last.
pub const EFFECT_PIPELINE_ORDER: [EffectKind; 7] = [
    EffectKind::Distortion,
    EffectKind::Bitcrusher,
    EffectKind::Eq,
    EffectKind::Panning,
    EffectKind::Chorus,
    EffectKind::Echo,
    EffectKind::Reverb,
];

/// The response curve of one filter control point.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumCount, FromRepr, PartialEq, Eq, Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FilterType {
    /// Passes below the corner frequency.
    #[default]
    LowPass,
    /// Passes above the corner frequency.
    HighPass,
    /// Boosts or cuts around the center frequency.
    Peak,
}

/// One point in a filter chain: a second-order section with a frequency
/// setting and a gain setting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilterControlPoint {
    /// Response curve.
    pub kind: FilterType,
    /// Frequency setting, within [config::FILTER_FREQ_RANGE].
    pub freq: usize,
    /// Gain setting, within [config::FILTER_GAIN_RANGE].
    pub gain: usize,
}
impl FilterControlPoint {
    /// Creates a control point, clamping settings into range.
    pub fn new(kind: FilterType, freq: usize, gain: usize) -> Self {
        Self {
            kind,
            freq: freq.min(config::FILTER_FREQ_RANGE - 1),
            gain: gain.min(config::FILTER_GAIN_RANGE - 1),
        }
    }

    /// The corner/center frequency in Hz.
    pub fn hz(&self) -> f64 {
        config::filter_freq_setting_to_hz(self.freq as f64)
    }

    /// The linear gain.
    pub fn linear_gain(&self) -> f64 {
        config::filter_gain_setting_to_linear(self.gain as f64)
    }
}

/// An ordered chain of filter control points. Instruments carry two: the
/// equalizer (in the effects chain) and the note filter (inside each tone).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilterSettings {
    /// The control points, applied in order.
    pub points: Vec<FilterControlPoint>,
}
impl FilterSettings {
    /// A chain with a single low-pass point, the shape legacy songs are
    /// migrated to.
    pub fn single_low_pass(freq: usize, gain: usize) -> Self {
        Self {
            points: vec![FilterControlPoint::new(FilterType::LowPass, freq, gain)],
        }
    }

    /// Adds a point, ignoring it if the chain is full.
    pub fn push(&mut self, point: FilterControlPoint) {
        if self.points.len() < config::FILTER_MAX_POINTS {
            self.points.push(point);
        }
    }
}

/// A parameter that an envelope can automate.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumCount, EnumIter, FromRepr, PartialEq, Eq,
    Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum AutomationTarget {
    /// Automates nothing.
    #[default]
    None,
    /// The note's output level.
    NoteVolume,
    /// A note filter point's frequency. Indexed by control point.
    NoteFilterFreq,
    /// A note filter point's gain. Indexed by control point.
    NoteFilterGain,
    /// The pulse generator's duty cycle.
    PulseWidth,
    /// Vibrato depth.
    VibratoDepth,
    /// An FM operator's amplitude. Indexed by operator.
    OperatorAmplitude,
    /// An FM operator's frequency. Indexed by operator.
    OperatorFrequency,
    /// Whole-tone pitch shift.
    PitchShift,
    /// Fine detune.
    Detune,
    /// The string model's sustain.
    StringSustain,
    /// The bitcrusher's latch rate.
    BitcrusherFrequency,
    /// The bitcrusher's quantization depth.
    BitcrusherQuantization,
    /// The chorus send.
    Chorus,
    /// The echo feedback amount.
    EchoSustain,
    /// The reverb send.
    Reverb,
    /// The supersaw's saw-versus-pulse shape.
    SupersawShape,
    /// The supersaw's detune spread.
    SupersawSpread,
    /// The supersaw's dynamism (center versus side voices).
    SupersawDynamism,
}
impl AutomationTarget {
    /// How many per-instrument instances this target has (filter points,
    /// operators). Unindexed targets have one.
    pub fn max_index(&self) -> usize {
        match self {
            Self::NoteFilterFreq | Self::NoteFilterGain => config::FILTER_MAX_POINTS,
            Self::OperatorAmplitude | Self::OperatorFrequency => config::OPERATOR_COUNT,
            _ => 1,
        }
    }
}

/// One envelope assignment: a target parameter, which instance of it, and
/// the envelope curve to apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnvelopeAssignment {
    /// What gets automated.
    pub target: AutomationTarget,
    /// Which instance of the target, for indexed targets.
    pub index: usize,
    /// Index into [config::ENVELOPES].
    pub envelope: usize,
}

/// One FM operator's persistent settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Operator {
    /// Index into [config::OPERATOR_FREQUENCIES].
    pub frequency: usize,
    /// Amplitude setting, up to [config::OPERATOR_AMPLITUDE_MAX].
    pub amplitude: usize,
}
impl Operator {
    /// The default for the operator at the given position: the first two
    /// operators start audible, the rest silent.
    pub fn default_for_index(index: usize) -> Self {
        Self {
            frequency: 0,
            amplitude: if index <= 1 {
                config::OPERATOR_AMPLITUDE_MAX
            } else {
                0
            },
        }
    }
}

/// A user-designed noise spectrum: control point amplitudes from low to
/// high frequency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpectrumWave {
    /// Control point values, each up to [config::SPECTRUM_MAX].
    pub spectrum: Vec<usize>,
}
impl Default for SpectrumWave {
    fn default() -> Self {
        Self::default_for_channel(true)
    }
}
impl SpectrumWave {
    /// The default spectrum: broadband rolloff in a noise channel, isolated
    /// harmonic peaks in a pitched channel.
    pub fn default_for_channel(is_noise_channel: bool) -> Self {
        let spectrum = (0..config::SPECTRUM_CONTROL_POINTS)
            .map(|i| {
                if is_noise_channel {
                    (config::SPECTRUM_MAX as f64 / (1.0 + i as f64 / 3.0).sqrt()).round() as usize
                } else {
                    let is_harmonic = matches!(i, 0 | 7 | 11 | 14 | 16 | 18 | 21 | 23) || i >= 25;
                    if is_harmonic {
                        (config::SPECTRUM_MAX as f64 * (1.0 - i as f64 / 30.0))
                            .round()
                            .max(0.0) as usize
                    } else {
                        0
                    }
                }
            })
            .collect();
        Self { spectrum }
    }
}

/// A user-designed harmonic series for the additive generator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HarmonicsWave {
    /// Per-partial amplitudes, each up to [config::HARMONICS_MAX].
    pub harmonics: Vec<usize>,
}
impl Default for HarmonicsWave {
    fn default() -> Self {
        let mut harmonics = vec![0; config::HARMONICS_CONTROL_POINTS];
        harmonics[0] = config::HARMONICS_MAX;
        harmonics[3] = config::HARMONICS_MAX;
        harmonics[6] = config::HARMONICS_MAX;
        Self { harmonics }
    }
}

/// One instrument: everything the codec persists about how a channel
/// sounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Instrument {
    /// The synthesis algorithm.
    pub kind: InstrumentKind,
    /// Volume setting. Zero is loudest; the top of the range is mute.
    pub volume: usize,
    /// Pan setting. [config::PAN_CENTER] is centered.
    pub pan: usize,
    /// Enabled-effects bitmask. See [EffectKind::bit()].
    pub effects: u8,
    /// The equalizer chain, applied in the effects pipeline.
    pub eq_filter: FilterSettings,
    /// The note filter chain, applied inside each tone.
    pub note_filter: FilterSettings,
    /// Envelope assignments, up to [config::MAX_ENVELOPE_COUNT].
    pub envelopes: Vec<EnvelopeAssignment>,
    /// Index into [config::TRANSITIONS].
    pub transition: usize,
    /// Index into [config::VIBRATOS].
    pub vibrato: usize,
    /// Index into [config::UNISONS].
    pub unison: usize,
    /// Index into [config::CHORDS].
    pub chord: usize,
    /// Whole-tone pitch shift setting, centered at
    /// [config::PITCH_SHIFT_CENTER].
    pub pitch_shift: usize,
    /// Fine detune setting, centered at [config::DETUNE_CENTER].
    pub detune: usize,
    /// Index into [config::CHIP_WAVES].
    pub chip_wave: usize,
    /// Index into [config::CHIP_NOISES].
    pub chip_noise: usize,
    /// Index into [config::ALGORITHMS].
    pub algorithm: usize,
    /// Index into [config::FEEDBACKS].
    pub feedback_type: usize,
    /// FM feedback amount, up to [config::OPERATOR_AMPLITUDE_MAX].
    pub feedback_amplitude: usize,
    /// The four FM operators.
    pub operators: [Operator; config::OPERATOR_COUNT],
    /// The spectrum design, for [InstrumentKind::Spectrum].
    pub spectrum_wave: SpectrumWave,
    /// The harmonic design, for [InstrumentKind::Harmonics] and
    /// [InstrumentKind::PickedString].
    pub harmonics_wave: HarmonicsWave,
    /// Per-drum envelope indices, for [InstrumentKind::Drumset].
    pub drumset_envelopes: Vec<usize>,
    /// Per-drum spectrum designs, for [InstrumentKind::Drumset].
    pub drumset_spectrum_waves: Vec<SpectrumWave>,
    /// Pulse width setting, for [InstrumentKind::Pwm].
    pub pulse_width: usize,
    /// Supersaw dynamism setting.
    pub supersaw_dynamism: usize,
    /// Supersaw spread setting.
    pub supersaw_spread: usize,
    /// Supersaw shape setting.
    pub supersaw_shape: usize,
    /// String sustain setting, for [InstrumentKind::PickedString].
    pub string_sustain: usize,
    /// Distortion amount.
    pub distortion: usize,
    /// Bitcrusher latch-rate setting.
    pub bitcrusher_freq: usize,
    /// Bitcrusher quantization setting.
    pub bitcrusher_quantization: usize,
    /// Chorus amount.
    pub chorus: usize,
    /// Echo feedback setting.
    pub echo_sustain: usize,
    /// Echo delay setting, in steps of
    /// [config::ECHO_DELAY_STEP_PARTS] parts.
    pub echo_delay: usize,
    /// Reverb send.
    pub reverb: usize,
}
impl Default for Instrument {
    fn default() -> Self {
        Self::new(InstrumentKind::Chip, false)
    }
}
impl Instrument {
    /// Creates an instrument of the given kind with that kind's default
    /// settings.
    pub fn new(kind: InstrumentKind, is_noise_channel: bool) -> Self {
        let mut instrument = Self {
            kind,
            volume: 0,
            pan: config::PAN_CENTER,
            effects: 0,
            eq_filter: FilterSettings::default(),
            note_filter: FilterSettings::default(),
            envelopes: Vec::default(),
            transition: 1,
            vibrato: 0,
            unison: 0,
            chord: 1,
            pitch_shift: config::PITCH_SHIFT_CENTER,
            detune: config::DETUNE_CENTER,
            chip_wave: 2,
            chip_noise: 1,
            algorithm: 0,
            feedback_type: 0,
            feedback_amplitude: 0,
            operators: std::array::from_fn(Operator::default_for_index),
            spectrum_wave: SpectrumWave::default_for_channel(is_noise_channel),
            harmonics_wave: HarmonicsWave::default(),
            drumset_envelopes: vec![7; config::DRUM_COUNT],
            drumset_spectrum_waves: (0..config::DRUM_COUNT)
                .map(|_| SpectrumWave::default_for_channel(true))
                .collect(),
            pulse_width: config::PULSE_WIDTH_RANGE - 1,
            supersaw_dynamism: config::SUPERSAW_DYNAMISM_RANGE - 1,
            supersaw_spread: config::SUPERSAW_SPREAD_RANGE / 2,
            supersaw_shape: 0,
            string_sustain: config::SUSTAIN_RANGE / 2,
            distortion: config::DISTORTION_RANGE / 2,
            bitcrusher_freq: config::BITCRUSHER_FREQ_RANGE / 2,
            bitcrusher_quantization: config::BITCRUSHER_QUANTIZATION_RANGE / 2,
            chorus: config::CHORUS_RANGE - 1,
            echo_sustain: config::ECHO_SUSTAIN_RANGE / 2,
            echo_delay: 11,
            reverb: 2,
        };
        instrument.reset_for_kind(is_noise_channel);
        instrument
    }

    /// Restores the kind-specific defaults, as when the user switches an
    /// instrument's algorithm in an editor.
    pub fn reset_for_kind(&mut self, is_noise_channel: bool) {
        self.volume = 0;
        self.pan = config::PAN_CENTER;
        self.envelopes.clear();
        match self.kind {
            InstrumentKind::Chip => {
                self.chip_wave = 2;
                self.transition = 1;
                self.vibrato = 0;
                self.unison = 0;
                self.effects = EffectKind::Reverb.bit();
                self.chord = 2;
            }
            InstrumentKind::Fm => {
                self.transition = 1;
                self.vibrato = 0;
                self.effects = EffectKind::Reverb.bit();
                self.chord = 3;
                self.algorithm = 0;
                self.feedback_type = 0;
                self.feedback_amplitude = 0;
                self.operators = std::array::from_fn(Operator::default_for_index);
            }
            InstrumentKind::Noise => {
                self.chip_noise = 1;
                self.transition = 1;
                self.effects = 0;
                self.chord = 2;
            }
            InstrumentKind::Spectrum => {
                self.transition = 1;
                self.effects = EffectKind::Reverb.bit();
                self.chord = 0;
                self.spectrum_wave = SpectrumWave::default_for_channel(is_noise_channel);
            }
            InstrumentKind::Drumset => {
                self.effects = 0;
                self.drumset_envelopes = vec![7; config::DRUM_COUNT];
                self.drumset_spectrum_waves = (0..config::DRUM_COUNT)
                    .map(|_| SpectrumWave::default_for_channel(true))
                    .collect();
            }
            InstrumentKind::Harmonics => {
                self.transition = 1;
                self.vibrato = 0;
                self.unison = 0;
                self.effects = EffectKind::Reverb.bit();
                self.chord = 0;
                self.harmonics_wave = HarmonicsWave::default();
            }
            InstrumentKind::Pwm => {
                self.transition = 1;
                self.vibrato = 0;
                self.effects = EffectKind::Reverb.bit();
                self.chord = 2;
                self.pulse_width = config::PULSE_WIDTH_RANGE - 1;
            }
            InstrumentKind::PickedString => {
                self.transition = 1;
                self.vibrato = 0;
                self.unison = 0;
                self.effects = EffectKind::Reverb.bit();
                self.chord = 1;
                self.harmonics_wave = HarmonicsWave::default();
                self.string_sustain = config::SUSTAIN_RANGE / 2;
            }
            InstrumentKind::Supersaw => {
                self.transition = 1;
                self.vibrato = 0;
                self.effects = EffectKind::Reverb.bit();
                self.chord = 2;
                self.supersaw_dynamism = config::SUPERSAW_DYNAMISM_RANGE - 1;
                self.supersaw_spread = config::SUPERSAW_SPREAD_RANGE / 2;
                self.supersaw_shape = 0;
            }
        }
    }

    /// Whether the given effect stage is enabled.
    pub fn effect_enabled(&self, effect: EffectKind) -> bool {
        self.effects & effect.bit() != 0
    }

    /// Enables or disables an effect stage.
    pub fn set_effect_enabled(&mut self, effect: EffectKind, enabled: bool) {
        if enabled {
            self.effects |= effect.bit();
        } else {
            self.effects &= !effect.bit();
        }
    }

    /// This instrument's transition policy.
    pub fn transition(&self) -> &'static config::Transition {
        &config::TRANSITIONS[self.transition]
    }

    /// This instrument's chord policy.
    pub fn chord(&self) -> &'static config::Chord {
        &config::CHORDS[self.chord]
    }

    /// This instrument's vibrato.
    pub fn vibrato(&self) -> &'static config::Vibrato {
        &config::VIBRATOS[self.vibrato]
    }

    /// This instrument's unison.
    pub fn unison(&self) -> &'static config::Unison {
        &config::UNISONS[self.unison]
    }

    /// The envelope curve assigned to the given automation target, if any.
    pub fn envelope_for(&self, target: AutomationTarget, index: usize) -> Option<usize> {
        self.envelopes
            .iter()
            .find(|assignment| assignment.target == target && assignment.index == index)
            .map(|assignment| assignment.envelope)
    }

    /// Assigns an envelope, replacing any existing assignment to the same
    /// target and ignoring the request if the list is full.
    pub fn assign_envelope(&mut self, target: AutomationTarget, index: usize, envelope: usize) {
        if let Some(existing) = self
            .envelopes
            .iter_mut()
            .find(|assignment| assignment.target == target && assignment.index == index)
        {
            existing.envelope = envelope;
        } else if self.envelopes.len() < config::MAX_ENVELOPE_COUNT {
            self.envelopes.push(EnvelopeAssignment {
                target,
                index,
                envelope,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn effect_bits_are_distinct() {
        let mut seen = 0u8;
        for effect in EffectKind::iter() {
            assert_eq!(seen & effect.bit(), 0);
            seen |= effect.bit();
        }
        assert_eq!(EFFECT_PIPELINE_ORDER.len(), seen.count_ones() as usize);
    }

    #[test]
    fn kind_channel_fit() {
        assert!(InstrumentKind::Chip.fits_pitch_channel());
        assert!(!InstrumentKind::Chip.fits_noise_channel());
        assert!(InstrumentKind::Drumset.fits_noise_channel());
        assert!(!InstrumentKind::Drumset.fits_pitch_channel());
        // Spectrum works in both kinds of channel.
        assert!(InstrumentKind::Spectrum.fits_pitch_channel());
        assert!(InstrumentKind::Spectrum.fits_noise_channel());
    }

    #[test]
    fn default_fm_operators() {
        let instrument = Instrument::new(InstrumentKind::Fm, false);
        assert_eq!(
            instrument.operators[0].amplitude,
            crate::config::OPERATOR_AMPLITUDE_MAX
        );
        assert_eq!(instrument.operators[3].amplitude, 0);
    }

    #[test]
    fn envelope_assignment_replaces_and_caps() {
        let mut instrument = Instrument::default();
        instrument.assign_envelope(AutomationTarget::NoteVolume, 0, 6);
        instrument.assign_envelope(AutomationTarget::NoteVolume, 0, 9);
        assert_eq!(instrument.envelopes.len(), 1);
        assert_eq!(
            instrument.envelope_for(AutomationTarget::NoteVolume, 0),
            Some(9)
        );
        for i in 0..crate::config::MAX_ENVELOPE_COUNT + 4 {
            instrument.assign_envelope(AutomationTarget::NoteFilterFreq, i, 1);
        }
        assert_eq!(
            instrument.envelopes.len(),
            crate::config::MAX_ENVELOPE_COUNT
        );
    }

    #[test]
    fn spectrum_defaults_differ_by_channel() {
        let noise = SpectrumWave::default_for_channel(true);
        let pitch = SpectrumWave::default_for_channel(false);
        assert_ne!(noise, pitch);
        // Pitched-channel defaults isolate harmonics; the second point is
        // in between them and silent.
        assert_eq!(pitch.spectrum[1], 0);
        assert_eq!(noise.spectrum[0], crate::config::SPECTRUM_MAX);
    }
}
