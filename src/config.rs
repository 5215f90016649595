// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Fixed tables and tuning constants shared by the composition model, the
//! codec, and the synthesis engine.
//!
//! Everything here is data, not behavior: named waveforms, noise recipes,
//! transition/chord/vibrato/unison policies, FM wiring diagrams, envelope
//! shapes, and the numeric ranges that sliders and codec fields clamp to.
//! Wavetables that take real work to build (integrated chip waves, noise
//! buffers, the sine table) are constructed lazily and cached for the life
//! of the process.

use once_cell::sync::Lazy;

use crate::util::fft;

// Time layout. A beat divides into parts (note quantization) and each part
// divides into ticks (scheduler/envelope resolution).
/// Parts per beat.
pub const PARTS_PER_BEAT: usize = 24;
/// Ticks per part.
pub const TICKS_PER_PART: usize = 2;
/// Ticks per beat.
pub const TICKS_PER_BEAT: usize = PARTS_PER_BEAT * TICKS_PER_PART;

/// Slowest supported tempo, in beats per minute.
pub const TEMPO_MIN: u32 = 30;
/// Fastest supported tempo, in beats per minute.
pub const TEMPO_MAX: u32 = 300;
/// Fewest beats per bar.
pub const BEATS_PER_BAR_MIN: usize = 3;
/// Most beats per bar.
pub const BEATS_PER_BAR_MAX: usize = 16;
/// Fewest bars per song.
pub const BAR_COUNT_MIN: usize = 1;
/// Most bars per song.
pub const BAR_COUNT_MAX: usize = 128;
/// Most patterns per channel.
pub const PATTERNS_PER_CHANNEL_MAX: usize = BAR_COUNT_MAX;
/// Fewest instruments per channel.
pub const INSTRUMENTS_PER_CHANNEL_MIN: usize = 1;
/// Most instruments per channel.
pub const INSTRUMENTS_PER_CHANNEL_MAX: usize = 10;
/// Fewest pitched channels.
pub const PITCH_CHANNEL_COUNT_MIN: usize = 1;
/// Most pitched channels.
pub const PITCH_CHANNEL_COUNT_MAX: usize = 6;
/// Fewest noise channels.
pub const NOISE_CHANNEL_COUNT_MIN: usize = 0;
/// Most noise channels.
pub const NOISE_CHANNEL_COUNT_MAX: usize = 3;

/// Semitones per octave.
pub const PITCHES_PER_OCTAVE: usize = 12;
/// Octaves spanned by a pitched channel.
pub const PITCH_OCTAVES: usize = 7;
/// Highest pitch in a pitched channel.
pub const MAX_PITCH: usize = PITCH_OCTAVES * PITCHES_PER_OCTAVE;
/// Number of distinct drums in a noise channel.
pub const DRUM_COUNT: usize = 12;
/// Semitone spacing between adjacent drum rows.
pub const NOISE_INTERVAL: usize = 6;
/// Most simultaneous pitches in one note.
pub const MAX_CHORD_SIZE: usize = 4;
/// Most simultaneous tones per channel; older tones beyond this fade fast.
pub const MAX_TONES_PER_CHANNEL: usize = MAX_CHORD_SIZE * 2;
/// Largest per-pin note size. Size 3 is full volume.
pub const NOTE_SIZE_MAX: usize = 3;

/// Number of instrument volume steps. The highest setting is silent.
pub const VOLUME_RANGE: usize = 8;
const VOLUME_LOG_SCALE: f64 = -0.5;
/// Number of pan positions left of (and right of) center.
pub const PAN_CENTER: usize = 4;
/// Largest pan setting.
pub const PAN_MAX: usize = PAN_CENTER * 2;
/// Inter-aural delay at full pan, in seconds.
pub const PAN_DELAY_SECONDS_MAX: f64 = 0.00065;

// Filter control points. Frequency settings are quarter-octave steps ending
// at the reference frequency; gain settings are half-octave steps around a
// unity center.
/// Number of filter frequency settings.
pub const FILTER_FREQ_RANGE: usize = 33;
/// Octaves per filter frequency step.
pub const FILTER_FREQ_STEP: f64 = 1.0 / 4.0;
/// Frequency of the top filter setting, in Hz.
pub const FILTER_FREQ_MAX_HZ: f64 = 16000.0;
/// Number of filter gain settings.
pub const FILTER_GAIN_RANGE: usize = 15;
/// The gain setting that means unity.
pub const FILTER_GAIN_CENTER: usize = 7;
/// Octaves per filter gain step.
pub const FILTER_GAIN_STEP: f64 = 1.0 / 2.0;
/// Most control points per filter chain.
pub const FILTER_MAX_POINTS: usize = 8;

/// Number of distortion settings.
pub const DISTORTION_RANGE: usize = 8;
/// Output scale applied to the distortion soft clipper.
pub const DISTORTION_BASE_VOLUME: f64 = 0.0125;
/// Number of bitcrusher sample-rate settings.
pub const BITCRUSHER_FREQ_RANGE: usize = 14;
/// Octaves per bitcrusher sample-rate step.
pub const BITCRUSHER_OCTAVE_STEP: f64 = 0.5;
/// Number of bitcrusher quantization settings.
pub const BITCRUSHER_QUANTIZATION_RANGE: usize = 8;

/// Number of echo sustain (feedback) settings.
pub const ECHO_SUSTAIN_RANGE: usize = 8;
/// Number of echo delay settings. Each step is two parts of delay.
pub const ECHO_DELAY_RANGE: usize = 24;
/// Parts of delay per echo delay step.
pub const ECHO_DELAY_STEP_PARTS: usize = 2;
/// Cutoff of the high shelf in the echo feedback path, in Hz.
pub const ECHO_SHELF_HZ: f64 = 4000.0;
/// Gain of the echo feedback shelf.
pub const ECHO_SHELF_GAIN: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Number of chorus depth settings.
pub const CHORUS_RANGE: usize = 4;
/// Period of the chorus tap modulation, in seconds.
pub const CHORUS_PERIOD_SECONDS: f64 = 2.0;
/// Base chorus tap delay, in seconds.
pub const CHORUS_DELAY_RANGE: f64 = 0.0034;
/// Per-tap delay multipliers, one row per stereo side.
pub const CHORUS_DELAY_OFFSETS: [[f64; 3]; 2] = [[1.51, 2.10, 3.35], [1.47, 2.15, 3.25]];
/// Per-tap modulation phase offsets, one row per stereo side.
pub const CHORUS_PHASE_OFFSETS: [[f64; 3]; 2] = [[0.0, 2.1, 4.2], [3.2, 5.3, 1.0]];
/// Chorus delay line length, in samples.
pub const CHORUS_DELAY_BUFFER_SIZE: usize = 1 << 11;

/// Number of reverb settings.
pub const REVERB_RANGE: usize = 4;
/// Reverb delay line length, in samples.
pub const REVERB_DELAY_BUFFER_SIZE: usize = 1 << 14;
/// Mask for wrapping reverb delay positions.
pub const REVERB_DELAY_BUFFER_MASK: usize = REVERB_DELAY_BUFFER_SIZE - 1;

/// Number of FM operators.
pub const OPERATOR_COUNT: usize = 4;
/// Largest FM operator amplitude setting.
pub const OPERATOR_AMPLITUDE_MAX: usize = 15;
/// Small detune applied to each FM carrier to keep unisons from phasing.
pub const OPERATOR_CARRIER_INTERVAL: [f64; OPERATOR_COUNT] = [0.0, 0.04, -0.073, 0.091];

/// Number of pulse width settings.
pub const PULSE_WIDTH_RANGE: usize = 8;
const PULSE_WIDTH_STEP_POWER: f64 = 0.5;

/// Number of pitch shift settings, one per semitone across two octaves.
pub const PITCH_SHIFT_RANGE: usize = 25;
/// The pitch shift setting that means no shift.
pub const PITCH_SHIFT_CENTER: usize = 12;
/// Number of detune settings.
pub const DETUNE_RANGE: usize = 25;
/// The detune setting that means no detune.
pub const DETUNE_CENTER: usize = 12;
/// Cents per detune step.
pub const DETUNE_STEP_CENTS: f64 = 10.0;
/// Most envelope assignments per instrument.
pub const MAX_ENVELOPE_COUNT: usize = 12;

/// Number of string sustain settings.
pub const SUSTAIN_RANGE: usize = 8;
// The string model has an all-pass filter whose corner frequency is based
// on the tone fundamental, pulled toward a center frequency, to add a
// slight inharmonicity.
/// Center frequency the string fundamental is pulled toward.
pub const STRING_DISPERSION_CENTER_FREQ: f64 = 6000.0;
/// How far the fundamental moves toward the center frequency.
pub const STRING_DISPERSION_FREQ_SCALE: f64 = 0.3;
/// All-pass corner frequency as a multiple of the adjusted fundamental.
pub const STRING_DISPERSION_FREQ_MULT: f64 = 4.0;
/// Cutoff of the shelf filter that decays high frequencies in the string.
pub const STRING_SHELF_HZ: f64 = 4000.0;
/// Randomization of the plucked impulse width.
pub const STRING_EXCITATION_RANDOMNESS: f64 = 0.1;

/// Number of detuned sawtooth voices in the supersaw generator.
pub const SUPERSAW_VOICE_COUNT: usize = 7;
/// Number of supersaw dynamism settings.
pub const SUPERSAW_DYNAMISM_RANGE: usize = 8;
/// Number of supersaw spread settings.
pub const SUPERSAW_SPREAD_RANGE: usize = 8;
/// Number of supersaw shape (saw-to-pulse) settings.
pub const SUPERSAW_SHAPE_RANGE: usize = 8;

// Baseline output level per generator, tuned so the types sound similar at
// equal settings.
/// Chip wave baseline expression.
pub const CHIP_BASE_EXPRESSION: f64 = 0.03375;
/// FM baseline expression.
pub const FM_BASE_EXPRESSION: f64 = 0.03;
/// Basic noise baseline expression.
pub const NOISE_BASE_EXPRESSION: f64 = 0.19;
/// Spectrum baseline expression. Doubled in noise channels.
pub const SPECTRUM_BASE_EXPRESSION: f64 = 0.3;
/// Drumset baseline expression.
pub const DRUMSET_BASE_EXPRESSION: f64 = 0.45;
/// Harmonics baseline expression.
pub const HARMONICS_BASE_EXPRESSION: f64 = 0.025;
/// Pulse width baseline expression.
pub const PWM_BASE_EXPRESSION: f64 = 0.04725;
/// Supersaw baseline expression.
pub const SUPERSAW_BASE_EXPRESSION: f64 = 0.03;
/// Picked string baseline expression.
pub const STRING_BASE_EXPRESSION: f64 = 0.03;

/// Length of the precomputed sine table.
pub const SINE_WAVE_LENGTH: usize = 1 << 8;
/// Mask for wrapping sine table indices.
pub const SINE_WAVE_MASK: usize = SINE_WAVE_LENGTH - 1;
/// Length of the basic-noise wavetables.
pub const CHIP_NOISE_LENGTH: usize = 1 << 15;
/// Length of the spectrum-instrument wavetable.
pub const SPECTRUM_NOISE_LENGTH: usize = 1 << 15;
/// Pitch at which a spectrum wavetable plays back unshifted.
pub const SPECTRUM_BASE_PITCH: usize = 24;
/// Number of spectrum control points.
pub const SPECTRUM_CONTROL_POINTS: usize = 30;
/// Spectrum control points below the base pitch, per octave.
pub const SPECTRUM_CONTROL_POINTS_PER_OCTAVE: usize = 7;
/// Bits per spectrum control point.
pub const SPECTRUM_CONTROL_POINT_BITS: u32 = 3;
/// Largest spectrum control point value.
pub const SPECTRUM_MAX: usize = (1 << SPECTRUM_CONTROL_POINT_BITS) - 1;
/// Number of harmonics control points.
pub const HARMONICS_CONTROL_POINTS: usize = 28;
/// Number of harmonic partials rendered into the wavetable.
pub const HARMONICS_RENDERED: usize = 64;
/// Bits per harmonics control point.
pub const HARMONICS_CONTROL_POINT_BITS: u32 = 3;
/// Largest harmonics control point value.
pub const HARMONICS_MAX: usize = (1 << HARMONICS_CONTROL_POINT_BITS) - 1;
/// Length of the harmonics wavetable.
pub const HARMONICS_WAVELENGTH: usize = 1 << 11;

/// Converts an instrument volume setting to an amplitude multiplier. The
/// final setting is full mute rather than merely quiet.
pub fn instrument_volume_to_mult(volume: usize) -> f64 {
    if volume >= VOLUME_RANGE - 1 {
        0.0
    } else {
        2.0_f64.powf(VOLUME_LOG_SCALE * volume as f64)
    }
}

/// Converts a note expression (0 to [NOTE_SIZE_MAX]) to an amplitude
/// multiplier.
pub fn note_size_to_volume_mult(size: f64) -> f64 {
    (size / NOTE_SIZE_MAX as f64).powf(1.5)
}

/// The frequency of a filter control point frequency setting, in Hz.
pub fn filter_freq_setting_to_hz(setting: f64) -> f64 {
    FILTER_FREQ_MAX_HZ
        * 2.0_f64.powf((setting - (FILTER_FREQ_RANGE - 1) as f64) * FILTER_FREQ_STEP)
}

/// The linear gain of a filter control point gain setting.
pub fn filter_gain_setting_to_linear(setting: f64) -> f64 {
    2.0_f64.powf((setting - FILTER_GAIN_CENTER as f64) * FILTER_GAIN_STEP)
}

/// The duty cycle (0.0 to 0.5) of a pulse width setting.
pub fn pulse_width_ratio(pulse_width: usize) -> f64 {
    0.5_f64.powf((PULSE_WIDTH_RANGE - 1 - pulse_width) as f64 * PULSE_WIDTH_STEP_POWER) * 0.5
}

/// A named musical key.
#[derive(Debug)]
pub struct Key {
    /// Display name.
    pub name: &'static str,
    /// Whether this key is a white key on a piano.
    pub is_white_key: bool,
    /// The MIDI pitch of this key's octave zero.
    pub base_pitch: usize,
}

/// The twelve keys, starting at C.
pub const KEYS: [Key; 12] = [
    Key { name: "C", is_white_key: true, base_pitch: 12 },
    Key { name: "C♯", is_white_key: false, base_pitch: 13 },
    Key { name: "D", is_white_key: true, base_pitch: 14 },
    Key { name: "D♯", is_white_key: false, base_pitch: 15 },
    Key { name: "E", is_white_key: true, base_pitch: 16 },
    Key { name: "F", is_white_key: true, base_pitch: 17 },
    Key { name: "F♯", is_white_key: false, base_pitch: 18 },
    Key { name: "G", is_white_key: true, base_pitch: 19 },
    Key { name: "G♯", is_white_key: false, base_pitch: 20 },
    Key { name: "A", is_white_key: true, base_pitch: 21 },
    Key { name: "A♯", is_white_key: false, base_pitch: 22 },
    Key { name: "B", is_white_key: true, base_pitch: 23 },
];

/// A named scale: which of the twelve semitones are in it.
#[derive(Debug)]
pub struct Scale {
    /// Display name.
    pub name: &'static str,
    /// Per-semitone membership flags, starting at the tonic.
    pub flags: [bool; 12],
}

const T: bool = true;
const F: bool = false;

/// The selectable scales.
pub const SCALES: [Scale; 12] = [
    Scale { name: "easy :)", flags: [T, F, T, F, T, F, F, T, F, T, F, F] },
    Scale { name: "easy :(", flags: [T, F, F, T, F, T, F, T, F, F, T, F] },
    Scale { name: "island :)", flags: [T, F, F, F, T, T, F, T, F, F, F, T] },
    Scale { name: "island :(", flags: [T, T, F, T, F, F, F, T, T, F, F, F] },
    Scale { name: "blues :)", flags: [T, F, T, T, T, F, F, T, F, T, F, F] },
    Scale { name: "blues :(", flags: [T, F, F, T, F, T, T, T, F, F, T, F] },
    Scale { name: "normal :)", flags: [T, F, T, F, T, T, F, T, F, T, F, T] },
    Scale { name: "normal :(", flags: [T, F, T, T, F, T, F, T, T, F, T, F] },
    Scale { name: "dbl harmonic :)", flags: [T, T, F, F, T, T, F, T, T, F, F, T] },
    Scale { name: "dbl harmonic :(", flags: [T, F, T, T, F, F, T, T, T, F, F, T] },
    Scale { name: "strange", flags: [T, F, T, F, T, F, T, F, T, F, T, F] },
    Scale { name: "expert", flags: [T; 12] },
];

/// A rhythm: how many note-placement steps a beat divides into, and how
/// arpeggios cycle at that resolution.
#[derive(Debug)]
pub struct Rhythm {
    /// Display name.
    pub name: &'static str,
    /// Note-placement steps per beat.
    pub steps_per_beat: usize,
    /// Ticks each arpeggio stage lasts.
    pub ticks_per_arpeggio: usize,
    /// Arpeggio stage sequences indexed by chord size minus one.
    pub arpeggio_patterns: &'static [&'static [usize]],
}

/// The selectable rhythms.
pub const RHYTHMS: [Rhythm; 5] = [
    Rhythm {
        name: "÷3 (triplets)",
        steps_per_beat: 3,
        ticks_per_arpeggio: 4,
        arpeggio_patterns: &[&[0], &[0, 0, 1, 1], &[0, 1, 2, 1]],
    },
    Rhythm {
        name: "÷4 (standard)",
        steps_per_beat: 4,
        ticks_per_arpeggio: 3,
        arpeggio_patterns: &[&[0], &[0, 0, 1, 1], &[0, 1, 2, 1]],
    },
    Rhythm {
        name: "÷6",
        steps_per_beat: 6,
        ticks_per_arpeggio: 4,
        arpeggio_patterns: &[&[0], &[0, 1], &[0, 1, 2, 1]],
    },
    Rhythm {
        name: "÷8",
        steps_per_beat: 8,
        ticks_per_arpeggio: 3,
        arpeggio_patterns: &[&[0], &[0, 1], &[0, 1, 2, 1]],
    },
    Rhythm {
        name: "freehand",
        steps_per_beat: 24,
        ticks_per_arpeggio: 3,
        arpeggio_patterns: &[&[0], &[0, 1], &[0, 1, 2, 1]],
    },
];

/// Which chord pitch an arpeggiating tone should play at the given arpeggio
/// stage counter.
pub fn arpeggio_pitch_index(pitch_count: usize, rhythm: usize, arpeggio: usize) -> usize {
    let patterns = RHYTHMS[rhythm].arpeggio_patterns;
    if pitch_count >= 1 && pitch_count - 1 < patterns.len() {
        let pattern = patterns[pitch_count - 1];
        pattern[arpeggio % pattern.len()]
    } else {
        arpeggio % pitch_count
    }
}

/// A transition: how a tone behaves at a note boundary.
#[derive(Debug)]
pub struct Transition {
    /// Display name.
    pub name: &'static str,
    /// Whether an adjacent same-pitch note continues the tone without a
    /// retrigger.
    pub is_seamless: bool,
    /// Attack ramp length, in seconds.
    pub attack_seconds: f64,
    /// Whether the tone keeps sounding after its note ends.
    pub releases: bool,
    /// How long a released tone fades, in ticks.
    pub release_ticks: usize,
    /// Whether adjacent notes slide in pitch instead of stepping.
    pub slides: bool,
    /// How long a slide takes, in ticks.
    pub slide_ticks: usize,
}

/// The selectable transitions.
pub const TRANSITIONS: [Transition; 9] = [
    Transition { name: "seamless", is_seamless: true, attack_seconds: 0.0, releases: false, release_ticks: 1, slides: false, slide_ticks: 3 },
    Transition { name: "hard", is_seamless: false, attack_seconds: 0.0, releases: false, release_ticks: 3, slides: false, slide_ticks: 3 },
    Transition { name: "soft", is_seamless: false, attack_seconds: 0.025, releases: false, release_ticks: 3, slides: false, slide_ticks: 3 },
    Transition { name: "slide", is_seamless: true, attack_seconds: 0.025, releases: false, release_ticks: 3, slides: true, slide_ticks: 3 },
    Transition { name: "cross fade", is_seamless: false, attack_seconds: 0.04, releases: true, release_ticks: 6, slides: false, slide_ticks: 3 },
    Transition { name: "hard fade", is_seamless: false, attack_seconds: 0.0, releases: true, release_ticks: 48, slides: false, slide_ticks: 3 },
    Transition { name: "medium fade", is_seamless: false, attack_seconds: 0.0125, releases: true, release_ticks: 72, slides: false, slide_ticks: 3 },
    Transition { name: "soft fade", is_seamless: false, attack_seconds: 0.06, releases: true, release_ticks: 96, slides: false, slide_ticks: 6 },
    Transition { name: "hard overlap", is_seamless: false, attack_seconds: 0.0, releases: true, release_ticks: 12, slides: false, slide_ticks: 3 },
];

/// A vibrato: a periodic pitch wobble.
#[derive(Debug)]
pub struct Vibrato {
    /// Display name.
    pub name: &'static str,
    /// Peak pitch offset, in semitones.
    pub amplitude: f64,
    /// LFO periods, in seconds. Multiple periods sum into a wandering wobble.
    pub periods_seconds: &'static [f64],
    /// Ticks before the wobble fades in.
    pub delay_ticks: usize,
}

/// The selectable vibratos.
pub const VIBRATOS: [Vibrato; 5] = [
    Vibrato { name: "none", amplitude: 0.0, periods_seconds: &[0.14], delay_ticks: 0 },
    Vibrato { name: "light", amplitude: 0.15, periods_seconds: &[0.14], delay_ticks: 0 },
    Vibrato { name: "delayed", amplitude: 0.3, periods_seconds: &[0.14], delay_ticks: 37 },
    Vibrato { name: "heavy", amplitude: 0.45, periods_seconds: &[0.14], delay_ticks: 0 },
    Vibrato { name: "shaky", amplitude: 0.1, periods_seconds: &[0.11, 1.618 * 0.11, 3.0 * 0.11], delay_ticks: 0 },
];

/// A unison: how a secondary detuned voice thickens a tone.
#[derive(Debug)]
pub struct Unison {
    /// Display name.
    pub name: &'static str,
    /// Detune between the two voices, in semitones.
    pub spread: f64,
    /// Pitch offset applied to both voices, in semitones.
    pub offset: f64,
    /// Amplitude multiplier compensating for the doubled voice.
    pub expression: f64,
    /// Sign of the secondary voice. Negative inverts it.
    pub sign: f64,
}

/// The selectable unisons.
pub const UNISONS: [Unison; 9] = [
    Unison { name: "union", spread: 0.0, offset: 0.0, expression: 0.7, sign: 1.0 },
    Unison { name: "shimmer", spread: 0.018, offset: 0.0, expression: 0.8, sign: 1.0 },
    Unison { name: "hum", spread: 0.045, offset: 0.0, expression: 1.0, sign: 1.0 },
    Unison { name: "honky tonk", spread: 0.09, offset: 0.0, expression: 1.0, sign: 1.0 },
    Unison { name: "dissonant", spread: 0.25, offset: 0.0, expression: 0.9, sign: 1.0 },
    Unison { name: "fifth", spread: 3.5, offset: 3.5, expression: 0.9, sign: 1.0 },
    Unison { name: "octave", spread: 6.0, offset: 6.0, expression: 0.8, sign: 1.0 },
    Unison { name: "bowed", spread: 0.02, offset: 0.0, expression: 1.0, sign: -1.0 },
    Unison { name: "piano", spread: 0.01, offset: 0.0, expression: 1.0, sign: 0.7 },
];

/// A chord policy: how a multi-pitch note maps onto tones.
#[derive(Debug)]
pub struct Chord {
    /// Display name.
    pub name: &'static str,
    /// Whether extra pitches modulate the first pitch instead of sounding.
    pub custom_interval: bool,
    /// Whether the pitches cycle over time instead of sounding together.
    pub arpeggiates: bool,
    /// Per-pitch start stagger, in parts.
    pub strum_parts: usize,
    /// Whether the whole chord shares one tone.
    pub single_tone: bool,
}

/// The selectable chord policies.
pub const CHORDS: [Chord; 4] = [
    Chord { name: "harmony", custom_interval: false, arpeggiates: false, strum_parts: 0, single_tone: false },
    Chord { name: "strum", custom_interval: false, arpeggiates: false, strum_parts: 1, single_tone: false },
    Chord { name: "arpeggio", custom_interval: false, arpeggiates: true, strum_parts: 0, single_tone: true },
    Chord { name: "custom interval", custom_interval: true, arpeggiates: true, strum_parts: 0, single_tone: true },
];

/// An FM algorithm: which operators are carriers and who modulates whom.
/// Operator references are one-based, matching the display names.
#[derive(Debug)]
pub struct Algorithm {
    /// Display name.
    pub name: &'static str,
    /// How many of the four operators are carriers.
    pub carrier_count: usize,
    /// Which carrier each operator's output is associated with.
    pub associated_carrier: [usize; OPERATOR_COUNT],
    /// For each operator, the operators that modulate it.
    pub modulated_by: [&'static [usize]; OPERATOR_COUNT],
}

/// The selectable FM algorithms.
pub const ALGORITHMS: [Algorithm; 13] = [
    Algorithm { name: "1←(2 3 4)", carrier_count: 1, associated_carrier: [1, 1, 1, 1], modulated_by: [&[2, 3, 4], &[], &[], &[]] },
    Algorithm { name: "1←(2 3←4)", carrier_count: 1, associated_carrier: [1, 1, 1, 1], modulated_by: [&[2, 3], &[], &[4], &[]] },
    Algorithm { name: "1←2←(3 4)", carrier_count: 1, associated_carrier: [1, 1, 1, 1], modulated_by: [&[2], &[3, 4], &[], &[]] },
    Algorithm { name: "1←(2 3)←4", carrier_count: 1, associated_carrier: [1, 1, 1, 1], modulated_by: [&[2, 3], &[4], &[4], &[]] },
    Algorithm { name: "1←2←3←4", carrier_count: 1, associated_carrier: [1, 1, 1, 1], modulated_by: [&[2], &[3], &[4], &[]] },
    Algorithm { name: "1←3 2←4", carrier_count: 2, associated_carrier: [1, 2, 1, 2], modulated_by: [&[3], &[4], &[], &[]] },
    Algorithm { name: "1 2←(3 4)", carrier_count: 2, associated_carrier: [1, 2, 2, 2], modulated_by: [&[], &[3, 4], &[], &[]] },
    Algorithm { name: "1 2←3←4", carrier_count: 2, associated_carrier: [1, 2, 2, 2], modulated_by: [&[], &[3], &[4], &[]] },
    Algorithm { name: "(1 2)←3←4", carrier_count: 2, associated_carrier: [1, 2, 2, 2], modulated_by: [&[3], &[3], &[4], &[]] },
    Algorithm { name: "(1 2)←(3 4)", carrier_count: 2, associated_carrier: [1, 2, 2, 2], modulated_by: [&[3, 4], &[3, 4], &[], &[]] },
    Algorithm { name: "1 2 3←4", carrier_count: 3, associated_carrier: [1, 2, 3, 3], modulated_by: [&[], &[], &[4], &[]] },
    Algorithm { name: "(1 2 3)←4", carrier_count: 3, associated_carrier: [1, 2, 3, 3], modulated_by: [&[4], &[4], &[4], &[]] },
    Algorithm { name: "1 2 3 4", carrier_count: 4, associated_carrier: [1, 2, 3, 4], modulated_by: [&[], &[], &[], &[]] },
];

/// An FM feedback network: for each operator, the operators whose previous
/// output is fed into it. One-based, like [Algorithm].
#[derive(Debug)]
pub struct Feedback {
    /// Display name.
    pub name: &'static str,
    /// For each operator, the operators feeding back into it.
    pub indices: [&'static [usize]; OPERATOR_COUNT],
}

/// The selectable FM feedback networks.
pub const FEEDBACKS: [Feedback; 18] = [
    Feedback { name: "1⟲", indices: [&[1], &[], &[], &[]] },
    Feedback { name: "2⟲", indices: [&[], &[2], &[], &[]] },
    Feedback { name: "3⟲", indices: [&[], &[], &[3], &[]] },
    Feedback { name: "4⟲", indices: [&[], &[], &[], &[4]] },
    Feedback { name: "1⟲ 2⟲", indices: [&[1], &[2], &[], &[]] },
    Feedback { name: "3⟲ 4⟲", indices: [&[], &[], &[3], &[4]] },
    Feedback { name: "1⟲ 2⟲ 3⟲", indices: [&[1], &[2], &[3], &[]] },
    Feedback { name: "2⟲ 3⟲ 4⟲", indices: [&[], &[2], &[3], &[4]] },
    Feedback { name: "1⟲ 2⟲ 3⟲ 4⟲", indices: [&[1], &[2], &[3], &[4]] },
    Feedback { name: "1→2", indices: [&[], &[1], &[], &[]] },
    Feedback { name: "1→3", indices: [&[], &[], &[1], &[]] },
    Feedback { name: "1→4", indices: [&[], &[], &[], &[1]] },
    Feedback { name: "2→3", indices: [&[], &[], &[2], &[]] },
    Feedback { name: "2→4", indices: [&[], &[], &[], &[2]] },
    Feedback { name: "3→4", indices: [&[], &[], &[], &[3]] },
    Feedback { name: "1→3 2→4", indices: [&[], &[], &[1], &[2]] },
    Feedback { name: "1→4 2→3", indices: [&[], &[], &[2], &[1]] },
    Feedback { name: "1→2→3→4", indices: [&[], &[1], &[2], &[3]] },
];

/// An FM operator frequency: a multiple of the fundamental, optionally
/// offset in Hz to shimmer against exact harmonics.
#[derive(Debug)]
pub struct OperatorFrequency {
    /// Display name.
    pub name: &'static str,
    /// Frequency multiplier.
    pub mult: f64,
    /// Fixed frequency offset, in Hz.
    pub hz_offset: f64,
    /// Sign applied to the operator's amplitude.
    pub amplitude_sign: f64,
}

/// The selectable FM operator frequencies.
pub const OPERATOR_FREQUENCIES: [OperatorFrequency; 15] = [
    OperatorFrequency { name: "1×", mult: 1.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "~1×", mult: 1.0, hz_offset: 1.5, amplitude_sign: -1.0 },
    OperatorFrequency { name: "2×", mult: 2.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "~2×", mult: 2.0, hz_offset: -1.3, amplitude_sign: -1.0 },
    OperatorFrequency { name: "3×", mult: 3.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "4×", mult: 4.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "5×", mult: 5.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "6×", mult: 6.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "7×", mult: 7.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "8×", mult: 8.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "9×", mult: 9.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "11×", mult: 11.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "13×", mult: 13.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "16×", mult: 16.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequency { name: "20×", mult: 20.0, hz_offset: 0.0, amplitude_sign: 1.0 },
];

/// The closed set of envelope curve families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeShape {
    /// Follows the note's own size pins.
    NoteSize,
    /// Constant 1.0.
    Steady,
    /// A brief boost at the start of the note.
    Punch,
    /// Rises quickly then decays.
    Flare,
    /// Exponential decay from 1.0.
    Twang,
    /// Exponential rise toward 1.0.
    Swell,
    /// Full-depth periodic wobble.
    Tremolo,
    /// Half-depth periodic wobble centered near 1.0.
    Tremolo2,
    /// Time-limited decay that reaches silence.
    Decay,
}

/// A named envelope curve.
#[derive(Debug)]
pub struct Envelope {
    /// Display name.
    pub name: &'static str,
    /// Curve family.
    pub shape: EnvelopeShape,
    /// Curve rate. Meaning depends on the family.
    pub speed: f64,
}

/// The selectable envelope curves.
pub const ENVELOPES: [Envelope; 21] = [
    Envelope { name: "note size", shape: EnvelopeShape::NoteSize, speed: 0.0 },
    Envelope { name: "steady", shape: EnvelopeShape::Steady, speed: 0.0 },
    Envelope { name: "punch", shape: EnvelopeShape::Punch, speed: 0.0 },
    Envelope { name: "flare 1", shape: EnvelopeShape::Flare, speed: 32.0 },
    Envelope { name: "flare 2", shape: EnvelopeShape::Flare, speed: 8.0 },
    Envelope { name: "flare 3", shape: EnvelopeShape::Flare, speed: 2.0 },
    Envelope { name: "twang 1", shape: EnvelopeShape::Twang, speed: 32.0 },
    Envelope { name: "twang 2", shape: EnvelopeShape::Twang, speed: 8.0 },
    Envelope { name: "twang 3", shape: EnvelopeShape::Twang, speed: 2.0 },
    Envelope { name: "swell 1", shape: EnvelopeShape::Swell, speed: 32.0 },
    Envelope { name: "swell 2", shape: EnvelopeShape::Swell, speed: 8.0 },
    Envelope { name: "swell 3", shape: EnvelopeShape::Swell, speed: 2.0 },
    Envelope { name: "tremolo1", shape: EnvelopeShape::Tremolo, speed: 4.0 },
    Envelope { name: "tremolo2", shape: EnvelopeShape::Tremolo, speed: 2.0 },
    Envelope { name: "tremolo3", shape: EnvelopeShape::Tremolo, speed: 1.0 },
    Envelope { name: "tremolo4", shape: EnvelopeShape::Tremolo2, speed: 4.0 },
    Envelope { name: "tremolo5", shape: EnvelopeShape::Tremolo2, speed: 2.0 },
    Envelope { name: "tremolo6", shape: EnvelopeShape::Tremolo2, speed: 1.0 },
    Envelope { name: "decay 1", shape: EnvelopeShape::Decay, speed: 10.0 },
    Envelope { name: "decay 2", shape: EnvelopeShape::Decay, speed: 7.0 },
    Envelope { name: "decay 3", shape: EnvelopeShape::Decay, speed: 4.0 },
];

/// A named chip waveform.
#[derive(Debug)]
pub struct ChipWave {
    /// Display name.
    pub name: &'static str,
    /// Amplitude compensation for this wave's inherent loudness.
    pub expression: f64,
    /// Integrated samples ready for the antialiasing wavetable reader. One
    /// extra sample at the end eases interpolation.
    pub samples: Vec<f32>,
}

/// Removes any DC offset, integrates the wave for the antialiasing reader,
/// and appends a duplicate of the first (zero) sample for interpolation.
pub fn center_and_integrate_wave(mut wave: Vec<f32>) -> Vec<f32> {
    let average = wave.iter().sum::<f32>() / wave.len() as f32;
    for sample in wave.iter_mut() {
        *sample -= average;
    }
    perform_integral(&mut wave);
    wave.push(0.0);
    wave
}

/// Replaces the wave with its running integral. The wavetable reader takes
/// the derivative across each output step, which recovers the wave but
/// averaged over the step, suppressing aliasing at high phase increments.
pub fn perform_integral(wave: &mut [f32]) {
    let mut cumulative = 0.0;
    for sample in wave.iter_mut() {
        let temp = *sample;
        *sample = cumulative;
        cumulative += temp;
    }
}

/// The selectable chip waveforms.
pub static CHIP_WAVES: Lazy<Vec<ChipWave>> = Lazy::new(|| {
    vec![
        ChipWave {
            name: "rounded",
            expression: 0.94,
            samples: center_and_integrate_wave(vec![
                0.0, 0.2, 0.4, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 1.0, 1.0, 1.0, 1.0, 1.0,
                1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.95, 0.9, 0.85, 0.8, 0.7,
                0.6, 0.5, 0.4, 0.2, 0.0, -0.2, -0.4, -0.5, -0.6, -0.7, -0.8, -0.85, -0.9,
                -0.95, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0,
                -0.95, -0.9, -0.85, -0.8, -0.7, -0.6, -0.5, -0.4, -0.2,
            ]),
        },
        ChipWave {
            name: "triangle",
            expression: 1.0,
            samples: center_and_integrate_wave(
                (0..32i32)
                    .map(|i| {
                        let step = match i {
                            0..=7 => 2 * i + 1,
                            8..=15 => 31 - 2 * i,
                            16..=23 => -(2 * (i - 16) + 1),
                            _ => -(63 - 2 * i),
                        };
                        step as f32 / 15.0
                    })
                    .collect(),
            ),
        },
        ChipWave {
            name: "square",
            expression: 0.5,
            samples: center_and_integrate_wave(vec![1.0, -1.0]),
        },
        ChipWave {
            name: "1/4 pulse",
            expression: 0.5,
            samples: center_and_integrate_wave(vec![1.0, -1.0, -1.0, -1.0]),
        },
        ChipWave {
            name: "1/8 pulse",
            expression: 0.5,
            samples: center_and_integrate_wave(vec![
                1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0,
            ]),
        },
        ChipWave {
            name: "sawtooth",
            expression: 0.65,
            samples: center_and_integrate_wave(
                (0..32)
                    .map(|i| {
                        let step = 2 * i as i32 + 1 - if i < 16 { 0 } else { 64 };
                        step as f32 / 31.0
                    })
                    .collect(),
            ),
        },
        ChipWave {
            name: "double saw",
            expression: 0.5,
            samples: center_and_integrate_wave(vec![
                0.0, -0.2, -0.4, -0.6, -0.8, -1.0, 1.0, -0.8, -0.6, -0.4, -0.2, 1.0, 0.8, 0.6,
                0.4, 0.2,
            ]),
        },
        ChipWave {
            name: "double pulse",
            expression: 0.4,
            samples: center_and_integrate_wave(vec![
                1.0, 1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0, -1.0, -1.0,
                -1.0, -1.0,
            ]),
        },
        ChipWave {
            name: "spiky",
            expression: 0.4,
            samples: center_and_integrate_wave(vec![1.0, -1.0, 1.0, -1.0, 1.0, 0.0]),
        },
    ]
});

/// A named basic-noise recipe.
#[derive(Debug)]
pub struct ChipNoise {
    /// Display name.
    pub name: &'static str,
    /// Amplitude compensation for this noise's inherent loudness.
    pub expression: f64,
    /// The pitch at which the wavetable plays back unshifted.
    pub base_pitch: usize,
    /// Scales the tracking cutoff of the one-pole pitch filter.
    pub pitch_filter_mult: f64,
    /// Soft noises keep the pitch filter active at all frequencies.
    pub is_soft: bool,
}

/// The selectable basic noises.
pub const CHIP_NOISES: [ChipNoise; 5] = [
    ChipNoise { name: "retro", expression: 0.25, base_pitch: 69, pitch_filter_mult: 1024.0, is_soft: false },
    ChipNoise { name: "white", expression: 1.0, base_pitch: 69, pitch_filter_mult: 8.0, is_soft: true },
    ChipNoise { name: "clang", expression: 0.4, base_pitch: 69, pitch_filter_mult: 1024.0, is_soft: false },
    ChipNoise { name: "buzz", expression: 0.3, base_pitch: 69, pitch_filter_mult: 1024.0, is_soft: false },
    ChipNoise { name: "hollow", expression: 1.5, base_pitch: 96, pitch_filter_mult: 1.0, is_soft: true },
];

// The LFSR noises append the new bit at different positions, which sets
// their repetition period and timbre.
fn lfsr_noise(tap: u32) -> Vec<f32> {
    let mut wave = Vec::with_capacity(CHIP_NOISE_LENGTH + 1);
    let mut buffer: u32 = 1;
    for _ in 0..CHIP_NOISE_LENGTH {
        wave.push((buffer & 1) as f32 * 2.0 - 1.0);
        let mut next = buffer >> 1;
        if (buffer + next) & 1 == 1 {
            next += tap;
        }
        buffer = next;
    }
    wave.push(wave[0]);
    wave
}

static RETRO_NOISE: Lazy<Vec<f32>> = Lazy::new(|| lfsr_noise(1 << 14));
static WHITE_NOISE: Lazy<Vec<f32>> = Lazy::new(|| {
    // A fixed seed keeps rendering reproducible run to run.
    let mut rng = crate::util::Rng::new_with_seed(0x9e3779b97f4a7c15);
    let mut wave: Vec<f32> = (0..CHIP_NOISE_LENGTH)
        .map(|_| rng.rand_bipolar() as f32)
        .collect();
    wave.push(wave[0]);
    wave
});
static CLANG_NOISE: Lazy<Vec<f32>> = Lazy::new(|| lfsr_noise(2 << 14));
static BUZZ_NOISE: Lazy<Vec<f32>> = Lazy::new(|| lfsr_noise(10 << 2));
static HOLLOW_NOISE: Lazy<Vec<f32>> = Lazy::new(|| {
    // Designed in frequency space, then converted to samples.
    let mut wave = vec![0.0f32; CHIP_NOISE_LENGTH];
    draw_noise_spectrum(&mut wave, 10.0, 11.0, 1.0, 1.0, 0.0);
    draw_noise_spectrum(&mut wave, 11.0, 14.0, 0.6578, 0.6578, 0.0);
    fft::inverse_real_fourier_transform(&mut wave);
    fft::scale_elements_by_factor(&mut wave, 1.0 / (CHIP_NOISE_LENGTH as f32).sqrt());
    wave.push(wave[0]);
    wave
});

/// The wavetable for the basic noise at the given index into [CHIP_NOISES].
pub fn chip_noise_samples(index: usize) -> &'static [f32] {
    match index {
        0 => &RETRO_NOISE,
        1 => &WHITE_NOISE,
        2 => &CLANG_NOISE,
        3 => &BUZZ_NOISE,
        _ => &HOLLOW_NOISE,
    }
}

/// Fills a band of a frequency-space buffer with pseudo-random partials
/// whose power ramps between `low_power` and `high_power` across the octave
/// range. Returns the combined amplitude added, which callers use to
/// normalize overall loudness.
pub fn draw_noise_spectrum(
    wave: &mut [f32],
    low_octave: f64,
    high_octave: f64,
    low_power: f64,
    high_power: f64,
    overall_slope: f64,
) -> f64 {
    let wave_length = wave.len() & !1;
    let reference_index = 1usize << 11;
    let low_index = 2.0_f64.powf(low_octave) as usize;
    let high_index = (2.0_f64.powf(high_octave) as usize).min(wave_length >> 1);
    // The sign flips come from the LFSR noise and the phase rotations from
    // the golden angle; both are deterministic so that re-rendering an
    // edited spectrum doesn't pop.
    let retro: &[f32] = &RETRO_NOISE;
    let mut combined_amplitude = 0.0;
    for i in low_index..high_index {
        let lerped =
            low_power + (high_power - low_power) * ((i as f64).log2() - low_octave) / (high_octave - low_octave);
        let mut amplitude = 2.0_f64.powf((lerped - 1.0) * 7.0 + 1.0) * lerped;
        amplitude *= (i as f64 / reference_index as f64).powf(overall_slope);
        combined_amplitude += amplitude;
        amplitude *= retro[i] as f64;
        let radians = 0.618_033_988_75 * i as f64 * i as f64 * std::f64::consts::TAU;
        wave[i] = (radians.cos() * amplitude) as f32;
        wave[wave_length - i] = (radians.sin() * amplitude) as f32;
    }
    combined_amplitude
}

/// A full-cycle sine table with one duplicated sample at the end for
/// interpolation.
pub static SINE_WAVE: Lazy<Vec<f32>> = Lazy::new(|| {
    (0..=SINE_WAVE_LENGTH)
        .map(|i| (std::f64::consts::TAU * i as f64 / SINE_WAVE_LENGTH as f64).sin() as f32)
        .collect()
});

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use more_asserts::{assert_gt, assert_lt};

    #[test]
    fn volume_settings() {
        assert_eq!(instrument_volume_to_mult(0), 1.0);
        assert_eq!(instrument_volume_to_mult(VOLUME_RANGE - 1), 0.0);
        assert_gt!(
            instrument_volume_to_mult(2),
            instrument_volume_to_mult(3)
        );
    }

    #[test]
    fn filter_setting_endpoints() {
        assert!(approx_eq!(
            f64,
            filter_freq_setting_to_hz((FILTER_FREQ_RANGE - 1) as f64),
            FILTER_FREQ_MAX_HZ
        ));
        assert_lt!(filter_freq_setting_to_hz(0.0), 70.0);
        assert!(approx_eq!(
            f64,
            filter_gain_setting_to_linear(FILTER_GAIN_CENTER as f64),
            1.0
        ));
    }

    #[test]
    fn pulse_width_settings() {
        // The widest setting is a square wave; each narrower step shrinks
        // the duty cycle.
        assert!(approx_eq!(f64, pulse_width_ratio(PULSE_WIDTH_RANGE - 1), 0.5));
        for width in 1..PULSE_WIDTH_RANGE {
            assert_gt!(pulse_width_ratio(width), pulse_width_ratio(width - 1));
        }
    }

    #[test]
    fn integrated_waves_are_zero_centered() {
        for wave in CHIP_WAVES.iter() {
            // An integrated zero-mean wave starts and ends at the same
            // value, so the duplicated last sample equals the first.
            let samples = &wave.samples;
            assert!(
                approx_eq!(f32, samples[0], samples[samples.len() - 1], epsilon = 1e-4),
                "wave {} does not wrap cleanly",
                wave.name
            );
        }
    }

    #[test]
    fn noise_tables_have_guard_sample() {
        for index in 0..CHIP_NOISES.len() {
            let samples = chip_noise_samples(index);
            assert_eq!(samples.len(), CHIP_NOISE_LENGTH + 1);
            assert_eq!(samples[0], samples[CHIP_NOISE_LENGTH]);
        }
    }

    #[test]
    fn arpeggio_patterns_cycle() {
        // Three pitches on the standard rhythm repeat 0, 1, 2, 1.
        let sequence: Vec<usize> = (0..8).map(|i| arpeggio_pitch_index(3, 1, i)).collect();
        assert_eq!(sequence, vec![0, 1, 2, 1, 0, 1, 2, 1]);
        // Chord sizes beyond the pattern table fall back to a plain cycle.
        let sequence: Vec<usize> = (0..4).map(|i| arpeggio_pitch_index(4, 1, i)).collect();
        assert_eq!(sequence, vec![0, 1, 2, 3]);
    }

    #[test]
    fn tables_are_consistent() {
        assert_eq!(SINE_WAVE.len(), SINE_WAVE_LENGTH + 1);
        for algorithm in ALGORITHMS.iter() {
            for (index, &carrier) in algorithm.associated_carrier.iter().enumerate() {
                assert!(carrier >= 1 && carrier <= algorithm.carrier_count, "{} operator {}", algorithm.name, index);
            }
        }
        for envelope in ENVELOPES.iter() {
            if matches!(envelope.shape, EnvelopeShape::Flare | EnvelopeShape::Twang | EnvelopeShape::Swell | EnvelopeShape::Decay) {
                assert_gt!(envelope.speed, 0.0);
            }
        }
    }
}
