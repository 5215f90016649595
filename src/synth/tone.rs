// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The runtime voice: one [Tone] per sounding pitch (or whole chord, for
//! single-tone chord policies).
//!
//! Tones are pooled and recycled. A recycled tone keeps its allocations
//! (the picked-string delay line, the filter array) but [Tone::reset]
//! clears every field that could leak audio from its previous life. Notes
//! are referenced by index into the current bar's pattern rather than by
//! pointer; the scheduler re-resolves them every tick, so an editor
//! swapping patterns out from under the synth invalidates nothing.

use crate::config;

use super::filtering::DynamicBiquad;

/// A back-reference to a note in the channel's currently playing pattern:
/// the index of the note within the pattern's note list.
pub(super) type NoteIndex = usize;

/// Per-tone state for the picked-string physical model: a fractional-delay
/// feedback loop with an all-pass for dispersion and a shelf for decay.
#[derive(Debug, Default)]
pub(super) struct PickedStringState {
    /// The circular delay line. Grown to fit the lowest pitch played.
    pub delay_line: Vec<f32>,
    /// Current write position.
    pub delay_index: usize,
    /// All-pass dispersion filter state.
    pub all_pass_sample: f64,
    pub all_pass_prev_input: f64,
    /// Loop damping shelf state.
    pub shelf_sample: f64,
    /// Fractional read offset behind the write position, in samples.
    pub delay_length: f64,
    /// Per-run loop coefficients, set by `compute_tone`.
    pub sustain_gain: f64,
    pub shelf_coefficient: f64,
    pub all_pass_coefficient: f64,
    /// Whether the string still needs its pluck impulse.
    pub needs_excitation: bool,
}
impl PickedStringState {
    fn reset(&mut self) {
        self.delay_line.fill(0.0);
        self.delay_index = 0;
        self.all_pass_sample = 0.0;
        self.all_pass_prev_input = 0.0;
        self.shelf_sample = 0.0;
        self.delay_length = 0.0;
        self.sustain_gain = 0.0;
        self.shelf_coefficient = 0.0;
        self.all_pass_coefficient = 0.0;
        self.needs_excitation = true;
    }
}

/// One sounding voice. Fields fall into three groups: scheduling (which
/// note/pitches, lifecycle counters), per-run interpolation (set by
/// `compute_tone` each run), and generator state (phases, feedback, nested
/// delay lines) that persists across runs.
#[derive(Debug)]
pub(super) struct Tone {
    /// Which of the channel's instruments this tone belongs to.
    pub instrument_index: usize,
    /// The sounding pitches. Only the first `pitch_count` entries are live.
    pub pitches: [usize; config::MAX_CHORD_SIZE],
    pub pitch_count: usize,
    /// The size of the chord this tone came from, for chord-volume scaling.
    pub chord_size: usize,
    /// The note this tone is playing, if any. None means live input.
    pub note: Option<NoteIndex>,
    pub prev_note: Option<NoteIndex>,
    pub next_note: Option<NoteIndex>,
    /// Which pitch of the note this tone carries.
    pub note_pitch_index: usize,
    /// Whether the tone has rendered at least one run since (re)starting.
    pub active: bool,
    /// Note start/end in parts, after strum offsets.
    pub note_start: i32,
    pub note_end: i32,
    /// The note's length in ticks, as of the current run.
    pub note_length_ticks: f64,
    /// For released tones, ticks since the release began.
    pub ticks_since_released: f64,
    /// For live-input tones, samples since the key went down.
    pub live_input_samples_held: usize,
    /// The interval and size the tone last rendered at, for seamless
    /// continuations.
    pub last_interval: f64,
    pub last_size: f64,
    /// Forced fast fade when the channel is over its voice cap.
    pub fade_out_fast: bool,

    // Per-run interpolation state.
    pub expression_start: f64,
    pub expression_delta: f64,
    pub phase_delta_scale: f64,
    pub pulse_width: f64,
    pub pulse_width_delta: f64,
    /// Secondary-voice pitch ratio for custom-interval chords.
    pub interval_mult: f64,
    pub interval_expression_mult: f64,
    /// For drumset tones, which drum row is playing.
    pub drumset_pitch: usize,

    // Generator state.
    pub phases: [f64; config::OPERATOR_COUNT],
    pub phase_deltas: [f64; config::OPERATOR_COUNT],
    pub expression_starts: [f64; config::OPERATOR_COUNT],
    pub expression_deltas: [f64; config::OPERATOR_COUNT],
    pub feedback_outputs: [f64; config::OPERATOR_COUNT],
    pub feedback_mult: f64,
    pub feedback_delta: f64,
    /// One-pole noise filter memory, and the generic "previous sample".
    pub sample: f64,
    pub supersaw_phases: [f64; config::SUPERSAW_VOICE_COUNT],
    /// The supersaw's pulse-shaping delay line.
    pub supersaw_delay_line: Vec<f32>,
    pub supersaw_delay_index: usize,
    pub supersaw_dynamism: f64,
    pub supersaw_dynamism_delta: f64,
    pub supersaw_unison_detunes: [f64; config::SUPERSAW_VOICE_COUNT],
    pub supersaw_shape: f64,
    pub supersaw_shape_delta: f64,
    pub supersaw_delay_length: f64,
    pub supersaw_delay_length_delta: f64,
    pub string: PickedStringState,
    /// The note filter chain, one biquad per control point.
    pub note_filters: [DynamicBiquad; config::FILTER_MAX_POINTS],
    pub note_filter_count: usize,
}
impl Default for Tone {
    fn default() -> Self {
        let mut tone = Self {
            instrument_index: 0,
            pitches: [0; config::MAX_CHORD_SIZE],
            pitch_count: 0,
            chord_size: 1,
            note: None,
            prev_note: None,
            next_note: None,
            note_pitch_index: 0,
            active: false,
            note_start: 0,
            note_end: 0,
            note_length_ticks: 0.0,
            ticks_since_released: 0.0,
            live_input_samples_held: 0,
            last_interval: 0.0,
            last_size: config::NOTE_SIZE_MAX as f64,
            fade_out_fast: false,
            expression_start: 0.0,
            expression_delta: 0.0,
            phase_delta_scale: 1.0,
            pulse_width: 0.5,
            pulse_width_delta: 0.0,
            interval_mult: 1.0,
            interval_expression_mult: 1.0,
            drumset_pitch: 0,
            phases: [0.0; config::OPERATOR_COUNT],
            phase_deltas: [0.0; config::OPERATOR_COUNT],
            expression_starts: [0.0; config::OPERATOR_COUNT],
            expression_deltas: [0.0; config::OPERATOR_COUNT],
            feedback_outputs: [0.0; config::OPERATOR_COUNT],
            feedback_mult: 0.0,
            feedback_delta: 0.0,
            sample: 0.0,
            supersaw_phases: [0.0; config::SUPERSAW_VOICE_COUNT],
            supersaw_delay_line: Vec::default(),
            supersaw_delay_index: 0,
            supersaw_dynamism: 0.0,
            supersaw_dynamism_delta: 0.0,
            supersaw_unison_detunes: [0.0; config::SUPERSAW_VOICE_COUNT],
            supersaw_shape: 0.0,
            supersaw_shape_delta: 0.0,
            supersaw_delay_length: 0.0,
            supersaw_delay_length_delta: 0.0,
            string: PickedStringState::default(),
            note_filters: [DynamicBiquad::default(); config::FILTER_MAX_POINTS],
            note_filter_count: 0,
        };
        tone.reset();
        tone
    }
}
impl Tone {
    /// Clears everything that could carry audio or scheduling state over
    /// from a previous use of this pooled tone. Allocations are kept.
    pub fn reset(&mut self) {
        self.pitch_count = 0;
        self.chord_size = 1;
        self.note = None;
        self.prev_note = None;
        self.next_note = None;
        self.note_pitch_index = 0;
        self.active = false;
        self.note_length_ticks = 0.0;
        self.ticks_since_released = 0.0;
        self.live_input_samples_held = 0;
        self.last_interval = 0.0;
        self.last_size = config::NOTE_SIZE_MAX as f64;
        self.fade_out_fast = false;
        self.interval_mult = 1.0;
        self.interval_expression_mult = 1.0;
        self.reset_phases();
    }

    /// Clears only the audio-rendering state: a retriggered note restarts
    /// its waveform from silence but keeps its scheduling identity.
    pub fn reset_phases(&mut self) {
        self.phases = [0.0; config::OPERATOR_COUNT];
        self.feedback_outputs = [0.0; config::OPERATOR_COUNT];
        self.sample = 0.0;
        self.supersaw_phases = [0.0; config::SUPERSAW_VOICE_COUNT];
        self.supersaw_delay_line.fill(0.0);
        self.supersaw_delay_index = 0;
        self.string.reset();
        for filter in self.note_filters.iter_mut() {
            filter.reset();
        }
        self.note_filter_count = 0;
    }

    /// The tone's first (primary) pitch.
    pub fn first_pitch(&self) -> usize {
        self.pitches[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_audio_state_but_keeps_allocations() {
        let mut tone = Tone::default();
        tone.phases[0] = 0.7;
        tone.sample = 0.3;
        tone.string.delay_line = vec![1.0; 512];
        tone.string.all_pass_sample = 0.5;
        tone.supersaw_delay_line = vec![0.25; 64];
        tone.note = Some(3);
        tone.active = true;
        let delay_capacity = tone.string.delay_line.capacity();
        tone.reset();
        assert_eq!(tone.phases[0], 0.0);
        assert_eq!(tone.sample, 0.0);
        assert!(tone.string.delay_line.iter().all(|s| *s == 0.0));
        assert_eq!(tone.string.delay_line.capacity(), delay_capacity);
        assert!(tone.supersaw_delay_line.iter().all(|s| *s == 0.0));
        assert!(tone.note.is_none());
        assert!(!tone.active);
        assert!(tone.string.needs_excitation);
    }
}
