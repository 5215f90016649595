// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The envelope computer: turns an instrument's envelope assignments into
//! per-tick start/end multipliers, one slot per automatable target.
//!
//! Everything downstream (tone parameter interpolation, the effects chain)
//! reads these values instead of evaluating curves itself. Each slot
//! defaults to 1.0; assigned envelopes multiply in, so stacking an envelope
//! on an already-automated target composes rather than replaces.

use crate::{
    config::{self, EnvelopeShape},
    song::{AutomationTarget, Instrument},
};

/// One multiplier per automatable target, at a single instant.
#[derive(Clone, Copy, Debug)]
pub(super) struct EnvelopeValues {
    pub note_volume: f64,
    pub note_filter_freq: [f64; config::FILTER_MAX_POINTS],
    pub note_filter_gain: [f64; config::FILTER_MAX_POINTS],
    pub pulse_width: f64,
    pub vibrato_depth: f64,
    pub operator_amplitude: [f64; config::OPERATOR_COUNT],
    pub operator_frequency: [f64; config::OPERATOR_COUNT],
    pub pitch_shift: f64,
    pub detune: f64,
    pub string_sustain: f64,
    pub bitcrusher_frequency: f64,
    pub bitcrusher_quantization: f64,
    pub chorus: f64,
    pub echo_sustain: f64,
    pub reverb: f64,
    pub supersaw_shape: f64,
    pub supersaw_spread: f64,
    pub supersaw_dynamism: f64,
}
impl Default for EnvelopeValues {
    fn default() -> Self {
        Self {
            note_volume: 1.0,
            note_filter_freq: [1.0; config::FILTER_MAX_POINTS],
            note_filter_gain: [1.0; config::FILTER_MAX_POINTS],
            pulse_width: 1.0,
            vibrato_depth: 1.0,
            operator_amplitude: [1.0; config::OPERATOR_COUNT],
            operator_frequency: [1.0; config::OPERATOR_COUNT],
            pitch_shift: 1.0,
            detune: 1.0,
            string_sustain: 1.0,
            bitcrusher_frequency: 1.0,
            bitcrusher_quantization: 1.0,
            chorus: 1.0,
            echo_sustain: 1.0,
            reverb: 1.0,
            supersaw_shape: 1.0,
            supersaw_spread: 1.0,
            supersaw_dynamism: 1.0,
        }
    }
}
impl EnvelopeValues {
    fn slot(&mut self, target: AutomationTarget, index: usize) -> Option<&mut f64> {
        match target {
            AutomationTarget::None => None,
            AutomationTarget::NoteVolume => Some(&mut self.note_volume),
            AutomationTarget::NoteFilterFreq => self.note_filter_freq.get_mut(index),
            AutomationTarget::NoteFilterGain => self.note_filter_gain.get_mut(index),
            AutomationTarget::PulseWidth => Some(&mut self.pulse_width),
            AutomationTarget::VibratoDepth => Some(&mut self.vibrato_depth),
            AutomationTarget::OperatorAmplitude => self.operator_amplitude.get_mut(index),
            AutomationTarget::OperatorFrequency => self.operator_frequency.get_mut(index),
            AutomationTarget::PitchShift => Some(&mut self.pitch_shift),
            AutomationTarget::Detune => Some(&mut self.detune),
            AutomationTarget::StringSustain => Some(&mut self.string_sustain),
            AutomationTarget::BitcrusherFrequency => Some(&mut self.bitcrusher_frequency),
            AutomationTarget::BitcrusherQuantization => {
                Some(&mut self.bitcrusher_quantization)
            }
            AutomationTarget::Chorus => Some(&mut self.chorus),
            AutomationTarget::EchoSustain => Some(&mut self.echo_sustain),
            AutomationTarget::Reverb => Some(&mut self.reverb),
            AutomationTarget::SupersawShape => Some(&mut self.supersaw_shape),
            AutomationTarget::SupersawSpread => Some(&mut self.supersaw_spread),
            AutomationTarget::SupersawDynamism => Some(&mut self.supersaw_dynamism),
        }
    }
}

/// A single instant on the note being evaluated: how far into the note and
/// the bar it is, and the note's own size-derived loudness there.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct EnvelopeInstant {
    /// Seconds since the note (or live pitch) began.
    pub note_seconds: f64,
    /// Beats since the start of the current bar.
    pub beats: f64,
    /// The note's size at this instant, converted to a loudness multiplier.
    pub note_size_mult: f64,
}

/// Evaluates one envelope curve at one instant.
pub(super) fn compute_envelope(envelope: &config::Envelope, instant: &EnvelopeInstant) -> f64 {
    let time = instant.note_seconds;
    let speed = envelope.speed;
    match envelope.shape {
        EnvelopeShape::NoteSize => instant.note_size_mult,
        EnvelopeShape::Steady => 1.0,
        EnvelopeShape::Punch => (2.0 - time * 10.0).max(1.0),
        EnvelopeShape::Flare => {
            let attack = 0.25 / speed.sqrt();
            if time < attack {
                time / attack
            } else {
                1.0 / (1.0 + (time - attack) * speed)
            }
        }
        EnvelopeShape::Twang => 1.0 / (1.0 + time * speed),
        EnvelopeShape::Swell => 1.0 - 1.0 / (1.0 + time * speed),
        EnvelopeShape::Tremolo => {
            0.5 - (instant.beats * std::f64::consts::TAU * speed).cos() * 0.5
        }
        EnvelopeShape::Tremolo2 => {
            0.75 - (instant.beats * std::f64::consts::TAU * speed).cos() * 0.25
        }
        EnvelopeShape::Decay => 2.0_f64.powf(-speed * time),
    }
}

/// Computes the full target-multiplier table for one instant. If nothing
/// explicitly automates note volume, the note's own size still does, so
/// note velocity always affects loudness.
pub(super) fn compute_envelopes(
    instrument: &Instrument,
    instant: &EnvelopeInstant,
) -> EnvelopeValues {
    let mut values = EnvelopeValues::default();
    let mut note_volume_automated = false;
    for assignment in &instrument.envelopes {
        let Some(envelope) = config::ENVELOPES.get(assignment.envelope) else {
            continue;
        };
        if assignment.target == AutomationTarget::NoteVolume {
            note_volume_automated = true;
        }
        if let Some(slot) = values.slot(assignment.target, assignment.index) {
            *slot *= compute_envelope(envelope, instant);
        }
    }
    if !note_volume_automated {
        values.note_volume *= instant.note_size_mult;
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::InstrumentKind;
    use float_cmp::approx_eq;
    use more_asserts::{assert_gt, assert_lt};

    fn instant(note_seconds: f64, beats: f64) -> EnvelopeInstant {
        EnvelopeInstant {
            note_seconds,
            beats,
            note_size_mult: 1.0,
        }
    }

    fn envelope_named(name: &str) -> &'static config::Envelope {
        config::ENVELOPES
            .iter()
            .find(|e| e.name == name)
            .unwrap()
    }

    #[test]
    fn punch_boosts_then_settles() {
        let punch = envelope_named("punch");
        assert!(approx_eq!(
            f64,
            compute_envelope(punch, &instant(0.0, 0.0)),
            2.0
        ));
        assert!(approx_eq!(
            f64,
            compute_envelope(punch, &instant(0.5, 0.0)),
            1.0
        ));
    }

    #[test]
    fn twang_decays_and_swell_rises() {
        let twang = envelope_named("twang 1");
        let swell = envelope_named("swell 1");
        assert_gt!(
            compute_envelope(twang, &instant(0.0, 0.0)),
            compute_envelope(twang, &instant(1.0, 0.0))
        );
        assert_lt!(
            compute_envelope(swell, &instant(0.0, 0.0)),
            compute_envelope(swell, &instant(1.0, 0.0))
        );
        // They are complements of each other.
        let t = instant(0.37, 0.0);
        assert!(approx_eq!(
            f64,
            compute_envelope(twang, &t) + compute_envelope(swell, &t),
            1.0
        ));
    }

    #[test]
    fn tremolo_tracks_beats_not_seconds() {
        let tremolo = envelope_named("tremolo1");
        // A full period at speed 4 is a quarter beat; elapsed seconds are
        // irrelevant.
        let quarter = compute_envelope(tremolo, &instant(99.0, 0.25));
        let start = compute_envelope(tremolo, &instant(0.0, 0.0));
        assert!(approx_eq!(f64, quarter, start, epsilon = 1e-9));
        let peak = compute_envelope(tremolo, &instant(0.0, 0.125));
        assert!(approx_eq!(f64, peak, 1.0, epsilon = 1e-9));
    }

    #[test]
    fn flare_attacks_before_decaying() {
        let flare = envelope_named("flare 2");
        let attack = 0.25 / 8.0_f64.sqrt();
        assert!(approx_eq!(
            f64,
            compute_envelope(flare, &instant(attack / 2.0, 0.0)),
            0.5
        ));
        assert!(approx_eq!(
            f64,
            compute_envelope(flare, &instant(attack, 0.0)),
            1.0
        ));
        assert_lt!(compute_envelope(flare, &instant(attack + 1.0, 0.0)), 0.2);
    }

    #[test]
    fn note_size_defaults_into_note_volume() {
        let instrument = Instrument::new(InstrumentKind::Chip, false);
        let quiet = EnvelopeInstant {
            note_seconds: 0.0,
            beats: 0.0,
            note_size_mult: 0.25,
        };
        let values = compute_envelopes(&instrument, &quiet);
        assert!(approx_eq!(f64, values.note_volume, 0.25));
        // Once note volume is explicitly automated, note size no longer
        // sneaks in implicitly.
        let mut automated = instrument.clone();
        automated.assign_envelope(crate::song::AutomationTarget::NoteVolume, 0, 1);
        let values = compute_envelopes(&automated, &quiet);
        assert!(approx_eq!(f64, values.note_volume, 1.0));
    }

    #[test]
    fn indexed_targets_land_in_their_slot() {
        let mut instrument = Instrument::new(InstrumentKind::Fm, false);
        // "twang 1" on operator 2's amplitude only.
        instrument.assign_envelope(crate::song::AutomationTarget::OperatorAmplitude, 2, 6);
        let values = compute_envelopes(&instrument, &instant(1.0, 0.0));
        assert_lt!(values.operator_amplitude[2], 1.0);
        assert!(approx_eq!(f64, values.operator_amplitude[0], 1.0));
    }
}
