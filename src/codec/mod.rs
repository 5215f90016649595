// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Serialization of [Song]s to and from a compact printable string, plus a
//! JSON form for interchange.
//!
//! The string form is a version character followed by tagged sections. Each
//! tag is one base64 character; fixed-size fields follow as base64
//! characters and variable-size payloads (bar maps, notes, spectra) as
//! packed bit streams. The format has gone through several revisions;
//! decoding routes every tag through an ordered table of
//! version-range rules, so a current decoder reads every revision back to
//! version 2 and migrates legacy settings onto the current model.
//!
//! Encoding always writes the current version. Unknown tags are a hard
//! error, since a skipped tag would desynchronize everything after it.
//! Out-of-range values are clamped rather than rejected.

mod bits;
mod json;

pub use json::{song_from_json, song_to_json};

use std::ops::RangeInclusive;

use log::debug;
use thiserror::Error;

use crate::{
    config,
    song::{
        AutomationTarget, EnvelopeAssignment, FilterControlPoint, FilterSettings, FilterType,
        Instrument, InstrumentKind, Note, NotePin, Song, SpectrumWave,
    },
    types::Tempo,
};
use bits::{base64_value, BitReader, BitWriter, BASE64_CHARS};

/// The version written by [encode_song].
const CURRENT_VERSION: u32 = 9;
/// The oldest version [decode_song] still reads.
const OLDEST_SUPPORTED_VERSION: u32 = 2;

/// How many recently-used pitches the pattern coder tracks.
const RECENT_PITCH_COUNT: usize = 8;
/// How many recently-used note shapes the pattern coder tracks.
const RECENT_SHAPE_COUNT: usize = 10;

/// Versions 2 and 3 stored tempo as an index into this preset table.
const LEGACY_TEMPO_PRESETS: [f64; 15] = [
    88.0, 95.0, 103.0, 111.0, 120.0, 130.0, 140.0, 151.0, 163.0, 176.0, 190.0, 206.0, 222.0,
    240.0, 259.0,
];
/// Version 2 stored beats per bar as an index into this table.
const LEGACY_BEAT_COUNTS: [usize; 5] = [6, 7, 8, 9, 10];
/// Pre-7 filter presets, as low-pass corner settings on the current scale.
const LEGACY_FILTER_FREQS: [usize; 7] = [30, 18, 9, 0, 24, 15, 6];
/// The envelope each pre-7 filter preset implied.
const LEGACY_FILTER_ENVELOPES: [usize; 7] = [1, 1, 1, 1, 18, 19, 20];
/// Pre-7 combined vibrato/tremolo presets: the vibrato half.
const LEGACY_VIBRATO_EFFECTS: [usize; 6] = [0, 1, 2, 3, 0, 0];
/// Pre-7 combined vibrato/tremolo presets: the volume-envelope half.
const LEGACY_VIBRATO_ENVELOPES: [usize; 6] = [1, 1, 1, 1, 16, 13];
/// Pre-7 chip waves were stored in a different order.
const LEGACY_WAVE_ORDER: [usize; 9] = [1, 2, 3, 4, 5, 6, 7, 8, 0];
/// Pre-7 volume settings ran 0..=5 with 5 meaning mute.
const LEGACY_VOLUME_MUTE: u32 = 5;

/// Why a song string failed to decode.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The version character is missing or outside the supported range.
    #[error("unsupported format version {version:?}")]
    UnsupportedVersion {
        /// The offending character.
        version: char,
    },
    /// A tag character that no format revision defines.
    #[error("unrecognized tag {tag:?} at character {index}")]
    UnknownTag {
        /// The offending character.
        tag: char,
        /// Its position in the input.
        index: usize,
    },
    /// A field character outside the base64 alphabet.
    #[error("character {index} is outside the song alphabet")]
    InvalidCharacter {
        /// Its position in the input.
        index: usize,
    },
    /// The string ended in the middle of a field.
    #[error("song string ends in the middle of a {tag:?} field")]
    UnexpectedEnd {
        /// The tag whose field was truncated.
        tag: char,
    },
    /// The note payload referenced state it never established.
    #[error("malformed note data: {reason}")]
    MalformedNotes {
        /// What went wrong.
        reason: &'static str,
    },
    /// The JSON form failed to parse.
    #[error("json form: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parses a song from either codec form: the compact string (with an
/// optional leading `#`, as copied from a URL fragment) or the JSON tree.
/// An empty string yields the default song.
pub fn decode_song(input: &str) -> Result<Song, DecodeError> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Ok(Song::default());
    }
    if trimmed.starts_with('{') {
        return song_from_json(trimmed);
    }
    Decoder::new(trimmed.as_bytes())?.run()
}

/// Serializes a song to the compact string form at the current version.
pub fn encode_song(song: &Song) -> String {
    let mut buffer: Vec<u8> = Vec::new();
    push_value(&mut buffer, CURRENT_VERSION as usize);

    if !song.title.is_empty() {
        encode_title(&mut buffer, &song.title);
    }
    buffer.push(b'n');
    push_value(&mut buffer, song.pitch_channel_count);
    push_value(&mut buffer, song.noise_channel_count);
    push_tagged(&mut buffer, b's', song.scale);
    push_tagged(&mut buffer, b'k', song.key);
    buffer.push(b'l');
    push_value(&mut buffer, song.loop_start >> 6);
    push_value(&mut buffer, song.loop_start);
    buffer.push(b'e');
    push_value(&mut buffer, (song.loop_length - 1) >> 6);
    push_value(&mut buffer, song.loop_length - 1);
    let bpm = song.tempo.0.round() as usize;
    buffer.push(b't');
    push_value(&mut buffer, bpm >> 6);
    push_value(&mut buffer, bpm);
    push_tagged(&mut buffer, b'a', song.beats_per_bar - 1);
    buffer.push(b'g');
    push_value(&mut buffer, (song.bar_count - 1) >> 6);
    push_value(&mut buffer, song.bar_count - 1);
    buffer.push(b'j');
    push_value(&mut buffer, (song.patterns_per_channel - 1) >> 6);
    push_value(&mut buffer, song.patterns_per_channel - 1);
    buffer.push(b'i');
    push_value(
        &mut buffer,
        song.instruments_per_channel - config::INSTRUMENTS_PER_CHANNEL_MIN,
    );
    push_value(&mut buffer, song.layered_instruments as usize);
    push_tagged(&mut buffer, b'r', song.rhythm);
    buffer.push(b'o');
    for channel in &song.channels {
        push_value(&mut buffer, channel.octave);
    }

    for channel in &song.channels {
        for instrument in &channel.instruments {
            encode_instrument(&mut buffer, instrument);
        }
    }

    encode_bars(&mut buffer, song);
    encode_patterns(&mut buffer, song);

    // The buffer only ever holds alphabet characters and tag letters.
    String::from_utf8(buffer).expect("song buffer is always ASCII")
}

fn push_value(buffer: &mut Vec<u8>, value: usize) {
    buffer.push(BASE64_CHARS[value & 0x3f]);
}

fn push_tagged(buffer: &mut Vec<u8>, tag: u8, value: usize) {
    buffer.push(tag);
    push_value(buffer, value);
}

/// The number of bits needed to distinguish `values` alternatives.
fn bits_needed(values: usize) -> u32 {
    let mut bits = 0;
    while (1usize << bits) < values {
        bits += 1;
    }
    bits
}

fn encode_title(buffer: &mut Vec<u8>, title: &str) {
    // Twelve bits of length, then two characters per byte.
    let bytes = &title.as_bytes()[..title.len().min(0xfff)];
    buffer.push(b'N');
    push_value(buffer, bytes.len() >> 6);
    push_value(buffer, bytes.len());
    for &byte in bytes {
        push_value(buffer, (byte >> 6) as usize);
        push_value(buffer, byte as usize);
    }
}

fn encode_filter(buffer: &mut Vec<u8>, tag: u8, filter: &FilterSettings) {
    buffer.push(tag);
    push_value(buffer, filter.points.len());
    for point in &filter.points {
        push_value(buffer, point.kind as usize);
        push_value(buffer, point.freq);
        push_value(buffer, point.gain);
    }
}

fn encode_spectrum(buffer: &mut Vec<u8>, spectra: &[&SpectrumWave]) {
    let mut writer = BitWriter::default();
    for wave in spectra {
        for &value in &wave.spectrum {
            writer.write(config::SPECTRUM_CONTROL_POINT_BITS, value as u32);
        }
    }
    writer.encode_base64(buffer);
}

fn encode_instrument(buffer: &mut Vec<u8>, instrument: &Instrument) {
    push_tagged(buffer, b'T', instrument.kind as usize);
    push_tagged(buffer, b'v', instrument.volume);
    push_tagged(buffer, b'Y', instrument.pan);
    buffer.push(b'q');
    push_value(buffer, (instrument.effects >> 6) as usize);
    push_value(buffer, instrument.effects as usize);
    encode_filter(buffer, b'f', &instrument.eq_filter);
    encode_filter(buffer, b'F', &instrument.note_filter);
    buffer.push(b'E');
    push_value(buffer, instrument.envelopes.len());
    for assignment in &instrument.envelopes {
        push_value(buffer, assignment.target as usize);
        push_value(buffer, assignment.index);
        push_value(buffer, assignment.envelope);
    }
    push_tagged(buffer, b'd', instrument.transition);
    push_tagged(buffer, b'C', instrument.chord);
    push_tagged(buffer, b'c', instrument.vibrato);
    push_tagged(buffer, b'h', instrument.unison);
    push_tagged(buffer, b'X', instrument.pitch_shift);
    push_tagged(buffer, b'D', instrument.detune);

    match instrument.kind {
        InstrumentKind::Chip => {
            push_tagged(buffer, b'w', instrument.chip_wave);
        }
        InstrumentKind::Noise => {
            push_tagged(buffer, b'w', instrument.chip_noise);
        }
        InstrumentKind::Fm => {
            push_tagged(buffer, b'A', instrument.algorithm);
            push_tagged(buffer, b'B', instrument.feedback_type);
            push_tagged(buffer, b'V', instrument.feedback_amplitude);
            buffer.push(b'Q');
            for operator in &instrument.operators {
                push_value(buffer, operator.frequency);
            }
            buffer.push(b'P');
            for operator in &instrument.operators {
                push_value(buffer, operator.amplitude);
            }
        }
        InstrumentKind::Spectrum => {
            buffer.push(b'S');
            encode_spectrum(buffer, &[&instrument.spectrum_wave]);
        }
        InstrumentKind::Drumset => {
            buffer.push(b'z');
            for &envelope in &instrument.drumset_envelopes {
                push_value(buffer, envelope);
            }
            buffer.push(b'S');
            let spectra: Vec<&SpectrumWave> = instrument.drumset_spectrum_waves.iter().collect();
            encode_spectrum(buffer, &spectra);
        }
        InstrumentKind::Harmonics | InstrumentKind::PickedString => {
            buffer.push(b'H');
            let mut writer = BitWriter::default();
            for &value in &instrument.harmonics_wave.harmonics {
                writer.write(config::HARMONICS_CONTROL_POINT_BITS, value as u32);
            }
            writer.encode_base64(buffer);
            if instrument.kind == InstrumentKind::PickedString {
                push_tagged(buffer, b'I', instrument.string_sustain);
            }
        }
        InstrumentKind::Pwm => {
            push_tagged(buffer, b'W', instrument.pulse_width);
        }
        InstrumentKind::Supersaw => {
            buffer.push(b'x');
            push_value(buffer, instrument.supersaw_dynamism);
            push_value(buffer, instrument.supersaw_spread);
            push_value(buffer, instrument.supersaw_shape);
        }
    }

    // Settings for bypassed stages keep their defaults, so only enabled
    // stages are worth the characters.
    use crate::song::EffectKind;
    if instrument.effect_enabled(EffectKind::Distortion) {
        push_tagged(buffer, b'U', instrument.distortion);
    }
    if instrument.effect_enabled(EffectKind::Bitcrusher) {
        buffer.push(b'u');
        push_value(buffer, instrument.bitcrusher_freq);
        push_value(buffer, instrument.bitcrusher_quantization);
    }
    if instrument.effect_enabled(EffectKind::Chorus) {
        push_tagged(buffer, b'y', instrument.chorus);
    }
    if instrument.effect_enabled(EffectKind::Echo) {
        buffer.push(b'm');
        push_value(buffer, instrument.echo_sustain);
        push_value(buffer, instrument.echo_delay);
    }
    if instrument.effect_enabled(EffectKind::Reverb) {
        push_tagged(buffer, b'R', instrument.reverb);
    }
}

fn encode_bars(buffer: &mut Vec<u8>, song: &Song) {
    buffer.push(b'b');
    let mut writer = BitWriter::default();
    let needed_bits = bits_needed(song.patterns_per_channel + 1);
    for channel in &song.channels {
        for &bar in &channel.bars {
            writer.write(needed_bits, bar as u32);
        }
    }
    writer.encode_base64(buffer);
}

fn encode_patterns(buffer: &mut Vec<u8>, song: &Song) {
    let mut writer = BitWriter::default();
    let needed_instrument_bits = bits_needed(song.instruments_per_channel);
    let parts_per_bar = song.parts_per_bar();
    for (channel_index, channel) in song.channels.iter().enumerate() {
        let is_noise = song.is_noise_channel(channel_index);
        let octave_offset = if is_noise {
            0
        } else {
            channel.octave as i32 * 12
        };
        let mut last_pitch = if is_noise { 4 } else { 12 } + octave_offset;
        let mut recent_pitches: Vec<i32> = if is_noise {
            vec![4, 6, 7, 2, 3, 8, 0, 10]
        } else {
            vec![12, 19, 24, 31, 36, 7, 0]
        };
        for pitch in recent_pitches.iter_mut() {
            *pitch += octave_offset;
        }
        let mut recent_shapes: Vec<Vec<u8>> = Vec::new();

        for pattern in &channel.patterns {
            writer.write(
                needed_instrument_bits,
                pattern.instruments.first().copied().unwrap_or(0) as u32,
            );
            if pattern.notes.is_empty() {
                writer.write(1, 0);
                continue;
            }
            writer.write(1, 1);
            let mut cur_part = 0usize;
            for note in &pattern.notes {
                if note.start > cur_part {
                    // A rest.
                    writer.write(2, 0);
                    writer.write_part_duration((note.start - cur_part) as u32);
                }

                // The shape: everything about the note except which
                // pitches it plays.
                let mut shape = BitWriter::default();
                for _ in 1..note.pitches.len() {
                    shape.write(1, 1);
                }
                if note.pitches.len() < config::MAX_CHORD_SIZE {
                    shape.write(1, 0);
                }
                shape.write_pin_count(note.pins.len() as u32 - 1);
                shape.write(2, note.pins[0].size as u32);
                let base_pitch = note.pitches[0] as i32;
                let mut shape_part = 0usize;
                let mut current_pitch = base_pitch;
                let mut pitch_bends: Vec<i32> = Vec::new();
                for pin in &note.pins[1..] {
                    let next_pitch = base_pitch + pin.interval;
                    if current_pitch != next_pitch {
                        shape.write(1, 1);
                        pitch_bends.push(next_pitch);
                        current_pitch = next_pitch;
                    } else {
                        shape.write(1, 0);
                    }
                    shape.write_part_duration((pin.time - shape_part) as u32);
                    shape_part = pin.time;
                    shape.write(2, pin.size as u32);
                }

                let shape_chars = shape.to_base64();
                if let Some(shape_index) =
                    recent_shapes.iter().position(|chars| *chars == shape_chars)
                {
                    writer.write(1, 1);
                    writer.write_long_tail(0, 0, shape_index as u32);
                    recent_shapes.remove(shape_index);
                } else {
                    writer.write(2, 1);
                    writer.concat(&shape);
                }
                recent_shapes.insert(0, shape_chars);
                recent_shapes.truncate(RECENT_SHAPE_COUNT);

                // The pitches, base pitches first and then bend targets,
                // each as a recent-pitch reference or a step interval that
                // skips over the recent pitches.
                let all_pitches: Vec<i32> = note
                    .pitches
                    .iter()
                    .map(|&pitch| pitch as i32)
                    .chain(pitch_bends.iter().copied())
                    .collect();
                for (i, &pitch) in all_pitches.iter().enumerate() {
                    if let Some(recent_index) =
                        recent_pitches.iter().position(|&recent| recent == pitch)
                    {
                        writer.write(1, 1);
                        writer.write(3, recent_index as u32);
                        recent_pitches.remove(recent_index);
                    } else {
                        writer.write(1, 0);
                        let mut interval = 0i32;
                        let mut pitch_iter = last_pitch;
                        if pitch_iter < pitch {
                            while pitch_iter != pitch {
                                pitch_iter += 1;
                                if !recent_pitches.contains(&pitch_iter) {
                                    interval += 1;
                                }
                            }
                        } else {
                            while pitch_iter != pitch {
                                pitch_iter -= 1;
                                if !recent_pitches.contains(&pitch_iter) {
                                    interval -= 1;
                                }
                            }
                        }
                        writer.write_pitch_interval(interval);
                    }
                    recent_pitches.insert(0, pitch);
                    recent_pitches.truncate(RECENT_PITCH_COUNT);
                    last_pitch = if i == note.pitches.len() - 1 {
                        all_pitches[0]
                    } else {
                        pitch
                    };
                }
                cur_part = note.end;
            }
            if cur_part < parts_per_bar {
                writer.write(2, 0);
                writer.write_part_duration((parts_per_bar - cur_part) as u32);
            }
        }
    }

    // Length prefix: a digit count, the length in base64 digits, then the
    // payload.
    buffer.push(b'p');
    let mut length = writer.base64_len();
    let mut digits: Vec<u8> = Vec::new();
    while length >= 64 {
        digits.insert(0, BASE64_CHARS[length & 0x3f]);
        length >>= 6;
    }
    digits.insert(0, BASE64_CHARS[length & 0x3f]);
    push_value(buffer, digits.len());
    buffer.extend_from_slice(&digits);
    writer.encode_base64(buffer);
}

/// One parsed note shape, kept in the recently-used list so repeated
/// rhythms cost a couple of bits.
#[derive(Clone, Debug)]
struct NoteShape {
    pitch_count: usize,
    initial_size: u32,
    pins: Vec<ShapePin>,
}
#[derive(Clone, Copy, Debug)]
struct ShapePin {
    pitch_bend: bool,
    duration: u32,
    size: u32,
}
impl NoteShape {
    fn bend_count(&self) -> usize {
        self.pins.iter().filter(|pin| pin.pitch_bend).count()
    }

    fn total_duration(&self) -> usize {
        self.pins.iter().map(|pin| pin.duration as usize).sum()
    }
}

type RuleFn = fn(&mut Decoder) -> Result<(), DecodeError>;

/// One entry of the decode table: the versions a tag's layout applies to,
/// and the rule that reads it (migrating onto the current model where the
/// layouts differ).
struct TagRule {
    tag: u8,
    versions: RangeInclusive<u32>,
    apply: RuleFn,
}

/// The decode table, in match order. A tag may appear more than once with
/// disjoint version ranges; the first matching entry wins.
static TAG_RULES: &[TagRule] = &[
    TagRule { tag: b'N', versions: 9..=9, apply: Decoder::read_title },
    TagRule { tag: b'n', versions: 2..=9, apply: Decoder::read_channel_counts },
    TagRule { tag: b's', versions: 2..=9, apply: Decoder::read_scale },
    TagRule { tag: b'k', versions: 2..=6, apply: Decoder::read_legacy_key },
    TagRule { tag: b'k', versions: 7..=9, apply: Decoder::read_key },
    TagRule { tag: b'l', versions: 2..=4, apply: Decoder::read_short_loop_start },
    TagRule { tag: b'l', versions: 5..=9, apply: Decoder::read_loop_start },
    TagRule { tag: b'e', versions: 2..=4, apply: Decoder::read_short_loop_length },
    TagRule { tag: b'e', versions: 5..=9, apply: Decoder::read_loop_length },
    TagRule { tag: b't', versions: 2..=3, apply: Decoder::read_preset_tempo },
    TagRule { tag: b't', versions: 4..=9, apply: Decoder::read_tempo },
    TagRule { tag: b'a', versions: 2..=2, apply: Decoder::read_preset_beats },
    TagRule { tag: b'a', versions: 3..=9, apply: Decoder::read_beats },
    TagRule { tag: b'g', versions: 2..=9, apply: Decoder::read_bar_count },
    TagRule { tag: b'j', versions: 2..=7, apply: Decoder::read_short_pattern_count },
    TagRule { tag: b'j', versions: 8..=9, apply: Decoder::read_pattern_count },
    TagRule { tag: b'i', versions: 2..=8, apply: Decoder::read_legacy_instrument_count },
    TagRule { tag: b'i', versions: 9..=9, apply: Decoder::read_instrument_count },
    TagRule { tag: b'r', versions: 2..=9, apply: Decoder::read_rhythm },
    TagRule { tag: b'o', versions: 2..=9, apply: Decoder::read_octaves },
    TagRule { tag: b'T', versions: 2..=9, apply: Decoder::read_start_instrument },
    TagRule { tag: b'v', versions: 2..=6, apply: Decoder::read_legacy_volume },
    TagRule { tag: b'v', versions: 7..=9, apply: Decoder::read_volume },
    TagRule { tag: b'Y', versions: 6..=9, apply: Decoder::read_pan },
    TagRule { tag: b'q', versions: 2..=7, apply: Decoder::read_legacy_effects },
    TagRule { tag: b'q', versions: 8..=9, apply: Decoder::read_effects },
    TagRule { tag: b'f', versions: 2..=6, apply: Decoder::read_legacy_filter },
    TagRule { tag: b'f', versions: 7..=9, apply: Decoder::read_eq_filter },
    TagRule { tag: b'F', versions: 7..=9, apply: Decoder::read_note_filter },
    TagRule { tag: b'E', versions: 8..=9, apply: Decoder::read_envelopes },
    TagRule { tag: b'O', versions: 2..=8, apply: Decoder::read_legacy_operator_envelopes },
    TagRule { tag: b'd', versions: 2..=9, apply: Decoder::read_transition },
    TagRule { tag: b'C', versions: 2..=9, apply: Decoder::read_chord },
    TagRule { tag: b'c', versions: 2..=6, apply: Decoder::read_legacy_vibrato },
    TagRule { tag: b'c', versions: 7..=9, apply: Decoder::read_vibrato },
    TagRule { tag: b'h', versions: 6..=9, apply: Decoder::read_unison },
    TagRule { tag: b'X', versions: 8..=9, apply: Decoder::read_pitch_shift },
    TagRule { tag: b'D', versions: 8..=9, apply: Decoder::read_detune },
    TagRule { tag: b'w', versions: 2..=6, apply: Decoder::read_legacy_wave },
    TagRule { tag: b'w', versions: 7..=9, apply: Decoder::read_wave },
    TagRule { tag: b'W', versions: 2..=8, apply: Decoder::read_legacy_pulse_width },
    TagRule { tag: b'W', versions: 9..=9, apply: Decoder::read_pulse_width },
    TagRule { tag: b'x', versions: 9..=9, apply: Decoder::read_supersaw },
    TagRule { tag: b'I', versions: 9..=9, apply: Decoder::read_string_sustain },
    TagRule { tag: b'A', versions: 2..=9, apply: Decoder::read_algorithm },
    TagRule { tag: b'B', versions: 2..=9, apply: Decoder::read_feedback_type },
    TagRule { tag: b'V', versions: 2..=9, apply: Decoder::read_feedback_amplitude },
    TagRule { tag: b'Q', versions: 2..=9, apply: Decoder::read_operator_frequencies },
    TagRule { tag: b'P', versions: 2..=9, apply: Decoder::read_operator_amplitudes },
    TagRule { tag: b'S', versions: 2..=9, apply: Decoder::read_spectrum },
    TagRule { tag: b'H', versions: 2..=9, apply: Decoder::read_harmonics },
    TagRule { tag: b'z', versions: 2..=9, apply: Decoder::read_drumset_envelopes },
    TagRule { tag: b'U', versions: 8..=9, apply: Decoder::read_distortion },
    TagRule { tag: b'u', versions: 8..=9, apply: Decoder::read_bitcrusher },
    TagRule { tag: b'y', versions: 8..=9, apply: Decoder::read_chorus },
    TagRule { tag: b'm', versions: 8..=9, apply: Decoder::read_echo },
    TagRule { tag: b'R', versions: 2..=8, apply: Decoder::read_global_reverb },
    TagRule { tag: b'R', versions: 9..=9, apply: Decoder::read_reverb },
    TagRule { tag: b'b', versions: 2..=4, apply: Decoder::read_dense_bars },
    TagRule { tag: b'b', versions: 5..=9, apply: Decoder::read_bars },
    TagRule { tag: b'p', versions: 2..=9, apply: Decoder::read_patterns },
];

struct Decoder {
    chars: Vec<u8>,
    index: usize,
    version: u32,
    current_tag: u8,
    song: Song,
    /// One past the instrument the last `T` tag selected, in channel-major
    /// order. Zero means no instrument has been selected yet.
    instrument_cursor: usize,
    /// A pre-9 song-wide reverb setting, migrated onto every instrument
    /// once all of them have been read.
    pending_global_reverb: Option<u32>,
}
impl Decoder {
    fn new(chars: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Self {
            chars: chars.to_vec(),
            index: 0,
            version: 0,
            current_tag: 0,
            song: Song::default(),
            instrument_cursor: 0,
            pending_global_reverb: None,
        };
        let version_char = decoder.chars[0];
        match base64_value(version_char) {
            Some(version)
                if (OLDEST_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&version) =>
            {
                if version < CURRENT_VERSION {
                    debug!("decoding legacy format version {version}");
                }
                decoder.version = version;
                decoder.index = 1;
                Ok(decoder)
            }
            _ => Err(DecodeError::UnsupportedVersion {
                version: version_char as char,
            }),
        }
    }

    fn run(mut self) -> Result<Song, DecodeError> {
        while self.index < self.chars.len() {
            let tag = self.chars[self.index];
            let tag_index = self.index;
            self.index += 1;
            self.current_tag = tag;
            let rule = TAG_RULES
                .iter()
                .find(|rule| rule.tag == tag && rule.versions.contains(&self.version))
                .ok_or(DecodeError::UnknownTag {
                    tag: tag as char,
                    index: tag_index,
                })?;
            (rule.apply)(&mut self)?;
        }
        if let Some(reverb) = self.pending_global_reverb {
            debug!("migrating song-wide reverb {reverb} onto every instrument");
            for channel in self.song.channels.iter_mut() {
                for instrument in channel.instruments.iter_mut() {
                    use crate::song::EffectKind;
                    instrument.set_effect_enabled(EffectKind::Reverb, reverb > 0);
                    instrument.reverb = (reverb as usize).min(config::REVERB_RANGE - 1);
                }
            }
        }
        self.song.conform();
        Ok(self.song)
    }

    fn next_value(&mut self) -> Result<u32, DecodeError> {
        let char = *self
            .chars
            .get(self.index)
            .ok_or(DecodeError::UnexpectedEnd {
                tag: self.current_tag as char,
            })?;
        let value = base64_value(char).ok_or(DecodeError::InvalidCharacter {
            index: self.index,
        })?;
        self.index += 1;
        Ok(value)
    }

    /// Takes `count` characters as a packed bit stream.
    fn next_bit_reader(&mut self, count: usize) -> Result<BitReader, DecodeError> {
        let stop = self.index + count;
        if stop > self.chars.len() {
            return Err(DecodeError::UnexpectedEnd {
                tag: self.current_tag as char,
            });
        }
        let reader = BitReader::new(&self.chars, self.index, stop);
        self.index = stop;
        Ok(reader)
    }

    fn instrument(&mut self) -> &mut Instrument {
        let flat = self.instrument_cursor.saturating_sub(1);
        let per_channel = self.song.instruments_per_channel;
        let channel_index = (flat / per_channel).min(self.song.channels.len() - 1);
        let channel = &mut self.song.channels[channel_index];
        let instrument_index = (flat % per_channel).min(channel.instruments.len() - 1);
        &mut channel.instruments[instrument_index]
    }

    fn is_noise_cursor(&self) -> bool {
        let flat = self.instrument_cursor.saturating_sub(1);
        self.song
            .is_noise_channel(flat / self.song.instruments_per_channel)
    }

    fn read_title(&mut self) -> Result<(), DecodeError> {
        let length = ((self.next_value()? << 6) | self.next_value()?) as usize;
        let mut bytes = Vec::with_capacity(length);
        for _ in 0..length {
            bytes.push(((self.next_value()? << 6) | self.next_value()?) as u8);
        }
        self.song.title = String::from_utf8_lossy(&bytes).into_owned();
        Ok(())
    }

    fn read_channel_counts(&mut self) -> Result<(), DecodeError> {
        self.song.pitch_channel_count = self.next_value()? as usize;
        self.song.noise_channel_count = self.next_value()? as usize;
        self.song.conform();
        Ok(())
    }

    fn read_scale(&mut self) -> Result<(), DecodeError> {
        self.song.scale = (self.next_value()? as usize).min(config::SCALES.len() - 1);
        Ok(())
    }

    // Old songs stored the key upside down relative to the current table.
    fn read_legacy_key(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::KEYS.len() - 1);
        self.song.key = config::KEYS.len() - 1 - value;
        Ok(())
    }

    fn read_key(&mut self) -> Result<(), DecodeError> {
        self.song.key = (self.next_value()? as usize).min(config::KEYS.len() - 1);
        Ok(())
    }

    fn read_short_loop_start(&mut self) -> Result<(), DecodeError> {
        self.song.loop_start = self.next_value()? as usize;
        Ok(())
    }

    fn read_loop_start(&mut self) -> Result<(), DecodeError> {
        self.song.loop_start = ((self.next_value()? << 6) | self.next_value()?) as usize;
        Ok(())
    }

    // The shorter form also stored the raw length rather than length - 1.
    fn read_short_loop_length(&mut self) -> Result<(), DecodeError> {
        self.song.loop_length = (self.next_value()? as usize).max(1);
        Ok(())
    }

    fn read_loop_length(&mut self) -> Result<(), DecodeError> {
        self.song.loop_length = ((self.next_value()? << 6) | self.next_value()?) as usize + 1;
        Ok(())
    }

    fn read_preset_tempo(&mut self) -> Result<(), DecodeError> {
        let index = (self.next_value()? as usize).min(LEGACY_TEMPO_PRESETS.len() - 1);
        self.song.tempo = Tempo::new(LEGACY_TEMPO_PRESETS[index]);
        Ok(())
    }

    fn read_tempo(&mut self) -> Result<(), DecodeError> {
        let bpm = (self.next_value()? << 6) | self.next_value()?;
        self.song.tempo = Tempo::new(bpm as f64);
        Ok(())
    }

    fn read_preset_beats(&mut self) -> Result<(), DecodeError> {
        let index = (self.next_value()? as usize).min(LEGACY_BEAT_COUNTS.len() - 1);
        self.song.beats_per_bar = LEGACY_BEAT_COUNTS[index];
        Ok(())
    }

    fn read_beats(&mut self) -> Result<(), DecodeError> {
        self.song.beats_per_bar = self.next_value()? as usize + 1;
        self.song.conform();
        Ok(())
    }

    fn read_bar_count(&mut self) -> Result<(), DecodeError> {
        self.song.bar_count = ((self.next_value()? << 6) | self.next_value()?) as usize + 1;
        self.song.conform();
        Ok(())
    }

    fn read_short_pattern_count(&mut self) -> Result<(), DecodeError> {
        self.song.patterns_per_channel = self.next_value()? as usize + 1;
        self.song.conform();
        Ok(())
    }

    fn read_pattern_count(&mut self) -> Result<(), DecodeError> {
        self.song.patterns_per_channel =
            ((self.next_value()? << 6) | self.next_value()?) as usize + 1;
        self.song.conform();
        Ok(())
    }

    fn read_legacy_instrument_count(&mut self) -> Result<(), DecodeError> {
        self.song.instruments_per_channel =
            self.next_value()? as usize + config::INSTRUMENTS_PER_CHANNEL_MIN;
        self.song.conform();
        Ok(())
    }

    fn read_instrument_count(&mut self) -> Result<(), DecodeError> {
        self.song.instruments_per_channel =
            self.next_value()? as usize + config::INSTRUMENTS_PER_CHANNEL_MIN;
        self.song.layered_instruments = self.next_value()? & 1 != 0;
        self.song.conform();
        Ok(())
    }

    fn read_rhythm(&mut self) -> Result<(), DecodeError> {
        self.song.rhythm = (self.next_value()? as usize).min(config::RHYTHMS.len() - 1);
        Ok(())
    }

    fn read_octaves(&mut self) -> Result<(), DecodeError> {
        for channel_index in 0..self.song.channel_count() {
            let octave = (self.next_value()? as usize).min(config::PITCH_OCTAVES - 1);
            self.song.channels[channel_index].octave = octave;
        }
        Ok(())
    }

    fn read_start_instrument(&mut self) -> Result<(), DecodeError> {
        let total = self.song.channel_count() * self.song.instruments_per_channel;
        self.instrument_cursor = (self.instrument_cursor + 1).min(total);
        let kind = InstrumentKind::from_repr(self.next_value()? as usize)
            .unwrap_or_default();
        let is_noise = self.is_noise_cursor();
        let instrument = self.instrument();
        instrument.kind = if is_noise {
            if kind.fits_noise_channel() {
                kind
            } else {
                InstrumentKind::Noise
            }
        } else if kind.fits_pitch_channel() {
            kind
        } else {
            InstrumentKind::Chip
        };
        instrument.reset_for_kind(is_noise);
        Ok(())
    }

    fn read_legacy_volume(&mut self) -> Result<(), DecodeError> {
        let value = self.next_value()?;
        self.instrument().volume = if value >= LEGACY_VOLUME_MUTE {
            config::VOLUME_RANGE - 1
        } else {
            value as usize
        };
        Ok(())
    }

    fn read_volume(&mut self) -> Result<(), DecodeError> {
        let value = self.next_value()? as usize;
        self.instrument().volume = value.min(config::VOLUME_RANGE - 1);
        Ok(())
    }

    fn read_pan(&mut self) -> Result<(), DecodeError> {
        let value = self.next_value()? as usize;
        self.instrument().pan = value.min(config::PAN_MAX);
        Ok(())
    }

    // The old effects field was a four-way enum rather than a bitmask.
    fn read_legacy_effects(&mut self) -> Result<(), DecodeError> {
        use crate::song::EffectKind;
        let value = self.next_value()?;
        debug!("migrating legacy effects enum {value} to a bitmask");
        self.instrument().effects = match value {
            1 => EffectKind::Reverb.bit(),
            2 => EffectKind::Chorus.bit(),
            3 => EffectKind::Chorus.bit() | EffectKind::Reverb.bit(),
            _ => 0,
        };
        Ok(())
    }

    fn read_effects(&mut self) -> Result<(), DecodeError> {
        let mask = (self.next_value()? << 6) | self.next_value()?;
        self.instrument().effects = (mask & 0x7f) as u8;
        Ok(())
    }

    fn read_filter_points(&mut self) -> Result<FilterSettings, DecodeError> {
        let count = (self.next_value()? as usize).min(config::FILTER_MAX_POINTS);
        let mut filter = FilterSettings::default();
        for _ in 0..count {
            let kind = FilterType::from_repr(self.next_value()? as usize).unwrap_or_default();
            let freq = self.next_value()? as usize;
            let gain = self.next_value()? as usize;
            filter.push(FilterControlPoint::new(kind, freq, gain));
        }
        Ok(filter)
    }

    // Old filter presets become a single low-pass point plus the envelope
    // the preset implied.
    fn read_legacy_filter(&mut self) -> Result<(), DecodeError> {
        let preset = (self.next_value()? as usize).min(LEGACY_FILTER_FREQS.len() - 1);
        debug!("migrating legacy filter preset {preset} to a control point");
        let instrument = self.instrument();
        instrument.note_filter =
            FilterSettings::single_low_pass(LEGACY_FILTER_FREQS[preset], config::FILTER_GAIN_CENTER);
        let envelope = LEGACY_FILTER_ENVELOPES[preset];
        if envelope != 1 {
            instrument.assign_envelope(AutomationTarget::NoteFilterFreq, 0, envelope);
        }
        Ok(())
    }

    fn read_eq_filter(&mut self) -> Result<(), DecodeError> {
        let filter = self.read_filter_points()?;
        self.instrument().eq_filter = filter;
        Ok(())
    }

    fn read_note_filter(&mut self) -> Result<(), DecodeError> {
        let filter = self.read_filter_points()?;
        self.instrument().note_filter = filter;
        Ok(())
    }

    fn read_envelopes(&mut self) -> Result<(), DecodeError> {
        let count = (self.next_value()? as usize).min(config::MAX_ENVELOPE_COUNT);
        let mut envelopes = Vec::with_capacity(count);
        for _ in 0..count {
            let target = AutomationTarget::from_repr(self.next_value()? as usize)
                .unwrap_or_default();
            let index = (self.next_value()? as usize).min(target.max_index() - 1);
            let envelope = (self.next_value()? as usize).min(config::ENVELOPES.len() - 1);
            envelopes.push(EnvelopeAssignment {
                target,
                index,
                envelope,
            });
        }
        self.instrument().envelopes = envelopes;
        Ok(())
    }

    // Old songs stored one envelope per FM operator inline.
    fn read_legacy_operator_envelopes(&mut self) -> Result<(), DecodeError> {
        for operator_index in 0..config::OPERATOR_COUNT {
            let envelope = (self.next_value()? as usize).min(config::ENVELOPES.len() - 1);
            if envelope != 1 {
                self.instrument().assign_envelope(
                    AutomationTarget::OperatorAmplitude,
                    operator_index,
                    envelope,
                );
            }
        }
        Ok(())
    }

    fn read_transition(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::TRANSITIONS.len() - 1);
        self.instrument().transition = value;
        Ok(())
    }

    fn read_chord(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::CHORDS.len() - 1);
        self.instrument().chord = value;
        Ok(())
    }

    // Old songs folded vibrato and tremolo into one setting; the tremolo
    // half becomes a volume envelope.
    fn read_legacy_vibrato(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(LEGACY_VIBRATO_EFFECTS.len() - 1);
        let instrument = self.instrument();
        instrument.vibrato = LEGACY_VIBRATO_EFFECTS[value];
        let envelope = LEGACY_VIBRATO_ENVELOPES[value];
        if envelope != 1 {
            instrument.assign_envelope(AutomationTarget::NoteVolume, 0, envelope);
        }
        Ok(())
    }

    fn read_vibrato(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::VIBRATOS.len() - 1);
        self.instrument().vibrato = value;
        Ok(())
    }

    fn read_unison(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::UNISONS.len() - 1);
        self.instrument().unison = value;
        Ok(())
    }

    fn read_pitch_shift(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::PITCH_SHIFT_RANGE - 1);
        self.instrument().pitch_shift = value;
        Ok(())
    }

    fn read_detune(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::DETUNE_RANGE - 1);
        self.instrument().detune = value;
        Ok(())
    }

    fn read_legacy_wave(&mut self) -> Result<(), DecodeError> {
        let value = self.next_value()? as usize;
        let is_noise = self.is_noise_cursor();
        let instrument = self.instrument();
        if is_noise {
            instrument.chip_noise = value.min(config::CHIP_NOISES.len() - 1);
        } else {
            instrument.chip_wave = LEGACY_WAVE_ORDER[value.min(LEGACY_WAVE_ORDER.len() - 1)];
        }
        Ok(())
    }

    fn read_wave(&mut self) -> Result<(), DecodeError> {
        let value = self.next_value()? as usize;
        let is_noise = self.is_noise_cursor();
        let instrument = self.instrument();
        if is_noise {
            instrument.chip_noise = value.min(config::CHIP_NOISES.len() - 1);
        } else {
            instrument.chip_wave = value.min(config::CHIP_WAVES.len() - 1);
        }
        Ok(())
    }

    // The old pulse tag carried its own envelope character.
    fn read_legacy_pulse_width(&mut self) -> Result<(), DecodeError> {
        let width = (self.next_value()? as usize).min(config::PULSE_WIDTH_RANGE - 1);
        let envelope = (self.next_value()? as usize).min(config::ENVELOPES.len() - 1);
        let instrument = self.instrument();
        instrument.pulse_width = width;
        if envelope != 1 {
            instrument.assign_envelope(AutomationTarget::PulseWidth, 0, envelope);
        }
        Ok(())
    }

    fn read_pulse_width(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::PULSE_WIDTH_RANGE - 1);
        self.instrument().pulse_width = value;
        Ok(())
    }

    fn read_supersaw(&mut self) -> Result<(), DecodeError> {
        let dynamism = (self.next_value()? as usize).min(config::SUPERSAW_DYNAMISM_RANGE - 1);
        let spread = (self.next_value()? as usize).min(config::SUPERSAW_SPREAD_RANGE - 1);
        let shape = (self.next_value()? as usize).min(config::SUPERSAW_SHAPE_RANGE - 1);
        let instrument = self.instrument();
        instrument.supersaw_dynamism = dynamism;
        instrument.supersaw_spread = spread;
        instrument.supersaw_shape = shape;
        Ok(())
    }

    fn read_string_sustain(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::SUSTAIN_RANGE - 1);
        self.instrument().string_sustain = value;
        Ok(())
    }

    fn read_algorithm(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::ALGORITHMS.len() - 1);
        self.instrument().algorithm = value;
        Ok(())
    }

    fn read_feedback_type(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::FEEDBACKS.len() - 1);
        self.instrument().feedback_type = value;
        Ok(())
    }

    fn read_feedback_amplitude(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::OPERATOR_AMPLITUDE_MAX);
        self.instrument().feedback_amplitude = value;
        Ok(())
    }

    fn read_operator_frequencies(&mut self) -> Result<(), DecodeError> {
        for operator_index in 0..config::OPERATOR_COUNT {
            let value =
                (self.next_value()? as usize).min(config::OPERATOR_FREQUENCIES.len() - 1);
            self.instrument().operators[operator_index].frequency = value;
        }
        Ok(())
    }

    fn read_operator_amplitudes(&mut self) -> Result<(), DecodeError> {
        for operator_index in 0..config::OPERATOR_COUNT {
            let value = (self.next_value()? as usize).min(config::OPERATOR_AMPLITUDE_MAX);
            self.instrument().operators[operator_index].amplitude = value;
        }
        Ok(())
    }

    fn read_spectrum_points(reader: &mut BitReader) -> SpectrumWave {
        SpectrumWave {
            spectrum: (0..config::SPECTRUM_CONTROL_POINTS)
                .map(|_| reader.read(config::SPECTRUM_CONTROL_POINT_BITS) as usize)
                .collect(),
        }
    }

    fn read_spectrum(&mut self) -> Result<(), DecodeError> {
        let point_bits = config::SPECTRUM_CONTROL_POINT_BITS as usize;
        if self.instrument().kind == InstrumentKind::Drumset {
            let total_bits = config::DRUM_COUNT * config::SPECTRUM_CONTROL_POINTS * point_bits;
            let mut reader = self.next_bit_reader(total_bits.div_ceil(6))?;
            let waves = (0..config::DRUM_COUNT)
                .map(|_| Self::read_spectrum_points(&mut reader))
                .collect();
            self.instrument().drumset_spectrum_waves = waves;
        } else {
            let total_bits = config::SPECTRUM_CONTROL_POINTS * point_bits;
            let mut reader = self.next_bit_reader(total_bits.div_ceil(6))?;
            let wave = Self::read_spectrum_points(&mut reader);
            self.instrument().spectrum_wave = wave;
        }
        Ok(())
    }

    fn read_harmonics(&mut self) -> Result<(), DecodeError> {
        let total_bits =
            config::HARMONICS_CONTROL_POINTS * config::HARMONICS_CONTROL_POINT_BITS as usize;
        let mut reader = self.next_bit_reader(total_bits.div_ceil(6))?;
        let harmonics = (0..config::HARMONICS_CONTROL_POINTS)
            .map(|_| reader.read(config::HARMONICS_CONTROL_POINT_BITS) as usize)
            .collect();
        self.instrument().harmonics_wave.harmonics = harmonics;
        Ok(())
    }

    fn read_drumset_envelopes(&mut self) -> Result<(), DecodeError> {
        for drum_index in 0..config::DRUM_COUNT {
            let value = (self.next_value()? as usize).min(config::ENVELOPES.len() - 1);
            self.instrument().drumset_envelopes[drum_index] = value;
        }
        Ok(())
    }

    fn read_distortion(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::DISTORTION_RANGE - 1);
        self.instrument().distortion = value;
        Ok(())
    }

    fn read_bitcrusher(&mut self) -> Result<(), DecodeError> {
        let freq = (self.next_value()? as usize).min(config::BITCRUSHER_FREQ_RANGE - 1);
        let quantization =
            (self.next_value()? as usize).min(config::BITCRUSHER_QUANTIZATION_RANGE - 1);
        let instrument = self.instrument();
        instrument.bitcrusher_freq = freq;
        instrument.bitcrusher_quantization = quantization;
        Ok(())
    }

    fn read_chorus(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::CHORUS_RANGE - 1);
        self.instrument().chorus = value;
        Ok(())
    }

    fn read_echo(&mut self) -> Result<(), DecodeError> {
        let sustain = (self.next_value()? as usize).min(config::ECHO_SUSTAIN_RANGE - 1);
        let delay = (self.next_value()? as usize).min(config::ECHO_DELAY_RANGE - 1);
        let instrument = self.instrument();
        instrument.echo_sustain = sustain;
        instrument.echo_delay = delay;
        Ok(())
    }

    // Pre-9 reverb was a single song-wide knob. It becomes a per-instrument
    // send at the end of decoding, once every instrument exists; zero turns
    // the stage off entirely.
    fn read_global_reverb(&mut self) -> Result<(), DecodeError> {
        self.pending_global_reverb = Some(self.next_value()?);
        Ok(())
    }

    fn read_reverb(&mut self) -> Result<(), DecodeError> {
        let value = (self.next_value()? as usize).min(config::REVERB_RANGE - 1);
        self.instrument().reverb = value;
        Ok(())
    }

    // The pre-5 bar map had no way to express an empty bar.
    fn read_dense_bars(&mut self) -> Result<(), DecodeError> {
        let needed_bits = bits_needed(self.song.patterns_per_channel);
        let total_bits = self.song.channel_count() * self.song.bar_count * needed_bits as usize;
        let mut reader = self.next_bit_reader(total_bits.div_ceil(6))?;
        for channel_index in 0..self.song.channel_count() {
            for bar_index in 0..self.song.bar_count {
                self.song.channels[channel_index].bars[bar_index] =
                    reader.read(needed_bits) as usize + 1;
            }
        }
        Ok(())
    }

    fn read_bars(&mut self) -> Result<(), DecodeError> {
        let needed_bits = bits_needed(self.song.patterns_per_channel + 1);
        let total_bits = self.song.channel_count() * self.song.bar_count * needed_bits as usize;
        let mut reader = self.next_bit_reader(total_bits.div_ceil(6))?;
        for channel_index in 0..self.song.channel_count() {
            for bar_index in 0..self.song.bar_count {
                self.song.channels[channel_index].bars[bar_index] =
                    reader.read(needed_bits) as usize;
            }
        }
        Ok(())
    }

    fn read_patterns(&mut self) -> Result<(), DecodeError> {
        // Length prefix, then the payload bits.
        let digit_count = self.next_value()? as usize;
        let mut char_count = 0usize;
        for _ in 0..digit_count {
            char_count = (char_count << 6) | self.next_value()? as usize;
        }
        let mut reader = self.next_bit_reader(char_count)?;

        let legacy_durations = self.version < 7;
        let needed_instrument_bits = bits_needed(self.song.instruments_per_channel);
        let parts_per_bar = self.song.parts_per_bar();
        let instruments_per_channel = self.song.instruments_per_channel;
        let layered = self.song.layered_instruments;

        for channel_index in 0..self.song.channel_count() {
            let is_noise = self.song.is_noise_channel(channel_index);
            let channel = &mut self.song.channels[channel_index];
            let max_pitch = if is_noise {
                config::DRUM_COUNT - 1
            } else {
                config::MAX_PITCH
            };
            let octave_offset = if is_noise {
                0
            } else {
                channel.octave as i32 * 12
            };
            let mut last_pitch = if is_noise { 4 } else { 12 } + octave_offset;
            let mut recent_pitches: Vec<i32> = if is_noise {
                vec![4, 6, 7, 2, 3, 8, 0, 10]
            } else {
                vec![12, 19, 24, 31, 36, 7, 0]
            };
            for pitch in recent_pitches.iter_mut() {
                *pitch += octave_offset;
            }
            let mut recent_shapes: Vec<NoteShape> = Vec::new();

            for pattern in channel.patterns.iter_mut() {
                let instrument =
                    (reader.read(needed_instrument_bits) as usize).min(instruments_per_channel - 1);
                pattern.instruments = if layered {
                    (0..instruments_per_channel).collect()
                } else {
                    vec![instrument]
                };
                pattern.notes.clear();
                if reader.read(1) == 0 {
                    continue;
                }

                let mut cur_part = 0usize;
                while cur_part < parts_per_bar {
                    let use_old_shape = reader.read(1) == 1;
                    let is_note = use_old_shape || reader.read(1) == 1;
                    if !is_note {
                        // A rest.
                        let duration = if legacy_durations {
                            reader.read_legacy_part_duration()
                        } else {
                            reader.read_part_duration()
                        } as usize;
                        cur_part += duration;
                        continue;
                    }

                    let shape = if use_old_shape {
                        let shape_index = reader.read_long_tail(0, 0) as usize;
                        if shape_index >= recent_shapes.len() {
                            return Err(DecodeError::MalformedNotes {
                                reason: "reference to a note shape that was never written",
                            });
                        }
                        recent_shapes.remove(shape_index)
                    } else {
                        let mut pitch_count = 1;
                        while pitch_count < config::MAX_CHORD_SIZE && reader.read(1) == 1 {
                            pitch_count += 1;
                        }
                        let pin_count = reader.read_pin_count() as usize;
                        let initial_size = reader.read(2);
                        let pins = (0..pin_count)
                            .map(|_| {
                                let pitch_bend = reader.read(1) == 1;
                                let duration = if legacy_durations {
                                    reader.read_legacy_part_duration()
                                } else {
                                    reader.read_part_duration()
                                };
                                let size = reader.read(2);
                                ShapePin {
                                    pitch_bend,
                                    duration,
                                    size,
                                }
                            })
                            .collect();
                        NoteShape {
                            pitch_count,
                            initial_size,
                            pins,
                        }
                    };
                    recent_shapes.insert(0, shape.clone());
                    recent_shapes.truncate(RECENT_SHAPE_COUNT);

                    let mut pitches: Vec<i32> = Vec::with_capacity(shape.pitch_count);
                    let mut pitch_bends: Vec<i32> = Vec::with_capacity(shape.bend_count());
                    for i in 0..shape.pitch_count + shape.bend_count() {
                        let pitch = if reader.read(1) == 1 {
                            let recent_index = reader.read(3) as usize;
                            if recent_index >= recent_pitches.len() {
                                return Err(DecodeError::MalformedNotes {
                                    reason: "reference to a pitch that was never written",
                                });
                            }
                            recent_pitches.remove(recent_index)
                        } else {
                            let mut interval = reader.read_pitch_interval();
                            let mut pitch = last_pitch;
                            while interval > 0 {
                                pitch += 1;
                                while recent_pitches.contains(&pitch) {
                                    pitch += 1;
                                }
                                interval -= 1;
                            }
                            while interval < 0 {
                                pitch -= 1;
                                while recent_pitches.contains(&pitch) {
                                    pitch -= 1;
                                }
                                interval += 1;
                            }
                            pitch
                        };
                        let pitch = pitch.clamp(0, max_pitch as i32);
                        recent_pitches.insert(0, pitch);
                        recent_pitches.truncate(RECENT_PITCH_COUNT);
                        if i < shape.pitch_count {
                            pitches.push(pitch);
                        } else {
                            pitch_bends.push(pitch);
                        }
                        last_pitch = if i == shape.pitch_count - 1 {
                            pitches[0]
                        } else {
                            pitch
                        };
                    }

                    let base_pitch = pitches[0];
                    let mut pins = vec![NotePin::new(0, 0, shape.initial_size as usize)];
                    pitch_bends.insert(0, base_pitch);
                    let mut pin_part = 0usize;
                    for shape_pin in &shape.pins {
                        if shape_pin.pitch_bend {
                            pitch_bends.remove(0);
                        }
                        pin_part += shape_pin.duration as usize;
                        pins.push(NotePin::new(
                            pitch_bends[0] - base_pitch,
                            pin_part,
                            shape_pin.size as usize,
                        ));
                    }
                    pattern.notes.push(Note {
                        pitches: pitches.iter().map(|&pitch| pitch as usize).collect(),
                        start: cur_part,
                        end: cur_part + shape.total_duration(),
                        pins,
                    });
                    cur_part += shape.total_duration();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{EffectKind, SongBuilder};

    fn sample_song() -> Song {
        let mut song = SongBuilder::default()
            .title("autumn drift".into())
            .scale(2)
            .key(5)
            .tempo(Tempo::new(132.0))
            .beats_per_bar(7)
            .bar_count(4)
            .patterns_per_channel(3)
            .instruments_per_channel(2)
            .loop_start(1)
            .loop_length(2)
            .build()
            .unwrap();

        song.channels[0].instruments[0].kind = InstrumentKind::Fm;
        song.channels[0].instruments[0].reset_for_kind(false);
        song.channels[0].instruments[0].feedback_amplitude = 9;
        song.channels[0].instruments[1].kind = InstrumentKind::Supersaw;
        song.channels[0].instruments[1].reset_for_kind(false);
        song.channels[1].instruments[0].kind = InstrumentKind::PickedString;
        song.channels[1].instruments[0].reset_for_kind(false);
        song.channels[3].instruments[1].kind = InstrumentKind::Drumset;
        song.channels[3].instruments[1].reset_for_kind(true);

        let instrument = &mut song.channels[2].instruments[0];
        instrument.set_effect_enabled(EffectKind::Echo, true);
        instrument.echo_sustain = 5;
        instrument.echo_delay = 7;
        instrument.set_effect_enabled(EffectKind::Distortion, true);
        instrument.distortion = 6;
        instrument.note_filter = FilterSettings::single_low_pass(20, 7);
        instrument.assign_envelope(AutomationTarget::NoteFilterFreq, 0, 4);

        // A melody with a rest, a chord, and a pitch bend.
        let mut bend = Note::new(vec![48], 72, 96);
        bend.pins = vec![
            NotePin::new(0, 0, 3),
            NotePin::new(2, 12, 3),
            NotePin::new(2, 24, 1),
        ];
        song.channels[0].patterns[0].notes = vec![
            Note::new(vec![48], 0, 24),
            Note::new(vec![52], 36, 48),
            Note::new(vec![48, 52, 55], 48, 72),
            bend,
        ];
        song.channels[0].bars = vec![1, 1, 0, 2];
        song.channels[3].patterns[1].notes = vec![Note::new(vec![2], 0, 12)];
        song.channels[3].bars = vec![2, 2, 2, 2];
        song
    }

    #[test]
    fn default_song_round_trips() {
        let song = Song::default();
        let encoded = encode_song(&song);
        let decoded = decode_song(&encoded).unwrap();
        assert_eq!(song, decoded);
    }

    #[test]
    fn sample_song_round_trips() {
        let song = sample_song();
        let encoded = encode_song(&song);
        let decoded = decode_song(&encoded).unwrap();
        assert_eq!(song, decoded);
    }

    #[test]
    fn encoding_is_idempotent() {
        let first = encode_song(&sample_song());
        let second = encode_song(&decode_song(&first).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn url_fragment_prefix_is_accepted() {
        let song = sample_song();
        let encoded = format!("#{}", encode_song(&song));
        assert_eq!(decode_song(&encoded).unwrap(), song);
    }

    #[test]
    fn empty_string_is_the_default_song() {
        assert_eq!(decode_song("").unwrap(), Song::default());
        assert_eq!(decode_song("  #  ").unwrap(), Song::default());
    }

    #[test]
    fn unknown_tag_is_rejected_with_its_position() {
        let mut encoded = encode_song(&Song::default());
        // '.' is not a tag in any revision.
        encoded.insert(1, '.');
        match decode_song(&encoded) {
            Err(DecodeError::UnknownTag { tag, index }) => {
                assert_eq!(tag, '.');
                assert_eq!(index, 1);
            }
            other => panic!("expected an unknown-tag error, got {other:?}"),
        }
    }

    #[test]
    fn bad_version_is_rejected() {
        assert!(matches!(
            decode_song("Zn31"),
            Err(DecodeError::UnsupportedVersion { .. })
        ));
        assert!(matches!(
            decode_song("1n31"),
            Err(DecodeError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn truncated_field_is_rejected() {
        assert!(matches!(
            decode_song("9n3"),
            Err(DecodeError::UnexpectedEnd { tag: 'n' })
        ));
    }

    #[test]
    fn out_of_range_settings_are_clamped() {
        // Scale index 63 is far beyond the table.
        let song = decode_song("9s_").unwrap();
        assert_eq!(song.scale, config::SCALES.len() - 1);
    }

    #[test]
    fn legacy_global_reverb_becomes_per_instrument() {
        // Version 2: a reversed key, a preset tempo, and a song-wide reverb.
        let song = decode_song("2k2t8R2").unwrap();
        assert_eq!(song.key, config::KEYS.len() - 1 - 2);
        assert_eq!(song.tempo.0, LEGACY_TEMPO_PRESETS[8]);
        for channel in &song.channels {
            for instrument in &channel.instruments {
                assert!(instrument.effect_enabled(EffectKind::Reverb));
                assert_eq!(instrument.reverb, 2);
            }
        }
        // Reverb zero disables the stage outright.
        let dry = decode_song("2R0").unwrap();
        for channel in &dry.channels {
            for instrument in &channel.instruments {
                assert!(!instrument.effect_enabled(EffectKind::Reverb));
            }
        }
    }

    #[test]
    fn legacy_filter_preset_becomes_point_and_envelope() {
        // Version 2, instrument cursor on the first instrument, preset 4.
        let song = decode_song("2T0f4").unwrap();
        let instrument = &song.channels[0].instruments[0];
        assert_eq!(instrument.note_filter.points.len(), 1);
        assert_eq!(instrument.note_filter.points[0].freq, LEGACY_FILTER_FREQS[4]);
        assert_eq!(
            instrument.envelope_for(AutomationTarget::NoteFilterFreq, 0),
            Some(LEGACY_FILTER_ENVELOPES[4])
        );
    }

    #[test]
    fn legacy_volume_five_means_mute() {
        let song = decode_song("2T0v5").unwrap();
        assert_eq!(
            song.channels[0].instruments[0].volume,
            config::VOLUME_RANGE - 1
        );
    }

    #[test]
    fn notes_survive_many_pitches_and_shapes() {
        // Stress the recent-pitch and recent-shape dictionaries with a
        // pattern that reuses and abandons shapes across bars.
        let mut song = Song::default();
        for (pattern_index, pattern) in song.channels[0].patterns.iter_mut().enumerate() {
            let mut part = 0;
            let mut notes = Vec::new();
            for step in 0..8 {
                let pitch = 24 + ((pattern_index * 5 + step * 7) % 36);
                notes.push(Note::new(vec![pitch], part, part + 12 + (step % 3) * 6));
                part += 24;
            }
            pattern.notes = notes;
        }
        song.channels[0].bars = (0..16).map(|bar| (bar % 8) + 1).collect();
        let decoded = decode_song(&encode_song(&song)).unwrap();
        assert_eq!(song, decoded);
    }

    #[test]
    fn json_form_is_dispatched() {
        let song = sample_song();
        let json = song_to_json(&song).unwrap();
        assert_eq!(decode_song(&json).unwrap(), song);
    }
}
