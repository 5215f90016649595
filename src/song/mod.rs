// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The composition model: everything a song string or JSON export
//! persists.
//!
//! A [Song] is an ordered list of [Channel]s (pitched channels first, then
//! noise channels), each with its own [Instrument]s and [Pattern]s and a
//! per-bar map of which pattern plays. Times are measured in parts; see
//! [crate::config::PARTS_PER_BEAT]. The model is inert data: the codec
//! reads and writes it, the synthesis engine only reads it.

mod instrument;

pub use instrument::{
    AutomationTarget, EffectKind, EnvelopeAssignment, FilterControlPoint, FilterSettings,
    FilterType, HarmonicsWave, Instrument, InstrumentKind, Operator, SpectrumWave,
    EFFECT_PIPELINE_ORDER,
};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{config, types::Tempo};

/// One breakpoint in a note's pitch-bend and size shape. Times are
/// relative to the note's start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotePin {
    /// Pitch offset from the note's base pitches, in semitones.
    pub interval: i32,
    /// Time offset from the note's start, in parts.
    pub time: usize,
    /// Note size, up to [config::NOTE_SIZE_MAX].
    pub size: usize,
}
impl NotePin {
    /// Creates a pin, clamping size into range.
    pub fn new(interval: i32, time: usize, size: usize) -> Self {
        Self {
            interval,
            time,
            size: size.min(config::NOTE_SIZE_MAX),
        }
    }
}

/// One note: one or more simultaneous pitches over a time range, shaped by
/// an ordered list of pins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Note {
    /// The sounding pitches, up to [config::MAX_CHORD_SIZE].
    pub pitches: Vec<usize>,
    /// Start time, in parts from the start of the pattern.
    pub start: usize,
    /// End time, in parts from the start of the pattern.
    pub end: usize,
    /// Shape breakpoints. The first pin is at time 0, the last at the
    /// note's duration, and times strictly increase.
    pub pins: Vec<NotePin>,
}
impl Note {
    /// Creates a note spanning `start..end` with a flat full-size shape.
    pub fn new(pitches: Vec<usize>, start: usize, end: usize) -> Self {
        Self {
            pitches,
            start,
            end,
            pins: vec![
                NotePin::new(0, 0, config::NOTE_SIZE_MAX),
                NotePin::new(0, end - start, config::NOTE_SIZE_MAX),
            ],
        }
    }

    /// The note's duration, in parts.
    pub fn duration(&self) -> usize {
        self.end - self.start
    }

    /// Whether the pin list covers the note and strictly increases in
    /// time.
    pub fn pins_are_valid(&self) -> bool {
        if self.pins.len() < 2 {
            return false;
        }
        if self.pins[0].time != 0 || self.pins[self.pins.len() - 1].time != self.duration() {
            return false;
        }
        self.pins.windows(2).all(|pair| pair[0].time < pair[1].time)
    }
}

/// A reusable bar's worth of notes for one channel.
#[derive(Clone, Debug, Default, Builder, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[builder(build_fn(private, name = "build_from_builder"))]
pub struct Pattern {
    /// The notes, ordered by start time and non-overlapping.
    #[builder(default, setter(each(name = "note", into)))]
    pub notes: Vec<Note>,
    /// Which of the channel's instruments play this pattern.
    #[builder(default = "vec![0]")]
    pub instruments: Vec<usize>,
}
impl PatternBuilder {
    /// Builds the [Pattern], rejecting out-of-order or overlapping notes.
    pub fn build(&self) -> Result<Pattern, PatternBuilderError> {
        let pattern = self.build_from_builder()?;
        for pair in pattern.notes.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(PatternBuilderError::ValidationError(format!(
                    "note at part {} overlaps note at part {}",
                    pair[0].start, pair[1].start
                )));
            }
        }
        for note in &pattern.notes {
            if note.end <= note.start || !note.pins_are_valid() {
                return Err(PatternBuilderError::ValidationError(format!(
                    "note at part {} has an invalid shape",
                    note.start
                )));
            }
        }
        Ok(pattern)
    }
}
impl Pattern {
    /// Whether any of this pattern's instrument indices matches.
    pub fn plays_instrument(&self, instrument_index: usize) -> bool {
        self.instruments.contains(&instrument_index)
    }
}

/// One channel: a set of instruments, a pool of patterns, and the bar map
/// that sequences them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Channel {
    /// Octave offset applied to all of this channel's notes.
    pub octave: usize,
    /// The channel's instruments.
    pub instruments: Vec<Instrument>,
    /// The channel's pattern pool.
    pub patterns: Vec<Pattern>,
    /// For each bar, one-based pattern index. Zero means an empty bar.
    pub bars: Vec<usize>,
}
impl Channel {
    /// The pattern playing in the given bar, or None if the bar is empty.
    pub fn pattern_for_bar(&self, bar: usize) -> Option<&Pattern> {
        match self.bars.get(bar) {
            Some(&index) if index > 0 => self.patterns.get(index - 1),
            _ => None,
        }
    }
}

/// A complete composition.
#[derive(Clone, Debug, Builder, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[builder(build_fn(private, name = "build_from_builder"))]
pub struct Song {
    /// Title, carried through both codec forms.
    #[builder(default)]
    pub title: String,
    /// Index into [config::SCALES].
    #[builder(default)]
    pub scale: usize,
    /// Index into [config::KEYS].
    #[builder(default)]
    pub key: usize,
    /// Beats per minute.
    #[builder(default)]
    pub tempo: Tempo,
    /// Beats in every bar.
    #[builder(default = "8")]
    pub beats_per_bar: usize,
    /// Bars in the song.
    #[builder(default = "16")]
    pub bar_count: usize,
    /// Patterns in every channel's pool.
    #[builder(default = "8")]
    pub patterns_per_channel: usize,
    /// Instruments in every channel.
    #[builder(default = "1")]
    pub instruments_per_channel: usize,
    /// Index into [config::RHYTHMS].
    #[builder(default = "1")]
    pub rhythm: usize,
    /// Whether all of a channel's instruments layer on every pattern. When
    /// false each pattern picks its instrument.
    #[builder(default)]
    pub layered_instruments: bool,
    /// First bar of the loop region.
    #[builder(default)]
    pub loop_start: usize,
    /// Length of the loop region, in bars.
    #[builder(default = "16")]
    pub loop_length: usize,
    /// Number of pitched channels at the front of `channels`.
    #[builder(default = "3")]
    pub pitch_channel_count: usize,
    /// Number of noise channels at the back of `channels`.
    #[builder(default = "1")]
    pub noise_channel_count: usize,
    /// The channels, pitched first.
    #[builder(default)]
    pub channels: Vec<Channel>,
}
impl Default for Song {
    fn default() -> Self {
        let mut song = Self {
            title: String::default(),
            scale: 0,
            key: 0,
            tempo: Tempo::default(),
            beats_per_bar: 8,
            bar_count: 16,
            patterns_per_channel: 8,
            instruments_per_channel: 1,
            rhythm: 1,
            layered_instruments: false,
            loop_start: 0,
            loop_length: 16,
            pitch_channel_count: 3,
            noise_channel_count: 1,
            channels: Vec::default(),
        };
        song.conform();
        song
    }
}
impl SongBuilder {
    /// Builds the [Song], clamping settings into range and growing or
    /// trimming channels, patterns, instruments, and bar maps to match the
    /// declared counts.
    pub fn build(&self) -> Result<Song, SongBuilderError> {
        let mut song = self.build_from_builder()?;
        song.conform();
        Ok(song)
    }
}
impl Song {
    /// The total channel count.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether the channel at the given index is a noise channel.
    pub fn is_noise_channel(&self, channel_index: usize) -> bool {
        channel_index >= self.pitch_channel_count
    }

    /// The pattern playing in the given channel and bar, or None if the
    /// bar is empty.
    pub fn pattern_for_bar(&self, channel_index: usize, bar: usize) -> Option<&Pattern> {
        self.channels
            .get(channel_index)
            .and_then(|channel| channel.pattern_for_bar(bar))
    }

    /// Parts per bar at the current time signature.
    pub fn parts_per_bar(&self) -> usize {
        self.beats_per_bar * config::PARTS_PER_BEAT
    }

    /// Clamps all global settings into range and reshapes channels to
    /// match the declared counts, preserving existing content.
    pub fn conform(&mut self) {
        self.scale = self.scale.min(config::SCALES.len() - 1);
        self.key = self.key.min(config::KEYS.len() - 1);
        self.rhythm = self.rhythm.min(config::RHYTHMS.len() - 1);
        self.beats_per_bar = self
            .beats_per_bar
            .clamp(config::BEATS_PER_BAR_MIN, config::BEATS_PER_BAR_MAX);
        self.bar_count = self
            .bar_count
            .clamp(config::BAR_COUNT_MIN, config::BAR_COUNT_MAX);
        self.patterns_per_channel = self
            .patterns_per_channel
            .clamp(1, config::PATTERNS_PER_CHANNEL_MAX);
        self.instruments_per_channel = self.instruments_per_channel.clamp(
            config::INSTRUMENTS_PER_CHANNEL_MIN,
            config::INSTRUMENTS_PER_CHANNEL_MAX,
        );
        self.pitch_channel_count = self.pitch_channel_count.clamp(
            config::PITCH_CHANNEL_COUNT_MIN,
            config::PITCH_CHANNEL_COUNT_MAX,
        );
        self.noise_channel_count = self.noise_channel_count.clamp(
            config::NOISE_CHANNEL_COUNT_MIN,
            config::NOISE_CHANNEL_COUNT_MAX,
        );
        self.loop_start = self.loop_start.min(self.bar_count - 1);
        self.loop_length = self.loop_length.clamp(1, self.bar_count - self.loop_start);

        let channel_count = self.pitch_channel_count + self.noise_channel_count;
        for channel_index in 0..channel_count {
            let is_noise = channel_index >= self.pitch_channel_count;
            if channel_index >= self.channels.len() {
                self.channels.push(Channel {
                    octave: if is_noise {
                        0
                    } else {
                        3usize.saturating_sub(channel_index)
                    },
                    ..Channel::default()
                });
            }
            let channel = &mut self.channels[channel_index];
            let default_kind = if is_noise {
                InstrumentKind::Noise
            } else {
                InstrumentKind::Chip
            };
            while channel.instruments.len() < self.instruments_per_channel {
                channel.instruments.push(Instrument::new(default_kind, is_noise));
            }
            channel.instruments.truncate(self.instruments_per_channel);
            while channel.patterns.len() < self.patterns_per_channel {
                channel.patterns.push(Pattern::default());
            }
            channel.patterns.truncate(self.patterns_per_channel);
            for pattern in channel.patterns.iter_mut() {
                pattern
                    .instruments
                    .retain(|index| *index < self.instruments_per_channel);
                if pattern.instruments.is_empty() {
                    pattern.instruments.push(0);
                }
            }
            channel.bars.resize(self.bar_count, 0);
            for bar in channel.bars.iter_mut() {
                if *bar > self.patterns_per_channel {
                    *bar = 0;
                }
            }
        }
        self.channels.truncate(channel_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_song_shape() {
        let song = Song::default();
        assert_eq!(song.channel_count(), 4);
        assert_eq!(
            song.pitch_channel_count + song.noise_channel_count,
            song.channel_count()
        );
        assert!(!song.is_noise_channel(2));
        assert!(song.is_noise_channel(3));
        for channel in &song.channels {
            assert_eq!(channel.bars.len(), song.bar_count);
            assert_eq!(channel.patterns.len(), song.patterns_per_channel);
            assert_eq!(channel.instruments.len(), song.instruments_per_channel);
        }
        assert_eq!(
            song.channels[3].instruments[0].kind,
            InstrumentKind::Noise
        );
    }

    #[test]
    fn conform_gives_every_pattern_an_instrument() {
        let mut song = Song::default();
        song.channels[0].patterns[0].instruments.clear();
        song.channels[0].patterns[1].instruments = vec![7];
        song.conform();
        assert_eq!(song.channels[0].patterns[0].instruments, vec![0]);
        assert_eq!(song.channels[0].patterns[1].instruments, vec![0]);
    }

    #[test]
    fn builder_clamps_out_of_range_settings() {
        let song = SongBuilder::default()
            .bar_count(1000)
            .beats_per_bar(1)
            .loop_start(500)
            .loop_length(0)
            .build()
            .unwrap();
        assert_eq!(song.bar_count, config::BAR_COUNT_MAX);
        assert_eq!(song.beats_per_bar, config::BEATS_PER_BAR_MIN);
        assert!(song.loop_start < song.bar_count);
        assert!(song.loop_length >= 1);
    }

    #[test]
    fn pattern_builder_rejects_overlap() {
        let result = PatternBuilder::default()
            .note(Note::new(vec![60], 0, 12))
            .note(Note::new(vec![62], 6, 18))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn pattern_builder_accepts_adjacent_notes() {
        let pattern = PatternBuilder::default()
            .note(Note::new(vec![60], 0, 12))
            .note(Note::new(vec![62], 12, 24))
            .build()
            .unwrap();
        assert_eq!(pattern.notes.len(), 2);
        assert!(pattern.plays_instrument(0));
    }

    #[test]
    fn empty_bar_has_no_pattern() {
        let mut song = Song::default();
        song.channels[0].bars[0] = 1;
        song.channels[1].bars[0] = 0;
        assert!(song.pattern_for_bar(0, 0).is_some());
        assert!(song.pattern_for_bar(1, 0).is_none());
    }

    #[test]
    fn note_pin_validation() {
        let note = Note::new(vec![60], 0, 24);
        assert!(note.pins_are_valid());
        let mut bad = note.clone();
        bad.pins[1].time = 12;
        assert!(!bad.pins_are_valid());
    }
}
