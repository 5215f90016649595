// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The synthesis engine.
//!
//! [Synth] owns the transport clock and renders a [Song] into interleaved
//! stereo buffers. Each audio buffer is split into runs bounded by tick
//! boundaries (a tick is half a part; see [config::TICKS_PER_PART]). At
//! every tick boundary the scheduler re-derives which notes are sounding
//! and syncs them onto pooled [Tone]s, then `compute_tone` interpolates
//! every per-tone parameter across the run and one signal generator per
//! instrument kind renders into a dry buffer. The instrument's effect
//! chain turns that mono dry signal into stereo, and a master limiter
//! rides the mix.
//!
//! Tones and their delay lines are pooled in ring-buffer deques and reused,
//! so steady-state rendering does not allocate.

mod effects;
mod envelope;
mod filtering;
mod generators;
mod tone;
mod waves;

use delegate::delegate;
use kahan::KahanSum;
use log::{debug, warn};

use crate::{
    codec,
    config,
    song::{Channel, FilterType, Instrument, InstrumentKind, Pattern, Song},
    types::{FrequencyHz, SampleRate},
    util::{Deque, Rng},
};

use effects::{EffectsContext, EffectsState, Limiter};
use envelope::{compute_envelope, compute_envelopes, EnvelopeInstant, EnvelopeValues};
use filtering::FilterCoefficients;
use tone::Tone;
use waves::RenderedWaves;

/// Relative detune of the six side voices of the supersaw stack, as a
/// fraction of the center frequency at full spread.
const SUPERSAW_DETUNE_CURVE: [f64; config::SUPERSAW_VOICE_COUNT - 1] = [
    -0.11002313,
    0.11002313,
    -0.06288439,
    0.06288439,
    -0.01952356,
    0.01952356,
];

/// Seed for the engine's noise phase randomization. Fixed so that two
/// engines rendering the same song produce identical samples.
const RNG_SEED: u128 = 0x9E37_79B9_7F4A_7C15;

/// Runtime state for one instrument of one channel: its voice lists, its
/// effect chain, and its rendered wavetable cache.
#[derive(Debug, Default)]
struct InstrumentRuntime {
    active_tones: Deque<Tone>,
    released_tones: Deque<Tone>,
    live_tones: Deque<Tone>,
    effects: EffectsState,
    waves: RenderedWaves,
    /// The most recently computed envelope table, read by effect stages.
    envelopes: EnvelopeValues,
}

#[derive(Debug, Default)]
struct ChannelState {
    instruments: Vec<InstrumentRuntime>,
}

/// Transport values frozen for the duration of one run.
#[derive(Clone, Copy, Debug)]
struct RunClock {
    sample_rate: f64,
    samples_per_tick: f64,
    /// Samples left in the current tick before this run renders.
    tick_sample_countdown: usize,
    run_length: usize,
    beat: usize,
    part: usize,
    tick: usize,
}

/// The song player and renderer.
#[derive(Debug)]
pub struct Synth {
    song: Song,
    sample_rate: SampleRate,
    volume: f64,
    playing: bool,
    bar: usize,
    beat: usize,
    part: usize,
    tick: usize,
    tick_sample_countdown: usize,
    /// The playhead in bars, accumulated with compensated summation and
    /// snapped to exact integers at bar boundaries.
    playhead: KahanSum<f64>,
    /// How many more times to jump back to the loop start: negative loops
    /// forever, zero plays straight through to the end.
    loop_repeat_count: i32,
    live_input_pressed: bool,
    live_input_channel: usize,
    live_input_pitches: Vec<usize>,
    tone_pool: Deque<Tone>,
    channel_states: Vec<ChannelState>,
    limiter: Limiter,
    rng: Rng,
    dry_buffer: Vec<f64>,
    tone_buffer: Vec<f64>,
    master_left: Vec<f64>,
    master_right: Vec<f64>,
}
impl Default for Synth {
    fn default() -> Self {
        Self::new_with(SampleRate::DEFAULT)
    }
}
impl Synth {
    /// Creates an engine rendering at the given sample rate, with an empty
    /// default song.
    pub fn new_with(sample_rate: SampleRate) -> Self {
        let mut synth = Self {
            song: Song::default(),
            sample_rate,
            volume: 0.5,
            playing: false,
            bar: 0,
            beat: 0,
            part: 0,
            tick: 0,
            tick_sample_countdown: 0,
            playhead: KahanSum::new(),
            loop_repeat_count: -1,
            live_input_pressed: false,
            live_input_channel: 0,
            live_input_pitches: Vec::default(),
            tone_pool: Deque::with_capacity(config::MAX_TONES_PER_CHANNEL),
            channel_states: Vec::default(),
            limiter: Limiter::new(f64::from(sample_rate)),
            rng: Rng::new_with_seed(RNG_SEED),
            dry_buffer: Vec::default(),
            tone_buffer: Vec::default(),
            master_left: Vec::default(),
            master_right: Vec::default(),
        };
        synth.sync_runtime_shape();
        synth
    }

    /// The engine's sample rate.
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    delegate! {
        to self.song {
            /// The loaded song's channel count.
            pub fn channel_count(&self) -> usize;
            /// Whether the given channel plays noise instruments.
            pub fn is_noise_channel(&self, channel_index: usize) -> bool;
            /// Parts per bar at the loaded song's time signature.
            pub fn parts_per_bar(&self) -> usize;
        }
    }

    /// The current song.
    pub fn song(&self) -> &Song {
        &self.song
    }

    /// Mutable access for editors. Structural changes are picked up at the
    /// next rendered buffer.
    pub fn song_mut(&mut self) -> &mut Song {
        &mut self.song
    }

    /// Replaces the song and rewinds to the start.
    pub fn set_song(&mut self, song: Song) {
        self.free_all_tones();
        self.song = song;
        self.sync_runtime_shape();
        self.snap_to_start();
        debug!(
            "loaded song: {} bars, {} channels",
            self.song.bar_count,
            self.song.channel_count()
        );
    }

    /// Decodes a compact song string and loads it.
    pub fn set_song_from_str(&mut self, input: &str) -> anyhow::Result<()> {
        let song = codec::decode_song(input)?;
        self.set_song(song);
        Ok(())
    }

    /// Master output volume, applied before the limiter's makeup division.
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume.max(0.0);
    }

    /// The master output volume.
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Starts the transport.
    pub fn play(&mut self) {
        self.playing = true;
    }

    /// Stops the transport, silences all voices, and flushes effect tails.
    pub fn pause(&mut self) {
        self.playing = false;
        self.free_all_tones();
        self.reset_effects();
    }

    /// Whether the transport is running.
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Rewinds to bar zero.
    pub fn snap_to_start(&mut self) {
        self.go_to_bar(0);
    }

    /// Jumps to the start of the given bar.
    pub fn go_to_bar(&mut self, bar: usize) {
        self.bar = bar.min(self.song.bar_count.saturating_sub(1));
        self.beat = 0;
        self.part = 0;
        self.tick = 0;
        self.tick_sample_countdown = 0;
        self.playhead = KahanSum::new_with_value(self.bar as f64);
        self.free_all_tones();
        self.reset_effects();
    }

    /// Skips forward one bar, preserving the intra-bar position.
    pub fn next_bar(&mut self) {
        let old_bar = self.bar;
        self.bar = (self.bar + 1) % self.song.bar_count;
        self.playhead += self.bar as f64 - old_bar as f64;
    }

    /// Skips back one bar, preserving the intra-bar position.
    pub fn prev_bar(&mut self) {
        let old_bar = self.bar;
        self.bar = if self.bar == 0 {
            self.song.bar_count - 1
        } else {
            self.bar - 1
        };
        self.playhead += self.bar as f64 - old_bar as f64;
    }

    /// The playhead position, in bars.
    pub fn playhead(&self) -> f64 {
        self.playhead.sum()
    }

    /// Moves the playhead to a position in bars, decomposing the fraction
    /// into beat, part, tick, and the intra-tick sample countdown.
    pub fn set_playhead(&mut self, position: f64) {
        let position = position.clamp(0.0, self.song.bar_count as f64);
        let samples_per_tick = self.samples_per_tick();
        self.bar = (position as usize).min(self.song.bar_count.saturating_sub(1));
        let mut remainder = position - self.bar as f64;
        remainder *= self.song.beats_per_bar as f64;
        self.beat = (remainder as usize).min(self.song.beats_per_bar - 1);
        remainder = (remainder - self.beat as f64) * config::PARTS_PER_BEAT as f64;
        self.part = (remainder as usize).min(config::PARTS_PER_BEAT - 1);
        remainder = (remainder - self.part as f64) * config::TICKS_PER_PART as f64;
        self.tick = (remainder as usize).min(config::TICKS_PER_PART - 1);
        remainder -= self.tick as f64;
        self.tick_sample_countdown =
            ((samples_per_tick as f64 * (1.0 - remainder)) as usize).max(1);
        self.playhead = KahanSum::new_with_value(position);
        self.free_all_tones();
    }

    /// How many more times the loop region repeats. Negative means forever.
    pub fn loop_repeat_count(&self) -> i32 {
        self.loop_repeat_count
    }

    /// Sets the remaining loop repeats. Negative loops forever; zero plays
    /// through the loop region and on to the end of the song.
    pub fn set_loop_repeat_count(&mut self, count: i32) {
        self.loop_repeat_count = count;
    }

    /// Starts (or re-chords) live input on a channel. Pitches beyond the
    /// maximum chord size are ignored.
    pub fn press_live_input(&mut self, channel_index: usize, pitches: &[usize]) {
        self.live_input_pressed = true;
        self.live_input_channel = channel_index.min(self.song.channel_count().saturating_sub(1));
        self.live_input_pitches.clear();
        self.live_input_pitches
            .extend(pitches.iter().copied().take(config::MAX_CHORD_SIZE));
    }

    /// Releases all live input pitches.
    pub fn release_live_input(&mut self) {
        self.live_input_pressed = false;
        self.live_input_pitches.clear();
    }

    /// Samples in one tick at the current tempo.
    pub fn samples_per_tick(&self) -> usize {
        let samples_per_beat = f64::from(self.sample_rate) / self.song.tempo.bps();
        ((samples_per_beat / config::TICKS_PER_BEAT as f64) as usize).max(1)
    }

    /// Samples in one bar at the current tempo and time signature.
    pub fn samples_per_bar(&self) -> usize {
        self.samples_per_tick() * config::TICKS_PER_BEAT * self.song.beats_per_bar
    }

    /// Renders the next stretch of audio into the two output buffers. The
    /// buffers are fully overwritten; if the transport is stopped and no
    /// live input is held they are zeroed.
    pub fn synthesize(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frame_count = left.len().min(right.len());
        left[..frame_count].fill(0.0);
        right[..frame_count].fill(0.0);
        self.sync_runtime_shape();
        self.master_left.clear();
        self.master_left.resize(frame_count, 0.0);
        self.master_right.clear();
        self.master_right.resize(frame_count, 0.0);

        let advancing = self.playing;
        if !advancing && !self.live_input_pressed {
            return;
        }

        let samples_per_tick = self.samples_per_tick();
        if self.tick_sample_countdown == 0 || self.tick_sample_countdown > samples_per_tick {
            self.tick_sample_countdown = samples_per_tick;
        }
        let samples_per_bar = self.samples_per_bar() as f64;

        let mut buffer_index = 0;
        while buffer_index < frame_count {
            if advancing && self.bar >= self.song.bar_count {
                debug!("playback reached the end of the song");
                self.pause();
                break;
            }
            if self.tick_sample_countdown == samples_per_tick {
                for channel_index in 0..self.channel_states.len() {
                    self.determine_live_input_tones(channel_index);
                    if advancing {
                        self.determine_current_active_tones(channel_index);
                    }
                }
            }
            let run_length = (frame_count - buffer_index).min(self.tick_sample_countdown);
            self.render_run(buffer_index, run_length, samples_per_tick);
            self.tick_sample_countdown -= run_length;
            buffer_index += run_length;
            if advancing {
                self.playhead += run_length as f64 / samples_per_bar;
            }
            if self.tick_sample_countdown == 0 {
                self.advance_tick(samples_per_tick, advancing);
                if !self.playing && !self.live_input_pressed {
                    break;
                }
            }
        }

        for i in 0..frame_count {
            let mut sample_left = self.master_left[i];
            let mut sample_right = self.master_right[i];
            self.limiter
                .process(self.volume, &mut sample_left, &mut sample_right);
            left[i] = if sample_left.is_finite() {
                sample_left as f32
            } else {
                0.0
            };
            right[i] = if sample_right.is_finite() {
                sample_right as f32
            } else {
                0.0
            };
        }
    }

    /// Grows or trims the per-channel runtime state to match the song's
    /// declared shape. Surplus tones return to the pool implicitly.
    fn sync_runtime_shape(&mut self) {
        let channel_count = self.song.channel_count();
        self.channel_states
            .resize_with(channel_count, ChannelState::default);
        for state in self.channel_states.iter_mut() {
            state
                .instruments
                .resize_with(self.song.instruments_per_channel, InstrumentRuntime::default);
        }
    }

    /// Returns every tone in every list to the pool.
    fn free_all_tones(&mut self) {
        for state in self.channel_states.iter_mut() {
            for runtime in state.instruments.iter_mut() {
                for list in [
                    &mut runtime.active_tones,
                    &mut runtime.released_tones,
                    &mut runtime.live_tones,
                ] {
                    while let Some(mut tone) = list.pop_back() {
                        tone.reset();
                        self.tone_pool.push_back(tone);
                    }
                }
            }
        }
    }

    fn reset_effects(&mut self) {
        for state in self.channel_states.iter_mut() {
            for runtime in state.instruments.iter_mut() {
                runtime.effects.reset();
            }
        }
        self.limiter.reset();
    }

    /// Advances the transport one tick: ages released tones, then rolls
    /// tick into part, beat, and bar, jumping back at the loop boundary.
    fn advance_tick(&mut self, samples_per_tick: usize, advancing: bool) {
        self.tick_sample_countdown = samples_per_tick;
        for channel_index in 0..self.channel_states.len() {
            let song = &self.song;
            let state = &mut self.channel_states[channel_index];
            for (instrument_index, runtime) in state.instruments.iter_mut().enumerate() {
                let release_ticks = song.channels[channel_index]
                    .instruments
                    .get(instrument_index)
                    .map_or(1, |instrument| instrument.transition().release_ticks)
                    as f64;
                let mut index = 0;
                while index < runtime.released_tones.len() {
                    let tone = runtime.released_tones.get_mut(index).unwrap();
                    tone.ticks_since_released += 1.0;
                    if tone.ticks_since_released >= release_ticks {
                        let mut tone = runtime.released_tones.remove(index).unwrap();
                        tone.reset();
                        self.tone_pool.push_back(tone);
                    } else {
                        index += 1;
                    }
                }
            }
        }
        if !advancing {
            return;
        }
        self.tick += 1;
        if self.tick < config::TICKS_PER_PART {
            return;
        }
        self.tick = 0;
        self.part += 1;
        if self.part < config::PARTS_PER_BEAT {
            return;
        }
        self.part = 0;
        self.beat += 1;
        if self.beat < self.song.beats_per_bar {
            return;
        }
        self.beat = 0;
        self.bar += 1;
        let loop_end = self.song.loop_start + self.song.loop_length;
        if self.bar == loop_end && self.loop_repeat_count != 0 {
            if self.loop_repeat_count > 0 {
                self.loop_repeat_count -= 1;
            }
            self.bar = self.song.loop_start;
        }
        // Snap the compensated sum to the exact boundary so drift cannot
        // accumulate across bars.
        self.playhead = KahanSum::new_with_value(self.bar as f64);
    }

    /// Re-derives this channel's note-driven tones for the current tick.
    fn determine_current_active_tones(&mut self, channel_index: usize) {
        let current_part = self.beat * config::PARTS_PER_BEAT + self.part;
        let parts_per_bar = self.song.parts_per_bar();
        for instrument_index in 0..self.song.instruments_per_channel {
            let song = &self.song;
            let pattern = song.pattern_for_bar(channel_index, self.bar);
            let plays = pattern.is_some_and(|pattern| {
                song.layered_instruments || pattern.plays_instrument(instrument_index)
            });
            let Some(state) = self.channel_states.get_mut(channel_index) else {
                return;
            };
            let Some(runtime) = state.instruments.get_mut(instrument_index) else {
                continue;
            };
            let Some(instrument) = song
                .channels
                .get(channel_index)
                .and_then(|channel| channel.instruments.get(instrument_index))
            else {
                continue;
            };

            let mut note_index = None;
            let mut prev_index = None;
            let mut next_index = None;
            if plays {
                if let Some(pattern) = pattern {
                    for (index, note) in pattern.notes.iter().enumerate() {
                        if note.end <= current_part {
                            prev_index = Some(index);
                        } else if note.start <= current_part {
                            note_index = Some(index);
                        } else {
                            next_index = Some(index);
                            break;
                        }
                    }
                    // Neighbors only matter when they touch this note, for
                    // seamless continuations and slides.
                    if let Some(current) = note_index {
                        let current_note = &pattern.notes[current];
                        if let Some(prev) = prev_index {
                            if pattern.notes[prev].end != current_note.start {
                                prev_index = None;
                            }
                        }
                        if let Some(next) = next_index {
                            if pattern.notes[next].start != current_note.end {
                                next_index = None;
                            }
                        }
                    }
                }
            }

            if let (Some(note_index), Some(pattern)) = (note_index, pattern) {
                sync_tones(
                    &mut self.tone_pool,
                    runtime,
                    instrument,
                    instrument_index,
                    pattern,
                    note_index,
                    prev_index,
                    next_index,
                    current_part,
                    parts_per_bar,
                );
            } else {
                release_or_free_all_active(&mut self.tone_pool, runtime, instrument);
            }
        }
    }

    /// Syncs the channel's live-input tones to the currently held pitches.
    /// Existing tones keep the pitch they were given as long as it is still
    /// held; newly pressed pitches claim the remaining tones in list order,
    /// so re-chording is deterministic.
    fn determine_live_input_tones(&mut self, channel_index: usize) {
        let song = &self.song;
        let Some(state) = self.channel_states.get_mut(channel_index) else {
            return;
        };
        let pressed = self.live_input_pressed
            && self.live_input_channel == channel_index
            && !self.live_input_pitches.is_empty();
        let selected_instrument = song
            .pattern_for_bar(channel_index, self.bar)
            .and_then(|pattern| pattern.instruments.first().copied())
            .unwrap_or(0)
            .min(song.instruments_per_channel.saturating_sub(1));

        for (instrument_index, runtime) in state.instruments.iter_mut().enumerate() {
            if instrument_index == selected_instrument && pressed {
                continue;
            }
            release_all_live(runtime);
        }
        if !pressed {
            return;
        }
        let Some(runtime) = state.instruments.get_mut(selected_instrument) else {
            return;
        };
        let Some(instrument) = song
            .channels
            .get(channel_index)
            .and_then(|channel| channel.instruments.get(selected_instrument))
        else {
            return;
        };
        let transition = instrument.transition();

        let mut held: Vec<Tone> = Vec::with_capacity(runtime.live_tones.len());
        while let Some(tone) = runtime.live_tones.pop_front() {
            held.push(tone);
        }
        let chord_size = self.live_input_pitches.len();
        for &pitch in &self.live_input_pitches {
            let mut tone = if let Some(position) =
                held.iter().position(|tone| tone.first_pitch() == pitch)
            {
                held.remove(position)
            } else if transition.is_seamless && !held.is_empty() {
                held.remove(0)
            } else {
                let mut tone = self.tone_pool.pop_back().unwrap_or_default();
                tone.reset();
                tone
            };
            tone.pitches[0] = pitch;
            tone.pitch_count = 1;
            tone.chord_size = chord_size;
            tone.instrument_index = selected_instrument;
            tone.note = None;
            tone.prev_note = None;
            tone.next_note = None;
            runtime.live_tones.push_back(tone);
        }
        for tone in held {
            release_tone(runtime, tone);
        }
    }

    /// Renders one tick-bounded run for every instrument of every channel
    /// into the master buffers.
    fn render_run(&mut self, buffer_index: usize, run_length: usize, samples_per_tick: usize) {
        let sample_rate = f64::from(self.sample_rate);
        let clock = RunClock {
            sample_rate,
            samples_per_tick: samples_per_tick as f64,
            tick_sample_countdown: self.tick_sample_countdown,
            run_length,
            beat: self.beat,
            part: self.part,
            tick: self.tick,
        };
        let context = EffectsContext {
            sample_rate,
            samples_per_part: samples_per_tick as f64 * config::TICKS_PER_PART as f64,
            key_base_freq: FrequencyHz::from_pitch(
                config::KEYS[self.song.key].base_pitch as f64,
            )
            .0,
        };

        for channel_index in 0..self.channel_states.len() {
            let is_noise_channel = self.song.is_noise_channel(channel_index);
            for instrument_index in 0..self.channel_states[channel_index].instruments.len() {
                let song = &self.song;
                let Some(channel) = song.channels.get(channel_index) else {
                    continue;
                };
                let Some(instrument) = channel.instruments.get(instrument_index) else {
                    continue;
                };
                let pattern = channel.pattern_for_bar(self.bar);
                let runtime =
                    &mut self.channel_states[channel_index].instruments[instrument_index];
                let InstrumentRuntime {
                    active_tones,
                    released_tones,
                    live_tones,
                    effects,
                    waves,
                    envelopes,
                } = runtime;

                self.dry_buffer.clear();
                self.dry_buffer.resize(run_length, 0.0);
                let mut any_tone = false;
                for (list, released) in [
                    (active_tones, false),
                    (live_tones, false),
                    (released_tones, true),
                ] {
                    for index in 0..list.len() {
                        let tone = list.get_mut(index).unwrap();
                        any_tone = true;
                        self.tone_buffer.clear();
                        self.tone_buffer.resize(run_length, 0.0);
                        compute_tone(
                            song,
                            channel,
                            is_noise_channel,
                            instrument,
                            pattern,
                            tone,
                            released,
                            &clock,
                            envelopes,
                            waves,
                            &mut self.rng,
                        );
                        render_tone(tone, instrument, waves, &mut self.tone_buffer);
                        for filter_index in 0..tone.note_filter_count {
                            tone.note_filters[filter_index].process(&mut self.tone_buffer);
                        }
                        for (dry, rendered) in
                            self.dry_buffer.iter_mut().zip(self.tone_buffer.iter())
                        {
                            *dry += *rendered;
                        }
                        tone.active = true;
                        if tone.note.is_none() && !released {
                            tone.live_input_samples_held += run_length;
                        }
                    }
                }

                if any_tone || effects.is_draining() {
                    let out_left = &mut self.master_left[buffer_index..buffer_index + run_length];
                    let out_right =
                        &mut self.master_right[buffer_index..buffer_index + run_length];
                    effects.process(
                        instrument,
                        envelopes,
                        &context,
                        &mut self.dry_buffer,
                        out_left,
                        out_right,
                    );
                }
            }
        }
    }
}

/// Moves a tone onto the released list, marking it for a fast fade when the
/// channel is over its voice cap.
fn release_tone(runtime: &mut InstrumentRuntime, mut tone: Tone) {
    tone.ticks_since_released = 0.0;
    tone.fade_out_fast = runtime.active_tones.len()
        + runtime.live_tones.len()
        + runtime.released_tones.len()
        >= config::MAX_TONES_PER_CHANNEL;
    if tone.fade_out_fast {
        warn!("instrument is over its voice cap, fast-fading a released tone");
    }
    runtime.released_tones.push_front(tone);
}

fn release_all_live(runtime: &mut InstrumentRuntime) {
    while let Some(tone) = runtime.live_tones.pop_back() {
        if tone.active {
            release_tone(runtime, tone);
        } else {
            runtime.released_tones.push_front(tone);
        }
    }
}

/// Releases or frees every note-driven tone, depending on whether the
/// instrument's transition sustains past the note end.
fn release_or_free_all_active(
    pool: &mut Deque<Tone>,
    runtime: &mut InstrumentRuntime,
    instrument: &Instrument,
) {
    let releases = instrument.transition().releases;
    while let Some(mut tone) = runtime.active_tones.pop_back() {
        if releases && tone.active {
            release_tone(runtime, tone);
        } else {
            tone.reset();
            pool.push_back(tone);
        }
    }
}

/// Reuses the tone at `index` in the list, pulling a pooled tone in if the
/// list is shorter than that.
fn tone_at<'a>(pool: &mut Deque<Tone>, list: &'a mut Deque<Tone>, index: usize) -> &'a mut Tone {
    while list.len() <= index {
        let mut tone = pool.pop_back().unwrap_or_default();
        tone.reset();
        list.push_back(tone);
    }
    list.get_mut(index).unwrap()
}

/// Maps the current note onto this instrument's tone list: one tone for the
/// whole chord under a single-tone policy, otherwise one tone per pitch
/// with strum offsets. Leftover tones from a larger previous chord are
/// released or freed.
#[allow(clippy::too_many_arguments)]
fn sync_tones(
    pool: &mut Deque<Tone>,
    runtime: &mut InstrumentRuntime,
    instrument: &Instrument,
    instrument_index: usize,
    pattern: &Pattern,
    note_index: usize,
    prev_index: Option<usize>,
    next_index: Option<usize>,
    current_part: usize,
    parts_per_bar: usize,
) {
    let note = &pattern.notes[note_index];
    let chord = instrument.chord();
    let transition = instrument.transition();
    let mut needed = 0;

    if chord.single_tone {
        let tone = tone_at(pool, &mut runtime.active_tones, 0);
        let pitch_count = note.pitches.len().min(config::MAX_CHORD_SIZE);
        for (slot, &pitch) in tone.pitches.iter_mut().zip(note.pitches.iter()) {
            *slot = pitch;
        }
        tone.pitch_count = pitch_count;
        tone.chord_size = 1;
        tone.instrument_index = instrument_index;
        tone.note = Some(note_index);
        tone.prev_note = prev_index;
        tone.next_note = next_index;
        tone.note_pitch_index = 0;
        tone.note_start = note.start as i32;
        tone.note_end = note.end as i32;
        needed = 1;
    } else {
        for (pitch_index, &pitch) in note
            .pitches
            .iter()
            .take(config::MAX_CHORD_SIZE)
            .enumerate()
        {
            let strum_offset = pitch_index * chord.strum_parts;
            let mut tone_note = note_index;
            let mut tone_prev = prev_index;
            let mut tone_next = next_index;
            let mut tone_pitch = pitch;
            let mut tone_pitch_index = pitch_index;
            let mut note_start = note.start + strum_offset;
            let mut note_end = note.end;
            if note_start > current_part {
                // This strummed pitch has not started yet. Under a seamless
                // transition the previous note's pitch keeps sounding until
                // it does; otherwise the tone simply does not exist yet.
                if let (Some(prev), true, true) = (
                    prev_index,
                    transition.is_seamless,
                    runtime.active_tones.len() > pitch_index,
                ) {
                    let prev_note = &pattern.notes[prev];
                    tone_pitch_index = pitch_index.min(prev_note.pitches.len() - 1);
                    tone_pitch = prev_note.pitches[tone_pitch_index];
                    tone_note = prev;
                    tone_prev = None;
                    tone_next = Some(note_index);
                    note_start = prev_note.start;
                    note_end = (note.start + strum_offset).min(parts_per_bar);
                } else {
                    break;
                }
            } else if transition.is_seamless && next_index.is_some() {
                note_end = (note_end + strum_offset).min(parts_per_bar);
            }
            let tone = tone_at(pool, &mut runtime.active_tones, needed);
            tone.pitches[0] = tone_pitch;
            tone.pitch_count = 1;
            tone.chord_size = note.pitches.len();
            tone.instrument_index = instrument_index;
            tone.note = Some(tone_note);
            tone.prev_note = tone_prev;
            tone.next_note = tone_next;
            tone.note_pitch_index = tone_pitch_index;
            tone.note_start = note_start as i32;
            tone.note_end = note_end as i32;
            needed += 1;
        }
    }

    while runtime.active_tones.len() > needed {
        let tone = runtime.active_tones.remove(needed).unwrap();
        if transition.releases && tone.active {
            release_tone(runtime, tone);
        } else {
            let mut tone = tone;
            tone.reset();
            pool.push_back(tone);
        }
    }
}

/// Linearly interpolates a note's pin list at a moment measured in ticks
/// from the start of the bar. Returns the pitch-bend interval and size.
fn interpolate_pins(note: &crate::song::Note, tick_time: f64) -> (f64, f64) {
    let base_tick = (note.start * config::TICKS_PER_PART) as f64;
    let ticks_in = tick_time - base_tick;
    let mut prev = note.pins[0];
    for &pin in &note.pins[1..] {
        let prev_tick = (prev.time * config::TICKS_PER_PART) as f64;
        let pin_tick = (pin.time * config::TICKS_PER_PART) as f64;
        if ticks_in <= pin_tick || pin == *note.pins.last().unwrap() {
            let span = (pin_tick - prev_tick).max(1e-9);
            let ratio = ((ticks_in - prev_tick) / span).clamp(0.0, 1.0);
            let interval =
                prev.interval as f64 + (pin.interval as f64 - prev.interval as f64) * ratio;
            let size = prev.size as f64 + (pin.size as f64 - prev.size as f64) * ratio;
            return (interval, size);
        }
        prev = pin;
    }
    (prev.interval as f64, prev.size as f64)
}

fn silence_tone(tone: &mut Tone) {
    tone.expression_start = 0.0;
    tone.expression_delta = 0.0;
    tone.expression_starts = [0.0; config::OPERATOR_COUNT];
    tone.expression_deltas = [0.0; config::OPERATOR_COUNT];
}

fn chord_volume_for_size(chord_size: f64, arpeggiates: bool) -> f64 {
    if arpeggiates {
        1.0
    } else {
        1.0 / ((chord_size - 1.0).max(0.0) * 0.25 + 1.0)
    }
}

fn filter_point_coefficients(
    kind: FilterType,
    radians_per_sample: f64,
    linear_gain: f64,
) -> FilterCoefficients {
    match kind {
        FilterType::LowPass => FilterCoefficients::low_pass(radians_per_sample, linear_gain),
        FilterType::HighPass => FilterCoefficients::high_pass(radians_per_sample, linear_gain),
        FilterType::Peak => FilterCoefficients::peak(radians_per_sample, linear_gain),
    }
}

/// Interpolates every per-tone parameter across one run: pin shapes,
/// transition fades, slides, vibrato, envelopes, per-kind frequency and
/// expression setup, and the note filter coefficients.
#[allow(clippy::too_many_arguments)]
fn compute_tone(
    song: &Song,
    channel: &Channel,
    is_noise_channel: bool,
    instrument: &Instrument,
    pattern: Option<&Pattern>,
    tone: &mut Tone,
    released: bool,
    clock: &RunClock,
    envelopes_out: &mut EnvelopeValues,
    waves: &mut RenderedWaves,
    rng: &mut Rng,
) {
    let transition = instrument.transition();
    let chord = instrument.chord();
    let sample_rate = clock.sample_rate;
    let seconds_per_part =
        config::TICKS_PER_PART as f64 * clock.samples_per_tick / sample_rate;
    let run_length = clock.run_length.max(1);
    let start_ratio = 1.0 - clock.tick_sample_countdown as f64 / clock.samples_per_tick;
    let end_ratio =
        1.0 - (clock.tick_sample_countdown - clock.run_length) as f64 / clock.samples_per_tick;
    let ticks_into_bar =
        ((clock.beat * config::PARTS_PER_BEAT + clock.part) * config::TICKS_PER_PART + clock.tick)
            as f64;
    let part_time_start = (ticks_into_bar + start_ratio) / config::TICKS_PER_PART as f64;
    let part_time_end = (ticks_into_bar + end_ratio) / config::TICKS_PER_PART as f64;

    let interval_scale = if is_noise_channel {
        config::NOISE_INTERVAL as f64
    } else {
        1.0
    };

    let mut interval_start = 0.0;
    let mut interval_end = 0.0;
    let mut size_start = tone.last_size;
    let mut size_end = tone.last_size;
    let mut decay_time_start = 0.0;
    let mut decay_time_end = 0.0;
    let mut transition_volume_start = 1.0;
    let mut transition_volume_end = 1.0;
    let mut chord_size_start = tone.chord_size as f64;
    let mut chord_size_end = tone.chord_size as f64;
    let mut reset_phases = false;
    let mut seamless_from_prev = false;

    if released {
        let release_ticks = transition.release_ticks as f64;
        interval_start = tone.last_interval;
        interval_end = tone.last_interval;
        decay_time_start = (tone.note_length_ticks + tone.ticks_since_released + start_ratio)
            / config::TICKS_PER_PART as f64;
        decay_time_end = (tone.note_length_ticks + tone.ticks_since_released + end_ratio)
            / config::TICKS_PER_PART as f64;
        transition_volume_start = config::note_size_to_volume_mult(
            (1.0 - (tone.ticks_since_released + start_ratio) / release_ticks).max(0.0)
                * config::NOTE_SIZE_MAX as f64,
        );
        transition_volume_end = config::note_size_to_volume_mult(
            (1.0 - (tone.ticks_since_released + end_ratio) / release_ticks).max(0.0)
                * config::NOTE_SIZE_MAX as f64,
        );
        if tone.fade_out_fast {
            transition_volume_start *= 1.0 - start_ratio;
            transition_volume_end *= 1.0 - end_ratio;
        }
    } else if tone.note.is_none() {
        // Live input: flat full-size shape, decay measured from the press.
        size_start = config::NOTE_SIZE_MAX as f64;
        size_end = size_start;
        let samples_per_part = seconds_per_part * sample_rate;
        decay_time_start = tone.live_input_samples_held as f64 / samples_per_part;
        decay_time_end = decay_time_start + clock.run_length as f64 / samples_per_part;
        reset_phases = !tone.active;
        tone.note_length_ticks = 0.0;
    } else {
        // The pattern or note can vanish between ticks when an editor
        // rewrites the bar; the tone goes silent until the next sync.
        let Some(pattern) = pattern else {
            silence_tone(tone);
            return;
        };
        let Some(note) = tone.note.and_then(|index| pattern.notes.get(index)) else {
            silence_tone(tone);
            return;
        };
        let prev_note = tone.prev_note.and_then(|index| pattern.notes.get(index));
        let next_note = tone.next_note.and_then(|index| pattern.notes.get(index));
        let note_start_tick = (tone.note_start * config::TICKS_PER_PART as i32) as f64;
        let note_end_tick = (tone.note_end * config::TICKS_PER_PART as i32) as f64;
        tone.note_length_ticks = note_end_tick - note_start_tick;

        let (interval_tick_start, size_tick_start) =
            interpolate_pins(note, ticks_into_bar + start_ratio);
        let (interval_tick_end, size_tick_end) =
            interpolate_pins(note, ticks_into_bar + end_ratio);
        interval_start = interval_tick_start;
        interval_end = interval_tick_end;
        size_start = size_tick_start;
        size_end = size_tick_end;
        decay_time_start =
            (ticks_into_bar + start_ratio - note_start_tick) / config::TICKS_PER_PART as f64;
        decay_time_end =
            (ticks_into_bar + end_ratio - note_start_tick) / config::TICKS_PER_PART as f64;

        reset_phases = (ticks_into_bar + start_ratio - note_start_tick).abs() < 1e-9;
        if transition.is_seamless && (prev_note.is_some() || note.start == 0) {
            // A seamless continuation keeps the running phase; only a tone
            // that was never active needs a fresh start.
            reset_phases = false;
            seamless_from_prev = prev_note.is_some();
        }
        reset_phases |= !tone.active;

        if transition.slides {
            let pitch_index = tone.note_pitch_index.min(note.pitches.len() - 1);
            let this_pitch = note.pitches[pitch_index] as f64;
            if let Some(prev) = prev_note {
                let slide_ticks = (transition.slide_ticks as f64)
                    .min(tone.note_length_ticks / 2.0)
                    .min((prev.duration() * config::TICKS_PER_PART) as f64 / 2.0)
                    .max(1e-9);
                let prev_pitch =
                    prev.pitches[pitch_index.min(prev.pitches.len() - 1)] as f64;
                let prev_last = prev.pins.last().unwrap();
                let pitch_diff = prev_pitch + prev_last.interval as f64 - this_pitch;
                let ratio_start = (1.0
                    - (ticks_into_bar + start_ratio - note_start_tick) / slide_ticks)
                    .max(0.0)
                    * 0.5;
                let ratio_end = (1.0
                    - (ticks_into_bar + end_ratio - note_start_tick) / slide_ticks)
                    .max(0.0)
                    * 0.5;
                interval_start += ratio_start * pitch_diff;
                interval_end += ratio_end * pitch_diff;
                size_start += ratio_start * (prev_last.size as f64 - size_start);
                size_end += ratio_end * (prev_last.size as f64 - size_end);
                let prev_parts = prev.duration() as f64;
                decay_time_start += ratio_start * prev_parts;
                decay_time_end += ratio_end * prev_parts;
                chord_size_start +=
                    ratio_start * (prev.pitches.len() as f64 - chord_size_start);
                chord_size_end += ratio_end * (prev.pitches.len() as f64 - chord_size_end);
            }
            if let Some(next) = next_note {
                let slide_ticks = (transition.slide_ticks as f64)
                    .min(tone.note_length_ticks / 2.0)
                    .min((next.duration() * config::TICKS_PER_PART) as f64 / 2.0)
                    .max(1e-9);
                let next_pitch =
                    next.pitches[pitch_index.min(next.pitches.len() - 1)] as f64;
                let this_last = note.pins.last().unwrap();
                let pitch_diff = next_pitch - (this_pitch + this_last.interval as f64);
                let ratio_start = (1.0
                    - (note_end_tick - (ticks_into_bar + start_ratio)) / slide_ticks)
                    .max(0.0)
                    * 0.5;
                let ratio_end = (1.0
                    - (note_end_tick - (ticks_into_bar + end_ratio)) / slide_ticks)
                    .max(0.0)
                    * 0.5;
                interval_start += ratio_start * pitch_diff;
                interval_end += ratio_end * pitch_diff;
                let next_size = next.pins.first().unwrap().size as f64;
                size_start += ratio_start * (next_size - size_start);
                size_end += ratio_end * (next_size - size_end);
                chord_size_start +=
                    ratio_start * (next.pitches.len() as f64 - chord_size_start);
                chord_size_end += ratio_end * (next.pitches.len() as f64 - chord_size_end);
            }
        }

        // Without a release tail or a seamless successor, the tone fades
        // over the last few ticks of the note so it does not click off.
        if !transition.releases && next_note.is_none() {
            let fade_ticks = (transition.release_ticks as f64).max(1.0);
            transition_volume_start *= ((note_end_tick - (ticks_into_bar + start_ratio))
                / fade_ticks)
                .clamp(0.0, 1.0);
            transition_volume_end *= ((note_end_tick - (ticks_into_bar + end_ratio))
                / fade_ticks)
                .clamp(0.0, 1.0);
        }

        tone.last_interval = interval_end;
        tone.last_size = size_end;
    }

    if !released && transition.attack_seconds > 0.0 && !seamless_from_prev {
        let attack = transition.attack_seconds;
        transition_volume_start *= (seconds_per_part * decay_time_start / attack).min(1.0);
        transition_volume_end *= (seconds_per_part * decay_time_end / attack).min(1.0);
    }

    let instant_start = EnvelopeInstant {
        note_seconds: decay_time_start * seconds_per_part,
        beats: part_time_start / config::PARTS_PER_BEAT as f64,
        note_size_mult: config::note_size_to_volume_mult(size_start),
    };
    let instant_end = EnvelopeInstant {
        note_seconds: decay_time_end * seconds_per_part,
        beats: part_time_end / config::PARTS_PER_BEAT as f64,
        note_size_mult: config::note_size_to_volume_mult(size_end),
    };
    let env_start = compute_envelopes(instrument, &instant_start);
    let env_end = compute_envelopes(instrument, &instant_end);
    *envelopes_out = env_end;

    if !is_noise_channel {
        let vibrato = instrument.vibrato();
        if vibrato.amplitude > 0.0 {
            let delay_parts = vibrato.delay_ticks as f64 / config::TICKS_PER_PART as f64;
            let lfo = |seconds: f64| -> f64 {
                vibrato
                    .periods_seconds
                    .iter()
                    .map(|period| (seconds * std::f64::consts::TAU / period).sin())
                    .sum()
            };
            if decay_time_start >= delay_parts {
                interval_start += vibrato.amplitude
                    * env_start.vibrato_depth
                    * lfo(part_time_start * seconds_per_part);
            }
            if decay_time_end >= delay_parts {
                interval_end += vibrato.amplitude
                    * env_end.vibrato_depth
                    * lfo(part_time_end * seconds_per_part);
            }
        }
    }

    if instrument.kind != InstrumentKind::Drumset {
        let pitch_shift =
            instrument.pitch_shift as f64 - config::PITCH_SHIFT_CENTER as f64;
        let detune = (instrument.detune as f64 - config::DETUNE_CENTER as f64)
            * config::DETUNE_STEP_CENTS
            / 100.0;
        interval_start += pitch_shift * env_start.pitch_shift + detune * env_start.detune;
        interval_end += pitch_shift * env_end.pitch_shift + detune * env_end.detune;
    }

    // Per-kind loudness reference: which pitch plays at unity and how fast
    // expression falls off above it.
    let (base_pitch, volume_reference_pitch, pitch_damping, kind_expression) =
        match instrument.kind {
            InstrumentKind::Noise => {
                let noise = &config::CHIP_NOISES[instrument.chip_noise.min(
                    config::CHIP_NOISES.len() - 1,
                )];
                let damping = if noise.is_soft { 24.0 } else { 60.0 };
                (
                    noise.base_pitch as f64,
                    noise.base_pitch as f64,
                    damping,
                    noise.expression,
                )
            }
            InstrumentKind::Spectrum => {
                let base = if is_noise_channel {
                    config::SPECTRUM_BASE_PITCH as f64
                } else {
                    config::KEYS[song.key].base_pitch as f64
                        + (config::PITCHES_PER_OCTAVE * channel.octave) as f64
                };
                let expression = if is_noise_channel { 2.0 } else { 1.0 };
                (base, config::SPECTRUM_BASE_PITCH as f64, 28.0, expression)
            }
            InstrumentKind::Drumset => (
                config::SPECTRUM_BASE_PITCH as f64,
                config::SPECTRUM_BASE_PITCH as f64,
                48.0,
                1.0,
            ),
            InstrumentKind::Chip => (
                config::KEYS[song.key].base_pitch as f64
                    + (config::PITCHES_PER_OCTAVE * channel.octave) as f64,
                16.0,
                48.0,
                config::CHIP_WAVES[instrument.chip_wave.min(config::CHIP_WAVES.len() - 1)]
                    .expression,
            ),
            _ => (
                config::KEYS[song.key].base_pitch as f64
                    + (config::PITCHES_PER_OCTAVE * channel.octave) as f64,
                16.0,
                48.0,
                1.0,
            ),
        };

    // Chord handling: arpeggios collapse the chord onto one cycling pitch,
    // and custom intervals turn the extra pitches into a frequency ratio.
    let mut pitch = tone.first_pitch() as f64;
    tone.interval_mult = 1.0;
    tone.interval_expression_mult = 1.0;
    if chord.arpeggiates && tone.pitch_count > 1 {
        let rhythm = &config::RHYTHMS[song.rhythm.min(config::RHYTHMS.len() - 1)];
        let arpeggio = (ticks_into_bar as usize) / rhythm.ticks_per_arpeggio;
        if chord.custom_interval {
            let step = config::arpeggio_pitch_index(tone.pitch_count - 1, song.rhythm, arpeggio);
            let offset =
                tone.pitches[1 + step.min(tone.pitch_count - 2)] as f64 - tone.pitches[0] as f64;
            tone.interval_mult = 2.0_f64.powf(offset / 12.0);
            tone.interval_expression_mult = 2.0_f64.powf(-offset / pitch_damping);
        } else {
            let step = config::arpeggio_pitch_index(tone.pitch_count, song.rhythm, arpeggio);
            pitch = tone.pitches[step.min(tone.pitch_count - 1)] as f64;
        }
    }
    if instrument.kind == InstrumentKind::Drumset {
        tone.drumset_pitch = tone.first_pitch().min(config::DRUM_COUNT - 1);
        pitch = 0.0;
    }

    let start_pitch = base_pitch + (pitch + interval_start) * interval_scale;
    let end_pitch = base_pitch + (pitch + interval_end) * interval_scale;
    let start_freq = FrequencyHz::from_pitch(start_pitch).0;
    let pitch_volume_start =
        2.0_f64.powf(-(start_pitch - volume_reference_pitch) / pitch_damping);
    let pitch_volume_end = 2.0_f64.powf(-(end_pitch - volume_reference_pitch) / pitch_damping);

    let settings_expression = instrument.kind.base_expression()
        * kind_expression
        * config::instrument_volume_to_mult(instrument.volume);
    let chord_volume_start = chord_volume_for_size(chord_size_start, chord.arpeggiates);
    let chord_volume_end = chord_volume_for_size(chord_size_end, chord.arpeggiates);
    let mut expression_start = settings_expression
        * chord_volume_start
        * transition_volume_start
        * pitch_volume_start
        * env_start.note_volume
        * tone.interval_expression_mult;
    let mut expression_end = settings_expression
        * chord_volume_end
        * transition_volume_end
        * pitch_volume_end
        * env_end.note_volume
        * tone.interval_expression_mult;

    if instrument.kind == InstrumentKind::Drumset {
        let envelope_index = instrument
            .drumset_envelopes
            .get(tone.drumset_pitch)
            .copied()
            .unwrap_or(0)
            .min(config::ENVELOPES.len() - 1);
        let envelope = &config::ENVELOPES[envelope_index];
        expression_start *= compute_envelope(envelope, &instant_start);
        expression_end *= compute_envelope(envelope, &instant_end);
    }

    if reset_phases {
        tone.reset_phases();
    }

    tone.phase_delta_scale = 2.0_f64
        .powf(((interval_end - interval_start) * interval_scale / 12.0) / run_length as f64);

    match instrument.kind {
        InstrumentKind::Chip | InstrumentKind::Harmonics => {
            let unison = instrument.unison();
            tone.phase_deltas[0] =
                FrequencyHz::from_pitch(start_pitch + unison.offset + unison.spread).0
                    / sample_rate
                    * tone.interval_mult;
            tone.phase_deltas[1] =
                FrequencyHz::from_pitch(start_pitch + unison.offset - unison.spread).0
                    / sample_rate
                    * tone.interval_mult;
            expression_start *= unison.expression;
            expression_end *= unison.expression;
        }
        InstrumentKind::Pwm => {
            tone.phase_deltas[0] = start_freq / sample_rate;
            let width_start =
                config::pulse_width_ratio(instrument.pulse_width) * env_start.pulse_width;
            let width_end =
                config::pulse_width_ratio(instrument.pulse_width) * env_end.pulse_width;
            tone.pulse_width = width_start;
            tone.pulse_width_delta = (width_end - width_start) / run_length as f64;
        }
        InstrumentKind::Supersaw => {
            compute_supersaw(
                tone,
                instrument,
                start_freq,
                FrequencyHz::from_pitch(end_pitch).0,
                sample_rate,
                run_length,
                &env_start,
                &env_end,
            );
        }
        InstrumentKind::PickedString => {
            compute_string(tone, instrument, start_freq, sample_rate, &env_start, waves, rng);
        }
        InstrumentKind::Noise => {
            tone.phase_deltas[0] = 2.0_f64.powf((start_pitch - base_pitch) / 12.0);
            if reset_phases {
                tone.phases[0] = rng.rand_float() * config::CHIP_NOISE_LENGTH as f64;
            }
        }
        InstrumentKind::Spectrum => {
            tone.phase_deltas[0] = 2.0_f64.powf((start_pitch - base_pitch) / 12.0);
            if reset_phases {
                let wave = waves.spectrum(&instrument.spectrum_wave);
                tone.phases[0] = generators::find_random_zero_crossing(
                    wave,
                    config::SPECTRUM_NOISE_LENGTH,
                    rng,
                );
            }
        }
        InstrumentKind::Drumset => {
            tone.phase_deltas[0] = 2.0_f64.powf((start_pitch - base_pitch) / 12.0);
            if reset_phases {
                let design = instrument
                    .drumset_spectrum_waves
                    .get(tone.drumset_pitch)
                    .cloned()
                    .unwrap_or_default();
                let wave = waves.drumset(tone.drumset_pitch, &design);
                tone.phases[0] = generators::find_random_zero_crossing(
                    wave,
                    config::SPECTRUM_NOISE_LENGTH,
                    rng,
                );
            }
        }
        InstrumentKind::Fm => {
            compute_fm(
                tone,
                instrument,
                base_pitch,
                interval_start,
                interval_end,
                interval_scale,
                volume_reference_pitch,
                pitch_damping,
                sample_rate,
                run_length,
                settings_expression,
                chord_volume_start,
                chord_volume_end,
                transition_volume_start,
                transition_volume_end,
                &env_start,
                &env_end,
            );
        }
    }

    if instrument.kind != InstrumentKind::Fm {
        tone.expression_start = expression_start;
        tone.expression_delta = (expression_end - expression_start) / run_length as f64;
    }

    let points = &instrument.note_filter.points;
    tone.note_filter_count = points.len().min(config::FILTER_MAX_POINTS);
    for (index, point) in points.iter().take(config::FILTER_MAX_POINTS).enumerate() {
        let radians_start = point.hz() * env_start.note_filter_freq[index]
            * std::f64::consts::TAU
            / sample_rate;
        let radians_end =
            point.hz() * env_end.note_filter_freq[index] * std::f64::consts::TAU / sample_rate;
        let gain_start = point.linear_gain() * env_start.note_filter_gain[index];
        let gain_end = point.linear_gain() * env_end.note_filter_gain[index];
        let start = filter_point_coefficients(point.kind, radians_start, gain_start);
        let end = filter_point_coefficients(point.kind, radians_end, gain_end);
        tone.note_filters[index].load(start, end, run_length);
    }
}

/// Sets up the supersaw voice detunes, dynamism, and the pulse-shaping
/// delay for one run.
#[allow(clippy::too_many_arguments)]
fn compute_supersaw(
    tone: &mut Tone,
    instrument: &Instrument,
    start_freq: f64,
    end_freq: f64,
    sample_rate: f64,
    run_length: usize,
    env_start: &EnvelopeValues,
    env_end: &EnvelopeValues,
) {
    tone.phase_deltas[0] = start_freq / sample_rate;
    let spread = instrument.supersaw_spread as f64
        / (config::SUPERSAW_SPREAD_RANGE - 1) as f64
        * env_start.supersaw_spread;
    tone.supersaw_unison_detunes[0] = 0.0;
    for (voice, detune) in SUPERSAW_DETUNE_CURVE.iter().enumerate() {
        tone.supersaw_unison_detunes[voice + 1] = detune * spread;
    }
    let dynamism_start = instrument.supersaw_dynamism as f64
        / (config::SUPERSAW_DYNAMISM_RANGE - 1) as f64
        * env_start.supersaw_dynamism;
    let dynamism_end = instrument.supersaw_dynamism as f64
        / (config::SUPERSAW_DYNAMISM_RANGE - 1) as f64
        * env_end.supersaw_dynamism;
    tone.supersaw_dynamism = dynamism_start;
    tone.supersaw_dynamism_delta = (dynamism_end - dynamism_start) / run_length as f64;
    let shape_start = instrument.supersaw_shape as f64
        / (config::SUPERSAW_SHAPE_RANGE - 1) as f64
        * env_start.supersaw_shape;
    let shape_end = instrument.supersaw_shape as f64
        / (config::SUPERSAW_SHAPE_RANGE - 1) as f64
        * env_end.supersaw_shape;
    tone.supersaw_shape = shape_start;
    tone.supersaw_shape_delta = (shape_end - shape_start) / run_length as f64;

    // The shape morphs the stack toward a pulse by subtracting a copy
    // delayed by the pulse-width fraction of one period.
    let width_start = config::pulse_width_ratio(instrument.pulse_width) * env_start.pulse_width;
    let width_end = config::pulse_width_ratio(instrument.pulse_width) * env_end.pulse_width;
    let delay_start = (sample_rate / start_freq) * width_start;
    let delay_end = (sample_rate / end_freq.max(1e-3)) * width_end;
    tone.supersaw_delay_length = delay_start;
    tone.supersaw_delay_length_delta = (delay_end - delay_start) / run_length as f64;
    let needed = ((delay_start.max(delay_end) as usize) + 2)
        .next_power_of_two()
        .max(4);
    if tone.supersaw_delay_line.len() < needed {
        tone.supersaw_delay_line.resize(needed, 0.0);
    }
}

/// Sets up the picked string's delay loop for one run, plucking it at a
/// genuine attack by pre-filling the delay line with one cycle of the
/// harmonics wave.
fn compute_string(
    tone: &mut Tone,
    instrument: &Instrument,
    start_freq: f64,
    sample_rate: f64,
    env_start: &EnvelopeValues,
    waves: &mut RenderedWaves,
    rng: &mut Rng,
) {
    let delay_length = (sample_rate / start_freq.max(1.0) - 1.0).max(2.0);
    tone.string.delay_length = delay_length;

    let sustain = (instrument.string_sustain as f64 / (config::SUSTAIN_RANGE - 1) as f64
        * env_start.string_sustain)
        .clamp(0.0, 1.0);
    tone.string.sustain_gain = (0.86 + 0.13 * sustain).min(0.999);

    // The dispersion all-pass corner tracks the fundamental, pulled toward
    // a fixed center so low strings stiffen audibly and high ones do not
    // fold over.
    let corner = ((start_freq
        + (config::STRING_DISPERSION_CENTER_FREQ - start_freq)
            * config::STRING_DISPERSION_FREQ_SCALE)
        * config::STRING_DISPERSION_FREQ_MULT)
        .min(sample_rate * 0.45);
    let warped = (std::f64::consts::PI * corner / sample_rate).tan();
    tone.string.all_pass_coefficient = (warped - 1.0) / (warped + 1.0);
    let shelf_hz = config::STRING_SHELF_HZ.min(sample_rate * 0.45);
    tone.string.shelf_coefficient =
        1.0 - (-std::f64::consts::TAU * shelf_hz / sample_rate).exp();

    if tone.string.needs_excitation {
        let needed = ((delay_length as usize) + 8).next_power_of_two().max(32);
        if tone.string.delay_line.len() < needed {
            tone.string.delay_line.resize(needed, 0.0);
        }
        let wave = waves.harmonics(&instrument.harmonics_wave);
        let wave_length = (wave.len() - 1) as f64;
        let step = wave_length / delay_length;
        let integral_at = |phase: f64| -> f64 {
            let wrapped = phase.rem_euclid(wave_length);
            let index = wrapped as usize;
            let fraction = wrapped - index as f64;
            wave[index] as f64 + (wave[index + 1] as f64 - wave[index] as f64) * fraction
        };
        for index in 0..tone.string.delay_line.len() {
            let sample = if (index as f64) < delay_length {
                let phase = index as f64 * step;
                let derivative = (integral_at(phase + step) - integral_at(phase)) / step;
                derivative * (1.0 + config::STRING_EXCITATION_RANDOMNESS * rng.rand_bipolar())
            } else {
                0.0
            };
            tone.string.delay_line[index] = sample as f32;
        }
        tone.string.delay_index = 0;
        tone.string.needs_excitation = false;
    }
}

/// Sets up the four FM operators for one run: frequencies from the operator
/// table, amplitudes through the exponential curve, carrier detunes, and
/// the feedback amount, with the quiet-sine boost folded into the carrier
/// expressions.
#[allow(clippy::too_many_arguments)]
fn compute_fm(
    tone: &mut Tone,
    instrument: &Instrument,
    base_pitch: f64,
    interval_start: f64,
    interval_end: f64,
    interval_scale: f64,
    volume_reference_pitch: f64,
    pitch_damping: f64,
    sample_rate: f64,
    run_length: usize,
    settings_expression: f64,
    chord_volume_start: f64,
    chord_volume_end: f64,
    transition_volume_start: f64,
    transition_volume_end: f64,
    env_start: &EnvelopeValues,
    env_end: &EnvelopeValues,
) {
    let algorithm =
        &config::ALGORITHMS[instrument.algorithm.min(config::ALGORITHMS.len() - 1)];
    let sine_length = config::SINE_WAVE_LENGTH as f64;

    let mut amplitude_curves = [0.0; config::OPERATOR_COUNT];
    let mut total_carrier = 0.0;
    for (op, operator) in instrument.operators.iter().enumerate() {
        let curve = (16.0_f64
            .powf(operator.amplitude as f64 / config::OPERATOR_AMPLITUDE_MAX as f64)
            - 1.0)
            / 15.0;
        amplitude_curves[op] = curve;
        if op < algorithm.carrier_count {
            total_carrier += curve;
        }
    }
    let feedback_setting =
        instrument.feedback_amplitude as f64 / config::OPERATOR_AMPLITUDE_MAX as f64;
    // A lone quiet sine is disproportionately faint next to the other
    // kinds, so low-feedback, single-carrier patches get a boost.
    let boost = ((2.0_f64.powf(2.0 - 1.4 * feedback_setting) - 1.0) / 3.0)
        * (1.0 - ((total_carrier - 1.0).max(0.0) / 2.0).min(1.0));
    let master_start = settings_expression
        * chord_volume_start
        * transition_volume_start
        * env_start.note_volume
        * (1.0 + boost * 3.0);
    let master_end = settings_expression
        * chord_volume_end
        * transition_volume_end
        * env_end.note_volume
        * (1.0 + boost * 3.0);

    let use_associated_pitch = tone.pitch_count > 1 && instrument.chord().custom_interval;
    for op in 0..config::OPERATOR_COUNT {
        let operator = &instrument.operators[op];
        let frequency = &config::OPERATOR_FREQUENCIES
            [operator.frequency.min(config::OPERATOR_FREQUENCIES.len() - 1)];
        let is_carrier = op < algorithm.carrier_count;
        let associated = algorithm.associated_carrier[op] - 1;
        let pitch_index = if use_associated_pitch {
            associated.min(tone.pitch_count - 1)
        } else {
            0
        };
        let op_pitch = tone.pitches[pitch_index] as f64;
        let carrier_detune = if is_carrier {
            config::OPERATOR_CARRIER_INTERVAL[associated]
        } else {
            0.0
        };
        let op_start_pitch =
            base_pitch + (op_pitch + interval_start) * interval_scale + carrier_detune;
        let op_end_pitch =
            base_pitch + (op_pitch + interval_end) * interval_scale + carrier_detune;
        let op_start_freq =
            frequency.mult * FrequencyHz::from_pitch(op_start_pitch).0 + frequency.hz_offset;
        tone.phase_deltas[op] =
            op_start_freq * env_start.operator_frequency[op] / sample_rate;

        let amplitude = amplitude_curves[op] * frequency.amplitude_sign;
        let (start, end) = if is_carrier {
            let pitch_volume_start = 2.0_f64
                .powf(-(op_start_pitch - volume_reference_pitch) / pitch_damping);
            let pitch_volume_end =
                2.0_f64.powf(-(op_end_pitch - volume_reference_pitch) / pitch_damping);
            (
                master_start * amplitude * pitch_volume_start * env_start.operator_amplitude[op],
                master_end * amplitude * pitch_volume_end * env_end.operator_amplitude[op],
            )
        } else {
            // Modulator output is measured in sine-table phase units.
            (
                amplitude * sine_length * 1.5 * env_start.operator_amplitude[op],
                amplitude * sine_length * 1.5 * env_end.operator_amplitude[op],
            )
        };
        tone.expression_starts[op] = start;
        tone.expression_deltas[op] = (end - start) / run_length as f64;
    }
    tone.feedback_mult = sine_length * 0.3 * feedback_setting;
    tone.feedback_delta = 0.0;
    tone.expression_start = 0.0;
    tone.expression_delta = 0.0;
}

/// Dispatches one tone to its kind's signal generator.
fn render_tone(
    tone: &mut Tone,
    instrument: &Instrument,
    waves: &mut RenderedWaves,
    buffer: &mut [f64],
) {
    match instrument.kind {
        InstrumentKind::Chip => {
            let wave =
                &config::CHIP_WAVES[instrument.chip_wave.min(config::CHIP_WAVES.len() - 1)];
            generators::render_wavetable(
                tone,
                &wave.samples,
                instrument.unison().sign,
                buffer,
            );
        }
        InstrumentKind::Harmonics => {
            let sign = instrument.unison().sign;
            let wave = waves.harmonics(&instrument.harmonics_wave);
            generators::render_wavetable(tone, wave, sign, buffer);
        }
        InstrumentKind::Fm => {
            let algorithm =
                &config::ALGORITHMS[instrument.algorithm.min(config::ALGORITHMS.len() - 1)];
            let feedback =
                &config::FEEDBACKS[instrument.feedback_type.min(config::FEEDBACKS.len() - 1)];
            generators::render_fm(tone, algorithm, feedback, buffer);
        }
        InstrumentKind::Noise => {
            let index = instrument.chip_noise.min(config::CHIP_NOISES.len() - 1);
            generators::render_noise(
                tone,
                config::chip_noise_samples(index),
                config::CHIP_NOISES[index].pitch_filter_mult,
                buffer,
            );
        }
        InstrumentKind::Spectrum => {
            let wave = waves.spectrum(&instrument.spectrum_wave);
            generators::render_spectrum(tone, wave, true, buffer);
        }
        InstrumentKind::Drumset => {
            let drum = tone.drumset_pitch;
            let design = instrument
                .drumset_spectrum_waves
                .get(drum)
                .cloned()
                .unwrap_or_default();
            let wave = waves.drumset(drum, &design);
            generators::render_spectrum(tone, wave, false, buffer);
        }
        InstrumentKind::Pwm => {
            generators::render_pwm(tone, buffer);
        }
        InstrumentKind::Supersaw => {
            generators::render_supersaw(tone, buffer);
        }
        InstrumentKind::PickedString => {
            let sustain_gain = tone.string.sustain_gain;
            let shelf_coefficient = tone.string.shelf_coefficient;
            let all_pass_coefficient = tone.string.all_pass_coefficient;
            generators::render_string(
                tone,
                sustain_gain,
                shelf_coefficient,
                all_pass_coefficient,
                buffer,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{Note, PatternBuilder};
    use float_cmp::approx_eq;
    use more_asserts::{assert_gt, assert_lt};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn song_with_note(channel_index: usize, pitches: Vec<usize>) -> Song {
        init_logging();
        let mut song = Song::default();
        song.channels[channel_index].patterns[0] = PatternBuilder::default()
            .note(Note::new(pitches, 0, 48))
            .build()
            .unwrap();
        song.channels[channel_index].bars[0] = 1;
        song
    }

    fn render(synth: &mut Synth, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        synth.synthesize(&mut left, &mut right);
        (left, right)
    }

    fn peak(buffer: &[f32]) -> f32 {
        buffer.iter().fold(0.0, |acc, s| acc.max(s.abs()))
    }

    #[test]
    fn samples_per_tick_follows_tempo() {
        let synth = Synth::default();
        // 150 BPM is 2.5 beats per second; 48 ticks per beat.
        assert_eq!(synth.samples_per_tick(), (44100.0 / (2.5 * 48.0)) as usize);
    }

    #[test]
    fn silent_song_renders_silence() {
        let mut synth = Synth::default();
        synth.play();
        let (left, right) = render(&mut synth, 2048);
        assert!(left.iter().all(|s| *s == 0.0));
        assert!(right.iter().all(|s| *s == 0.0));
        assert!(synth.is_playing());
    }

    #[test]
    fn note_produces_audio_and_empty_bars_do_not() {
        let mut synth = Synth::default();
        synth.set_song(song_with_note(0, vec![24]));
        synth.play();
        let (left, _) = render(&mut synth, 4096);
        assert_gt!(peak(&left), 0.0);

        // The second bar of every channel is empty, and go_to_bar flushes
        // effect tails.
        synth.go_to_bar(1);
        synth.play();
        let (left, _) = render(&mut synth, 4096);
        assert_eq!(peak(&left), 0.0);
    }

    #[test]
    fn rendering_is_deterministic_for_noise_too() {
        let song = song_with_note(3, vec![4]);
        let mut first = Synth::default();
        first.set_song(song.clone());
        first.play();
        let (left_a, right_a) = render(&mut first, 4096);

        let mut second = Synth::default();
        second.set_song(song);
        second.play();
        let (left_b, right_b) = render(&mut second, 4096);
        assert_eq!(left_a, left_b);
        assert_eq!(right_a, right_b);
    }

    #[test]
    fn every_kind_renders_audio() {
        for (channel_index, kind) in [
            (0, InstrumentKind::Chip),
            (0, InstrumentKind::Fm),
            (0, InstrumentKind::Harmonics),
            (0, InstrumentKind::Pwm),
            (0, InstrumentKind::PickedString),
            (0, InstrumentKind::Supersaw),
            (3, InstrumentKind::Noise),
            (3, InstrumentKind::Spectrum),
            (3, InstrumentKind::Drumset),
        ] {
            let mut song = song_with_note(channel_index, vec![6]);
            let is_noise = song.is_noise_channel(channel_index);
            song.channels[channel_index].instruments[0].kind = kind;
            song.channels[channel_index].instruments[0].reset_for_kind(is_noise);
            let mut synth = Synth::default();
            synth.set_song(song);
            synth.play();
            let (left, _) = render(&mut synth, 4096);
            assert_gt!(peak(&left), 0.0, "{kind} was silent");
        }
    }

    #[test]
    fn playhead_round_trips() {
        let mut synth = Synth::default();
        synth.set_playhead(2.375);
        assert!(approx_eq!(f64, synth.playhead(), 2.375));
        synth.snap_to_start();
        assert_eq!(synth.playhead(), 0.0);
        synth.go_to_bar(5);
        assert_eq!(synth.playhead(), 5.0);
    }

    #[test]
    fn bar_skips_move_the_playhead() {
        let mut synth = Synth::default();
        synth.next_bar();
        assert_eq!(synth.playhead(), 1.0);
        synth.prev_bar();
        assert_eq!(synth.playhead(), 0.0);
        synth.prev_bar();
        assert_eq!(synth.playhead(), 15.0);
    }

    #[test]
    fn playhead_advances_while_playing() {
        let mut synth = Synth::default();
        synth.set_song(song_with_note(0, vec![24]));
        synth.play();
        let before = synth.playhead();
        render(&mut synth, 8192);
        let after = synth.playhead();
        assert_gt!(after, before);
        assert_lt!(after, 1.0);
    }

    #[test]
    fn playback_stops_at_the_end_without_looping() {
        let mut song = song_with_note(0, vec![24]);
        song.bar_count = 1;
        song.loop_length = 1;
        song.conform();
        let mut synth = Synth::default();
        synth.set_song(song);
        synth.set_loop_repeat_count(0);
        synth.play();
        let frames = synth.samples_per_bar() + 4096;
        render(&mut synth, frames);
        assert!(!synth.is_playing());
    }

    #[test]
    fn looping_keeps_playing_past_the_loop_boundary() {
        let mut song = song_with_note(0, vec![24]);
        song.bar_count = 1;
        song.loop_length = 1;
        song.conform();
        let mut synth = Synth::default();
        synth.set_song(song);
        synth.play();
        let frames = synth.samples_per_bar() + 4096;
        render(&mut synth, frames);
        assert!(synth.is_playing());
        assert_lt!(synth.playhead(), 1.0);
    }

    #[test]
    fn pause_silences_and_resets() {
        let mut synth = Synth::default();
        synth.set_song(song_with_note(0, vec![24]));
        synth.play();
        render(&mut synth, 4096);
        synth.pause();
        let (left, right) = render(&mut synth, 4096);
        assert_eq!(peak(&left), 0.0);
        assert_eq!(peak(&right), 0.0);
        assert!(!synth.is_playing());
    }

    #[test]
    fn live_input_sounds_without_notes_and_fades_after_release() {
        let mut synth = Synth::default();
        synth.play();
        synth.press_live_input(0, &[24, 28]);
        let (held, _) = render(&mut synth, 4096);
        assert_gt!(peak(&held), 0.0);

        synth.release_live_input();
        // Long enough for the release fade and the reverb tail to drain.
        let mut last_peak = f32::MAX;
        for _ in 0..32 {
            let (buffer, _) = render(&mut synth, 4096);
            last_peak = peak(&buffer);
        }
        assert_eq!(last_peak, 0.0);
    }

    #[test]
    fn live_input_rechords_deterministically() {
        let mut synth = Synth::default();
        synth.play();
        synth.press_live_input(0, &[24]);
        render(&mut synth, 1024);
        // Holding the old pitch while adding one keeps the existing tone.
        synth.press_live_input(0, &[24, 31]);
        render(&mut synth, 1024);
        let runtime = &synth.channel_states[0].instruments[0];
        assert_eq!(runtime.live_tones.len(), 2);
        assert_eq!(runtime.live_tones.front().unwrap().first_pitch(), 24);
    }

    #[test]
    fn chords_spread_across_tones_and_arpeggios_share_one() {
        let mut song = song_with_note(0, vec![24, 28, 31]);
        song.channels[0].instruments[0].chord = 0;
        let mut synth = Synth::default();
        synth.set_song(song);
        synth.play();
        render(&mut synth, 1024);
        assert_eq!(synth.channel_states[0].instruments[0].active_tones.len(), 3);

        let mut song = song_with_note(0, vec![24, 28, 31]);
        song.channels[0].instruments[0].chord = 2;
        let mut synth = Synth::default();
        synth.set_song(song);
        synth.play();
        render(&mut synth, 1024);
        assert_eq!(synth.channel_states[0].instruments[0].active_tones.len(), 1);
        assert_eq!(
            synth.channel_states[0].instruments[0]
                .active_tones
                .front()
                .unwrap()
                .pitch_count,
            3
        );
    }

    #[test]
    fn releasing_transition_leaves_a_tail() {
        let mut song = Song::default();
        song.channels[0].patterns[0] = PatternBuilder::default()
            .note(Note::new(vec![24], 0, 12))
            .build()
            .unwrap();
        song.channels[0].bars[0] = 1;
        // "hard fade" sustains released tones for 48 ticks.
        song.channels[0].instruments[0].transition = 5;
        let mut synth = Synth::default();
        synth.set_song(song);
        synth.play();
        let samples_per_part = synth.samples_per_tick() * config::TICKS_PER_PART;
        // Render through the note and a little past its end.
        render(&mut synth, samples_per_part * 13);
        let runtime = &synth.channel_states[0].instruments[0];
        assert_eq!(runtime.active_tones.len(), 0);
        assert_eq!(runtime.released_tones.len(), 1);
    }

    #[test]
    fn tones_return_to_the_pool() {
        let mut synth = Synth::default();
        synth.set_song(song_with_note(0, vec![24, 28, 31]));
        synth.play();
        render(&mut synth, 1024);
        synth.pause();
        assert_eq!(synth.channel_states[0].instruments[0].active_tones.len(), 0);
        assert_gt!(synth.tone_pool.len(), 0);
    }

    #[test]
    fn interpolate_pins_follows_the_shape() {
        let mut note = Note::new(vec![24], 0, 24);
        note.pins[1].interval = 12;
        note.pins[1].size = 0;
        let (interval, size) = interpolate_pins(&note, 24.0);
        assert!(approx_eq!(f64, interval, 6.0));
        assert!(approx_eq!(f64, size, 1.5));
        let (interval, size) = interpolate_pins(&note, 0.0);
        assert!(approx_eq!(f64, interval, 0.0));
        assert!(approx_eq!(f64, size, 3.0));
    }
}
