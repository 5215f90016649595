// Copyright (c) 2023 Mike Tsao. All rights reserved.

#![warn(missing_docs)]

//! The `picosong` crate renders a structured chiptune composition ("song")
//! into an audio sample stream, and round-trips that composition through a
//! compact printable string.
//!
//! The crate has two halves:
//!
//! - The composition model and codec: [song], [codec]. A [Song](song::Song)
//!   holds channels, patterns, notes, and instruments. The codec serializes
//!   it to a short base64 tag string (with multi-version legacy migration)
//!   or a JSON tree.
//! - The synthesis engine: [synth]. A [Synth](synth::Synth) owns the
//!   transport clock, schedules notes into runtime voices ("tones"), runs
//!   one signal generator per instrument algorithm, applies a per-instrument
//!   effects chain, and mixes into a stereo output buffer.
//!
//! Rendering is single-threaded and allocation-free at steady state: tones
//! and delay buffers are pooled and reused.

pub mod codec;
pub mod config;
pub mod song;
pub mod synth;
pub mod types;
pub mod util;

/// The most commonly used imports.
pub mod prelude {
    pub use crate::codec::{decode_song, encode_song, DecodeError};
    pub use crate::song::{
        Channel, Instrument, InstrumentKind, Note, NotePin, Pattern, PatternBuilder, Song,
        SongBuilder,
    };
    pub use crate::synth::Synth;
    pub use crate::types::{FrequencyHz, SampleRate, Tempo};
}
