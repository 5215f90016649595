// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! The JSON form of a song: a nested object tree mirroring the composition
//! model, for interchange with tools that would rather not speak the
//! compact string format.

use crate::song::Song;

use super::DecodeError;

/// Serializes a song as pretty-printed JSON. Lossless: every model field
/// appears in the tree.
pub fn song_to_json(song: &Song) -> Result<String, DecodeError> {
    Ok(serde_json::to_string_pretty(song)?)
}

/// Parses a song from its JSON form, then clamps it into a playable state
/// the same way the string decoder does.
pub fn song_from_json(json: &str) -> Result<Song, DecodeError> {
    let mut song: Song = serde_json::from_str(json)?;
    song.conform();
    Ok(song)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{InstrumentKind, Note};

    #[test]
    fn json_round_trips_losslessly() {
        let mut song = Song::default();
        song.title = "night market".into();
        song.channels[0].instruments[0].kind = InstrumentKind::Harmonics;
        song.channels[0].instruments[0].reset_for_kind(false);
        song.channels[0].patterns[0].notes = vec![Note::new(vec![36, 40], 0, 48)];
        song.channels[0].bars[0] = 1;
        let json = song_to_json(&song).unwrap();
        assert_eq!(song_from_json(&json).unwrap(), song);
    }

    #[test]
    fn json_field_names_are_kebab_case() {
        let json = song_to_json(&Song::default()).unwrap();
        assert!(json.contains("\"beats-per-bar\""));
        assert!(json.contains("\"patterns-per-channel\""));
        assert!(!json.contains("\"beatsPerBar\""));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            song_from_json("{\"title\": }"),
            Err(DecodeError::Json(_))
        ));
    }
}
