// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Common numeric newtypes used throughout the crate.

use derivative::Derivative;
use derive_more::{Add, Display, Sub};
use serde::{Deserialize, Serialize};

use crate::config;

/// Samples per second. The audio host picks this; everything downstream is
/// derived from it.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SampleRate(pub usize);
impl SampleRate {
    /// The default sample rate, a CD-quality 44.1kHz.
    pub const DEFAULT_SAMPLE_RATE: usize = 44100;
    /// The default [SampleRate].
    pub const DEFAULT: SampleRate = SampleRate(Self::DEFAULT_SAMPLE_RATE);

    /// Constructs a new [SampleRate]. Zero is nonsense, so it is replaced
    /// with the default rate.
    pub fn new(value: usize) -> Self {
        if value == 0 {
            Self::DEFAULT
        } else {
            Self(value)
        }
    }
}
impl Default for SampleRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}
impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0 as f64
    }
}
impl From<usize> for SampleRate {
    fn from(value: usize) -> Self {
        Self::new(value)
    }
}

/// Beats per minute.
#[derive(
    Clone, Copy, Debug, Derivative, Display, PartialEq, PartialOrd, Add, Sub, Serialize,
    Deserialize,
)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case")]
pub struct Tempo(#[derivative(Default(value = "150.0"))] pub f64);
impl Tempo {
    /// Constructs a [Tempo], clamped into the supported range.
    pub fn new(value: f64) -> Self {
        Self(value.clamp(config::TEMPO_MIN as f64, config::TEMPO_MAX as f64))
    }

    /// Beats per second.
    pub fn bps(&self) -> f64 {
        self.0 / 60.0
    }
}
impl From<f64> for Tempo {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

/// A frequency measured in Hertz.
#[derive(
    Clone, Copy, Debug, Derivative, Display, PartialEq, PartialOrd, Add, Sub, Serialize,
    Deserialize,
)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case")]
pub struct FrequencyHz(#[derivative(Default(value = "440.0"))] pub f64);
impl FrequencyHz {
    /// The frequency of the given pitch, where pitch 0 is MIDI key 0
    /// (C-1 at 8.176Hz in the MIDI convention this crate uses).
    pub fn from_pitch(pitch: f64) -> Self {
        Self(440.0 * 2.0_f64.powf((pitch - 69.0) / 12.0))
    }
}
impl From<f64> for FrequencyHz {
    fn from(value: f64) -> Self {
        Self(value)
    }
}
impl From<FrequencyHz> for f64 {
    fn from(value: FrequencyHz) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn sample_rate_zero_is_replaced() {
        assert_eq!(SampleRate::new(0), SampleRate::DEFAULT);
        assert_eq!(SampleRate::new(22050).0, 22050);
    }

    #[test]
    fn tempo_clamps() {
        assert_eq!(Tempo::new(1.0).0, config::TEMPO_MIN as f64);
        assert_eq!(Tempo::new(1000.0).0, config::TEMPO_MAX as f64);
        assert_eq!(Tempo::new(120.0).0, 120.0);
    }

    #[test]
    fn pitch_frequency() {
        assert!(approx_eq!(f64, FrequencyHz::from_pitch(69.0).0, 440.0));
        assert!(approx_eq!(f64, FrequencyHz::from_pitch(57.0).0, 220.0));
    }
}
