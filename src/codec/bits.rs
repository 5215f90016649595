// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Bit-level plumbing for the compact song format.
//!
//! Song strings use a URL-safe base64 alphabet where each character carries
//! six bits. Structured payloads (bar maps, note shapes) are written as raw
//! bit streams and then chunked into characters. Unbounded values use a
//! "long tail" code: a unary run of continuation bits selects a suffix
//! width, so statistically common small values (short rests, small pitch
//! steps) stay short.

/// The base64 alphabet, in value order. Digits first keeps version
/// prefixes readable.
pub const BASE64_CHARS: &[u8; 64] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-_";

/// The value of a base64 character, or None if it is not in the alphabet.
pub fn base64_value(char: u8) -> Option<u32> {
    match char {
        b'0'..=b'9' => Some((char - b'0') as u32),
        b'a'..=b'z' => Some((char - b'a') as u32 + 10),
        b'A'..=b'Z' => Some((char - b'A') as u32 + 36),
        b'-' => Some(62),
        b'_' => Some(63),
        _ => None,
    }
}

/// Accumulates a bit stream most-significant-bit first.
#[derive(Debug, Default)]
pub struct BitWriter {
    bits: Vec<bool>,
}
impl BitWriter {
    /// Appends the low `bit_count` bits of `value`.
    pub fn write(&mut self, bit_count: u32, value: u32) {
        for shift in (0..bit_count).rev() {
            self.bits.push((value >> shift) & 1 != 0);
        }
    }

    /// Appends `value` in the long-tail code based at `min_value` with an
    /// initial suffix width of `min_bits`.
    pub fn write_long_tail(&mut self, min_value: u32, min_bits: u32, value: u32) {
        debug_assert!(value >= min_value, "long-tail value below its base");
        let mut remaining = value - min_value;
        let mut num_bits = min_bits;
        while remaining >= (1 << num_bits) {
            self.bits.push(true);
            remaining -= 1 << num_bits;
            num_bits += 1;
        }
        self.bits.push(false);
        for shift in (0..num_bits).rev() {
            self.bits.push((remaining >> shift) & 1 != 0);
        }
    }

    /// Appends a duration in parts, at least 1.
    pub fn write_part_duration(&mut self, value: u32) {
        self.write_long_tail(1, 3, value);
    }

    /// Appends a note's pin count, at least 1.
    pub fn write_pin_count(&mut self, value: u32) {
        self.write_long_tail(1, 0, value);
    }

    /// Appends a signed pitch interval.
    pub fn write_pitch_interval(&mut self, value: i32) {
        if value < 0 {
            self.write(1, 1);
            self.write_long_tail(1, 3, (-value) as u32);
        } else {
            self.write(1, 0);
            self.write_long_tail(1, 3, value as u32);
        }
    }

    /// Appends all of `other`'s bits.
    pub fn concat(&mut self, other: &BitWriter) {
        self.bits.extend_from_slice(&other.bits);
    }

    /// The number of base64 characters this stream occupies.
    pub fn base64_len(&self) -> usize {
        self.bits.len().div_ceil(6)
    }

    /// Chunks the bits into base64 characters appended to `buffer`. The
    /// final character is zero-padded.
    pub fn encode_base64(&self, buffer: &mut Vec<u8>) {
        for chunk in self.bits.chunks(6) {
            let mut value = 0usize;
            for (position, &bit) in chunk.iter().enumerate() {
                if bit {
                    value |= 1 << (5 - position);
                }
            }
            buffer.push(BASE64_CHARS[value]);
        }
    }

    /// The encoded characters as a standalone buffer, used for comparing
    /// recently-seen note shapes.
    pub fn to_base64(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.base64_len());
        self.encode_base64(&mut buffer);
        buffer
    }
}

/// Reads a bit stream previously chunked into base64 characters. Reads
/// past the end return zero bits, which decodes truncated strings into
/// silence instead of panicking.
#[derive(Debug)]
pub struct BitReader {
    bits: Vec<bool>,
    read_index: usize,
}
impl BitReader {
    /// Unpacks the characters in `source[start..stop]`. Characters outside
    /// the alphabet contribute zero bits.
    pub fn new(source: &[u8], start: usize, stop: usize) -> Self {
        let mut bits = Vec::with_capacity((stop - start) * 6);
        for &char in source.get(start..stop.min(source.len())).unwrap_or(&[]) {
            let value = base64_value(char).unwrap_or(0);
            for shift in (0..6).rev() {
                bits.push((value >> shift) & 1 != 0);
            }
        }
        Self {
            bits,
            read_index: 0,
        }
    }

    fn next_bit(&mut self) -> bool {
        let bit = self.bits.get(self.read_index).copied().unwrap_or(false);
        self.read_index += 1;
        bit
    }

    /// Whether all bits have been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.read_index >= self.bits.len()
    }

    /// Reads `bit_count` bits as an unsigned value.
    pub fn read(&mut self, bit_count: u32) -> u32 {
        let mut result = 0;
        for _ in 0..bit_count {
            result = (result << 1) | self.next_bit() as u32;
        }
        result
    }

    /// Reads a long-tail value based at `min_value` with an initial suffix
    /// width of `min_bits`.
    pub fn read_long_tail(&mut self, min_value: u32, min_bits: u32) -> u32 {
        let mut result = min_value;
        let mut num_bits = min_bits;
        while self.next_bit() {
            result += 1 << num_bits;
            num_bits += 1;
            if num_bits >= 32 {
                break;
            }
        }
        for shift in (0..num_bits).rev() {
            if self.next_bit() {
                result += 1 << shift;
            }
        }
        result
    }

    /// Reads a duration in parts.
    pub fn read_part_duration(&mut self) -> u32 {
        self.read_long_tail(1, 3)
    }

    /// Reads a duration in the narrower code older songs used.
    pub fn read_legacy_part_duration(&mut self) -> u32 {
        self.read_long_tail(1, 2)
    }

    /// Reads a note's pin count.
    pub fn read_pin_count(&mut self) -> u32 {
        self.read_long_tail(1, 0)
    }

    /// Reads a signed pitch interval.
    pub fn read_pitch_interval(&mut self) -> i32 {
        if self.read(1) != 0 {
            -(self.read_long_tail(1, 3) as i32)
        } else {
            self.read_long_tail(1, 3) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(writer: &BitWriter) -> BitReader {
        let chars = writer.to_base64();
        BitReader::new(&chars, 0, chars.len())
    }

    #[test]
    fn alphabet_is_a_bijection() {
        for (value, &char) in BASE64_CHARS.iter().enumerate() {
            assert_eq!(base64_value(char), Some(value as u32));
        }
        assert_eq!(base64_value(b'!'), None);
        assert_eq!(base64_value(b'+'), None);
    }

    #[test]
    fn fixed_width_fields() {
        let mut writer = BitWriter::default();
        writer.write(3, 5);
        writer.write(1, 0);
        writer.write(7, 100);
        let mut reader = round_trip(&writer);
        assert_eq!(reader.read(3), 5);
        assert_eq!(reader.read(1), 0);
        assert_eq!(reader.read(7), 100);
    }

    #[test]
    fn long_tail_values() {
        // Cover the boundary where the unary prefix grows.
        for value in [1u32, 2, 7, 8, 9, 24, 25, 100, 5000] {
            let mut writer = BitWriter::default();
            writer.write_part_duration(value);
            let mut reader = round_trip(&writer);
            assert_eq!(reader.read_part_duration(), value, "value {value}");
        }
        for value in [1u32, 2, 3, 10] {
            let mut writer = BitWriter::default();
            writer.write_pin_count(value);
            let mut reader = round_trip(&writer);
            assert_eq!(reader.read_pin_count(), value);
        }
    }

    #[test]
    fn small_values_encode_short() {
        // The whole point of the long tail: a one-part rest costs far
        // fewer bits than a huge one.
        let mut short = BitWriter::default();
        short.write_part_duration(1);
        let mut long = BitWriter::default();
        long.write_part_duration(4096);
        assert!(short.base64_len() <= 1);
        assert!(long.base64_len() > short.base64_len());
    }

    #[test]
    fn pitch_intervals_are_signed() {
        // Zero is unrepresentable: the long tail's base is 1, and the
        // encoder never needs it because the previous pitch is always in
        // the recent-pitch list.
        for value in [-50i32, -8, -1, 1, 7, 8, 63] {
            let mut writer = BitWriter::default();
            writer.write_pitch_interval(value);
            let mut reader = round_trip(&writer);
            assert_eq!(reader.read_pitch_interval(), value, "value {value}");
        }
    }

    #[test]
    fn reading_past_the_end_yields_zero() {
        let mut reader = BitReader::new(b"0", 0, 1);
        assert_eq!(reader.read(6), 0);
        assert_eq!(reader.read(32), 0);
        assert!(reader.is_exhausted());
    }
}
