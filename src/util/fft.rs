// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! An in-place inverse FFT over real-valued spectra, used to turn
//! spectrum-designed wavetables (harmonics, spectrum, "hollow" noise) into
//! time-domain samples.
//!
//! The input format is space-efficient: elements `0..=N/2` are cosine-wave
//! amplitudes in ascending frequency, and elements `N/2+1..N` are sine-wave
//! amplitudes in descending frequency. The transform overwrites the input
//! with real time-domain samples.

/// Multiplies every element by `factor`. A forward-then-inverse transform
/// scales the signal by N; this compensates.
pub fn scale_elements_by_factor(array: &mut [f32], factor: f32) {
    for sample in array.iter_mut() {
        *sample *= factor;
    }
}

fn count_bits(n: usize) -> u32 {
    debug_assert!(n.is_power_of_two(), "FFT length must be a power of 2");
    n.trailing_zeros()
}

// Swaps each element with the one at the bit-reversed index.
fn reverse_index_bits(array: &mut [f32]) {
    let full_array_length = array.len();
    let bit_count = count_bits(full_array_length);
    debug_assert!(bit_count <= 16, "FFT length must not exceed 2^16");
    let final_shift = 16 - bit_count;
    for i in 0..full_array_length {
        let mut j = ((i & 0xaaaa) >> 1) | ((i & 0x5555) << 1);
        j = ((j & 0xcccc) >> 2) | ((j & 0x3333) << 2);
        j = ((j & 0xf0f0) >> 4) | ((j & 0x0f0f) << 4);
        j = ((j >> 8) | ((j & 0xff) << 8)) >> final_shift;
        if j > i {
            array.swap(i, j);
        }
    }
}

/// Computes the inverse Fourier transform of a real-formatted spectrum (see
/// module docs), in place, in O(N log N).
pub fn inverse_real_fourier_transform(array: &mut [f32]) {
    let full_array_length = array.len();
    let total_passes = count_bits(full_array_length);
    debug_assert!(full_array_length >= 4, "FFT length must be at least 4");

    // All but the last two passes, in reverse.
    for pass in (2..total_passes).rev() {
        let sub_stride = 1usize << pass;
        let mid_sub_stride = sub_stride >> 1;
        let stride = sub_stride << 1;
        let radians_increment = std::f64::consts::TAU / stride as f64;
        let cos_increment = radians_increment.cos();
        let sin_increment = radians_increment.sin();
        let oscillator_multiplier = 2.0 * cos_increment;

        let mut start_index = 0;
        while start_index < full_array_length {
            let start_index_a = start_index;
            let mid_index_a = start_index_a + mid_sub_stride;
            let start_index_b = start_index_a + sub_stride;
            let mid_index_b = start_index_b + mid_sub_stride;
            let stop_index = start_index_b + sub_stride;
            let real_start_a = array[start_index_a];
            let imag_start_b = array[start_index_b];
            array[start_index_a] = real_start_a + imag_start_b;
            array[mid_index_a] *= 2.0;
            array[start_index_b] = real_start_a - imag_start_b;
            array[mid_index_b] *= 2.0;
            let mut c = cos_increment;
            let mut s = -sin_increment;
            let mut c_prev = 1.0;
            let mut s_prev = 0.0;
            for index in 1..mid_sub_stride {
                let index_a0 = start_index_a + index;
                let index_a1 = start_index_b - index;
                let index_b0 = start_index_b + index;
                let index_b1 = stop_index - index;
                let real0 = array[index_a0] as f64;
                let real1 = array[index_a1] as f64;
                let imag0 = array[index_b0] as f64;
                let imag1 = array[index_b1] as f64;
                let temp_a = real0 - real1;
                let temp_b = imag0 + imag1;
                array[index_a0] = (real0 + real1) as f32;
                array[index_a1] = (imag1 - imag0) as f32;
                array[index_b0] = (temp_a * c - temp_b * s) as f32;
                array[index_b1] = (temp_b * c + temp_a * s) as f32;
                let c_temp = oscillator_multiplier * c - c_prev;
                let s_temp = oscillator_multiplier * s - s_prev;
                c_prev = c;
                s_prev = s;
                c = c_temp;
                s = s_temp;
            }
            start_index += stride;
        }
    }

    // The final passes with strides 4 and 2, combined into one loop.
    let mut index = 0;
    while index < full_array_length {
        let real0 = array[index];
        let real1 = array[index + 1] * 2.0;
        let imag2 = array[index + 2];
        let imag3 = array[index + 3] * 2.0;
        let temp_a = real0 + imag2;
        let temp_b = real0 - imag2;
        array[index] = temp_a + real1;
        array[index + 1] = temp_a - real1;
        array[index + 2] = temp_b + imag3;
        array[index + 3] = temp_b - imag3;
        index += 4;
    }

    reverse_index_bits(array);
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    // Projects the signal onto cos/sin at the given bin. A pure tone shows
    // all its energy in one of the two projections.
    fn project(array: &[f32], bin: usize) -> (f64, f64) {
        let n = array.len() as f64;
        let mut cos_sum = 0.0;
        let mut sin_sum = 0.0;
        for (i, &sample) in array.iter().enumerate() {
            let radians = std::f64::consts::TAU * bin as f64 * i as f64 / n;
            cos_sum += sample as f64 * radians.cos();
            sin_sum += sample as f64 * radians.sin();
        }
        (cos_sum * 2.0 / n, sin_sum * 2.0 / n)
    }

    #[test]
    fn single_cosine_partial() {
        // A lone amplitude in the ascending (cosine) half should produce one
        // pure sinusoid at that bin and nothing anywhere else.
        const N: usize = 16;
        let mut array = [0.0f32; N];
        array[1] = 1.0;
        inverse_real_fourier_transform(&mut array);
        let (cos_amp, sin_amp) = project(&array, 1);
        assert!(approx_eq!(f64, cos_amp.abs() + sin_amp.abs(), 2.0, epsilon = 1e-4));
        for bin in 2..N / 2 {
            let (c, s) = project(&array, bin);
            assert!(c.abs() < 1e-4 && s.abs() < 1e-4, "leakage at bin {bin}");
        }
    }

    #[test]
    fn single_sine_partial() {
        // A lone amplitude in the descending (sine) half should also produce
        // one pure sinusoid, in quadrature with the cosine case.
        const N: usize = 16;
        let mut cosine_array = [0.0f32; N];
        cosine_array[1] = 1.0;
        inverse_real_fourier_transform(&mut cosine_array);
        let mut sine_array = [0.0f32; N];
        sine_array[N - 1] = 1.0;
        inverse_real_fourier_transform(&mut sine_array);
        let (c0, s0) = project(&cosine_array, 1);
        let (c1, s1) = project(&sine_array, 1);
        // Orthogonal phases, equal magnitude.
        assert!(approx_eq!(f64, c0 * c1 + s0 * s1, 0.0, epsilon = 1e-4));
        assert!(approx_eq!(
            f64,
            (c0 * c0 + s0 * s0).sqrt(),
            (c1 * c1 + s1 * s1).sqrt(),
            epsilon = 1e-4
        ));
    }

    #[test]
    fn dc_only() {
        let mut array = [0.0f32; 8];
        array[0] = 1.0;
        inverse_real_fourier_transform(&mut array);
        for &sample in array.iter() {
            assert!(approx_eq!(f32, sample, 1.0, epsilon = 1e-5));
        }
    }
}
