// Copyright (c) 2023 Mike Tsao. All rights reserved.

//! Small support utilities: the voice-pool deque, a seedable RNG, and an
//! inverse FFT for spectrum-designed wavetables.

pub mod deque;
pub mod fft;
pub mod rng;

pub use deque::Deque;
pub use rng::Rng;
