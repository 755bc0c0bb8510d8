//! # Mel Filterbank
//!
//! Slaney-style triangular mel filters, the layout Whisper was trained with.
//! Computed once when the model loads instead of shipping a precomputed table.
//!
//! ## Layout:
//! Row-major `n_mels x n_freqs`, where `n_freqs = n_fft / 2 + 1`. Row `m` holds
//! the weights mel band `m` gives to each FFT bin.

/// FFT window Whisper's front end uses at 16kHz.
pub const N_FFT: usize = 400;

// Slaney mel scale: linear below 1kHz, logarithmic above.
const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}

/// Build an area-normalized mel filterbank.
pub fn mel_filters(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let sample_rate = sample_rate as f64;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate / n_fft as f64)
        .collect();

    let max_mel = hz_to_mel(sample_rate / 2.0);
    let band_edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (band_edges[m], band_edges[m + 1], band_edges[m + 2]);
        let norm = 2.0 / (upper - lower);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}
