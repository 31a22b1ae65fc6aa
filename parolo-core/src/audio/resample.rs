//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Capture runs at the device's native rate (commonly 48 kHz); the
//! recognizers consume 16 kHz mono. `RateConverter` bridges that gap on the
//! capture thread, where allocation is allowed. Linear interpolation is
//! plenty for speech and keeps the per-frame cost negligible.
//!
//! When capture rate == target rate the converter is a passthrough and no
//! rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ParoloError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when capture rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer — holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `ParoloError::AudioDevice` if rubato fails to initialise.
    pub fn new(capture_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / capture_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Linear,
            chunk_size,
            1, // mono
        )
        .map_err(|e| ParoloError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(capture_rate, target_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples accumulate internally until a full `chunk_size` block is
    /// available; any remainder is kept for the next call. In passthrough
    /// mode input is returned directly.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Returns `true` when capture rate == target rate.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
