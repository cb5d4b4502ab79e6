use std::sync::atomic::{AtomicU32, Ordering};

/// Latest microphone level in `0.0..=1.0`, written by capture and read by the visualizer.
#[derive(Debug, Default)]
pub struct AudioLevelMeter {
    bits: AtomicU32,
}

impl AudioLevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_pcm(&self, samples: &[i16]) {
        self.store(rms_level(samples));
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.store(0.0);
    }

    fn store(&self, level: f32) {
        self.bits.store(level.to_bits(), Ordering::Relaxed);
    }
}

/// Root-mean-square of a PCM window, normalised to full scale.
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}
