use std::f64::consts::PI;

/// Learning-rate schedule: linear warmup from zero, then cosine decay to a
/// floor.
///
/// Progress is counted in training samples, not optimizer steps, so the
/// schedule lands at the same rate for any batch size or worker count.
#[derive(Debug, Clone, Copy)]
pub struct WarmupCosine {
    pub max_lr: f64,
    pub min_lr: f64,
    pub warmup_samples: u64,
    pub decay_samples: u64,
}

impl WarmupCosine {
    /// Rate after `samples` training samples have been consumed.
    pub fn at(&self, samples: u64) -> f64 {
        if samples < self.warmup_samples {
            return self.max_lr * samples as f64 / self.warmup_samples as f64;
        }
        let progress = (samples - self.warmup_samples) as f64 / self.decay_samples as f64;
        if progress >= 1.0 {
            return self.min_lr;
        }
        self.min_lr + 0.5 * (self.max_lr - self.min_lr) * (1.0 + (PI * progress).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> WarmupCosine {
        WarmupCosine {
            max_lr: 1e-3,
            min_lr: 1e-5,
            warmup_samples: 1_000,
            decay_samples: 10_000,
        }
    }

    #[test]
    fn starts_at_zero() {
        assert!(schedule().at(0) == 0.0);
    }

    #[test]
    fn warmup_is_linear() {
        let s = schedule();
        assert!((s.at(500) - 5e-4).abs() < 1e-12);
        assert!((s.at(250) - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn peak_at_end_of_warmup() {
        let s = schedule();
        assert!((s.at(1_000) - s.max_lr).abs() < 1e-12);
    }

    #[test]
    fn decay_is_monotone_after_warmup() {
        let s = schedule();
        let mut last = s.at(1_000);
        for samples in (1_000..=11_000).step_by(500).skip(1) {
            let lr = s.at(samples);
            assert!(lr < last);
            last = lr;
        }
    }

    #[test]
    fn clamps_to_floor_after_decay() {
        let s = schedule();
        assert!(s.at(11_000) == s.min_lr);
        assert!(s.at(1_000_000) == s.min_lr);
    }

    #[test]
    fn midpoint_of_decay_is_halfway() {
        let s = schedule();
        let mid = s.at(6_000);
        assert!((mid - (s.max_lr + s.min_lr) / 2.0).abs() < 1e-12);
    }
}
