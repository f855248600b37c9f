use crate::TRAINING_LOG_INTERVAL;
use crate::error::Result;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Per-epoch CSV record of the run, written by rank 0 only. Appends across
/// restarts so a resumed run keeps one continuous history.
pub struct Logbook {
    file: std::fs::File,
    started: Instant,
}

impl Logbook {
    const NAME: &'static str = "train.csv";

    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::NAME);
        let fresh = !path.exists();
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writeln!(file, "epoch,samples,lr,train_loss,val_loss,val_accuracy,elapsed_secs")?;
        }
        Ok(Self {
            file,
            started: Instant::now(),
        })
    }

    pub fn record(
        &mut self,
        epoch: usize,
        samples: u64,
        lr: f64,
        train_loss: f64,
        val: Option<(f64, f64)>,
    ) -> Result<()> {
        let (val_loss, val_accuracy) = match val {
            Some((loss, accuracy)) => (format!("{:.6}", loss), format!("{:.6}", accuracy)),
            None => (String::new(), String::new()),
        };
        writeln!(
            self.file,
            "{},{},{:.8},{:.6},{},{},{:.1}",
            epoch,
            samples,
            lr,
            train_loss,
            val_loss,
            val_accuracy,
            self.started.elapsed().as_secs_f64()
        )?;
        self.file.flush()?;
        if crate::metrics_enabled() {
            log::info!(
                "metrics {}",
                serde_json::json!({
                    "epoch": epoch,
                    "samples": samples,
                    "lr": lr,
                    "train_loss": train_loss,
                    "val_loss": val.map(|v| v.0),
                    "val_accuracy": val.map(|v| v.1),
                })
            );
        }
        Ok(())
    }
}

/// Interval ticker for the training loop. Accumulates loss over the whole
/// epoch and logs throughput once a minute rather than per batch.
pub struct Progress {
    epoch: usize,
    ticked: Instant,
    interval_samples: usize,
    loss_sum: f64,
    batches: usize,
}

impl Progress {
    pub fn new(epoch: usize) -> Self {
        Self {
            epoch,
            ticked: Instant::now(),
            interval_samples: 0,
            loss_sum: 0.0,
            batches: 0,
        }
    }

    pub fn tick(&mut self, examples: usize, loss: f64, lr: f64) {
        self.batches += 1;
        self.loss_sum += loss;
        self.interval_samples += examples;
        if self.ticked.elapsed() >= TRAINING_LOG_INTERVAL {
            let rate = self.interval_samples as f64 / self.ticked.elapsed().as_secs_f64();
            log::info!(
                "epoch {:>4} ~ {:>6} batches ~ loss {:.4} ~ lr {:.3e} ~ {:.0} samples/sec",
                self.epoch,
                self.batches,
                self.mean_loss(),
                lr,
                rate
            );
            self.ticked = Instant::now();
            self.interval_samples = 0;
        }
    }

    pub fn mean_loss(&self) -> f64 {
        if self.batches == 0 {
            return 0.0;
        }
        self.loss_sum / self.batches as f64
    }

    pub fn batches(&self) -> usize {
        self.batches
    }
}
