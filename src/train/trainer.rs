use super::checkpoint;
use super::checkpoint::CheckpointMeta;
use super::logbook::Logbook;
use super::logbook::Progress;
use crate::TOKEN_PAD;
use crate::batch::Batch;
use crate::config::TrainConf;
use crate::dist::Coordinator;
use crate::dist::WorkerContext;
use crate::error::Result;
use crate::loader::PregenLoader;
use crate::model::VarTransformer;
use crate::model::shift_right;
use crate::schedule::WarmupCosine;
use candle_core::D;
use candle_core::DType;
use candle_core::Device;
use candle_core::Tensor;
use candle_nn::AdamW;
use candle_nn::Optimizer;
use candle_nn::ParamsAdamW;
use candle_nn::VarBuilder;
use candle_nn::VarMap;

/// One worker's view of a training run.
///
/// Every rank trains on its own shard slice and averages parameters with the
/// rest of the world after each optimizer step. Rank 0 additionally owns
/// validation, checkpoints, and the run CSV.
pub struct Trainer {
    conf: TrainConf,
    ctx: WorkerContext,
    coordinator: Coordinator,
    device: Device,
    varmap: VarMap,
    model: VarTransformer,
    optimizer: AdamW,
    schedule: WarmupCosine,
    train_data: PregenLoader,
    val_data: Option<PregenLoader>,
    logbook: Option<Logbook>,
    /// Global samples consumed across all ranks, drives the LR schedule.
    samples: u64,
    epoch: usize,
}

impl Trainer {
    pub fn new(conf: TrainConf, ctx: WorkerContext) -> Result<Self> {
        let device = Device::cuda_if_available(0)?;
        let train_data = PregenLoader::open(
            &conf.datadir,
            conf.threads(),
            conf.max_decomp_batches,
            conf.max_corrupt_frac,
            ctx.rank,
            ctx.world,
        )?;
        train_data.compat(&conf.model)?;
        let val_data = match conf.val_dir {
            Some(ref dir) if ctx.rank == 0 => {
                let data = PregenLoader::open(
                    dir,
                    1,
                    conf.max_decomp_batches,
                    conf.max_corrupt_frac,
                    0,
                    1,
                )?;
                data.compat(&conf.model)?;
                Some(data)
            }
            _ => None,
        };

        let max_len = train_data
            .manifest()
            .window
            .max(train_data.manifest().label_len);
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = VarTransformer::new(&conf.model, max_len, vb)?;
        let meta = match conf.input_model {
            Some(ref path) => checkpoint::resume(&mut varmap, path)?,
            None => CheckpointMeta { epoch: 0, samples: 0 },
        };

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: conf.learning_rate,
                ..Default::default()
            },
        )?;
        let schedule = WarmupCosine {
            max_lr: conf.learning_rate,
            min_lr: conf.min_learning_rate,
            warmup_samples: conf.lr_warmup_iters as u64,
            decay_samples: conf.lr_decay_iters as u64,
        };
        let logbook = match ctx.rank {
            0 => Some(Logbook::open(&conf.output_dir)?),
            _ => None,
        };
        let coordinator = Coordinator::rendezvous(&ctx)?;
        log::info!(
            "rank {}/{} ready on {:?}, resuming at epoch {} ({} samples)",
            ctx.rank,
            ctx.world,
            device,
            meta.epoch,
            meta.samples
        );
        Ok(Self {
            conf,
            ctx,
            coordinator,
            device,
            varmap,
            model,
            optimizer,
            schedule,
            train_data,
            val_data,
            logbook,
            samples: meta.samples,
            epoch: meta.epoch,
        })
    }

    /// Train to the configured epoch count, or until interrupted. Either way
    /// rank 0 leaves a final checkpoint behind.
    pub fn run(&mut self) -> Result<()> {
        while self.epoch < self.conf.epochs {
            if crate::interrupted() {
                log::warn!("stopping before epoch {}", self.epoch + 1);
                break;
            }
            let epoch = self.epoch + 1;
            let (train_loss, lr) = self.train_epoch(epoch)?;
            self.epoch = epoch;
            let val = self.validate()?;
            if let Some((loss, accuracy)) = val {
                log::info!(
                    "epoch {:>4} ~ val loss {:.4} ~ base accuracy {:.2}%",
                    epoch,
                    loss,
                    accuracy * 100.0
                );
            }
            if let Some(ref mut book) = self.logbook {
                book.record(epoch, self.samples, lr, train_loss, val)?;
            }
            if self.due_for_checkpoint() {
                self.checkpoint(&checkpoint::name(self.epoch))?;
            }
        }
        self.checkpoint(checkpoint::FINAL_CHECKPOINT)?;
        Ok(())
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<(f64, f64)> {
        let mut progress = Progress::new(epoch);
        let mut lr = self.schedule.at(self.samples);
        let mut consumed = 0usize;
        for item in self.train_data.epoch(epoch as u64) {
            if crate::interrupted() {
                break;
            }
            let batch = item?;
            lr = self.schedule.at(self.samples);
            let examples = batch.examples;
            match self.step(&batch, lr) {
                Ok(loss) => progress.tick(examples, loss, lr),
                Err(e) => log::warn!("skipping malformed batch: {}", e),
            }
            // the other ranks reached their exchange for this step; join it
            // even when this rank's batch was skipped
            self.coordinator.sync(&self.varmap)?;
            self.samples += (examples * self.ctx.world) as u64;
            // cap counted in nominal batches so every rank breaks on the
            // same step regardless of partial shards
            consumed += self.conf.batch_size * self.ctx.world;
            if self.conf.samples_per_epoch > 0 && consumed >= self.conf.samples_per_epoch {
                break;
            }
        }
        log::info!(
            "epoch {:>4} ~ {} batches ~ train loss {:.4}",
            epoch,
            progress.batches(),
            progress.mean_loss()
        );
        Ok((progress.mean_loss(), lr))
    }

    /// Forward/backward for one batch. Errors here are batch-local and the
    /// caller skips them; the parameter exchange happens outside, so a skip
    /// never desynchronizes the world.
    fn step(&mut self, batch: &Batch, lr: f64) -> Result<f64> {
        self.optimizer.set_learning_rate(lr);
        let (src, labels) = batch.to_tensors(&self.device)?;
        let logits = self.model.forward(&src, &shift_right(&labels)?)?;
        let loss = flat_cross_entropy(&logits, &labels)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_scalar::<f32>()? as f64)
    }

    /// Deterministic pass over the held-out shards, rank 0 only. Reports mean
    /// loss and per-base accuracy over non-pad positions.
    fn validate(&self) -> Result<Option<(f64, f64)>> {
        let Some(ref data) = self.val_data else {
            return Ok(None);
        };
        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        let mut correct = 0usize;
        let mut counted = 0usize;
        for item in data.ordered() {
            let batch = item?;
            let (src, labels) = batch.to_tensors(&self.device)?;
            let logits = self.model.forward(&src, &shift_right(&labels)?)?;
            loss_sum += flat_cross_entropy(&logits, &labels)?.to_scalar::<f32>()? as f64;
            batches += 1;
            let calls = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
            let truth = labels.to_vec2::<u32>()?;
            for (call_row, truth_row) in calls.iter().zip(&truth) {
                for (&call, &base) in call_row.iter().zip(truth_row) {
                    if base != TOKEN_PAD as u32 {
                        counted += 1;
                        correct += usize::from(call == base);
                    }
                }
            }
        }
        if batches == 0 || counted == 0 {
            return Ok(None);
        }
        Ok(Some((
            loss_sum / batches as f64,
            correct as f64 / counted as f64,
        )))
    }

    fn due_for_checkpoint(&self) -> bool {
        self.ctx.rank == 0
            && self.conf.checkpoint_freq > 0
            && self.epoch % self.conf.checkpoint_freq == 0
    }

    fn checkpoint(&self, name: &str) -> Result<()> {
        if self.ctx.rank != 0 {
            return Ok(());
        }
        let meta = CheckpointMeta {
            epoch: self.epoch,
            samples: self.samples,
        };
        checkpoint::save(&self.varmap, &self.conf.output_dir, name, &meta)?;
        Ok(())
    }
}

fn flat_cross_entropy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let (n, t, vocab) = logits.dims3()?;
    candle_nn::loss::cross_entropy(
        &logits.reshape((n * t, vocab))?,
        &labels.reshape(n * t)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConf;
    use crate::encode::RegionEncoder;
    use crate::pileup::AlignedRead;
    use crate::pileup::Region;
    use crate::pregen::ShardWriter;
    use std::path::Path;

    fn pregen(dir: &Path, regions: usize) {
        let all = (0..regions)
            .map(|i| Region {
                chrom: "chr1".to_string(),
                start: i as u64 * 100,
                end: i as u64 * 100 + 16,
                reads: vec![AlignedRead {
                    sequence: "ACGTACGT".to_string(),
                    quals: vec![30; 8],
                    offset: (i % 3) as i64,
                    reverse: i % 2 == 1,
                    clipped: 0,
                }],
                haplotype: "ACGTACGT".to_string(),
            })
            .collect::<Vec<_>>();
        ShardWriter::new(RegionEncoder::new(4, 9, 16, 8), 4, 2, dir)
            .run(all.into_iter())
            .unwrap();
    }

    fn conf(data: &Path, val: &Path, out: &Path) -> TrainConf {
        TrainConf {
            batch_size: 4,
            samples_per_epoch: 0,
            checkpoint_freq: 1,
            learning_rate: 1e-3,
            min_learning_rate: 1e-5,
            lr_warmup_iters: 8,
            lr_decay_iters: 1000,
            epochs: 2,
            val_dir: Some(val.to_path_buf()),
            datadir: data.to_path_buf(),
            max_decomp_batches: 2,
            threads: 2,
            input_model: None,
            output_dir: out.to_path_buf(),
            max_corrupt_frac: 0.05,
            model: ModelConf {
                decoder_layers: 1,
                decoder_attention_heads: 2,
                encoder_layers: 1,
                encoder_attention_heads: 2,
                dim_feedforward: 32,
                embed_dim_factor: 8,
                max_read_depth: 4,
                feats_per_read: 9,
            },
        }
    }

    fn solo() -> WorkerContext {
        WorkerContext {
            rank: 0,
            world: 1,
            master: "127.0.0.1:0".to_string(),
            job_id: "test".to_string(),
        }
    }

    fn worker(rank: usize, master: &str) -> WorkerContext {
        WorkerContext {
            rank,
            world: 2,
            master: master.to_string(),
            job_id: "test".to_string(),
        }
    }

    fn free_port() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn weights(trainer: &Trainer) -> Vec<f32> {
        let data = trainer.varmap.data().lock().unwrap();
        let mut names = data.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
            .iter()
            .flat_map(|n| data[n].flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn solo_run_trains_validates_and_checkpoints() {
        let data = tempfile::tempdir().unwrap();
        let val = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        pregen(data.path(), 8);
        pregen(val.path(), 4);
        let mut trainer = Trainer::new(conf(data.path(), val.path(), out.path()), solo()).unwrap();
        trainer.run().unwrap();
        assert!(out.path().join("checkpoint-epoch0001.safetensors").exists());
        assert!(out.path().join("checkpoint-epoch0002.safetensors").exists());
        assert!(out.path().join(checkpoint::FINAL_CHECKPOINT).exists());
        let csv = std::fs::read_to_string(out.path().join("train.csv")).unwrap();
        assert!(csv.lines().count() == 3);
        assert!(trainer.samples == 16);
    }

    #[test]
    fn checkpoint_cadence_skips_odd_epochs() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        pregen(data.path(), 4);
        let mut c = conf(data.path(), data.path(), out.path());
        c.val_dir = None;
        c.checkpoint_freq = 2;
        c.epochs = 3;
        Trainer::new(c, solo()).unwrap().run().unwrap();
        assert!(!out.path().join("checkpoint-epoch0001.safetensors").exists());
        assert!(out.path().join("checkpoint-epoch0002.safetensors").exists());
        assert!(!out.path().join("checkpoint-epoch0003.safetensors").exists());
        assert!(out.path().join(checkpoint::FINAL_CHECKPOINT).exists());
    }

    #[test]
    fn resume_restores_scheduler_position() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        pregen(data.path(), 8);
        let mut first = conf(data.path(), data.path(), out.path());
        first.val_dir = None;
        first.epochs = 1;
        Trainer::new(first.clone(), solo()).unwrap().run().unwrap();
        let mut second = first;
        second.epochs = 2;
        second.input_model = Some(out.path().join(checkpoint::FINAL_CHECKPOINT));
        let trainer = Trainer::new(second, solo()).unwrap();
        assert!(trainer.epoch == 1);
        assert!(trainer.samples == 8);
    }

    #[test]
    fn uneven_shards_keep_the_world_in_step() {
        let data = tempfile::tempdir().unwrap();
        let out0 = tempfile::tempdir().unwrap();
        let out1 = tempfile::tempdir().unwrap();
        pregen(data.path(), 10); // 3 shards across a world of 2
        let master = free_port();
        let mut c0 = conf(data.path(), data.path(), out0.path());
        c0.val_dir = None;
        c0.epochs = 1;
        let mut c1 = c0.clone();
        c1.output_dir = out1.path().to_path_buf();
        let follower_master = master.clone();
        let follower = std::thread::spawn(move || {
            let mut t = Trainer::new(c1, worker(1, &follower_master)).unwrap();
            t.run().unwrap();
            weights(&t)
        });
        let mut leader = Trainer::new(c0, worker(0, &master)).unwrap();
        leader.run().unwrap();
        let follower_weights = follower.join().unwrap();
        assert!(weights(&leader) == follower_weights);
        assert!(out0.path().join(checkpoint::FINAL_CHECKPOINT).exists());
        assert!(!out1.path().join(checkpoint::FINAL_CHECKPOINT).exists());
    }

    #[test]
    fn mismatched_encoding_is_fatal_before_training() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        pregen(data.path(), 4);
        let mut bad = conf(data.path(), data.path(), out.path());
        bad.val_dir = None;
        bad.model.max_read_depth = 64;
        assert!(Trainer::new(bad, solo()).is_err());
    }
}
