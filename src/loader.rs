use crate::batch::Batch;
use crate::config::ModelConf;
use crate::error::Result;
use crate::error::VarformerError;
use crate::pregen::Manifest;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::bounded;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

/// Streams pregenerated shards back as ready-to-consume batches through a
/// bounded decompression pipeline.
///
/// At most `max_decomp` decompressed batches exist ahead of the consumer at
/// any moment, counting batches still in workers' hands, so decompression
/// never races arbitrarily far ahead of the training step. Shard visit order
/// is reshuffled per epoch for training and strictly in-order for validation.
pub struct PregenLoader {
    shards: Vec<PathBuf>,
    manifest: Manifest,
    threads: usize,
    max_decomp: usize,
    max_corrupt_frac: f64,
}

impl PregenLoader {
    /// Open a shard directory, slicing shards for this worker: rank `r` of
    /// `world` visits indices congruent to `r` so ranks consume disjoint
    /// data. Every rank's slice is truncated to the same length, so all
    /// ranks take the same number of steps per epoch and the per-step
    /// parameter exchange always has a full complement of partners.
    pub fn open(
        dir: &Path,
        threads: usize,
        max_decomp: usize,
        max_corrupt_frac: f64,
        rank: usize,
        world: usize,
    ) -> Result<Self> {
        let manifest = Manifest::load(dir)?;
        let mut shards = manifest
            .shards
            .iter()
            .enumerate()
            .filter(|(i, _)| i % world == rank)
            .map(|(_, s)| dir.join(&s.name))
            .collect::<Vec<_>>();
        shards.truncate(manifest.shards.len() / world);
        if shards.is_empty() {
            return Err(VarformerError::Config(format!(
                "no shards for rank {} in {}",
                rank,
                dir.display()
            )));
        }
        log::info!(
            "opened {} ({} shards for this rank, {} examples total)",
            dir.display(),
            shards.len(),
            manifest.examples
        );
        Ok(Self {
            shards,
            manifest,
            threads: threads.max(1),
            max_decomp: max_decomp.max(1),
            max_corrupt_frac,
        })
    }

    /// Fatal when pregen-time and train-time encoding parameters disagree.
    pub fn compat(&self, model: &ModelConf) -> Result<()> {
        self.manifest.compat(model)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// One training pass: shard order permuted from `seed`, decompression
    /// fanned out across the worker pool.
    pub fn epoch(&self, seed: u64) -> Epoch {
        let mut shards = self.shards.clone();
        shards.shuffle(&mut SmallRng::seed_from_u64(seed));
        Epoch::spawn(shards, self.threads, self.max_decomp, self.max_corrupt_frac)
    }

    /// One deterministic pass in shard order, single decoder, for validation.
    pub fn ordered(&self) -> Epoch {
        Epoch::spawn(self.shards.clone(), 1, self.max_decomp, self.max_corrupt_frac)
    }
}

/// Capacity gate for decompressed batches. A worker takes a slot before it
/// decompresses and the consumer frees the slot on receipt, so the slot count
/// covers batches buffered in the channel and batches in workers' hands.
struct Slots {
    held: Mutex<usize>,
    freed: Condvar,
    cap: usize,
    closed: AtomicBool,
}

impl Slots {
    fn new(cap: usize) -> Self {
        Self {
            held: Mutex::new(0),
            freed: Condvar::new(),
            cap,
            closed: AtomicBool::new(false),
        }
    }

    /// Blocks until a slot is free. False once the pipeline is shutting down.
    fn acquire(&self) -> bool {
        let mut held = self.held.lock().unwrap();
        while *held >= self.cap {
            if self.closed.load(Ordering::Relaxed) {
                return false;
            }
            held = self.freed.wait(held).unwrap();
        }
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        *held += 1;
        true
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap();
        *held -= 1;
        drop(held);
        self.freed.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.freed.notify_all();
    }

    fn count(&self) -> usize {
        *self.held.lock().unwrap()
    }
}

/// A lazily-decompressed pass over a shard set. Dropping it tears the worker
/// pool down; workers exit as soon as the channel closes.
pub struct Epoch {
    rx: Receiver<Result<Batch>>,
    slots: Arc<Slots>,
    handles: Vec<JoinHandle<()>>,
}

impl Epoch {
    fn spawn(shards: Vec<PathBuf>, threads: usize, max_decomp: usize, max_corrupt_frac: f64) -> Self {
        let total = shards.len();
        let workers = threads.min(total).max(1);
        let corrupt = Arc::new(AtomicUsize::new(0));
        let slots = Arc::new(Slots::new(max_decomp));
        let (tx, rx) = bounded::<Result<Batch>>(max_decomp);
        let handles = (0..workers)
            .map(|worker| {
                // round-robin shard assignment keeps worker sets disjoint
                let mine = shards
                    .iter()
                    .skip(worker)
                    .step_by(workers)
                    .cloned()
                    .collect::<Vec<_>>();
                let tx = tx.clone();
                let corrupt = corrupt.clone();
                let slots = slots.clone();
                std::thread::spawn(move || {
                    decode_shards(mine, tx, slots, corrupt, total, max_corrupt_frac)
                })
            })
            .collect();
        Self { rx, slots, handles }
    }

    /// Decompressed batches currently ahead of the consumer, in the channel
    /// or in a worker's hand.
    pub fn buffered(&self) -> usize {
        self.slots.count()
    }
}

impl Iterator for Epoch {
    type Item = Result<Batch>;
    fn next(&mut self) -> Option<Self::Item> {
        let item = self.rx.recv().ok()?;
        if item.is_ok() {
            self.slots.release();
        }
        Some(item)
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // unblock producers waiting on a slot or a send, then reap them
        self.slots.close();
        let (_, drain) = bounded(0);
        self.rx = drain;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn decode_shards(
    shards: Vec<PathBuf>,
    tx: Sender<Result<Batch>>,
    slots: Arc<Slots>,
    corrupt: Arc<AtomicUsize>,
    total: usize,
    max_corrupt_frac: f64,
) {
    for ref path in shards {
        if !slots.acquire() {
            return;
        }
        let message = match read_shard(path) {
            Ok(batch) => Ok(batch),
            Err(e) => {
                slots.release();
                log::warn!("skipping corrupt shard: {}", e);
                let seen = corrupt.fetch_add(1, Ordering::Relaxed) + 1;
                if seen as f64 > max_corrupt_frac * total as f64 {
                    let _ = tx.send(Err(VarformerError::ShardCorruptThreshold {
                        corrupt: seen,
                        total,
                        threshold: max_corrupt_frac,
                    }));
                    return;
                }
                continue;
            }
        };
        if tx.send(message).is_err() {
            slots.release();
            return;
        }
    }
}

fn read_shard(path: &Path) -> Result<Batch> {
    let bytes = std::fs::read(path).map_err(|e| VarformerError::ShardCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Batch::decompress(&bytes).map_err(|e| VarformerError::ShardCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
