use super::Manifest;
use super::manifest::ShardEntry;
use super::shard_name;
use crate::batch::Batch;
use crate::encode::RegionEncoder;
use crate::error::Result;
use crate::error::VarformerError;
use crate::pileup::Region;
use rayon::prelude::*;
use std::path::Path;
use std::path::PathBuf;

/// Batches encoded regions and persists each batch as one compressed shard.
///
/// Restart-safe: shards land under their final name only via rename, so a
/// crashed run leaves at worst a `.tmp` that the next run overwrites, and
/// re-running against a complete destination writes nothing.
pub struct ShardWriter {
    encoder: RegionEncoder,
    batch_size: usize,
    threads: usize,
    dest: PathBuf,
}

impl ShardWriter {
    pub fn new(encoder: RegionEncoder, batch_size: usize, threads: usize, dest: &Path) -> Self {
        Self {
            encoder,
            batch_size,
            threads,
            dest: dest.to_path_buf(),
        }
    }

    /// Encode, batch, compress, and persist the given region stream.
    /// Invalid regions are logged and skipped; the manifest reflects only
    /// what was actually written.
    pub fn run(&self, regions: impl Iterator<Item = Region>) -> Result<Manifest> {
        std::fs::create_dir_all(&self.dest)?;
        let mut skipped = 0usize;
        let mut examples = Vec::new();
        for ref region in regions {
            match self.encoder.encode(region) {
                Ok(encoded) => examples.push(encoded),
                Err(e) => {
                    skipped += 1;
                    log::warn!("skipping region {}: {}", region, e);
                }
            }
        }
        if skipped > 0 {
            log::info!("skipped {} invalid regions", skipped);
        }
        let batches = examples
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect::<Vec<_>>();
        log::info!(
            "writing {} shards ({} examples) to {}",
            batches.len(),
            examples.len(),
            self.dest.display()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| VarformerError::Config(format!("worker pool: {}", e)))?;
        let shards = pool.install(|| {
            batches
                .into_par_iter()
                .enumerate()
                .map(|(idx, chunk)| self.persist(idx, chunk))
                .collect::<Result<Vec<_>>>()
        })?;

        let manifest = Manifest {
            encoding_version: crate::ENCODING_VERSION,
            batch_size: self.batch_size,
            max_read_depth: self.encoder.max_read_depth,
            feats_per_read: self.encoder.feats_per_read,
            window: self.encoder.window,
            label_len: self.encoder.label_len,
            examples: shards.iter().map(|s| s.examples).sum(),
            shards,
        };
        manifest.save(&self.dest)?;
        Ok(manifest)
    }

    /// Write one shard, or skip it when a complete one is already present.
    /// Workers own disjoint batch indices, so no two ever race on a name.
    fn persist(&self, idx: usize, chunk: Vec<crate::encode::EncodedExample>) -> Result<ShardEntry> {
        let name = shard_name(idx);
        let path = self.dest.join(&name);
        let examples = chunk.len();
        if path.exists() {
            log::debug!("shard already complete ({})", name);
            return Ok(ShardEntry { name, examples });
        }
        let batch = Batch::stack(chunk, &self.encoder);
        let compressed = batch.compress()?;
        let tmp = self.dest.join(format!("{}.tmp", name));
        std::fs::write(&tmp, &compressed)?;
        std::fs::rename(&tmp, &path)?;
        log::debug!("wrote shard {} ({} examples)", name, examples);
        Ok(ShardEntry { name, examples })
    }
}
