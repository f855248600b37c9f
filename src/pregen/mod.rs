//! Offline pregeneration: encode labelled regions into compressed,
//! batch-sized shards plus a manifest the training loader validates against.

pub mod manifest;
pub mod writer;

pub use manifest::Manifest;
pub use writer::ShardWriter;

/// Configuration-derived shard file name for batch index `idx`.
pub fn shard_name(idx: usize) -> String {
    format!("shard-{:05}.vfb.zst", idx)
}
