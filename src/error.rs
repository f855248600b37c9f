use std::path::PathBuf;

/// Failure taxonomy for the pipeline.
///
/// Per-region and per-shard failures are isolated and logged by their callers;
/// setup-time and state-integrity failures abort the run with a non-zero exit.
#[derive(Debug, thiserror::Error)]
pub enum VarformerError {
    /// A region that cannot be encoded. Skip-and-continue, never fatal.
    #[error("invalid region {chrom}:{start}-{end}: {reason}")]
    InvalidRegion {
        chrom: String,
        start: u64,
        end: u64,
        reason: String,
    },

    /// A shard that fails magic/version/length checks or decompression.
    /// Skipped unless the corrupt fraction exceeds the configured threshold.
    #[error("corrupt shard {path}: {reason}")]
    ShardCorrupt { path: PathBuf, reason: String },

    /// Too many corrupt shards for the configured failure-rate threshold.
    #[error("{corrupt} of {total} shards corrupt, exceeds threshold {threshold}")]
    ShardCorruptThreshold {
        corrupt: usize,
        total: usize,
        threshold: f64,
    },

    /// Encoding parameters disagree between pregen and train. Fatal at startup.
    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    /// A worker failed to join the process group in time. Fatal.
    #[error("rendezvous timeout: {0}")]
    RendezvousTimeout(String),

    /// A checkpoint could not be persisted. Fatal, training state would be lost.
    #[error("checkpoint write failed at {path}: {source}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("{0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, VarformerError>;
