use crate::error::Result;
use crate::error::VarformerError;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

/// Model dimensions. `max_read_depth` and `feats_per_read` must match the
/// values recorded in the pregen manifest or training refuses to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConf {
    pub decoder_layers: usize,
    pub decoder_attention_heads: usize,
    pub encoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub dim_feedforward: usize,
    pub embed_dim_factor: usize,
    pub max_read_depth: usize,
    pub feats_per_read: usize,
}

impl ModelConf {
    /// Shared width of the encoder and decoder streams.
    pub fn embed_dim(&self) -> usize {
        self.encoder_attention_heads * self.embed_dim_factor
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_read_depth == 0 || self.feats_per_read == 0 {
            return Err(VarformerError::Config(
                "max_read_depth and feats_per_read must be positive".to_string(),
            ));
        }
        if self.encoder_layers == 0 || self.decoder_layers == 0 {
            return Err(VarformerError::Config(
                "encoder_layers and decoder_layers must be positive".to_string(),
            ));
        }
        if self.embed_dim() % self.decoder_attention_heads != 0 {
            return Err(VarformerError::Config(format!(
                "embed dim {} not divisible by decoder_attention_heads {}",
                self.embed_dim(),
                self.decoder_attention_heads
            )));
        }
        Ok(())
    }
}

/// Full training configuration, loaded once at process start and read-only
/// for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConf {
    pub batch_size: usize,
    pub samples_per_epoch: usize,
    pub checkpoint_freq: usize,
    pub learning_rate: f64,
    pub min_learning_rate: f64,
    pub lr_warmup_iters: usize,
    pub lr_decay_iters: usize,
    pub epochs: usize,
    pub val_dir: Option<PathBuf>,
    pub datadir: PathBuf,
    pub max_decomp_batches: usize,
    pub threads: usize,
    #[serde(default)]
    pub input_model: Option<PathBuf>,
    /// Checkpoints and the run CSV land here.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Corrupt-shard failure-rate threshold; the run aborts above it.
    #[serde(default = "default_max_corrupt_frac")]
    pub max_corrupt_frac: f64,
    pub model: ModelConf,
}

fn default_max_corrupt_frac() -> f64 {
    0.05
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl TrainConf {
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let conf: Self = serde_yaml::from_str(&text)
            .map_err(|e| VarformerError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if self.batch_size == 0 {
            return Err(VarformerError::Config("batch_size must be positive".to_string()));
        }
        if self.epochs == 0 {
            return Err(VarformerError::Config("epochs must be positive".to_string()));
        }
        if self.lr_warmup_iters == 0 || self.lr_decay_iters == 0 {
            return Err(VarformerError::Config(
                "lr_warmup_iters and lr_decay_iters must be positive".to_string(),
            ));
        }
        if self.min_learning_rate > self.learning_rate {
            return Err(VarformerError::Config(format!(
                "min_learning_rate {} exceeds learning_rate {}",
                self.min_learning_rate, self.learning_rate
            )));
        }
        if self.max_decomp_batches == 0 {
            return Err(VarformerError::Config(
                "max_decomp_batches must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_corrupt_frac) {
            return Err(VarformerError::Config(
                "max_corrupt_frac must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Thread count with a machine-derived fallback.
    pub fn threads(&self) -> usize {
        match self.threads {
            0 => num_cpus::get(),
            n => n,
        }
    }
}

/// Pregeneration source configuration: where the labelled regions live and
/// what encoding parameters to bake into the shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PregenConf {
    /// JSONL file with one labelled Region per line.
    pub regions: PathBuf,
    pub max_read_depth: usize,
    pub feats_per_read: usize,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_label_len")]
    pub label_len: usize,
}

fn default_window() -> usize {
    crate::DEFAULT_WINDOW
}

fn default_label_len() -> usize {
    crate::DEFAULT_LABEL_LEN
}

impl PregenConf {
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("loading pregen configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let conf: Self = serde_yaml::from_str(&text)
            .map_err(|e| VarformerError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        if conf.max_read_depth == 0 || conf.feats_per_read == 0 || conf.window == 0 {
            return Err(VarformerError::Config(
                "max_read_depth, feats_per_read, and window must be positive".to_string(),
            ));
        }
        Ok(conf)
    }
}
