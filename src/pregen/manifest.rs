use crate::config::ModelConf;
use crate::error::Result;
use crate::error::VarformerError;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub name: String,
    pub examples: usize,
}

/// Sidecar record of what a shard directory contains and how it was encoded.
/// Written once by the shard writer, consumed by the loader to validate
/// compatibility before training starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub encoding_version: u16,
    pub batch_size: usize,
    pub max_read_depth: usize,
    pub feats_per_read: usize,
    pub window: usize,
    pub label_len: usize,
    pub examples: usize,
    pub shards: Vec<ShardEntry>,
}

impl Manifest {
    pub const NAME: &'static str = "manifest.json";

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::NAME);
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map_err(|e| VarformerError::Config(format!("bad manifest {}: {}", path.display(), e)))
    }

    /// Atomic write: temp name then rename, same discipline as the shards.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(Self::NAME);
        let tmp = dir.join(format!("{}.tmp", Self::NAME));
        std::fs::write(&tmp, serde_json::to_string_pretty(self).expect("manifest json"))?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Encoding parameters baked into the shards must match the training
    /// configuration exactly; a mismatch is fatal at startup.
    pub fn compat(&self, model: &ModelConf) -> Result<()> {
        if self.encoding_version != crate::ENCODING_VERSION {
            return Err(VarformerError::ConfigMismatch(format!(
                "shards encoded with version {}, this build expects {}",
                self.encoding_version,
                crate::ENCODING_VERSION
            )));
        }
        if self.max_read_depth != model.max_read_depth {
            return Err(VarformerError::ConfigMismatch(format!(
                "max_read_depth: pregen {} vs train {}",
                self.max_read_depth, model.max_read_depth
            )));
        }
        if self.feats_per_read != model.feats_per_read {
            return Err(VarformerError::ConfigMismatch(format!(
                "feats_per_read: pregen {} vs train {}",
                self.feats_per_read, model.feats_per_read
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            encoding_version: crate::ENCODING_VERSION,
            batch_size: 4,
            max_read_depth: 50,
            feats_per_read: 9,
            window: 150,
            label_len: 148,
            examples: 10,
            shards: vec![
                ShardEntry { name: "shard-00000.vfb.zst".to_string(), examples: 4 },
                ShardEntry { name: "shard-00001.vfb.zst".to_string(), examples: 4 },
                ShardEntry { name: "shard-00002.vfb.zst".to_string(), examples: 2 },
            ],
        }
    }

    fn model() -> ModelConf {
        ModelConf {
            decoder_layers: 2,
            decoder_attention_heads: 2,
            encoder_layers: 2,
            encoder_attention_heads: 2,
            dim_feedforward: 64,
            embed_dim_factor: 16,
            max_read_depth: 50,
            feats_per_read: 9,
        }
    }

    #[test]
    fn saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let ref m = manifest();
        m.save(dir.path()).unwrap();
        assert!(Manifest::load(dir.path()).unwrap() == *m);
    }

    #[test]
    fn accepts_matching_encoding_params() {
        assert!(manifest().compat(&model()).is_ok());
    }

    #[test]
    fn depth_mismatch_is_fatal() {
        let mut m = model();
        m.max_read_depth = 100;
        assert!(matches!(
            manifest().compat(&m),
            Err(VarformerError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn feats_mismatch_is_fatal() {
        let mut m = model();
        m.feats_per_read = 10;
        assert!(matches!(
            manifest().compat(&m),
            Err(VarformerError::ConfigMismatch(_))
        ));
    }
}
