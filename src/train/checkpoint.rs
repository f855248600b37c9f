use crate::error::Result;
use crate::error::VarformerError;
use candle_nn::VarMap;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

pub const FINAL_CHECKPOINT: &str = "checkpoint-final.safetensors";

/// Training position stored alongside the weights so a resumed run picks up
/// both the epoch counter and the scheduler position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub samples: u64,
}

pub fn name(epoch: usize) -> String {
    format!("checkpoint-epoch{:04}.safetensors", epoch)
}

/// Write weights plus the metadata sidecar, staged through `.tmp` files and
/// renamed into place so a crash mid-write never leaves a half checkpoint
/// under the final name.
pub fn save(varmap: &VarMap, dir: &Path, name: &str, meta: &CheckpointMeta) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| write_error(dir.join(name), e))?;
    let path = dir.join(name);
    let staged = dir.join(format!("{}.tmp", name));
    varmap.save(&staged)?;
    std::fs::rename(&staged, &path).map_err(|e| write_error(path.clone(), e))?;
    let sidecar = path.with_extension("json");
    let staged = dir.join(format!("{}.json.tmp", name));
    let text = serde_json::to_string_pretty(meta)
        .map_err(|e| VarformerError::Config(format!("checkpoint metadata: {}", e)))?;
    std::fs::write(&staged, text).map_err(|e| write_error(sidecar.clone(), e))?;
    std::fs::rename(&staged, &sidecar).map_err(|e| write_error(sidecar.clone(), e))?;
    log::info!("saved checkpoint {}", path.display());
    Ok(path)
}

/// Load weights into an existing varmap (shapes must already match) and
/// return the stored position. A missing sidecar resumes from zero, which
/// covers weights imported from outside this pipeline.
pub fn resume(varmap: &mut VarMap, path: &Path) -> Result<CheckpointMeta> {
    varmap.load(path)?;
    let sidecar = path.with_extension("json");
    let meta = match std::fs::read_to_string(&sidecar) {
        Err(_) => {
            log::warn!("no metadata beside {}, starting counters at zero", path.display());
            CheckpointMeta { epoch: 0, samples: 0 }
        }
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| VarformerError::Config(format!("checkpoint metadata: {}", e)))?,
    };
    log::info!(
        "resumed {} at epoch {}, {} samples",
        path.display(),
        meta.epoch,
        meta.samples
    );
    Ok(meta)
}

fn write_error(path: PathBuf, source: std::io::Error) -> VarformerError {
    VarformerError::CheckpointWrite { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_core::Device;
    use candle_nn::Init;

    fn varmap(value: f64) -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((3, 3), "layer.w", Init::Const(value), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    #[test]
    fn save_then_resume_restores_weights_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let saved = varmap(7.0);
        let meta = CheckpointMeta { epoch: 3, samples: 1920 };
        let path = save(&saved, dir.path(), &name(3), &meta).unwrap();
        let mut restored = varmap(0.0);
        let meta = resume(&mut restored, &path).unwrap();
        assert!(meta.epoch == 3);
        assert!(meta.samples == 1920);
        let data = restored.data().lock().unwrap();
        let values = data["layer.w"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn no_tmp_files_survive_a_save() {
        let dir = tempfile::tempdir().unwrap();
        save(
            &varmap(1.0),
            dir.path(),
            &name(1),
            &CheckpointMeta { epoch: 1, samples: 64 },
        )
        .unwrap();
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert!(leftovers == 0);
    }

    #[test]
    fn missing_sidecar_resumes_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = save(
            &varmap(2.0),
            dir.path(),
            FINAL_CHECKPOINT,
            &CheckpointMeta { epoch: 9, samples: 99 },
        )
        .unwrap();
        std::fs::remove_file(path.with_extension("json")).unwrap();
        let meta = resume(&mut varmap(0.0), &path).unwrap();
        assert!(meta.epoch == 0);
        assert!(meta.samples == 0);
    }
}
