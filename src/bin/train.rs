use clap::Parser;
use std::path::PathBuf;
use varformer::config::TrainConf;
use varformer::dist::WorkerContext;
use varformer::error::Result;
use varformer::train::Trainer;

/// Train the pileup-to-haplotype transformer on pregenerated shards.
///
/// Runs standalone by default; set RANK, WORLD_SIZE, MASTER_ADDR, and
/// MASTER_PORT to join a multi-worker job. Type "Q" + Enter for a graceful
/// stop at the next batch boundary.
#[derive(Parser)]
#[command(name = "train")]
struct Args {
    /// Training configuration YAML.
    #[arg(short, long)]
    config: PathBuf,
    /// Checkpoint and run-CSV directory, overrides the YAML `output_dir`.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Checkpoint to resume from, overrides the YAML `input_model`.
    #[arg(short, long)]
    input_model: Option<PathBuf>,
    /// Epoch count, overrides the YAML `epochs`.
    #[arg(short, long)]
    epochs: Option<usize>,
}

fn apply(mut conf: TrainConf, args: &Args) -> Result<TrainConf> {
    if let Some(ref output) = args.output {
        conf.output_dir = output.clone();
    }
    if let Some(ref input) = args.input_model {
        conf.input_model = Some(input.clone());
    }
    if let Some(epochs) = args.epochs {
        conf.epochs = epochs;
    }
    conf.validate()?;
    Ok(conf)
}

fn main() -> anyhow::Result<()> {
    varformer::log();
    varformer::brb();
    let args = Args::parse();
    let conf = apply(TrainConf::load(&args.config)?, &args)?;
    let ctx = WorkerContext::from_env()?;
    let mut trainer = Trainer::new(conf, ctx)?;
    trainer.run()?;
    log::info!("training complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> TrainConf {
        serde_yaml::from_str(
            r#"
batch_size: 4
samples_per_epoch: 10
checkpoint_freq: 1
learning_rate: 0.001
min_learning_rate: 0.0005
lr_warmup_iters: 10
lr_decay_iters: 100
epochs: 5
datadir: /data/pregen
max_decomp_batches: 2
threads: 1
model:
  decoder_layers: 1
  decoder_attention_heads: 2
  encoder_layers: 1
  encoder_attention_heads: 2
  dim_feedforward: 64
  embed_dim_factor: 16
  max_read_depth: 10
  feats_per_read: 9
"#,
        )
        .unwrap()
    }

    #[test]
    fn flags_override_the_yaml() {
        let args = Args::parse_from([
            "train",
            "--config",
            "train.yaml",
            "--output",
            "elsewhere",
            "--input-model",
            "prior.safetensors",
            "--epochs",
            "9",
        ]);
        let conf = apply(conf(), &args).unwrap();
        assert!(conf.output_dir == PathBuf::from("elsewhere"));
        assert!(conf.input_model == Some(PathBuf::from("prior.safetensors")));
        assert!(conf.epochs == 9);
    }

    #[test]
    fn absent_flags_leave_the_yaml_alone() {
        let args = Args::parse_from(["train", "--config", "train.yaml"]);
        let conf = apply(conf(), &args).unwrap();
        assert!(conf.output_dir == PathBuf::from("runs"));
        assert!(conf.input_model.is_none());
        assert!(conf.epochs == 5);
    }

    #[test]
    fn zero_epoch_override_is_rejected() {
        let args = Args::parse_from(["train", "--config", "train.yaml", "--epochs", "0"]);
        assert!(apply(conf(), &args).is_err());
    }
}
