use clap::Parser;
use std::path::PathBuf;
use varformer::config::PregenConf;
use varformer::encode::RegionEncoder;
use varformer::pileup::Region;
use varformer::pregen::ShardWriter;

/// Encode labelled pileup regions into compressed training shards.
#[derive(Parser)]
#[command(name = "pregen")]
struct Args {
    /// Pregen configuration YAML.
    #[arg(short, long)]
    config: PathBuf,
    /// Directory receiving the shards and manifest.
    #[arg(short, long)]
    dest: PathBuf,
    /// Examples per shard.
    #[arg(short, long, default_value_t = 64)]
    batch_size: usize,
    /// Compression worker threads, 0 for one per core.
    #[arg(short, long, default_value_t = 0)]
    threads: usize,
}

fn main() -> anyhow::Result<()> {
    varformer::log();
    let args = Args::parse();
    let conf = PregenConf::load(&args.config)?;
    let threads = match args.threads {
        0 => num_cpus::get(),
        n => n,
    };
    let encoder = RegionEncoder::new(
        conf.max_read_depth,
        conf.feats_per_read,
        conf.window,
        conf.label_len,
    );
    let regions = Region::stream(&conf.regions)?.filter_map(|parsed| match parsed {
        Ok(region) => Some(region),
        Err(e) => {
            log::warn!("skipping unparseable region: {}", e);
            None
        }
    });
    let manifest = ShardWriter::new(encoder, args.batch_size, threads, &args.dest).run(regions)?;
    log::info!(
        "wrote {} shards ({} examples) to {}",
        manifest.shards.len(),
        manifest.examples,
        args.dest.display()
    );
    Ok(())
}
