//! Core types, tunable constants, and runtime glue for varformer.
//!
//! The pipeline has two stages: `pregen` encodes labelled pileup regions into
//! compressed tensor shards, and `train` streams those shards into a
//! sequence-to-sequence transformer under a bounded decompression pipeline.

pub mod batch;
pub mod config;
pub mod dist;
pub mod encode;
pub mod error;
pub mod loader;
pub mod model;
pub mod pileup;
pub mod pregen;
pub mod schedule;
pub mod train;

/// Per-base feature channel value. Quality is pre-scaled so i8 is enough.
pub type Feature = i8;
/// Label vocabulary token.
pub type Token = u8;

// ============================================================================
// ENCODING PARAMETERS
// ============================================================================
/// Bumped whenever the example/batch wire layout changes.
pub const ENCODING_VERSION: u16 = 1;
/// Canonical per-base channels: one-hot base (4), quality, ref-consumed,
/// read-consumed, strand, clipped.
pub const CANONICAL_FEATS: usize = 9;
/// Reference window width in bases.
pub const DEFAULT_WINDOW: usize = 150;
/// Target haplotype length after pad/truncate.
pub const DEFAULT_LABEL_LEN: usize = 148;

// ============================================================================
// LABEL VOCABULARY
// ============================================================================
pub const TOKEN_PAD: Token = 0;
pub const TOKEN_START: Token = 1;
/// PAD, START, A, C, G, T.
pub const LABEL_VOCAB: usize = 6;

// ============================================================================
// MODEL INTERNALS
// ============================================================================
/// Hidden width of the per-read feature embedding.
pub const FC1_HIDDEN: usize = 12;

// ============================================================================
// TRAINING INFRASTRUCTURE
// ============================================================================
/// Interval between progress log messages during training.
pub const TRAINING_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// How long rank 0 waits for the full world to join rendezvous.
pub const RENDEZVOUS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

// ============================================================================
// ENVIRONMENT
// ============================================================================
/// Worker rank within the process group.
pub const ENV_RANK: &str = "RANK";
/// Total process-group size.
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
/// Rendezvous address and port, agreed on by every worker.
pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";
/// Job identifier used as the rendezvous id.
pub const ENV_JOB_ID: &str = "JOB_ID";
/// Toggle for run-level metric emission on rank 0.
pub const ENV_ENABLE_METRICS: &str = "ENABLE_METRICS";
/// Optional wall-clock budget for timed runs, e.g. "30m", "2h".
pub const ENV_TRAIN_DURATION: &str = "TRAIN_DURATION";

// ============================================================================
// RUNTIME UTILITIES
// ============================================================================
/// Initialize dual logging (terminal + file) with timestamped log files.
/// Creates `logs/` directory and writes DEBUG level to file, INFO to terminal.
pub fn log() {
    std::fs::create_dir_all("logs").expect("create logs directory");
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time moves slow")
        .as_secs();
    let file = simplelog::WriteLogger::new(
        log::LevelFilter::Debug,
        config.clone(),
        std::fs::File::create(format!("logs/{}.log", time)).expect("create log file"),
    );
    let term = simplelog::TermLogger::new(
        log::LevelFilter::Info,
        config.clone(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    simplelog::CombinedLogger::init(vec![term, file]).expect("initialize logger");
}

/// Global interrupt flag for graceful shutdown coordination.
static INTERRUPTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
/// Optional training deadline from TRAIN_DURATION env var.
static DEADLINE: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

/// Check if graceful shutdown was requested (via stdin "Q") or deadline reached.
/// Honored at batch-step boundaries only, never mid-update.
pub fn interrupted() -> bool {
    INTERRUPTED.load(std::sync::atomic::Ordering::Relaxed)
        || DEADLINE
            .get()
            .map_or(false, |d| std::time::Instant::now() >= *d)
}

/// Register graceful interrupt handler. Type "Q" + Enter to stop after the
/// in-flight batch. Optionally set TRAIN_DURATION (e.g., "2h") for timed runs.
pub fn brb() {
    if let Ok(duration) = std::env::var(ENV_TRAIN_DURATION) {
        if let Some(deadline) = parse_duration(&duration) {
            let _ = DEADLINE.set(std::time::Instant::now() + deadline);
            log::info!("training will stop after {}", duration);
        }
    }
    std::thread::spawn(|| {
        loop {
            let ref mut buffer = String::new();
            if let Ok(_) = std::io::stdin().read_line(buffer) {
                if buffer.trim().to_uppercase() == "Q" {
                    log::warn!("graceful interrupt requested, finishing current batch...");
                    INTERRUPTED.store(true, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
            }
        }
    });
}

/// Parse duration string like "30s", "5m", "2h", "1d" into Duration.
fn parse_duration(s: &str) -> Option<std::time::Duration> {
    let s = s.trim();
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let value: u64 = num.parse().ok()?;
    match unit {
        "s" => Some(std::time::Duration::from_secs(value)),
        "m" => Some(std::time::Duration::from_secs(value * 60)),
        "h" => Some(std::time::Duration::from_secs(value * 3600)),
        "d" => Some(std::time::Duration::from_secs(value * 86400)),
        _ => None,
    }
}

/// Whether run-level metric emission is enabled (rank 0 only reads this).
pub fn metrics_enabled() -> bool {
    std::env::var(ENV_ENABLE_METRICS).map_or(false, |v| v != "0" && !v.is_empty())
}
