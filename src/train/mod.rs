mod checkpoint;
mod logbook;
mod trainer;

pub use checkpoint::CheckpointMeta;
pub use checkpoint::FINAL_CHECKPOINT;
pub use logbook::Logbook;
pub use logbook::Progress;
pub use trainer::Trainer;
