pub mod checkpoint;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest};
pub use config::{TrainingConfig, TrainingError};
pub use data::{DataSplits, ForecastDataLoader, ForecastWindow, InMemoryDataLoader, WindowShape};
pub use early_stopping::EarlyStopping;
pub use loss::{HorizonMseLoss, LossOutput};
pub use metrics::{EpochSummary, HorizonErrors};
pub use trainer::{TestReport, Trainer};
