pub mod aggregator;
pub mod categorizer;
pub mod config;
pub mod daemon;
pub mod error;
pub mod monitor;
pub mod recorder;
pub mod sampler;
pub mod session_builder;

pub use aggregator::{Aggregator, GoalProgress, PassReport, PeriodSummary};
pub use categorizer::{canonical_name, rank_rules, Categorizer, Classification};
pub use config::{EngineConfig, FlickerPolicy};
pub use daemon::{Daemon, RunSummary};
pub use error::{EngineError, ProbeError, Result};
pub use recorder::Recorder;
pub use sampler::{Sample, Sampler, SamplerHealth};
pub use session_builder::{RunTotals, SessionBuilder, Transition};
