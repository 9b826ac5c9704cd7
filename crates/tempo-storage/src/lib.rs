pub mod db;
pub mod error;
pub mod migrations;
pub mod models;

pub use db::{
    rolled_through_key, Compaction, Database, PeriodRollup, SessionQuery, COMPACTED_THROUGH,
    DEFAULT_LOCK_TIMEOUT,
};
pub use error::{Result, StoreError};
pub use models::{
    Application, Category, Goal, GoalKind, Granularity, IdleGap, MatchKind, NewApplication,
    PeriodStat, ProductivityLevel, Reassignment, Rule, Session, SessionRecord, StatScope,
};
