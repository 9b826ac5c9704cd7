use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical productivity levels on the weighted `[-1.0, 1.0]` scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductivityLevel {
    Productive,
    Neutral,
    Distracting,
}

impl ProductivityLevel {
    /// Weight of this level on the productivity scale
    #[must_use]
    pub const fn score(self) -> f64 {
        match self {
            Self::Productive => 1.0,
            Self::Neutral => 0.0,
            Self::Distracting => -1.0,
        }
    }

    /// Bucket an arbitrary weighted score into a level
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score > 0.0 {
            Self::Productive
        } else if score < 0.0 {
            Self::Distracting
        } else {
            Self::Neutral
        }
    }
}

/// Application observed in the foreground.
/// Identity is `canonical_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub canonical_name: String,
    pub display_name: String,
    pub category_id: i64,
    pub productivity_score: f64,
    /// Set when the user pinned category/score; rule changes leave it alone.
    pub user_override: bool,
}

/// New category and score for an existing application, applied when rules change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reassignment {
    pub app_id: i64,
    pub category_id: i64,
    pub productivity_score: f64,
}

/// Application row about to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewApplication {
    pub canonical_name: String,
    pub display_name: String,
    pub category_id: i64,
    pub productivity_score: f64,
}

/// A contiguous span of time attributed to one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub app_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Sub-threshold inactivity observed while the session was open
    pub idle_time_seconds: u32,
    /// Open sessions carry their last checkpointed sample time in `end_time`
    pub open: bool,
}

impl Session {
    #[must_use]
    pub fn duration_seconds(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds().max(0)
    }
}

/// Session joined with its application and category, for report consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session: Session,
    pub app_name: String,
    pub category_id: i64,
    pub productivity_score: f64,
}

/// Inactive time not attributed to any application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleGap {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl IdleGap {
    #[must_use]
    pub fn duration_seconds(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds().max(0)
    }
}

/// Application category with its default productivity weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub default_productivity_score: f64,
    pub builtin: bool,
}

impl Category {
    pub const UNCATEGORIZED: i64 = 1;
    pub const DEVELOPMENT: i64 = 2;
    pub const PRODUCTIVITY: i64 = 3;
    pub const COMMUNICATION: i64 = 4;
    pub const BROWSING: i64 = 5;
    pub const UTILITIES: i64 = 6;
    pub const MEDIA: i64 = 7;
    pub const ENTERTAINMENT: i64 = 8;
    pub const SOCIAL: i64 = 9;
    pub const GAMES: i64 = 10;

    /// First id handed out to user-defined categories
    pub const FIRST_USER_ID: i64 = 1000;

    /// Built-in categories, seeded on every open
    #[must_use]
    pub fn builtins() -> Vec<Self> {
        [
            (Self::UNCATEGORIZED, "Uncategorized", ProductivityLevel::Neutral),
            (Self::DEVELOPMENT, "Development", ProductivityLevel::Productive),
            (Self::PRODUCTIVITY, "Productivity", ProductivityLevel::Productive),
            (Self::COMMUNICATION, "Communication", ProductivityLevel::Neutral),
            (Self::BROWSING, "Browsing", ProductivityLevel::Neutral),
            (Self::UTILITIES, "Utilities", ProductivityLevel::Neutral),
            (Self::MEDIA, "Media", ProductivityLevel::Neutral),
            (Self::ENTERTAINMENT, "Entertainment", ProductivityLevel::Distracting),
            (Self::SOCIAL, "Social", ProductivityLevel::Distracting),
            (Self::GAMES, "Games", ProductivityLevel::Distracting),
        ]
        .into_iter()
        .map(|(id, name, level)| Self {
            id,
            name: name.to_string(),
            default_productivity_score: level.score(),
            builtin: true,
        })
        .collect()
    }

    #[must_use]
    pub fn level(&self) -> ProductivityLevel {
        ProductivityLevel::from_score(self.default_productivity_score)
    }
}

/// How a rule pattern is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Whole canonical app name
    Exact,
    /// Start of the canonical app name
    Prefix,
    /// Substring of the window title
    TitleContains,
}

impl MatchKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Prefix => "prefix",
            Self::TitleContains => "title_contains",
        }
    }
}

impl std::fmt::Display for MatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MatchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "title_contains" => Ok(Self::TitleContains),
            other => Err(format!("unknown match kind: {other}")),
        }
    }
}

/// User override mapping apps to a category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    /// Stored lowercased
    pub pattern: String,
    pub match_kind: MatchKind,
    pub category_id: i64,
    /// Higher wins among rules of equal specificity
    pub priority: i32,
    /// Declaration order, assigned by the store on insert
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    #[must_use]
    pub fn new(pattern: &str, match_kind: MatchKind, category_id: i64, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern: pattern.trim().to_lowercase(),
            match_kind,
            category_id,
            priority,
            position: 0,
            created_at: Utc::now(),
        }
    }

    /// Check whether the rule applies to a canonical app name and optional title
    #[must_use]
    pub fn matches(&self, canonical_name: &str, window_title: Option<&str>) -> bool {
        match self.match_kind {
            MatchKind::Exact => canonical_name == self.pattern,
            MatchKind::Prefix => canonical_name.starts_with(&self.pattern),
            MatchKind::TitleContains => window_title
                .is_some_and(|title| title.to_lowercase().contains(&self.pattern)),
        }
    }

    /// Longer patterns are more specific
    #[must_use]
    pub fn specificity(&self) -> usize {
        self.pattern.chars().count()
    }
}

/// Aggregation resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Self; 4] = [Self::Hour, Self::Day, Self::Week, Self::Month];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

/// What a period aggregate row is grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StatScope {
    App(i64),
    Category(i64),
}

impl StatScope {
    #[must_use]
    pub const fn kind(self) -> &'static str {
        match self {
            Self::App(_) => "app",
            Self::Category(_) => "category",
        }
    }

    #[must_use]
    pub const fn id(self) -> i64 {
        match self {
            Self::App(id) | Self::Category(id) => id,
        }
    }

    /// Rebuild from the stored `(kind, id)` pair
    #[must_use]
    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "app" => Some(Self::App(id)),
            "category" => Some(Self::Category(id)),
            _ => None,
        }
    }
}

/// Rolled-up usage for one scope over one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodStat {
    pub granularity: Granularity,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub scope: StatScope,
    pub total_seconds: i64,
    pub productive_seconds: i64,
    pub distracting_seconds: i64,
    pub idle_seconds: i64,
    pub session_count: u32,
    /// Sum of `score * seconds`, kept so the productivity index survives compaction
    pub score_seconds: f64,
}

/// Kind of user goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    /// Reach at least `target_value` minutes per day
    DailyMinutes,
    /// Stay under `target_value` minutes per day for one app
    AppLimit,
}

impl GoalKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyMinutes => "daily_minutes",
            Self::AppLimit => "app_limit",
        }
    }
}

impl std::str::FromStr for GoalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_minutes" => Ok(Self::DailyMinutes),
            "app_limit" => Ok(Self::AppLimit),
            other => Err(format!("unknown goal kind: {other}")),
        }
    }
}

/// User goal, read by the aggregator when scoring a day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub kind: GoalKind,
    pub target_value: u32,
    /// Category name for `DailyMinutes` (none = all productive time),
    /// canonical app name for `AppLimit`
    pub scope: Option<String>,
}

impl Goal {
    #[must_use]
    pub fn new(kind: GoalKind, target_value: u32, scope: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target_value,
            scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_score() {
        assert_eq!(ProductivityLevel::from_score(0.5), ProductivityLevel::Productive);
        assert_eq!(ProductivityLevel::from_score(0.0), ProductivityLevel::Neutral);
        assert_eq!(ProductivityLevel::from_score(-0.2), ProductivityLevel::Distracting);
    }

    #[test]
    fn test_builtin_ids_below_user_range() {
        let builtins = Category::builtins();
        assert_eq!(builtins.len(), 10);
        assert!(builtins.iter().all(|c| c.id < Category::FIRST_USER_ID));
        assert!(builtins.iter().all(|c| c.builtin));
    }

    #[test]
    fn test_rule_pattern_is_lowercased() {
        let rule = Rule::new("  Visual Studio ", MatchKind::Prefix, Category::DEVELOPMENT, 1);
        assert_eq!(rule.pattern, "visual studio");
        assert!(rule.matches("visual studio code", None));
        assert!(!rule.matches("code", None));
    }

    #[test]
    fn test_title_rule_needs_title() {
        let rule = Rule::new("YouTube", MatchKind::TitleContains, Category::ENTERTAINMENT, 1);
        assert!(rule.matches("firefox", Some("Cats - YouTube - Mozilla Firefox")));
        assert!(!rule.matches("firefox", None));
    }

    #[test]
    fn test_stat_scope_parts() {
        let scope = StatScope::Category(4);
        assert_eq!(StatScope::from_parts(scope.kind(), scope.id()), Some(scope));
        assert_eq!(StatScope::from_parts("project", 1), None);
    }

    #[test]
    fn test_match_kind_parse() {
        assert_eq!("title_contains".parse::<MatchKind>(), Ok(MatchKind::TitleContains));
        assert!("regex".parse::<MatchKind>().is_err());
    }
}
