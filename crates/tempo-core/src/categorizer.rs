use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tempo_storage::{
    Application, Category, Database, MatchKind, Reassignment, Rule, StoreError,
};

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

static BUNDLE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\s*\.(?:exe|app))+$").expect("Invalid bundle suffix regex"));

/// Built-in app table, keyed by canonical name
const DEFAULT_APPS: &[(&str, i64)] = &[
    // Editors, IDEs, terminals, developer tools
    ("visual studio code", Category::DEVELOPMENT),
    ("vscode", Category::DEVELOPMENT),
    ("code", Category::DEVELOPMENT),
    ("pycharm", Category::DEVELOPMENT),
    ("intellij", Category::DEVELOPMENT),
    ("intellij idea", Category::DEVELOPMENT),
    ("eclipse", Category::DEVELOPMENT),
    ("sublime text", Category::DEVELOPMENT),
    ("xcode", Category::DEVELOPMENT),
    ("android studio", Category::DEVELOPMENT),
    ("vim", Category::DEVELOPMENT),
    ("nvim", Category::DEVELOPMENT),
    ("emacs", Category::DEVELOPMENT),
    ("nano", Category::DEVELOPMENT),
    ("terminal", Category::DEVELOPMENT),
    ("console", Category::DEVELOPMENT),
    ("iterm", Category::DEVELOPMENT),
    ("iterm2", Category::DEVELOPMENT),
    ("powershell", Category::DEVELOPMENT),
    ("gnome-terminal", Category::DEVELOPMENT),
    ("konsole", Category::DEVELOPMENT),
    ("alacritty", Category::DEVELOPMENT),
    ("kitty", Category::DEVELOPMENT),
    ("wezterm", Category::DEVELOPMENT),
    ("git", Category::DEVELOPMENT),
    ("github desktop", Category::DEVELOPMENT),
    ("postman", Category::DEVELOPMENT),
    ("docker desktop", Category::DEVELOPMENT),
    // Office and notes
    ("microsoft word", Category::PRODUCTIVITY),
    ("microsoft excel", Category::PRODUCTIVITY),
    ("microsoft powerpoint", Category::PRODUCTIVITY),
    ("google docs", Category::PRODUCTIVITY),
    ("google sheets", Category::PRODUCTIVITY),
    ("libreoffice", Category::PRODUCTIVITY),
    ("notion", Category::PRODUCTIVITY),
    ("obsidian", Category::PRODUCTIVITY),
    ("roam research", Category::PRODUCTIVITY),
    // Browsers
    ("firefox", Category::BROWSING),
    ("chrome", Category::BROWSING),
    ("google chrome", Category::BROWSING),
    ("chromium", Category::BROWSING),
    ("safari", Category::BROWSING),
    ("edge", Category::BROWSING),
    ("microsoft edge", Category::BROWSING),
    ("brave", Category::BROWSING),
    // Mail and work chat
    ("thunderbird", Category::COMMUNICATION),
    ("mail", Category::COMMUNICATION),
    ("outlook", Category::COMMUNICATION),
    ("slack", Category::COMMUNICATION),
    ("microsoft teams", Category::COMMUNICATION),
    ("teams", Category::COMMUNICATION),
    ("zoom", Category::COMMUNICATION),
    // System
    ("finder", Category::UTILITIES),
    ("explorer", Category::UTILITIES),
    ("file manager", Category::UTILITIES),
    ("nautilus", Category::UTILITIES),
    ("settings", Category::UTILITIES),
    ("system preferences", Category::UTILITIES),
    ("system settings", Category::UTILITIES),
    // Music
    ("spotify", Category::MEDIA),
    ("apple music", Category::MEDIA),
    ("music", Category::MEDIA),
    ("vlc", Category::MEDIA),
    // Video
    ("youtube", Category::ENTERTAINMENT),
    ("netflix", Category::ENTERTAINMENT),
    ("twitch", Category::ENTERTAINMENT),
    ("disney+", Category::ENTERTAINMENT),
    // Social and personal chat
    ("facebook", Category::SOCIAL),
    ("twitter", Category::SOCIAL),
    ("instagram", Category::SOCIAL),
    ("tiktok", Category::SOCIAL),
    ("reddit", Category::SOCIAL),
    ("discord", Category::SOCIAL),
    ("whatsapp", Category::SOCIAL),
    ("telegram", Category::SOCIAL),
    ("signal", Category::SOCIAL),
    // Games
    ("steam", Category::GAMES),
    ("epic games", Category::GAMES),
    ("epic games launcher", Category::GAMES),
    ("league of legends", Category::GAMES),
];

/// Canonical application identity: trimmed, lowercased, `.exe`/`.app`
/// stripped, internal whitespace collapsed.
#[must_use]
pub fn canonical_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let stripped = BUNDLE_SUFFIX_RE.replace(&lowered, "");
    WHITESPACE_RE.replace_all(stripped.trim(), " ").into_owned()
}

/// Pick the winning rule for an app. Exact rules beat every other kind and
/// rank by priority; prefix and title rules rank by pattern length, then
/// priority. Remaining ties go to the rule declared first.
pub fn rank_rules<'a, I>(rules: I, canonical_name: &str, window_title: Option<&str>) -> Option<&'a Rule>
where
    I: IntoIterator<Item = &'a Rule>,
{
    rules
        .into_iter()
        .filter(|rule| rule.matches(canonical_name, window_title))
        .max_by_key(|rule| {
            let exact = rule.match_kind == MatchKind::Exact;
            let specificity = if exact { 0 } else { rule.specificity() };
            (exact, specificity, rule.priority, Reverse(rule.position))
        })
}

/// Classification result with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category_id: i64,
    pub category_name: String,
    pub score: f64,
    pub matched_rule_id: Option<uuid::Uuid>,
    pub source: ClassificationSource,
}

/// Where the classification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationSource {
    UserRule,
    BuiltIn,
    Default,
}

/// Maps applications to categories.
/// Priority: user rules > built-in app table > Uncategorized
#[derive(Debug, Clone)]
pub struct Categorizer {
    categories: HashMap<i64, Category>,
    rules: Vec<Rule>,
}

impl Categorizer {
    /// `rules` must be in declaration order
    #[must_use]
    pub fn new(categories: Vec<Category>, rules: Vec<Rule>) -> Self {
        Self {
            categories: categories.into_iter().map(|c| (c.id, c)).collect(),
            rules,
        }
    }

    /// Create a categorizer from stored categories and rules
    ///
    /// # Errors
    ///
    /// Returns an error if database queries fail
    pub fn from_database(db: &Database) -> Result<Self, StoreError> {
        let categories = db.get_categories()?;
        let rules = db.get_rules()?;
        log::info!(
            "Loaded {} categories, {} user rules",
            categories.len(),
            rules.len()
        );
        Ok(Self::new(categories, rules))
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Register a category created after startup
    pub fn add_category(&mut self, category: Category) {
        self.categories.insert(category.id, category);
    }

    /// Append a stored rule (with its assigned position)
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.position);
    }

    /// Classify an application
    #[must_use]
    pub fn categorize(&self, app_name: &str, window_title: Option<&str>) -> Classification {
        let name = canonical_name(app_name);

        let usable = self
            .rules
            .iter()
            .filter(|rule| self.categories.contains_key(&rule.category_id));
        if let Some(rule) = rank_rules(usable, &name, window_title) {
            log::debug!(
                "Matched {} rule '{}' for '{name}' -> category {}",
                rule.match_kind,
                rule.pattern,
                rule.category_id
            );
            return self.classification(rule.category_id, Some(rule.id), ClassificationSource::UserRule);
        }

        if let Some(&(_, category_id)) = DEFAULT_APPS.iter().find(|(app, _)| *app == name) {
            if self.categories.contains_key(&category_id) {
                return self.classification(category_id, None, ClassificationSource::BuiltIn);
            }
        }

        self.classification(Category::UNCATEGORIZED, None, ClassificationSource::Default)
    }

    /// Category and score changes needed to bring `apps` in line with the
    /// current rules. Pinned apps are skipped.
    #[must_use]
    pub fn reassignments(&self, apps: &[Application]) -> Vec<Reassignment> {
        apps.iter()
            .filter(|app| !app.user_override)
            .filter_map(|app| {
                let class = self.categorize(&app.canonical_name, None);
                let changed = class.category_id != app.category_id
                    || (class.score - app.productivity_score).abs() > f64::EPSILON;
                changed.then_some(Reassignment {
                    app_id: app.id,
                    category_id: class.category_id,
                    productivity_score: class.score,
                })
            })
            .collect()
    }

    fn classification(
        &self,
        category_id: i64,
        matched_rule_id: Option<uuid::Uuid>,
        source: ClassificationSource,
    ) -> Classification {
        let (category_name, score) = self
            .categories
            .get(&category_id)
            .map_or_else(|| (String::from("Uncategorized"), 0.0), |c| {
                (c.name.clone(), c.default_productivity_score)
            });
        Classification {
            category_id,
            category_name,
            score,
            matched_rule_id,
            source,
        }
    }
}
