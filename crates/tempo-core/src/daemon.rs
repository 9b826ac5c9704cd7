use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tempo_storage::{Category, Database, Rule};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::aggregator::Aggregator;
use crate::categorizer::{Categorizer, Classification};
use crate::config::EngineConfig;
use crate::error::{EngineError, ProbeError, Result};
use crate::monitor::{create_probes, Probes};
use crate::recorder::{Recorder, RecorderStats};
use crate::sampler::{Clock, Sampler, SamplerHealth, SystemClock};
use crate::session_builder::{RunTotals, SessionBuilder};

/// What one run of the engine did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub totals: RunTotals,
    pub recorder: RecorderStats,
    pub health: SamplerHealth,
}

/// Owns the sampling, recording and aggregation tasks
pub struct Daemon {
    config: EngineConfig,
    db: Arc<Database>,
    probes: Probes,
    clock: Arc<dyn Clock>,
    categorizer: Arc<RwLock<Categorizer>>,
    aggregator: Aggregator,
}

impl Daemon {
    /// Open the configured store, close sessions left open by a crash and
    /// select the platform probes
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for a bad config, or `Store` if the store
    /// cannot be opened (including `SchemaMismatch`)
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open_with_timeout(config.db_path.clone(), config.store_lock_timeout())?;
        db.recover_open_sessions()?;
        Self::with_parts(config, Arc::new(db), create_probes(), Arc::new(SystemClock))
    }

    /// Assemble a daemon from explicit parts
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` or `Store` if the categorizer cannot be loaded
    pub fn with_parts(
        config: EngineConfig,
        db: Arc<Database>,
        probes: Probes,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let categorizer = Arc::new(RwLock::new(Categorizer::from_database(&db)?));
        let aggregator = Aggregator::new(db.clone(), &config)?;
        Ok(Self {
            config,
            db,
            probes,
            clock,
            categorizer,
            aggregator,
        })
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    #[must_use]
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Classify with the live rule set
    #[must_use]
    pub fn classify(&self, app_name: &str, window_title: Option<&str>) -> Classification {
        self.categorizer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .categorize(app_name, window_title)
    }

    /// Store a rule and recategorize every application it changes, in one
    /// transaction. Applications seen afterwards use the new rule too.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the rule's category is unknown or the write fails
    pub fn add_rule(&self, rule: Rule) -> Result<Rule> {
        let apps = self.db.get_applications()?;
        let mut live = self
            .categorizer
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        // Preview against the persisted rule set, where the store appends
        // the new rule after the highest position
        let mut refreshed = Categorizer::from_database(&self.db)?;
        let mut candidate = refreshed.clone();
        let next_position = candidate
            .rules()
            .iter()
            .map(|r| r.position)
            .max()
            .map_or(1, |p| p + 1);
        candidate.add_rule(Rule {
            position: next_position,
            ..rule.clone()
        });
        let reassignments = candidate.reassignments(&apps);

        let stored = self.db.add_rule_with_recategorization(&rule, &reassignments)?;
        refreshed.add_rule(stored.clone());
        *live = refreshed;
        Ok(stored)
    }

    /// Delete a rule. Applications keep their current category; apps seen
    /// afterwards no longer match it.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the delete or the rule reload fails
    pub fn delete_rule(&self, rule_id: uuid::Uuid) -> Result<bool> {
        let mut live = self
            .categorizer
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let deleted = self.db.delete_rule(rule_id)?;
        *live = Categorizer::from_database(&self.db)?;
        Ok(deleted)
    }

    /// Create a user category and make it available to rules
    ///
    /// # Errors
    ///
    /// Returns `Store` for a duplicate name or an out-of-range score
    pub fn add_category(&self, name: &str, default_productivity_score: f64) -> Result<Category> {
        let category = self.db.add_category(name, default_productivity_score)?;
        self.categorizer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_category(category.clone());
        Ok(category)
    }

    /// Poll both probes once. A probe that reports itself unavailable is
    /// fatal; anything else is left to the sampler's degraded mode.
    ///
    /// # Errors
    ///
    /// Returns `ProbeUnavailable` when this platform cannot be sampled
    pub async fn preflight(&self) -> Result<()> {
        let limit = self.config.probe_timeout();

        match tokio::time::timeout(limit, self.probes.window.poll()).await {
            Ok(Ok(window)) => log::info!("Window probe ready (foreground: {})", window.app_name),
            Ok(Err(ProbeError::Unavailable(reason))) => {
                return Err(EngineError::ProbeUnavailable(reason))
            }
            Ok(Err(e)) => log::warn!("Window probe not ready: {e}"),
            Err(_) => log::warn!("Window probe did not answer within {limit:?}"),
        }

        match tokio::time::timeout(limit, self.probes.idle.idle_seconds()).await {
            Ok(Ok(idle)) => log::info!("Idle probe ready ({idle}s idle)"),
            Ok(Err(ProbeError::Unavailable(reason))) => {
                return Err(EngineError::ProbeUnavailable(reason))
            }
            Ok(Err(e)) => log::warn!("Idle probe not ready: {e}"),
            Err(_) => log::warn!("Idle probe did not answer within {limit:?}"),
        }
        Ok(())
    }

    /// Run until `stop` flips to true.
    ///
    /// Stop order: the sampler finishes its sample and closes the open
    /// session, the recorder drains every transition, then the aggregator
    /// runs a final pass.
    ///
    /// # Errors
    ///
    /// Returns `ProbeUnavailable` from the preflight, or `Store` if the
    /// recorder gave up. In the latter case sampling stops at once but
    /// aggregation keeps running until `stop`.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<RunSummary> {
        self.preflight().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (aggregation_stop_tx, aggregation_stop_rx) = watch::channel(false);

        let sampler = Sampler::new(self.probes.clone(), &self.config, self.clock.clone());
        let health = sampler.subscribe_health();
        let builder = SessionBuilder::new(&self.config);
        let sampling = tokio::spawn(sampler.run(builder, tx, stop.clone()));

        let recorder = Recorder::new(self.db.clone(), self.categorizer.clone(), &self.config);
        let recording = tokio::task::spawn_blocking(move || recorder.run_blocking(rx));

        let aggregation = tokio::spawn(aggregation_loop(
            self.aggregator.clone(),
            self.clock.clone(),
            self.config.aggregation_interval(),
            aggregation_stop_rx,
        ));

        log::info!("Daemon started");

        let totals = sampling.await?;
        let recorded = recording.await?;
        if recorded.is_err() {
            // Sampling is over; keep aggregating until asked to stop
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        }

        // Receivers may already be gone if the aggregation task panicked
        let _ = aggregation_stop_tx.send(true);
        aggregation.await?;

        let recorder = recorded?;
        let health = *health.borrow();
        log::info!("Daemon shut down gracefully.");
        Ok(RunSummary {
            totals,
            recorder,
            health,
        })
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// See [`Daemon::run`].
    pub async fn run_with_signals(&self) -> Result<RunSummary> {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("Received Ctrl-C, shutting down..."),
                Err(e) => log::error!("Signal handler failed, shutting down: {e}"),
            }
            let _ = stop_tx.send(true);
        });
        self.run(stop_rx).await
    }
}

async fn aggregation_loop(
    aggregator: Aggregator,
    clock: Arc<dyn Clock>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => aggregate_once(&aggregator, &clock).await,
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    // Final pass flushes the watermarks
    aggregate_once(&aggregator, &clock).await;
}

async fn aggregate_once(aggregator: &Aggregator, clock: &Arc<dyn Clock>) {
    let aggregator = aggregator.clone();
    let now = clock.now();
    match tokio::task::spawn_blocking(move || aggregator.run_pass(now)).await {
        Ok(Ok(report)) => log::debug!("Aggregation pass: {report:?}"),
        Ok(Err(e)) => log::error!("Aggregation pass failed, retrying next interval: {e}"),
        Err(e) => log::error!("Aggregation pass panicked: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::unavailable::UnavailableProbe;
    use crate::monitor::{IdleProbe, WindowInfo, WindowProbe};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempo_storage::{MatchKind, SessionQuery};

    /// Wall-clock time since construction, rounded to whole seconds past
    /// a fixed base
    struct SteppedClock {
        base: DateTime<Utc>,
        started: std::time::Instant,
    }

    impl Clock for SteppedClock {
        fn now(&self) -> DateTime<Utc> {
            let millis = self.started.elapsed().as_millis() + 500;
            self.base + chrono::Duration::seconds(i64::try_from(millis / 1000).unwrap())
        }
    }

    struct Focused {
        app: &'static str,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl WindowProbe for Focused {
        async fn poll(&self) -> std::result::Result<WindowInfo, ProbeError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(WindowInfo {
                app_name: self.app.to_string(),
                window_title: None,
            })
        }
    }

    #[async_trait]
    impl IdleProbe for Focused {
        async fn idle_seconds(&self) -> std::result::Result<u64, ProbeError> {
            Ok(0)
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
    }

    /// One-second sampling so a run spans a few real seconds
    fn fast_config() -> EngineConfig {
        EngineConfig {
            sample_interval_secs: 1,
            ..EngineConfig::default()
        }
    }

    fn daemon_with(config: EngineConfig, db: Database, probes: Probes) -> Daemon {
        let clock = Arc::new(SteppedClock {
            base: base(),
            started: std::time::Instant::now(),
        });
        Daemon::with_parts(config, Arc::new(db), probes, clock).unwrap()
    }

    fn daemon(probes: Probes) -> Daemon {
        daemon_with(fast_config(), Database::open_in_memory().unwrap(), probes)
    }

    fn focused(app: &'static str) -> (Arc<Focused>, Probes) {
        let probe = Arc::new(Focused {
            app,
            polls: AtomicUsize::new(0),
        });
        let probes = Probes {
            window: probe.clone(),
            idle: probe.clone(),
        };
        (probe, probes)
    }

    fn stop_after(millis: u64) -> (watch::Receiver<bool>, tokio::task::JoinHandle<()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            stop_tx.send(true).unwrap();
        });
        (stop_rx, stopper)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_records_session_until_stop() {
        let (_, probes) = focused("Code");
        let daemon = daemon(probes);

        // Samples at 0, 1, 2 and 3 seconds; stop lands between samples
        let (stop_rx, stopper) = stop_after(3500);
        let summary = daemon.run(stop_rx).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(summary.totals.session_seconds, 3);
        assert!(!summary.health.degraded);
        assert_eq!(summary.recorder.retries, 0);

        let sessions = daemon
            .database()
            .get_sessions(&SessionQuery::range(base(), base() + chrono::Duration::hours(1)))
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].app_name, "code");
        assert!(!sessions[0].session.open);
        assert_eq!(sessions[0].session.start_time, base());
        assert_eq!(
            sessions[0].session.end_time,
            base() + chrono::Duration::seconds(3)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_failure_stops_sampling_but_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tempo.db");
        let config = EngineConfig {
            store_lock_timeout_ms: 50,
            store_write_retries: 1,
            ..fast_config()
        };
        let db = Database::open_with_timeout(Some(path.clone()), config.store_lock_timeout())
            .unwrap();
        let (probe, probes) = focused("Code");
        let daemon = daemon_with(config, db, probes);

        // Every write from here on times out
        let holder = rusqlite::Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let watcher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            let halted_at = probe.polls.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2000)).await;
            let later = probe.polls.load(Ordering::SeqCst);
            stop_tx.send(true).unwrap();
            (halted_at, later)
        });

        let result = daemon.run(stop_rx).await;
        let (halted_at, later) = watcher.await.unwrap();

        // run only returned once asked to stop
        assert!(matches!(
            result,
            Err(EngineError::Store(tempo_storage::StoreError::Busy))
        ));
        // preflight, the opening sample and at most one more
        assert!(halted_at <= 3);
        assert_eq!(halted_at, later);

        holder.execute_batch("ROLLBACK").unwrap();
        assert!(daemon.database().get_open_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_probe_is_fatal() {
        let probe = Arc::new(UnavailableProbe::new("plan9"));
        let daemon = daemon(Probes {
            window: probe.clone(),
            idle: probe,
        });
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert!(matches!(
            daemon.run(stop_rx).await,
            Err(EngineError::ProbeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_add_rule_recategorizes_existing_apps() {
        let daemon = daemon(focused("Firefox").1);
        let db = daemon.database();
        db.insert_application(&tempo_storage::NewApplication {
            canonical_name: String::from("firefox"),
            display_name: String::from("Firefox"),
            category_id: Category::BROWSING,
            productivity_score: 0.0,
        })
        .unwrap();

        let stored = daemon
            .add_rule(Rule::new("fire", MatchKind::Prefix, Category::DEVELOPMENT, 0))
            .unwrap();
        assert_eq!(stored.position, 1);

        let app = db.get_application("firefox").unwrap().unwrap();
        assert_eq!(app.category_id, Category::DEVELOPMENT);
        assert_eq!(daemon.classify("Firefox", None).category_id, Category::DEVELOPMENT);
    }

    #[tokio::test]
    async fn test_rule_preview_follows_stored_order() {
        let daemon = daemon(focused("Firefox").1);
        let db = daemon.database();
        db.insert_application(&tempo_storage::NewApplication {
            canonical_name: String::from("firefox"),
            display_name: String::from("Firefox"),
            category_id: Category::BROWSING,
            productivity_score: 0.0,
        })
        .unwrap();

        // Written straight to the store, so the live rule set never saw it
        let earlier = db
            .add_rule_with_recategorization(
                &Rule::new("firefox", MatchKind::Exact, Category::GAMES, 0),
                &[],
            )
            .unwrap();
        assert_eq!(earlier.position, 1);

        let stored = daemon
            .add_rule(Rule::new("firefox", MatchKind::Exact, Category::DEVELOPMENT, 0))
            .unwrap();
        assert_eq!(stored.position, 2);

        // Exact ties go to the first declared rule
        let app = db.get_application("firefox").unwrap().unwrap();
        assert_eq!(app.category_id, Category::GAMES);
        assert_eq!(daemon.classify("Firefox", None).category_id, Category::GAMES);
    }

    #[tokio::test]
    async fn test_deleted_rule_stops_matching() {
        let daemon = daemon(focused("Firefox").1);
        let rule = daemon
            .add_rule(Rule::new("firefox", MatchKind::Exact, Category::DEVELOPMENT, 0))
            .unwrap();
        assert_eq!(daemon.classify("Firefox", None).category_id, Category::DEVELOPMENT);

        assert!(daemon.delete_rule(rule.id).unwrap());
        assert!(!daemon.delete_rule(rule.id).unwrap());
        assert_ne!(daemon.classify("Firefox", None).category_id, Category::DEVELOPMENT);
        assert!(daemon.database().get_rules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rule_for_new_category() {
        let daemon = daemon(focused("Code").1);
        let research = daemon.add_category("Research", 0.5).unwrap();
        assert!(research.id >= Category::FIRST_USER_ID);

        daemon
            .add_rule(Rule::new("arxiv", MatchKind::TitleContains, research.id, 0))
            .unwrap();
        let class = daemon.classify("Firefox", Some("arXiv listing"));
        assert_eq!(class.category_id, research.id);
        assert!((class.score - 0.5).abs() < f64::EPSILON);
    }
}
