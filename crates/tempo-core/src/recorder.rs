//! Persists session transitions.
//!
//! The recorder is the only consumer of the sampler's transition channel and
//! runs on a blocking thread, so a slow disk never stalls sampling. Newly
//! seen applications are categorized here, once, when they are first stored.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tempo_storage::{Database, NewApplication, StoreError};
use tokio::sync::mpsc;

use crate::categorizer::Categorizer;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::session_builder::{SessionKey, Transition};

/// Linear retry step: attempt `n` waits `n * RETRY_STEP`
const RETRY_STEP: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub applied: u64,
    pub retries: u64,
}

pub struct Recorder {
    db: Arc<Database>,
    categorizer: Arc<RwLock<Categorizer>>,
    /// Builder key -> store row id, for sessions that may still change
    sessions: HashMap<SessionKey, i64>,
    /// Canonical name -> application id
    apps: HashMap<String, i64>,
    max_retries: u32,
    stats: RecorderStats,
}

impl Recorder {
    #[must_use]
    pub fn new(db: Arc<Database>, categorizer: Arc<RwLock<Categorizer>>, config: &EngineConfig) -> Self {
        Self {
            db,
            categorizer,
            sessions: HashMap::new(),
            apps: HashMap::new(),
            max_retries: config.store_write_retries,
            stats: RecorderStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Drain `rx` until every sender is gone. Blocks the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `Store` once a transition still fails after all retries. The
    /// receiver is dropped with it, which stops the sampler.
    pub fn run_blocking(mut self, mut rx: mpsc::UnboundedReceiver<Transition>) -> Result<RecorderStats> {
        log::info!("Recorder started");
        while let Some(transition) = rx.blocking_recv() {
            if let Err(e) = self.apply(&transition) {
                log::error!("Recorder halting on {transition:?}: {e}");
                return Err(e);
            }
        }
        log::info!(
            "Recorder drained: {} transitions applied, {} retries",
            self.stats.applied,
            self.stats.retries
        );
        Ok(self.stats)
    }

    /// Apply one transition, retrying lock timeouts and I/O failures
    ///
    /// # Errors
    ///
    /// Returns `Store` if the write is rejected or retries run out
    pub fn apply(&mut self, transition: &Transition) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_apply(transition) {
                Ok(()) => {
                    self.stats.applied += 1;
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    attempt += 1;
                    self.stats.retries += 1;
                    log::warn!("Store write failed ({e}), retry {attempt}/{}", self.max_retries);
                    std::thread::sleep(RETRY_STEP * attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_apply(&mut self, transition: &Transition) -> std::result::Result<(), StoreError> {
        match transition {
            Transition::Opened {
                key,
                app_name,
                display_name,
                window_title,
                start,
            } => {
                let app_id = self.resolve_app(app_name, display_name, window_title.as_deref())?;
                let id = self.db.insert_open_session(app_id, *start)?;
                self.sessions.insert(*key, id);
            }
            Transition::Extended {
                key,
                end,
                idle_seconds,
            } => {
                self.db
                    .checkpoint_session(self.session_id(*key)?, *end, *idle_seconds)?;
            }
            Transition::Closed {
                key,
                end,
                idle_seconds,
            } => {
                self.db
                    .close_session(self.session_id(*key)?, *end, *idle_seconds)?;
                // Only the most recently closed session can be reopened
                let closed = *key;
                self.sessions.retain(|k, _| *k >= closed);
            }
            Transition::Discarded { key } => {
                self.db.discard_session(self.session_id(*key)?)?;
                self.sessions.remove(key);
            }
            Transition::Reopened {
                key,
                discarded,
                end,
                idle_seconds,
            } => {
                self.db.merge_flicker(
                    self.session_id(*key)?,
                    self.session_id(*discarded)?,
                    *end,
                    *idle_seconds,
                )?;
                self.sessions.remove(discarded);
            }
            Transition::IdleGap { start, end } => {
                self.db.insert_idle_gap(*start, *end)?;
            }
        }
        Ok(())
    }

    fn session_id(&self, key: SessionKey) -> std::result::Result<i64, StoreError> {
        self.sessions
            .get(&key)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("session key {key}")))
    }

    fn resolve_app(
        &mut self,
        canonical: &str,
        display_name: &str,
        window_title: Option<&str>,
    ) -> std::result::Result<i64, StoreError> {
        if let Some(&id) = self.apps.get(canonical) {
            return Ok(id);
        }

        let id = if let Some(app) = self.db.get_application(canonical)? {
            app.id
        } else {
            let class = self
                .categorizer
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .categorize(canonical, window_title);
            let app = self.db.insert_application(&NewApplication {
                canonical_name: canonical.to_string(),
                display_name: display_name.to_string(),
                category_id: class.category_id,
                productivity_score: class.score,
            })?;
            log::info!(
                "New application '{}' categorized as {} ({:?})",
                app.display_name,
                class.category_name,
                class.source
            );
            app.id
        };

        self.apps.insert(canonical.to_string(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlickerPolicy;
    use crate::sampler::Sample;
    use crate::session_builder::SessionBuilder;
    use chrono::{DateTime, TimeZone, Utc};
    use tempo_storage::{Category, MatchKind, Rule, SessionQuery};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn recorder() -> (Arc<Database>, Recorder) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let categorizer = Arc::new(RwLock::new(Categorizer::from_database(&db).unwrap()));
        let recorder = Recorder::new(db.clone(), categorizer, &EngineConfig::default());
        (db, recorder)
    }

    fn opened(key: SessionKey, app: &str, start: i64) -> Transition {
        Transition::Opened {
            key,
            app_name: app.to_lowercase(),
            display_name: app.to_string(),
            window_title: None,
            start: at(start),
        }
    }

    fn record_samples(recorder: &mut Recorder, policy: FlickerPolicy, samples: &[(&str, i64, u64)]) {
        let mut builder = SessionBuilder::new(&EngineConfig {
            flicker_policy: policy,
            ..EngineConfig::default()
        });
        let mut transitions = Vec::new();
        for &(app, secs, idle) in samples {
            transitions.extend(builder.push(&Sample {
                app_name: app.to_string(),
                window_title: None,
                timestamp: at(secs),
                idle_seconds: idle,
            }));
        }
        transitions.extend(builder.finish());
        for t in &transitions {
            recorder.apply(t).unwrap();
        }
    }

    #[test]
    fn test_new_application_is_categorized_once() {
        let (db, mut recorder) = recorder();
        recorder.apply(&opened(1, "Code", 0)).unwrap();
        recorder
            .apply(&Transition::Closed {
                key: 1,
                end: at(10),
                idle_seconds: 0,
            })
            .unwrap();
        db.set_application_override("code", Category::GAMES, -1.0)
            .unwrap();
        recorder.apply(&opened(2, "Code", 20)).unwrap();

        let app = db.get_application("code").unwrap().unwrap();
        assert_eq!(app.display_name, "Code");
        assert_eq!(app.category_id, Category::GAMES);
        assert_eq!(db.get_applications().unwrap().len(), 1);
    }

    #[test]
    fn test_switch_scenario_is_persisted() {
        let (db, mut recorder) = recorder();
        record_samples(
            &mut recorder,
            FlickerPolicy::Merge,
            &[("A", 0, 0), ("A", 10, 0), ("A", 20, 0), ("B", 30, 0), ("B", 40, 0)],
        );

        let sessions = db.get_sessions(&SessionQuery::range(at(0), at(100))).unwrap();
        let spans: Vec<_> = sessions
            .iter()
            .map(|r| (r.app_name.as_str(), r.session.start_time, r.session.end_time, r.session.open))
            .collect();
        assert_eq!(
            spans,
            vec![("a", at(0), at(20), false), ("b", at(30), at(40), false)]
        );
        assert_eq!(recorder.stats().applied, 7);
    }

    #[test]
    fn test_idle_scenario_persists_gap() {
        let (db, mut recorder) = recorder();
        record_samples(&mut recorder, FlickerPolicy::Merge, &[("A", 0, 0), ("A", 10, 400)]);

        let sessions = db.get_sessions(&SessionQuery::range(at(0), at(100))).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session.duration_seconds(), 0);

        let gaps = db.get_idle_gaps(at(0), at(100)).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].start_time, gaps[0].end_time), (at(0), at(10)));
    }

    #[test]
    fn test_flicker_merge_is_persisted() {
        let (db, mut recorder) = recorder();
        record_samples(
            &mut recorder,
            FlickerPolicy::Merge,
            &[("A", 0, 0), ("A", 100, 0), ("B", 105, 0), ("A", 110, 0), ("A", 120, 0)],
        );

        let sessions = db.get_sessions(&SessionQuery::range(at(0), at(200))).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].app_name, "a");
        assert_eq!(sessions[0].session.end_time, at(120));
        assert!(!sessions[0].session.open);
    }

    #[test]
    fn test_discarded_flicker_is_deleted() {
        let (db, mut recorder) = recorder();
        record_samples(
            &mut recorder,
            FlickerPolicy::Discard,
            &[("A", 0, 0), ("A", 10, 0), ("B", 15, 0), ("A", 20, 0), ("A", 30, 0)],
        );

        let names: Vec<_> = db
            .get_sessions(&SessionQuery::range(at(0), at(100)))
            .unwrap()
            .into_iter()
            .map(|r| r.app_name)
            .collect();
        assert_eq!(names, vec!["a", "a"]);
    }

    #[test]
    fn test_unknown_key_is_not_retried() {
        let (_db, mut recorder) = recorder();
        let err = recorder
            .apply(&Transition::Extended {
                key: 42,
                end: at(10),
                idle_seconds: 0,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Store(StoreError::NotFound(_))
        ));
        assert_eq!(recorder.stats().retries, 0);
    }

    fn file_recorder(dir: &std::path::Path, retries: u32) -> (Arc<Database>, Recorder) {
        let config = EngineConfig {
            store_lock_timeout_ms: 50,
            store_write_retries: retries,
            ..EngineConfig::default()
        };
        let db = Arc::new(
            Database::open_with_timeout(Some(dir.join("tempo.db")), config.store_lock_timeout())
                .unwrap(),
        );
        let categorizer = Arc::new(RwLock::new(Categorizer::from_database(&db).unwrap()));
        let recorder = Recorder::new(db.clone(), categorizer, &config);
        (db, recorder)
    }

    /// Takes SQLite's write lock on the store from a raw connection
    fn hold_write_lock(dir: &std::path::Path) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(dir.join("tempo.db")).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        conn
    }

    #[test]
    fn test_busy_store_is_retried_until_write_lands() {
        let dir = tempfile::tempdir().unwrap();
        let (db, mut recorder) = file_recorder(dir.path(), 3);

        let holder = hold_write_lock(dir.path());
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            holder.execute_batch("COMMIT").unwrap();
        });

        recorder.apply(&opened(1, "Code", 0)).unwrap();
        release.join().unwrap();

        let stats = recorder.stats();
        assert!(stats.retries >= 1);
        assert_eq!(stats.applied, 1);
        assert_eq!(db.get_open_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_busy_store_halts_once_retries_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let (db, mut recorder) = file_recorder(dir.path(), 1);
        let holder = hold_write_lock(dir.path());

        let err = recorder.apply(&opened(1, "Code", 0)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Store(StoreError::Busy)
        ));
        assert_eq!(recorder.stats().retries, 1);
        assert_eq!(recorder.stats().applied, 0);

        drop(holder);
        assert!(db.get_applications().unwrap().is_empty());
    }

    #[test]
    fn test_constraint_violation_fails_fast() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        // A category the store has never seen
        let mut categories = db.get_categories().unwrap();
        categories.push(Category {
            id: 999,
            name: String::from("Phantom"),
            default_productivity_score: 0.0,
            builtin: false,
        });
        let mut rule = Rule::new("code", MatchKind::Exact, 999, 0);
        rule.position = 1;
        let categorizer = Arc::new(RwLock::new(Categorizer::new(categories, vec![rule])));
        let mut recorder = Recorder::new(db.clone(), categorizer, &EngineConfig::default());

        let err = recorder.apply(&opened(1, "Code", 0)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Store(StoreError::Io(_))
        ));
        assert_eq!(recorder.stats().retries, 0);
        assert!(db.get_applications().unwrap().is_empty());
    }

    #[test]
    fn test_run_blocking_drains_channel() {
        let (db, recorder) = recorder();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(opened(1, "Code", 0)).unwrap();
        tx.send(Transition::Closed {
            key: 1,
            end: at(30),
            idle_seconds: 2,
        })
        .unwrap();
        drop(tx);

        let stats = recorder.run_blocking(rx).unwrap();
        assert_eq!(stats.applied, 2);
        assert!(db.get_open_sessions().unwrap().is_empty());
    }
}
