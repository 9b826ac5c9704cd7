use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use tempo_core::{Categorizer, Daemon, EngineConfig, Recorder, Transition};
use tempo_storage::{Database, SessionQuery, DEFAULT_LOCK_TIMEOUT};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

#[test]
fn test_restart_closes_session_at_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tempo.db");
    let config = EngineConfig {
        db_path: Some(path.clone()),
        ..EngineConfig::default()
    };

    // First run dies mid-session, after two checkpoints
    {
        let db = Arc::new(Database::new(Some(path.clone())).unwrap());
        let categorizer = Arc::new(RwLock::new(Categorizer::from_database(&db).unwrap()));
        let mut recorder = Recorder::new(db.clone(), categorizer, &config);
        for transition in [
            Transition::Opened {
                key: 1,
                app_name: String::from("code"),
                display_name: String::from("Code"),
                window_title: None,
                start: at(0),
            },
            Transition::Extended {
                key: 1,
                end: at(10),
                idle_seconds: 0,
            },
            Transition::Extended {
                key: 1,
                end: at(20),
                idle_seconds: 3,
            },
        ] {
            recorder.apply(&transition).unwrap();
        }
        assert_eq!(db.get_open_sessions().unwrap().len(), 1);
    }

    // Restart recovers before anything else runs
    let daemon = Daemon::open(config).unwrap();
    assert!(daemon.database().get_open_sessions().unwrap().is_empty());

    let reader = Database::open_reader(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
    let sessions = reader
        .get_sessions(&SessionQuery::range(at(0), at(100)))
        .unwrap();
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0].session;
    assert!(!session.open);
    assert_eq!(session.start_time, at(0));
    assert_eq!(session.end_time, at(20));
    assert_eq!(session.idle_time_seconds, 3);
    assert_eq!(sessions[0].app_name, "code");
}

#[test]
fn test_restart_with_clean_store_recovers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tempo.db");
    Database::new(Some(path.clone())).unwrap();

    let daemon = Daemon::open(EngineConfig {
        db_path: Some(path),
        ..EngineConfig::default()
    })
    .unwrap();
    assert_eq!(daemon.database().recover_open_sessions().unwrap(), 0);
}
