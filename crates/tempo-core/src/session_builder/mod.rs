//! Folds samples into sessions and idle gaps.
//!
//! The builder is owned by the sampling task and never blocks: every sample
//! is handled in constant time and turned into zero or more [`Transition`]s,
//! which the recorder applies to the store.

use chrono::{DateTime, Utc};

use crate::categorizer::canonical_name;
use crate::config::{EngineConfig, FlickerPolicy};
use crate::sampler::Sample;


/// Builder-local session identity, unique for the life of the builder
pub type SessionKey = u64;

/// A change to persisted session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Opened {
        key: SessionKey,
        /// Canonical name
        app_name: String,
        display_name: String,
        window_title: Option<String>,
        start: DateTime<Utc>,
    },
    /// Open session checkpoint
    Extended {
        key: SessionKey,
        end: DateTime<Utc>,
        idle_seconds: u32,
    },
    Closed {
        key: SessionKey,
        end: DateTime<Utc>,
        idle_seconds: u32,
    },
    /// Flicker dropped on close
    Discarded { key: SessionKey },
    /// `discarded` is dropped and `key` (closed just before it) is open again
    Reopened {
        key: SessionKey,
        discarded: SessionKey,
        end: DateTime<Utc>,
        idle_seconds: u32,
    },
    IdleGap {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Where the time between the first and last sample went. The four buckets
/// always add up to the run's span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub first_sample: Option<DateTime<Utc>>,
    pub last_sample: Option<DateTime<Utc>>,
    pub session_seconds: i64,
    pub idle_seconds: i64,
    /// Unobserved time between the last sample of one app and the first of the next
    pub switch_seconds: i64,
    pub discarded_seconds: i64,
}

impl RunTotals {
    #[must_use]
    pub fn span_seconds(&self) -> i64 {
        match (self.first_sample, self.last_sample) {
            (Some(first), Some(last)) => (last - first).num_seconds(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn accounted_seconds(&self) -> i64 {
        self.session_seconds + self.idle_seconds + self.switch_seconds + self.discarded_seconds
    }
}

#[derive(Debug, Clone)]
struct OpenSession {
    key: SessionKey,
    app: String,
    start: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    idle_seconds: i64,
    /// Switch gap between the previous session and this one
    gap_before: i64,
}

impl OpenSession {
    fn duration(&self) -> i64 {
        (self.last_seen - self.start).num_seconds()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingGap {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Empty,
    Active(OpenSession),
    Idle(PendingGap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Switch,
    Idle,
    Finish,
}

pub struct SessionBuilder {
    idle_threshold: u64,
    min_session: i64,
    debounce_window: i64,
    policy: FlickerPolicy,
    next_key: SessionKey,
    state: State,
    /// Session closed by the most recent app switch; the only merge target
    last_closed: Option<OpenSession>,
    totals: RunTotals,
}

impl SessionBuilder {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            idle_threshold: config.idle_threshold_secs,
            min_session: i64::try_from(config.min_session_secs).unwrap_or(i64::MAX),
            debounce_window: i64::try_from(config.debounce_window_secs).unwrap_or(i64::MAX),
            policy: config.flicker_policy,
            next_key: 1,
            state: State::Empty,
            last_closed: None,
            totals: RunTotals::default(),
        }
    }

    #[must_use]
    pub fn totals(&self) -> RunTotals {
        self.totals
    }

    /// Whether a session is currently open
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// Feed one sample. Samples older than the previous one are ignored.
    pub fn push(&mut self, sample: &Sample) -> Vec<Transition> {
        let ts = sample.timestamp;
        if let Some(last) = self.totals.last_sample {
            if ts < last {
                log::warn!("Ignoring out-of-order sample at {ts} (last seen {last})");
                return Vec::new();
            }
        }
        if self.totals.first_sample.is_none() {
            self.totals.first_sample = Some(ts);
        }

        let mut out = Vec::new();
        let state = std::mem::take(&mut self.state);
        self.state = if sample.idle_seconds >= self.idle_threshold {
            self.on_idle(state, ts, &mut out)
        } else {
            self.on_active(state, sample, &mut out)
        };
        self.totals.last_sample = Some(ts);
        out
    }

    /// Close whatever is open at its last observed sample
    pub fn finish(&mut self) -> Vec<Transition> {
        let mut out = Vec::new();
        match std::mem::take(&mut self.state) {
            State::Active(open) => self.close(open, CloseReason::Finish, &mut out),
            State::Idle(gap) => self.close_gap(gap.start, gap.end, &mut out),
            State::Empty => {}
        }
        self.last_closed = None;
        out
    }

    fn on_idle(&mut self, state: State, ts: DateTime<Utc>, out: &mut Vec<Transition>) -> State {
        match state {
            State::Empty => State::Idle(PendingGap { start: ts, end: ts }),
            State::Idle(gap) => State::Idle(PendingGap { end: ts, ..gap }),
            State::Active(open) => {
                let start = open.last_seen;
                log::debug!("User idle, closing session for {}", open.app);
                self.close(open, CloseReason::Idle, out);
                State::Idle(PendingGap { start, end: ts })
            }
        }
    }

    fn on_active(&mut self, state: State, sample: &Sample, out: &mut Vec<Transition>) -> State {
        let app = canonical_name(&sample.app_name);
        let ts = sample.timestamp;

        match state {
            State::Empty => State::Active(self.open(sample, app, 0, out)),
            State::Idle(gap) => {
                self.close_gap(gap.start, ts, out);
                State::Active(self.open(sample, app, 0, out))
            }
            State::Active(mut open) if open.app == app => {
                open.idle_seconds += sub_threshold_idle(sample, open.last_seen);
                open.last_seen = ts;
                out.push(Transition::Extended {
                    key: open.key,
                    end: ts,
                    idle_seconds: clamp_idle(&open),
                });
                State::Active(open)
            }
            State::Active(open) => {
                if let Some(previous) = self.take_merge_target(&open, &app, ts) {
                    return State::Active(self.merge(previous, open, sample, out));
                }
                let gap = (ts - open.last_seen).num_seconds();
                self.totals.switch_seconds += gap;
                log::debug!("App changed from {} to {app}", open.app);
                self.close(open, CloseReason::Switch, out);
                State::Active(self.open(sample, app, gap, out))
            }
        }
    }

    fn open(
        &mut self,
        sample: &Sample,
        app: String,
        gap_before: i64,
        out: &mut Vec<Transition>,
    ) -> OpenSession {
        let key = self.next_key;
        self.next_key += 1;

        out.push(Transition::Opened {
            key,
            app_name: app.clone(),
            display_name: sample.app_name.trim().to_string(),
            window_title: sample.window_title.clone(),
            start: sample.timestamp,
        });
        OpenSession {
            key,
            app,
            start: sample.timestamp,
            last_seen: sample.timestamp,
            idle_seconds: 0,
            gap_before,
        }
    }

    fn close(&mut self, open: OpenSession, reason: CloseReason, out: &mut Vec<Transition>) {
        let duration = open.duration();

        if self.policy == FlickerPolicy::Discard && self.is_flicker(&open) {
            log::debug!("Discarding {duration}s flicker of {}", open.app);
            self.totals.discarded_seconds += duration;
            self.last_closed = None;
            out.push(Transition::Discarded { key: open.key });
            return;
        }

        self.totals.session_seconds += duration;
        out.push(Transition::Closed {
            key: open.key,
            end: open.last_seen,
            idle_seconds: clamp_idle(&open),
        });
        self.last_closed = (reason == CloseReason::Switch).then_some(open);
    }

    fn close_gap(&mut self, start: DateTime<Utc>, end: DateTime<Utc>, out: &mut Vec<Transition>) {
        self.totals.idle_seconds += (end - start).num_seconds();
        out.push(Transition::IdleGap { start, end });
    }

    fn is_flicker(&self, session: &OpenSession) -> bool {
        session.duration() < self.min_session
    }

    /// The session closed just before `flicker`, if the user is switching
    /// straight back to it within the debounce window
    fn take_merge_target(
        &mut self,
        flicker: &OpenSession,
        app: &str,
        ts: DateTime<Utc>,
    ) -> Option<OpenSession> {
        if self.policy != FlickerPolicy::Merge || !self.is_flicker(flicker) {
            return None;
        }
        let fits = self.last_closed.as_ref().is_some_and(|previous| {
            previous.app == app && (ts - previous.last_seen).num_seconds() <= self.debounce_window
        });
        if fits {
            self.last_closed.take()
        } else {
            None
        }
    }

    fn merge(
        &mut self,
        previous: OpenSession,
        flicker: OpenSession,
        sample: &Sample,
        out: &mut Vec<Transition>,
    ) -> OpenSession {
        // The previous session is counted again when it closes for good
        self.totals.session_seconds -= previous.duration();
        self.totals.switch_seconds -= flicker.gap_before;

        let ts = sample.timestamp;
        let reopened = OpenSession {
            last_seen: ts,
            idle_seconds: previous.idle_seconds
                + flicker.idle_seconds
                + sub_threshold_idle(sample, flicker.last_seen),
            ..previous
        };
        log::debug!(
            "Merged {}s flicker of {} back into {}",
            flicker.duration(),
            flicker.app,
            reopened.app
        );
        out.push(Transition::Reopened {
            key: reopened.key,
            discarded: flicker.key,
            end: ts,
            idle_seconds: clamp_idle(&reopened),
        });
        reopened
    }
}

/// Inactivity below the idle threshold observed since `last_seen`
fn sub_threshold_idle(sample: &Sample, last_seen: DateTime<Utc>) -> i64 {
    let elapsed = (sample.timestamp - last_seen).num_seconds();
    i64::try_from(sample.idle_seconds)
        .unwrap_or(i64::MAX)
        .min(elapsed)
}

fn clamp_idle(session: &OpenSession) -> u32 {
    let idle = session.idle_seconds.clamp(0, session.duration().max(0));
    u32::try_from(idle).unwrap_or(u32::MAX)
}
