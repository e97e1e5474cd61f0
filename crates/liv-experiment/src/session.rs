//! Measurement session: state, samples and events of one sweep.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  start   ┌─────────┐  pause   ┌────────┐
//! │ Idle │─────────▶│ Running │─────────▶│ Paused │
//! └──────┘          └────┬────┘◀─────────└───┬────┘
//!                        │        resume      │
//!        exhausted       │  violation/cancel  │ cancel
//!     ┌──────────┐       │     ┌─────────┐    │
//!     │ Complete │◀──────┼────▶│ Aborted │◀───┘
//!     └──────────┘       │     └─────────┘
//!                        │ instrument error
//!                        ▼
//!                   ┌────────┐
//!                   │ Failed │
//!                   └────────┘
//! ```
//!
//! Only the sweep task mutates a session. The sample sequence is append-only
//! behind a lock, so every [`SessionSnapshot`] holds complete rows and is a
//! prefix of the final dataset.

use chrono::{DateTime, Utc};
use liv_core::config::MeasurementConfig;
use liv_core::data::SamplePoint;
use liv_core::error::{LivError, LivResult};
use liv_core::limits::ViolationReason;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

/// Capacity of the session event channel. Slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, sweep not yet running
    Idle,
    /// Stepping through setpoints
    Running,
    /// Holding between steps with outputs parked
    Paused,
    /// Stopped early by a limit violation or a cancel request
    Aborted,
    /// Every setpoint measured
    Complete,
    /// Stopped by an instrument error
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Aborted | SessionState::Complete | SessionState::Failed
        )
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Aborted)
                | (Idle, Failed)
                | (Running, Paused)
                | (Running, Aborted)
                | (Running, Complete)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Aborted)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Running => write!(f, "running"),
            SessionState::Paused => write!(f, "paused"),
            SessionState::Aborted => write!(f, "aborted"),
            SessionState::Complete => write!(f, "complete"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a session ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalReason {
    OverVoltage,
    OverCurrent,
    OverPower,
    UserCancelled,
    /// Instrument error text.
    Failure(String),
}

impl From<ViolationReason> for TerminalReason {
    fn from(reason: ViolationReason) -> Self {
        match reason {
            ViolationReason::OverVoltage => TerminalReason::OverVoltage,
            ViolationReason::OverCurrent => TerminalReason::OverCurrent,
            ViolationReason::OverPower => TerminalReason::OverPower,
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::OverVoltage => write!(f, "over-voltage"),
            TerminalReason::OverCurrent => write!(f, "over-current"),
            TerminalReason::OverPower => write!(f, "over-power"),
            TerminalReason::UserCancelled => write!(f, "cancelled by user"),
            TerminalReason::Failure(message) => write!(f, "instrument failure: {}", message),
        }
    }
}

/// State tag and terminal reason, published together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub reason: Option<TerminalReason>,
}

/// Notifications broadcast while a sweep runs.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionStatus),
    Sample(SamplePoint),
}

/// Read-only copy of a session at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub config: Arc<MeasurementConfig>,
    pub state: SessionState,
    pub reason: Option<TerminalReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub samples: Vec<SamplePoint>,
}

pub struct MeasurementSession {
    id: Uuid,
    config: Arc<MeasurementConfig>,
    samples: RwLock<Vec<SamplePoint>>,
    status: watch::Sender<SessionStatus>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MeasurementSession {
    /// Validate `config` and create an idle session.
    pub fn new(config: MeasurementConfig) -> LivResult<Self> {
        config.validate()?;
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Idle,
            reason: None,
        });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            id: Uuid::new_v4(),
            config: Arc::new(config),
            samples: RwLock::new(Vec::new()),
            status,
            started_at: RwLock::new(None),
            events,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Arc<MeasurementConfig> {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn reason(&self) -> Option<TerminalReason> {
        self.status.borrow().reason.clone()
    }

    /// Number of samples recorded so far.
    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            id: self.id,
            config: self.config.clone(),
            state: status.state,
            reason: status.reason,
            started_at: *self.started_at.read(),
            samples: self.samples.read().clone(),
        }
    }

    /// Subscribe to state changes and appended samples.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch the status tag.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn append(&self, sample: SamplePoint) {
        self.samples.write().push(sample.clone());
        let _ = self.events.send(SessionEvent::Sample(sample));
    }

    pub(crate) fn transition(&self, next: SessionState) -> LivResult<()> {
        self.publish(next, None)
    }

    pub(crate) fn finish(&self, state: SessionState, reason: Option<TerminalReason>) -> LivResult<()> {
        debug_assert!(state.is_terminal());
        self.publish(state, reason)
    }

    fn publish(&self, next: SessionState, reason: Option<TerminalReason>) -> LivResult<()> {
        let mut result = Ok(());
        self.status.send_if_modified(|status| {
            if !status.state.can_transition_to(next) {
                result = Err(LivError::InvalidState(format!(
                    "cannot move from {} to {}",
                    status.state, next
                )));
                return false;
            }
            status.state = next;
            status.reason = reason.clone();
            true
        });
        result?;

        if next == SessionState::Running && self.started_at.read().is_none() {
            *self.started_at.write() = Some(Utc::now());
        }
        info!(session = %self.id, state = %next, reason = ?reason, "session state changed");
        let _ = self.events.send(SessionEvent::StateChanged(SessionStatus {
            state: next,
            reason,
        }));
        Ok(())
    }
}

impl std::fmt::Debug for MeasurementSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("samples", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liv_core::config::{MeasurementKind, SweepRange};
    use std::time::Duration;

    fn session() -> MeasurementSession {
        let config = MeasurementConfig::builder(MeasurementKind::Iv)
            .sweep(0.0, 0.01, 0.005)
            .build();
        MeasurementSession::new(config).unwrap()
    }

    fn sample(index: usize) -> SamplePoint {
        SamplePoint {
            index,
            setpoint: index as f64,
            source_feedback: index as f64,
            voltage: Some(1.0),
            current: Some(0.01),
            power: None,
            elapsed: Duration::from_millis(index as u64),
            timestamp: Utc::now(),
            channel_skew: Duration::ZERO,
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = MeasurementConfig::builder(MeasurementKind::Iv).build();
        config.sweep = SweepRange::new(0.0, 1.0, -0.1);
        assert!(matches!(
            MeasurementSession::new(config),
            Err(LivError::Config(_))
        ));
    }

    #[test]
    fn lifecycle_transitions() {
        let s = session();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.started_at.read().is_none());

        s.transition(SessionState::Running).unwrap();
        assert!(s.snapshot().started_at.is_some());
        s.transition(SessionState::Paused).unwrap();
        s.transition(SessionState::Running).unwrap();
        s.finish(SessionState::Aborted, Some(TerminalReason::UserCancelled))
            .unwrap();

        assert_eq!(s.reason(), Some(TerminalReason::UserCancelled));
        assert!(s.transition(SessionState::Running).is_err());
    }

    #[test]
    fn complete_only_from_running() {
        let s = session();
        assert!(s.finish(SessionState::Complete, None).is_err());
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn snapshots_are_prefixes() {
        let s = session();
        s.transition(SessionState::Running).unwrap();
        s.append(sample(0));
        let early = s.snapshot();
        s.append(sample(1));
        let late = s.snapshot();

        assert_eq!(early.samples.len(), 1);
        assert_eq!(&late.samples[..1], &early.samples[..]);
        assert_eq!(s.snapshot(), s.snapshot());
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let s = session();
        let mut rx = s.subscribe();
        s.transition(SessionState::Running).unwrap();
        s.append(sample(0));

        match rx.recv().await.unwrap() {
            SessionEvent::StateChanged(status) => assert_eq!(status.state, SessionState::Running),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Sample(p) if p.index == 0));
    }

    #[test]
    fn terminal_reason_from_violation() {
        assert_eq!(
            TerminalReason::from(ViolationReason::OverPower),
            TerminalReason::OverPower
        );
        assert_eq!(TerminalReason::UserCancelled.to_string(), "cancelled by user");
    }
}
