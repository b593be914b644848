//! Alert acknowledgement workflow.
//!
//! Per-alert state machine:
//!
//!   Open ──ack──▶ Acknowledging ──ok──▶ Acknowledged
//!                      │
//!                      └──error──▶ Open
//!
//! The alert leaves the open listing as soon as the request is issued and
//! comes back if the remote call fails. A second `acknowledge` for an alert
//! already in flight joins the first call's result instead of calling the
//! backend again. The board lock is never held across the remote call, so
//! acknowledgements of different alerts run independently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::logging::{self, Component};
use crate::model::{AckError, Alert};
use crate::telemetry::TelemetryBackend;

/// What a confirmed acknowledgement does to the local alert list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Drop the alert from the local list.
    #[default]
    Remove,
    /// Keep it, flagged acknowledged.
    MarkAcknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Open,
    Acknowledging,
    Acknowledged,
}

type AckResult = Result<bool, AckError>;

/// Result slot shared by every caller waiting on one remote call.
struct InFlight {
    result: Mutex<Option<AckResult>>,
    settled: Condvar,
}

impl InFlight {
    fn new() -> Self {
        InFlight { result: Mutex::new(None), settled: Condvar::new() }
    }

    fn finish(&self, result: AckResult) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.settled.notify_all();
    }

    fn wait(&self) -> AckResult {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.settled.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Default)]
struct AlertBoard {
    alerts: Vec<Alert>,
    pending: HashMap<String, Arc<InFlight>>,
    /// Ids confirmed acknowledged in this session.
    confirmed: HashSet<String>,
}

pub struct AckWorkflow {
    backend: Arc<dyn TelemetryBackend>,
    policy: AckPolicy,
    board: Mutex<AlertBoard>,
}

impl AckWorkflow {
    pub fn new(backend: Arc<dyn TelemetryBackend>, policy: AckPolicy, alerts: Vec<Alert>) -> Self {
        let workflow = AckWorkflow {
            backend,
            policy,
            board: Mutex::new(AlertBoard::default()),
        };
        workflow.replace_alerts(alerts);
        workflow
    }

    fn board(&self) -> MutexGuard<'_, AlertBoard> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    /// Installs a fresh alert collection from the data source. Requests in
    /// flight keep their state, and an alert confirmed acknowledged here
    /// stays acknowledged even if the source read predates the confirmation.
    pub fn replace_alerts(&self, alerts: Vec<Alert>) {
        let keep_acknowledged = self.policy == AckPolicy::MarkAcknowledged;
        let mut board = self.board();
        let alerts: Vec<Alert> = alerts
            .into_iter()
            .map(|mut a| {
                a.acknowledged |= board.confirmed.contains(&a.id);
                a
            })
            .filter(|a| keep_acknowledged || !a.acknowledged)
            .collect();
        board.alerts = alerts;
    }

    /// Acknowledges `alert_id`.
    ///
    /// `Ok(false)` for an unknown or already acknowledged alert, and when
    /// the backend reports nothing to acknowledge. `Err` means the remote
    /// call failed and the alert is open again.
    pub fn acknowledge(&self, alert_id: &str) -> Result<bool, AckError> {
        let flight = {
            let mut board = self.board();
            if let Some(existing) = board.pending.get(alert_id) {
                let existing = Arc::clone(existing);
                drop(board);
                return existing.wait();
            }
            match board.alerts.iter().find(|a| a.id == alert_id) {
                Some(alert) if !alert.acknowledged => {}
                _ => return Ok(false),
            }
            let flight = Arc::new(InFlight::new());
            board.pending.insert(alert_id.to_string(), Arc::clone(&flight));
            flight
        };

        let result = self.backend.acknowledge(alert_id).map_err(AckError::from);

        {
            let mut board = self.board();
            board.pending.remove(alert_id);
            match &result {
                Ok(true) => {
                    board.confirmed.insert(alert_id.to_string());
                    match self.policy {
                        AckPolicy::Remove => board.alerts.retain(|a| a.id != alert_id),
                        AckPolicy::MarkAcknowledged => {
                            if let Some(alert) = board.alerts.iter_mut().find(|a| a.id == alert_id) {
                                alert.acknowledged = true;
                            }
                        }
                    }
                    logging::info(Component::Alerts, Some(alert_id), "acknowledged");
                }
                Ok(false) => {
                    logging::warn(Component::Alerts, Some(alert_id), "backend had nothing to acknowledge");
                }
                Err(e) => {
                    logging::warn(Component::Alerts, Some(alert_id), &format!("acknowledge failed, alert reopened: {}", e));
                }
            }
        }

        flight.finish(result.clone());
        result
    }

    /// `None` for an id this workflow has never seen.
    pub fn state_of(&self, alert_id: &str) -> Option<AckState> {
        let board = self.board();
        if board.pending.contains_key(alert_id) {
            return Some(AckState::Acknowledging);
        }
        if board.confirmed.contains(alert_id) {
            return Some(AckState::Acknowledged);
        }
        board.alerts.iter().find(|a| a.id == alert_id).map(|a| {
            if a.acknowledged { AckState::Acknowledged } else { AckState::Open }
        })
    }

    /// Alerts still awaiting acknowledgement, in source order.
    pub fn open_alerts(&self) -> Vec<Alert> {
        let board = self.board();
        board
            .alerts
            .iter()
            .filter(|a| !a.acknowledged && !board.pending.contains_key(&a.id))
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        let board = self.board();
        board
            .alerts
            .iter()
            .filter(|a| !a.acknowledged && !board.pending.contains_key(&a.id))
            .count()
    }

    /// Every alert the board holds under the current policy.
    pub fn all_alerts(&self) -> Vec<Alert> {
        self.board().alerts.clone()
    }
}
