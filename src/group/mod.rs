//! # Group Coordination
//!
//! Live-location and SOS propagation between the members of a hiking group.
//!
//! [`GroupProtocol`] is the per-hiker state machine:
//!
//! ```text
//!   Idle --join--> Syncing <--acknowledge / clear--> Distress
//!    ^                |  \______local or remote help_____^  |
//!    +------leave-----+-------------------------------------+
//! ```
//!
//! It is purely synchronous; the timer-driven push/pull cycle lives in
//! [`sync`] and talks to a [`GroupLocationService`].

pub mod sync;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::GuideError;
use crate::{Fix, GeoPoint};

pub use sync::{GroupSync, GroupSyncHandle, SyncCommand};

/// Supplies the bearer credential for the group service.
///
/// `None` means the user is signed out; calls fail with
/// [`GuideError::MissingCredential`].
pub type CredentialProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GroupState {
    /// Not in a group
    #[default]
    Idle,
    /// Periodic push/pull
    Syncing,
    /// An SOS request is active locally or for a tracked member
    Distress,
}

/// One group member's last-known state, as returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLocation {
    pub member_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub position: GeoPoint,
    pub accuracy: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Server timestamp, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Destination waypoint label
    #[serde(default)]
    pub going_to: Option<String>,
    #[serde(default)]
    pub help_request: bool,
}

/// Body of a push: the local hiker's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStateUpdate {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub altitude: Option<f64>,
    pub going_to: Option<String>,
    pub help_request: bool,
    pub timestamp: u64,
}

impl MemberStateUpdate {
    pub fn from_fix(fix: &Fix, going_to: Option<String>, help_request: bool) -> Self {
        Self {
            latitude: fix.point.latitude,
            longitude: fix.point.longitude,
            accuracy: fix.accuracy_m,
            altitude: fix.altitude(),
            going_to,
            help_request,
            timestamp: fix.timestamp_ms,
        }
    }
}

/// Something the UI or the alert path should hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupEvent {
    Joined { group_id: String },
    Left,
    /// Transition into Distress. `local` is true when the local hiker asked for help.
    EnteredDistress { member_ids: Vec<String>, local: bool },
    DistressCleared,
    /// Too many consecutive failed pulls; the roster is kept but aging.
    RosterStale,
    RosterRecovered,
}

/// Copy-out view of the protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group_id: Option<String>,
    pub state: GroupState,
    /// Other members, ordered by member id
    pub roster: Vec<MemberLocation>,
    pub local_help: bool,
    pub stale: bool,
    pub last_success_ms: Option<u64>,
    pub consecutive_failures: u32,
}

/// Timing for the push/pull cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Default: 10000 ms
    pub push_interval_ms: u64,

    /// Default: 10000 ms
    pub pull_interval_ms: u64,

    /// Per-call network timeout.
    /// Default: 5000 ms
    pub call_timeout_ms: u64,

    /// First retry delay; doubles per consecutive failure.
    /// Default: 1000 ms
    pub backoff_base_ms: u64,

    /// Default: 30000 ms
    pub backoff_max_ms: u64,

    /// Consecutive failed pulls before the roster is marked stale.
    /// Default: 3
    pub stale_after_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_interval_ms: 10_000,
            pull_interval_ms: 10_000,
            call_timeout_ms: 5_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            stale_after_failures: 3,
        }
    }
}

impl SyncConfig {
    /// Retry delay after `failures` consecutive failures (1-based).
    pub fn backoff_ms(&self, failures: u32) -> u64 {
        let exponent = failures.saturating_sub(1).min(20);
        self.backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms)
    }
}

/// Remote group-location service.
#[async_trait]
pub trait GroupLocationService: Send + Sync {
    /// Upload the local member's state.
    async fn push_state(
        &self,
        group_id: &str,
        member_id: &str,
        update: &MemberStateUpdate,
    ) -> Result<(), GuideError>;

    /// Fetch every member's last-known state.
    async fn fetch_members(&self, group_id: &str) -> Result<Vec<MemberLocation>, GuideError>;
}

/// Per-hiker group state machine. Owns the roster.
#[derive(Debug, Clone)]
pub struct GroupProtocol {
    local_member_id: String,
    stale_after_failures: u32,
    group_id: Option<String>,
    state: GroupState,
    roster: BTreeMap<String, MemberLocation>,
    local_help: bool,
    /// Remote members whose current request was acknowledged
    acknowledged: BTreeSet<String>,
    stale: bool,
    consecutive_failures: u32,
    last_success_ms: Option<u64>,
}

impl GroupProtocol {
    pub fn new(local_member_id: impl Into<String>, stale_after_failures: u32) -> Self {
        Self {
            local_member_id: local_member_id.into(),
            stale_after_failures,
            group_id: None,
            state: GroupState::Idle,
            roster: BTreeMap::new(),
            local_help: false,
            acknowledged: BTreeSet::new(),
            stale: false,
            consecutive_failures: 0,
            last_success_ms: None,
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn local_member_id(&self) -> &str {
        &self.local_member_id
    }

    pub fn local_help(&self) -> bool {
        self.local_help
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn roster(&self) -> impl Iterator<Item = &MemberLocation> {
        self.roster.values()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            group_id: self.group_id.clone(),
            state: self.state,
            roster: self.roster.values().cloned().collect(),
            local_help: self.local_help,
            stale: self.stale,
            last_success_ms: self.last_success_ms,
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Enter a group. Joining while in another group starts over.
    pub fn join(&mut self, group_id: impl Into<String>) -> Vec<GroupEvent> {
        let group_id = group_id.into();
        if self.state != GroupState::Idle {
            self.reset_group();
        }
        info!("[GroupProtocol] Joined group {}", group_id);
        self.group_id = Some(group_id.clone());
        self.state = GroupState::Syncing;

        let mut events = vec![GroupEvent::Joined { group_id }];
        events.extend(self.enter_distress_if_needed());
        events
    }

    /// Leave the group: back to Idle, roster and SOS state cleared.
    pub fn leave(&mut self) -> Vec<GroupEvent> {
        if self.state == GroupState::Idle {
            return Vec::new();
        }
        info!("[GroupProtocol] Left group {:?}", self.group_id);
        self.reset_group();
        self.local_help = false;
        vec![GroupEvent::Left]
    }

    pub fn set_local_help(&mut self, help: bool) -> Vec<GroupEvent> {
        if !help {
            return self.clear_local_help();
        }
        self.local_help = true;
        self.enter_distress_if_needed().into_iter().collect()
    }

    pub fn clear_local_help(&mut self) -> Vec<GroupEvent> {
        self.local_help = false;
        self.leave_distress_if_resolved().into_iter().collect()
    }

    /// Acknowledge every remote request active right now.
    pub fn acknowledge(&mut self) -> Vec<GroupEvent> {
        let active: Vec<String> = self.active_remote_requests();
        if !active.is_empty() {
            debug!("[GroupProtocol] Acknowledged help requests from {:?}", active);
        }
        self.acknowledged.extend(active);
        self.leave_distress_if_resolved().into_iter().collect()
    }

    /// Members with `help_request` set, acknowledged or not.
    pub fn active_remote_requests(&self) -> Vec<String> {
        self.roster
            .values()
            .filter(|m| m.help_request)
            .map(|m| m.member_id.clone())
            .collect()
    }

    pub fn unacknowledged_requests(&self) -> Vec<String> {
        self.roster
            .values()
            .filter(|m| m.help_request && !self.acknowledged.contains(&m.member_id))
            .map(|m| m.member_id.clone())
            .collect()
    }

    /// Replace the roster with a successful pull.
    ///
    /// Per member, the record with the newest server timestamp wins, whether
    /// it comes from this pull or the previous roster.
    pub fn apply_pull(&mut self, members: Vec<MemberLocation>, now_ms: u64) -> Vec<GroupEvent> {
        if self.state == GroupState::Idle {
            return Vec::new();
        }

        let mut next: BTreeMap<String, MemberLocation> = BTreeMap::new();
        for member in members {
            if member.member_id == self.local_member_id {
                continue;
            }
            let newest = match next.get(&member.member_id) {
                Some(seen) if seen.timestamp_ms >= member.timestamp_ms => continue,
                _ => member,
            };
            next.insert(newest.member_id.clone(), newest);
        }
        for (id, record) in next.iter_mut() {
            if let Some(previous) = self.roster.get(id) {
                if previous.timestamp_ms > record.timestamp_ms {
                    *record = previous.clone();
                }
            }
        }
        self.roster = next;

        // A dropped flag re-arms the alert for that member
        let roster = &self.roster;
        self.acknowledged
            .retain(|id| roster.get(id).map_or(false, |m| m.help_request));

        self.consecutive_failures = 0;
        self.last_success_ms = Some(now_ms);

        let mut events = Vec::new();
        if self.stale {
            info!("[GroupProtocol] Roster recovered");
            self.stale = false;
            events.push(GroupEvent::RosterRecovered);
        }
        events.extend(self.enter_distress_if_needed());
        events
    }

    /// Count a failed pull. Marks the roster stale once the limit is reached.
    pub fn record_failure(&mut self) -> Vec<GroupEvent> {
        if self.state == GroupState::Idle {
            return Vec::new();
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.stale && self.consecutive_failures >= self.stale_after_failures {
            warn!(
                "[GroupProtocol] Roster stale after {} consecutive failures",
                self.consecutive_failures
            );
            self.stale = true;
            return vec![GroupEvent::RosterStale];
        }
        Vec::new()
    }

    fn enter_distress_if_needed(&mut self) -> Option<GroupEvent> {
        if self.state != GroupState::Syncing {
            return None;
        }
        let (member_ids, local) = if self.local_help {
            (vec![self.local_member_id.clone()], true)
        } else {
            let pending = self.unacknowledged_requests();
            if pending.is_empty() {
                return None;
            }
            (pending, false)
        };
        warn!("[GroupProtocol] Distress: {:?} (local: {})", member_ids, local);
        self.state = GroupState::Distress;
        Some(GroupEvent::EnteredDistress { member_ids, local })
    }

    fn leave_distress_if_resolved(&mut self) -> Option<GroupEvent> {
        if self.state != GroupState::Distress
            || self.local_help
            || !self.unacknowledged_requests().is_empty()
        {
            return None;
        }
        info!("[GroupProtocol] Distress cleared");
        self.state = GroupState::Syncing;
        Some(GroupEvent::DistressCleared)
    }

    fn reset_group(&mut self) {
        self.group_id = None;
        self.state = GroupState::Idle;
        self.roster.clear();
        self.acknowledged.clear();
        self.stale = false;
        self.consecutive_failures = 0;
        self.last_success_ms = None;
    }
}
