//! Timer-driven push/pull against the group location service.
//!
//! One task per group session. It owns the [`GroupProtocol`], reads the
//! latest local fix from a `watch`, takes commands over `mpsc` and publishes
//! [`GroupSnapshot`] copies. Push and pull calls run as owned futures polled
//! by the same `select!` as the commands, so a slow service never delays a
//! help request. Every call runs under a per-call timeout; a timeout is a
//! transient failure like any other.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

use super::{
    GroupEvent, GroupLocationService, GroupProtocol, GroupSnapshot, MemberLocation,
    MemberStateUpdate, SyncConfig,
};
use crate::error::GuideError;
use crate::{now_ms, Fix};

const COMMAND_CAPACITY: usize = 16;

/// A network call in flight, already wrapped in its timeout.
type Call<T> = BoxFuture<'static, Result<T, GuideError>>;

/// Requests from the session to the sync task.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncCommand {
    SetHelp(bool),
    Acknowledge,
    SetGoingTo(Option<String>),
    /// Push the current state without waiting for the timer
    PushNow,
}

/// The sync task's state. Built and consumed by [`GroupSync::spawn`].
pub struct GroupSync {
    protocol: GroupProtocol,
    service: Arc<dyn GroupLocationService>,
    config: SyncConfig,
    group_id: String,
    going_to: Option<String>,
    local_fix: watch::Receiver<Option<Fix>>,
    snapshot_tx: watch::Sender<GroupSnapshot>,
    events_tx: mpsc::Sender<GroupEvent>,
    push_failures: u32,
}

impl GroupSync {
    /// Join `group_id` and start the push/pull cycle on the current runtime.
    ///
    /// Protocol events are delivered on `events_tx`. The first push and pull
    /// happen immediately.
    pub fn spawn(
        group_id: impl Into<String>,
        member_id: impl Into<String>,
        service: Arc<dyn GroupLocationService>,
        config: SyncConfig,
        local_fix: watch::Receiver<Option<Fix>>,
        events_tx: mpsc::Sender<GroupEvent>,
    ) -> GroupSyncHandle {
        let group_id = group_id.into();
        let mut protocol = GroupProtocol::new(member_id, config.stale_after_failures);
        let joined = protocol.join(group_id.clone());

        let (snapshot_tx, snapshot_rx) = watch::channel(protocol.snapshot());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sync = GroupSync {
            protocol,
            service,
            config,
            group_id,
            going_to: None,
            local_fix,
            snapshot_tx,
            events_tx,
            push_failures: 0,
        };
        let task = tokio::spawn(sync.run(joined, command_rx, shutdown_rx));

        GroupSyncHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        initial_events: Vec<GroupEvent>,
        mut commands: mpsc::Receiver<SyncCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "[GroupSync] Started for group {} (push every {}ms, pull every {}ms)",
            self.group_id, self.config.push_interval_ms, self.config.pull_interval_ms
        );
        self.emit(initial_events).await;

        let mut next_push = Instant::now();
        let mut next_pull = Instant::now();
        let mut push_call: Option<Call<()>> = None;
        let mut pull_call: Option<Call<Vec<MemberLocation>>> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await {
                        // Supersedes any push still in flight
                        push_call = self.start_push();
                        next_push = self.after(self.config.push_interval_ms);
                    }
                }
                result = in_flight(&mut push_call) => {
                    push_call = None;
                    next_push = self.finish_push(result);
                }
                result = in_flight(&mut pull_call) => {
                    pull_call = None;
                    next_pull = self.finish_pull(result).await;
                }
                _ = sleep_until(next_pull), if pull_call.is_none() => {
                    pull_call = Some(self.start_pull());
                }
                _ = sleep_until(next_push), if push_call.is_none() => {
                    push_call = self.start_push();
                    next_push = self.after(self.config.push_interval_ms);
                }
            }
        }

        info!("[GroupSync] Stopped for group {}", self.group_id);
    }

    /// Apply a command. Returns true when the state should be pushed now.
    async fn handle_command(&mut self, command: SyncCommand) -> bool {
        debug!("[GroupSync] Command {:?}", command);
        match command {
            SyncCommand::SetHelp(help) => {
                let changed = help != self.protocol.local_help();
                let events = self.protocol.set_local_help(help);
                self.emit(events).await;
                changed
            }
            SyncCommand::Acknowledge => {
                let events = self.protocol.acknowledge();
                self.emit(events).await;
                false
            }
            SyncCommand::SetGoingTo(going_to) => {
                self.going_to = going_to;
                false
            }
            SyncCommand::PushNow => true,
        }
    }

    /// Build the push call for the current state, or `None` without a fix.
    fn start_push(&self) -> Option<Call<()>> {
        let fix = *self.local_fix.borrow();
        let Some(fix) = fix else {
            debug!("[GroupSync] No fix yet, skipping push");
            return None;
        };

        let update =
            MemberStateUpdate::from_fix(&fix, self.going_to.clone(), self.protocol.local_help());
        let service = Arc::clone(&self.service);
        let group_id = self.group_id.clone();
        let member_id = self.protocol.local_member_id().to_string();
        let limit = self.call_timeout();
        let call = async move {
            timed("push", limit, service.push_state(&group_id, &member_id, &update)).await
        };
        Some(call.boxed())
    }

    /// Returns when the next push is due.
    fn finish_push(&mut self, result: Result<(), GuideError>) -> Instant {
        match result {
            Ok(()) => {
                self.push_failures = 0;
                self.after(self.config.push_interval_ms)
            }
            Err(e) => {
                self.push_failures = self.push_failures.saturating_add(1);
                let wait = self.retry_delay(&e, self.push_failures);
                warn!(
                    "[GroupSync] Push failed: {}, retry {} in {}ms",
                    e, self.push_failures, wait
                );
                self.after(wait)
            }
        }
    }

    fn start_pull(&self) -> Call<Vec<MemberLocation>> {
        let service = Arc::clone(&self.service);
        let group_id = self.group_id.clone();
        let limit = self.call_timeout();
        async move { timed("pull", limit, service.fetch_members(&group_id)).await }.boxed()
    }

    /// Apply a pull result. Returns when the next pull is due.
    async fn finish_pull(&mut self, result: Result<Vec<MemberLocation>, GuideError>) -> Instant {
        let next = match result {
            Ok(members) => {
                debug!("[GroupSync] Pulled {} members", members.len());
                let events = self.protocol.apply_pull(members, now_ms());
                self.emit(events).await;
                self.after(self.config.pull_interval_ms)
            }
            Err(e) => {
                let events = self.protocol.record_failure();
                let failures = self.protocol.snapshot().consecutive_failures;
                let wait = self.retry_delay(&e, failures);
                warn!(
                    "[GroupSync] Pull failed: {}, attempt {} in {}ms",
                    e, failures, wait
                );
                self.emit(events).await;
                self.after(wait)
            }
        };
        self.snapshot_tx.send_replace(self.protocol.snapshot());
        next
    }

    /// Exponential backoff for transient failures; the cap for the rest.
    fn retry_delay(&self, error: &GuideError, failures: u32) -> u64 {
        if error.is_transient() {
            self.config.backoff_ms(failures)
        } else {
            self.config.backoff_max_ms
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    fn after(&self, ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    async fn emit(&mut self, events: Vec<GroupEvent>) {
        self.snapshot_tx.send_replace(self.protocol.snapshot());
        for event in events {
            // The receiver going away is not an error for the sync loop
            let _ = self.events_tx.send(event).await;
        }
    }
}

/// Resolve the call in `slot`, or never when the slot is empty.
async fn in_flight<T>(slot: &mut Option<Call<T>>) -> Result<T, GuideError> {
    match slot {
        Some(call) => call.await,
        None => std::future::pending().await,
    }
}

async fn timed<T>(
    what: &'static str,
    limit: Duration,
    request: impl Future<Output = Result<T, GuideError>>,
) -> Result<T, GuideError> {
    match timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(GuideError::Timeout(what)),
    }
}

/// Owner-side handle of a running sync task.
pub struct GroupSyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    snapshot: watch::Receiver<GroupSnapshot>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl GroupSyncHandle {
    pub fn snapshot(&self) -> GroupSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GroupSnapshot> {
        self.snapshot.clone()
    }

    pub async fn send(&self, command: SyncCommand) -> Result<(), GuideError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GuideError::ChannelClosed("group sync commands"))
    }

    /// Signal the task, cancel any in-flight call and wait for it to end.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for GroupSyncHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
