//! # Hike Session
//!
//! Binds one trail to the live sensor streams, the matcher and (optionally)
//! a group sync task.
//!
//! A single guidance loop owns the [`PositionMatcher`] and consumes fixes in
//! arrival order, so the cursor has exactly one writer. Results are published
//! as [`GuidanceSnapshot`]s on a `watch` channel; [`AlertEvent`]s go out on a
//! `broadcast` channel.
//!
//! [`HikeSession::stop`] deregisters both sensor adapters and cancels the
//! guidance loop and the group sync task in one call.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::GuideConfig;
use crate::error::GuideError;
use crate::group::{
    GroupEvent, GroupLocationService, GroupSnapshot, GroupSync, GroupSyncHandle, SyncCommand,
};
use crate::guidance::{AlertEvent, AlertTrigger, Guidance, GuidanceCalculator};
use crate::matcher::{MatchOutcome, PositionMatcher};
use crate::sensors::heading::{HeadingFusion, HeadingReading, MotionSample};
use crate::sensors::position::{LocationSample, PositionNormalizer};
use crate::sensors::{SampleProcessor, SampleStream, SensorAdapter, SensorPlatform, SensorStatus};
use crate::track::Track;
use crate::{Fix, GeoPoint};

/// Group the session should join.
#[derive(Clone)]
pub struct GroupMembership {
    pub group_id: String,
    pub member_id: String,
    pub service: Arc<dyn GroupLocationService>,
}

/// What the UI renders. Copied out of the guidance loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceSnapshot {
    /// `None` until the first matched fix
    pub guidance: Option<Guidance>,
    pub cursor: usize,
    pub along_track_m: f64,
    pub remaining_m: f64,
    pub deviation_m: f64,
    pub off_track: bool,
    pub arrived: bool,
    pub last_fix: Option<Fix>,
    pub heading: Option<HeadingReading>,
    /// Fixes dropped for invalid coordinates or poor accuracy
    pub ignored_fixes: u64,
    pub position_status: SensorStatus,
    pub heading_status: SensorStatus,
}

impl GuidanceSnapshot {
    fn initial(track: &Track, position_status: SensorStatus, heading_status: SensorStatus) -> Self {
        Self {
            guidance: None,
            cursor: 0,
            along_track_m: 0.0,
            remaining_m: track.total_distance(),
            deviation_m: 0.0,
            off_track: false,
            arrived: false,
            last_fix: None,
            heading: None,
            ignored_fixes: 0,
            position_status,
            heading_status,
        }
    }
}

/// A running hike.
pub struct HikeSession {
    track: Arc<Track>,
    position: SensorAdapter<PositionNormalizer>,
    heading: Option<SensorAdapter<HeadingFusion>>,
    group: Option<GroupSyncHandle>,
    guidance: watch::Receiver<GuidanceSnapshot>,
    alerts: broadcast::Sender<AlertEvent>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl HikeSession {
    /// Start guiding along `points`.
    ///
    /// The track is validated before any sensor is touched. Must be called
    /// from within a Tokio runtime. A missing sensor is not fatal: it shows
    /// up as [`SensorStatus::Unavailable`] in the snapshot.
    pub fn start(
        points: &[GeoPoint],
        config: GuideConfig,
        position_platform: Box<dyn SensorPlatform<Sample = LocationSample>>,
        heading_platform: Option<Box<dyn SensorPlatform<Sample = MotionSample>>>,
        group: Option<GroupMembership>,
    ) -> Result<Self, GuideError> {
        config.validate()?;
        let track = Arc::new(Track::from_points(points)?);
        let runtime = Handle::try_current().map_err(|_| GuideError::NoRuntime)?;

        let capacity = config.channel_capacity;
        let mut position = SensorAdapter::new(
            position_platform,
            PositionNormalizer::new(config.position.clone()),
            capacity,
        );
        let fixes = start_adapter(&mut position)?;

        let mut heading = heading_platform.map(|platform| {
            SensorAdapter::new(platform, HeadingFusion::new(config.heading.clone()), capacity)
        });
        let headings = match heading.as_mut() {
            Some(adapter) => start_adapter(adapter)?,
            None => None,
        };

        let (local_fix_tx, local_fix_rx) = watch::channel(None);
        let (group_events_tx, group_events_rx) = mpsc::channel(capacity);
        let group = group.map(|membership| {
            GroupSync::spawn(
                membership.group_id,
                membership.member_id,
                membership.service,
                config.sync.clone(),
                local_fix_rx,
                group_events_tx,
            )
        });

        let initial = GuidanceSnapshot::initial(
            &track,
            position.status(),
            heading.as_ref().map_or(SensorStatus::Unavailable, |h| h.status()),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (alerts, _) = broadcast::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let guidance_loop = GuidanceLoop {
            matcher: PositionMatcher::new(Arc::clone(&track), config.matcher.clone()),
            calculator: GuidanceCalculator::new(config.guidance.clone()),
            trigger: AlertTrigger::new(),
            heading: None,
            snapshot_tx,
            alerts: alerts.clone(),
            local_fix: local_fix_tx,
        };
        let group_events = group.as_ref().map(|_| group_events_rx);
        let task = runtime.spawn(guidance_loop.run(fixes, headings, group_events, shutdown_rx));

        info!(
            "[HikeSession] Started on {} points ({:.0}m), group: {}",
            track.len(),
            track.total_distance(),
            group.is_some()
        );

        Ok(Self {
            track,
            position,
            heading,
            group,
            guidance: snapshot_rx,
            alerts,
            shutdown,
            task: Some(task),
        })
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    /// Latest guidance (copy-out).
    pub fn guidance(&self) -> GuidanceSnapshot {
        self.guidance.borrow().clone()
    }

    pub fn subscribe_guidance(&self) -> watch::Receiver<GuidanceSnapshot> {
        self.guidance.clone()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    pub fn group_snapshot(&self) -> Option<GroupSnapshot> {
        self.group.as_ref().map(|g| g.snapshot())
    }

    pub fn subscribe_group(&self) -> Option<watch::Receiver<GroupSnapshot>> {
        self.group.as_ref().map(|g| g.subscribe())
    }

    pub fn position_status(&self) -> SensorStatus {
        self.position.status()
    }

    pub fn heading_status(&self) -> SensorStatus {
        self.heading.as_ref().map_or(SensorStatus::Unavailable, |h| h.status())
    }

    /// Raise the local SOS flag. No-op outside a group.
    pub async fn request_help(&self) -> Result<(), GuideError> {
        self.send_group(SyncCommand::SetHelp(true)).await
    }

    pub async fn clear_help(&self) -> Result<(), GuideError> {
        self.send_group(SyncCommand::SetHelp(false)).await
    }

    /// Acknowledge every remote help request active right now.
    pub async fn acknowledge_distress(&self) -> Result<(), GuideError> {
        self.send_group(SyncCommand::Acknowledge).await
    }

    pub async fn set_going_to(&self, label: Option<String>) -> Result<(), GuideError> {
        self.send_group(SyncCommand::SetGoingTo(label)).await
    }

    async fn send_group(&self, command: SyncCommand) -> Result<(), GuideError> {
        match &self.group {
            Some(group) => group.send(command).await,
            None => {
                debug!("[HikeSession] Not in a group, ignoring {:?}", command);
                Ok(())
            }
        }
    }

    /// End the hike: sensors deregistered, loop and group sync cancelled.
    pub async fn stop(mut self) {
        self.halt();
        if let Some(group) = self.group.take() {
            group.shutdown().await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("[HikeSession] Stopped");
    }

    fn halt(&mut self) {
        self.position.stop();
        if let Some(heading) = self.heading.as_mut() {
            heading.stop();
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.as_ref() {
            task.abort();
        }
    }
}

impl Drop for HikeSession {
    fn drop(&mut self) {
        self.halt();
    }
}

fn start_adapter<P: SampleProcessor>(
    adapter: &mut SensorAdapter<P>,
) -> Result<Option<SampleStream<P::Output>>, GuideError> {
    match adapter.start() {
        Ok(rx) => Ok(Some(rx)),
        Err(GuideError::SensorUnavailable(name)) => {
            warn!("[HikeSession] {} unavailable, continuing without it", name);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// The single consumer of fixes. Owns the matcher.
struct GuidanceLoop {
    matcher: PositionMatcher,
    calculator: GuidanceCalculator,
    trigger: AlertTrigger,
    heading: Option<HeadingReading>,
    snapshot_tx: watch::Sender<GuidanceSnapshot>,
    alerts: broadcast::Sender<AlertEvent>,
    local_fix: watch::Sender<Option<Fix>>,
}

impl GuidanceLoop {
    async fn run(
        mut self,
        mut fixes: Option<SampleStream<Fix>>,
        mut headings: Option<SampleStream<HeadingReading>>,
        mut group_events: Option<mpsc::Receiver<GroupEvent>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fix = next_sample(&mut fixes) => match fix {
                    Some(fix) => self.on_fix(fix),
                    None => fixes = None,
                },
                reading = next_sample(&mut headings) => match reading {
                    Some(reading) => self.on_heading(reading),
                    None => headings = None,
                },
                event = next_event(&mut group_events) => match event {
                    Some(event) => self.on_group_event(event),
                    None => group_events = None,
                },
            }
        }
        debug!("[GuidanceLoop] Exited");
    }

    fn on_fix(&mut self, fix: Fix) {
        self.local_fix.send_replace(Some(fix));

        match self.matcher.process_fix(&fix) {
            MatchOutcome::Updated(update) => {
                for alert in self.trigger.observe_match(&update) {
                    self.alert(alert);
                }
                let guidance =
                    self.calculator
                        .compute(&update, self.matcher.track(), self.heading.as_ref());
                self.snapshot_tx.send_modify(|snap| {
                    snap.guidance = Some(guidance);
                    snap.cursor = update.cursor;
                    snap.along_track_m = update.along_track_m;
                    snap.remaining_m = update.remaining_m;
                    snap.deviation_m = update.deviation_m;
                    snap.off_track = update.off_track;
                    snap.arrived = update.arrived;
                    snap.last_fix = Some(fix);
                });
            }
            MatchOutcome::Ignored(reason) => {
                debug!("[GuidanceLoop] Fix ignored: {:?}", reason);
                self.snapshot_tx.send_modify(|snap| snap.ignored_fixes += 1);
            }
        }
    }

    fn on_heading(&mut self, reading: HeadingReading) {
        self.heading = Some(reading);
        let guidance = self.matcher.last_update().map(|update| {
            self.calculator
                .compute(update, self.matcher.track(), Some(&reading))
        });
        self.snapshot_tx.send_modify(|snap| {
            snap.heading = Some(reading);
            if guidance.is_some() {
                snap.guidance = guidance;
            }
        });
    }

    fn on_group_event(&mut self, event: GroupEvent) {
        if let Some(alert) = self.trigger.observe_group(&event) {
            self.alert(alert);
        }
    }

    fn alert(&self, alert: AlertEvent) {
        info!("[GuidanceLoop] Alert: {:?}", alert);
        // No subscribers is fine
        let _ = self.alerts.send(alert);
    }
}

async fn next_sample<T: Clone>(stream: &mut Option<SampleStream<T>>) -> Option<T> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_event<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupState, MemberLocation, MemberStateUpdate};
    use crate::guidance::{GuidanceBand, GuidanceMode};
    use crate::sensors::{CallbackPlatform, SensorFeeder};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn trail() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 0.001),
            GeoPoint::new(0.0, 0.002),
        ]
    }

    fn location(lat: f64, lng: f64, ts: u64) -> LocationSample {
        LocationSample {
            latitude: lat,
            longitude: lng,
            altitude: None,
            accuracy_m: 5.0,
            timestamp_ms: ts,
        }
    }

    type PositionPlatform = Box<dyn SensorPlatform<Sample = LocationSample>>;
    type MotionPlatform = Box<dyn SensorPlatform<Sample = MotionSample>>;

    fn platforms() -> (
        PositionPlatform,
        SensorFeeder<LocationSample>,
        MotionPlatform,
        SensorFeeder<MotionSample>,
    ) {
        let position = CallbackPlatform::new();
        let position_feeder = position.feeder();
        let heading = CallbackPlatform::new();
        let heading_feeder = heading.feeder();
        (Box::new(position), position_feeder, Box::new(heading), heading_feeder)
    }

    async fn wait_for<T: Clone>(
        rx: &mut watch::Receiver<T>,
        pred: impl Fn(&T) -> bool,
    ) -> T {
        timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                rx.changed().await.expect("sender dropped");
            }
        })
        .await
        .expect("timed out waiting for snapshot")
    }

    async fn next_alert(rx: &mut broadcast::Receiver<AlertEvent>) -> AlertEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for alert")
            .expect("alert channel closed")
    }

    struct RemoteHelp;

    #[async_trait]
    impl GroupLocationService for RemoteHelp {
        async fn push_state(
            &self,
            _group_id: &str,
            _member_id: &str,
            _update: &MemberStateUpdate,
        ) -> Result<(), GuideError> {
            Ok(())
        }

        async fn fetch_members(&self, _group_id: &str) -> Result<Vec<MemberLocation>, GuideError> {
            Ok(vec![MemberLocation {
                member_id: "ana".to_string(),
                display_name: Some("Ana".to_string()),
                position: GeoPoint::new(0.0, 0.0015),
                accuracy: 10.0,
                altitude: None,
                timestamp_ms: 1,
                going_to: None,
                help_request: true,
            }])
        }
    }

    /// Counts calls; the roster is always empty.
    #[derive(Default)]
    struct CountingService {
        pushes: AtomicUsize,
        pulls: AtomicUsize,
    }

    impl CountingService {
        fn counts(&self) -> (usize, usize) {
            (self.pushes.load(Ordering::SeqCst), self.pulls.load(Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl GroupLocationService for CountingService {
        async fn push_state(
            &self,
            _group_id: &str,
            _member_id: &str,
            _update: &MemberStateUpdate,
        ) -> Result<(), GuideError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_members(&self, _group_id: &str) -> Result<Vec<MemberLocation>, GuideError> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_start_outside_runtime() {
        let (position, feeder, _, _) = platforms();
        let result = HikeSession::start(&trail(), GuideConfig::default(), position, None, None);
        assert!(matches!(result, Err(GuideError::NoRuntime)));
        assert!(!feeder.is_registered());
    }

    #[tokio::test]
    async fn test_invalid_track_fails_before_sensors() {
        let (position, feeder, _, _) = platforms();
        let result = HikeSession::start(
            &[GeoPoint::new(0.0, 0.0)],
            GuideConfig::default(),
            position,
            None,
            None,
        );
        assert!(matches!(result, Err(GuideError::InvalidTrack(_))));
        assert!(!feeder.is_registered());
    }

    #[tokio::test]
    async fn test_guidance_from_fixes_and_heading() {
        let (position, fixes, heading, motion) = platforms();
        let session =
            HikeSession::start(&trail(), GuideConfig::default(), position, Some(heading), None)
                .unwrap();
        assert_eq!(session.position_status(), SensorStatus::Running);
        assert_eq!(session.heading_status(), SensorStatus::Running);

        let mut rx = session.subscribe_guidance();
        assert!(fixes.push(location(0.0, 0.0, 0)));
        let snap = wait_for(&mut rx, |s| s.guidance.is_some()).await;
        let guidance = snap.guidance.unwrap();
        assert_eq!(snap.cursor, 0);
        assert_eq!(guidance.target_index, 1);
        assert_eq!(guidance.mode, GuidanceMode::FollowTrail);
        assert_eq!(guidance.band, None);

        // Facing north while the trail runs east
        motion.push(MotionSample::Accelerometer { values: [0.0, 0.0, 9.81], timestamp_ms: 0 });
        motion.push(MotionSample::Magnetometer { values: [0.0, 20.0, -40.0], timestamp_ms: 0 });
        let snap = wait_for(&mut rx, |s| s.guidance.as_ref().and_then(|g| g.band).is_some()).await;
        assert_eq!(snap.guidance.unwrap().band, Some(GuidanceBand::TurnRight));

        fixes.push(location(0.0, 0.0015, 3_000));
        let snap = wait_for(&mut rx, |s| s.cursor > 0).await;
        assert!(snap.cursor == 1 || snap.cursor == 2);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_off_track_alert_fires_once() {
        let (position, fixes, _, _) = platforms();
        let session =
            HikeSession::start(&trail(), GuideConfig::default(), position, None, None).unwrap();
        let mut alerts = session.subscribe_alerts();
        let mut rx = session.subscribe_guidance();

        fixes.push(location(0.0, 0.0, 0));
        fixes.push(location(-0.001, 0.0005, 3_000));
        assert!(matches!(next_alert(&mut alerts).await, AlertEvent::OffTrack { .. }));

        fixes.push(location(-0.001, 0.0005, 6_000));
        let snap = wait_for(&mut rx, |s| s.last_fix.map(|f| f.timestamp_ms) == Some(6_000)).await;
        assert!(snap.off_track);
        assert_eq!(snap.guidance.unwrap().mode, GuidanceMode::ReturnToTrail);
        assert!(alerts.try_recv().is_err());

        session.stop().await;
    }

    #[tokio::test]
    async fn test_ignored_fixes_counted() {
        let (position, fixes, _, _) = platforms();
        let session =
            HikeSession::start(&trail(), GuideConfig::default(), position, None, None).unwrap();
        let mut rx = session.subscribe_guidance();

        let mut poor = location(0.0, 0.0, 0);
        poor.accuracy_m = 500.0;
        fixes.push(poor);
        let snap = wait_for(&mut rx, |s| s.ignored_fixes == 1).await;
        assert!(snap.guidance.is_none());

        session.stop().await;
    }

    #[tokio::test]
    async fn test_missing_heading_sensor_is_a_status() {
        let (position, fixes, _, _) = platforms();
        let session = HikeSession::start(
            &trail(),
            GuideConfig::default(),
            position,
            Some(Box::new(CallbackPlatform::<MotionSample>::unavailable()) as MotionPlatform),
            None,
        )
        .unwrap();
        assert_eq!(session.heading_status(), SensorStatus::Unavailable);
        assert_eq!(session.guidance().heading_status, SensorStatus::Unavailable);

        let mut rx = session.subscribe_guidance();
        fixes.push(location(0.0, 0.0, 0));
        let snap = wait_for(&mut rx, |s| s.guidance.is_some()).await;
        assert!(!snap.guidance.unwrap().heading_confident);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_deregisters_everything() {
        let (position, fixes, heading, motion) = platforms();
        let session =
            HikeSession::start(&trail(), GuideConfig::default(), position, Some(heading), None)
                .unwrap();
        assert!(fixes.is_registered());
        assert!(motion.is_registered());

        session.stop().await;
        assert!(!fixes.is_registered());
        assert!(!motion.is_registered());
        assert!(!fixes.push(location(0.0, 0.0, 0)));
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let (position, fixes, _, _) = platforms();
        let session =
            HikeSession::start(&trail(), GuideConfig::default(), position, None, None).unwrap();
        drop(session);
        assert!(!fixes.is_registered());
    }

    #[tokio::test]
    async fn test_remote_help_raises_distress_alert() {
        let (position, _fixes, _, _) = platforms();
        let membership = GroupMembership {
            group_id: "alps".to_string(),
            member_id: "me".to_string(),
            service: Arc::new(RemoteHelp),
        };
        let session = HikeSession::start(
            &trail(),
            GuideConfig::default(),
            position,
            None,
            Some(membership),
        )
        .unwrap();
        let mut alerts = session.subscribe_alerts();

        match next_alert(&mut alerts).await {
            AlertEvent::Distress { member_ids, local } => {
                assert_eq!(member_ids, vec!["ana".to_string()]);
                assert!(!local);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        assert_eq!(session.group_snapshot().unwrap().state, GroupState::Distress);

        session.acknowledge_distress().await.unwrap();
        let mut group = session.subscribe_group().unwrap();
        wait_for(&mut group, |g| g.state == GroupState::Syncing).await;

        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_group_sync() {
        let (position, fixes, _, _) = platforms();
        let service = Arc::new(CountingService::default());
        let membership = GroupMembership {
            group_id: "alps".to_string(),
            member_id: "me".to_string(),
            service: service.clone(),
        };
        let session = HikeSession::start(
            &trail(),
            GuideConfig::default(),
            position,
            None,
            Some(membership),
        )
        .unwrap();

        fixes.push(location(0.0, 0.0, 0));
        tokio::time::sleep(Duration::from_secs(25)).await;
        let (pushes, pulls) = service.counts();
        assert!(pushes >= 2, "pushes {}", pushes);
        assert!(pulls >= 3, "pulls {}", pulls);

        session.stop().await;
        let stopped_at = service.counts();
        assert_eq!(Arc::strong_count(&service), 1, "sync task still holds the service");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(service.counts(), stopped_at);
    }

    #[tokio::test]
    async fn test_help_commands_without_group() {
        let (position, _fixes, _, _) = platforms();
        let session =
            HikeSession::start(&trail(), GuideConfig::default(), position, None, None).unwrap();
        assert!(session.request_help().await.is_ok());
        assert!(session.group_snapshot().is_none());
        session.stop().await;
    }
}
