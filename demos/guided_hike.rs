//! Simulated hike along a short trail with one group member calling for help.
//!
//! Run with: cargo run --example guided_hike

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use trail_guide::{
    AlertEvent, CallbackPlatform, GeoPoint, GroupLocationService, GroupMembership, GuideConfig,
    GuideError, HikeSession, LocationSample, MemberLocation, MemberStateUpdate, MotionSample,
};

/// In-memory stand-in for the group location service.
struct SimulatedGroup;

#[async_trait]
impl GroupLocationService for SimulatedGroup {
    async fn push_state(
        &self,
        _group_id: &str,
        member_id: &str,
        update: &MemberStateUpdate,
    ) -> Result<(), GuideError> {
        println!(
            "   push {} -> ({:.5}, {:.5}) help={}",
            member_id, update.latitude, update.longitude, update.help_request
        );
        Ok(())
    }

    async fn fetch_members(&self, _group_id: &str) -> Result<Vec<MemberLocation>, GuideError> {
        Ok(vec![MemberLocation {
            member_id: "ana".to_string(),
            display_name: Some("Ana".to_string()),
            position: GeoPoint::new(46.5600, 7.9060),
            accuracy: 12.0,
            altitude: Some(2100.0),
            timestamp_ms: 1,
            going_to: Some("Summit".to_string()),
            help_request: true,
        }])
    }
}

#[tokio::main]
async fn main() -> Result<(), GuideError> {
    // A short trail heading north-east (Bernese Oberland)
    let trail: Vec<GeoPoint> = (0..20)
        .map(|i| GeoPoint::new(46.5500 + i as f64 * 0.0005, 7.9000 + i as f64 * 0.0003))
        .collect();

    let position = CallbackPlatform::<LocationSample>::new();
    let fixes = position.feeder();
    let heading = CallbackPlatform::<MotionSample>::new();
    let motion = heading.feeder();

    let mut config = GuideConfig::default();
    config.position.min_interval_ms = 1_000;

    let session = HikeSession::start(
        &trail,
        config,
        Box::new(position),
        Some(Box::new(heading)),
        Some(GroupMembership {
            group_id: "oberland".to_string(),
            member_id: "me".to_string(),
            service: Arc::new(SimulatedGroup),
        }),
    )?;
    let mut alerts = session.subscribe_alerts();

    println!("Guided hike over {:.0}m\n", session.track().total_distance());

    // Device held flat, top facing north
    motion.push(MotionSample::Accelerometer { values: [0.0, 0.0, 9.81], timestamp_ms: 0 });
    motion.push(MotionSample::Magnetometer { values: [0.0, 20.0, -40.0], timestamp_ms: 0 });

    for step in 0..20u64 {
        let along = trail[step as usize];
        // Wander off the trail for a few fixes halfway through
        let drift = if (8..11).contains(&step) { 0.0008 } else { 0.0 };
        fixes.push(LocationSample {
            latitude: along.latitude,
            longitude: along.longitude + drift,
            altitude: Some(1800.0 + step as f64 * 15.0),
            accuracy_m: 6.0,
            timestamp_ms: step * 1_000,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = session.guidance();
        if let Some(g) = &snap.guidance {
            println!(
                "fix {:>2}: cursor {:>2} -> {:>2} | {:?} {:?} | {:>5.0}m to go{}",
                step,
                snap.cursor,
                g.target_index,
                g.mode,
                g.band,
                snap.remaining_m,
                if snap.off_track { " | OFF TRACK" } else { "" }
            );
        }

        while let Ok(alert) = alerts.try_recv() {
            match alert {
                AlertEvent::OffTrack { deviation_m } => {
                    println!("   ** vibrate: off track by {:.0}m", deviation_m)
                }
                AlertEvent::Distress { member_ids, local } => {
                    println!("   ** vibrate: help requested by {:?} (local: {})", member_ids, local);
                    session.acknowledge_distress().await?;
                }
                AlertEvent::Arrived => println!("   ** arrived"),
            }
        }
    }

    if let Some(group) = session.group_snapshot() {
        println!("\nGroup state: {:?}, {} other member(s)", group.state, group.roster.len());
    }

    session.stop().await;
    Ok(())
}
