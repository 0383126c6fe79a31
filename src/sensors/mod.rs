//! # Sensor Push Sources
//!
//! Platform sensor callbacks feed bounded queues that the hike session
//! drains in arrival order.
//!
//! A [`SensorAdapter`] owns one [`SensorPlatform`] (the callback registration
//! seam) and one [`SampleProcessor`] (fusion or normalisation). On
//! [`start`](SensorAdapter::start) it hands the platform a [`SampleSink`]; raw
//! samples pushed into the sink are processed under a lock together with an
//! `active` flag, and the output is
//! - published as the adapter's current value (`tokio::sync::watch`), and
//! - queued on a bounded `tokio::sync::broadcast` ring read through a
//!   [`SampleStream`]. When the consumer falls behind, the oldest queued
//!   samples are overwritten so it always catches up on the newest ones.
//!
//! [`stop`](SensorAdapter::stop) clears the flag under the same lock before
//! unregistering, so no output is delivered once `stop` returns.

pub mod heading;
pub mod position;

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::watch;

use crate::error::GuideError;

/// Lifecycle of a sensor adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStatus {
    /// Constructed, not started
    Idle,
    Running,
    Stopped,
    /// The device lacks the sensor; permanent for this adapter
    Unavailable,
}

/// Turns raw platform samples into the values consumers care about.
pub trait SampleProcessor: Send + 'static {
    type Raw: Send + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Short name used in logs and errors.
    const NAME: &'static str;

    /// Process one raw sample. `None` means nothing to publish for it.
    fn process(&mut self, raw: Self::Raw) -> Option<Self::Output>;
}

/// Registration seam for platform sensor callbacks.
///
/// Implementations hold on to the sink between `register` and `unregister`
/// and push every raw sample into it.
pub trait SensorPlatform: Send {
    type Sample: Send + 'static;

    fn is_available(&self) -> bool;

    fn register(&mut self, sink: SampleSink<Self::Sample>) -> Result<(), GuideError>;

    fn unregister(&mut self);
}

trait SinkTarget<R>: Send + Sync {
    fn deliver(&self, raw: R) -> bool;
}

/// Handle given to a platform for pushing raw samples.
pub struct SampleSink<R> {
    target: Arc<dyn SinkTarget<R>>,
}

impl<R> Clone for SampleSink<R> {
    fn clone(&self) -> Self {
        Self { target: Arc::clone(&self.target) }
    }
}

impl<R> SampleSink<R> {
    /// Push one raw sample. Returns `false` once the adapter has stopped.
    pub fn push(&self, raw: R) -> bool {
        self.target.deliver(raw)
    }
}

struct PipelineState<P: SampleProcessor> {
    active: bool,
    processor: P,
    tx: Option<broadcast::Sender<P::Output>>,
    capacity: usize,
    current: watch::Sender<Option<P::Output>>,
    dropped: u64,
}

struct Pipeline<P: SampleProcessor> {
    state: Mutex<PipelineState<P>>,
}

impl<P: SampleProcessor> SinkTarget<P::Raw> for Pipeline<P> {
    fn deliver(&self, raw: P::Raw) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        if !state.active {
            return false;
        }

        let Some(output) = state.processor.process(raw) else {
            return true;
        };
        state.current.send_replace(Some(output.clone()));

        if let Some(tx) = &state.tx {
            let overwrites = tx.len() >= state.capacity;
            match tx.send(output) {
                Ok(_) if overwrites => {
                    state.dropped += 1;
                    debug!(
                        "[{}] Consumer behind, overwrote oldest sample ({} total)",
                        P::NAME,
                        state.dropped
                    );
                }
                Ok(_) => {}
                Err(_) => {
                    debug!("[{}] Consumer gone, detaching channel", P::NAME);
                    state.tx = None;
                }
            }
        }
        true
    }
}

/// Ordered output of a running [`SensorAdapter`].
///
/// Ends (`None` / [`TryRecvError::Closed`]) once the adapter stops and the
/// queued samples are drained.
pub struct SampleStream<T> {
    rx: broadcast::Receiver<T>,
    name: &'static str,
}

impl<T: Clone> SampleStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => self.skipped(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Never returns [`TryRecvError::Lagged`]; overwritten samples are skipped.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        loop {
            match self.rx.try_recv() {
                Err(TryRecvError::Lagged(skipped)) => self.skipped(skipped),
                other => return other,
            }
        }
    }

    fn skipped(&self, count: u64) {
        debug!("[{}] Consumer skipped {} overwritten samples", self.name, count);
    }
}

/// A push source: one platform sensor plus its processor.
pub struct SensorAdapter<P: SampleProcessor> {
    platform: Box<dyn SensorPlatform<Sample = P::Raw>>,
    pipeline: Arc<Pipeline<P>>,
    current: watch::Receiver<Option<P::Output>>,
    status: SensorStatus,
    capacity: usize,
}

impl<P: SampleProcessor> SensorAdapter<P> {
    /// Create an adapter; `capacity` bounds the output queue and is rounded
    /// up to a power of two.
    pub fn new(
        platform: Box<dyn SensorPlatform<Sample = P::Raw>>,
        processor: P,
        capacity: usize,
    ) -> Self {
        let (current_tx, current_rx) = watch::channel(None);
        Self {
            platform,
            pipeline: Arc::new(Pipeline {
                state: Mutex::new(PipelineState {
                    active: false,
                    processor,
                    tx: None,
                    capacity: 0,
                    current: current_tx,
                    dropped: 0,
                }),
            }),
            current: current_rx,
            status: SensorStatus::Idle,
            capacity: capacity.max(1).next_power_of_two(),
        }
    }

    pub fn status(&self) -> SensorStatus {
        self.status
    }

    /// Latest processed value (copy-out).
    pub fn current(&self) -> Option<P::Output> {
        self.current.borrow().clone()
    }

    /// Observe the latest processed value.
    pub fn subscribe(&self) -> watch::Receiver<Option<P::Output>> {
        self.current.clone()
    }

    /// Oldest samples overwritten because the consumer fell behind.
    pub fn dropped_samples(&self) -> u64 {
        self.lock_state().dropped
    }

    /// Register with the platform and return the ordered output stream.
    pub fn start(&mut self) -> Result<SampleStream<P::Output>, GuideError> {
        match self.status {
            SensorStatus::Unavailable => return Err(GuideError::SensorUnavailable(P::NAME)),
            SensorStatus::Running => return Err(GuideError::SensorAlreadyStarted(P::NAME)),
            SensorStatus::Idle | SensorStatus::Stopped => {}
        }

        if !self.platform.is_available() {
            warn!("[{}] Sensor not available on this device", P::NAME);
            self.status = SensorStatus::Unavailable;
            return Err(GuideError::SensorUnavailable(P::NAME));
        }

        let (tx, rx) = broadcast::channel(self.capacity);
        {
            let mut state = self.lock_state();
            state.active = true;
            state.tx = Some(tx);
            state.capacity = self.capacity;
        }

        let sink = SampleSink {
            target: Arc::clone(&self.pipeline) as Arc<dyn SinkTarget<P::Raw>>,
        };
        if let Err(e) = self.platform.register(sink) {
            warn!("[{}] Registration failed: {}", P::NAME, e);
            self.deactivate();
            self.status = SensorStatus::Unavailable;
            return Err(e);
        }

        info!("[{}] Started (channel capacity {})", P::NAME, self.capacity);
        self.status = SensorStatus::Running;
        Ok(SampleStream { rx, name: P::NAME })
    }

    /// Deregister from the platform. Idempotent.
    pub fn stop(&mut self) {
        if self.status != SensorStatus::Running {
            return;
        }
        self.deactivate();
        self.platform.unregister();
        self.status = SensorStatus::Stopped;
        info!("[{}] Stopped", P::NAME);
    }

    fn deactivate(&self) {
        let mut state = self.lock_state();
        state.active = false;
        state.tx = None;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PipelineState<P>> {
        self.pipeline.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: SampleProcessor> Drop for SensorAdapter<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Host-driven platform
// ============================================================================

type SharedSink<R> = Arc<Mutex<Option<SampleSink<R>>>>;

/// A platform driven by the host application.
///
/// The host's native sensor callbacks call [`SensorFeeder::push`]; samples
/// reach the adapter only while it is registered.
pub struct CallbackPlatform<R> {
    sink: SharedSink<R>,
    available: bool,
}

impl<R: Send + 'static> CallbackPlatform<R> {
    pub fn new() -> Self {
        Self { sink: Arc::new(Mutex::new(None)), available: true }
    }

    /// A platform reporting that the device has no such sensor.
    pub fn unavailable() -> Self {
        Self { sink: Arc::new(Mutex::new(None)), available: false }
    }

    /// Handle for the host's callbacks.
    pub fn feeder(&self) -> SensorFeeder<R> {
        SensorFeeder { sink: Arc::clone(&self.sink) }
    }
}

impl<R: Send + 'static> Default for CallbackPlatform<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> SensorPlatform for CallbackPlatform<R> {
    type Sample = R;

    fn is_available(&self) -> bool {
        self.available
    }

    fn register(&mut self, sink: SampleSink<R>) -> Result<(), GuideError> {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn unregister(&mut self) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Cloneable handle that pushes raw samples into a [`CallbackPlatform`].
pub struct SensorFeeder<R> {
    sink: SharedSink<R>,
}

impl<R> Clone for SensorFeeder<R> {
    fn clone(&self) -> Self {
        Self { sink: Arc::clone(&self.sink) }
    }
}

impl<R> SensorFeeder<R> {
    /// Push a raw sample. Returns `false` when nothing is registered.
    pub fn push(&self, raw: R) -> bool {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => sink.push(raw),
            None => false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Doubles every value; drops negatives.
    struct Doubler;

    impl SampleProcessor for Doubler {
        type Raw = i32;
        type Output = i32;
        const NAME: &'static str = "Doubler";

        fn process(&mut self, raw: i32) -> Option<i32> {
            (raw >= 0).then_some(raw * 2)
        }
    }

    fn adapter(capacity: usize) -> (SensorAdapter<Doubler>, SensorFeeder<i32>) {
        let platform = CallbackPlatform::new();
        let feeder = platform.feeder();
        (SensorAdapter::new(Box::new(platform), Doubler, capacity), feeder)
    }

    #[test]
    fn test_samples_flow_in_order() {
        let (mut adapter, feeder) = adapter(8);
        assert!(!feeder.push(1), "not registered before start");

        let mut rx = adapter.start().unwrap();
        assert_eq!(adapter.status(), SensorStatus::Running);
        assert!(feeder.push(1));
        assert!(feeder.push(-5));
        assert!(feeder.push(3));

        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 6);
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.current(), Some(6));
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let (mut adapter, feeder) = adapter(8);
        let mut rx = adapter.start().unwrap();
        feeder.push(1);
        adapter.stop();

        assert_eq!(adapter.status(), SensorStatus::Stopped);
        assert!(!feeder.is_registered());
        assert!(!feeder.push(2));
        assert_eq!(rx.try_recv().unwrap(), 2);
        // Sender dropped on stop: the stream ends after draining
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
    }

    #[test]
    fn test_stale_sink_cannot_deliver_after_stop() {
        struct Hoarding {
            kept: SharedSink<i32>,
        }
        impl SensorPlatform for Hoarding {
            type Sample = i32;
            fn is_available(&self) -> bool {
                true
            }
            fn register(&mut self, sink: SampleSink<i32>) -> Result<(), GuideError> {
                *self.kept.lock().unwrap() = Some(sink);
                Ok(())
            }
            // Forgets to drop the sink
            fn unregister(&mut self) {}
        }

        let kept: SharedSink<i32> = Arc::new(Mutex::new(None));
        let mut adapter = SensorAdapter::new(
            Box::new(Hoarding { kept: Arc::clone(&kept) }),
            Doubler,
            4,
        );
        let _rx = adapter.start().unwrap();
        adapter.stop();

        let sink = kept.lock().unwrap().clone().unwrap();
        assert!(!sink.push(7));
        assert_eq!(adapter.current(), None);
    }

    #[test]
    fn test_unavailable_is_permanent() {
        let mut adapter: SensorAdapter<Doubler> =
            SensorAdapter::new(Box::new(CallbackPlatform::<i32>::unavailable()), Doubler, 4);
        assert!(matches!(adapter.start(), Err(GuideError::SensorUnavailable("Doubler"))));
        assert_eq!(adapter.status(), SensorStatus::Unavailable);
        assert!(adapter.start().is_err());
    }

    #[test]
    fn test_double_start_rejected_and_restart_allowed() {
        let (mut adapter, feeder) = adapter(4);
        let _rx = adapter.start().unwrap();
        assert!(matches!(adapter.start(), Err(GuideError::SensorAlreadyStarted(_))));
        adapter.stop();
        let mut rx = adapter.start().unwrap();
        feeder.push(4);
        assert_eq!(rx.try_recv().unwrap(), 8);
    }

    #[test]
    fn test_slow_consumer_keeps_newest_samples() {
        let (mut adapter, feeder) = adapter(2);
        let mut rx = adapter.start().unwrap();
        for i in 0..5 {
            feeder.push(i);
        }
        assert_eq!(adapter.dropped_samples(), 3);
        assert_eq!(rx.try_recv().unwrap(), 6);
        assert_eq!(rx.try_recv().unwrap(), 8);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(adapter.current(), Some(8));

        // Caught up: nothing more is dropped
        feeder.push(5);
        assert_eq!(rx.try_recv().unwrap(), 10);
        assert_eq!(adapter.dropped_samples(), 3);
    }

    #[tokio::test]
    async fn test_stream_ends_after_stop() {
        let (mut adapter, feeder) = adapter(3);
        let mut rx = adapter.start().unwrap();
        for i in 0..6 {
            feeder.push(i);
        }
        adapter.stop();

        let mut received = Vec::new();
        while let Some(value) = rx.recv().await {
            received.push(value);
        }
        // Capacity 3 rounds up to 4
        assert_eq!(received, vec![4, 6, 8, 10]);
        assert_eq!(adapter.dropped_samples(), 2);
    }

    #[test]
    fn test_drop_unregisters() {
        let (mut adapter, feeder) = adapter(2);
        let _rx = adapter.start().unwrap();
        assert!(feeder.is_registered());
        drop(adapter);
        assert!(!feeder.is_registered());
    }
}
