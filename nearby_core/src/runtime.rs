//! Engine Runtime - drives an [`Engine`] from an async inbox.
//!
//! The engine itself is synchronous and owns all state. The runtime moves it
//! onto a single task, so callers on any thread talk to it through a cloneable
//! [`EngineHandle`] and never race a pass in progress.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   EngineEvent    ┌──────────────────────────────────┐
//! │ EngineHandle │ ───────────────► │          EngineRuntime           │
//! │  (cloneable) │   (unbounded)    │  ┌────────────────────────────┐  │
//! └──────────────┘                  │  │ Context: NearbyContext     │  │
//!        ▲                          │  │  • now_millis() → clock    │  │
//!        │ pump()                   │  │  • sleep() → debounce/anim │  │
//! ┌──────┴─────────┐                │  └────────────────────────────┘  │
//! │TelemetrySource │                │   Engine ──► RenderSurface       │
//! └────────────────┘                └──────────────┬───────────────────┘
//!                                                  │ MarkerActivation
//!                                                  ▼
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nearby_core::runtime::EngineRuntime;
//! use nearby_env::TokioContext;
//!
//! let (runtime, handle, mut activations) =
//!     EngineRuntime::new(TokioContext::shared(), EngineConfig::default(), surface);
//! tokio::spawn(runtime.run());
//!
//! handle.submit_peer_reports(reports)?;
//! ```

use nearby_env::{
    MarkerId, NearbyContext, PeerId, PeerReport, Position, RenderSurface, TelemetryEvent,
    TelemetrySource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::engine::{Engine, EngineConfig, MarkerActivation};
use crate::error::EngineError;
use crate::lifecycle::RenderBatch;

/// A message for the engine task.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Reports(Vec<PeerReport>),
    Viewport { zoom: f64, center: Position },
    Viewer(Option<Position>),
    Remove(PeerId),
    Activated(MarkerId),
    Shutdown,
}

/// Cloneable sender side of the engine inbox.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    inbox: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    fn send(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.inbox
            .send(event)
            .map_err(|_| EngineError::RuntimeStopped)
    }

    pub fn submit_peer_reports(&self, reports: Vec<PeerReport>) -> Result<(), EngineError> {
        self.send(EngineEvent::Reports(reports))
    }

    pub fn set_viewport(&self, zoom: f64, center: Position) -> Result<(), EngineError> {
        self.send(EngineEvent::Viewport { zoom, center })
    }

    pub fn set_viewer_position(&self, position: Option<Position>) -> Result<(), EngineError> {
        self.send(EngineEvent::Viewer(position))
    }

    pub fn remove_peer(&self, id: PeerId) -> Result<(), EngineError> {
        self.send(EngineEvent::Remove(id))
    }

    pub fn marker_activated(&self, id: MarkerId) -> Result<(), EngineError> {
        self.send(EngineEvent::Activated(id))
    }

    /// Asks the runtime to finish queued work and stop.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.send(EngineEvent::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

enum Wake {
    Event(Option<EngineEvent>),
    Timer,
}

/// Owns the engine and the rendering surface for the lifetime of the task.
pub struct EngineRuntime<Ctx, S>
where
    Ctx: NearbyContext,
    S: RenderSurface,
{
    context: Arc<Ctx>,
    engine: Engine,
    surface: S,
    inbox: mpsc::UnboundedReceiver<EngineEvent>,
    activations: mpsc::UnboundedSender<MarkerActivation>,
}

impl<Ctx, S> EngineRuntime<Ctx, S>
where
    Ctx: NearbyContext,
    S: RenderSurface,
{
    /// Creates a runtime, the handle to feed it and the activation stream.
    pub fn new(
        context: Arc<Ctx>,
        config: EngineConfig,
        surface: S,
    ) -> (
        Self,
        EngineHandle,
        mpsc::UnboundedReceiver<MarkerActivation>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (activations_tx, activations_rx) = mpsc::unbounded_channel();
        let runtime = Self {
            context,
            engine: Engine::new(config),
            surface,
            inbox: inbox_rx,
            activations: activations_tx,
        };
        (runtime, EngineHandle { inbox: inbox_tx }, activations_rx)
    }

    /// Runs until shutdown or until every handle is dropped, then returns
    /// the engine for inspection.
    pub async fn run(mut self) -> Engine {
        tracing::info!("engine runtime started (seed {})", self.context.seed());

        loop {
            let now = self.context.now_millis();
            while let Some(batch) = self.engine.poll(now) {
                self.flush(&batch);
            }

            let wake = match self.engine.next_wakeup(now) {
                Some(at) => {
                    let wait = Duration::from_millis((at - now).max(0) as u64);
                    tokio::select! {
                        event = self.inbox.recv() => Wake::Event(event),
                        _ = self.context.sleep(wait) => Wake::Timer,
                    }
                }
                None => Wake::Event(self.inbox.recv().await),
            };

            let event = match wake {
                Wake::Timer => continue,
                Wake::Event(None) => {
                    tracing::debug!("all engine handles dropped");
                    break;
                }
                Wake::Event(Some(event)) => event,
            };

            // Drain whatever else is queued so a burst becomes one pass
            let mut running = self.handle(event);
            while running {
                match self.inbox.try_recv() {
                    Ok(event) => running = self.handle(event),
                    Err(_) => break,
                }
            }
            if !running {
                break;
            }
        }

        if self.engine.has_pending_work() {
            let batch = self.engine.run_pass(self.context.now_millis());
            self.flush(&batch);
        }

        let stats = self.engine.stats();
        tracing::info!(
            "engine runtime stopped after {} passes ({} peers tracked)",
            stats.passes,
            stats.tracked_peers
        );
        self.engine
    }

    /// Applies one event. Returns false on shutdown.
    fn handle(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Reports(reports) => self.engine.submit_peer_reports(reports),
            EngineEvent::Viewport { zoom, center } => {
                // Rejected viewports are already logged by the engine
                let _ = self.engine.set_viewport(zoom, center);
            }
            EngineEvent::Viewer(position) => {
                let _ = self.engine.set_viewer_position(position);
            }
            EngineEvent::Remove(id) => self.engine.remove_peer(id),
            EngineEvent::Activated(id) => {
                if let Some(activation) = self.engine.on_marker_activated(id) {
                    if self.activations.send(activation).is_err() {
                        tracing::debug!("activation for {} dropped, no listener", id);
                    }
                }
            }
            EngineEvent::Shutdown => return false,
        }
        true
    }

    fn flush(&mut self, batch: &RenderBatch) {
        if batch.is_empty() {
            return;
        }
        let report = self.engine.flush(batch, &mut self.surface);
        if report.failed > 0 {
            tracing::warn!(
                "{} of {} render commands failed",
                report.failed,
                report.failed + report.applied
            );
        }
    }
}

/// Forwards telemetry from `source` into the engine until either side closes.
/// Returns the number of events forwarded.
pub async fn pump<Src>(source: &Src, handle: &EngineHandle) -> usize
where
    Src: TelemetrySource + ?Sized,
{
    let mut forwarded = 0;
    while let Some(event) = source.recv().await {
        let sent = match event {
            TelemetryEvent::Reports(reports) => handle.submit_peer_reports(reports),
            TelemetryEvent::Removed(id) => handle.remove_peer(id),
        };
        if sent.is_err() {
            tracing::warn!("engine stopped, telemetry pump exiting");
            break;
        }
        forwarded += 1;
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nearby_env::{EnvError, MarkerPlacement, RenderCommand, TokioContext, VisualPhase};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct RecordingSurface {
        commands: Arc<Mutex<Vec<RenderCommand>>>,
    }

    impl RenderSurface for RecordingSurface {
        fn render_marker(&mut self, placement: &MarkerPlacement) -> Result<(), EnvError> {
            self.commands
                .lock()
                .unwrap()
                .push(RenderCommand::Render(placement.clone()));
            Ok(())
        }

        fn remove_marker(&mut self, id: MarkerId) -> Result<(), EnvError> {
            self.commands.lock().unwrap().push(RenderCommand::Remove(id));
            Ok(())
        }
    }

    struct QueuedSource {
        events: Mutex<VecDeque<TelemetryEvent>>,
    }

    #[async_trait]
    impl TelemetrySource for QueuedSource {
        async fn recv(&self) -> Option<TelemetryEvent> {
            self.events.lock().unwrap().pop_front()
        }
    }

    fn report(seed: u64, lat: f64, lng: f64, now: i64) -> PeerReport {
        PeerReport::new(PeerId::from_seed(seed), Position::new(lat, lng), now)
    }

    fn spawn_runtime(
        surface: RecordingSurface,
    ) -> (
        tokio::task::JoinHandle<Engine>,
        EngineHandle,
        mpsc::UnboundedReceiver<MarkerActivation>,
    ) {
        let (runtime, handle, activations) =
            EngineRuntime::new(TokioContext::shared(), EngineConfig::default(), surface);
        (tokio::spawn(runtime.run()), handle, activations)
    }

    #[tokio::test]
    async fn test_runtime_renders_submitted_reports() {
        let surface = RecordingSurface::default();
        let (task, handle, _activations) = spawn_runtime(surface.clone());
        let now = TokioContext::new().now_millis();

        handle
            .submit_peer_reports(vec![report(1, 10.0, 10.0, now), report(2, 20.0, 20.0, now)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().unwrap();

        let engine = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(engine.stats().tracked_peers, 2);

        let commands = surface.commands.lock().unwrap();
        let appearing = commands
            .iter()
            .filter(|c| matches!(c, RenderCommand::Render(p) if p.phase == VisualPhase::Appearing))
            .count();
        assert_eq!(appearing, 2);
    }

    #[tokio::test]
    async fn test_queued_events_coalesce_into_one_pass() {
        let surface = RecordingSurface::default();
        let (runtime, handle, _activations) =
            EngineRuntime::new(TokioContext::shared(), EngineConfig::default(), surface);
        let now = TokioContext::new().now_millis();

        for i in 0..4 {
            handle
                .submit_peer_reports(vec![report(i, 0.0, i as f64, now)])
                .unwrap();
        }
        handle.set_viewport(14.0, Position::new(0.0, 1.0)).unwrap();

        let task = tokio::spawn(runtime.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().unwrap();

        let engine = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(engine.stats().passes, 1);
        assert_eq!(engine.viewport().zoom, 14.0);
    }

    #[tokio::test]
    async fn test_disappearance_completes_in_background() {
        let surface = RecordingSurface::default();
        let (task, handle, _activations) = spawn_runtime(surface.clone());
        let now = TokioContext::new().now_millis();

        handle.submit_peer_reports(vec![report(1, 10.0, 10.0, now)]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.remove_peer(PeerId::from_seed(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.shutdown().unwrap();

        let engine = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(engine.peer(&PeerId::from_seed(1)).is_none());

        let commands = surface.commands.lock().unwrap();
        assert!(matches!(
            commands.last(),
            Some(RenderCommand::Remove(MarkerId::Peer(id))) if *id == PeerId::from_seed(1)
        ));
    }

    #[tokio::test]
    async fn test_activation_forwarded() {
        let (task, handle, mut activations) = spawn_runtime(RecordingSurface::default());
        let now = TokioContext::new().now_millis();
        let id = PeerId::from_seed(7);

        handle.submit_peer_reports(vec![report(7, 1.0, 1.0, now)]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.marker_activated(MarkerId::Peer(id)).unwrap();

        let activation = timeout(Duration::from_secs(5), activations.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(activation.members, vec![id]);

        handle.shutdown().unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handle_errors_after_stop() {
        let (task, handle, _activations) = spawn_runtime(RecordingSurface::default());
        handle.shutdown().unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert!(handle.is_closed());
        assert!(matches!(
            handle.remove_peer(PeerId::from_seed(1)),
            Err(EngineError::RuntimeStopped)
        ));
    }

    #[tokio::test]
    async fn test_pump_forwards_until_source_ends() {
        let (task, handle, _activations) = spawn_runtime(RecordingSurface::default());
        let now = TokioContext::new().now_millis();

        let source = QueuedSource {
            events: Mutex::new(VecDeque::from(vec![
                TelemetryEvent::Reports(vec![report(1, 5.0, 5.0, now)]),
                TelemetryEvent::Reports(vec![report(2, 6.0, 6.0, now)]),
                TelemetryEvent::Removed(PeerId::from_seed(1)),
            ])),
        };

        assert_eq!(pump(&source, &handle).await, 3);
        handle.shutdown().unwrap();

        let engine = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(engine.peer(&PeerId::from_seed(2)).is_some());
        assert_eq!(engine.stats().removals, 1);
    }
}
