use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::GRACEFUL_STOP_MS;
use crate::error::Result;
use crate::events::ManagerEvent;
use crate::router::Envelope;
use crate::traits::PeerSender;
use crate::types::{now_ms, Manager, TaskState};

/// Shared view of the control loop: the cycle counter and the pause/stop
/// switches. Cloned into everything that needs to read the cycle or nudge a
/// dispatch between ticks.
#[derive(Clone)]
pub struct ControlHandle {
    cycle: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    nudge_tx: mpsc::UnboundedSender<()>,
    nudge_rx: Arc<std::sync::Mutex<Option<mpsc::UnboundedReceiver<()>>>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        Self {
            cycle: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            nudge_tx,
            nudge_rx: Arc::new(std::sync::Mutex::new(Some(nudge_rx))),
        }
    }

    /// Monotonic cycle counter, incremented once per tick.
    pub fn get_cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// Suspends sweeps and dispatch. Inbound messages keep flowing; their
    /// effects queue up until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.nudge_tx.send(());
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Asks the loop to run a dispatch step before the next tick, used when a
    /// task arrives or a worker becomes idle.
    pub fn nudge(&self) {
        let _ = self.nudge_tx.send(());
    }

    fn take_nudge_rx(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.nudge_rx.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The cycle tick: sweep, dispatch, counter. Runs until [`stop`] flips the
/// stopping switch.
pub async fn run_control_loop(manager: Arc<Manager>) {
    let Some(mut nudge_rx) = manager.control.take_nudge_rx() else {
        error!("Control loop started twice, refusing to run");
        return;
    };

    let mut ticker =
        tokio::time::interval(Duration::from_millis(manager.config.tick_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Control loop started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if manager.control.is_stopping() {
                    break;
                }
                if manager.control.is_paused() {
                    continue;
                }
                if let Err(e) = run_tick(&manager).await {
                    error!("Cycle tick failed: {}", e);
                }
            }
            nudge = nudge_rx.recv() => {
                if nudge.is_none() || manager.control.is_stopping() {
                    break;
                }
                if manager.control.is_paused() {
                    continue;
                }
                if let Err(e) = dispatch_and_deliver(&manager).await {
                    error!("Dispatch failed: {}", e);
                }
            }
        }
    }
    info!("Control loop stopped");
}

async fn run_tick(manager: &Arc<Manager>) -> Result<()> {
    let now = now_ms();
    {
        let mut engine = manager.engine.lock().await;
        let mut registry = manager.registry.lock().await;
        engine.sweep(&mut registry, now)?;
    }

    if manager.config.auto_manage {
        dispatch_and_deliver(manager).await?;
    }

    let cycle = manager.control.cycle.fetch_add(1, Ordering::SeqCst) + 1;
    manager.events.emit(ManagerEvent::Cycle { cycle });
    Ok(())
}

/// Runs the dispatch step and pushes the resulting offers out.
pub async fn dispatch_and_deliver(manager: &Arc<Manager>) -> Result<usize> {
    let offers = {
        let mut engine = manager.engine.lock().await;
        let mut registry = manager.registry.lock().await;
        engine.dispatch(&mut registry, now_ms(), manager.control.get_cycle())?
    };
    deliver_offers(manager, offers, manager.peers.as_ref()).await
}

/// Sends offers out after the subsystem locks are dropped; a failed send
/// rolls its offer back so the task stays assignable.
pub async fn deliver_offers(
    manager: &Arc<Manager>,
    offers: Vec<crate::engine::OutboundOffer>,
    sender: &dyn PeerSender,
) -> Result<usize> {
    let mut delivered = 0;
    for offer in offers {
        match sender
            .send(&offer.peer_id, Envelope::Offer(offer.task.clone()))
            .await
        {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!("Could not deliver offer for task {}: {}", offer.task_id, e);
                let mut engine = manager.engine.lock().await;
                let mut registry = manager.registry.lock().await;
                engine.rollback_offer(&mut registry, &offer.task_id)?;
            }
        }
    }
    Ok(delivered)
}

/// Graceful drain: refuse new tasks, withdraw open offers, give accepted
/// tasks until the deadline to complete or expire, then announce the stop.
pub async fn stop(manager: &Arc<Manager>) -> Result<()> {
    info!("Stopping manager...");
    manager.engine.lock().await.set_draining(true);

    // Open offers are withdrawn immediately; only accepted work may drain.
    let offered: Vec<String> = manager
        .store
        .tasks()?
        .into_iter()
        .filter(|t| t.state == TaskState::Offered)
        .map(|t| t.id)
        .collect();
    {
        let mut engine = manager.engine.lock().await;
        let mut registry = manager.registry.lock().await;
        for task_id in offered {
            engine.rollback_offer(&mut registry, &task_id)?;
        }
    }

    let deadline = now_ms() + GRACEFUL_STOP_MS as i64;
    loop {
        if !manager.engine.lock().await.has_active_tasks()? {
            break;
        }
        if now_ms() > deadline {
            warn!("Graceful stop deadline reached with tasks still in flight");
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    manager.events.emit(ManagerEvent::ManagerStop);
    manager.control.stopping.store(true, Ordering::SeqCst);
    manager.control.nudge();
    manager.store.flush()?;
    Ok(())
}
