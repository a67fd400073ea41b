//! Daemon Shell: process lifecycle, signal handling, the event loop that
//! wires the RPC surface, Policy Controller and TC Engine together, and the
//! optional stats sink (spec.md §4.4).

use crate::config::Config;
use crate::policy::{PolicyController, TimerAction, RECOMPUTE_PERIOD_MS};
use crate::rpc::{self, RpcEvent};
use crate::tc::stats::TcStats;
use crate::tc::{TcControl, TcEngine};
use anyhow::Context;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

const IFB: &str = "ifb0";

/// Scoped-resource teardown guarantee (spec.md §9 "exit hook semantics").
/// Holds only a `Weak` handle: once the clean-shutdown path has released the
/// last strong `Arc`, this guard's `Drop` finds nothing to upgrade and is a
/// no-op; on any other exit (an error propagated with `?`, a panic unwind)
/// the engine is still alive and this is what actually tears it down.
pub struct TeardownGuard {
    engine: Weak<Mutex<TcEngine>>,
}

impl TeardownGuard {
    pub fn new(engine: &Arc<Mutex<TcEngine>>) -> Self {
        Self {
            engine: Arc::downgrade(engine),
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Ok(mut engine) = engine.lock() {
            log::warn!("teardown guard firing on an unreleased engine handle");
            engine.uninit();
        }
    }
}

struct StatsSink {
    file: std::fs::File,
}

impl StatsSink {
    fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("opening stats file {}", path.display()))?;
        writeln!(
            file,
            "time qdisc_root_bytes qdisc_stream_bytes qdisc_background_bytes background_bandwidth_requested gst_buffer_percent"
        )?;
        Ok(Self { file })
    }

    fn write_sample(
        &mut self,
        stats: TcStats,
        background_rate: u64,
        buffer_pct: u32,
    ) -> anyhow::Result<()> {
        use std::io::Write;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        writeln!(
            self.file,
            "{}.{:06} {} {} {} {} {}",
            now.as_secs(),
            now.subsec_micros(),
            stats.root_bytes,
            stats.stream_bytes,
            stats.background_bytes,
            background_rate,
            buffer_pct
        )?;
        self.file.flush()?;
        Ok(())
    }
}

fn spawn_recompute_tick(tx: mpsc::UnboundedSender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(RECOMPUTE_PERIOD_MS)).await;
        let _ = tx.send(());
    })
}

/// Apply a `TimerAction` to the single `Option<JoinHandle<()>>` recompute
/// timer slot - there is exactly one slot, so invariant 5 ("at most one
/// recompute timer armed") holds by construction.
fn apply_timer_action(
    action: TimerAction,
    handle: &mut Option<tokio::task::JoinHandle<()>>,
    tx: mpsc::UnboundedSender<()>,
) {
    match action {
        TimerAction::Cancel => {
            if let Some(h) = handle.take() {
                h.abort();
            }
        }
        TimerAction::ArmIfIdle => {
            if handle.is_none() {
                *handle = Some(spawn_recompute_tick(tx));
            }
        }
        TimerAction::Rearm => {
            if let Some(h) = handle.take() {
                h.abort();
            }
            *handle = Some(spawn_recompute_tick(tx));
        }
    }
}

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let engine = Arc::new(Mutex::new(TcEngine::new(IFB)));
    let guard = TeardownGuard::new(&engine);

    {
        let mut e = engine.lock().unwrap();
        e.init(cfg.interface.as_deref())
            .context("selecting primary interface")?;
    }
    {
        let mut e = engine.lock().unwrap();
        e.init_ifb()
            .context("bringing up ifb0 and installing ingress redirection")?;
    }

    let (rpc_tx, mut rpc_rx) = mpsc::unbounded_channel::<RpcEvent>();
    let connection = rpc::serve(rpc_tx).await?;
    if connection.is_none() {
        log::warn!("continuing with the RPC surface disabled");
    }

    let mut controller = PolicyController::new();
    let mut recompute_timer: Option<tokio::task::JoinHandle<()>> = None;
    let (recompute_tx, mut recompute_rx) = mpsc::unbounded_channel::<()>();

    let mut stats_sink = match &cfg.save_stats {
        Some(path) => Some(StatsSink::open(path)?),
        None => None,
    };
    let mut stats_ticker = tokio::time::interval(Duration::from_secs(1));
    stats_ticker.tick().await; // first tick fires immediately; skip it

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down");
                break;
            }

            Some(event) = rpc_rx.recv() => {
                let mut e = engine.lock().unwrap();
                let timer_action = match event {
                    RpcEvent::SetPolicy { flow, bitrate, buffer_fill } => {
                        let action = controller
                            .set_policy(&mut *e, flow, bitrate, buffer_fill)
                            .context("set_policy kernel mutation")?;
                        Some(action)
                    }
                    RpcEvent::SetFixedPolicy { flow, stream_rate, background_rate } => {
                        let action = controller
                            .set_fixed_policy(&mut *e, flow, stream_rate, background_rate)
                            .context("set_fixed_policy kernel mutation")?;
                        Some(action)
                    }
                    RpcEvent::UnsetPolicy => {
                        controller.unset_policy(&mut *e);
                        None
                    }
                };
                drop(e);
                if let Some(action) = timer_action {
                    apply_timer_action(action, &mut recompute_timer, recompute_tx.clone());
                }
            }

            Some(()) = recompute_rx.recv() => {
                let mut e = engine.lock().unwrap();
                let action = controller
                    .on_recompute(&mut *e)
                    .context("recompute kernel mutation")?;
                drop(e);
                apply_timer_action(action, &mut recompute_timer, recompute_tx.clone());
            }

            _ = stats_ticker.tick(), if stats_sink.is_some() => {
                let result = {
                    let e = engine.lock().unwrap();
                    e.get_stats()
                };
                match result {
                    Ok(stats) => {
                        if let Some(sink) = stats_sink.as_mut() {
                            if let Err(err) = sink.write_sample(
                                stats,
                                controller.background_rate(),
                                controller.buffer_pct(),
                            ) {
                                log::warn!("stats write failed: {err}");
                            }
                        }
                    }
                    Err(err) => log::warn!("stats read failed: {err}"),
                }
            }
        }
    }

    if let Some(h) = recompute_timer.take() {
        h.abort();
    }

    {
        let mut e = engine.lock().unwrap();
        e.uninit();
    }
    drop(engine);
    drop(guard);
    drop(connection);

    Ok(())
}
