use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS;
use crate::models::ProcessHandle;
use crate::services::controller::{Evaluation, InjectionController};
use crate::services::instrumentation::run_dir;
use crate::services::registry::ProcessRegistry;

/// 两个队列的容量；每个扫描周期的进程变化远小于这个值
pub const QUEUE_CAPACITY: usize = 500;

/// 进程退出事件，带上启动时间，避免误删同 pid 的新进程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    pub pid: i32,
    pub start_time: u64,
}

/// 队列生产端。队列满时丢弃事件并告警，不阻塞生产者：
/// 丢掉的发现事件会在下一次扫描重新产生，丢掉的退出事件会在下一次存活检测重新产生。
#[derive(Debug, Clone)]
pub struct EventSender {
    discovered: mpsc::Sender<ProcessHandle>,
    exited: mpsc::Sender<ExitEvent>,
}

impl EventSender {
    pub fn discovered(&self, process: ProcessHandle) -> bool {
        let pid = process.pid;
        match self.discovered.try_send(process) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("[discovery] queue full, drop discovered pid {}", pid);
                METRICS.dropped_events.with_label_values(&["discovered"]).inc();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn exited(&self, event: ExitEvent) -> bool {
        match self.exited.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("[exit] queue full, drop exit event of pid {}", event.pid);
                METRICS.dropped_events.with_label_values(&["exited"]).inc();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// 正在处理中的进程与被排除的 IDE 进程，按 (pid, 启动时间) 区分
#[derive(Debug, Default)]
pub struct DiscoveryTracker {
    in_flight: DashMap<i32, u64>,
    excluded: DashMap<i32, u64>,
}

impl DiscoveryTracker {
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_claimed(&self, pid: i32) -> bool {
        self.in_flight.contains_key(&pid)
    }

    pub fn is_excluded(&self, process: &ProcessHandle) -> bool {
        self.excluded
            .get(&process.pid)
            .map(|s| *s == process.start_time)
            .unwrap_or(false)
    }

    /// 清理已经退出的被排除进程
    pub fn prune_excluded<F>(&self, mut alive: F)
    where
        F: FnMut(i32, u64) -> bool,
    {
        self.excluded.retain(|pid, start_time| alive(*pid, *start_time));
    }

    fn claim(self: &Arc<Self>, process: &ProcessHandle) -> Option<InFlightGuard> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(process.pid) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                v.insert(process.start_time);
                METRICS.evaluations_in_flight.inc();
                Some(InFlightGuard {
                    tracker: Arc::clone(self),
                    pid: process.pid,
                    start_time: process.start_time,
                })
            }
        }
    }
}

/// 处理结束（包括 panic）时释放 in-flight 标记
struct InFlightGuard {
    tracker: Arc<DiscoveryTracker>,
    pid: i32,
    start_time: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let start_time = self.start_time;
        self.tracker
            .in_flight
            .remove_if(&self.pid, |_, s| *s == start_time);
        METRICS.evaluations_in_flight.dec();
    }
}

/// 事件分发：发现队列、退出队列
pub struct EventPipeline {
    registry: ProcessRegistry,
    controller: Arc<InjectionController>,
    tracker: Arc<DiscoveryTracker>,
    install_dir: PathBuf,
    discovered_rx: mpsc::Receiver<ProcessHandle>,
    exited_rx: mpsc::Receiver<ExitEvent>,
}

impl EventPipeline {
    pub fn new(
        registry: ProcessRegistry,
        controller: Arc<InjectionController>,
        install_dir: impl Into<PathBuf>,
    ) -> (EventSender, Self) {
        let (discovered_tx, discovered_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (exited_tx, exited_rx) = mpsc::channel(QUEUE_CAPACITY);
        let sender = EventSender {
            discovered: discovered_tx,
            exited: exited_tx,
        };
        let pipeline = Self {
            registry,
            controller,
            tracker: Arc::new(DiscoveryTracker::default()),
            install_dir: install_dir.into(),
            discovered_rx,
            exited_rx,
        };
        (sender, pipeline)
    }

    pub fn tracker(&self) -> Arc<DiscoveryTracker> {
        Arc::clone(&self.tracker)
    }

    /// 分发循环，直到收到取消信号或所有生产端关闭
    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!("[pipeline] dispatch loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(process) = self.discovered_rx.recv() => self.on_discovered(process, &cancel),
                Some(event) = self.exited_rx.recv() => self.on_exited(event),
                else => {
                    log::error!("[pipeline] all event channels closed");
                    break;
                }
            }
        }
        log::info!("[pipeline] dispatch loop stopped");
    }

    fn on_discovered(&self, process: ProcessHandle, cancel: &CancellationToken) {
        if self.tracker.is_excluded(&process) {
            return;
        }

        if let Some(existing) = self.registry.load(process.pid) {
            if existing.same_generation(process.start_time) {
                log::debug!("[discovery] java process has been monitored, javaPid:{}", process.pid);
                return;
            }
            // pid 被新进程复用，先退役旧记录
            log::info!(
                "[discovery] pid {} reused (start time {} -> {}), retire old record",
                process.pid,
                existing.start_time,
                process.start_time
            );
            self.retire(process.pid, existing.start_time);
        }

        let Some(guard) = self.tracker.claim(&process) else {
            log::debug!("[discovery] java process is being evaluated, javaPid:{}", process.pid);
            return;
        };

        let controller = Arc::clone(&self.controller);
        let tracker = Arc::clone(&self.tracker);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let generation = process.generation();
            if controller.handle_discovered(process, &cancel).await == Evaluation::Excluded {
                tracker.excluded.insert(generation.0, generation.1);
            }
        });
    }

    fn on_exited(&self, event: ExitEvent) {
        self.retire(event.pid, event.start_time);
    }

    /// 退役一代进程。run 目录只在该代被删除，或 pid 既无记录也无处理中的进程时清理，
    /// 否则目录属于复用该 pid 的新进程
    fn retire(&self, pid: i32, start_time: u64) {
        if self.registry.delete_generation(pid, start_time).is_some() {
            METRICS.exits.inc();
            log::info!("[exit] java process exit, pid {}", pid);
            remove_run_dir(&self.install_dir, pid);
        } else if self.registry.load(pid).is_none() && !self.tracker.is_claimed(pid) {
            remove_run_dir(&self.install_dir, pid);
        } else {
            log::debug!("[exit] stale exit event of pid {} (start time {}), ignored", pid, start_time);
        }
    }
}

/// 删除 run/<pid> 目录，失败只记录日志
pub fn remove_run_dir(install_dir: &Path, pid: i32) {
    let dir = run_dir(install_dir, pid);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("[exit] delete {} failed: {}", dir.display(), e),
    }
}
