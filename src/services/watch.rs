use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::services::controller::InjectionController;
use crate::services::pipeline::{DiscoveryTracker, EventPipeline, EventSender, ExitEvent};
use crate::services::process_checker::ProcessProbe;
use crate::services::registry::ProcessRegistry;
use crate::services::reporter::Reporter;
use crate::services::restart::{RestartHandle, RestartReason};
use crate::services::scheduler::Scheduler;

/// java 进程监控：定时扫描、存活检测、上报、定时重启
pub struct Watch {
    config: Arc<DaemonConfig>,
    registry: ProcessRegistry,
    probe: Arc<dyn ProcessProbe>,
    controller: Arc<InjectionController>,
    install_dir: PathBuf,
    cancel: CancellationToken,
}

/// 运行中的监控任务
pub struct WatchTasks {
    scheduler: Scheduler,
    dispatch: JoinHandle<()>,
}

impl WatchTasks {
    pub async fn join(self) {
        self.scheduler.join().await;
        if let Err(e) = self.dispatch.await {
            log::error!("[watch] dispatch loop failed: {}", e);
        }
    }
}

impl Watch {
    pub fn new(
        config: Arc<DaemonConfig>,
        registry: ProcessRegistry,
        probe: Arc<dyn ProcessProbe>,
        controller: Arc<InjectionController>,
        install_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            probe,
            controller,
            install_dir: install_dir.into(),
            cancel,
        }
    }

    pub fn start(&self, restart: RestartHandle) -> WatchTasks {
        let (sender, pipeline) = EventPipeline::new(
            self.registry.clone(),
            Arc::clone(&self.controller),
            self.install_dir.clone(),
        );
        let tracker = pipeline.tracker();
        let dispatch = tokio::spawn(pipeline.run(self.cancel.clone()));

        let reporter = Arc::new(Reporter::new(
            self.registry.clone(),
            Arc::clone(&self.probe),
            self.install_dir.clone(),
        ));
        let mut scheduler = Scheduler::new(self.cancel.clone());

        // 启动时先扫描一次，之后按周期扫描
        tokio::spawn(scan(Arc::clone(&self.probe), sender.clone()));
        {
            let probe = Arc::clone(&self.probe);
            let sender = sender.clone();
            scheduler.every("scan", self.config.scan_interval(), move || {
                scan(Arc::clone(&probe), sender.clone())
            });
        }
        {
            let probe = Arc::clone(&self.probe);
            let registry = self.registry.clone();
            scheduler.every("pid-exists", self.config.pid_exists_interval(), move || {
                check_exists(
                    registry.clone(),
                    Arc::clone(&probe),
                    sender.clone(),
                    Arc::clone(&tracker),
                )
            });
        }
        {
            let reporter = Arc::clone(&reporter);
            scheduler.every("log-report", self.config.log_report_interval(), move || {
                let reporter = Arc::clone(&reporter);
                async move {
                    if let Err(e) = tokio::task::spawn_blocking(move || reporter.log_report()).await {
                        log::error!("[LogReport] report task failed: {}", e);
                    }
                }
            });
        }
        scheduler.every("heart-beat", self.config.heart_beat_interval(), move || {
            let reporter = Arc::clone(&reporter);
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || reporter.heart_beat()).await {
                    log::error!("[HeartBeat] heart beat task failed: {}", e);
                }
            }
        });
        scheduler.every("reboot", self.config.reboot_interval(), move || {
            let restart = restart.clone();
            async move { restart.request(RestartReason::Scheduled) }
        });

        WatchTasks { scheduler, dispatch }
    }
}

async fn scan(probe: Arc<dyn ProcessProbe>, sender: EventSender) {
    let handles = match tokio::task::spawn_blocking(move || probe.enumerate()).await {
        Ok(handles) => handles,
        Err(e) => {
            log::error!("[scan] enumerate java processes failed: {}", e);
            return;
        }
    };
    for process in handles {
        sender.discovered(process);
    }
}

/// 已记录进程若不存在（或 pid 被复用）则投递退出事件
async fn check_exists(
    registry: ProcessRegistry,
    probe: Arc<dyn ProcessProbe>,
    sender: EventSender,
    tracker: Arc<DiscoveryTracker>,
) {
    let result = tokio::task::spawn_blocking(move || {
        let mut exited = Vec::new();
        registry.range(|pid, record| {
            if !probe.is_alive(pid, record.start_time) {
                exited.push(ExitEvent {
                    pid,
                    start_time: record.start_time,
                });
            }
            true
        });
        tracker.prune_excluded(|pid, start_time| probe.is_alive(pid, start_time));
        log::debug!(
            "[ScanProcess] tracked {}, evaluating {}, exited {}",
            registry.len(),
            tracker.in_flight_count(),
            exited.len()
        );
        exited
    })
    .await;

    match result {
        Ok(exited) => {
            for event in exited {
                sender.exited(event);
            }
        }
        Err(e) => log::error!("[ScanProcess] liveness check failed: {}", e),
    }
}
