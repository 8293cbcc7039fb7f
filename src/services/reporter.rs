use std::path::PathBuf;
use std::sync::Arc;

use crate::metrics::METRICS;
use crate::models::{HeartBeat, ManagedProcessRecord};
use crate::services::pipeline::remove_run_dir;
use crate::services::process_checker::ProcessProbe;
use crate::services::registry::ProcessRegistry;

/// 定时上报：进程信息日志与心跳。遍历时顺带清理已退出的进程。
pub struct Reporter {
    registry: ProcessRegistry,
    probe: Arc<dyn ProcessProbe>,
    install_dir: PathBuf,
}

impl Reporter {
    pub fn new(registry: ProcessRegistry, probe: Arc<dyn ProcessProbe>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            probe,
            install_dir: install_dir.into(),
        }
    }

    /// 逐个输出存活进程的快照，返回存活数
    pub fn log_report(&self) -> usize {
        let mut live = 0;
        self.for_each_live(|record| {
            live += 1;
            log::info!("[LogReport] {}", record.to_json());
        });
        live
    }

    /// 汇总所有存活进程，输出一条心跳
    pub fn heart_beat(&self) -> HeartBeat {
        let mut hb = HeartBeat::new();
        self.for_each_live(|record| hb.append(record));

        METRICS.set_tracked(hb.processes.iter().map(|b| b.status));

        log::info!("[HeartBeat] {}", hb.to_json());
        hb
    }

    fn for_each_live<F>(&self, mut visit: F)
    where
        F: FnMut(&ManagedProcessRecord),
    {
        self.registry.range(|pid, record| {
            if self.probe.is_alive(pid, record.start_time) {
                visit(record);
            } else {
                // 只退役同一代的记录与目录，新进程可能已经复用了该 pid
                if self.registry.delete_generation(pid, record.start_time).is_some() {
                    METRICS.exits.inc();
                    log::info!("[exit] java process exit, pid {}", pid);
                    remove_run_dir(&self.install_dir, pid);
                }
            }
            true
        });
    }
}
