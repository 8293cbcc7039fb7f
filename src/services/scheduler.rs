use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 一组独立的定时任务，共享同一个取消信号
pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    /// 每隔 `period` 调用一次 `handler`，第一次在一个周期之后。
    /// 取消后不再触发，正在执行的 handler 会执行完。
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, mut handler: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        log::info!("[scheduler] {} ticker start, period {:?}", name, period);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        handler().await;
                    }
                }
            }
            log::debug!("[scheduler] {} ticker stopped", name);
        });
        self.tasks.push((name, task));
    }

    /// 等待所有定时任务退出，需先触发取消信号
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                log::error!("[scheduler] {} ticker task failed: {}", name, e);
            }
        }
    }
}
