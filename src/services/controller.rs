use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::metrics::METRICS;
use crate::models::{InjectionStatus, ManagedProcessRecord, ProcessHandle};
use crate::services::instrumentation::{InjectError, Instrumentation};
use crate::services::process_checker::is_ide_process;
use crate::services::registry::ProcessRegistry;

/// 发现进程后等待一段时间再注入，避免与目标进程自身的启动竞争
pub const INJECT_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// 单个进程处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// IDE/编辑器启动的进程，不注入也不记录
    Excluded,
    /// 等待期间收到退出信号
    Cancelled,
    Tracked(InjectionStatus),
}

/// 注入决策与状态机
pub struct InjectionController {
    config: Arc<DaemonConfig>,
    instrumentation: Arc<dyn Instrumentation>,
    registry: ProcessRegistry,
    grace_period: Duration,
}

impl InjectionController {
    pub fn new(
        config: Arc<DaemonConfig>,
        instrumentation: Arc<dyn Instrumentation>,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            config,
            instrumentation,
            registry,
            grace_period: INJECT_GRACE_PERIOD,
        }
    }

    /// 新发现进程的完整处理流程，调用方保证同一 pid 同时只有一个流程
    pub async fn handle_discovered(
        &self,
        process: ProcessHandle,
        cancel: &CancellationToken,
    ) -> Evaluation {
        if is_ide_process(&process.cmdline) {
            log::warn!(
                "[discovery] idea or vscode process, java process ignored. javaPid:{}",
                process.pid
            );
            return Evaluation::Excluded;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Evaluation::Cancelled,
            _ = tokio::time::sleep(self.grace_period) => {}
        }

        let mut record = ManagedProcessRecord::new(&process);
        self.evaluate(&process, &mut record, cancel).await;

        log::info!("[discovery] find a java process {}", record.to_json());
        let status = record.injection_status;
        // 结果无论成败都记录，便于通过上报观察失败进程
        self.registry.store(record);
        Evaluation::Tracked(status)
    }

    /// 对已记录进程再做一次决策，不会重复 attach
    pub async fn reevaluate(
        &self,
        pid: i32,
        cancel: &CancellationToken,
    ) -> Option<ManagedProcessRecord> {
        let mut record = self.registry.load(pid)?;
        let process = ProcessHandle {
            pid: record.pid,
            start_time: record.start_time,
            cmdline: record.cmdline.clone(),
            exe: None,
        };
        self.evaluate(&process, &mut record, cancel).await;

        // 期间记录可能已被删除或被新一代进程替换
        if let Some(current) = self.registry.load(pid) {
            if current.same_generation(record.start_time) {
                self.registry.store(record.clone());
            }
        }
        Some(record)
    }

    /// 状态对账、注入/退出、参数更新
    pub async fn evaluate(
        &self,
        process: &ProcessHandle,
        record: &mut ManagedProcessRecord,
        cancel: &CancellationToken,
    ) {
        if record.injection_status.is_terminal() {
            log::debug!(
                "[inject] pid {} is {}, nothing to do",
                process.pid,
                record.injection_status
            );
            return;
        }

        let observed = self.instrumentation.get_and_mark_status(process).await;
        record.reconcile(observed);

        if self.config.is_disable() && record.success_inject() {
            self.exit_inject_immediately(process, record).await;
        } else if self.config.is_dynamic_mode() && !record.is_injected() {
            if cancel.is_cancelled() {
                log::info!("[inject] shutting down, skip attach of pid {}", process.pid);
                return;
            }
            self.dynamic_inject(process, record, cancel).await;
            if cancel.is_cancelled() {
                return;
            }
        }

        if !self.config.is_disable() && record.success_inject() {
            self.update_parameters(process, record).await;
        }
    }

    async fn dynamic_inject(
        &self,
        process: &ProcessHandle,
        record: &mut ManagedProcessRecord,
        cancel: &CancellationToken,
    ) {
        METRICS.attach_attempts.inc();
        if let Err(e) = self.instrumentation.attach(process).await {
            log::error!("[inject] attach to java failed, target jvm[{}], err:{}", process.pid, e);
            METRICS.attach_failures.inc();
            self.mark(record, InjectionStatus::InjectFailed);
            return;
        }

        // 先标记为已注入，防止 agent 异常时再次注入，需要人工介入
        self.mark(record, InjectionStatus::InjectSuccess);

        match self.instrumentation.read_injection_token(process, cancel).await {
            Ok(()) => {
                log::info!(
                    "[inject] java agent init success {{\"pid\":{},\"status\":\"{}\",\"startTime\":{}}}",
                    record.pid,
                    record.injection_status,
                    record.start_time
                );
            }
            Err(InjectError::Cancelled) => {
                log::info!("[inject] shutting down, stop verifying token of pid {}", process.pid);
            }
            Err(e) => {
                log::error!("[inject] verify token of pid {} failed: {}, exit agent", process.pid, e);
                METRICS.attach_failures.inc();
                self.mark(record, InjectionStatus::InjectFailed);
                if let Err(e) = self.instrumentation.exit_inject(process).await {
                    log::error!("[inject] exit half-injected agent of pid {} failed: {}", process.pid, e);
                }
            }
        }
    }

    async fn exit_inject_immediately(&self, process: &ProcessHandle, record: &mut ManagedProcessRecord) {
        match self.instrumentation.exit_inject(process).await {
            Ok(()) => {
                METRICS.detaches.inc();
                self.mark(record, InjectionStatus::ExitedByPolicy);
                log::info!("[inject] agent disabled, pid {} exited by policy", process.pid);
            }
            Err(e) => {
                // 保持 InjectSuccess，下次决策时重试
                log::error!("[inject] exit agent of pid {} failed: {}", process.pid, e);
            }
        }
    }

    async fn update_parameters(&self, process: &ProcessHandle, record: &mut ManagedProcessRecord) {
        if let Err(e) = self.instrumentation.soft_flush(process).await {
            log::warn!("[inject] soft flush of pid {} failed: {}", process.pid, e);
            return;
        }
        if let Err(e) = self
            .instrumentation
            .update_parameters(process, &self.config.parameters)
            .await
        {
            log::warn!("[inject] update parameters of pid {} failed: {}", process.pid, e);
            return;
        }

        METRICS.refreshes.inc();
        record.parameters = self.config.parameters.clone();
        record.last_config_version = Some(self.config.config_version.clone());
        log::info!("[inject] update agent config of pid {} success", process.pid);
    }

    fn mark(&self, record: &mut ManagedProcessRecord, next: InjectionStatus) {
        if let Err(e) = record.transition(next) {
            log::error!("[inject] {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentMode;
    use crate::services::testing::{handle, ScriptedInstrumentation};

    fn setup(
        mode: AgentMode,
        inst: Arc<ScriptedInstrumentation>,
    ) -> (InjectionController, ProcessRegistry) {
        let config = DaemonConfig {
            agent_mode: mode,
            config_version: "v2".to_string(),
            ..DaemonConfig::default()
        };
        let registry = ProcessRegistry::new();
        let controller = InjectionController::new(Arc::new(config), inst, registry.clone());
        (controller, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_attach_success() {
        let inst = Arc::new(ScriptedInstrumentation::default());
        let (controller, registry) = setup(AgentMode::Dynamic, inst.clone());

        let result = controller
            .handle_discovered(handle(100, 1), &CancellationToken::new())
            .await;

        assert_eq!(result, Evaluation::Tracked(InjectionStatus::InjectSuccess));
        assert_eq!(inst.attach_calls(), 1);
        let record = registry.load(100).unwrap();
        assert_eq!(record.injection_status, InjectionStatus::InjectSuccess);
        assert_eq!(record.last_config_version.as_deref(), Some("v2"));
        assert_eq!(inst.update_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_precedes_attach() {
        let inst = Arc::new(ScriptedInstrumentation::default());
        let (controller, _) = setup(AgentMode::Dynamic, inst.clone());
        let start = tokio::time::Instant::now();
        controller
            .handle_discovered(handle(100, 1), &CancellationToken::new())
            .await;
        assert!(start.elapsed() >= INJECT_GRACE_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_failure_is_recorded() {
        let inst = Arc::new(ScriptedInstrumentation::default().failing_attach());
        let (controller, registry) = setup(AgentMode::Dynamic, inst.clone());

        let result = controller
            .handle_discovered(handle(100, 1), &CancellationToken::new())
            .await;

        assert_eq!(result, Evaluation::Tracked(InjectionStatus::InjectFailed));
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::InjectFailed);
        assert_eq!(inst.update_calls(), 0);

        // 失败后再次决策不会重新 attach
        controller.reevaluate(100, &CancellationToken::new()).await;
        assert_eq!(inst.attach_calls(), 1);
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::InjectFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_failure_fails_closed() {
        let inst = Arc::new(ScriptedInstrumentation::default().missing_token());
        let (controller, registry) = setup(AgentMode::Dynamic, inst.clone());

        controller
            .handle_discovered(handle(100, 1), &CancellationToken::new())
            .await;

        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::InjectFailed);
        assert_eq!(inst.exit_calls(), 1);
        assert_eq!(inst.update_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_token_wait_is_not_a_failure() {
        let inst = Arc::new(ScriptedInstrumentation::default().token_until_cancel());
        let (controller, registry) = setup(AgentMode::Dynamic, inst.clone());
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INJECT_GRACE_PERIOD + Duration::from_secs(5)).await;
            stop.cancel();
        });

        controller.handle_discovered(handle(100, 1), &cancel).await;

        assert_eq!(inst.attach_calls(), 1);
        assert_eq!(inst.exit_calls(), 0);
        assert_eq!(inst.update_calls(), 0);
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::InjectSuccess);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reevaluate_success_only_refreshes() {
        let inst = Arc::new(ScriptedInstrumentation::default());
        let (controller, registry) = setup(AgentMode::Dynamic, inst.clone());
        let cancel = CancellationToken::new();
        controller.handle_discovered(handle(100, 1), &cancel).await;

        controller.reevaluate(100, &cancel).await;
        controller.reevaluate(100, &cancel).await;

        assert_eq!(inst.attach_calls(), 1);
        assert_eq!(inst.flush_calls(), 3);
        assert_eq!(inst.update_calls(), 3);
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::InjectSuccess);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_mode_detaches_injected_process() {
        let inst = Arc::new(ScriptedInstrumentation::default().already_injected(100, 1));
        let (controller, registry) = setup(AgentMode::Disable, inst.clone());

        controller
            .handle_discovered(handle(100, 1), &CancellationToken::new())
            .await;

        assert_eq!(inst.exit_calls(), 1);
        assert_eq!(inst.attach_calls(), 0);
        assert_eq!(inst.update_calls(), 0);
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::ExitedByPolicy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_mode_leaves_clean_process_alone() {
        let inst = Arc::new(ScriptedInstrumentation::default());
        let (controller, registry) = setup(AgentMode::Disable, inst.clone());

        controller
            .handle_discovered(handle(100, 1), &CancellationToken::new())
            .await;

        assert_eq!(inst.attach_calls() + inst.exit_calls(), 0);
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::NotInjected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_mode_refreshes_without_attach() {
        let inst = Arc::new(ScriptedInstrumentation::default().already_injected(100, 1));
        let (controller, registry) = setup(AgentMode::Static, inst.clone());

        controller
            .handle_discovered(handle(100, 1), &CancellationToken::new())
            .await;
        controller
            .handle_discovered(handle(101, 1), &CancellationToken::new())
            .await;

        assert_eq!(inst.attach_calls(), 0);
        assert_eq!(inst.update_calls(), 1);
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::InjectSuccess);
        assert_eq!(registry.load(101).unwrap().injection_status, InjectionStatus::NotInjected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ide_process_never_tracked() {
        let inst = Arc::new(ScriptedInstrumentation::default());
        for mode in [AgentMode::Dynamic, AgentMode::Static, AgentMode::Disable] {
            let (controller, registry) = setup(mode, inst.clone());
            let mut p = handle(100, 1);
            p.cmdline.push("-Didea.launcher=/opt/IDEA/bin".to_string());

            let result = controller.handle_discovered(p, &CancellationToken::new()).await;

            assert_eq!(result, Evaluation::Excluded);
            assert!(registry.is_empty());
        }
        assert_eq!(inst.attach_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_grace_period() {
        let inst = Arc::new(ScriptedInstrumentation::default());
        let (controller, registry) = setup(AgentMode::Dynamic, inst.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = controller.handle_discovered(handle(100, 1), &cancel).await;

        assert_eq!(result, Evaluation::Cancelled);
        assert_eq!(inst.attach_calls(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reevaluate_returns_tracked_record() {
        let inst = Arc::new(ScriptedInstrumentation::default());
        let (controller, registry) = setup(AgentMode::Dynamic, inst.clone());
        let cancel = CancellationToken::new();
        controller.handle_discovered(handle(100, 1), &cancel).await;

        let record = controller.reevaluate(100, &cancel).await.unwrap();
        assert_eq!(record.start_time, 1);
        assert!(controller.reevaluate(999, &cancel).await.is_none());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.load(100).unwrap().injection_status, InjectionStatus::InjectSuccess);
    }
}
