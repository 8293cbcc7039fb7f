use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 进程的注入状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InjectionStatus {
    NotInjected,
    InjectSuccess,
    /// 本代进程内不再重试，需要进程重启
    InjectFailed,
    /// 配置关闭后被强制退出
    ExitedByPolicy,
}

impl InjectionStatus {
    pub const ALL: [InjectionStatus; 4] = [
        InjectionStatus::NotInjected,
        InjectionStatus::InjectSuccess,
        InjectionStatus::InjectFailed,
        InjectionStatus::ExitedByPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionStatus::NotInjected => "not_injected",
            InjectionStatus::InjectSuccess => "inject_success",
            InjectionStatus::InjectFailed => "inject_failed",
            InjectionStatus::ExitedByPolicy => "exited_by_policy",
        }
    }

    pub fn can_transition_to(&self, next: InjectionStatus) -> bool {
        use InjectionStatus::*;
        matches!(
            (self, next),
            (NotInjected, InjectSuccess)
                | (NotInjected, InjectFailed)
                | (InjectSuccess, InjectSuccess)
                | (InjectSuccess, ExitedByPolicy)
                // agent 加载成功但 token 校验失败
                | (InjectSuccess, InjectFailed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InjectionStatus::InjectFailed | InjectionStatus::ExitedByPolicy)
    }
}

impl fmt::Display for InjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 枚举得到的候选 java 进程
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: i32,
    /// 进程启动时间（Unix 秒）
    pub start_time: u64,
    pub cmdline: Vec<String>,
    pub exe: Option<String>,
}

impl ProcessHandle {
    pub fn generation(&self) -> (i32, u64) {
        (self.pid, self.start_time)
    }
}

/// 非法状态迁移
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal injection transition for pid {pid}: {from} -> {to}")]
pub struct IllegalTransition {
    pub pid: i32,
    pub from: InjectionStatus,
    pub to: InjectionStatus,
}

/// 被监控的 java 进程
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProcessRecord {
    pub pid: i32,
    pub start_time: u64,
    pub cmdline: Vec<String>,
    pub injection_status: InjectionStatus,
    pub last_config_version: Option<String>,
    pub parameters: HashMap<String, String>,
    /// 最近一次状态变化时间（Unix 秒）
    pub updated_at: u64,
}

impl ManagedProcessRecord {
    pub fn new(handle: &ProcessHandle) -> Self {
        Self {
            pid: handle.pid,
            start_time: handle.start_time,
            cmdline: handle.cmdline.clone(),
            injection_status: InjectionStatus::NotInjected,
            last_config_version: None,
            parameters: HashMap::new(),
            updated_at: crate::models::unix_now(),
        }
    }

    pub fn same_generation(&self, start_time: u64) -> bool {
        self.start_time == start_time
    }

    pub fn is_injected(&self) -> bool {
        self.injection_status != InjectionStatus::NotInjected
    }

    pub fn success_inject(&self) -> bool {
        self.injection_status == InjectionStatus::InjectSuccess
    }

    pub fn transition(&mut self, next: InjectionStatus) -> Result<(), IllegalTransition> {
        if !self.injection_status.can_transition_to(next) {
            return Err(IllegalTransition {
                pid: self.pid,
                from: self.injection_status,
                to: next,
            });
        }
        self.injection_status = next;
        self.updated_at = crate::models::unix_now();
        Ok(())
    }

    /// 用于重启后的状态对账，不经过状态机
    pub fn reconcile(&mut self, observed: InjectionStatus) {
        if self.injection_status == InjectionStatus::NotInjected {
            self.injection_status = observed;
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"pid\":{}}}", self.pid))
    }
}
