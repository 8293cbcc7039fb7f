use serde::Serialize;

use crate::models::{InjectionStatus, ManagedProcessRecord};

/// 心跳中单个进程的摘要
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessBeat {
    pub pid: i32,
    pub status: InjectionStatus,
    pub start_time: u64,
    pub config_version: Option<String>,
}

/// 心跳批量数据，每个周期输出一次
#[derive(Debug, Clone, Serialize, Default)]
pub struct HeartBeat {
    pub timestamp: u64,
    pub processes: Vec<ProcessBeat>,
}

impl HeartBeat {
    pub fn new() -> Self {
        Self {
            timestamp: crate::models::unix_now(),
            processes: Vec::new(),
        }
    }

    pub fn append(&mut self, record: &ManagedProcessRecord) {
        self.processes.push(ProcessBeat {
            pid: record.pid,
            status: record.injection_status,
            start_time: record.start_time,
            config_version: record.last_config_version.clone(),
        });
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
