use dashmap::DashMap;
use std::sync::Arc;

use crate::models::ManagedProcessRecord;

/// 被监控 java 进程集合，pid -> 记录
///
/// 克隆后共享同一份数据。`range` 先取快照再回调，回调中可以安全地
/// `delete` 任意 pid（包括正在访问的），不会与分片锁死锁。
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<DashMap<i32, ManagedProcessRecord>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, record: ManagedProcessRecord) {
        self.processes.insert(record.pid, record);
    }

    pub fn load(&self, pid: i32) -> Option<ManagedProcessRecord> {
        self.processes.get(&pid).map(|r| r.value().clone())
    }

    pub fn delete(&self, pid: i32) -> Option<ManagedProcessRecord> {
        self.processes.remove(&pid).map(|(_, r)| r)
    }

    /// 仅当记录仍属于同一代进程时删除
    pub fn delete_generation(&self, pid: i32, start_time: u64) -> Option<ManagedProcessRecord> {
        self.processes
            .remove_if(&pid, |_, r| r.same_generation(start_time))
            .map(|(_, r)| r)
    }

    /// 遍历所有记录，回调返回 false 时停止
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(i32, &ManagedProcessRecord) -> bool,
    {
        for (pid, record) in self.snapshot() {
            if !visit(pid, &record) {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(i32, ManagedProcessRecord)> {
        self.processes
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
