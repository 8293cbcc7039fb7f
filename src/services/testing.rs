//! 测试替身：脚本化的注入子系统与进程视图

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::{InjectionStatus, ProcessHandle};
use crate::services::instrumentation::{InjectError, Instrumentation};
use crate::services::process_checker::ProcessProbe;

pub fn handle(pid: i32, start_time: u64) -> ProcessHandle {
    ProcessHandle {
        pid,
        start_time,
        cmdline: vec!["java".into(), "-jar".into(), "app.jar".into()],
        exe: Some("/usr/bin/java".into()),
    }
}

#[derive(Default)]
pub struct ScriptedInstrumentation {
    fail_attach: bool,
    missing_token: bool,
    token_until_cancel: bool,
    attach_delay: Option<Duration>,
    injected: Mutex<HashSet<(i32, u64)>>,
    attach: AtomicUsize,
    exit: AtomicUsize,
    flush: AtomicUsize,
    update: AtomicUsize,
}

impl ScriptedInstrumentation {
    pub fn failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    pub fn missing_token(mut self) -> Self {
        self.missing_token = true;
        self
    }

    /// token 一直未出现，直到收到取消信号
    pub fn token_until_cancel(mut self) -> Self {
        self.token_until_cancel = true;
        self
    }

    pub fn slow_attach(mut self, delay: Duration) -> Self {
        self.attach_delay = Some(delay);
        self
    }

    pub fn already_injected(self, pid: i32, start_time: u64) -> Self {
        self.injected.lock().unwrap().insert((pid, start_time));
        self
    }

    pub fn attach_calls(&self) -> usize {
        self.attach.load(Ordering::SeqCst)
    }

    pub fn exit_calls(&self) -> usize {
        self.exit.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.flush.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Instrumentation for ScriptedInstrumentation {
    async fn attach(&self, process: &ProcessHandle) -> Result<(), InjectError> {
        self.attach.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.attach_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_attach {
            return Err(InjectError::Launcher {
                pid: process.pid,
                action: "attach",
                code: Some(1),
                stderr: "AttachNotSupportedException".to_string(),
            });
        }
        self.injected.lock().unwrap().insert(process.generation());
        Ok(())
    }

    async fn get_and_mark_status(&self, process: &ProcessHandle) -> InjectionStatus {
        if self.injected.lock().unwrap().contains(&process.generation()) {
            InjectionStatus::InjectSuccess
        } else {
            InjectionStatus::NotInjected
        }
    }

    async fn read_injection_token(
        &self,
        process: &ProcessHandle,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        if self.token_until_cancel {
            cancel.cancelled().await;
            return Err(InjectError::Cancelled);
        }
        if self.missing_token {
            return Err(InjectError::TokenMissing {
                pid: process.pid,
                waited: Duration::from_secs(30),
            });
        }
        Ok(())
    }

    async fn exit_inject(&self, process: &ProcessHandle) -> Result<(), InjectError> {
        self.exit.fetch_add(1, Ordering::SeqCst);
        self.injected.lock().unwrap().remove(&process.generation());
        Ok(())
    }

    async fn soft_flush(&self, _process: &ProcessHandle) -> Result<(), InjectError> {
        self.flush.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_parameters(
        &self,
        _process: &ProcessHandle,
        _parameters: &HashMap<String, String>,
    ) -> Result<(), InjectError> {
        self.update.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 可控的进程视图，pid -> 启动时间
#[derive(Default)]
pub struct FakeProbe {
    alive: Mutex<HashMap<i32, ProcessHandle>>,
}

impl FakeProbe {
    pub fn spawn(&self, process: ProcessHandle) {
        self.alive.lock().unwrap().insert(process.pid, process);
    }

    pub fn kill(&self, pid: i32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn enumerate(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<_> = self.alive.lock().unwrap().values().cloned().collect();
        handles.sort_by_key(|h| h.pid);
        handles
    }

    fn is_alive(&self, pid: i32, start_time: u64) -> bool {
        self.alive
            .lock()
            .unwrap()
            .get(&pid)
            .map(|h| h.start_time == start_time)
            .unwrap_or(false)
    }
}
