use regex::Regex;
use std::sync::Mutex;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::models::ProcessHandle;

/// 操作系统进程视图：枚举候选进程、存活检测
pub trait ProcessProbe: Send + Sync {
    /// 枚举当前所有匹配的 java 进程
    fn enumerate(&self) -> Vec<ProcessHandle>;

    /// 进程是否仍然存在且是同一代（启动时间一致）
    fn is_alive(&self, pid: i32, start_time: u64) -> bool;
}

/// 基于 sysinfo 的实现
pub struct SysinfoProbe {
    system: Mutex<System>,
    selector: Regex,
    self_pid: i32,
}

impl SysinfoProbe {
    pub fn new(selector: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            system: Mutex::new(System::new()),
            selector: Regex::new(selector)?,
            self_pid: std::process::id() as i32,
        })
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::OnlyIfNotSet)
            .with_exe(UpdateKind::OnlyIfNotSet)
    }

    fn is_candidate(&self, process: &Process) -> bool {
        let name = process.name().to_string_lossy();
        if self.selector.is_match(&name) {
            return true;
        }
        // 有些发行版下进程名被截断，退回到可执行文件名
        process
            .exe()
            .and_then(|p| p.file_name())
            .map(|f| self.selector.is_match(&f.to_string_lossy()))
            .unwrap_or(false)
    }
}

fn to_handle(pid: Pid, process: &Process) -> ProcessHandle {
    ProcessHandle {
        pid: pid.as_u32() as i32,
        start_time: process.start_time(),
        cmdline: process
            .cmd()
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect(),
        exe: process.exe().map(|p| p.display().to_string()),
    }
}

impl ProcessProbe for SysinfoProbe {
    fn enumerate(&self) -> Vec<ProcessHandle> {
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        let mut handles: Vec<ProcessHandle> = sys
            .processes()
            .iter()
            // 线程不单独处理
            .filter(|(_, p)| p.thread_kind().is_none())
            .filter(|(pid, _)| pid.as_u32() as i32 != self.self_pid)
            .filter(|(_, p)| self.is_candidate(p))
            .map(|(pid, p)| to_handle(*pid, p))
            .collect();

        handles.sort_by_key(|h| h.pid);
        log::debug!("[scan] found {} java processes", handles.len());
        handles
    }

    fn is_alive(&self, pid: i32, start_time: u64) -> bool {
        if pid <= 0 {
            return false;
        }
        let sysinfo_pid = Pid::from_u32(pid as u32);
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sysinfo_pid]),
            true,
            ProcessRefreshKind::nothing(),
        );

        match sys.process(sysinfo_pid) {
            Some(p) => start_time == 0 || p.start_time() == start_time,
            None => false,
        }
    }
}

/// cmdline 中包含 IDE/编辑器特征的进程不注入
pub const IDE_MARKERS: [&str; 5] = ["IDEA", "idea_rt", "vscode", "eclipse", "netbeans"];

pub fn is_ide_process(cmdline: &[String]) -> bool {
    cmdline
        .iter()
        .any(|arg| IDE_MARKERS.iter().any(|marker| arg.contains(marker)))
}
