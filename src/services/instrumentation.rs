use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::models::{InjectionStatus, ProcessHandle};

pub const TOKEN_FILE: &str = ".jrasp.token";
pub const PARAMETERS_FILE: &str = "parameters.json";
const TOKEN_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("failed to spawn launcher for pid {pid}: {source}")]
    Spawn {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("launcher action `{action}` for pid {pid} exited with {code:?}: {stderr}")]
    Launcher {
        pid: i32,
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("launcher action `{action}` for pid {pid} timed out after {timeout:?}")]
    Timeout {
        pid: i32,
        action: &'static str,
        timeout: Duration,
    },

    #[error("token file for pid {pid} not found within {waited:?}")]
    TokenMissing { pid: i32, waited: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// 注入子系统：attach、token 校验、参数刷新与强制退出
#[async_trait]
pub trait Instrumentation: Send + Sync {
    async fn attach(&self, process: &ProcessHandle) -> Result<(), InjectError>;

    /// 读取进程当前的注入标记（上一次守护进程实例可能已经注入过）
    async fn get_and_mark_status(&self, process: &ProcessHandle) -> InjectionStatus;

    /// 在有限时间内等待 token 文件出现
    async fn read_injection_token(
        &self,
        process: &ProcessHandle,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError>;

    async fn exit_inject(&self, process: &ProcessHandle) -> Result<(), InjectError>;

    async fn soft_flush(&self, process: &ProcessHandle) -> Result<(), InjectError>;

    async fn update_parameters(
        &self,
        process: &ProcessHandle,
        parameters: &HashMap<String, String>,
    ) -> Result<(), InjectError>;
}

/// 通过 launcher jar 完成 attach 等动作
///
/// 命令形如 `java -jar <home>/lib/jrasp-launcher.jar <pid> <action> <home>`，
/// token 与参数文件放在 `<home>/run/<pid>/` 下。
pub struct LauncherInstrumentation {
    install_dir: PathBuf,
    java_home: Option<PathBuf>,
    action_timeout: Duration,
    token_wait: Duration,
}

impl LauncherInstrumentation {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        java_home: Option<PathBuf>,
        action_timeout: Duration,
        token_wait: Duration,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            java_home,
            action_timeout,
            token_wait,
        }
    }

    pub fn run_dir(&self, pid: i32) -> PathBuf {
        run_dir(&self.install_dir, pid)
    }

    fn token_path(&self, pid: i32) -> PathBuf {
        self.run_dir(pid).join(TOKEN_FILE)
    }

    /// 优先使用配置的 JAVA_HOME，其次是目标进程自身的 java
    fn java_bin(&self, process: &ProcessHandle) -> PathBuf {
        if let Some(home) = &self.java_home {
            return home.join("bin").join("java");
        }
        match &process.exe {
            Some(exe) => PathBuf::from(exe),
            None => PathBuf::from("java"),
        }
    }

    async fn run_launcher(
        &self,
        process: &ProcessHandle,
        action: &'static str,
    ) -> Result<(), InjectError> {
        let pid = process.pid;
        let launcher = self.install_dir.join("lib").join("jrasp-launcher.jar");

        let mut command = Command::new(self.java_bin(process));
        command
            .arg("-jar")
            .arg(&launcher)
            .arg(pid.to_string())
            .arg(action)
            .arg(&self.install_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("[launcher] pid={} action={} launcher={}", pid, action, launcher.display());

        let child = command
            .spawn()
            .map_err(|source| InjectError::Spawn { pid, source })?;

        let output = match tokio::time::timeout(self.action_timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(InjectError::Timeout {
                    pid,
                    action,
                    timeout: self.action_timeout,
                })
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(InjectError::Launcher {
                pid,
                action,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

pub fn run_dir(install_dir: &Path, pid: i32) -> PathBuf {
    install_dir.join("run").join(pid.to_string())
}

#[async_trait]
impl Instrumentation for LauncherInstrumentation {
    async fn attach(&self, process: &ProcessHandle) -> Result<(), InjectError> {
        tokio::fs::create_dir_all(self.run_dir(process.pid)).await?;
        self.run_launcher(process, "attach").await
    }

    async fn get_and_mark_status(&self, process: &ProcessHandle) -> InjectionStatus {
        match tokio::fs::try_exists(self.token_path(process.pid)).await {
            Ok(true) => InjectionStatus::InjectSuccess,
            Ok(false) => InjectionStatus::NotInjected,
            Err(e) => {
                log::warn!("[inject] check token of pid {} failed: {}", process.pid, e);
                InjectionStatus::NotInjected
            }
        }
    }

    async fn read_injection_token(
        &self,
        process: &ProcessHandle,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let path = self.token_path(process.pid);
        let deadline = tokio::time::Instant::now() + self.token_wait;
        loop {
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                if !content.trim().is_empty() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(InjectError::TokenMissing {
                    pid: process.pid,
                    waited: self.token_wait,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(InjectError::Cancelled),
                _ = tokio::time::sleep(TOKEN_POLL_INTERVAL) => {}
            }
        }
    }

    async fn exit_inject(&self, process: &ProcessHandle) -> Result<(), InjectError> {
        self.run_launcher(process, "exit").await?;
        match tokio::fs::remove_file(self.token_path(process.pid)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn soft_flush(&self, process: &ProcessHandle) -> Result<(), InjectError> {
        self.run_launcher(process, "flush").await
    }

    async fn update_parameters(
        &self,
        process: &ProcessHandle,
        parameters: &HashMap<String, String>,
    ) -> Result<(), InjectError> {
        let dir = self.run_dir(process.pid);
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(parameters).map_err(std::io::Error::other)?;
        tokio::fs::write(dir.join(PARAMETERS_FILE), body).await?;
        self.run_launcher(process, "update").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(pid: i32) -> ProcessHandle {
        ProcessHandle {
            pid,
            start_time: 1,
            cmdline: vec!["java".into()],
            exe: None,
        }
    }

    fn instrumentation(dir: &Path) -> LauncherInstrumentation {
        LauncherInstrumentation::new(
            dir,
            Some(dir.join("no-such-jdk")),
            Duration::from_secs(1),
            Duration::from_millis(600),
        )
    }

    #[tokio::test]
    async fn test_status_follows_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instrumentation(dir.path());
        let p = handle(4242);
        assert_eq!(inst.get_and_mark_status(&p).await, InjectionStatus::NotInjected);

        std::fs::create_dir_all(inst.run_dir(4242)).unwrap();
        std::fs::write(inst.run_dir(4242).join(TOKEN_FILE), "jrasp;127.0.0.1;8080").unwrap();
        assert_eq!(inst.get_and_mark_status(&p).await, InjectionStatus::InjectSuccess);
    }

    #[tokio::test]
    async fn test_read_token_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instrumentation(dir.path());
        let err = inst
            .read_injection_token(&handle(7), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::TokenMissing { pid: 7, .. }));
    }

    #[tokio::test]
    async fn test_read_token_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instrumentation(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = inst.read_injection_token(&handle(7), &cancel).await.unwrap_err();
        assert!(matches!(err, InjectError::Cancelled));
    }

    #[tokio::test]
    async fn test_attach_reports_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instrumentation(dir.path());
        let err = inst.attach(&handle(9)).await.unwrap_err();
        assert!(matches!(err, InjectError::Spawn { pid: 9, .. }));
        // run 目录在 attach 前创建
        assert!(inst.run_dir(9).is_dir());
    }

    #[tokio::test]
    async fn test_update_parameters_writes_file_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instrumentation(dir.path());
        let mut params = HashMap::new();
        params.insert("rce.block".to_string(), "true".to_string());
        assert!(inst.update_parameters(&handle(11), &params).await.is_err());

        let written = std::fs::read_to_string(inst.run_dir(11).join(PARAMETERS_FILE)).unwrap();
        assert!(written.contains("rce.block"));
    }
}
