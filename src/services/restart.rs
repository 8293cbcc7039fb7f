use std::fmt;
use tokio::sync::mpsc;

/// 主动重启的原因；进程以退出码 0 结束，由外部进程管理器重新拉起
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// 定时重启，长时间运行后注册/配置监听会话不稳定
    Scheduled,
    /// 远程配置已更新并落盘
    ConfigChanged,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Scheduled => f.write_str("scheduled restart"),
            RestartReason::ConfigChanged => f.write_str("config changed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartHandle {
    tx: mpsc::Sender<RestartReason>,
}

impl RestartHandle {
    pub fn channel() -> (Self, mpsc::Receiver<RestartReason>) {
        let (tx, rx) = mpsc::channel(4);
        (Self { tx }, rx)
    }

    pub fn request(&self, reason: RestartReason) {
        if self.tx.try_send(reason).is_err() {
            log::debug!("[restart] restart already requested, ignore {}", reason);
        }
    }
}

/// 守护进程的主动退出点，不是错误
pub fn terminate_for_restart(reason: RestartReason) -> ! {
    log::info!(
        "[restart] rasp-daemon will restart ({}), pid:{}",
        reason,
        std::process::id()
    );
    log::logger().flush();
    std::process::exit(0)
}
