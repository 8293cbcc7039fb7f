use clap::Parser;
use std::path::PathBuf;

/// RASP daemon - java 进程发现与 agent 注入守护进程
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CommandArgs {
    /// 安装目录
    #[arg(short = 'd', long, env = "RASP_HOME", default_value = "/usr/local/jrasp")]
    pub install_dir: PathBuf,

    /// 配置文件路径，默认 <install_dir>/cfg/config.json
    #[arg(short, long, env = "RASP_CONFIG")]
    pub config: Option<PathBuf>,

    /// 状态接口监听端口
    #[arg(short, long, env = "PORT", default_value_t = 9999)]
    pub port: u16,

    /// 状态接口监听地址
    #[arg(short = 'a', long, env = "ADDRESS", default_value = "127.0.0.1")]
    pub address: String,
}

impl CommandArgs {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.install_dir.join("cfg").join("config.json"))
    }
}
