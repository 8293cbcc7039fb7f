use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;
use tokio_util::sync::CancellationToken;

mod api;
mod cli;
mod config;
mod metrics;
mod models;
mod services;
mod state;

use api::{get_metrics, health, list_processes, reevaluate_process};
use cli::CommandArgs;
use config::DaemonConfig;
use services::nacos::{follow_config, NacosClient};
use services::restart::terminate_for_restart;
use services::{
    InjectionController, LauncherInstrumentation, ProcessRegistry, RestartHandle, SysinfoProbe,
    Watch,
};
use state::new_state;

pub const RASP_DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandArgs::parse();
    let config_path = args.config_path();
    let bind_address = format!("{}:{}", args.address, args.port);

    // 目录创建失败、配置错误直接退出，此时还没有开始监控
    prepare_dirs(&args.install_dir, &config_path)?;
    let config = Arc::new(
        DaemonConfig::load(&config_path)
            .with_context(|| format!("load config {}", config_path.display()))?,
    );
    let host_name = System::host_name().unwrap_or_else(|| "unknown".to_string());

    let cancel = CancellationToken::new();
    let (restart, mut restart_rx) = RestartHandle::channel();

    start_nacos(&config, &host_name, &config_path, &restart, &cancel);

    let registry = ProcessRegistry::new();
    let probe = Arc::new(
        SysinfoProbe::new(&config.java_selector).context("invalid javaSelector")?,
    );
    let instrumentation = Arc::new(LauncherInstrumentation::new(
        args.install_dir.clone(),
        config.java_home.as_ref().map(PathBuf::from),
        config.attach_timeout(),
        config.token_wait(),
    ));
    let controller = Arc::new(InjectionController::new(
        config.clone(),
        instrumentation,
        registry.clone(),
    ));

    let state = new_state(registry.clone(), controller.clone(), cancel.clone());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/api/process/list", web::get().to(list_processes))
            .route("/api/process/{pid}/reevaluate", web::post().to(reevaluate_process))
            .route("/metrics", web::get().to(get_metrics))
            .route("/health", web::get().to(health))
    })
    .workers(1)
    .disable_signals()
    .bind(&bind_address)
    .with_context(|| format!("bind status server on {}", bind_address))?
    .run();

    print_banner(&args, &config, &host_name);

    let watch = Watch::new(
        config.clone(),
        registry,
        probe,
        controller,
        args.install_dir.clone(),
        cancel.clone(),
    );
    let tasks = watch.start(restart);

    tokio::select! {
        Some(reason) = restart_rx.recv() => {
            cancel.cancel();
            terminate_for_restart(reason);
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, rasp-daemon shutting down");
        }
        res = server => {
            if let Err(e) = res {
                log::error!("status server stopped: {}", e);
            }
        }
    }

    cancel.cancel();
    tasks.join().await;
    log::info!("rasp-daemon stopped");
    Ok(())
}

fn prepare_dirs(install_dir: &Path, config_path: &Path) -> anyhow::Result<()> {
    for sub in ["run", "cfg"] {
        let dir = install_dir.join(sub);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    Ok(())
}

/// 服务注册与配置监听，失败不影响进程监控
fn start_nacos(
    config: &DaemonConfig,
    host_name: &str,
    config_path: &Path,
    restart: &RestartHandle,
    cancel: &CancellationToken,
) {
    let Some(nacos) = NacosClient::new(config) else {
        log::info!("[nacos] no server configured, remote config disabled");
        return;
    };

    let data_id = config.effective_data_id(host_name);
    let host_name = host_name.to_string();
    let config_path = config_path.to_path_buf();
    let restart = restart.clone();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        match nacos.register_instance(&host_name, RASP_DAEMON_VERSION).await {
            Ok(()) => log::info!("[nacos] register instance {} success", host_name),
            Err(e) => log::error!("[nacos] register instance failed: {}", e),
        }

        follow_config(&nacos, &data_id, &config_path, &restart, &cancel).await;
    });
}

fn print_banner(args: &CommandArgs, config: &DaemonConfig, host_name: &str) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      RASP Daemon v{:<40}║", RASP_DAEMON_VERSION);
    println!("║      Java process discovery & agent injection             ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🏠 Host: {}", host_name);
    println!("📂 Install dir: {}", args.install_dir.display());
    println!("⚙️  Agent mode: {:?}", config.agent_mode);
    println!("🚀 Status server on http://{}:{}", args.address, args.port);
    println!();
    println!("📋 Available endpoints:");
    println!("  GET    /api/process/list              - List monitored java processes");
    println!("  POST   /api/process/{{pid}}/reevaluate  - Re-evaluate one process");
    println!("  GET    /metrics                       - Prometheus metrics");
    println!("  GET    /health                        - Health check");
    println!("═══════════════════════════════════════════════════════════");
}
