use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info};

use kernel::app::Application;
use kernel::shutdown::{wait_for_signal, ShutdownManager};
use kernel_core::{init_logging, KernelConfig, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("kernel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("应用服务器内核：部署处理链与集群RPC分发")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，不指定时按默认位置查找"),
        )
        .arg(
            Arg::new("node-name")
                .short('n')
                .long("node-name")
                .value_name("NAME")
                .help("覆盖配置中的节点名称"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("覆盖配置中的日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("覆盖配置中的日志格式")
                .value_parser(["json", "pretty", "compact"]),
        )
        .arg(
            Arg::new("deploy")
                .short('d')
                .long("deploy")
                .value_name("UNIT")
                .help("启动后部署的单元，可以重复指定")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("peers")
                .long("peers")
                .value_name("COUNT")
                .help("在进程内额外启动的对等节点数量")
                .value_parser(clap::value_parser!(usize))
                .default_value("0"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = KernelConfig::load(config_path).context("加载配置失败")?;

    if let Some(name) = matches.get_one::<String>("node-name") {
        config.node.node_name = name.clone();
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = match format.as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        };
    }
    config.validate()?;
    init_logging(&config.logging)?;

    info!(node = %config.node.node_name, group = %config.cluster.group_name, "启动内核");

    let app = Arc::new(Application::new(config).await?);
    for unit in matches.get_many::<String>("deploy").into_iter().flatten() {
        app.deploy(unit).await?;
    }
    let peers = matches.get_one::<usize>("peers").copied().unwrap_or(0);
    for index in 1..=peers {
        let name = format!("{}-peer-{index}", app.cluster().local_node().name());
        app.add_peer(&name).await?;
    }

    let shutdown = ShutdownManager::new();
    let handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!(error = %e, "内核运行失败");
            }
        })
    };

    wait_for_signal().await;
    info!("开始优雅关闭");
    shutdown.shutdown();

    let drained = shutdown
        .drain(
            async {
                if let Err(e) = handle.await {
                    error!(error = %e, "内核任务异常退出");
                }
            },
            Duration::from_secs(30),
        )
        .await;
    if drained {
        info!("内核已退出");
    }
    Ok(())
}
