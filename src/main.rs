use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use everysearch::cli::{run_cli, CliArgs};
use everysearch::config::{self, AppConfig};
use everysearch::instance::InstanceGuard;
use everysearch::server::{self, AppState};
use everysearch::{BackendTier, SearchBackend};

/// 等服务起来后再打开浏览器
const BROWSER_DELAY: Duration = Duration::from_millis(1500);

fn main() -> ExitCode {
    // 初始化日志（输出到 stderr，单次搜索模式下 stdout 只有 JSON）
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "everysearch=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = CliArgs::parse();

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = config::load_config(&config_path);
    config.apply_env_overrides();
    args.apply_to(&mut config);

    // 单次搜索：不加实例锁，不启动服务
    if let Some(query) = args.query.as_deref() {
        return match run_cli(query, &args, &config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("搜索失败: {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    // 0. 单实例检测（锁文件 + 端口）
    let guard = match InstanceGuard::acquire(
        &config.lock_path(),
        &config.server.host,
        config.server.port,
        config.lock_timeout(),
    ) {
        Ok(guard) => guard,
        Err(e) => {
            error!("{}", e);
            eprintln!("❌ {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let result = run_server(config);

    // 守卫在所有退出路径上释放锁（panic 展开时同样会 drop）
    drop(guard);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("服务异常退出: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("无法创建 tokio 运行时")?;

    // 1. 探测后端，之后不再切换
    let backend = Arc::new(SearchBackend::from_config(&config));
    let tier = backend.probe();
    log_banner(&config, tier);

    runtime.block_on(async move {
        let addr = config.listen_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("无法监听 {}", addr))?;
        info!("Server running at {}", config.base_url());

        if config.open_browser {
            spawn_browser(config.base_url());
        }

        // 2. 运行 HTTP 服务直到收到关闭信号
        server::serve(listener, AppState::new(backend, config))
            .await
            .context("HTTP 服务运行失败")?;

        info!("👋 服务已停止");
        Ok(())
    })
}

fn log_banner(config: &AppConfig, tier: BackendTier) {
    let url = config.base_url();
    info!("{}", "=".repeat(60));
    info!("🔍 EverySearch 本机文件搜索服务 v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", "=".repeat(60));
    info!("✓ 当前搜索引擎: {} ({})", tier, tier.description());

    if tier == BackendTier::Demo {
        warn!("⚠ 以示范模式运行 - 所有真实后端均不可用");
        warn!("要使用完整功能，请:");
        warn!("1. 安装 Everything 搜索引擎");
        warn!("2. 启动 Everything");
        warn!("3. 重新启动此程序");
    }

    info!("📍 服务地址: {}", url);
    info!("📊 状态检查: {}/status", url);
    info!("💡 按 Ctrl+C 停止服务");
    info!("{}", "=".repeat(60));
}

fn spawn_browser(url: String) {
    std::thread::spawn(move || {
        std::thread::sleep(BROWSER_DELAY);
        if let Err(e) = open::that(&url) {
            warn!("无法打开浏览器 {}: {}", url, e);
        }
    });
}
