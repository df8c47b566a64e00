use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::searcher::SearchBackend;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "EverySearch 本机文件搜索服务", long_about = None)]
pub struct CliArgs {
    /// 单次搜索关键词；指定后只输出 JSON 结果，不启动服务
    #[arg(short = 'q', long = "query")]
    pub query: Option<String>,

    /// 最大结果数（默认取配置）
    #[arg(short = 'm', long = "max-results")]
    pub max_results: Option<usize>,

    /// 监听地址
    #[arg(long)]
    pub host: Option<String>,

    /// 监听端口
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// 配置文件路径（默认=程序目录下的 config.json）
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// 启动后不打开浏览器
    #[arg(long = "no-browser")]
    pub no_browser: bool,
}

impl CliArgs {
    /// 命令行参数优先于配置文件和环境变量
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.no_browser {
            config.open_browser = false;
        }
    }
}

// CLI入口：单次搜索，输出 JSON（不加实例锁，不启动服务）
pub fn run_cli(query: &str, args: &CliArgs, config: &AppConfig) -> anyhow::Result<()> {
    let output = search_json(query, args.max_results, config)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub fn search_json(
    query: &str,
    max_results: Option<usize>,
    config: &AppConfig,
) -> anyhow::Result<serde_json::Value> {
    let backend = SearchBackend::from_config(config);
    let status = backend.status();
    let max_results = config.clamp_max_results(max_results);

    let outcome = backend.search(query, max_results)?;
    Ok(json!({
        "code": 0,
        "msg": "success",
        "query": query,
        "search_engine": status.label,
        "demo_mode": status.demo_mode,
        "total_count": outcome.total_matched,
        "displayed_count": outcome.records.len(),
        "results": outcome.records,
    }))
}
