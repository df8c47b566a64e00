use std::path::PathBuf;
use std::time::Instant;

use everysearch::config::{self, AppConfig};
use everysearch::demo::DemoSearcher;
use everysearch::everything::EverythingSearcher;
use everysearch::searcher::{SearchBackend, SearchProvider};
use everysearch::simple_search::SimpleSearcher;
use everysearch::windows_search::WindowsSearcher;
use everysearch::SearchQuery;

fn main() {
    println!("=== 搜索后端深度测试 (逐层探测 + 场景验证) ===");

    let mut config = config::load_config(&config::default_config_path());
    config.apply_env_overrides();

    // 场景 1: 每一层单独探测，不受降级顺序影响
    println!("\n[逐层探测]");
    for provider in all_providers(&config) {
        let started = Instant::now();
        let available = provider.is_available();
        println!(
            "  {:<15} {}  ({:?})",
            provider.tier().label(),
            if available { "✅ 可用" } else { "❌ 不可用" },
            started.elapsed()
        );
        if available {
            run_direct(provider.as_ref(), "txt");
        }
    }

    // 场景 2: 经过调度器的完整链路
    let backend = SearchBackend::from_config(&config);
    let status = backend.status();
    println!("\n后端状态: {} - {}", status.label, status.message);

    test_scenario(&backend, "通用关键词", "txt");
    test_scenario(&backend, "扩展名通配: *.txt", "*.txt");
    test_scenario(&backend, "扩展名通配: *.png", "*.png");
    test_scenario(&backend, "中文关键词", "文档");
    test_scenario(&backend, "带单引号的关键词", "it's");
    test_scenario(&backend, "空查询 (应为空)", "   ");

    println!("\n=== 所有场景测试完成 ===");
}

fn all_providers(config: &AppConfig) -> Vec<Box<dyn SearchProvider>> {
    let preferred = config.search.native_library.as_ref().map(PathBuf::from);
    let mut providers: Vec<Box<dyn SearchProvider>> = Vec::new();
    providers.push(Box::new(EverythingSearcher::new(preferred)));
    providers.push(Box::new(WindowsSearcher::new(
        config.probe_timeout(),
        config.enumeration_timeout(),
    )));
    providers.push(Box::new(SimpleSearcher::new(
        config.probe_timeout(),
        config.enumeration_timeout(),
    )));
    providers.push(Box::new(DemoSearcher::new()));
    providers
}

fn run_direct(provider: &dyn SearchProvider, query: &str) {
    match provider.search(&SearchQuery::new(query, 3)) {
        Ok(outcome) => println!(
            "    '{}' -> {}/{} 条",
            query,
            outcome.records.len(),
            outcome.total_matched
        ),
        Err(e) => println!("    '{}' -> 错误: {}", query, e),
    }
}

fn test_scenario(backend: &SearchBackend, name: &str, query: &str) {
    println!("\n[场景测试] {}", name);
    println!("查询语句: '{}'", query);

    let started = Instant::now();
    let outcome = match backend.search(query, 10) {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("  >>> [结论] 场景测试失败: {}", e);
            return;
        }
    };
    println!(
        "获取结果: {} 条 (共匹配 {} 条, 用时 {:?})",
        outcome.records.len(),
        outcome.total_matched,
        started.elapsed()
    );

    let mut fail_count = 0;
    for (i, res) in outcome.records.iter().enumerate() {
        // 核心校验: 完整路径 = 目录 + 文件名，文件夹没有扩展名
        let consistent = res.full_path().ends_with(res.filename())
            && res.full_path().starts_with(res.directory())
            && (res.is_file() || res.extension().is_empty());
        if !consistent {
            fail_count += 1;
        }

        let icon = if res.is_folder() { "📁" } else { "📄" };
        println!("  {}. [{}] {} ({})", i + 1, icon, res.filename(), res.size_str());
        println!("     路径: {}", res.full_path());
        if !consistent {
            println!("     ❌ 字段不一致");
        }
    }

    if fail_count > 0 {
        println!("  >>> [结论] 场景测试失败: 存在 {} 条不一致记录", fail_count);
    } else if outcome.records.is_empty() {
        println!("  >>> [结论] 场景测试跳过: 未找到匹配项");
    } else {
        println!("  >>> [结论] 场景测试通过");
    }
}
