use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::demo::DemoSearcher;
use crate::error::SearchError;
use crate::everything::EverythingSearcher;
use crate::simple_search::SimpleSearcher;
use crate::types::{BackendStatus, BackendTier, SearchOutcome, SearchQuery};
use crate::windows_search::WindowsSearcher;

/// 单个搜索后端
pub trait SearchProvider: Send + Sync {
    fn tier(&self) -> BackendTier;

    /// 廉价的可用性探测，不得 panic，失败返回 false
    fn is_available(&self) -> bool;

    fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, SearchError>;
}

/// 多后端降级调度器
///
/// 首次探测时按优先级依次调用 `is_available`，选中第一个可用的后端后在进程生命周期内固定，
/// 之后的查询失败只作为单次错误返回，不会重新探测或降级。
pub struct SearchBackend {
    providers: Vec<Box<dyn SearchProvider>>,
    selected: OnceCell<usize>,
}

impl SearchBackend {
    /// 使用给定的后端列表。列表会按优先级排序，缺少示范后端时自动补上
    pub fn new(mut providers: Vec<Box<dyn SearchProvider>>) -> Self {
        providers.sort_by(|a, b| b.tier().cmp(&a.tier()));
        if !providers.iter().any(|p| p.tier() == BackendTier::Demo) {
            providers.push(Box::new(DemoSearcher::new()));
        }
        Self {
            providers,
            selected: OnceCell::new(),
        }
    }

    /// 按配置构造全部真实后端；被禁用的层级不会创建，也不会被探测
    pub fn from_config(config: &AppConfig) -> Self {
        let mut providers: Vec<Box<dyn SearchProvider>> = Vec::new();

        if config.backends.disable_native {
            info!("Everything SDK 已被配置禁用");
        } else {
            let preferred = config.search.native_library.as_ref().map(PathBuf::from);
            providers.push(Box::new(EverythingSearcher::new(preferred)));
        }

        if config.backends.disable_os_index {
            info!("Windows Search API 已被配置禁用");
        } else {
            providers.push(Box::new(WindowsSearcher::new(
                config.probe_timeout(),
                config.enumeration_timeout(),
            )));
        }

        if config.backends.disable_fs_tool {
            info!("简化搜索已被配置禁用");
        } else {
            providers.push(Box::new(SimpleSearcher::new(
                config.probe_timeout(),
                config.enumeration_timeout(),
            )));
        }

        providers.push(Box::new(DemoSearcher::new()));
        Self::new(providers)
    }

    /// 执行探测并固定后端；重复调用直接返回已选层级
    pub fn probe(&self) -> BackendTier {
        self.providers[self.selected_index()].tier()
    }

    fn selected_index(&self) -> usize {
        *self.selected.get_or_init(|| self.select())
    }

    fn select(&self) -> usize {
        for (index, provider) in self.providers.iter().enumerate() {
            let tier = provider.tier();
            let started = Instant::now();
            let available = provider.is_available();
            debug!("探测 {} 用时 {:?}", tier, started.elapsed());

            if available {
                info!("✓ 使用搜索后端: {} ({})", tier, tier.description());
                return index;
            }
            warn!("⚠ 搜索后端 {} 不可用，尝试下一层", tier);
        }
        // 示范后端总是可用，走到这里说明列表里的示范后端被替换过
        let last = self.providers.len() - 1;
        warn!("所有后端探测失败，使用 {}", self.providers[last].tier());
        last
    }

    pub fn active_tier(&self) -> Option<BackendTier> {
        self.selected.get().map(|&i| self.providers[i].tier())
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus::from(self.probe())
    }

    pub fn is_demo(&self) -> bool {
        self.probe() == BackendTier::Demo
    }

    /// 在固定后端上执行查询。任何后端错误都统一为 `QueryFailed`
    pub fn search(&self, text: &str, max_results: usize) -> Result<SearchOutcome, SearchError> {
        let provider = &self.providers[self.selected_index()];
        let tier = provider.tier();
        let query = SearchQuery::new(text, max_results);

        let started = Instant::now();
        match provider.search(&query) {
            Ok(mut outcome) => {
                outcome.records.truncate(max_results);
                debug!(
                    "{} 查询 '{}' 返回 {}/{} 条，用时 {:?}",
                    tier,
                    text,
                    outcome.records.len(),
                    outcome.total_matched,
                    started.elapsed()
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!("{} 查询 '{}' 失败: {}", tier, text, e);
                Err(match e {
                    SearchError::QueryFailed(msg) => SearchError::QueryFailed(msg),
                    SearchError::BackendUnavailable(msg) => SearchError::QueryFailed(msg),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchRecord;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// 可计数的假后端
    struct Stub {
        tier: BackendTier,
        available: bool,
        probes: Arc<AtomicUsize>,
        searches: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    impl Stub {
        fn new(tier: BackendTier, available: bool) -> (Self, Arc<AtomicUsize>) {
            let probes = Arc::new(AtomicUsize::new(0));
            let stub = Self {
                tier,
                available,
                probes: probes.clone(),
                searches: Arc::new(AtomicUsize::new(0)),
                failing: Arc::new(AtomicBool::new(false)),
            };
            (stub, probes)
        }
    }

    impl SearchProvider for Stub {
        fn tier(&self) -> BackendTier {
            self.tier
        }

        fn is_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.available
        }

        fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, SearchError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(SearchError::unavailable("stub down"));
            }
            let records = (0..query.max_results + 3)
                .map(|i| SearchRecord::new("/tmp", &format!("{}-{}.txt", query.text, i), false))
                .collect();
            Ok(SearchOutcome::new(records, 999))
        }
    }

    fn boxed(stubs: Vec<Stub>) -> Vec<Box<dyn SearchProvider>> {
        stubs
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn SearchProvider>)
            .collect()
    }

    #[test]
    fn test_first_available_tier_short_circuits() {
        let (native, native_probes) = Stub::new(BackendTier::NativeIndex, true);
        let (os, os_probes) = Stub::new(BackendTier::OsIndexed, true);
        let (fs, fs_probes) = Stub::new(BackendTier::FilesystemTool, true);
        let (demo, demo_probes) = Stub::new(BackendTier::Demo, true);

        // 故意乱序传入
        let backend = SearchBackend::new(boxed(vec![demo, fs, native, os]));
        assert_eq!(backend.probe(), BackendTier::NativeIndex);
        assert_eq!(native_probes.load(Ordering::SeqCst), 1);
        assert_eq!(os_probes.load(Ordering::SeqCst), 0);
        assert_eq!(fs_probes.load(Ordering::SeqCst), 0);
        assert_eq!(demo_probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_falls_through_to_demo() {
        let (native, native_probes) = Stub::new(BackendTier::NativeIndex, false);
        let (os, os_probes) = Stub::new(BackendTier::OsIndexed, false);
        let (fs, fs_probes) = Stub::new(BackendTier::FilesystemTool, false);

        let backend = SearchBackend::new(boxed(vec![native, os, fs]));
        assert_eq!(backend.probe(), BackendTier::Demo);
        assert!(backend.is_demo());
        assert_eq!(native_probes.load(Ordering::SeqCst), 1);
        assert_eq!(os_probes.load(Ordering::SeqCst), 1);
        assert_eq!(fs_probes.load(Ordering::SeqCst), 1);

        let outcome = backend.search("*.txt", 50).unwrap();
        assert!(outcome.records.iter().all(|r| r.extension() == "txt"));
    }

    #[test]
    fn test_selection_is_frozen() {
        let (native, native_probes) = Stub::new(BackendTier::NativeIndex, false);
        let (os, os_probes) = Stub::new(BackendTier::OsIndexed, true);
        let backend = SearchBackend::new(boxed(vec![native, os]));

        assert!(backend.active_tier().is_none());
        for _ in 0..3 {
            assert_eq!(backend.probe(), BackendTier::OsIndexed);
            backend.search("a", 1).unwrap();
        }
        assert_eq!(backend.active_tier(), Some(BackendTier::OsIndexed));
        assert_eq!(native_probes.load(Ordering::SeqCst), 1);
        assert_eq!(os_probes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.status().label, "OsIndexed");
    }

    #[test]
    fn test_runtime_failure_does_not_downgrade() {
        let (os, _) = Stub::new(BackendTier::OsIndexed, true);
        let failing = os.failing.clone();
        let searches = os.searches.clone();
        let (fs, fs_probes) = Stub::new(BackendTier::FilesystemTool, true);
        let backend = SearchBackend::new(boxed(vec![os, fs]));

        assert_eq!(backend.probe(), BackendTier::OsIndexed);
        failing.store(true, Ordering::SeqCst);

        let err = backend.search("a", 5).unwrap_err();
        assert!(matches!(err, SearchError::QueryFailed(_)));
        assert_eq!(backend.probe(), BackendTier::OsIndexed);
        assert_eq!(fs_probes.load(Ordering::SeqCst), 0);

        failing.store(false, Ordering::SeqCst);
        assert!(backend.search("a", 5).is_ok());
        assert_eq!(searches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cap_is_honored() {
        let (native, _) = Stub::new(BackendTier::NativeIndex, true);
        let backend = SearchBackend::new(boxed(vec![native]));
        let outcome = backend.search("x", 4).unwrap();
        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.total_matched, 999);
    }

    #[test]
    fn test_concurrent_first_probe_selects_once() {
        let (native, native_probes) = Stub::new(BackendTier::NativeIndex, true);
        let backend = Arc::new(SearchBackend::new(boxed(vec![native])));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = backend.clone();
                std::thread::spawn(move || b.probe())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), BackendTier::NativeIndex);
        }
        assert_eq!(native_probes.load(Ordering::SeqCst), 1);
    }
}
