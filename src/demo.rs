use chrono::{Duration, Local};

use crate::error::SearchError;
use crate::searcher::SearchProvider;
use crate::types::{BackendTier, SearchOutcome, SearchQuery, SearchRecord};

/// 示范目录：(文件名, 所在目录, 大小, 是否目录)
const CATALOG: &[(&str, &str, u64, bool)] = &[
    // Python 文件
    ("app.py", "D:\\Work\\pyeverything", 5120, false),
    ("test.py", "D:\\Work\\projects\\myapp", 2048, false),
    ("main.py", "C:\\Users\\User\\Documents\\python", 8192, false),
    ("setup.py", "D:\\Work\\myproject", 1024, false),
    // 文本
    ("readme.txt", "D:\\Work\\projects", 3072, false),
    ("notes.txt", "C:\\Users\\User\\Desktop", 1536, false),
    ("config.txt", "D:\\Apps\\myapp", 512, false),
    // 图片
    ("image.jpg", "C:\\Users\\User\\Pictures", 2_097_152, false),
    ("photo.png", "D:\\Photos\\vacation", 1_048_576, false),
    ("screenshot.png", "C:\\Users\\User\\Desktop", 524_288, false),
    // 目录
    ("Documents", "C:\\Users\\User", 0, true),
    ("Projects", "D:\\Work", 0, true),
    ("Downloads", "C:\\Users\\User", 0, true),
    // Office
    ("presentation.pptx", "D:\\Work\\documents", 5_242_880, false),
    ("report.docx", "C:\\Users\\User\\Documents", 204_800, false),
    ("data.xlsx", "D:\\Work\\analysis", 1_048_576, false),
];

/// 示范后端：不接触真实文件系统，总是可用
pub struct DemoSearcher {
    entries: Vec<SearchRecord>,
}

impl DemoSearcher {
    pub fn new() -> Self {
        let now = Local::now();
        let entries = CATALOG
            .iter()
            .map(|&(name, dir, size, is_dir)| {
                SearchRecord::new(dir, name, is_dir)
                    .with_size(size)
                    .with_created(Some(now - Duration::days(30)))
                    .with_modified(Some(now - Duration::days(1)))
                    .with_accessed(Some(now))
            })
            .collect();
        Self { entries }
    }

    fn matches(entry: &SearchRecord, needle: &str, wildcard: Option<&str>) -> bool {
        match wildcard {
            Some(ext) => entry.extension() == ext,
            None => {
                entry.filename().to_lowercase().contains(needle)
                    || entry.directory().to_lowercase().contains(needle)
            }
        }
    }
}

impl Default for DemoSearcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchProvider for DemoSearcher {
    fn tier(&self) -> BackendTier {
        BackendTier::Demo
    }

    fn is_available(&self) -> bool {
        true
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, SearchError> {
        let needle = query.text.trim().to_lowercase();
        let wildcard = query.extension_wildcard();

        let matched: Vec<&SearchRecord> = self
            .entries
            .iter()
            .filter(|e| Self::matches(e, &needle, wildcard.as_deref()))
            .collect();

        let total = matched.len();
        let records = matched
            .into_iter()
            .take(query.max_results)
            .cloned()
            .collect();
        Ok(SearchOutcome::new(records, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(text: &str, max: usize) -> SearchOutcome {
        DemoSearcher::new().search(&SearchQuery::new(text, max)).unwrap()
    }

    #[test]
    fn test_always_available() {
        assert!(DemoSearcher::new().is_available());
    }

    #[test]
    fn test_extension_wildcard_is_exact() {
        let outcome = search("*.txt", 100);
        assert_eq!(outcome.records.len(), 3);
        assert!(outcome.records.iter().all(|r| r.extension() == "txt"));

        // 没有 "tx" 扩展名，前缀不能算命中
        assert!(search("*.tx", 100).records.is_empty());
        assert!(search("*.txtx", 100).records.is_empty());
    }

    #[test]
    fn test_substring_is_case_insensitive() {
        let outcome = search("README", 100);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].full_path(), "D:\\Work\\projects\\readme.txt");
    }

    #[test]
    fn test_matches_directory() {
        // "desktop" 只出现在目录里
        let outcome = search("desktop", 100);
        let names: Vec<&str> = outcome.records.iter().map(|r| r.filename()).collect();
        assert_eq!(names, vec!["notes.txt", "screenshot.png"]);
    }

    #[test]
    fn test_total_counts_before_truncation() {
        let outcome = search("py", 2);
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.total_matched > 2);
    }

    #[test]
    fn test_folders() {
        let outcome = search("downloads", 10);
        let folder = outcome.records.iter().find(|r| r.filename() == "Downloads").unwrap();
        assert!(folder.is_folder());
        assert_eq!(folder.extension(), "");
        assert_eq!(folder.size_str(), "0 B");
    }
}
