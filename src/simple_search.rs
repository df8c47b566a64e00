use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{MalformedRecord, SearchError};
use crate::process::run_with_timeout;
use crate::searcher::SearchProvider;
use crate::types::{parse_timestamp, BackendTier, SearchOutcome, SearchQuery, SearchRecord};

const KEY_FULL_NAME: &str = "FullName";
const KEY_ATTRIBUTES: &str = "Attributes";
const KEY_LENGTH: &str = "Length";
const KEY_MODIFIED: &str = "LastWriteTime";
const KEY_CREATED: &str = "CreationTime";

/// 文件名过滤条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFilter {
    /// 名称包含（不区分大小写）
    Contains(String),
    /// `*.ext`：只比较扩展名
    Extension(String),
}

impl NameFilter {
    pub fn from_query(query: &SearchQuery) -> Option<Self> {
        if let Some(ext) = query.extension_wildcard() {
            return Some(Self::Extension(ext));
        }
        let text = query.text.trim();
        (!text.is_empty()).then(|| Self::Contains(text.to_string()))
    }
}

/// 外部遍历工具
pub trait ShellTool: Send + Sync {
    /// 系统索引服务是否处于运行状态
    fn service_running(&self) -> bool;

    /// 在 `root` 下递归列出匹配项，输出 `Key : Value` 文本块
    fn enumerate(&self, root: &Path, filter: &NameFilter, limit: usize) -> io::Result<String>;
}

/// 简化搜索后端：PowerShell 遍历常用目录
pub struct SimpleSearcher {
    tool: Box<dyn ShellTool>,
    roots: Vec<PathBuf>,
    available: OnceCell<bool>,
}

impl SimpleSearcher {
    pub fn new(probe_timeout: Duration, enumeration_timeout: Duration) -> Self {
        Self::with_tool(
            Box::new(PowerShellTool {
                probe_timeout,
                enumeration_timeout,
            }),
            default_roots(),
        )
    }

    pub fn with_tool(tool: Box<dyn ShellTool>, roots: Vec<PathBuf>) -> Self {
        Self {
            tool,
            roots,
            available: OnceCell::new(),
        }
    }
}

impl SearchProvider for SimpleSearcher {
    fn tier(&self) -> BackendTier {
        BackendTier::FilesystemTool
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let running = self.tool.service_running();
            if running {
                info!("✓ Windows Search 服务正在运行，可使用简化搜索");
            } else {
                warn!("⚠ Windows Search 服务未运行");
            }
            running
        })
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, SearchError> {
        if !self.is_available() {
            return Err(SearchError::query_failed("Windows Search 服务不可用"));
        }
        let Some(filter) = NameFilter::from_query(query) else {
            return Ok(SearchOutcome::empty());
        };

        // 主目录递归遍历时已包含桌面等子目录，按完整路径去重
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for root in &self.roots {
            if records.len() >= query.max_results {
                break;
            }
            if !root.exists() {
                continue;
            }

            let budget = query.max_results - records.len();
            match self.tool.enumerate(root, &filter, budget) {
                Ok(output) => {
                    let found = parse_list_output(&output);
                    debug!("{} 下找到 {} 项", root.display(), found.len());
                    let fresh = found
                        .into_iter()
                        .filter(|r| seen.insert(r.full_path().to_string()))
                        .take(budget);
                    records.extend(fresh);
                }
                Err(e) => {
                    warn!("搜索路径 {} 时出错: {}", root.display(), e);
                }
            }
        }

        records.truncate(query.max_results);
        Ok(SearchOutcome::counted(records))
    }
}

/// 主目录、桌面、文档、下载，按此顺序；去重
pub fn default_roots() -> Vec<PathBuf> {
    let home = dirs::home_dir();
    let candidates = [
        home.clone(),
        dirs::desktop_dir().or_else(|| home.as_ref().map(|h| h.join("Desktop"))),
        dirs::document_dir().or_else(|| home.as_ref().map(|h| h.join("Documents"))),
        dirs::download_dir().or_else(|| home.as_ref().map(|h| h.join("Downloads"))),
    ];

    let mut roots: Vec<PathBuf> = Vec::new();
    for path in candidates.into_iter().flatten() {
        if !roots.contains(&path) {
            roots.push(path);
        }
    }
    roots
}

enum ParseState {
    Between,
    Accumulating(HashMap<String, String>),
}

/// 解析 `Format-List` 输出。
///
/// 每遇到 `FullName` 键或空行就结束当前块；缺少 `FullName` 的块被丢弃，不影响相邻块。
pub fn parse_list_output(output: &str) -> Vec<SearchRecord> {
    let mut records = Vec::new();
    let mut state = ParseState::Between;

    for line in output.lines() {
        let line = line.trim();

        if line.is_empty() {
            if let ParseState::Accumulating(block) = std::mem::replace(&mut state, ParseState::Between) {
                finish_block(block, &mut records);
            }
            continue;
        }

        // 没有冒号的行是被截断的续行，忽略
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();

        state = match state {
            ParseState::Accumulating(block) if key == KEY_FULL_NAME => {
                finish_block(block, &mut records);
                ParseState::Accumulating(HashMap::from([(key.to_string(), value)]))
            }
            ParseState::Accumulating(mut block) => {
                block.insert(key.to_string(), value);
                ParseState::Accumulating(block)
            }
            ParseState::Between => ParseState::Accumulating(HashMap::from([(key.to_string(), value)])),
        };
    }

    if let ParseState::Accumulating(block) = state {
        finish_block(block, &mut records);
    }
    records
}

fn finish_block(block: HashMap<String, String>, records: &mut Vec<SearchRecord>) {
    match record_from_block(&block) {
        Ok(record) => records.push(record),
        Err(e) => debug!("{}", e),
    }
}

fn record_from_block(block: &HashMap<String, String>) -> Result<SearchRecord, MalformedRecord> {
    let full_path = block
        .get(KEY_FULL_NAME)
        .filter(|p| !p.is_empty())
        .ok_or(MalformedRecord {
            missing_key: KEY_FULL_NAME,
        })?;

    let is_folder = block
        .get(KEY_ATTRIBUTES)
        .map(|a| a.contains("Directory"))
        .unwrap_or(false);

    let size = block
        .get(KEY_LENGTH)
        .filter(|l| !l.is_empty() && l.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|l| l.parse::<u64>().ok())
        .unwrap_or(0);

    let timestamp = |key: &str| block.get(key).and_then(|v| parse_timestamp(v));

    Ok(SearchRecord::from_full_path(full_path, is_folder)
        .with_size(size)
        .with_modified(timestamp(KEY_MODIFIED))
        .with_created(timestamp(KEY_CREATED)))
}

const ENUMERATE_SCRIPT: &str = r#"
[Console]::OutputEncoding = [System.Text.Encoding]::UTF8
$term = $env:EVERYSEARCH_TERM
Get-ChildItem -LiteralPath $env:EVERYSEARCH_ROOT -Recurse -Force -ErrorAction SilentlyContinue |
    Where-Object { __FILTER__ } |
    Select-Object -First ([int]$env:EVERYSEARCH_LIMIT) FullName, Name, DirectoryName, Length,
        @{Name='LastWriteTime'; Expression={ $_.LastWriteTime.ToString('o') }},
        @{Name='CreationTime'; Expression={ $_.CreationTime.ToString('o') }},
        Attributes |
    Format-List | Out-String -Width 4096
"#;

const CONTAINS_FILTER: &str =
    "$_.Name.IndexOf($term, [System.StringComparison]::OrdinalIgnoreCase) -ge 0";
const EXTENSION_FILTER: &str = "-not $_.PSIsContainer -and $_.Extension -eq ('.' + $term)";

struct PowerShellTool {
    probe_timeout: Duration,
    enumeration_timeout: Duration,
}

impl ShellTool for PowerShellTool {
    fn service_running(&self) -> bool {
        if !cfg!(windows) {
            return false;
        }
        let mut cmd = Command::new("sc");
        cmd.args(["query", "WSearch"]);
        match run_with_timeout(cmd, self.probe_timeout) {
            Ok(out) => out.stdout.contains("RUNNING"),
            Err(e) => {
                debug!("查询 WSearch 服务失败: {}", e);
                false
            }
        }
    }

    fn enumerate(&self, root: &Path, filter: &NameFilter, limit: usize) -> io::Result<String> {
        let (term, predicate) = match filter {
            NameFilter::Contains(text) => (text.as_str(), CONTAINS_FILTER),
            NameFilter::Extension(ext) => (ext.as_str(), EXTENSION_FILTER),
        };
        let script = ENUMERATE_SCRIPT.replace("__FILTER__", predicate);

        // 参数经环境变量传入，避免拼接进脚本
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script])
            .env("EVERYSEARCH_ROOT", root)
            .env("EVERYSEARCH_TERM", term)
            .env("EVERYSEARCH_LIMIT", limit.to_string());

        let out = run_with_timeout(cmd, self.enumeration_timeout)?;
        if !out.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("PowerShell 退出码 {:?}: {}", out.status.code(), out.stderr.trim()),
            ));
        }
        Ok(out.stdout)
    }
}
