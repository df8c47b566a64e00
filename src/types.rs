use chrono::{DateTime, Local, NaiveDateTime};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// 搜索结果条目（所有后端统一的结果结构）
///
/// 构造后不可变，字段只能通过访问器读取。
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRecord {
    filename: String,
    directory: String,
    full_path: String,
    extension: String,
    size_bytes: u64,
    created_at: Option<DateTime<Local>>,
    modified_at: Option<DateTime<Local>>,
    accessed_at: Option<DateTime<Local>>,
    is_folder: bool,
}

impl SearchRecord {
    /// 由目录和文件名构造，自动拼接完整路径并推导扩展名
    pub fn new(directory: &str, filename: &str, is_folder: bool) -> Self {
        let sep = separator_for(directory);
        let trimmed = directory.trim_end_matches(['\\', '/']);

        let full_path = if trimmed.is_empty() && !directory.is_empty() {
            // 根目录 "/" 或 "\"
            format!("{}{}", sep, filename)
        } else if trimmed.is_empty() {
            filename.to_string()
        } else if filename.is_empty() {
            trimmed.to_string()
        } else {
            format!("{}{}{}", trimmed, sep, filename)
        };

        let extension = if is_folder {
            String::new()
        } else {
            extension_of(filename)
        };

        Self {
            filename: filename.to_string(),
            directory: trimmed.to_string(),
            full_path,
            extension,
            size_bytes: 0,
            created_at: None,
            modified_at: None,
            accessed_at: None,
            is_folder,
        }
    }

    /// 由完整路径构造（按最后一个分隔符拆分目录与文件名）
    pub fn from_full_path(full_path: &str, is_folder: bool) -> Self {
        let full_path = full_path.trim();
        let stripped = full_path.trim_end_matches(['\\', '/']);
        let stripped = if stripped.is_empty() { full_path } else { stripped };

        match stripped.rfind(['\\', '/']) {
            Some(idx) => {
                let (dir, name) = stripped.split_at(idx);
                let name = &name[1..];
                // "C:\foo" 拆分后目录为 "C:"，保留分隔符以便重新拼接
                let dir = if dir.is_empty() { &stripped[..1] } else { dir };
                let dir_owned = if dir.ends_with(':') {
                    format!("{}{}", dir, &stripped[idx..idx + 1])
                } else {
                    dir.to_string()
                };
                let mut record = Self::new(&dir_owned, name, is_folder);
                record.full_path = stripped.to_string();
                record
            }
            None => Self::new("", stripped, is_folder),
        }
    }

    /// 使用后端直接报告的扩展名（目录始终为空）
    pub fn with_extension(mut self, extension: &str) -> Self {
        if !self.is_folder {
            self.extension = extension.trim_start_matches('.').to_lowercase();
        }
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = if self.is_folder { 0 } else { size_bytes };
        self
    }

    pub fn with_created(mut self, at: Option<DateTime<Local>>) -> Self {
        self.created_at = at;
        self
    }

    pub fn with_modified(mut self, at: Option<DateTime<Local>>) -> Self {
        self.modified_at = at;
        self
    }

    pub fn with_accessed(mut self, at: Option<DateTime<Local>>) -> Self {
        self.accessed_at = at;
        self
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn created_at(&self) -> Option<DateTime<Local>> {
        self.created_at
    }

    pub fn modified_at(&self) -> Option<DateTime<Local>> {
        self.modified_at
    }

    pub fn accessed_at(&self) -> Option<DateTime<Local>> {
        self.accessed_at
    }

    pub fn is_file(&self) -> bool {
        !self.is_folder
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    pub fn size_str(&self) -> String {
        format_size(self.size_bytes)
    }
}

impl Serialize for SearchRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let iso = |t: &Option<DateTime<Local>>| t.map(|t| t.to_rfc3339());

        let mut s = serializer.serialize_struct("SearchRecord", 11)?;
        s.serialize_field("filename", &self.filename)?;
        s.serialize_field("path", &self.directory)?;
        s.serialize_field("full_path", &self.full_path)?;
        s.serialize_field("extension", &self.extension)?;
        s.serialize_field("size", &self.size_bytes)?;
        s.serialize_field("size_formatted", &self.size_str())?;
        s.serialize_field("date_created", &iso(&self.created_at))?;
        s.serialize_field("date_modified", &iso(&self.modified_at))?;
        s.serialize_field("date_accessed", &iso(&self.accessed_at))?;
        s.serialize_field("is_file", &self.is_file())?;
        s.serialize_field("is_folder", &self.is_folder)?;
        s.end()
    }
}

fn separator_for(directory: &str) -> char {
    if directory.contains('\\') {
        '\\'
    } else if directory.contains('/') {
        '/'
    } else {
        std::path::MAIN_SEPARATOR
    }
}

/// 取最后一个 '.' 之后的部分；以 '.' 开头的隐藏文件名不算扩展名
fn extension_of(filename: &str) -> String {
    let stem = filename.trim_start_matches('.');
    match stem.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => String::new(),
    }
}

/// 外部工具输出的本地时间格式（不带时区）
const LOCAL_TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

/// 解析外部工具给出的时间文本：先按 RFC 3339，再按常见本地格式。无法解析返回 None
pub fn parse_timestamp(text: &str) -> Option<DateTime<Local>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Local));
    }
    LOCAL_TIME_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(text, fmt)
            .ok()
            .and_then(|naive| naive.and_local_timezone(Local).earliest())
    })
}

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// 按 1024 进制格式化文件大小，保留一位小数
pub fn format_size(size_bytes: u64) -> String {
    if size_bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = size_bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, SIZE_UNITS[unit])
}

/// 一次搜索请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub max_results: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, max_results: usize) -> Self {
        Self {
            text: text.into(),
            max_results,
        }
    }

    /// `*.ext` 形式的扩展名通配，返回小写的 ext
    pub fn extension_wildcard(&self) -> Option<String> {
        let text = self.text.trim();
        let ext = text.strip_prefix("*.")?;
        if ext.is_empty() || ext.contains(['*', '?', '\\', '/']) {
            return None;
        }
        Some(ext.to_lowercase())
    }
}

/// 后端返回的结果：`total_matched` 可能大于 `records.len()`
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub records: Vec<SearchRecord>,
    pub total_matched: usize,
}

impl SearchOutcome {
    pub fn new(records: Vec<SearchRecord>, total_matched: usize) -> Self {
        Self {
            records,
            total_matched,
        }
    }

    /// 无法得知真实总数的后端：总数即实际返回条数
    pub fn counted(records: Vec<SearchRecord>) -> Self {
        let total_matched = records.len();
        Self {
            records,
            total_matched,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// 后端层级。声明顺序即优先级由低到高，`NativeIndex` 最高
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum BackendTier {
    Demo,
    FilesystemTool,
    OsIndexed,
    NativeIndex,
}

impl BackendTier {
    /// 探测顺序：从最好到最差
    pub const PRIORITY: [BackendTier; 4] = [
        BackendTier::NativeIndex,
        BackendTier::OsIndexed,
        BackendTier::FilesystemTool,
        BackendTier::Demo,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::NativeIndex => "NativeIndex",
            Self::OsIndexed => "OsIndexed",
            Self::FilesystemTool => "FilesystemTool",
            Self::Demo => "Demo",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::NativeIndex => "Everything 索引已连接",
            Self::OsIndexed => "使用 Windows Search 索引",
            Self::FilesystemTool => "使用 PowerShell 目录遍历",
            Self::Demo => "示范模式 - 使用模拟数据",
        }
    }
}

impl std::fmt::Display for BackendTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// 当前激活后端的状态
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub tier: BackendTier,
    pub label: &'static str,
    pub message: &'static str,
    pub demo_mode: bool,
}

impl From<BackendTier> for BackendStatus {
    fn from(tier: BackendTier) -> Self {
        Self {
            tier,
            label: tier.label(),
            message: tier.description(),
            demo_mode: tier == BackendTier::Demo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1), "1.0 B");
        assert_eq!(format_size(1023), "1023.0 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1_048_576), "1.0 MB");
        assert_eq!(format_size(1_073_741_824), "1.0 GB");
        assert_eq!(format_size(1u64 << 40), "1.0 TB");
        // 超过 TB 仍以 TB 显示
        assert_eq!(format_size(1u64 << 50), "1024.0 TB");
    }

    #[test]
    fn test_record_paths() {
        let r = SearchRecord::new("D:\\Work\\pyeverything\\", "App.PY", false);
        assert_eq!(r.directory(), "D:\\Work\\pyeverything");
        assert_eq!(r.full_path(), "D:\\Work\\pyeverything\\App.PY");
        assert_eq!(r.extension(), "py");
        assert!(r.is_file() && !r.is_folder());

        let r = SearchRecord::new("/home/user", "notes", false);
        assert_eq!(r.full_path(), "/home/user/notes");
        assert_eq!(r.extension(), "");

        let r = SearchRecord::new("/", "etc", true);
        assert_eq!(r.full_path(), "/etc");
        assert_eq!(r.directory(), "");
    }

    #[test]
    fn test_folder_has_no_extension_or_size() {
        let r = SearchRecord::new("C:\\Users", "my.folder", true)
            .with_extension("folder")
            .with_size(4096);
        assert_eq!(r.extension(), "");
        assert_eq!(r.size_bytes(), 0);
        assert!(r.is_folder() && !r.is_file());
    }

    #[test]
    fn test_hidden_file_extension() {
        assert_eq!(SearchRecord::new("/x", ".gitignore", false).extension(), "");
        assert_eq!(SearchRecord::new("/x", ".env.local", false).extension(), "local");
        assert_eq!(SearchRecord::new("/x", "a.tar.GZ", false).extension(), "gz");
    }

    #[test]
    fn test_from_full_path() {
        let r = SearchRecord::from_full_path("C:\\Users\\User\\Desktop\\notes.txt", false);
        assert_eq!(r.filename(), "notes.txt");
        assert_eq!(r.directory(), "C:\\Users\\User\\Desktop");
        assert_eq!(r.full_path(), "C:\\Users\\User\\Desktop\\notes.txt");

        let r = SearchRecord::from_full_path("C:\\boot.ini", false);
        assert_eq!(r.filename(), "boot.ini");
        assert_eq!(r.full_path(), "C:\\boot.ini");

        let r = SearchRecord::from_full_path("/var/log/", true);
        assert_eq!(r.filename(), "log");
        assert_eq!(r.directory(), "/var");
        assert_eq!(r.full_path(), "/var/log");
    }

    #[test]
    fn test_parse_timestamp() {
        let t = parse_timestamp("2024-03-01T10:20:30.1234567+08:00").unwrap();
        assert_eq!(t.timestamp(), 1_709_259_630);

        let local = parse_timestamp("2024-03-01T10:20:30.0000000").unwrap();
        assert_eq!(local.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-01 10:20:30");
        assert!(parse_timestamp("2024/03/01 10:20:30").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_extension_wildcard() {
        assert_eq!(SearchQuery::new("*.TXT", 10).extension_wildcard().as_deref(), Some("txt"));
        assert_eq!(SearchQuery::new("*.", 10).extension_wildcard(), None);
        assert_eq!(SearchQuery::new("txt", 10).extension_wildcard(), None);
        assert_eq!(SearchQuery::new("*.t*", 10).extension_wildcard(), None);
    }

    #[test]
    fn test_record_json_shape() {
        let r = SearchRecord::new("C:\\Users\\User\\Desktop", "notes.txt", false).with_size(1536);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["path"], "C:\\Users\\User\\Desktop");
        assert_eq!(v["size"], 1536);
        assert_eq!(v["size_formatted"], "1.5 KB");
        assert!(v["date_modified"].is_null());
        assert_eq!(v["is_file"], true);
    }

    #[test]
    fn test_tier_priority_order() {
        assert!(BackendTier::NativeIndex > BackendTier::OsIndexed);
        assert!(BackendTier::OsIndexed > BackendTier::FilesystemTool);
        assert!(BackendTier::FilesystemTool > BackendTier::Demo);
        assert_eq!(BackendTier::PRIORITY[0], BackendTier::NativeIndex);
    }
}
