use chrono::{DateTime, Local};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SearchError;
use crate::process::run_with_timeout;
use crate::searcher::SearchProvider;
use crate::types::{parse_timestamp, BackendTier, SearchOutcome, SearchQuery, SearchRecord};

pub const FIELD_PATH: &str = "System.ItemPathDisplay";
pub const FIELD_NAME: &str = "System.FileName";
pub const FIELD_SIZE: &str = "System.Size";
pub const FIELD_MODIFIED: &str = "System.DateModified";
pub const FIELD_CREATED: &str = "System.DateCreated";
pub const FIELD_KIND: &str = "System.Kind";

const PROVIDER: &str = "Provider=Search.CollatorDSO;Extended Properties='Application=Windows';";

/// 记录集中的一个字段值
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Null,
}

impl FieldValue {
    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    fn as_size(&self) -> Option<u64> {
        match self {
            Self::Integer(n) => u64::try_from(*n).ok(),
            Self::Float(f) if *f >= 0.0 => Some(*f as u64),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Float(_) | Self::Null => None,
        }
    }

    fn as_datetime(&self) -> Option<DateTime<Local>> {
        self.as_text().and_then(parse_timestamp)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Integer(b as i64),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Value::String(s) => Self::Text(s),
            other => Self::Text(other.to_string()),
        }
    }
}

/// 记录集中的一行，按字段名取值
#[derive(Debug, Clone, Default)]
pub struct Row {
    fields: HashMap<String, FieldValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// 只进游标
pub trait RecordCursor {
    fn next_row(&mut self) -> Result<Option<Row>, SearchError>;
}

/// 索引服务的连接与查询能力
pub trait RecordSource: Send + Sync {
    /// 握手：连接索引目录并取得查询辅助对象
    fn connect(&self) -> Result<(), SearchError>;

    fn open(&self, sql: &str) -> Result<Box<dyn RecordCursor>, SearchError>;
}

/// 构造 SystemIndex 查询。空查询返回 None
pub fn build_query(term: &str, max_results: usize) -> Option<String> {
    let clean = term.replace('\'', "''");
    let clean = clean.trim();
    if clean.is_empty() {
        return None;
    }
    Some(format!(
        "SELECT TOP {max_results} {FIELD_PATH}, {FIELD_NAME}, {FIELD_SIZE}, {FIELD_MODIFIED}, \
         {FIELD_CREATED}, {FIELD_KIND} FROM SystemIndex \
         WHERE CONTAINS({FIELD_NAME}, '\"{clean}\"') OR {FIELD_NAME} LIKE '%{clean}%' \
         ORDER BY {FIELD_MODIFIED} DESC"
    ))
}

/// 把一行转换为结果；缺少路径的行返回 None
pub fn record_from_row(row: &Row) -> Option<SearchRecord> {
    let full_path = row.field(FIELD_PATH).and_then(FieldValue::as_text)?;

    let is_folder = match row.field(FIELD_KIND).and_then(FieldValue::as_text) {
        // Kind 可能是多值，已合并为 "a;b"
        Some(kind) => kind.to_lowercase().contains("folder"),
        None => Path::new(full_path).is_dir(),
    };

    let size = row
        .field(FIELD_SIZE)
        .and_then(FieldValue::as_size)
        .unwrap_or(0);

    Some(
        SearchRecord::from_full_path(full_path, is_folder)
            .with_size(size)
            .with_modified(row.field(FIELD_MODIFIED).and_then(FieldValue::as_datetime))
            .with_created(row.field(FIELD_CREATED).and_then(FieldValue::as_datetime)),
    )
}

/// Windows Search 后端（SystemIndex）
pub struct WindowsSearcher {
    source: Box<dyn RecordSource>,
    connected: OnceCell<bool>,
}

impl WindowsSearcher {
    pub fn new(connect_timeout: Duration, query_timeout: Duration) -> Self {
        Self::with_source(Box::new(AdoBridge::new(connect_timeout, query_timeout)))
    }

    pub fn with_source(source: Box<dyn RecordSource>) -> Self {
        Self {
            source,
            connected: OnceCell::new(),
        }
    }

    /// 连接只尝试一次，结果缓存
    fn ensure_connected(&self) -> bool {
        *self.connected.get_or_init(|| match self.source.connect() {
            Ok(()) => {
                info!("✓ Windows Search API 连接成功");
                true
            }
            Err(e) => {
                warn!("⚠ Windows Search API 连接失败: {}", e);
                false
            }
        })
    }

    fn collect(&self, sql: &str, max_results: usize) -> Result<Vec<SearchRecord>, SearchError> {
        let mut cursor = self.source.open(sql)?;
        let mut records = Vec::new();
        while records.len() < max_results {
            let Some(row) = cursor.next_row()? else {
                break;
            };
            match record_from_row(&row) {
                Some(record) => records.push(record),
                None => debug!("跳过缺少 {} 的记录", FIELD_PATH),
            }
        }
        Ok(records)
    }
}

impl SearchProvider for WindowsSearcher {
    fn tier(&self) -> BackendTier {
        BackendTier::OsIndexed
    }

    fn is_available(&self) -> bool {
        self.ensure_connected()
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, SearchError> {
        if !self.ensure_connected() {
            return Err(SearchError::query_failed("Windows Search 服务未连接"));
        }
        let Some(sql) = build_query(&query.text, query.max_results) else {
            return Ok(SearchOutcome::empty());
        };

        // 单次查询失败返回空结果，不向上传播
        match self.collect(&sql, query.max_results) {
            Ok(records) => {
                debug!("Windows Search API 找到 {} 个结果", records.len());
                Ok(SearchOutcome::counted(records))
            }
            Err(e) => {
                warn!("Windows Search API 搜索失败: {}", e);
                Ok(SearchOutcome::empty())
            }
        }
    }
}

const HANDSHAKE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$conn = New-Object -ComObject ADODB.Connection
$conn.Open($env:EVERYSEARCH_PROVIDER)
$conn.Close()
$manager = New-Object -ComObject Microsoft.Search.Interop.CSearchManager
$helper = $manager.GetCatalog('SystemIndex').GetQueryHelper()
if ($null -eq $helper) { exit 1 }
Write-Output 'OK'
"#;

const QUERY_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
[Console]::OutputEncoding = [System.Text.Encoding]::UTF8
$conn = New-Object -ComObject ADODB.Connection
$conn.Open($env:EVERYSEARCH_PROVIDER)
$rs = New-Object -ComObject ADODB.Recordset
$rs.Open($env:EVERYSEARCH_SQL, $conn)
while (-not $rs.EOF) {
    $row = [ordered]@{}
    foreach ($f in $rs.Fields) {
        $v = $f.Value
        if ($null -eq $v -or $v -is [System.DBNull]) { $row[$f.Name] = $null }
        elseif ($v -is [datetime]) { $row[$f.Name] = $v.ToString('o') }
        elseif ($v -is [array]) { $row[$f.Name] = ($v -join ';') }
        else { $row[$f.Name] = $v }
    }
    $row | ConvertTo-Json -Compress
    $rs.MoveNext()
}
$rs.Close()
$conn.Close()
"#;

/// 通过 PowerShell 驱动 ADO 记录集，每行输出一个 JSON 对象
pub struct AdoBridge {
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl AdoBridge {
    /// 握手用较短的探测超时，查询包含 PowerShell 冷启动，单独给超时
    pub fn new(connect_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            query_timeout,
        }
    }

    fn timeout_for(&self, sql: Option<&str>) -> Duration {
        if sql.is_some() {
            self.query_timeout
        } else {
            self.connect_timeout
        }
    }

    fn powershell(&self, script: &str, sql: Option<&str>) -> Result<String, SearchError> {
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", script])
            .env("EVERYSEARCH_PROVIDER", PROVIDER);
        if let Some(sql) = sql {
            cmd.env("EVERYSEARCH_SQL", sql);
        }

        let output = run_with_timeout(cmd, self.timeout_for(sql))
            .map_err(|e| SearchError::unavailable(format!("无法启动 PowerShell: {}", e)))?;
        if !output.success() {
            return Err(SearchError::query_failed(format!(
                "PowerShell 退出码 {:?}: {}",
                output.status.code(),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl RecordSource for AdoBridge {
    fn connect(&self) -> Result<(), SearchError> {
        if !cfg!(windows) {
            return Err(SearchError::unavailable("Windows Search 仅在 Windows 上可用"));
        }
        let out = self
            .powershell(HANDSHAKE_SCRIPT, None)
            .map_err(|e| SearchError::unavailable(e.to_string()))?;
        if out.trim() == "OK" {
            Ok(())
        } else {
            Err(SearchError::unavailable(format!("握手返回异常: {}", out.trim())))
        }
    }

    fn open(&self, sql: &str) -> Result<Box<dyn RecordCursor>, SearchError> {
        let out = self.powershell(QUERY_SCRIPT, Some(sql))?;
        let lines: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        Ok(Box::new(JsonLineCursor {
            lines: lines.into_iter(),
        }))
    }
}

struct JsonLineCursor {
    lines: std::vec::IntoIter<String>,
}

impl RecordCursor for JsonLineCursor {
    fn next_row(&mut self) -> Result<Option<Row>, SearchError> {
        let Some(line) = self.lines.next() else {
            return Ok(None);
        };
        let value: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&line)
            .map_err(|e| SearchError::query_failed(format!("无法解析记录: {}", e)))?;

        let row = value
            .into_iter()
            .fold(Row::new(), |row, (name, v)| row.with(&name, FieldValue::from(v)));
        Ok(Some(row))
    }
}
