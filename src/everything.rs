//! Everything SDK 后端
//!
//! 通过 `libloading` 加载 Everything64.dll / Everything32.dll，直接调用 SDK 导出函数。
//! 所有指针与缓冲区处理都封装在 [`EverythingDll`] 内，上层只面对 [`EverythingApi`]。

use chrono::{DateTime, Local, TimeZone, Utc};
use libloading::Library;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::SearchError;
use crate::searcher::SearchProvider;
use crate::types::{BackendTier, SearchOutcome, SearchQuery, SearchRecord};

// Everything_SetRequestFlags 请求字段
pub const REQUEST_FILE_NAME: u32 = 0x0000_0001;
pub const REQUEST_PATH: u32 = 0x0000_0002;
pub const REQUEST_EXTENSION: u32 = 0x0000_0008;
pub const REQUEST_SIZE: u32 = 0x0000_0010;
pub const REQUEST_DATE_CREATED: u32 = 0x0000_0020;
pub const REQUEST_DATE_MODIFIED: u32 = 0x0000_0040;
pub const REQUEST_DATE_ACCESSED: u32 = 0x0000_0080;

pub const SEARCH_REQUEST_FLAGS: u32 = REQUEST_FILE_NAME
    | REQUEST_PATH
    | REQUEST_EXTENSION
    | REQUEST_SIZE
    | REQUEST_DATE_CREATED
    | REQUEST_DATE_MODIFIED
    | REQUEST_DATE_ACCESSED;

/// FILETIME 每秒的 100ns 刻度数
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// 1601-01-01 到 1970-01-01 的秒数
pub const EPOCH_OFFSET_SECONDS: u64 = 11_644_473_600;

/// 将 FILETIME 原始值转换为 UTC 时间；0 表示无时间
pub fn filetime_to_utc(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let offset_ticks = (TICKS_PER_SECOND * EPOCH_OFFSET_SECONDS) as i128;
    let since_unix = ticks as i128 - offset_ticks;
    let secs = since_unix.div_euclid(TICKS_PER_SECOND as i128);
    let nanos = since_unix.rem_euclid(TICKS_PER_SECOND as i128) * 100;
    Utc.timestamp_opt(i64::try_from(secs).ok()?, nanos as u32)
        .single()
}

pub fn filetime_to_local(ticks: u64) -> Option<DateTime<Local>> {
    filetime_to_utc(ticks).map(|t| t.with_timezone(&Local))
}

/// 结果的三种时间字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Created,
    Modified,
    Accessed,
}

/// Everything SDK 的类型化适配接口，每个方法对应一个 SDK 调用
pub trait EverythingApi: Send + Sync {
    fn set_search(&self, query: &str);
    fn set_request_flags(&self, flags: u32);
    fn set_max(&self, max: u32);
    /// 同步执行查询
    fn execute(&self) -> bool;
    fn last_error(&self) -> u32;
    /// 当前可读取的结果行数（受 set_max 限制）
    fn num_results(&self) -> u32;
    /// 全部匹配数（不受 set_max 限制）
    fn total_results(&self) -> u32;
    fn file_name(&self, index: u32) -> Option<String>;
    fn path(&self, index: u32) -> Option<String>;
    fn extension(&self, index: u32) -> Option<String>;
    fn size(&self, index: u32) -> Option<u64>;
    /// 原始 FILETIME，读取失败返回 0
    fn date(&self, index: u32, field: DateField) -> u64;
    fn is_file(&self, index: u32) -> bool;
    fn is_folder(&self, index: u32) -> bool;
}

type LoadFn = dyn Fn() -> Result<Arc<dyn EverythingApi>, SearchError> + Send + Sync;

/// Everything 搜索后端
pub struct EverythingSearcher {
    loader: Box<LoadFn>,
    // 只加载一次；失败结果同样缓存
    api: OnceCell<Option<Arc<dyn EverythingApi>>>,
    // SDK 的查询状态是进程全局的，设置-执行-读取必须串行
    query_lock: Mutex<()>,
}

impl EverythingSearcher {
    /// 按候选路径加载 SDK，`preferred` 优先
    pub fn new(preferred: Option<PathBuf>) -> Self {
        let candidates = dll_candidates(preferred);
        Self::with_loader(move || EverythingDll::load_first(&candidates))
    }

    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn EverythingApi>, SearchError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            api: OnceCell::new(),
            query_lock: Mutex::new(()),
        }
    }

    fn api(&self) -> Option<&Arc<dyn EverythingApi>> {
        self.api
            .get_or_init(|| match (self.loader)() {
                Ok(api) => Some(api),
                Err(e) => {
                    warn!("Everything SDK 加载失败: {}", e);
                    None
                }
            })
            .as_ref()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // 锁只保护 SDK 调用顺序，中毒后继续使用即可
        self.query_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_row(api: &dyn EverythingApi, index: u32) -> SearchRecord {
        let is_folder = api.is_folder(index) && !api.is_file(index);
        let filename = api.file_name(index).unwrap_or_default();
        let directory = api.path(index).unwrap_or_default();

        let mut record = SearchRecord::new(&directory, &filename, is_folder);
        if let Some(ext) = api.extension(index) {
            record = record.with_extension(&ext);
        }
        record
            .with_size(api.size(index).unwrap_or(0))
            .with_created(filetime_to_local(api.date(index, DateField::Created)))
            .with_modified(filetime_to_local(api.date(index, DateField::Modified)))
            .with_accessed(filetime_to_local(api.date(index, DateField::Accessed)))
    }
}

impl SearchProvider for EverythingSearcher {
    fn tier(&self) -> BackendTier {
        BackendTier::NativeIndex
    }

    fn is_available(&self) -> bool {
        let Some(api) = self.api() else {
            return false;
        };
        let _guard = self.lock();
        // 执行一个空查询测试与 Everything 的 IPC 连接
        api.set_search("");
        api.set_max(1);
        let ok = api.execute();
        if !ok {
            warn!("Everything 未运行或 IPC 不可用 (错误码 {})", api.last_error());
        }
        ok
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchOutcome, SearchError> {
        let api = self
            .api()
            .ok_or_else(|| SearchError::unavailable("Everything SDK 未加载"))?;
        let max = u32::try_from(query.max_results).unwrap_or(u32::MAX);

        let _guard = self.lock();
        api.set_search(&query.text);
        api.set_request_flags(SEARCH_REQUEST_FLAGS);
        api.set_max(max);

        if !api.execute() {
            return Err(SearchError::query_failed(format!(
                "Everything 查询失败 (错误码 {})",
                api.last_error()
            )));
        }

        let total = api.total_results();
        let rows = total.min(max).min(api.num_results());
        debug!("Everything 命中 {} 条，读取 {} 条", total, rows);

        let records = (0..rows)
            .map(|i| Self::read_row(&**api, i))
            .collect();
        Ok(SearchOutcome::new(records, total as usize))
    }
}

/// SDK 候选路径：程序自带目录、默认安装目录、当前目录
pub fn dll_candidates(preferred: Option<PathBuf>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(p) = preferred {
        candidates.push(p);
    }

    let bundled = crate::config::install_dir().join("dll");
    candidates.push(bundled.join("Everything64.dll"));
    candidates.push(bundled.join("Everything32.dll"));

    candidates.push(PathBuf::from(r"C:\Program Files\Everything\Everything64.dll"));
    candidates.push(PathBuf::from(r"C:\Program Files (x86)\Everything\Everything32.dll"));
    candidates.push(PathBuf::from(r"C:\Program Files\Everything\Everything32.dll"));

    let cwd = std::env::current_dir().unwrap_or_default();
    candidates.push(cwd.join("Everything64.dll"));
    candidates.push(cwd.join("Everything32.dll"));
    candidates
}

type SetSearchW = unsafe extern "system" fn(*const u16);
type SetU32 = unsafe extern "system" fn(u32);
type QueryW = unsafe extern "system" fn(i32) -> i32;
type GetU32 = unsafe extern "system" fn() -> u32;
type GetStrW = unsafe extern "system" fn(u32) -> *const u16;
type GetI64 = unsafe extern "system" fn(u32, *mut i64) -> i32;
type GetU64 = unsafe extern "system" fn(u32, *mut u64) -> i32;
type IsKind = unsafe extern "system" fn(u32) -> i32;

/// 取出导出函数指针；符号借用在函数内结束
fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, libloading::Error> {
    // SAFETY: 调用方保证 T 与导出函数签名一致
    unsafe { Ok(*lib.get::<T>(name)?) }
}

/// 已加载的 SDK 函数表
struct EverythingDll {
    set_search: SetSearchW,
    set_request_flags: SetU32,
    set_max: SetU32,
    query: QueryW,
    get_last_error: GetU32,
    get_num_results: GetU32,
    get_tot_results: GetU32,
    get_file_name: GetStrW,
    get_path: GetStrW,
    get_extension: GetStrW,
    get_size: GetI64,
    get_date_created: GetU64,
    get_date_modified: GetU64,
    get_date_accessed: GetU64,
    is_file_result: IsKind,
    is_folder_result: IsKind,
    // 函数指针的有效期依赖库句柄，必须一起保存
    _lib: Library,
}

impl EverythingDll {
    fn load_first(candidates: &[PathBuf]) -> Result<Arc<dyn EverythingApi>, SearchError> {
        for path in candidates {
            match Self::load(path) {
                Ok(dll) => {
                    info!("成功载入 Everything SDK: {}", path.display());
                    return Ok(Arc::new(dll));
                }
                Err(e) => debug!("跳过 {}: {}", path.display(), e),
            }
        }
        let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        Err(SearchError::unavailable(format!(
            "找不到 Everything SDK，尝试的路径: {}",
            tried.join(", ")
        )))
    }

    fn load(path: &Path) -> Result<Self, libloading::Error> {
        // SAFETY: 只加载 Everything SDK，导出函数签名与官方头文件一致
        let lib = unsafe { Library::new(path)? };
        Ok(Self {
            set_search: symbol::<SetSearchW>(&lib, b"Everything_SetSearchW\0")?,
            set_request_flags: symbol::<SetU32>(&lib, b"Everything_SetRequestFlags\0")?,
            set_max: symbol::<SetU32>(&lib, b"Everything_SetMax\0")?,
            query: symbol::<QueryW>(&lib, b"Everything_QueryW\0")?,
            get_last_error: symbol::<GetU32>(&lib, b"Everything_GetLastError\0")?,
            get_num_results: symbol::<GetU32>(&lib, b"Everything_GetNumResults\0")?,
            get_tot_results: symbol::<GetU32>(&lib, b"Everything_GetTotResults\0")?,
            get_file_name: symbol::<GetStrW>(&lib, b"Everything_GetResultFileNameW\0")?,
            get_path: symbol::<GetStrW>(&lib, b"Everything_GetResultPathW\0")?,
            get_extension: symbol::<GetStrW>(&lib, b"Everything_GetResultExtensionW\0")?,
            get_size: symbol::<GetI64>(&lib, b"Everything_GetResultSize\0")?,
            get_date_created: symbol::<GetU64>(&lib, b"Everything_GetResultDateCreated\0")?,
            get_date_modified: symbol::<GetU64>(&lib, b"Everything_GetResultDateModified\0")?,
            get_date_accessed: symbol::<GetU64>(&lib, b"Everything_GetResultDateAccessed\0")?,
            is_file_result: symbol::<IsKind>(&lib, b"Everything_IsFileResult\0")?,
            is_folder_result: symbol::<IsKind>(&lib, b"Everything_IsFolderResult\0")?,
            _lib: lib,
        })
    }

    fn read_wide(&self, f: GetStrW, index: u32) -> Option<String> {
        // SAFETY: SDK 返回以 0 结尾的 UTF-16 字符串，在下一次查询前有效
        unsafe {
            let ptr = f(index);
            if ptr.is_null() {
                return None;
            }
            let mut len = 0;
            while *ptr.add(len) != 0 {
                len += 1;
            }
            Some(String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len)))
        }
    }
}

impl EverythingApi for EverythingDll {
    fn set_search(&self, query: &str) {
        let wide: Vec<u16> = query.encode_utf16().chain(std::iter::once(0)).collect();
        // SAFETY: SDK 会复制字符串，调用结束后缓冲区可以释放
        unsafe { (self.set_search)(wide.as_ptr()) }
    }

    fn set_request_flags(&self, flags: u32) {
        unsafe { (self.set_request_flags)(flags) }
    }

    fn set_max(&self, max: u32) {
        unsafe { (self.set_max)(max) }
    }

    fn execute(&self) -> bool {
        unsafe { (self.query)(1) != 0 }
    }

    fn last_error(&self) -> u32 {
        unsafe { (self.get_last_error)() }
    }

    fn num_results(&self) -> u32 {
        unsafe { (self.get_num_results)() }
    }

    fn total_results(&self) -> u32 {
        unsafe { (self.get_tot_results)() }
    }

    fn file_name(&self, index: u32) -> Option<String> {
        self.read_wide(self.get_file_name, index)
    }

    fn path(&self, index: u32) -> Option<String> {
        self.read_wide(self.get_path, index)
    }

    fn extension(&self, index: u32) -> Option<String> {
        self.read_wide(self.get_extension, index)
    }

    fn size(&self, index: u32) -> Option<u64> {
        let mut size: i64 = 0;
        let ok = unsafe { (self.get_size)(index, &mut size) } != 0;
        if ok {
            u64::try_from(size).ok()
        } else {
            None
        }
    }

    fn date(&self, index: u32, field: DateField) -> u64 {
        let f = match field {
            DateField::Created => self.get_date_created,
            DateField::Modified => self.get_date_modified,
            DateField::Accessed => self.get_date_accessed,
        };
        let mut ticks: u64 = 0;
        let ok = unsafe { f(index, &mut ticks) } != 0;
        if ok {
            ticks
        } else {
            0
        }
    }

    fn is_file(&self, index: u32) -> bool {
        unsafe { (self.is_file_result)(index) != 0 }
    }

    fn is_folder(&self, index: u32) -> bool {
        unsafe { (self.is_folder_result)(index) != 0 }
    }
}
