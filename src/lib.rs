//! 本机文件搜索服务：按 Everything SDK → Windows Search → PowerShell 遍历 → 示范数据
//! 的顺序探测后端，固定第一个可用的后端，对外提供统一的搜索结果。

pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod everything;
pub mod instance;
pub mod process;
pub mod searcher;
pub mod server;
pub mod simple_search;
pub mod types;
pub mod windows_search;

pub use error::{InstanceError, SearchError};
pub use searcher::{SearchBackend, SearchProvider};
pub use types::{BackendTier, SearchOutcome, SearchQuery, SearchRecord};
