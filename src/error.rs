use std::path::PathBuf;

/// 搜索后端错误。后端内部错误在越过后端边界前统一转换为这两类
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    /// 探测阶段：后端不存在或无法连接
    #[error("搜索后端不可用: {0}")]
    BackendUnavailable(String),
    /// 运行阶段：单次查询失败，不影响进程
    #[error("查询失败: {0}")]
    QueryFailed(String),
}

impl SearchError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn query_failed(msg: impl Into<String>) -> Self {
        Self::QueryFailed(msg.into())
    }
}

/// 目录遍历输出中缺少完整路径的记录块
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("记录缺少 {missing_key} 字段，已丢弃")]
pub struct MalformedRecord {
    pub missing_key: &'static str,
}

/// 单实例检测失败，进程应以对应退出码结束
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("已有另一个实例正在运行（锁文件 {} 已被占用）", path.display())]
    ProcessLockHeld { path: PathBuf },

    #[error("端口 {addr} 已被占用，无法启动服务: {source}")]
    PortUnavailable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("无法打开锁文件 {}: {source}", path.display())]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstanceError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ProcessLockHeld { .. } => 2,
            Self::PortUnavailable { .. } => 3,
            Self::LockIo { .. } => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let held = InstanceError::ProcessLockHeld { path: PathBuf::from("x.lock") };
        let port = InstanceError::PortUnavailable {
            addr: "127.0.0.1:5000".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(held.exit_code(), 2);
        assert_eq!(port.exit_code(), 3);
        assert!(port.to_string().contains("127.0.0.1:5000"));
    }
}
