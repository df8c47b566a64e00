use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::InstanceError;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// 单实例守卫：持有锁文件的独占锁，drop 时释放
///
/// 锁文件本身不删除，只释放锁。下一个实例直接复用该文件。
#[derive(Debug)]
pub struct InstanceGuard {
    file: File,
    path: PathBuf,
}

impl InstanceGuard {
    /// 依次检查锁文件和监听端口，两者都通过才返回守卫。
    ///
    /// 端口检查只绑定后立即释放，真正的监听在之后进行。端口检查失败时锁随守卫一起释放。
    pub fn acquire(
        lock_path: &Path,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, InstanceError> {
        let guard = Self::lock(lock_path, timeout)?;
        probe_port(host, port)?;
        info!("✓ 单实例检查通过 (锁文件 {})", lock_path.display());
        Ok(guard)
    }

    /// 只获取锁文件
    pub fn lock(lock_path: &Path, timeout: Duration) -> Result<Self, InstanceError> {
        let io_err = |source| InstanceError::LockIo {
            path: lock_path.to_path_buf(),
            source,
        };

        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(io_err)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if Instant::now() < deadline => {
                    debug!("锁文件被占用，重试: {}", e);
                    thread::sleep(RETRY_INTERVAL);
                }
                Err(_) => {
                    return Err(InstanceError::ProcessLockHeld {
                        path: lock_path.to_path_buf(),
                    });
                }
            }
        }

        // 写入 pid 只用于排查，失败不影响加锁结果
        if let Err(e) = write_pid(&mut file) {
            warn!("无法写入 pid 到 {}: {}", lock_path.display(), e);
        }

        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => debug!("已释放锁文件 {}", self.path.display()),
            Err(e) => warn!("释放锁文件 {} 失败: {}", self.path.display(), e),
        }
    }
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

/// 绑定一次端口确认可用，随即释放
pub fn probe_port(host: &str, port: u16) -> Result<(), InstanceError> {
    let addr = format!("{}:{}", host, port);
    match TcpListener::bind(&addr) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(source) => Err(InstanceError::PortUnavailable { addr, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_fails_and_keeps_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let first = InstanceGuard::lock(&path, Duration::from_millis(100)).unwrap();
        let err = InstanceGuard::lock(&path, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, InstanceError::ProcessLockHeld { .. }));
        assert_eq!(err.exit_code(), 2);

        // 第一次持有的锁仍然有效
        let again = InstanceGuard::lock(&path, Duration::ZERO);
        assert!(again.is_err());
        assert_eq!(first.path(), path.as_path());

        drop(first);
        assert!(InstanceGuard::lock(&path, Duration::ZERO).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_lock_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.lock");
        drop(InstanceGuard::lock(&path, Duration::ZERO).unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn test_busy_port_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = InstanceGuard::acquire(&path, "127.0.0.1", port, Duration::ZERO).unwrap_err();
        assert!(matches!(err, InstanceError::PortUnavailable { .. }));
        assert_eq!(err.exit_code(), 3);

        // 端口检查失败后锁已释放
        assert!(InstanceGuard::lock(&path, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_free_port_acquires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.lock");
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let guard = InstanceGuard::acquire(&path, "127.0.0.1", port, Duration::ZERO).unwrap();
        // 端口已立即释放，可以再次绑定
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
        drop(guard);
    }
}
