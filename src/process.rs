use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// 子进程输出（已解码）
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// 运行外部工具，超时后强制结束并返回 `TimedOut`
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> io::Result<ToolOutput> {
    hide_console(&mut command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    // 管道必须并行读取，否则输出过大时子进程会阻塞在写入上
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("子进程超过 {:?} 未结束，已终止", timeout),
            ));
        }
        thread::sleep(Duration::from_millis(20));
    };

    let collect = |reader: Option<thread::JoinHandle<Vec<u8>>>| {
        reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };

    Ok(ToolOutput {
        status,
        stdout: decode_output(&collect(stdout_reader)),
        stderr: decode_output(&collect(stderr_reader)),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// 智能检测编码：先尝试 UTF-8，失败则按 GBK 解码（中文系统控制台默认代码页）
pub fn decode_output(bytes: &[u8]) -> String {
    let (decoded_utf8, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if !had_errors {
        return decoded_utf8.into_owned();
    }
    let (decoded_gbk, _, _) = encoding_rs::GBK.decode(bytes);
    decoded_gbk.into_owned()
}

#[cfg(windows)]
fn hide_console(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_command: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode_output("搜索".as_bytes()), "搜索");
    }

    #[test]
    fn test_decode_gbk_fallback() {
        let (gbk, _, _) = encoding_rs::GBK.encode("文档");
        assert_eq!(decode_output(&gbk), "文档");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_collects_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; echo oops 1>&2"]);
        let out = run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let err = run_with_timeout(cmd, Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_tool_is_error() {
        let cmd = Command::new("definitely-not-a-real-tool-everysearch");
        assert!(run_with_timeout(cmd, Duration::from_secs(1)).is_err());
    }
}
