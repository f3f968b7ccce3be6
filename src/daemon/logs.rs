//! Poll-based log tailing. The stable `<name>.log` path is a symlink that
//! gets replaced on rotation, so growth is detected by re-stat'ing the path
//! instead of OS-level file-change notification.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{GpmError, Result};
use crate::paths::Paths;
use crate::service::LogPolicy;

const POLL_INTERVAL: Duration = Duration::from_millis(300);
const CHANNEL_DEPTH: usize = 256;

/// One emitted log line. A line carrying `error` terminates the stream.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub text: String,
    pub timestamp: i64,
    pub error: Option<String>,
}

/// Tail the service's stable log path. With a positive `offset_bytes`
/// smaller than the current file size the tail starts `offset_bytes` from
/// the end, otherwise from the beginning. With `follow` the task keeps
/// polling for growth until the receiver is dropped.
pub async fn watch(
    paths: &Paths,
    name: &str,
    offset_bytes: u64,
    follow: bool,
) -> Result<mpsc::Receiver<LogLine>> {
    let path = paths.log_link(name);
    if tokio::fs::symlink_metadata(&path).await.is_err() {
        return Err(GpmError::NotFound(format!("no log file for '{name}'")));
    }

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::spawn(tail_loop(path, offset_bytes, follow, tx));
    Ok(rx)
}

async fn tail_loop(path: PathBuf, offset_bytes: u64, follow: bool, tx: mpsc::Sender<LogLine>) {
    let mut pos = match start_offset(&path, offset_bytes).await {
        Ok(pos) => pos,
        Err(e) => {
            let _ = tx.send(error_line(e)).await;
            return;
        }
    };
    // Partial trailing line carried between polls.
    let mut carry = String::new();
    let mut skip_partial = pos > 0;

    loop {
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                let _ = tx.send(error_line(e.into())).await;
                return;
            }
        };

        // Rotation: the symlink now points at a smaller (new) file.
        if len < pos {
            debug!("Log {} rotated, restarting from offset 0", path.display());
            pos = 0;
            carry.clear();
            skip_partial = false;
        }

        if len > pos {
            match read_from(&path, pos).await {
                Ok(bytes) => {
                    pos += bytes.len() as u64;
                    carry.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(idx) = carry.find('\n') {
                        let line: String = carry.drain(..=idx).collect();
                        let text = line.trim_end_matches('\n').to_string();
                        if skip_partial {
                            // Seeking into the middle of the file lands in
                            // the middle of a line; drop the fragment.
                            skip_partial = false;
                            continue;
                        }
                        if tx
                            .send(LogLine {
                                text,
                                timestamp: chrono::Utc::now().timestamp(),
                                error: None,
                            })
                            .await
                            .is_err()
                        {
                            return; // subscriber cancelled
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(error_line(e)).await;
                    return;
                }
            }
        }

        if pos >= len {
            if !follow {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            if tx.is_closed() {
                return;
            }
        }
    }
}

async fn start_offset(path: &PathBuf, offset_bytes: u64) -> Result<u64> {
    let size = tokio::fs::metadata(path).await?.len();
    if offset_bytes > 0 && offset_bytes < size {
        Ok(size - offset_bytes)
    } else {
        Ok(0)
    }
}

async fn read_from(path: &PathBuf, pos: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(pos)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Enforce one service's log policy.
///
/// Size rotation is copy-then-truncate: the active file is copied to an
/// archive sibling and truncated in place, because the writing child holds
/// an `O_APPEND` fd that must stay valid. Tail loops observe the shrink as
/// a rotation and restart from offset 0. Retention prunes archived and
/// stale dated logs past `expire_days`; the active file and the stable
/// symlink are never pruned.
pub fn enforce_policy(paths: &Paths, name: &str, policy: &LogPolicy) -> Result<()> {
    if policy.max_size == 0 && policy.expire_days == 0 {
        return Ok(());
    }
    let link = paths.log_link(name);
    let active = std::fs::read_link(&link).ok();

    if policy.max_size > 0 {
        if let Some(target) = &active {
            if let Ok(meta) = std::fs::metadata(target) {
                if meta.len() > policy.max_size {
                    let ts = chrono::Local::now().format("%Y%m%d%H%M%S");
                    let archived = target.with_extension(format!("{ts}.log"));
                    std::fs::copy(target, &archived)?;
                    std::fs::OpenOptions::new()
                        .write(true)
                        .open(target)?
                        .set_len(0)?;
                    debug!(
                        "Rotated log {} -> {}",
                        target.display(),
                        archived.display()
                    );
                }
            }
        }
    }

    if policy.expire_days > 0 {
        let retention = Duration::from_secs(u64::from(policy.expire_days) * 24 * 3600);
        let cutoff = std::time::SystemTime::now() - retention;
        let dir = paths.logs_dir(name);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(());
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path == link || Some(&path) == active.as_ref() {
                continue;
            }
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                continue;
            }
            if let Ok(modified) = meta.modified() {
                if modified < cutoff {
                    std::fs::remove_file(&path)?;
                    debug!("Pruned expired log {}", path.display());
                }
            }
        }
    }
    Ok(())
}

fn error_line(err: GpmError) -> LogLine {
    LogLine {
        text: String::new(),
        timestamp: chrono::Utc::now().timestamp(),
        error: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(content: &str) -> (TempDir, Paths) {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        std::fs::create_dir_all(paths.logs_dir("web")).unwrap();
        std::fs::write(paths.log_link("web"), content).unwrap();
        (tmp, paths)
    }

    async fn drain(mut rx: mpsc::Receiver<LogLine>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            assert!(line.error.is_none());
            lines.push(line.text);
        }
        lines
    }

    #[tokio::test]
    async fn missing_log_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        assert!(matches!(
            watch(&paths, "ghost", 0, false).await,
            Err(GpmError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reads_whole_file_without_follow() {
        let (_tmp, paths) = setup("one\ntwo\nthree\n");
        let rx = watch(&paths, "web", 0, false).await.unwrap();
        assert_eq!(drain(rx).await, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn tail_offset_skips_leading_content_and_partial_line() {
        let (_tmp, paths) = setup("aaaa\nbbbb\ncccc\n");
        // 7 bytes from the end lands inside "bbbb\n"; the fragment is
        // dropped and only the following complete line survives
        let rx = watch(&paths, "web", 7, false).await.unwrap();
        assert_eq!(drain(rx).await, vec!["cccc"]);
    }

    #[tokio::test]
    async fn oversized_offset_reads_from_beginning() {
        let (_tmp, paths) = setup("one\ntwo\n");
        let rx = watch(&paths, "web", 10_000, false).await.unwrap();
        assert_eq!(drain(rx).await, vec!["one", "two"]);
    }

    #[cfg(unix)]
    #[test]
    fn oversized_active_log_is_rotated_copy_truncate() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        std::fs::create_dir_all(paths.logs_dir("web")).unwrap();
        let dated = paths.dated_log("web", "20260101");
        std::fs::write(&dated, vec![b'x'; 4096]).unwrap();
        std::os::unix::fs::symlink(&dated, paths.log_link("web")).unwrap();

        let policy = LogPolicy {
            expire_days: 0,
            max_size: 1024,
        };
        enforce_policy(&paths, "web", &policy).unwrap();

        // Active file truncated, contents preserved in exactly one archive
        assert_eq!(std::fs::metadata(&dated).unwrap().len(), 0);
        let archives: Vec<_> = std::fs::read_dir(paths.logs_dir("web"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                *p != dated
                    && !std::fs::symlink_metadata(p)
                        .unwrap()
                        .file_type()
                        .is_symlink()
            })
            .collect();
        assert_eq!(archives.len(), 1);
        assert_eq!(std::fs::metadata(&archives[0]).unwrap().len(), 4096);

        // Under the threshold the second pass is a no-op
        enforce_policy(&paths, "web", &policy).unwrap();
        assert_eq!(std::fs::metadata(&dated).unwrap().len(), 0);
    }

    #[test]
    fn retention_keeps_recent_logs() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        std::fs::create_dir_all(paths.logs_dir("web")).unwrap();
        let dated = paths.dated_log("web", "20260101");
        std::fs::write(&dated, "fresh\n").unwrap();

        let policy = LogPolicy {
            expire_days: 1,
            max_size: 0,
        };
        enforce_policy(&paths, "web", &policy).unwrap();
        assert!(dated.exists());
    }

    #[tokio::test]
    async fn follow_picks_up_appended_lines() {
        let (_tmp, paths) = setup("first\n");
        let mut rx = watch(&paths, "web", 0, true).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().text, "first");

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(paths.log_link("web"))
            .unwrap();
        use std::io::Write;
        writeln!(file, "second").unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "second");
        drop(rx); // cancellation: the tail task notices the closed channel
    }
}
