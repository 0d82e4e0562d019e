//! Follows a log file that is still being appended to

use std::io::{self, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// Receiving side of a follow session
///
/// `content` yields the file line by line (a trailing partial line is
/// delivered as soon as it is read). `errors` yields at most one read
/// error. Both close once the session ends.
pub struct Follower {
    pub content: mpsc::Receiver<Vec<u8>>,
    pub errors: mpsc::Receiver<io::Error>,
}

/// Starts following `path` from `offset`
///
/// On EOF the reader sleeps `delay` and retries. Cancelling `cancel` drops
/// the file handle and closes both channels.
pub async fn follow(
    path: &Path,
    offset: u64,
    delay: Duration,
    cancel: CancellationToken,
) -> io::Result<Follower> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let (content_tx, content) = mpsc::channel(CHANNEL_CAPACITY);
    let (error_tx, errors) = mpsc::channel(1);
    let path = path.display().to_string();

    tokio::spawn(async move {
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(_) => {
                    let chunk = std::mem::take(&mut buf);
                    if content_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = error_tx.send(e).await;
                    break;
                }
            }
        }

        debug!("Stopped following {}", path);
    });

    Ok(Follower { content, errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn append(path: &Path, data: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(data).await.unwrap();
        file.flush().await.unwrap();
    }

    async fn collect(follower: &mut Follower, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let chunk = tokio::time::timeout(Duration::from_secs(5), follower.content.recv())
                .await
                .expect("timed out waiting for log content")
                .expect("content channel closed");
            out.extend(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_follow_delivers_appended_bytes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.log");
        tokio::fs::write(&path, b"before\n").await.unwrap();

        let cancel = CancellationToken::new();
        let mut follower = follow(&path, 0, Duration::from_millis(10), cancel.clone())
            .await
            .unwrap();

        assert_eq!(collect(&mut follower, 7).await, b"before\n");

        let mut expected = Vec::new();
        for i in 0..20 {
            let line = format!("line {}\n", i);
            append(&path, line.as_bytes()).await;
            expected.extend(line.into_bytes());
        }

        assert_eq!(collect(&mut follower, expected.len()).await, expected);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_follow_starts_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.log");
        tokio::fs::write(&path, b"skip\nkeep\n").await.unwrap();

        let cancel = CancellationToken::new();
        let mut follower = follow(&path, 5, Duration::from_millis(10), cancel.clone())
            .await
            .unwrap();

        assert_eq!(collect(&mut follower, 5).await, b"keep\n");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_closes_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.log");
        tokio::fs::write(&path, b"").await.unwrap();

        let cancel = CancellationToken::new();
        let mut follower = follow(&path, 0, Duration::from_millis(50), cancel.clone())
            .await
            .unwrap();

        cancel.cancel();

        let closed = tokio::time::timeout(Duration::from_secs(1), follower.content.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert!(follower.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let res = follow(
            &dir.path().join("missing.log"),
            0,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await;
        assert!(res.is_err());
    }
}
