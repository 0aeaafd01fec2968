//! Incremental log tailing for running jobs.
//!
//! A tailer seeks to the end of the job's log file and polls for new
//! lines, keeping a bounded per-job cache for inspection. The cache is
//! best-effort and lost on worker restart. Cancelling the token stops
//! the tailer after it drains whatever is already on disk.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lines kept per job.
pub const LOG_CACHE_LINES: usize = 100;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded per-job cache of recent log lines.
#[derive(Default)]
pub struct LogCache {
    lines: DashMap<String, VecDeque<String>>,
}

impl LogCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, job: &str, line: String) {
        let mut entry = self.lines.entry(job.to_string()).or_default();
        entry.push_back(line);
        if entry.len() > LOG_CACHE_LINES {
            entry.pop_front();
        }
    }

    pub fn tail(&self, job: &str) -> Vec<String> {
        self.lines
            .get(job)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Spawn a tailer for `path`, feeding `cache` under the `job` key
/// until `token` is cancelled and the file is drained.
pub fn spawn_tailer(
    path: PathBuf,
    job: String,
    cache: Arc<LogCache>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = tail_file(&path, &job, &cache, &token).await {
            tracing::debug!(job = %job, error = %err, "log tailer stopped");
        }
    })
}

async fn tail_file(
    path: &PathBuf,
    job: &str,
    cache: &LogCache,
    token: &CancellationToken,
) -> std::io::Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::End(0)).await?;

    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read > 0 {
            cache.append(job, line.trim_end().to_string());
            continue;
        }
        // Drained; stop once cancelled, otherwise poll for growth.
        if token.is_cancelled() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cache_is_bounded() {
        let cache = LogCache::new();
        for i in 0..150 {
            cache.append("cats", format!("line {i}"));
        }
        let tail = cache.tail("cats");
        assert_eq!(tail.len(), LOG_CACHE_LINES);
        assert_eq!(tail.first().unwrap(), "line 50");
        assert_eq!(tail.last().unwrap(), "line 149");
    }

    #[test]
    fn unknown_job_has_empty_tail() {
        let cache = LogCache::new();
        assert!(cache.tail("nope").is_empty());
    }

    #[tokio::test]
    async fn tailer_picks_up_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cats.txt");
        std::fs::File::create(&path).unwrap();

        let cache = Arc::new(LogCache::new());
        let token = CancellationToken::new();
        let handle = spawn_tailer(
            path.clone(),
            "cats".to_string(),
            Arc::clone(&cache),
            token.clone(),
        );

        // Let the tailer open the file and seek before appending.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "epoch 1 loss 0.9").unwrap();
        writeln!(file, "epoch 2 loss 0.5").unwrap();
        file.flush().unwrap();

        // Cancellation drains what is on disk before the tailer exits.
        token.cancel();
        handle.await.unwrap();

        assert_eq!(
            cache.tail("cats"),
            vec![
                "epoch 1 loss 0.9".to_string(),
                "epoch 2 loss 0.5".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn tailer_on_missing_file_exits_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(LogCache::new());
        let token = CancellationToken::new();

        let handle = spawn_tailer(
            dir.path().join("absent.txt"),
            "cats".to_string(),
            Arc::clone(&cache),
            token,
        );
        handle.await.unwrap();
        assert!(cache.tail("cats").is_empty());
    }
}
