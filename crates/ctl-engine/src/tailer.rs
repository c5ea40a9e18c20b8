//! Follows a growing append-only line file and emits complete lines in file
//! order, each exactly once.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TailEvent {
    Line(String),
    /// The file existed and then disappeared mid-run. Non-fatal; surfaced to
    /// reconciliation.
    FileVanished,
    /// The file never appeared within the wait window. Non-fatal.
    NoOutputTimeout,
}

#[derive(Debug, Clone)]
pub(crate) struct TailerConfig {
    pub poll: Duration,
    pub file_wait: Duration,
    /// Backpressure high-water mark: at most this many bytes are read off
    /// disk per pass. Anything beyond stays in the file and is drained on
    /// later ticks; the subprocess is never throttled.
    pub high_water_bytes: u64,
}

/// Tail `path` until the stop signal flips, then drain the remainder of the
/// file and return. Lines appended after the final drain are discarded. Each
/// read pass is capped at `high_water_bytes`, and the send side of `tx` is
/// bounded: when the ingest side cannot keep up, the tailer stops reading
/// and the file keeps growing on disk.
pub(crate) async fn tail_file(
    path: PathBuf,
    cfg: TailerConfig,
    mut stop: watch::Receiver<bool>,
    tx: mpsc::Sender<TailEvent>,
) {
    let mut tail = Tail {
        path,
        offset: 0,
        partial: Vec::new(),
        seen_file: false,
        vanish_reported: false,
        missing_reported: false,
        started: Instant::now(),
        file_wait: cfg.file_wait,
        high_water: cfg.high_water_bytes.max(1),
    };

    loop {
        let stopping = *stop.borrow();
        if tail.drain(&tx, stopping).await.is_err() {
            return;
        }
        if stopping {
            // A trailing partial line is a complete record at end-of-run per
            // the output contract.
            tail.flush_partial(&tx).await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(cfg.poll) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    // Stop sender dropped; drain and bail.
                    let _ = tail.drain(&tx, true).await;
                    tail.flush_partial(&tx).await;
                    return;
                }
            }
        }
    }
}

struct Tail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    seen_file: bool,
    vanish_reported: bool,
    missing_reported: bool,
    started: Instant,
    file_wait: Duration,
    high_water: u64,
}

struct ReceiverGone;

impl Tail {
    /// One tick's worth of reading. During normal operation a single capped
    /// pass runs and the rest waits for the next tick; at end-of-run the
    /// passes repeat until the file is exhausted.
    async fn drain(&mut self, tx: &mpsc::Sender<TailEvent>, to_eof: bool) -> Result<(), ReceiverGone> {
        loop {
            let more = self.poll_once(tx).await?;
            if !(to_eof && more) {
                return Ok(());
            }
        }
    }

    /// Returns whether unread bytes remain past the high-water cap.
    async fn poll_once(&mut self, tx: &mpsc::Sender<TailEvent>) -> Result<bool, ReceiverGone> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                self.seen_file = true;
                meta.len()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if self.seen_file {
                    if !self.vanish_reported {
                        self.vanish_reported = true;
                        send(tx, TailEvent::FileVanished).await?;
                    }
                } else if !self.missing_reported && self.started.elapsed() >= self.file_wait {
                    self.missing_reported = true;
                    send(tx, TailEvent::NoOutputTimeout).await?;
                }
                return Ok(false);
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "tail stat failed");
                return Ok(false);
            }
        };

        if size < self.offset {
            // The file shrank: it was replaced. Start over from the top.
            debug!(path = %self.path.display(), "output file shrank; resetting tail offset");
            self.offset = 0;
            self.partial.clear();
        }
        if size == self.offset {
            return Ok(false);
        }

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "tail open failed");
                return Ok(false);
            }
        };
        if file.seek(SeekFrom::Start(self.offset)).await.is_err() {
            return Ok(false);
        }

        // Cap the read at the high-water mark; bytes past it stay on disk
        // until a later pass.
        let want = (size - self.offset).min(self.high_water);
        let mut chunk = Vec::with_capacity(want as usize);
        let n = match (&mut file).take(want).read_to_end(&mut chunk).await {
            Ok(n) => n,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "tail read failed");
                return Ok(false);
            }
        };
        self.offset += n as u64;

        self.partial.extend_from_slice(&chunk);
        while let Some(newline) = self.partial.iter().position(|b| *b == b'\n') {
            let rest = self.partial.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.pop(); // the newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                send(tx, TailEvent::Line(String::from_utf8_lossy(&line).into_owned())).await?;
            }
        }
        Ok(self.offset < size)
    }

    async fn flush_partial(&mut self, tx: &mpsc::Sender<TailEvent>) {
        let line = std::mem::take(&mut self.partial);
        if !line.is_empty() {
            let _ = tx
                .send(TailEvent::Line(String::from_utf8_lossy(&line).into_owned()))
                .await;
        }
    }
}

async fn send(tx: &mpsc::Sender<TailEvent>, event: TailEvent) -> Result<(), ReceiverGone> {
    tx.send(event).await.map_err(|_| ReceiverGone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cfg() -> TailerConfig {
        TailerConfig {
            poll: Duration::from_millis(20),
            file_wait: Duration::from_millis(200),
            high_water_bytes: 10_000_000,
        }
    }

    async fn recv_line(rx: &mut mpsc::Receiver<TailEvent>) -> String {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(TailEvent::Line(line))) => line,
            other => panic!("expected line, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn emits_lines_as_they_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(64);
        let tail = tokio::spawn(tail_file(path.clone(), cfg(), stop_rx, tx));

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{{\"k\":1}}").unwrap();
        file.flush().unwrap();
        assert_eq!(recv_line(&mut rx).await, "{\"k\":1}");

        writeln!(file, "{{\"k\":2}}").unwrap();
        writeln!(file, "{{\"k\":3}}").unwrap();
        file.flush().unwrap();
        assert_eq!(recv_line(&mut rx).await, "{\"k\":2}");
        assert_eq!(recv_line(&mut rx).await, "{\"k\":3}");

        stop_tx.send(true).unwrap();
        tail.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn buffers_partial_lines_across_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(64);
        let tail = tokio::spawn(tail_file(path.clone(), cfg(), stop_rx, tx));

        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{{\"k\":").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        write!(file, "1}}\n{{\"k\":2}}").unwrap();
        file.flush().unwrap();
        assert_eq!(recv_line(&mut rx).await, "{\"k\":1}");

        // The trailing partial line is flushed at stop: it is a complete
        // record at end-of-run.
        stop_tx.send(true).unwrap();
        assert_eq!(recv_line(&mut rx).await, "{\"k\":2}");
        tail.await.unwrap();
    }

    #[tokio::test]
    async fn lines_written_before_stop_are_still_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        std::fs::write(&path, "{\"k\":1}\n").unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(64);
        // Stop immediately: the final drain must still pick up the line.
        stop_tx.send(true).unwrap();
        tail_file(path, cfg(), stop_rx, tx).await;
        assert_eq!(recv_line(&mut rx).await, "{\"k\":1}");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn capped_reads_drain_a_large_backlog_across_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        let mut body = String::new();
        for i in 0..200 {
            body.push_str(&format!("{{\"k\":{i}}}\n"));
        }
        std::fs::write(&path, &body).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(1024);
        // A 64-byte high-water mark forces many passes, splitting lines
        // mid-record at pass boundaries.
        let cfg = TailerConfig {
            poll: Duration::from_millis(10),
            file_wait: Duration::from_millis(200),
            high_water_bytes: 64,
        };
        let tail = tokio::spawn(tail_file(path, cfg, stop_rx, tx));

        for i in 0..200 {
            assert_eq!(recv_line(&mut rx).await, format!("{{\"k\":{i}}}"));
        }
        stop_tx.send(true).unwrap();
        tail.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn final_drain_ignores_the_per_tick_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        let mut body = String::new();
        for i in 0..50 {
            body.push_str(&format!("{{\"k\":{i}}}\n"));
        }
        std::fs::write(&path, &body).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(1024);
        let cfg = TailerConfig {
            poll: Duration::from_millis(10),
            file_wait: Duration::from_millis(200),
            high_water_bytes: 32,
        };
        // Stop before the first pass: everything must still come out.
        stop_tx.send(true).unwrap();
        tail_file(path, cfg, stop_rx, tx).await;
        for i in 0..50 {
            assert_eq!(recv_line(&mut rx).await, format!("{{\"k\":{i}}}"));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reports_missing_output_once_after_wait_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.jsonl");
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(64);
        let tail = tokio::spawn(tail_file(path, cfg(), stop_rx, tx));

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(TailEvent::NoOutputTimeout)) => {}
            other => panic!("expected NoOutputTimeout, got {other:?}"),
        }
        stop_tx.send(true).unwrap();
        tail.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reports_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.jsonl");
        std::fs::write(&path, "{\"k\":1}\n").unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel(64);
        let tail = tokio::spawn(tail_file(path.clone(), cfg(), stop_rx, tx));
        assert_eq!(recv_line(&mut rx).await, "{\"k\":1}");

        std::fs::remove_file(&path).unwrap();
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(TailEvent::FileVanished)) => {}
            other => panic!("expected FileVanished, got {other:?}"),
        }
        stop_tx.send(true).unwrap();
        tail.await.unwrap();
    }
}
