//! Process-group signalling and lightweight process inspection.

use sha2::{Digest, Sha256};

/// Deliver `signal` to the whole process group rooted at `pid`. Workers are
/// spawned with `process_group(0)`, so the group id equals the child pid and
/// the signal reaches the entire tree.
pub(crate) fn signal_process_group(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

/// Signal-0 liveness probe. EPERM still means "alive, not ours".
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let res = unsafe { libc::kill(pid as i32, 0) };
    res == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Resident set size in MB, from `/proc/<pid>/status`. `None` when the
/// process is gone or the field is unreadable.
pub(crate) async fn rss_mb(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// Audit fingerprint of an assembled argument vector. Logged at spawn so the
/// exact command a run executed can be matched later without re-quoting.
pub(crate) fn command_fingerprint<S: AsRef<str>>(argv: &[S]) -> String {
    let mut hasher = Sha256::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(arg.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_fingerprint_is_argv_sensitive() {
        let a = command_fingerprint(&["crawl", "listing", "-o", "out.jsonl"]);
        let b = command_fingerprint(&["crawl", "listing", "-o", "out2.jsonl"]);
        assert_ne!(a, b);
        // Argument boundaries matter: ["ab","c"] != ["a","bc"].
        assert_ne!(
            command_fingerprint(&["ab", "c"]),
            command_fingerprint(&["a", "bc"])
        );
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }

    #[tokio::test]
    async fn own_rss_is_reported_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(rss_mb(std::process::id()).await.is_some());
        }
    }
}
