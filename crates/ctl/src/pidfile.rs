//! One PID file per supervised unit: the decimal process id of its root
//! process. The supervisor derives unit identity from these files, never
//! from in-memory state, so it survives its own restarts.

use std::path::{Path, PathBuf};

pub fn pid_path(data_root: &Path, service: &str) -> PathBuf {
    data_root.join("pids").join(format!("{service}.pid"))
}

pub fn read(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

pub fn write(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("pid.tmp");
    std::fs::write(&tmp, format!("{pid}\n"))?;
    std::fs::rename(tmp, path)
}

pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Signal-0 probe; EPERM counts as alive.
pub fn alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let res = unsafe { libc::kill(pid as i32, 0) };
    res == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// The recorded pid, if its process is still running. Stale files read as
/// `None`.
pub fn live_pid(path: &Path) -> Option<u32> {
    read(path).filter(|pid| alive(*pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_path(dir.path(), "engine");

        assert_eq!(read(&path), None);
        write(&path, std::process::id()).unwrap();
        assert_eq!(read(&path), Some(std::process::id()));
        assert_eq!(live_pid(&path), Some(std::process::id()));

        // A pid that cannot be alive reads as stale.
        write(&path, 0).unwrap();
        assert_eq!(live_pid(&path), None);

        remove(&path);
        assert_eq!(read(&path), None);
    }
}
