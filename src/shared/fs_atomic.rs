use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Checkpoint records must never be observable half-written. The new
/// content goes to a scratch file in the target's directory, is fsynced,
/// and is renamed over the target; the directory is then fsynced so the
/// rename itself survives a crash. Readers see the old record or the new
/// one, nothing in between.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let scratch = scratch_path(parent, path);

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&scratch)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&scratch, path)?;
    sync_dir(parent)?;
    Ok(())
}

// Scratch names carry the pid and a process-wide sequence number, so
// concurrent writers in the same directory never collide.
fn scratch_path(parent: &Path, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("record");
    let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(".swap.{}.{seq}.{name}", std::process::id()))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
