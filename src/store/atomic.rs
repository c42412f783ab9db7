use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);
const TEMP_PREFIX: &str = ".unsealed.tmp.";

/// Pretty-printed JSON with a trailing newline, replaced in one rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let mut rendered = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    rendered.push(b'\n');
    atomic_write(path, &rendered)
}

/// Writes to a sibling temp file, fsyncs, then renames over `path`. Readers
/// see either the old contents or the new ones.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path `{}` has no parent directory", path.display()),
            ));
        }
    };
    fs::create_dir_all(parent)?;

    let tmp_path = temp_sibling(parent, path)?;
    let result = write_then_rename(&tmp_path, path, parent, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_then_rename(tmp_path: &Path, path: &Path, parent: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(tmp_path, path) {
        if !path.exists() {
            return Err(err);
        }
        fs::remove_file(path)?;
        fs::rename(tmp_path, path)?;
    }
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_sibling(parent: &Path, target: &Path) -> io::Result<PathBuf> {
    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(
        "{TEMP_PREFIX}{file_name}.{}.{counter}",
        std::process::id()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_pretty_json_and_replaces_previous_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports/merge-log.json");

        write_json_atomic(&path, &json!({"merged": 1})).expect("first write");
        write_json_atomic(&path, &json!({"merged": 2})).expect("second write");

        let content = fs::read_to_string(&path).expect("read report");
        assert!(content.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&content).expect("valid json");
        assert_eq!(value["merged"], 2);
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("merge-report.json");

        atomic_write(&path, b"v1").expect("write1");
        atomic_write(&path, b"v2").expect("write2");
        assert_eq!(fs::read(&path).expect("read"), b"v2");

        let leftovers = fs::read_dir(dir.path())
            .expect("list dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(TEMP_PREFIX))
            .collect::<Vec<_>>();
        assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
    }
}
