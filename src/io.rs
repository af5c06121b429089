use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

use crate::error::StoreError;

const ANSI_BLUE: Style = Style::new().blue();

/// Marker carried by every temporary file name, so scans can skip them.
pub(crate) const TMP_MARKER: &str = ".tmp-";

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Writes `content` to `path` so that readers either see the previous file or
/// the complete new one, never a prefix.
///
/// The data goes to a uniquely named hidden file in the same directory, is
/// synced to disk, and is then renamed over the destination.
pub(crate) fn atomic_write(path: &Utf8Path, content: &[u8]) -> Result<(), StoreError> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let parent = path.parent().unwrap_or(Utf8Path::new("."));
    let file_name = path.file_name().unwrap_or("artifact");

    let tmp_path = parent.join(format!(
        ".{}{}{}-{}",
        file_name,
        TMP_MARKER,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
    ));

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(StoreError::io(&tmp_path))?;
        file.write_all(content).map_err(StoreError::io(&tmp_path))?;
        file.sync_all().map_err(StoreError::io(&tmp_path))?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(path)(e));
    }

    sync_dir(parent).map_err(StoreError::io(parent))
}

#[cfg(unix)]
fn sync_dir(dir: &Utf8Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_: &Utf8Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let path = dir.join("reference.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");

        // no temporary files are left behind
        let leftovers = fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains(TMP_MARKER)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
