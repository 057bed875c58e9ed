use std::io::Write;
use std::path::Path;

use log::debug;

/// Write bytes to a uniquely-named temp file in the target's directory,
/// fsync, then rename over the target. Readers never see a partial file and
/// a crash leaves either the old content or the new, nothing in between.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("no parent for {path:?}")))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    fsync_dir(parent);
    Ok(())
}

// not all filesystems support directory fsync; the rename itself is still
// atomic, so failure here only widens the crash window
pub fn fsync_dir(path: &Path) {
    match std::fs::File::open(path).and_then(|f| f.sync_all()) {
        Ok(()) => {}
        Err(e) => debug!("dir fsync not supported for {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub").join("state.json");
        atomic_write(&target, b"one").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"one");
        atomic_write(&target, b"two").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"two");
        // no temp droppings left behind
        let names: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }
}
