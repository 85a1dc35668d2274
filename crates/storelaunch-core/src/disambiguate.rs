use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Stages per-run copies of shared files and removes them afterwards.
///
/// For every target `dir/name`, the prefixed source `dir/<prefix>_name` is
/// copied onto the target, refusing to overwrite. A target that already
/// exists is still tracked for deletion; a target whose copy failed for any
/// other reason is not.
#[derive(Debug)]
pub struct FileDisambiguator {
    tracked: Vec<PathBuf>,
    delete_on_drop: bool,
}

impl FileDisambiguator {
    pub fn new(prefix: &str, files: &[PathBuf], copy: bool, delete_on_drop: bool) -> Self {
        let tracked = files
            .iter()
            .filter_map(|target| stage(prefix, target, copy))
            .collect();
        Self {
            tracked,
            delete_on_drop,
        }
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.tracked
    }
}

/// `dir/name` → `dir/<prefix>_name`.
pub fn source_path(prefix: &str, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source = format!("{prefix}_{name}");
    match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(source),
        _ => PathBuf::from(source),
    }
}

fn stage(prefix: &str, target: &Path, copy: bool) -> Option<PathBuf> {
    if !copy {
        return Some(target.to_path_buf());
    }
    let source = source_path(prefix, target);
    info!("copying {} -> {}", source.display(), target.display());
    match copy_new(&source, target) {
        Ok(()) => Some(target.to_path_buf()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            warn!("{} already exists; keeping it", target.display());
            Some(target.to_path_buf())
        }
        Err(e) => {
            warn!("cannot copy {}: {e}", source.display());
            None
        }
    }
}

fn copy_new(source: &Path, target: &Path) -> std::io::Result<()> {
    let mut from = File::open(source)?;
    let mut to = OpenOptions::new().write(true).create_new(true).open(target)?;
    if let Err(e) = std::io::copy(&mut from, &mut to) {
        drop(to);
        let _ = std::fs::remove_file(target);
        return Err(e);
    }
    Ok(())
}

impl Drop for FileDisambiguator {
    fn drop(&mut self) {
        if !self.delete_on_drop {
            return;
        }
        for path in &self.tracked {
            info!("deleting {}...", path.display());
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("cannot delete {}: {e}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_path_prefixes_the_file_name() {
        assert_eq!(
            source_path("run7", Path::new("/data/config.json")),
            PathBuf::from("/data/run7_config.json")
        );
        assert_eq!(
            source_path("run7", Path::new("config.json")),
            PathBuf::from("run7_config.json")
        );
    }

    #[test]
    fn copies_and_deletes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("settings.ini");
        std::fs::write(dir.path().join("p_settings.ini"), "x=1").unwrap();

        {
            let files = FileDisambiguator::new("p", &[target.clone()], true, true);
            assert_eq!(files.tracked(), &[target.clone()]);
            assert_eq!(std::fs::read_to_string(&target).unwrap(), "x=1");
        }
        assert!(!target.exists());
        assert!(dir.path().join("p_settings.ini").exists());
    }

    #[test]
    fn existing_target_is_kept_but_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("settings.ini");
        std::fs::write(dir.path().join("p_settings.ini"), "new").unwrap();
        std::fs::write(&target, "old").unwrap();

        let files = FileDisambiguator::new("p", &[target.clone()], true, false);
        assert_eq!(files.tracked(), &[target.clone()]);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "old");
        drop(files);
        assert!(target.exists());
    }

    #[test]
    fn missing_source_is_not_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("settings.ini");
        let files = FileDisambiguator::new("p", &[target.clone()], true, true);
        assert!(files.tracked().is_empty());
        assert!(!target.exists());
    }

    #[test]
    fn uninstall_only_deletes_without_copying() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("settings.ini");
        std::fs::write(&target, "left over").unwrap();
        std::fs::write(dir.path().join("p_settings.ini"), "fresh").unwrap();

        drop(FileDisambiguator::new("p", &[target.clone()], false, true));
        assert!(!target.exists());
    }
}
