//! Hot reloading of the rule and action files on mtime change.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::FileErrorPolicy;

/// The mtime of a file, with `None` for "not there".
type Stamp = Option<SystemTime>;

pub struct Reloader<T> {
    path: PathBuf,
    what: &'static str,
    policy: FileErrorPolicy,
    /// The stamp of the last load attempt; `None` before the first one.
    /// A missing file gets complained about exactly once.
    last: Option<Stamp>,
    root: Option<Arc<T>>,
}

impl<T> Reloader<T> {
    pub fn new(path: PathBuf, what: &'static str, policy: FileErrorPolicy) -> Self {
        Self {
            path,
            what,
            policy,
            last: None,
            root: None,
        }
    }

    /// The current root, reloading if the file's mtime moved. On a failed
    /// parse the error is logged once and either the previous root stays
    /// (use-old) or the root is cleared (drop); the stamp always advances
    /// so the same error is not re-logged every tick.
    pub fn current<E: Display>(
        &mut self,
        load: impl FnOnce(&Path) -> Result<T, E>,
    ) -> Option<Arc<T>> {
        let stamp = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if self.last.as_ref() == Some(&stamp) {
            return self.root.clone();
        }
        // Once committed to loading, kill the old root if errors drop it.
        if self.policy == FileErrorPolicy::Drop {
            self.root = None;
        }
        self.last = Some(stamp);

        match load(&self.path) {
            Ok(root) => {
                self.root = Some(Arc::new(root));
                tracing::debug!(
                    "reloaded {} file {} dated {stamp:?}",
                    self.what,
                    self.path.display()
                );
            }
            Err(e) => {
                tracing::error!("error loading {} file: {e}", self.what);
            }
        }

        self.root.clone()
    }

    /// The cached root, with no reload check.
    pub fn cached(&self) -> Option<Arc<T>> {
        self.root.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::Duration;

    fn temp_with(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();

        file
    }

    fn bump_mtime(path: &Path) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2))
            .unwrap();
    }

    fn load_lines(path: &Path) -> Result<Vec<String>, std::io::Error> {
        Ok(std::fs::read_to_string(path)?
            .lines()
            .map(str::to_owned)
            .collect())
    }

    fn load_fail(_: &Path) -> Result<Vec<String>, std::io::Error> {
        Err(std::io::Error::other("synthetic parse failure"))
    }

    #[test]
    fn unchanged_mtime_returns_the_same_root() {
        let file = temp_with("one\n");
        let mut reloader: Reloader<Vec<String>> =
            Reloader::new(file.path().to_owned(), "rules", FileErrorPolicy::UseOld);

        let first = reloader.current(load_lines).unwrap();
        let second = reloader.current(load_lines).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn mtime_change_reloads() {
        let file = temp_with("one\n");
        let mut reloader: Reloader<Vec<String>> =
            Reloader::new(file.path().to_owned(), "rules", FileErrorPolicy::UseOld);

        let first = reloader.current(load_lines).unwrap();
        std::fs::write(file.path(), "one\ntwo\n").unwrap();
        bump_mtime(file.path());

        let second = reloader.current(load_lines).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn use_old_keeps_the_previous_root_on_errors() {
        let file = temp_with("one\n");
        let mut reloader: Reloader<Vec<String>> =
            Reloader::new(file.path().to_owned(), "rules", FileErrorPolicy::UseOld);

        let first = reloader.current(load_lines).unwrap();
        bump_mtime(file.path());
        let after_error = reloader.current(load_fail).unwrap();
        assert!(Arc::ptr_eq(&first, &after_error));
    }

    #[test]
    fn drop_clears_the_root_on_errors() {
        let file = temp_with("one\n");
        let mut reloader: Reloader<Vec<String>> =
            Reloader::new(file.path().to_owned(), "rules", FileErrorPolicy::Drop);

        assert!(reloader.current(load_lines).is_some());
        bump_mtime(file.path());
        assert!(reloader.current(load_fail).is_none());
        // And it stays gone until the file changes again.
        assert!(reloader.current(load_lines).is_none());

        bump_mtime(file.path());
        assert!(reloader.current(load_lines).is_some());
    }

    #[test]
    fn missing_files_fail_once_and_stay_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-there");
        let mut reloader: Reloader<Vec<String>> =
            Reloader::new(path.clone(), "rules", FileErrorPolicy::UseOld);

        assert!(reloader.current(load_lines).is_none());
        assert!(reloader.current(load_lines).is_none());

        // The file appearing counts as an mtime change.
        std::fs::write(&path, "one\n").unwrap();
        assert!(reloader.current(load_lines).is_some());
    }
}
