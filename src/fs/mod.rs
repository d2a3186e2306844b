use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::debug;

use crate::{IoContext, Result};

/// A scratch directory that owns every temporary file created inside it.
///
/// Removal is idempotent: `cleanup` may run after a partial or cancelled run,
/// more than once, and again implicitly on drop.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl WorkDir {
    /// Creates a fresh directory named `<prefix><random>` under `parent`, or
    /// under the system temp dir when no parent is given. A missing parent is
    /// created.
    pub fn new(parent: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent).at(parent)?;
                builder.tempdir_in(parent).at(parent)?
            }
            None => builder.tempdir().at(std::env::temp_dir())?,
        };
        debug!(path = %dir.path().display(), "created work dir");
        Ok(WorkDir {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join<P>(&self, fname: &P) -> PathBuf
    where
        P: AsRef<Path> + ?Sized,
    {
        self.path.join(fname)
    }

    /// Creates (or truncates) a file for both reading and writing.
    pub fn create<P>(&self, fname: &P) -> Result<File>
    where
        P: AsRef<Path> + ?Sized,
    {
        let path = self.join(fname);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .at(&path)
    }

    pub fn is_removed(&self) -> bool {
        self.dir.is_none()
    }

    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            debug!(path = %self.path.display(), "removing work dir");
            dir.close().at(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use super::WorkDir;

    #[test]
    fn test_work_dir() -> anyhow::Result<()> {
        let parent = tempfile::tempdir()?;
        let mut dir = WorkDir::new(Some(parent.path().join("nested").as_path()), "scratch-")?;

        let mut f = dir.create("a")?;
        f.write_all(b"hello")?;
        drop(f);

        let mut contents = String::new();
        std::fs::File::open(dir.join("a"))?.read_to_string(&mut contents)?;
        assert_eq!("hello", contents);

        // Creating again truncates.
        assert_eq!(0, dir.create("a")?.metadata()?.len());

        let path = dir.path().to_path_buf();
        dir.cleanup()?;
        assert!(!path.exists());
        assert!(dir.is_removed());
        // A second cleanup is a no-op.
        dir.cleanup()?;

        Ok(())
    }
}
