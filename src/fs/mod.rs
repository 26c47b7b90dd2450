use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fs, io};

use anyhow::{Context, Result};

use util::PathEncodingError;

/// Utility fns
mod ops;
pub use ops::same_contents;

/// Defines fns for creating common paths in the job tree
mod paths;
pub use paths::{CONTROL_SENTINELS, JOB_LOG, STATUS_FILE};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not a regular file: {0}")]
    NotFile(String),
    #[error("Specified root directory \"{0}\" is not a directory")]
    NotDirectory(String),
    #[error("Can't perform IO operation: \"{0}\" is not whitelisted")]
    NotWhitelisted(String),
}

/// All file operations on the job tree should go through this struct.
///
/// All destructive operations check that the path in question is a child of the
/// single whitelisted prefix (the root dir), otherwise they will not be performed.
/// Commands from the workflow file can break this rule; it is up to the user
/// to make sure they don't have unintended consequences.
#[derive(Debug, Clone)]
pub struct Fs {
    /// The directory we are allowed to modify
    root: PathBuf,
    /// if true, prevents all destructive operations
    dry_run: bool,
}

impl Fs {
    /// Create a new `Fs` for the given root directory.
    pub fn new(root: &Path, dry_run: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            dry_run,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Check that the root dir exists, and canonicalize it so that
    /// whitelist checks see the same prefix the scanner produces.
    pub fn ensure_root_exists(&mut self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(Error::NotDirectory(
                self.root.to_str().ok_or(PathEncodingError)?.to_string(),
            )
            .into());
        }
        self.root = self.root.canonicalize()?;
        Ok(())
    }

    /// Check if path exists on disk.
    pub fn exists<T: AsRef<Path>>(&self, path: T) -> bool {
        let path = path.as_ref();
        path.exists() || path.is_symlink()
    }

    /// Check if path exists and is a regular file (following symlinks).
    pub fn is_file<T: AsRef<Path>>(&self, path: T) -> bool {
        path.as_ref().is_file()
    }

    /// Check if path exists and is a directory.
    pub fn is_dir<T: AsRef<Path>>(&self, path: T) -> bool {
        path.as_ref().is_dir()
    }

    /// Create a directory (uses `std::fs::create_dir_all`, so an entire tree of dirs can be created).
    pub fn create_dir<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        fs::create_dir_all(path).with_context(|| format!("creating dir {:?}", path))?;
        Ok(())
    }

    /// Write entire str to a file.
    pub fn write_file<T: AsRef<Path>>(&self, path: T, text: &str) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        fs::write(path, text).with_context(|| format!("writing file {:?}", path))?;
        Ok(())
    }

    /// Append one line to a file, creating it if needed.
    pub fn append_line<T: AsRef<Path>>(&self, path: T, line: &str) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {:?} for append", path))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    /// Delete a file or dir if it exists. Returns true if something was deleted.
    pub fn remove_if_exists<T: AsRef<Path>>(&self, path: T) -> Result<bool> {
        let path = path.as_ref();
        if !self.exists(path) {
            return Ok(false);
        }
        self.check_whitelist(path)?;
        if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(path).with_context(|| format!("deleting dir {:?}", path))?;
        } else {
            fs::remove_file(path).with_context(|| format!("deleting file {:?}", path))?;
        }
        Ok(true)
    }

    /// Rename `src` to `tgt`; both must be whitelisted.
    pub fn rename<T: AsRef<Path>, U: AsRef<Path>>(&self, src: T, tgt: U) -> Result<()> {
        let (src, tgt) = (src.as_ref(), tgt.as_ref());
        self.check_whitelist(src)?;
        self.check_whitelist(tgt)?;
        fs::rename(src, tgt).with_context(|| format!("renaming {:?} to {:?}", src, tgt))?;
        Ok(())
    }

    /// Copy the regular file `src` to `tgt`.
    pub fn copy<T: AsRef<Path>, U: AsRef<Path>>(&self, src: T, tgt: U) -> Result<()> {
        let (src, tgt) = (src.as_ref(), tgt.as_ref());
        self.check_whitelist(tgt)?;
        ops::copy(src, tgt).with_context(|| format!("copying {:?} to {:?}", src, tgt))?;
        Ok(())
    }

    /// Read a file written by an external program. Invalid UTF-8 is replaced
    /// rather than rejected, since crashed runs often leave stray bytes behind.
    pub fn read_lossy<T: AsRef<Path>>(&self, path: T) -> Result<String> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("reading {:?}", path))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read entire file into a String.
    fn read_to_buf<T: AsRef<Path>>(&self, path: T, strbuf: &mut String) -> Result<()> {
        use std::io::Read;
        let path = path.as_ref();
        strbuf.clear();
        let cap = fs::metadata(path)?.len() as usize;
        if cap > strbuf.len() {
            strbuf.reserve(cap - strbuf.len());
        }
        let mut f = fs::File::open(path).with_context(|| format!("opening {:?}", path))?;
        f.read_to_string(strbuf)?;
        Ok(())
    }

    /// Read entire file into a new String.
    pub fn read_to_string<T: AsRef<Path>>(&self, path: T) -> Result<String> {
        let mut buf = String::new();
        self.read_to_buf(path, &mut buf)?;
        Ok(buf)
    }

    /// Sorted names of the regular files directly inside `dir`.
    pub fn file_names<T: AsRef<Path>>(&self, dir: T) -> Result<Vec<String>> {
        let dir = dir.as_ref();
        let mut names = Vec::with_capacity(32);
        for entry in self.read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name();
                names.push(name.to_str().ok_or(PathEncodingError)?.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// List entries in a directory
    pub fn read_dir<T: AsRef<Path>>(&self, path: T) -> Result<fs::ReadDir, io::Error> {
        fs::read_dir(path)
    }

    fn is_whitelisted<T: AsRef<Path>>(&self, path: T) -> bool {
        path.as_ref().starts_with(&self.root)
    }

    fn check_whitelist(&self, path: &Path) -> Result<()> {
        if self.dry_run || !self.is_whitelisted(path) {
            Err(Error::NotWhitelisted(path.to_str().ok_or(PathEncodingError)?.to_owned()).into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_whitelist() -> Result<()> {
        let dir = tempdir()?;
        let mut fs = Fs::new(&dir.path().join("root"), false);
        assert!(fs.ensure_root_exists().is_err());

        std::fs::create_dir(dir.path().join("root"))?;
        fs.ensure_root_exists()?;
        let inside = fs.root().join("file");
        fs.write_file(&inside, "x")?;
        assert!(fs.write_file(dir.path().join("outside"), "x").is_err());

        let dry = Fs::new(fs.root(), true);
        assert!(dry.remove_if_exists(&inside).is_err());
        assert!(inside.exists());
        Ok(())
    }

    #[test]
    fn test_append_and_remove() -> Result<()> {
        let dir = tempdir()?;
        let fs = Fs::new(dir.path(), false);
        let log = dir.path().join("log");
        fs.append_line(&log, "one")?;
        fs.append_line(&log, "two")?;
        assert_eq!("one\ntwo\n", fs.read_to_string(&log)?);
        assert!(fs.remove_if_exists(&log)?);
        assert!(!fs.remove_if_exists(&log)?);
        Ok(())
    }
}
