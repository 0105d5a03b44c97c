//! Filesystem primitives used by staging and cloning.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Raw filesystem operations.
///
/// Kept behind a trait so tests can inject failing or corrupting stores.
pub trait FileStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Copy `src` to `dst`. Fails with `AlreadyExists` if `dst` is present and
    /// `overwrite` is false.
    fn copy(&self, src: &Path, dst: &Path, overwrite: bool) -> io::Result<()>;

    /// Create a single directory. Fails with `AlreadyExists` if present.
    fn create_directory(&self, path: &Path) -> io::Result<()>;

    /// Every entry below `root` (excluding `root` itself), parents before children.
    fn traverse(&self, root: &Path, include_dirs: bool) -> io::Result<Vec<PathBuf>>;

    /// Delete a file, or a directory with all of its contents.
    fn delete(&self, path: &Path) -> io::Result<()>;
}

/// `FileStore` backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn copy(&self, src: &Path, dst: &Path, overwrite: bool) -> io::Result<()> {
        if overwrite {
            fs::copy(src, dst)?;
            return Ok(());
        }

        // create_new makes the existence check and the create a single step
        let mut reader = File::open(src)?;
        let mut writer = OpenOptions::new().write(true).create_new(true).open(dst)?;
        if let Err(e) = io::copy(&mut reader, &mut writer) {
            drop(writer);
            let _ = fs::remove_file(dst);
            return Err(e);
        }
        writer.sync_all()?;
        let permissions = reader.metadata()?.permissions();
        fs::set_permissions(dst, permissions)
    }

    fn create_directory(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn traverse(&self, root: &Path, include_dirs: bool) -> io::Result<Vec<PathBuf>> {
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("not a directory: {}", root.display()),
            ));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                if include_dirs {
                    entries.push(entry.into_path());
                }
            } else if file_type.is_file() {
                entries.push(entry.into_path());
            }
        }
        Ok(entries)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(path)?;
        if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }
}
