//! Block-wise copy primitives used by the copy/move task.
//!
//! Copies are planned up front as a flat list of [`CopyItem`]s and then
//! carried out one block at a time with [`BlockCopy`], so a large file
//! never ties up a whole scheduler slice.

use std::fs::{self, File, Permissions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult};

/// Unit of copy progress, in bytes.
pub const BLOCK_SIZE: u64 = 16 * 1024;

/// Bytes a file of `len` bytes counts for in progress accounting.
///
/// Sizes are rounded up to whole blocks and every file costs at least one
/// block, which approximates the real cost of many small files.
pub fn accounted_size(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE).max(1) * BLOCK_SIZE
}

/// Total accounted size of every regular file under `paths`.
///
/// Symlinks are not followed and not counted.
pub fn transfer_size(paths: &[PathBuf]) -> u64 {
    paths
        .iter()
        .flat_map(|p| WalkDir::new(p).follow_links(false))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| accounted_size(m.len()))
        .sum()
}

/// Returns `path`, or a free variant of it if something already exists there.
///
/// Tries `path_` first, then `path_0`, `path_1`, and so on.
pub fn safe_path(path: &Path) -> PathBuf {
    if !exists(path) {
        return path.to_path_buf();
    }
    let mut base = path.as_os_str().to_owned();
    base.push("_");
    let candidate = PathBuf::from(&base);
    if !exists(&candidate) {
        return candidate;
    }
    let mut n: u64 = 0;
    loop {
        let mut numbered = base.clone();
        numbered.push(n.to_string());
        let candidate = PathBuf::from(numbered);
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Like `Path::exists` but also true for dangling symlinks.
fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// One action of a planned copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyItem {
    /// Create this directory.
    Dir(PathBuf),
    /// Recreate the symlink at `src` as `dest`.
    Link { src: PathBuf, dest: PathBuf },
    /// Copy file contents.
    File { src: PathBuf, dest: PathBuf, len: u64 },
}

/// Flattens the copy of `src` to `dest` into individual actions.
///
/// Directories come before their contents. Symlinks are copied as links,
/// never followed.
///
/// # Errors
///
/// - [`CoreError::NotFound`] if `src` does not exist.
/// - [`CoreError::Io`] if part of the tree cannot be read.
pub fn plan_copy(src: &Path, dest: &Path) -> CoreResult<Vec<CopyItem>> {
    let meta = fs::symlink_metadata(src).map_err(|e| CoreError::from_io(src, e))?;
    if !meta.is_dir() {
        return Ok(vec![item_for(src, dest.to_path_buf(), &meta)]);
    }

    let mut items = Vec::new();
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| CoreError::Io(e.into()))?;
        let target = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => dest.join(rel),
            _ => dest.to_path_buf(),
        };
        let meta = entry.metadata().map_err(|e| CoreError::Io(e.into()))?;
        items.push(item_for(entry.path(), target, &meta));
    }
    Ok(items)
}

fn item_for(src: &Path, dest: PathBuf, meta: &fs::Metadata) -> CopyItem {
    let ft = meta.file_type();
    if ft.is_symlink() {
        CopyItem::Link {
            src: src.to_path_buf(),
            dest,
        }
    } else if ft.is_dir() {
        CopyItem::Dir(dest)
    } else {
        CopyItem::File {
            src: src.to_path_buf(),
            dest,
            len: meta.len(),
        }
    }
}

/// Recreates the symlink `src` at `dest`.
pub fn copy_link(src: &Path, dest: &Path) -> CoreResult<()> {
    #[cfg(unix)]
    {
        let target = fs::read_link(src).map_err(|e| CoreError::from_io(src, e))?;
        std::os::unix::fs::symlink(target, dest)?;
    }
    #[cfg(not(unix))]
    {
        fs::copy(src, dest)?;
    }
    Ok(())
}

/// An open source/destination pair copied one block per call.
#[derive(Debug)]
pub struct BlockCopy {
    reader: File,
    writer: File,
    permissions: Permissions,
    buf: Vec<u8>,
}

impl BlockCopy {
    /// Opens `src` for reading and creates (or truncates) `dest`.
    pub fn open(src: &Path, dest: &Path) -> CoreResult<Self> {
        let reader = File::open(src).map_err(|e| CoreError::from_io(src, e))?;
        let permissions = reader.metadata()?.permissions();
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = File::create(dest).map_err(|e| CoreError::from_io(dest, e))?;
        Ok(Self {
            reader,
            writer,
            permissions,
            buf: vec![0; BLOCK_SIZE as usize],
        })
    }

    /// Copies the next block and returns its length; `0` once the end is reached.
    ///
    /// At the end the destination gets the source's permission bits.
    pub fn copy_block(&mut self) -> CoreResult<usize> {
        let n = self.reader.read(&mut self.buf)?;
        if n == 0 {
            self.writer.flush()?;
            self.writer.set_permissions(self.permissions.clone())?;
            return Ok(0);
        }
        self.writer.write_all(&self.buf[..n])?;
        Ok(n)
    }
}

/// Deletes a file, symlink or directory tree.
///
/// # Errors
///
/// - [`CoreError::NotFound`] if `path` does not exist.
/// - [`CoreError::Io`] for any I/O failure during deletion.
pub fn remove_path(path: &Path) -> CoreResult<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| CoreError::from_io(path, e))?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_plan(items: &[CopyItem]) {
        for item in items {
            match item {
                CopyItem::Dir(dest) => fs::create_dir_all(dest).unwrap(),
                CopyItem::Link { src, dest } => copy_link(src, dest).unwrap(),
                CopyItem::File { src, dest, .. } => {
                    let mut copy = BlockCopy::open(src, dest).unwrap();
                    while copy.copy_block().unwrap() > 0 {}
                }
            }
        }
    }

    #[test]
    fn accounted_size_rounds_up_to_blocks() {
        assert_eq!(accounted_size(0), BLOCK_SIZE);
        assert_eq!(accounted_size(10), BLOCK_SIZE);
        assert_eq!(accounted_size(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(accounted_size(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
    }

    #[test]
    fn transfer_size_walks_directories() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a"), "1").unwrap();
        fs::write(dir.join("b"), vec![0u8; BLOCK_SIZE as usize + 1]).unwrap();
        let single = tmp.path().join("single");
        fs::write(&single, "x").unwrap();

        let total = transfer_size(&[dir, single]);

        assert_eq!(total, 4 * BLOCK_SIZE);
    }

    #[cfg(unix)]
    #[test]
    fn transfer_size_skips_symlinks() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        fs::write(&target, "data").unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert_eq!(transfer_size(&[link]), 0);
    }

    #[test]
    fn safe_path_appends_suffixes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f.txt");
        assert_eq!(safe_path(&path), path);

        fs::write(&path, "").unwrap();
        assert_eq!(safe_path(&path), tmp.path().join("f.txt_"));

        fs::write(tmp.path().join("f.txt_"), "").unwrap();
        assert_eq!(safe_path(&path), tmp.path().join("f.txt_0"));

        fs::write(tmp.path().join("f.txt_0"), "").unwrap();
        assert_eq!(safe_path(&path), tmp.path().join("f.txt_1"));
    }

    #[test]
    fn block_copy_moves_data_in_blocks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("big");
        let dest = tmp.path().join("copy");
        let data: Vec<u8> = (0..BLOCK_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &data).unwrap();

        let mut copy = BlockCopy::open(&src, &dest).unwrap();
        let mut blocks = 0;
        while copy.copy_block().unwrap() > 0 {
            blocks += 1;
        }

        assert!(blocks >= 3);
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[cfg(unix)]
    #[test]
    fn block_copy_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("script");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, Permissions::from_mode(0o750)).unwrap();
        let dest = tmp.path().join("copy");

        let mut copy = BlockCopy::open(&src, &dest).unwrap();
        while copy.copy_block().unwrap() > 0 {}

        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn block_copy_missing_source_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let result = BlockCopy::open(&tmp.path().join("nope"), &tmp.path().join("dest"));
        assert!(matches!(result.unwrap_err(), CoreError::NotFound(_)));
    }

    #[test]
    fn plan_copy_directory_tree() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "aaa").unwrap();
        fs::write(src.join("nested").join("b.txt"), "bbb").unwrap();
        let dest = tmp.path().join("dest");

        let items = plan_copy(&src, &dest).unwrap();
        assert_eq!(items[0], CopyItem::Dir(dest.clone()));
        assert_eq!(items.len(), 4);

        run_plan(&items);
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "aaa");
        assert_eq!(
            fs::read_to_string(dest.join("nested").join("b.txt")).unwrap(),
            "bbb"
        );
    }

    #[test]
    fn plan_copy_single_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("one");
        fs::write(&src, "12345").unwrap();
        let dest = tmp.path().join("two");

        let items = plan_copy(&src, &dest).unwrap();

        assert_eq!(
            items,
            vec![CopyItem::File {
                src,
                dest,
                len: 5
            }]
        );
    }

    #[test]
    fn plan_copy_missing_source_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let result = plan_copy(&tmp.path().join("nope"), &tmp.path().join("dest"));
        assert!(matches!(result.unwrap_err(), CoreError::NotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_copied_as_links() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        std::os::unix::fs::symlink("elsewhere", src.join("link")).unwrap();
        let dest = tmp.path().join("dest");

        run_plan(&plan_copy(&src, &dest).unwrap());

        let copied = dest.join("link");
        assert!(fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&copied).unwrap(), PathBuf::from("elsewhere"));
    }

    #[test]
    fn remove_path_handles_files_and_trees() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, "x").unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir_all(dir.join("inner")).unwrap();

        remove_path(&file).unwrap();
        remove_path(&dir).unwrap();

        assert!(!file.exists());
        assert!(!dir.exists());
        assert!(matches!(
            remove_path(&file).unwrap_err(),
            CoreError::NotFound(_)
        ));
    }
}
