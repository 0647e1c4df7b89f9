//! File storage backend for vault documents and blobs.

use anyhow::{Context, Result};
use getrandom::fill;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single file persisted atomically.
///
/// `Storage` handles reading, writing, and destroying one file of the
/// vault layout (a record document, the key file, or a blob).
#[derive(Clone, Debug)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    /// Creates a new Storage instance with the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns `true` if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the entire storage file into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn load(&self) -> std::io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    /// Saves data to the storage file using atomic write.
    ///
    /// This method ensures crash-safety by:
    /// 1. Writing data to a temporary file with random name
    /// 2. Syncing the temporary file to disk
    /// 3. Atomically replacing the old file with the new one
    /// 4. Syncing the parent directory to ensure the rename is persisted
    ///
    /// If a crash occurs during save, either the old or new file will be present,
    /// never a corrupted partial write.
    ///
    /// Creates parent directories if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        self.stage(data)?.commit()
    }

    /// Writes `data` next to the target without replacing it.
    ///
    /// The returned [`StagedFile`] can be read back and inspected before
    /// [`StagedFile::commit`] swaps it into place. Dropping it uncommitted
    /// removes the temporary file.
    pub fn stage(&self, data: &[u8]) -> Result<StagedFile> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.random_tmp_path()?;

        // securely create temp file (fail if exists)
        let mut tmp_file = private_options()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .context("failed to create temporary file")?;

        let staged = StagedFile {
            target: self.clone(),
            tmp_path,
            committed: false,
        };

        tmp_file.write_all(data)?;
        tmp_file.sync_all()?; //fsync file

        Ok(staged)
    }

    /// Deletes the file. Missing files are not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }

    /// Overwrites the file contents in place `passes` times with random
    /// bytes, syncing after each pass, then once with zeros.
    ///
    /// On copy-on-write or wear-levelled media the old blocks may survive.
    pub fn overwrite(&self, passes: u32) -> Result<()> {
        let len = fs::metadata(&self.path)
            .with_context(|| format!("failed to stat {}", self.path.display()))?
            .len();

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {} for overwrite", self.path.display()))?;

        let mut chunk = vec![0u8; 64 * 1024];
        for _ in 0..passes {
            write_pattern(&mut file, len, &mut chunk, true)?;
        }
        write_pattern(&mut file, len, &mut chunk, false)?;
        Ok(())
    }

    /// [`overwrite`](Self::overwrite) followed by [`remove`](Self::remove).
    pub fn shred(&self, passes: u32) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }
        self.overwrite(passes)?;
        self.remove()
    }

    /// Returns the path to the storage file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Generates a unique temporary file path in the same directory.
    ///
    /// Uses cryptographically secure random bytes to avoid name collisions.
    /// Format: `filename.tmp.<randomhex>`
    fn random_tmp_path(&self) -> Result<PathBuf> {
        let mut buf = [0u8; 8]; // 64 bit entropy
        fill(&mut buf)?;

        let file_name = self
            .path
            .file_name()
            .context("storage path has no file name")?
            .to_string_lossy();

        let tmp_name = format!("{}.tmp.{}", file_name, hex::encode(buf));

        Ok(self.path.with_file_name(tmp_name))
    }

    /// Atomically replaces the target file with the temporary file.
    ///
    /// Uses Windows `ReplaceFileW` API with `REPLACEFILE_WRITE_THROUGH` flag
    /// to ensure the operation is truly atomic and persisted to disk.
    #[cfg(target_os = "windows")]
    fn atomic_replace(&self, tmp_path: &Path) -> Result<()> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

        if !self.path.exists() {
            fs::rename(tmp_path, &self.path)?;
            return Ok(());
        }

        fn to_wide(s: &OsStr) -> Vec<u16> {
            s.encode_wide().chain(std::iter::once(0)).collect()
        }

        let target_w = to_wide(self.path.as_os_str());
        let tmp_w = to_wide(tmp_path.as_os_str());

        // SAFETY:
        // - Strings are valid UTF-16 and null-terminated
        // - Pointers remain valid during the call
        // - Windows does not retain the pointers after return
        let result = unsafe {
            ReplaceFileW(
                target_w.as_ptr(),
                tmp_w.as_ptr(),
                std::ptr::null(),
                REPLACEFILE_WRITE_THROUGH,
                std::ptr::null(),
                std::ptr::null(),
            )
        };

        if result == 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context("atomic replace failed");
        }

        Ok(())
    }

    /// Atomically replaces the target file with the temporary file.
    ///
    /// On Unix, `rename()` is atomic when both paths are on the same filesystem.
    #[cfg(not(target_os = "windows"))]
    fn atomic_replace(&self, tmp_path: &Path) -> Result<()> {
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }

    fn sync_parent(&self) -> Result<()> {
        #[cfg(not(target_os = "windows"))]
        {
            if let Some(parent) = self.path.parent() {
                let dir = File::open(parent)?;
                dir.sync_all()?;
            }
        }
        Ok(())
    }
}

/// A fully written temporary file waiting to replace its target.
#[derive(Debug)]
pub struct StagedFile {
    target: Storage,
    tmp_path: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn load(&self) -> std::io::Result<Vec<u8>> {
        fs::read(&self.tmp_path)
    }

    /// Atomically moves the staged file over its target.
    pub fn commit(mut self) -> Result<()> {
        self.target.atomic_replace(&self.tmp_path)?;
        self.committed = true;
        self.target.sync_parent()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn write_pattern(file: &mut File, len: u64, chunk: &mut [u8], random: bool) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u64) as usize;
        if random {
            fill(&mut chunk[..n])?;
        } else {
            chunk[..n].fill(0);
        }
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()?;
    Ok(())
}

/// Files are created readable by the owner only.
fn private_options() -> OpenOptions {
    #[allow(unused_mut)]
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    // --------------------------------------------------
    // LOAD TESTS
    // --------------------------------------------------

    #[test]
    fn load_returns_written_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let storage = Storage::new(path.clone());
        storage.save(b"hello world").unwrap();

        let data = storage.load().unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn load_fails_if_file_does_not_exist() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("missing.db"));

        let err = storage.load().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    // --------------------------------------------------
    // SAVE / STAGE TESTS
    // --------------------------------------------------

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let storage = Storage::new(path.clone());

        storage.save(b"first").unwrap();
        storage.save(b"second").unwrap();

        let content = fs::read(path).unwrap();
        assert_eq!(content, b"second");
    }

    #[test]
    fn tmp_file_is_removed_after_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let storage = Storage::new(path.clone());
        storage.save(b"data").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], "store.db");
    }

    #[test]
    fn parent_directory_is_created() {
        let dir = tempdir().unwrap();

        let nested = dir.path().join("a").join("b").join("c").join("store.db");

        let storage = Storage::new(nested.clone());
        storage.save(b"data").unwrap();

        assert!(nested.exists());
    }

    #[test]
    fn staged_file_leaves_target_untouched_until_commit() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("keys.json"));
        storage.save(b"old").unwrap();

        let staged = storage.stage(b"new").unwrap();
        assert_eq!(staged.load().unwrap(), b"new");
        assert_eq!(storage.load().unwrap(), b"old");

        staged.commit().unwrap();
        assert_eq!(storage.load().unwrap(), b"new");
    }

    #[test]
    fn dropped_staged_file_is_cleaned_up() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("keys.json"));
        storage.save(b"old").unwrap();

        let tmp = {
            let staged = storage.stage(b"new").unwrap();
            staged.path().to_path_buf()
        };

        assert!(!tmp.exists());
        assert_eq!(storage.load().unwrap(), b"old");
    }

    #[test]
    fn tmp_names_are_unique() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("store.db"));

        let a = storage.random_tmp_path().unwrap();
        let b = storage.random_tmp_path().unwrap();

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn saved_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("auth.json"));
        storage.save(b"x").unwrap();

        let mode = fs::metadata(storage.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // --------------------------------------------------
    // DESTRUCTION TESTS
    // --------------------------------------------------

    #[test]
    fn overwrite_keeps_length_and_zeroes_content() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("blob"));
        let original = vec![0xAB; 100_000];
        storage.save(&original).unwrap();

        storage.overwrite(2).unwrap();

        let after = storage.load().unwrap();
        assert_eq!(after.len(), original.len());
        assert!(after.iter().all(|b| *b == 0));
    }

    #[test]
    fn shred_removes_file() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("blob"));
        storage.save(b"secret").unwrap();

        storage.shred(3).unwrap();
        assert!(!storage.exists());
    }

    #[test]
    fn removing_missing_file_is_ok() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("nothing"));
        storage.remove().unwrap();
        storage.shred(1).unwrap();
    }
}
