//! The system mount table (`/etc/mtab`).
//!
//! Every change is a locked read-modify-write: an exclusive `fs2` lock on
//! `<table>~` is taken with a bounded wait, the whole table is rewritten to
//! a temporary file in the same directory and renamed over the original.
//! Lines this module cannot parse are carried through untouched.
//!
//! When the table is a symlink (usually to `/proc/self/mounts`) the kernel
//! owns it and nothing is recorded.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, trace};

use crate::options::{MountFlags, canonicalize};

pub const DEFAULT_MOUNT_TABLE: &str = "/etc/mtab";

/// Longest wait for the mount table lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(50);

/// A mount table failure. Callers report these as warnings; they never
/// abort a mount.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot access mount table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {timeout:?} waiting for mount table lock {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },
}

impl RegistryError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One fstab-format line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: String,
    pub fstype: String,
    pub options: String,
    pub freq: u32,
    pub passno: u32,
}

impl MountEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            escape(&self.source),
            escape(&self.mount_point),
            escape(&self.fstype),
            escape(&self.options),
            self.freq,
            self.passno
        )
    }

    /// Parses a line; comments and malformed lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut parts = line.split_whitespace();
        let source = unescape(parts.next()?);
        let mount_point = unescape(parts.next()?);
        let fstype = unescape(parts.next()?);
        let options = parts.next().map_or_else(|| "defaults".to_string(), unescape);
        let freq = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let passno = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Some(Self {
            source,
            mount_point,
            fstype,
            options,
            freq,
            passno,
        })
    }
}

/// Escapes space, tab, newline and backslash as three-digit octal.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\040"),
            '\t' => out.push_str("\\011"),
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`]. A backslash not followed by three octal digits is
/// kept literally.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        let digits = tail.get(..3).filter(|d| d.bytes().all(|b| (b'0'..=b'7').contains(&b)));
        match digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
            Some(code) => {
                out.push(char::from(code));
                rest = &tail[3..];
            }
            None => {
                out.push('\\');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Handle on a mount table file.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
    lock_path: PathBuf,
    disabled: bool,
}

impl MountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push("~");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            disabled: false,
        }
    }

    /// The system table at [`DEFAULT_MOUNT_TABLE`].
    pub fn system() -> Self {
        Self::new(DEFAULT_MOUNT_TABLE)
    }

    /// A table on which every update is a successful no-op (`-n`).
    #[must_use]
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether updates reach the file.
    pub fn is_active(&self) -> bool {
        if self.disabled {
            return false;
        }
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                debug!(path = %self.path.display(), "mount table is a symlink, not recording");
                false
            }
            _ => true,
        }
    }

    /// Current entries, read without locking.
    pub fn entries(&self) -> Result<Vec<MountEntry>, RegistryError> {
        Ok(self
            .read_lines()?
            .iter()
            .filter_map(|l| MountEntry::parse_line(l))
            .collect())
    }

    /// Records a mount.
    ///
    /// With `REMOUNT` in `flags` the last entry for `mount_point` is
    /// replaced in place (appended if there is none); otherwise a new entry
    /// is appended.
    pub fn record_mount(
        &self,
        source: &str,
        mount_point: &Path,
        fstype: &str,
        flags: MountFlags,
        extra: &str,
    ) -> Result<(), RegistryError> {
        if !self.is_active() {
            return Ok(());
        }
        let entry = MountEntry {
            source: source.to_string(),
            mount_point: mount_point.to_string_lossy().into_owned(),
            fstype: fstype.to_string(),
            options: canonicalize(flags, extra),
            freq: 0,
            passno: 0,
        };
        let remount = flags.contains(MountFlags::REMOUNT);
        self.with_lock(|lines| {
            let line = entry.to_line();
            match find_last(lines, &entry.mount_point).filter(|_| remount) {
                Some(i) => lines[i] = line,
                None => lines.push(line),
            }
        })?;
        debug!(
            source,
            mount_point = %mount_point.display(),
            options = %entry.options,
            remount,
            "recorded mount"
        );
        Ok(())
    }

    /// Removes the last entry for `mount_point`, if any.
    pub fn remove_mount(&self, mount_point: &Path) -> Result<(), RegistryError> {
        if !self.is_active() {
            return Ok(());
        }
        let target = mount_point.to_string_lossy().into_owned();
        let removed = self.with_lock(|lines| {
            find_last(lines, &target).map(|i| lines.remove(i)).is_some()
        })?;
        debug!(mount_point = %mount_point.display(), removed, "removed mount entry");
        Ok(())
    }

    fn read_lines(&self) -> Result<Vec<String>, RegistryError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(RegistryError::io(&self.path, e)),
        }
    }

    /// Runs `f` over the table's lines under the lock and writes the result back.
    fn with_lock<F, R>(&self, f: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut Vec<String>) -> R,
    {
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| RegistryError::io(&self.lock_path, e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        return Err(RegistryError::LockTimeout {
                            path: self.lock_path.clone(),
                            timeout: LOCK_TIMEOUT,
                        });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(RegistryError::io(&self.lock_path, e)),
            }
        }
        trace!(path = %self.lock_path.display(), "mount table locked");

        let result = self.read_lines().and_then(|mut lines| {
            let out = f(&mut lines);
            self.write_lines(&lines)?;
            Ok(out)
        });

        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), RegistryError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| RegistryError::io(dir, e))?;
        for line in lines {
            writeln!(tmp, "{line}").map_err(|e| RegistryError::io(tmp.path(), e))?;
        }
        tmp.as_file()
            .set_permissions(Permissions::from_mode(0o644))
            .map_err(|e| RegistryError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| RegistryError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| RegistryError::io(&self.path, e.error))?;
        Ok(())
    }
}

fn find_last(lines: &[String], mount_point: &str) -> Option<usize> {
    lines.iter().rposition(|l| {
        MountEntry::parse_line(l).is_some_and(|e| e.mount_point == mount_point)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table() -> (TempDir, MountTable) {
        let dir = tempfile::tempdir().unwrap();
        let table = MountTable::new(dir.path().join("mtab"));
        (dir, table)
    }

    #[test]
    fn test_escape_round_trip() {
        let raw = "/mnt/my dir\twith\\odd\nchars";
        let escaped = escape(raw);
        assert_eq!(escaped, "/mnt/my\\040dir\\011with\\134odd\\012chars");
        assert_eq!(unescape(&escaped), raw);
    }

    #[test]
    fn test_unescape_keeps_invalid_sequences() {
        assert_eq!(unescape("a\\9bc"), "a\\9bc");
        assert_eq!(unescape("trailing\\"), "trailing\\");
        assert_eq!(unescape("\\04"), "\\04");
    }

    #[test]
    fn test_parse_line() {
        let e = MountEntry::parse_line("srv:/x /mnt/a\\040b fuse.nfs rw,noatime 0 0").unwrap();
        assert_eq!(e.source, "srv:/x");
        assert_eq!(e.mount_point, "/mnt/a b");
        assert_eq!(e.fstype, "fuse.nfs");
        assert_eq!(e.options, "rw,noatime");
        assert!(MountEntry::parse_line("# comment").is_none());
        assert!(MountEntry::parse_line("too short").is_none());
    }

    #[test]
    fn test_record_appends() {
        let (_dir, table) = table();
        table
            .record_mount("h:/e", Path::new("/mnt/a"), "fuse.nfs", MountFlags::RDONLY, "vers=3")
            .unwrap();
        table
            .record_mount("h:/f", Path::new("/mnt/b"), "fuse.nfs", MountFlags::empty(), "")
            .unwrap();
        let entries = table.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].options, "ro,vers=3");
        assert_eq!(entries[1].options, "rw");
    }

    #[test]
    fn test_remount_updates_in_place() {
        let (_dir, table) = table();
        let mp = Path::new("/mnt/a");
        table.record_mount("h:/e", mp, "fuse.nfs", MountFlags::empty(), "").unwrap();
        table
            .record_mount("h:/other", Path::new("/mnt/b"), "fuse.nfs", MountFlags::empty(), "")
            .unwrap();
        table
            .record_mount(
                "h:/e",
                mp,
                "fuse.nfs",
                MountFlags::REMOUNT | MountFlags::RDONLY,
                "",
            )
            .unwrap();
        let entries = table.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mount_point, "/mnt/a");
        assert!(entries[0].options.starts_with("ro"));
    }

    #[test]
    fn test_remove_keeps_other_lines() {
        let (dir, table) = table();
        fs::write(dir.path().join("mtab"), "# keep me\nproc /proc proc rw 0 0\n").unwrap();
        table
            .record_mount("h:/e", Path::new("/mnt/a"), "fuse.nfs", MountFlags::empty(), "")
            .unwrap();
        table.remove_mount(Path::new("/mnt/a")).unwrap();
        let contents = fs::read_to_string(dir.path().join("mtab")).unwrap();
        assert_eq!(contents, "# keep me\nproc /proc proc rw 0 0\n");
        // Removing again is harmless.
        table.remove_mount(Path::new("/mnt/a")).unwrap();
    }

    #[test]
    fn test_disabled_table_is_untouched() {
        let (dir, table) = table();
        let table = table.disabled(true);
        table
            .record_mount("h:/e", Path::new("/mnt/a"), "fuse.nfs", MountFlags::empty(), "")
            .unwrap();
        assert!(!dir.path().join("mtab").exists());
    }

    #[test]
    fn test_symlinked_table_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("mounts");
        fs::write(&real, "").unwrap();
        let link = dir.path().join("mtab");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let table = MountTable::new(&link);
        assert!(!table.is_active());
        table
            .record_mount("h:/e", Path::new("/mnt/a"), "fuse.nfs", MountFlags::empty(), "")
            .unwrap();
        assert_eq!(fs::read_to_string(&real).unwrap(), "");
    }

    #[test]
    fn test_lock_timeout() {
        let (dir, table) = table();
        let lock = fs::File::create(dir.path().join("mtab~")).unwrap();
        FileExt::lock_exclusive(&lock).unwrap();

        // flock locks are per open file description, so a second open contends.
        let err = table
            .record_mount("h:/e", Path::new("/mnt/a"), "fuse.nfs", MountFlags::empty(), "")
            .unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout { .. }));
    }

    #[test]
    fn test_unwritable_directory_is_an_error() {
        let table = MountTable::new("/nonexistent-dir/for/mtab");
        let err = table
            .record_mount("h:/e", Path::new("/mnt/a"), "fuse.nfs", MountFlags::empty(), "")
            .unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }
}
