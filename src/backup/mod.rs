//! Zip snapshots of an instance directory.
//!
//! Archives live in `<base>/backups/<name>.zip` and cover everything under the
//! base directory except that top-level `backups/` folder. Creation writes to a
//! temp file in the same folder and renames on success, so a half-written
//! archive is never listed. Restore extracts into a staging directory first and
//! only touches the live tree once extraction has fully succeeded.

pub mod schedule;

pub use schedule::BackupScheduler;

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tokio::sync::watch;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::instance::{ServerInstance, BACKUPS_DIR};
use crate::supervisor::SupervisorError;

const ARCHIVE_EXT: &str = "zip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub size: u64,
    /// Archive mtime, unix seconds
    pub created_at: u64,
}

/// Backup operations for one instance. Clones share the operation lock.
#[derive(Clone)]
pub struct BackupManager {
    instance: ServerInstance,
    running: watch::Receiver<bool>,
    /// One create/restore/delete/prune in flight per instance
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

impl BackupManager {
    pub fn new(instance: ServerInstance, running: watch::Receiver<bool>) -> Self {
        Self {
            instance,
            running,
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn archive_path(&self, name: &str) -> PathBuf {
        self.instance
            .backups_dir()
            .join(format!("{}.{}", name, ARCHIVE_EXT))
    }

    /// Archive the instance directory. Allowed while the server runs (best effort).
    pub async fn create(&self, name: Option<&str>) -> Result<BackupInfo, SupervisorError> {
        let name = backup_name(name)?;
        let _op = self.op_lock.lock().await;

        let dest = self.archive_path(&name);
        if dest.exists() {
            return Err(SupervisorError::BackupError(format!("backup '{}' already exists", name)));
        }
        if self.is_running() {
            tracing::info!("[{}] Creating backup '{}' of a running server", self.instance.name(), name);
        }

        let base_dir = self.instance.base_dir().to_path_buf();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || write_archive(&base_dir, &target))
            .await
            .map_err(|e| SupervisorError::BackupError(format!("backup task failed: {}", e)))??;

        let info = backup_info(&dest).map_err(|e| SupervisorError::BackupError(e.to_string()))?;
        tracing::info!(
            "[{}] Backup '{}' created ({} bytes)",
            self.instance.name(),
            info.name,
            info.size
        );
        Ok(info)
    }

    /// Archives in `backups/`, newest first.
    pub fn list(&self) -> Result<Vec<BackupInfo>, SupervisorError> {
        let dir = self.instance.backups_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SupervisorError::BackupError(format!("{}: {}", dir.display(), e))),
        };

        let mut backups: Vec<BackupInfo> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map(|x| x == ARCHIVE_EXT).unwrap_or(false))
            .filter_map(|p| backup_info(&p).ok())
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        Ok(backups)
    }

    /// Replace the instance directory (except `backups/`) with the archive contents.
    pub async fn restore(&self, name: &str) -> Result<(), SupervisorError> {
        validate_backup_name(name)?;
        if self.is_running() {
            return Err(SupervisorError::ServerRunning(self.instance.name().to_string()));
        }
        let _op = self.op_lock.lock().await;
        // 락을 기다리는 동안 서버가 켜졌을 수도 있음
        if self.is_running() {
            return Err(SupervisorError::ServerRunning(self.instance.name().to_string()));
        }

        let archive = self.archive_path(name);
        if !archive.is_file() {
            return Err(SupervisorError::BackupNotFound(name.to_string()));
        }

        tracing::info!("[{}] Restoring backup '{}'", self.instance.name(), name);
        let base_dir = self.instance.base_dir().to_path_buf();
        tokio::task::spawn_blocking(move || restore_archive(&archive, &base_dir))
            .await
            .map_err(|e| SupervisorError::RestoreError(format!("restore task failed: {}", e)))??;
        tracing::info!("[{}] Backup '{}' restored", self.instance.name(), name);
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), SupervisorError> {
        validate_backup_name(name)?;
        let _op = self.op_lock.lock().await;
        self.delete_locked(name)
    }

    fn delete_locked(&self, name: &str) -> Result<(), SupervisorError> {
        let path = self.archive_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("[{}] Deleted backup '{}'", self.instance.name(), name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SupervisorError::BackupNotFound(name.to_string())),
            Err(e) => Err(SupervisorError::BackupError(format!("{}: {}", path.display(), e))),
        }
    }

    /// Keep the newest `max_backups` archives; negative keeps everything.
    /// Returns the deleted names.
    pub async fn prune(&self, max_backups: i64) -> Result<Vec<String>, SupervisorError> {
        if max_backups < 0 {
            return Ok(Vec::new());
        }
        let _op = self.op_lock.lock().await;
        let backups = self.list()?;
        let mut removed = Vec::new();
        for old in backups.into_iter().skip(max_backups as usize) {
            self.delete_locked(&old.name)?;
            removed.push(old.name);
        }
        if !removed.is_empty() {
            tracing::info!(
                "[{}] Pruned {} backup(s), keeping {}",
                self.instance.name(),
                removed.len(),
                max_backups
            );
        }
        Ok(removed)
    }
}

// ─── Names ───────────────────────────────────────────────────

/// Explicit name (without `.zip`) or a timestamped default.
pub fn backup_name(name: Option<&str>) -> Result<String, SupervisorError> {
    let name = name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Ok(chrono::Local::now().format("backup_%Y%m%d_%H%M%S").to_string());
    }
    let name = name.strip_suffix(".zip").unwrap_or(name);
    validate_backup_name(name)?;
    Ok(name.to_string())
}

fn validate_backup_name(name: &str) -> Result<(), SupervisorError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") || name.starts_with('.') {
        return Err(SupervisorError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn backup_info(path: &Path) -> io::Result<BackupInfo> {
    let meta = fs::metadata(path)?;
    let created_at = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(BackupInfo {
        name,
        size: meta.len(),
        created_at,
    })
}

// ─── Archive I/O (blocking) ──────────────────────────────────

fn backup_err(context: impl std::fmt::Display, e: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::BackupError(format!("{}: {}", context, e))
}

fn restore_err(context: impl std::fmt::Display, e: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::RestoreError(format!("{}: {}", context, e))
}

fn write_archive(base_dir: &Path, dest: &Path) -> Result<(), SupervisorError> {
    let backups_dir = dest
        .parent()
        .ok_or_else(|| backup_err(dest.display(), "no parent directory"))?;
    fs::create_dir_all(backups_dir).map_err(|e| backup_err(backups_dir.display(), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(backups_dir).map_err(|e| backup_err(backups_dir.display(), e))?;
    {
        let mut zip = ZipWriter::new(tmp.as_file_mut());
        add_dir(&mut zip, base_dir, Path::new(""))?;
        zip.finish().map_err(|e| backup_err(dest.display(), e))?;
    }
    tmp.as_file().sync_all().map_err(|e| backup_err(dest.display(), e))?;
    // 완성된 아카이브만 보이도록 마지막에 rename
    tmp.persist_noclobber(dest)
        .map_err(|e| backup_err(dest.display(), e.error))?;
    Ok(())
}

/// Depth-first walk; `rel` is the path inside the archive.
fn add_dir<W: io::Write + io::Seek>(zip: &mut ZipWriter<W>, base_dir: &Path, rel: &Path) -> Result<(), SupervisorError> {
    let dir = base_dir.join(rel);
    let mut entries: Vec<_> = fs::read_dir(&dir)
        .map_err(|e| backup_err(dir.display(), e))?
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                None
            }
        })
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if rel.as_os_str().is_empty() && name == BACKUPS_DIR {
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Skipping {} in backup: {}", entry.path().display(), e);
                continue;
            }
        };
        let rel_path = rel.join(&name);
        let zip_name = rel_path.to_string_lossy().replace('\\', "/");

        if file_type.is_dir() {
            zip.add_directory(format!("{}/", zip_name), FileOptions::default())
                .map_err(|e| backup_err(&zip_name, e))?;
            add_dir(zip, base_dir, &rel_path)?;
        } else if file_type.is_file() {
            let path = entry.path();
            let mut file = match File::open(&path) {
                Ok(f) => f,
                // 실행 중인 서버가 지웠거나 잠근 파일 (session.lock 등)
                Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                    tracing::warn!("Skipping {} in backup: {}", path.display(), e);
                    continue;
                }
                Err(e) => return Err(backup_err(path.display(), e)),
            };
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .large_file(size >= u32::MAX as u64);
            zip.start_file(zip_name.as_str(), options)
                .map_err(|e| backup_err(&zip_name, e))?;
            io::copy(&mut file, zip).map_err(|e| backup_err(path.display(), e))?;
        } else {
            // 심볼릭 링크, 소켓 등은 아카이브에 넣지 않음
            tracing::warn!("Skipping {} in backup: not a regular file or directory", entry.path().display());
        }
    }
    Ok(())
}

fn restore_archive(archive_path: &Path, base_dir: &Path) -> Result<(), SupervisorError> {
    let backups_dir = base_dir.join(BACKUPS_DIR);
    let staging = tempfile::Builder::new()
        .prefix(".restore-")
        .tempdir_in(&backups_dir)
        .map_err(|e| restore_err(backups_dir.display(), e))?;
    let incoming = staging.path().join("incoming");
    let previous = staging.path().join("previous");
    for dir in [&incoming, &previous] {
        fs::create_dir(dir).map_err(|e| restore_err(dir.display(), e))?;
    }

    extract_to(archive_path, &incoming)?;
    // 추출이 끝난 뒤에만 라이브 트리를 건드림
    swap_in(base_dir, &incoming, &previous)
}

/// Move the live entries (except `backups/`) aside into `previous`, then move
/// `incoming` into place. Any failure puts the old entries back.
fn swap_in(base_dir: &Path, incoming: &Path, previous: &Path) -> Result<(), SupervisorError> {
    let displaced = match move_all(base_dir, previous, Some(BACKUPS_DIR)) {
        Ok(names) => names,
        Err((moved, e)) => {
            move_back(previous, base_dir, &moved);
            return Err(e);
        }
    };

    if let Err((moved_in, e)) = move_all(incoming, base_dir, None) {
        tracing::error!(
            "Restore into {} failed after {} entries, rolling back: {}",
            base_dir.display(),
            moved_in.len(),
            e
        );
        for name in &moved_in {
            let path = base_dir.join(name);
            if let Err(re) = remove_path(&path) {
                tracing::warn!("Could not remove restored {}: {}", path.display(), re);
            }
        }
        move_back(previous, base_dir, &displaced);
        return Err(e);
    }
    Ok(())
}

type MoveFailure = (Vec<OsString>, SupervisorError);

/// Move every entry of `from` into `to`, in name order. On failure the names
/// already moved come back with the error.
fn move_all(from: &Path, to: &Path, skip: Option<&str>) -> Result<Vec<OsString>, MoveFailure> {
    let mut names: Vec<OsString> = match fs::read_dir(from) {
        Ok(entries) => entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.file_name()),
                Err(e) => {
                    tracing::warn!("Unreadable entry in {}: {}", from.display(), e);
                    None
                }
            })
            .filter(|name| skip.map_or(true, |s| name != s))
            .collect(),
        Err(e) => return Err((Vec::new(), restore_err(from.display(), e))),
    };
    names.sort();

    let mut moved = Vec::with_capacity(names.len());
    for name in names {
        let target = to.join(&name);
        if let Err(e) = move_entry(&from.join(&name), &target) {
            return Err((moved, restore_err(target.display(), e)));
        }
        moved.push(name);
    }
    Ok(moved)
}

fn move_back(from: &Path, to: &Path, names: &[OsString]) {
    for name in names {
        let target = to.join(name);
        if let Err(e) = move_entry(&from.join(name), &target) {
            tracing::error!("Could not put back {}: {}", target.display(), e);
        }
    }
}

/// Rename, falling back to copy + delete across filesystems.
fn move_entry(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if fs::symlink_metadata(from)?.is_dir() {
        crate::instance::provision::copy_dir_recursive(from, to)?;
    } else {
        fs::copy(from, to)?;
    }
    remove_path(from)
}

fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn extract_to(archive_path: &Path, dest: &Path) -> Result<(), SupervisorError> {
    let file = File::open(archive_path).map_err(|e| restore_err(archive_path.display(), e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| restore_err(archive_path.display(), e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| restore_err(archive_path.display(), e))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(restore_err(entry.name(), "unsafe path in archive"));
        };
        if matches!(rel.components().next(), Some(Component::Normal(first)) if first == BACKUPS_DIR) {
            continue;
        }
        let out_path = dest.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| restore_err(out_path.display(), e))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| restore_err(parent.display(), e))?;
            }
            let mut out = File::create(&out_path).map_err(|e| restore_err(out_path.display(), e))?;
            io::copy(&mut entry, &mut out).map_err(|e| restore_err(out_path.display(), e))?;
        }
    }
    Ok(())
}
