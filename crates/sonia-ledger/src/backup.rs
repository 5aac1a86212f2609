//! Hot backup and restore of the memory ledger.
//!
//! Backups are taken with SQLite's online backup API against the live
//! database, so readers and the writer keep running. Each backup file has
//! a sibling `.manifest.json` recording its checksum and provenance;
//! verification and restore work from the manifest alone.
//!
//! Encryption is best-effort platform file protection: when the platform
//! hook is unavailable the backup falls back to plaintext with a warning
//! and never fails.

use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};

/// Manifest written next to every backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// `memory-YYYYMMDD-HHMMSS[-label]`.
    pub backup_id: String,
    /// Timestamp component of the id.
    pub timestamp: String,
    /// The database that was backed up.
    pub source_path: String,
    /// The backup file.
    pub backup_path: String,
    /// SHA-256 of the backup file as written (post-encryption).
    pub sha256: String,
    /// Size of the backup file in bytes.
    pub size_bytes: u64,
    /// Optional label supplied by the caller.
    pub label: Option<String>,
    /// Whether platform encryption was applied.
    pub encrypted: bool,
    /// Whether the source was in WAL mode at backup time.
    pub wal_mode: bool,
}

/// Result of verifying a backup.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// The verified backup.
    pub backup_id: String,
    /// Whether every check passed.
    pub verified: bool,
    /// Checks passed out of [`VerifyReport::checks_total`].
    pub checks_passed: u32,
    /// Total checks run.
    pub checks_total: u32,
    /// Failure details.
    pub errors: Vec<String>,
}

/// Result of a restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// The restored backup.
    pub backup_id: String,
    /// Whether the restore (or dry-run validation) succeeded.
    pub success: bool,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Where the database was (or would be) restored.
    pub target_path: String,
    /// Journal mode of the restored file, live restores only.
    pub wal_mode: Option<bool>,
    /// Whether it matches the manifest's recorded mode.
    pub wal_mode_match: Option<bool>,
}

/// Hot backup manager for one ledger database.
#[derive(Debug)]
pub struct BackupManager {
    db_path: PathBuf,
    backup_dir: PathBuf,
    encrypt: bool,
    max_backups: usize,
}

impl BackupManager {
    /// Create a manager for `db_path`, writing backups under `backup_dir`.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the backup directory cannot be created.
    pub fn new(
        db_path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        encrypt: bool,
        max_backups: usize,
    ) -> LedgerResult<Self> {
        let backup_dir = backup_dir.into();
        fs::create_dir_all(&backup_dir)?;
        Ok(Self {
            db_path: db_path.into(),
            backup_dir,
            encrypt,
            max_backups,
        })
    }

    /// Create a hot backup. Returns the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the source is missing or the online
    /// copy fails. Encryption failure is not an error.
    pub fn create_backup(&self, label: Option<&str>) -> LedgerResult<BackupManifest> {
        if !self.db_path.exists() {
            return Err(LedgerError::NotFound(format!(
                "database not found: {}",
                self.db_path.display()
            )));
        }

        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let label_suffix = label.map(|l| format!("-{l}")).unwrap_or_default();
        let backup_id = format!("memory-{timestamp}{label_suffix}");
        let mut backup_path = self.backup_dir.join(format!("{backup_id}.db"));

        info!(backup_id, "creating backup");

        let source = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut dest = Connection::open(&backup_path)?;
        {
            let backup = Backup::new(&source, &mut dest)?;
            if let Err(e) = backup.run_to_completion(64, std::time::Duration::from_millis(25), None)
            {
                let _ = fs::remove_file(&backup_path);
                return Err(LedgerError::Internal(format!(
                    "online backup failed for {backup_id}: {e}"
                )));
            }
        }
        drop(dest);

        let wal_mode = check_wal_mode(&self.db_path);

        let mut encrypted = false;
        if self.encrypt {
            match platform_encrypt(&backup_path) {
                Ok(enc_path) => {
                    backup_path = enc_path;
                    encrypted = true;
                }
                Err(e) => {
                    warn!(error = %e, "backup encryption unavailable, keeping plaintext");
                }
            }
        }

        let sha256 = compute_sha256(&backup_path)?;
        let size_bytes = fs::metadata(&backup_path)?.len();

        let manifest = BackupManifest {
            backup_id: backup_id.clone(),
            timestamp,
            source_path: self.db_path.display().to_string(),
            backup_path: backup_path.display().to_string(),
            sha256,
            size_bytes,
            label: label.map(str::to_string),
            encrypted,
            wal_mode,
        };

        let manifest_path = self.manifest_path(&backup_id);
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        info!(
            backup_id,
            size_bytes, encrypted, wal = wal_mode, "backup created"
        );
        Ok(manifest)
    }

    /// Verify a backup: size, checksum, readable schema.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] when the manifest is missing;
    /// verification failures are reported inside the report.
    pub fn verify_backup(&self, backup_id: &str) -> LedgerResult<VerifyReport> {
        let manifest = self.load_manifest(backup_id)?;
        let backup_path = PathBuf::from(&manifest.backup_path);
        let mut errors = Vec::new();

        if !backup_path.exists() {
            return Ok(VerifyReport {
                backup_id: backup_id.to_string(),
                verified: false,
                checks_passed: 0,
                checks_total: 4,
                errors: vec!["backup file not found".to_string()],
            });
        }

        let actual_size = fs::metadata(&backup_path)?.len();
        if actual_size != manifest.size_bytes {
            errors.push(format!(
                "size mismatch: expected {}, got {actual_size}",
                manifest.size_bytes
            ));
        }

        let actual_sha = compute_sha256(&backup_path)?;
        if actual_sha != manifest.sha256 {
            errors.push(format!(
                "sha256 mismatch: expected {}, got {actual_sha}",
                manifest.sha256
            ));
        }

        // Open read-only (decrypting first if needed) and confirm the
        // schema is intact
        let open_target = if manifest.encrypted {
            let tmp = self.backup_dir.join(format!("{backup_id}.verify.tmp"));
            match platform_decrypt(&backup_path, &tmp) {
                Ok(()) => Some(tmp),
                Err(e) => {
                    errors.push(format!("decryption verification failed: {e}"));
                    None
                }
            }
        } else {
            Some(backup_path.clone())
        };

        if let Some(target) = open_target {
            match Connection::open_with_flags(&target, OpenFlags::SQLITE_OPEN_READ_ONLY) {
                Ok(conn) => {
                    let schema_ok: Result<i64, _> =
                        conn.query_row("SELECT count(*) FROM sqlite_master", [], |r| r.get(0));
                    if let Err(e) = schema_ok {
                        errors.push(format!("schema not readable: {e}"));
                    }
                }
                Err(e) => errors.push(format!("not a valid database: {e}")),
            }
            if manifest.encrypted {
                let _ = fs::remove_file(&target);
            }
        }

        let verified = errors.is_empty();
        info!(backup_id, verified, "backup verification");
        Ok(VerifyReport {
            backup_id: backup_id.to_string(),
            verified,
            checks_passed: 4 - errors.len().min(4) as u32,
            checks_total: 4,
            errors,
        })
    }

    /// Restore a backup. `dry_run` verifies and reports without touching
    /// the target; a live restore moves the current database aside as
    /// `.pre-restore` first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the manifest is missing, verification
    /// fails, or the copy fails.
    pub fn restore(
        &self,
        backup_id: &str,
        target: Option<&Path>,
        dry_run: bool,
    ) -> LedgerResult<RestoreReport> {
        let manifest = self.load_manifest(backup_id)?;
        let target_path = target.unwrap_or(&self.db_path).to_path_buf();

        let verification = self.verify_backup(backup_id)?;
        if !verification.verified {
            return Err(LedgerError::BackupVerification(verification.errors));
        }

        if dry_run {
            return Ok(RestoreReport {
                backup_id: backup_id.to_string(),
                success: true,
                dry_run: true,
                target_path: target_path.display().to_string(),
                wal_mode: None,
                wal_mode_match: None,
            });
        }

        let backup_path = PathBuf::from(&manifest.backup_path);
        let restore_source = if manifest.encrypted {
            let tmp = self.backup_dir.join(format!("{backup_id}.restore.tmp"));
            platform_decrypt(&backup_path, &tmp)
                .map_err(|e| LedgerError::Internal(format!("decryption failed: {e}")))?;
            tmp
        } else {
            backup_path
        };

        if target_path.exists() {
            let aside = target_path.with_extension("db.pre-restore");
            fs::copy(&target_path, &aside)?;
            info!(aside = %aside.display(), "current database moved aside");
        }

        fs::copy(&restore_source, &target_path)?;
        if manifest.encrypted {
            let _ = fs::remove_file(&restore_source);
        }

        let wal_mode = check_wal_mode(&target_path);
        info!(backup_id, target = %target_path.display(), "restore completed");

        Ok(RestoreReport {
            backup_id: backup_id.to_string(),
            success: true,
            dry_run: false,
            target_path: target_path.display().to_string(),
            wal_mode: Some(wal_mode),
            wal_mode_match: Some(wal_mode == manifest.wal_mode),
        })
    }

    /// List manifests, newest first.
    ///
    /// # Errors
    ///
    /// Returns IO errors reading the backup directory.
    pub fn list_backups(&self) -> LedgerResult<Vec<BackupManifest>> {
        let mut manifests = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.ends_with(".manifest.json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(LedgerError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(LedgerError::from))
            {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a: &BackupManifest, b: &BackupManifest| b.timestamp.cmp(&a.timestamp));
        Ok(manifests)
    }

    /// Prune the oldest backups beyond `max_backups`, deleting file and
    /// manifest together. Returns the pruned backup ids.
    ///
    /// # Errors
    ///
    /// Returns IO errors from the deletions.
    pub fn enforce_retention(&self) -> LedgerResult<Vec<String>> {
        let manifests = self.list_backups()?;
        let mut pruned = Vec::new();
        for manifest in manifests.iter().skip(self.max_backups) {
            let backup_path = PathBuf::from(&manifest.backup_path);
            if backup_path.exists() {
                fs::remove_file(&backup_path)?;
            }
            let manifest_path = self.manifest_path(&manifest.backup_id);
            if manifest_path.exists() {
                fs::remove_file(&manifest_path)?;
            }
            info!(backup_id = manifest.backup_id, "pruned backup");
            pruned.push(manifest.backup_id.clone());
        }
        Ok(pruned)
    }

    fn manifest_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{backup_id}.manifest.json"))
    }

    fn load_manifest(&self, backup_id: &str) -> LedgerResult<BackupManifest> {
        let path = self.manifest_path(backup_id);
        if !path.exists() {
            return Err(LedgerError::NotFound(format!(
                "manifest not found for {backup_id}"
            )));
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn compute_sha256(path: &Path) -> LedgerResult<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

fn check_wal_mode(path: &Path) -> bool {
    let Ok(conn) = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) else {
        return false;
    };
    conn.query_row("PRAGMA journal_mode", [], |r| r.get::<_, String>(0))
        .map(|mode| mode.eq_ignore_ascii_case("wal"))
        .unwrap_or(false)
}

/// Platform file-protection hook. No keyed store is wired on this build,
/// so encryption reports unavailable and callers fall back to plaintext.
fn platform_encrypt(_path: &Path) -> Result<PathBuf, String> {
    Err("platform file protection not available".to_string())
}

fn platform_decrypt(_encrypted: &Path, _output: &Path) -> Result<(), String> {
    Err("platform file protection not available".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;

    fn seeded_db(dir: &Path) -> (MemoryDatabase, PathBuf) {
        let path = dir.join("memory.db");
        let db = MemoryDatabase::open(&path).unwrap();
        db.store("note", "backup me", None).unwrap();
        (db, path)
    }

    #[test]
    fn test_create_and_verify_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), false, 7).unwrap();

        let manifest = manager.create_backup(Some("nightly")).unwrap();
        assert!(manifest.backup_id.contains("-nightly"));
        assert!(manifest.wal_mode);
        assert!(!manifest.encrypted);
        assert!(manifest.size_bytes > 0);

        let report = manager.verify_backup(&manifest.backup_id).unwrap();
        assert!(report.verified, "{:?}", report.errors);
        assert_eq!(report.checks_passed, 4);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), false, 7).unwrap();
        let manifest = manager.create_backup(None).unwrap();

        let mut bytes = fs::read(&manifest.backup_path).unwrap();
        bytes.extend_from_slice(b"tamper");
        fs::write(&manifest.backup_path, bytes).unwrap();

        let report = manager.verify_backup(&manifest.backup_id).unwrap();
        assert!(!report.verified);
        assert!(report.errors.iter().any(|e| e.contains("size mismatch")));
    }

    #[test]
    fn test_restore_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), false, 7).unwrap();
        let manifest = manager.create_backup(None).unwrap();

        db.store("note", "written after backup", None).unwrap();

        let report = manager.restore(&manifest.backup_id, None, true).unwrap();
        assert!(report.success);
        assert!(report.dry_run);
        // Post-backup write still present
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn test_restore_round_trip_into_fresh_target() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), false, 7).unwrap();
        let manifest = manager.create_backup(None).unwrap();

        let target = dir.path().join("restored.db");
        let report = manager
            .restore(&manifest.backup_id, Some(&target), false)
            .unwrap();
        assert!(report.success);
        assert_eq!(report.wal_mode_match, Some(true));

        // A fresh backup of the restored file has the same checksum
        let manager2 =
            BackupManager::new(&target, dir.path().join("backups2"), false, 7).unwrap();
        let manifest2 = manager2.create_backup(None).unwrap();
        assert_eq!(manifest.sha256, manifest2.sha256);
    }

    #[test]
    fn test_live_restore_moves_current_aside() {
        let dir = tempfile::tempdir().unwrap();
        let (db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), false, 7).unwrap();
        let manifest = manager.create_backup(None).unwrap();

        db.store("note", "will be rolled back", None).unwrap();
        drop(db);

        manager.restore(&manifest.backup_id, None, false).unwrap();
        assert!(db_path.with_extension("db.pre-restore").exists());

        let restored = MemoryDatabase::open(&db_path).unwrap();
        assert_eq!(restored.count().unwrap(), 1);
    }

    #[test]
    fn test_list_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), false, 2).unwrap();

        let first = manager.create_backup(Some("a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        manager.create_backup(Some("b")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        manager.create_backup(Some("c")).unwrap();

        let listed = manager.list_backups().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].timestamp >= listed[2].timestamp);

        let pruned = manager.enforce_retention().unwrap();
        assert_eq!(pruned, vec![first.backup_id.clone()]);
        assert_eq!(manager.list_backups().unwrap().len(), 2);
        assert!(!PathBuf::from(&first.backup_path).exists());
    }

    #[test]
    fn test_missing_manifest_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), false, 7).unwrap();
        assert!(matches!(
            manager.verify_backup("memory-00000000-000000"),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_encrypt_falls_back_to_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, db_path) = seeded_db(dir.path());
        let manager = BackupManager::new(&db_path, dir.path().join("backups"), true, 7).unwrap();
        let manifest = manager.create_backup(None).unwrap();
        assert!(!manifest.encrypted);
        assert!(manager.verify_backup(&manifest.backup_id).unwrap().verified);
    }
}
