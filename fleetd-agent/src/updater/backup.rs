use anyhow::{Context, Result};
use chrono::Utc;
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use fleetd_core::error::{FleetError, FleetResult};
use fleetd_core::types::{BackupEntry, BackupEntryKind, BackupManifest};

const MANIFEST_FILE: &str = "backup.json";
const DATA_DIR: &str = "data";

/// Snapshot the given paths into `backups/<id>/`. Plain files are copied;
/// directories are archived as tar.gz. Paths that do not exist are skipped.
pub async fn create_backup(
    backups_dir: &Path,
    id: &str,
    version: &str,
    paths: &[PathBuf],
) -> Result<BackupManifest> {
    let backup_dir = backups_dir.join(id);
    let data_dir = backup_dir.join(DATA_DIR);
    tokio::fs::create_dir_all(&data_dir).await?;

    let mut entries = Vec::new();
    let mut captured = Vec::new();
    let mut size: u64 = 0;

    for (idx, source) in paths.iter().enumerate() {
        let meta = match tokio::fs::metadata(source).await {
            Ok(meta) => meta,
            Err(_) => {
                warn!("Backup {}: skipping missing path {:?}", id, source);
                continue;
            }
        };

        let stem = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());

        if meta.is_dir() {
            let stored_rel = PathBuf::from(DATA_DIR).join(format!("{}_{}.tar.gz", idx, stem));
            let stored_abs = backup_dir.join(&stored_rel);
            archive_dir(source.clone(), stored_abs.clone()).await?;
            size += tokio::fs::metadata(&stored_abs).await.map(|m| m.len()).unwrap_or(0);
            entries.push(BackupEntry {
                source: source.clone(),
                stored: stored_rel,
                kind: BackupEntryKind::Archive,
            });
        } else {
            let stored_rel = PathBuf::from(DATA_DIR).join(format!("{}_{}", idx, stem));
            let stored_abs = backup_dir.join(&stored_rel);
            tokio::fs::copy(source, &stored_abs)
                .await
                .with_context(|| format!("Failed to copy {:?} into backup", source))?;
            size += meta.len();
            entries.push(BackupEntry {
                source: source.clone(),
                stored: stored_rel,
                kind: BackupEntryKind::File,
            });
        }
        captured.push(source.clone());
    }

    let manifest = BackupManifest {
        id: id.to_string(),
        version: version.to_string(),
        created_at: Utc::now(),
        size,
        files: captured,
        metadata: HashMap::new(),
        entries,
    };

    let manifest_json = serde_json::to_string_pretty(&manifest)?;
    tokio::fs::write(backup_dir.join(MANIFEST_FILE), manifest_json).await?;
    info!("Backup {} captured {} paths ({} bytes)", id, manifest.files.len(), size);
    Ok(manifest)
}

pub async fn load_manifest(backups_dir: &Path, id: &str) -> Result<BackupManifest> {
    let path = backups_dir.join(id).join(MANIFEST_FILE);
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read backup manifest {:?}", path))?;
    Ok(serde_json::from_str(&content)?)
}

/// Restore every path in the manifest. Files are replaced atomically via a
/// `.rollback` shadow; directory trees are re-extracted from their archive.
pub async fn restore_backup(backups_dir: &Path, manifest: &BackupManifest) -> FleetResult<()> {
    let backup_dir = backups_dir.join(&manifest.id);

    for entry in &manifest.entries {
        let stored_abs = backup_dir.join(&entry.stored);
        if !stored_abs.exists() {
            return Err(FleetError::Rollback(format!(
                "backup {} is missing stored copy for {:?}",
                manifest.id, entry.source
            )));
        }

        match entry.kind {
            BackupEntryKind::File => restore_file(&stored_abs, &entry.source).await?,
            BackupEntryKind::Archive => restore_tree(&stored_abs, &entry.source).await?,
        }
        info!("Restored {:?} from backup {}", entry.source, manifest.id);
    }
    Ok(())
}

async fn restore_file(stored: &Path, dest: &Path) -> FleetResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            FleetError::Rollback(format!("cannot create parent for {:?}: {}", dest, e))
        })?;
    }
    let mut shadow = dest.as_os_str().to_os_string();
    shadow.push(".rollback");
    let shadow = PathBuf::from(shadow);

    tokio::fs::copy(stored, &shadow)
        .await
        .map_err(|e| FleetError::Rollback(format!("staging {:?} failed: {}", dest, e)))?;
    if let Err(err) = tokio::fs::rename(&shadow, dest).await {
        let _ = tokio::fs::remove_file(&shadow).await;
        return Err(FleetError::Rollback(format!("replacing {:?} failed: {}", dest, err)));
    }
    Ok(())
}

async fn restore_tree(stored: &Path, dest: &Path) -> FleetResult<()> {
    let stored = stored.to_path_buf();
    let dest = dest.to_path_buf();
    let stored_for_blocking = stored.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        std::fs::create_dir_all(&dest)?;
        let file = std::fs::File::open(&stored_for_blocking)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.unpack(&dest)?;
        Ok(())
    })
    .await
    .map_err(|e| FleetError::Rollback(format!("restore task panicked: {}", e)))?
    .map_err(|e| FleetError::Rollback(format!("extracting {:?} failed: {:#}", stored, e)))
}

async fn archive_dir(source: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&dest)?;
        let encoder = GzEncoder::new(file, GzLevel::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &source)?;
        builder.into_inner()?.finish()?;
        Ok(())
    })
    .await
    .context("archive task panicked")?
}

/// Keep the newest `keep` backups; evict the rest oldest-first. Returns
/// the ids that were removed.
pub async fn enforce_retention(backups_dir: &Path, keep: usize) -> Result<Vec<String>> {
    let mut found: Vec<(chrono::DateTime<Utc>, String)> = Vec::new();
    let mut dir = match tokio::fs::read_dir(backups_dir).await {
        Ok(dir) => dir,
        Err(_) => return Ok(Vec::new()),
    };

    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        let created_at = match load_manifest(backups_dir, &id).await {
            Ok(manifest) => manifest.created_at,
            // Unreadable manifests sort oldest so they are evicted first
            Err(_) => chrono::DateTime::<Utc>::MIN_UTC,
        };
        found.push((created_at, id));
    }

    found.sort_by(|a, b| b.0.cmp(&a.0));
    let mut evicted = Vec::new();
    for (_, id) in found.into_iter().skip(keep) {
        let path = backups_dir.join(&id);
        if let Err(err) = tokio::fs::remove_dir_all(&path).await {
            warn!("Evicting backup {} failed: {}", id, err);
        } else {
            info!("Evicted backup {}", id);
            evicted.push(id);
        }
    }
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_backup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.conf");
        tokio::fs::write(&target, "original").await.unwrap();

        let backups = dir.path().join("backups");
        let manifest =
            create_backup(&backups, "backup_1_100", "1.0.0", &[target.clone()]).await.unwrap();
        assert_eq!(manifest.files, vec![target.clone()]);
        assert!(backups.join("backup_1_100").join(MANIFEST_FILE).exists());

        tokio::fs::write(&target, "clobbered").await.unwrap();
        restore_backup(&backups, &manifest).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&target).await.unwrap(), "original");
    }

    #[tokio::test]
    async fn directory_backup_restores_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("config");
        tokio::fs::create_dir_all(tree.join("nested")).await.unwrap();
        tokio::fs::write(tree.join("a.toml"), "a = 1").await.unwrap();
        tokio::fs::write(tree.join("nested").join("b.toml"), "b = 2").await.unwrap();

        let backups = dir.path().join("backups");
        let manifest = create_backup(&backups, "backup_2_200", "2.0.0", &[tree.clone()])
            .await
            .unwrap();

        // Mutate and add garbage, then restore
        tokio::fs::write(tree.join("a.toml"), "a = 999").await.unwrap();
        tokio::fs::write(tree.join("junk.tmp"), "junk").await.unwrap();
        restore_backup(&backups, &manifest).await.unwrap();

        assert_eq!(tokio::fs::read_to_string(tree.join("a.toml")).await.unwrap(), "a = 1");
        assert_eq!(
            tokio::fs::read_to_string(tree.join("nested").join("b.toml")).await.unwrap(),
            "b = 2"
        );
        assert!(!tree.join("junk.tmp").exists());
    }

    #[tokio::test]
    async fn missing_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        tokio::fs::write(&present, "x").await.unwrap();
        let missing = dir.path().join("missing.txt");

        let backups = dir.path().join("backups");
        let manifest =
            create_backup(&backups, "b", "1.0.0", &[present.clone(), missing]).await.unwrap();
        assert_eq!(manifest.files, vec![present]);
        assert_eq!(manifest.entries.len(), 1);
    }

    #[tokio::test]
    async fn retention_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.txt");
        tokio::fs::write(&target, "x").await.unwrap();
        let backups = dir.path().join("backups");

        for i in 0..4 {
            create_backup(&backups, &format!("backup_{}", i), "1.0.0", &[target.clone()])
                .await
                .unwrap();
            // Distinct created_at ordering
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let evicted = enforce_retention(&backups, 2).await.unwrap();
        assert_eq!(evicted.len(), 2);
        assert!(evicted.contains(&"backup_0".to_string()));
        assert!(evicted.contains(&"backup_1".to_string()));
        assert!(backups.join("backup_2").exists());
        assert!(backups.join("backup_3").exists());
    }
}
