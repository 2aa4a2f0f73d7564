use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use fleetd_core::error::{FleetError, FleetResult};
use fleetd_core::types::Update;

/// Extract an update payload into `dest` based on the payload name
/// (tar.gz / tar / zip).
pub async fn extract_archive(payload: &Path, dest: &Path, source_name: &str) -> Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    let payload = payload.to_path_buf();
    let dest = dest.to_path_buf();
    let lower = source_name.to_lowercase();

    tokio::task::spawn_blocking(move || -> Result<()> {
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            let file = std::fs::File::open(&payload)?;
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive.unpack(&dest)?;
        } else if lower.ends_with(".tar") {
            let file = std::fs::File::open(&payload)?;
            let mut archive = tar::Archive::new(file);
            archive.unpack(&dest)?;
        } else if lower.ends_with(".zip") {
            let file = std::fs::File::open(&payload)?;
            let mut archive = zip::ZipArchive::new(file)?;
            archive.extract(&dest)?;
        } else {
            return Err(anyhow::anyhow!("unsupported archive format: {}", lower));
        }
        Ok(())
    })
    .await
    .context("extract task panicked")?
}

/// Run a shell command with a bounded timeout. Returns an error on
/// non-zero exit or timeout; the caller decides whether that is fatal.
pub async fn run_script(
    script: &str,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<()> {
    debug!("Running update script: {}", script);
    let mut command = Command::new("sh");
    command.arg("-c").arg(script).envs(env).kill_on_drop(true);

    let run = async {
        let output = command.output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "script exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    };

    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| anyhow::anyhow!("script timed out after {:?}", timeout))?
}

/// Application update: extract to a scratch dir; hand off to an embedded
/// `update.sh` when present, else place files per the manifest.
pub async fn apply_application(
    update: &Update,
    payload: &Path,
    scratch: &Path,
    script_timeout: Duration,
) -> FleetResult<()> {
    extract_archive(payload, scratch, &update.url)
        .await
        .map_err(|e| FleetError::Apply(format!("extracting payload failed: {:#}", e)))?;

    let installer = scratch.join("update.sh");
    if installer.exists() {
        let mut env = HashMap::new();
        env.insert("VERSION".to_string(), update.version.clone());
        env.insert("UPDATE_ID".to_string(), update.id.clone());
        let script = format!("cd {} && sh update.sh", scratch.display());
        run_script(&script, &env, script_timeout)
            .await
            .map_err(|e| FleetError::Apply(format!("update.sh failed: {:#}", e)))?;
        return Ok(());
    }

    // Manual placement driven by the manifest's file list
    let placements = update
        .manifest
        .get("files")
        .and_then(|files| files.as_array())
        .cloned()
        .unwrap_or_default();
    if placements.is_empty() {
        return Err(FleetError::Apply(
            "archive has no update.sh and the manifest lists no files".to_string(),
        ));
    }
    for placement in placements {
        let source = placement.get("source").and_then(|v| v.as_str()).ok_or_else(|| {
            FleetError::Apply("manifest file entry is missing \"source\"".to_string())
        })?;
        let dest = placement.get("dest").and_then(|v| v.as_str()).ok_or_else(|| {
            FleetError::Apply("manifest file entry is missing \"dest\"".to_string())
        })?;

        let from = scratch.join(source);
        let to = PathBuf::from(dest);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FleetError::Apply(format!("creating {:?}: {}", parent, e)))?;
        }
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| FleetError::Apply(format!("placing {:?}: {}", to, e)))?;
        info!("Placed {} -> {}", source, dest);
    }
    Ok(())
}

/// Binary update: shadow-copy the current executable, then replace it
/// atomically and make it executable.
pub async fn apply_binary(payload: &Path, target: &Path) -> FleetResult<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FleetError::Apply(format!("creating {:?}: {}", parent, e)))?;
    }

    // Keep a shadow of the running binary next to it
    if target.exists() {
        let mut shadow = target.as_os_str().to_os_string();
        shadow.push(".backup");
        tokio::fs::copy(target, PathBuf::from(shadow))
            .await
            .map_err(|e| FleetError::Apply(format!("shadow copy failed: {}", e)))?;
    }

    // Stage in the target directory so the final rename is atomic even
    // when the payload landed on another filesystem
    let staged = target.with_extension("staged");
    tokio::fs::copy(payload, &staged)
        .await
        .map_err(|e| FleetError::Apply(format!("staging binary failed: {}", e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| FleetError::Apply(format!("chmod failed: {}", e)))?;
    }

    // Windows cannot rename over a locked executable: move the live file
    // aside under a temp name first. Elsewhere the rename replaces directly.
    #[cfg(windows)]
    {
        if target.exists() {
            let parked = target.with_extension("old");
            let _ = tokio::fs::remove_file(&parked).await;
            tokio::fs::rename(target, &parked)
                .await
                .map_err(|e| FleetError::Apply(format!("parking old binary failed: {}", e)))?;
        }
    }
    tokio::fs::rename(&staged, target)
        .await
        .map_err(|e| FleetError::Apply(format!("binary swap failed: {}", e)))?;

    info!("Installed binary at {:?}", target);
    Ok(())
}

/// Firmware update. Refused outright on unsupported architectures; on
/// supported ones the manifest must name the flash method.
pub async fn apply_firmware(
    update: &Update,
    payload: &Path,
    arch: &str,
    supported: &[String],
    script_timeout: Duration,
) -> FleetResult<()> {
    if !supported.iter().any(|candidate| candidate == arch) {
        return Err(FleetError::Apply(format!(
            "firmware updates are not supported on {} (supported: {:?})",
            arch, supported
        )));
    }

    let flash = update
        .manifest
        .get("flash_command")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            FleetError::Apply("firmware manifest is missing \"flash_command\"".to_string())
        })?;

    let mut env = HashMap::new();
    env.insert("FIRMWARE_IMAGE".to_string(), payload.display().to_string());
    env.insert("VERSION".to_string(), update.version.clone());
    run_script(flash, &env, script_timeout)
        .await
        .map_err(|e| FleetError::Apply(format!("firmware flash failed: {:#}", e)))?;
    warn!("Firmware {} flashed; a device reboot may be pending", update.version);
    Ok(())
}

/// Config update: the payload must parse as JSON; the parsed document is
/// handed to the configuration collaborator by the caller.
pub async fn parse_config_payload(payload: &Path) -> FleetResult<serde_json::Value> {
    let content = tokio::fs::read_to_string(payload)
        .await
        .map_err(|e| FleetError::Apply(format!("reading config payload: {}", e)))?;
    serde_json::from_str(&content)
        .map_err(|e| FleetError::Apply(format!("config payload is not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;

    fn make_tar_gz(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
        let src = dir.join("tree");
        std::fs::create_dir_all(&src).unwrap();
        for (name, content) in entries {
            let path = src.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let archive_path = dir.join("payload.tar.gz");
        let file = std::fs::File::create(&archive_path).unwrap();
        let encoder = GzEncoder::new(file, GzLevel::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &src).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        archive_path
    }

    #[tokio::test]
    async fn extract_tar_gz_payload() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_tar_gz(dir.path(), &[("app/run.sh", "echo hi")]);
        let dest = dir.path().join("out");
        extract_archive(&archive, &dest, "payload.tar.gz").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("app").join("run.sh")).unwrap(),
            "echo hi"
        );
    }

    #[tokio::test]
    async fn unknown_archive_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("payload.bin");
        std::fs::write(&payload, b"raw").unwrap();
        let err = extract_archive(&payload, &dir.path().join("out"), "payload.bin")
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("unsupported archive"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_timeout_is_enforced() {
        let env = HashMap::new();
        let err = run_script("sleep 5", &env, Duration::from_millis(200)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_nonzero_exit_is_an_error() {
        let env = HashMap::new();
        assert!(run_script("exit 0", &env, Duration::from_secs(5)).await.is_ok());
        let err = run_script("exit 7", &env, Duration::from_secs(5)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("7"));
    }

    #[tokio::test]
    async fn binary_swap_keeps_shadow() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin").join("agent");
        tokio::fs::create_dir_all(target.parent().unwrap()).await.unwrap();
        tokio::fs::write(&target, "old-binary").await.unwrap();

        let payload = dir.path().join("payload");
        tokio::fs::write(&payload, "new-binary").await.unwrap();

        apply_binary(&payload, &target).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&target).await.unwrap(), "new-binary");
        let shadow = dir.path().join("bin").join("agent.backup");
        assert_eq!(tokio::fs::read_to_string(&shadow).await.unwrap(), "old-binary");
    }

    #[tokio::test]
    async fn firmware_rejected_on_unsupported_arch() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("fw.img");
        tokio::fs::write(&payload, "fw").await.unwrap();
        let update: Update = serde_json::from_value(serde_json::json!({
            "id": "u-fw", "version": "9", "kind": "firmware",
            "url": "http://example/fw.img", "checksum": "00"
        }))
        .unwrap();

        let err = apply_firmware(
            &update,
            &payload,
            "x86_64",
            &["aarch64".to_string()],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FleetError::Apply(ref msg) if msg.contains("not supported")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn application_update_runs_embedded_installer() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("installed.txt");
        let script = format!("echo \"$VERSION $UPDATE_ID\" > {}", marker.display());
        let archive = make_tar_gz(dir.path(), &[("update.sh", script.as_str())]);

        let update: Update = serde_json::from_value(serde_json::json!({
            "id": "u-app", "version": "3.1.4", "kind": "application",
            "url": "http://example/app.tar.gz", "checksum": "00"
        }))
        .unwrap();

        let scratch = dir.path().join("scratch");
        apply_application(&update, &archive, &scratch, Duration::from_secs(10))
            .await
            .unwrap();
        let content = tokio::fs::read_to_string(&marker).await.unwrap();
        assert_eq!(content.trim(), "3.1.4 u-app");
    }

    #[tokio::test]
    async fn application_update_places_manifest_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = make_tar_gz(dir.path(), &[("conf/app.toml", "x = 1")]);
        let dest = dir.path().join("etc").join("app.toml");

        let update: Update = serde_json::from_value(serde_json::json!({
            "id": "u-app2", "version": "1.0", "kind": "application",
            "url": "http://example/app.tar.gz", "checksum": "00",
            "manifest": { "files": [
                { "source": "conf/app.toml", "dest": dest.to_string_lossy() }
            ]}
        }))
        .unwrap();

        let scratch = dir.path().join("scratch");
        apply_application(&update, &archive, &scratch, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "x = 1");
    }
}
