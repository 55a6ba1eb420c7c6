//! Versioned on-disk snapshot of the position set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::models::Position;

/// Only version this build reads or writes.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: Option<DateTime<Utc>>,
    pub positions: BTreeMap<String, Position>,
    /// signal id -> asset address
    pub signal_index: BTreeMap<String, String>,
    /// Closed positions displaced by a later buy of the same asset
    #[serde(default)]
    pub archive: Vec<Position>,
}

/// Read just enough to check the version before committing to a layout.
#[derive(Deserialize)]
struct VersionProbe {
    version: Option<u32>,
}

/// `<state_file>.tmp`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Load the last committed snapshot.
///
/// A missing file is an empty store. Anything unreadable is `StateCorruption`.
pub async fn load(path: &Path) -> Result<Snapshot> {
    let tmp = temp_path(path);
    if tokio::fs::try_exists(&tmp).await.unwrap_or(false) {
        warn!(path = %tmp.display(), "Removing incomplete snapshot left by an interrupted write");
        tokio::fs::remove_file(&tmp).await?;
    }

    let body = match tokio::fs::read_to_string(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Snapshot {
                version: SNAPSHOT_VERSION,
                ..Default::default()
            });
        }
        Err(e) => return Err(EngineError::corruption(path, e.to_string())),
    };

    let probe: VersionProbe = serde_json::from_str(&body)
        .map_err(|e| EngineError::corruption(path, format!("unparseable snapshot: {}", e)))?;
    match probe.version {
        Some(SNAPSHOT_VERSION) => {}
        Some(other) => {
            return Err(EngineError::corruption(
                path,
                format!("unsupported snapshot version {}", other),
            ))
        }
        None => return Err(EngineError::corruption(path, "missing snapshot version")),
    }

    let snapshot: Snapshot = serde_json::from_str(&body)
        .map_err(|e| EngineError::corruption(path, format!("invalid snapshot layout: {}", e)))?;
    check_consistency(path, &snapshot)?;
    Ok(snapshot)
}

fn check_consistency(path: &Path, snapshot: &Snapshot) -> Result<()> {
    for (asset, position) in &snapshot.positions {
        if &position.asset_address != asset {
            return Err(EngineError::corruption(
                path,
                format!("position keyed {} holds asset {}", asset, position.asset_address),
            ));
        }
        if position.sold_percentage > rust_decimal_macros::dec!(100) {
            return Err(EngineError::corruption(
                path,
                format!("position {} sold {}%", asset, position.sold_percentage),
            ));
        }
    }
    for (signal_id, asset) in &snapshot.signal_index {
        match snapshot.positions.get(asset) {
            None => {
                return Err(EngineError::corruption(
                    path,
                    format!("signal {} points at missing position {}", signal_id, asset),
                ))
            }
            Some(position) if &position.signal_id != signal_id => {
                return Err(EngineError::corruption(
                    path,
                    format!(
                        "signal {} points at {} which was opened by signal {}",
                        signal_id, asset, position.signal_id
                    ),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Write the snapshot to `<path>.tmp`, fsync, then rename over `path`.
pub async fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path);
    let body = serde_json::to_vec_pretty(snapshot)?;

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
