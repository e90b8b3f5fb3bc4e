use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::merge::MergeAction;
use crate::entity::{Entity, EntityType};
use crate::error::Result;
use crate::TARGET_DEDUP;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: i64,
    pub name: String,
}

impl From<&Entity> for EntityRef {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id,
            name: entity.name.clone(),
        }
    }
}

/// One committed pairwise merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub entity_type: EntityType,
    pub keeper: EntityRef,
    pub duplicate: EntityRef,
    pub actions: Vec<String>,
}

impl AuditLogEntry {
    pub fn new(
        entity_type: EntityType,
        keeper: &Entity,
        duplicate: &Entity,
        actions: &[MergeAction],
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            entity_type,
            keeper: keeper.into(),
            duplicate: duplicate.into(),
            actions: actions.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Append-only JSON array of merge records.
///
/// Each append rewrites the whole array through a temp file and a rename,
/// so readers never see a half-written log.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn entries(&self) -> Result<Vec<AuditLogEntry>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    #[instrument(target = "dedup", level = "debug", skip(self, entry), fields(keeper = entry.keeper.id, duplicate = entry.duplicate.id))]
    pub async fn append(&self, entry: AuditLogEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.entries().await?;
        entries.push(entry);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            target: TARGET_DEDUP,
            "Audit log {} now holds {} entries",
            self.path.display(),
            entries.len()
        );
        Ok(())
    }
}
