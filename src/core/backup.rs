//! Backup Store
//!
//! Snapshots of live backend state, one JSON file per snapshot in a caller
//! supplied directory. Files are written atomically with mode 0600 and carry a
//! SHA-256 checksum of their documents, verified on every load.
//!
//! Each backend has at most one *baseline*: the snapshot taken before the last
//! committed apply. Pruning never removes it.

use crate::core::error::{Error, Result, SnapshotError};
use crate::core::render::{BackendKind, Document};
use crate::utils::{ensure_dir, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Current on-disk snapshot format
pub const FORMAT_VERSION: u32 = 1;

/// Opaque snapshot identifier: `<backend>-<utc timestamp>-<content hash>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        crate::validators::validate_identifier(s).map_err(SnapshotError::InvalidId)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = SnapshotError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub id: SnapshotId,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    /// SHA-256 over the serialized documents
    pub checksum: String,
    pub documents: Vec<Document>,
}

/// Listing entry, without the captured content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub baseline: bool,
}

pub fn compute_checksum(documents: &[Document]) -> String {
    let json = serde_json::to_string(documents).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Snapshot {
    /// Wraps freshly dumped documents, stamping them with the current time.
    pub fn capture(backend: BackendKind, documents: Vec<Document>) -> Self {
        Self::capture_at(backend, documents, Utc::now())
    }

    pub fn capture_at(
        backend: BackendKind,
        documents: Vec<Document>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let checksum = compute_checksum(&documents);
        let id = SnapshotId(format!(
            "{backend}-{}-{}",
            created_at.format("%Y%m%dT%H%M%S%3f"),
            &checksum[..8]
        ));
        Self {
            format_version: FORMAT_VERSION,
            id,
            backend,
            created_at,
            checksum,
            documents,
        }
    }

    /// Checks format version and checksum.
    pub fn verify(&self) -> std::result::Result<(), SnapshotError> {
        if self.format_version != FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found: self.format_version,
                expected: FORMAT_VERSION,
            });
        }
        let actual = compute_checksum(&self.documents);
        if actual != self.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// True if the backend had no managed state when this was taken.
    pub fn is_empty(&self) -> bool {
        self.documents.iter().all(|d| d.content.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn baseline_path(&self, backend: BackendKind) -> PathBuf {
        self.dir.join(format!("{backend}.baseline"))
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        ensure_dir(&self.dir)?;
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.snapshot_path(&snapshot.id), json.as_bytes())?;
        info!("Snapshot {} saved to {}", snapshot.id, self.dir.display());
        Ok(())
    }

    /// Loads and verifies a snapshot.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::NotFound`] if no such snapshot exists,
    /// [`SnapshotError::Corrupted`] if it cannot be parsed, and checksum or
    /// version mismatches from [`Snapshot::verify`].
    pub fn load(&self, id: &SnapshotId) -> Result<Snapshot> {
        let path = self.snapshot_path(id);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(id.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| SnapshotError::Corrupted(format!("{}: {e}", path.display())))?;
        if snapshot.id != *id {
            return Err(SnapshotError::Corrupted(format!(
                "{} contains snapshot {}",
                path.display(),
                snapshot.id
            ))
            .into());
        }
        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Loads a snapshot that must belong to `backend`.
    pub fn load_for(&self, backend: BackendKind, id: &SnapshotId) -> Result<Snapshot> {
        let snapshot = self.load(id)?;
        if snapshot.backend != backend {
            return Err(SnapshotError::BackendMismatch {
                found: snapshot.backend.to_string(),
                expected: backend.to_string(),
            }
            .into());
        }
        Ok(snapshot)
    }

    /// Stored snapshots, newest first, optionally for one backend.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn list(&self, backend: Option<BackendKind>) -> Result<Vec<SnapshotInfo>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut infos: Vec<SnapshotInfo> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let parsed = std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|json| {
                        serde_json::from_str::<SnapshotInfo>(&json).map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!("Skipping unreadable snapshot {}: {e}", path.display());
                        None
                    }
                }
            })
            .filter(|info| backend.is_none_or(|b| info.backend == b))
            .collect();

        for info in &mut infos {
            info.baseline = self.baseline(info.backend)?.as_ref() == Some(&info.id);
        }

        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(infos)
    }

    pub fn delete(&self, id: &SnapshotId) -> Result<()> {
        match std::fs::remove_file(self.snapshot_path(id)) {
            Ok(()) => {
                debug!("Deleted snapshot {id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapshotError::NotFound(id.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes all but the `keep` newest snapshots of a backend.
    ///
    /// The baseline is always kept, in addition to `keep`.
    pub fn prune(&self, backend: BackendKind, keep: usize) -> Result<Vec<SnapshotId>> {
        let mut removed = Vec::new();
        for info in self
            .list(Some(backend))?
            .into_iter()
            .filter(|info| !info.baseline)
            .skip(keep)
        {
            match self.delete(&info.id) {
                Ok(()) => removed.push(info.id),
                Err(e) => warn!("Failed to remove old snapshot {}: {e}", info.id),
            }
        }
        if !removed.is_empty() {
            info!("Pruned {} {backend} snapshot(s)", removed.len());
        }
        Ok(removed)
    }

    /// Records `id` as the rollback baseline of its backend.
    pub fn mark_baseline(&self, backend: BackendKind, id: &SnapshotId) -> Result<()> {
        if !self.snapshot_path(id).exists() {
            return Err(SnapshotError::NotFound(id.to_string()).into());
        }
        write_atomic(&self.baseline_path(backend), id.as_str().as_bytes())?;
        debug!("Baseline for {backend} is now {id}");
        Ok(())
    }

    pub fn baseline(&self, backend: BackendKind) -> Result<Option<SnapshotId>> {
        match std::fs::read_to_string(self.baseline_path(backend)) {
            Ok(content) => Ok(Some(content.trim().parse::<SnapshotId>()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn docs(content: &str) -> Vec<Document> {
        vec![Document::new("ruleset.json", content)]
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_snapshot_id_format() {
        let snapshot = Snapshot::capture_at(BackendKind::Nftables, docs("{}"), at(0));
        let id = snapshot.id.as_str();
        assert!(id.starts_with("nftables-20231114T221320000-"));
        assert_eq!(id.len(), "nftables-20231114T221320000-".len() + 8);
        assert!(id.parse::<SnapshotId>().is_ok());
    }

    #[test]
    fn test_snapshot_id_rejects_paths() {
        assert!("../etc/passwd".parse::<SnapshotId>().is_err());
        assert!("a/b".parse::<SnapshotId>().is_err());
        assert!("".parse::<SnapshotId>().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let snapshot = Snapshot::capture(BackendKind::Iptables, docs("*filter\nCOMMIT\n"));

        store.save(&snapshot).unwrap();
        let loaded = store.load(&snapshot.id).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let id: SnapshotId = "nftables-missing".parse().unwrap();
        assert!(matches!(
            store.load(&id),
            Err(Error::Snapshot(SnapshotError::NotFound(_)))
        ));
    }

    #[test]
    fn test_tampered_snapshot_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let mut snapshot = Snapshot::capture(BackendKind::Nftables, docs("original"));
        snapshot.documents[0].content = "tampered".to_string();
        store.save(&snapshot).unwrap();

        assert!(matches!(
            store.load(&snapshot.id),
            Err(Error::Snapshot(SnapshotError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_garbage_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        std::fs::write(dir.path().join("nftables-x.json"), "not json").unwrap();
        let id: SnapshotId = "nftables-x".parse().unwrap();
        assert!(matches!(
            store.load(&id),
            Err(Error::Snapshot(SnapshotError::Corrupted(_)))
        ));
        // Listing skips it
        assert!(store.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_version_mismatch() {
        let mut snapshot = Snapshot::capture(BackendKind::Ufw, docs(""));
        snapshot.format_version = 99;
        assert!(matches!(
            snapshot.verify(),
            Err(SnapshotError::VersionMismatch {
                found: 99,
                expected: 1
            })
        ));
    }

    #[test]
    fn test_load_for_wrong_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let snapshot = Snapshot::capture(BackendKind::Firewalld, docs("<zone/>"));
        store.save(&snapshot).unwrap();

        assert!(store.load_for(BackendKind::Firewalld, &snapshot.id).is_ok());
        assert!(matches!(
            store.load_for(BackendKind::Nftables, &snapshot.id),
            Err(Error::Snapshot(SnapshotError::BackendMismatch { .. }))
        ));
    }

    #[test]
    fn test_list_newest_first_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let old = Snapshot::capture_at(BackendKind::Nftables, docs("a"), at(0));
        let new = Snapshot::capture_at(BackendKind::Nftables, docs("b"), at(60));
        let other = Snapshot::capture_at(BackendKind::Ufw, docs("c"), at(30));
        for s in [&old, &new, &other] {
            store.save(s).unwrap();
        }

        let all: Vec<SnapshotId> = store.list(None).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(all, vec![new.id.clone(), other.id.clone(), old.id.clone()]);

        let nft = store.list(Some(BackendKind::Nftables)).unwrap();
        assert_eq!(nft.len(), 2);
    }

    #[test]
    fn test_prune_keeps_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let snapshots: Vec<Snapshot> = (0..5)
            .map(|i| {
                Snapshot::capture_at(BackendKind::Nftables, docs(&i.to_string()), at(i * 10))
            })
            .collect();
        for s in &snapshots {
            store.save(s).unwrap();
        }
        // The oldest is the baseline
        store
            .mark_baseline(BackendKind::Nftables, &snapshots[0].id)
            .unwrap();

        let removed = store.prune(BackendKind::Nftables, 2).unwrap();
        assert_eq!(removed, vec![snapshots[2].id.clone(), snapshots[1].id.clone()]);

        let left: Vec<SnapshotId> = store
            .list(Some(BackendKind::Nftables))
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(
            left,
            vec![
                snapshots[4].id.clone(),
                snapshots[3].id.clone(),
                snapshots[0].id.clone()
            ]
        );
    }

    #[test]
    fn test_baseline_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        assert_eq!(store.baseline(BackendKind::Iptables).unwrap(), None);

        let snapshot = Snapshot::capture(BackendKind::Iptables, docs("x"));
        assert!(store.mark_baseline(BackendKind::Iptables, &snapshot.id).is_err());

        store.save(&snapshot).unwrap();
        store
            .mark_baseline(BackendKind::Iptables, &snapshot.id)
            .unwrap();
        assert_eq!(
            store.baseline(BackendKind::Iptables).unwrap(),
            Some(snapshot.id.clone())
        );
        assert!(store.list(None).unwrap()[0].baseline);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let snapshot = Snapshot::capture(BackendKind::Nftables, docs("x"));
        store.save(&snapshot).unwrap();
        store.delete(&snapshot.id).unwrap();
        assert!(store.delete(&snapshot.id).is_err());
    }

    #[test]
    fn test_empty_snapshot() {
        assert!(Snapshot::capture(BackendKind::Nftables, docs("  ")).is_empty());
        assert!(!Snapshot::capture(BackendKind::Nftables, docs("x")).is_empty());
    }
}
