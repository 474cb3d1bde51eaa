use chrono::Utc;
use dashmap::DashMap;

use super::{check_write, ArtifactStore};
use crate::constants::FIRST_ARTIFACT_VERSION;
use crate::errors::StoreError;
use crate::model::{Artifact, ArtifactKind, Payload, Version};

#[derive(Default)]
struct Slot {
    versions: Vec<(Artifact, Payload)>,
    latest: Option<u64>,
}

/// Store en memoria. El lock por entrada de `DashMap` serializa escritores de
/// un mismo nombre; lectores concurrentes no se bloquean entre sí.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    slots: DashMap<String, Slot>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn stage_version(&self,
                     name: &str,
                     kind: ArtifactKind,
                     payload: Payload,
                     produced_by: Option<&str>)
                     -> Result<Artifact, StoreError> {
        check_write(name, kind, &payload)?;
        let mut slot = self.slots.entry(name.to_string()).or_default();
        let version = slot.versions.last().map(|(a, _)| a.version + 1).unwrap_or(FIRST_ARTIFACT_VERSION);
        let artifact = Artifact { name: name.to_string(),
                                  kind,
                                  version,
                                  location: format!("mem://{name}/v{version}"),
                                  produced_by: produced_by.map(str::to_string),
                                  created_at: Utc::now(),
                                  content_hash: payload.content_hash() };
        slot.versions.push((artifact.clone(), payload));
        Ok(artifact)
    }

    fn promote(&self, artifacts: &[Artifact]) -> Result<(), StoreError> {
        for artifact in artifacts {
            let mut slot = self.slots
                               .get_mut(&artifact.name)
                               .ok_or_else(|| StoreError::NotFound(artifact.name.clone()))?;
            if !slot.versions.iter().any(|(a, _)| a.version == artifact.version) {
                return Err(StoreError::VersionNotFound { name: artifact.name.clone(),
                                                         version: artifact.version });
            }
            if slot.latest.map_or(true, |l| l < artifact.version) {
                slot.latest = Some(artifact.version);
            }
        }
        Ok(())
    }

    fn get(&self, name: &str, version: Version) -> Result<Artifact, StoreError> {
        let slot = self.slots.get(name).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        match version {
            Version::Latest => {
                let latest = slot.latest.ok_or_else(|| StoreError::NotFound(name.to_string()))?;
                slot.versions
                    .iter()
                    .find(|(a, _)| a.version == latest)
                    .map(|(a, _)| a.clone())
                    .ok_or_else(|| StoreError::NotFound(name.to_string()))
            }
            Version::Exact(v) => slot.versions
                                     .iter()
                                     .find(|(a, _)| a.version == v)
                                     .map(|(a, _)| a.clone())
                                     .ok_or_else(|| StoreError::VersionNotFound { name: name.to_string(),
                                                                                  version: v }),
        }
    }

    fn read(&self, artifact: &Artifact) -> Result<Payload, StoreError> {
        let slot = self.slots
                       .get(&artifact.name)
                       .ok_or_else(|| StoreError::NotFound(artifact.name.clone()))?;
        slot.versions
            .iter()
            .find(|(a, _)| a.location == artifact.location)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| StoreError::VersionNotFound { name: artifact.name.clone(),
                                                         version: artifact.version })
    }

    fn versions(&self, name: &str) -> Result<Vec<Artifact>, StoreError> {
        let slot = self.slots.get(name).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(slot.versions.iter().map(|(a, _)| a.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_creates_new_versions() {
        let store = InMemoryArtifactStore::new();
        let v1 = store.put("raw", ArtifactKind::Json, Payload::Json(json!({"n": 1}))).expect("v1");
        let v2 = store.put("raw", ArtifactKind::Json, Payload::Json(json!({"n": 2}))).expect("v2");
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(store.get("raw", Version::Latest).expect("latest").version, 2);
        let (_, old) = store.load("raw", Version::Exact(1)).expect("v1 still readable");
        assert_eq!(old, Payload::Json(json!({"n": 1})));
    }

    #[test]
    fn missing_name_and_missing_version_are_distinct() {
        let store = InMemoryArtifactStore::new();
        assert_eq!(store.get("nope", Version::Latest), Err(StoreError::NotFound("nope".into())));
        store.put("doc", ArtifactKind::Document, Payload::text("brd")).expect("put");
        assert_eq!(store.get("doc", Version::Exact(7)),
                   Err(StoreError::VersionNotFound { name: "doc".into(), version: 7 }));
        assert!(store.exists("doc", Version::Latest));
        assert!(!store.exists("doc", Version::Exact(2)));
    }

    #[test]
    fn staged_versions_do_not_move_latest() {
        let store = InMemoryArtifactStore::new();
        store.put("clean", ArtifactKind::Json, Payload::Json(json!(1))).expect("v1");
        let staged = store.stage_version("clean", ArtifactKind::Json, Payload::Json(json!(2)), Some("transform"))
                          .expect("stage");
        assert_eq!(store.get("clean", Version::Latest).expect("latest").version, 1);
        assert!(store.exists("clean", Version::Exact(staged.version)));
        store.promote(&[staged.clone()]).expect("promote");
        let latest = store.get("clean", Version::Latest).expect("latest");
        assert_eq!(latest.version, 2);
        assert_eq!(latest.produced_by.as_deref(), Some("transform"));
    }

    #[test]
    fn only_staged_versions_means_not_found_for_latest() {
        let store = InMemoryArtifactStore::new();
        store.stage_version("x", ArtifactKind::Json, Payload::Json(json!(1)), None).expect("stage");
        assert_eq!(store.get("x", Version::Latest), Err(StoreError::NotFound("x".into())));
    }

    #[test]
    fn rejects_bad_names_and_kind_mismatch() {
        let store = InMemoryArtifactStore::new();
        assert!(matches!(store.put("", ArtifactKind::Json, Payload::Json(json!(1))), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.put("r", ArtifactKind::Json, Payload::text("not json")),
                         Err(StoreError::KindMismatch { .. })));
    }
}
