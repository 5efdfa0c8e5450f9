// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Adding and replacing target entries in the targets role.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::metadata::{TargetDescription, TargetPath};
use crate::registry::RoleRegistry;
use crate::repo_builder::write_atomic;

/// Mutates the targets role: registers artifacts and their custom attribute
/// objects, flagging the role for re-signature. Upserts are last-write-wins
/// on the full attribute object, so replaying the same sequence always
/// converges on the same payload.
pub struct TargetManager<'a> {
    registry: &'a mut RoleRegistry,
    targets_dir: PathBuf,
}

impl<'a> TargetManager<'a> {
    pub(crate) fn new(registry: &'a mut RoleRegistry, targets_dir: PathBuf) -> Self {
        TargetManager { registry, targets_dir }
    }

    /// Register `content` under `path`, copying it into the repository's
    /// targets directory and recording its length and hashes alongside the
    /// custom attributes.
    pub fn upsert_target_bytes(
        &mut self,
        path: &TargetPath,
        content: &[u8],
        custom: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.store_content(path, content)?;
        let description = TargetDescription::from_slice(content, custom);
        self.upsert_target(path, description);
        Ok(())
    }

    /// Insert or replace the metadata entry for `path` without touching
    /// target content on disk.
    pub fn upsert_target(&mut self, path: &TargetPath, description: TargetDescription) {
        match self.registry.insert_target(path.clone(), description) {
            None => info!("adding new target: {}", path),
            Some(_) => info!("replacing target: {}", path),
        }
    }

    fn store_content(&self, path: &TargetPath, content: &[u8]) -> Result<()> {
        let mut destination = self.targets_dir.clone();
        destination.extend(path.components());
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&destination, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::canonical_json;
    use crate::metadata::{Role, TargetsMetadata};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn manager_over<'a>(
        registry: &'a mut RoleRegistry,
        dir: &std::path::Path,
    ) -> TargetManager<'a> {
        TargetManager::new(registry, dir.to_path_buf())
    }

    #[test]
    fn upsert_copies_content_and_marks_dirty() {
        let tmp = tempfile::tempdir().unwrap();
        let mut registry = RoleRegistry::new();
        let mut manager = manager_over(&mut registry, tmp.path());

        let path = TargetPath::new("bundles/bundle.json").unwrap();
        let custom = maplit::btreemap! {
            "origin".to_string() => serde_json::json!("registry.example"),
        };
        manager.upsert_target_bytes(&path, b"{}", custom.clone()).unwrap();

        assert_eq!(fs::read(tmp.path().join("bundles/bundle.json")).unwrap(), b"{}");
        assert!(registry.role_info(Role::Targets).is_dirty());
        assert_eq!(registry.targets().len(), 1);
        assert_eq!(registry.targets()[&path].custom(), &custom);
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut registry = RoleRegistry::new();
        let mut manager = manager_over(&mut registry, tmp.path());

        let path = TargetPath::new("bundle.json").unwrap();
        manager.upsert_target_bytes(&path, b"first", BTreeMap::new()).unwrap();
        manager.upsert_target_bytes(&path, b"second", BTreeMap::new()).unwrap();

        assert_eq!(registry.targets().len(), 1);
        assert_eq!(registry.targets()[&path].length(), "second".len() as u64);
        assert_eq!(fs::read(tmp.path().join("bundle.json")).unwrap(), b"second");
    }

    proptest! {
        /// Any sequence of upserts converging on the same final mapping
        /// yields byte-identical targets payloads, no matter the order or
        /// how often entries were overwritten along the way.
        #[test]
        fn upsert_payload_depends_only_on_final_mapping(
            upserts in proptest::collection::vec(
                ("[a-d]", prop::num::u8::ANY),
                1..16,
            )
        ) {
            let mut registry = RoleRegistry::new();
            let mut reference = BTreeMap::new();

            for (name, payload) in &upserts {
                let path = TargetPath::new(name.clone()).unwrap();
                let content = vec![*payload];
                let description = TargetDescription::from_slice(&content, BTreeMap::new());
                reference.insert(path.clone(), description.clone());

                let mut manager = TargetManager::new(&mut registry, PathBuf::new());
                manager.upsert_target(&path, description);
            }

            let expires = Utc.ymd(2038, 1, 1).and_hms(0, 0, 0);
            let from_registry =
                TargetsMetadata::new(1, expires, registry.targets().clone());
            let from_reference = TargetsMetadata::new(1, expires, reference);

            prop_assert_eq!(
                canonical_json(&from_registry).unwrap(),
                canonical_json(&from_reference).unwrap()
            );
        }
    }
}
