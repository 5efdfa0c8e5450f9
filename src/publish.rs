// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Staging, signing, and atomically promoting metadata.
//!
//! The live `metadata` path is a symlink into per-publish generation
//! directories. Promotion builds a complete new generation next to the live
//! one and then renames a fresh symlink over `metadata`; the rename is the
//! atomic primitive, so a reader that resolves the link sees either the old
//! generation or the new one in full, never a mix. The previous generation
//! is kept until the next promotion so in-flight readers can finish.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::lockfile::Lockfile;
use crate::metadata::{
    Metadata, MetadataDescription, Role, RootMetadata, SignedMetadata, SnapshotMetadata,
    TargetsMetadata, TimestampMetadata,
};
use crate::registry::RoleRegistry;
use crate::repo_builder::{write_atomic, RepoLayout};

/// Name of the symlink staged next to `metadata` during a swap.
const SWAP_LINK: &str = ".metadata.swap";

/// Generation directory reserved for a live `metadata` directory that
/// predates the symlink layout.
const MIGRATED_GENERATION: &str = "metadata.g0";

/// One role staged for publication.
#[derive(Debug, Clone)]
pub struct StagedRole {
    /// The staged role.
    pub role: Role,
    /// The version the role will have once promoted.
    pub version: u32,
}

/// The set of roles staged by one `stage_and_sign` round.
#[derive(Debug, Clone, Default)]
pub struct StagedSnapshot {
    entries: Vec<StagedRole>,
    generation: u32,
}

impl StagedSnapshot {
    /// Whether nothing was dirty and no metadata was staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The staged roles, in hierarchy order.
    pub fn roles(&self) -> &[StagedRole] {
        &self.entries
    }

    /// The version `role` was staged at, if it was part of this round.
    pub fn version_of(&self, role: Role) -> Option<u32> {
        self.entries.iter().find(|entry| entry.role == role).map(|entry| entry.version)
    }

    fn generation(&self) -> u32 {
        self.generation
    }
}

/// Stages, signs, and promotes metadata for one repository. Exactly one
/// pipeline holds the repository's publish lock at a time; the lock is taken
/// on first use and held until the pipeline is dropped.
pub struct PublishPipeline<'a> {
    layout: &'a RepoLayout,
    registry: &'a mut RoleRegistry,
    consistent_snapshot: bool,
    current_time: DateTime<Utc>,
    lock_timeout: Duration,
    lock: Option<Lockfile>,
}

impl<'a> PublishPipeline<'a> {
    pub(crate) fn new(
        layout: &'a RepoLayout,
        registry: &'a mut RoleRegistry,
        consistent_snapshot: bool,
        current_time: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Self {
        PublishPipeline {
            layout,
            registry,
            consistent_snapshot,
            current_time,
            lock_timeout,
            lock: None,
        }
    }

    fn ensure_locked(&mut self) -> Result<()> {
        if self.lock.is_none() {
            let lock = Lockfile::lock(&self.layout.lock_path(), self.lock_timeout)
                .map_err(|source| Error::RepositoryLocked { source })?;
            self.lock = Some(lock);
        }
        Ok(())
    }

    /// Stage and promote every pending edit in one step.
    pub fn publish(mut self) -> Result<StagedSnapshot> {
        let staged = self.stage_and_sign()?;
        self.promote(&staged)?;
        Ok(staged)
    }

    /// For every dirty role, bump the version, recompute the expiration,
    /// re-serialize, sign, and write the result into `metadata.staged`.
    /// Versions only become durable once [`promote`](Self::promote)
    /// succeeds; a failed publish never consumes a version number.
    pub fn stage_and_sign(&mut self) -> Result<StagedSnapshot> {
        self.ensure_locked()?;

        let mut staging: BTreeSet<Role> = self.registry.dirty_roles().into_iter().collect();
        // Movement below the pointer roles forces them to re-sign.
        if staging.contains(&Role::Root) || staging.contains(&Role::Targets) {
            staging.insert(Role::Snapshot);
        }
        if !staging.is_empty() {
            staging.insert(Role::Timestamp);
        }
        if staging.is_empty() {
            return Ok(StagedSnapshot::default());
        }

        // Catch a registry that went stale against the live repository
        // before signing versions that can never land.
        for role in &staging {
            let live = self.live_version(*role)?.unwrap_or(0);
            let published = self.registry.published_version(*role);
            if live != published {
                return Err(Error::VersionConflict {
                    role: *role,
                    staged: published + 1,
                    live,
                });
            }
        }

        let mut versions = BTreeMap::new();
        let mut expires = BTreeMap::new();
        for role in Role::ALL {
            let published = self.registry.published_version(role);
            let version = if staging.contains(&role) { published + 1 } else { published };
            versions.insert(role, version);
            expires.insert(role, self.current_time + self.registry.expiration(role));
        }

        // Restart the staging area from scratch; leftovers from an abandoned
        // publish must not leak into this promotion.
        let staged_dir = self.layout.staged_dir();
        if staged_dir.exists() {
            fs::remove_dir_all(&staged_dir)?;
        }
        fs::create_dir_all(&staged_dir)?;

        let mut raws: BTreeMap<Role, Vec<u8>> = BTreeMap::new();

        if staging.contains(&Role::Root) {
            let mut role_keys = BTreeMap::new();
            for role in Role::ALL {
                role_keys
                    .insert(role, self.registry.role_info(role).verification_keys().to_vec());
            }
            let root = RootMetadata::new(
                versions[&Role::Root],
                expires[&Role::Root],
                self.consistent_snapshot,
                &role_keys,
            );
            raws.insert(Role::Root, self.sign(&root)?);
        }

        if staging.contains(&Role::Targets) {
            let targets = TargetsMetadata::new(
                versions[&Role::Targets],
                expires[&Role::Targets],
                self.registry.targets().clone(),
            );
            raws.insert(Role::Targets, self.sign(&targets)?);
        }

        if staging.contains(&Role::Snapshot) {
            let mut meta = BTreeMap::new();
            for role in [Role::Root, Role::Targets] {
                let raw = self.current_raw(role, &raws)?;
                meta.insert(
                    role.metadata_filename(),
                    MetadataDescription::from_slice(versions[&role], &raw),
                );
            }
            let snapshot = SnapshotMetadata::new(
                versions[&Role::Snapshot],
                expires[&Role::Snapshot],
                meta,
            );
            raws.insert(Role::Snapshot, self.sign(&snapshot)?);
        }

        // Timestamp is always part of a non-empty staging set.
        {
            let raw = self.current_raw(Role::Snapshot, &raws)?;
            let timestamp = TimestampMetadata::new(
                versions[&Role::Timestamp],
                expires[&Role::Timestamp],
                MetadataDescription::from_slice(versions[&Role::Snapshot], &raw),
            );
            raws.insert(Role::Timestamp, self.sign(&timestamp)?);
        }

        for (role, raw) in &raws {
            write_atomic(&staged_dir.join(role.metadata_filename()), raw)?;
            // Timestamp only ever lives under its canonical name; everything
            // else additionally gets an immutable version-qualified copy.
            if self.consistent_snapshot && *role != Role::Timestamp {
                write_atomic(
                    &staged_dir.join(role.versioned_metadata_filename(versions[role])),
                    raw,
                )?;
            }
        }

        let entries = staging
            .iter()
            .map(|role| StagedRole { role: *role, version: versions[role] })
            .collect();
        Ok(StagedSnapshot { entries, generation: versions[&Role::Timestamp] })
    }

    /// Atomically replace the live metadata with the staged set. On any
    /// failure the live directory is left in its last-known-good state and
    /// no version number is consumed.
    pub fn promote(&mut self, staged: &StagedSnapshot) -> Result<()> {
        self.ensure_locked()?;
        if staged.is_empty() {
            return Ok(());
        }

        // A stale staging round must not clobber a newer live set.
        for entry in staged.roles() {
            if let Some(live) = self.live_version(entry.role)? {
                if live >= entry.version {
                    return Err(Error::VersionConflict {
                        role: entry.role,
                        staged: entry.version,
                        live,
                    });
                }
            }
        }

        let generation_name = format!("metadata.g{}", staged.generation());
        let previous = self
            .install_generation(&generation_name)
            .map_err(|source| Error::PromotionFailed { source })?;

        for entry in staged.roles() {
            self.registry.record_published(entry.role, entry.version);
        }
        info!(
            "promoted metadata generation {} for repository {}",
            staged.generation(),
            self.layout.name()
        );

        self.cleanup_generations(&generation_name, previous.as_deref());
        Ok(())
    }

    fn sign<M: Metadata>(&self, metadata: &M) -> Result<Vec<u8>> {
        let key = self.registry.role_info(M::ROLE).signing_key().ok_or_else(|| {
            Error::IllegalArgument(format!("no signing key bound for role {}", M::ROLE))
        })?;
        let envelope = SignedMetadata::create(metadata, key)?;
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// The serialized envelope currently describing `role`: this round's
    /// staged bytes if the role was restaged, otherwise the live file.
    fn current_raw(&self, role: Role, raws: &BTreeMap<Role, Vec<u8>>) -> Result<Vec<u8>> {
        if let Some(raw) = raws.get(&role) {
            return Ok(raw.clone());
        }
        let path = self.layout.metadata_dir().join(role.metadata_filename());
        fs::read(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::IllegalArgument(format!("role {} has never been published", role))
            } else {
                e.into()
            }
        })
    }

    fn live_version(&self, role: Role) -> Result<Option<u32>> {
        let path = self.layout.metadata_dir().join(role.metadata_filename());
        match fs::read(&path) {
            Ok(raw) => Ok(Some(SignedMetadata::from_slice(&raw)?.version()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Build the new generation directory and swap the `metadata` symlink
    /// over to it. Returns the previous generation's directory name, if any.
    fn install_generation(&self, generation_name: &str) -> std::io::Result<Option<PathBuf>> {
        let repo_dir = self.layout.repo_dir();
        let generation_dir = repo_dir.join(generation_name);
        if generation_dir.exists() {
            // Debris from a promotion that failed after building its
            // generation; safe to discard under the publish lock.
            fs::remove_dir_all(&generation_dir)?;
        }
        fs::create_dir(&generation_dir)?;

        let live = self.layout.metadata_dir();
        // Carry the current live set forward so the new generation is
        // complete even for roles that were not restaged, then overlay this
        // round's staged files.
        match fs::read_dir(&live) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        fs::copy(entry.path(), generation_dir.join(entry.file_name()))?;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        for entry in fs::read_dir(self.layout.staged_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), generation_dir.join(entry.file_name()))?;
            }
        }

        let swap_link = repo_dir.join(SWAP_LINK);
        match fs::remove_file(&swap_link) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        // Relative target: the generation dir is a sibling of the link.
        symlink(generation_name, &swap_link)?;

        match fs::symlink_metadata(&live) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let previous = fs::read_link(&live)?;
                // Renaming over the existing symlink is the atomic swap.
                fs::rename(&swap_link, &live)?;
                Ok(Some(previous))
            }
            Ok(_) => {
                // A plain directory from a pre-symlink layout. Move it aside
                // so in-flight readers can finish, then swap the link in.
                let aside = repo_dir.join(MIGRATED_GENERATION);
                if aside.exists() {
                    fs::remove_dir_all(&aside)?;
                }
                fs::rename(&live, &aside)?;
                if let Err(e) = fs::rename(&swap_link, &live) {
                    // Fail closed: restore the old directory before
                    // surfacing the error.
                    let _ = fs::rename(&aside, &live);
                    return Err(e);
                }
                Ok(Some(PathBuf::from(MIGRATED_GENERATION)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::rename(&swap_link, &live)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove generation directories other than the current one and its
    /// predecessor. The predecessor stays so readers that resolved the link
    /// just before the swap can finish; anything older is unreachable.
    fn cleanup_generations(&self, current: &str, previous: Option<&Path>) {
        let repo_dir = self.layout.repo_dir();
        let entries = match fs::read_dir(&repo_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("listing {} for generation cleanup: {}", repo_dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with("metadata.g") || name == current {
                continue;
            }
            if previous.map(|p| p == Path::new(name)).unwrap_or(false) {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!("removing stale generation {}: {}", name, e);
            }
        }
    }
}
