// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Creating and opening trust repositories: directory layout, role key
//! assignment, and the repository handle the other components hang off.

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{Error, Result};
use crate::fetcher::ArtifactFetcher;
use crate::keystore::{KeyStore, PassphraseSource};
use crate::metadata::{
    Role, RootMetadata, SignedMetadata, TargetPath, TargetsMetadata,
};
use crate::publish::{PublishPipeline, StagedSnapshot};
use crate::registry::RoleRegistry;
use crate::targets::TargetManager;
use crate::verify::Verifier;

/// How long a publisher waits for the repository lock before giving up with
/// [`Error::RepositoryLocked`].
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Atomically write `bytes` to `path` by way of a temporary file in the same
/// directory, so readers can never observe a partially written file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    // The temporary file must live next to its destination; renaming across
    // mountpoints is not atomic.
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The fixed on-disk layout of one trust repository under
/// `<trust_dir>/<name>`.
#[derive(Debug, Clone)]
pub struct RepoLayout {
    trust_dir: PathBuf,
    name: String,
}

impl RepoLayout {
    /// The layout for repository `name` under `trust_dir`.
    pub fn new(trust_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        RepoLayout { trust_dir: trust_dir.into(), name: name.into() }
    }

    /// The default trust directory, `$HOME/.signy`.
    pub fn default_trust_dir() -> Result<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".signy"))
            .ok_or_else(|| Error::IllegalArgument("HOME is not set".into()))
    }

    /// The repository name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The repository's base directory.
    pub fn repo_dir(&self) -> PathBuf {
        self.trust_dir.join(&self.name)
    }

    /// Where sealed role keys live.
    pub fn private_dir(&self) -> PathBuf {
        self.repo_dir().join("private")
    }

    /// Where in-progress signed metadata is staged before promotion.
    pub fn staged_dir(&self) -> PathBuf {
        self.repo_dir().join("metadata.staged")
    }

    /// The live, published metadata directory seen by verifiers.
    pub fn metadata_dir(&self) -> PathBuf {
        self.repo_dir().join("metadata")
    }

    /// Where registered artifact content is copied.
    pub fn targets_dir(&self) -> PathBuf {
        self.repo_dir().join("targets")
    }

    /// The publisher lockfile guarding the staging and live directories.
    pub fn lock_path(&self) -> PathBuf {
        self.repo_dir().join(".publish.lock")
    }
}

/// Builds a new trust repository: creates the directory layout and assigns a
/// fresh key to each of the four roles.
pub struct RepositoryBuilder {
    layout: RepoLayout,
    consistent_snapshot: bool,
    passphrase_source: Option<Box<dyn PassphraseSource>>,
    current_time: Option<DateTime<Utc>>,
    lock_timeout: Duration,
}

impl RepositoryBuilder {
    /// Start building repository `name` under `trust_dir`.
    pub fn new(trust_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        RepositoryBuilder {
            layout: RepoLayout::new(trust_dir, name),
            consistent_snapshot: true,
            passphrase_source: None,
            current_time: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Whether metadata is additionally published under version-qualified
    /// filenames. Defaults to true.
    pub fn consistent_snapshot(mut self, consistent_snapshot: bool) -> Self {
        self.consistent_snapshot = consistent_snapshot;
        self
    }

    /// The fallback passphrase source used when no environment override is
    /// present. Defaults to an interactive prompt.
    pub fn passphrase_source(mut self, source: Box<dyn PassphraseSource>) -> Self {
        self.passphrase_source = Some(source);
        self
    }

    /// Pin the clock used for expiration timestamps.
    pub fn current_time(mut self, current_time: DateTime<Utc>) -> Self {
        self.current_time = Some(current_time);
        self
    }

    /// How long publishes wait on the repository lock.
    pub fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Create the repository: directory layout first, then one key per role,
    /// bound as both verification and signing key. A failure on any role
    /// aborts the whole initialization with
    /// [`Error::PartialInitialization`]; files already written stay on disk
    /// for inspection but the repository must not be used.
    pub fn build(self) -> Result<Repository> {
        let layout = self.layout;
        for dir in
            [layout.private_dir(), layout.staged_dir(), layout.targets_dir()]
        {
            DirBuilder::new().recursive(true).create(&dir)?;
        }

        let keystore = match self.passphrase_source {
            Some(source) => KeyStore::with_source(layout.private_dir(), source),
            None => KeyStore::new(layout.private_dir()),
        };

        let mut registry = RoleRegistry::new();
        for role in Role::ALL {
            init_role(&keystore, &mut registry, role).map_err(|source| {
                Error::PartialInitialization { role, source: Box::new(source) }
            })?;
            // Everything must be signed and published before the repository
            // is usable.
            registry.mark_dirty(role);
        }

        info!("initialized trust repository {} at {}", layout.name(), layout.repo_dir().display());

        Ok(Repository {
            layout,
            registry,
            consistent_snapshot: self.consistent_snapshot,
            current_time: self.current_time,
            lock_timeout: self.lock_timeout,
        })
    }
}

fn init_role(keystore: &KeyStore, registry: &mut RoleRegistry, role: Role) -> Result<()> {
    let key = keystore.generate(role)?;
    registry.bind_verification_key(role, key.public().clone());
    registry.bind_signing_key(role, key)?;
    Ok(())
}

/// A handle on one trust repository: its layout, role registry, and publish
/// configuration.
#[derive(Debug)]
pub struct Repository {
    layout: RepoLayout,
    registry: RoleRegistry,
    consistent_snapshot: bool,
    current_time: Option<DateTime<Utc>>,
    lock_timeout: Duration,
}

impl Repository {
    /// Open an existing repository, reloading role keys from the key
    /// directory and resuming versions from the live metadata.
    pub fn open(
        trust_dir: impl Into<PathBuf>,
        name: impl Into<String>,
        source: Box<dyn PassphraseSource>,
    ) -> Result<Repository> {
        let layout = RepoLayout::new(trust_dir, name);
        let keystore = KeyStore::with_source(layout.private_dir(), source);

        let mut registry = RoleRegistry::new();
        for role in Role::ALL {
            let key = keystore.load(role)?;
            registry.bind_verification_key(role, key.public().clone());
            registry.bind_signing_key(role, key)?;
        }

        let mut consistent_snapshot = true;
        let metadata_dir = layout.metadata_dir();
        for role in Role::ALL {
            let path = metadata_dir.join(role.metadata_filename());
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            // This is the publisher's own repository; parse without
            // verification, the way it was written.
            let envelope = SignedMetadata::from_slice(&raw)?;
            registry.record_published(role, envelope.version()?);
            match role {
                Role::Root => {
                    let root = envelope.parse_unverified::<RootMetadata>()?;
                    consistent_snapshot = root.consistent_snapshot();
                }
                Role::Targets => {
                    let targets = envelope.parse_unverified::<TargetsMetadata>()?;
                    registry.replace_targets(targets.targets().clone());
                }
                _ => {}
            }
        }

        Ok(Repository {
            layout,
            registry,
            consistent_snapshot,
            current_time: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// The repository's on-disk layout.
    pub fn layout(&self) -> &RepoLayout {
        &self.layout
    }

    /// The repository's role registry.
    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// Mutable access to the role registry.
    pub fn registry_mut(&mut self) -> &mut RoleRegistry {
        &mut self.registry
    }

    /// A target manager scoped to this repository.
    pub fn target_manager(&mut self) -> TargetManager<'_> {
        TargetManager::new(&mut self.registry, self.layout.targets_dir())
    }

    /// Register `content` under `path` with the given custom attributes.
    pub fn upsert_target_bytes(
        &mut self,
        path: &TargetPath,
        content: &[u8],
        custom: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.target_manager().upsert_target_bytes(path, content, custom)
    }

    /// Pull `reference` through `fetcher` and register the artifact under
    /// `path`, using the fetched metadata document as the custom attribute
    /// object.
    pub fn import_artifact<F: ArtifactFetcher>(
        &mut self,
        fetcher: &F,
        reference: &str,
        path: &TargetPath,
    ) -> Result<()> {
        let fetched = fetcher.pull(reference)?;
        let custom = if fetched.metadata.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(&fetched.metadata)?
        };
        self.upsert_target_bytes(path, &fetched.artifact, custom)
    }

    /// A publish pipeline over this repository, for callers that want to
    /// stage and promote as separate steps.
    pub fn publish_pipeline(&mut self) -> PublishPipeline<'_> {
        PublishPipeline::new(
            &self.layout,
            &mut self.registry,
            self.consistent_snapshot,
            self.current_time.unwrap_or_else(Utc::now),
            self.lock_timeout,
        )
    }

    /// Stage, sign, and atomically promote all pending edits.
    pub fn publish(&mut self) -> Result<StagedSnapshot> {
        self.publish_pipeline().publish()
    }

    /// A verifier trusting the currently published root document.
    pub fn verifier(&self) -> Result<Verifier> {
        let raw = fs::read(self.layout.metadata_dir().join(Role::Root.metadata_filename()))?;
        Verifier::from_trusted_root(&crate::metadata::RawSignedMetadata::new(raw))
    }
}
