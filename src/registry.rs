// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory model of the four roles: their keys, versions, and pending
//! edits. A registry instance is always passed explicitly; there is no
//! process-wide key state.

use std::collections::BTreeMap;

use chrono::Duration;

use crate::crypto::{PublicKey, SigningKey};
use crate::error::{Error, Result};
use crate::metadata::{Role, TargetDescription, TargetPath};

/// Number of days from now before the root metadata is expired.
const DEFAULT_ROOT_EXPIRATION: i64 = 365;

/// Number of days from now before the targets metadata is expired.
const DEFAULT_TARGETS_EXPIRATION: i64 = 90;

/// Number of days from now before the snapshot metadata is expired.
const DEFAULT_SNAPSHOT_EXPIRATION: i64 = 30;

/// Number of days from now before the timestamp metadata is expired.
const DEFAULT_TIMESTAMP_EXPIRATION: i64 = 30;

/// The registry's view of one role.
#[derive(Debug)]
pub struct RoleState {
    verification_keys: Vec<PublicKey>,
    signing_key: Option<SigningKey>,
    published_version: u32,
    dirty: bool,
    expiration: Duration,
}

impl RoleState {
    fn new(expiration: Duration) -> Self {
        RoleState {
            verification_keys: Vec::new(),
            signing_key: None,
            published_version: 0,
            dirty: false,
            expiration,
        }
    }

    /// The public keys used to verify this role's signatures.
    pub fn verification_keys(&self) -> &[PublicKey] {
        &self.verification_keys
    }

    /// The key this role signs with, if one is bound.
    pub fn signing_key(&self) -> Option<&SigningKey> {
        self.signing_key.as_ref()
    }

    /// The last version durably published for this role; zero when the role
    /// has never been published.
    pub fn published_version(&self) -> u32 {
        self.published_version
    }

    /// Whether this role needs a re-signature and version bump at the next
    /// publish.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// How long this role's metadata stays valid after signing.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }
}

/// Holds the current state of every role plus the targets payload.
#[derive(Debug)]
pub struct RoleRegistry {
    roles: [RoleState; 4],
    targets: BTreeMap<TargetPath, TargetDescription>,
}

impl RoleRegistry {
    /// A registry with no keys bound and default expirations.
    pub fn new() -> Self {
        RoleRegistry {
            roles: [
                RoleState::new(Duration::days(DEFAULT_ROOT_EXPIRATION)),
                RoleState::new(Duration::days(DEFAULT_TARGETS_EXPIRATION)),
                RoleState::new(Duration::days(DEFAULT_SNAPSHOT_EXPIRATION)),
                RoleState::new(Duration::days(DEFAULT_TIMESTAMP_EXPIRATION)),
            ],
            targets: BTreeMap::new(),
        }
    }

    fn state(&self, role: Role) -> &RoleState {
        &self.roles[role as usize]
    }

    fn state_mut(&mut self, role: Role) -> &mut RoleState {
        &mut self.roles[role as usize]
    }

    /// Add a public key to the set `role` is verified with. Re-adding a key
    /// that is already present is a no-op.
    pub fn bind_verification_key(&mut self, role: Role, key: PublicKey) {
        let state = self.state_mut(role);
        if !state.verification_keys.contains(&key) {
            state.verification_keys.push(key);
        }
    }

    /// Set the key `role` signs its own metadata with, replacing any
    /// previously bound key. The key must have been created for `role`; keys
    /// are never shared across roles.
    pub fn bind_signing_key(&mut self, role: Role, key: SigningKey) -> Result<()> {
        if key.role() != role {
            return Err(Error::IllegalArgument(format!(
                "key for role {} cannot sign for role {}",
                key.role(),
                role
            )));
        }
        self.state_mut(role).signing_key = Some(key);
        Ok(())
    }

    /// Flag `role` as needing a re-signature and version bump at the next
    /// publish.
    pub fn mark_dirty(&mut self, role: Role) {
        self.state_mut(role).dirty = true;
    }

    /// Read access to a role's state.
    pub fn role_info(&self, role: Role) -> &RoleState {
        self.state(role)
    }

    /// Read access to a role's state by name, for callers working from
    /// untyped input.
    pub fn role_info_by_name(&self, name: &str) -> Result<&RoleState> {
        let role: Role = name.parse()?;
        Ok(self.state(role))
    }

    /// The roles currently flagged dirty, in hierarchy order.
    pub fn dirty_roles(&self) -> Vec<Role> {
        Role::ALL.iter().copied().filter(|role| self.state(*role).dirty).collect()
    }

    /// Shorthand for `role_info(role).published_version()`.
    pub fn published_version(&self, role: Role) -> u32 {
        self.state(role).published_version
    }

    /// Shorthand for `role_info(role).expiration()`.
    pub fn expiration(&self, role: Role) -> Duration {
        self.state(role).expiration
    }

    /// Override how long `role`'s metadata stays valid after signing.
    pub fn set_expiration(&mut self, role: Role, expiration: Duration) {
        self.state_mut(role).expiration = expiration;
    }

    /// The current targets payload.
    pub fn targets(&self) -> &BTreeMap<TargetPath, TargetDescription> {
        &self.targets
    }

    pub(crate) fn insert_target(
        &mut self,
        path: TargetPath,
        description: TargetDescription,
    ) -> Option<TargetDescription> {
        let previous = self.targets.insert(path, description);
        self.mark_dirty(Role::Targets);
        previous
    }

    pub(crate) fn replace_targets(
        &mut self,
        targets: BTreeMap<TargetPath, TargetDescription>,
    ) {
        self.targets = targets;
    }

    pub(crate) fn record_published(&mut self, role: Role, version: u32) {
        let state = self.state_mut(role);
        state.published_version = version;
        state.dirty = false;
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn bind_verification_key_is_idempotent() {
        let key = SigningKey::generate(Role::Root).unwrap();
        let mut registry = RoleRegistry::new();

        registry.bind_verification_key(Role::Root, key.public().clone());
        registry.bind_verification_key(Role::Root, key.public().clone());

        assert_eq!(registry.role_info(Role::Root).verification_keys().len(), 1);
    }

    #[test]
    fn bind_signing_key_rejects_role_mismatch() {
        let key = SigningKey::generate(Role::Targets).unwrap();
        let mut registry = RoleRegistry::new();

        assert_matches!(
            registry.bind_signing_key(Role::Snapshot, key),
            Err(Error::IllegalArgument(_))
        );
        assert!(registry.role_info(Role::Snapshot).signing_key().is_none());
    }

    #[test]
    fn bind_signing_key_replaces_previous() {
        let mut registry = RoleRegistry::new();
        let first = SigningKey::generate(Role::Targets).unwrap();
        let second = SigningKey::generate(Role::Targets).unwrap();
        let second_public = second.public().clone();

        registry.bind_signing_key(Role::Targets, first).unwrap();
        registry.bind_signing_key(Role::Targets, second).unwrap();

        assert_eq!(
            registry.role_info(Role::Targets).signing_key().unwrap().public(),
            &second_public
        );
    }

    #[test]
    fn mark_dirty_is_tracked_per_role() {
        let mut registry = RoleRegistry::new();
        assert!(registry.dirty_roles().is_empty());

        registry.mark_dirty(Role::Targets);
        assert_eq!(registry.dirty_roles(), vec![Role::Targets]);
        assert!(!registry.role_info(Role::Root).is_dirty());
    }

    #[test]
    fn role_info_by_name_rejects_unknown_roles() {
        let registry = RoleRegistry::new();
        assert!(registry.role_info_by_name("targets").is_ok());
        assert_matches!(
            registry.role_info_by_name("mirror"),
            Err(Error::UnknownRole(name)) if name == "mirror"
        );
    }

    #[test]
    fn record_published_clears_dirty_and_advances_version() {
        let mut registry = RoleRegistry::new();
        registry.mark_dirty(Role::Timestamp);

        registry.record_published(Role::Timestamp, 1);

        assert_eq!(registry.published_version(Role::Timestamp), 1);
        assert!(!registry.role_info(Role::Timestamp).is_dirty());
    }
}
