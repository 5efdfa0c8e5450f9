// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A signed, tamper-evident trust repository for software artifacts.
//!
//! The engine maintains the four-role signing hierarchy (root, targets,
//! snapshot, timestamp): it generates passphrase-sealed role keys, registers
//! target artifacts with custom attributes, and publishes signed metadata
//! through a staged, atomically promoted, consistent-snapshot layout that a
//! verifier can validate from the root of trust down.

mod crypto;
mod error;
mod fetcher;
mod keystore;
mod lockfile;
mod metadata;
mod publish;
mod registry;
mod repo_builder;
mod targets;
mod verify;

pub use crate::crypto::{KeyId, PublicKey, Signature, SigningKey};
pub use crate::error::{Error, Result};
pub use crate::fetcher::{ArtifactFetcher, FetchedArtifact};
pub use crate::keystore::{
    EnvPassphraseSource, KeyStore, PassphraseSource, PromptPassphraseSource,
    StaticPassphraseSource,
};
pub use crate::lockfile::{LockContext, Lockfile, LockfileCreateError};
pub use crate::metadata::{
    KeyAuthorization, Metadata, MetadataDescription, RawSignedMetadata, Role, RootMetadata,
    SignedMetadata, SnapshotMetadata, TargetDescription, TargetPath, TargetsMetadata,
    TimestampMetadata,
};
pub use crate::publish::{PublishPipeline, StagedRole, StagedSnapshot};
pub use crate::registry::{RoleRegistry, RoleState};
pub use crate::repo_builder::{RepoLayout, Repository, RepositoryBuilder};
pub use crate::targets::TargetManager;
pub use crate::verify::{verify_signatures, Verified, Verifier};
