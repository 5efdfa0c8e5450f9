// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error types used across the trust repository engine.

use std::path::PathBuf;

use crate::lockfile::LockfileCreateError;
use crate::metadata::Role;

/// Alias for `Result` with this crate's [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for all repository operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Key material for a role could not be generated or written to the key
    /// directory.
    #[error("generating key for role {role}")]
    KeyGeneration {
        /// The role whose key could not be produced.
        role: Role,
        /// The underlying filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// A sealed private key could not be opened with the supplied passphrase.
    #[error("invalid passphrase for role {role}")]
    InvalidPassphrase {
        /// The role whose key was being opened.
        role: Role,
    },

    /// No key material exists on disk for the role.
    #[error("no key for role {role} under {}", path.display())]
    KeyNotFound {
        /// The role whose key was requested.
        role: Role,
        /// The key directory that was searched.
        path: PathBuf,
    },

    /// A role name outside the fixed root/targets/snapshot/timestamp set.
    #[error("unknown role {0:?}")]
    UnknownRole(String),

    /// Repository initialization failed part way through assigning role keys.
    /// The repository must not be used; files already written are left on
    /// disk for inspection.
    #[error("initializing the {role} role failed, repository is not usable")]
    PartialInitialization {
        /// The role whose initialization failed.
        role: Role,
        /// The error that interrupted initialization.
        #[source]
        source: Box<Error>,
    },

    /// Another publisher holds the repository lock.
    #[error("repository is locked by another publisher")]
    RepositoryLocked {
        /// Details about the lock owner.
        #[source]
        source: LockfileCreateError,
    },

    /// The metadata staged for publication is not strictly newer than what is
    /// already live; the repository advanced underneath this publisher.
    #[error("stale publish of {role}: staged version {staged} against live version {live}")]
    VersionConflict {
        /// The conflicting role.
        role: Role,
        /// The version this publisher staged.
        staged: u32,
        /// The version currently live.
        live: u32,
    },

    /// The atomic promotion of staged metadata could not complete. The live
    /// metadata directory is unchanged.
    #[error("promoting staged metadata")]
    PromotionFailed {
        /// The underlying filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// Signature verification of a metadata document failed.
    #[error("signature verification failure: {0}")]
    VerificationFailure(String),

    /// A cryptographic primitive failed.
    #[error("crypto operation failed: {0}")]
    Crypto(String),

    /// An argument or on-disk document was structurally invalid.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Metadata could not be serialized or deserialized.
    #[error("metadata encoding")]
    Encoding(#[from] serde_json::Error),

    /// An IO error that is not covered by a more specific variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
