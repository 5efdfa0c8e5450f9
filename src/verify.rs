// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Signature verification of raw metadata documents.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::crypto::{KeyId, PublicKey, Signature};
use crate::error::{Error, Result};
use crate::metadata::{
    Metadata, RawSignedMetadata, Role, RootMetadata, SignedMetadata, SnapshotMetadata,
    TargetsMetadata, TimestampMetadata,
};

/// A wrapper proving the inner document's signatures were verified. Values
/// can only be created by [`verify_signatures`].
#[derive(Clone, Debug, PartialEq)]
pub struct Verified<M> {
    value: M,
}

impl<M> Verified<M> {
    fn new(value: M) -> Self {
        Verified { value }
    }
}

impl<M> std::ops::Deref for Verified<M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// Verify `raw` against `authorized_keys`, requiring at least `threshold`
/// good signatures from distinct keys.
///
/// The returned document is deserialized from the canonical bytes the
/// signatures actually cover, not from the raw encoding.
pub fn verify_signatures<'a, M, I>(
    raw: &RawSignedMetadata<M>,
    threshold: u32,
    authorized_keys: I,
) -> Result<Verified<M>>
where
    M: Metadata,
    I: IntoIterator<Item = &'a PublicKey>,
{
    if threshold < 1 {
        return Err(Error::VerificationFailure(
            "threshold must be strictly greater than zero".into(),
        ));
    }

    let authorized_keys = authorized_keys
        .into_iter()
        .map(|key| (key.key_id(), key))
        .collect::<HashMap<KeyId, &PublicKey>>();

    let envelope = SignedMetadata::from_slice(raw.as_bytes())?;
    if envelope.signatures.is_empty() {
        return Err(Error::VerificationFailure(
            "the metadata was not signed with any authorized keys".into(),
        ));
    }
    let canonical_bytes = envelope.canonical_bytes()?;

    // Deduplicate by key id so one key cannot satisfy a larger threshold.
    let signatures = envelope
        .signatures
        .iter()
        .map(|sig| (sig.key_id(), sig))
        .collect::<HashMap<&KeyId, &Signature>>();

    let mut signatures_needed = threshold;
    for (key_id, sig) in signatures {
        match authorized_keys.get(key_id) {
            Some(public_key) => match public_key.verify(&canonical_bytes, sig) {
                Ok(()) => {
                    debug!("good signature from key id {}", key_id);
                    signatures_needed -= 1;
                }
                Err(e) => {
                    warn!("bad signature from key id {}: {}", key_id, e);
                }
            },
            None => {
                warn!("key id {} is not in the set of authorized keys", key_id);
            }
        }
        if signatures_needed == 0 {
            break;
        }
    }

    if signatures_needed > 0 {
        return Err(Error::VerificationFailure(format!(
            "signature threshold not met: {}/{}",
            threshold - signatures_needed,
            threshold
        )));
    }

    // Deserialize from the canonical bytes: only those are known to be
    // covered by the verified signatures.
    let metadata: M = serde_json::from_slice(&canonical_bytes)?;
    if metadata.role() != M::ROLE {
        return Err(Error::VerificationFailure(format!(
            "signed document is for role {}, expected {}",
            metadata.role(),
            M::ROLE
        )));
    }

    Ok(Verified::new(metadata))
}

/// A verifier anchored on a trusted root document. The root is the sole
/// source of truth for which keys are authoritative for the other roles.
#[derive(Debug)]
pub struct Verifier {
    root: Verified<RootMetadata>,
}

impl Verifier {
    /// Bootstrap from a serialized root document, requiring it to satisfy its
    /// own root-role key set. Pinning this root against prior out-of-band
    /// trust is the caller's responsibility.
    pub fn from_trusted_root(raw: &RawSignedMetadata<RootMetadata>) -> Result<Self> {
        let unverified = SignedMetadata::from_slice(raw.as_bytes())?
            .parse_unverified::<RootMetadata>()?;
        let root = verify_signatures(
            raw,
            unverified.threshold(Role::Root),
            unverified.role_keys(Role::Root),
        )?;
        Ok(Verifier { root })
    }

    /// The trusted root document.
    pub fn root(&self) -> &RootMetadata {
        &self.root
    }

    /// Verify a targets document against the root's targets keys.
    pub fn verify_targets(
        &self,
        raw: &RawSignedMetadata<TargetsMetadata>,
    ) -> Result<Verified<TargetsMetadata>> {
        verify_signatures(
            raw,
            self.root.threshold(Role::Targets),
            self.root.role_keys(Role::Targets),
        )
    }

    /// Verify a snapshot document against the root's snapshot keys.
    pub fn verify_snapshot(
        &self,
        raw: &RawSignedMetadata<SnapshotMetadata>,
    ) -> Result<Verified<SnapshotMetadata>> {
        verify_signatures(
            raw,
            self.root.threshold(Role::Snapshot),
            self.root.role_keys(Role::Snapshot),
        )
    }

    /// Verify a timestamp document against the root's timestamp keys.
    pub fn verify_timestamp(
        &self,
        raw: &RawSignedMetadata<TimestampMetadata>,
    ) -> Result<Verified<TimestampMetadata>> {
        verify_signatures(
            raw,
            self.root.threshold(Role::Timestamp),
            self.root.role_keys(Role::Timestamp),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKey;
    use crate::metadata::SnapshotMetadata;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn raw_snapshot(key: &SigningKey) -> RawSignedMetadata<SnapshotMetadata> {
        let snapshot =
            SnapshotMetadata::new(1, Utc.ymd(2038, 1, 1).and_hms(0, 0, 0), BTreeMap::new());
        SignedMetadata::create(&snapshot, key).unwrap().to_raw().unwrap()
    }

    #[test]
    fn verifies_with_authorized_key() {
        let key = SigningKey::generate(Role::Snapshot).unwrap();
        let raw = raw_snapshot(&key);

        let verified = verify_signatures(&raw, 1, [key.public()]).unwrap();
        assert_eq!(verified.version(), 1);
    }

    #[test]
    fn rejects_unauthorized_key() {
        let key = SigningKey::generate(Role::Snapshot).unwrap();
        let other = SigningKey::generate(Role::Snapshot).unwrap();
        let raw = raw_snapshot(&key);

        assert_matches!(
            verify_signatures(&raw, 1, [other.public()]),
            Err(Error::VerificationFailure(_))
        );
    }

    #[test]
    fn rejects_empty_key_set_and_zero_threshold() {
        let key = SigningKey::generate(Role::Snapshot).unwrap();
        let raw = raw_snapshot(&key);

        assert_matches!(
            verify_signatures(&raw, 1, std::iter::empty()),
            Err(Error::VerificationFailure(_))
        );
        assert_matches!(
            verify_signatures(&raw, 0, [key.public()]),
            Err(Error::VerificationFailure(_))
        );
    }

    #[test]
    fn rejects_higher_threshold_than_signatures() {
        let key = SigningKey::generate(Role::Snapshot).unwrap();
        let raw = raw_snapshot(&key);

        assert_matches!(
            verify_signatures(&raw, 2, [key.public()]),
            Err(Error::VerificationFailure(_))
        );
    }

    #[test]
    fn rejects_tampered_payload() {
        let key = SigningKey::generate(Role::Snapshot).unwrap();
        let raw = raw_snapshot(&key);

        let mut envelope = SignedMetadata::from_slice(raw.as_bytes()).unwrap();
        envelope.signed["version"] = serde_json::json!(9);
        let tampered: RawSignedMetadata<SnapshotMetadata> = envelope.to_raw().unwrap();

        assert_matches!(
            verify_signatures(&tampered, 1, [key.public()]),
            Err(Error::VerificationFailure(_))
        );
    }
}
