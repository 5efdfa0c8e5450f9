// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The four fixed metadata roles and their signed documents.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{canonical_json, sha256_hex, KeyId, PublicKey, Signature, SigningKey};
use crate::error::{Error, Result};

/// A fixed responsibility in the signing hierarchy. The set is closed;
/// delegated sub-roles are out of scope.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Asserts which keys are authoritative for every other role.
    Root,
    /// Lists the artifacts the repository vouches for.
    Targets,
    /// Points at the current version of all other metadata.
    Snapshot,
    /// Points at the current snapshot, bounding replay windows.
    Timestamp,
}

impl Role {
    /// Every role, in signing-hierarchy order.
    pub const ALL: [Role; 4] = [Role::Root, Role::Targets, Role::Snapshot, Role::Timestamp];

    /// The lowercase wire name of this role.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Targets => "targets",
            Role::Snapshot => "snapshot",
            Role::Timestamp => "timestamp",
        }
    }

    /// Canonical metadata filename, e.g. `root.json`.
    pub fn metadata_filename(&self) -> String {
        format!("{}.json", self.name())
    }

    /// Version-qualified metadata filename used in consistent snapshot mode,
    /// e.g. `1.root.json`.
    pub fn versioned_metadata_filename(&self, version: u32) -> String {
        format!("{}.{}.json", version, self.name())
    }

    /// The environment variable consulted for this role's key passphrase.
    pub fn passphrase_env_var(&self) -> String {
        format!("{}_PASSPHRASE", self.name().to_uppercase())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "root" => Ok(Role::Root),
            "targets" => Ok(Role::Targets),
            "snapshot" => Ok(Role::Snapshot),
            "timestamp" => Ok(Role::Timestamp),
            other => Err(Error::UnknownRole(other.to_string())),
        }
    }
}

/// A slash-separated relative path naming a target within the repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TargetPath(String);

impl TargetPath {
    /// Validate and wrap a target path. Paths must be relative and must not
    /// traverse upward.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() || path.starts_with('/') {
            return Err(Error::IllegalArgument(format!("invalid target path {:?}", path)));
        }
        for component in path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(Error::IllegalArgument(format!("invalid target path {:?}", path)));
            }
        }
        Ok(TargetPath(path))
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The slash-separated components of the path.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TargetPath {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TargetPath::new(s).map_err(serde::de::Error::custom)
    }
}

/// A versioned, signed role document.
pub trait Metadata:
    fmt::Debug + Clone + PartialEq + Serialize + DeserializeOwned
{
    /// The role this document type belongs to.
    const ROLE: Role;

    /// The role recorded inside the document.
    fn role(&self) -> Role;

    /// Monotonically increasing version, never reused.
    fn version(&self) -> u32;

    /// The instant after which this document must no longer be trusted.
    fn expires(&self) -> &DateTime<Utc>;
}

/// The key ids authorized to sign for a role, and how many of them must
/// agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyAuthorization {
    /// Ids of the verification keys for the role.
    pub keyids: Vec<KeyId>,
    /// Number of distinct authorized signatures required.
    pub threshold: u32,
}

/// The root role document: the root of trust binding keys to roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMetadata {
    #[serde(rename = "_type")]
    role: Role,
    version: u32,
    expires: DateTime<Utc>,
    consistent_snapshot: bool,
    keys: BTreeMap<KeyId, PublicKey>,
    roles: BTreeMap<Role, KeyAuthorization>,
}

impl RootMetadata {
    /// Build a root document asserting `role_keys` as the authoritative
    /// verification keys, with a signing threshold of one per role.
    pub fn new(
        version: u32,
        expires: DateTime<Utc>,
        consistent_snapshot: bool,
        role_keys: &BTreeMap<Role, Vec<PublicKey>>,
    ) -> Self {
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for (role, verification_keys) in role_keys {
            let mut keyids = Vec::new();
            for key in verification_keys {
                let key_id = key.key_id();
                keys.insert(key_id.clone(), key.clone());
                keyids.push(key_id);
            }
            roles.insert(*role, KeyAuthorization { keyids, threshold: 1 });
        }
        RootMetadata { role: Role::Root, version, expires, consistent_snapshot, keys, roles }
    }

    /// Whether metadata is published under version-qualified filenames.
    pub fn consistent_snapshot(&self) -> bool {
        self.consistent_snapshot
    }

    /// The signing threshold for `role`, defaulting to one when the role is
    /// not listed.
    pub fn threshold(&self, role: Role) -> u32 {
        self.roles.get(&role).map(|a| a.threshold).unwrap_or(1)
    }

    /// The verification keys this document authorizes for `role`.
    pub fn role_keys(&self, role: Role) -> Vec<&PublicKey> {
        self.roles
            .get(&role)
            .map(|authorization| {
                authorization.keyids.iter().filter_map(|id| self.keys.get(id)).collect()
            })
            .unwrap_or_default()
    }
}

impl Metadata for RootMetadata {
    const ROLE: Role = Role::Root;

    fn role(&self) -> Role {
        self.role
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn expires(&self) -> &DateTime<Utc> {
        &self.expires
    }
}

/// Description of one target artifact: its length, content hashes, and the
/// opaque custom attribute object attached by the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescription {
    length: u64,
    hashes: BTreeMap<String, String>,
    custom: BTreeMap<String, Value>,
}

impl TargetDescription {
    /// Describe target content held in memory.
    pub fn from_slice(content: &[u8], custom: BTreeMap<String, Value>) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256_hex(content));
        TargetDescription { length: content.len() as u64, hashes, custom }
    }

    /// The target's length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Content hashes by algorithm name.
    pub fn hashes(&self) -> &BTreeMap<String, String> {
        &self.hashes
    }

    /// The custom attribute object.
    pub fn custom(&self) -> &BTreeMap<String, Value> {
        &self.custom
    }
}

/// The targets role document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetsMetadata {
    #[serde(rename = "_type")]
    role: Role,
    version: u32,
    expires: DateTime<Utc>,
    targets: BTreeMap<TargetPath, TargetDescription>,
}

impl TargetsMetadata {
    /// Build a targets document from the complete target mapping.
    pub fn new(
        version: u32,
        expires: DateTime<Utc>,
        targets: BTreeMap<TargetPath, TargetDescription>,
    ) -> Self {
        TargetsMetadata { role: Role::Targets, version, expires, targets }
    }

    /// The registered targets.
    pub fn targets(&self) -> &BTreeMap<TargetPath, TargetDescription> {
        &self.targets
    }
}

impl Metadata for TargetsMetadata {
    const ROLE: Role = Role::Targets;

    fn role(&self) -> Role {
        self.role
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn expires(&self) -> &DateTime<Utc> {
        &self.expires
    }
}

/// A version/length/hash pointer to another metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDescription {
    version: u32,
    length: u64,
    hashes: BTreeMap<String, String>,
}

impl MetadataDescription {
    /// Describe a serialized metadata file.
    pub fn from_slice(version: u32, content: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), sha256_hex(content));
        MetadataDescription { version, length: content.len() as u64, hashes }
    }

    /// The described file's version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The described file's length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Content hashes by algorithm name.
    pub fn hashes(&self) -> &BTreeMap<String, String> {
        &self.hashes
    }
}

/// The snapshot role document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(rename = "_type")]
    role: Role,
    version: u32,
    expires: DateTime<Utc>,
    meta: BTreeMap<String, MetadataDescription>,
}

impl SnapshotMetadata {
    /// Build a snapshot document from pointers to the other metadata files.
    pub fn new(
        version: u32,
        expires: DateTime<Utc>,
        meta: BTreeMap<String, MetadataDescription>,
    ) -> Self {
        SnapshotMetadata { role: Role::Snapshot, version, expires, meta }
    }

    /// Pointers to the covered metadata files, keyed by filename.
    pub fn meta(&self) -> &BTreeMap<String, MetadataDescription> {
        &self.meta
    }
}

impl Metadata for SnapshotMetadata {
    const ROLE: Role = Role::Snapshot;

    fn role(&self) -> Role {
        self.role
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn expires(&self) -> &DateTime<Utc> {
        &self.expires
    }
}

/// The timestamp role document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampMetadata {
    #[serde(rename = "_type")]
    role: Role,
    version: u32,
    expires: DateTime<Utc>,
    snapshot: MetadataDescription,
}

impl TimestampMetadata {
    /// Build a timestamp document pointing at the current snapshot.
    pub fn new(version: u32, expires: DateTime<Utc>, snapshot: MetadataDescription) -> Self {
        TimestampMetadata { role: Role::Timestamp, version, expires, snapshot }
    }

    /// The pointer to the current snapshot.
    pub fn snapshot(&self) -> &MetadataDescription {
        &self.snapshot
    }
}

impl Metadata for TimestampMetadata {
    const ROLE: Role = Role::Timestamp;

    fn role(&self) -> Role {
        self.role
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn expires(&self) -> &DateTime<Utc> {
        &self.expires
    }
}

/// The serialized bytes of a signed metadata document, tagged with the
/// document type they contain.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignedMetadata<M> {
    bytes: Vec<u8>,
    _metadata: PhantomData<M>,
}

impl<M> RawSignedMetadata<M> {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        RawSignedMetadata { bytes, _metadata: PhantomData }
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A metadata document together with the signatures over its canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedMetadata {
    /// Signatures over the canonical form of `signed`.
    pub signatures: Vec<Signature>,
    /// The document payload, held as a JSON value so unknown documents can
    /// still be inspected.
    pub signed: Value,
}

impl SignedMetadata {
    /// Sign `metadata` with `key`, producing the envelope to serialize.
    pub fn create<M: Metadata>(metadata: &M, key: &SigningKey) -> Result<Self> {
        let signed = serde_json::to_value(metadata)?;
        let canonical = serde_json::to_vec(&signed)?;
        let signature = key.sign(&canonical);
        Ok(SignedMetadata { signatures: vec![signature], signed })
    }

    /// Parse an envelope from its serialized form.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Serialize this envelope into tagged raw bytes.
    pub fn to_raw<M: Metadata>(&self) -> Result<RawSignedMetadata<M>> {
        Ok(RawSignedMetadata::new(serde_json::to_vec_pretty(self)?))
    }

    /// The version recorded in the signed payload.
    pub fn version(&self) -> Result<u32> {
        self.signed
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::IllegalArgument("metadata is missing a version".into()))
    }

    /// Deserialize the payload as `M` without verifying any signatures.
    /// Only suitable for a publisher inspecting its own repository.
    pub fn parse_unverified<M: Metadata>(&self) -> Result<M> {
        let metadata: M = serde_json::from_value(self.signed.clone())?;
        if metadata.role() != M::ROLE {
            return Err(Error::IllegalArgument(format!(
                "document is for role {}, expected {}",
                metadata.role(),
                M::ROLE
            )));
        }
        Ok(metadata)
    }

    /// The canonical bytes that signatures cover.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(&self.signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn expires() -> DateTime<Utc> {
        Utc.ymd(2038, 1, 1).and_hms(0, 0, 0)
    }

    #[test]
    fn role_names_round_trip() {
        for role in Role::ALL {
            assert_eq!(role.name().parse::<Role>().unwrap(), role);
        }
        assert_matches!("mirror".parse::<Role>(), Err(Error::UnknownRole(name)) if name == "mirror");
    }

    #[test]
    fn role_filenames() {
        assert_eq!(Role::Root.metadata_filename(), "root.json");
        assert_eq!(Role::Targets.versioned_metadata_filename(3), "3.targets.json");
        assert_eq!(Role::Snapshot.passphrase_env_var(), "SNAPSHOT_PASSPHRASE");
    }

    #[test]
    fn target_path_rejects_traversal() {
        assert_matches!(TargetPath::new(""), Err(Error::IllegalArgument(_)));
        assert_matches!(TargetPath::new("/etc/passwd"), Err(Error::IllegalArgument(_)));
        assert_matches!(TargetPath::new("a/../b"), Err(Error::IllegalArgument(_)));
        assert_matches!(TargetPath::new("a//b"), Err(Error::IllegalArgument(_)));

        let path = TargetPath::new("foo/bar/baz").unwrap();
        assert_eq!(path.components().collect::<Vec<_>>(), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn root_metadata_resolves_role_keys() {
        let key = SigningKey::generate(Role::Targets).unwrap();
        let mut role_keys = BTreeMap::new();
        role_keys.insert(Role::Targets, vec![key.public().clone()]);

        let root = RootMetadata::new(1, expires(), true, &role_keys);
        assert_eq!(root.role_keys(Role::Targets), vec![key.public()]);
        assert_eq!(root.threshold(Role::Targets), 1);
        assert!(root.role_keys(Role::Snapshot).is_empty());
    }

    #[test]
    fn signed_envelope_round_trips() {
        let key = SigningKey::generate(Role::Timestamp).unwrap();
        let description = MetadataDescription::from_slice(7, b"snapshot bytes");
        let timestamp = TimestampMetadata::new(4, expires(), description);

        let envelope = SignedMetadata::create(&timestamp, &key).unwrap();
        let raw = envelope.to_raw::<TimestampMetadata>().unwrap();

        let parsed = SignedMetadata::from_slice(raw.as_bytes()).unwrap();
        assert_eq!(parsed.version().unwrap(), 4);
        assert_eq!(parsed.parse_unverified::<TimestampMetadata>().unwrap(), timestamp);
    }

    #[test]
    fn parse_unverified_rejects_role_mismatch() {
        let key = SigningKey::generate(Role::Snapshot).unwrap();
        let snapshot = SnapshotMetadata::new(1, expires(), BTreeMap::new());
        let envelope = SignedMetadata::create(&snapshot, &key).unwrap();

        assert_matches!(envelope.parse_unverified::<TimestampMetadata>(), Err(_));
    }
}
