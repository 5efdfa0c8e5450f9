// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ed25519 role keys, key ids, signatures, and passphrase sealing of private
//! key material at rest.

use std::fmt;

use data_encoding::{BASE64, HEXLOWER};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{self, Ed25519KeyPair, KeyPair as _};
use scrypt::{scrypt, Params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metadata::Role;

/// Scrypt cost parameters for sealing private keys. Recorded in the sealed
/// envelope so older keys stay loadable if the defaults change.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

const SALT_LEN: usize = 16;
const CIPHER_KEY_LEN: usize = 32;

const KEY_TYPE_ED25519: &str = "ed25519";
const KDF_SCRYPT: &str = "scrypt";
const CIPHER_AES_256_GCM: &str = "aes-256-gcm";

/// Serialize a value into its canonical byte form: JSON with all object keys
/// sorted. Signatures are always computed over these bytes, never over the
/// raw on-disk encoding.
pub(crate) fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    // Round-tripping through Value sorts object keys and drops any
    // struct-declaration ordering.
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Hex encoded SHA-256 digest of `data`.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(digest(&SHA256, data).as_ref())
}

/// The identifier of a public key: the hex encoded SHA-256 digest of the
/// key's canonical form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    /// The hex string form of this key id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PublicKeyValue {
    public: String,
}

/// The public half of a role key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    keytype: String,
    scheme: String,
    keyval: PublicKeyValue,
}

impl PublicKey {
    /// Wrap raw Ed25519 public key bytes.
    pub fn from_ed25519(bytes: &[u8]) -> Self {
        PublicKey {
            keytype: KEY_TYPE_ED25519.to_string(),
            scheme: KEY_TYPE_ED25519.to_string(),
            keyval: PublicKeyValue { public: HEXLOWER.encode(bytes) },
        }
    }

    /// The identifier derived from this key's canonical form.
    pub fn key_id(&self) -> KeyId {
        // A public key is a map of plain strings and cannot fail to serialize.
        let canonical =
            canonical_json(self).expect("public key canonicalization is infallible");
        KeyId(sha256_hex(&canonical))
    }

    /// Verify `sig` over `message` with this key.
    pub fn verify(&self, message: &[u8], sig: &Signature) -> Result<()> {
        let key_bytes = HEXLOWER
            .decode(self.keyval.public.as_bytes())
            .map_err(|e| Error::Crypto(format!("decoding public key: {}", e)))?;
        let sig_bytes = HEXLOWER
            .decode(sig.sig.as_bytes())
            .map_err(|e| Error::Crypto(format!("decoding signature: {}", e)))?;
        signature::UnparsedPublicKey::new(&signature::ED25519, key_bytes)
            .verify(message, &sig_bytes)
            .map_err(|_| Error::VerificationFailure("bad ed25519 signature".into()))
    }
}

/// A single signature over a metadata document's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    keyid: KeyId,
    sig: String,
}

impl Signature {
    /// The id of the key that produced this signature.
    pub fn key_id(&self) -> &KeyId {
        &self.keyid
    }
}

/// An Ed25519 key pair assigned to exactly one role. The private half only
/// exists in memory; at rest it is sealed with a passphrase (see
/// [`seal_private_key`]).
pub struct SigningKey {
    role: Role,
    keypair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
    public: PublicKey,
}

impl SigningKey {
    /// Generate a fresh key pair for `role`.
    pub fn generate(role: Role) -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| Error::Crypto("ed25519 key generation failed".into()))?;
        Self::from_pkcs8(role, pkcs8.as_ref())
    }

    /// Reconstruct a key pair from PKCS#8 v2 DER bytes.
    pub fn from_pkcs8(role: Role, der: &[u8]) -> Result<Self> {
        let keypair = Ed25519KeyPair::from_pkcs8(der)
            .map_err(|e| Error::Crypto(format!("parsing ed25519 key: {}", e)))?;
        let public = PublicKey::from_ed25519(keypair.public_key().as_ref());
        Ok(SigningKey { role, keypair, pkcs8: der.to_vec(), public })
    }

    /// The role this key is bound to.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The public half of this key pair.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Sign `message`, producing a signature attributable to this key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            keyid: self.public.key_id(),
            sig: HEXLOWER.encode(self.keypair.sign(message).as_ref()),
        }
    }

    pub(crate) fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose private key material through Debug.
        f.debug_struct("SigningKey")
            .field("role", &self.role)
            .field("key_id", &self.public.key_id())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct KdfParameters {
    alg: String,
    salt: String,
    log_n: u8,
    r: u32,
    p: u32,
}

#[derive(Serialize, Deserialize)]
struct CipherParameters {
    alg: String,
    nonce: String,
}

/// On-disk envelope for a sealed private key. Self-describing so the kdf
/// parameters can evolve without invalidating existing keys.
#[derive(Serialize, Deserialize)]
struct SealedKey {
    role: Role,
    keytype: String,
    kdf: KdfParameters,
    cipher: CipherParameters,
    ciphertext: String,
}

fn derive_cipher_key(
    passphrase: &str,
    salt: &[u8],
    log_n: u8,
    r: u32,
    p: u32,
) -> Result<[u8; CIPHER_KEY_LEN]> {
    let params = Params::new(log_n, r, p)
        .map_err(|e| Error::Crypto(format!("invalid scrypt parameters: {}", e)))?;
    let mut out = [0u8; CIPHER_KEY_LEN];
    scrypt(passphrase.as_bytes(), salt, &params, &mut out)
        .map_err(|e| Error::Crypto(format!("scrypt derivation failed: {}", e)))?;
    Ok(out)
}

fn aead_key(cipher_key: &[u8]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, cipher_key)
        .map_err(|_| Error::Crypto("constructing aes-256-gcm key failed".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `key`'s private half with `passphrase`, returning the serialized
/// envelope to write to disk.
pub(crate) fn seal_private_key(key: &SigningKey, passphrase: &str) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| Error::Crypto("gathering salt entropy failed".into()))?;
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| Error::Crypto("gathering nonce entropy failed".into()))?;

    let cipher_key = derive_cipher_key(passphrase, &salt, SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)?;
    let mut in_out = key.pkcs8().to_vec();
    aead_key(&cipher_key)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| Error::Crypto("sealing private key failed".into()))?;

    let sealed = SealedKey {
        role: key.role(),
        keytype: KEY_TYPE_ED25519.to_string(),
        kdf: KdfParameters {
            alg: KDF_SCRYPT.to_string(),
            salt: BASE64.encode(&salt),
            log_n: SCRYPT_LOG_N,
            r: SCRYPT_R,
            p: SCRYPT_P,
        },
        cipher: CipherParameters {
            alg: CIPHER_AES_256_GCM.to_string(),
            nonce: BASE64.encode(&nonce),
        },
        ciphertext: BASE64.encode(&in_out),
    };
    Ok(serde_json::to_vec_pretty(&sealed)?)
}

/// Open a sealed private key envelope. A wrong passphrase (or tampered
/// ciphertext) is always reported as [`Error::InvalidPassphrase`], never
/// returned as key material.
pub(crate) fn open_private_key(role: Role, raw: &[u8], passphrase: &str) -> Result<SigningKey> {
    let sealed: SealedKey = serde_json::from_slice(raw)?;
    if sealed.kdf.alg != KDF_SCRYPT || sealed.cipher.alg != CIPHER_AES_256_GCM {
        return Err(Error::Crypto(format!(
            "unsupported sealing scheme {}/{}",
            sealed.kdf.alg, sealed.cipher.alg
        )));
    }

    let decode = |what: &str, value: &str| -> Result<Vec<u8>> {
        BASE64
            .decode(value.as_bytes())
            .map_err(|e| Error::Crypto(format!("decoding sealed key {}: {}", what, e)))
    };
    let salt = decode("salt", &sealed.kdf.salt)?;
    let nonce: [u8; NONCE_LEN] = decode("nonce", &sealed.cipher.nonce)?
        .try_into()
        .map_err(|_| Error::Crypto("sealed key nonce has the wrong length".into()))?;
    let mut in_out = decode("ciphertext", &sealed.ciphertext)?;

    let cipher_key =
        derive_cipher_key(passphrase, &salt, sealed.kdf.log_n, sealed.kdf.r, sealed.kdf.p)?;
    let plaintext = aead_key(&cipher_key)?
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| Error::InvalidPassphrase { role })?;

    SigningKey::from_pkcs8(role, plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn sign_and_verify_round_trip() {
        let key = SigningKey::generate(Role::Targets).unwrap();
        let sig = key.sign(b"payload");
        assert_eq!(sig.key_id(), &key.public().key_id());
        key.public().verify(b"payload", &sig).unwrap();

        assert_matches!(
            key.public().verify(b"other payload", &sig),
            Err(Error::VerificationFailure(_))
        );
    }

    #[test]
    fn key_ids_are_stable_and_distinct() {
        let key = SigningKey::generate(Role::Root).unwrap();
        assert_eq!(key.public().key_id(), key.public().key_id());

        let other = SigningKey::generate(Role::Root).unwrap();
        assert_ne!(key.public().key_id(), other.public().key_id());
    }

    #[test]
    fn seal_and_open_round_trip() {
        let key = SigningKey::generate(Role::Snapshot).unwrap();
        let sig = key.sign(b"sealed before");

        let sealed = seal_private_key(&key, "correct horse").unwrap();
        let loaded = open_private_key(Role::Snapshot, &sealed, "correct horse").unwrap();

        assert_eq!(loaded.public(), key.public());
        // A signature made before sealing verifies against the reloaded key.
        loaded.public().verify(b"sealed before", &sig).unwrap();
    }

    #[test]
    fn open_with_wrong_passphrase_fails() {
        let key = SigningKey::generate(Role::Timestamp).unwrap();
        let sealed = seal_private_key(&key, "correct horse").unwrap();

        assert_matches!(
            open_private_key(Role::Timestamp, &sealed, "battery staple"),
            Err(Error::InvalidPassphrase { role: Role::Timestamp })
        );
    }

    #[test]
    fn open_tampered_ciphertext_fails() {
        let key = SigningKey::generate(Role::Root).unwrap();
        let sealed = seal_private_key(&key, "correct horse").unwrap();

        let mut envelope: serde_json::Value = serde_json::from_slice(&sealed).unwrap();
        let ciphertext = envelope["ciphertext"].as_str().unwrap();
        let mut bytes = BASE64.decode(ciphertext.as_bytes()).unwrap();
        bytes[0] ^= 0xff;
        envelope["ciphertext"] = BASE64.encode(&bytes).into();
        let tampered = serde_json::to_vec(&envelope).unwrap();

        assert_matches!(
            open_private_key(Role::Root, &tampered, "correct horse"),
            Err(Error::InvalidPassphrase { role: Role::Root })
        );
    }

    #[test]
    fn canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unordered {
            zebra: u32,
            apple: u32,
        }

        let bytes = canonical_json(&Unordered { zebra: 1, apple: 2 }).unwrap();
        assert_eq!(bytes, br#"{"apple":2,"zebra":1}"#);
    }
}
