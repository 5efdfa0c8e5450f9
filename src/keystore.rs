// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Generation and loading of sealed role keys, and the passphrase sources
//! that protect them.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::crypto::{self, SigningKey};
use crate::error::{Error, Result};
use crate::metadata::Role;
use crate::repo_builder::write_atomic;

/// How many times an interactive passphrase entry may fail confirmation
/// before the operation is abandoned.
const PASSPHRASE_CONFIRM_ATTEMPTS: u32 = 3;

/// A capability that can produce the passphrase protecting a role's private
/// key. Sources are consulted in order; a source answers `Ok(None)` to pass
/// the question along.
pub trait PassphraseSource {
    /// The passphrase for `role`, or `None` if this source has no answer.
    fn passphrase(&self, role: Role) -> Result<Option<String>>;
}

/// Reads `<ROLE>_PASSPHRASE` from the environment, letting automation bypass
/// interactive prompting deterministically.
#[derive(Debug, Default)]
pub struct EnvPassphraseSource;

impl PassphraseSource for EnvPassphraseSource {
    fn passphrase(&self, role: Role) -> Result<Option<String>> {
        Ok(std::env::var(role.passphrase_env_var()).ok())
    }
}

/// Prompts for a passphrase on the given streams, requiring the same value
/// twice. Stream injection keeps the prompt testable without a terminal.
pub struct PromptPassphraseSource {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl PromptPassphraseSource {
    /// Prompt on stdin/stderr.
    pub fn stdio() -> Self {
        Self::with_streams(BufReader::new(io::stdin()), io::stderr())
    }

    /// Prompt on arbitrary streams.
    pub fn with_streams(
        input: impl BufRead + Send + 'static,
        output: impl Write + Send + 'static,
    ) -> Self {
        PromptPassphraseSource {
            input: Mutex::new(Box::new(input)),
            output: Mutex::new(Box::new(output)),
        }
    }

    fn read_line(input: &mut dyn BufRead) -> Result<String> {
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(Error::IllegalArgument("passphrase input stream closed".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n'].as_ref()).to_string())
    }
}

impl PassphraseSource for PromptPassphraseSource {
    fn passphrase(&self, role: Role) -> Result<Option<String>> {
        let mut input = self.input.lock().expect("passphrase input lock poisoned");
        let mut output = self.output.lock().expect("passphrase output lock poisoned");

        for _ in 0..PASSPHRASE_CONFIRM_ATTEMPTS {
            write!(output, "Enter passphrase for the {} role key: ", role)?;
            output.flush()?;
            let first = Self::read_line(&mut **input)?;

            write!(output, "Confirm passphrase for the {} role key: ", role)?;
            output.flush()?;
            let second = Self::read_line(&mut **input)?;

            if first == second {
                return Ok(Some(first));
            }
            writeln!(output, "Passphrases do not match, try again.")?;
        }
        Err(Error::InvalidPassphrase { role })
    }
}

/// A fixed in-memory passphrase mapping. Primarily for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct StaticPassphraseSource {
    passphrases: BTreeMap<Role, String>,
}

impl StaticPassphraseSource {
    /// A source answering `passphrase` for every role.
    pub fn uniform(passphrase: impl Into<String>) -> Self {
        let passphrase = passphrase.into();
        let passphrases =
            Role::ALL.iter().map(|role| (*role, passphrase.clone())).collect();
        StaticPassphraseSource { passphrases }
    }

    /// A source with per-role passphrases.
    pub fn new(passphrases: BTreeMap<Role, String>) -> Self {
        StaticPassphraseSource { passphrases }
    }
}

impl PassphraseSource for StaticPassphraseSource {
    fn passphrase(&self, role: Role) -> Result<Option<String>> {
        Ok(self.passphrases.get(&role).cloned())
    }
}

/// Generates, seals, and loads the signing keys of a repository's roles.
/// Private keys live under the key directory as `<role>` (sealed) next to
/// `<role>.pub` (public key document).
pub struct KeyStore {
    directory: PathBuf,
    sources: Vec<Box<dyn PassphraseSource>>,
}

impl KeyStore {
    /// A key store over `directory` resolving passphrases from the
    /// environment first and an interactive prompt second.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_source(directory, Box::new(PromptPassphraseSource::stdio()))
    }

    /// A key store over `directory` with a custom fallback source. The
    /// environment override is always consulted first so automation keeps
    /// working regardless of configuration.
    pub fn with_source(
        directory: impl Into<PathBuf>,
        source: Box<dyn PassphraseSource>,
    ) -> Self {
        KeyStore {
            directory: directory.into(),
            sources: vec![Box::new(EnvPassphraseSource), source],
        }
    }

    /// The directory holding the sealed keys.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn private_key_path(&self, role: Role) -> PathBuf {
        self.directory.join(role.name())
    }

    fn public_key_path(&self, role: Role) -> PathBuf {
        self.directory.join(format!("{}.pub", role.name()))
    }

    /// Resolve the passphrase for `role` from the configured sources.
    pub fn resolve_passphrase(&self, role: Role) -> Result<String> {
        for source in &self.sources {
            if let Some(passphrase) = source.passphrase(role)? {
                return Ok(passphrase);
            }
        }
        Err(Error::IllegalArgument(format!(
            "no passphrase source could answer for role {}",
            role
        )))
    }

    /// Generate a fresh key pair for `role`, sealing the private half with
    /// the role's passphrase and writing both halves into the key directory.
    pub fn generate(&self, role: Role) -> Result<SigningKey> {
        let passphrase = self.resolve_passphrase(role)?;
        let key = SigningKey::generate(role)?;

        let sealed = crypto::seal_private_key(&key, &passphrase)?;
        write_atomic(&self.private_key_path(role), &sealed)
            .map_err(|source| Error::KeyGeneration { role, source })?;

        let public = serde_json::to_vec_pretty(key.public())?;
        write_atomic(&self.public_key_path(role), &public)
            .map_err(|source| Error::KeyGeneration { role, source })?;

        Ok(key)
    }

    /// Load `role`'s key pair, resolving the passphrase from the configured
    /// sources.
    pub fn load(&self, role: Role) -> Result<SigningKey> {
        let passphrase = self.resolve_passphrase(role)?;
        self.load_with_passphrase(role, &passphrase)
    }

    /// Load `role`'s key pair with an explicit passphrase.
    pub fn load_with_passphrase(&self, role: Role, passphrase: &str) -> Result<SigningKey> {
        let read = |path: &Path| -> Result<Vec<u8>> {
            std::fs::read(path).map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    Error::KeyNotFound { role, path: self.directory.clone() }
                } else {
                    Error::Io(e)
                }
            })
        };

        let sealed = read(&self.private_key_path(role))?;
        let public = read(&self.public_key_path(role))?;

        let key = crypto::open_private_key(role, &sealed, passphrase)?;

        // The public key document is derivable from the private half, but a
        // divergent one on disk means the directory was tampered with.
        let stored: crate::crypto::PublicKey = serde_json::from_slice(&public)?;
        if &stored != key.public() {
            warn!("public key file for role {} does not match the sealed private key", role);
            return Err(Error::Crypto(format!(
                "public key on disk does not match the private key for role {}",
                role
            )));
        }

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Cursor;

    fn test_store(dir: &Path) -> KeyStore {
        KeyStore::with_source(dir, Box::new(StaticPassphraseSource::uniform("correct horse")))
    }

    #[test]
    fn generate_writes_both_key_halves() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        store.generate(Role::Root).unwrap();
        assert!(tmp.path().join("root").is_file());
        assert!(tmp.path().join("root.pub").is_file());
    }

    #[test]
    fn generate_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        let key = store.generate(Role::Targets).unwrap();
        let sig = key.sign(b"signed at generation time");

        let loaded = store.load(Role::Targets).unwrap();
        assert_eq!(loaded.public(), key.public());
        loaded.public().verify(b"signed at generation time", &sig).unwrap();
    }

    #[test]
    fn load_with_wrong_passphrase_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());
        store.generate(Role::Snapshot).unwrap();

        assert_matches!(
            store.load_with_passphrase(Role::Snapshot, "battery staple"),
            Err(Error::InvalidPassphrase { role: Role::Snapshot })
        );
    }

    #[test]
    fn load_missing_key_fails_with_key_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        assert_matches!(
            store.load(Role::Timestamp),
            Err(Error::KeyNotFound { role: Role::Timestamp, .. })
        );
    }

    #[test]
    fn generate_into_unwritable_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory squatting on the private key path makes the final
        // rename fail.
        std::fs::create_dir(tmp.path().join("root")).unwrap();
        let store = test_store(tmp.path());

        assert_matches!(
            store.generate(Role::Root),
            Err(Error::KeyGeneration { role: Role::Root, .. })
        );
    }

    #[test]
    fn env_override_wins_over_fallback_source() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        std::env::set_var("TIMESTAMP_PASSPHRASE", "from environment");
        let resolved = store.resolve_passphrase(Role::Timestamp);
        std::env::remove_var("TIMESTAMP_PASSPHRASE");

        assert_eq!(resolved.unwrap(), "from environment");
        assert_eq!(store.resolve_passphrase(Role::Snapshot).unwrap(), "correct horse");
    }

    #[test]
    fn prompt_confirms_matching_entry() {
        let source = PromptPassphraseSource::with_streams(
            Cursor::new("hunter2\nhunter2\n"),
            io::sink(),
        );
        assert_eq!(source.passphrase(Role::Root).unwrap(), Some("hunter2".to_string()));
    }

    #[test]
    fn prompt_retries_after_mismatch() {
        let source = PromptPassphraseSource::with_streams(
            Cursor::new("first\nsecond\nhunter2\nhunter2\n"),
            io::sink(),
        );
        assert_eq!(source.passphrase(Role::Root).unwrap(), Some("hunter2".to_string()));
    }

    #[test]
    fn prompt_gives_up_after_bounded_attempts() {
        let source = PromptPassphraseSource::with_streams(
            Cursor::new("a\nb\nc\nd\ne\nf\ng\nh\n"),
            io::sink(),
        );
        assert_matches!(
            source.passphrase(Role::Root),
            Err(Error::InvalidPassphrase { role: Role::Root })
        );
    }
}
