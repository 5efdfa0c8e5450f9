// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The seam to the artifact transport. The engine registers whatever a
//! fetcher returns; it never performs network transfers itself.

use crate::error::Result;

/// An artifact pulled from a remote reference: the content to register as a
/// target plus an opaque metadata document describing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    /// The artifact bytes.
    pub artifact: Vec<u8>,
    /// A serialized attribute document (e.g. provenance metadata) attached
    /// to the target entry as custom attributes. May be empty.
    pub metadata: Vec<u8>,
}

/// Retrieves a remote artifact by reference. Implemented by external
/// transport clients; consumed by
/// [`Repository::import_artifact`](crate::Repository::import_artifact).
pub trait ArtifactFetcher {
    /// Pull the artifact named by `reference`.
    fn pull(&self, reference: &str) -> Result<FetchedArtifact>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::StaticPassphraseSource;
    use crate::metadata::TargetPath;
    use crate::repo_builder::RepositoryBuilder;
    use std::collections::HashMap;

    struct FixtureFetcher {
        artifacts: HashMap<String, FetchedArtifact>,
    }

    impl ArtifactFetcher for FixtureFetcher {
        fn pull(&self, reference: &str) -> Result<FetchedArtifact> {
            self.artifacts.get(reference).cloned().ok_or_else(|| {
                crate::Error::IllegalArgument(format!("unknown reference {}", reference))
            })
        }
    }

    #[test]
    fn imported_artifact_lands_in_targets_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let mut repo = RepositoryBuilder::new(tmp.path(), "demo")
            .passphrase_source(Box::new(StaticPassphraseSource::uniform("correct horse")))
            .build()
            .unwrap();

        let fetcher = FixtureFetcher {
            artifacts: HashMap::from([(
                "registry.example/bundle:latest".to_string(),
                FetchedArtifact {
                    artifact: b"bundle content".to_vec(),
                    metadata: br#"{"origin":"registry.example"}"#.to_vec(),
                },
            )]),
        };

        let path = TargetPath::new("bundle.json").unwrap();
        repo.import_artifact(&fetcher, "registry.example/bundle:latest", &path).unwrap();

        let description = &repo.registry().targets()[&path];
        assert_eq!(description.length(), b"bundle content".len() as u64);
        assert_eq!(
            description.custom()["origin"],
            serde_json::json!("registry.example")
        );
    }
}
