//! Enrolled identities and their on-disk document.
//!
//! The store keeps identities in enrollment order. That order is observable:
//! matching breaks score ties in favour of the earlier enrollment.
//!
//! On-disk layout is a single JSON object with two parallel arrays:
//!
//! ```json
//! { "names": ["alice"], "encodings": [[[0.1, 0.2, ...], [...]]] }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::matching::cosine_similarity;

// ----------------------------------------------------------------------------
// Embedding
// ----------------------------------------------------------------------------

/// Fixed-length face descriptor produced by a `FaceEmbedder`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(anyhow!("embedding must not be empty"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("embedding contains a non-finite component"));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.0, &other.0)
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = anyhow::Error;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.0
    }
}

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    name: String,
    embeddings: Vec<Embedding>,
}

impl Identity {
    pub fn new(name: impl Into<String>, embeddings: Vec<Embedding>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(anyhow!("identity name must not be empty"));
        }
        if embeddings.is_empty() {
            return Err(anyhow!("identity {:?} has no embeddings", name));
        }
        Ok(Self { name, embeddings })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityDocument {
    names: Vec<String>,
    encodings: Vec<Vec<Embedding>>,
}

// ----------------------------------------------------------------------------
// IdentityStore
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct IdentityStore {
    identities: Vec<Identity>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the document at `path`. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::info!("no identity file at {}; starting empty", path.display());
                return Ok(Self::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", path.display()));
            }
        };
        let doc: IdentityDocument = serde_json::from_str(&raw)
            .with_context(|| format!("parse identity file {}", path.display()))?;
        let store = Self::from_document(doc)
            .with_context(|| format!("invalid identity file {}", path.display()))?;
        log::info!(
            "loaded {} identities from {}",
            store.len(),
            path.display()
        );
        Ok(store)
    }

    /// Like `load`, but an existing file that fails to load is renamed aside
    /// and an empty store is returned, so a later `save` cannot overwrite it.
    ///
    /// Errors only when the bad file cannot be moved out of the way.
    pub fn load_or_quarantine(path: &Path) -> Result<Self> {
        let err = match Self::load(path) {
            Ok(store) => return Ok(store),
            Err(err) => err,
        };
        if !path.is_file() {
            return Err(err);
        }
        let aside = quarantine_path(path);
        fs::rename(path, &aside).with_context(|| {
            format!(
                "identity file {} failed to load ({:#}) and could not be moved aside",
                path.display(),
                err
            )
        })?;
        log::error!(
            "failed to load identities: {:#}; moved to {} and starting empty",
            err,
            aside.display()
        );
        Ok(Self::new())
    }

    /// Persist atomically: write a sibling temp file, fsync, rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let doc = IdentityDocument {
            names: self.identities.iter().map(|i| i.name.clone()).collect(),
            encodings: self
                .identities
                .iter()
                .map(|i| i.embeddings.clone())
                .collect(),
        };
        let data = serde_json::to_vec_pretty(&doc)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        write_atomic(path, &data).with_context(|| format!("write {}", path.display()))
    }

    /// Append a new identity. Names are unique.
    pub fn insert(&mut self, identity: Identity) -> Result<()> {
        if self.contains(&identity.name) {
            return Err(anyhow!("identity {:?} already enrolled", identity.name));
        }
        self.identities.push(identity);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Identities in enrollment order.
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.identities.iter().map(|i| i.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    fn from_document(doc: IdentityDocument) -> Result<Self> {
        if doc.names.len() != doc.encodings.len() {
            return Err(anyhow!(
                "names has {} entries but encodings has {}",
                doc.names.len(),
                doc.encodings.len()
            ));
        }
        let mut store = Self::new();
        for (name, embeddings) in doc.names.into_iter().zip(doc.encodings) {
            store.insert(Identity::new(name, embeddings)?)?;
        }
        Ok(store)
    }
}

/// `<file>.corrupt-<local timestamp>` next to `path`.
fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", stamp));
    path.with_file_name(name)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
