//! Content-addressed cache keys
//!
//! A key is a SHA-256 digest over a set of named inputs (source files,
//! lockfiles, allow-listed environment variables) placed in a namespace.
//! Inputs are hashed in name order, so the order in which a caller
//! enumerates them never changes the key. Same inputs = same key.

use crate::error::{StrataError, StrataResult};
use crate::scope::Namespace;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Length of a hex-encoded digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Supported package ecosystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    /// npm (package-lock.json, npm-shrinkwrap.json)
    Npm,
    /// Yarn (yarn.lock)
    Yarn,
    /// pnpm (pnpm-lock.yaml)
    Pnpm,
    /// Cargo/Rust (Cargo.lock)
    Cargo,
    /// pip/Python (requirements.txt, Pipfile.lock)
    Pip,
    /// Poetry/Python (poetry.lock)
    Poetry,
    /// Go modules (go.sum)
    Go,
}

impl Ecosystem {
    /// Get the lockfile patterns for this ecosystem
    fn lockfile_patterns(&self) -> &'static [&'static str] {
        match self {
            Self::Npm => &["package-lock.json", "npm-shrinkwrap.json"],
            Self::Yarn => &["yarn.lock"],
            Self::Pnpm => &["pnpm-lock.yaml"],
            Self::Cargo => &["Cargo.lock"],
            Self::Pip => &["requirements.txt", "Pipfile.lock"],
            Self::Poetry => &["poetry.lock"],
            Self::Go => &["go.sum"],
        }
    }

    /// All ecosystems in detection priority order
    fn all() -> &'static [Self] {
        &[
            Self::Npm,
            Self::Yarn,
            Self::Pnpm,
            Self::Cargo,
            Self::Pip,
            Self::Poetry,
            Self::Go,
        ]
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
            Self::Cargo => "cargo",
            Self::Pip => "pip",
            Self::Poetry => "poetry",
            Self::Go => "go",
        };
        write!(f, "{}", name)
    }
}

/// Information about a detected lockfile
#[derive(Debug, Clone)]
pub struct LockfileInfo {
    /// The ecosystem this lockfile belongs to
    pub ecosystem: Ecosystem,
    /// Path to the lockfile
    pub path: PathBuf,
    /// SHA256 hash of the lockfile contents (first 12 chars)
    pub hash: String,
}

fn read_input(path: &Path) -> StrataResult<Vec<u8>> {
    fs::read(path).map_err(|e| StrataError::Io {
        context: format!("reading key input {}", path.display()),
        source: e,
    })
}

/// Detect all lockfiles in a project directory
///
/// Only the first matching lockfile per ecosystem is reported.
pub fn detect_lockfiles(project_dir: &Path) -> StrataResult<Vec<LockfileInfo>> {
    let mut lockfiles = Vec::new();

    for ecosystem in Ecosystem::all() {
        for pattern in ecosystem.lockfile_patterns() {
            let lockfile_path = project_dir.join(pattern);
            if lockfile_path.is_file() {
                debug!("Found {} lockfile: {}", ecosystem, lockfile_path.display());

                let contents = read_input(&lockfile_path)?;
                let digest = Sha256::digest(&contents);
                lockfiles.push(LockfileInfo {
                    ecosystem: *ecosystem,
                    path: lockfile_path,
                    hash: hex::encode(&digest[..6]),
                });
                break;
            }
        }
    }

    debug!("Detected {} lockfiles", lockfiles.len());
    Ok(lockfiles)
}

/// Builds a deterministic digest from named inputs
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    inputs: BTreeMap<String, Vec<u8>>,
    env_allow_prefixes: Vec<String>,
}

impl KeyBuilder {
    /// Create a builder that admits environment variables with these prefixes
    pub fn new<S: AsRef<str>>(env_allow_prefixes: &[S]) -> Self {
        Self {
            inputs: BTreeMap::new(),
            env_allow_prefixes: env_allow_prefixes
                .iter()
                .map(|p| p.as_ref().to_string())
                .collect(),
        }
    }

    /// Add a named input. A later input with the same name replaces an
    /// earlier one.
    pub fn add_input(&mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> &mut Self {
        self.inputs
            .insert(format!("input:{}", name.into()), content.into());
        self
    }

    /// Add a file, named by its path relative to `root`
    pub fn add_file(&mut self, root: &Path, path: &Path) -> StrataResult<&mut Self> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let name = full
            .strip_prefix(root)
            .unwrap_or(&full)
            .to_string_lossy()
            .replace('\\', "/");
        let content = read_input(&full)?;
        Ok(self.add_input(name, content))
    }

    /// Add environment variables that pass the prefix allow-list
    pub fn add_env<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in vars {
            let name = name.as_ref();
            if self.env_allowed(name) {
                self.inputs
                    .insert(format!("env:{}", name), value.as_ref().as_bytes().to_vec());
            } else {
                debug!("Ignoring env var {} for cache key", name);
            }
        }
        self
    }

    /// Add every detected lockfile in `project_dir`
    pub fn add_lockfiles(&mut self, project_dir: &Path) -> StrataResult<Vec<LockfileInfo>> {
        let lockfiles = detect_lockfiles(project_dir)?;
        for info in &lockfiles {
            let content = read_input(&info.path)?;
            let file_name = info
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.inputs.insert(format!("lockfile:{}", file_name), content);
        }
        Ok(lockfiles)
    }

    fn env_allowed(&self, name: &str) -> bool {
        self.env_allow_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Number of inputs collected so far
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Names of the collected inputs in hashing order
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    /// Hex-encoded SHA-256 over every input, in name order
    ///
    /// Each name and content is length-prefixed, so moving bytes between a
    /// name and its content always changes the digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, content) in &self.inputs {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(content);
        }
        hex::encode(hasher.finalize())
    }

    /// Finish into a key in `namespace`
    pub fn build(&self, namespace: Namespace) -> CacheKey {
        let digest = self.digest();
        CacheKey {
            namespace,
            identity: digest.clone(),
            digest,
        }
    }
}

/// Namespaced content-addressed key
///
/// Equality and hashing consider only the namespace and digest.
#[derive(Debug, Clone)]
pub struct CacheKey {
    namespace: Namespace,
    digest: String,
    identity: String,
}

impl CacheKey {
    /// Key for a logical identity such as `pkg/react/18.2.0`
    pub fn new(namespace: Namespace, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        let digest = hex::encode(Sha256::digest(identity.as_bytes()));
        Self {
            namespace,
            digest,
            identity,
        }
    }

    pub fn global(identity: impl Into<String>) -> Self {
        Self::new(Namespace::Global, identity)
    }

    /// Parse the textual form `global/<hex>`, `group/<id>/<hex>`,
    /// `owner/<id>/<hex>`. The identity of a parsed key is its digest.
    pub fn parse(s: &str) -> StrataResult<Self> {
        let invalid = || StrataError::InvalidKey(s.to_string());
        let parts: Vec<&str> = s.split('/').collect();
        let (namespace, digest) = match parts.as_slice() {
            ["global", digest] => (Namespace::Global, *digest),
            ["group", id, digest] => (Namespace::group(*id)?, *digest),
            ["owner", id, digest] => (Namespace::owner(*id)?, *digest),
            _ => return Err(invalid()),
        };

        let well_formed = digest.len() == DIGEST_HEX_LEN
            && digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return Err(invalid());
        }

        Ok(Self {
            namespace,
            digest: digest.to_string(),
            identity: digest.to_string(),
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Logical identity handed to the origin on a miss
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.digest == other.digest
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.digest.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.namespace.prefix(), self.digest)
    }
}
