//! Scope classification and namespace access control
//!
//! Decides whether content may live in the globally shared namespace, a
//! group namespace, or only under its owner, and enforces who may read and
//! write each namespace.
//!
//! # Decision order
//!
//! | Check | Result |
//! |-------|--------|
//! | Name matches a sensitive pattern | owner (always wins) |
//! | Distributable material | global |
//! | Body matches a sensitive pattern | owner |
//! | Build artifact, every source global | global |
//! | Build artifact, any source not global | owner |
//! | Group-shared material | group |
//! | Anything else | owner |

use crate::config::schema::ScopeConfig;
use crate::error::{StrataError, StrataResult};
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Patterns used when the config does not override them
pub const DEFAULT_SENSITIVE_PATTERNS: &[&str] = &[
    r"passw(or)?d",
    r"secret",
    r"token",
    r"private[ _-]?key",
    r"credential",
    r"api[_-]?key",
    r"(^|/)\.env(\.[a-z0-9_-]+)?$",
    r"(^|/)\.netrc$",
    r"(^|/)\.npmrc$",
    r"id_(rsa|dsa|ecdsa|ed25519)",
    r"\.(pem|key|p12|pfx|keystore|jks)$",
    r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
];

/// Sharing boundary of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Group,
    Owner,
}

impl Scope {
    /// Whether entries of this scope may be written to a shared tier
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Global | Self::Group)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Global => "global",
            Self::Group => "group",
            Self::Owner => "owner",
        };
        write!(f, "{}", name)
    }
}

/// Key namespace: where an entry lives and who may read it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Global,
    Group(String),
    Owner(String),
}

impl Namespace {
    /// Group namespace; the id must be a single path segment
    pub fn group(id: impl Into<String>) -> StrataResult<Self> {
        Ok(Self::Group(valid_id(id.into())?))
    }

    /// Owner namespace; the id must be a single path segment
    pub fn owner(id: impl Into<String>) -> StrataResult<Self> {
        Ok(Self::Owner(valid_id(id.into())?))
    }

    /// Scope of entries stored in this namespace
    pub fn scope(&self) -> Scope {
        match self {
            Self::Global => Scope::Global,
            Self::Group(_) => Scope::Group,
            Self::Owner(_) => Scope::Owner,
        }
    }

    /// Textual prefix, e.g. `group/web/`
    pub fn prefix(&self) -> String {
        match self {
            Self::Global => "global/".to_string(),
            Self::Group(id) => format!("group/{}/", id),
            Self::Owner(id) => format!("owner/{}/", id),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

fn valid_id(id: String) -> StrataResult<String> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') {
        return Err(StrataError::InvalidKey(format!(
            "namespace id must be a single non-empty path segment: {:?}",
            id
        )));
    }
    Ok(id)
}

/// Identity of whoever calls into the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub owner: String,
    pub groups: BTreeSet<String>,
}

impl Caller {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            groups: BTreeSet::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }
}

/// What a piece of content is, as declared by whoever stores it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    /// Public, non-private material such as registry packages
    Distributable,
    /// Output of a build; shareable only if all of its sources are
    BuildArtifact { sources: Vec<Content> },
    /// Material shared within one group
    GroupShared { group: String },
    /// Anything else
    Private,
}

/// A named payload submitted for caching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub name: String,
    pub kind: ContentKind,
    pub payload: Vec<u8>,
    pub ttl: Option<Duration>,
}

impl Content {
    pub fn new(name: impl Into<String>, kind: ContentKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            kind,
            payload: payload.into(),
            ttl: None,
        }
    }

    pub fn distributable(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(name, ContentKind::Distributable, payload)
    }

    pub fn private(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(name, ContentKind::Private, payload)
    }

    pub fn artifact(
        name: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        sources: Vec<Content>,
    ) -> Self {
        Self::new(name, ContentKind::BuildArtifact { sources }, payload)
    }

    pub fn group_shared(
        name: impl Into<String>,
        group: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(
            name,
            ContentKind::GroupShared {
                group: group.into(),
            },
            payload,
        )
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Why a scope was chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    SensitiveName(String),
    SensitiveBody(String),
    Distributable,
    ArtifactOfSharedSources,
    ArtifactOfOwnerSource(String),
    GroupShared,
    Default,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SensitiveName(p) => write!(f, "name matches sensitive pattern {}", p),
            Self::SensitiveBody(p) => write!(f, "body matches sensitive pattern {}", p),
            Self::Distributable => write!(f, "distributable material"),
            Self::ArtifactOfSharedSources => write!(f, "artifact of shareable sources"),
            Self::ArtifactOfOwnerSource(name) => {
                write!(f, "artifact depends on owner-specific source {}", name)
            }
            Self::GroupShared => write!(f, "group-shared material"),
            Self::Default => write!(f, "no sharing rule applies"),
        }
    }
}

/// Outcome of classifying one piece of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub scope: Scope,
    /// Set when `scope` is [`Scope::Group`]
    pub group: Option<String>,
    pub reason: Reason,
}

impl Classification {
    fn new(scope: Scope, reason: Reason) -> Self {
        Self {
            scope,
            group: None,
            reason,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        matches!(
            self.reason,
            Reason::SensitiveName(_) | Reason::SensitiveBody(_)
        )
    }
}

/// Classifies content and checks placement against namespaces
#[derive(Debug, Clone)]
pub struct ScopeClassifier {
    patterns: RegexSet,
    scan_distributable: bool,
}

impl ScopeClassifier {
    /// Compile a classifier from case-insensitive patterns
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> StrataResult<Self> {
        let patterns = RegexSetBuilder::new(patterns.iter().map(|p| p.as_ref()))
            .case_insensitive(true)
            .build()
            .map_err(|e| StrataError::InvalidPattern {
                pattern: patterns
                    .iter()
                    .map(|p| p.as_ref())
                    .collect::<Vec<_>>()
                    .join(", "),
                reason: e.to_string(),
            })?;
        Ok(Self {
            patterns,
            scan_distributable: false,
        })
    }

    pub fn from_config(config: &ScopeConfig) -> StrataResult<Self> {
        Ok(Self::new(config.sensitive_patterns.as_slice())?
            .scan_distributable(config.scan_distributable_bodies))
    }

    /// Also scan the text bodies of distributable content
    pub fn scan_distributable(mut self, scan: bool) -> Self {
        self.scan_distributable = scan;
        self
    }

    /// First sensitive pattern matching `text`
    fn matched(&self, text: &str) -> Option<String> {
        self.patterns
            .matches(text)
            .iter()
            .next()
            .map(|i| self.patterns.patterns()[i].clone())
    }

    /// First sensitive pattern matching the content name
    pub fn sensitive_name(&self, name: &str) -> Option<String> {
        self.matched(name)
    }

    fn sensitive_body(&self, payload: &[u8]) -> Option<String> {
        std::str::from_utf8(payload)
            .ok()
            .and_then(|text| self.matched(text))
    }

    /// Decide the widest scope the content may be shared at
    pub fn classify(&self, content: &Content) -> Classification {
        if let Some(pattern) = self.sensitive_name(&content.name) {
            return Classification::new(Scope::Owner, Reason::SensitiveName(pattern));
        }

        // Public packages routinely contain words like "token"
        if content.kind != ContentKind::Distributable || self.scan_distributable {
            if let Some(pattern) = self.sensitive_body(&content.payload) {
                return Classification::new(Scope::Owner, Reason::SensitiveBody(pattern));
            }
        }

        match &content.kind {
            ContentKind::Distributable => Classification::new(Scope::Global, Reason::Distributable),
            ContentKind::BuildArtifact { sources } => {
                let owner_source = sources
                    .iter()
                    .find(|source| self.classify(source).scope != Scope::Global);
                match owner_source {
                    Some(source) => Classification::new(
                        Scope::Owner,
                        Reason::ArtifactOfOwnerSource(source.name.clone()),
                    ),
                    None => Classification::new(Scope::Global, Reason::ArtifactOfSharedSources),
                }
            }
            ContentKind::GroupShared { group } => Classification {
                scope: Scope::Group,
                group: Some(group.clone()),
                reason: Reason::GroupShared,
            },
            ContentKind::Private => Classification::new(Scope::Owner, Reason::Default),
        }
    }

    /// Refuse placement of content in a namespace wider than its scope
    pub fn check_placement(
        &self,
        name: &str,
        classification: &Classification,
        namespace: &Namespace,
    ) -> StrataResult<()> {
        let fits = match (classification.scope, namespace) {
            (_, Namespace::Owner(_)) => true,
            (Scope::Global, _) => true,
            (Scope::Group, Namespace::Group(id)) => classification.group.as_deref() == Some(id),
            _ => false,
        };

        if fits {
            return Ok(());
        }

        if classification.is_sensitive() {
            Err(StrataError::SensitiveContent {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
        } else {
            Err(StrataError::ScopeViolation {
                name: name.to_string(),
                scope: classification.scope.to_string(),
                namespace: namespace.to_string(),
            })
        }
    }
}

/// Global and group namespaces are readable by anyone; owner namespaces only
/// by their owner.
pub fn authorize_read(caller: &Caller, namespace: &Namespace) -> StrataResult<()> {
    match namespace {
        Namespace::Owner(id) if *id != caller.owner => Err(unauthorized(caller, namespace)),
        _ => Ok(()),
    }
}

/// Writing requires ownership of an owner namespace or membership of a group.
pub fn authorize_write(caller: &Caller, namespace: &Namespace) -> StrataResult<()> {
    let allowed = match namespace {
        Namespace::Global => true,
        Namespace::Group(id) => caller.groups.contains(id),
        Namespace::Owner(id) => *id == caller.owner,
    };
    if allowed {
        Ok(())
    } else {
        Err(unauthorized(caller, namespace))
    }
}

fn unauthorized(caller: &Caller, namespace: &Namespace) -> StrataError {
    StrataError::Unauthorized {
        caller: caller.owner.clone(),
        namespace: namespace.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ScopeClassifier {
        ScopeClassifier::new(DEFAULT_SENSITIVE_PATTERNS).unwrap()
    }

    #[test]
    fn distributable_is_global() {
        let c = classifier().classify(&Content::distributable("react-18.2.0.tgz", b"\x1f\x8b".to_vec()));
        assert_eq!(c.scope, Scope::Global);
        assert_eq!(c.reason, Reason::Distributable);
    }

    #[test]
    fn sensitive_name_wins_over_distributable() {
        let c = classifier().classify(&Content::distributable(".env", b"A=1".to_vec()));
        assert_eq!(c.scope, Scope::Owner);
        assert!(c.is_sensitive());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let c = classifier().classify(&Content::private("config/DB_PASSWORD.txt", b"x".to_vec()));
        assert!(matches!(c.reason, Reason::SensitiveName(_)));
    }

    #[test]
    fn sensitive_body_detected_for_text() {
        let content = Content::group_shared(
            "deploy.sh",
            "web",
            b"export AWS_SECRET_ACCESS_KEY=abc".to_vec(),
        );
        let c = classifier().classify(&content);
        assert_eq!(c.scope, Scope::Owner);
        assert!(matches!(c.reason, Reason::SensitiveBody(_)));
    }

    #[test]
    fn distributable_body_scanned_only_when_enabled() {
        let content = Content::distributable("auth.js", "const token = readToken();");

        let c = classifier().classify(&content);
        assert_eq!(c.scope, Scope::Global);
        assert_eq!(c.reason, Reason::Distributable);

        let strict = classifier().scan_distributable(true).classify(&content);
        assert_eq!(strict.scope, Scope::Owner);
        assert!(matches!(strict.reason, Reason::SensitiveBody(_)));
    }

    #[test]
    fn binary_body_is_not_scanned() {
        let content = Content::group_shared("blob.bin", "web", vec![0xff, 0xfe, 0x00, 0x81]);
        assert_eq!(classifier().classify(&content).scope, Scope::Group);
    }

    #[test]
    fn artifact_of_public_sources_is_global() {
        let artifact = Content::artifact(
            "dist/bundle.js",
            b"bundle".to_vec(),
            vec![
                Content::distributable("lodash-4.17.21.tgz", b"l".to_vec()),
                Content::artifact(
                    "vendor.js",
                    b"v".to_vec(),
                    vec![Content::distributable("react-18.2.0.tgz", b"r".to_vec())],
                ),
            ],
        );
        let c = classifier().classify(&artifact);
        assert_eq!(c.scope, Scope::Global);
    }

    #[test]
    fn artifact_with_owner_source_is_owner_only() {
        let artifact = Content::artifact(
            "dist/app.js",
            b"app".to_vec(),
            vec![
                Content::distributable("react-18.2.0.tgz", b"r".to_vec()),
                Content::artifact(
                    "generated.js",
                    b"g".to_vec(),
                    vec![Content::private("src/main.ts", b"main".to_vec())],
                ),
            ],
        );
        let c = classifier().classify(&artifact);
        assert_eq!(c.scope, Scope::Owner);
        assert_eq!(c.reason, Reason::ArtifactOfOwnerSource("generated.js".to_string()));
    }

    #[test]
    fn private_defaults_to_owner() {
        let c = classifier().classify(&Content::private("notes.md", b"hello".to_vec()));
        assert_eq!(c.scope, Scope::Owner);
        assert_eq!(c.reason, Reason::Default);
    }

    #[test]
    fn patterns_are_configurable() {
        let custom = ScopeClassifier::new(&["internal"]).unwrap();
        let c = custom.classify(&Content::distributable("internal-tool.tgz", b"x".to_vec()));
        assert_eq!(c.scope, Scope::Owner);
        let c = custom.classify(&Content::distributable(".env", b"x".to_vec()));
        assert_eq!(c.scope, Scope::Global);
    }

    #[test]
    fn invalid_pattern_rejected() {
        assert!(matches!(
            ScopeClassifier::new(&["(oops"]),
            Err(StrataError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn sensitive_placement_refused_in_shared_namespace() {
        let classifier = classifier();
        let content = Content::distributable(".env", b"A=1".to_vec());
        let c = classifier.classify(&content);

        let result = classifier.check_placement(&content.name, &c, &Namespace::Global);
        assert!(matches!(result, Err(StrataError::SensitiveContent { .. })));

        let owner = Namespace::owner("alice").unwrap();
        assert!(classifier.check_placement(&content.name, &c, &owner).is_ok());
    }

    #[test]
    fn group_content_only_fits_its_group() {
        let classifier = classifier();
        let content = Content::group_shared("fixtures.tar", "web", vec![0u8; 4]);
        let c = classifier.classify(&content);

        let web = Namespace::group("web").unwrap();
        let api = Namespace::group("api").unwrap();
        assert!(classifier.check_placement(&content.name, &c, &web).is_ok());
        assert!(matches!(
            classifier.check_placement(&content.name, &c, &api),
            Err(StrataError::ScopeViolation { .. })
        ));
        assert!(classifier
            .check_placement(&content.name, &c, &Namespace::Global)
            .is_err());
    }

    #[test]
    fn owner_namespace_readable_only_by_owner() {
        let alice = Caller::new("alice");
        let bob = Caller::new("bob");
        let ns = Namespace::owner("alice").unwrap();

        assert!(authorize_read(&alice, &ns).is_ok());
        assert!(matches!(
            authorize_read(&bob, &ns),
            Err(StrataError::Unauthorized { .. })
        ));
        assert!(authorize_read(&bob, &Namespace::Global).is_ok());
        assert!(authorize_read(&bob, &Namespace::group("web").unwrap()).is_ok());
    }

    #[test]
    fn group_write_requires_membership() {
        let ns = Namespace::group("web").unwrap();
        assert!(authorize_write(&Caller::new("a").with_group("web"), &ns).is_ok());
        assert!(authorize_write(&Caller::new("b"), &ns).is_err());
    }

    #[test]
    fn namespace_ids_validated() {
        assert!(Namespace::owner("").is_err());
        assert!(Namespace::group("a/b").is_err());
        assert!(Namespace::owner("..").is_err());
        assert_eq!(Namespace::owner("alice").unwrap().prefix(), "owner/alice/");
    }
}
