//! Core types shared by every pipeline stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, PipelineResult};

/// Suffix appended to a repository name to form its build artifact object.
pub const BUILD_ARTIFACT_SUFFIX: &str = "-build.zip";

/// Suffix appended to a repository name to form its source artifact object.
pub const SOURCE_ARTIFACT_SUFFIX: &str = ".zip";

/// Maximum accepted length of a repository name.
pub const MAX_NAME_LEN: usize = 100;

/// A validated repository name.
///
/// Names are used verbatim as path components and object key prefixes, so
/// construction rejects anything that could reach outside a directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Validate and wrap a repository name.
    pub fn new(name: impl Into<String>) -> PipelineResult<Self> {
        let name = name.into();
        validate_name(&name).map_err(|reason| PipelineError::InvalidName {
            name: name.clone(),
            reason,
        })?;
        Ok(Self(name))
    }

    /// Derive the name from a repository URL.
    ///
    /// Takes the last path segment, ignoring trailing slashes and a `.git`
    /// suffix.
    pub fn from_url(url: &str) -> PipelineResult<Self> {
        let trimmed = url.trim().trim_end_matches('/');
        let last = trimmed.rsplit('/').next().unwrap_or_default();
        let name = last.strip_suffix(".git").unwrap_or(last);
        Self::new(name)
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_owned());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name exceeds {MAX_NAME_LEN} characters"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err("name contains a path separator".to_owned());
    }
    if name.contains("..") {
        return Err("name contains a parent-directory segment".to_owned());
    }
    if name == "." {
        return Err("name refers to the current directory".to_owned());
    }
    if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err("name contains whitespace or control characters".to_owned());
    }
    Ok(())
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RepositoryName> for String {
    fn from(name: RepositoryName) -> Self {
        name.0
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated source repository URL and the name derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    url: Url,
    repository: RepositoryName,
}

impl SourceUrl {
    /// Parse and validate a repository URL.
    ///
    /// Only `https` URLs are accepted. When `allowed_hosts` is non-empty the
    /// host must appear in it. Embedded credentials are rejected; they are
    /// injected separately at fetch time.
    pub fn parse(raw: &str, allowed_hosts: &[String]) -> PipelineResult<Self> {
        let invalid = |reason: &str| PipelineError::InvalidUrl {
            url: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let raw_trimmed = raw.trim();
        if raw_trimmed.is_empty() {
            return Err(invalid("url is empty"));
        }

        let url = Url::parse(raw_trimmed).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "https" {
            return Err(invalid("only https urls are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("url has no host"))?;
        if !allowed_hosts.is_empty() && !allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
        {
            return Err(invalid("host is not allowed"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials must not be embedded in the url"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("url must not carry a query or fragment"));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        if segments.len() < 2 {
            return Err(invalid("url must name an owner and a repository"));
        }

        let repository = RepositoryName::from_url(url.path())?;
        Ok(Self { url, repository })
    }

    /// The repository name derived from the URL.
    #[must_use]
    pub fn repository(&self) -> &RepositoryName {
        &self.repository
    }

    /// The URL as supplied, after normalisation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The URL to clone from, with a `.git` suffix.
    ///
    /// When a token is supplied it is placed in the URL user info.
    #[must_use]
    pub fn clone_url(&self, token: Option<&str>) -> String {
        let mut url = self.url.clone();
        let path = url.path().trim_end_matches('/').to_owned();
        if !path.ends_with(".git") {
            url.set_path(&format!("{path}.git"));
        }
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            // Only fails for cannot-be-a-base urls, which parse() already rejected.
            let _ = url.set_username(token);
        }
        url.to_string()
    }
}

impl fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Location of an archive in the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object name within the bucket.
    pub object: String,
}

impl ArtifactKey {
    /// Create a key from raw parts.
    #[must_use]
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
        }
    }

    /// Key of the packaged source for a repository: `<name>.zip`.
    #[must_use]
    pub fn source(bucket: impl Into<String>, name: &RepositoryName) -> Self {
        Self::new(bucket, format!("{name}{SOURCE_ARTIFACT_SUFFIX}"))
    }

    /// Key of the packaged build output for a repository: `<name>-build.zip`.
    #[must_use]
    pub fn build(bucket: impl Into<String>, name: &RepositoryName) -> Self {
        Self::new(bucket, format!("{name}{BUILD_ARTIFACT_SUFFIX}"))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object)
    }
}

/// Starter template used when no stored source exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TemplateKind {
    /// `create-react-app` scaffold.
    #[default]
    CreateReactApp,
    /// `create-next-app` scaffold.
    Next,
    /// Vite React scaffold.
    Vite,
}

impl TemplateKind {
    /// Canonical name of the template.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateReactApp => "create-react-app",
            Self::Next => "next",
            Self::Vite => "vite",
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create-react-app" | "react" | "app" => Ok(Self::CreateReactApp),
            "next" | "nextjs" | "next-app" => Ok(Self::Next),
            "vite" => Ok(Self::Vite),
            other => Err(PipelineError::Config(format!(
                "unsupported template kind {other:?}"
            ))),
        }
    }
}

impl TryFrom<String> for TemplateKind {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TemplateKind> for String {
    fn from(kind: TemplateKind) -> Self {
        kind.as_str().to_owned()
    }
}

/// A request to build one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    /// Repository to build.
    pub repository: RepositoryName,
    /// Permit scaffolding from a template when no source is stored.
    pub use_template: bool,
    /// Template to scaffold from.
    pub template: TemplateKind,
}

impl BuildJob {
    /// Build job with template fallback disabled.
    #[must_use]
    pub fn new(repository: RepositoryName) -> Self {
        Self {
            repository,
            use_template: false,
            template: TemplateKind::default(),
        }
    }

    /// Enable template fallback with the given kind.
    #[must_use]
    pub fn with_template(mut self, template: TemplateKind) -> Self {
        self.use_template = true;
        self.template = template;
        self
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Repository that was built.
    pub repository: RepositoryName,
    /// Where the packaged output was stored.
    pub artifact: ArtifactKey,
    /// Template the source was scaffolded from, if any.
    pub created_from: Option<TemplateKind>,
}
