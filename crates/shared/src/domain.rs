use std::{collections::HashSet, fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SetupError, ValidationError};

const DEFAULT_CATALOG: &str = include_str!("../data/catalog.toml");

/// Two-letter bucket code, e.g. `US`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketId(String);

impl BucketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for BucketId {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.len() != 2 || !trimmed.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ValidationError::MalformedBucketId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for BucketId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BucketId> for String {
    fn from(value: BucketId) -> Self {
        value.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic per-session token identifying one contribution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestToken(pub u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "bucket")]
    buckets: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    name: String,
}

/// The fixed, ordered set of buckets. Order is significant: it breaks ties
/// when ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    buckets: Vec<Bucket>,
}

impl Catalog {
    pub fn new(buckets: Vec<Bucket>) -> Result<Self, SetupError> {
        if buckets.is_empty() {
            return Err(SetupError::EmptyCatalog);
        }
        let mut seen = HashSet::new();
        for bucket in &buckets {
            if !seen.insert(bucket.id.clone()) {
                return Err(SetupError::DuplicateBucket(bucket.id.to_string()));
            }
        }
        Ok(Self { buckets })
    }

    pub fn builtin() -> Result<Self, SetupError> {
        Self::from_toml_str(DEFAULT_CATALOG)
    }

    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let raw = fs::read_to_string(path).map_err(|source| SetupError::CatalogUnreadable {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SetupError> {
        let file: CatalogFile =
            toml::from_str(raw).map_err(|err| SetupError::CatalogMalformed(err.to_string()))?;
        let buckets = file
            .buckets
            .into_iter()
            .map(|entry| {
                let id = entry
                    .id
                    .parse::<BucketId>()
                    .map_err(|err| SetupError::CatalogMalformed(err.to_string()))?;
                Ok(Bucket {
                    id,
                    name: entry.name,
                })
            })
            .collect::<Result<Vec<_>, SetupError>>()?;
        Self::new(buckets)
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, id: &BucketId) -> Option<&Bucket> {
        self.buckets.iter().find(|bucket| &bucket.id == id)
    }

    pub fn contains(&self, id: &BucketId) -> bool {
        self.get(id).is_some()
    }

    /// Parses `raw` and checks catalog membership.
    pub fn resolve(&self, raw: &str) -> Result<&Bucket, ValidationError> {
        let id = raw.parse::<BucketId>()?;
        self.get(&id)
            .ok_or_else(|| ValidationError::UnknownBucket(id.to_string()))
    }

    pub fn display_name<'a>(&'a self, id: &'a BucketId) -> &'a str {
        self.get(id)
            .map(|bucket| bucket.name.as_str())
            .unwrap_or_else(|| id.as_str())
    }
}
