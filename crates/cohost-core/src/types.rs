//! Core type definitions for cohost

use crate::error::ErrorContext;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use url::Url;

/// Identifier of an instance inside one driver run.
///
/// For individually addressable instances this is the endpoint URL; behind a
/// shared load-balanced endpoint it is the instance's stable id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create a new InstanceId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the InstanceId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Coarse hardware fingerprint of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSignature {
    /// CPU brand string
    pub cpu_brand: String,

    /// Nominal frequency in Hz, when the brand string advertises one
    #[serde(default)]
    pub frequency_hz: Option<f64>,
}

impl HardwareSignature {
    /// Brand reported when no source could be read
    pub const UNKNOWN_BRAND: &'static str = "Unknown CPU Brand";

    /// Build a signature from a brand string, parsing the advertised frequency
    pub fn from_brand(brand: impl Into<String>) -> Self {
        let cpu_brand = brand.into().trim().to_string();
        let frequency_hz = parse_frequency_hz(&cpu_brand);
        Self {
            cpu_brand,
            frequency_hz,
        }
    }

    /// Signature used when the hardware could not be identified
    pub fn unknown() -> Self {
        Self {
            cpu_brand: Self::UNKNOWN_BRAND.to_string(),
            frequency_hz: None,
        }
    }

    /// Bucketing key; equal keys iff equal brand and frequency
    pub fn key(&self) -> String {
        match self.frequency_hz {
            Some(hz) => format!("{}@{}", self.cpu_brand, hz),
            None => format!("{}@none", self.cpu_brand),
        }
    }
}

impl fmt::Display for HardwareSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frequency_hz {
            Some(hz) => write!(f, "{} ({:.2} GHz)", self.cpu_brand, hz / 1e9),
            None => write!(f, "{}", self.cpu_brand),
        }
    }
}

/// Parse the first `<digits>.<digits>GHz` token of a CPU brand string
pub fn parse_frequency_hz(brand: &str) -> Option<f64> {
    let bytes = brand.as_bytes();
    let mut search_from = 0;
    while let Some(pos) = brand[search_from..].find("GHz") {
        let end = search_from + pos;
        let mut start = end;
        while start > 0 && (bytes[start - 1].is_ascii_digit() || bytes[start - 1] == b'.') {
            start -= 1;
        }
        let token = &brand[start..end];
        let well_formed = token.contains('.')
            && !token.starts_with('.')
            && !token.ends_with('.')
            && token.matches('.').count() == 1;
        if well_formed {
            if let Ok(ghz) = token.parse::<f64>() {
                return Some(ghz * 1e9);
            }
        }
        search_from = end + 3;
    }
    None
}

/// External description of one instance, as handed to the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Base URL of the instance agent
    pub endpoint: Url,

    /// Hardware signature, if already known
    #[serde(default)]
    pub signature: Option<HardwareSignature>,

    /// Stable instance id, if already known
    #[serde(default)]
    pub stable_id: Option<String>,
}

impl InstanceDescriptor {
    /// Create a descriptor with only an endpoint
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            signature: None,
            stable_id: None,
        }
    }

    /// Parse a descriptor from an endpoint string
    pub fn parse(endpoint: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(endpoint.trim())?))
    }

    /// Attach a known hardware signature
    pub fn with_signature(mut self, signature: HardwareSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Attach a known stable id
    pub fn with_stable_id(mut self, stable_id: impl Into<String>) -> Self {
        self.stable_id = Some(stable_id.into());
        self
    }

    /// Driver-side identifier of this instance
    pub fn id(&self) -> InstanceId {
        InstanceId::new(self.endpoint.as_str())
    }
}

/// Parse a plain URL list: one URL per line, blank lines and `#` comments ignored
pub fn parse_url_list(content: &str) -> Result<Vec<InstanceDescriptor>> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            InstanceDescriptor::parse(line).with_context_fn(|| format!("invalid instance URL '{}'", line))
        })
        .collect()
}

/// Load instance descriptors from a YAML/JSON document or a plain URL list.
///
/// Duplicate endpoints are rejected: they would make one instance appear in
/// two groups.
pub fn load_descriptors(path: impl AsRef<Path>) -> Result<Vec<InstanceDescriptor>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context_fn(|| format!("failed to read instance list {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let descriptors: Vec<InstanceDescriptor> = match extension.as_deref() {
        Some("json") => serde_json::from_str(&content)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        _ => parse_url_list(&content)?,
    };

    let mut seen = std::collections::HashSet::new();
    for descriptor in &descriptors {
        if !seen.insert(descriptor.id()) {
            return Err(Error::invalid_request(format!(
                "duplicate instance endpoint {}",
                descriptor.endpoint
            )));
        }
    }

    Ok(descriptors)
}

/// A set of instances believed to share one physical host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Instance whose contention window formed this group
    pub lock: InstanceId,

    /// All members, lock instance included
    pub members: Vec<InstanceId>,
}

impl Group {
    /// Create a singleton group around a lock instance
    pub fn singleton(lock: InstanceId) -> Self {
        Self {
            members: vec![lock.clone()],
            lock,
        }
    }

    /// Check membership
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.members.contains(id)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Groups always hold their lock instance, so this is false for any group built here
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// One hardware bucket of host representatives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    /// Hardware signature shared by every instance in the set
    pub signature: HardwareSignature,

    /// One representative instance per known host, sorted
    pub instances: Vec<InstanceId>,
}
