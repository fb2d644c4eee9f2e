//! Common types used throughout MedStock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Resources of the inventory API that get a readable change label.
pub const KNOWN_RESOURCES: &[&str] = &[
    "materials",
    "barcodes",
    "stock",
    "usages",
    "suppliers",
    "categories",
    "locations",
    "orders",
];

/// Label used when no path segment names a known resource.
const UNKNOWN_RESOURCE: &str = "unknown";

/// Store-assigned identifier of a queued change.
///
/// Identifiers are strictly increasing within one store and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(i64);

impl ChangeId {
    /// Wrap a raw store identifier.
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Get the raw identifier.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// HTTP verb of a replayable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    /// Any other syntactically valid method, stored uppercase.
    Other(String),
}

impl HttpMethod {
    /// Canonical uppercase form.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Other(method) => method,
        }
    }

    /// Verb used in change labels.
    pub fn verb(&self) -> String {
        match self {
            Self::Post => "create".to_string(),
            Self::Put | Self::Patch => "update".to_string(),
            Self::Delete => "delete".to_string(),
            other => other.as_str().to_ascii_lowercase(),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = crate::Error;

    fn from_str(raw: &str) -> crate::Result<Self> {
        let method = raw.trim().to_ascii_uppercase();
        if method.is_empty() {
            return Err(crate::Error::InvalidInput(
                "HTTP method cannot be empty".to_string(),
            ));
        }
        // RFC 9110 token characters only
        if !method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c))
        {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid HTTP method: {raw}"
            )));
        }

        Ok(match method.as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            _ => Self::Other(method),
        })
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl From<HttpMethod> for String {
    fn from(method: HttpMethod) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Derive the display label `"<verb>_<resource>"` for a change.
///
/// `url` may be absolute or a bare path. The first path segment that names a
/// known resource wins; query and fragment are ignored.
pub fn derive_change_type(method: &HttpMethod, url: &str) -> String {
    let resource = resource_of(url).unwrap_or(UNKNOWN_RESOURCE);
    format!("{}_{}", method.verb(), resource)
}

fn resource_of(url: &str) -> Option<&'static str> {
    let parsed = Url::parse(url).or_else(|_| {
        Url::parse("http://localhost/").and_then(|base| base.join(url))
    });
    let parsed = parsed.ok()?;
    let segments = parsed.path_segments()?;
    for segment in segments {
        if let Some(resource) = KNOWN_RESOURCES
            .iter()
            .copied()
            .find(|known| known.eq_ignore_ascii_case(segment))
        {
            return Some(resource);
        }
    }
    None
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!(" Patch ".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert_eq!(
            "purge".parse::<HttpMethod>().unwrap(),
            HttpMethod::Other("PURGE".to_string())
        );
    }

    #[test]
    fn test_method_parse_rejects_garbage() {
        assert!("".parse::<HttpMethod>().is_err());
        assert!("PO ST".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_method_serde_roundtrip_as_string() {
        let json = serde_json::to_string(&HttpMethod::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
        let method: HttpMethod = serde_json::from_str("\"put\"").unwrap();
        assert_eq!(method, HttpMethod::Put);
    }

    #[test]
    fn test_change_type_from_path() {
        assert_eq!(
            derive_change_type(&HttpMethod::Post, "/api/materials"),
            "create_materials"
        );
        assert_eq!(
            derive_change_type(&HttpMethod::Put, "/api/v1/barcodes/42?force=1"),
            "update_barcodes"
        );
        assert_eq!(
            derive_change_type(&HttpMethod::Delete, "https://inv.example.org/api/usages/7"),
            "delete_usages"
        );
    }

    #[test]
    fn test_change_type_first_known_segment_wins() {
        assert_eq!(
            derive_change_type(&HttpMethod::Patch, "/api/locations/3/stock"),
            "update_locations"
        );
    }

    #[test]
    fn test_change_type_unknown_resource() {
        assert_eq!(
            derive_change_type(&HttpMethod::Post, "/api/reports"),
            "create_unknown"
        );
        assert_eq!(
            derive_change_type(&HttpMethod::Other("PURGE".into()), "/cache"),
            "purge_unknown"
        );
    }

    #[test]
    fn test_change_id_ordering() {
        assert!(ChangeId::new(1) < ChangeId::new(2));
        assert_eq!(ChangeId::new(9).to_string(), "9");
    }

    proptest! {
        #[test]
        fn change_type_always_has_verb_and_resource(path in "[a-z/]{0,24}") {
            let label = derive_change_type(&HttpMethod::Post, &path);
            prop_assert!(label.starts_with("create_"));
            prop_assert!(label.len() > "create_".len());
        }
    }
}
