//! Declared analytics fields and the accessors that read them from a DUT.
//!
//! A field maps a name to a typed `Cluster.Attributes.Attribute` path plus an
//! endpoint. Paths are parsed when the configuration is loaded, so a typo is
//! a configuration error instead of a silently null sample.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::record::model::AnalyticsData;
use crate::record::DutInformation;

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("attribute path `{0}` must have the form Cluster.Attributes.Attribute")]
    Shape(String),

    #[error("attribute path `{path}` has an invalid identifier `{segment}`")]
    Identifier { path: String, segment: String },
}

/// `Cluster.Attributes.Attribute`, e.g. `SoftwareDiagnostics.Attributes.CurrentHeapUsed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributePath {
    cluster: String,
    attribute: String,
}

impl AttributePath {
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

impl FromStr for AttributePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let [cluster, "Attributes", attribute] = parts.as_slice() else {
            return Err(PathError::Shape(s.to_string()));
        };
        for segment in [cluster, attribute] {
            let valid = segment
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic())
                && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(PathError::Identifier {
                    path: s.to_string(),
                    segment: segment.to_string(),
                });
            }
        }
        Ok(Self {
            cluster: cluster.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.Attributes.{}", self.cluster, self.attribute)
    }
}

impl Serialize for AttributePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One declared analytics field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsField {
    pub name: String,
    pub endpoint: u16,
    pub path: AttributePath,
}

/// Anything that can read numeric attribute values off the DUT.
#[async_trait::async_trait]
pub trait AttributeSource: Send + Sync {
    /// Read one attribute. `Ok(None)` means the value could not be decoded.
    async fn read_attribute(&self, endpoint: u16, path: &AttributePath)
        -> anyhow::Result<Option<f64>>;

    /// Basic information about the device, if the source can provide it.
    async fn read_dut_information(&self) -> anyhow::Result<Option<DutInformation>> {
        Ok(None)
    }
}

/// Read every field from `source`. A failed read is logged and recorded as
/// a null sample; it never fails the iteration.
pub async fn collect_analytics(
    fields: &[AnalyticsField],
    source: &(dyn AttributeSource + '_),
) -> AnalyticsData {
    let mut data = AnalyticsData::new();
    for field in fields {
        let value = match source.read_attribute(field.endpoint, &field.path).await {
            Ok(value) => value,
            Err(e) => {
                error!(field = %field.name, path = %field.path, error = %e, "attribute read failed");
                None
            }
        };
        debug!(field = %field.name, ?value, "analytics sample");
        data.insert(field.name.clone(), value);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn test_parse_attribute_path() {
        let path: AttributePath = "SoftwareDiagnostics.Attributes.CurrentHeapUsed".parse().unwrap();
        assert_eq!(path.cluster(), "SoftwareDiagnostics");
        assert_eq!(path.attribute(), "CurrentHeapUsed");
        assert_eq!(path.to_string(), "SoftwareDiagnostics.Attributes.CurrentHeapUsed");
    }

    #[test]
    fn test_reject_malformed_paths() {
        assert!(matches!(
            "OnOff.OnOff".parse::<AttributePath>(),
            Err(PathError::Shape(_))
        ));
        assert!(matches!(
            "OnOff.Commands.Toggle".parse::<AttributePath>(),
            Err(PathError::Shape(_))
        ));
        assert!(matches!(
            "On-Off.Attributes.OnOff".parse::<AttributePath>(),
            Err(PathError::Identifier { .. })
        ));
        assert!(matches!(
            "OnOff.Attributes.".parse::<AttributePath>(),
            Err(PathError::Identifier { .. })
        ));
    }

    struct Flaky;

    #[async_trait::async_trait]
    impl AttributeSource for Flaky {
        async fn read_attribute(
            &self,
            _endpoint: u16,
            path: &AttributePath,
        ) -> anyhow::Result<Option<f64>> {
            if path.attribute() == "CurrentHeapUsed" {
                Ok(Some(2048.0))
            } else {
                bail!("read timed out")
            }
        }
    }

    #[tokio::test]
    async fn test_failed_reads_become_null() {
        let fields = vec![
            AnalyticsField {
                name: "heap_usage".into(),
                endpoint: 0,
                path: "SoftwareDiagnostics.Attributes.CurrentHeapUsed".parse().unwrap(),
            },
            AnalyticsField {
                name: "uptime".into(),
                endpoint: 0,
                path: "GeneralDiagnostics.Attributes.UpTime".parse().unwrap(),
            },
        ];
        let data = collect_analytics(&fields, &Flaky).await;
        assert_eq!(data["heap_usage"], Some(2048.0));
        assert_eq!(data["uptime"], None);
    }
}
