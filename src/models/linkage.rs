//! Entity linkage attached to every request, result and failure envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies which plantation-domain entity an analysis belongs to.
///
/// Every field is optional on its own, but a linkage is only valid when at
/// least one identifier is present. Empty or whitespace-only strings count as
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLinkage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_point_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_id: Option<String>,
}

/// Returned when a linkage carries no usable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("linkage must set at least one of farmer_id, region_id, group_id, collection_point_id, factory_id")]
pub struct LinkageError;

impl EntityLinkage {
    pub fn for_farmer(farmer_id: impl Into<String>) -> Self {
        Self {
            farmer_id: Some(farmer_id.into()),
            ..Default::default()
        }
    }

    pub fn for_region(region_id: impl Into<String>) -> Self {
        Self {
            region_id: Some(region_id.into()),
            ..Default::default()
        }
    }

    /// All identifiers as `(field, value)` pairs, skipping empty ones.
    pub fn identifiers(&self) -> Vec<(&'static str, &str)> {
        [
            ("farmer_id", &self.farmer_id),
            ("region_id", &self.region_id),
            ("group_id", &self.group_id),
            ("collection_point_id", &self.collection_point_id),
            ("factory_id", &self.factory_id),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (name, v))
        })
        .collect()
    }

    pub fn validate(&self) -> Result<(), LinkageError> {
        if self.identifiers().is_empty() {
            Err(LinkageError)
        } else {
            Ok(())
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl std::fmt::Display for EntityLinkage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .identifiers()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_field(index: usize, value: &str) -> EntityLinkage {
        let mut linkage = EntityLinkage::default();
        let value = Some(value.to_string());
        match index {
            0 => linkage.farmer_id = value,
            1 => linkage.region_id = value,
            2 => linkage.group_id = value,
            3 => linkage.collection_point_id = value,
            _ => linkage.factory_id = value,
        }
        linkage
    }

    #[test]
    fn test_empty_linkage_is_invalid() {
        assert_eq!(EntityLinkage::default().validate(), Err(LinkageError));
    }

    #[test]
    fn test_any_single_identifier_is_enough() {
        for index in 0..5 {
            let linkage = with_field(index, "WM-0001");
            assert!(linkage.is_valid(), "field {} alone should validate", index);
        }
    }

    #[test]
    fn test_blank_identifiers_do_not_count() {
        for index in 0..5 {
            assert!(!with_field(index, "").is_valid());
            assert!(!with_field(index, "   ").is_valid());
        }
    }

    #[test]
    fn test_deserialize_skips_missing_fields() {
        let linkage: EntityLinkage =
            serde_json::from_str(r#"{"factory_id": "F-12"}"#).unwrap();
        assert_eq!(linkage.factory_id.as_deref(), Some("F-12"));
        assert!(linkage.farmer_id.is_none());
        assert_eq!(linkage.to_string(), "factory_id=F-12");

        let json = serde_json::to_value(&linkage).unwrap();
        assert_eq!(json, serde_json::json!({"factory_id": "F-12"}));
    }
}
