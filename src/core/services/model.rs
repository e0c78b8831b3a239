//! Wire types exchanged with the probe services.

use serde::{Deserialize, Serialize};

/// How a probe-service endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Https,
    Onion,
    Cloudfront,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Https => write!(f, "https"),
            Self::Onion => write!(f, "onion"),
            Self::Cloudfront => write!(f, "cloudfront"),
        }
    }
}

/// One backend endpoint. Equal endpoints deduplicate before benchmarking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: EndpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<String>,
}

/// Check-in request. Empty fields are back-filled by the session before
/// the request leaves the probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInConfig {
    #[serde(default)]
    pub charging: bool,
    #[serde(default)]
    pub on_wifi: bool,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub probe_asn: String,
    #[serde(default)]
    pub probe_cc: String,
    #[serde(default)]
    pub run_type: String,
    #[serde(default)]
    pub software_name: String,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub web_connectivity: CheckInConfigWebConnectivity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInConfigWebConnectivity {
    /// `None` means "not set"; the session replaces it with an empty list
    /// because the remote API rejects nulls.
    #[serde(default)]
    pub category_codes: Option<Vec<String>>,
}

/// Check-in response: the work the backend wants from this probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInInfo {
    #[serde(default)]
    pub v: i64,
    #[serde(default)]
    pub tests: CheckInInfoTests,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInInfoTests {
    #[serde(default)]
    pub web_connectivity: Option<CheckInInfoWebConnectivity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInInfoWebConnectivity {
    #[serde(default)]
    pub report_id: String,
    #[serde(default)]
    pub urls: Vec<UrlInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlInfo {
    #[serde(default)]
    pub category_code: String,
    #[serde(default)]
    pub country_code: String,
    pub url: String,
}

/// A measurement as submitted to the collector. Only the envelope fields
/// the engine needs are typed; experiment results stay opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(default)]
    pub data_format_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default)]
    pub measurement_start_time: String,
    #[serde(default)]
    pub probe_asn: String,
    #[serde(default)]
    pub probe_cc: String,
    #[serde(default)]
    pub report_id: String,
    #[serde(default)]
    pub software_name: String,
    #[serde(default)]
    pub software_version: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub test_start_time: String,
    #[serde(default)]
    pub test_version: String,
    #[serde(default)]
    pub test_keys: serde_json::Value,
}

/// The subset of measurement fields identifying the report it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportTemplate {
    pub data_format_version: String,
    pub format: String,
    pub probe_asn: String,
    pub probe_cc: String,
    pub software_name: String,
    pub software_version: String,
    pub test_name: String,
    pub test_start_time: String,
    pub test_version: String,
}

impl ReportTemplate {
    pub fn from_measurement(measurement: &Measurement) -> Self {
        Self {
            data_format_version: measurement.data_format_version.clone(),
            format: "json".to_string(),
            probe_asn: measurement.probe_asn.clone(),
            probe_cc: measurement.probe_cc.clone(),
            software_name: measurement.software_name.clone(),
            software_version: measurement.software_version.clone(),
            test_name: measurement.test_name.clone(),
            test_start_time: measurement.test_start_time.clone(),
            test_version: measurement.test_version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn endpoint_kind_serializes_lowercase() {
        let endpoint = ServiceEndpoint {
            address: "https://api.ooni.io".to_string(),
            kind: EndpointKind::Https,
            front: None,
        };
        let json = serde_json::to_string(&endpoint).unwrap();
        assert!(json.contains(r#""type":"https""#));
        assert!(!json.contains("front"));
        let parsed: ServiceEndpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, endpoint);
    }

    #[test]
    fn equal_endpoints_hash_equal() {
        let a = ServiceEndpoint {
            address: "https://api.ooni.io".to_string(),
            kind: EndpointKind::Https,
            front: None,
        };
        let b = a.clone();
        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn check_in_config_serializes_category_codes_when_set() {
        let mut config = CheckInConfig::default();
        config.web_connectivity.category_codes = Some(vec![]);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""category_codes":[]"#));
    }

    #[test]
    fn check_in_info_parses_a_realistic_response() {
        let body = r#"{
            "v": 1,
            "tests": {
                "web_connectivity": {
                    "report_id": "20260802T101530Z_webconnectivity_IT_30722",
                    "urls": [
                        {"category_code": "NEWS", "country_code": "IT",
                         "url": "https://www.example.com/"}
                    ]
                }
            }
        }"#;
        let info: CheckInInfo = serde_json::from_str(body).unwrap();
        let wc = info.tests.web_connectivity.unwrap();
        assert_eq!(wc.urls.len(), 1);
        assert_eq!(wc.urls[0].category_code, "NEWS");
    }

    #[test]
    fn report_template_tracks_envelope_fields() {
        let measurement = Measurement {
            probe_asn: "AS30722".to_string(),
            probe_cc: "IT".to_string(),
            test_name: "web_connectivity".to_string(),
            ..Default::default()
        };
        let template = ReportTemplate::from_measurement(&measurement);
        assert_eq!(template.format, "json");
        assert_eq!(template.probe_asn, "AS30722");
        assert_eq!(
            template,
            ReportTemplate::from_measurement(&measurement.clone())
        );
    }
}
