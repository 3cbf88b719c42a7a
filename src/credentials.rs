//! ExecCredential wire format
//!
//! This is the schema the Kubernetes client exec plugin consumes. It is a
//! compatibility contract: field names and the apiVersion string must stay
//! bit-compatible with `client.authentication.k8s.io/v1beta1`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// apiVersion of the exec credential scheme served to clients
pub const EXEC_CREDENTIAL_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

/// Kind of the exec credential object
pub const EXEC_CREDENTIAL_KIND: &str = "ExecCredential";

/// Response body of the kerberos auth endpoint
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    /// Always `ExecCredential`
    pub kind: String,

    /// Always `client.authentication.k8s.io/v1beta1`
    pub api_version: String,

    /// Token payload; omitted only by clients sending the request half of
    /// the protocol, never by this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecCredentialStatus>,
}

/// Status half of an [`ExecCredential`]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    /// Bearer token to present to the API server
    pub token: String,

    /// Server-reported token expiry, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp: Option<String>,
}

impl ExecCredential {
    /// Build a credential from an issued token and its server-reported expiry
    pub fn new(token: String, expiration: Option<DateTime<Utc>>) -> Self {
        Self {
            kind: EXEC_CREDENTIAL_KIND.to_string(),
            api_version: EXEC_CREDENTIAL_API_VERSION.to_string(),
            status: Some(ExecCredentialStatus {
                token,
                expiration_timestamp: expiration
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Story: kubectl parses what we serialize
    ///
    /// The exec plugin protocol is consumed by client-go; a renamed field or
    /// a drifted apiVersion breaks every workstation at once.
    #[test]
    fn story_serialized_credential_matches_exec_plugin_schema() {
        let expiry = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let cred = ExecCredential::new("abc123".into(), Some(expiry));

        let json = serde_json::to_value(&cred).unwrap();
        assert_eq!(json["kind"], "ExecCredential");
        assert_eq!(json["apiVersion"], "client.authentication.k8s.io/v1beta1");
        assert_eq!(json["status"]["token"], "abc123");
        assert_eq!(json["status"]["expirationTimestamp"], "2024-05-01T12:30:00Z");
    }

    /// Story: a credential round-trips through its own wire format
    #[test]
    fn story_credential_roundtrip() {
        let cred = ExecCredential::new("tok".into(), Some(Utc::now()));
        let parsed: ExecCredential =
            serde_json::from_str(&serde_json::to_string(&cred).unwrap()).unwrap();

        assert_eq!(parsed.kind, EXEC_CREDENTIAL_KIND);
        assert_eq!(parsed.api_version, EXEC_CREDENTIAL_API_VERSION);
        let status = parsed.status.expect("status present");
        assert!(!status.token.is_empty());
        assert!(status.expiration_timestamp.is_some());
    }

    #[test]
    fn missing_expiry_is_omitted_from_the_body() {
        let cred = ExecCredential::new("tok".into(), None);
        let json = serde_json::to_value(&cred).unwrap();
        assert!(json["status"].get("expirationTimestamp").is_none());
    }
}
