//! Wire types for the `admission.k8s.io` AdmissionReview envelope.

use std::fmt;

use k8s_openapi::api::authentication::v1::UserInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::admit::Decision;
use crate::error::{DecisionError, DecodeError};

pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";
pub const SUPPORTED_API_VERSIONS: [&str; 2] = ["admission.k8s.io/v1", "admission.k8s.io/v1beta1"];

/// HTTP-like status code carried by a denial.
pub const DENIED_CODE: u16 = 403;
pub const DENIED_REASON: &str = "Forbidden";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resource: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `request` half of an AdmissionReview.
///
/// `object` and `old_object` stay as raw JSON: only the decision functions
/// that care about the resource body decode them, into the type they expect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_sub_resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

impl AdmissionRequest {
    /// Decode `object` into `K`. `Ok(None)` when the request has no object,
    /// which is the normal case for DELETE.
    pub fn decode_object<K: DeserializeOwned>(&self) -> Result<Option<K>, DecisionError> {
        self.object
            .as_ref()
            .map(|object| {
                K::deserialize(object).map_err(|source| DecisionError::ObjectDecode {
                    kind: self.kind.kind.clone(),
                    source,
                })
            })
            .transpose()
    }

    /// `namespace/name`, or just the name for cluster scoped resources.
    pub fn display_name(&self) -> String {
        let name = self.name.as_deref().unwrap_or_default();
        match self.namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
            _ => name.to_owned(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReview {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    request: Option<AdmissionRequest>,
}

/// A decoded, validated incoming AdmissionReview.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewRequest {
    pub api_version: String,
    pub kind: String,
    pub request: AdmissionRequest,
}

impl AdmissionReviewRequest {
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawReview = serde_json::from_slice(body).map_err(DecodeError::Malformed)?;

        let kind = raw.kind.unwrap_or_default();
        if kind != ADMISSION_REVIEW_KIND {
            return Err(DecodeError::UnexpectedKind(kind));
        }

        let api_version = raw.api_version.unwrap_or_default();
        if !SUPPORTED_API_VERSIONS.contains(&api_version.as_str()) {
            return Err(DecodeError::UnsupportedApiVersion(api_version));
        }

        let request = raw.request.ok_or(DecodeError::MissingRequest)?;

        Ok(Self {
            api_version,
            kind,
            request,
        })
    }

    /// Build the response envelope for `decision`, echoing the request's uid
    /// and envelope version.
    pub fn respond(&self, decision: Decision) -> AdmissionReviewResponse {
        AdmissionReviewResponse {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            response: AdmissionResponse::new(self.request.uid.clone(), decision),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

impl AdmissionReviewResponse {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl AdmissionResponse {
    pub fn new(uid: String, decision: Decision) -> Self {
        let allowed = decision.allowed();
        let status = decision.into_message().map(|message| Status {
            message: Some(message),
            code: (!allowed).then_some(DENIED_CODE),
            reason: (!allowed).then(|| DENIED_REASON.to_owned()),
        });

        Self {
            uid,
            allowed,
            status,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn review(api_version: &str, uid: &str) -> Vec<u8> {
        json!({
            "apiVersion": api_version,
            "kind": "AdmissionReview",
            "request": {
                "uid": uid,
                "kind": {"group": "networking.k8s.io", "version": "v1", "kind": "Ingress"},
                "resource": {"group": "networking.k8s.io", "version": "v1", "resource": "ingresses"},
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "alice", "groups": ["system:authenticated"]},
                "object": {"apiVersion": "networking.k8s.io/v1", "kind": "Ingress"},
                "oldObject": null,
                "dryRun": false
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_decode_v1_review() {
        let decoded = AdmissionReviewRequest::decode(&review("admission.k8s.io/v1", "abc")).unwrap();
        assert_eq!(decoded.api_version, "admission.k8s.io/v1");
        assert_eq!(decoded.request.uid, "abc");
        assert_eq!(decoded.request.kind.kind, "Ingress");
        assert_eq!(decoded.request.operation, Operation::Create);
        assert_eq!(decoded.request.namespace.as_deref(), Some("default"));
        assert!(decoded.request.object.is_some());
        assert!(decoded.request.old_object.is_none());
        assert_eq!(
            decoded.request.user_info.unwrap().username.as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn test_respond_mirrors_envelope_version() {
        for version in SUPPORTED_API_VERSIONS {
            let decoded = AdmissionReviewRequest::decode(&review(version, "u-1")).unwrap();
            let response = decoded.respond(Decision::allow());
            assert_eq!(response.api_version, version);
            assert_eq!(response.kind, ADMISSION_REVIEW_KIND);
            assert_eq!(response.response.uid, "u-1");
        }
    }

    #[test]
    fn test_decode_rejects_wrong_kind() {
        let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "Pod", "request": null});
        let err = AdmissionReviewRequest::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedKind(kind) if kind == "Pod"));
    }

    #[test]
    fn test_decode_rejects_missing_request() {
        let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});
        let err = AdmissionReviewRequest::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingRequest));
    }

    #[test]
    fn test_decode_rejects_unknown_api_version() {
        let err = AdmissionReviewRequest::decode(&review("admission.k8s.io/v2", "x")).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedApiVersion(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_json() {
        let body = review("admission.k8s.io/v1", "x");
        let err = AdmissionReviewRequest::decode(&body[..body.len() / 2]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_operation() {
        let mut body: serde_json::Value =
            serde_json::from_slice(&review("admission.k8s.io/v1", "x")).unwrap();
        body["request"]["operation"] = json!("PATCH");
        let err = AdmissionReviewRequest::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_denial_carries_status() {
        let response = AdmissionResponse::new("u".to_owned(), Decision::deny("nope"));
        assert!(!response.allowed);
        assert_eq!(
            response.status,
            Some(Status {
                message: Some("nope".to_owned()),
                code: Some(DENIED_CODE),
                reason: Some(DENIED_REASON.to_owned()),
            })
        );

        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["status"]["code"], 403);
    }

    #[test]
    fn test_allow_omits_status() {
        let response = AdmissionResponse::new("u".to_owned(), Decision::allow());
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded, json!({"uid": "u", "allowed": true}));
    }

    #[test]
    fn test_encode_preserves_verdict() {
        let decoded = AdmissionReviewRequest::decode(&review("admission.k8s.io/v1", "7f0c-☃")).unwrap();
        let encoded = decoded.respond(Decision::deny("denied for a reason")).encode().unwrap();
        let parsed: AdmissionReviewResponse = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(parsed.response.uid, "7f0c-☃");
        assert!(!parsed.response.allowed);
        assert_eq!(
            parsed.response.status.unwrap().message.as_deref(),
            Some("denied for a reason")
        );
    }

    #[test]
    fn test_display_name() {
        let decoded = AdmissionReviewRequest::decode(&review("admission.k8s.io/v1", "x")).unwrap();
        assert_eq!(decoded.request.display_name(), "default/web");
    }
}
