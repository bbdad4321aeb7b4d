use crate::admit::{AdmitFunc, Decision};
use crate::error::{DecisionError, PolicyConfigError};
use crate::policies::NamespaceAllowList;
use crate::review::AdmissionRequest;

/// Denies every request for one resource kind outside the allow-listed
/// namespaces. Requests for other kinds pass through.
#[derive(Clone, Debug)]
pub struct DenyKind {
    kind: String,
    policy: String,
    allowed_namespaces: NamespaceAllowList,
}

impl DenyKind {
    pub fn new<I, S>(kind: impl Into<String>, allowed_namespaces: I) -> Result<Self, PolicyConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(PolicyConfigError::EmptyKind);
        }

        Ok(Self {
            policy: format!("deny-{}s", kind.to_lowercase()),
            kind,
            allowed_namespaces: NamespaceAllowList::new(allowed_namespaces),
        })
    }

    pub fn ingresses<I, S>(allowed_namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: "Ingress".to_owned(),
            policy: "deny-ingresses".to_owned(),
            allowed_namespaces: NamespaceAllowList::new(allowed_namespaces),
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }
}

impl AdmitFunc for DenyKind {
    fn admit(&self, request: &AdmissionRequest) -> Result<Decision, DecisionError> {
        if request.kind.kind != self.kind || self.allowed_namespaces.allows(request) {
            return Ok(Decision::allow());
        }

        Ok(Decision::deny(format!(
            "{} objects cannot be deployed to this cluster (policy: {})",
            self.kind, self.policy
        )))
    }
}
