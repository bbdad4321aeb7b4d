//! Built-in decision functions.

mod annotations;
mod kind;
mod loadbalancer;

use std::collections::BTreeSet;

pub use annotations::{EnforcePodAnnotations, Validator, parse_requirement};
pub use kind::DenyKind;
pub use loadbalancer::{CloudProvider, DenyPublicLoadBalancers};

use crate::admit::Decision;
use crate::review::AdmissionRequest;

/// Namespaces exempted from a policy. Empty means no exemptions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceAllowList(BTreeSet<String>);

impl NamespaceAllowList {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(namespaces.into_iter().map(Into::into).collect())
    }

    /// Cluster scoped requests are never exempt.
    pub fn allows(&self, request: &AdmissionRequest) -> bool {
        request
            .namespace
            .as_deref()
            .is_some_and(|namespace| self.0.contains(namespace))
    }
}

/// Denial used when a policy needs the object body and the request has none.
pub(crate) fn cannot_evaluate(policy: &str, request: &AdmissionRequest) -> Decision {
    Decision::deny(format!(
        "{policy}: cannot evaluate {} of {} {}: the request carries no object",
        request.operation,
        request.kind.kind,
        request.display_name(),
    ))
}


#[cfg(test)]
mod tests {
    use super::test_support::request;
    use super::*;

    #[test]
    fn test_allow_list() {
        let allow = NamespaceAllowList::new(["ops", "kube-system"]);
        assert!(allow.allows(&request("", "Pod", "ops", None)));
        assert!(!allow.allows(&request("", "Pod", "default", None)));

        let mut cluster_scoped = request("", "Namespace", "ops", None);
        cluster_scoped.namespace = None;
        assert!(!allow.allows(&cluster_scoped));

        assert!(!NamespaceAllowList::default().allows(&request("", "Pod", "ops", None)));
    }

    #[test]
    fn test_cannot_evaluate_explains() {
        let decision = cannot_evaluate("deny-public-services", &request("", "Service", "web", None));
        assert!(!decision.allowed());
        assert_eq!(
            decision.message(),
            Some(
                "deny-public-services: cannot evaluate DELETE of Service web/example: the request carries no object"
            )
        );
    }
}
