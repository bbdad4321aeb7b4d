use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Service;

use crate::admit::{AdmitFunc, Decision};
use crate::error::{DecisionError, PolicyConfigError};
use crate::policies::{NamespaceAllowList, cannot_evaluate};
use crate::review::AdmissionRequest;

const POLICY: &str = "deny-public-services";
const LOAD_BALANCER: &str = "LoadBalancer";

/// Cloud provider whose annotations mark a LoadBalancer as internal-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloudProvider {
    Gcp,
    Azure,
    Aws,
}

/// (annotation, accepted values) pairs; any one present marks the Service internal.
type Indicators = &'static [(&'static str, &'static [&'static str])];

const GCP_INDICATORS: Indicators = &[
    ("networking.gke.io/load-balancer-type", &["Internal"]),
    ("cloud.google.com/load-balancer-type", &["Internal"]),
];

const AZURE_INDICATORS: Indicators = &[(
    "service.beta.kubernetes.io/azure-load-balancer-internal",
    &["true"],
)];

const AWS_INDICATORS: Indicators = &[
    (
        "service.beta.kubernetes.io/aws-load-balancer-internal",
        &["true", "0.0.0.0/0"],
    ),
    ("service.beta.kubernetes.io/aws-load-balancer-scheme", &["internal"]),
];

impl CloudProvider {
    pub const ALL: [CloudProvider; 3] = [CloudProvider::Gcp, CloudProvider::Azure, CloudProvider::Aws];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Gcp => "gcp",
            CloudProvider::Azure => "azure",
            CloudProvider::Aws => "aws",
        }
    }

    fn indicators(&self) -> Indicators {
        match self {
            CloudProvider::Gcp => GCP_INDICATORS,
            CloudProvider::Azure => AZURE_INDICATORS,
            CloudProvider::Aws => AWS_INDICATORS,
        }
    }

    /// The annotation suggested to operators in denial messages.
    pub fn internal_annotation(&self) -> String {
        let (key, values) = self.indicators()[0];
        format!("{key}: \"{}\"", values[0])
    }

    pub fn is_internal(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.indicators().iter().any(|(key, accepted)| {
            annotations.get(*key).is_some_and(|value| {
                accepted
                    .iter()
                    .any(|expected| value.trim().eq_ignore_ascii_case(expected))
            })
        })
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = PolicyConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CloudProvider::ALL
            .into_iter()
            .find(|provider| provider.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PolicyConfigError::UnknownProvider(s.to_owned()))
    }
}

/// Denies Services of type LoadBalancer that are not marked internal-only for
/// the configured provider.
#[derive(Clone, Debug)]
pub struct DenyPublicLoadBalancers {
    provider: CloudProvider,
    allowed_namespaces: NamespaceAllowList,
}

impl DenyPublicLoadBalancers {
    pub fn new<I, S>(allowed_namespaces: I, provider: CloudProvider) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            provider,
            allowed_namespaces: NamespaceAllowList::new(allowed_namespaces),
        }
    }

    pub fn provider(&self) -> CloudProvider {
        self.provider
    }
}

impl AdmitFunc for DenyPublicLoadBalancers {
    fn admit(&self, request: &AdmissionRequest) -> Result<Decision, DecisionError> {
        if !(request.kind.group.is_empty() && request.kind.kind == "Service")
            || self.allowed_namespaces.allows(request)
        {
            return Ok(Decision::allow());
        }

        let Some(service) = request.decode_object::<Service>()? else {
            return Ok(cannot_evaluate(POLICY, request));
        };

        let service_type = service.spec.as_ref().and_then(|spec| spec.type_.as_deref());
        if service_type != Some(LOAD_BALANCER) {
            return Ok(Decision::allow());
        }

        let annotations = service.metadata.annotations.unwrap_or_default();
        if self.provider.is_internal(&annotations) {
            return Ok(Decision::allow());
        }

        Ok(Decision::deny(format!(
            "Services of type LoadBalancer without an internal-only annotation cannot be deployed to this cluster (provider {}: set {})",
            self.provider,
            self.provider.internal_annotation(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policies::test_support::request;

    use serde_json::{Value, json};

    fn service(service_type: &str, annotations: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "example", "annotations": annotations},
            "spec": {"type": service_type, "ports": [{"port": 443}]},
        })
    }

    fn service_request(namespace: &str, object: Value) -> AdmissionRequest {
        request("", "Service", namespace, Some(object))
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!("gcp".parse::<CloudProvider>().unwrap(), CloudProvider::Gcp);
        assert_eq!("Azure".parse::<CloudProvider>().unwrap(), CloudProvider::Azure);
        assert_eq!(" AWS ".parse::<CloudProvider>().unwrap(), CloudProvider::Aws);
        assert!(matches!(
            "digitalocean".parse::<CloudProvider>(),
            Err(PolicyConfigError::UnknownProvider(name)) if name == "digitalocean"
        ));
    }

    #[test]
    fn test_aws_without_indicator_is_denied() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Aws);
        let decision = policy
            .admit(&service_request("default", service("LoadBalancer", json!({}))))
            .unwrap();
        assert!(!decision.allowed());
        assert!(decision.message().unwrap().contains("aws-load-balancer-internal"));
    }

    #[test]
    fn test_aws_with_indicator_is_allowed() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Aws);
        for annotations in [
            json!({"service.beta.kubernetes.io/aws-load-balancer-internal": "0.0.0.0/0"}),
            json!({"service.beta.kubernetes.io/aws-load-balancer-internal": "true"}),
            json!({"service.beta.kubernetes.io/aws-load-balancer-scheme": "internal"}),
        ] {
            let decision = policy
                .admit(&service_request("default", service("LoadBalancer", annotations)))
                .unwrap();
            assert!(decision.allowed());
        }
    }

    #[test]
    fn test_external_indicator_is_denied() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Aws);
        let annotations =
            json!({"service.beta.kubernetes.io/aws-load-balancer-scheme": "internet-facing"});
        let decision = policy
            .admit(&service_request("default", service("LoadBalancer", annotations)))
            .unwrap();
        assert!(!decision.allowed());
    }

    #[test]
    fn test_indicator_of_another_provider_is_denied() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Gcp);
        let annotations = json!({"service.beta.kubernetes.io/azure-load-balancer-internal": "true"});
        let decision = policy
            .admit(&service_request("default", service("LoadBalancer", annotations)))
            .unwrap();
        assert!(!decision.allowed());
    }

    #[test]
    fn test_gcp_and_azure_indicators() {
        let gcp = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Gcp);
        let annotations = json!({"cloud.google.com/load-balancer-type": "internal"});
        assert!(
            gcp.admit(&service_request("default", service("LoadBalancer", annotations)))
                .unwrap()
                .allowed()
        );

        let azure = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Azure);
        let annotations = json!({"service.beta.kubernetes.io/azure-load-balancer-internal": "true"});
        assert!(
            azure
                .admit(&service_request("default", service("LoadBalancer", annotations)))
                .unwrap()
                .allowed()
        );
    }

    #[test]
    fn test_non_load_balancer_is_allowed() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Azure);
        let decision = policy
            .admit(&service_request("default", service("ClusterIP", json!({}))))
            .unwrap();
        assert!(decision.allowed());
    }

    #[test]
    fn test_other_kinds_pass_through() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Aws);
        let pod = request("", "Pod", "default", Some(json!({"apiVersion": "v1", "kind": "Pod"})));
        assert!(policy.admit(&pod).unwrap().allowed());
    }

    #[test]
    fn test_allow_listed_namespace_is_allowed() {
        let policy = DenyPublicLoadBalancers::new(["edge"], CloudProvider::Aws);
        let decision = policy
            .admit(&service_request("edge", service("LoadBalancer", json!({}))))
            .unwrap();
        assert!(decision.allowed());
    }

    #[test]
    fn test_missing_object_fails_closed() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Aws);
        let decision = policy.admit(&request("", "Service", "default", None)).unwrap();
        assert!(!decision.allowed());
        assert!(decision.message().unwrap().contains("carries no object"));
    }

    #[test]
    fn test_undecodable_object_is_an_error() {
        let policy = DenyPublicLoadBalancers::new(Vec::<String>::new(), CloudProvider::Aws);
        let broken = json!({"apiVersion": "v1", "kind": "Service", "spec": {"type": 42}});
        assert!(matches!(
            policy.admit(&service_request("default", broken)),
            Err(DecisionError::ObjectDecode { .. })
        ));
    }
}
