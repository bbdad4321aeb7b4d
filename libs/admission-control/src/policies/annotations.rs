use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use regex::Regex;

use crate::admit::{AdmitFunc, Decision};
use crate::error::{DecisionError, PolicyConfigError};
use crate::policies::{NamespaceAllowList, cannot_evaluate};
use crate::review::AdmissionRequest;

const POLICY: &str = "enforce-pod-annotations";

/// Predicate over an annotation value.
#[derive(Clone)]
pub struct Validator(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl Validator {
    /// Accepts any value; only the presence of the key is enforced.
    pub fn any() -> Self {
        Self::from_fn(|_| true)
    }

    pub fn non_empty() -> Self {
        Self::from_fn(|value| !value.trim().is_empty())
    }

    /// The whole value must match `pattern`.
    pub fn matches(pattern: &str) -> Result<Self, PolicyConfigError> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            PolicyConfigError::InvalidPattern {
                pattern: pattern.to_owned(),
                source,
            }
        })?;
        Ok(Self::from_fn(move |value| regex.is_match(value)))
    }

    pub fn from_fn<F>(validate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(validate))
    }

    pub fn validate(&self, value: &str) -> bool {
        (self.0)(value)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Validator")
    }
}

/// Parse `KEY` (presence only) or `KEY=REGEX`.
pub fn parse_requirement(requirement: &str) -> Result<(String, Validator), PolicyConfigError> {
    let (key, validator) = match requirement.split_once('=') {
        Some((key, pattern)) => (key.trim(), Validator::matches(pattern)?),
        None => (requirement.trim(), Validator::any()),
    };

    if key.is_empty() {
        return Err(PolicyConfigError::InvalidRequirement(requirement.to_owned()));
    }

    Ok((key.to_owned(), validator))
}

/// Requires annotations on Pods, and on the pod templates of the built-in
/// workload controllers, outside the allow-listed namespaces.
#[derive(Clone, Debug)]
pub struct EnforcePodAnnotations {
    allowed_namespaces: NamespaceAllowList,
    required: BTreeMap<String, Validator>,
}

impl EnforcePodAnnotations {
    pub fn new<I, S>(allowed_namespaces: I, required: BTreeMap<String, Validator>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_namespaces: NamespaceAllowList::new(allowed_namespaces),
            required,
        }
    }

    pub fn required_keys(&self) -> impl Iterator<Item = &str> {
        self.required.keys().map(String::as_str)
    }

    fn failures(&self, annotations: &BTreeMap<String, String>) -> Vec<String> {
        self.required
            .iter()
            .filter_map(|(key, validator)| match annotations.get(key) {
                None => Some(format!("{key} (missing)")),
                Some(value) if !validator.validate(value) => Some(format!("{key} (invalid value)")),
                Some(_) => None,
            })
            .collect()
    }
}

/// Whether `group`/`kind` carries pod annotations this policy understands.
fn is_workload(group: &str, kind: &str) -> bool {
    matches!(
        (group, kind),
        ("", "Pod")
            | ("apps", "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet")
            | ("batch", "Job" | "CronJob")
    )
}

fn template_annotations(template: Option<PodTemplateSpec>) -> BTreeMap<String, String> {
    template
        .and_then(|template| template.metadata)
        .and_then(|metadata| metadata.annotations)
        .unwrap_or_default()
}

/// Annotations the created pods will carry, `None` when there is no object.
fn pod_annotations(
    request: &AdmissionRequest,
) -> Result<Option<BTreeMap<String, String>>, DecisionError> {
    let annotations = match request.kind.kind.as_str() {
        "Pod" => request
            .decode_object::<Pod>()?
            .map(|pod| pod.metadata.annotations.unwrap_or_default()),
        "Deployment" => request
            .decode_object::<Deployment>()?
            .map(|d| template_annotations(d.spec.map(|spec| spec.template))),
        "StatefulSet" => request
            .decode_object::<StatefulSet>()?
            .map(|s| template_annotations(s.spec.map(|spec| spec.template))),
        "DaemonSet" => request
            .decode_object::<DaemonSet>()?
            .map(|d| template_annotations(d.spec.map(|spec| spec.template))),
        "ReplicaSet" => request
            .decode_object::<ReplicaSet>()?
            .map(|r| template_annotations(r.spec.and_then(|spec| spec.template))),
        "Job" => request
            .decode_object::<Job>()?
            .map(|j| template_annotations(j.spec.map(|spec| spec.template))),
        "CronJob" => request.decode_object::<CronJob>()?.map(|c| {
            template_annotations(
                c.spec
                    .and_then(|spec| spec.job_template.spec)
                    .map(|job| job.template),
            )
        }),
        _ => Some(BTreeMap::new()),
    };

    Ok(annotations)
}

impl AdmitFunc for EnforcePodAnnotations {
    fn admit(&self, request: &AdmissionRequest) -> Result<Decision, DecisionError> {
        if !is_workload(&request.kind.group, &request.kind.kind)
            || self.allowed_namespaces.allows(request)
        {
            return Ok(Decision::allow());
        }

        let Some(annotations) = pod_annotations(request)? else {
            return Ok(cannot_evaluate(POLICY, request));
        };

        let failures = self.failures(&annotations);
        if failures.is_empty() {
            return Ok(Decision::allow());
        }

        Ok(Decision::deny(format!(
            "the submitted {} does not satisfy required annotations: {}",
            request.kind.kind,
            failures.join(", ")
        )))
    }
}
