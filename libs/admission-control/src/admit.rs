use crate::error::DecisionError;
use crate::review::AdmissionRequest;

const GENERIC_DENIAL: &str = "denied by admission policy";

/// A validating decision function.
///
/// Implementations must be pure: no I/O and no state shared between calls
/// other than their own immutable configuration. Returning `Err` is not a
/// verdict; the handler denies the request on the policy's behalf.
pub trait AdmitFunc: Send + Sync {
    fn admit(&self, request: &AdmissionRequest) -> Result<Decision, DecisionError>;
}

impl<F> AdmitFunc for F
where
    F: Fn(&AdmissionRequest) -> Result<Decision, DecisionError> + Send + Sync,
{
    fn admit(&self, request: &AdmissionRequest) -> Result<Decision, DecisionError> {
        self(request)
    }
}

/// Verdict for a single admission request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    allowed: bool,
    message: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    /// A denial always carries a message; an empty one is replaced.
    pub fn deny(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            GENERIC_DENIAL.to_owned()
        } else {
            message
        };

        Self {
            allowed: false,
            message: Some(message),
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn into_message(self) -> Option<String> {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_never_has_empty_message() {
        assert_eq!(Decision::deny("").message(), Some(GENERIC_DENIAL));
        assert_eq!(Decision::deny("   ").message(), Some(GENERIC_DENIAL));
        assert_eq!(Decision::deny("no").message(), Some("no"));
        assert!(!Decision::deny("no").allowed());
    }

    #[test]
    fn test_allow_has_no_message() {
        let decision = Decision::allow();
        assert!(decision.allowed());
        assert_eq!(decision.message(), None);
    }
}
