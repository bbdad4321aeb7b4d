//! Engine for Kubernetes validating admission webhooks.
//!
//! An [`AdmissionHandler`] decodes an `admission.k8s.io` review, asks an
//! [`AdmitFunc`] for a verdict and encodes the response. [`Routes`] mounts
//! handlers on an axum router and [`AdmissionServer`] serves it over TLS with
//! graceful shutdown.

pub mod admit;
pub mod conn;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod policies;
pub mod review;
pub mod routes;
pub mod server;
pub mod telemetry;
pub mod tls;

pub use admit::{AdmitFunc, Decision};
pub use error::{DecisionError, DecodeError, Error, PolicyConfigError, Result, TransportError};
pub use handler::AdmissionHandler;
pub use policies::{
    CloudProvider, DenyKind, DenyPublicLoadBalancers, EnforcePodAnnotations, Validator,
};
pub use review::{AdmissionRequest, AdmissionReviewRequest, AdmissionReviewResponse, Operation};
pub use routes::Routes;
pub use server::{AdmissionServer, ServerConfig, ServerState, TlsPaths};
