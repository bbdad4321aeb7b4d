use admission_control::policies::parse_requirement;
use admission_control::telemetry::{self, LogFormat};
use admission_control::{
    AdmissionHandler, AdmissionServer, AdmitFunc, CloudProvider, DenyKind,
    DenyPublicLoadBalancers, EnforcePodAnnotations, Routes, ServerConfig, TlsPaths,
};

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, crate_authors, crate_description, crate_version};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

const ROUTE_PREFIX: &str = "/admission-control";

#[derive(Parser, Debug)]
#[command(
    name = "admissiond",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Path to the PEM encoded TLS certificate
    #[arg(long, default_value = "./cert.crt", env)]
    cert_path: PathBuf,

    /// Path to the PEM encoded TLS private key
    #[arg(long, default_value = "./key.key", env)]
    key_path: PathBuf,

    /// Serve plain HTTP. Only meant for local testing: the Kubernetes API
    /// server only calls webhooks over HTTPS.
    #[arg(long, env)]
    http_only: bool,

    /// Listen address (use "::" for IPv6, "0.0.0.0" for IPv4)
    #[arg(long, default_value = "0.0.0.0", env)]
    listen_address: IpAddr,

    /// Listen on given port
    #[arg(short, long, default_value_t = 8443, env)]
    port: u16,

    /// Hostname the webhook Service is reached by
    #[arg(long, default_value = "admissiond.questionable.services", env)]
    host: String,

    /// Timeout in seconds for reading request headers and processing requests
    #[arg(long, default_value_t = 15, env)]
    timeout: u64,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 30, env)]
    grace_period: u64,

    /// Reload the TLS certificate and key when they change on disk
    #[arg(long, env)]
    watch_tls: bool,

    /// Namespace where Ingress objects may be created. Can be repeated.
    #[arg(long, value_delimiter = ',', env)]
    ingress_allowed_namespace: Vec<String>,

    /// Namespace where public LoadBalancer Services may be created. Can be
    /// repeated.
    #[arg(long, value_delimiter = ',', env)]
    service_allowed_namespace: Vec<String>,

    /// Cloud providers to register LoadBalancer policies for
    #[arg(long, value_delimiter = ',', default_values = ["gcp", "azure", "aws"], env)]
    providers: Vec<String>,

    /// Namespace exempted from the Pod annotation policy. Can be repeated.
    #[arg(long, value_delimiter = ',', default_value = "kube-system", env)]
    pod_annotation_allowed_namespace: Vec<String>,

    /// Annotation every Pod must carry, as KEY or KEY=REGEX. Can be repeated.
    #[arg(long, default_value = "k8s.questionable.services/hostname", env)]
    required_pod_annotation: Vec<String>,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,admission_control=debug"
    #[arg(short, long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = Args::parse();

    if let Err(e) = telemetry::init(&args.log_filter, args.log_format) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(status = "fatal", error = %format!("{e:#}"), "admissiond stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let routes = build_routes(&args)?;

    let mut config = ServerConfig::new(SocketAddr::new(args.listen_address, args.port));
    config.host = args.host.clone();
    config.timeout = Duration::from_secs(args.timeout);
    config.grace_period = Duration::from_secs(args.grace_period);
    config.watch_tls = args.watch_tls;
    if !args.http_only {
        config.tls = Some(TlsPaths {
            cert_path: args.cert_path.clone(),
            key_path: args.key_path.clone(),
        });
    }

    let server = AdmissionServer::new(config, info_span!("server", component = "server"))?;

    let shutdown = CancellationToken::new();
    let sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    tokio::spawn(cancel_on_signal(sigterm, shutdown.clone()));

    server.run(routes.into_router(), shutdown).await?;
    Ok(())
}

fn build_routes(args: &Args) -> anyhow::Result<Routes> {
    let banner = format!("admissiond {} ({})", crate_version!(), args.host);
    let mut routes = Routes::new(banner);

    routes = mount(
        routes,
        "deny-ingresses",
        handler(
            "deny-ingresses",
            DenyKind::ingresses(&args.ingress_allowed_namespace),
        ),
    );

    let mut providers: Vec<CloudProvider> = Vec::new();
    for provider in &args.providers {
        let provider: CloudProvider = provider.parse()?;
        if !providers.contains(&provider) {
            providers.push(provider);
        }
    }

    for provider in providers {
        let policy = DenyPublicLoadBalancers::new(&args.service_allowed_namespace, provider);
        let name = format!("deny-public-services-{}", policy.provider());
        info!(
            policy = name.as_str(),
            internal_annotation = %policy.provider().internal_annotation(),
            "configured LoadBalancer policy"
        );
        routes = mount(
            routes,
            &format!("deny-public-services/{}", policy.provider()),
            handler(&name, policy),
        );
    }

    let policy = pod_annotation_policy(args)?;
    info!(
        required = ?policy.required_keys().collect::<Vec<_>>(),
        "configured pod annotation policy"
    );
    routes = mount(
        routes,
        "enforce-pod-annotations",
        handler("enforce-pod-annotations", policy),
    );

    Ok(routes)
}

fn pod_annotation_policy(args: &Args) -> anyhow::Result<EnforcePodAnnotations> {
    let required = args
        .required_pod_annotation
        .iter()
        .map(|requirement| parse_requirement(requirement))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(EnforcePodAnnotations::new(
        &args.pod_annotation_allowed_namespace,
        required,
    ))
}

fn handler(name: &str, admit: impl AdmitFunc + 'static) -> AdmissionHandler {
    let span = info_span!("admission", component = "admission", policy = name);
    AdmissionHandler::new(name, admit, span)
}

fn mount(routes: Routes, route: &str, handler: AdmissionHandler) -> Routes {
    let path = format!("{ROUTE_PREFIX}/{route}");
    info!(path = path.as_str(), policy = handler.name(), "registered admission route");
    routes.admission(&path, handler)
}

async fn cancel_on_signal(mut sigterm: Signal, shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!(signal = "SIGINT", "received shutdown signal"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "received shutdown signal"),
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes() {
        let args = Args::parse_from(["admissiond"]);
        let routes = build_routes(&args).unwrap();
        assert_eq!(
            routes.paths(),
            [
                "/",
                "/healthz",
                "/admission-control/deny-ingresses",
                "/admission-control/deny-public-services/gcp",
                "/admission-control/deny-public-services/azure",
                "/admission-control/deny-public-services/aws",
                "/admission-control/enforce-pod-annotations",
            ]
        );
    }

    #[test]
    fn test_unknown_provider() {
        let args = Args::parse_from(["admissiond", "--providers", "gcp,openstack"]);
        let err = build_routes(&args).unwrap_err();
        assert!(err.to_string().contains("openstack"));
    }

    #[test]
    fn test_invalid_requirement() {
        let args = Args::parse_from(["admissiond", "--required-pod-annotation", "team=("]);
        assert!(build_routes(&args).is_err());
    }

    #[test]
    fn test_required_annotations() {
        let args = Args::parse_from([
            "admissiond",
            "--required-pod-annotation",
            "team",
            "--required-pod-annotation",
            "cost-center=[0-9]{4}",
        ]);
        let policy = pod_annotation_policy(&args).unwrap();
        assert_eq!(
            policy.required_keys().collect::<Vec<_>>(),
            ["cost-center", "team"]
        );
    }

    #[test]
    fn test_handler_name() {
        let policy = DenyPublicLoadBalancers::new(["ops"], CloudProvider::Azure);
        let name = format!("deny-public-services-{}", policy.provider());
        assert_eq!(handler(&name, policy).name(), "deny-public-services-azure");
    }

    #[test]
    fn test_duplicate_provider() {
        let args = Args::parse_from(["admissiond", "--providers", "aws,AWS"]);
        let routes = build_routes(&args).unwrap();
        assert_eq!(routes.paths().len(), 5);
    }

    #[test]
    fn test_repeated_namespaces() {
        let args = Args::parse_from([
            "admissiond",
            "--ingress-allowed-namespace",
            "ops",
            "--ingress-allowed-namespace",
            "infra,edge",
        ]);
        assert_eq!(args.ingress_allowed_namespace, ["ops", "infra", "edge"]);
        assert_eq!(args.pod_annotation_allowed_namespace, ["kube-system"]);
    }
}
