use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use rustls::ServerConfig;
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;
use tracing::{Span, error, info};

use crate::error::TransportError;
use crate::server::TlsPaths;

/// Delay between a change notification and the reload, so that both files of
/// a rotated pair are on disk.
const RELOAD_SETTLE_DELAY: Duration = Duration::from_secs(5);

pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TransportError> {
    let cert_file =
        File::open(cert_path).map_err(|e| TransportError::read("certificate", cert_path, e))?;
    let key_file = File::open(key_path).map_err(|e| TransportError::read("key", key_path, e))?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);

    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::read("certificate", cert_path, e))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TransportError::read("key", key_path, e))?
        .ok_or_else(|| {
            TransportError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Rustls("cannot select TLS protocol versions".to_owned(), e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Rustls("invalid certificate or key".to_owned(), e))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

/// Directories holding the certificate and key. Watching the directories
/// rather than the files catches the symlink swaps done by Kubernetes secret
/// volumes.
fn watched_dirs(paths: &TlsPaths) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = [&paths.cert_path, &paths.key_path]
        .into_iter()
        .map(|path| match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        })
        .collect();
    dirs.dedup();
    dirs
}

/// Reload `rustls_config` in place whenever the certificate or key changes.
/// A failed reload keeps serving the previous material.
pub(crate) async fn watch_tls_files(
    paths: TlsPaths,
    rustls_config: RustlsConfig,
    span: Span,
) -> Result<(), TransportError> {
    let (tx, mut rx) = mpsc::channel(1);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                // a reload is already pending when the channel is full
                let _ = tx.try_send(());
            }
        }
    })
    .map_err(|e| TransportError::Watch("cannot create certificate watcher".to_owned(), e))?;

    for dir in watched_dirs(&paths) {
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| TransportError::Watch(format!("cannot watch {}", dir.display()), e))?;
    }

    while rx.recv().await.is_some() {
        tokio::time::sleep(RELOAD_SETTLE_DELAY).await;

        match load_tls_config(&paths.cert_path, &paths.key_path) {
            Ok(new_config) => {
                rustls_config.reload_from_config(Arc::new(new_config));
                info!(parent: &span, "reloaded TLS certificates");
            }
            Err(e) => {
                error!(parent: &span, error = %e, "cannot reload TLS certificates");
            }
        }
    }

    Ok(())
}
