use std::fmt::Write;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};

use crate::handler::AdmissionHandler;

pub const INDEX_PATH: &str = "/";
pub const HEALTH_PATH: &str = "/healthz";

/// Largest AdmissionReview body accepted.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Route table of the webhook server.
///
/// Keeps the registered paths next to the router so `GET /` can list them.
#[derive(Debug)]
pub struct Routes {
    banner: String,
    paths: Vec<String>,
    router: Router,
}

impl Routes {
    pub fn new(banner: impl Into<String>) -> Self {
        Self {
            banner: banner.into(),
            paths: vec![INDEX_PATH.to_owned(), HEALTH_PATH.to_owned()],
            router: Router::new(),
        }
    }

    /// Mount `handler` for POST requests on `path`.
    pub fn admission(mut self, path: &str, handler: AdmissionHandler) -> Self {
        let route_path = path.to_owned();
        self.router = self.router.route(
            path,
            post(move |headers: HeaderMap, body: Bytes| async move {
                handler.handle(&route_path, &headers, &body)
            }),
        );
        self.paths.push(path.to_owned());
        self
    }

    /// Mount a plain GET route, listed on the index like admission routes.
    pub fn get<H, T>(mut self, path: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.router = self.router.route(path, get(handler));
        self.paths.push(path.to_owned());
        self
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn into_router(self) -> Router {
        let index = Arc::new(render_index(&self.banner, &self.paths));

        self.router
            .route(INDEX_PATH, get(move || async move { index.to_string() }))
            .route(HEALTH_PATH, get(healthz))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn render_index(banner: &str, paths: &[String]) -> String {
    let mut index = String::new();
    writeln!(index, "{banner}").ok();
    writeln!(index, "Available routes:").ok();
    for path in paths {
        writeln!(index, "{path}").ok();
    }
    index
}
