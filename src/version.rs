//! Build information
//!
//! Values other than the crate version are injected at compile time through
//! `BUILD_BRANCH`, `BUILD_REVISION`, `BUILD_RUSTC_VERSION`, `BUILD_DATE` and
//! `BUILD_USER`, and read `unknown` when absent.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tracing::info;
use warp::Filter;

const UNKNOWN: &str = "unknown";

/// Build metadata of the running binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    pub branch: String,
    pub revision: String,
    pub rust_version: String,
    pub build_date: String,
    pub build_user: String,
}

impl BuildInfo {
    /// Build information of this binary
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            branch: option_env!("BUILD_BRANCH").unwrap_or(UNKNOWN).to_string(),
            revision: option_env!("BUILD_REVISION").unwrap_or(UNKNOWN).to_string(),
            rust_version: option_env!("BUILD_RUSTC_VERSION")
                .unwrap_or(UNKNOWN)
                .to_string(),
            build_date: option_env!("BUILD_DATE").unwrap_or(UNKNOWN).to_string(),
            build_user: option_env!("BUILD_USER").unwrap_or(UNKNOWN).to_string(),
        }
    }

    /// One-line version string
    pub fn summary(&self) -> String {
        format!(
            "mqtt-messenger, version {} (branch: {}, revision: {})",
            self.version, self.branch, self.revision
        )
    }

    /// Multi-line report including build environment
    pub fn full_report(&self) -> String {
        format!(
            "{}\n  build user:       {}\n  build date:       {}\n  rust version:     {}",
            self.summary(),
            self.build_user,
            self.build_date,
            self.rust_version
        )
    }
}

/// `GET /version` returning the build information as pretty JSON
pub fn routes() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("version")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            let body = serde_json::to_string_pretty(&BuildInfo::current())
                .unwrap_or_else(|_| "{}".to_string());
            warp::reply::with_header(body, "content-type", "application/json; charset=utf-8")
        })
}

/// Serve [`routes`] until `shutdown` resolves
pub async fn serve(
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), warp::Error> {
    let (bound, server) = warp::serve(routes()).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(address = %bound, "Serving build information");
    server.await;
    Ok(())
}
