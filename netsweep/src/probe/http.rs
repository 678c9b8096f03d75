//! HTTP/HTTPS availability probes.
//!
//! A discovery probe only cares whether *something* answers HTTP on the
//! port: any response, whatever the status code, is up.  Certificates are
//! not verified and redirects are followed only when the check allows it.

use std::net::IpAddr;
use std::time::Duration;

use tracing::trace;

use crate::rule::{CheckType, ServiceStatus};

pub(crate) fn build_client(
    allow_redirect: bool,
    source_ip: Option<IpAddr>,
) -> reqwest::Result<reqwest::Client> {
    let redirect = if allow_redirect {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };
    reqwest::Client::builder()
        .redirect(redirect)
        .danger_accept_invalid_certs(true)
        .local_address(source_ip)
        .build()
}

pub(crate) async fn check(
    client: &reqwest::Client,
    kind: CheckType,
    ip: IpAddr,
    port: u16,
    timeout: Duration,
) -> ServiceStatus {
    let scheme = if kind == CheckType::Https { "https" } else { "http" };
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    let url = format!("{scheme}://{host}:{port}/");

    match client.head(&url).timeout(timeout).send().await {
        Ok(response) => {
            trace!(%url, status = %response.status(), "http probe answered");
            ServiceStatus::Up
        }
        Err(err) => {
            trace!(%url, "http probe failed: {err}");
            ServiceStatus::Down
        }
    }
}
