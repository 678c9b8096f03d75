//! Reverse DNS lookups for discovered addresses.

use std::net::IpAddr;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use trust_dns_resolver::TokioAsyncResolver;

/// Reverse resolution seam; the engine only ever needs "address to name,
/// best effort".
pub trait ReverseResolver: Send + Sync {
    fn reverse(&self, ip: IpAddr) -> BoxFuture<'_, Option<String>>;
}

/// Resolver backed by the system configuration.  Construction is lazy so an
/// unusable resolv.conf degrades discovery to empty DNS names instead of
/// failing engine startup.
#[derive(Debug, Default)]
pub struct SystemResolver {
    inner: OnceCell<Option<TokioAsyncResolver>>,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver(&self) -> Option<&TokioAsyncResolver> {
        self.inner
            .get_or_init(|| async {
                match TokioAsyncResolver::tokio_from_system_conf() {
                    Ok(resolver) => Some(resolver),
                    Err(err) => {
                        warn!("reverse DNS disabled: {err}");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }
}

impl ReverseResolver for SystemResolver {
    fn reverse(&self, ip: IpAddr) -> BoxFuture<'_, Option<String>> {
        async move {
            let resolver = self.resolver().await?;
            match resolver.reverse_lookup(ip).await {
                Ok(names) => names
                    .iter()
                    .next()
                    .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
                Err(err) => {
                    debug!(%ip, "reverse lookup failed: {err}");
                    None
                }
            }
        }
        .boxed()
    }
}

/// Resolver that never answers; hosts are reported with empty DNS names.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReverseDns;

impl ReverseResolver for NoReverseDns {
    fn reverse(&self, _ip: IpAddr) -> BoxFuture<'_, Option<String>> {
        async { None }.boxed()
    }
}
