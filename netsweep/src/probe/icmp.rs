//! Default ICMP driver on raw sockets.
//!
//! One echo client per address family, created lazily on the first sweep so
//! an engine without raw-socket privileges only fails when a rule actually
//! carries an ICMP check, and fails it as a job abort rather than at
//! startup.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::sync::OnceCell;
use tracing::trace;

use crate::probe::{PingReply, Pinger};

const ECHO_PAYLOAD: [u8; 56] = [0u8; 56];

#[derive(Default)]
pub struct SurgePinger {
    v4: OnceCell<Client>,
    v6: OnceCell<Client>,
}

impl std::fmt::Debug for SurgePinger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurgePinger")
            .field("v4", &self.v4.initialized())
            .field("v6", &self.v6.initialized())
            .finish()
    }
}

impl SurgePinger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, ip: IpAddr) -> anyhow::Result<&Client> {
        match ip {
            IpAddr::V4(_) => {
                self.v4
                    .get_or_try_init(|| async { Client::new(&Config::default()) })
                    .await
                    .context("cannot create ICMPv4 socket")
            }
            IpAddr::V6(_) => {
                self.v6
                    .get_or_try_init(|| async {
                        Client::new(&Config::builder().kind(ICMP::V6).build())
                    })
                    .await
                    .context("cannot create ICMPv6 socket")
            }
        }
    }

    async fn ping_one(&self, addr: IpAddr, retries: u32, timeout: Duration) -> anyhow::Result<PingReply> {
        let client = self.client(addr).await?;
        let ident = PingIdentifier(rand::random::<u16>());
        let mut pinger = client.pinger(addr, ident).await;
        pinger.timeout(timeout);

        let mut received = false;
        for attempt in 0..retries.max(1) {
            match pinger.ping(PingSequence(attempt as u16), &ECHO_PAYLOAD).await {
                Ok((_, rtt)) => {
                    trace!(%addr, ?rtt, "echo reply");
                    received = true;
                    break;
                }
                Err(_) => continue,
            }
        }
        Ok(PingReply { addr, received, dnsname: None })
    }
}

impl Pinger for SurgePinger {
    fn ping_batch<'a>(
        &'a self,
        targets: &'a [IpAddr],
        retries: u32,
        timeout: Duration,
        _allow_redirect: bool,
    ) -> BoxFuture<'a, anyhow::Result<Vec<PingReply>>> {
        async move {
            // fail fast on socket setup before fanning out
            if let Some(first) = targets.first() {
                self.client(*first).await?;
            }
            let mut in_flight: FuturesUnordered<_> = targets
                .iter()
                .map(|addr| self.ping_one(*addr, retries, timeout))
                .collect();
            let mut replies = Vec::with_capacity(targets.len());
            while let Some(reply) = in_flight.next().await {
                replies.push(reply?);
            }
            Ok(replies)
        }
        .boxed()
    }
}
