//! Passive agent probe.
//!
//! Speaks the classic monitoring-agent framing: `ZBXD` magic, a protocol
//! flag byte and a little-endian length, followed by the item key.  A
//! readable reply marks the service up and its payload becomes the service
//! value; a `ZBX_NOTSUPPORTED` reply means the agent is there but the item
//! is not — still down for discovery purposes.

use std::net::IpAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::probe::{tcp, ProbeOutcome};

const MAGIC: &[u8; 4] = b"ZBXD";
const FLAG_PROTOCOL: u8 = 0x01;
const HEADER_LEN: usize = 13;
const PAYLOAD_MAX: u64 = 16 * 1024 * 1024;

pub(crate) async fn check(
    ip: IpAddr,
    port: u16,
    key: &str,
    timeout: Duration,
    source_ip: Option<IpAddr>,
) -> ProbeOutcome {
    match tokio::time::timeout(timeout, query(ip, port, key, source_ip)).await {
        Ok(Some(value)) if !value.starts_with("ZBX_NOTSUPPORTED") => ProbeOutcome::up_with(value),
        _ => ProbeOutcome::down(),
    }
}

async fn query(ip: IpAddr, port: u16, key: &str, source_ip: Option<IpAddr>) -> Option<String> {
    let mut stream = tcp::connect(ip, port, source_ip).await?;
    stream.write_all(&frame(key.as_bytes())).await.ok()?;

    let mut header = BytesMut::zeroed(HEADER_LEN);
    stream.read_exact(&mut header).await.ok()?;
    if !header.starts_with(MAGIC) {
        return None;
    }
    header.advance(MAGIC.len() + 1);
    let len = header.get_u64_le();
    if len > PAYLOAD_MAX {
        return None;
    }
    let mut payload = BytesMut::zeroed(len as usize);
    stream.read_exact(&mut payload).await.ok()?;
    Some(String::from_utf8_lossy(&payload).into_owned())
}

pub(crate) fn frame(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_slice(MAGIC);
    out.put_u8(FLAG_PROTOCOL);
    out.put_u64_le(body.len() as u64);
    out.put_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::rule::ServiceStatus;
    use tokio::net::TcpListener;

    async fn fake_agent(reply_body: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut header = BytesMut::zeroed(HEADER_LEN);
                if stream.read_exact(&mut header).await.is_err() {
                    continue;
                }
                header.advance(MAGIC.len() + 1);
                let len = header.get_u64_le();
                let mut key = BytesMut::zeroed(len as usize);
                let _ = stream.read_exact(&mut key).await;
                let _ = stream.write_all(&frame(reply_body)).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn supported_item_is_up_with_value() {
        let addr = fake_agent(b"Linux lab 6.1").await;
        let outcome = check(addr.ip(), addr.port(), "system.uname", Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, ServiceStatus::Up);
        assert_eq!(outcome.value, "Linux lab 6.1");
    }

    #[tokio::test]
    async fn notsupported_reply_is_down() {
        let addr = fake_agent(b"ZBX_NOTSUPPORTED\0no such item").await;
        let outcome = check(addr.ip(), addr.port(), "nope", Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn no_agent_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let outcome = check(addr.ip(), addr.port(), "system.uname", Duration::from_millis(300), None).await;
        assert_eq!(outcome.status, ServiceStatus::Down);
    }
}
