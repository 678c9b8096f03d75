//! TCP banner-family probes: plain connect checks plus the greeting
//! validation the mail/news protocols need.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::trace;

use crate::probe::ProbeOutcome;
use crate::rule::CheckType;

const BANNER_MAX: usize = 255;
const TELNET_IAC: u8 = 0xff;

/// Probes one `(address, port)` for the given banner-family service.  Every
/// failure mode is a down service, never an error.
pub(crate) async fn check(
    kind: CheckType,
    ip: IpAddr,
    port: u16,
    timeout: Duration,
    source_ip: Option<IpAddr>,
) -> ProbeOutcome {
    match tokio::time::timeout(timeout, probe(kind, ip, port, source_ip)).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) | Err(_) => ProbeOutcome::down(),
    }
}

async fn probe(kind: CheckType, ip: IpAddr, port: u16, source_ip: Option<IpAddr>) -> Option<ProbeOutcome> {
    let mut stream = connect(ip, port, source_ip).await?;

    let outcome = match kind {
        CheckType::Tcp => ProbeOutcome::up(),
        CheckType::Ssh => {
            let banner = read_banner(&mut stream).await?;
            if banner.starts_with("SSH-") {
                ProbeOutcome::up_with(banner.lines().next().unwrap_or_default().trim().to_string())
            } else {
                return None;
            }
        }
        CheckType::Smtp => {
            let banner = read_banner(&mut stream).await?;
            if !banner.starts_with("220") {
                return None;
            }
            let _ = stream.write_all(b"QUIT\r\n").await;
            ProbeOutcome::up()
        }
        CheckType::Ftp => expect_prefix(&mut stream, &["220"]).await?,
        CheckType::Pop => expect_prefix(&mut stream, &["+OK"]).await?,
        CheckType::Nntp => expect_prefix(&mut stream, &["200", "201"]).await?,
        CheckType::Imap => expect_prefix(&mut stream, &["* OK"]).await?,
        CheckType::Telnet => {
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.ok()?;
            if n > 0 && buf[..n].contains(&TELNET_IAC) {
                ProbeOutcome::up()
            } else {
                return None;
            }
        }
        other => {
            trace!(%other, "connect-only probe");
            ProbeOutcome::up()
        }
    };
    Some(outcome)
}

/// Connects with the configured source address when it matches the target
/// family.
pub(crate) async fn connect(ip: IpAddr, port: u16, source_ip: Option<IpAddr>) -> Option<TcpStream> {
    let addr = SocketAddr::new(ip, port);
    match source_ip {
        Some(source) if source.is_ipv4() == ip.is_ipv4() => {
            let socket = if ip.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }.ok()?;
            socket.bind(SocketAddr::new(source, 0)).ok()?;
            socket.connect(addr).await.ok()
        }
        _ => TcpStream::connect(addr).await.ok(),
    }
}

async fn expect_prefix(stream: &mut TcpStream, prefixes: &[&str]) -> Option<ProbeOutcome> {
    let banner = read_banner(stream).await?;
    prefixes
        .iter()
        .any(|p| banner.starts_with(p))
        .then(ProbeOutcome::up)
}

/// Reads the greeting up to the first newline or the size cap.
async fn read_banner(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    while buf.len() < BANNER_MAX {
        match stream.read(&mut byte).await {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
            }
            Err(_) => return None,
        }
    }
    if buf.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn greeter(banner: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let _ = stream.write_all(banner).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn plain_tcp_is_up_on_connect() {
        let addr = greeter(b"").await;
        let outcome = check(
            CheckType::Tcp,
            addr.ip(),
            addr.port(),
            Duration::from_secs(2),
            None,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::up());
    }

    #[tokio::test]
    async fn closed_port_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let outcome = check(
            CheckType::Tcp,
            addr.ip(),
            addr.port(),
            Duration::from_secs(2),
            None,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::down());
    }

    #[tokio::test]
    async fn ssh_banner_is_captured() {
        let addr = greeter(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        let outcome = check(
            CheckType::Ssh,
            addr.ip(),
            addr.port(),
            Duration::from_secs(2),
            None,
        )
        .await;
        assert_eq!(outcome.status, crate::rule::ServiceStatus::Up);
        assert_eq!(outcome.value, "SSH-2.0-OpenSSH_9.6");
    }

    #[tokio::test]
    async fn smtp_requires_a_220_greeting() {
        let good = greeter(b"220 mail.example ESMTP\r\n").await;
        let outcome = check(CheckType::Smtp, good.ip(), good.port(), Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, crate::rule::ServiceStatus::Up);

        let bad = greeter(b"554 go away\r\n").await;
        let outcome = check(CheckType::Smtp, bad.ip(), bad.port(), Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, crate::rule::ServiceStatus::Down);
    }

    #[tokio::test]
    async fn imap_and_pop_greetings() {
        let imap = greeter(b"* OK IMAP4rev1 ready\r\n").await;
        let outcome = check(CheckType::Imap, imap.ip(), imap.port(), Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, crate::rule::ServiceStatus::Up);

        let pop = greeter(b"+OK POP3 ready\r\n").await;
        let outcome = check(CheckType::Pop, pop.ip(), pop.port(), Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, crate::rule::ServiceStatus::Up);
    }

    #[tokio::test]
    async fn telnet_needs_option_negotiation() {
        let addr = greeter(&[0xff, 0xfd, 0x18]).await;
        let outcome = check(CheckType::Telnet, addr.ip(), addr.port(), Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, crate::rule::ServiceStatus::Up);

        let plain = greeter(b"login: ").await;
        let outcome = check(CheckType::Telnet, plain.ip(), plain.port(), Duration::from_secs(2), None).await;
        assert_eq!(outcome.status, crate::rule::ServiceStatus::Down);
    }

    #[tokio::test]
    async fn silent_banner_service_times_out_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _hold = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let outcome = check(
            CheckType::Ftp,
            addr.ip(),
            addr.port(),
            Duration::from_millis(200),
            None,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::down());
    }
}
