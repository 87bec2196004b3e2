//! Per-execution egress proxy.
//!
//! A container granted any network joins an internal Docker network with no
//! route out. The only way off it is this proxy, which the container is
//! pointed at through `HTTP_PROXY`/`HTTPS_PROXY`. Every request is decided
//! against the execution's [`EgressPolicy`] before anything is dialled:
//! `CONNECT host:port` for HTTPS, absolute-form requests for plain HTTP.
//!
//! The proxy lives exactly as long as its [`EgressProxy`] handle.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::policy::{
    EgressPolicy, NetworkDecision, NetworkPolicyDecider, NetworkRequest, is_internal_host,
};

/// Request line plus headers.
const MAX_HEAD_BYTES: usize = 16 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers meant for the proxy itself, never forwarded.
const HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization", "connection", "keep-alive"];

/// Running proxy for one execution. Dropping it stops the listener and
/// every open tunnel.
pub struct EgressProxy {
    addr: SocketAddr,
    _stop: DropGuard,
}

impl std::fmt::Debug for EgressProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressProxy").field("addr", &self.addr).finish()
    }
}

impl EgressProxy {
    /// Listen on an ephemeral port of `bind` and start serving.
    pub async fn start(bind: IpAddr, policy: EgressPolicy, execution_id: Uuid) -> io::Result<Self> {
        let listener = TcpListener::bind((bind, 0)).await?;
        let addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let policy = Arc::new(policy);

        tokio::spawn(accept_loop(listener, policy, stop.clone(), execution_id));
        tracing::debug!(execution_id = %execution_id, %addr, "Egress proxy listening");

        Ok(Self {
            addr,
            _stop: stop.drop_guard(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn accept_loop(
    listener: TcpListener,
    policy: Arc<EgressPolicy>,
    stop: CancellationToken,
    execution_id: Uuid,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let policy = Arc::clone(&policy);
                let stop = stop.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        served = serve(stream, &policy, execution_id) => {
                            if let Err(e) = served {
                                tracing::debug!(execution_id = %execution_id, error = %e, "Proxy connection ended");
                            }
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "Egress proxy accept failed");
            }
        }
    }
    tracing::debug!(execution_id = %execution_id, "Egress proxy stopped");
}

/// Where a request is headed, once parsed.
#[derive(Debug, PartialEq, Eq)]
enum Target {
    Tunnel { host: String, port: u16 },
    Forward { host: String, port: u16, origin_form: String },
}

impl Target {
    fn host(&self) -> &str {
        match self {
            Self::Tunnel { host, .. } | Self::Forward { host, .. } => host,
        }
    }

    fn port(&self) -> u16 {
        match self {
            Self::Tunnel { port, .. } | Self::Forward { port, .. } => *port,
        }
    }
}

/// Parse a proxy request line into the decision request and its target.
fn parse_target(method: &str, target: &str) -> Option<(NetworkRequest, Target)> {
    if method.eq_ignore_ascii_case("CONNECT") {
        let parsed = url::Url::parse(&format!("https://{target}/")).ok()?;
        let port = parsed.port_or_known_default()?;
        let request = NetworkRequest::from_url("CONNECT", parsed.as_str())?;
        let host = request.host.clone();
        return Some((request, Target::Tunnel { host, port }));
    }

    let parsed = url::Url::parse(target).ok()?;
    if parsed.scheme() != "http" {
        return None;
    }
    let port = parsed.port_or_known_default()?;
    let origin_form = parsed[url::Position::BeforePath..].to_string();
    let request = NetworkRequest::from_url(method, target)?;
    let host = request.host.clone();
    Some((
        request,
        Target::Forward {
            host,
            port,
            origin_form,
        },
    ))
}

/// A name the policy admits must not resolve somewhere internal, unless it
/// is the one internal host the policy names outright.
fn vet_addresses(policy: &EgressPolicy, host: &str, addrs: &[SocketAddr]) -> Result<(), String> {
    if policy.admits_internal(host) {
        return Ok(());
    }
    match addrs.iter().find(|a| is_internal_host(&a.ip().to_string())) {
        Some(addr) => Err(format!("{host} resolves to internal address {}", addr.ip())),
        None => Ok(()),
    }
}

async fn read_head(reader: &mut BufReader<TcpStream>) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut total = 0;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-request"));
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            return Ok(lines);
        }
        lines.push(line);
    }
}

async fn respond(stream: &mut BufReader<TcpStream>, status: &str, body: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

async fn serve(stream: TcpStream, policy: &EgressPolicy, execution_id: Uuid) -> io::Result<()> {
    let mut client = BufReader::new(stream);
    let head = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut client)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
            return respond(&mut client, "431 Request Header Fields Too Large", "").await;
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return respond(&mut client, "408 Request Timeout", "").await,
    };

    let mut parts = head.first().map(String::as_str).unwrap_or("").split_whitespace();
    let (Some(method), Some(raw_target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return respond(&mut client, "400 Bad Request", "malformed request line\n").await;
    };
    let Some((request, target)) = parse_target(method, raw_target) else {
        return respond(&mut client, "400 Bad Request", "expected CONNECT or an absolute http:// URL\n").await;
    };

    if let NetworkDecision::Deny { reason } = policy.decide(&request).await {
        tracing::info!(execution_id = %execution_id, host = %request.host, %reason, "Egress denied");
        return respond(&mut client, "403 Forbidden", &format!("{reason}\n")).await;
    }

    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((target.host(), target.port())).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            return respond(&mut client, "502 Bad Gateway", &format!("cannot resolve {}: {e}\n", target.host())).await;
        }
    };
    if let Err(reason) = vet_addresses(policy, target.host(), &addrs) {
        tracing::info!(execution_id = %execution_id, host = %request.host, %reason, "Egress denied");
        return respond(&mut client, "403 Forbidden", &format!("{reason}\n")).await;
    }

    let mut upstream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addrs[..])).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            return respond(&mut client, "502 Bad Gateway", &format!("{}: {e}\n", target.host())).await;
        }
        Err(_) => return respond(&mut client, "504 Gateway Timeout", "").await,
    };
    tracing::debug!(execution_id = %execution_id, host = %request.host, method, "Egress allowed");

    match target {
        Target::Tunnel { .. } => {
            client
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
        }
        Target::Forward { origin_form, .. } => {
            let mut forwarded = format!("{method} {origin_form} {version}\r\n");
            for line in head.iter().skip(1) {
                let name = line.split(':').next().unwrap_or("").trim().to_ascii_lowercase();
                if HOP_HEADERS.contains(&name.as_str()) {
                    continue;
                }
                forwarded.push_str(line);
                forwarded.push_str("\r\n");
            }
            // One request per connection, so each one is decided.
            forwarded.push_str("Connection: close\r\n\r\n");
            upstream.write_all(forwarded.as_bytes()).await?;
        }
    }

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    use super::*;

    const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    /// Policy that admits only the loopback upstream the tests start.
    fn loopback_only() -> EgressPolicy {
        EgressPolicy::new(Some("127.0.0.1".into()), vec![], false)
    }

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn read_status(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            buf.push(byte[0]);
        }
        String::from_utf8_lossy(&buf).lines().next().unwrap_or("").to_string()
    }

    #[tokio::test]
    async fn tunnel_reaches_an_allowed_host() {
        let upstream = echo_upstream().await;
        let proxy = EgressProxy::start(LOOPBACK, loopback_only(), Uuid::new_v4()).await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        client
            .write_all(format!("CONNECT {upstream} HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(read_status(&mut client).await, "HTTP/1.1 200 Connection Established");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn host_outside_the_allowlist_is_refused() {
        let policy = EgressPolicy::new(None, vec!["googleapis.com".into()], false);
        let proxy = EgressProxy::start(LOOPBACK, policy, Uuid::new_v4()).await.unwrap();

        for request in [
            "CONNECT example.com:443 HTTP/1.1\r\n\r\n",
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
            "CONNECT 169.254.169.254:80 HTTP/1.1\r\n\r\n",
        ] {
            let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
            client.write_all(request.as_bytes()).await.unwrap();
            assert_eq!(read_status(&mut client).await, "HTTP/1.1 403 Forbidden", "{request}");
        }
    }

    #[tokio::test]
    async fn plain_http_is_forwarded_in_origin_form() {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let upstream = listener.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let head = read_head(&mut reader).await.unwrap();
            reader
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            reader.shutdown().await.unwrap();
            head
        });
        let proxy = EgressProxy::start(LOOPBACK, loopback_only(), Uuid::new_v4()).await.unwrap();

        let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        client
            .write_all(
                format!(
                    "GET http://{upstream}/v1/items?q=1 HTTP/1.1\r\nHost: {upstream}\r\nProxy-Connection: keep-alive\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));

        let head = seen.await.unwrap();
        assert_eq!(head[0], "GET /v1/items?q=1 HTTP/1.1");
        assert!(head.iter().any(|h| h == "Connection: close"));
        assert!(!head.iter().any(|h| h.to_ascii_lowercase().starts_with("proxy-")));
    }

    #[tokio::test]
    async fn garbage_is_a_bad_request() {
        let proxy = EgressProxy::start(LOOPBACK, loopback_only(), Uuid::new_v4()).await.unwrap();
        for request in ["hello\r\n\r\n", "GET /relative HTTP/1.1\r\n\r\n", "GET ftp://x/ HTTP/1.1\r\n\r\n"] {
            let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
            client.write_all(request.as_bytes()).await.unwrap();
            assert_eq!(read_status(&mut client).await, "HTTP/1.1 400 Bad Request", "{request}");
        }
    }

    #[test]
    fn allowed_names_must_not_resolve_inside() {
        let policy = EgressPolicy::new(Some("hub.internal".into()), vec!["example.com".into()], false);
        let inside: SocketAddr = "10.0.0.7:443".parse().unwrap();
        let outside: SocketAddr = "93.184.216.34:443".parse().unwrap();

        assert!(vet_addresses(&policy, "api.example.com", &[outside]).is_ok());
        let err = vet_addresses(&policy, "api.example.com", &[outside, inside]).unwrap_err();
        assert!(err.contains("10.0.0.7"));
        assert!(vet_addresses(&policy, "hub.internal", &[inside]).is_ok());
    }

    #[test]
    fn targets_are_parsed() {
        let (req, target) = parse_target("connect", "API.example.com:8443").unwrap();
        assert_eq!(req.host, "api.example.com");
        assert_eq!(
            target,
            Target::Tunnel {
                host: "api.example.com".into(),
                port: 8443
            }
        );

        let (_, target) = parse_target("POST", "http://example.com/a/b?c=d").unwrap();
        assert_eq!(
            target,
            Target::Forward {
                host: "example.com".into(),
                port: 80,
                origin_form: "/a/b?c=d".into()
            }
        );
        assert!(parse_target("GET", "https://example.com/").is_none());
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_listener() {
        let proxy = EgressProxy::start(LOOPBACK, loopback_only(), Uuid::new_v4()).await.unwrap();
        let addr = proxy.local_addr();
        drop(proxy);

        let refused = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if TcpStream::connect(addr).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(refused.is_ok(), "listener still accepting after drop");
    }
}
