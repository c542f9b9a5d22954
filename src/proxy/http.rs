//! HTTP/1.1 proxy (CONNECT and forward-GET) dialing through the tunnel.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::common::{Address, Error, ProxyStream};
use crate::tun::VirtualTun;

use super::relay::{copy_pool, splice};
use super::socks5::CredentialValidator;

const PROXY_AUTH_HEADER: &str = "proxy-authorization";

pub struct HttpServer {
    bind: SocketAddr,
    auth: CredentialValidator,
    auth_required: bool,
    cert_file: Option<String>,
    key_file: Option<String>,
}

/// One parsed request head: the verbatim lines plus the bits we route on.
struct RequestHead {
    method: String,
    target: String,
    /// Request line and header lines exactly as received.
    raw_lines: Vec<String>,
    proxy_authorization: Option<String>,
    host_header: Option<String>,
}

impl HttpServer {
    pub fn new(
        bind: SocketAddr,
        username: Option<String>,
        password: Option<String>,
        cert_file: Option<String>,
        key_file: Option<String>,
    ) -> Self {
        let username = username.unwrap_or_default();
        let password = password.unwrap_or_default();
        let auth_required = !username.is_empty() || !password.is_empty();
        Self {
            bind,
            auth: CredentialValidator::new(username, password),
            auth_required,
            cert_file,
            key_file,
        }
    }

    pub async fn run(self, vt: Arc<VirtualTun>) -> Result<()> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("http proxy listen on {}", self.bind))?;

        // TLS-terminating listener when both halves of the keypair are
        // configured.
        let acceptor = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
            _ => None,
        };

        info!(addr = %self.bind, tls = acceptor.is_some(), "http proxy listening");

        let server = Arc::new(self);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "http accept failed");
                    continue;
                }
            };
            let server = server.clone();
            let vt = vt.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let stream: ProxyStream = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => Box::new(tls),
                        Err(e) => {
                            error!(peer = %peer, error = %e, "tls handshake failed");
                            return;
                        }
                    },
                    None => Box::new(stream),
                };
                if let Err(e) = server.serve(stream, vt).await {
                    error!(peer = %peer, error = %e, "http connection failed");
                }
            });
        }
    }

    async fn serve(&self, stream: ProxyStream, vt: Arc<VirtualTun>) -> Result<()> {
        let mut reader = BufReader::new(stream);
        let head = read_request_head(&mut reader).await?;
        let mut stream = reader.into_inner();

        if self.auth_required {
            if let Err(e) = self.authenticate(&head) {
                let (code, text) = match &e {
                    Error::Auth(code, _) => (*code, status_text(*code)),
                    _ => (500, status_text(500)),
                };
                let extra = if code == 407 {
                    Some("Proxy-Authenticate: Basic realm=\"Proxy\"")
                } else {
                    None
                };
                write_response(&mut stream, code, text, extra).await?;
                return Err(e.into());
            }
        }

        match head.method.as_str() {
            "CONNECT" => {
                // CONNECT targets default to 443.
                let target = parse_proxy_target(&head.target, 443)?;
                let addr = resolve(&vt, &target).await?;
                let remote = match vt.dial_tcp(addr).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        write_response(&mut stream, 502, status_text(502), None).await?;
                        bail!("tun tcp dial failed: {}", e);
                    }
                };
                stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await?;
                debug!(target = %target, "http CONNECT established");
                splice(stream, remote, copy_pool()).await;
                Ok(())
            }
            "GET" => {
                let target_str = forward_target(&head)?;
                let target = parse_proxy_target(&target_str, 80)?;
                let addr = resolve(&vt, &target).await?;
                let remote = match vt.dial_tcp(addr).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        write_response(&mut stream, 502, status_text(502), None).await?;
                        bail!("tun tcp dial failed: {}", e);
                    }
                };

                // Forward the request exactly as the client sent it.
                let mut request = head.raw_lines.join("\r\n");
                request.push_str("\r\n\r\n");
                remote
                    .write(request.as_bytes())
                    .await
                    .map_err(|e| anyhow::anyhow!("conn write failed: {}", e))?;

                debug!(target = %target, "http GET forwarded");
                splice(stream, remote, copy_pool()).await;
                Ok(())
            }
            other => {
                write_response(&mut stream, 405, status_text(405), None).await?;
                bail!("unsupported method: {}", other);
            }
        }
    }

    fn authenticate(&self, head: &RequestHead) -> Result<(), Error> {
        let auth = match &head.proxy_authorization {
            Some(value) => value,
            None => {
                return Err(Error::Auth(407, "proxy authentication required".into()));
            }
        };
        let encoded = auth.strip_prefix("Basic ").unwrap_or(auth);
        let decoded = BASE64_STD
            .decode(encoded.trim())
            .map_err(|_| Error::Auth(406, "decode username and password failed".into()))?;
        let decoded = String::from_utf8_lossy(&decoded);
        let Some((username, password)) = decoded.split_once(':') else {
            return Err(Error::Auth(406, "username and password format invalid".into()));
        };
        if !self.auth.valid(username, password) {
            return Err(Error::Auth(401, "username and password not matching".into()));
        }
        Ok(())
    }
}

async fn read_request_head(
    reader: &mut BufReader<ProxyStream>,
) -> Result<RequestHead> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        bail!("invalid HTTP request line: {}", request_line);
    }
    let method = parts[0].to_string();
    let target = parts[1].to_string();

    let mut raw_lines = vec![request_line];
    let mut proxy_authorization = None;
    let mut host_header = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            if name == PROXY_AUTH_HEADER {
                proxy_authorization = Some(value.to_string());
            } else if name == "host" {
                host_header = Some(value.to_string());
            }
        }
        raw_lines.push(line);
    }

    Ok(RequestHead {
        method,
        target,
        raw_lines,
        proxy_authorization,
        host_header,
    })
}

/// Target for forward requests: the absolute URI's authority, or the Host
/// header for proxy-style requests.
fn forward_target(head: &RequestHead) -> Result<String> {
    if let Some(rest) = head
        .target
        .strip_prefix("http://")
        .or_else(|| head.target.strip_prefix("https://"))
    {
        let authority = rest.split('/').next().unwrap_or(rest);
        if !authority.is_empty() {
            return Ok(authority.to_string());
        }
    }
    if let Some(host) = &head.host_header {
        return Ok(host.clone());
    }
    bail!("request carries no resolvable host");
}

/// `host[:port]` with a scheme-appropriate default port.
fn parse_proxy_target(target: &str, default_port: u16) -> Result<Address> {
    // Bracketed IPv6 literals keep their colons.
    let has_port = if let Some(end) = target.rfind(']') {
        target[end..].contains(':')
    } else {
        target.contains(':')
    };
    if has_port {
        Address::parse(target)
    } else {
        Address::parse(&format!("{}:{}", target, default_port))
    }
}

async fn resolve(vt: &VirtualTun, target: &Address) -> Result<SocketAddr> {
    match target {
        Address::Ip(addr) => Ok(*addr),
        Address::Domain(host, port) => Ok(vt.resolve_to_addr_port(host, *port).await?),
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        401 => "Unauthorized",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        502 => "Bad Gateway",
        _ => "Internal Server Error",
    }
}

/// Minimal response with the proxy's synthetic status body.
async fn write_response<S>(
    stream: &mut S,
    code: u16,
    text: &str,
    extra_header: Option<&str>,
) -> Result<()>
where
    S: tokio::io::AsyncWrite + Send + Unpin,
{
    let body = format!("wireproxy: HTTP/1.1 {} {}\r\n", code, text);
    let mut response = format!("HTTP/1.1 {} {}\r\n", code, text);
    if let Some(header) = extra_header {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    response.push_str(&body);
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("open cert file {}", cert_path))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse certificate chain")?;

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("open key file {}", key_path))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .context("parse private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build tls config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
