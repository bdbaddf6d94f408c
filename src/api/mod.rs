use crate::status::StatusProvider;
use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const STATUS_PATH: &str = "/status";

#[derive(Clone, Debug)]
pub struct StatusServerConfig {
    pub addr: String,
}

impl StatusServerConfig {
    /// `bind` is a bare IPv4 or IPv6 address, e.g. `0.0.0.0` or `::`.
    pub fn new(bind: &str, port: u16) -> Result<Self> {
        let ip: IpAddr = bind
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid status bind address '{}': {}", bind, e))?;
        Ok(Self {
            addr: SocketAddr::new(ip, port).to_string(),
        })
    }
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct StatusHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StatusHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("status server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct StatusServer {
    cfg: StatusServerConfig,
    provider: StatusProvider,
}

impl StatusServer {
    pub fn new(cfg: StatusServerConfig, provider: StatusProvider) -> Self {
        Self { cfg, provider }
    }

    pub fn spawn(self) -> Result<StatusHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid status address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)
            .map_err(|e| anyhow!("bind status server on {}: {}", configured_addr, e))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let provider = self.provider;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_status_server(listener, &provider, shutdown_thread) {
                log::error!("status server stopped: {}", err);
            }
        });

        log::info!("HTTP status server started on {}", addr);
        Ok(StatusHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_status_server(
    listener: TcpListener,
    provider: &StatusProvider,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, provider) {
                    log::debug!("status request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, provider: &StatusProvider) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    if request.path != STATUS_PATH {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    }

    let payload = serde_json::to_vec_pretty(&provider.get_status())?;
    write_response(&mut stream, 200, "application/json", &payload)?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_bind_address_is_bracketed() -> Result<()> {
        let cfg = StatusServerConfig::new("::", 8080)?;
        assert_eq!(cfg.addr, "[::]:8080");
        let addr: SocketAddr = cfg.addr.parse()?;
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 8080);
        Ok(())
    }

    #[test]
    fn ipv4_bind_address_is_kept() -> Result<()> {
        assert_eq!(StatusServerConfig::new("0.0.0.0", 80)?.addr, "0.0.0.0:80");
        assert_eq!(StatusServerConfig::new(" 127.0.0.1 ", 9000)?.addr, "127.0.0.1:9000");
        Ok(())
    }

    #[test]
    fn hostname_bind_address_is_rejected() {
        assert!(StatusServerConfig::new("not-an-ip", 80).is_err());
        assert!(StatusServerConfig::new("[::]", 80).is_err());
    }
}
