mod http;
mod ssh;

use super::git_protocol::{line_size, PktLine, UploadPackRequest, PACK_SIGNATURE};
use super::{Error, ObjectId, Result, ScanOptions};
use regex::Regex;
use reqwest::Url;
use std::fmt;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::Child;
use tracing::{debug, info};

/// Where the repository lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Http(Url),
    Ssh(SshEndpoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl SshEndpoint {
    /// `user@host` or just `host`, as handed to the ssh program.
    pub fn destination(&self) -> String {
        match self.user.as_deref() {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

fn scp_like() -> &'static Regex {
    static SCP_LIKE: OnceLock<Regex> = OnceLock::new();
    SCP_LIKE.get_or_init(|| {
        Regex::new(r"^(?:(?P<user>[^@/:]+)@)?(?P<host>[^@/:]+):(?P<path>[^/].*|/.+)$")
            .expect("scp-like pattern is valid")
    })
}

impl Endpoint {
    pub fn parse(locator: &str) -> Result<Self> {
        let locator = locator.trim();

        if locator.contains("://") {
            let url = Url::parse(locator)
                .map_err(|err| Error::Endpoint(format!("invalid repository URL {locator}: {err}")))?;

            return match url.scheme() {
                "http" | "https" => {
                    if url.host_str().is_none() {
                        return Err(Error::Endpoint(format!("missing host in {locator}")));
                    }
                    Ok(Self::Http(url))
                }
                "ssh" => {
                    let host = url
                        .host_str()
                        .filter(|h| !h.is_empty())
                        .ok_or_else(|| Error::Endpoint(format!("missing host in {locator}")))?;
                    let path = url.path();
                    if path.is_empty() || path == "/" {
                        return Err(Error::Endpoint(format!("missing path in {locator}")));
                    }
                    // ssh://host/~user/repo is relative to that user's home.
                    let path = path.strip_prefix('/').filter(|p| p.starts_with('~')).unwrap_or(path);

                    Ok(Self::Ssh(SshEndpoint {
                        user: Some(url.username())
                            .filter(|u| !u.is_empty())
                            .map(String::from),
                        host: host.to_string(),
                        port: url.port(),
                        path: path.to_string(),
                    }))
                }
                scheme => Err(Error::Endpoint(format!("unsupported URL scheme {scheme}"))),
            };
        }

        if let Some(caps) = scp_like().captures(locator) {
            return Ok(Self::Ssh(SshEndpoint {
                user: caps.name("user").map(|m| m.as_str().to_string()),
                host: caps["host"].to_string(),
                port: None,
                path: caps["path"].to_string(),
            }));
        }

        Err(Error::Endpoint(format!(
            "cannot parse repository locator {locator:?}"
        )))
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::Ssh(ssh) => match ssh.port {
                Some(port) => write!(f, "ssh://{}:{port}/{}", ssh.destination(), ssh.path.trim_start_matches('/')),
                None => write!(f, "{}:{}", ssh.destination(), ssh.path),
            },
        }
    }
}

/// The server's reference advertisement. Only the capability list matters
/// here; refs are kept for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advertisement {
    pub refs: Vec<(ObjectId, String)>,
    pub capabilities: Vec<String>,
}

impl Advertisement {
    pub fn parse<I>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = PktLine>,
    {
        let mut advertisement = Self::default();
        let mut lines = lines.into_iter().peekable();

        // Smart HTTP prefixes the advertisement with a service banner and a flush.
        if lines
            .peek()
            .is_some_and(|line| line.text().starts_with("# service="))
        {
            lines.next();
            if lines.peek().is_some_and(PktLine::is_flush) {
                lines.next();
            }
        }

        for line in lines {
            if line.is_flush() {
                break;
            }
            reject_on_error_line(&line)?;

            let payload = line.payload();
            let payload = payload.strip_suffix(b"\n").unwrap_or(payload);
            let (reference, caps) = match payload.iter().position(|&b| b == b'\0') {
                Some(pos) => (&payload[..pos], Some(&payload[pos + 1..])),
                None => (payload, None),
            };

            if let Some(caps) = caps {
                advertisement.capabilities = String::from_utf8_lossy(caps)
                    .split_whitespace()
                    .map(String::from)
                    .collect();
            }

            let reference = String::from_utf8_lossy(reference);
            let (id, name) = reference.split_once(' ').ok_or_else(|| {
                Error::Protocol(format!("malformed ref advertisement {reference:?}"))
            })?;
            let id = ObjectId::from_hex(id)
                .map_err(|_| Error::Protocol(format!("malformed ref advertisement {reference:?}")))?;
            advertisement.refs.push((id, name.to_string()));
        }

        Ok(advertisement)
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap.split('=').next() == Some(capability))
    }

    /// Fails unless every capability in the request was advertised.
    pub fn check(&self, request: &UploadPackRequest) -> Result<()> {
        for capability in request.capabilities() {
            if !self.supports(capability.as_str()) {
                return Err(Error::NegotiationRejected(format!(
                    "server does not support {capability}"
                )));
            }
        }
        Ok(())
    }
}

fn reject_on_error_line(line: &PktLine) -> Result<()> {
    match line.text().strip_prefix("ERR ") {
        Some(msg) => Err(Error::NegotiationRejected(msg.to_string())),
        None => Ok(()),
    }
}

enum Connection {
    Http(http::HttpSession),
    Ssh(ssh::SshSession),
}

/// An open upload-pack conversation. The connection is released when the
/// session, or the pack stream it turns into, is dropped.
pub struct Session {
    connection: Connection,
    advertisement: Advertisement,
}

impl Session {
    /// Connects and reads the reference advertisement.
    pub async fn connect(endpoint: &Endpoint, options: &ScanOptions) -> Result<Self> {
        let (connection, advertisement) = match endpoint {
            Endpoint::Http(url) => {
                let (session, advertisement) = http::HttpSession::connect(url, options).await?;
                (Connection::Http(session), advertisement)
            }
            Endpoint::Ssh(ssh) => {
                let (session, advertisement) = ssh::SshSession::connect(ssh, options).await?;
                (Connection::Ssh(session), advertisement)
            }
        };

        debug!(
            %endpoint,
            refs = advertisement.refs.len(),
            capabilities = advertisement.capabilities.len(),
            "Read ref advertisement"
        );

        Ok(Self {
            connection,
            advertisement,
        })
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    /// Sends the request and returns the response positioned at the first
    /// byte of the pack.
    pub async fn upload_pack(self, request: &UploadPackRequest) -> Result<PackStream> {
        self.advertisement.check(request)?;

        info!(
            wants = request.wants().len(),
            haves = request.haves().len(),
            "Sending upload-pack request"
        );

        match self.connection {
            Connection::Http(session) => session.upload_pack(request).await,
            Connection::Ssh(session) => session.upload_pack(request).await,
        }
    }
}

/// Raw pack bytes coming off the wire, from the `PACK` signature onwards.
pub struct PackStream {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    _child: Option<Box<Child>>,
}

impl PackStream {
    /// Consumes the ACK/NAK lines that precede the pack.
    async fn negotiate(
        mut reader: Box<dyn AsyncBufRead + Send + Unpin>,
        child: Option<Child>,
    ) -> Result<Self> {
        loop {
            let mut prefix = [0u8; 4];
            reader
                .read_exact(&mut prefix)
                .await
                .map_err(|err| match err.kind() {
                    io::ErrorKind::UnexpectedEof => Error::Connection(
                        "server closed the connection before sending a pack".into(),
                    ),
                    _ => Error::Io(err),
                })?;

            if &prefix == PACK_SIGNATURE {
                let reader = Cursor::new(prefix.to_vec()).chain(reader);
                return Ok(Self {
                    reader: Box::new(reader),
                    _child: child.map(Box::new),
                });
            }

            let Some(len) = line_size(&prefix)? else {
                continue;
            };
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            let line = PktLine::new(payload);
            reject_on_error_line(&line)?;

            let text = line.text();
            if text == "NAK" || text.starts_with("ACK ") {
                debug!(line = %text, "Negotiation");
            } else {
                return Err(Error::Protocol(format!(
                    "unexpected line {text:?} before pack data"
                )));
            }
        }
    }
}

impl AsyncRead for PackStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncBufRead for PackStream {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        Pin::new(&mut self.get_mut().reader).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().reader).consume(amt)
    }
}
