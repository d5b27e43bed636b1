#![allow(dead_code)]

use flate2::{write::ZlibEncoder, Compression};
use git_pack_scanner::{ObjectHeader, ObjectKind, PackHeader, PktLine, SHA1_HASH_SIZE};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const H1: &str = "eaceca8c2e77a8b0dae5ce976bf1901b8accd68f";
pub const H2: &str = "9edeb164f449abb91c7abd81d82ea4fe80a8ed8a";

pub const FULL_CAPABILITIES: &str =
    "multi_ack thin-pack side-band side-band-64k ofs-delta shallow no-progress include-tag agent=git/2.43.0";

pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Builds a version 2 pack of undeltified objects with a zeroed trailer.
pub fn build_pack(objects: &[(ObjectKind, &[u8])]) -> Vec<u8> {
    let header = PackHeader {
        version: 2,
        num_objects: objects.len() as u32,
    };
    let mut out = header.encode().to_vec();
    for (kind, data) in objects {
        out.extend(
            ObjectHeader {
                kind: *kind,
                size: data.len() as u64,
            }
            .encode(),
        );
        out.extend(compress(data));
    }
    out.extend_from_slice(&[0u8; SHA1_HASH_SIZE]);
    out
}

pub fn advertisement(head: &str, capabilities: &str) -> Vec<u8> {
    let mut out = PktLine::from("# service=git-upload-pack\n".to_string()).encode();
    out.extend(PktLine::flush().encode());
    out.extend(PktLine::from(format!("{head} HEAD\0{capabilities}\n")).encode());
    out.extend(PktLine::from(format!("{head} refs/heads/main\n")).encode());
    out.extend(PktLine::flush().encode());
    out
}

/// Ref advertisement as upload-pack prints it over ssh: no service banner.
pub fn ssh_advertisement(head: &str, capabilities: &str) -> Vec<u8> {
    let mut out = PktLine::from(format!("{head} HEAD\0{capabilities}\n")).encode();
    out.extend(PktLine::flush().encode());
    out
}

pub fn nak_then(pack: &[u8]) -> Vec<u8> {
    let mut out = PktLine::from("NAK\n".to_string()).encode();
    out.extend_from_slice(pack);
    out
}

#[derive(Debug, Clone, Default)]
pub struct FakeRepo {
    /// `None` answers the advertisement request with 404.
    pub advertisement: Option<Vec<u8>>,
    pub upload_pack: Vec<u8>,
}

pub struct FakeServer {
    pub url: String,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeServer {
    /// Bodies of every upload-pack POST seen so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

/// Minimal smart-HTTP server: one request per connection.
pub async fn serve(repo: FakeRepo) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(vec![]));

    let seen = requests.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handle(socket, repo.clone(), seen.clone()));
        }
    });

    FakeServer {
        url: format!("http://{addr}/repo.git"),
        requests,
    }
}

async fn handle(socket: TcpStream, repo: FakeRepo, requests: Arc<Mutex<Vec<Vec<u8>>>>) {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
        return;
    }

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap();
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.unwrap();

    let response = if request_line.starts_with("GET ")
        && request_line.contains("/repo.git/info/refs?service=git-upload-pack")
    {
        repo.advertisement
            .map(|adv| ("application/x-git-upload-pack-advertisement", adv))
    } else if request_line.starts_with("POST ") && request_line.contains("/repo.git/git-upload-pack")
    {
        requests.lock().unwrap().push(body);
        Some(("application/x-git-upload-pack-result", repo.upload_pack))
    } else {
        None
    };

    let head = match &response {
        Some((content_type, payload)) => format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            payload.len()
        ),
        None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    };

    let _ = write.write_all(head.as_bytes()).await;
    if let Some((_, payload)) = response {
        let _ = write.write_all(&payload).await;
    }
    let _ = write.shutdown().await;
}
