use super::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::io::{Cursor, Read};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest pkt-line payload allowed by the protocol (65520 bytes minus the prefix).
const MAX_PKT_PAYLOAD: usize = 65516;

#[derive(Debug, Clone, PartialEq)]
pub struct PktLine(Option<Vec<u8>>);

impl PktLine {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Some(bytes))
    }

    pub fn size(&self) -> usize {
        if let Some(bytes) = self.0.as_ref() {
            bytes.len() + 4
        } else {
            0
        }
    }

    pub fn flush() -> Self {
        Self(None)
    }

    pub fn is_flush(&self) -> bool {
        self.0.is_none()
    }

    pub fn payload(&self) -> &[u8] {
        self.0.as_deref().unwrap_or_default()
    }

    /// The payload as text with the trailing newline removed.
    pub fn text(&self) -> String {
        let payload = self.payload();
        let payload = payload.strip_suffix(b"\n").unwrap_or(payload);
        String::from_utf8_lossy(payload).into_owned()
    }

    /// Wire form: four hex digits of length followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{:04x}", self.size()).into_bytes();
        out.extend_from_slice(self.payload());
        out
    }
}

impl From<String> for PktLine {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl fmt::Display for PktLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}{}",
            self.size(),
            String::from_utf8_lossy(self.payload())
        )
    }
}

/// Iterates pkt-lines out of a fully buffered response body.
#[derive(Debug, Clone)]
pub struct PktLines {
    cursor: Cursor<Vec<u8>>,
}

impl From<Bytes> for PktLines {
    fn from(value: Bytes) -> Self {
        Self::new(value.to_vec())
    }
}

impl PktLines {
    pub fn new(buf: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(buf),
        }
    }

    fn remaining(&self) -> &[u8] {
        let curr = self.cursor.position() as usize;
        &self.cursor.get_ref()[curr..]
    }
}

impl Iterator for PktLines {
    type Item = Result<PktLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining().is_empty() {
            return None;
        }

        let mut buf = [0u8; 4];
        if Read::read_exact(&mut self.cursor, &mut buf).is_err() {
            return Some(Err(Error::Protocol("truncated pkt-line length".into())));
        }

        let value_len = match line_size(&buf) {
            Ok(None) => return Some(Ok(PktLine::flush())),
            Ok(Some(len)) => len,
            Err(err) => return Some(Err(err)),
        };

        if self.remaining().len() < value_len {
            return Some(Err(Error::Protocol(format!(
                "pkt-line declares {value_len} bytes but only {} remain",
                self.remaining().len()
            ))));
        }

        let mut buf = vec![0u8; value_len];
        if let Err(err) = Read::read_exact(&mut self.cursor, &mut buf) {
            return Some(Err(err.into()));
        }

        Some(Ok(PktLine::new(buf)))
    }
}

/// Reads one pkt-line from a live connection. `Ok(None)` means the peer
/// closed the stream before a length prefix arrived.
pub async fn read_pkt_line<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<PktLine>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Protocol("truncated pkt-line length".into()));
        }
        filled += n;
    }

    match line_size(&buf)? {
        None => Ok(Some(PktLine::flush())),
        Some(len) => {
            let mut payload = vec![0u8; len];
            r.read_exact(&mut payload).await?;
            Ok(Some(PktLine::new(payload)))
        }
    }
}

/// Decodes a length prefix into the payload length, `None` for a flush line.
pub fn line_size(buf: &[u8; 4]) -> Result<Option<usize>> {
    let len_str = std::str::from_utf8(buf)
        .map_err(|_| Error::Protocol(format!("invalid pkt-line length {buf:?}")))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|_| Error::Protocol(format!("invalid pkt-line length {len_str:?}")))?;

    match len {
        0 => Ok(None),
        1..=3 => Err(Error::Protocol(format!(
            "unsupported pkt-line length {len_str:?}"
        ))),
        len if len - 4 > MAX_PKT_PAYLOAD => Err(Error::Protocol(format!(
            "pkt-line length {len} exceeds the protocol limit"
        ))),
        len => Ok(Some(len - 4)),
    }
}
