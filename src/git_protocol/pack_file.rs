use super::{msb_is_1, read_one, Error, ObjectId, Result, SHA1_HASH_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::bufread::ZlibDecoder;
use std::fmt;
use std::io::{self, BufRead, Read};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];

const MASK_LAST_4: u8 = 0b00001111;
const MASK_LAST_7: u8 = 0b01111111;
const MASK_OBJECT_TYPE: u8 = 0b01110000;

/// Upper bound for the up-front allocation of an inflate buffer. Larger
/// objects still inflate, the buffer just grows as bytes arrive.
const MAX_PREALLOC: usize = 1 << 20;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
    OfsDelta,
    RefDelta,
}

impl ObjectKind {
    pub fn from_type_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            6 => Some(Self::OfsDelta),
            7 => Some(Self::RefDelta),
            _ => None,
        }
    }

    pub fn type_bits(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
            Self::OfsDelta => 6,
            Self::RefDelta => 7,
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Self::OfsDelta | Self::RefDelta)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
            Self::OfsDelta => "ofsdelta",
            Self::RefDelta => "refdelta",
        };
        write!(f, "{value}")
    }
}

/// The 12-byte framing header that opens every pack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PackHeader {
    pub version: u32,
    pub num_objects: u32,
}

impl PackHeader {
    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; 12];
        r.read_exact(&mut buf).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::malformed("pack header is truncated"),
            _ => Error::Io(err),
        })?;

        if &buf[..4] != PACK_SIGNATURE {
            return Err(Error::malformed(format!(
                "bad pack signature {:?}",
                String::from_utf8_lossy(&buf[..4])
            )));
        }

        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(Error::malformed(format!(
                "unsupported pack version {version}"
            )));
        }

        let num_objects = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        Ok(Self {
            version,
            num_objects,
        })
    }

    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..4].copy_from_slice(PACK_SIGNATURE);
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..].copy_from_slice(&self.num_objects.to_be_bytes());
        buf
    }
}

/// Type and inflated size of one packed object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub size: u64,
}

impl ObjectHeader {
    /// The first byte carries a continuation bit, three type bits and the low
    /// four size bits; every following byte adds seven more size bits.
    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut byte = read_one(r)?;
        let type_bits = (byte & MASK_OBJECT_TYPE) >> 4;
        let kind = ObjectKind::from_type_bits(type_bits)
            .ok_or_else(|| invalid_data(format!("unknown object type {type_bits}")))?;
        let mut size = (byte & MASK_LAST_4) as u64;
        let mut shift = 4;

        while msb_is_1(byte) {
            byte = read_one(r)?;
            let part = (byte & MASK_LAST_7) as u64;
            if shift >= 64 || (shift > 57 && part >> (64 - shift) != 0) {
                return Err(invalid_data("object size overflows 64 bits"));
            }
            size |= part << shift;
            shift += 7;
        }

        Ok(Self { kind, size })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut size = self.size;
        let mut byte = (self.kind.type_bits() << 4) | (size as u8 & MASK_LAST_4);
        size >>= 4;

        let mut out = Vec::with_capacity(10);
        while size != 0 {
            out.push(byte | 0b10000000);
            byte = size as u8 & MASK_LAST_7;
            size >>= 7;
        }
        out.push(byte);
        out
    }
}

/// Where a delta finds its base object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeltaBase {
    /// Absolute pack offset of the base, already resolved from the
    /// backwards distance stored in the pack.
    Offset(u64),
    Ref(ObjectId),
}

/// One object as met in the stream. Records are not kept once the scanner
/// moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub kind: ObjectKind,
    pub size: u64,
    pub offset: u64,
    pub base: Option<DeltaBase>,
}

#[derive(Debug)]
pub enum Step {
    Header(PackHeader),
    Object {
        record: ObjectRecord,
        payload: Option<Bytes>,
    },
    Done,
    Aborted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Done { objects: u32 },
    Aborted { objects: u32 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    HeaderRead,
    Iterating { total: u32, remaining: u32 },
    Done,
    Aborted,
    Failed,
}

/// Streaming pack reader. Walks the declared number of objects one at a
/// time, inflating the kinds it was asked for and draining everything else.
#[derive(Debug)]
pub struct PackFile<R> {
    reader: CountingReader<R>,
    state: State,
    buf: BytesMut,
    kinds: Vec<ObjectKind>,
}

impl<R: BufRead> PackFile<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: CountingReader::new(reader),
            state: State::HeaderRead,
            buf: BytesMut::new(),
            kinds: vec![ObjectKind::Commit, ObjectKind::Blob],
        }
    }

    pub fn with_kinds(mut self, kinds: &[ObjectKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// Bytes consumed from the underlying reader so far.
    pub fn position(&self) -> u64 {
        self.reader.position
    }

    /// Advances the state machine by one transition.
    pub fn step(&mut self, cancel: &CancellationToken) -> Result<Step> {
        match self.state {
            State::HeaderRead => {
                let header = PackHeader::decode(&mut self.reader).inspect_err(|_| {
                    self.state = State::Failed;
                })?;
                self.state = State::Iterating {
                    total: header.num_objects,
                    remaining: header.num_objects,
                };
                Ok(Step::Header(header))
            }
            State::Iterating { remaining: 0, .. } => {
                self.state = State::Done;
                Ok(Step::Done)
            }
            State::Iterating { total, remaining } => {
                if cancel.is_cancelled() {
                    self.state = State::Aborted;
                    return Ok(Step::Aborted);
                }

                let index = total - remaining;
                match self.read_object() {
                    // Cancelled while this object was in flight: drop it.
                    Ok(_) if cancel.is_cancelled() => {
                        self.state = State::Aborted;
                        Ok(Step::Aborted)
                    }
                    Ok((record, payload)) => {
                        self.state = State::Iterating {
                            total,
                            remaining: remaining - 1,
                        };
                        Ok(Step::Object { record, payload })
                    }
                    Err(err) => {
                        self.state = State::Failed;
                        Err(self.classify(err, total, index))
                    }
                }
            }
            State::Done => Ok(Step::Done),
            State::Aborted => Ok(Step::Aborted),
            State::Failed => Err(Error::malformed("pack scan already failed")),
        }
    }

    /// Runs the state machine to a terminal state, handing every selected
    /// payload to `emit` in pack order.
    pub fn scan<F>(mut self, cancel: &CancellationToken, mut emit: F) -> Result<ScanOutcome>
    where
        F: FnMut(&ObjectRecord, Bytes) -> Result<()>,
    {
        let mut objects = 0;

        loop {
            match self.step(cancel)? {
                Step::Header(header) => {
                    debug!(
                        version = header.version,
                        num_objects = header.num_objects,
                        "Read pack header"
                    );
                }
                Step::Object { record, payload } => {
                    objects += 1;
                    trace!(
                        kind = %record.kind,
                        size = record.size,
                        offset = record.offset,
                        forwarded = payload.is_some(),
                        "Scanned object"
                    );
                    if let Some(payload) = payload {
                        emit(&record, payload)?;
                    }
                }
                Step::Done => {
                    debug!(objects, position = self.position(), "Pack scan finished");
                    return Ok(ScanOutcome::Done { objects });
                }
                Step::Aborted => {
                    debug!(objects, "Pack scan cancelled");
                    return Ok(ScanOutcome::Aborted { objects });
                }
            }
        }
    }

    fn read_object(&mut self) -> io::Result<(ObjectRecord, Option<Bytes>)> {
        let offset = self.reader.position;
        let ObjectHeader { kind, size } = ObjectHeader::decode(&mut self.reader)?;

        let base = match kind {
            ObjectKind::OfsDelta => {
                let distance = read_ofs_distance(&mut self.reader)?;
                if distance == 0 || distance > offset {
                    return Err(invalid_data(format!(
                        "delta at offset {offset} points {distance} bytes back"
                    )));
                }
                Some(DeltaBase::Offset(offset - distance))
            }
            ObjectKind::RefDelta => {
                let mut buf = [0u8; SHA1_HASH_SIZE];
                self.reader.read_exact(&mut buf)?;
                Some(DeltaBase::Ref(ObjectId::from(buf)))
            }
            _ => None,
        };

        let record = ObjectRecord {
            kind,
            size,
            offset,
            base,
        };

        let payload = if self.kinds.contains(&kind) {
            Some(self.inflate(size)?)
        } else {
            self.drain(size)?;
            None
        };

        Ok((record, payload))
    }

    /// The returned `Bytes` owns the inflated region of `buf`. The allocation
    /// is only reclaimed by a later `reserve` once the consumer has dropped
    /// every earlier payload; otherwise `buf` grows a fresh one.
    fn inflate(&mut self, size: u64) -> io::Result<Bytes> {
        let expected = usize::try_from(size)
            .map_err(|_| invalid_data(format!("object of {size} bytes does not fit in memory")))?;
        self.buf.clear();
        self.buf.reserve(expected.min(MAX_PREALLOC));

        let mut decoder = ZlibDecoder::new(&mut self.reader);
        let mut writer = (&mut self.buf).writer();
        let n = io::copy(&mut (&mut decoder).take(size.saturating_add(1)), &mut writer)?;
        check_inflated(n, size)?;

        Ok(self.buf.split().freeze())
    }

    fn drain(&mut self, size: u64) -> io::Result<()> {
        let mut decoder = ZlibDecoder::new(&mut self.reader);
        let n = io::copy(
            &mut (&mut decoder).take(size.saturating_add(1)),
            &mut io::sink(),
        )?;
        check_inflated(n, size)
    }

    fn classify(&mut self, err: io::Error, expected: u32, read: u32) -> Error {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::TruncatedPack { expected, read },
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                if self.at_eof() {
                    Error::TruncatedPack { expected, read }
                } else {
                    Error::MalformedPack(format!("object {read}: {err}"))
                }
            }
            _ => Error::Io(err),
        }
    }

    fn at_eof(&mut self) -> bool {
        self.reader.fill_buf().map(|b| b.is_empty()).unwrap_or(false)
    }
}

fn check_inflated(n: u64, size: u64) -> io::Result<()> {
    if n != size {
        return Err(invalid_data(format!(
            "object inflated to {}{n} bytes but its header declares {size}",
            if n > size { "more than " } else { "" }
        )));
    }
    Ok(())
}

/// Offset deltas store the distance back to their base in a big-endian
/// varint where each continuation adds one before shifting.
fn read_ofs_distance<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut byte = read_one(r)?;
    let mut distance = (byte & MASK_LAST_7) as u64;

    while msb_is_1(byte) {
        byte = read_one(r)?;
        distance = distance
            .checked_add(1)
            .and_then(|d| d.checked_mul(1 << 7))
            .ok_or_else(|| invalid_data("delta base distance overflows 64 bits"))?;
        distance |= (byte & MASK_LAST_7) as u64;
    }

    Ok(distance)
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[derive(Debug)]
struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.position += amt as u64;
    }
}
