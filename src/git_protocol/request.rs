use super::{Error, ObjectId, PktLine, Result};
use std::fmt;

/// Capabilities this client always asks for. Negotiation fails when the
/// server does not advertise one of them.
pub const REQUIRED_CAPABILITIES: [Capability; 2] = [Capability::ThinPack, Capability::OfsDelta];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Capability {
    /// The server may omit delta bases the client already has.
    ThinPack,
    /// The server may encode deltas as offsets back into the same pack.
    OfsDelta,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThinPack => "thin-pack",
            Self::OfsDelta => "ofs-delta",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An upload-pack request: the commits we want, the commits we already
/// have and the capabilities to switch on.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPackRequest {
    wants: Vec<ObjectId>,
    haves: Vec<ObjectId>,
    capabilities: Vec<Capability>,
}

impl UploadPackRequest {
    /// Order of both sets is kept as given; duplicates are passed through.
    pub fn new(wants: Vec<ObjectId>, haves: Vec<ObjectId>) -> Result<Self> {
        if wants.is_empty() {
            return Err(Error::InvalidRequest(
                "at least one wanted object id is required".into(),
            ));
        }

        Ok(Self {
            wants,
            haves,
            capabilities: REQUIRED_CAPABILITIES.to_vec(),
        })
    }

    pub fn from_hex<W, H>(wants: &[W], haves: &[H]) -> Result<Self>
    where
        W: AsRef<str>,
        H: AsRef<str>,
    {
        let wants = wants
            .iter()
            .map(|w| ObjectId::from_hex(w.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let haves = haves
            .iter()
            .map(|h| ObjectId::from_hex(h.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Self::new(wants, haves)
    }

    pub fn wants(&self) -> &[ObjectId] {
        &self.wants
    }

    pub fn haves(&self) -> &[ObjectId] {
        &self.haves
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// The request as pkt-lines: wants (capabilities on the first), flush,
    /// haves, then `done`.
    pub fn to_pkt_lines(&self) -> Vec<PktLine> {
        let mut lines = Vec::with_capacity(self.wants.len() + self.haves.len() + 2);

        for (i, want) in self.wants.iter().enumerate() {
            let line = if i == 0 {
                let caps = self
                    .capabilities
                    .iter()
                    .map(Capability::as_str)
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("want {want} {caps}\n")
            } else {
                format!("want {want}\n")
            };
            lines.push(PktLine::from(line));
        }

        lines.push(PktLine::flush());

        for have in self.haves.iter() {
            lines.push(PktLine::from(format!("have {have}\n")));
        }

        lines.push(PktLine::new(b"done\n".into()));
        lines
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.to_pkt_lines()
            .iter()
            .flat_map(PktLine::encode)
            .collect()
    }
}
