mod pack_file;
mod pkt_line;
mod request;

use std::io::Read;

pub use pack_file::{
    DeltaBase, ObjectHeader, ObjectKind, ObjectRecord, PackFile, PackHeader, ScanOutcome, Step,
    PACK_SIGNATURE,
};
pub use pkt_line::{line_size, read_pkt_line, PktLine, PktLines};
pub use request::{Capability, UploadPackRequest, REQUIRED_CAPABILITIES};

use super::{Error, ObjectId, Result, SHA1_HASH_SIZE};

fn read_one<R: Read>(r: &mut R) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    let [byte] = buf;
    Ok(byte)
}

fn msb_is_1(byte: u8) -> bool {
    byte & 0b10000000 == 0b10000000
}
