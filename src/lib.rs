mod error;
mod git_protocol;
mod hash;
mod options;
mod pipe;
mod scanner;
mod transport;

pub use error::Error;
pub use git_protocol::{
    Capability, DeltaBase, ObjectHeader, ObjectKind, ObjectRecord, PackFile, PackHeader, PktLine,
    PktLines, ScanOutcome, Step, UploadPackRequest, PACK_SIGNATURE, REQUIRED_CAPABILITIES,
};
pub use hash::{ObjectId, SHA1_HASH_SIZE};
pub use options::ScanOptions;
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use scanner::PackScanner;
pub use tokio_util::sync::CancellationToken;
pub use transport::{Advertisement, Endpoint, PackStream, Session, SshEndpoint};

pub type Result<T> = std::result::Result<T, Error>;
