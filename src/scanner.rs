//! Fetch-and-scan orchestration.
//!
//! [`PackScanner::scan_packfile`] hands back a [`PipeReader`] straight
//! away and does the work on a background task: the network exchange runs
//! on the async runtime, the pack is parsed on a blocking thread, and every
//! failure after that point reaches the reader through the pipe.

use super::git_protocol::{PackFile, ScanOutcome, UploadPackRequest};
use super::pipe::{pipe, PipeReader, PipeWriter};
use super::transport::{Endpoint, PackStream, Session};
use super::{Error, Result, ScanOptions};
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A validated fetch: where to go and what to ask for.
#[derive(Debug, Clone)]
pub struct PackScanner {
    endpoint: Endpoint,
    request: UploadPackRequest,
    options: ScanOptions,
}

impl PackScanner {
    /// Parses the locator and the hex ids. Nothing touches the network yet.
    pub fn new<W, H>(repo_url: &str, wants: &[W], haves: &[H]) -> Result<Self>
    where
        W: AsRef<str>,
        H: AsRef<str>,
    {
        let endpoint = Endpoint::parse(repo_url)?;
        let request = UploadPackRequest::from_hex(wants, haves)?;

        Ok(Self {
            endpoint,
            request,
            options: ScanOptions::from_env(),
        })
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn request(&self) -> &UploadPackRequest {
        &self.request
    }

    /// Starts fetching on the current tokio runtime and returns the reading
    /// end of the pipe. Only option errors are returned here; everything
    /// else arrives through the reader.
    pub fn scan_packfile(&self, cancel: CancellationToken) -> Result<PipeReader> {
        self.options.validate()?;
        let runtime = Handle::try_current().map_err(|err| {
            Error::InvalidRequest(format!("scan_packfile needs a tokio runtime: {err}"))
        })?;

        let (writer, reader) = pipe(self.options.channel_capacity)?;
        runtime.spawn(process_packfile(
            self.endpoint.clone(),
            self.request.clone(),
            self.options.clone(),
            cancel,
            writer,
        ));

        Ok(reader)
    }
}

async fn process_packfile(
    endpoint: Endpoint,
    request: UploadPackRequest,
    options: ScanOptions,
    cancel: CancellationToken,
    writer: PipeWriter,
) {
    info!(%endpoint, wants = request.wants().len(), haves = request.haves().len(), "Fetching pack");

    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fetch_packfile(&endpoint, &request, &options) => res,
    };

    let stream = match fetched {
        Ok(stream) => stream,
        Err(err) => {
            log_failure(&err, "Failed to fetch pack");
            writer.close_with_error(err).await;
            return;
        }
    };

    let bridge = SyncIoBridge::new(stream);
    let kinds = options.kinds;
    let producer = writer.clone();

    let task = tokio::task::spawn_blocking(move || {
        let outcome = PackFile::new(bridge)
            .with_kinds(&kinds)
            .scan(&cancel, |_, payload| producer.blocking_write(payload));

        match outcome {
            Ok(ScanOutcome::Done { objects }) => {
                info!(objects, "Pack scan complete");
            }
            Ok(ScanOutcome::Aborted { objects }) => {
                debug!(objects, "Pack scan cancelled");
                producer.blocking_close_with_error(Error::Cancelled);
            }
            Err(Error::PipeClosed) => {
                debug!("Reader dropped, stopping pack scan");
            }
            Err(err) => {
                log_failure(&err, "Failed to parse pack");
                producer.blocking_close_with_error(err);
            }
        }
    });

    if let Err(err) = task.await {
        warn!(error = %err, "Pack scanner task failed");
        writer
            .close_with_error(anyhow::anyhow!("pack scanner task failed: {err}").into())
            .await;
    }
}

async fn fetch_packfile(
    endpoint: &Endpoint,
    request: &UploadPackRequest,
    options: &ScanOptions,
) -> Result<PackStream> {
    let session = Session::connect(endpoint, options).await?;
    session.upload_pack(request).await
}

fn log_failure(err: &Error, msg: &str) {
    if err.is_cancelled() {
        debug!("{msg}: cancelled");
    } else {
        warn!(error = %err, "{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H1: &str = "eaceca8c2e77a8b0dae5ce976bf1901b8accd68f";
    const H2: &str = "9edeb164f449abb91c7abd81d82ea4fe80a8ed8a";

    #[test]
    fn it_validates_inputs_up_front() {
        let err = PackScanner::new::<&str, &str>("https://example.com/repo.git", &[], &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = PackScanner::new("https://example.com/repo.git", &["xyz"], &[H2]).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = PackScanner::new("ftp://example.com/repo.git", &[H1], &[H2]).unwrap_err();
        assert!(matches!(err, Error::Endpoint(_)));
    }

    #[test]
    fn it_keeps_the_request() {
        let scanner = PackScanner::new("git@github.com:org/repo.git", &[H1], &[H2]).unwrap();
        assert!(matches!(scanner.endpoint(), Endpoint::Ssh(_)));
        assert_eq!(scanner.request().wants()[0].hex(), H1);
        assert_eq!(scanner.request().haves()[0].hex(), H2);
    }

    #[test]
    fn it_needs_a_runtime() {
        let scanner = PackScanner::new::<&str, &str>("https://example.com/repo.git", &[H1], &[])
            .unwrap();
        let err = scanner.scan_packfile(CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn it_rejects_bad_options_before_spawning() {
        let scanner = PackScanner::new::<&str, &str>("https://example.com/repo.git", &[H1], &[])
            .unwrap()
            .with_options(ScanOptions::default().channel_capacity(0));
        let err = scanner.scan_packfile(CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn it_delivers_cancellation_through_the_reader() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let scanner = PackScanner::new::<&str, &str>("https://example.invalid/repo.git", &[H1], &[])
            .unwrap()
            .with_options(ScanOptions::default().system_proxy(false));
        let mut reader = scanner.scan_packfile(cancel).unwrap();

        let err = reader.next_chunk().await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(reader.next_chunk().await.is_none());
    }
}
