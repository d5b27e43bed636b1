use super::{Advertisement, Error, PackStream, Result, ScanOptions};
use crate::git_protocol::{PktLines, UploadPackRequest};
use futures_util::TryStreamExt;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use std::io;
use tokio_util::io::StreamReader;
use tracing::debug;

const ADVERTISEMENT_CONTENT_TYPE: &str = "application/x-git-upload-pack-advertisement";
const REQUEST_CONTENT_TYPE: &str = "application/x-git-upload-pack-request";
const RESULT_CONTENT_TYPE: &str = "application/x-git-upload-pack-result";

/// Stateless smart-HTTP exchange: one GET for the advertisement, one POST
/// carrying the whole request.
pub(super) struct HttpSession {
    client: reqwest::Client,
    base: String,
}

impl HttpSession {
    pub(super) async fn connect(
        url: &Url,
        options: &ScanOptions,
    ) -> Result<(Self, Advertisement)> {
        let client = build_client(options)?;
        let base = url.as_str().trim_end_matches('/').to_string();

        let res = client
            .get(format!("{base}/info/refs?service=git-upload-pack"))
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(Error::Connection(format!(
                "GET {base}/info/refs returned {status}"
            )));
        }

        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with(ADVERTISEMENT_CONTENT_TYPE) {
            return Err(Error::NegotiationRejected(format!(
                "{base} does not speak smart HTTP (content type {content_type:?})"
            )));
        }

        let body = res.bytes().await?;
        debug!(bytes = body.len(), "Fetched ref advertisement");
        let lines = PktLines::from(body).collect::<Result<Vec<_>>>()?;
        let advertisement = Advertisement::parse(lines)?;

        Ok((Self { client, base }, advertisement))
    }

    pub(super) async fn upload_pack(self, request: &UploadPackRequest) -> Result<PackStream> {
        let res = self
            .client
            .post(format!("{}/git-upload-pack", self.base))
            .header(CONTENT_TYPE, HeaderValue::from_static(REQUEST_CONTENT_TYPE))
            .header(ACCEPT, HeaderValue::from_static(RESULT_CONTENT_TYPE))
            .body(request.serialize())
            .send()
            .await?;

        let status = res.status();
        if status.is_client_error() {
            return Err(Error::NegotiationRejected(format!(
                "POST {}/git-upload-pack returned {status}",
                self.base
            )));
        }
        if !status.is_success() {
            return Err(Error::Connection(format!(
                "POST {}/git-upload-pack returned {status}",
                self.base
            )));
        }

        let stream = Box::pin(res.bytes_stream().map_err(io::Error::other));
        PackStream::negotiate(Box::new(StreamReader::new(stream)), None).await
    }
}

fn build_client(options: &ScanOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(options.user_agent.as_str());
    if let Some(timeout) = options.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if !options.system_proxy {
        builder = builder.no_proxy();
    }
    Ok(builder.build()?)
}
