//! Transactional segment delivery to an IVR cloud store.
//!
//! Three REST phases per segment: `create` reserves a remote name and an
//! upload URI, the raw buffer is PUT to that URI, and a final `save` (or
//! `fail` after a broken upload) lets the store commit or release the
//! reservation. The overall call reports the upload outcome; losing only
//! the save notification is not data loss and surfaces as an unconfirmed
//! commit for the reconciliation sweep to settle.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing as log;
use url::Url;

use cseg_core::config::HttpConfig;
use cseg_core::error::{Error, Result};
use cseg_core::media::SEGMENT_CONTENT_TYPE;
use cseg_core::segment::Segment;
use cseg_core::writer::{SegmentWriter, WriteOutcome};

use crate::client::{HttpReply, HttpTransport};
use crate::meta::{non_empty, IvrReply};

const MAX_URI_LEN: usize = 1024;

const OP_CREATE: &str = "create";
const OP_SAVE: &str = "save";
const OP_FAIL: &str = "fail";

#[derive(Serialize)]
struct CreateForm<'a> {
    op: &'a str,
    content_type: &'a str,
    size: usize,
    start: String,
    duration: String,
}

#[derive(Serialize)]
struct NotifyForm<'a> {
    op: &'a str,
    name: &'a str,
    size: usize,
    start: String,
    duration: String,
}

enum CreateOutcome {
    Reserved { name: String, uri: String },
    /// The store issued no reservation yet; retry the segment later.
    NotReady,
}

pub struct IvrWriter {
    rest_uri: String,
    transport: HttpTransport,
    /// Metadata calls use the short timeout, the body upload the long one.
    create_timeout: Duration,
    upload_timeout: Duration,
}

impl IvrWriter {
    /// Build from an `ivr:`-scheme target; everything after the first
    /// colon is the REST endpoint with an `http` scheme prepended.
    pub fn new(target: &str, http: &HttpConfig) -> Result<Self> {
        if target.is_empty() {
            return Err(Error::InvalidConfig("ivr target absent".to_string()));
        }
        if target.len() > MAX_URI_LEN - 5 {
            return Err(Error::InvalidConfig("ivr target is too long".to_string()));
        }
        let Some(colon) = target.find(':') else {
            return Err(Error::InvalidConfig(format!(
                "ivr target malformed: {target}"
            )));
        };
        let rest_uri = format!("http{}", &target[colon..]);
        let parsed = Url::parse(&rest_uri)
            .map_err(|e| Error::InvalidConfig(format!("ivr target malformed: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "ivr target scheme unsupported: {}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            rest_uri,
            transport: HttpTransport::new(http.retries),
            create_timeout: Duration::from_millis(http.create_timeout_ms),
            upload_timeout: Duration::from_millis(http.timeout_ms),
        })
    }

    fn create_body(segment: &Segment) -> Result<String> {
        let form = CreateForm {
            op: OP_CREATE,
            content_type: SEGMENT_CONTENT_TYPE,
            size: segment.size(),
            start: format!("{:.6}", segment.start_ts),
            duration: format!("{:.6}", segment.duration),
        };
        serde_urlencoded::to_string(&form)
            .map_err(|e| Error::InvalidConfig(format!("encode create body: {e}")))
    }

    fn notify_body(segment: &Segment, op: &str, name: &str) -> Result<String> {
        let form = NotifyForm {
            op,
            name,
            size: segment.size(),
            start: format!("{:.6}", segment.start_ts),
            duration: format!("{:.6}", segment.duration),
        };
        serde_urlencoded::to_string(&form)
            .map_err(|e| Error::InvalidConfig(format!("encode {op} body: {e}")))
    }

    /// Map a non-2xx metadata reply, pulling the `info` diagnostic out of
    /// the body when one is present.
    fn status_error(reply: &HttpReply) -> Error {
        let info = if reply.body.is_empty() {
            None
        } else {
            IvrReply::decode(&reply.body).info
        };
        Error::from_status(reply.status, info.unwrap_or_default())
    }

    async fn create(&self, segment: &Segment) -> Result<CreateOutcome> {
        let body = Self::create_body(segment)?;
        let reply = self
            .transport
            .post_form(&self.rest_uri, body, self.create_timeout)
            .await?;
        if !reply.is_success() {
            let err = Self::status_error(&reply);
            log::error!(sequence = segment.sequence, status = reply.status, error = %err, "create rejected");
            return Err(err);
        }

        let fields = IvrReply::decode(&reply.body);
        match (
            non_empty(fields.name.as_deref()),
            non_empty(fields.uri.as_deref()),
        ) {
            (Some(name), Some(uri)) => Ok(CreateOutcome::Reserved {
                name: name.to_string(),
                uri: uri.to_string(),
            }),
            _ => Ok(CreateOutcome::NotReady),
        }
    }

    async fn upload(&self, segment: &Segment, uri: &str) -> Result<()> {
        let reply = self
            .transport
            .put_bytes(
                uri,
                SEGMENT_CONTENT_TYPE,
                segment.buffer.clone(),
                self.upload_timeout,
            )
            .await?;
        if !reply.is_success() {
            log::error!(
                sequence = segment.sequence,
                status = reply.status,
                "segment upload failed"
            );
            return Err(Error::from_status(reply.status, "segment upload"));
        }
        Ok(())
    }

    async fn notify(&self, segment: &Segment, op: &str, name: &str) -> Result<()> {
        let body = Self::notify_body(segment, op, name)?;
        let reply = self
            .transport
            .post_form(&self.rest_uri, body, self.create_timeout)
            .await?;
        if !reply.is_success() {
            let err = Self::status_error(&reply);
            log::error!(sequence = segment.sequence, op, status = reply.status, error = %err, "notify rejected");
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl SegmentWriter for IvrWriter {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn write_segment(&self, segment: &Segment) -> Result<WriteOutcome> {
        let (name, uri) = match self.create(segment).await? {
            CreateOutcome::Reserved { name, uri } => (name, uri),
            CreateOutcome::NotReady => {
                log::info!(
                    sequence = segment.sequence,
                    "store not ready, deferring segment"
                );
                return Ok(WriteOutcome::Deferred);
            }
        };

        match self.upload(segment, &uri).await {
            Ok(()) => match self.notify(segment, OP_SAVE, &name).await {
                Ok(()) => Ok(WriteOutcome::Committed),
                Err(err) => {
                    // The bytes are stored; only the acknowledgement is
                    // missing. The sweep re-issues the save later.
                    log::warn!(sequence = segment.sequence, name, error = %err, "save notification lost after upload");
                    Ok(WriteOutcome::CommittedUnconfirmed { name })
                }
            },
            Err(upload_err) => {
                // Release the reservation so the store does not hold an
                // orphaned entry for bytes that never arrived.
                if let Err(fail_err) = self.notify(segment, OP_FAIL, &name).await {
                    log::warn!(sequence = segment.sequence, name, error = %fail_err, "fail notification rejected");
                }
                Err(upload_err)
            }
        }
    }

    async fn confirm(&self, segment: &Segment, name: &str) -> Result<()> {
        self.notify(segment, OP_SAVE, name).await
    }

    async fn uninit(&self) -> Result<()> {
        Ok(())
    }
}
