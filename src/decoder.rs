//! Adapter over the `actix-multipart` decoder.
//!
//! [`FormDecoder`] drives a [`Multipart`] stream and reports what it finds as [`Event`]s. Field
//! values are read in full before being reported. File content is forwarded through a bounded
//! channel, so the decoder only advances as fast as the consumer of that channel.

use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use actix_multipart::{Field, Multipart};
use actix_web::{
    error::PayloadError,
    http::header::{HeaderMap, HeaderName},
};
use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use futures_core::Stream;
use futures_util::StreamExt as _;
use mime::Mime;
use tokio::sync::mpsc;

use crate::{config::DecoderLimits, error::MultipartError};

/// Names of intrinsic object properties. Parts using them are refused so that form bodies can be
/// handed safely to dynamic-object consumers.
pub const RESERVED_NAMES: &[&str] = &[
    "__proto__",
    "constructor",
    "__defineGetter__",
    "__defineSetter__",
    "hasOwnProperty",
    "__lookupGetter__",
    "__lookupSetter__",
    "isPrototypeOf",
    "propertyIsEnumerable",
    "toString",
    "valueOf",
    "toLocaleString",
];

const DEFAULT_TRANSFER_ENCODING: &str = "7bit";

/// Chunks buffered per file part before the decoder waits for the consumer.
const PART_CHANNEL_CAPACITY: usize = 16;

pub(crate) fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Something the decoder found in the request body.
///
/// Exactly one terminal event (`Finish`, a limit or `Error`) is sent per request.
#[derive(Debug)]
pub(crate) enum Event {
    Field(FieldPart),
    File(FilePart),
    PartsLimit,
    FilesLimit,
    FieldsLimit,
    Error(MultipartError),
    Finish,
}

#[derive(Debug)]
pub(crate) struct FieldPart {
    pub(crate) name: String,
    pub(crate) value: String,
    pub(crate) name_truncated: bool,
    pub(crate) value_truncated: bool,
    pub(crate) transfer_encoding: String,
    pub(crate) mime_type: Mime,
}

#[derive(Debug)]
pub(crate) struct FilePart {
    pub(crate) name: String,
    pub(crate) stream: PartStream,
    pub(crate) file_name: String,
    pub(crate) transfer_encoding: String,
    pub(crate) mime_type: Mime,
}

#[derive(Debug)]
pub(crate) enum PartChunk {
    Data(Bytes),
    End { truncated: bool },
}

/// Content of one file part.
///
/// Ends with `Err(Incomplete)` if the decoder goes away before the part is complete. Whether the
/// part was truncated at the file size limit is known once the stream has ended.
#[derive(Debug)]
pub(crate) struct PartStream {
    rx: mpsc::Receiver<PartChunk>,
    truncated: bool,
    done: bool,
}

impl PartStream {
    pub(crate) fn channel() -> (mpsc::Sender<PartChunk>, PartStream) {
        let (tx, rx) = mpsc::channel(PART_CHANNEL_CAPACITY);

        (
            tx,
            PartStream {
                rx,
                truncated: false,
                done: false,
            },
        )
    }

    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Stream for PartStream {
    type Item = Result<Bytes, MultipartError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        match ready!(this.rx.poll_recv(cx)) {
            Some(PartChunk::Data(chunk)) => Poll::Ready(Some(Ok(chunk))),

            Some(PartChunk::End { truncated }) => {
                this.truncated = truncated;
                this.done = true;
                Poll::Ready(None)
            }

            None => {
                this.done = true;
                Poll::Ready(Some(Err(MultipartError::Incomplete)))
            }
        }
    }
}

pub(crate) struct FormDecoder {
    multipart: Multipart,
    limits: DecoderLimits,
}

impl FormDecoder {
    /// Header problems (missing boundary, wrong Content-Type) surface as an `Error` event once
    /// [`run`](Self::run) starts.
    pub(crate) fn new<S>(headers: &HeaderMap, payload: S, limits: DecoderLimits) -> Self
    where
        S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
    {
        FormDecoder {
            multipart: Multipart::new(headers, payload),
            limits,
        }
    }

    /// Decodes the whole body, sending events as parts are found.
    pub(crate) async fn run(mut self, events: mpsc::UnboundedSender<Event>) {
        let terminal = self.decode(&events).await;
        log::trace!("multipart decoder finished with {terminal:?}");
        let _ = events.send(terminal);
    }

    async fn decode(&mut self, events: &mpsc::UnboundedSender<Event>) -> Event {
        let (mut parts, mut files, mut fields) = (0, 0, 0);

        while let Some(item) = self.multipart.next().await {
            let mut field = match item {
                Ok(field) => field,
                Err(err) => return Event::Error(err.into()),
            };

            parts += 1;
            if exceeds(self.limits.parts, parts) {
                return Event::PartsLimit;
            }

            let mime_type = field.content_type().cloned().unwrap_or(mime::TEXT_PLAIN);
            let transfer_encoding = transfer_encoding(field.headers());
            let file_name = field
                .content_disposition()
                .and_then(|cd| cd.get_filename())
                .map(str::to_owned);

            match file_name {
                Some(file_name) => {
                    files += 1;
                    if exceeds(self.limits.files, files) {
                        return Event::FilesLimit;
                    }

                    let name = field.name().unwrap_or_default().to_owned();
                    if is_reserved_name(&name) {
                        return Event::Error(MultipartError::ReservedName(name));
                    }

                    log::trace!("file part `{name}` ({file_name:?}, {mime_type})");

                    let (tx, stream) = PartStream::channel();
                    let _ = events.send(Event::File(FilePart {
                        name,
                        stream,
                        file_name,
                        transfer_encoding,
                        mime_type,
                    }));

                    if let Err(err) = forward_file(&mut field, tx, self.limits.file_size).await {
                        return Event::Error(err);
                    }
                }

                None => {
                    fields += 1;
                    if exceeds(self.limits.fields, fields) {
                        return Event::FieldsLimit;
                    }

                    let (name, name_truncated) =
                        truncate(field.name().unwrap_or_default(), self.limits.field_name_size);
                    if is_reserved_name(&name) {
                        return Event::Error(MultipartError::ReservedName(name));
                    }

                    let (value, value_truncated) =
                        match read_value(&mut field, self.limits.field_size).await {
                            Ok(value) => value,
                            Err(err) => return Event::Error(err),
                        };

                    log::trace!("field part `{name}` ({} bytes, {mime_type})", value.len());

                    let _ = events.send(Event::Field(FieldPart {
                        name,
                        value,
                        name_truncated,
                        value_truncated,
                        transfer_encoding,
                        mime_type,
                    }));
                }
            }
        }

        Event::Finish
    }
}

fn exceeds(limit: Option<usize>, count: usize) -> bool {
    limit.is_some_and(|limit| count > limit)
}

fn transfer_encoding(headers: &HeaderMap) -> String {
    headers
        .get(HeaderName::from_static("content-transfer-encoding"))
        .and_then(|val| val.to_str().ok())
        .map(|val| val.trim().to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_TRANSFER_ENCODING.to_owned())
}

/// Cuts `s` to at most `limit` bytes on a char boundary.
fn truncate(s: &str, limit: usize) -> (String, bool) {
    if s.len() <= limit {
        return (s.to_owned(), false);
    }

    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }

    (s[..end].to_owned(), true)
}

/// Reads a field value up to `limit` bytes and decodes it with the part's charset.
///
/// The rest of an oversized value is read and discarded.
async fn read_value(field: &mut Field, limit: usize) -> Result<(String, bool), MultipartError> {
    let encoding = field
        .content_type()
        .and_then(|mime| mime.get_param(mime::CHARSET))
        .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
        .unwrap_or(UTF_8);

    let mut buf = BytesMut::new();
    let mut truncated = false;

    while let Some(chunk) = field.next().await {
        let chunk = chunk?;

        if truncated {
            continue;
        }

        let room = limit - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            truncated = true;
        } else {
            buf.extend_from_slice(&chunk);
        }
    }

    let (value, _) = encoding.decode_without_bom_handling(&buf);
    Ok((value.into_owned(), truncated))
}

/// Forwards file content to the part channel, cutting it at `limit` bytes.
///
/// If the receiving side is gone the remaining content is still read so that the decoder can
/// move on to the next part.
async fn forward_file(
    field: &mut Field,
    tx: mpsc::Sender<PartChunk>,
    limit: Option<u64>,
) -> Result<(), MultipartError> {
    let mut tx = Some(tx);
    let mut size = 0u64;
    let mut truncated = false;

    while let Some(chunk) = field.next().await {
        let mut chunk = chunk?;

        if truncated {
            continue;
        }

        if let Some(limit) = limit {
            let room = limit - size;

            if chunk.len() as u64 > room {
                chunk.truncate(room as usize);
                truncated = true;
            }
        }

        size += chunk.len() as u64;

        if chunk.is_empty() {
            continue;
        }

        if let Some(ref sender) = tx {
            if sender.send(PartChunk::Data(chunk)).await.is_err() {
                tx = None;
            }
        }
    }

    if let Some(sender) = tx {
        let _ = sender.send(PartChunk::End { truncated }).await;
    }

    Ok(())
}
