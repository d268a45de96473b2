//! Per-request ingestion.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use actix_web::{
    error::PayloadError,
    http::header::{self, HeaderMap},
};
use bytes::Bytes;
use futures_core::{future::LocalBoxFuture, Stream};
use futures_util::{stream::FuturesUnordered, FutureExt as _, StreamExt as _};
use tokio::sync::mpsc;

use crate::{
    body::MultipartBody,
    config::MultipartConfig,
    decoder::{Event, FieldPart, FilePart, FormDecoder},
    entry::{Entry, FieldEntry, FieldValue, FileEntry, FileMeta},
    error::MultipartError,
    json::{is_json_mime, parse_secure},
    spool::spool,
    watchdog::BodyWatchdog,
};

type SpoolFuture = LocalBoxFuture<'static, Result<FileEntry, MultipartError>>;

/// State of one multipart request, shared between the extractor, the handler and the
/// [`MultipartCleanup`](crate::MultipartCleanup) middleware.
///
/// Holds every entry produced for the request in completion order. File entries stay owned by the
/// context until [`release`](Self::release) runs after the response has been sent.
#[derive(Clone, Default)]
pub struct MultipartContext {
    inner: Rc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    is_multipart: Cell<bool>,
    entries: RefCell<Vec<Entry>>,
}

impl MultipartContext {
    pub fn new() -> Self {
        MultipartContext::default()
    }

    /// Returns true once the request body has been handed to [`ingest`](Self::ingest).
    pub fn is_multipart(&self) -> bool {
        self.inner.is_multipart.get()
    }

    /// All entries, fields and files, in the order their handling completed.
    pub fn entries(&self) -> Vec<Entry> {
        self.inner.entries.borrow().clone()
    }

    pub fn fields(&self) -> Vec<FieldEntry> {
        self.inner
            .entries
            .borrow()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Field(field) => Some(field.clone()),
                Entry::File(_) => None,
            })
            .collect()
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.inner
            .entries
            .borrow()
            .iter()
            .filter_map(|entry| match entry {
                Entry::File(file) => Some(file.clone()),
                Entry::Field(_) => None,
            })
            .collect()
    }

    fn push(&self, entry: Entry) {
        self.inner.entries.borrow_mut().push(entry);
    }

    /// Decodes a `multipart/form-data` body into a [`MultipartBody`].
    ///
    /// Fields are recorded as they arrive. Each file part is spooled concurrently with the rest of
    /// the decode. The first failure, whether reported by the decoder, a spool, the JSON check or
    /// the body size watchdog, stops decoding; spools already running are awaited and their
    /// entries kept so [`release`](Self::release) can clean them up, then that failure is
    /// returned. Later failures are discarded.
    pub async fn ingest<S>(
        &self,
        config: &MultipartConfig,
        headers: &HeaderMap,
        payload: S,
    ) -> Result<MultipartBody, MultipartError>
    where
        S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
    {
        self.inner.is_multipart.set(true);

        if let Some(len) = content_length(headers) {
            if len > config.body_limit {
                log::debug!(
                    "declared content length {len} exceeds body limit of {}",
                    config.body_limit
                );
                return Err(MultipartError::RequestTooLarge);
            }
        }

        let (tx, mut events) = mpsc::unbounded_channel();
        let payload = BodyWatchdog::new(payload, config.body_limit, tx.clone());
        let mut decoding = Box::pin(FormDecoder::new(headers, payload, config.limits).run(tx));

        let mut pending = FuturesUnordered::<SpoolFuture>::new();
        let mut error = None;
        let mut finished = false;
        let mut decoded = false;

        while error.is_none() && !(finished && pending.is_empty()) {
            tokio::select! {
                biased;

                event = events.recv(), if !finished => match event {
                    Some(Event::Field(part)) => match field_entry(part) {
                        Ok(field) => self.push(Entry::Field(field)),
                        Err(err) => error = Some(err),
                    },

                    Some(Event::File(part)) => match start_spool(config, part) {
                        Ok(fut) => pending.push(fut),
                        Err(err) => error = Some(err),
                    },

                    Some(Event::PartsLimit) => error = Some(MultipartError::PartsLimitExceeded),
                    Some(Event::FilesLimit) => error = Some(MultipartError::FilesLimitExceeded),
                    Some(Event::FieldsLimit) => error = Some(MultipartError::FieldsLimitExceeded),
                    Some(Event::Error(err)) => error = Some(err),
                    Some(Event::Finish) => finished = true,

                    // decoder gone without a terminal event
                    None => error = Some(MultipartError::Incomplete),
                },

                Some(res) = pending.next(), if !pending.is_empty() => match res {
                    Ok(file) => self.push(Entry::File(file)),
                    Err(err) => error = Some(err),
                },

                _ = &mut decoding, if !decoded => decoded = true,
            }
        }

        // draining
        drop(decoding);

        if let Some(ref err) = error {
            log::debug!(
                "multipart ingestion failed: {err}; awaiting {} pending file parts",
                pending.len()
            );
        }

        while let Some(res) = pending.next().await {
            match res {
                Ok(file) => self.push(Entry::File(file)),
                Err(err) if error.is_none() => error = Some(err),
                Err(err) => log::trace!("discarding file part error: {err}"),
            }
        }

        match error {
            Some(err) => Err(err),

            None => {
                let entries = self.inner.entries.borrow();
                log::trace!("multipart ingestion finished with {} entries", entries.len());
                let body = MultipartBody::from_entries(entries.iter());
                Ok(body)
            }
        }
    }

    /// Destroys every file entry of the request.
    ///
    /// Safe to call more than once. Failures to remove a temp file are logged, not returned.
    pub async fn release(&self) {
        let files = self.files();

        if !files.is_empty() {
            log::trace!("releasing {} file entries", files.len());
        }

        for file in files {
            if let Err(err) = file.destroy().await {
                log::warn!(
                    "failed to remove temp file of part `{}`: {err}",
                    file.field_name()
                );
            }
        }
    }
}

impl fmt::Debug for MultipartContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartContext")
            .field("is_multipart", &self.is_multipart())
            .field("entries", &self.inner.entries.borrow().len())
            .finish()
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn start_spool(config: &MultipartConfig, part: FilePart) -> Result<SpoolFuture, MultipartError> {
    let dest = config.temp.next_path()?;

    let meta = FileMeta {
        field_name: part.name,
        file_name: part.file_name,
        mime_type: part.mime_type,
        transfer_encoding: part.transfer_encoding,
    };

    Ok(spool(part.stream, meta, config.in_memory_limit, dest).boxed_local())
}

fn field_entry(part: FieldPart) -> Result<FieldEntry, MultipartError> {
    let value = if is_json_mime(&part.mime_type) {
        match parse_secure(&part.value) {
            Ok(value) => FieldValue::Json(value),
            Err(err) => {
                log::debug!("field `{}` is not valid JSON: {err}", part.name);
                return Err(MultipartError::InvalidJsonField(part.name));
            }
        }
    } else {
        FieldValue::Text(part.value)
    };

    Ok(FieldEntry::new(
        part.name,
        part.mime_type,
        part.transfer_encoding,
        value,
        part.name_truncated,
        part.value_truncated,
    ))
}

#[cfg(test)]
mod tests {
    use actix_web::http::header::HeaderValue;
    use futures_util::{stream, StreamExt as _, TryStreamExt as _};

    use super::*;
    use crate::{
        config::DecoderLimits,
        test::{random_bytes, FormBuilder},
    };

    fn chunked(body: Bytes, size: usize) -> impl Stream<Item = Result<Bytes, PayloadError>> {
        let mut chunks = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            chunks.push(Ok(rest.split_to(size.min(rest.len()))));
        }
        stream::iter(chunks)
    }

    fn config(dir: &std::path::Path) -> MultipartConfig {
        MultipartConfig::default()
            .temp_dir(dir)
            .max_in_memory_file_size(2048)
    }

    async fn ingest(
        config: &MultipartConfig,
        form: FormBuilder,
    ) -> (MultipartContext, Result<MultipartBody, MultipartError>) {
        let (body, headers) = form.finish();
        let ctx = MultipartContext::new();
        let res = ctx.ingest(config, &headers, chunked(body, 700)).await;
        (ctx, res)
    }

    #[actix_rt::test]
    async fn memory_and_disk_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let small = random_bytes(1024);
        let large = random_bytes(4096);

        let (ctx, res) = ingest(
            &config,
            FormBuilder::new()
                .text("field1", "just string")
                .file("file1", "small.bin", mime::APPLICATION_OCTET_STREAM, small.clone())
                .file("file2", "large.bin", mime::APPLICATION_OCTET_STREAM, large.clone()),
        )
        .await;
        let body = res.unwrap();

        assert!(ctx.is_multipart());
        assert_eq!(body.len(), 3);
        assert_eq!(body.text("field1"), Some("just string"));

        let file1 = body.file("file1").unwrap();
        assert!(file1.is_in_memory());
        assert_eq!(file1.size(), 1024);
        assert_eq!(file1.to_bytes().await.unwrap(), small);

        let file2 = body.file("file2").unwrap();
        assert!(file2.is_persisted());
        assert_eq!(file2.size(), 4096);
        assert_eq!(file2.file_name(), "large.bin");
        assert_eq!(file2.to_bytes().await.unwrap(), large);
        let streamed: Vec<Bytes> = file2.to_stream().unwrap().try_collect().await.unwrap();
        assert_eq!(streamed.concat(), large);

        let path = file2.path().unwrap().to_owned();
        assert!(path.starts_with(dir.path()));

        assert_eq!(ctx.fields().len(), 1);
        assert_eq!(ctx.files().len(), 2);

        ctx.release().await;
        assert!(!path.exists());
        assert!(file1.is_destroyed());
        assert!(file2.is_destroyed());

        // idempotent
        ctx.release().await;
    }

    #[actix_rt::test]
    async fn json_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let (_, res) = ingest(
            &config,
            FormBuilder::new()
                .typed_text("meta", mime::APPLICATION_JSON, r#"{"tags":["a","b"]}"#)
                .typed_text("plain", mime::TEXT_PLAIN, r#"{"tags":[]}"#),
        )
        .await;
        let body = res.unwrap();

        assert_eq!(
            body.json("meta"),
            Some(&serde_json::json!({ "tags": ["a", "b"] }))
        );
        assert_eq!(body.text("plain"), Some(r#"{"tags":[]}"#));

        let (_, res) = ingest(
            &config,
            FormBuilder::new().typed_text(
                "meta",
                "application/vnd.api+json".parse().unwrap(),
                "not json",
            ),
        )
        .await;
        assert!(matches!(res, Err(MultipartError::InvalidJsonField(ref name)) if name == "meta"));

        let (_, res) = ingest(
            &config,
            FormBuilder::new().typed_text(
                "meta",
                mime::APPLICATION_JSON,
                r#"{"__proto__":{"admin":true}}"#,
            ),
        )
        .await;
        assert!(matches!(res, Err(MultipartError::InvalidJsonField(_))));
    }

    #[actix_rt::test]
    async fn reserved_name_fails_and_keeps_spooled_files_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let (ctx, res) = ingest(
            &config,
            FormBuilder::new()
                .file("upload", "big.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(8192))
                .text("constructor", "x"),
        )
        .await;

        assert!(matches!(res, Err(MultipartError::ReservedName(ref name)) if name == "constructor"));

        let files = ctx.files();
        assert_eq!(files.len(), 1);
        let path = files[0].path().unwrap().to_owned();
        assert!(path.exists());

        ctx.release().await;
        assert!(!path.exists());
    }

    #[actix_rt::test]
    async fn watchdog_error_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).max_body_limit(4096);

        let (ctx, res) = ingest(
            &config,
            FormBuilder::new()
                .file("a", "a.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(3000))
                .file("b", "b.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(3000)),
        )
        .await;

        assert!(matches!(res, Err(MultipartError::RequestTooLarge)));

        ctx.release().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Like `chunked`, but each chunk only becomes ready after a yield to the scheduler.
    fn trickled(body: Bytes, size: usize) -> impl Stream<Item = Result<Bytes, PayloadError>> {
        chunked(body, size).then(|chunk| async move {
            actix_rt::task::yield_now().await;
            chunk
        })
    }

    #[actix_rt::test]
    async fn watchdog_trips_after_parts_were_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path())
            .max_body_limit(4096)
            .max_in_memory_file_size(1024);

        let (body, headers) = FormBuilder::new()
            .file("a", "a.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(1500))
            .file("b", "b.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(1500))
            .file("c", "c.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(1500))
            .finish();

        let ctx = MultipartContext::new();
        let res = ctx.ingest(&config, &headers, trickled(body, 256)).await;
        assert!(matches!(res, Err(MultipartError::RequestTooLarge)));

        let files = ctx.files();
        assert!(!files.is_empty());
        assert!(files.iter().all(|file| file.is_persisted()));

        ctx.release().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[actix_rt::test]
    async fn declared_length_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).max_body_limit(10);

        let (body, mut headers) = FormBuilder::new().text("a", "1").finish();
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&body.len().to_string()).unwrap(),
        );

        let ctx = MultipartContext::new();
        let res = ctx.ingest(&config, &headers, chunked(body, 64)).await;
        assert!(matches!(res, Err(MultipartError::RequestTooLarge)));
        assert!(ctx.entries().is_empty());
    }

    #[actix_rt::test]
    async fn file_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).limits(DecoderLimits::default().file_size(1000));

        let (ctx, res) = ingest(
            &config,
            FormBuilder::new().file("f", "f.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(4000)),
        )
        .await;

        assert!(matches!(res, Err(MultipartError::FileTooLarge)));
        assert!(ctx.files().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[actix_rt::test]
    async fn count_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).limits(DecoderLimits::default().fields(1));

        let (_, res) = ingest(&config, FormBuilder::new().text("a", "1").text("b", "2")).await;
        assert!(matches!(res, Err(MultipartError::FieldsLimitExceeded)));
    }

    #[actix_rt::test]
    async fn malformed_body() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let (body, headers) = FormBuilder::new()
            .file("f", "f.bin", mime::APPLICATION_OCTET_STREAM, random_bytes(100))
            .finish();
        let cut = body.slice(..body.len() - 100);

        let ctx = MultipartContext::new();
        let res = ctx.ingest(&config, &headers, chunked(cut, 64)).await;
        assert!(res.is_err());
        assert!(ctx.files().is_empty());
    }

    #[actix_rt::test]
    async fn duplicate_names_keep_last_completed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let (ctx, res) = ingest(
            &config,
            FormBuilder::new().text("tag", "one").text("tag", "two"),
        )
        .await;

        assert_eq!(res.unwrap().text("tag"), Some("two"));
        assert_eq!(ctx.entries().len(), 2);
    }
}
