//! Parsed parts of a multipart request.

use std::{
    cell::RefCell,
    fmt, fs, io,
    path::{Path, PathBuf},
    rc::Rc,
};

use bytes::{Bytes, BytesMut};
use futures_core::stream::LocalBoxStream;
use futures_util::{stream, StreamExt as _};
use mime::Mime;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt as _, AsyncWriteExt as _},
};

use crate::error::MultipartError;

/// Read size used when streaming a persisted file.
const READ_CHUNK: usize = 64 * 1024;

/// Byte stream over the content of an entry.
pub type ContentStream = LocalBoxStream<'static, io::Result<Bytes>>;

/// A single parsed part: either a field or a file.
#[derive(Debug, Clone)]
pub enum Entry {
    Field(FieldEntry),
    File(FileEntry),
}

impl Entry {
    /// Form field name of the part.
    pub fn name(&self) -> &str {
        match self {
            Entry::Field(field) => field.name(),
            Entry::File(file) => file.field_name(),
        }
    }
}

/// Value of a field part.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Raw text value.
    Text(String),

    /// Parsed value of a field whose Content-Type declares JSON.
    Json(serde_json::Value),
}

/// A non-file part of the form.
#[derive(Debug, Clone)]
pub struct FieldEntry {
    name: String,
    mime_type: Mime,
    transfer_encoding: String,
    value: FieldValue,
    name_truncated: bool,
    value_truncated: bool,
}

impl FieldEntry {
    pub(crate) fn new(
        name: String,
        mime_type: Mime,
        transfer_encoding: String,
        value: FieldValue,
        name_truncated: bool,
        value_truncated: bool,
    ) -> Self {
        FieldEntry {
            name,
            mime_type,
            transfer_encoding,
            value,
            name_truncated,
            value_truncated,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared Content-Type of the part.
    pub fn mime_type(&self) -> &Mime {
        &self.mime_type
    }

    pub fn transfer_encoding(&self) -> &str {
        &self.transfer_encoding
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    /// Returns the text value, or `None` for JSON fields.
    pub fn as_str(&self) -> Option<&str> {
        match self.value {
            FieldValue::Text(ref text) => Some(text),
            FieldValue::Json(_) => None,
        }
    }

    /// Returns the parsed value, or `None` for text fields.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self.value {
            FieldValue::Json(ref value) => Some(value),
            FieldValue::Text(_) => None,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.value, FieldValue::Json(_))
    }

    /// Whether the decoder cut the field name at its length limit.
    pub fn name_truncated(&self) -> bool {
        self.name_truncated
    }

    /// Whether the decoder cut the value at its length limit.
    pub fn value_truncated(&self) -> bool {
        self.value_truncated
    }

    /// Field content as bytes. JSON values are serialized back to text.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }

    /// Field content as a single chunk stream.
    pub fn to_stream(&self) -> ContentStream {
        stream::once(futures_util::future::ready(Ok(self.to_bytes()))).boxed_local()
    }
}

impl fmt::Display for FieldEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            FieldValue::Text(ref text) => f.write_str(text),
            FieldValue::Json(ref value) => write!(f, "{value}"),
        }
    }
}

/// Where the content of a file entry lives.
#[derive(Debug)]
enum Storage {
    Memory(Bytes),
    Disk,
    Released,
}

/// An uploaded file part.
///
/// Small files are kept in memory, larger ones are spooled to a temporary file. Cloning is cheap;
/// clones share the same backing storage, so destroying one clone destroys all of them.
#[derive(Clone)]
pub struct FileEntry {
    inner: Rc<FileInner>,
}

struct FileInner {
    field_name: String,
    file_name: String,
    mime_type: Mime,
    transfer_encoding: String,
    size: u64,

    /// Backing file path when persisted, reserved destination otherwise.
    path: PathBuf,

    storage: RefCell<Storage>,
}

/// Metadata shared by both storage tiers.
pub(crate) struct FileMeta {
    pub(crate) field_name: String,
    pub(crate) file_name: String,
    pub(crate) mime_type: Mime,
    pub(crate) transfer_encoding: String,
}

impl FileEntry {
    pub(crate) fn in_memory(meta: FileMeta, data: Bytes, reserved_path: PathBuf) -> Self {
        FileEntry::new(
            meta,
            data.len() as u64,
            reserved_path,
            Storage::Memory(data),
        )
    }

    pub(crate) fn persisted(meta: FileMeta, size: u64, path: PathBuf) -> Self {
        FileEntry::new(meta, size, path, Storage::Disk)
    }

    fn new(meta: FileMeta, size: u64, path: PathBuf, storage: Storage) -> Self {
        FileEntry {
            inner: Rc::new(FileInner {
                field_name: meta.field_name,
                file_name: meta.file_name,
                mime_type: meta.mime_type,
                transfer_encoding: meta.transfer_encoding,
                size,
                path,
                storage: RefCell::new(storage),
            }),
        }
    }

    /// Form field name of the part.
    pub fn field_name(&self) -> &str {
        &self.inner.field_name
    }

    /// File name supplied by the client.
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    /// Declared Content-Type of the part.
    pub fn mime_type(&self) -> &Mime {
        &self.inner.mime_type
    }

    pub fn transfer_encoding(&self) -> &str {
        &self.inner.transfer_encoding
    }

    /// Size of the file in bytes. Still available after the entry is destroyed.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Same as [`size`](Self::size).
    pub fn len(&self) -> u64 {
        self.inner.size
    }

    pub fn is_empty(&self) -> bool {
        self.inner.size == 0
    }

    /// Whether the content is held in memory.
    pub fn is_in_memory(&self) -> bool {
        matches!(*self.inner.storage.borrow(), Storage::Memory(_))
    }

    /// Whether the content lives in a temporary file.
    pub fn is_persisted(&self) -> bool {
        matches!(*self.inner.storage.borrow(), Storage::Disk)
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(*self.inner.storage.borrow(), Storage::Released)
    }

    /// Path of the backing temporary file, if the entry is persisted.
    pub fn path(&self) -> Option<&Path> {
        self.is_persisted().then(|| self.inner.path.as_path())
    }

    /// Reads the whole content.
    ///
    /// Can be called repeatedly; every call returns the same bytes.
    ///
    /// # Errors
    /// Fails with [`MultipartError::Destroyed`] once the entry is destroyed.
    pub async fn to_bytes(&self) -> Result<Bytes, MultipartError> {
        let data = match *self.inner.storage.borrow() {
            Storage::Memory(ref data) => Some(data.clone()),
            Storage::Disk => None,
            Storage::Released => return Err(MultipartError::Destroyed),
        };

        match data {
            Some(data) => Ok(data),
            None => Ok(Bytes::from(tokio::fs::read(&self.inner.path).await?)),
        }
    }

    /// Returns a fresh stream over the content.
    ///
    /// Persisted files are opened lazily and read in chunks.
    ///
    /// # Errors
    /// Fails with [`MultipartError::Destroyed`] once the entry is destroyed.
    pub fn to_stream(&self) -> Result<ContentStream, MultipartError> {
        match *self.inner.storage.borrow() {
            Storage::Memory(ref data) => {
                let chunk = (!data.is_empty()).then(|| Ok(data.clone()));
                Ok(stream::iter(chunk).boxed_local())
            }

            Storage::Disk => Ok(read_file_stream(self.inner.path.clone())),

            Storage::Released => Err(MultipartError::Destroyed),
        }
    }

    /// Writes an in-memory entry to its reserved temporary path and switches it to the disk tier.
    ///
    /// Persisted entries are left untouched.
    pub async fn persist_to_disk(&self) -> Result<(), MultipartError> {
        let data = match *self.inner.storage.borrow() {
            Storage::Memory(ref data) => data.clone(),
            Storage::Disk => return Ok(()),
            Storage::Released => return Err(MultipartError::Destroyed),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.inner.path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);

        let mut storage = self.inner.storage.borrow_mut();

        if let Storage::Memory(_) = *storage {
            *storage = Storage::Disk;
        } else {
            // destroyed while writing
            drop(storage);
            remove_file(&self.inner.path).await?;
        }

        Ok(())
    }

    /// Releases the backing storage: removes the temporary file or drops the buffer.
    ///
    /// Calling this more than once has no further effect. Metadata stays available. If the
    /// temporary file cannot be removed the entry stays persisted, so a later `destroy` or the
    /// drop of the last handle can retry.
    pub async fn destroy(&self) -> Result<(), MultipartError> {
        let storage = self.inner.storage.replace(Storage::Released);

        if let Storage::Disk = storage {
            if let Err(err) = remove_file(&self.inner.path).await {
                self.inner.storage.replace(Storage::Disk);
                return Err(err.into());
            }
        }

        Ok(())
    }
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("field_name", &self.inner.field_name)
            .field("file_name", &self.inner.file_name)
            .field("mime_type", &self.inner.mime_type)
            .field("size", &self.inner.size)
            .field("storage", &*self.inner.storage.borrow())
            .finish()
    }
}

impl Drop for FileInner {
    fn drop(&mut self) {
        if let Storage::Disk = *self.storage.get_mut() {
            log::debug!("removing temp file of dropped entry: {:?}", self.path);
            let _ = fs::remove_file(&self.path);
        }
    }
}

async fn remove_file(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn read_file_stream(path: PathBuf) -> ContentStream {
    stream::try_unfold(None::<File>, move |file| {
        let path = path.clone();

        async move {
            let mut file = match file {
                Some(file) => file,
                None => File::open(&path).await?,
            };

            let mut buf = BytesMut::with_capacity(READ_CHUNK);

            if file.read_buf(&mut buf).await? == 0 {
                Ok(None)
            } else {
                Ok(Some((buf.freeze(), Some(file))))
            }
        }
    })
    .boxed_local()
}
