//! Memory to disk spooling of file parts.

use std::{fs, path::PathBuf};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt as _;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt as _,
};

use crate::{
    decoder::PartStream,
    entry::{FileEntry, FileMeta},
    error::MultipartError,
};

/// Turns one file part into a [`FileEntry`].
///
/// Chunks are buffered in memory while the total stays below `threshold`. The first chunk that
/// brings the total to `threshold` or above opens `dest`, flushes the buffer into it and every
/// later chunk is written straight to the file. A part truncated by the decoder's file size limit
/// fails with [`MultipartError::FileTooLarge`] and leaves nothing behind.
pub(crate) async fn spool(
    mut part: PartStream,
    meta: FileMeta,
    threshold: u64,
    dest: PathBuf,
) -> Result<FileEntry, MultipartError> {
    let mut buffered = Vec::<Bytes>::new();
    let mut size = 0u64;
    let mut disk: Option<(File, SpoolGuard)> = None;

    while let Some(chunk) = part.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;

        match disk {
            Some((ref mut file, _)) => file.write_all(&chunk).await?,

            None => {
                buffered.push(chunk);

                if size >= threshold {
                    log::trace!(
                        "spooling `{}` to {:?} after {size} bytes",
                        meta.field_name,
                        dest
                    );

                    let mut file = OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&dest)
                        .await?;
                    let guard = SpoolGuard::new(dest.clone());

                    for chunk in buffered.drain(..) {
                        file.write_all(&chunk).await?;
                    }

                    disk = Some((file, guard));
                }
            }
        }
    }

    if part.truncated() {
        log::debug!("file part `{}` exceeded the file size limit", meta.field_name);
        return Err(MultipartError::FileTooLarge);
    }

    match disk {
        None => Ok(FileEntry::in_memory(meta, concat(buffered), dest)),

        Some((mut file, guard)) => {
            file.flush().await?;
            drop(file);
            guard.disarm();

            Ok(FileEntry::persisted(meta, size, dest))
        }
    }
}

fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.remove(0),
        _ => {
            let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        }
    }
}

/// Removes a partially written spool file unless disarmed.
struct SpoolGuard {
    path: Option<PathBuf>,
}

impl SpoolGuard {
    fn new(path: PathBuf) -> Self {
        SpoolGuard { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        if let Some(ref path) = self.path {
            log::trace!("removing partial spool file {path:?}");
            let _ = fs::remove_file(path);
        }
    }
}
