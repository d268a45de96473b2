//! Temporary file namespace for spooled parts.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use once_cell::sync::OnceCell;
use rand::distributions::{Alphanumeric, DistString as _};
use tempfile::TempDir;

const DIR_PREFIX: &str = "actix-multipart-";

/// Hands out collision-resistant file paths inside one directory.
///
/// The directory is resolved on first use. Names combine a process-wide counter with a random
/// suffix, so restarting the process with the same directory does not reuse names.
#[derive(Debug)]
pub(crate) struct TempStore {
    location: Location,
    resolved: OnceCell<Resolved>,
    counter: AtomicU64,
}

#[derive(Debug)]
enum Location {
    /// A fresh directory under the system temp dir, removed when the store is dropped.
    System,

    /// A caller supplied directory.
    Configured { path: PathBuf, auto_create: bool },
}

#[derive(Debug)]
struct Resolved {
    path: PathBuf,
    _guard: Option<TempDir>,
}

impl TempStore {
    pub(crate) fn system() -> Self {
        TempStore::with_location(Location::System)
    }

    pub(crate) fn configured(path: PathBuf, auto_create: bool) -> Self {
        TempStore::with_location(Location::Configured { path, auto_create })
    }

    fn with_location(location: Location) -> Self {
        TempStore {
            location,
            resolved: OnceCell::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the directory, creating it if needed.
    pub(crate) fn dir(&self) -> io::Result<&Path> {
        let resolved = self.resolved.get_or_try_init(|| match self.location {
            Location::System => {
                let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir()?;
                log::debug!("created temp dir for multipart uploads: {:?}", dir.path());

                Ok::<_, io::Error>(Resolved {
                    path: dir.path().to_owned(),
                    _guard: Some(dir),
                })
            }

            Location::Configured {
                ref path,
                auto_create,
            } => {
                match fs::metadata(path) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            format!("{} is not a directory", path.display()),
                        ))
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound && auto_create => {
                        fs::create_dir_all(path)?;
                        log::debug!("created temp dir for multipart uploads: {path:?}");
                    }
                    Err(err) => return Err(err),
                }

                Ok(Resolved {
                    path: path.clone(),
                    _guard: None,
                })
            }
        })?;

        Ok(&resolved.path)
    }

    /// Reserves a new unique path. The file itself is not created.
    pub(crate) fn next_path(&self) -> io::Result<PathBuf> {
        let dir = self.dir()?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let tag = Alphanumeric.sample_string(&mut rand::thread_rng(), 12);

        Ok(dir.join(format!("{n:x}-{tag}.part")))
    }
}
