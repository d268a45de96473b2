//! Ingestion configuration.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use actix_web::{web, Error, HttpRequest};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::{
    error::{ConfigError, MultipartError},
    size::ByteSize,
    temp::TempStore,
};

const DEFAULT_BODY_LIMIT: u64 = 100 * 1024 * 1024; // 100 MiB
const DEFAULT_IN_MEMORY_LIMIT: u64 = 5 * 1024 * 1024; // 5 MiB

const DEFAULT_FIELD_SIZE: usize = 1024 * 1024; // 1 MiB
const DEFAULT_FIELD_NAME_SIZE: usize = 100;

type ErrorHandler = Arc<dyn Fn(MultipartError, &HttpRequest) -> Error + Send + Sync>;

/// Configuration for the [`MultipartBody`](crate::MultipartBody) extractor.
///
/// Register it with [`App::app_data`](actix_web::App::app_data), either directly or wrapped in
/// [`web::Data`]. Requests without a registered config use the defaults: a 100MiB body limit,
/// a 5MiB in-memory threshold and a fresh directory under the system temp dir.
///
/// Clones share the same temporary directory namespace. A directory created under the system temp
/// dir is removed when the last clone is dropped. The built-in default used when no config is
/// registered lives for the whole process, so its directory is left behind at exit; register a
/// config (or set [`temp_dir`](Self::temp_dir)) to control where uploads are spooled.
///
/// # Examples
/// ```
/// use actix_web::{App, web};
/// use actix_multipart_spool::{DecoderLimits, MultipartConfig};
///
/// let config = MultipartConfig::default()
///     .max_body_limit(10 * 1024 * 1024)
///     .max_in_memory_file_size(64 * 1024)
///     .limits(DecoderLimits::default().files(4));
///
/// let app = App::new().app_data(config);
/// ```
#[derive(Clone)]
pub struct MultipartConfig {
    pub(crate) body_limit: u64,
    pub(crate) in_memory_limit: u64,
    pub(crate) limits: DecoderLimits,
    temp_dir: Option<PathBuf>,
    auto_create_temp_dir: bool,
    pub(crate) temp: Arc<TempStore>,
    err_handler: Option<ErrorHandler>,
}

impl MultipartConfig {
    /// Sets the hard ceiling on raw bytes read from a request body.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn max_body_limit(mut self, limit: u64) -> Self {
        assert_ne!(limit, 0, "max body limit must be greater than 0");
        self.body_limit = limit;
        self
    }

    /// Sets the size at which a file part moves from memory to a temporary file.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn max_in_memory_file_size(mut self, limit: u64) -> Self {
        assert_ne!(limit, 0, "max in-memory file size must be greater than 0");
        self.in_memory_limit = limit;
        self
    }

    /// Sets the directory spooled files are written to.
    pub fn temp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.temp_dir = Some(dir.as_ref().to_owned());
        self.rebuild_store();
        self
    }

    /// Sets whether a missing [temp dir](Self::temp_dir) is created. Enabled by default.
    pub fn auto_create_temp_dir(mut self, auto_create: bool) -> Self {
        self.auto_create_temp_dir = auto_create;
        self.rebuild_store();
        self
    }

    /// Sets the part count and size limits applied while decoding.
    pub fn limits(mut self, limits: DecoderLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets custom error handler.
    pub fn error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(MultipartError, &HttpRequest) -> Error + Send + Sync + 'static,
    {
        self.err_handler = Some(Arc::new(f));
        self
    }

    /// Builds a config from deserialized settings.
    ///
    /// Unlike the builder methods, this validates the result: both sizes must be positive and the
    /// temp dir is resolved right away.
    pub fn from_settings(settings: MultipartSettings) -> Result<Self, ConfigError> {
        let mut config = MultipartConfig::default();

        if let Some(size) = settings.max_body_limit {
            config.body_limit = positive(size.as_bytes()?, "maxBodyLimit")?;
        }

        if let Some(size) = settings.max_in_memory_file_size {
            config.in_memory_limit = positive(size.as_bytes()?, "maxInMemoryFileSize")?;
        }

        config.limits = settings.limits;
        config.temp_dir = settings.temp_dir;
        config.auto_create_temp_dir = settings.auto_create_temp_dir.unwrap_or(true);
        config.rebuild_store();

        config.temp.dir().map_err(ConfigError::TempDir)?;

        Ok(config)
    }

    /// Returns the body size limit in bytes.
    pub fn body_limit(&self) -> u64 {
        self.body_limit
    }

    /// Returns the in-memory threshold in bytes.
    pub fn in_memory_limit(&self) -> u64 {
        self.in_memory_limit
    }

    /// Returns the directory spooled files are written to, creating it if needed.
    pub fn resolved_temp_dir(&self) -> Result<&Path, MultipartError> {
        Ok(self.temp.dir()?)
    }

    fn rebuild_store(&mut self) {
        self.temp = Arc::new(match self.temp_dir {
            Some(ref dir) => TempStore::configured(dir.clone(), self.auto_create_temp_dir),
            None => TempStore::system(),
        });
    }

    /// Extracts config from app data. Check both `T` and `Data<T>`, in that order, and fall back to
    /// the default config.
    pub(crate) fn from_req(req: &HttpRequest) -> &Self {
        req.app_data::<Self>()
            .or_else(|| req.app_data::<web::Data<Self>>().map(|d| d.as_ref()))
            .unwrap_or(&DEFAULT_CONFIG)
    }

    pub(crate) fn map_error(&self, req: &HttpRequest, err: MultipartError) -> Error {
        if let Some(ref err_handler) = self.err_handler {
            (err_handler)(err, req)
        } else {
            err.into()
        }
    }
}

fn positive(size: u64, option: &'static str) -> Result<u64, ConfigError> {
    if size == 0 {
        Err(ConfigError::NotPositive(option))
    } else {
        Ok(size)
    }
}

static DEFAULT_CONFIG: Lazy<MultipartConfig> = Lazy::new(MultipartConfig::default);

impl Default for MultipartConfig {
    fn default() -> Self {
        MultipartConfig {
            body_limit: DEFAULT_BODY_LIMIT,
            in_memory_limit: DEFAULT_IN_MEMORY_LIMIT,
            limits: DecoderLimits::default(),
            temp_dir: None,
            auto_create_temp_dir: true,
            temp: Arc::new(TempStore::system()),
            err_handler: None,
        }
    }
}

impl fmt::Debug for MultipartConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartConfig")
            .field("body_limit", &self.body_limit)
            .field("in_memory_limit", &self.in_memory_limit)
            .field("limits", &self.limits)
            .field("temp_dir", &self.temp_dir)
            .field("auto_create_temp_dir", &self.auto_create_temp_dir)
            .finish_non_exhaustive()
    }
}

/// Deserializable form of [`MultipartConfig`], e.g. a section of an application config file.
///
/// Sizes accept a byte count or a size string such as `"10MB"`.
///
/// ```
/// use actix_multipart_spool::{MultipartConfig, MultipartSettings};
///
/// let settings: MultipartSettings = serde_json::from_str(r#"{
///     "maxBodyLimit": "20MB",
///     "maxInMemoryFileSize": 65536,
///     "limits": { "files": 3 }
/// }"#).unwrap();
///
/// let config = MultipartConfig::from_settings(settings).unwrap();
/// assert_eq!(config.body_limit(), 20 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultipartSettings {
    pub max_body_limit: Option<ByteSize>,
    pub max_in_memory_file_size: Option<ByteSize>,
    pub temp_dir: Option<PathBuf>,
    pub auto_create_temp_dir: Option<bool>,
    pub limits: DecoderLimits,
}

/// Limits enforced by the decoder.
///
/// Count limits are unset by default. When one is exceeded the request fails with the matching
/// `*LimitExceeded` error. Field names and values longer than their size limit are truncated and
/// flagged on the [`FieldEntry`](crate::FieldEntry). A file part longer than the file size limit
/// fails the request with [`FileTooLarge`](MultipartError::FileTooLarge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecoderLimits {
    pub(crate) parts: Option<usize>,
    pub(crate) files: Option<usize>,
    pub(crate) fields: Option<usize>,
    pub(crate) field_size: usize,
    pub(crate) field_name_size: usize,
    pub(crate) file_size: Option<u64>,
}

impl DecoderLimits {
    /// Sets the maximum number of parts.
    pub fn parts(mut self, max: usize) -> Self {
        self.parts = Some(max);
        self
    }

    /// Sets the maximum number of file parts.
    pub fn files(mut self, max: usize) -> Self {
        self.files = Some(max);
        self
    }

    /// Sets the maximum number of non-file parts.
    pub fn fields(mut self, max: usize) -> Self {
        self.fields = Some(max);
        self
    }

    /// Sets the maximum field value size in bytes. Default is 1MiB.
    pub fn field_size(mut self, max: usize) -> Self {
        self.field_size = max;
        self
    }

    /// Sets the maximum field name size in bytes. Default is 100.
    pub fn field_name_size(mut self, max: usize) -> Self {
        self.field_name_size = max;
        self
    }

    /// Sets the maximum size of a single file part in bytes.
    pub fn file_size(mut self, max: u64) -> Self {
        self.file_size = Some(max);
        self
    }
}

impl Default for DecoderLimits {
    fn default() -> Self {
        DecoderLimits {
            parts: None,
            files: None,
            fields: None,
            field_size: DEFAULT_FIELD_SIZE,
            field_name_size: DEFAULT_FIELD_NAME_SIZE,
            file_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::TestRequest;

    use super::*;

    fn settings(json: &str) -> MultipartSettings {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn defaults() {
        let config = MultipartConfig::default();
        assert_eq!(config.body_limit(), 100 * 1024 * 1024);
        assert_eq!(config.in_memory_limit(), 5 * 1024 * 1024);
        assert_eq!(config.limits, DecoderLimits::default());
        assert_eq!(config.limits.field_size, 1024 * 1024);
        assert_eq!(config.limits.field_name_size, 100);
    }

    #[test]
    fn from_settings_parses_sizes() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("uploads");

        let config = MultipartConfig::from_settings(settings(&format!(
            r#"{{
                "maxBodyLimit": "1MB",
                "maxInMemoryFileSize": 2048,
                "tempDir": {:?},
                "limits": {{ "parts": 10, "fileSize": 4096 }}
            }}"#,
            dir.to_str().unwrap()
        )))
        .unwrap();

        assert_eq!(config.body_limit(), 1024 * 1024);
        assert_eq!(config.in_memory_limit(), 2048);
        assert_eq!(config.limits.parts, Some(10));
        assert_eq!(config.limits.file_size, Some(4096));
        assert_eq!(config.limits.field_size, 1024 * 1024);

        // created eagerly
        assert!(dir.is_dir());
        assert_eq!(config.resolved_temp_dir().unwrap(), dir);
    }

    #[test]
    fn from_settings_rejects_bad_values() {
        let err = MultipartConfig::from_settings(settings(r#"{ "maxBodyLimit": "ten" }"#))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Size(_)));

        let err = MultipartConfig::from_settings(settings(r#"{ "maxInMemoryFileSize": 0 }"#))
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive("maxInMemoryFileSize")));

        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing");
        let err = MultipartConfig::from_settings(MultipartSettings {
            temp_dir: Some(missing.clone()),
            auto_create_temp_dir: Some(false),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::TempDir(_)));
        assert!(!missing.exists());
    }

    #[test]
    fn last_clone_removes_system_dir() {
        let config = MultipartConfig::default();
        let clone = config.clone();
        let dir = config.resolved_temp_dir().unwrap().to_owned();
        assert!(dir.is_dir());

        drop(config);
        assert!(dir.is_dir());

        drop(clone);
        assert!(!dir.exists());
    }

    #[test]
    #[should_panic(expected = "max body limit must be greater than 0")]
    fn zero_body_limit() {
        let _ = MultipartConfig::default().max_body_limit(0);
    }

    #[test]
    #[should_panic(expected = "max in-memory file size must be greater than 0")]
    fn zero_in_memory_limit() {
        let _ = MultipartConfig::default().max_in_memory_file_size(0);
    }

    #[test]
    fn builder_keeps_dir_options_together() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("later");

        let config = MultipartConfig::default()
            .auto_create_temp_dir(false)
            .temp_dir(&dir);
        assert!(config.resolved_temp_dir().is_err());

        let config = config.auto_create_temp_dir(true);
        assert_eq!(config.resolved_temp_dir().unwrap(), dir);
    }

    #[test]
    fn lookup_from_app_data() {
        let req = TestRequest::default()
            .app_data(MultipartConfig::default().max_body_limit(7))
            .to_http_request();
        assert_eq!(MultipartConfig::from_req(&req).body_limit(), 7);

        let req = TestRequest::default()
            .app_data(web::Data::new(MultipartConfig::default().max_body_limit(9)))
            .to_http_request();
        assert_eq!(MultipartConfig::from_req(&req).body_limit(), 9);

        let req = TestRequest::default().to_http_request();
        assert_eq!(
            MultipartConfig::from_req(&req).body_limit(),
            DEFAULT_BODY_LIMIT
        );
    }
}
