//! Spooling `multipart/form-data` ingestion for Actix Web.
//!
//! The [`MultipartBody`] extractor decodes a form into fields and files. Field values are kept as
//! text, or as parsed JSON when the part declares a JSON Content-Type. Files stay in memory while
//! small and are spooled to a temporary file once they reach the configured threshold, so large
//! uploads never sit in memory in full.
//!
//! The total body size is watched independently of the decoder. The first failure of a request
//! (a limit, a reserved part name, an invalid JSON field, an I/O error) is the one reported.
//! Temporary files are removed by the [`MultipartCleanup`] middleware once the response has been
//! sent.
//!
//! # Examples
//! ```no_run
//! use actix_web::{post, App, HttpResponse, HttpServer};
//! use actix_multipart_spool::{MultipartBody, MultipartCleanup, MultipartConfig};
//!
//! #[post("/upload")]
//! async fn upload(body: MultipartBody) -> actix_web::Result<HttpResponse> {
//!     let title = body.text("title").unwrap_or("untitled");
//!
//!     let size = match body.file("document") {
//!         Some(file) => file.to_bytes().await?.len(),
//!         None => 0,
//!     };
//!
//!     Ok(HttpResponse::Ok().body(format!("{title}: {size} bytes")))
//! }
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = MultipartConfig::default()
//!         .max_body_limit(20 * 1024 * 1024)
//!         .max_in_memory_file_size(256 * 1024);
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .app_data(config.clone())
//!             .wrap(MultipartCleanup)
//!             .service(upload)
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(future_incompatible)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod body;
mod config;
mod decoder;
mod entry;
mod error;
mod extractor;
mod ingest;
mod json;
mod middleware;
mod size;
mod spool;
mod temp;
pub mod test;
mod watchdog;

pub use self::body::{BodyValue, MultipartBody};
pub use self::config::{DecoderLimits, MultipartConfig, MultipartSettings};
pub use self::decoder::RESERVED_NAMES;
pub use self::entry::{ContentStream, Entry, FieldEntry, FieldValue, FileEntry};
pub use self::error::{ConfigError, MultipartError, SizeParseError};
pub use self::ingest::MultipartContext;
pub use self::json::is_json_mime;
pub use self::middleware::{CleanupBody, MultipartCleanup, MultipartCleanupMiddleware};
pub use self::size::{parse_size, ByteSize};
