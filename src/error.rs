//! Error and Result module

use std::io;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use derive_more::{Display, Error};
use serde::Serialize;

/// A set of errors that can occur while ingesting a multipart request.
///
/// Every variant maps to a response status and a stable [code](MultipartError::code). Only the
/// first error of a request is ever reported.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum MultipartError {
    /// The request contains more parts than allowed.
    #[display("reach parts limit")]
    PartsLimitExceeded,

    /// The request contains more file parts than allowed.
    #[display("reach files limit")]
    FilesLimitExceeded,

    /// The request contains more field parts than allowed.
    #[display("reach fields limit")]
    FieldsLimitExceeded,

    /// Raw bytes received exceeded the configured body limit.
    #[display("request is too large")]
    RequestTooLarge,

    /// A single file part exceeded its size limit.
    #[display("request file too large")]
    FileTooLarge,

    /// A part name collides with a reserved object property name.
    #[display("prototype property `{_0}` is not allowed as field name")]
    ReservedName(#[error(not(source))] String),

    /// A field declared as JSON by its Content-Type did not parse.
    #[display("field `{_0}` is not a valid JSON as declared by its Content-Type")]
    InvalidJsonField(#[error(not(source))] String),

    /// The request is not `multipart/form-data`.
    #[display("the request is not multipart")]
    NotMultipart,

    /// The multipart decoder rejected the payload.
    #[display("{_0}")]
    Decode(actix_multipart::MultipartError),

    /// A part ended before the decoder delivered all of it.
    #[display("multipart stream is incomplete")]
    Incomplete,

    /// Temporary storage failed.
    #[display("temporary file I/O error: {_0}")]
    Io(io::Error),

    /// Content was read from a file entry after it was destroyed.
    #[display("cannot read file after it has been destroyed")]
    Destroyed,
}

impl MultipartError {
    /// Stable machine readable code of this error.
    pub fn code(&self) -> &'static str {
        match self {
            MultipartError::PartsLimitExceeded => "FST_PARTS_LIMIT",
            MultipartError::FilesLimitExceeded => "FST_FILES_LIMIT",
            MultipartError::FieldsLimitExceeded => "FST_FIELDS_LIMIT",
            MultipartError::RequestTooLarge => "FST_REQ_TOO_LARGE",
            MultipartError::FileTooLarge => "FST_REQ_FILE_TOO_LARGE",
            MultipartError::ReservedName(_) => "FST_PROTO_VIOLATION",
            MultipartError::InvalidJsonField(_) => "FST_INVALID_JSON_FIELD_ERROR",
            MultipartError::NotMultipart => "FST_INVALID_MULTIPART_CONTENT_TYPE",
            MultipartError::Decode(_) => "FST_MALFORMED_MULTIPART",
            MultipartError::Incomplete => "FST_INCOMPLETE_MULTIPART",
            MultipartError::Io(_) => "FST_TEMP_FILE_IO",
            MultipartError::Destroyed => "FST_FILE_BUFFER_NOT_FOUND",
        }
    }
}

impl From<io::Error> for MultipartError {
    fn from(err: io::Error) -> Self {
        MultipartError::Io(err)
    }
}

impl From<actix_multipart::MultipartError> for MultipartError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        MultipartError::Decode(err)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    status_code: u16,
    code: &'a str,
    message: String,
}

impl ResponseError for MultipartError {
    fn status_code(&self) -> StatusCode {
        match self {
            MultipartError::PartsLimitExceeded
            | MultipartError::FilesLimitExceeded
            | MultipartError::FieldsLimitExceeded
            | MultipartError::RequestTooLarge
            | MultipartError::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,

            MultipartError::InvalidJsonField(_) | MultipartError::NotMultipart => {
                StatusCode::NOT_ACCEPTABLE
            }

            MultipartError::ReservedName(_)
            | MultipartError::Decode(_)
            | MultipartError::Incomplete => StatusCode::BAD_REQUEST,

            MultipartError::Io(_) | MultipartError::Destroyed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        HttpResponse::build(status).json(ErrorBody {
            status_code: status.as_u16(),
            code: self.code(),
            message: self.to_string(),
        })
    }
}

/// Error returned by [`parse_size`](crate::parse_size) for malformed size strings.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[display("invalid size format: {input:?}")]
pub struct SizeParseError {
    input: String,
}

impl SizeParseError {
    pub(crate) fn new(input: &str) -> Self {
        SizeParseError {
            input: input.to_owned(),
        }
    }
}

/// Errors produced while turning [`MultipartSettings`](crate::MultipartSettings) into a config.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A size option could not be parsed.
    #[display("{_0}")]
    Size(SizeParseError),

    /// A size option resolved to zero.
    #[display("`{_0}` must be a positive number or a valid size string")]
    NotPositive(#[error(not(source))] &'static str),

    /// The temporary directory is missing or could not be created.
    #[display("temporary directory is unavailable: {_0}")]
    TempDir(io::Error),
}

impl From<SizeParseError> for ConfigError {
    fn from(err: SizeParseError) -> Self {
        ConfigError::Size(err)
    }
}
