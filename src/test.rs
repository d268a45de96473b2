//! Multipart testing utilities.

use actix_web::{
    http::{
        header::{self, HeaderMap, HeaderValue},
        Method,
    },
    test::TestRequest,
    web::{BufMut as _, Bytes, BytesMut},
};
use mime::Mime;
use rand::{
    distributions::{Alphanumeric, DistString as _},
    RngCore as _,
};

const CRLF: &[u8] = b"\r\n";
const CRLF_CRLF: &[u8] = b"\r\n\r\n";
const HYPHENS: &[u8] = b"--";
const BOUNDARY_PREFIX: &str = "------------------------";

/// Builds `multipart/form-data` payloads.
///
/// # Examples
/// ```
/// use actix_multipart_spool::test::FormBuilder;
///
/// let (body, headers) = FormBuilder::new()
///     .text("title", "holiday")
///     .file("photo", "beach.jpg", mime::IMAGE_JPEG, vec![0xff, 0xd8, 0xff])
///     .finish();
///
/// assert!(headers
///     .get("content-type")
///     .unwrap()
///     .to_str()
///     .unwrap()
///     .starts_with("multipart/form-data; boundary="));
/// assert!(body.len() > 3);
/// ```
#[derive(Debug)]
pub struct FormBuilder {
    boundary: String,
    buf: BytesMut,
}

impl FormBuilder {
    /// Creates a builder with a random alphanumeric boundary.
    pub fn new() -> Self {
        let boundary = Alphanumeric.sample_string(&mut rand::thread_rng(), 32);
        FormBuilder::with_boundary(&boundary)
    }

    /// Creates a builder with a fixed boundary.
    pub fn with_boundary(boundary: &str) -> Self {
        FormBuilder {
            boundary: [BOUNDARY_PREFIX, boundary].concat(),
            buf: BytesMut::new(),
        }
    }

    /// Adds a field part without a Content-Type.
    pub fn text(self, name: &str, value: impl Into<Bytes>) -> Self {
        self.part(name, None, None, value.into())
    }

    /// Adds a field part with the given Content-Type.
    pub fn typed_text(self, name: &str, content_type: Mime, value: impl Into<Bytes>) -> Self {
        self.part(name, None, Some(content_type), value.into())
    }

    /// Adds a file part.
    pub fn file(
        self,
        name: &str,
        file_name: &str,
        content_type: Mime,
        data: impl Into<Bytes>,
    ) -> Self {
        self.part(name, Some(file_name), Some(content_type), data.into())
    }

    fn part(
        mut self,
        name: &str,
        file_name: Option<&str>,
        content_type: Option<Mime>,
        data: Bytes,
    ) -> Self {
        let buf = &mut self.buf;

        buf.put(HYPHENS);
        buf.put(self.boundary.as_bytes());
        buf.put(CRLF);

        buf.put(format!("Content-Disposition: form-data; name=\"{name}\"").as_bytes());
        if let Some(file_name) = file_name {
            buf.put(format!("; filename=\"{file_name}\"").as_bytes());
        }
        buf.put(CRLF);

        if let Some(ct) = content_type {
            buf.put(format!("Content-Type: {ct}").as_bytes());
            buf.put(CRLF);
        }

        buf.put(format!("Content-Length: {}", data.len()).as_bytes());
        buf.put(CRLF_CRLF);

        buf.put(data);
        buf.put(CRLF);

        self
    }

    /// Closes the payload and returns it along with its Content-Type header.
    pub fn finish(mut self) -> (Bytes, HeaderMap) {
        self.buf.put(HYPHENS);
        self.buf.put(self.boundary.as_bytes());
        self.buf.put(HYPHENS);
        self.buf.put(CRLF);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!(
                "multipart/form-data; boundary=\"{}\"",
                self.boundary
            ))
            .unwrap(),
        );

        (self.buf.freeze(), headers)
    }

    /// Closes the payload and wraps it in a `POST` [`TestRequest`].
    pub fn into_request(self) -> TestRequest {
        let (body, headers) = self.finish();

        headers
            .into_iter()
            .fold(TestRequest::default().method(Method::POST), |req, hdr| {
                req.insert_header(hdr)
            })
            .set_payload(body)
    }
}

impl Default for FormBuilder {
    fn default() -> Self {
        FormBuilder::new()
    }
}

/// Returns `len` random bytes.
pub fn random_bytes(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_layout() {
        let (body, headers) = FormBuilder::with_boundary("abc")
            .text("a", "1")
            .file("f", "f.txt", mime::TEXT_PLAIN, "hi")
            .finish();

        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "multipart/form-data; boundary=\"------------------------abc\""
        );
        assert_eq!(
            body,
            Bytes::from_static(
                b"--------------------------abc\r\n\
                Content-Disposition: form-data; name=\"a\"\r\n\
                Content-Length: 1\r\n\r\n\
                1\r\n\
                --------------------------abc\r\n\
                Content-Disposition: form-data; name=\"f\"; filename=\"f.txt\"\r\n\
                Content-Type: text/plain\r\n\
                Content-Length: 2\r\n\r\n\
                hi\r\n\
                --------------------------abc--\r\n"
            )
        );
    }

    #[test]
    fn random_boundaries_differ() {
        let (_, a) = FormBuilder::new().finish();
        let (_, b) = FormBuilder::new().finish();
        assert_ne!(a.get(header::CONTENT_TYPE), b.get(header::CONTENT_TYPE));
    }

    #[test]
    fn random_bytes_len() {
        assert_eq!(random_bytes(0).len(), 0);
        assert_eq!(random_bytes(1000).len(), 1000);
    }
}
