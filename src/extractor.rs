//! Request extractors.

use actix_utils::future::{ready, Ready};
use actix_web::{dev::Payload, Error, FromRequest, HttpMessage as _, HttpRequest};
use futures_core::future::LocalBoxFuture;

use crate::{
    body::MultipartBody, config::MultipartConfig, error::MultipartError, ingest::MultipartContext,
};

/// Returns the request's context, creating and attaching one if the cleanup middleware is absent.
fn context(req: &HttpRequest) -> MultipartContext {
    if let Some(ctx) = req.extensions().get::<MultipartContext>() {
        return ctx.clone();
    }

    let ctx = MultipartContext::new();
    req.extensions_mut().insert(ctx.clone());
    ctx
}

fn is_form_data(req: &HttpRequest) -> bool {
    matches!(
        req.mime_type(),
        Ok(Some(ref mime)) if mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA
    )
}

/// Extracts the parsed `multipart/form-data` body.
///
/// Limits and storage are taken from the [`MultipartConfig`] in app data. Requests with any other
/// Content-Type are rejected with [`MultipartError::NotMultipart`].
///
/// Wrap the app in [`MultipartCleanup`](crate::MultipartCleanup) so temporary files are removed
/// once the response has been sent.
///
/// # Examples
/// ```
/// use actix_web::{post, App, HttpResponse};
/// use actix_multipart_spool::{MultipartBody, MultipartCleanup};
///
/// #[post("/upload")]
/// async fn upload(body: MultipartBody) -> HttpResponse {
///     match body.file("avatar") {
///         Some(file) => HttpResponse::Ok().body(format!("{} bytes", file.size())),
///         None => HttpResponse::BadRequest().finish(),
///     }
/// }
///
/// let app = App::new().wrap(MultipartCleanup).service(upload);
/// ```
impl FromRequest for MultipartBody {
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let config = MultipartConfig::from_req(req).clone();

        if !is_form_data(req) {
            let err = config.map_error(req, MultipartError::NotMultipart);
            return Box::pin(ready(Err(err)));
        }

        let ctx = context(req);
        if !req.extensions().contains::<CleanupInstalled>() {
            log::warn!(
                "MultipartCleanup middleware is not installed; temp files are only removed when \
                their entries are dropped"
            );
        }

        let req = req.clone();
        let payload = payload.take();

        Box::pin(async move {
            ctx.ingest(&config, req.headers(), payload)
                .await
                .map_err(|err| config.map_error(&req, err))
        })
    }
}

/// Marker placed in request extensions by the cleanup middleware.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CleanupInstalled;

/// Gives handlers access to the per-request [`MultipartContext`].
///
/// The context holds the complete entry sequence, including duplicates that the
/// [`MultipartBody`] mapping collapses.
impl FromRequest for MultipartContext {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    #[inline]
    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Ok(context(req)))
    }
}
