//! For middleware documentation, see [`MultipartCleanup`].

use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use actix_utils::future::{ready, Ready};
use actix_web::{
    body::{BodySize, MessageBody},
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage as _,
};
use bytes::Bytes;
use futures_core::ready;
use pin_project_lite::pin_project;

use crate::{extractor::CleanupInstalled, ingest::MultipartContext};

/// Middleware that releases the file entries of a multipart request once its response is done.
///
/// A [`MultipartContext`] is attached to every request. When the response body has been sent (or
/// dropped, e.g. on a disconnect) the context's file entries are destroyed on a background task,
/// whatever the outcome of the handler. Requests that never read a multipart body cost one
/// allocation.
///
/// # Examples
/// ```
/// use actix_web::{web, App, HttpResponse};
/// use actix_multipart_spool::{MultipartBody, MultipartCleanup};
///
/// async fn upload(body: MultipartBody) -> HttpResponse {
///     HttpResponse::Ok().body(format!("{} parts", body.len()))
/// }
///
/// let app = App::new()
///     .wrap(MultipartCleanup)
///     .route("/upload", web::post().to(upload));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartCleanup;

impl<S, B> Transform<S, ServiceRequest> for MultipartCleanup
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<CleanupBody<B>>;
    type Error = Error;
    type Transform = MultipartCleanupMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MultipartCleanupMiddleware { service }))
    }
}

/// Multipart cleanup middleware service.
pub struct MultipartCleanupMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MultipartCleanupMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<CleanupBody<B>>;
    type Error = Error;
    type Future = CleanupResponse<S, B>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let ctx = MultipartContext::new();

        {
            let mut ext = req.extensions_mut();
            ext.insert(ctx.clone());
            ext.insert(CleanupInstalled);
        }

        CleanupResponse {
            fut: self.service.call(req),
            ctx: Some(ctx),
            _phantom: PhantomData,
        }
    }
}

pin_project! {
    pub struct CleanupResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        ctx: Option<MultipartContext>,
        _phantom: PhantomData<B>,
    }
}

impl<S, B> Future for CleanupResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<CleanupBody<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let res = match ready!(this.fut.poll(cx)) {
            Ok(res) => res,
            Err(err) => {
                if let Some(ctx) = this.ctx.take() {
                    spawn_release(ctx);
                }

                return Poll::Ready(Err(err));
            }
        };

        let ctx = this.ctx.take();

        Poll::Ready(Ok(res.map_body(move |_, body| CleanupBody { body, ctx })))
    }
}

fn spawn_release(ctx: MultipartContext) {
    if !ctx.is_multipart() {
        return;
    }

    actix_web::rt::spawn(async move {
        ctx.release().await;
    });
}

pin_project! {
    /// Response body wrapper that releases the request's file entries when dropped.
    pub struct CleanupBody<B> {
        #[pin]
        body: B,
        ctx: Option<MultipartContext>,
    }

    impl<B> PinnedDrop for CleanupBody<B> {
        fn drop(this: Pin<&mut Self>) {
            if let Some(ctx) = this.project().ctx.take() {
                spawn_release(ctx);
            }
        }
    }
}

impl<B: MessageBody> MessageBody for CleanupBody<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        self.project().body.poll_next(cx)
    }
}
