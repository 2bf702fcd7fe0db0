//! Runs the work a connection dispatches: mount targets and protocol callbacks.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use tracing::{debug, warn};

use crate::connection::{Completion, Dispatch, Route};
use crate::handler::ConnInfo;
use crate::protocol::status_response;
use crate::vhost::CachePolicy;

use super::{Shared, cgi};

const DEFAULT_DOCUMENT: &str = "index.html";

pub(crate) fn run(shared: Rc<Shared>, work: Dispatch) -> LocalBoxFuture<'static, Completion> {
    async move {
        match work {
            Dispatch::Http { stream, request, route, info } => {
                let response = respond(&shared, request, route, &info).await;
                Completion::Http { stream, response }
            }
            Dispatch::WsMessage { handler, message, info } => {
                Completion::Ws(handler.on_ws_message(&info, message).await.map_err(|e| e.to_string()))
            }
            Dispatch::Raw { handler, data, info } => Completion::Raw(handler.on_raw(&info, data).await.map_err(|e| e.to_string())),
        }
    }
    .boxed_local()
}

async fn respond(shared: &Shared, request: Request<Bytes>, route: Route, info: &ConnInfo) -> Response<Bytes> {
    match route {
        Route::Callback { handler } => match handler.on_http(info, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(conn = %info.id, handler = handler.name(), cause = %e, "http callback failed");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        },
        Route::File { root, relative, default_document, cache } => {
            serve_file(request.method(), &root, &relative, default_document.as_deref(), &cache).await
        }
        Route::Cgi { program, script_name, path_info } => {
            match cgi::run(shared, &program, &script_name, &path_info, request, info).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(conn = %info.id, program = %program.display(), cause = %e, "cgi failed");
                    status_response(e.status())
                }
            }
        }
        Route::Redirect { location } => redirect(&location),
        Route::NotFound => status_response(StatusCode::NOT_FOUND),
    }
}

fn redirect(location: &str) -> Response<Bytes> {
    let mut response = status_response(StatusCode::MOVED_PERMANENTLY);
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Serves `relative` below `root`, falling back to the default document for directories.
pub(crate) async fn serve_file(
    method: &Method,
    root: &Path,
    relative: &str,
    default_document: Option<&str>,
    cache: &CachePolicy,
) -> Response<Bytes> {
    if method != Method::GET && method != Method::HEAD {
        let mut response = status_response(StatusCode::METHOD_NOT_ALLOWED);
        response.headers_mut().insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let Some(mut path) = resolve(root, relative) else {
        debug!(relative, "refusing path outside the mount");
        return status_response(StatusCode::FORBIDDEN);
    };
    if relative.is_empty() || relative.ends_with('/') || is_dir(&path).await {
        path.push(default_document.unwrap_or(DEFAULT_DOCUMENT));
    }

    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return status_response(StatusCode::NOT_FOUND),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return status_response(StatusCode::FORBIDDEN),
        Err(e) => {
            warn!(path = %path.display(), cause = %e, "can't read file");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut builder = Response::builder().status(StatusCode::OK).header(header::CONTENT_TYPE, mime.as_ref());
    if let Some(value) = cache.header_value() {
        builder = builder.header(header::CACHE_CONTROL, value);
    }
    builder.body(Bytes::from(contents)).unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Joins `relative` onto `root`, refusing anything but plain path segments.
fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(segment) => path.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|meta| meta.is_dir())
}
