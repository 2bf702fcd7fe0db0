//! CGI/1.1 mounts.
//!
//! Each request runs the mounted program once with a cleared environment holding the CGI
//! meta-variables. The request body goes to the child's stdin; its stdout is a CGI response:
//! header lines (`Status`, `Location` and ordinary headers), a blank line, then the body.
//! Children are killed when the deadline passes or the connection goes away.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::trace;

use crate::ensure;
use crate::handler::ConnInfo;

use super::Shared;

const SERVER_SOFTWARE: &str = concat!("micro-mux/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub(crate) enum CgiError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("io error talking to the child: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("no response within {after:?}")]
    Timeout { after: Duration },

    #[error("malformed output: {reason}")]
    MalformedOutput { reason: String },

    #[error("output exceeds {limit} bytes")]
    OutputTooLarge { limit: usize },
}

impl CgiError {
    fn malformed<S: ToString>(str: S) -> Self {
        Self::MalformedOutput { reason: str.to_string() }
    }

    /// Status answered to the client when the program fails.
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            CgiError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CgiError::MalformedOutput { .. } | CgiError::OutputTooLarge { .. } => StatusCode::BAD_GATEWAY,
            CgiError::Spawn { .. } | CgiError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Keeps the thread's live child count while a child runs.
struct Alive<'a>(&'a Shared);

impl<'a> Alive<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.cgi_started();
        Self(shared)
    }
}

impl Drop for Alive<'_> {
    fn drop(&mut self) {
        self.0.cgi_finished();
    }
}

pub(crate) async fn run(
    shared: &Shared,
    program: &Path,
    script_name: &str,
    path_info: &str,
    request: Request<Bytes>,
    info: &ConnInfo,
) -> Result<Response<Bytes>, CgiError> {
    let vars = environment(script_name, path_info, &request, info);
    let body = request.into_body();

    let mut command = Command::new(program);
    command.env_clear().envs(vars).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::inherit()).kill_on_drop(true);
    if let Ok(path) = std::env::var("PATH") {
        command.env("PATH", path);
    }
    if let Some(dir) = program.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command.current_dir(dir);
    }
    let mut child = command.spawn().map_err(|source| CgiError::Spawn { program: program.display().to_string(), source })?;
    let _alive = Alive::new(shared);
    trace!(conn = %info.id, program = %program.display(), pid = ?child.id(), "cgi started");

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let after = shared.env.config.timeouts.cgi;
    let limit = shared.env.config.max_cgi_output_bytes;
    let exchange = async {
        let feed = async {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&body).await {
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(CgiError::from(e)),
                    _ => {}
                }
            }
            Ok(())
        };
        let collect = async {
            match stdout {
                Some(stdout) => collect(stdout, limit).await,
                None => Ok(Vec::new()),
            }
        };
        let ((), out) = tokio::try_join!(feed, collect)?;
        let status = child.wait().await?;
        Ok::<_, CgiError>((status, out))
    };

    let (status, out) = tokio::time::timeout(after, exchange).await.map_err(|_elapsed| CgiError::Timeout { after })??;
    trace!(conn = %info.id, %status, len = out.len(), "cgi exited");
    parse_output(&out)
}

/// Reads the child's stdout to the end, refusing more than `limit` bytes.
async fn collect<R: AsyncRead + Unpin>(stdout: R, limit: usize) -> Result<Vec<u8>, CgiError> {
    let mut out = Vec::new();
    stdout.take(limit as u64 + 1).read_to_end(&mut out).await?;
    ensure!(out.len() <= limit, CgiError::OutputTooLarge { limit });
    Ok(out)
}

/// CGI/1.1 meta-variables for one request.
pub(crate) fn environment(script_name: &str, path_info: &str, request: &Request<Bytes>, info: &ConnInfo) -> Vec<(String, String)> {
    let protocol = match request.version() {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    };
    let uri = request.uri();
    let mut vars = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("SERVER_PROTOCOL".to_string(), protocol.to_string()),
        ("SERVER_NAME".to_string(), info.vhost.to_string()),
        ("SERVER_PORT".to_string(), info.port.to_string()),
        ("REQUEST_METHOD".to_string(), request.method().to_string()),
        ("REQUEST_URI".to_string(), uri.path_and_query().map_or_else(|| uri.path().to_string(), ToString::to_string)),
        ("SCRIPT_NAME".to_string(), script_name.to_string()),
        ("PATH_INFO".to_string(), path_info.to_string()),
        ("QUERY_STRING".to_string(), uri.query().unwrap_or_default().to_string()),
        ("REMOTE_ADDR".to_string(), info.peer.ip().to_string()),
        ("REMOTE_PORT".to_string(), info.peer.port().to_string()),
    ];
    if !request.body().is_empty() {
        vars.push(("CONTENT_LENGTH".to_string(), request.body().len().to_string()));
    }
    if let Some(value) = request.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        vars.push(("CONTENT_TYPE".to_string(), value.to_string()));
    }

    for (name, value) in request.headers() {
        if name == CONTENT_TYPE || name == CONTENT_LENGTH {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        match vars.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, joined)) => {
                joined.push_str(", ");
                joined.push_str(value);
            }
            None => vars.push((key, value.to_string())),
        }
    }
    vars
}

/// Turns CGI program output into a response.
pub(crate) fn parse_output(out: &[u8]) -> Result<Response<Bytes>, CgiError> {
    let (head_len, sep_len) = header_end(out).ok_or_else(|| CgiError::malformed("no blank line after the headers"))?;
    let head = std::str::from_utf8(&out[..head_len]).map_err(|_utf8| CgiError::malformed("headers are not utf-8"))?;

    let mut response = Response::new(Bytes::copy_from_slice(&out[head_len + sep_len..]));
    let mut status = None;
    let mut redirected = false;
    for line in head.split('\n').map(|line| line.trim_end_matches('\r')).filter(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(|| CgiError::malformed(format!("header line {line:?}")))?;
        let (name, value) = (name.trim(), value.trim());

        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or_default();
            let code = code.parse::<u16>().ok().and_then(|code| StatusCode::from_u16(code).ok());
            status = Some(code.ok_or_else(|| CgiError::malformed(format!("status {value:?}")))?);
            continue;
        }
        if name.eq_ignore_ascii_case(LOCATION.as_str()) {
            redirected = true;
        }
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(CgiError::malformed)?;
        let value = HeaderValue::from_str(value).map_err(CgiError::malformed)?;
        response.headers_mut().append(name, value);
    }

    *response.status_mut() = match status {
        Some(status) => status,
        None if redirected => StatusCode::FOUND,
        None => StatusCode::OK,
    };
    Ok(response)
}

/// Length of the header block and of the separator ending it.
fn header_end(out: &[u8]) -> Option<(usize, usize)> {
    let crlf = out.windows(4).position(|w| w == b"\r\n\r\n").map(|at| (at, 4));
    let lf = out.windows(2).position(|w| w == b"\n\n").map(|at| (at, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::Method;

    use super::*;
    use crate::connection::ConnId;

    fn info() -> ConnInfo {
        ConnInfo { id: ConnId::new(3), thread: 0, peer: "10.0.0.7:41000".parse().unwrap(), vhost: Arc::from("example"), port: 8080 }
    }

    fn lookup<'a>(vars: &'a [(String, String)], key: &str) -> Option<&'a str> {
        vars.iter().find(|(name, _)| name == key).map(|(_, value)| value.as_str())
    }

    #[tokio::test]
    async fn output_is_capped() {
        let out = collect(&b"Status: 200\r\n\r\nfits"[..], 64).await.unwrap();
        assert_eq!(out.len(), 19);

        let flood = vec![b'x'; 4096];
        let e = collect(&flood[..], 1024).await.unwrap_err();
        assert!(matches!(e, CgiError::OutputTooLarge { limit: 1024 }));
        assert_eq!(e.status(), StatusCode::BAD_GATEWAY);

        let exact = vec![b'x'; 1024];
        assert_eq!(collect(&exact[..], 1024).await.unwrap().len(), 1024);
    }

    #[test]
    fn environment_carries_request_meta_variables() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/cgi/form.sh/extra?a=1&b=2")
            .header("content-type", "application/x-www-form-urlencoded")
            .header("x-trace", "one")
            .header("x-trace", "two")
            .body(Bytes::from_static(b"name=value"))
            .unwrap();
        let vars = environment("/cgi", "/form.sh/extra", &request, &info());

        assert_eq!(lookup(&vars, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(lookup(&vars, "REQUEST_METHOD"), Some("POST"));
        assert_eq!(lookup(&vars, "SCRIPT_NAME"), Some("/cgi"));
        assert_eq!(lookup(&vars, "PATH_INFO"), Some("/form.sh/extra"));
        assert_eq!(lookup(&vars, "QUERY_STRING"), Some("a=1&b=2"));
        assert_eq!(lookup(&vars, "REQUEST_URI"), Some("/cgi/form.sh/extra?a=1&b=2"));
        assert_eq!(lookup(&vars, "SERVER_NAME"), Some("example"));
        assert_eq!(lookup(&vars, "SERVER_PORT"), Some("8080"));
        assert_eq!(lookup(&vars, "REMOTE_ADDR"), Some("10.0.0.7"));
        assert_eq!(lookup(&vars, "CONTENT_LENGTH"), Some("10"));
        assert_eq!(lookup(&vars, "CONTENT_TYPE"), Some("application/x-www-form-urlencoded"));
        assert_eq!(lookup(&vars, "HTTP_X_TRACE"), Some("one, two"));
        assert_eq!(lookup(&vars, "HTTP_CONTENT_TYPE"), None);
    }

    #[test]
    fn parses_status_headers_and_body() {
        let response = parse_output(b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\nmade it").unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(response.body(), &Bytes::from_static(b"made it"));
    }

    #[test]
    fn bare_newlines_and_default_status() {
        let response = parse_output(b"Content-Type: text/html\n\n<p>hi</p>\n").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"<p>hi</p>\n"));
    }

    #[test]
    fn location_without_status_redirects() {
        let response = parse_output(b"Location: /elsewhere\n\n").unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/elsewhere");
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(matches!(parse_output(b"Content-Type: text/plain\r\n"), Err(CgiError::MalformedOutput { .. })));
        assert!(matches!(parse_output(b"no colon here\n\nbody"), Err(CgiError::MalformedOutput { .. })));
        assert!(matches!(parse_output(b"Status: abc\n\n"), Err(CgiError::MalformedOutput { .. })));
        assert_eq!(parse_output(b"Status: x\n\n").unwrap_err().status(), StatusCode::BAD_GATEWAY);
    }
}
