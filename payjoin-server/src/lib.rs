use std::sync::Arc;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use payjoin::receive::{Error, JsonReply, PayjoinEndpoint, RequestError};
use payjoin::MAX_CONTENT_LENGTH;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

pub mod bitcoind;
pub mod cli;
pub mod config;
pub mod db;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DB_PATH: &str = "payjoin.sqlite";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Headers<'a>(&'a hyper::HeaderMap);

impl payjoin::receive::Headers for Headers<'_> {
    fn get_header(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.to_str()).transpose().ok().flatten()
    }
}

/// Serves `endpoint` on `listen_addr` until the listener fails.
pub async fn listen_tcp(
    listen_addr: &str,
    endpoint: Arc<PayjoinEndpoint>,
    timeout: Duration,
) -> Result<(), BoxError> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Payjoin receiver listening on {}", listener.local_addr()?);
    serve_on_listener(listener, endpoint, timeout).await;
    Ok(())
}

pub async fn listen_tcp_on_free_port(
    endpoint: Arc<PayjoinEndpoint>,
    timeout: Duration,
) -> Result<(u16, JoinHandle<()>), BoxError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    debug!("Payjoin receiver binding to port {port}");
    let handle = tokio::spawn(serve_on_listener(listener, endpoint, timeout));
    Ok((port, handle))
}

async fn serve_on_listener(
    listener: TcpListener,
    endpoint: Arc<PayjoinEndpoint>,
    timeout: Duration,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let endpoint = endpoint.clone();
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |req| serve_payjoin(req, endpoint.clone(), timeout)),
                )
                .await
            {
                error!("Error serving connection: {:?}", err);
            }
        });
    }
}

async fn serve_payjoin(
    req: Request<Incoming>,
    endpoint: Arc<PayjoinEndpoint>,
    timeout: Duration,
) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let path_segments: Vec<&str> = path.split('/').collect();
    debug!("serve_payjoin: {:?}", &path_segments);
    let mut response = match (method, path_segments.as_slice()) {
        (Method::POST, ["", crypto_code, "bip78"]) =>
            post_original(crypto_code, req, endpoint.clone(), timeout).await,
        (Method::GET, ["", "health"]) => health_check().await,
        _ => Ok(not_found()),
    }
    .unwrap_or_else(|e| e.to_response());

    response.headers_mut().insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    Ok(response)
}

/// Runs the exchange for one original. The sender waits at most `timeout`.
///
/// The exchange runs on its own task and is cancelled when this future is
/// dropped, so a sender hanging up still gets its locks released and the
/// original broadcast.
async fn post_original(
    crypto_code: &str,
    req: Request<Incoming>,
    endpoint: Arc<PayjoinEndpoint>,
    timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, HandlerError> {
    trace!("post_original");
    let (parts, body) = req.into_parts();
    if body.size_hint().lower() > MAX_CONTENT_LENGTH as u64 {
        return body_too_large();
    }
    let body = match Limited::new(body, MAX_CONTENT_LENGTH).collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => match e.downcast::<http_body_util::LengthLimitError>() {
            Ok(_) => return body_too_large(),
            Err(e) => return Err(HandlerError::BadRequest(anyhow::anyhow!(e))),
        },
    };

    let cancel = CancellationToken::new();
    let _hang_up = cancel.clone().drop_guard();
    let deadline = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => cancel.cancel(),
                _ = cancel.cancelled() => (),
            }
        })
    };
    let exchange = {
        let crypto_code = crypto_code.to_owned();
        let query = parts.uri.query().unwrap_or_default().to_owned();
        let headers = parts.headers;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            endpoint.submit(&crypto_code, body.as_ref(), &query, Headers(&headers), cancel).await
        })
    };
    let result = exchange.await.map_err(|e| HandlerError::InternalServerError(e.into()));
    deadline.abort();

    match result? {
        Ok(proposal) => {
            info!("Responded with payjoin proposal {}", proposal.txid());
            let mut res = Response::new(full(proposal.body().to_owned()));
            res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            Ok(res)
        }
        Err(e) => json_reply(&e.reply()),
    }
}

fn body_too_large() -> Result<Response<BoxBody<Bytes, hyper::Error>>, HandlerError> {
    json_reply(&Error::from(RequestError::body_too_large(MAX_CONTENT_LENGTH)).reply())
}

fn json_reply(reply: &JsonReply) -> Result<Response<BoxBody<Bytes, hyper::Error>>, HandlerError> {
    debug!("Rejected original with {}: {}", reply.error_code(), reply.message());
    let mut res = Response::new(full(reply.to_json().to_string()));
    *res.status_mut() = StatusCode::from_u16(reply.status_code())
        .map_err(|e| HandlerError::InternalServerError(e.into()))?;
    res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(res)
}

async fn health_check() -> Result<Response<BoxBody<Bytes, hyper::Error>>, HandlerError> {
    Ok(Response::new(empty()))
}

#[derive(Debug)]
enum HandlerError {
    InternalServerError(anyhow::Error),
    BadRequest(anyhow::Error),
}

impl HandlerError {
    fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut res = Response::new(empty());
        match self {
            HandlerError::InternalServerError(e) => {
                error!("Internal server error: {}", e);
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR
            }
            HandlerError::BadRequest(e) => {
                error!("Bad request: {}", e);
                *res.status_mut() = StatusCode::BAD_REQUEST
            }
        };

        res
    }
}

fn not_found() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut res = Response::default();
    *res.status_mut() = StatusCode::NOT_FOUND;
    res
}

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}
