use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::info;

/// Liveness endpoint for the compute cloud's own probe of the LTM host
/// (`SPEC_FULL.md` §6), separate from the authenticated frontend router.
pub async fn server(port: u16) -> std::io::Result<()> {
    info!("healthcheck endpoint http://0.0.0.0:{}", port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(healthcheck))
                .await
            {
                eprintln!("Healthcheck endpoint error: {:?}", err);
            }
        });
    }
}

async fn healthcheck(_: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = Response::builder()
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .status(200)
        .body(Full::new(Bytes::from("up")))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("up"))));

    Ok(response)
}
