use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State as AxumState;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::StatusCode;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

pub const HEALTH_PATH: &str = "/childprocess/health";

#[derive(Clone)]
pub struct State {
    ready: CancellationToken,
}

impl State {
    /// `ready` is cancelled once the initial sync has been written.
    pub fn new(ready: CancellationToken) -> Self {
        Self { ready }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

pub async fn serve(addr: SocketAddr, state: Arc<State>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("health listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route("/readyz", get(readyz))
        .with_state(state)
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

#[derive(Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "Ok").into_response(),
            Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "NotReady").into_response(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_readiness_follows_token() {
        let ready = CancellationToken::new();
        let state = State::new(ready.clone());
        assert_eq!(state.ready(), Readiness::NotReady);
        assert_eq!(
            state.ready().into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        ready.cancel();
        assert_eq!(state.ready(), Readiness::Ready);
        assert_eq!(state.ready().into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_endpoint() -> Result<()> {
        let cancel = CancellationToken::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        let server = tokio::spawn(serve(
            addr,
            Arc::new(State::new(CancellationToken::new())),
            cancel.clone(),
        ));

        let mut body = String::new();
        for _ in 0..50 {
            if let Ok(reply) = get_raw(addr, HEALTH_PATH).await {
                body = reply;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(body.starts_with("HTTP/1.1 200"), "{body}");
        assert!(body.ends_with("OK"), "{body}");

        cancel.cancel();
        server.await.map_err(|e| crate::Error::Task(e.to_string()))??;
        Ok(())
    }

    async fn get_raw(addr: SocketAddr, path: &str) -> std::io::Result<String> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok(reply)
    }
}
