use std::{convert::Infallible, net::SocketAddr, time::Duration};

pub mod error;
pub mod init_log;
pub mod util;
type DynError = Box<dyn std::error::Error + Send + Sync>;
use crate::util::io::{TimeoutIO, create_dual_stack_listener};

use axum::{Router, extract::Request, response::Response};

use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{info, warn};
use tokio::sync::mpsc;
use tower::{Service, ServiceExt};
use util::format::SocketAddrFormat;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    pub port: u16,
    router: Router,
    pub idle_timeout: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

pub fn new_server(port: u16, router: Router) -> (Server, mpsc::Sender<()>) {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let server = Server {
        port,
        router,
        idle_timeout: Duration::from_secs(120),
        shutdown_rx,
    };
    (server, shutdown_tx)
}

impl Server {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub async fn run(mut self) -> Result<(), std::io::Error> {
        log::info!("listening on port {}", self.port);
        let server: hyper_util::server::conn::auto::Builder<TokioExecutor> = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
        let graceful: hyper_util::server::graceful::GracefulShutdown = hyper_util::server::graceful::GracefulShutdown::new();
        serve_plaintext(&self.router, server, graceful, self.port, self.idle_timeout, &mut self.shutdown_rx).await
    }
}

async fn handle(
    request: Request<Incoming>, app: axum::middleware::AddExtension<Router, axum::extract::ConnectInfo<SocketAddr>>,
) -> std::result::Result<Response, std::io::Error> {
    app.oneshot(request)
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Interrupted, err))
}

async fn handle_connection<C>(
    conn: C, client_socket_addr: SocketAddr, app: Router, server: hyper_util::server::conn::auto::Builder<TokioExecutor>,
    graceful: &hyper_util::server::graceful::GracefulShutdown, timeout: Duration,
) where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + 'static + Send + Sync,
{
    let timeout_io = Box::pin(TimeoutIO::new(conn, timeout));
    let stream = TokioIo::new(timeout_io);
    let mut app = app.into_make_service_with_connect_info::<SocketAddr>();
    let app: axum::middleware::AddExtension<Router, axum::extract::ConnectInfo<SocketAddr>> = unwrap_infallible(app.call(client_socket_addr).await);
    // https://github.com/tokio-rs/axum/blob/main/examples/serve-with-hyper/src/main.rs#L81
    let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| handle(request, app.clone()));

    let conn = server.serve_connection_with_upgrades(stream, hyper_service);
    let conn = graceful.watch(conn.into_owned());

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            handle_hyper_error(client_socket_addr, err);
        }
        log::debug!("connection dropped: {client_socket_addr}");
    });
}

fn handle_hyper_error(client_socket_addr: SocketAddr, http_err: DynError) {
    use std::error::Error;
    match http_err.downcast_ref::<hyper::Error>() {
        Some(hyper_err) => {
            let level = if hyper_err.is_user() { log::Level::Warn } else { log::Level::Debug };
            let source = hyper_err.source().unwrap_or(hyper_err);
            log::log!(
                level,
                "[hyper {}]: {:?} from {}",
                if hyper_err.is_user() { "user" } else { "system" },
                source,
                SocketAddrFormat(&client_socket_addr)
            );
        }
        None => match http_err.downcast_ref::<std::io::Error>() {
            Some(io_err) => {
                warn!("[hyper io]: [{}] {} from {}", io_err.kind(), io_err, SocketAddrFormat(&client_socket_addr));
            }
            None => {
                warn!("[hyper]: {} from {}", http_err, SocketAddrFormat(&client_socket_addr));
            }
        },
    }
}

async fn serve_plaintext(
    app: &Router, server: hyper_util::server::conn::auto::Builder<TokioExecutor>, graceful: hyper_util::server::graceful::GracefulShutdown,
    port: u16, timeout: Duration, shutdown_rx: &mut mpsc::Receiver<()>,
) -> Result<(), std::io::Error> {
    let listener = create_dual_stack_listener(port).await?;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("start graceful shutdown!");
                drop(listener);
                break;
            }
            conn = listener.accept() => {
                match conn {
                    Ok((conn, client_socket_addr)) => {
                        handle_connection(conn, client_socket_addr, app.clone(), server.clone(), &graceful, timeout).await;
                    }
                    Err(e) => {
                        warn!("accept error:{e}");
                    }
                }
            }
        }
    }
    tokio::select! {
        _ = graceful.shutdown() => {
            info!("Gracefully shutdown!");
        },
        _ = tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT) => {
            info!("Waited {GRACEFUL_SHUTDOWN_TIMEOUT:?} for graceful shutdown, aborting...");
        }
    }
    Ok(())
}

#[cfg(unix)]
pub async fn wait_signal() -> Result<(), DynError> {
    use log::info;
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate_signal = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate_signal.recv() => {
            info!("receive terminate signal");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("receive ctrl_c signal");
        },
    };
    Ok(())
}

#[cfg(windows)]
pub async fn wait_signal() -> Result<(), DynError> {
    let _ = tokio::signal::ctrl_c().await;
    info!("receive ctrl_c signal");
    Ok(())
}

fn unwrap_infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => match err {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_timeout_overrides_the_default_idle_timeout() {
        let (server, _shutdown_tx) = new_server(3000, Router::new());
        assert_eq!(server.idle_timeout, Duration::from_secs(120));

        let server = server.with_timeout(Duration::from_secs(5));
        assert_eq!(server.idle_timeout, Duration::from_secs(5));
    }
}
