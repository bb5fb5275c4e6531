use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpListener,
    time::{Instant, Sleep, sleep},
};

/// Binds one IPv6 socket serving both stacks, so `curl http://127.0.0.1:3000`
/// and `curl http://[::1]:3000` hit the same listener.
pub(crate) async fn create_dual_stack_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    // reuse_address allows fast restarts while old sockets linger in TIME_WAIT
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    socket.set_only_v6(false)?;

    let addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener = std::net::TcpListener::from(socket);
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

pin_project! {
    /// IO wrapper that fails the stream once no read or write makes progress
    /// within `timeout`. Every ready poll pushes the deadline out again.
    #[derive(Debug)]
    pub struct TimeoutIO<T>
    where
    T: AsyncWrite,
    T: AsyncRead,
    {
        #[pin]
        inner: T,
        timeout: Duration,
        #[pin]
        idle: Sleep,
    }
}

impl<T> TimeoutIO<T>
where
    T: AsyncWrite + AsyncRead,
{
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            idle: sleep(timeout),
        }
    }
}

/// Shared poll arm: a ready inner poll re-arms the idle timer, a pending one
/// is turned into `TimedOut` once the timer fires.
fn poll_with_deadline<R>(
    result: Poll<io::Result<R>>, idle: Pin<&mut Sleep>, timeout: Duration, cx: &mut Context<'_>, op: &'static str,
) -> Poll<io::Result<R>> {
    if result.is_ready() {
        idle.reset(Instant::now() + timeout);
    } else if idle.poll(cx).is_ready() {
        return Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, format!("{op} idle for {timeout:?}"))));
    }
    result
}

impl<T> AsyncRead for TimeoutIO<T>
where
    T: AsyncWrite + AsyncRead,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        poll_with_deadline(this.inner.poll_read(cx, buf), this.idle, *this.timeout, cx, "read")
    }
}

impl<T> AsyncWrite for TimeoutIO<T>
where
    T: AsyncWrite + AsyncRead,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        poll_with_deadline(this.inner.poll_write(cx, buf), this.idle, *this.timeout, cx, "write")
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        poll_with_deadline(this.inner.poll_flush(cx), this.idle, *this.timeout, cx, "flush")
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        poll_with_deadline(this.inner.poll_shutdown(cx), this.idle, *this.timeout, cx, "shutdown")
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(self: Pin<&mut Self>, cx: &mut Context<'_>, bufs: &[std::io::IoSlice<'_>]) -> Poll<io::Result<usize>> {
        let this = self.project();
        poll_with_deadline(this.inner.poll_write_vectored(cx, bufs), this.idle, *this.timeout, cx, "write")
    }
}
