//! The listening sockets.
//!
//! Binding happens early, before privileges are dropped and before the
//! runtime exists; registration with the reactor happens later, inside it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::task::Poll;

use anyhow::{Context as _, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

const BACKLOG: i32 = 100;

fn bind_one(host: Option<Ipv4Addr>, port: u16) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddrV4::new(host.unwrap_or(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&SocketAddr::from(addr).into())?;
    // This number is reasonably arbitrary, but large is better than small.
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Binds every configured endpoint. Runs with whatever privileges the
/// daemon started with.
pub fn bind_all(specs: &[(Option<Ipv4Addr>, u16)]) -> Result<Vec<std::net::TcpListener>> {
    specs
        .iter()
        .map(|(host, port)| {
            bind_one(*host, *port).with_context(|| {
                format!(
                    "could not establish socket {}@{}",
                    port,
                    host.map(|h| h.to_string()).unwrap_or_default()
                )
            })
        })
        .collect()
}

/// All listening sockets, accepted from round-robin so one busy port
/// cannot starve the others.
pub struct Listeners {
    inner: Vec<TcpListener>,
    next: usize,
}

impl Listeners {
    /// Registers already-bound sockets with the runtime's reactor.
    pub fn register(bound: Vec<std::net::TcpListener>) -> Result<Self> {
        let inner = bound
            .into_iter()
            .map(TcpListener::from_std)
            .collect::<std::io::Result<Vec<_>>>()
            .context("could not register listeners with the runtime")?;

        Ok(Self { inner, next: 0 })
    }

    /// The next accepted connection on any listener. Transient accept
    /// errors are logged and the listener keeps going; a peer can close
    /// before we get around to accepting it.
    pub async fn accept(&mut self) -> (TcpStream, SocketAddr) {
        std::future::poll_fn(|cx| {
            for offset in 0..self.inner.len() {
                let idx = (self.next + offset) % self.inner.len();
                match self.inner[idx].poll_accept(cx) {
                    Poll::Ready(Ok((stream, peer))) => {
                        self.next = idx + 1;
                        return Poll::Ready((stream, peer));
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::warn!("accept failed on listener {idx}: {e}");
                        // An error consumes no readiness; ask to be polled
                        // again so the listener is not stranded.
                        cx.waker().wake_by_ref();
                    }
                    Poll::Pending => {}
                }
            }

            Poll::Pending
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_across_multiple_listeners() {
        let bound = bind_all(&[
            (Some(Ipv4Addr::LOCALHOST), 0),
            (Some(Ipv4Addr::LOCALHOST), 0),
        ])
        .unwrap();
        let first = bound[0].local_addr().unwrap();
        let second = bound[1].local_addr().unwrap();
        let mut listeners = Listeners::register(bound).unwrap();

        let a = std::net::TcpStream::connect(second).unwrap();
        let (_, peer) = listeners.accept().await;
        assert_eq!(peer, a.local_addr().unwrap());

        let b = std::net::TcpStream::connect(first).unwrap();
        let (_, peer) = listeners.accept().await;
        assert_eq!(peer, b.local_addr().unwrap());
    }

    #[test]
    fn binding_an_occupied_port_errors() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        assert!(bind_all(&[(Some(Ipv4Addr::LOCALHOST), port)]).is_err());
    }
}
