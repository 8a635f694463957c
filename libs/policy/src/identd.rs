//! A client for the identd protocol (RFC 1413).
//!
//! The whole exchange runs against one absolute deadline: connect, query,
//! and response together may take no longer than the caller's timeout.
//! Every failure mode collapses into `None`.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

// No sane identd return will ever be over this size.
const MAX_RESPONSE: usize = 1024;
const IDENTD_PORT: u16 = 113;

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.checked_duration_since(Instant::now())?;
    if left.is_zero() { None } else { Some(left) }
}

fn connect_from(local_ip: Ipv4Addr, remote_ip: Ipv4Addr, deadline: Instant) -> Option<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).ok()?;
    // Bind to the specific interface the connection arrived on; a multihomed
    // host would otherwise get errors or the wrong answer from the remote
    // identd.
    socket
        .bind(&SocketAddr::from((local_ip, 0)).into())
        .ok()?;
    socket
        .connect_timeout(
            &SocketAddr::from((remote_ip, IDENTD_PORT)).into(),
            remaining(deadline)?,
        )
        .ok()?;

    Some(socket.into())
}

fn exchange(
    stream: &mut TcpStream,
    remote_port: u16,
    local_port: u16,
    deadline: Instant,
) -> Option<String> {
    stream.set_write_timeout(Some(remaining(deadline)?)).ok()?;
    stream
        .write_all(format!("{remote_port}, {local_port}\r\n").as_bytes())
        .ok()?;

    let mut response = Vec::new();
    let mut buf = [0_u8; 256];
    while response.len() < MAX_RESPONSE && !response.contains(&b'\n') {
        stream.set_read_timeout(Some(remaining(deadline)?)).ok()?;
        match stream.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(_) => return None,
        }
    }

    if !response.contains(&b'\n') {
        return None;
    }
    let response = String::from_utf8_lossy(&response);
    let line = response.lines().next()?;
    let fields = line.split(':').map(str::trim).collect::<Vec<_>>();
    // Does this look like a good identd return, with a user ID?
    if fields.len() != 4 || fields[1] != "USERID" {
        return None;
    }

    Some(fields[3].to_owned())
}

/// Performs the identd protocol against the peer of a connection.
pub fn ident(remote: SocketAddrV4, local: SocketAddrV4, timeout: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;
    let mut stream = connect_from(*local.ip(), *remote.ip(), deadline)?;

    exchange(&mut stream, remote.port(), local.port(), deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn serve_one(response: &'static str) -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0_u8; 128];
            let _ = stream.read(&mut buf);
            stream.write_all(response.as_bytes()).unwrap();
        });

        addr
    }

    fn query(server: SocketAddrV4) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut stream = TcpStream::connect(server).unwrap();

        exchange(&mut stream, 6191, 23, deadline)
    }

    #[test]
    fn parses_a_userid_response() {
        let addr = serve_one("6191, 23 : USERID : UNIX : stjohns\r\n");

        assert_eq!(query(addr), Some("stjohns".to_owned()));
    }

    #[test]
    fn rejects_error_responses() {
        let addr = serve_one("6191, 23 : ERROR : NO-USER\r\n");

        assert_eq!(query(addr), None);
    }

    #[test]
    fn rejects_malformed_responses() {
        let addr = serve_one("what even is this\r\n");

        assert_eq!(query(addr), None);
    }

    #[test]
    fn eof_without_newline_is_no_answer() {
        let addr = serve_one("6191, 23 : USERID : UNIX");

        assert_eq!(query(addr), None);
    }

    #[test]
    fn unreachable_identd_times_out() {
        // RFC 5737 TEST-NET; nothing listens there.
        let remote = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 6191);
        let local = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 23);

        assert_eq!(ident(remote, local, Duration::from_millis(50)), None);
    }
}
