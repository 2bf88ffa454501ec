//! Socket helpers: listeners, accept, and per-connection options.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};

/// Binds a non-blocking TCP listener. `::` listens on both IPv6 and IPv4.
pub fn tcp_server(bind: &str, port: u16, backlog: i32) -> io::Result<Socket> {
    let ip: IpAddr = bind
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid bind address '{bind}'")))?;
    let addr = SocketAddr::new(ip, port);

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Binds a non-blocking Unix-domain listener, replacing a stale socket
/// file at `path`.
pub fn unix_server(path: &Path, backlog: i32) -> io::Result<Socket> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.set_nonblocking(true)?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Accepts one connection, returning it non-blocking along with a
/// printable peer address.
pub fn accept(listener: &Socket) -> io::Result<(Socket, String)> {
    let (conn, addr) = listener.accept()?;
    conn.set_nonblocking(true)?;
    Ok((conn, format_addr(&addr)))
}

pub fn format_addr(addr: &SockAddr) -> String {
    if let Some(sa) = addr.as_socket() {
        return sa.to_string();
    }
    match addr.as_pathname() {
        Some(path) => path.display().to_string(),
        None => String::from("unix"),
    }
}

pub fn enable_tcp_nodelay(socket: &Socket) -> io::Result<()> {
    socket.set_tcp_nodelay(true)
}

/// Turns on TCP keepalive probing after `secs` idle seconds.
pub fn keepalive(socket: &Socket, secs: u64) -> io::Result<()> {
    let ka = TcpKeepalive::new().with_time(Duration::from_secs(secs));
    #[cfg(target_os = "linux")]
    let ka = ka.with_interval(Duration::from_secs((secs / 3).max(1)));
    socket.set_tcp_keepalive(&ka)
}

/// Port a TCP socket is bound to; 0 for non-IP sockets.
pub fn local_port(socket: &Socket) -> io::Result<u16> {
    Ok(socket.local_addr()?.as_socket().map_or(0, |sa| sa.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[test]
    fn test_tcp_listener_accepts() {
        let listener = tcp_server("127.0.0.1", 0, 16).unwrap();
        let port = local_port(&listener).unwrap();
        assert_ne!(port, 0);

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"hi").unwrap();

        let (conn, peer) = loop {
            match accept(&listener) {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        assert!(peer.starts_with("127.0.0.1:"));
        enable_tcp_nodelay(&conn).unwrap();
        keepalive(&conn, 300).unwrap();

        let mut buf = [0u8; 2];
        conn.set_nonblocking(false).unwrap();
        (&conn).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_bad_bind_address() {
        let err = tcp_server("not-an-ip", 0, 16).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_unix_listener_replaces_stale_file() {
        let path = std::env::temp_dir().join(format!("tinyredis-anet-{}.sock", std::process::id()));
        std::fs::write(&path, b"stale").unwrap();
        let listener = unix_server(&path, 16).unwrap();
        assert_eq!(local_port(&listener).unwrap(), 0);
        drop(listener);
        let _ = std::fs::remove_file(&path);
    }
}
