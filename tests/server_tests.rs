//! End-to-end tests: a real server on an ephemeral port, driven over TCP.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tinyredis::{Server, ServerConfig};

struct TestServer {
    port: u16,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(ServerConfig::default())
    }

    fn start_with(mut config: ServerConfig) -> Self {
        config.bind = String::from("127.0.0.1");
        config.port = 0;
        config.hz = 100;
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut server = Server::new(config).expect("server");
            server.listen().expect("listen");
            tx.send(server.local_port()).expect("send port");
            server.serve().expect("serve");
        });
        let port = rx.recv_timeout(Duration::from_secs(5)).expect("server did not start");
        Self {
            port,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> Conn {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
        Conn {
            reader: BufReader::new(stream.try_clone().expect("clone")),
            stream,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // A full server rejects the connection, so retry until a slot frees up.
        for _ in 0..50 {
            let Ok(mut conn) = TcpStream::connect(("127.0.0.1", self.port)) else {
                break;
            };
            let _ = conn.write_all(b"*1\r\n$8\r\nSHUTDOWN\r\n");
            let mut reply = Vec::new();
            let _ = conn.read_to_end(&mut reply);
            if reply.starts_with(b"+OK") {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let _ = handle.join();
    }
}

#[derive(Debug, PartialEq)]
enum Resp {
    Status(String),
    Error(String),
    Int(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Resp>>),
}

impl Resp {
    fn bulk(s: &str) -> Self {
        Resp::Bulk(Some(s.as_bytes().to_vec()))
    }
}

struct Conn {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Conn {
    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write");
    }

    fn send(&mut self, args: &[&str]) {
        let mut out = format!("*{}\r\n", args.len()).into_bytes();
        for arg in args {
            out.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
        }
        self.send_raw(&out);
    }

    fn cmd(&mut self, args: &[&str]) -> Resp {
        self.send(args);
        self.read()
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read line");
        assert!(line.ends_with("\r\n"), "truncated reply line: {line:?}");
        line.truncate(line.len() - 2);
        line
    }

    fn read(&mut self) -> Resp {
        let line = self.read_line();
        let (kind, rest) = line.split_at(1);
        match kind {
            "+" => Resp::Status(rest.to_string()),
            "-" => Resp::Error(rest.to_string()),
            ":" => Resp::Int(rest.parse().expect("int")),
            "$" => {
                let len: i64 = rest.parse().expect("bulk len");
                if len < 0 {
                    return Resp::Bulk(None);
                }
                let mut buf = vec![0; len as usize + 2];
                self.reader.read_exact(&mut buf).expect("bulk body");
                buf.truncate(len as usize);
                Resp::Bulk(Some(buf))
            }
            "*" => {
                let n: i64 = rest.parse().expect("array len");
                if n < 0 {
                    return Resp::Array(None);
                }
                Resp::Array(Some((0..n).map(|_| self.read()).collect()))
            }
            other => panic!("unexpected reply type {other:?}"),
        }
    }

    /// True once the server closed the connection.
    fn closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.reader.read(&mut buf), Ok(0))
    }
}

#[test]
fn test_ping_and_echo() {
    let server = TestServer::start();
    let mut c = server.connect();
    assert_eq!(c.cmd(&["PING"]), Resp::Status("PONG".into()));
    assert_eq!(c.cmd(&["echo", "hey"]), Resp::bulk("hey"));
}

#[test]
fn test_set_get_del() {
    let server = TestServer::start();
    let mut c = server.connect();
    assert_eq!(c.cmd(&["SET", "foo", "bar"]), Resp::Status("OK".into()));
    assert_eq!(c.cmd(&["GET", "foo"]), Resp::bulk("bar"));
    assert_eq!(c.cmd(&["DEL", "foo", "nope"]), Resp::Int(1));
    assert_eq!(c.cmd(&["GET", "foo"]), Resp::Bulk(None));
}

#[test]
fn test_pipelined_requests_answer_in_order() {
    let server = TestServer::start();
    let mut c = server.connect();
    let mut batch = Vec::new();
    for _ in 0..200 {
        batch.extend_from_slice(b"*2\r\n$4\r\nincr\r\n$1\r\nn\r\n");
    }
    batch.extend_from_slice(b"*2\r\n$3\r\nget\r\n$1\r\nn\r\n");
    c.send_raw(&batch);
    for i in 1..=200 {
        assert_eq!(c.read(), Resp::Int(i));
    }
    assert_eq!(c.read(), Resp::bulk("200"));
}

#[test]
fn test_request_split_across_writes() {
    let server = TestServer::start();
    let mut c = server.connect();
    let request = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
    for chunk in request.chunks(3) {
        c.send_raw(chunk);
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(c.read(), Resp::Status("OK".into()));
    assert_eq!(c.cmd(&["get", "key"]), Resp::bulk("value"));
}

#[test]
fn test_inline_commands() {
    let server = TestServer::start();
    let mut c = server.connect();
    c.send_raw(b"SET greeting \"hello world\"\r\n");
    assert_eq!(c.read(), Resp::Status("OK".into()));
    c.send_raw(b"GET greeting\n");
    assert_eq!(c.read(), Resp::bulk("hello world"));
}

#[test]
fn test_large_value_round_trip() {
    let server = TestServer::start();
    let mut c = server.connect();
    let big = "x".repeat(300 * 1024);
    assert_eq!(c.cmd(&["set", "big", &big]), Resp::Status("OK".into()));
    assert_eq!(c.cmd(&["strlen", "big"]), Resp::Int(big.len() as i64));
    assert_eq!(c.cmd(&["get", "big"]), Resp::bulk(&big));
}

#[test]
fn test_protocol_error_closes_connection() {
    let server = TestServer::start();
    let mut c = server.connect();
    c.send_raw(b"*1\r\nfoo\r\n");
    assert_eq!(c.read(), Resp::Error("ERR Protocol error: expected '$', got 'f'".into()));
    assert!(c.closed());

    let mut other = server.connect();
    assert_eq!(other.cmd(&["ping"]), Resp::Status("PONG".into()));
}

#[test]
fn test_command_errors_keep_connection() {
    let server = TestServer::start();
    let mut c = server.connect();
    assert_eq!(c.cmd(&["nosuch"]), Resp::Error("ERR unknown command 'nosuch'".into()));
    assert_eq!(
        c.cmd(&["get"]),
        Resp::Error("ERR wrong number of arguments for 'get' command".into())
    );
    assert_eq!(c.cmd(&["ping"]), Resp::Status("PONG".into()));
}

#[test]
fn test_quit_closes_after_reply() {
    let server = TestServer::start();
    let mut c = server.connect();
    assert_eq!(c.cmd(&["QUIT"]), Resp::Status("OK".into()));
    assert!(c.closed());
}

#[test]
fn test_sorted_set_commands() {
    let server = TestServer::start();
    let mut c = server.connect();
    assert_eq!(c.cmd(&["zadd", "z", "1", "a", "2", "b", "3", "c"]), Resp::Int(3));
    assert_eq!(c.cmd(&["zrank", "z", "b"]), Resp::Int(1));
    assert_eq!(
        c.cmd(&["zrangebyscore", "z", "(1", "+inf", "withscores"]),
        Resp::Array(Some(vec![
            Resp::bulk("b"),
            Resp::bulk("2"),
            Resp::bulk("c"),
            Resp::bulk("3"),
        ]))
    );
    assert_eq!(c.cmd(&["zrem", "z", "a", "b", "c"]), Resp::Int(3));
    assert_eq!(c.cmd(&["exists", "z"]), Resp::Int(0));
}

#[test]
fn test_keys_expire_through_the_cron() {
    let server = TestServer::start();
    let mut c = server.connect();
    for i in 0..50 {
        assert_eq!(c.cmd(&["psetex", &format!("k{i}"), "30", "v"]), Resp::Status("OK".into()));
    }
    assert_eq!(c.cmd(&["set", "keep", "v"]), Resp::Status("OK".into()));
    thread::sleep(Duration::from_millis(500));
    // No key is touched, so only the active cycle can have removed them.
    let info = match c.cmd(&["info", "keyspace"]) {
        Resp::Bulk(Some(b)) => String::from_utf8(b).unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    assert!(info.contains("db0:keys=1,expires=0"), "{info}");
}

#[test]
fn test_clients_are_isolated_by_database() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();
    assert_eq!(a.cmd(&["select", "1"]), Resp::Status("OK".into()));
    assert_eq!(a.cmd(&["set", "k", "one"]), Resp::Status("OK".into()));
    assert_eq!(b.cmd(&["get", "k"]), Resp::Bulk(None));
    assert_eq!(b.cmd(&["select", "1"]), Resp::Status("OK".into()));
    assert_eq!(b.cmd(&["get", "k"]), Resp::bulk("one"));
}

#[test]
fn test_client_list_shows_every_connection() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();
    assert_eq!(b.cmd(&["client", "setname", "second"]), Resp::Status("OK".into()));
    let list = match a.cmd(&["client", "list"]) {
        Resp::Bulk(Some(b)) => String::from_utf8(b).unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(list.lines().count(), 2, "{list}");
    assert!(list.contains("name=second"));
}

#[test]
fn test_idle_clients_are_closed() {
    let server = TestServer::start_with(ServerConfig {
        maxidletime: 1,
        ..ServerConfig::default()
    });
    let mut idle = server.connect();
    assert_eq!(idle.cmd(&["ping"]), Resp::Status("PONG".into()));
    thread::sleep(Duration::from_millis(1600));
    assert!(idle.closed());
}

#[test]
fn test_maxclients_rejects_extra_connections() {
    let server = TestServer::start_with(ServerConfig {
        maxclients: 1,
        ..ServerConfig::default()
    });
    let mut first = server.connect();
    assert_eq!(first.cmd(&["ping"]), Resp::Status("PONG".into()));
    let mut second = server.connect();
    assert_eq!(second.read(), Resp::Error("ERR max number of clients reached".into()));
    assert!(second.closed());
    assert_eq!(first.cmd(&["ping"]), Resp::Status("PONG".into()));
}

#[test]
fn test_shutdown_stops_the_server() {
    let mut server = TestServer::start();
    let mut c = server.connect();
    assert_eq!(c.cmd(&["shutdown"]), Resp::Status("OK".into()));
    assert!(c.closed());
    if let Some(handle) = server.handle.take() {
        handle.join().expect("server thread");
    }
    assert!(TcpStream::connect(("127.0.0.1", server.port)).is_err());
}
