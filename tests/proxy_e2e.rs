//! End-to-end scenarios against a live proxy instance.
//!
//! Each test spins up the proxy on an ephemeral port in its own thread and
//! scripts one or more mock origins on plain blocking sockets. Clients are
//! plain `TcpStream`s speaking proxy-form HTTP/1.x.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use sluice::server::{Server, ServerConfig};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

fn start_proxy(config: ServerConfig) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut server =
            Server::bind("127.0.0.1:0".parse().unwrap(), config).expect("could not bind proxy");
        tx.send(server.local_addr()).expect("proxy address");
        let _ = server.run();
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("proxy did not start")
}

fn default_proxy() -> SocketAddr {
    start_proxy(ServerConfig {
        resolver_workers: 2,
        ..ServerConfig::default()
    })
}

/// One scripted origin answer and whether the connection drops after it.
struct OriginResponse {
    body: Vec<u8>,
    close_after: bool,
}

impl OriginResponse {
    fn keep(body: &[u8]) -> OriginResponse {
        OriginResponse {
            body: body.to_vec(),
            close_after: false,
        }
    }
}

/// A scripted origin: accepts connections one at a time, records the
/// requests it sees and answers from the script in order.
struct MockOrigin {
    addr: SocketAddr,
    requests: mpsc::Receiver<String>,
    connections: Arc<AtomicUsize>,
}

impl MockOrigin {
    fn spawn(script: Vec<OriginResponse>) -> MockOrigin {
        let listener = TcpListener::bind("127.0.0.1:0").expect("could not bind mock origin");
        let addr = listener.local_addr().unwrap();
        let (request_tx, requests) = mpsc::channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = connections.clone();

        thread::spawn(move || {
            let mut script = script.into_iter();
            loop {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                'conn: loop {
                    let mut data = Vec::new();
                    let mut buffer = [0u8; 4096];
                    while find_blank_line(&data).is_none() {
                        match stream.read(&mut buffer) {
                            Ok(0) => break 'conn,
                            Ok(size) => data.extend_from_slice(&buffer[..size]),
                            Err(_) => break 'conn,
                        }
                    }
                    request_tx
                        .send(String::from_utf8_lossy(&data).into_owned())
                        .ok();
                    let Some(response) = script.next() else {
                        break 'conn;
                    };
                    if stream.write_all(&response.body).is_err() {
                        break 'conn;
                    }
                    if response.close_after {
                        break 'conn;
                    }
                }
            }
        });

        MockOrigin {
            addr,
            requests,
            connections,
        }
    }

    fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    fn next_request(&self) -> String {
        self.requests
            .recv_timeout(Duration::from_secs(10))
            .expect("origin saw no request")
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn connect_client(proxy: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(proxy).expect("could not reach proxy");
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Read one HTTP response: headers, then a Content-Length body when one is
/// declared, everything until EOF otherwise.
fn read_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buffer = [0u8; 4096];

    while find_blank_line(&data).is_none() {
        match stream.read(&mut buffer) {
            Ok(0) => return data,
            Ok(size) => data.extend_from_slice(&buffer[..size]),
            Err(error) => panic!("client read failed: {error}"),
        }
    }

    let header_end = find_blank_line(&data).unwrap() + 4;
    let head = String::from_utf8_lossy(&data[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|value| value.trim().parse::<usize>().expect("content-length"));

    match content_length {
        Some(length) => {
            while data.len() < header_end + length {
                match stream.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(size) => data.extend_from_slice(&buffer[..size]),
                    Err(error) => panic!("client read failed: {error}"),
                }
            }
            data
        }
        None => {
            loop {
                match stream.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(size) => data.extend_from_slice(&buffer[..size]),
                    Err(_) => break,
                }
            }
            data
        }
    }
}

fn proxied_get(authority: &str, version: &str) -> String {
    format!("GET http://{authority}/ HTTP/{version}\r\nHost: {authority}\r\n\r\n")
}

#[test]
fn simple_get_streams_origin_bytes_verbatim() {
    let origin_bytes = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nhi";
    let origin = MockOrigin::spawn(vec![OriginResponse::keep(origin_bytes)]);
    let proxy = default_proxy();

    let mut client = connect_client(proxy);
    client
        .write_all(proxied_get(&origin.authority(), "1.0").as_bytes())
        .unwrap();

    let response = read_response(&mut client);
    assert_eq!(response, origin_bytes.to_vec());

    let seen = origin.next_request();
    assert!(
        seen.starts_with("GET / HTTP/1.0\r\n"),
        "origin saw origin-form request line, got: {seen}"
    );
    assert!(seen.contains(&format!("Host: {}\r\n", origin.authority())));
}

#[test]
fn cacheable_get_is_served_via_revalidation() {
    let fresh = b"HTTP/1.1 200 OK\r\nETag: \"a\"\r\nContent-Length: 2\r\n\r\nhi";
    let origin = MockOrigin::spawn(vec![
        OriginResponse::keep(fresh),
        OriginResponse::keep(b"HTTP/1.1 304 Not Modified\r\n\r\n"),
    ]);
    let proxy = default_proxy();
    let request = proxied_get(&origin.authority(), "1.1");

    // first fetch populates the cache
    let mut first = connect_client(proxy);
    first.write_all(request.as_bytes()).unwrap();
    assert_eq!(read_response(&mut first), fresh.to_vec());
    assert!(origin.next_request().starts_with("GET / HTTP/1.1\r\n"));
    drop(first);

    // repeat fetch goes upstream as a conditional GET, the 304 makes the
    // proxy replay the cached 200 to the client
    let mut second = connect_client(proxy);
    second.write_all(request.as_bytes()).unwrap();
    assert_eq!(read_response(&mut second), fresh.to_vec());

    let revalidation = origin.next_request();
    assert!(
        revalidation.contains("If-None-Match: \"a\"\r\n"),
        "expected a conditional GET, got: {revalidation}"
    );
}

#[test]
fn keep_alive_reuses_upstream_connection() {
    let answer = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    let origin_a = MockOrigin::spawn(vec![
        OriginResponse::keep(answer),
        OriginResponse::keep(answer),
    ]);
    let origin_b = MockOrigin::spawn(vec![OriginResponse::keep(answer)]);
    let proxy = default_proxy();

    let mut client = connect_client(proxy);

    client
        .write_all(proxied_get(&origin_a.authority(), "1.1").as_bytes())
        .unwrap();
    assert_eq!(read_response(&mut client), answer.to_vec());
    origin_a.next_request();

    client
        .write_all(proxied_get(&origin_a.authority(), "1.1").as_bytes())
        .unwrap();
    assert_eq!(read_response(&mut client), answer.to_vec());
    origin_a.next_request();

    assert_eq!(
        origin_a.connection_count(),
        1,
        "same host:port must reuse the upstream socket"
    );

    // a different authority forces a fresh upstream connection
    client
        .write_all(proxied_get(&origin_b.authority(), "1.1").as_bytes())
        .unwrap();
    assert_eq!(read_response(&mut client), answer.to_vec());
    origin_b.next_request();

    assert_eq!(origin_b.connection_count(), 1);
    assert_eq!(origin_a.connection_count(), 1);
}

#[test]
fn connect_tunnel_copies_bytes_both_ways() {
    // raw echo server standing in for a TLS origin
    let echo_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    thread::spawn(move || {
        while let Ok((mut stream, _)) = echo_listener.accept() {
            thread::spawn(move || {
                let mut buffer = [0u8; 4096];
                while let Ok(size) = stream.read(&mut buffer) {
                    if size == 0 {
                        break;
                    }
                    if stream.write_all(&buffer[..size]).is_err() {
                        break;
                    }
                }
            });
        }
    });

    let proxy = default_proxy();
    let mut client = connect_client(proxy);
    client
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n",
                port = echo_addr.port()
            )
            .as_bytes(),
        )
        .unwrap();

    let mut established = Vec::new();
    let mut buffer = [0u8; 4096];
    while find_blank_line(&established).is_none() {
        let size = client.read(&mut buffer).expect("tunnel handshake");
        assert!(size > 0, "proxy closed during CONNECT handshake");
        established.extend_from_slice(&buffer[..size]);
    }
    let established = String::from_utf8_lossy(&established);
    assert!(
        established.starts_with("HTTP/1.1 200 Connection established\r\n"),
        "got: {established}"
    );

    let payload = b"\x16\x03\x01 opaque tunnel bytes";
    client.write_all(payload).unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).expect("echo through tunnel");
    assert_eq!(echoed, payload.to_vec());
}

#[test]
fn malformed_request_gets_exact_400_and_close() {
    let proxy = default_proxy();
    let mut client = connect_client(proxy);
    client.write_all(b"NOTAMETHOD /\r\n\r\n").unwrap();

    let mut answer = Vec::new();
    client.read_to_end(&mut answer).expect("answer then EOF");
    assert_eq!(answer, b"HTTP/1.1 400 Bad Request\r\n\r\n".to_vec());
}

#[test]
fn resolution_failure_gets_502() {
    let proxy = default_proxy();
    let mut client = connect_client(proxy);
    client
        .write_all(
            b"GET http://does-not-exist.invalid/ HTTP/1.0\r\nHost: does-not-exist.invalid\r\n\r\n",
        )
        .unwrap();

    let mut answer = Vec::new();
    client.read_to_end(&mut answer).expect("answer then EOF");
    assert_eq!(answer, b"HTTP/1.1 502 Bad Gateway\r\n\r\n".to_vec());
}

#[test]
fn idle_connection_is_torn_down() {
    let proxy = start_proxy(ServerConfig {
        resolver_workers: 1,
        idle_timeout: Duration::from_millis(500),
    });

    let mut client = connect_client(proxy);
    // send nothing: the proxy must close the connection on its own
    let mut buffer = [0u8; 16];
    let read = client.read(&mut buffer).expect("expected EOF, not a timeout");
    assert_eq!(read, 0);
}
