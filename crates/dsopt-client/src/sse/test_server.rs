//! Raw TCP server for exercising connection drops the mock server can't
//! produce.

use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

/// Serves two connections: the first is closed after its request head
/// arrives, the second answers with `body` as an event stream.
///
/// Returns the base URL and a handle that yields the number of
/// connections accepted.
pub(crate) fn drop_then_serve(body: &'static str) -> (String, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}", listener.local_addr().expect("addr"));
    let handle = std::thread::spawn(move || {
        let (first, _) = listener.accept().expect("first accept");
        read_head(&first);
        drop(first);

        let (mut second, _) = listener.accept().expect("second accept");
        read_head(&second);
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        second.write_all(response.as_bytes()).expect("write");
        second.flush().expect("flush");
        2
    });
    (url, handle)
}

fn read_head(mut socket: &TcpStream) {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => seen.extend_from_slice(&buf[..n]),
        }
    }
}
