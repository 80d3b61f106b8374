use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::time::Duration;

/// Plain HTTP/1.1 response with a JSON body.
pub fn http_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Accepts one connection and reports its request head. With no response the
/// socket is held open and silent.
pub fn stub_server(response: Option<String>) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let (head_tx, head_rx) = mpsc::channel();

    std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut head = Vec::new();
        let mut buffer = [0u8; 1024];
        while !head.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = socket.read(&mut buffer).unwrap_or(0);
            if read == 0 {
                break;
            }
            head.extend_from_slice(&buffer[..read]);
        }
        let _ = head_tx.send(String::from_utf8_lossy(&head).into_owned());

        match response {
            Some(response) => {
                let _ = socket.write_all(response.as_bytes());
            }
            None => std::thread::sleep(Duration::from_secs(5)),
        }
    });

    (format!("http://{address}"), head_rx)
}
