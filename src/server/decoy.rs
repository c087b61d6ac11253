//! Decoy HTTP responder
//!
//! Connections whose first bytes look like an HTTP request get a plain web
//! server's answer: a default landing page for `/`, 404 elsewhere, and the
//! connection closes.

use crate::transport::AsyncStream;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

/// Longest request head read before answering
const MAX_REQUEST_HEAD: u64 = 8 * 1024;

/// Time allowed for the request head
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const SERVER_NAME: &str = "nginx";

const METHODS: &[&str] = &["GET ", "POST ", "HEAD ", "PUT ", "DELETE ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE "];

/// Longest method prefix, including the space
pub const HTTP_SNIFF_LEN: usize = 8;

const WELCOME_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head>\n<title>Welcome to nginx!</title>\n</head>\n<body>\n<h1>Welcome to nginx!</h1>\n<p>If you see this page, the nginx web server is successfully installed and working. Further configuration is required.</p>\n</body>\n</html>\n";

const NOT_FOUND_PAGE: &str = "<html>\r\n<head><title>404 Not Found</title></head>\r\n<body>\r\n<center><h1>404 Not Found</h1></center>\r\n<hr><center>nginx</center>\r\n</body>\r\n</html>\r\n";

const BAD_REQUEST_PAGE: &str = "<html>\r\n<head><title>400 Bad Request</title></head>\r\n<body>\r\n<center><h1>400 Bad Request</h1></center>\r\n<hr><center>nginx</center>\r\n</body>\r\n</html>\r\n";

const NOT_ALLOWED_PAGE: &str = "<html>\r\n<head><title>405 Not Allowed</title></head>\r\n<body>\r\n<center><h1>405 Not Allowed</h1></center>\r\n<hr><center>nginx</center>\r\n</body>\r\n</html>\r\n";

/// Whether `prefix` begins with an HTTP method and a space
pub fn looks_like_http(prefix: &[u8]) -> bool {
    METHODS.iter().any(|m| prefix.starts_with(m.as_bytes()))
}

struct Response {
    status: &'static str,
    body: &'static str,
    send_body: bool,
}

fn respond_to(request_line: &str) -> Response {
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Response {
            status: "400 Bad Request",
            body: BAD_REQUEST_PAGE,
            send_body: true,
        };
    }

    let (method, path) = (parts[0], parts[1]);
    let send_body = method != "HEAD";
    match (method, path) {
        ("GET" | "HEAD", "/" | "/index.html") => Response {
            status: "200 OK",
            body: WELCOME_PAGE,
            send_body,
        },
        ("GET" | "HEAD", _) => Response {
            status: "404 Not Found",
            body: NOT_FOUND_PAGE,
            send_body,
        },
        _ => Response {
            status: "405 Not Allowed",
            body: NOT_ALLOWED_PAGE,
            send_body: true,
        },
    }
}

/// Read one request head from `stream` and answer it like a web server
pub async fn serve_decoy(stream: &mut dyn AsyncStream) -> io::Result<()> {
    let mut reader = BufReader::new((&mut *stream).take(MAX_REQUEST_HEAD));

    let mut request_line = String::new();
    let head = async {
        reader.read_line(&mut request_line).await?;
        // Read headers
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
                break;
            }
        }
        Ok::<(), io::Error>(())
    };
    // A slow or oversized request still gets an answer
    let _ = tokio::time::timeout(REQUEST_TIMEOUT, head).await;
    drop(reader);

    let response = respond_to(request_line.trim());
    debug!("Decoy answered {:?} with {}", request_line.trim(), response.status);

    let mut out = format!(
        "HTTP/1.1 {}\r\nServer: {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        SERVER_NAME,
        response.body.len()
    )
    .into_bytes();
    if response.send_body {
        out.extend_from_slice(response.body.as_bytes());
    }

    stream.write_all(&out).await?;
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_detection() {
        assert!(looks_like_http(b"GET / HT"));
        assert!(looks_like_http(b"OPTIONS "));
        assert!(!looks_like_http(b"GETX / H"));
        assert!(!looks_like_http(&[0x16, 0x03, 0x01, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_responses() {
        assert_eq!(respond_to("GET / HTTP/1.1").status, "200 OK");
        assert_eq!(respond_to("GET /admin HTTP/1.1").status, "404 Not Found");
        assert_eq!(respond_to("POST / HTTP/1.1").status, "405 Not Allowed");
        assert_eq!(respond_to("garbage").status, "400 Bad Request");
        assert!(!respond_to("HEAD / HTTP/1.1").send_body);
    }

    #[tokio::test]
    async fn test_serve_decoy() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            let mut server: Box<dyn AsyncStream> = Box::new(server);
            serve_decoy(server.as_mut()).await
        });

        client
            .write_all(b"GET /secret HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Server: nginx\r\n"));
        assert!(response.ends_with("</html>\r\n"));
        task.await.unwrap().unwrap();
    }
}
