/*
 * server_integration.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the Locanda HTTP engine. Each test binds a real
 * listener on 127.0.0.1 and speaks raw HTTP/1.1 (and WebSocket framing)
 * over a TcpStream, verifying the full request/response cycle.
 *
 * Run with:
 *   cargo test -p locanda_core --test server_integration -- --nocapture
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use locanda_core::protocol::http::router::handler_fn;
use locanda_core::protocol::http::{HandlerError, Request, Response};
use locanda_core::protocol::websocket::{WebSocketHandler, WsOutbox};
use locanda_core::{ConnectionHandle, HttpServer, Method, RouteConfig, ServerConfig};

/// Raw HTTP client that keeps leftover bytes between responses so one
/// connection can carry several exchanges.
struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read one response: status, headers, body (Content-Length framing).
    async fn read_response(&mut self) -> (u16, Vec<(String, String)>, Vec<u8>) {
        let head_end = loop {
            if let Some(pos) = find_subslice(&self.buf, b"\r\n\r\n") {
                break pos;
            }
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed before response head");
            self.buf.extend_from_slice(&tmp[..n]);
        };
        let head = String::from_utf8(self.buf[..head_end].to_vec()).unwrap();
        self.buf.drain(..head_end + 4);

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
        let headers: Vec<(String, String)> = lines
            .map(|line| {
                let colon = line.find(':').unwrap();
                (
                    line[..colon].to_string(),
                    line[colon + 1..].trim().to_string(),
                )
            })
            .collect();

        let content_length: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| v.parse().unwrap())
            .unwrap_or(0);
        while self.buf.len() < content_length {
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed before response body");
            self.buf.extend_from_slice(&tmp[..n]);
        }
        let body = self.buf.drain(..content_length).collect();
        (status, headers, body)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn test_config() -> ServerConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    config.upload_dir = std::env::temp_dir().join(format!("locanda-it-{}", std::process::id()));
    config
}

async fn hello(
    _req: &mut Request,
    res: &mut Response,
    _conn: ConnectionHandle,
) -> Result<(), HandlerError> {
    res.render_string("hi");
    Ok(())
}

#[tokio::test]
async fn get_hello_keeps_connection_open() {
    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Get],
            "/hello",
            handler_fn(|req, res, conn| Box::pin(hello(req, res, conn))),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    let mut client = TestClient::connect(running.local_addr()).await;
    client
        .send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (status, headers, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Length"), Some("2"));
    assert_eq!(body, b"hi");
    assert!(header(&headers, "Date").is_some());
    assert!(header(&headers, "Server").is_some());

    // Connection stayed open: a second request succeeds on the same socket.
    client
        .send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (status, _, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hi");

    running.stop().await;
}

#[tokio::test]
async fn back_to_back_requests_answer_in_order() {
    let mut server = HttpServer::new(test_config());
    for path in ["/a", "/b"] {
        let marker = path.as_bytes()[1] as char;
        server
            .route(
                &[Method::Get],
                path,
                handler_fn(move |_req, res, _conn| {
                    Box::pin(async move {
                        res.render_string(marker.to_string());
                        Ok(())
                    })
                }),
                RouteConfig::default(),
            )
            .unwrap();
    }
    let running = server.bind().await.unwrap();

    let mut client = TestClient::connect(running.local_addr()).await;
    // Both requests in one write; the engine must answer A fully before B.
    client
        .send(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (status, _, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(body, b"a");
    let (status, _, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(body, b"b");

    running.stop().await;
}

#[tokio::test]
async fn multipart_upload_streams_to_files() {
    let observed: Arc<Mutex<Vec<(String, u64, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let observed_handler = observed.clone();

    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Post],
            "/upload",
            handler_fn(move |req, res, _conn| {
                let observed = observed_handler.clone();
                Box::pin(async move {
                    for part in req.upload_parts() {
                        observed.lock().unwrap().push((
                            part.field_name().to_string(),
                            part.size(),
                            part.path().exists(),
                        ));
                    }
                    for part in req.take_upload_parts() {
                        part.delete().await?;
                    }
                    res.render_string("multipart finished");
                    Ok(())
                })
            }),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    let file_payload = vec![0x5au8; 4096];
    let mut body = Vec::new();
    body.extend_from_slice(b"--X\r\nContent-Disposition: form-data; name=\"field1\"\r\n\r\nvalue\r\n");
    body.extend_from_slice(
        b"--X\r\nContent-Disposition: form-data; name=\"file1\"; filename=\"a.bin\"\r\n\
          Content-Type: application/octet-stream\r\n\r\n",
    );
    body.extend_from_slice(&file_payload);
    body.extend_from_slice(b"\r\n--X--\r\n");

    let mut request = Vec::new();
    request.extend_from_slice(b"POST /upload HTTP/1.1\r\nHost: x\r\n");
    request.extend_from_slice(b"Content-Type: multipart/form-data; boundary=X\r\n");
    request.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    request.extend_from_slice(&body);

    let mut client = TestClient::connect(running.local_addr()).await;
    client.send(&request).await;
    let (status, _, response_body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(response_body, b"multipart finished");

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0], ("field1".to_string(), 5, true));
    assert_eq!(observed[1], ("file1".to_string(), 4096, true));

    running.stop().await;
}

#[tokio::test]
async fn concurrent_cacheable_requests_build_once() {
    let builds = Arc::new(AtomicUsize::new(0));
    let builds_handler = builds.clone();

    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Get],
            "/expensive",
            handler_fn(move |_req, res, _conn| {
                let builds = builds_handler.clone();
                Box::pin(async move {
                    builds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    res.render_string("expensive result");
                    Ok(())
                })
            }),
            RouteConfig::cached(Some(Duration::from_secs(60))),
        )
        .unwrap();
    let running = server.bind().await.unwrap();
    let addr = running.local_addr();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await;
            client
                .send(b"GET /expensive?q=1 HTTP/1.1\r\nHost: x\r\n\r\n")
                .await;
            client.read_response().await
        }));
    }
    let mut bodies = Vec::new();
    for task in tasks {
        let (status, _, body) = task.await.unwrap();
        assert_eq!(status, 200);
        bodies.push(body);
    }
    assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    running.stop().await;
}

struct PingPong;

impl WebSocketHandler for PingPong {
    fn on_message(&mut self, out: &mut WsOutbox, payload: &[u8], is_binary: bool) {
        if !is_binary && payload == b"ping" {
            out.send_text("pong");
        }
    }
}

#[tokio::test]
async fn websocket_upgrade_and_text_echo() {
    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Get],
            "/chat",
            handler_fn(|_req, _res, conn| {
                Box::pin(async move {
                    conn.set_websocket_handler(Box::new(PingPong));
                    Ok(())
                })
            }),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    let mut stream = TcpStream::connect(running.local_addr()).await.unwrap();
    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: x\r\n\
              Upgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    // Read the 101 head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 "));
    assert!(head.contains("Sec-Websocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        || head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // Masked client text frame "ping".
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81u8, 0x84];
    frame.extend_from_slice(&mask);
    for (i, b) in b"ping".iter().enumerate() {
        frame.push(b ^ mask[i % 4]);
    }
    stream.write_all(&frame).await.unwrap();

    // Expect one unmasked text frame "pong".
    let mut reply_head = [0u8; 2];
    stream.read_exact(&mut reply_head).await.unwrap();
    assert_eq!(reply_head[0], 0x81);
    assert_eq!(reply_head[1], 4, "unmasked, length 4");
    let mut payload = [0u8; 4];
    stream.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"pong");

    running.stop().await;
}

#[tokio::test]
async fn router_errors_on_the_wire() {
    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Get, Method::Post],
            "/only",
            handler_fn(|req, res, conn| Box::pin(hello(req, res, conn))),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    let mut client = TestClient::connect(running.local_addr()).await;
    client
        .send(b"PUT /only HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (status, headers, _) = client.read_response().await;
    assert_eq!(status, 405);
    assert_eq!(header(&headers, "Allow"), Some("GET, POST"));

    // 405 keeps the connection alive.
    client
        .send(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (status, _, _) = client.read_response().await;
    assert_eq!(status, 404);

    client
        .send(b"OPTIONS /only HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (status, headers, _) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Allow"), Some("GET, POST"));

    running.stop().await;
}

#[tokio::test]
async fn chunked_request_body_is_decoded() {
    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Post],
            "/echo",
            handler_fn(|req, res, _conn| {
                let body = req.body_bytes().to_vec();
                Box::pin(async move {
                    res.render_string(String::from_utf8_lossy(&body).into_owned());
                    Ok(())
                })
            }),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    let mut client = TestClient::connect(running.local_addr()).await;
    client
        .send(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await;
    let (status, _, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(body, b"Wikipedia");

    running.stop().await;
}

#[tokio::test]
async fn gzip_encoding_negotiated() {
    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Get],
            "/compressed",
            handler_fn(|_req, res, _conn| {
                Box::pin(async move {
                    res.render_string("squeeze me squeeze me squeeze me");
                    res.set_content_encoding(locanda_core::ContentEncoding::Gzip);
                    Ok(())
                })
            }),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    // Client accepts gzip: response is gzip-encoded.
    let mut client = TestClient::connect(running.local_addr()).await;
    client
        .send(b"GET /compressed HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n")
        .await;
    let (status, headers, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Encoding"), Some("gzip"));
    assert_eq!(&body[..2], &[0x1f, 0x8b], "gzip magic");

    // Client that does not accept it gets identity.
    client
        .send(b"GET /compressed HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (status, headers, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert!(header(&headers, "Content-Encoding").is_none());
    assert_eq!(body, b"squeeze me squeeze me squeeze me");

    running.stop().await;
}

#[tokio::test]
async fn session_cookie_round_trip() {
    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Get],
            "/login",
            handler_fn(|_req, res, conn| {
                Box::pin(async move {
                    let session = conn.start_session(res)?;
                    session.set("userid", "1");
                    res.render_string("login");
                    Ok(())
                })
            }),
            RouteConfig::default(),
        )
        .unwrap();
    server
        .route(
            &[Method::Get],
            "/islogin",
            handler_fn(|req, res, conn| {
                Box::pin(async move {
                    let logged_in = conn
                        .session(req)
                        .and_then(|s| s.get("userid"))
                        .is_some_and(|v| v == "1");
                    res.render_string(if logged_in { "yes" } else { "no" });
                    Ok(())
                })
            }),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    let mut client = TestClient::connect(running.local_addr()).await;
    client
        .send(b"GET /islogin HTTP/1.1\r\nHost: x\r\n\r\n")
        .await;
    let (_, _, body) = client.read_response().await;
    assert_eq!(body, b"no");

    client.send(b"GET /login HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let (status, headers, _) = client.read_response().await;
    assert_eq!(status, 200);
    let cookie = header(&headers, "Set-Cookie").unwrap().to_string();
    let token_pair = cookie.split(';').next().unwrap();

    client
        .send(format!("GET /islogin HTTP/1.1\r\nHost: x\r\nCookie: {}\r\n\r\n", token_pair).as_bytes())
        .await;
    let (_, _, body) = client.read_response().await;
    assert_eq!(body, b"yes");

    running.stop().await;
}

#[tokio::test]
async fn connection_close_honoured() {
    let mut server = HttpServer::new(test_config());
    server
        .route(
            &[Method::Get],
            "/hello",
            handler_fn(|req, res, conn| Box::pin(hello(req, res, conn))),
            RouteConfig::default(),
        )
        .unwrap();
    let running = server.bind().await.unwrap();

    let mut client = TestClient::connect(running.local_addr()).await;
    client
        .send(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await;
    let (status, headers, body) = client.read_response().await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hi");
    assert_eq!(header(&headers, "Connection"), Some("close"));

    // Server closes: the next read returns EOF.
    let mut tmp = [0u8; 16];
    let n = client.stream.read(&mut tmp).await.unwrap();
    assert_eq!(n, 0);

    running.stop().await;
}
