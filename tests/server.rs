use forja::error::Error;
use forja::http::{Flags, HttpRequest, Method, StatusCode};
use forja::transport::{self, ServerTransport, TransportConfig};
use forja::{server, status, Connection, HttpResponse, Uri};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spin up a transport with the status page and an echo handler on an
/// ephemeral port.
async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let transport =
        ServerTransport::new(&TransportConfig::new(format!("it-{}", addr.port()))).unwrap();
    status::bind(&transport, "/status").unwrap();
    transport
        .bind_handler(
            "/echo",
            transport::handler(|context| async move {
                Ok(HttpResponse::text(StatusCode::OK, context.request.body))
            }),
        )
        .unwrap();
    transport
        .bind_handler(
            "/fail",
            transport::handler(|_context| async move {
                Err::<HttpResponse, _>(Error::Handler("deliberate".into()))
            }),
        )
        .unwrap();
    transport
        .bind_handler(
            "/big",
            transport::handler(|_context| async move {
                Ok(HttpResponse::text(StatusCode::OK, "x".repeat(200 * 1024)))
            }),
        )
        .unwrap();

    tokio::spawn(server::run(
        listener,
        transport,
        std::future::pending::<()>(),
    ));
    addr
}

fn get(path: &str) -> HttpRequest {
    let mut request = HttpRequest::new(Method::Get, Uri::parse(path).unwrap());
    request.headers.set("Host", "localhost");
    request
}

fn post(path: &str, body: &str) -> HttpRequest {
    let mut request = HttpRequest::new(Method::Post, Uri::parse(path).unwrap());
    request.headers.set("Host", "localhost");
    request.body = body.to_string().into();
    request
}

#[tokio::test]
async fn status_page_over_keep_alive() {
    let addr = start_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);

    connection.write_request(&get("/status")).await.unwrap();
    let response = connection.read_response().await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.headers.get("Content-Type"),
        Some("text/plain; charset=utf-8")
    );
    let body = String::from_utf8(response.body.to_vec()).unwrap();
    assert!(body.contains("============"));
    assert!(body.contains("GENERAL"));
    assert!(response.keep_alive());

    // The connection stays usable for a second exchange.
    connection.write_request(&get("/status")).await.unwrap();
    let second = connection.read_response().await.unwrap().unwrap();
    assert_eq!(second.status, StatusCode::OK);
}

#[tokio::test]
async fn status_page_raw_metrics() {
    let addr = start_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);

    connection
        .write_request(&get("/status?raw"))
        .await
        .unwrap();
    let response = connection.read_response().await.unwrap().unwrap();
    let body = String::from_utf8(response.body.to_vec()).unwrap();
    assert!(body.contains("RAW METRICS"));
}

#[tokio::test]
async fn echo_with_content_length() {
    let addr = start_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);

    connection
        .write_request(&post("/echo", "hello"))
        .await
        .unwrap();
    let response = connection.read_response().await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"hello");
}

#[tokio::test]
async fn echo_with_chunked_body() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    socket
        .write_all(
            b"POST /echo HTTP/1.1\r\n\
              Host: localhost\r\n\
              Transfer-Encoding: chunked\r\n\
              \r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut connection = Connection::new(socket);
    let response = connection.read_response().await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"hello world");
}

#[tokio::test]
async fn oversize_header_gets_413_and_close() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    let mut wire = b"GET /echo HTTP/1.1\r\nX-Pad: ".to_vec();
    wire.extend(std::iter::repeat(b'a').take(8 * 1024));
    wire.extend_from_slice(b"\r\n\r\n");
    socket.write_all(&wire).await.unwrap();

    // The server answers 413 and closes after a short drain.
    let mut raw = Vec::new();
    socket.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 413"));
    assert!(text.contains("Connection: close"));
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    socket
        .write_all(b"BREW /echo HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    socket.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn large_response_streams_chunked() {
    let addr = start_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);

    connection.write_request(&get("/big")).await.unwrap();
    let response = connection.read_response().await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.flags.contains(Flags::CHUNKED));
    assert_eq!(response.body.len(), 200 * 1024);
    assert!(response.body.iter().all(|&b| b == b'x'));

    // Chunked coding is self-delimiting: keep-alive survives it.
    connection.write_request(&get("/status")).await.unwrap();
    let second = connection.read_response().await.unwrap().unwrap();
    assert_eq!(second.status, StatusCode::OK);
}

#[tokio::test]
async fn unbound_path_gets_404() {
    let addr = start_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);

    connection.write_request(&get("/nowhere")).await.unwrap();
    let response = connection.read_response().await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn handler_failure_becomes_json_envelope() {
    let addr = start_server().await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);

    connection.write_request(&get("/fail")).await.unwrap();
    let response = connection.read_response().await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.headers.get("Content-Type"),
        Some("application/json")
    );
    let body = String::from_utf8(response.body.to_vec()).unwrap();
    assert!(body.contains(r#""status":false"#));
    assert!(body.contains("deliberate"));
}

#[tokio::test]
async fn http10_connection_closes_after_response() {
    let addr = start_server().await;
    let mut socket = TcpStream::connect(addr).await.unwrap();

    socket
        .write_all(b"GET /status HTTP/1.0\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    socket.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.0") || text.starts_with("HTTP/1.1"));
    assert!(text.contains("Connection: close"));
}

#[tokio::test]
async fn graceful_shutdown_drains_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let transport =
        ServerTransport::new(&TransportConfig::new(format!("it-shutdown-{}", addr.port())))
            .unwrap();
    status::bind(&transport, "/status").unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(server::run(listener, transport, async {
        let _ = stop_rx.await;
    }));

    // One request, then shutdown; run() must come back.
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut connection = Connection::new(socket);
    connection.write_request(&get("/status")).await.unwrap();
    connection.read_response().await.unwrap().unwrap();
    drop(connection);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap();
}
