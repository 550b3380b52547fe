//! Full-stack acceptance tests: a local axum app, a real tunnel server and
//! the real client supervisor, all over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use burrow_client::events::{ConnectionState, TunnelEvent};
use burrow_client::{EventBus, SupervisorOptions};
use burrow_server::{api, config::ServerConfig, AppState};

const API_KEY: &str = "acceptance-key";

async fn spawn_tunnel_server() -> (SocketAddr, Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        api_key: API_KEY.to_string(),
        base_domain: "tunnel.test".to_string(),
        port: 0,
        cache_path: dir.path().join("subdomains.json"),
    };
    let state = AppState::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, dir)
}

/// The app being exposed: a few routes that exercise every response mode.
async fn spawn_local_app() -> u16 {
    async fn hello() -> impl IntoResponse {
        ([(header::CONTENT_TYPE, "text/plain")], "hello world")
    }

    async fn page() -> impl IntoResponse {
        let body = "<p>lorem ipsum dolor sit amet</p>\n".repeat(200);
        ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body)
    }

    async fn blob() -> impl IntoResponse {
        let body: Vec<u8> = (0..600 * 1024).map(|i| (i % 251) as u8).collect();
        ([(header::CONTENT_TYPE, "application/octet-stream")], body)
    }

    // Always answers 200 + ETag; the tunnel client is the one expected to
    // turn that into a 304 on a matching If-None-Match.
    async fn asset() -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, "W/\"abc\"")
            .header(header::CACHE_CONTROL, "max-age=60")
            .header(header::CONTENT_TYPE, "application/javascript")
            .body(Body::from("console.log('cached');"))
            .unwrap()
    }

    async fn events() -> Response {
        let chunks = vec![
            Ok::<_, std::convert::Infallible>("data: one\n\n"),
            Ok("data: two\n\n"),
        ];
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(futures_util::stream::iter(chunks)))
            .unwrap()
    }

    let app = Router::new()
        .route("/hello", get(hello))
        .route("/page", get(page))
        .route("/blob", get(blob))
        .route("/asset.js", get(asset))
        .route("/events", get(events));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Start the real client against the server and wait until it is registered.
async fn spawn_client(server_addr: SocketAddr, local_port: u16) -> String {
    let events = EventBus::default();
    let mut rx = events.subscribe();

    let options = SupervisorOptions {
        server_url: format!("http://{}", server_addr),
        api_key: API_KEY.to_string(),
        local_port,
        initial_subdomain: None,
        store: None,
    };
    let supervisor_events = events.clone();
    tokio::spawn(async move {
        let _ = burrow_client::supervisor::run(options, supervisor_events).await;
    });

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("client never connected"),
            event = rx.recv() => {
                if let Ok(TunnelEvent::ConnectionState(ConnectionState::Connected { subdomain })) =
                    event
                {
                    return subdomain;
                }
            }
        }
    }
}

/// Public-side client that does not negotiate or undo any encoding itself.
fn raw_public_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .no_zstd()
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_small_text_response() {
    let (server_addr, _state, _dir) = spawn_tunnel_server().await;
    let local_port = spawn_local_app().await;
    let subdomain = spawn_client(server_addr, local_port).await;

    let response = raw_public_client()
        .get(format!("http://{}/hello", server_addr))
        .header("X-Tunnel-Subdomain", &subdomain)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    // Too small to compress, so it stays identity-encoded.
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(response.text().await.unwrap(), "hello world");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compressible_page_is_zstd_encoded() {
    let (server_addr, _state, _dir) = spawn_tunnel_server().await;
    let local_port = spawn_local_app().await;
    let subdomain = spawn_client(server_addr, local_port).await;

    let expected = "<p>lorem ipsum dolor sit amet</p>\n".repeat(200);
    let response = raw_public_client()
        .get(format!("http://{}/page", server_addr))
        .header("X-Tunnel-Subdomain", &subdomain)
        .header(header::ACCEPT_ENCODING, "gzip, br, zstd")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[header::CONTENT_ENCODING].to_str().unwrap(),
        "zstd"
    );
    let compressed = response.bytes().await.unwrap();
    assert!(compressed.len() < expected.len());
    let restored = zstd::bulk::decompress(&compressed, expected.len()).unwrap();
    assert_eq!(String::from_utf8(restored).unwrap(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_binary_streams_untouched() {
    let (server_addr, _state, _dir) = spawn_tunnel_server().await;
    let local_port = spawn_local_app().await;
    let subdomain = spawn_client(server_addr, local_port).await;

    let response = raw_public_client()
        .get(format!("http://{}/blob", server_addr))
        .header("X-Tunnel-Subdomain", &subdomain)
        .header(header::ACCEPT_ENCODING, "gzip, br, zstd")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    // Incompressible content type: no encoding added.
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 600 * 1024);
    let expected: Vec<u8> = (0..600 * 1024).map(|i| (i % 251) as u8).collect();
    assert_eq!(body.to_vec(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conditional_get_short_circuits() {
    let (server_addr, _state, _dir) = spawn_tunnel_server().await;
    let local_port = spawn_local_app().await;
    let subdomain = spawn_client(server_addr, local_port).await;

    let response = raw_public_client()
        .get(format!("http://{}/asset.js", server_addr))
        .header("X-Tunnel-Subdomain", &subdomain)
        .header(header::IF_NONE_MATCH, "\"abc\"")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 304);
    assert_eq!(
        response.headers()[header::ETAG].to_str().unwrap(),
        "W/\"abc\""
    );
    assert_eq!(
        response.headers()[header::CACHE_CONTROL].to_str().unwrap(),
        "max-age=60"
    );
    assert_eq!(response.text().await.unwrap(), "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sse_stream() {
    let (server_addr, _state, _dir) = spawn_tunnel_server().await;
    let local_port = spawn_local_app().await;
    let subdomain = spawn_client(server_addr, local_port).await;

    let response = raw_public_client()
        .get(format!("http://{}/events", server_addr))
        .header("X-Tunnel-Subdomain", &subdomain)
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "text/event-stream"
    );
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    assert_eq!(
        response.text().await.unwrap(),
        "data: one\n\ndata: two\n\n"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_loopback_is_bad_gateway() {
    let (server_addr, _state, _dir) = spawn_tunnel_server().await;
    // Point the client at a port nothing listens on.
    let dead_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let subdomain = spawn_client(server_addr, dead_port).await;

    let response = raw_public_client()
        .get(format!("http://{}/anything", server_addr))
        .header("X-Tunnel-Subdomain", &subdomain)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert!(response.text().await.unwrap().starts_with("Bad Gateway"));
}
