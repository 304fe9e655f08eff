//! End-to-end scenarios across the orchestrator, bridge and native
//! transport.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use osrv::core::bridge::{BridgeEnvelope, BridgeRequest, BridgeRuntime, BridgeTransport};
use osrv::core::encoding::{base64_decode, base64_encode};
use osrv::prelude::*;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    futures_executor::block_on(fut)
}

fn text_fetch(
    _req: &mut Request,
) -> std::future::Ready<Result<Response, ServerError>> {
    std::future::ready(Ok(Response::text("ok")))
}

fn local_request(path: &str) -> Request {
    Request::new(
        Method::Get,
        Url::parse(&format!("http://localhost{path}")).unwrap(),
    )
}

// ----------------------------------------------------------------------
// Scenario: basic GET through dispatch.
// ----------------------------------------------------------------------
#[test]
fn basic_get_returns_ok() {
    let server = Server::builder(text_fetch).env(HashMap::new()).build();
    let mut req = local_request("/");
    let mut resp = block_on(server.dispatch(&mut req));
    assert_eq!(resp.status().as_u16(), 200);
    match resp.take_body() {
        ResponseBody::Bytes(b) => assert_eq!(b, b"ok"),
        other => panic!("unexpected body {other:?}"),
    }
}

// ----------------------------------------------------------------------
// Scenario: middleware onion order.
// ----------------------------------------------------------------------
struct Label {
    name: &'static str,
    trace: Arc<Mutex<Vec<String>>>,
}

impl Middleware for Label {
    fn handle<'a>(
        &'a self,
        req: &'a mut Request,
        next: Next<'a>,
    ) -> osrv::BoxFuture<'a, Result<Response, ServerError>> {
        Box::pin(async move {
            self.trace.lock().push(format!("{}-before", self.name));
            let resp = next.run(req).await;
            self.trace.lock().push(format!("{}-after", self.name));
            resp
        })
    }
}

#[test]
fn middleware_order_matches_contract() {
    let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let fetch_trace = trace.clone();

    let server = Server::builder(move |_req: &mut Request| {
        fetch_trace.lock().push("fetch".to_string());
        std::future::ready(Ok(Response::text("ok")))
    })
    .middleware(Label {
        name: "m1",
        trace: trace.clone(),
    })
    .middleware(Label {
        name: "m2",
        trace: trace.clone(),
    })
    .env(HashMap::new())
    .build();

    let mut req = local_request("/");
    let resp = block_on(server.dispatch(&mut req));
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        *trace.lock(),
        vec!["m1-before", "m2-before", "fetch", "m2-after", "m1-after"]
    );
}

// ----------------------------------------------------------------------
// Scenario: plugin lifecycle hook order.
// ----------------------------------------------------------------------
struct HookRecorder {
    hooks: Arc<Mutex<Vec<&'static str>>>,
}

impl Plugin for HookRecorder {
    fn on_register(&self) -> osrv::BoxFuture<'_, osrv::HookResult> {
        self.hooks.lock().push("register");
        Box::pin(std::future::ready(Ok(())))
    }
    fn on_before_serve(&self) -> osrv::BoxFuture<'_, osrv::HookResult> {
        self.hooks.lock().push("beforeServe");
        Box::pin(std::future::ready(Ok(())))
    }
    fn on_after_serve(&self) -> osrv::BoxFuture<'_, osrv::HookResult> {
        self.hooks.lock().push("afterServe");
        Box::pin(std::future::ready(Ok(())))
    }
    fn on_before_close(&self) -> osrv::BoxFuture<'_, osrv::HookResult> {
        self.hooks.lock().push("beforeClose");
        Box::pin(std::future::ready(Ok(())))
    }
    fn on_after_close(&self) -> osrv::BoxFuture<'_, osrv::HookResult> {
        self.hooks.lock().push("afterClose");
        Box::pin(std::future::ready(Ok(())))
    }
}

#[test]
fn plugin_lifecycle_order() {
    let hooks: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (bridge, handle) = BridgeTransport::new();
    let mut server = Server::builder(text_fetch)
        .plugin(HookRecorder {
            hooks: hooks.clone(),
        })
        .transport(Box::new(bridge))
        .env(HashMap::new())
        .build();

    block_on(async {
        server.serve().await.expect("serve");
        let _ = handle
            .handle(envelope("http://example.com/", "GET", None))
            .await
            .expect("one request");
        server.close(false).await.expect("close");
    });

    assert_eq!(
        *hooks.lock(),
        vec!["register", "beforeServe", "afterServe", "beforeClose", "afterClose"]
    );
    assert!(!server.is_serving());
}

// ----------------------------------------------------------------------
// Scenario: body-size limit produces the documented 413 shape.
// ----------------------------------------------------------------------
#[test]
fn body_limit_yields_documented_413() {
    let server = Server::builder(|req: &mut Request| {
        let body = req.take_body();
        async move {
            let bytes = body.into_bytes_async().await?;
            Ok(Response::text(format!("{} bytes", bytes.len())))
        }
    })
    .env(HashMap::new())
    .build();

    // The transport's limiter hands the handler a body that fails at
    // consumption time, exactly as a POST of 10 bytes against a 4-byte
    // limit does on the wire.
    let mut req = local_request("/upload");
    req.set_body(osrv::Body::failed(osrv::BodyError::TooLarge {
        max: 4,
        actual: 10,
    }));
    let response = block_on(server.dispatch(&mut req));

    assert_eq!(response.status().as_u16(), 413);
    let json = body_json(response);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"], "Request body too large");
    assert_eq!(json["maxBytes"], 4);
    assert_eq!(json["actualBytes"], 10);
}

// ----------------------------------------------------------------------
// Scenario: production default error hides details.
// ----------------------------------------------------------------------
#[test]
fn production_default_error_has_no_details() {
    let mut env = HashMap::new();
    env.insert("OSRV_ENV".to_string(), "production".to_string());
    let server = Server::builder(|_req: &mut Request| {
        std::future::ready(Err::<Response, _>(ServerError::handler("boom")))
    })
    .env(env)
    .build();

    let mut req = local_request("/");
    let resp = block_on(server.dispatch(&mut req));
    assert_eq!(resp.status().as_u16(), 500);
    let json = body_json(resp);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"], "Internal Server Error");
    assert!(json.get("details").is_none());
    assert!(json.get("stack").is_none());
}

// ----------------------------------------------------------------------
// Round-trip law: response through the bridge envelope.
// ----------------------------------------------------------------------
fn envelope(url: &str, method: &str, body: Option<&[u8]>) -> BridgeEnvelope {
    BridgeEnvelope {
        request: BridgeRequest {
            url: url.to_string(),
            method: method.to_string(),
            headers: vec![
                ("X-One".to_string(), "1".to_string()),
                ("X-Two".to_string(), "2".to_string()),
                ("X-One".to_string(), "3".to_string()),
            ],
            body_base64: body.map(base64_encode),
        },
        runtime: BridgeRuntime {
            provider: "node".to_string(),
            runtime: "node".to_string(),
            protocol: "http".to_string(),
            http_version: "1.1".to_string(),
            tls: false,
            ip: None,
            local_address: None,
            remote_address: None,
            env: HashMap::new(),
            request_id: None,
        },
        context: serde_json::Map::new(),
    }
}

#[test]
fn bridge_round_trip_preserves_headers_and_body() {
    let (bridge, handle) = BridgeTransport::new();
    let mut server = Server::builder(|req: &mut Request| {
        // Echo request header multiset and body through the response.
        let ones: Vec<String> = req
            .headers()
            .get_all("x-one")
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect();
        let body = req.take_body();
        async move {
            let bytes = body.into_bytes_async().await?;
            let mut resp = Response::ok()
                .header("set-cookie", b"a=1".to_vec())
                .header("set-cookie", b"b=2".to_vec())
                .body(ResponseBody::Bytes(bytes));
            for v in ones {
                resp = resp.header("x-echoed-one", v.into_bytes());
            }
            Ok(resp)
        }
    })
    .transport(Box::new(bridge))
    .env(HashMap::new())
    .build();

    block_on(async {
        server.serve().await.expect("serve");
        let response = handle
            .handle(envelope("http://example.com/echo", "POST", Some(b"payload")))
            .await
            .expect("bridge call");

        assert_eq!(response.status, 200);
        // Request header order and multiplicity survived.
        let echoed: Vec<&str> = response
            .headers
            .iter()
            .filter(|(n, _)| n == "x-echoed-one")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(echoed, vec!["1", "3"]);
        // Response set-cookie multiplicity survived serialization.
        let cookies: Vec<&str> = response
            .headers
            .iter()
            .filter(|(n, _)| n == "set-cookie")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        // Body bytes round-tripped through base64.
        assert_eq!(
            base64_decode(response.body_base64.as_deref().unwrap()).unwrap(),
            b"payload"
        );
        server.close(false).await.expect("close");
    });
}

// ----------------------------------------------------------------------
// waitUntil drains before graceful close completes.
// ----------------------------------------------------------------------
#[test]
fn wait_until_settles_before_graceful_close() {
    let (bridge, handle) = BridgeTransport::new();
    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let done_flag = done.clone();
    let mut server = Server::builder(move |req: &mut Request| {
        let flag = done_flag.clone();
        req.wait_until(async move {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        std::future::ready(Ok(Response::text("queued")))
    })
    .transport(Box::new(bridge))
    .env(HashMap::new())
    .build();

    block_on(async {
        server.serve().await.expect("serve");
        handle
            .handle(envelope("http://example.com/", "GET", None))
            .await
            .expect("request");
        server.close(false).await.expect("close");
    });
    assert!(
        done.load(std::sync::atomic::Ordering::SeqCst),
        "graceful close waited for the background task"
    );
}

// ----------------------------------------------------------------------
// Native transport: a real GET over a socket, then keep-alive reuse.
// ----------------------------------------------------------------------
#[test]
fn native_transport_serves_real_sockets() {
    let mut server = osrv::server(|req: &mut Request| {
        let path = req.url().path().to_string();
        std::future::ready(Ok(Response::text(format!("hello {path}"))))
    })
    .options(ServerOptions {
        hostname: Some("127.0.0.1".to_string()),
        port: Some(0),
        ..ServerOptions::default()
    })
    .env(HashMap::new())
    .build();

    block_on(server.serve()).expect("serve");
    let addr = server.local_addr().expect("bound address");
    let caps = server.capabilities().expect("capabilities").clone();
    assert!(caps.http1);
    assert!(caps.websocket);
    assert!(!caps.http2, "plain listener has no h2");

    let mut conn = std::net::TcpStream::connect(addr).expect("connect");
    conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Two requests on one connection exercise keep-alive.
    for path in ["/first", "/second"] {
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        conn.write_all(request.as_bytes()).expect("write");
        let response = read_http_response(&mut conn);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with(&format!("hello {path}")), "{response}");
    }
    drop(conn);

    block_on(server.close(false)).expect("close");
    assert!(!server.is_serving());
}

/// Read one HTTP/1.1 response (content-length framed) as a string.
fn read_http_response(conn: &mut std::net::TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if let Some(head_end) = find_subsequence(&data, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            let body_start = head_end + 4;
            while data.len() < body_start + content_length {
                let n = conn.read(&mut buf).expect("read body");
                assert!(n > 0, "connection closed mid-body");
                data.extend_from_slice(&buf[..n]);
            }
            return String::from_utf8_lossy(&data[..body_start + content_length]).into_owned();
        }
        let n = conn.read(&mut buf).expect("read head");
        assert!(n > 0, "connection closed mid-head");
        data.extend_from_slice(&buf[..n]);
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn body_json(mut resp: Response) -> serde_json::Value {
    match resp.take_body() {
        ResponseBody::Bytes(b) => serde_json::from_slice(&b).expect("json body"),
        other => panic!("unexpected body {other:?}"),
    }
}
