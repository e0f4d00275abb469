//! End-to-end tests: a real axum server on a loopback port, driven by
//! real WebSocket and long-poll clients.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use strait_client::{ChannelClient, ClientOptions, TransportKind};
use strait_core::{Event, EventId, Uid};
use strait_server::{ChannelServer, RequestCtx, ServerEventMsg, ServerOptions};
use testresult::TestResult;

static TRACING: OnceLock<()> = OnceLock::new();

fn init_tracing() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter("strait_core=debug,strait_server=debug,strait_client=debug")
            .init();
    });
}

fn test_server_options() -> ServerOptions {
    ServerOptions {
        user_id_fn: Arc::new(|ctx: &RequestCtx| {
            ctx.query.get("uid").map(|s| Uid::new(s.as_str()))
        }),
        disconnect_grace: Duration::from_millis(300),
        ..ServerOptions::default()
    }
}

async fn serve(server: &ChannelServer) -> anyhow::Result<SocketAddr> {
    let app = server.router("/chsk");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await?;
        Ok::<(), anyhow::Error>(())
    });
    Ok(addr)
}

fn client_options(kind: TransportKind, uid: &str) -> ClientOptions {
    ClientOptions {
        kind,
        params: vec![("uid".to_owned(), uid.to_owned())],
        lp_timeout: Duration::from_secs(2),
        ..ClientOptions::default()
    }
}

/// Reply `"pong"` to every `app/ping`; forward everything else.
fn spawn_echo_handler(
    server: &ChannelServer,
) -> async_channel::Receiver<ServerEventMsg> {
    let (seen_tx, seen_rx) = async_channel::unbounded();
    let events = server.events();
    tokio::spawn(async move {
        while let Ok(msg) = events.recv().await {
            if msg.event.id == "app/ping" {
                if let Some(reply) = &msg.reply {
                    reply.resolve(json!("pong"));
                }
            }
            let _ = seen_tx.send(msg).await;
        }
    });
    seen_rx
}

async fn wait_open(client: &ChannelClient) -> anyhow::Result<()> {
    let mut state = client.state();
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if state.borrow().open {
                return Ok::<(), anyhow::Error>(());
            }
            state.changed().await?;
        }
    })
    .await??;
    Ok(())
}

fn app_event(id: &str, payload: Option<serde_json::Value>) -> Event {
    Event::new(EventId::new(id).expect("valid id"), payload)
}

/// Wait for the next wrapped application event and unwrap it.
async fn next_recv(rx: &async_channel::Receiver<Event>) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let ev = tokio::time::timeout_at(deadline, rx.recv()).await??;
        if ev.id == "chsk/recv" {
            return Ok(ev.payload.expect("recv payload"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ws_echo_and_timeout() -> TestResult {
    init_tracing();
    let server = ChannelServer::new(test_server_options());
    let _seen = spawn_echo_handler(&server);
    let addr = serve(&server).await?;

    let client = ChannelClient::connect(
        &format!("http://{addr}/chsk"),
        client_options(TransportKind::Ws, "alice"),
    )?;
    wait_open(&client).await?;
    assert_eq!(
        client.state().borrow().uid,
        Some(Uid::new("alice")),
        "handshake must carry the uid"
    );

    // Echo: the reply arrives well inside the timeout.
    let reply = client
        .call(app_event("app/ping", Some(json!(1))), Duration::from_millis(1000))
        .await?;
    assert_eq!(reply, json!("pong"));

    // Timeout: the handler never resolves `app/slow`.
    let err = client
        .call(app_event("app/slow", None), Duration::from_millis(100))
        .await
        .expect_err("no reply should arrive");
    assert!(matches!(err, strait_client::CallError::Timeout));

    client.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ws_push_coalesces_in_order() -> TestResult {
    init_tracing();
    let server = ChannelServer::new(test_server_options());
    let _seen = spawn_echo_handler(&server);
    let addr = serve(&server).await?;

    let client = ChannelClient::connect(
        &format!("http://{addr}/chsk"),
        client_options(TransportKind::Ws, "bob"),
    )?;
    wait_open(&client).await?;

    let uid = Uid::new("bob");
    server.push(&uid, app_event("a/1", None));
    server.push(&uid, app_event("a/2", None));
    server.push(&uid, app_event("a/3", None));

    let events = client.events();
    assert_eq!(next_recv(&events).await?, json!(["a/1"]));
    assert_eq!(next_recv(&events).await?, json!(["a/2"]));
    assert_eq!(next_recv(&events).await?, json!(["a/3"]));

    client.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ajax_handshake_call_send_and_push() -> TestResult {
    init_tracing();
    let server = ChannelServer::new(test_server_options());
    let seen = spawn_echo_handler(&server);
    let addr = serve(&server).await?;

    let client = ChannelClient::connect(
        &format!("http://{addr}/chsk"),
        client_options(TransportKind::Ajax, "carol"),
    )?;
    wait_open(&client).await?;
    assert_eq!(client.state().borrow().kind, TransportKind::Ajax);

    // One-shot POST call.
    let reply = client
        .call(app_event("app/ping", None), Duration::from_secs(1))
        .await?;
    assert_eq!(reply, json!("pong"));

    // Fire-and-forget POST reaches the receive queue.
    client.send(app_event("app/note", Some(json!("hi")))).await?;
    let noted = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let msg = seen.recv().await?;
            if msg.event.id == "app/note" {
                return Ok::<_, anyhow::Error>(msg);
            }
        }
    })
    .await??;
    assert_eq!(noted.event.payload, Some(json!("hi")));

    // Server push is delivered on a held poll (or the next repoll).
    server.push(&Uid::new("carol"), app_event("b/hello", None));
    assert_eq!(next_recv(&client.events()).await?, json!(["b/hello"]));

    client.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn presence_edges_with_grace() -> TestResult {
    init_tracing();
    let server = ChannelServer::new(test_server_options());
    let seen = spawn_echo_handler(&server);
    let addr = serve(&server).await?;
    let connected = server.connected();
    let uid = Uid::new("dave");

    // No connections yet.
    assert!(!connected.borrow().any.contains(&uid));

    // Tab A: WebSocket.
    let tab_a = ChannelClient::connect(
        &format!("http://{addr}/chsk"),
        client_options(TransportKind::Ws, "dave"),
    )?;
    wait_open(&tab_a).await?;

    let opened = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let msg = seen.recv().await?;
            if msg.event.id == "chsk/uidport-open" {
                return Ok::<_, anyhow::Error>(msg);
            }
        }
    })
    .await??;
    assert_eq!(opened.uid, uid);
    assert!(connected.borrow().ws.contains(&uid));
    assert!(connected.borrow().any.contains(&uid));

    // Tab B: Ajax, same uid; no second open edge.
    let tab_b = ChannelClient::connect(
        &format!("http://{addr}/chsk"),
        client_options(TransportKind::Ajax, "dave"),
    )?;
    wait_open(&tab_b).await?;
    assert!(connected.borrow().ajax.contains(&uid));

    // Close A: the uid stays present through tab B; no close edge.
    tab_a.disconnect();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!connected.borrow().ws.contains(&uid));
    assert!(connected.borrow().any.contains(&uid));

    // Close B and wait out the grace: the close edge fires once.
    tab_b.disconnect();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = seen.recv().await?;
            match msg.event.id.as_str() {
                "chsk/uidport-close" => return Ok::<_, anyhow::Error>(msg),
                "chsk/uidport-open" => anyhow::bail!("unexpected second open edge"),
                _ => {}
            }
        }
    })
    .await??;
    assert_eq!(closed.uid, uid);
    assert!(!connected.borrow().any.contains(&uid));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn auto_downgrades_to_ajax() -> TestResult {
    use axum::extract::Request;
    use axum::middleware::{self, Next};
    use axum::response::{IntoResponse, Response};

    init_tracing();

    // A server whose GET refuses WebSocket upgrades: the auto client's
    // first WS attempt fails and it must fall back to long-polling.
    async fn reject_upgrades(req: Request, next: Next) -> Response {
        if req.headers().contains_key(axum::http::header::UPGRADE) {
            return axum::http::StatusCode::BAD_REQUEST.into_response();
        }
        next.run(req).await
    }

    let server = ChannelServer::new(test_server_options());
    let _seen = spawn_echo_handler(&server);
    let app = server
        .router("/chsk")
        .layer(middleware::from_fn(reject_upgrades));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await?;
        Ok::<(), anyhow::Error>(())
    });

    let client = ChannelClient::connect(
        &format!("http://{addr}/chsk"),
        client_options(TransportKind::Auto, "erin"),
    )?;
    wait_open(&client).await?;

    let state = client.state().borrow().clone();
    assert_eq!(state.kind, TransportKind::Ajax);
    assert!(state.ever_opened);

    // The downgraded channel is fully functional.
    let reply = client
        .call(app_event("app/ping", None), Duration::from_secs(1))
        .await?;
    assert_eq!(reply, json!("pong"));

    client.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protocol_errors_at_the_http_level() -> TestResult {
    init_tracing();
    let server = ChannelServer::new(test_server_options());
    let seen = spawn_echo_handler(&server);
    let addr = serve(&server).await?;
    let http = reqwest::Client::new();

    // GET without client-id is a hard, descriptive rejection.
    let resp = http.get(format!("http://{addr}/chsk")).send().await?;
    assert_eq!(resp.status().as_u16(), 400);
    assert!(resp.text().await?.contains("client-id"));

    // An undecodable POST body surfaces as chsk/bad-package and the POST
    // still completes with the dummy reply.
    let resp = http
        .post(format!("http://{addr}/chsk"))
        .form(&[("client-id", "tab-x"), ("ppstr", "-not json")])
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await?, "-\"chsk/dummy-cb-200\"");

    let msg = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let msg = seen.recv().await?;
            if msg.event.id == "chsk/bad-package" {
                return Ok::<_, anyhow::Error>(msg);
            }
        }
    })
    .await??;
    assert_eq!(msg.event.payload, Some(json!("-not json")));
    Ok(())
}
