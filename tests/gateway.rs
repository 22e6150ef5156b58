use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use skypulse::{api, AppState, Settings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

struct Server {
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: broadcast::Sender<()>,
}

async fn start(dir: &Path, tweak: impl FnOnce(&mut Settings)) -> Server {
    let mut settings = Settings::default();
    settings.persistence.path = dir.join("weatherData.json");
    tweak(&mut settings);

    let state = Arc::new(AppState::open(settings).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _) = broadcast::channel(1);
    tokio::spawn(api::http::serve(listener, state.clone(), shutdown.subscribe()));
    Server { addr, state, shutdown }
}

struct Reply {
    status: u16,
    head: String,
    body: String,
}

async fn send(addr: SocketAddr, raw: &[u8]) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();

    let text = String::from_utf8(buf).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
    let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
    Reply {
        status,
        head: head.to_ascii_lowercase(),
        body: body.to_string(),
    }
}

fn put(body: &str) -> Vec<u8> {
    format!(
        "PUT /weather.json HTTP/1.1\r\nHost: localhost\r\nUser-Agent: ContentServer/1.0\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn get(path: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nUser-Agent: GETClient/1.0\r\n\r\n").into_bytes()
}

fn json(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn first_write_creates_then_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;

    let r = send(srv.addr, &put(r#"{"id":"A","t":"1"}"#)).await;
    assert_eq!(r.status, 201);
    let r = send(srv.addr, &put(r#"{"id":"A","t":"2"}"#)).await;
    assert_eq!(r.status, 200);

    let r = send(srv.addr, &get("/weather/A")).await;
    assert_eq!(r.status, 200);
    assert!(r.head.contains("content-type: application/json"));
    let body = json(&r.body);
    assert_eq!(body["t"], "2");
    assert_eq!(body["id"], "A");
    assert!(body["lamportTime"].is_u64());
    assert_eq!(srv.state.len().await, 1);
}

#[tokio::test]
async fn get_all_lists_every_station() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    send(srv.addr, &put(r#"{"id":"IDS60901","air_temp":13.3}"#)).await;
    send(srv.addr, &put(r#"{"id":"IDS60902","air_temp":9.1}"#)).await;

    for path in ["/weather", "/weather.json"] {
        let r = send(srv.addr, &get(path)).await;
        assert_eq!(r.status, 200);
        let body = json(&r.body);
        let ids: Vec<_> = body.as_object().unwrap().keys().cloned().collect();
        assert_eq!(ids, ["IDS60901", "IDS60902"]);
        assert_eq!(body["IDS60902"]["air_temp"], 9.1);
    }
}

#[tokio::test]
async fn capacity_evicts_first_written() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    for i in 1..=21 {
        let r = send(srv.addr, &put(&format!(r#"{{"id":"S{i}"}}"#))).await;
        assert_eq!(r.status, 201);
        assert!(srv.state.len().await <= 20);
    }

    assert_eq!(send(srv.addr, &get("/weather/S1")).await.status, 404);
    assert_eq!(send(srv.addr, &get("/weather/S21")).await.status, 200);
    assert_eq!(srv.state.len().await, 20);
}

#[tokio::test]
async fn unknown_station_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    let r = send(srv.addr, &get("/weather/NOPE")).await;
    assert_eq!(r.status, 404);
    assert_eq!(r.body, "Station data not found.");
}

#[tokio::test]
async fn empty_body_is_no_content() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    let r = send(srv.addr, &put("")).await;
    assert_eq!(r.status, 204);
    assert_eq!(srv.state.len().await, 0);
    assert!(!dir.path().join("weatherData.json").exists());
}

#[tokio::test]
async fn body_without_id_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    let r = send(srv.addr, &put(r#"{"air_temp":13.3}"#)).await;
    assert_eq!(r.status, 400);
    assert_eq!(srv.state.len().await, 0);
}

#[tokio::test]
async fn invalid_remote_stamp_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    let r = send(srv.addr, &put(r#"{"id":"A","lamportTime":"soon"}"#)).await;
    assert_eq!(r.status, 400);
    assert_eq!(srv.state.len().await, 0);
}

#[tokio::test]
async fn oversized_remote_stamp_cannot_rewind_the_clock() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;

    assert_eq!(send(srv.addr, &put(r#"{"id":"A","lamportTime":5}"#)).await.status, 201);
    let before = srv.state.clock.read();

    let r = send(srv.addr, &put(r#"{"id":"B","lamportTime":18446744073709551615}"#)).await;
    assert_eq!(r.status, 400);
    assert!(srv.state.read("B").await.is_none());
    assert_eq!(srv.state.clock.read(), before);

    assert_eq!(send(srv.addr, &put(r#"{"id":"C"}"#)).await.status, 201);
    let a = srv.state.read("A").await.unwrap().logical_stamp;
    let c = srv.state.read("C").await.unwrap().logical_stamp;
    assert!(c > a, "C stamp {c} should follow A stamp {a}");
}

#[tokio::test]
async fn unparseable_body_is_server_error() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    assert_eq!(send(srv.addr, &put(r#"{"id":"A","#)).await.status, 500);
    assert_eq!(send(srv.addr, &put(r#"["A"]"#)).await.status, 500);
    assert_eq!(srv.state.len().await, 0);
}

#[tokio::test]
async fn unsupported_requests_are_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;

    let delete = b"DELETE /weather HTTP/1.1\r\nHost: localhost\r\n\r\n";
    assert_eq!(send(srv.addr, delete).await.status, 400);
    let brew = b"BREW /pot HTTP/1.1\r\nHost: localhost\r\n\r\n";
    assert_eq!(send(srv.addr, brew).await.status, 400);
    assert_eq!(send(srv.addr, &get("/stations")).await.status, 400);

    // an unparseable request line is answered, not just dropped
    let mut stream = TcpStream::connect(srv.addr).await.unwrap();
    stream.write_all(b"\x01\x02 nonsense\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    let reply = String::from_utf8_lossy(&buf);
    assert!(reply.starts_with("HTTP/1.1 400"), "got {reply:?}");

    // the listener keeps serving after a bad connection
    assert_eq!(send(srv.addr, &get("/weather")).await.status, 200);
}

#[tokio::test]
async fn connection_closes_after_one_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    let r = send(srv.addr, &get("/weather")).await;
    assert!(r.head.contains("connection: close"));
}

#[tokio::test]
async fn slow_body_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |s| s.server.read_timeout_ms = 200).await;

    let partial = b"PUT /weather.json HTTP/1.1\r\nHost: localhost\r\nContent-Length: 50\r\n\r\n{\"id\":\"A\"";
    let r = tokio::time::timeout(Duration::from_secs(5), send(srv.addr, partial))
        .await
        .expect("server should give up on the body");
    assert_eq!(r.status, 408);
    assert_eq!(srv.state.len().await, 0);

    // a stalled client does not block other writers
    assert_eq!(send(srv.addr, &put(r#"{"id":"B"}"#)).await.status, 201);
}

#[tokio::test]
async fn concurrent_writers_to_distinct_ids_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let addr = srv.addr;
            tokio::spawn(async move { send(addr, &put(&format!(r#"{{"id":"C{i}"}}"#))).await.status })
        })
        .collect();
    for t in tasks {
        assert_eq!(t.await.unwrap(), 201);
    }

    let all = json(&send(srv.addr, &get("/weather")).await.body);
    let stations = all.as_object().unwrap();
    assert_eq!(stations.len(), 12);
    for i in 0..12 {
        assert!(stations.contains_key(&format!("C{i}")));
    }
}

#[tokio::test]
async fn concurrent_writers_to_one_id_leave_one_whole_record() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let addr = srv.addr;
            tokio::spawn(async move {
                let body = format!(r#"{{"id":"X","n":{i},"tag":"w{i}"}}"#);
                send(addr, &put(&body)).await.status
            })
        })
        .collect();
    let mut statuses = Vec::new();
    for t in tasks {
        statuses.push(t.await.unwrap());
    }
    assert_eq!(statuses.iter().filter(|s| **s == 201).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 7);

    let rec = srv.state.read("X").await.unwrap();
    let n = rec.payload["n"].as_u64().unwrap();
    assert!(n < 8);
    assert_eq!(rec.payload["tag"], format!("w{n}"));
    assert_eq!(srv.state.len().await, 1);
}

#[tokio::test]
async fn snapshot_tracks_writes_and_sweeps() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |s| s.store.ttl_secs = 30).await;
    send(srv.addr, &put(r#"{"id":"A","t":"1"}"#)).await;
    send(srv.addr, &put(r#"{"id":"B","t":"1"}"#)).await;

    let path = dir.path().join("weatherData.json");
    let on_disk = json(&std::fs::read_to_string(&path).unwrap());
    let ids: Vec<_> = on_disk.as_object().unwrap().keys().cloned().collect();
    assert_eq!(ids, ["B", "A"]);

    let later = SystemTime::now() + Duration::from_secs(31);
    srv.state.sweep(later).await;
    assert_eq!(json(&send(srv.addr, &get("/weather")).await.body), json("{}"));
    assert_eq!(json(&std::fs::read_to_string(&path).unwrap()), json("{}"));
}

#[tokio::test]
async fn failed_persistence_rejects_write() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |s| {
        s.persistence.path = dir.path().join("gone").join("weatherData.json");
    })
    .await;

    let r = send(srv.addr, &put(r#"{"id":"A"}"#)).await;
    assert_eq!(r.status, 500);
    assert_eq!(send(srv.addr, &get("/weather/A")).await.status, 404);
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start(dir.path(), |_| {}).await;
    assert_eq!(send(srv.addr, &get("/weather")).await.status, 200);

    srv.shutdown.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(srv.addr).await.is_err());
}
