//! End-to-end tests: a real server and real clients over the rendezvous
//! socket, with resources backed by a temporary directory.

use std::collections::HashSet;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reswire::client::Client;
use reswire::server::{OpenSource, Server, ServerHandle, Service, SessionInfo};
use reswire::{
    Error, EventKind, OpenFlags, ResourceId, ResourceState, ResourceStatus, Status,
};

/// Unique rendezvous name per test; the sockets live in a shared temp dir.
fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "rwt-{}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed),
        tag
    )
}

/// Poll `probe` until it holds or two seconds pass.
async fn eventually(probe: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Serves files out of a temp directory and counts callback invocations.
struct DirService {
    root: PathBuf,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    watches: AtomicUsize,
    unwatches: AtomicUsize,
    argv_log: Mutex<Vec<Vec<String>>>,
    /// Ids that stat as READY even when open would fail.
    ready_overrides: Mutex<HashSet<String>>,
}

impl DirService {
    fn new(root: PathBuf) -> Arc<Self> {
        Arc::new(DirService {
            root,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            watches: AtomicUsize::new(0),
            unwatches: AtomicUsize::new(0),
            argv_log: Mutex::new(Vec::new()),
            ready_overrides: Mutex::new(HashSet::new()),
        })
    }

    fn path_for(&self, id: &ResourceId) -> PathBuf {
        let name = id.as_str().strip_prefix("byfd/").unwrap_or(id.as_str());
        self.root.join(name)
    }
}

impl Service for DirService {
    fn connect(&self, _session: &SessionInfo, argv: &[String]) -> Status {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.argv_log.lock().unwrap().push(argv.to_vec());
        if argv.iter().any(|a| a == "refuse-me") {
            return Status::Refused;
        }
        Status::Success
    }

    fn disconnect(&self, _session: &SessionInfo) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn open(
        &self,
        _session: &SessionInfo,
        id: &ResourceId,
        _flags: OpenFlags,
    ) -> Result<OpenSource, Status> {
        let path = self.path_for(id);
        if id.as_str().starts_with("byfd/") {
            // Hand back an already-open descriptor instead of a path.
            let file = std::fs::File::open(&path).map_err(|_| Status::NotFound)?;
            return Ok(OpenSource::Fd(file.into()));
        }
        Ok(OpenSource::Path(path))
    }

    fn stat(&self, _session: &SessionInfo, id: &ResourceId) -> Result<ResourceStatus, Status> {
        if self.ready_overrides.lock().unwrap().contains(id.as_str()) {
            return Ok(ResourceStatus {
                state: ResourceState::Ready,
                size: 0,
                mtime: 0,
            });
        }
        match std::fs::metadata(self.path_for(id)) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i32)
                    .unwrap_or(0);
                Ok(ResourceStatus {
                    state: ResourceState::Ready,
                    size: meta.len() as i64,
                    mtime,
                })
            }
            Err(_) => Ok(ResourceStatus {
                state: ResourceState::NotFound,
                size: -1,
                mtime: 0,
            }),
        }
    }

    fn watch(&self, _id: &ResourceId) -> Status {
        self.watches.fetch_add(1, Ordering::SeqCst);
        Status::Success
    }

    fn unwatch(&self, _id: &ResourceId) -> Status {
        self.unwatches.fetch_add(1, Ordering::SeqCst);
        Status::Success
    }
}

struct Fixture {
    service: Arc<DirService>,
    server: ServerHandle,
    name: String,
    _dir: tempfile::TempDir,
}

async fn start_fixture(tag: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let service = DirService::new(dir.path().to_owned());
    let name = unique_name(tag);
    let server = Server::start(&name, service.clone()).await.unwrap();
    Fixture {
        service,
        server,
        name,
        _dir: dir,
    }
}

impl Fixture {
    fn write_file(&self, name: &str, contents: &[u8]) {
        let mut file = std::fs::File::create(self.service.root.join(name)).unwrap();
        file.write_all(contents).unwrap();
    }

    async fn client(&self) -> Client {
        Client::connect(&self.name, &[]).await.unwrap()
    }
}

#[tokio::test]
async fn test_handshake_delivers_argv() {
    let fx = start_fixture("argv").await;
    let client = Client::connect(&fx.name, &["alpha", "beta"]).await.unwrap();

    assert!(eventually(|| fx.service.connects.load(Ordering::SeqCst) == 1).await);
    assert_eq!(
        fx.service.argv_log.lock().unwrap()[0],
        vec!["alpha".to_string(), "beta".to_string()]
    );
    drop(client);
}

#[tokio::test]
async fn test_connect_refused_by_callback() {
    let fx = start_fixture("refuse").await;
    let err = Client::connect(&fx.name, &["refuse-me"]).await.unwrap_err();
    assert!(matches!(err, Error::Status(Status::Refused)));

    // Refused sessions never see the disconnect callback.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.service.disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_open_reads_through_transferred_handle() {
    let fx = start_fixture("open").await;
    fx.write_file("Test.txt", b"hello");

    let client = fx.client().await;
    let mut res = client.open("Test.txt", OpenFlags::READ).await.unwrap();
    assert_eq!(res.flags(), OpenFlags::READ);

    let mut buf = [0u8; 128];
    let n = res.read(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
}

#[tokio::test]
async fn test_open_from_callback_descriptor() {
    let fx = start_fixture("openfd").await;
    fx.write_file("blob.bin", b"descriptor-backed");

    let client = fx.client().await;
    let mut res = client.open("byfd/blob.bin", OpenFlags::READ).await.unwrap();

    let mut buf = [0u8; 64];
    let n = res.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"descriptor-backed");
}

#[tokio::test]
async fn test_open_missing_resource_is_notfound() {
    let fx = start_fixture("notfound").await;
    let client = fx.client().await;

    let err = client.open("nope", OpenFlags::READ).await.unwrap_err();
    assert!(matches!(err, Error::Status(Status::NotFound)));

    // The session keeps working after a failed open.
    fx.write_file("real.txt", b"ok");
    let res = client.open("real.txt", OpenFlags::READ).await;
    assert!(res.is_ok());
}

#[tokio::test]
async fn test_write_gated_and_applied() {
    let fx = start_fixture("write").await;
    fx.write_file("out.txt", b"");

    let client = fx.client().await;

    // Read-only handle refuses writes client-side.
    let mut ro = client.open("out.txt", OpenFlags::READ).await.unwrap();
    assert_eq!(ro.write(b"x").unwrap_err().status(), Status::Perm);

    let mut rw = client
        .open("out.txt", OpenFlags::READ | OpenFlags::WRITE)
        .await
        .unwrap();
    rw.write_all(b"written-direct").unwrap();
    drop(rw);

    let on_disk = std::fs::read(fx.service.root.join("out.txt")).unwrap();
    assert_eq!(on_disk, b"written-direct");
}

#[tokio::test]
async fn test_stat_reports_state_and_size() {
    let fx = start_fixture("stat").await;
    fx.write_file("five.txt", b"12345");

    let client = fx.client().await;
    let stat = client.stat("five.txt").await.unwrap();
    assert_eq!(stat.state, ResourceState::Ready);
    assert_eq!(stat.size, 5);
    assert!(stat.mtime > 0);

    let stat = client.stat("missing").await.unwrap();
    assert_eq!(stat.state, ResourceState::NotFound);
}

#[tokio::test]
async fn test_watch_fanout_and_edge_callbacks() {
    let fx = start_fixture("fanout").await;
    fx.write_file("X", b"ready");

    let c1 = fx.client().await;
    let c2 = fx.client().await;

    let w1 = c1.watch("X").await.unwrap();
    let w2 = c2.watch("X").await.unwrap();
    assert!(w1.is_valid() && w2.is_valid());
    assert_ne!(w1.id(), w2.id());

    // First subscriber fired watch() exactly once.
    assert_eq!(fx.service.watches.load(Ordering::SeqCst), 1);

    // Both get the initial READY (the resource exists).
    let e1 = tokio::time::timeout(Duration::from_secs(2), c1.wait_event())
        .await
        .unwrap()
        .unwrap();
    let e2 = tokio::time::timeout(Duration::from_secs(2), c2.wait_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((e1.watcher, e1.kind), (w1.id(), EventKind::Ready));
    assert_eq!((e2.watcher, e2.kind), (w2.id(), EventKind::Ready));

    // A broadcast reaches both subscribers.
    fx.server.push_event("X", EventKind::Update).await.unwrap();
    let e1 = tokio::time::timeout(Duration::from_secs(2), c1.wait_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((e1.watcher, e1.kind), (w1.id(), EventKind::Update));
    let e2 = tokio::time::timeout(Duration::from_secs(2), c2.wait_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(e2.kind, EventKind::Update);

    // Last unsubscribe fires unwatch() exactly once.
    c1.close_watcher(w1).await.unwrap();
    assert_eq!(fx.service.unwatches.load(Ordering::SeqCst), 0);
    c2.close_watcher(w2).await.unwrap();
    assert!(eventually(|| fx.service.unwatches.load(Ordering::SeqCst) == 1).await);
    assert_eq!(fx.service.watches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_watch_suppresses_ready_on_success() {
    let fx = start_fixture("openwatch").await;
    fx.write_file("cfg", b"data");

    let client = fx.client().await;
    let ow = client.open_watch("cfg", OpenFlags::READ).await.unwrap();
    assert!(ow.resource.is_ok());
    assert!(ow.watcher.is_valid());

    // No READY: the successful open already proved availability.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(client.poll_event().unwrap().is_none());

    // The watcher is live: later pushes arrive.
    fx.server.push_event("cfg", EventKind::Update).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), client.wait_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((event.watcher, event.kind), (ow.watcher.id(), EventKind::Update));
}

#[tokio::test]
async fn test_open_watch_failure_still_registers_watcher() {
    let fx = start_fixture("openwatchfail").await;
    fx.service
        .ready_overrides
        .lock()
        .unwrap()
        .insert("phantom".to_string());

    let client = fx.client().await;
    let ow = client.open_watch("phantom", OpenFlags::READ).await.unwrap();

    assert_eq!(ow.resource.unwrap_err(), Status::NotFound);
    assert!(ow.watcher.is_valid());

    // Open failed but stat says READY, so the watch-style event fires,
    // ordered after the response we already consumed.
    let event = tokio::time::timeout(Duration::from_secs(2), client.wait_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((event.watcher, event.kind), (ow.watcher.id(), EventKind::Ready));
}

#[tokio::test]
async fn test_stat_watch_never_fires_initial_ready() {
    let fx = start_fixture("statwatch").await;
    fx.write_file("S", b"123");

    let client = fx.client().await;
    let sw = client.stat_watch("S").await.unwrap();
    assert_eq!(sw.stat.unwrap().state, ResourceState::Ready);
    assert!(sw.watcher.is_valid());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(client.poll_event().unwrap().is_none());
}

#[tokio::test]
async fn test_watcher_open_resolves_stored_id() {
    let fx = start_fixture("watcheropen").await;
    fx.write_file("W", b"via-watcher");

    let client = fx.client().await;
    let watcher = client.watch("W").await.unwrap();
    let mut res = client.watcher_open(&watcher, OpenFlags::READ).await.unwrap();

    let mut buf = [0u8; 32];
    let n = res.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"via-watcher");
}

#[tokio::test]
async fn test_close_unknown_watcher_tears_down_only_that_session() {
    let fx = start_fixture("isolation").await;
    fx.write_file("Y", b"y");

    let victim = fx.client().await;
    let bystander = fx.client().await;

    let watcher = victim.watch("Y").await.unwrap();
    victim.close_watcher(watcher).await.unwrap();

    // Same id again: the server no longer knows it -> protocol error ->
    // that session dies mid-call.
    let err = victim.close_watcher(watcher).await.unwrap_err();
    assert!(matches!(err, Error::Broken));

    // The other session is untouched.
    let res = bystander.open("Y", OpenFlags::READ).await;
    assert!(res.is_ok());
    assert!(eventually(|| fx.service.disconnects.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn test_version_mismatch_rejected() {
    use reswire::protocol::{ClientMessage, ServerMessage, PREAMBLE_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let fx = start_fixture("version").await;
    let path = reswire::transport::endpoint_path(&fx.name).unwrap();
    let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();

    let bad = ClientMessage::Handshake {
        version: 0x0000_0001,
        pid: std::process::id(),
        argv: vec![],
    };
    stream.write_all(&bad.encode()).await.unwrap();

    let mut preamble = [0u8; PREAMBLE_SIZE];
    stream.read_exact(&mut preamble).await.unwrap();
    let (raw_type, body_len) = reswire::protocol::decode_preamble(&preamble).unwrap();
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await.unwrap();

    let ack = ServerMessage::decode(raw_type, &body).unwrap();
    assert_eq!(
        ack,
        ServerMessage::HandshakeAck {
            status: Status::NotSupported
        }
    );

    // The server closes the session right after the ack.
    let n = stream.read(&mut [0u8; 8]).await.unwrap();
    assert_eq!(n, 0);
    assert_eq!(fx.service.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_abrupt_client_death_runs_disconnect_once() {
    let fx = start_fixture("abrupt").await;
    fx.write_file("F", b"f");

    let client = fx.client().await;
    let _res = client.open("F", OpenFlags::READ).await.unwrap();
    let _watcher = client.watch("F").await.unwrap();

    // Drop without any goodbye; the server must reap the session, clear
    // its watcher (firing unwatch), and call disconnect exactly once.
    drop(client);

    assert!(eventually(|| fx.service.disconnects.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| fx.service.unwatches.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.service.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_responses_keep_order() {
    let fx = start_fixture("ordering").await;
    for i in 0..10 {
        fx.write_file(&format!("f{i}"), format!("contents-{i}").as_bytes());
    }

    let client = fx.client().await;
    for i in 0..10 {
        let stat = client.stat(&format!("f{i}")).await.unwrap();
        assert_eq!(stat.size, format!("contents-{i}").len() as i64);
    }
}

#[tokio::test]
async fn test_server_shutdown_closes_sessions() {
    let fx = start_fixture("shutdown").await;
    let c1 = fx.client().await;
    let c2 = fx.client().await;
    assert!(eventually(|| fx.service.connects.load(Ordering::SeqCst) == 2).await);

    fx.server.shutdown().await.unwrap();
    assert_eq!(fx.service.disconnects.load(Ordering::SeqCst), 2);

    // Blocked waiters and later calls observe the broken connection.
    let err = tokio::time::timeout(Duration::from_secs(2), c1.wait_event())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Broken));
    let err = c2.open("anything", OpenFlags::READ).await.unwrap_err();
    assert!(matches!(err, Error::Broken));

    // The rendezvous socket is gone.
    let err = Client::connect(&fx.name, &[]).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable));
}

#[tokio::test]
async fn test_connect_to_absent_server_unavailable() {
    let err = Client::connect(&unique_name("absent"), &[]).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable));
}

#[tokio::test]
async fn test_many_clients_across_workers() {
    // More sessions than one worker's cap, to cross the spawn boundary.
    let fx = start_fixture("many").await;
    fx.write_file("shared", b"shared-bytes");

    let mut clients = Vec::new();
    for _ in 0..20 {
        clients.push(fx.client().await);
    }
    for client in &clients {
        let mut res = client.open("shared", OpenFlags::READ).await.unwrap();
        let mut buf = [0u8; 32];
        let n = res.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"shared-bytes");
    }

    drop(clients);
    assert!(eventually(|| fx.service.disconnects.load(Ordering::SeqCst) == 20).await);
}
