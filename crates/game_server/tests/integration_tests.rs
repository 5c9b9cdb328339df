//! End-to-end tests of the network core over loopback sockets.
//!
//! These tests run a real server with real clients and verify framing,
//! liveness, backpressure and pausing as seen from the wire.

use game_server::{GameServer, NetState, NetworkCore, PacketLength, ServerConfig};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

const SEED: [u8; 4] = [0x7F, 0x00, 0x00, 0x01];

/// Helper to create a loopback configuration driven manually by the test.
fn create_test_config() -> ServerConfig {
    let mut config = ServerConfig {
        listen: vec![SocketAddr::from(([127, 0, 0, 1], 0))],
        tick_interval_ms: 0,
        ..ServerConfig::default()
    };
    config.pools.receive_count = 8;
    config.pools.coalesce_count = 8;
    config
}

struct TestServer {
    server: Arc<GameServer>,
    address: SocketAddr,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let server = Arc::new(GameServer::new(config).expect("server"));
        let listener = server.bind().expect("bind");
        let address = listener.local_addrs()[0];

        let running = server.clone();
        let task = tokio::spawn(async move {
            running.run(listener).await.expect("run");
        });
        Self {
            server,
            address,
            task,
        }
    }

    fn core(&self) -> Arc<NetworkCore> {
        self.server.core()
    }

    /// Connects a client and, with the tick disabled, slices until the server
    /// picked it up.
    async fn connect(&self) -> (TcpStream, Arc<NetState>) {
        let client = TcpStream::connect(self.address).await.expect("connect");
        let local = client.local_addr().expect("local addr");
        let core = self.core();

        let mut found = None;
        for _ in 0..300 {
            if self.server.config().tick_interval_ms == 0 {
                core.slice();
            }
            found = core.connections().into_iter().find(|ns| ns.address() == local);
            if found.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        (client, found.expect("connection registered"))
    }

    async fn stop(self) {
        self.server.shutdown();
        let _ = timeout(Duration::from_secs(5), self.task).await;
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn expect_closed(client: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let closed = timeout(Duration::from_secs(3), async {
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket was not closed by the server");
}

fn record(server: &GameServer, id: u8, length: PacketLength) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    server.handlers().register(id, length, false, move |_, reader| {
        sink.lock().push(reader.buffer().to_vec());
    });
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_packets_in_one_receive_decode_in_order() {
    let server = TestServer::start(create_test_config()).await;
    let seen = record(&server.server, 0x02, PacketLength::Fixed(3));
    let (mut client, ns) = server.connect().await;

    let mut bytes = SEED.to_vec();
    bytes.extend_from_slice(&[0x02, 0xAA, 0x01, 0x02, 0xBB, 0x02]);
    client.write_all(&bytes).await.unwrap();

    wait_for("bytes buffered", || ns.incoming_len() == bytes.len()).await;
    server.core().slice();

    assert_eq!(
        *seen.lock(),
        vec![vec![0x02, 0xAA, 0x01], vec![0x02, 0xBB, 0x02]]
    );
    assert_eq!(ns.incoming_len(), 0);
    assert_eq!(ns.seed(), 0x7F00_0001);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_split_packet_not_decoded_early() {
    let server = TestServer::start(create_test_config()).await;
    let seen = record(&server.server, 0x03, PacketLength::Dynamic);
    let (mut client, ns) = server.connect().await;

    let mut head = SEED.to_vec();
    head.extend_from_slice(&[0x03, 0x00]);
    client.write_all(&head).await.unwrap();
    wait_for("header buffered", || ns.incoming_len() == head.len()).await;
    server.core().slice();
    assert!(seen.lock().is_empty());
    assert_eq!(ns.incoming_len(), 2);

    client.write_all(&[0x06, b'x', b'y']).await.unwrap();
    wait_for("partial body buffered", || ns.incoming_len() == 5).await;
    server.core().slice();
    assert!(seen.lock().is_empty());

    client.write_all(&[b'z']).await.unwrap();
    wait_for("body buffered", || ns.incoming_len() == 6).await;
    server.core().slice();
    assert_eq!(*seen.lock(), vec![vec![0x03, 0x00, 0x06, b'x', b'y', b'z']]);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_is_answered_by_server_tick() {
    let config = ServerConfig {
        tick_interval_ms: 10,
        ..create_test_config()
    };
    let server = TestServer::start(config).await;
    let (mut client, _ns) = server.connect().await;

    let mut bytes = SEED.to_vec();
    bytes.extend_from_slice(&[0x73, 0x09]);
    client.write_all(&bytes).await.unwrap();

    let mut reply = [0u8; 2];
    timeout(Duration::from_secs(3), client.read_exact(&mut reply))
        .await
        .expect("ping reply in time")
        .unwrap();
    assert_eq!(reply, [0x73, 0x09]);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inactivity_sweep_disposes_and_returns_buffers() {
    let config = ServerConfig {
        tick_interval_ms: 10,
        inactivity_timeout: Duration::from_millis(200),
        sweep_delay: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(50),
        ..create_test_config()
    };
    let server = TestServer::start(config).await;
    let (mut client, ns) = server.connect().await;
    let core = server.core();
    assert_eq!(core.online_count(), 1);

    expect_closed(&mut client).await;
    wait_for("connection removed", || core.online_count() == 0).await;
    assert!(!ns.is_running());

    wait_for("buffers returned", || {
        core.stats()
            .pools
            .iter()
            .filter(|pool| pool.name == "Receive" || pool.name == "Coalesced")
            .all(|pool| pool.in_use == 0)
    })
    .await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_cap_overflow_tears_down_one_connection() {
    let mut config = create_test_config();
    config.pending_cap = 4096;
    config.pools.coalesce_size = 512;
    let server = TestServer::start(config).await;

    let (mut client_a, ns_a) = server.connect().await;
    let (mut client_b, ns_b) = server.connect().await;
    assert_eq!(server.core().online_count(), 2);

    ns_a.send_bytes(&vec![0x42; 8192]);
    assert!(ns_a.is_disposing());

    ns_b.send_bytes(&[0x73, 0x01]);
    assert!(ns_b.flush());
    let mut reply = [0u8; 2];
    timeout(Duration::from_secs(3), client_b.read_exact(&mut reply))
        .await
        .expect("data for the healthy client")
        .unwrap();
    assert_eq!(reply, [0x73, 0x01]);

    expect_closed(&mut client_a).await;
    server.core().slice();
    assert_eq!(server.core().online_count(), 1);
    assert!(ns_b.is_running());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pause_holds_receives_until_resume() {
    let server = TestServer::start(create_test_config()).await;
    let (mut client, ns) = server.connect().await;
    let core = server.core();

    assert!(core.pause());
    sleep(Duration::from_millis(50)).await;
    client.write_all(&SEED).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(ns.incoming_len(), 0);
    assert!(ns.is_running());

    assert!(core.resume());
    wait_for("bytes after resume", || ns.incoming_len() == SEED.len()).await;

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_flushes_queued_data() {
    let server = TestServer::start(create_test_config()).await;
    let (mut client, ns) = server.connect().await;

    ns.send_bytes(&[0x73, 0x11]);
    server.stop().await;

    let mut reply = [0u8; 2];
    timeout(Duration::from_secs(3), client.read_exact(&mut reply))
        .await
        .expect("flushed data in time")
        .unwrap();
    assert_eq!(reply, [0x73, 0x11]);
    expect_closed(&mut client).await;
}
