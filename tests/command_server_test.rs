//! TCP command interface round trips against a simulated camera.

use highlight_daq::capture::{
    DeviceParameter, FrameFormat, FramePump, PixelFormat, SimulatedCamera, SimulationProbe,
    SyntheticScene,
};
use highlight_daq::highlights::{CollectingSink, HighlightTracker};
use highlight_daq::server::CommandServer;
use highlight_daq::storage::MemorySink;
use highlight_daq::worker::{WorkerConfig, WorkerCoordinator};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Harness {
    addr: SocketAddr,
    server: JoinHandle<highlight_daq::CaptureResult<()>>,
    worker: WorkerCoordinator,
    probe: SimulationProbe,
    storage: MemorySink,
}

async fn start(scene: SyntheticScene) -> Harness {
    let format = FrameFormat::packed(8, 4, PixelFormat::Yuyv);
    let camera = SimulatedCamera::new("sim0", format, scene);
    let probe = camera.probe();
    let pump = FramePump::open(camera, 4).unwrap();
    let storage = MemorySink::new();
    let config = WorkerConfig {
        capture_timeout: Duration::from_millis(100),
        flush_poll: Duration::from_millis(1),
        flush_settle: Duration::from_millis(1),
        flush_max_frames: 4,
        ..WorkerConfig::default()
    };
    let worker = WorkerCoordinator::spawn(
        pump,
        HighlightTracker::default(),
        Box::new(CollectingSink::new()),
        Box::new(storage.clone()),
        config,
    )
    .unwrap();

    let server = CommandServer::bind("127.0.0.1:0".parse().unwrap(), worker.handle())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let server = tokio::spawn(server.run());

    Harness {
        addr,
        server,
        worker,
        probe,
        storage,
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn reply(&mut self) -> Option<String> {
        timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("reply timed out")
            .unwrap()
    }

    async fn command(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await.expect("connection closed")
    }
}

#[tokio::test]
async fn test_action_commands_reply_with_codes() {
    let harness = start(SyntheticScene::uniform(8, 4, 210)).await;
    let mut client = Client::connect(harness.addr).await;

    assert_eq!(client.command("dump").await, "1");
    assert_eq!(harness.storage.frames().len(), 1);

    assert_eq!(client.command("accum 2").await, "1");
    assert_eq!(harness.storage.accumulations()[0].1.frames(), 2);

    assert_eq!(client.command("track 1").await, "1");
    assert_eq!(client.command("thresh 200").await, "32");
    assert_eq!(client.command("thresh 220 3").await, "0");

    assert_eq!(client.command("set 2 64").await, "1");
    assert_eq!(
        harness.probe.parameters(),
        vec![(DeviceParameter::Contrast, 64)]
    );
}

#[tokio::test]
async fn test_bad_commands() {
    let harness = start(SyntheticScene::uniform(8, 4, 0)).await;
    let mut client = Client::connect(harness.addr).await;

    assert_eq!(client.command("accum").await, "-2");
    assert_eq!(client.command("thresh").await, "-2");
    assert_eq!(client.command("set 99 1").await, "-1");

    // Unknown verbs are ignored: the next reply belongs to the next command.
    client.send("bogus").await;
    assert_eq!(client.command("flush").await, "1");
}

#[tokio::test]
async fn test_timeout_reply_when_scene_runs_dry() {
    let harness = start(SyntheticScene::uniform(8, 4, 0).limit(0)).await;
    let mut client = Client::connect(harness.addr).await;
    assert_eq!(client.command("dump").await, "0");
}

#[tokio::test]
async fn test_close_serves_next_client() {
    let harness = start(SyntheticScene::uniform(8, 4, 50)).await;

    let mut first = Client::connect(harness.addr).await;
    assert_eq!(first.command("flush").await, "1");
    first.send("close").await;
    assert_eq!(first.reply().await, None);

    let mut second = Client::connect(harness.addr).await;
    assert_eq!(second.command("dump").await, "1");
}

#[tokio::test]
async fn test_shutdown_stops_worker_and_server() {
    let harness = start(SyntheticScene::uniform(8, 4, 50)).await;
    let handle = harness.worker.handle();
    let mut client = Client::connect(harness.addr).await;

    client.send("shutdown").await;
    assert_eq!(client.reply().await, None);

    timeout(Duration::from_secs(5), harness.server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    tokio::task::spawn_blocking(move || harness.worker.shutdown())
        .await
        .unwrap();
    assert!(!handle.is_running());
}

#[tokio::test]
async fn test_shutdown_handle_stops_idle_server() {
    let harness = start(SyntheticScene::uniform(8, 4, 50)).await;
    let server = CommandServer::bind("127.0.0.1:0".parse().unwrap(), harness.worker.handle())
        .await
        .unwrap();
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(server.run());

    shutdown.trigger();
    assert!(shutdown.is_triggered());
    timeout(Duration::from_secs(5), running)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
