use cellsync_node::{
    spawn_with_transport, CellConfig, CellHandle, CellIdentity, CellSnapshot, Role, UdpTransport,
    MAX_DATAGRAM,
};
use cellsync_protocol::{ChunkRecord, ChunkRequest, Message};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn fast_config(root: &Path) -> CellConfig {
    CellConfig {
        storage_root: root.to_path_buf(),
        heartbeat_interval_ms: 50,
        dead_check_interval_ms: 100,
        dead_after_ms: 400,
        differentiate_after_ms: 200,
        ..CellConfig::default()
    }
}

async fn bind() -> UdpTransport {
    UdpTransport::bind(LOCALHOST, 0, MAX_DATAGRAM).await.unwrap()
}

/// Starts `n` stem cells that all list each other as neighbors.
async fn start_cluster(n: usize, root: &Path) -> Vec<CellHandle> {
    let mut transports = Vec::new();
    for _ in 0..n {
        transports.push(bind().await);
    }
    let ports: Vec<u16> = transports.iter().map(UdpTransport::port).collect();

    transports
        .into_iter()
        .map(|transport| {
            let own = transport.port();
            let neighbors = ports.iter().copied().filter(|p| *p != own).collect();
            spawn_with_transport(
                CellIdentity::new(own, neighbors),
                Role::Stem,
                fast_config(root),
                transport,
            )
            .unwrap()
        })
        .collect()
}

async fn wait_for<F>(handle: &CellHandle, what: &str, pred: F) -> CellSnapshot
where
    F: Fn(&CellSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = handle.snapshot().await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {snapshot:?}");
        sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_roles(cells: &[CellHandle]) {
    for cell in cells {
        wait_for(cell, "differentiation", |s| s.role != Role::Stem).await;
    }
}

fn guard_index(cells: &[CellHandle]) -> usize {
    let (idx, _) = cells
        .iter()
        .enumerate()
        .max_by_key(|(_, cell)| cell.port())
        .unwrap();
    idx
}

async fn stop_all(cells: Vec<CellHandle>) {
    for cell in cells {
        cell.stop().await;
    }
}

#[tokio::test]
async fn highest_port_becomes_the_only_guard() {
    let root = TempDir::new().unwrap();
    let cells = start_cluster(4, root.path()).await;
    wait_for_roles(&cells).await;

    let guard = guard_index(&cells);
    for (idx, cell) in cells.iter().enumerate() {
        let role = cell.snapshot().await.unwrap().role;
        let expected = if idx == guard { Role::Guard } else { Role::Storage };
        assert_eq!(role, expected, "cell {}", cell.port());
    }
    stop_all(cells).await;
}

#[tokio::test]
async fn corrupted_store_gets_sender_isolated_cluster_wide() {
    let root = TempDir::new().unwrap();
    let cells = start_cluster(4, root.path()).await;
    wait_for_roles(&cells).await;
    let guard = guard_index(&cells);

    let client = bind().await;
    let mut bad = ChunkRecord::new("secret.txt", 0, 1, b"the real contents".to_vec());
    bad.data = b"DEADBEEF".repeat(100);
    client
        .try_send(cells[guard].port(), &Message::Store(bad))
        .await
        .unwrap();

    for (idx, cell) in cells.iter().enumerate() {
        if idx == guard {
            continue;
        }
        wait_for(cell, "isolation of the client", |s| {
            s.blacklist.contains(&client.port())
        })
        .await;
    }
    let guard_view = cells[guard].snapshot().await.unwrap();
    assert!(guard_view.chunks.is_empty());
    assert!(guard_view.blacklist.is_empty());

    // Anything further from the isolated port is dropped.
    let later = ChunkRecord::new("later.txt", 0, 1, b"honest".to_vec());
    let storage = if guard == 0 { 1 } else { 0 };
    client
        .try_send(cells[storage].port(), &Message::Store(later))
        .await
        .unwrap();
    sleep(Duration::from_millis(150)).await;
    assert!(cells[storage].snapshot().await.unwrap().chunks.is_empty());

    stop_all(cells).await;
}

#[tokio::test]
async fn uploaded_file_can_be_fetched_back() {
    let root = TempDir::new().unwrap();
    let cells = start_cluster(4, root.path()).await;
    wait_for_roles(&cells).await;
    let ports: Vec<u16> = cells.iter().map(CellHandle::port).collect();

    let body: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let chunks = cellsync_client_sdk::chunk_bytes("report.bin", &body, 1024).unwrap();
    assert_eq!(chunks.len(), 3);
    let plan = cellsync_client_sdk::distribute(&chunks, &ports, 2).unwrap();

    let client = bind().await;
    for (port, records) in &plan.assignments {
        for record in records {
            client
                .try_send(*port, &Message::Store(record.clone()))
                .await
                .unwrap();
        }
    }
    for cell in &cells {
        let expected = plan.for_port(cell.port()).len();
        wait_for(cell, "upload", |s| s.chunks.len() == expected).await;
    }

    for idx in 0..3 {
        let request = Message::Request(ChunkRequest {
            chunk_id: ChunkRecord::chunk_id("report.bin", idx),
            requestor_port: client.port(),
        });
        client.broadcast(&ports, &request).await;
    }

    let mut received = Vec::new();
    let collect = async {
        while received.len() < 6 {
            if let Some((envelope, _)) = client.receive().await {
                if let Message::Store(record) = envelope.message {
                    received.push(record);
                }
            }
        }
    };
    timeout(Duration::from_secs(5), collect).await.unwrap();

    let rebuilt = cellsync_client_sdk::reconstruct_bytes(&received).unwrap();
    assert_eq!(rebuilt, body);
    stop_all(cells).await;
}

#[tokio::test]
async fn chunks_survive_a_restart() {
    let root = TempDir::new().unwrap();
    let config = fast_config(root.path());
    let transport = bind().await;
    let port = transport.port();
    let cell = spawn_with_transport(
        CellIdentity::new(port, Vec::new()),
        Role::Storage,
        config.clone(),
        transport,
    )
    .unwrap();

    let client = bind().await;
    let record = ChunkRecord::new("keep.txt", 0, 1, b"persist me".to_vec());
    client
        .try_send(port, &Message::Store(record.clone()))
        .await
        .unwrap();
    wait_for(&cell, "store", |s| s.chunks == vec!["keep.txt_0".to_string()]).await;
    cell.stop().await;
    assert!(config.storage_dir(port).join("keep.txt_0.json").exists());

    let transport = UdpTransport::bind(LOCALHOST, port, MAX_DATAGRAM).await.unwrap();
    let restarted = spawn_with_transport(
        CellIdentity::new(port, Vec::new()),
        Role::Storage,
        config,
        transport,
    )
    .unwrap();
    let snapshot = restarted.snapshot().await.unwrap();
    assert_eq!(snapshot.chunks, vec!["keep.txt_0".to_string()]);

    let request = Message::Request(ChunkRequest {
        chunk_id: "keep.txt_0".into(),
        requestor_port: client.port(),
    });
    client.try_send(port, &request).await.unwrap();
    let (envelope, _) = timeout(Duration::from_secs(2), client.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.message, Message::Store(record));
    restarted.stop().await;
}

#[tokio::test]
async fn stopped_cell_drops_out_of_alive_sets() {
    let root = TempDir::new().unwrap();
    let mut cells = start_cluster(3, root.path()).await;
    let victim = cells.pop().unwrap();
    let victim_port = victim.port();

    for cell in &cells {
        let snapshot = cell.snapshot().await.unwrap();
        assert!(snapshot.alive.contains(&victim_port));
    }
    let config = fast_config(root.path());
    let bound = config.dead_after() + config.dead_check_interval() + Duration::from_millis(300);
    let stopped_at = Instant::now();
    victim.stop().await;

    for cell in &cells {
        let snapshot = wait_for(cell, "dead neighbor", |s| !s.alive.contains(&victim_port)).await;
        assert_eq!(snapshot.alive.len(), 1);
    }
    let elapsed = stopped_at.elapsed();
    assert!(elapsed <= bound, "death noticed after {elapsed:?}, bound {bound:?}");
    stop_all(cells).await;
}

#[tokio::test]
async fn snapshot_reports_identity() {
    let root = TempDir::new().unwrap();
    let cells = start_cluster(1, root.path()).await;
    let snapshot = cells[0].snapshot().await.unwrap();
    assert_eq!(snapshot.id, format!("cell-{}", cells[0].port()));
    assert!(snapshot.neighbors.is_empty());
    stop_all(cells).await;
}
