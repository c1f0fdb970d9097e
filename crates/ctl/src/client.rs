//! Client-side traffic: uploads, fetches and the two adversarial tools.

use anyhow::{anyhow, Result};
use cellsync_client_sdk::Distribution;
use cellsync_node::UdpTransport;
use cellsync_protocol::{ChunkRecord, ChunkRequest, Message};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

pub const CLIENT_PORT: u16 = 4999;

/// Payload the injector swaps in while keeping the declared hash.
pub fn injected_payload() -> Vec<u8> {
    b"DEADBEEF".repeat(100)
}

/// Sends every assignment as a STORE, pausing `pace` between datagrams so
/// the cells' receive queues keep up. Returns the number of datagrams sent.
pub async fn upload(transport: &UdpTransport, plan: &Distribution, pace: Duration) -> Result<usize> {
    let mut sent = 0;
    for (port, records) in &plan.assignments {
        for record in records {
            transport
                .try_send(*port, &Message::Store(record.clone()))
                .await?;
            debug!(peer = port, chunk = %record.id, "Chunk uploaded");
            sent += 1;
            if !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
        }
    }
    Ok(sent)
}

/// Requests every chunk of `filename` from every port and collects intact
/// replies until all `total` chunks arrived or `wait` runs out.
pub async fn fetch(
    transport: &UdpTransport,
    filename: &str,
    total: u64,
    ports: &[u16],
    wait: Duration,
) -> Result<Vec<ChunkRecord>> {
    for index in 0..total {
        let request = Message::Request(ChunkRequest {
            chunk_id: ChunkRecord::chunk_id(filename, index),
            requestor_port: transport.port(),
        });
        transport.broadcast(ports, &request).await;
    }

    let deadline = Instant::now() + wait;
    let mut found: BTreeMap<u64, ChunkRecord> = BTreeMap::new();
    while (found.len() as u64) < total {
        let received = match timeout_at(deadline, transport.receive()).await {
            Ok(received) => received,
            Err(_) => break,
        };
        let Some((envelope, _)) = received else {
            continue;
        };
        let Message::Store(record) = envelope.message else {
            continue;
        };
        if record.filename != filename || record.index >= total {
            continue;
        }
        if !record.is_intact() {
            warn!(peer = envelope.sender_port, chunk = %record.id, "Discarding corrupted reply");
            continue;
        }
        found.entry(record.index).or_insert(record);
    }

    if (found.len() as u64) < total {
        let missing: Vec<u64> = (0..total).filter(|i| !found.contains_key(i)).collect();
        return Err(anyhow!(
            "fetched {}/{} chunks of {filename}, missing indices {missing:?}",
            found.len(),
            total
        ));
    }
    Ok(found.into_values().collect())
}

/// Corrupts the first chunk in place and returns it.
pub fn inject_corruption(chunks: &mut [ChunkRecord]) -> Option<&ChunkRecord> {
    let first = chunks.first_mut()?;
    first.data = injected_payload();
    Some(first)
}

pub async fn send_corrupted(transport: &UdpTransport, chunk: &ChunkRecord, ports: &[u16]) {
    transport
        .broadcast(ports, &Message::Store(chunk.clone()))
        .await;
}

pub async fn sabotage(transport: &UdpTransport, target: u16) -> Result<()> {
    transport.try_send(target, &Message::Sabotage).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellsync_node::{spawn_with_transport, CellConfig, CellIdentity, Role, MAX_DATAGRAM};
    use std::net::{IpAddr, Ipv4Addr};

    async fn bind() -> UdpTransport {
        UdpTransport::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, MAX_DATAGRAM)
            .await
            .unwrap()
    }

    #[test]
    fn injection_keeps_declared_hash() {
        let mut chunks = cellsync_client_sdk::chunk_bytes("f.txt", &[7u8; 3000], 1024).unwrap();
        let original_hash = chunks[0].hash.clone();

        let corrupted = inject_corruption(&mut chunks).unwrap();
        assert_eq!(corrupted.hash, original_hash);
        assert_eq!(corrupted.data.len(), 800);
        assert!(!corrupted.is_intact());
        assert!(chunks[1].is_intact());

        assert!(inject_corruption(&mut []).is_none());
    }

    #[tokio::test]
    async fn upload_then_fetch_against_storage_cells() {
        let root = tempfile::tempdir().unwrap();
        let config = CellConfig {
            storage_root: root.path().to_path_buf(),
            ..CellConfig::default()
        };
        let mut cells = Vec::new();
        for _ in 0..2 {
            let transport = bind().await;
            let port = transport.port();
            cells.push(
                spawn_with_transport(
                    CellIdentity::new(port, Vec::new()),
                    Role::Storage,
                    config.clone(),
                    transport,
                )
                .unwrap(),
            );
        }
        let ports: Vec<u16> = cells.iter().map(|c| c.port()).collect();

        let body = b"a small file that spans a few chunks".repeat(10);
        let chunks = cellsync_client_sdk::chunk_bytes("notes.txt", &body, 100).unwrap();
        let plan = cellsync_client_sdk::distribute(&chunks, &ports, 1).unwrap();

        let client = bind().await;
        let sent = upload(&client, &plan, Duration::from_millis(2)).await.unwrap();
        assert_eq!(sent, chunks.len());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fetched = fetch(&client, "notes.txt", chunks.len() as u64, &ports, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(cellsync_client_sdk::reconstruct_bytes(&fetched).unwrap(), body);

        let missing = fetch(&client, "absent.txt", 1, &ports, Duration::from_millis(200)).await;
        assert!(missing.is_err());

        for cell in cells {
            cell.stop().await;
        }
    }
}
