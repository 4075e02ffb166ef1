//! Stress tests for the write-token protocol
//!
//! Run with: cargo test --release --test stress_coordinator -- --nocapture

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardflow_core::comm::{broadcast, Channel, LocalGroup, TcpChannel, TcpConfig};
use shardflow_core::config::LockConfig;
use shardflow_core::coordinator::{
    CoordinationContext, Election, FixedElection, LockFileElection, WriteCoordinator,
    WriteOutcome,
};
use shardflow_core::{Result, ShardflowError};

/// Flush monitor asserting no two flushes overlap
#[derive(Default)]
struct FlushMonitor {
    in_flush: AtomicBool,
    flushes: AtomicUsize,
    overlaps: AtomicUsize,
}

impl FlushMonitor {
    async fn flush(&self, rank: u32) -> Result<()> {
        if self.in_flush.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_micros(50 + (rank as u64 % 7) * 30)).await;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.in_flush.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn run_group<E>(
    channels: Vec<Arc<dyn Channel>>,
    monitor: Arc<FlushMonitor>,
    election: E,
) -> Vec<Result<WriteOutcome>>
where
    E: Fn(u32) -> Box<dyn Election>,
{
    let mut handles = Vec::new();
    for channel in channels {
        let rank = channel.rank();
        let monitor = monitor.clone();
        let writer = WriteCoordinator::new(CoordinationContext::new(channel), election(rank));
        handles.push(tokio::spawn(async move {
            writer.write(|| async move { monitor.flush(rank).await }).await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

fn local(size: u32) -> Vec<Arc<dyn Channel>> {
    LocalGroup::channels(size)
        .into_iter()
        .map(|c| Arc::new(c) as Arc<dyn Channel>)
        .collect()
}

/// Single-writer invariant under many concurrent requesters
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_single_writer() {
    let num_workers = 64;
    let monitor = Arc::new(FlushMonitor::default());

    let start = Instant::now();
    let results = run_group(local(num_workers), monitor.clone(), |_| {
        Box::new(FixedElection(5)) as Box<dyn Election>
    })
    .await;
    let elapsed = start.elapsed();

    println!("Single-writer stress test:");
    println!("  Workers: {}", num_workers);
    println!("  Total elapsed: {:?}", elapsed);

    for result in &results {
        assert_eq!(result.as_ref().unwrap().manager, 5);
    }
    assert_eq!(results.iter().filter(|r| r.as_ref().unwrap().was_manager).count(), 1);
    assert_eq!(monitor.flushes.load(Ordering::SeqCst), num_workers as usize);
    assert_eq!(monitor.overlaps.load(Ordering::SeqCst), 0, "Flushes overlapped");
}

/// Lock-marker election under concurrent stamping
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_lock_file_election() {
    let dir = tempfile::tempdir().unwrap();
    let lock = dir.path().join("out.json.lock");
    let config = LockConfig {
        retries: 50,
        backoff_ms: 5,
        ..Default::default()
    };

    let monitor = Arc::new(FlushMonitor::default());
    let results = run_group(local(16), monitor.clone(), |_| {
        Box::new(LockFileElection::new(&lock, &config)) as Box<dyn Election>
    })
    .await;

    let managers: Vec<u32> = results.iter().map(|r| r.as_ref().unwrap().manager).collect();
    assert!(managers.iter().all(|&m| m == managers[0]), "Workers disagree: {:?}", managers);
    assert_eq!(monitor.flushes.load(Ordering::SeqCst), 16);
    assert_eq!(monitor.overlaps.load(Ordering::SeqCst), 0);
    assert!(!lock.exists(), "Manager should remove the lock marker");
}

/// Requests arriving as [r2, r3, r1] are granted in that order
#[tokio::test]
async fn test_fifo_grants() {
    let mut channels = local(4).into_iter();
    let manager_channel = channels.next().unwrap();
    let members: Vec<Arc<dyn Channel>> = channels.collect();
    let (r1, r2, r3) = (members[0].clone(), members[1].clone(), members[2].clone());

    let manager = tokio::spawn(async move {
        let writer = WriteCoordinator::new(
            CoordinationContext::new(manager_channel),
            Box::new(FixedElection(0)),
        );
        writer.write(|| async { Ok(()) }).await
    });

    for member in [&r2, &r3, &r1] {
        member.send(0, member.rank()).await.unwrap();
    }

    let mut granted = Vec::new();
    for member in [&r2, &r3, &r1] {
        let (from, payload) = tokio::time::timeout(Duration::from_secs(5), member.receive())
            .await
            .expect("grant out of order")
            .unwrap();
        assert_eq!((from, payload), (0, member.rank()));
        granted.push(member.rank());
        member.send(0, member.rank()).await.unwrap();
    }
    assert_eq!(granted, vec![2, 3, 1]);

    let barriers: Vec<_> = [r1, r2, r3]
        .into_iter()
        .map(|m| tokio::spawn(async move { m.barrier().await }))
        .collect();
    for b in barriers {
        b.await.unwrap().unwrap();
    }
    assert!(manager.await.unwrap().unwrap().was_manager);
}

/// A failed flush still lets every queued worker write
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deferred_flush_error_liveness() {
    let flushed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for channel in local(6) {
        let rank = channel.rank();
        let flushed = flushed.clone();
        let writer =
            WriteCoordinator::new(CoordinationContext::new(channel), Box::new(FixedElection(0)));
        handles.push(tokio::spawn(async move {
            writer
                .write(|| async move {
                    flushed.fetch_add(1, Ordering::SeqCst);
                    if rank == 0 || rank == 3 {
                        return Err(ShardflowError::Sink {
                            path: "out.json".into(),
                            reason: format!("write refused on {}", rank),
                        });
                    }
                    Ok(())
                })
                .await
        }));
    }

    let mut failed = Vec::new();
    for handle in handles {
        if let Err(e) = handle.await.unwrap() {
            assert!(e.is_deferred());
            if let ShardflowError::Flush { rank, .. } = e {
                failed.push(rank);
            }
        }
    }

    failed.sort();
    assert_eq!(failed, vec![0, 3]);
    assert_eq!(flushed.load(Ordering::SeqCst), 6);
}

fn free_addrs(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<_> = (0..n)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

/// Token protocol and broadcast over a TCP group
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_group() {
    let peers = free_addrs(3);

    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    for rank in 0..3 {
        let channel = TcpChannel::bind(TcpConfig::new(rank, peers.clone())).await.unwrap();
        channels.push(Arc::new(channel));
    }

    let monitor = Arc::new(FlushMonitor::default());
    let mut handles = Vec::new();
    for channel in channels {
        let monitor = monitor.clone();
        handles.push(tokio::spawn(async move {
            let rank = channel.rank();
            let value = vec!["K00".to_string(), "K01".to_string()];
            let keys: Vec<String> =
                broadcast(channel.as_ref(), (rank == 0).then_some(&value), 0).await?;

            let writer =
                WriteCoordinator::new(CoordinationContext::new(channel), Box::new(FixedElection(1)));
            let outcome = writer.write(|| async move { monitor.flush(rank).await }).await?;
            Ok::<_, ShardflowError>((keys, outcome))
        }));
    }

    for handle in handles {
        let (keys, outcome) = handle.await.unwrap().unwrap();
        assert_eq!(keys, vec!["K00", "K01"]);
        assert_eq!(outcome.manager, 1);
    }
    assert_eq!(monitor.flushes.load(Ordering::SeqCst), 3);
    assert_eq!(monitor.overlaps.load(Ordering::SeqCst), 0);
}

/// A peer that starts late still receives the key broadcast
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_late_peer_is_awaited() {
    let peers = free_addrs(2);
    let backoff = Duration::from_millis(10);

    let root = TcpChannel::bind(TcpConfig::new(0, peers.clone()).with_connect(0, backoff))
        .await
        .unwrap();
    let sender = tokio::spawn(async move {
        let value = vec!["K00".to_string()];
        broadcast::<Vec<String>>(&root, Some(&value), 0).await
    });

    // Dozens of connect attempts fail before this peer listens
    tokio::time::sleep(Duration::from_millis(600)).await;
    let late = TcpChannel::bind(TcpConfig::new(1, peers).with_connect(0, backoff))
        .await
        .unwrap();

    let received: Vec<String> = tokio::time::timeout(
        Duration::from_secs(10),
        broadcast::<Vec<String>>(&late, None, 0),
    )
    .await
    .expect("late peer never received the broadcast")
    .unwrap();

    assert_eq!(received, vec!["K00"]);
    assert_eq!(sender.await.unwrap().unwrap(), vec!["K00"]);
}

/// Bounded connection attempts give up on a peer that never listens
#[tokio::test]
async fn test_tcp_bounded_connect_fails() {
    let peers = free_addrs(2);
    let root = TcpChannel::bind(
        TcpConfig::new(0, peers).with_connect(3, Duration::from_millis(10)),
    )
    .await
    .unwrap();

    let err = root.send(1, 0).await.unwrap_err();
    assert!(matches!(err, ShardflowError::Channel { peer: 1, .. }));
}
