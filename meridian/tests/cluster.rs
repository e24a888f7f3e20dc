//! End-to-end scenarios over real clusters on loopback TCP. Each test uses
//! its own port range so they can run in parallel.

use std::sync::Arc;

use meridian::config::{Config, LockManagerMode};
use meridian::execution::parse_code;
use meridian::message::{ApiRequest, ApiResponse};
use meridian::socket;
use meridian::storage::Storage;
use meridian::transaction::{KeyMode, Transaction, TxnEvent, TxnStatus};
use meridian::{MachineHandle, MachineId, ModuleId};

async fn start_cluster(config: Config) -> Vec<MachineHandle> {
    let config = Arc::new(config);
    let mut handles = Vec::new();
    for id in 0..config.num_machines() {
        handles.push(meridian::start(config.clone(), MachineId(id)).await);
    }
    handles
}

struct Client {
    rx: socket::Rx<ApiResponse>,
    tx: socket::Tx<ApiRequest>,
}

impl Client {
    async fn connect(handle: &MachineHandle) -> Self {
        let port = handle.config.client_port_of(handle.id);
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("could not reach server");
        let (rx, tx) = socket::split(stream);
        Client { rx, tx }
    }

    async fn submit(&mut self, txn: Transaction) {
        self.tx
            .send(&ApiRequest::Txn { txn: Box::new(txn) })
            .await
            .expect("send failed");
    }

    async fn response(&mut self) -> Transaction {
        let response = tokio::time::timeout(std::time::Duration::from_secs(20), self.rx.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("server hung up");
        match response {
        | ApiResponse::Txn { txn } => *txn,
        | other => panic!("unexpected response: {:?}", other),
        }
    }

    async fn round_trip(&mut self, txn: Transaction) -> Transaction {
        self.submit(txn).await;
        self.response().await
    }

    async fn stats(&mut self, module: ModuleId, level: u32) -> serde_json::Value {
        self.tx
            .send(&ApiRequest::Stats { module, level })
            .await
            .expect("send failed");
        let response = tokio::time::timeout(std::time::Duration::from_secs(20), self.rx.recv())
            .await
            .expect("timed out waiting for stats")
            .expect("server hung up");
        match response {
        | ApiResponse::Stats { json } => serde_json::from_str(&json).expect("malformed stats"),
        | other => panic!("unexpected response: {:?}", other),
        }
    }
}

fn txn(keys: Vec<(&str, KeyMode)>, code: Vec<Vec<&str>>) -> Transaction {
    let keys = keys
        .into_iter()
        .map(|(k, m)| (k.as_bytes().to_vec(), m))
        .collect();
    let code: Vec<Vec<String>> = code
        .into_iter()
        .map(|p| p.into_iter().map(str::to_string).collect())
        .collect();
    Transaction::new(keys, parse_code(&code).expect("bad code"))
}

/// Scenario: one region, two replicas, a single-partition read-only
/// transaction commits and leaves the expected trace.
#[tokio::test]
async fn single_home_single_partition_read() {
    let handles = start_cluster(Config::localhost(1, 2, 1, 25000)).await;
    let mut client = Client::connect(&handles[0]).await;

    let response = client
        .round_trip(txn(vec![("k1", KeyMode::Read)], vec![vec!["echo", "hi"]]))
        .await;

    assert_eq!(response.status, TxnStatus::Committed, "{}", response.abort_reason);
    for event in [
        TxnEvent::EnterForwarder,
        TxnEvent::EnterSequencer,
        TxnEvent::EnterSchedulerLm,
        TxnEvent::Commit,
    ] {
        assert!(response.has_event(event), "missing {:?}", event);
    }
}

/// Scenario: two transactions on the same key serialize; the second reads
/// the first's write.
#[tokio::test]
async fn writes_serialize_before_reads() {
    let handles = start_cluster(Config::localhost(1, 1, 1, 25200)).await;
    let mut client = Client::connect(&handles[0]).await;

    let write = client
        .round_trip(txn(vec![("k1", KeyMode::Write)], vec![vec!["set", "k1", "a"]]))
        .await;
    assert_eq!(write.status, TxnStatus::Committed, "{}", write.abort_reason);

    let read = client
        .round_trip(txn(vec![("k1", KeyMode::Read)], vec![vec!["get", "k1"]]))
        .await;
    assert_eq!(read.status, TxnStatus::Committed, "{}", read.abort_reason);
    assert_eq!(read.reads, vec![(b"k1".to_vec(), b"a".to_vec())]);
}

/// Scenario: a transaction spanning two home regions takes exactly one
/// multi-home slot and commits on both regions' replicas.
#[tokio::test]
async fn multi_home_txn_commits_everywhere() {
    let mut config = Config::localhost(2, 1, 1, 25400);
    config.metadata_overrides = vec![("k1".to_string(), 0), ("k2".to_string(), 1)];
    let handles = start_cluster(config).await;
    let mut client = Client::connect(&handles[0]).await;

    let response = client
        .round_trip(txn(
            vec![("k1", KeyMode::Write), ("k2", KeyMode::Write)],
            vec![vec!["set", "k1", "x"], vec!["set", "k2", "y"]],
        ))
        .await;

    assert_eq!(response.status, TxnStatus::Committed, "{}", response.abort_reason);
    assert!(response.internal.multi_home);
    assert_eq!(response.internal.involved_regions, vec![0, 1]);

    // Every machine executes the same stream; both regions converge.
    for handle in &handles {
        let mut tries = 0;
        loop {
            let k1 = handle.storage.read(b"k1");
            let k2 = handle.storage.read(b"k2");
            if k1 == Some(b"x".to_vec()) && k2 == Some(b"y".to_vec()) {
                break;
            }
            tries += 1;
            assert!(tries < 100, "machine {} never applied the writes", handle.id);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

/// Scenario: opposing multi-home writers under the deadlock-resolving lock
/// manager either serialize or lose exactly one of the pair to the
/// deadlock breaker — and the victim is always the younger transaction.
#[tokio::test]
async fn ddr_conflicting_writers_resolve() {
    let mut config = Config::localhost(2, 1, 1, 25600);
    config.lock_manager = LockManagerMode::Ddr;
    config.metadata_overrides = vec![("k1".to_string(), 0), ("k2".to_string(), 1)];
    let handles = start_cluster(config).await;

    let mut client_a = Client::connect(&handles[0]).await;
    let mut client_b = Client::connect(&handles[1]).await;

    client_a
        .submit(txn(
            vec![("k1", KeyMode::Write), ("k2", KeyMode::Write)],
            vec![vec!["set", "k1", "a"], vec!["set", "k2", "a"]],
        ))
        .await;
    client_b
        .submit(txn(
            vec![("k2", KeyMode::Write), ("k1", KeyMode::Write)],
            vec![vec!["set", "k2", "b"], vec!["set", "k1", "b"]],
        ))
        .await;

    let a = client_a.response().await;
    let b = client_b.response().await;

    let aborted: Vec<&Transaction> = [&a, &b]
        .iter()
        .copied()
        .filter(|t| t.status == TxnStatus::Aborted)
        .collect();
    assert!(aborted.len() <= 1, "at most one of the pair may die");
    if let Some(victim) = aborted.first() {
        assert_eq!(victim.abort_reason, "aborted_by_deadlock_breaker");
        let survivor = if victim.id == a.id { &b } else { &a };
        assert!(victim.id > survivor.id, "the deadlock breaker kills the youngest");
        assert_eq!(survivor.status, TxnStatus::Committed);
    }
}

/// Scenario: remastering a key moves its home region, bumps its counter by
/// exactly one, and later transactions route to the new home.
#[tokio::test]
async fn remaster_moves_key_home() {
    let mut config = Config::localhost(2, 1, 1, 25800);
    config.metadata_overrides = vec![("k1".to_string(), 0)];
    let handles = start_cluster(config).await;
    let mut client = Client::connect(&handles[0]).await;

    let remaster = client
        .round_trip(Transaction::new_remaster(vec![b"k1".to_vec()], 1))
        .await;
    assert_eq!(remaster.status, TxnStatus::Committed, "{}", remaster.abort_reason);

    // The forwarder learns the new home asynchronously; a write racing the
    // announcement aborts with outdated metadata and is retried.
    let mut tries = 0;
    let committed = loop {
        let response = client
            .round_trip(txn(vec![("k1", KeyMode::Write)], vec![vec!["set", "k1", "v"]]))
            .await;
        if response.status == TxnStatus::Committed {
            break response;
        }
        assert_eq!(response.abort_reason, "outdated metadata");
        tries += 1;
        assert!(tries < 100, "forwarder never learned the remaster");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    };

    let metadata = committed.keys[0].metadata.expect("unstamped key");
    assert_eq!(metadata.master, 1, "key must now route to region 1");
    assert_eq!(metadata.counter, 1, "counter bumps exactly once");
}

/// Scenario: after traffic drains, the scheduler reports no active
/// transactions and no locked keys.
#[tokio::test]
async fn scheduler_stats_drain_to_zero() {
    let handles = start_cluster(Config::localhost(1, 1, 1, 26000)).await;
    let mut client = Client::connect(&handles[0]).await;

    let response = client
        .round_trip(txn(vec![("k1", KeyMode::Write)], vec![vec!["set", "k1", "a"]]))
        .await;
    assert_eq!(response.status, TxnStatus::Committed, "{}", response.abort_reason);

    let stats = client.stats(ModuleId::Scheduler, 1).await;
    assert_eq!(stats["active_txns"], 0);
    assert_eq!(stats["num_locked_keys"], 0);
}

/// Scenario: malformed code is rejected at the server edge and never
/// enters the pipeline.
#[tokio::test]
async fn malformed_txn_rejected_at_admission() {
    let handles = start_cluster(Config::localhost(1, 1, 1, 26200)).await;
    let mut client = Client::connect(&handles[0]).await;

    let mut bad = txn(vec![("k1", KeyMode::Write)], vec![vec!["set", "k1", "a"]]);
    bad.code[0].args.pop();
    let response = client.round_trip(bad).await;
    assert_eq!(response.status, TxnStatus::Aborted);
    assert!(response.abort_reason.contains("invalid number of arguments"));
    assert_eq!(response.id, 0, "rejected transactions are never admitted");

    let empty = Transaction::new(Vec::new(), Vec::new());
    let response = client.round_trip(empty).await;
    assert_eq!(response.status, TxnStatus::Aborted);
    assert!(response.abort_reason.contains("no keys"));
}

/// Scenario: replicas of the same partition dispatch an identical stream.
/// Two replicas' storages converge to the same values after a burst of
/// conflicting writes.
#[tokio::test]
async fn replicas_converge_on_the_same_state() {
    let handles = start_cluster(Config::localhost(1, 2, 1, 26400)).await;
    let mut client = Client::connect(&handles[0]).await;

    for round in 0..10 {
        let value = format!("v{}", round);
        let response = client
            .round_trip(txn(
                vec![("k1", KeyMode::Write)],
                vec![vec!["set", "k1", &value]],
            ))
            .await;
        assert_eq!(response.status, TxnStatus::Committed, "{}", response.abort_reason);
    }

    // Replica 1 hears the same log; wait for it to catch up.
    let mut tries = 0;
    loop {
        if handles[1].storage.read(b"k1") == Some(b"v9".to_vec()) {
            break;
        }
        tries += 1;
        assert!(tries < 100, "replica never converged");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(handles[0].storage.read(b"k1"), handles[1].storage.read(b"k1"));
}
