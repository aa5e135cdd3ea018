// In-process cluster tests for incremental directory splitting
//
// Every test runs real ServerNodes (handler + split thread) connected through
// LocalTransport, and talks to them with the same RpcClient the CLI uses.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use shardfs::metadata::{
    index_for_name, name_hash, DirRef, PartitionMap, ROOT_DIRECTORY_ID,
};
use shardfs::rpc::client::{RetryPolicy, RpcClient};
use shardfs::rpc::{LocalTransport, Operation, Request, Status};
use shardfs::server::{NodeOptions, ServerNode};
use shardfs::split::SplitTask;
use shardfs::storage::MetadataStore;

const WAIT: Duration = Duration::from_secs(10);

fn cluster(count: u32, threshold: u64) -> (Arc<LocalTransport>, Vec<ServerNode>) {
    let transport = Arc::new(LocalTransport::new(count));
    let nodes: Vec<ServerNode> = (0..count)
        .map(|id| {
            let options = NodeOptions::new(id, count)
                .with_split_threshold(threshold)
                .with_place_timeout(Duration::from_secs(5));
            ServerNode::start(options, transport.clone()).unwrap()
        })
        .collect();
    for node in &nodes {
        transport.register(node.server_id(), &node.handler());
    }
    (transport, nodes)
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 64,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(20),
        rpc_timeout: Duration::from_secs(5),
        deadline: None,
    }
}

fn wait_all(nodes: &[ServerNode]) {
    // 受け取った側の分割が元の側に波及することはないので 2 周で十分
    for _ in 0..2 {
        for node in nodes {
            assert!(node.wait_for_splits(WAIT), "server {} never went idle", node.server_id());
        }
    }
}

/// Union of every server's view of the root map
fn merged_root_map(nodes: &[ServerNode]) -> PartitionMap {
    let mut merged: Option<PartitionMap> = None;
    for node in nodes {
        let Some(pin) = node.metadata_server().cache().lookup(ROOT_DIRECTORY_ID) else {
            continue;
        };
        let mapping = pin.mapping();
        node.metadata_server().cache().release(pin);
        match merged.as_mut() {
            Some(m) => {
                m.merge(&mapping).unwrap();
            }
            None => merged = Some(mapping),
        }
    }
    merged.unwrap()
}

/// Names in the root directory per server, across all partitions that server holds
fn stored_names(node: &ServerNode, mapping: &PartitionMap) -> Vec<String> {
    let mut names = Vec::new();
    for partition in mapping.partitions() {
        for (name, _) in node.store().list_partition(ROOT_DIRECTORY_ID, partition).unwrap() {
            names.push(name);
        }
    }
    names
}

fn names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

#[test]
fn test_first_split_moves_odd_hashes_to_second_server() {
    let threshold = 16;
    let (transport, nodes) = cluster(2, threshold);
    let writer = RpcClient::new(transport.clone(), policy());

    let created = names("file_", threshold as usize);
    for name in &created {
        writer.mknod(DirRef::root(), name, 0o644).unwrap();
    }
    wait_all(&nodes);

    let mapping = merged_root_map(&nodes);
    assert_eq!(mapping.radix(), 1);
    assert!(mapping.exists(1));
    assert_eq!(mapping.server_for_index(1), 1);

    // 新しいクライアントは radix 0 のマップで server 0 に送り、一度だけ訂正される
    let moved = created
        .iter()
        .find(|n| name_hash(n) & 1 == 1)
        .expect("some name hashes odd");
    let reader = RpcClient::new(transport.clone(), policy());
    let attr = reader.lookup(DirRef::root(), moved).unwrap();
    assert_eq!(attr.size, 0);
    assert_eq!(reader.stats().stale_retries, 1);
    assert_eq!(reader.cached_mapping(DirRef::root()).unwrap().radix(), 1);

    // 同じクライアントの2回目は直接届く
    reader.lookup(DirRef::root(), moved).unwrap();
    assert_eq!(reader.stats().stale_retries, 1);
}

#[test]
fn test_split_conserves_entries() {
    let threshold = 32;
    let (transport, nodes) = cluster(2, threshold);
    let client = RpcClient::new(transport, policy());

    let created = names("entry-", threshold as usize);
    for name in &created {
        client.mknod(DirRef::root(), name, 0o644).unwrap();
    }
    wait_all(&nodes);

    let mapping = merged_root_map(&nodes);
    let on_0 = stored_names(&nodes[0], &mapping);
    let on_1 = stored_names(&nodes[1], &mapping);
    assert_eq!(on_0.len() + on_1.len(), created.len());

    let all: BTreeSet<&String> = on_0.iter().chain(on_1.iter()).collect();
    assert_eq!(all.len(), created.len(), "an entry is stored twice");
    assert_eq!(all, created.iter().collect());

    for name in &on_0 {
        assert_eq!(name_hash(name) & 1, 0, "{} should have stayed", name);
    }
    for name in &on_1 {
        assert_eq!(name_hash(name) & 1, 1, "{} should have moved", name);
    }

    let listing: Vec<String> = client
        .readdir(DirRef::root())
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    let mut expected = created.clone();
    expected.sort();
    assert_eq!(listing, expected);
}

#[test]
fn test_routing_converges_within_radix() {
    let (transport, nodes) = cluster(4, 8);
    let writer = RpcClient::new(transport.clone(), policy());

    let created = names("n", 200);
    for name in &created {
        writer.mknod(DirRef::root(), name, 0o600).unwrap();
    }
    wait_all(&nodes);

    let mapping = merged_root_map(&nodes);
    assert!(mapping.radix() >= 2, "expected several splits, got {:?}", mapping);

    let total: u64 = nodes.iter().map(|n| n.store().total_entries()).sum();
    assert_eq!(total, created.len() as u64);

    for name in &created {
        // 名前ごとに新しいクライアントを使い、キャッシュの影響を除く
        let reader = RpcClient::new(transport.clone(), policy());
        reader.lookup(DirRef::root(), name).unwrap();
        let stale = reader.stats().stale_retries;
        assert!(
            stale <= mapping.radix() as u64,
            "{} took {} stale retries with radix {}",
            name,
            stale,
            mapping.radix()
        );

        let index = index_for_name(&mapping, name);
        let owner = mapping.server_for_index(index) as usize;
        assert!(nodes[owner]
            .store()
            .get(ROOT_DIRECTORY_ID, index, name)
            .is_ok());
    }
}

#[test]
fn test_mutation_on_moving_range_gets_retry() {
    let threshold = 16;
    let (transport, nodes) = cluster(2, threshold);
    let client = RpcClient::new(transport.clone(), policy());

    // 配置を遅らせて分割スロットを保持させる
    transport.set_delay(1, Some(Duration::from_millis(400)));
    for name in names("slow", threshold as usize) {
        client.mknod(DirRef::root(), &name, 0o644).unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));

    let moving = (0..)
        .map(|i| format!("late{}", i))
        .find(|n| name_hash(n) & 1 == 1)
        .unwrap();
    let staying = (0..)
        .map(|i| format!("late{}", i))
        .find(|n| name_hash(n) & 1 == 0)
        .unwrap();

    let handler = nodes[0].handler();
    let resp = handler.handle(Request::MkNod {
        dir: DirRef::root(),
        name: moving.clone(),
        mode: 0o644,
    });
    assert_eq!(resp.status, Status::Retry);

    // 移動しない範囲は分割中でも受け付ける
    let resp = handler.handle(Request::MkNod {
        dir: DirRef::root(),
        name: staying.clone(),
        mode: 0o644,
    });
    assert_eq!(resp.status, Status::Ok);

    wait_all(&nodes);
    transport.set_delay(1, None);

    // 分割完了後はクライアント経由で作成できる
    client.mknod(DirRef::root(), &moving, 0o644).unwrap();
    assert!(nodes[1].store().get(ROOT_DIRECTORY_ID, 1, &moving).is_ok());
    assert!(nodes[0].store().get(ROOT_DIRECTORY_ID, 0, &staying).is_ok());
}

#[test]
fn test_failed_placement_leaves_directory_unchanged() {
    let threshold = 16;
    let (transport, nodes) = cluster(2, threshold);
    let client = RpcClient::new(transport.clone(), policy());

    transport.set_unreachable(1, true);
    let created = names("keep", threshold as usize);
    for name in &created {
        client.mknod(DirRef::root(), name, 0o644).unwrap();
    }
    assert!(nodes[0].wait_for_splits(WAIT));

    let mapping = merged_root_map(&nodes);
    assert_eq!(mapping.radix(), 0);
    assert_eq!(
        nodes[0].store().partition_len(ROOT_DIRECTORY_ID, 0).unwrap(),
        threshold
    );
    assert_eq!(nodes[1].store().total_entries(), 0);
    for name in &created {
        client.lookup(DirRef::root(), name).unwrap();
    }

    // 復旧後の再トリガーで分割できる
    transport.set_unreachable(1, false);
    assert!(nodes[0].queue().push(SplitTask::new(ROOT_DIRECTORY_ID, 0)));
    wait_all(&nodes);

    let mapping = merged_root_map(&nodes);
    assert_eq!(mapping.radix(), 1);
    let total = nodes[0].store().total_entries() + nodes[1].store().total_entries();
    assert_eq!(total, threshold);
    for name in &created {
        client.lookup(DirRef::root(), name).unwrap();
    }
}

#[test]
fn test_lost_placement_reply_keeps_single_owner() {
    let threshold = 16;
    let (transport, nodes) = cluster(2, threshold);
    let client = RpcClient::new(transport.clone(), policy());

    // server 1 は子を受け取るが、応答は server 0 に届かない
    transport.set_reply_lost(1, Operation::Split, true);
    let created = names("lost", threshold as usize);
    for name in &created {
        client.mknod(DirRef::root(), name, 0o644).unwrap();
    }
    assert!(nodes[0].wait_for_splits(WAIT));

    assert_eq!(merged_root_map(&nodes).radix(), 0);
    assert_eq!(nodes[1].store().total_entries(), 0);
    assert_eq!(nodes[1].metadata_server().stats().splits_aborted, 1);

    // 子の範囲の名前を受け付けるのは親のサーバーだけ
    let late = (0..)
        .map(|i| format!("late{}", i))
        .find(|n| name_hash(n) & 1 == 1)
        .unwrap();
    let create = Request::MkNod {
        dir: DirRef::root(),
        name: late.clone(),
        mode: 0o644,
    };
    assert_eq!(nodes[1].handler().handle(create.clone()).status, Status::StaleMapping);
    assert_eq!(nodes[0].handler().handle(create).status, Status::Ok);

    transport.set_reply_lost(1, Operation::Split, false);
    assert!(nodes[0].queue().push(SplitTask::new(ROOT_DIRECTORY_ID, 0)));
    wait_all(&nodes);

    let mapping = merged_root_map(&nodes);
    assert_eq!(mapping.radix(), 1);
    let total = nodes[0].store().total_entries() + nodes[1].store().total_entries();
    assert_eq!(total, threshold + 1);
    assert!(nodes[1].store().get(ROOT_DIRECTORY_ID, 1, &late).is_ok());
    for name in created.iter().chain(std::iter::once(&late)) {
        client.lookup(DirRef::root(), name).unwrap();
    }
}

#[test]
fn test_subdirectory_splits_independently() {
    let (transport, nodes) = cluster(3, 8);
    let client = RpcClient::new(transport.clone(), policy());

    let attr = client.mkdir(DirRef::root(), "big", 0o755).unwrap();
    let big = DirRef::new(attr.inode, attr.zeroth_server.unwrap());
    for name in names("x", 40) {
        client.mknod(big, &name, 0o644).unwrap();
    }
    wait_all(&nodes);

    // root は 1 エントリのまま分割されない
    assert_eq!(merged_root_map(&nodes).radix(), 0);

    let listing = client.readdir(big).unwrap();
    assert_eq!(listing.len(), 40);

    let mapping = client.get_partition_map(big).unwrap();
    assert!(mapping.radix() >= 1);
    assert_eq!(mapping.zeroth_server(), big.zeroth_server);
}
