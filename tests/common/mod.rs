//! In-memory broker used by the integration tests.
//!
//! A `MockCluster` holds partitioned topic logs behind a mutex; the consumer,
//! producer, and transactional producer implement the engine's client traits
//! against it. Fault injection counters let tests fail the next N polls or
//! transaction commits to exercise the retry and exactly-once paths.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kafka_subscriptions::{
    BrokerConsumer, BrokerProducer, ClientFactory, GroupMembership, OffsetMap, RebalanceEvent,
    Record, Result, SubscriptionConfig, SubscriptionError, TopicPartition, TransactionalProducer,
};

#[derive(Default)]
struct ClusterState {
    /// topic -> per-partition logs.
    topics: HashMap<String, Vec<Vec<Record>>>,
    /// (group, partition) -> committed next offset.
    committed: HashMap<(String, TopicPartition), i64>,
    fail_polls: u32,
    fail_tx_commits: u32,
}

#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
    }

    /// Append directly, as an external producer would.
    pub fn append(&self, record: Record) -> (i32, i64) {
        let mut state = self.lock();
        Self::append_locked(&mut state, record)
    }

    /// Every record in `topic`, in partition order then offset order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .map(|logs| logs.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.lock();
        state
            .committed
            .get(&(group.to_string(), tp.clone()))
            .copied()
    }

    /// Fail the next `n` consumer polls with an intermittent error.
    pub fn fail_next_polls(&self, n: u32) {
        self.lock().fail_polls = n;
    }

    /// Fail the next `n` transaction commits with an intermittent error.
    pub fn fail_next_tx_commits(&self, n: u32) {
        self.lock().fail_tx_commits = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append_locked(state: &mut ClusterState, mut record: Record) -> (i32, i64) {
        let requested = record.partition;
        let logs = state.topics.entry(record.topic.clone()).or_insert_with(|| {
            vec![Vec::new(); requested.map(|p| p as usize + 1).unwrap_or(1)]
        });
        let partition = match requested {
            Some(p) => p,
            None => {
                let mut hasher = DefaultHasher::new();
                record.key.hash(&mut hasher);
                (hasher.finish() % logs.len() as u64) as i32
            }
        };
        let log = &mut logs[partition as usize];
        let offset = log.len() as i64;
        record.partition = Some(partition);
        record.offset = Some(offset);
        record.timestamp = Some(chrono::Utc::now().timestamp_millis());
        log.push(record);
        (partition, offset)
    }
}

pub struct MockConsumer {
    cluster: MockCluster,
    group_id: String,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    paused: HashSet<TopicPartition>,
    rebalances: Vec<RebalanceEvent>,
}

impl MockConsumer {
    fn new(cluster: MockCluster, group_id: String) -> Self {
        Self {
            cluster,
            group_id,
            assignment: Vec::new(),
            positions: HashMap::new(),
            paused: HashSet::new(),
            rebalances: Vec::new(),
        }
    }

    fn committed_or_zero(&self, tp: &TopicPartition) -> i64 {
        self.cluster.committed(&self.group_id, tp).unwrap_or(0)
    }
}

#[async_trait]
impl BrokerConsumer for MockConsumer {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<Record>> {
        {
            let mut state = self.cluster.lock();
            if state.fail_polls > 0 {
                state.fail_polls -= 1;
                return Err(SubscriptionError::intermittent("injected poll failure"));
            }
        }
        let mut records = Vec::new();
        {
            let state = self.cluster.lock();
            for tp in &self.assignment {
                if self.paused.contains(tp) {
                    continue;
                }
                let Some(logs) = state.topics.get(&tp.topic) else {
                    continue;
                };
                let Some(log) = logs.get(tp.partition as usize) else {
                    continue;
                };
                let position = self.positions.get(tp).copied().unwrap_or(0);
                for record in log.iter().skip(position as usize) {
                    if records.len() >= max_records {
                        break;
                    }
                    records.push(record.clone());
                }
            }
        }
        for record in &records {
            if let (Some(tp), Some(offset)) = (record.topic_partition(), record.offset) {
                let position = self.positions.entry(tp).or_insert(0);
                if *position <= offset {
                    *position = offset + 1;
                }
            }
        }
        if records.is_empty() {
            // Simulate blocking so busy poll loops yield to the runtime.
            tokio::time::sleep(timeout.min(Duration::from_millis(2))).await;
        }
        Ok(records)
    }

    async fn subscribe(&mut self, topics: &[String]) -> Result<()> {
        let mut assignment = Vec::new();
        for topic in topics {
            for partition in BrokerConsumer::partitions_for(self, topic).await? {
                assignment.push(TopicPartition::new(topic.clone(), partition));
            }
        }
        self.positions = assignment
            .iter()
            .map(|tp| (tp.clone(), self.committed_or_zero(tp)))
            .collect();
        self.assignment = assignment.clone();
        // Single-member group: assignment is immediate.
        self.rebalances.push(RebalanceEvent::Assigned(assignment));
        Ok(())
    }

    async fn assign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.assignment = partitions.to_vec();
        self.positions = partitions.iter().map(|tp| (tp.clone(), 0)).collect();
        self.paused.clear();
        Ok(())
    }

    async fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.positions.insert(tp.clone(), offset);
        Ok(())
    }

    async fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        for tp in partitions {
            self.positions.insert(tp.clone(), 0);
        }
        Ok(())
    }

    async fn seek_to_committed(&mut self) -> Result<()> {
        for tp in self.assignment.clone() {
            let committed = self.committed_or_zero(&tp);
            self.positions.insert(tp, committed);
        }
        Ok(())
    }

    async fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    async fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        for tp in partitions {
            self.paused.remove(tp);
        }
        Ok(())
    }

    async fn commit(&mut self, offsets: &OffsetMap) -> Result<()> {
        let mut state = self.cluster.lock();
        for (tp, next) in offsets.iter() {
            state
                .committed
                .insert((self.group_id.clone(), tp.clone()), next);
        }
        Ok(())
    }

    async fn end_offsets(&mut self, topic: &str) -> Result<HashMap<i32, i64>> {
        let state = self.cluster.lock();
        let Some(logs) = state.topics.get(topic) else {
            return Err(SubscriptionError::fatal(format!("unknown topic {topic}")));
        };
        Ok(logs
            .iter()
            .enumerate()
            .map(|(p, log)| (p as i32, log.len() as i64))
            .collect())
    }

    async fn position(&mut self) -> Result<OffsetMap> {
        let mut positions = OffsetMap::new();
        for tp in &self.assignment {
            positions.set(tp.clone(), self.positions.get(tp).copied().unwrap_or(0));
        }
        Ok(positions)
    }

    async fn partitions_for(&mut self, topic: &str) -> Result<Vec<i32>> {
        let state = self.cluster.lock();
        let Some(logs) = state.topics.get(topic) else {
            return Err(SubscriptionError::fatal(format!("unknown topic {topic}")));
        };
        Ok((0..logs.len() as i32).collect())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.clone()
    }

    fn take_rebalances(&mut self) -> Vec<RebalanceEvent> {
        std::mem::take(&mut self.rebalances)
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn group_membership(&self) -> Result<GroupMembership> {
        Ok(GroupMembership::Named(self.group_id.clone()))
    }
}

pub struct MockProducer {
    cluster: MockCluster,
}

#[async_trait]
impl BrokerProducer for MockProducer {
    async fn send(&self, record: &Record) -> Result<(i32, i64)> {
        Ok(self.cluster.append(record.clone()))
    }
}

#[derive(Default)]
struct TxState {
    open: bool,
    records: Vec<Record>,
    offsets: Vec<(String, OffsetMap)>,
}

pub struct MockTxProducer {
    cluster: MockCluster,
    tx: Mutex<TxState>,
}

#[async_trait]
impl BrokerProducer for MockTxProducer {
    async fn send(&self, record: &Record) -> Result<(i32, i64)> {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if !tx.open {
            return Err(SubscriptionError::fatal("send outside a transaction"));
        }
        tx.records.push(record.clone());
        // Partition and offset are only known at commit.
        Ok((record.partition.unwrap_or(-1), -1))
    }
}

#[async_trait]
impl TransactionalProducer for MockTxProducer {
    async fn begin_transaction(&self) -> Result<()> {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.open = true;
        tx.records.clear();
        tx.offsets.clear();
        Ok(())
    }

    async fn send_offsets(&self, offsets: &OffsetMap, group: GroupMembership) -> Result<()> {
        let Some(group) = group.group_id().map(str::to_string) else {
            return Err(SubscriptionError::fatal(
                "mock producer needs a named group membership",
            ));
        };
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if !tx.open {
            return Err(SubscriptionError::fatal("send_offsets outside a transaction"));
        }
        tx.offsets.push((group, offsets.clone()));
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.cluster.lock();
        if state.fail_tx_commits > 0 {
            state.fail_tx_commits -= 1;
            return Err(SubscriptionError::intermittent(
                "injected transaction commit failure",
            ));
        }
        for record in tx.records.drain(..) {
            MockCluster::append_locked(&mut state, record);
        }
        for (group, offsets) in tx.offsets.drain(..) {
            for (tp, next) in offsets.iter() {
                state.committed.insert((group.clone(), tp.clone()), next);
            }
        }
        tx.open = false;
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<()> {
        let mut tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.records.clear();
        tx.offsets.clear();
        tx.open = false;
        Ok(())
    }
}

pub struct MockFactory {
    pub cluster: MockCluster,
    consumers_created: std::sync::atomic::AtomicUsize,
}

impl MockFactory {
    pub fn new(cluster: MockCluster) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            consumers_created: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Group consumers handed out so far; a second one means the retry
    /// driver tore a session down and rebuilt its handles.
    pub fn consumers_created(&self) -> usize {
        self.consumers_created.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    type Consumer = MockConsumer;
    type Producer = MockProducer;
    type TxProducer = MockTxProducer;

    async fn consumer(&self, config: &SubscriptionConfig) -> Result<MockConsumer> {
        self.consumers_created
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(MockConsumer::new(
            self.cluster.clone(),
            config.group_id.clone(),
        ))
    }

    async fn standalone_consumer(&self, config: &SubscriptionConfig) -> Result<MockConsumer> {
        Ok(MockConsumer::new(
            self.cluster.clone(),
            format!("{}-standalone", config.group_id),
        ))
    }

    async fn producer(&self, _config: &SubscriptionConfig) -> Result<MockProducer> {
        Ok(MockProducer {
            cluster: self.cluster.clone(),
        })
    }

    async fn transactional_producer(&self, _config: &SubscriptionConfig) -> Result<MockTxProducer> {
        Ok(MockTxProducer {
            cluster: self.cluster.clone(),
            tx: Mutex::new(TxState::default()),
        })
    }
}

/// Config with timings tightened for tests. Also installs the log
/// subscriber so `RUST_LOG=debug cargo test` shows the engine's tracing.
pub fn test_config(group_id: &str, topic: &str) -> SubscriptionConfig {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    SubscriptionConfig {
        poll_timeout: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(2),
        processing_timeout: Duration::from_millis(250),
        backoff: kafka_subscriptions::RetryBackoff {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
        },
        ..SubscriptionConfig::new("mock:9092", group_id, topic)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
