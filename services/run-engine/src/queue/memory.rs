//! Process-local queue store.
//!
//! One async mutex guards the whole keyspace, which gives every trait method
//! the single-round-trip atomicity a shared sorted-set server would.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use runway_id::{EnvId, RunId};
use tokio::sync::Mutex;

use super::{QueueEntry, QueueError, QueueResult, QueueScore, QueueStore};

#[derive(Default)]
struct EnvQueue {
    master_queue: String,
    ordered: BTreeSet<(QueueScore, RunId)>,
    entries: HashMap<RunId, QueueEntry>,
}

#[derive(Default)]
struct MasterIndex {
    members: BTreeSet<EnvId>,
    cursor: usize,
}

#[derive(Default)]
struct Keyspace {
    queues: HashMap<EnvId, EnvQueue>,
    masters: HashMap<String, MasterIndex>,
    sequences: HashMap<EnvId, u64>,
    locations: HashMap<RunId, EnvId>,
}

impl Keyspace {
    fn remove_entry(&mut self, env_id: &EnvId, run_id: &RunId) -> bool {
        let Some(queue) = self.queues.get_mut(env_id) else {
            return false;
        };
        let Some(entry) = queue.entries.remove(run_id) else {
            return false;
        };
        queue.ordered.remove(&(entry.score, *run_id));
        self.locations.remove(run_id);

        if queue.entries.is_empty() {
            let master_queue = std::mem::take(&mut queue.master_queue);
            self.queues.remove(env_id);
            if let Some(master) = self.masters.get_mut(&master_queue) {
                master.members.remove(env_id);
                if master.members.is_empty() {
                    self.masters.remove(&master_queue);
                }
            }
        }
        true
    }
}

/// In-memory [`QueueStore`].
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn next_sequence(&self, env_id: &EnvId) -> QueueResult<u64> {
        let mut keyspace = self.keyspace.lock().await;
        let sequence = keyspace.sequences.entry(*env_id).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    async fn enqueue(&self, entry: QueueEntry) -> QueueResult<()> {
        let mut keyspace = self.keyspace.lock().await;

        if let Some(queue) = keyspace.queues.get(&entry.env_id) {
            let only_self = queue.entries.len() == 1 && queue.entries.contains_key(&entry.run_id);
            if queue.master_queue != entry.master_queue && !only_self {
                return Err(QueueError::MasterQueueMismatch {
                    env_id: entry.env_id,
                    attached: queue.master_queue.clone(),
                    requested: entry.master_queue,
                });
            }
        }

        if let Some(previous_env) = keyspace.locations.get(&entry.run_id).copied() {
            keyspace.remove_entry(&previous_env, &entry.run_id);
        }

        let queue = keyspace.queues.entry(entry.env_id).or_default();
        queue.master_queue = entry.master_queue.clone();
        queue.ordered.insert((entry.score, entry.run_id));
        queue.entries.insert(entry.run_id, entry.clone());

        keyspace.locations.insert(entry.run_id, entry.env_id);
        keyspace
            .masters
            .entry(entry.master_queue)
            .or_default()
            .members
            .insert(entry.env_id);
        Ok(())
    }

    async fn remove(&self, env_id: &EnvId, run_id: &RunId) -> QueueResult<bool> {
        let mut keyspace = self.keyspace.lock().await;
        Ok(keyspace.remove_entry(env_id, run_id))
    }

    async fn length(&self, env_id: &EnvId) -> QueueResult<usize> {
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace
            .queues
            .get(env_id)
            .map_or(0, |queue| queue.entries.len()))
    }

    async fn peek(&self, env_id: &EnvId) -> QueueResult<Option<QueueEntry>> {
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace.queues.get(env_id).and_then(|queue| {
            queue
                .ordered
                .first()
                .and_then(|(_, run_id)| queue.entries.get(run_id).cloned())
        }))
    }

    async fn rotate_master(&self, master_queue: &str) -> QueueResult<Vec<EnvId>> {
        let mut keyspace = self.keyspace.lock().await;
        let Some(master) = keyspace.masters.get_mut(master_queue) else {
            return Ok(Vec::new());
        };

        let members: Vec<EnvId> = master.members.iter().copied().collect();
        if members.is_empty() {
            return Ok(members);
        }
        let start = master.cursor % members.len();
        master.cursor = master.cursor.wrapping_add(1);

        Ok(members[start..]
            .iter()
            .chain(members[..start].iter())
            .copied()
            .collect())
    }

    async fn master_members(&self, master_queue: &str) -> QueueResult<Vec<EnvId>> {
        let keyspace = self.keyspace.lock().await;
        Ok(keyspace
            .masters
            .get(master_queue)
            .map(|master| master.members.iter().copied().collect())
            .unwrap_or_default())
    }
}
