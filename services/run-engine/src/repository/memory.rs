//! In-memory repository.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use runway_id::{EnvId, RunId, WaitpointId};

use super::{RepositoryError, RepositoryResult, RunRepository};
use crate::model::{Output, Run, Waitpoint, WaitpointKind, WaitpointStatus};

#[derive(Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    waitpoints: HashMap<WaitpointId, Waitpoint>,
    idempotency: HashMap<(EnvId, String), WaitpointId>,
    bindings: BTreeSet<(WaitpointId, RunId)>,
}

/// [`RunRepository`] backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryRunRepository {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live run ⇄ waitpoint bindings.
    pub async fn binding_count(&self) -> usize {
        self.tables.read().await.bindings.len()
    }
}

#[async_trait]
impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, run: &Run) -> RepositoryResult<()> {
        let mut tables = self.tables.write().await;
        if tables.runs.contains_key(&run.id) {
            return Err(RepositoryError::Duplicate(run.id.to_string()));
        }
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn delete_run(&self, run_id: &RunId) -> RepositoryResult<()> {
        self.tables
            .write()
            .await
            .runs
            .remove(run_id);
        Ok(())
    }

    async fn find_run(&self, env_id: &EnvId, run_id: &RunId) -> RepositoryResult<Option<Run>> {
        let tables = self.tables.read().await;
        Ok(tables
            .runs
            .get(run_id)
            .filter(|run| run.env_id == *env_id)
            .cloned())
    }

    async fn get_run(&self, run_id: &RunId) -> RepositoryResult<Option<Run>> {
        let tables = self.tables.read().await;
        Ok(tables.runs.get(run_id).cloned())
    }

    async fn update_run(&self, run: &Run) -> RepositoryResult<()> {
        let mut tables = self.tables.write().await;
        match tables.runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(RepositoryError::Corrupt {
                id: run.id.to_string(),
                message: "update of missing run".to_string(),
            }),
        }
    }

    async fn create_waitpoint(&self, waitpoint: &Waitpoint) -> RepositoryResult<Waitpoint> {
        let mut tables = self.tables.write().await;
        if let Some(key) = &waitpoint.idempotency_key {
            let index_key = (waitpoint.env_id, key.clone());
            if let Some(existing) = tables.idempotency.get(&index_key) {
                if let Some(existing) = tables.waitpoints.get(existing) {
                    return Ok(existing.clone());
                }
            }
            tables.idempotency.insert(index_key, waitpoint.id);
        }
        tables.waitpoints.insert(waitpoint.id, waitpoint.clone());
        Ok(waitpoint.clone())
    }

    async fn find_waitpoint(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
    ) -> RepositoryResult<Option<Waitpoint>> {
        let tables = self.tables.read().await;
        Ok(tables
            .waitpoints
            .get(waitpoint_id)
            .filter(|waitpoint| waitpoint.env_id == *env_id)
            .cloned())
    }

    async fn find_waitpoint_by_idempotency_key(
        &self,
        env_id: &EnvId,
        idempotency_key: &str,
    ) -> RepositoryResult<Option<Waitpoint>> {
        let tables = self.tables.read().await;
        Ok(tables
            .idempotency
            .get(&(*env_id, idempotency_key.to_string()))
            .and_then(|id| tables.waitpoints.get(id))
            .cloned())
    }

    async fn complete_waitpoint(
        &self,
        waitpoint_id: &WaitpointId,
        output: Option<&Output>,
        completed_at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(waitpoint) = tables.waitpoints.get_mut(waitpoint_id) else {
            return Ok(false);
        };
        if waitpoint.status == WaitpointStatus::Completed {
            return Ok(false);
        }
        waitpoint.status = WaitpointStatus::Completed;
        waitpoint.output = output.cloned();
        waitpoint.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn completion_waitpoints_for_run(
        &self,
        run_id: &RunId,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        let tables = self.tables.read().await;
        Ok(tables
            .waitpoints
            .values()
            .filter(|w| {
                w.kind == WaitpointKind::RunCompletion
                    && w.status == WaitpointStatus::Pending
                    && w.completed_by_run.as_ref() == Some(run_id)
            })
            .cloned()
            .collect())
    }

    async fn due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        let tables = self.tables.read().await;
        let mut due: Vec<Waitpoint> = tables
            .waitpoints
            .values()
            .filter(|w| {
                w.kind == WaitpointKind::DateTime
                    && w.status == WaitpointStatus::Pending
                    && w.completed_after.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|w| w.completed_after);
        due.truncate(limit);
        Ok(due)
    }

    async fn completed_waitpoints_with_bindings(
        &self,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        let tables = self.tables.read().await;
        let bound: BTreeSet<WaitpointId> = tables.bindings.iter().map(|(id, _)| *id).collect();
        let mut stranded: Vec<Waitpoint> = bound
            .iter()
            .filter_map(|id| tables.waitpoints.get(id))
            .filter(|w| w.status == WaitpointStatus::Completed)
            .cloned()
            .collect();
        stranded.sort_by_key(|w| w.completed_at);
        stranded.truncate(limit);
        Ok(stranded)
    }

    async fn bind_run(&self, run_id: &RunId, waitpoint_id: &WaitpointId) -> RepositoryResult<()> {
        self.tables
            .write()
            .await
            .bindings
            .insert((*waitpoint_id, *run_id));
        Ok(())
    }

    async fn unbind_run(
        &self,
        run_id: &RunId,
        waitpoint_id: &WaitpointId,
    ) -> RepositoryResult<()> {
        self.tables
            .write()
            .await
            .bindings
            .remove(&(*waitpoint_id, *run_id));
        Ok(())
    }

    async fn blocked_runs(&self, waitpoint_id: &WaitpointId) -> RepositoryResult<Vec<RunId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .bindings
            .range((*waitpoint_id, RunId::from_ulid(runway_id::Ulid::nil()))..)
            .take_while(|(waitpoint, _)| waitpoint == waitpoint_id)
            .map(|(_, run_id)| *run_id)
            .collect())
    }
}
