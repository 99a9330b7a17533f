//! Postgres repository.
//!
//! Identifiers are stored in internal form. Payload packets are flattened
//! into `{prefix}_kind / _data / _storage_key / _type` columns.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use runway_id::{EnvId, LeaseId, RunId, WaitpointId};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::{RepositoryError, RepositoryResult, RunRepository};
use crate::model::{
    Output, PayloadPacket, Run, RunLease, RunStatus, Waitpoint, WaitpointKind, WaitpointStatus,
};

const UNIQUE_VIOLATION: &str = "23505";

const RUN_COLUMNS: &str = r#"
    id, env_id, task_identifier, queue_name, master_queue, machine_preset,
    payload_kind, payload_data, payload_storage_key, payload_type,
    status, sequence, priority, is_test, blocking_waitpoint_id,
    lease_id, lease_consumer_id, leased_at,
    output_kind, output_data, output_storage_key, output_type, output_is_error,
    created_at, updated_at
"#;

const WAITPOINT_COLUMNS: &str = r#"
    id, env_id, kind, status, idempotency_key, completed_by_run, completed_after,
    output_kind, output_data, output_storage_key, output_type, output_is_error,
    created_at, completed_at
"#;

/// [`RunRepository`] over a Postgres pool.
#[derive(Clone)]
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select_waitpoints(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(waitpoint_from_row).collect()
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create_run(&self, run: &Run) -> RepositoryResult<()> {
        let payload = PacketColumns::from_packet(Some(&run.payload));
        let output = PacketColumns::from_output(run.output.as_ref());

        let result = sqlx::query(
            r#"
            INSERT INTO runs (
                id, friendly_id, env_id, task_identifier, queue_name, master_queue,
                machine_preset, payload_kind, payload_data, payload_storage_key, payload_type,
                status, sequence, priority, is_test, blocking_waitpoint_id,
                lease_id, lease_consumer_id, leased_at,
                output_kind, output_data, output_storage_key, output_type, output_is_error,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16,
                $17, $18, $19,
                $20, $21, $22, $23, $24,
                $25, $26
            )
            "#,
        )
        .bind(run.id.to_internal())
        .bind(run.friendly_id())
        .bind(run.env_id.to_internal())
        .bind(&run.task_identifier)
        .bind(&run.queue_name)
        .bind(&run.master_queue)
        .bind(&run.machine_preset)
        .bind(payload.kind)
        .bind(payload.data)
        .bind(payload.storage_key)
        .bind(payload.data_type.unwrap_or_default())
        .bind(run.status.as_str())
        .bind(run.sequence as i64)
        .bind(run.priority)
        .bind(run.is_test)
        .bind(run.blocking_waitpoint.map(|id| id.to_internal()))
        .bind(run.lease.as_ref().map(|l| l.lease_id.to_internal()))
        .bind(run.lease.as_ref().map(|l| l.consumer_id.clone()))
        .bind(run.lease.as_ref().map(|l| l.leased_at))
        .bind(output.kind)
        .bind(output.data)
        .bind(output.storage_key)
        .bind(output.data_type)
        .bind(output.is_error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(RepositoryError::Duplicate(run.id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_run(&self, run_id: &RunId) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM runs WHERE id = $1")
            .bind(run_id.to_internal())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_run(&self, env_id: &EnvId, run_id: &RunId) -> RepositoryResult<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 AND env_id = $2");
        let row = sqlx::query(&sql)
            .bind(run_id.to_internal())
            .bind(env_id.to_internal())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_run(&self, run_id: &RunId) -> RepositoryResult<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id.to_internal())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_run(&self, run: &Run) -> RepositoryResult<()> {
        let output = PacketColumns::from_output(run.output.as_ref());

        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = $2,
                sequence = $3,
                priority = $4,
                blocking_waitpoint_id = $5,
                lease_id = $6,
                lease_consumer_id = $7,
                leased_at = $8,
                output_kind = $9,
                output_data = $10,
                output_storage_key = $11,
                output_type = $12,
                output_is_error = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(run.id.to_internal())
        .bind(run.status.as_str())
        .bind(run.sequence as i64)
        .bind(run.priority)
        .bind(run.blocking_waitpoint.map(|id| id.to_internal()))
        .bind(run.lease.as_ref().map(|l| l.lease_id.to_internal()))
        .bind(run.lease.as_ref().map(|l| l.consumer_id.clone()))
        .bind(run.lease.as_ref().map(|l| l.leased_at))
        .bind(output.kind)
        .bind(output.data)
        .bind(output.storage_key)
        .bind(output.data_type)
        .bind(output.is_error)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Corrupt {
                id: run.id.to_string(),
                message: "update of missing run".to_string(),
            });
        }
        Ok(())
    }

    async fn create_waitpoint(&self, waitpoint: &Waitpoint) -> RepositoryResult<Waitpoint> {
        let output = PacketColumns::from_output(waitpoint.output.as_ref());

        let result = sqlx::query(
            r#"
            INSERT INTO waitpoints (
                id, env_id, kind, status, idempotency_key, completed_by_run, completed_after,
                output_kind, output_data, output_storage_key, output_type, output_is_error,
                created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (env_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(waitpoint.id.to_internal())
        .bind(waitpoint.env_id.to_internal())
        .bind(waitpoint.kind.as_str())
        .bind(waitpoint.status.as_str())
        .bind(&waitpoint.idempotency_key)
        .bind(waitpoint.completed_by_run.map(|id| id.to_internal()))
        .bind(waitpoint.completed_after)
        .bind(output.kind)
        .bind(output.data)
        .bind(output.storage_key)
        .bind(output.data_type)
        .bind(output.is_error)
        .bind(waitpoint.created_at)
        .bind(waitpoint.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(waitpoint.clone());
        }

        // Lost the idempotency race: hand back the winner.
        let key = waitpoint.idempotency_key.as_deref().unwrap_or_default();
        self.find_waitpoint_by_idempotency_key(&waitpoint.env_id, key)
            .await?
            .ok_or_else(|| RepositoryError::Duplicate(waitpoint.id.to_string()))
    }

    async fn find_waitpoint(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
    ) -> RepositoryResult<Option<Waitpoint>> {
        let sql = format!("SELECT {WAITPOINT_COLUMNS} FROM waitpoints WHERE id = $1 AND env_id = $2");
        let row = sqlx::query(&sql)
            .bind(waitpoint_id.to_internal())
            .bind(env_id.to_internal())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(waitpoint_from_row).transpose()
    }

    async fn find_waitpoint_by_idempotency_key(
        &self,
        env_id: &EnvId,
        idempotency_key: &str,
    ) -> RepositoryResult<Option<Waitpoint>> {
        let sql = format!(
            "SELECT {WAITPOINT_COLUMNS} FROM waitpoints WHERE env_id = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(env_id.to_internal())
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(waitpoint_from_row).transpose()
    }

    async fn complete_waitpoint(
        &self,
        waitpoint_id: &WaitpointId,
        output: Option<&Output>,
        completed_at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let output = PacketColumns::from_output(output);

        let result = sqlx::query(
            r#"
            UPDATE waitpoints SET
                status = 'COMPLETED',
                output_kind = $2,
                output_data = $3,
                output_storage_key = $4,
                output_type = $5,
                output_is_error = $6,
                completed_at = $7
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(waitpoint_id.to_internal())
        .bind(output.kind)
        .bind(output.data)
        .bind(output.storage_key)
        .bind(output.data_type)
        .bind(output.is_error)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn completion_waitpoints_for_run(
        &self,
        run_id: &RunId,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        let sql = format!(
            "SELECT {WAITPOINT_COLUMNS} FROM waitpoints \
             WHERE completed_by_run = $1 AND kind = 'RUN_COMPLETION' AND status = 'PENDING'"
        );
        self.select_waitpoints(sqlx::query(&sql).bind(run_id.to_internal()))
            .await
    }

    async fn due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        let sql = format!(
            "SELECT {WAITPOINT_COLUMNS} FROM waitpoints \
             WHERE kind = 'DATE_TIME' AND status = 'PENDING' AND completed_after <= $1 \
             ORDER BY completed_after LIMIT $2"
        );
        self.select_waitpoints(sqlx::query(&sql).bind(now).bind(limit as i64))
            .await
    }

    async fn completed_waitpoints_with_bindings(
        &self,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        let sql = format!(
            "SELECT {WAITPOINT_COLUMNS} FROM waitpoints \
             WHERE status = 'COMPLETED' \
               AND EXISTS (SELECT 1 FROM run_waitpoints rw WHERE rw.waitpoint_id = waitpoints.id) \
             ORDER BY completed_at LIMIT $1"
        );
        self.select_waitpoints(sqlx::query(&sql).bind(limit as i64))
            .await
    }

    async fn bind_run(&self, run_id: &RunId, waitpoint_id: &WaitpointId) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO run_waitpoints (run_id, waitpoint_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(run_id.to_internal())
        .bind(waitpoint_id.to_internal())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unbind_run(
        &self,
        run_id: &RunId,
        waitpoint_id: &WaitpointId,
    ) -> RepositoryResult<()> {
        sqlx::query("DELETE FROM run_waitpoints WHERE run_id = $1 AND waitpoint_id = $2")
            .bind(run_id.to_internal())
            .bind(waitpoint_id.to_internal())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn blocked_runs(&self, waitpoint_id: &WaitpointId) -> RepositoryResult<Vec<RunId>> {
        let rows = sqlx::query("SELECT run_id FROM run_waitpoints WHERE waitpoint_id = $1")
            .bind(waitpoint_id.to_internal())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("run_id")?;
                decode_id(&raw, RunId::from_internal)
            })
            .collect()
    }
}

// =============================================================================
// Column mapping
// =============================================================================

struct PacketColumns {
    kind: Option<&'static str>,
    data: Option<Vec<u8>>,
    storage_key: Option<String>,
    data_type: Option<String>,
    is_error: bool,
}

impl PacketColumns {
    fn from_packet(packet: Option<&PayloadPacket>) -> Self {
        match packet {
            None => Self {
                kind: None,
                data: None,
                storage_key: None,
                data_type: None,
                is_error: false,
            },
            Some(PayloadPacket::Inline { data, data_type }) => Self {
                kind: Some("inline"),
                data: Some(data.to_vec()),
                storage_key: None,
                data_type: Some(data_type.clone()),
                is_error: false,
            },
            Some(PayloadPacket::Reference {
                storage_key,
                data_type,
            }) => Self {
                kind: Some("reference"),
                data: None,
                storage_key: Some(storage_key.clone()),
                data_type: Some(data_type.clone()),
                is_error: false,
            },
        }
    }

    fn from_output(output: Option<&Output>) -> Self {
        let mut columns = Self::from_packet(output.map(|o| &o.packet));
        columns.is_error = output.is_some_and(|o| o.is_error);
        columns
    }
}

fn packet_from_row(row: &PgRow, prefix: &str, id: &str) -> RepositoryResult<Option<PayloadPacket>> {
    let kind: Option<String> = row.try_get(format!("{prefix}_kind").as_str())?;
    let data: Option<Vec<u8>> = row.try_get(format!("{prefix}_data").as_str())?;
    let storage_key: Option<String> = row.try_get(format!("{prefix}_storage_key").as_str())?;
    let data_type: Option<String> = row.try_get(format!("{prefix}_type").as_str())?;
    let data_type = data_type.unwrap_or_default();

    match kind.as_deref() {
        None => Ok(None),
        Some("inline") => Ok(Some(PayloadPacket::Inline {
            data: Bytes::from(data.unwrap_or_default()),
            data_type,
        })),
        Some("reference") => Ok(Some(PayloadPacket::Reference {
            storage_key: storage_key.ok_or_else(|| corrupt(id, "reference without storage key"))?,
            data_type,
        })),
        Some(other) => Err(corrupt(id, &format!("unknown packet kind '{other}'"))),
    }
}

fn output_from_row(row: &PgRow, id: &str) -> RepositoryResult<Option<Output>> {
    let is_error: bool = row.try_get("output_is_error")?;
    Ok(packet_from_row(row, "output", id)?.map(|packet| Output { packet, is_error }))
}

fn run_from_row(row: &PgRow) -> RepositoryResult<Run> {
    let id: String = row.try_get("id")?;
    let run_id = decode_id(&id, RunId::from_internal)?;

    let status: String = row.try_get("status")?;
    let status =
        RunStatus::parse(&status).ok_or_else(|| corrupt(&id, &format!("unknown status '{status}'")))?;

    let lease_id: Option<String> = row.try_get("lease_id")?;
    let lease_consumer_id: Option<String> = row.try_get("lease_consumer_id")?;
    let leased_at: Option<DateTime<Utc>> = row.try_get("leased_at")?;
    let lease = match (lease_id, lease_consumer_id, leased_at) {
        (Some(lease_id), Some(consumer_id), Some(leased_at)) => Some(RunLease {
            lease_id: decode_id(&lease_id, LeaseId::from_internal)?,
            consumer_id,
            leased_at,
        }),
        _ => None,
    };

    let blocking: Option<String> = row.try_get("blocking_waitpoint_id")?;
    let env_id: String = row.try_get("env_id")?;
    let sequence: i64 = row.try_get("sequence")?;

    Ok(Run {
        id: run_id,
        env_id: decode_id(&env_id, EnvId::from_internal)?,
        task_identifier: row.try_get("task_identifier")?,
        queue_name: row.try_get("queue_name")?,
        master_queue: row.try_get("master_queue")?,
        machine_preset: row.try_get("machine_preset")?,
        payload: packet_from_row(row, "payload", &id)?
            .ok_or_else(|| corrupt(&id, "run without payload"))?,
        status,
        sequence: sequence as u64,
        priority: row.try_get("priority")?,
        is_test: row.try_get("is_test")?,
        blocking_waitpoint: blocking
            .map(|raw| decode_id(&raw, WaitpointId::from_internal))
            .transpose()?,
        lease,
        output: output_from_row(row, &id)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn waitpoint_from_row(row: &PgRow) -> RepositoryResult<Waitpoint> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let env_id: String = row.try_get("env_id")?;
    let completed_by_run: Option<String> = row.try_get("completed_by_run")?;

    Ok(Waitpoint {
        id: decode_id(&id, WaitpointId::from_internal)?,
        env_id: decode_id(&env_id, EnvId::from_internal)?,
        kind: WaitpointKind::parse(&kind)
            .ok_or_else(|| corrupt(&id, &format!("unknown kind '{kind}'")))?,
        status: WaitpointStatus::parse(&status)
            .ok_or_else(|| corrupt(&id, &format!("unknown status '{status}'")))?,
        output: output_from_row(row, &id)?,
        idempotency_key: row.try_get("idempotency_key")?,
        completed_by_run: completed_by_run
            .map(|raw| decode_id(&raw, RunId::from_internal))
            .transpose()?,
        completed_after: row.try_get("completed_after")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn decode_id<T>(
    raw: &str,
    decode: impl FnOnce(&str) -> Result<T, runway_id::IdError>,
) -> RepositoryResult<T> {
    decode(raw).map_err(|e| corrupt(raw, &e.to_string()))
}

fn corrupt(id: &str, message: &str) -> RepositoryError {
    RepositoryError::Corrupt {
        id: id.to_string(),
        message: message.to_string(),
    }
}
