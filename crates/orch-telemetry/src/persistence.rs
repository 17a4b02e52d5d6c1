//! Postgres persistence for the three event tables. Connection errors close
//! and drop the pool; the next event re-opens it. A missing `database_url`
//! means persistence is simply skipped — only the webhook (if any) fires.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::events::Event;

pub struct EventStore {
    run_id: String,
    database_url: String,
    pool: Option<Pool<Postgres>>,
}

impl EventStore {
    pub fn new(database_url: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            database_url: database_url.into(),
            pool: None,
        }
    }

    async fn pool(&mut self) -> Result<&Pool<Postgres>, sqlx::Error> {
        if self.pool.is_none() {
            let pool = PgPoolOptions::new().max_connections(1).connect(&self.database_url).await?;
            self.pool = Some(pool);
        }
        Ok(self.pool.as_ref().expect("just set"))
    }

    /// Persist one event. On error the pool is dropped so the next call
    /// reconnects, matching the original's close-and-reopen behavior.
    pub async fn persist(&mut self, event: &Event) {
        let result = self.try_persist(event).await;
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to persist telemetry event; dropping and reconnecting");
            self.pool = None;
        }
    }

    async fn try_persist(&mut self, event: &Event) -> Result<(), sqlx::Error> {
        let run_id = self.run_id.clone();
        let pool = self.pool().await?;
        match event {
            Event::RunStageProgress(e) => {
                sqlx::query(
                    "INSERT INTO rp_run_stage_progress_events \
                     (run_id, stage, iteration, max_iterations, progress, total_nodes, buggy_nodes, \
                      good_nodes, best_metric, eta_s, latest_iteration_time_s) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                )
                .bind(run_id)
                .bind(&e.stage)
                .bind(e.iteration as i32)
                .bind(e.max_iterations as i32)
                .bind(e.progress)
                .bind(e.total_nodes as i32)
                .bind(e.buggy_nodes as i32)
                .bind(e.good_nodes as i32)
                .bind(&e.best_metric)
                .bind(e.eta_s)
                .bind(e.latest_iteration_time_s)
                .execute(pool)
                .await?;
            }
            Event::RunLog(e) => {
                sqlx::query("INSERT INTO rp_run_log_events (run_id, message, level) VALUES ($1, $2, $3)")
                    .bind(run_id)
                    .bind(&e.message)
                    .bind(&e.level)
                    .execute(pool)
                    .await?;
            }
            Event::ExperimentNodeCompleted(e) => {
                sqlx::query(
                    "INSERT INTO rp_experiment_node_completed_events (run_id, stage, node_id, summary) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(run_id)
                .bind(&e.stage)
                .bind(&e.node_id)
                .bind(&e.summary)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }
}
