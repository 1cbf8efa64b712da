//! Engine layer: the shared worker skeleton plus the two copy engines,
//! selected per run as a tagged variant.

pub mod copy_stream;
pub mod metrics;
pub mod row_batch;
pub mod worker;

use crate::domain::errors::Result;
use crate::domain::models::{Checkpoint, CompatMode, ConnectionProfile, EngineKind, PartitionDescriptor};
use crate::engine::copy_stream::CopyStreamEngine;
use crate::engine::row_batch::RowBatchEngine;
use crate::engine::worker::PartitionCtx;
use crate::pg;

/// Connections per side: one copy leg plus one control-plane statement.
const POOL_SIZE: u32 = 2;

/// The per-run copy routine. The worker drives the partition loop; the
/// variant only decides how one partition's rows move.
pub enum Engine {
    RowBatch(RowBatchEngine),
    StreamingCopy(CopyStreamEngine),
}

impl Engine {
    /// Builds the engine with its connection pools. Only the COPY engine
    /// installs bulk-load session tuning on its connections.
    pub fn build(kind: EngineKind, profile: &ConnectionProfile, compat: CompatMode) -> Result<Engine> {
        match kind {
            EngineKind::RowBatch => {
                let source = pg::build_pool(&profile.source, "source", POOL_SIZE, None)?;
                let target = pg::build_pool(&profile.target, "target", POOL_SIZE, None)?;
                Ok(Engine::RowBatch(RowBatchEngine::new(source, target)))
            }
            EngineKind::StreamingCopy => {
                let source = pg::build_pool(&profile.source, "source", POOL_SIZE, Some(compat))?;
                let target = pg::build_pool(&profile.target, "target", POOL_SIZE, Some(compat))?;
                Ok(Engine::StreamingCopy(CopyStreamEngine::new(source, target)))
            }
        }
    }

    pub fn migrate_partition(
        &self,
        ctx: &mut PartitionCtx<'_>,
        descriptor: &PartitionDescriptor,
        checkpoint: &Checkpoint,
    ) -> Result<u64> {
        match self {
            Engine::RowBatch(engine) => engine.migrate_partition(ctx, descriptor, checkpoint),
            Engine::StreamingCopy(engine) => engine.migrate_partition(ctx, descriptor, checkpoint),
        }
    }
}
