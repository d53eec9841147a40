/// shardsup — core library
///
/// Supervises long-running sharded-computation jobs: a JobManager spawns one
/// detached coordinator per job, the coordinator supervises N workers with a
/// bounded restart policy, and each worker persists its progress as atomic
/// checkpoints so crashes resume at the first uncommitted sample.
pub mod schema;
pub mod index;
pub mod logtail;
pub mod checkpoint;
pub mod shards;
pub mod model;
pub mod dataset;
pub mod worker;
pub mod coordinator;
pub mod manager;
