//! Side effects queued on the worker pool.

use meshvault_locks::LockManager;
use meshvault_storage::DataSource;
use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::error::Result;

/// Work that callers trigger but do not wait for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BackgroundJob {
    /// Top up a group that just took a file, then issue its first transfer.
    SpreadNewFile { group: String, md5: String },
    /// Recompute placement weights.
    Reweight(Vec<String>),
    /// Queue the files a freshly joined member is missing.
    ScheduleJoined { group: String, node: String },
    /// Make lagging members re-fetch a file.
    BumpFileVersion { group: String, md5: String },
}

impl BackgroundJob {
    const fn label(&self) -> &'static str {
        match self {
            Self::SpreadNewFile { .. } => "spread_new_file",
            Self::Reweight(_) => "reweight",
            Self::ScheduleJoined { .. } => "schedule_joined",
            Self::BumpFileVersion { .. } => "bump_file_version",
        }
    }
}

impl<D, L> Coordinator<D, L>
where
    D: DataSource,
    L: LockManager,
{
    pub(crate) fn schedule(&self, job: BackgroundJob) {
        let this = self.clone();
        self.submit(job.label(), async move { this.run_job(job).await });
    }

    async fn run_job(&self, job: BackgroundJob) -> Result<()> {
        match job {
            BackgroundJob::SpreadNewFile { group, md5 } => {
                match self.expand_group(&group).await {
                    Ok(expansion) => debug!("group {} for {}: {:?}", group, md5, expansion),
                    Err(e) => warn!("expansion of {} after adding {} failed: {}", group, md5, e),
                }
                let outcome = self.gen_piece(&group, None, &md5).await?;
                debug!("gen piece {} in {}: {:?}", md5, group, outcome);
            }
            BackgroundJob::Reweight(ids) => self.reweight(&ids).await?,
            BackgroundJob::ScheduleJoined { group, node } => {
                self.schedule_for_joined_node(&group, &node).await?;
            }
            BackgroundJob::BumpFileVersion { group, md5 } => {
                self.incr_group_file_ver(&group, &md5).await?;
            }
        }

        Ok(())
    }
}
