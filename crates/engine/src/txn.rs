use bazaar_storage::SnapshotStore;

use crate::error::Result;

/// Commit `snapshot` if `staged` succeeded, otherwise abort it and return
/// the staging error. Abort failures are logged, not surfaced: the staging
/// error is the one the caller needs.
pub(crate) async fn finish<S, T>(storage: &S, snapshot: S::Snapshot, staged: Result<T>) -> Result<T>
where
    S: SnapshotStore,
{
    match staged {
        Ok(value) => {
            storage.commit_snapshot(snapshot).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(abort) = storage.abort_snapshot(snapshot).await {
                tracing::warn!(error = %abort, "abort after failed staging also failed");
            }
            Err(e)
        }
    }
}
