use crate::error::Result;
use crate::resources::ImageImport;
use crate::store::SharedStore;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deletes ImageImports some time after their result was folded into a Tag.
pub struct ImportCollector {
    imports: SharedStore<ImageImport>,
    grace: chrono::Duration,
    interval: Duration,
}

impl ImportCollector {
    pub fn new(imports: SharedStore<ImageImport>, grace: Duration, interval: Duration) -> Self {
        Self {
            imports,
            grace: chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX),
            interval,
        }
    }

    /// Deletes every import consumed before `now - grace`. Returns how many
    /// were deleted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut deleted = 0;
        for import in self.imports.list(None, None).await? {
            let Some(consumed_at) = import.consumed_at() else {
                continue;
            };
            if consumed_at + self.grace > now {
                continue;
            }
            let namespace = import.namespace().unwrap_or_default();
            match self.imports.delete(&namespace, &import.name_any()).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            debug!(import = %import.name_any(), namespace = %namespace, "Deleted consumed import");
        }
        Ok(deleted)
    }

    /// Sweeps every interval while this replica leads, until cancelled.
    pub async fn run(self, leadership: watch::Receiver<bool>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !*leadership.borrow() {
                continue;
            }
            match self.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "Collected consumed imports"),
                Err(e) => warn!(error = %e, "Import collection failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ImageImportSpec, Tag, TagSpec};
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;

    fn import(name: &str, consumed_at: Option<DateTime<Utc>>) -> ImageImport {
        let tag = Tag::new(
            "app",
            TagSpec {
                from: "centos:7".to_string(),
                mirror: false,
                insecure: false,
                generation: 0,
            },
        );
        let mut import = ImageImport::new(name, ImageImportSpec::default());
        import.metadata.namespace = Some("team".to_string());
        import.set_owner_image(&tag);
        if let Some(at) = consumed_at {
            import.flag_consumed(at);
        }
        import
    }

    #[tokio::test]
    async fn test_sweep_respects_grace_period() {
        let now = Utc::now();
        let imports = Arc::new(MemoryStore::with([
            import("old", Some(now - chrono::Duration::minutes(6))),
            import("recent", Some(now - chrono::Duration::minutes(1))),
            import("pending", None),
        ]));
        let collector = ImportCollector::new(
            imports.clone(),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );

        assert_eq!(collector.sweep(now).await.unwrap(), 1);
        let left: Vec<String> = imports.all().iter().map(|i| i.name_any()).collect();
        assert_eq!(left, vec!["pending".to_string(), "recent".to_string()]);

        assert_eq!(collector.sweep(now + chrono::Duration::minutes(5)).await.unwrap(), 1);
        assert_eq!(imports.all().len(), 1);
    }
}
