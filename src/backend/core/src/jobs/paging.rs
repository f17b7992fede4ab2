//! Paged sweep with bounded fan-out.
//!
//! A sweep walks `total` items a page at a time. Every item of a page gets
//! its own subtask in a [`JoinSet`]; the page is drained before the next one
//! is fetched, so at most `page_size` subtasks are ever in flight and a huge
//! inventory never turns into an unbounded number of concurrent calls.

use serde::Serialize;
use std::future::Future;
use tokio::task::JoinSet;

use super::job::JobError;
use crate::inventory::Page;
use crate::telemetry::JobMetrics;

/// Outcome counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pages: usize,
    pub items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
}

/// A paged walk over a collaborator's inventory.
#[derive(Debug, Clone, Copy)]
pub struct PagedSweep {
    label: &'static str,
    page_size: usize,
}

impl PagedSweep {
    /// `page_size` is clamped to at least 1.
    pub fn new(label: &'static str, page_size: usize) -> Self {
        Self {
            label,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages needed to cover `total` items.
    pub fn page_count(&self, total: usize) -> usize {
        total.div_ceil(self.page_size)
    }

    /// Walk `total` items.
    ///
    /// `fetch` loads one page; its failure aborts the sweep. `work` turns one
    /// item into a subtask whose error or panic is logged and counted only.
    pub async fn run<T, F, FFut, W, WFut>(
        &self,
        total: usize,
        mut fetch: F,
        work: W,
    ) -> Result<SweepReport, JobError>
    where
        T: Send + 'static,
        F: FnMut(Page) -> FFut,
        FFut: Future<Output = Result<Vec<T>, JobError>>,
        W: Fn(T) -> WFut,
        WFut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let mut report = SweepReport::default();
        let pages = self.page_count(total);

        for index in 0..pages {
            let page = Page {
                index,
                offset: index * self.page_size,
                limit: self.page_size,
            };

            let items = fetch(page).await.map_err(|e| {
                tracing::error!(sweep = self.label, page = index, error = %e, "Page fetch failed");
                e
            })?;
            report.pages += 1;

            if items.len() > self.page_size {
                tracing::warn!(
                    sweep = self.label,
                    page = index,
                    returned = items.len(),
                    limit = self.page_size,
                    "Oversized page truncated"
                );
            }

            let mut subtasks = JoinSet::new();
            for item in items.into_iter().take(self.page_size) {
                report.items += 1;
                subtasks.spawn(work(item));
            }

            while let Some(joined) = subtasks.join_next().await {
                match joined {
                    Ok(Ok(())) => report.succeeded += 1,
                    Ok(Err(e)) => {
                        report.failed += 1;
                        tracing::warn!(sweep = self.label, page = index, error = %e, "Sweep item failed");
                    }
                    Err(e) if e.is_panic() => {
                        report.panicked += 1;
                        tracing::error!(sweep = self.label, page = index, "Sweep item panicked");
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(sweep = self.label, page = index, error = %e, "Sweep item cancelled");
                    }
                }
            }

            tracing::debug!(sweep = self.label, page = index, pages, "Page done");
        }

        JobMetrics::sweep_items(
            self.label,
            report.succeeded as u64,
            (report.failed + report.panicked) as u64,
        );
        Ok(report)
    }
}
