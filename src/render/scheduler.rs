//! Parallel recording of draw calls on deferred contexts
//!
//! Above a draw-call threshold the item range is split into contiguous
//! partitions. Each partition records on its own pooled deferred context in
//! a scoped thread and yields one command list. Lists are replayed on the
//! immediate context in ascending partition order, so the GPU sees the same
//! sequence a single-threaded render would produce.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::backend::{CommandList, DeferredContextPool, DeviceContext};
use crate::config::RenderConfiguration;
use crate::error::{RenderError, RenderResult};
use crate::render::{RenderContext, RenderParameter};
use crate::scene::SceneNode;

/// Result of [`RenderTaskScheduler::schedule_and_run`]
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// False when the item count was below the threshold and nothing was recorded
    pub committed: bool,
    /// Command lists keyed by the first item index of their partition
    pub command_lists: Vec<(usize, CommandList)>,
    /// Items that issued draw calls
    pub rendered: usize,
}

impl ScheduleOutcome {
    fn not_committed() -> Self {
        Self::default()
    }

    /// Execute every list on the immediate context in partition order
    pub fn replay(mut self, dc: &mut dyn DeviceContext) -> RenderResult<usize> {
        self.command_lists.sort_unstable_by_key(|(start, _)| *start);
        for (start, list) in self.command_lists {
            log::trace!("Replaying partition starting at {} ({} commands)", start, list.command_count());
            dc.execute_command_list(list)?;
        }
        Ok(self.rendered)
    }
}

/// Splits draw calls across deferred contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTaskScheduler {
    minimum_draw_calls: usize,
    max_number_of_tasks: usize,
}

impl RenderTaskScheduler {
    pub fn new(minimum_draw_calls: usize, max_number_of_tasks: usize) -> Self {
        Self {
            minimum_draw_calls,
            max_number_of_tasks: max_number_of_tasks.max(1),
        }
    }

    pub fn from_config(config: &RenderConfiguration) -> Self {
        Self::new(config.minimum_draw_calls, config.max_number_of_tasks)
    }

    pub fn minimum_draw_calls(&self) -> usize {
        self.minimum_draw_calls
    }

    pub fn max_number_of_tasks(&self) -> usize {
        self.max_number_of_tasks
    }

    /// Whether `count` items are worth recording in parallel
    pub fn should_schedule(&self, count: usize) -> bool {
        count > self.minimum_draw_calls
    }

    /// Contiguous ranges covering `0..count`, at most `max_number_of_tasks` of them
    pub fn partitions(&self, count: usize) -> Vec<Range<usize>> {
        if count == 0 {
            return Vec::new();
        }
        let tasks = self.max_number_of_tasks.min(count);
        let base = count / tasks;
        let extra = count % tasks;
        let mut start = 0;
        (0..tasks)
            .map(|task| {
                let len = base + usize::from(task < extra);
                let range = start..start + len;
                start += len;
                range
            })
            .collect()
    }

    /// Record `items` in parallel when there are enough of them
    ///
    /// Returns an uncommitted outcome below the threshold; the caller then
    /// renders on the immediate context. Every partition runs to completion.
    /// If any partition fails, the first error is returned and the recorded
    /// lists are released without being executed.
    pub fn schedule_and_run(
        &self,
        items: &[&SceneNode],
        pool: &DeferredContextPool,
        ctx: &RenderContext<'_>,
        parameter: &RenderParameter,
        test_frustum: bool,
    ) -> RenderResult<ScheduleOutcome> {
        if !self.should_schedule(items.len()) {
            return Ok(ScheduleOutcome::not_committed());
        }

        let partitions = self.partitions(items.len());
        let lists: Mutex<Vec<(usize, CommandList)>> = Mutex::new(Vec::with_capacity(partitions.len()));
        let first_error: Mutex<Option<RenderError>> = Mutex::new(None);
        let rendered = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            let handles: Vec<_> = partitions
                .iter()
                .map(|range| {
                    let start = range.start;
                    let chunk = &items[range.clone()];
                    let (lists, first_error, rendered) = (&lists, &first_error, &rendered);
                    let handle = scope.spawn(move || {
                        match record_partition(chunk, pool, ctx, parameter, test_frustum) {
                            Ok((list, count)) => {
                                rendered.fetch_add(count, Ordering::Relaxed);
                                lists.lock().push((start, list));
                            }
                            Err(err) => {
                                log::error!("Render partition starting at {} failed: {}", start, err);
                                first_error.lock().get_or_insert(err);
                            }
                        }
                    });
                    (start, handle)
                })
                .collect();

            for (start, handle) in handles {
                if handle.join().is_err() {
                    log::error!("Render partition starting at {} panicked", start);
                    first_error
                        .lock()
                        .get_or_insert(RenderError::TaskPanicked(start));
                }
            }
        });

        if let Some(err) = first_error.into_inner() {
            // Recorded lists are dropped unexecuted.
            return Err(err);
        }

        let command_lists = lists.into_inner();
        log::trace!(
            "Recorded {} items in {} partitions",
            items.len(),
            command_lists.len()
        );
        Ok(ScheduleOutcome {
            committed: true,
            command_lists,
            rendered: rendered.into_inner(),
        })
    }
}

fn record_partition(
    items: &[&SceneNode],
    pool: &DeferredContextPool,
    ctx: &RenderContext<'_>,
    parameter: &RenderParameter,
    test_frustum: bool,
) -> RenderResult<(CommandList, usize)> {
    let mut dc = pool.acquire()?;
    parameter.bind(&mut *dc);
    let mut rendered = 0;
    for node in items {
        if test_frustum && !node.test_view_frustum(&ctx.frustum) {
            continue;
        }
        if node.render(ctx, &mut *dc)? {
            rendered += 1;
        }
    }
    let list = dc.finish_command_list()?;
    Ok((list, rendered))
}
