//! Render Task Graph
//!
//! A [`Task`] is a fixed list of named [`Job`]s run in the order they were
//! added. Jobs exchange data through [`Varying`] slots: a job producing a
//! value holds a clone of the slot and writes it during `run`, jobs
//! consuming the value receive another clone when they are constructed.
//!
//! Because a consumer needs its input slot before it can be added, a job can
//! only depend on jobs added before it, and build order is a topological
//! order of the data flow by construction.
//!
//! ```rust,ignore
//! let mut builder = TaskBuilder::new("Example");
//! let framebuffer = Varying::new();
//! builder.add_job("Prepare", PrepareFramebuffer::new(framebuffer.clone()));
//! builder.add_job("Draw", DrawItems::new(framebuffer));
//! let mut task = builder.build();
//! task.run(&mut render_context);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::args::RenderContext;

/// A typed, shared slot connecting the output of one job to the inputs of
/// later jobs.
///
/// Slots are single-threaded; the whole task runs on the recording thread.
pub struct Varying<T>(Rc<RefCell<Option<T>>>);

impl<T> Clone for Varying<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T> Default for Varying<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Varying<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Varying").field(&self.0.borrow()).finish()
    }
}

impl<T> Varying<T> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    /// Creates a slot already holding `value`.
    #[must_use]
    pub fn with_value(value: T) -> Self {
        Self(Rc::new(RefCell::new(Some(value))))
    }

    /// Replaces the value held by the slot.
    pub fn set(&self, value: T) {
        *self.0.borrow_mut() = Some(value);
    }

    /// Removes and returns the value.
    pub fn take(&self) -> Option<T> {
        self.0.borrow_mut().take()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().take();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// Calls `f` with a reference to the value, if any.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.0.borrow().as_ref().map(f)
    }

    /// Calls `f` with a mutable reference to the value, if any.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.0.borrow_mut().as_mut().map(f)
    }
}

impl<T: Clone> Varying<T> {
    /// Returns a clone of the value.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.0.borrow().clone()
    }
}

/// One render pass or computation of a [`Task`].
///
/// Inputs and outputs are [`Varying`]s handed to the job when it is
/// constructed. A job records its GPU work into batches of the context held
/// by the [`RenderContext`].
pub trait Job {
    fn run(&mut self, ctx: &mut RenderContext);
}

impl<F> Job for F
where
    F: FnMut(&mut RenderContext),
{
    fn run(&mut self, ctx: &mut RenderContext) {
        self(ctx);
    }
}

struct JobEntry {
    name: String,
    enabled: bool,
    job: Box<dyn Job>,
}

/// Collects jobs in execution order.
pub struct TaskBuilder {
    name: String,
    jobs: Vec<JobEntry>,
    index: FxHashMap<String, usize>,
}

impl TaskBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            jobs: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Appends a job. Jobs run in the order they were added.
    pub fn add_job(&mut self, name: &str, job: impl Job + 'static) -> &mut Self {
        // Lookups by name resolve to the first job added under it.
        if self.index.contains_key(name) {
            log::warn!("TaskBuilder '{}': duplicate job name '{name}'", self.name);
        } else {
            self.index.insert(name.to_string(), self.jobs.len());
        }
        self.jobs.push(JobEntry {
            name: name.to_string(),
            enabled: true,
            job: Box::new(job),
        });
        self
    }

    /// Appends a job that starts disabled.
    pub fn add_disabled_job(&mut self, name: &str, job: impl Job + 'static) -> &mut Self {
        self.add_job(name, job);
        if let Some(entry) = self.jobs.last_mut() {
            entry.enabled = false;
        }
        self
    }

    #[inline]
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn build(self) -> Task {
        log::debug!("Task '{}' built with {} jobs", self.name, self.jobs.len());
        Task {
            name: self.name,
            jobs: self.jobs,
            index: self.index,
        }
    }
}

/// A built task. The job list is fixed for the lifetime of the task.
pub struct Task {
    name: String,
    jobs: Vec<JobEntry>,
    index: FxHashMap<String, usize>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("jobs", &self.job_names().collect::<Vec<_>>())
            .finish()
    }
}

impl Task {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs every enabled job once, in build order.
    pub fn run(&mut self, ctx: &mut RenderContext) {
        for entry in &mut self.jobs {
            if !entry.enabled {
                continue;
            }
            log::trace!("{}::{}", self.name, entry.name);
            entry.job.run(ctx);
        }
    }

    /// Enables or disables the job called `name`. Returns `false` when no
    /// job has that name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.index.get(name).map(|&i| &mut self.jobs[i]) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => {
                log::debug!("Task '{}': no job named '{name}'", self.name);
                false
            }
        }
    }

    #[must_use]
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.index.get(name).map(|&i| self.jobs[i].enabled)
    }

    /// Job names in execution order.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|entry| entry.name.as_str())
    }

    #[inline]
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::RenderArgs;
    use ember_gpu::native::{RecordingApi, ScriptedCompiler};
    use ember_gpu::{BackendSettings, Context, StateBackend};
    use std::sync::Arc;

    fn render_context() -> RenderContext {
        let backend = StateBackend::new(RecordingApi::new(), ScriptedCompiler::new(), BackendSettings::default());
        RenderContext::new(Arc::new(Context::new(backend)), RenderArgs::default())
    }

    #[test]
    fn varying_is_shared_between_clones() {
        let output = Varying::new();
        let input = output.clone();
        assert!(!input.is_set());
        output.set(7u32);
        assert_eq!(input.get(), Some(7));
        assert_eq!(input.take(), Some(7));
        assert!(!output.is_set());
    }

    #[test]
    fn jobs_run_in_build_order() {
        let trace = Varying::with_value(Vec::new());
        let mut builder = TaskBuilder::new("Order");
        for name in ["a", "b", "c"] {
            let trace = trace.clone();
            builder.add_job(name, move |_: &mut RenderContext| {
                trace.with_mut(|t: &mut Vec<&str>| t.push(name));
            });
        }
        let mut task = builder.build();
        task.run(&mut render_context());
        assert_eq!(trace.get(), Some(vec!["a", "b", "c"]));
        assert_eq!(task.job_names().collect::<Vec<_>>(), ["a", "b", "c"]);
    }

    #[test]
    fn disabled_jobs_are_skipped() {
        let count = Varying::with_value(0u32);
        let mut builder = TaskBuilder::new("Toggle");
        let counter = count.clone();
        builder.add_job("count", move |_: &mut RenderContext| {
            counter.with_mut(|c| *c += 1);
        });
        let mut task = builder.build();
        let mut ctx = render_context();

        assert!(task.set_enabled("count", false));
        task.run(&mut ctx);
        assert_eq!(count.get(), Some(0));

        assert!(task.set_enabled("count", true));
        task.run(&mut ctx);
        assert_eq!(count.get(), Some(1));
        assert!(!task.set_enabled("missing", true));
        assert_eq!(task.is_enabled("missing"), None);
    }
}
