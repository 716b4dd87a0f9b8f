//! Output stage: framebuffers, clears, blits and timer queries.

use std::sync::Arc;
use std::time::Instant;

use glam::{IVec4, UVec2, Vec4};

use super::StateBackend;
use crate::batch::ClearFlags;
use crate::native::{NativeApi, NativeHandle};
use crate::pipeline::StateCommand;
use crate::query::{Query, QueryResult};
use crate::resources::Framebuffer;

#[derive(Debug)]
struct OpenQuery {
    query: Arc<Query>,
    handle: NativeHandle,
    started: Instant,
}

/// A query whose end was issued but whose GPU result was not read yet.
#[derive(Debug)]
struct PendingQuery {
    query: Arc<Query>,
    handle: NativeHandle,
    batch_elapsed_ns: u64,
}

#[derive(Debug, Default)]
pub(crate) struct OutputStageState {
    /// Size of the bound framebuffer, `None` for the default one.
    pub size: Option<UVec2>,
    framebuffer: NativeHandle,
    open_queries: Vec<OpenQuery>,
    pending_queries: Vec<PendingQuery>,
}

impl<A: NativeApi> StateBackend<A> {
    /// In the transfer pass only the size is tracked, for jitter scaling.
    pub(super) fn do_set_framebuffer(&mut self, framebuffer: Option<&Arc<Framebuffer>>) {
        let size = framebuffer.map(|fb| fb.size());
        if self.in_transfer_pass {
            self.output.size = size;
            return;
        }

        let id = framebuffer.map(|fb| fb.id());
        if self.cache.framebuffer == id {
            return;
        }
        let handle = framebuffer.map_or(NativeHandle::NULL, |fb| {
            self.objects.sync_framebuffer(&mut self.api, fb)
        });
        self.api.bind_framebuffer(handle);
        self.cache.framebuffer = id;
        self.output.framebuffer = handle;
        self.output.size = size;
        self.stats.framebuffers_bound += 1;
    }

    pub(super) fn do_clear_framebuffer(
        &mut self,
        flags: ClearFlags,
        color: Vec4,
        depth: f32,
        stencil: i32,
        enable_scissor: bool,
    ) {
        if flags.is_empty() {
            return;
        }
        // The scissor test must match the request for the clear only.
        let toggle_scissor = enable_scissor != self.pipeline.scissor_enable;
        if toggle_scissor {
            self.api.apply_state(&StateCommand::ScissorEnable(enable_scissor));
        }
        self.api.clear(flags, color, depth, stencil);
        if toggle_scissor {
            self.api
                .apply_state(&StateCommand::ScissorEnable(self.pipeline.scissor_enable));
        }
    }

    /// Copies `source_rect` of `source` into the bound framebuffer.
    pub(super) fn do_blit(&mut self, source: &Arc<Framebuffer>, source_rect: IVec4, destination_rect: IVec4) {
        let source = self.objects.sync_framebuffer(&mut self.api, source);
        self.api
            .blit(source, source_rect, self.output.framebuffer, destination_rect);
    }

    pub(super) fn do_begin_query(&mut self, query: &Arc<Query>) {
        let handle = self.objects.sync_query(&mut self.api, query);
        self.api.begin_timer_query(handle);
        self.output.open_queries.push(OpenQuery {
            query: query.clone(),
            handle,
            started: Instant::now(),
        });
    }

    pub(super) fn do_end_query(&mut self, query: &Arc<Query>) {
        let Some(position) = self
            .output
            .open_queries
            .iter()
            .rposition(|open| open.query.id() == query.id())
        else {
            log::debug!("end_query '{}' without a matching begin", query.name());
            return;
        };
        let open = self.output.open_queries.remove(position);
        self.api.end_timer_query(open.handle);
        self.output.pending_queries.push(PendingQuery {
            query: open.query,
            handle: open.handle,
            batch_elapsed_ns: open.started.elapsed().as_nanos() as u64,
        });
    }

    /// Stores the results of ended queries the GPU has finished.
    pub(super) fn poll_queries(&mut self) {
        let api = &mut self.api;
        self.output.pending_queries.retain(|pending| match api.query_result(pending.handle) {
            Some(gpu_elapsed_ns) => {
                pending.query.set_result(QueryResult {
                    gpu_elapsed_ns,
                    batch_elapsed_ns: pending.batch_elapsed_ns,
                });
                false
            }
            None => true,
        });
    }

    /// Reports and forgets queries left open at the end of a frame.
    pub(super) fn check_open_queries(&mut self) {
        if self.output.open_queries.is_empty() {
            return;
        }
        for open in &self.output.open_queries {
            log::warn!("Query '{}' was begun but never ended", open.query.name());
        }
        self.output.open_queries.clear();
    }

    pub(super) fn reset_output_stage(&mut self) {
        if self.cache.framebuffer.is_some() {
            self.api.bind_framebuffer(NativeHandle::NULL);
        }
        self.cache.framebuffer = None;
        self.output.framebuffer = NativeHandle::NULL;
        self.output.size = None;
    }
}
