//! LIFO stack of open spans.
//!
//! Each stack is exclusively owned by one execution context and never
//! touched from another. The stack itself is policy-free: callers decide
//! what to log and where force-popped frames go.

use super::{Span, SpanId};

/// Result of removing a span from the stack. `discarded` holds any frames
/// that sat above the removed span, top-first; a non-empty list means the
/// close was out of order and the caller should report it.
#[derive(Debug)]
pub(crate) struct PoppedSpan {
    pub span: Span,
    pub discarded: Vec<Span>,
}

/// Stack of open spans, bottom (oldest) first.
#[derive(Debug, Default)]
pub struct SpanStack {
    frames: Vec<Span>,
}

impl SpanStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn top(&self) -> Option<&Span> {
        self.frames.last()
    }

    pub fn top_id(&self) -> Option<SpanId> {
        self.frames.last().map(|s| s.id)
    }

    pub(crate) fn push(&mut self, span: Span) {
        self.frames.push(span);
    }

    pub(crate) fn take_top(&mut self) -> Option<Span> {
        self.frames.pop()
    }

    /// Remove the span with `id` wherever it sits, together with its
    /// position, so it can be handed to a callback and [`Self::reinsert`]ed
    /// afterwards without disturbing the frames below it.
    pub(crate) fn lift(&mut self, id: SpanId) -> Option<(usize, Span)> {
        let index = self.frames.iter().rposition(|s| s.id == id)?;
        Some((index, self.frames.remove(index)))
    }

    pub(crate) fn reinsert(&mut self, index: usize, span: Span) {
        let index = index.min(self.frames.len());
        self.frames.insert(index, span);
    }

    /// Pop the span with `id`. Frames above it are force-popped and
    /// returned in `discarded`, top-first. Returns `None` when `id` is not
    /// on the stack at all (already closed, or foreign).
    pub(crate) fn remove(&mut self, id: SpanId) -> Option<PoppedSpan> {
        let index = self.frames.iter().rposition(|s| s.id == id)?;
        let mut discarded = self.frames.split_off(index + 1);
        discarded.reverse();
        let span = self
            .frames
            .pop()
            .expect("frame at matched index still present");
        Some(PoppedSpan { span, discarded })
    }

    /// Empty the stack, returning the frames top-first. Teardown path.
    pub(crate) fn drain_all(&mut self) -> Vec<Span> {
        let mut frames = std::mem::take(&mut self.frames);
        frames.reverse();
        frames
    }
}
