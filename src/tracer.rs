//! In-band tracing: a span tree built along the call chain.
//!
//! A [`Tracer`] is attached to the entry request's local-value store and
//! shared with every nested request, so the spans of an in-process fan-out
//! land in one tree. Spans live in an arena; children hold their parent's
//! index and never own anything upward. When the root span finishes, the
//! completed tree is emitted.
//!
//! Span arithmetic is fixed: `latency = end - beg`, and
//! `handling = latency - waiting`, where `waiting` is stamped when the
//! dispatched task actually starts handling.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Index of a span within its tracer's arena.
pub type SpanId = usize;

/// One finished node of the emitted span tree.
#[derive(Clone, Debug, Serialize)]
pub struct Span {
    pub id: String,
    pub endpoint: String,
    #[serde(rename = "fn")]
    pub fn_name: String,
    /// Unix milliseconds at span begin.
    pub beg: u64,
    /// Unix milliseconds at span end.
    pub end: u64,
    /// Microseconds spent queued before handling began.
    pub waiting: u64,
    /// Microseconds spent inside the fn body.
    pub handling: u64,
    /// Microseconds from begin to end.
    pub latency: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Span>,
}

struct SpanNode {
    id: String,
    endpoint: String,
    fn_name: String,
    beg_unix_ms: u64,
    beg: Instant,
    end: Option<Instant>,
    waiting: Duration,
    latency: Duration,
    tags: BTreeMap<String, String>,
    parent: Option<SpanId>,
    children: Vec<SpanId>,
}

#[derive(Default)]
struct Arena {
    nodes: Vec<SpanNode>,
    active: Option<SpanId>,
}

/// The per-request span tree under construction.
pub struct Tracer {
    id: String,
    arena: Mutex<Arena>,
}

impl Tracer {
    /// Creates a tracer; `id` is the entry request's process id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            arena: Mutex::new(Arena::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opens a span.
    ///
    /// The new span roots the tree when it is empty, otherwise it is
    /// appended under the active unfinished span. When the active span has
    /// already finished, the new span becomes its sibling under the same
    /// parent.
    pub fn begin(
        &self,
        endpoint: impl Into<String>,
        fn_name: impl Into<String>,
        tags: impl IntoIterator<Item = (String, String)>,
    ) -> SpanId {
        let mut arena = self.arena.lock();
        let parent = match arena.active {
            None => None,
            Some(active) => {
                if arena.nodes[active].end.is_none() {
                    Some(active)
                } else {
                    arena.nodes[active].parent
                }
            }
        };
        let id = arena.nodes.len();
        arena.nodes.push(SpanNode {
            id: uuid::Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            fn_name: fn_name.into(),
            beg_unix_ms: unix_ms(),
            beg: Instant::now(),
            end: None,
            waiting: Duration::ZERO,
            latency: Duration::ZERO,
            tags: tags.into_iter().collect(),
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            arena.nodes[parent].children.push(id);
        }
        arena.active = Some(id);
        id
    }

    /// Stamps the end of the queued phase: `waiting = now - beg`.
    pub fn mark_begin_handling(&self, span: SpanId) {
        let mut arena = self.arena.lock();
        if let Some(node) = arena.nodes.get_mut(span) {
            if node.end.is_none() {
                node.waiting = node.beg.elapsed();
            }
        }
    }

    /// Closes a span. Returns the emitted tree when the root finished.
    pub fn end(
        &self,
        span: SpanId,
        tags: impl IntoIterator<Item = (String, String)>,
    ) -> Option<Span> {
        let mut arena = self.arena.lock();
        let parent = {
            let Some(node) = arena.nodes.get_mut(span) else {
                return None;
            };
            if node.end.is_none() {
                let now = Instant::now();
                node.end = Some(now);
                node.latency = now - node.beg;
                node.tags.extend(tags);
            }
            node.parent
        };
        if arena.active == Some(span) {
            arena.active = parent;
        }
        if parent.is_none() {
            return Some(build(&arena, span));
        }
        None
    }
}

fn build(arena: &Arena, at: SpanId) -> Span {
    let node = &arena.nodes[at];
    let latency = node.latency;
    let waiting = node.waiting.min(latency);
    Span {
        id: node.id.clone(),
        endpoint: node.endpoint.clone(),
        fn_name: node.fn_name.clone(),
        beg: node.beg_unix_ms,
        end: node.beg_unix_ms + latency.as_millis() as u64,
        waiting: waiting.as_micros() as u64,
        handling: (latency - waiting).as_micros() as u64,
        latency: latency.as_micros() as u64,
        tags: node.tags.clone(),
        children: node.children.iter().map(|&c| build(arena, c)).collect(),
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
