//! Bus topic and payload definitions.
//!
//! ```text
//! Milestone("config") ──┐
//! Milestone("preload") ─┼──> Barrier ──> Ready
//! Milestone("renderer")─┘
//!
//! Include(doc, node, 0) ──┐
//! Include(doc, node, 1) ──┼──> parent splice ──> Include(parent's key) / Resolved(fp)
//! Include(doc, node, 2) ──┘
//! ```

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::ResolveError;
use crate::fingerprint::Fingerprint;

// =============================================================================
// Topic
// =============================================================================

/// An event name on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A named initialization step completed.
    Milestone(Arc<str>),
    /// Terminal readiness event, published once by a barrier.
    Ready,
    /// One include directive occurrence inside one document resolved.
    Include(CorrelationKey),
    /// A file (by path fingerprint) finished resolving; joined waiters listen here.
    Resolved(Fingerprint),
    /// Reserved out-of-band diagnostic channel.
    Diagnostic,
}

impl Topic {
    pub fn milestone(name: impl Into<Arc<str>>) -> Self {
        Self::Milestone(name.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Milestone(name) => write!(f, "milestone:{name}"),
            Self::Ready => f.write_str("ready"),
            Self::Include(key) => write!(f, "include:{key}"),
            Self::Resolved(fp) => write!(f, "resolved:{fp}"),
            Self::Diagnostic => f.write_str("diagnostic"),
        }
    }
}

/// Structured correlation id for one directive occurrence.
///
/// `node` distinguishes concurrent resolutions of identical documents, and
/// `occurrence` keeps repeated identical directive text apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub document: Fingerprint,
    pub node: u64,
    pub occurrence: usize,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.document, self.node, self.occurrence)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Outcome of one resolution, shared by every waiter that receives it.
pub type Resolution = Result<Arc<str>, ResolveError>;

/// Data carried by a publication.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Signal with no data (milestones, readiness).
    Signal,
    /// Include or file completion; errors travel here too.
    Content(Resolution),
    /// Free-form diagnostic text.
    Diagnostic(String),
}

impl Payload {
    /// Take the resolution out of a content payload.
    ///
    /// Anything else on an include topic is a wiring bug and surfaces as
    /// `Panicked` rather than silently substituting empty content.
    pub fn into_resolution(self) -> Resolution {
        match self {
            Self::Content(resolution) => resolution,
            Self::Signal | Self::Diagnostic(_) => Err(ResolveError::Panicked),
        }
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Payloads handed to a handler once its whole topic set is satisfied.
#[derive(Debug, Default)]
pub struct Delivery {
    payloads: FxHashMap<Topic, Payload>,
}

impl Delivery {
    pub(super) fn new(payloads: FxHashMap<Topic, Payload>) -> Self {
        Self { payloads }
    }

    pub fn get(&self, topic: &Topic) -> Option<&Payload> {
        self.payloads.get(topic)
    }

    pub fn take(&mut self, topic: &Topic) -> Option<Payload> {
        self.payloads.remove(topic)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}
