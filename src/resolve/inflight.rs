//! In-flight load registry.
//!
//! The first request for a path claims it and performs the read; concurrent
//! requests for the same path join and receive the claimer's result through
//! [`Topic::Resolved`].
//!
//! ```text
//! claim_or_join(fp) ── vacant ──> Claimed(Claim) ── finish(r) ──> remove fp, publish Resolved(fp, r)
//!                   ├─ occupied ─> Joined(Waiter)  <──────────────────────────────┘
//!                   └─ occupied, waits on joiner ─> Cycle
//! ```
//!
//! A joiner registers its subscription while holding the registry lock, and
//! the claimer removes its entry before publishing, so a joiner can never
//! miss the completion it waits for.
//!
//! Every load records which in-flight loads its document is waiting on. A
//! request joins only if the load it wants does not transitively wait on one
//! of the request's own ancestors; otherwise the two would wait on each other
//! forever.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::bus::{Bus, Payload, Resolution, Topic, Waiter};
use crate::error::ResolveError;
use crate::fingerprint::Fingerprint;

/// One claimed load and the loads its document is waiting on.
#[derive(Default)]
struct Load {
    waits_on: FxHashSet<Fingerprint>,
}

pub(super) struct InFlight {
    loads: Mutex<FxHashMap<Fingerprint, Load>>,
    bus: Arc<Bus>,
}

pub(super) enum Slot {
    /// This caller performs the load and must finish the claim.
    Claimed(Claim),
    /// Another caller is loading; await its result.
    Joined(Waiter),
    /// The running load already waits on one of the caller's ancestors.
    Cycle,
}

impl InFlight {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            loads: Mutex::new(FxHashMap::default()),
            bus,
        }
    }

    /// Claim `fp`, or join whoever holds it.
    ///
    /// `chain` holds the caller's ancestors, nearest last. The nearest one is
    /// recorded as waiting on `fp`.
    pub fn claim_or_join(
        self: &Arc<Self>,
        fp: Fingerprint,
        path: &Path,
        chain: &[Fingerprint],
    ) -> Slot {
        let mut loads = self.loads.lock();

        let slot = if loads.contains_key(&fp) {
            if Self::reaches(&loads, fp, chain) {
                return Slot::Cycle;
            }
            Slot::Joined(self.bus.wait_all([Topic::Resolved(fp)]))
        } else {
            loads.insert(fp, Load::default());
            Slot::Claimed(Claim {
                inflight: Arc::clone(self),
                fp,
                path: path.to_path_buf(),
                done: false,
            })
        };

        if let Some(parent) = chain.last()
            && let Some(load) = loads.get_mut(parent)
        {
            load.waits_on.insert(fp);
        }
        slot
    }

    /// Whether `from` is in `chain` or waits on it through other loads.
    fn reaches(
        loads: &FxHashMap<Fingerprint, Load>,
        from: Fingerprint,
        chain: &[Fingerprint],
    ) -> bool {
        let mut seen = FxHashSet::default();
        let mut stack = vec![from];
        while let Some(fp) = stack.pop() {
            if chain.contains(&fp) {
                return true;
            }
            if let Some(load) = loads.get(&fp) {
                stack.extend(load.waits_on.iter().filter(|next| seen.insert(**next)));
            }
        }
        false
    }

    /// Number of loads currently claimed.
    pub fn len(&self) -> usize {
        self.loads.lock().len()
    }

    fn release(&self, fp: Fingerprint, resolution: Resolution) {
        {
            let mut loads = self.loads.lock();
            loads.remove(&fp);
            for load in loads.values_mut() {
                load.waits_on.remove(&fp);
            }
        }
        self.bus
            .publish(Topic::Resolved(fp), Payload::Content(resolution));
    }
}

/// Exclusive right to load one path.
///
/// Dropping an unfinished claim (aborted task, timeout) releases joiners with
/// [`ResolveError::Cancelled`].
pub(super) struct Claim {
    inflight: Arc<InFlight>,
    fp: Fingerprint,
    path: PathBuf,
    done: bool,
}

impl Claim {
    pub fn finish(mut self, resolution: Resolution) {
        self.done = true;
        self.inflight.release(self.fp, resolution);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.done {
            let path = std::mem::take(&mut self.path);
            self.inflight
                .release(self.fp, Err(ResolveError::Cancelled(path)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Bus>, Arc<InFlight>) {
        let bus = Arc::new(Bus::new());
        let inflight = Arc::new(InFlight::new(Arc::clone(&bus)));
        (bus, inflight)
    }

    #[tokio::test]
    async fn test_joiner_receives_claimer_result() {
        let (bus, inflight) = setup();
        let path = Path::new("/t/a.tpl");
        let fp = Fingerprint::of_path(path);

        let Slot::Claimed(claim) = inflight.claim_or_join(fp, path, &[]) else {
            panic!("first caller must claim");
        };
        let Slot::Joined(waiter) = inflight.claim_or_join(fp, path, &[]) else {
            panic!("second caller must join");
        };
        assert_eq!(inflight.len(), 1);

        claim.finish(Ok(Arc::from("A")));
        assert_eq!(inflight.len(), 0);

        let mut delivery = waiter.await.unwrap();
        let content = delivery
            .take(&Topic::Resolved(fp))
            .unwrap()
            .into_resolution()
            .unwrap();
        assert_eq!(&*content, "A");
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_claim_cancels_joiners() {
        let (_bus, inflight) = setup();
        let path = Path::new("/t/a.tpl");
        let fp = Fingerprint::of_path(path);

        let claim = inflight.claim_or_join(fp, path, &[]);
        let Slot::Joined(waiter) = inflight.claim_or_join(fp, path, &[]) else {
            panic!("second caller must join");
        };
        drop(claim);

        let mut delivery = waiter.await.unwrap();
        let result = delivery
            .take(&Topic::Resolved(fp))
            .unwrap()
            .into_resolution();
        assert_eq!(result, Err(ResolveError::Cancelled(path.to_path_buf())));
        assert!(matches!(inflight.claim_or_join(fp, path, &[]), Slot::Claimed(_)));
    }

    #[test]
    fn test_mutual_wait_is_a_cycle() {
        let (_bus, inflight) = setup();
        let (x_path, y_path) = (Path::new("/t/x.tpl"), Path::new("/t/y.tpl"));
        let (x, y) = (Fingerprint::of_path(x_path), Fingerprint::of_path(y_path));

        let _x = inflight.claim_or_join(x, x_path, &[]);
        let _y = inflight.claim_or_join(y, y_path, &[]);

        // x's document includes y, which is already loading
        let Slot::Joined(_waiter) = inflight.claim_or_join(y, y_path, &[x]) else {
            panic!("x must join y");
        };
        // y's document includes x, which now waits on y
        assert!(matches!(inflight.claim_or_join(x, x_path, &[y]), Slot::Cycle));
    }

    #[test]
    fn test_finished_child_clears_wait_edge() {
        let (_bus, inflight) = setup();
        let (x_path, y_path) = (Path::new("/t/x.tpl"), Path::new("/t/y.tpl"));
        let (x, y) = (Fingerprint::of_path(x_path), Fingerprint::of_path(y_path));

        let _x = inflight.claim_or_join(x, x_path, &[]);
        let Slot::Claimed(y_claim) = inflight.claim_or_join(y, y_path, &[x]) else {
            panic!("x must claim y");
        };
        y_claim.finish(Ok(Arc::from("Y")));

        let Slot::Claimed(_y_again) = inflight.claim_or_join(y, y_path, &[]) else {
            panic!("y is free again");
        };
        // y no longer counts as something x waits on
        assert!(matches!(inflight.claim_or_join(x, x_path, &[y]), Slot::Joined(_)));
    }
}
