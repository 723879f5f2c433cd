//! Readiness barrier.
//!
//! Waits for a fixed, known-in-advance set of milestones and then publishes
//! the terminal [`Topic::Ready`] exactly once.
//!
//! Registration always precedes emission: [`Barrier::arm`] registers the
//! compound subscription and only then hands out the [`Milestone`] handles
//! that are the sole way to signal. A milestone can therefore never fire
//! before the barrier exists, and a stalled barrier names what it is still
//! missing instead of hanging.
//!
//! ```ignore
//! let (barrier, milestones) = Barrier::arm(&bus, ["config", "preload"]);
//! for m in milestones {
//!     tokio::spawn(async move { do_work().await; m.complete() });
//! }
//! barrier.wait(Duration::from_secs(5)).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio::sync::oneshot;

use super::{Bus, Payload, Topic, Waiter};

/// Failures while waiting on a barrier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    #[error("not ready after {after:?}, still waiting for: {}", missing.join(", "))]
    Stalled { missing: Vec<String>, after: Duration },

    #[error("bus dropped before the barrier fired")]
    Closed,
}

/// Handle for one milestone. Completing it consumes the handle.
#[derive(Debug)]
pub struct Milestone {
    bus: Arc<Bus>,
    name: Arc<str>,
}

impl Milestone {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal this milestone.
    pub fn complete(self) {
        crate::debug!("ready"; "milestone `{}` complete", self.name);
        self.bus
            .publish(Topic::Milestone(self.name), Payload::Signal);
    }
}

/// Fan-in over a fixed milestone set.
pub struct Barrier {
    bus: Arc<Bus>,
    waiter: Waiter,
    names: Vec<Arc<str>>,
}

impl Barrier {
    /// Register the barrier and return one handle per distinct milestone name.
    pub fn arm<I, S>(bus: &Arc<Bus>, names: I) -> (Self, Vec<Milestone>)
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let mut seen = FxHashSet::default();
        let names: Vec<Arc<str>> = names
            .into_iter()
            .map(Into::into)
            .filter(|name: &Arc<str>| seen.insert(name.clone()))
            .collect();

        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(bus);
        let id = bus.subscribe(
            names.iter().cloned().map(Topic::Milestone),
            move |delivery| {
                if let Some(bus) = weak.upgrade() {
                    crate::debug!("ready"; "all {} milestones complete", delivery.len());
                    bus.publish(Topic::Ready, Payload::Signal);
                }
                let _ = tx.send(delivery);
            },
        );

        let milestones = names
            .iter()
            .map(|name| Milestone {
                bus: Arc::clone(bus),
                name: name.clone(),
            })
            .collect();

        let barrier = Self {
            bus: Arc::clone(bus),
            waiter: Waiter::new(Arc::downgrade(bus), id, rx),
            names,
        };
        (barrier, milestones)
    }

    /// Milestone names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(AsRef::as_ref)
    }

    /// Wait until every milestone completed, or report what is missing.
    pub async fn wait(mut self, deadline: Duration) -> Result<(), BarrierError> {
        match tokio::time::timeout(deadline, &mut self.waiter).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(BarrierError::Closed),
            Err(_) => {
                let mut missing: Vec<String> = self
                    .bus
                    .outstanding(self.waiter.id())
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|topic| match topic {
                        Topic::Milestone(name) => Some(name.to_string()),
                        _ => None,
                    })
                    .collect();
                missing.sort();
                Err(BarrierError::Stalled {
                    missing,
                    after: deadline,
                })
            }
        }
    }
}
