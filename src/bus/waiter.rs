//! Future adapter over a one-shot compound subscription.

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{Bus, Delivery, SubscriptionId};

/// Resolves with the subscription's [`Delivery`] once every awaited topic
/// has been published, or `None` if the bus went away first.
///
/// Dropping an unfinished waiter removes its subscription, so abandoned
/// resolutions (timeouts, aborted tasks) do not leak table entries.
pub struct Waiter {
    bus: Weak<Bus>,
    id: SubscriptionId,
    rx: oneshot::Receiver<Delivery>,
    done: bool,
}

impl Waiter {
    pub(super) fn new(bus: Weak<Bus>, id: SubscriptionId, rx: oneshot::Receiver<Delivery>) -> Self {
        Self {
            bus,
            id,
            rx,
            done: false,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Future for Waiter {
    type Output = Option<Delivery>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        Pin::new(&mut this.rx).poll(cx).map(|result| {
            this.done = true;
            result.ok()
        })
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if !self.done
            && let Some(bus) = self.bus.upgrade()
        {
            bus.unsubscribe(self.id);
        }
    }
}
