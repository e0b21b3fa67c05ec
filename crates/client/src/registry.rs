//! Subscription registry and id generation.
//!
//! The registry maps subscription ids to routes. It lives inside the connection's
//! core state and is only touched under the connection lock; pending queues have
//! their own locks so deliveries never wait on it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{subscription::SubscriptionInner, transport::Frame};

/// Monotonic id source owned by one connection.
///
/// Ids start at 1 and are never reused, so a late message for a removed
/// subscription can never reach a newer one.
#[derive(Debug)]
pub(crate) struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub(crate) fn new() -> Self {
        IdGenerator {
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    routes: HashMap<u64, Arc<SubscriptionInner>>,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(&mut self, route: Arc<SubscriptionInner>) {
        self.routes.insert(route.sid, route);
    }

    pub(crate) fn get(&self, sid: u64) -> Option<Arc<SubscriptionInner>> {
        self.routes.get(&sid).cloned()
    }

    pub(crate) fn remove(&mut self, sid: u64) -> Option<Arc<SubscriptionInner>> {
        self.routes.remove(&sid)
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }

    /// Frames that re-register every resendable route, in subscription order.
    pub(crate) fn resend_frames(&self) -> Vec<Frame> {
        let mut routes: Vec<&Arc<SubscriptionInner>> = self
            .routes
            .values()
            .filter(|route| route.resend && route.delivery.is_valid())
            .collect();
        routes.sort_by_key(|route| route.sid);

        routes
            .into_iter()
            .flat_map(|route| route.resend_frames())
            .collect()
    }

    /// Empties the registry, returning every route.
    pub(crate) fn drain(&mut self) -> Vec<Arc<SubscriptionInner>> {
        self.routes.drain().map(|(_, route)| route).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Delivery;

    fn route(sid: u64, resend: bool) -> Arc<SubscriptionInner> {
        Arc::new(SubscriptionInner {
            sid,
            subject: format!("s.{sid}"),
            queue_group: None,
            consumer: None,
            resend,
            manager: None,
            delivery: Arc::new(Delivery::new(sid, 10, 1024, None)),
        })
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_resend_skips_unmanaged_routes_and_orders_by_sid() {
        let mut registry = SubscriptionRegistry::default();
        registry.insert(route(3, true));
        registry.insert(route(1, true));
        registry.insert(route(2, false));

        let sids: Vec<u64> = registry
            .resend_frames()
            .into_iter()
            .map(|frame| match frame {
                Frame::Sub { sid, .. } => sid,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(sids, vec![1, 3]);
    }

    #[test]
    fn test_resend_carries_remaining_auto_unsubscribe() {
        let mut registry = SubscriptionRegistry::default();
        let r = route(1, true);
        r.delivery.set_max_delivered(5);
        registry.insert(r);

        let frames = registry.resend_frames();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Frame::Unsub { sid: 1, max: Some(5) }));
    }

    #[test]
    fn test_drain_empties() {
        let mut registry = SubscriptionRegistry::default();
        registry.insert(route(1, true));
        registry.insert(route(2, true));
        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.get(1).is_none());
    }
}
