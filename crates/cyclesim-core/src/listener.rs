//! Two-tier, ordered fan-out of lifecycle events.
//!
//! Listeners are registered into one of two [`ListenerTier`]s. On every
//! [`ListenerBus::notify`], all subscribed core listeners run before any
//! user listener, each tier in registration order. The fan-out is
//! fail-fast: the first listener that returns an error stops the round,
//! and the remaining listeners never see that event.
//!
//! The bus keeps [`Arc`] handles. Whoever registers a listener keeps its
//! own handle and therefore its ownership; the bus only holds the
//! registration list.
//!
//! ```text
//!   notify(event)
//!       │
//!       ├─► core[0] ─► core[1] ─► ... ─► user[0] ─► user[1] ─► ...
//!       │                  ✗ error
//!       └──────────────────┴─► Err(ListenerError), rest skipped
//! ```

use std::sync::Arc;

use tracing::{debug, trace};

use cyclesim_types::{EventKind, LifecycleEvent};

/// Which list a listener is registered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ListenerTier {
    /// Built-in listeners loaded by the simulation before `Startup`.
    Core,
    /// Listeners added by users of the controller.
    User,
}

impl core::fmt::Display for ListenerTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Core => f.write_str("core"),
            Self::User => f.write_str("user"),
        }
    }
}

/// A listener that failed while handling an event.
#[derive(Debug, thiserror::Error)]
#[error("{tier} listener '{listener}' failed on {event}: {source}")]
pub struct ListenerError {
    /// Name of the failing listener.
    pub listener: String,
    /// Tier the listener was registered in.
    pub tier: ListenerTier,
    /// The event being delivered.
    pub event: LifecycleEvent,
    /// The error returned by the listener.
    #[source]
    pub source: anyhow::Error,
}

/// Observer of controller lifecycle events.
///
/// Implementations receive `&self`; use interior mutability for state.
/// Handlers run on the controller thread and block the iteration while
/// they execute.
pub trait ControllerListener: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether this listener wants events of `kind`. Defaults to all kinds.
    fn subscribes_to(&self, kind: EventKind) -> bool {
        let _ = kind;
        true
    }

    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Any error aborts the run the same way a failing phase does.
    fn notify(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// A listener built from a closure and a fixed subscription list.
pub struct FnListener<F> {
    name: String,
    kinds: Vec<EventKind>,
    handler: F,
}

impl<F> FnListener<F>
where
    F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync,
{
    /// Create a listener named `name` for the given event kinds.
    pub fn new(name: impl Into<String>, kinds: &[EventKind], handler: F) -> Self {
        Self {
            name: name.into(),
            kinds: kinds.to_vec(),
            handler,
        }
    }
}

impl<F> core::fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnListener")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

impl<F> ControllerListener for FnListener<F>
where
    F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribes_to(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn notify(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        (self.handler)(event)
    }
}

/// Shared handle to a registered listener.
pub type ListenerHandle = Arc<dyn ControllerListener>;

/// Ordered registration lists for both tiers.
#[derive(Default)]
pub struct ListenerBus {
    core: Vec<ListenerHandle>,
    user: Vec<ListenerHandle>,
}

impl core::fmt::Debug for ListenerBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names = |list: &[ListenerHandle]| -> Vec<String> {
            list.iter().map(|l| l.name().to_owned()).collect()
        };
        f.debug_struct("ListenerBus")
            .field("core", &names(&self.core))
            .field("user", &names(&self.user))
            .finish()
    }
}

impl ListenerBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `listener` to `tier`. Registering the same handle twice makes
    /// it fire twice.
    pub fn register(&mut self, listener: ListenerHandle, tier: ListenerTier) {
        debug!(listener = listener.name(), %tier, "listener registered");
        match tier {
            ListenerTier::Core => self.core.push(listener),
            ListenerTier::User => self.user.push(listener),
        }
    }

    /// Register a core-tier listener.
    pub fn add_core_listener(&mut self, listener: ListenerHandle) {
        self.register(listener, ListenerTier::Core);
    }

    /// Register a user-tier listener.
    pub fn add_listener(&mut self, listener: ListenerHandle) {
        self.register(listener, ListenerTier::User);
    }

    /// Number of listeners registered in `tier`.
    pub fn len(&self, tier: ListenerTier) -> usize {
        match tier {
            ListenerTier::Core => self.core.len(),
            ListenerTier::User => self.user.len(),
        }
    }

    /// Whether no listener is registered in either tier.
    pub fn is_empty(&self) -> bool {
        self.core.is_empty() && self.user.is_empty()
    }

    /// Deliver `event` to every subscribed listener, core tier first.
    ///
    /// Returns the number of listeners that handled the event.
    ///
    /// # Errors
    ///
    /// Returns the first [`ListenerError`]; listeners after the failing one
    /// are not invoked.
    pub fn notify(&self, event: &LifecycleEvent) -> Result<usize, ListenerError> {
        let kind = event.kind();
        let tiers = [
            (ListenerTier::Core, &self.core),
            (ListenerTier::User, &self.user),
        ];
        let mut delivered: usize = 0;
        for (tier, list) in tiers {
            for listener in list.iter().filter(|l| l.subscribes_to(kind)) {
                trace!(listener = listener.name(), %tier, %event, "delivering event");
                listener.notify(event).map_err(|source| ListenerError {
                    listener: listener.name().to_owned(),
                    tier,
                    event: *event,
                    source,
                })?;
                delivered = delivered.saturating_add(1);
            }
        }
        Ok(delivered)
    }
}
