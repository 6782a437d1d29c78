use serde::Serialize;
use std::sync::{Arc, RwLock};

pub const ADD_CHILD_EVENT: &str = "addChild";
pub const REMOVE_CHILD_EVENT: &str = "removeChild";
pub const ADD_VALVE_EVENT: &str = "addValve";
pub const REMOVE_VALVE_EVENT: &str = "removeValve";

/// Registry of shared listeners; iteration works on a snapshot so listeners
/// may register or unregister from inside a callback.
pub struct Listeners<L: ?Sized> {
    entries: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same `Arc` twice is a no-op.
    pub fn add(&self, listener: Arc<L>) {
        let mut entries = self.entries.write().expect("listener lock poisoned");
        if !entries.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entries.push(listener);
        }
    }

    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.entries.write().expect("listener lock poisoned");
        let before = entries.len();
        entries.retain(|l| !Arc::ptr_eq(l, listener));
        entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.read().expect("listener lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("listener lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerEvent {
    pub source: String,
    pub event_type: String,
    pub data: Option<String>,
}

impl ContainerEvent {
    pub fn new(source: &str, event_type: &str, data: Option<String>) -> Self {
        Self {
            source: source.to_owned(),
            event_type: event_type.to_owned(),
            data,
        }
    }
}

pub trait ContainerListener: Send + Sync {
    fn container_event(&self, event: &ContainerEvent);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyChangeEvent {
    pub source: String,
    pub property: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

pub trait PropertyChangeListener: Send + Sync {
    fn property_change(&self, event: &PropertyChangeEvent);
}

/// Fan a container event out to every registered listener.
pub(crate) fn fire_container_event(
    listeners: &Listeners<dyn ContainerListener>,
    source: &str,
    event_type: &str,
    data: Option<String>,
) {
    if listeners.is_empty() {
        return;
    }
    let event = ContainerEvent::new(source, event_type, data);
    for listener in listeners.snapshot() {
        listener.container_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ContainerEvent>>);

    impl ContainerListener for Collect {
        fn container_event(&self, event: &ContainerEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let registry: Listeners<dyn ContainerListener> = Listeners::new();
        let listener: Arc<dyn ContainerListener> = Arc::new(Collect::default());
        registry.add(listener.clone());
        registry.add(listener.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&listener));
        assert!(!registry.remove(&listener));
        assert!(registry.is_empty());
    }

    #[test]
    fn fire_reaches_each_listener_once() {
        let registry: Listeners<dyn ContainerListener> = Listeners::new();
        let collect = Arc::new(Collect::default());
        registry.add(collect.clone());
        fire_container_event(&registry, "Host[a]", ADD_CHILD_EVENT, Some("/x".to_owned()));

        let events = collect.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "addChild");
        assert_eq!(events[0].data.as_deref(), Some("/x"));
    }

    struct SelfRemoving {
        registry: Arc<Listeners<dyn ContainerListener>>,
        me: Mutex<Option<Arc<dyn ContainerListener>>>,
    }

    impl ContainerListener for SelfRemoving {
        fn container_event(&self, _event: &ContainerEvent) {
            if let Some(me) = self.me.lock().unwrap().take() {
                self.registry.remove(&me);
            }
        }
    }

    #[test]
    fn listener_may_unregister_during_fire() {
        let registry: Arc<Listeners<dyn ContainerListener>> = Arc::new(Listeners::new());
        let listener = Arc::new(SelfRemoving {
            registry: registry.clone(),
            me: Mutex::new(None),
        });
        let as_dyn: Arc<dyn ContainerListener> = listener.clone();
        *listener.me.lock().unwrap() = Some(as_dyn.clone());
        registry.add(as_dyn);

        fire_container_event(&registry, "Engine[e]", "custom", None);
        assert!(registry.is_empty());
    }
}
