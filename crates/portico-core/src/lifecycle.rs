use crate::listeners::Listeners;
use crate::LifecycleError;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error};

pub const BEFORE_INIT_EVENT: &str = "before_init";
pub const AFTER_INIT_EVENT: &str = "after_init";
pub const BEFORE_START_EVENT: &str = "before_start";
pub const START_EVENT: &str = "start";
pub const AFTER_START_EVENT: &str = "after_start";
pub const BEFORE_STOP_EVENT: &str = "before_stop";
pub const STOP_EVENT: &str = "stop";
pub const AFTER_STOP_EVENT: &str = "after_stop";
pub const BEFORE_DESTROY_EVENT: &str = "before_destroy";
pub const AFTER_DESTROY_EVENT: &str = "after_destroy";
/// Fired by a container each time its background work runs.
pub const PERIODIC_EVENT: &str = "periodic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    New,
    Initializing,
    Initialized,
    StartingPrep,
    Starting,
    Started,
    StoppingPrep,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Failed,
}

impl LifecycleState {
    /// Whether a component in this state may process work.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Started | LifecycleState::StoppingPrep
        )
    }

    /// Event fired on entering this state.
    pub fn lifecycle_event(self) -> Option<&'static str> {
        match self {
            LifecycleState::New | LifecycleState::Failed => None,
            LifecycleState::Initializing => Some(BEFORE_INIT_EVENT),
            LifecycleState::Initialized => Some(AFTER_INIT_EVENT),
            LifecycleState::StartingPrep => Some(BEFORE_START_EVENT),
            LifecycleState::Starting => Some(START_EVENT),
            LifecycleState::Started => Some(AFTER_START_EVENT),
            LifecycleState::StoppingPrep => Some(BEFORE_STOP_EVENT),
            LifecycleState::Stopping => Some(STOP_EVENT),
            LifecycleState::Stopped => Some(AFTER_STOP_EVENT),
            LifecycleState::Destroying => Some(BEFORE_DESTROY_EVENT),
            LifecycleState::Destroyed => Some(AFTER_DESTROY_EVENT),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::New => "NEW",
            LifecycleState::Initializing => "INITIALIZING",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::StartingPrep => "STARTING_PREP",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Started => "STARTED",
            LifecycleState::StoppingPrep => "STOPPING_PREP",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Destroying => "DESTROYING",
            LifecycleState::Destroyed => "DESTROYED",
            LifecycleState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a single state change against the lifecycle graph.
pub fn validate_transition(
    component: &str,
    from: LifecycleState,
    to: LifecycleState,
) -> Result<(), LifecycleError> {
    use LifecycleState::{
        Destroyed, Destroying, Failed, Initialized, Initializing, New, Started, Starting,
        StartingPrep, Stopped, Stopping, StoppingPrep,
    };

    let valid = matches!(
        (from, to),
        (New, Initializing)
            | (Initializing, Initialized)
            | (Initialized | Stopped, StartingPrep)
            | (StartingPrep, Starting)
            | (Starting, Started)
            | (Started, StoppingPrep)
            | (StoppingPrep | Failed, Stopping)
            | (Stopping, Stopped)
            | (New | Initialized | Stopped | Failed, Destroying)
            | (Destroying, Destroyed)
    ) || (to == Failed && !matches!(from, Destroyed | Failed));

    if valid {
        Ok(())
    } else {
        Err(LifecycleError::IllegalStateChange {
            component: component.to_owned(),
            from,
            to,
        })
    }
}

/// Immutable record of one lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    source: String,
    event_type: String,
    data: Option<String>,
}

impl LifecycleEvent {
    pub fn new(source: &str, event_type: &str, data: Option<String>) -> Self {
        Self {
            source: source.to_owned(),
            event_type: event_type.to_owned(),
            data,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }
}

pub trait LifecycleListener: Send + Sync {
    /// Called synchronously on the transitioning thread; must not block.
    fn lifecycle_event(&self, event: &LifecycleEvent);
}

/// Component-specific work run inside each transition.
pub trait LifecycleHooks {
    fn init_internal(&self) -> Result<(), LifecycleError> {
        Ok(())
    }

    fn start_internal(&self) -> Result<(), LifecycleError>;

    fn stop_internal(&self) -> Result<(), LifecycleError>;

    fn destroy_internal(&self) -> Result<(), LifecycleError> {
        Ok(())
    }
}

/// State, listeners and transition guard owned by one component.
///
/// Transitions on one component are serialized fail-fast: while one is in
/// flight, any other `init`/`start`/`stop`/`destroy` call is rejected with
/// [`LifecycleError::TransitionInProgress`] instead of blocking.
pub struct LifecycleSupport {
    component: String,
    state: RwLock<LifecycleState>,
    listeners: Listeners<dyn LifecycleListener>,
    in_transition: Mutex<Option<&'static str>>,
}

struct TransitionGuard<'a>(&'a Mutex<Option<&'static str>>);

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().expect("lifecycle transition lock poisoned") = None;
    }
}

impl LifecycleSupport {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: RwLock::new(LifecycleState::New),
            listeners: Listeners::new(),
            in_transition: Mutex::new(None),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read().expect("lifecycle state lock poisoned")
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LifecycleListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn find_listeners(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.listeners.snapshot()
    }

    /// Deliver an event to a snapshot of the registered listeners.
    pub fn fire(&self, event_type: &str, data: Option<String>) {
        let event = LifecycleEvent::new(&self.component, event_type, data);
        for listener in self.listeners.snapshot() {
            listener.lifecycle_event(&event);
        }
    }

    pub fn init<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        let _guard = self.begin("init")?;
        self.init_locked(hooks)
    }

    pub fn start<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        let _guard = self.begin("start")?;
        self.start_locked(hooks)
    }

    pub fn stop<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        let _guard = self.begin("stop")?;
        self.stop_locked(hooks)
    }

    pub fn destroy<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        let _guard = self.begin("destroy")?;
        self.destroy_locked(hooks)
    }

    fn begin(&self, operation: &'static str) -> Result<TransitionGuard<'_>, LifecycleError> {
        let mut active = self
            .in_transition
            .lock()
            .expect("lifecycle transition lock poisoned");
        if let Some(active) = *active {
            return Err(LifecycleError::TransitionInProgress {
                component: self.component.clone(),
                active,
                operation,
            });
        }
        *active = Some(operation);
        Ok(TransitionGuard(&self.in_transition))
    }

    fn init_locked<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != LifecycleState::New {
            return Err(self.invalid("init", state));
        }
        self.set_state(LifecycleState::Initializing)?;
        hooks.init_internal().map_err(|e| self.fail("init", e))?;
        self.set_state(LifecycleState::Initialized)
    }

    fn start_locked<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        match self.state() {
            LifecycleState::StartingPrep | LifecycleState::Starting | LifecycleState::Started => {
                debug!("{} is already started", self.component);
                return Ok(());
            }
            LifecycleState::New => self.init_locked(hooks)?,
            LifecycleState::Failed => self.stop_locked(hooks)?,
            LifecycleState::Initialized | LifecycleState::Stopped => {}
            other => return Err(self.invalid("start", other)),
        }

        self.set_state(LifecycleState::StartingPrep)?;
        hooks.start_internal().map_err(|e| self.fail("start", e))?;
        self.set_state(LifecycleState::Starting)?;
        self.set_state(LifecycleState::Started)
    }

    fn stop_locked<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        let state = self.state();
        match state {
            LifecycleState::StoppingPrep | LifecycleState::Stopping | LifecycleState::Stopped => {
                debug!("{} is already stopped", self.component);
                return Ok(());
            }
            LifecycleState::New => {
                // Never started: nothing to undo, no events.
                *self.state.write().expect("lifecycle state lock poisoned") =
                    LifecycleState::Stopped;
                return Ok(());
            }
            LifecycleState::Started | LifecycleState::Failed => {}
            other => return Err(self.invalid("stop", other)),
        }

        if state == LifecycleState::Failed {
            self.fire(BEFORE_STOP_EVENT, None);
        } else {
            self.set_state(LifecycleState::StoppingPrep)?;
        }
        self.set_state(LifecycleState::Stopping)?;
        hooks.stop_internal().map_err(|e| self.fail("stop", e))?;
        self.set_state(LifecycleState::Stopped)
    }

    fn destroy_locked<H: LifecycleHooks + ?Sized>(&self, hooks: &H) -> Result<(), LifecycleError> {
        if self.state() == LifecycleState::Failed {
            if let Err(e) = self.stop_locked(hooks) {
                error!("{}: stop before destroy failed: {e}", self.component);
            }
        }

        match self.state() {
            LifecycleState::Destroying | LifecycleState::Destroyed => {
                debug!("{} is already destroyed", self.component);
                return Ok(());
            }
            LifecycleState::Stopped
            | LifecycleState::Failed
            | LifecycleState::New
            | LifecycleState::Initialized => {}
            other => return Err(self.invalid("destroy", other)),
        }

        self.set_state(LifecycleState::Destroying)?;
        hooks.destroy_internal().map_err(|e| self.fail("destroy", e))?;
        self.set_state(LifecycleState::Destroyed)
    }

    fn set_state(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.write().expect("lifecycle state lock poisoned");
            validate_transition(&self.component, *state, to)?;
            debug!("{}: {} -> {to}", self.component, *state);
            *state = to;
        }
        if let Some(event) = to.lifecycle_event() {
            self.fire(event, None);
        }
        Ok(())
    }

    fn invalid(&self, operation: &'static str, state: LifecycleState) -> LifecycleError {
        LifecycleError::InvalidTransition {
            component: self.component.clone(),
            operation,
            state,
        }
    }

    /// Force FAILED after a side effect of `operation` went wrong.
    fn fail(&self, operation: &'static str, cause: LifecycleError) -> LifecycleError {
        error!("{} failed during {operation}: {cause}", self.component);
        *self.state.write().expect("lifecycle state lock poisoned") = LifecycleState::Failed;
        let reason = match cause {
            LifecycleError::Failed {
                component, reason, ..
            } if component == self.component => reason,
            other => other.to_string(),
        };
        LifecycleError::Failed {
            component: self.component.clone(),
            operation,
            reason,
        }
    }
}

impl fmt::Debug for LifecycleSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleSupport")
            .field("component", &self.component)
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Uniform lifecycle surface for anything that owns a [`LifecycleSupport`].
pub trait Lifecycle: LifecycleHooks {
    fn lifecycle(&self) -> &LifecycleSupport;

    fn init(&self) -> Result<(), LifecycleError> {
        self.lifecycle().init(self)
    }

    fn start(&self) -> Result<(), LifecycleError> {
        self.lifecycle().start(self)
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        self.lifecycle().stop(self)
    }

    fn destroy(&self) -> Result<(), LifecycleError> {
        self.lifecycle().destroy(self)
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle().state()
    }

    fn state_name(&self) -> &'static str {
        self.lifecycle().state().as_str()
    }

    fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.lifecycle().add_listener(listener);
    }

    fn remove_lifecycle_listener(&self, listener: &Arc<dyn LifecycleListener>) -> bool {
        self.lifecycle().remove_listener(listener)
    }

    fn find_lifecycle_listeners(&self) -> Vec<Arc<dyn LifecycleListener>> {
        self.lifecycle().find_listeners()
    }
}
