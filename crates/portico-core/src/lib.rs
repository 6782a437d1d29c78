//! Request-dispatch and component-lifecycle core for the Portico server.
//!
//! This crate ties together the composite container tree (engine, host,
//! context, wrapper), the per-container valve `Pipeline`, the lifecycle state
//! machine every component runs through, and the background processor that
//! drives periodic maintenance across the tree. Connection handling, class
//! loading, authentication and clustering stay outside; the core only talks to
//! them through the narrow traits in [`collaborators`].

pub mod background;
pub mod collaborators;
pub mod concurrency;
pub mod container;
pub mod lifecycle;
pub mod listeners;
pub mod mapping;
pub mod pipeline;
pub mod request;
pub mod valves;

pub use background::{BackgroundFailure, BackgroundHandle, BackgroundProcessor, BackgroundReport};
pub use collaborators::{BoxError, ClassLoaderRef, Cluster, Realm, Servlet};
pub use concurrency::{install_signal_handler, run_bounded, ShutdownSignal};
pub use container::{Container, ContainerKind, ContainerSnapshot, ObjectName};
pub use lifecycle::{
    validate_transition, Lifecycle, LifecycleEvent, LifecycleHooks, LifecycleListener,
    LifecycleState, LifecycleSupport,
};
pub use listeners::{
    ContainerEvent, ContainerListener, Listeners, PropertyChangeEvent, PropertyChangeListener,
};
pub use mapping::{MappedServlet, ServletMappings};
pub use pipeline::{Next, Pipeline, Valve};
pub use request::{CancellationToken, Exception, MappingData, Request, Response};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot {operation} {component} while it is {state}")]
    InvalidTransition {
        component: String,
        operation: &'static str,
        state: LifecycleState,
    },
    #[error("illegal state change for {component}: {from} -> {to}")]
    IllegalStateChange {
        component: String,
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("{component} is already in a {active} transition, rejecting {operation}")]
    TransitionInProgress {
        component: String,
        active: &'static str,
        operation: &'static str,
    },
    #[error("{component} failed during {operation}: {reason}")]
    Failed {
        component: String,
        operation: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("{parent} already has a child named '{child}'")]
    DuplicateChild { parent: String, child: String },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("background processing failed for {container}: {reason}")]
    Background { container: String, reason: String },
    #[error("{parent} added child '{child}' but could not start it: {source}")]
    ChildStart {
        parent: String,
        child: String,
        #[source]
        source: LifecycleError,
    },
}

/// Failure raised while a request travels through a valve chain.
///
/// Any failure aborts the rest of the chain; mapping it to a response is the
/// connector's job.
#[derive(Debug, Error)]
pub enum ValveError {
    #[error("{0}")]
    Raised(Exception),
    #[error("request cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ValveError {
    /// Raise a typed exception, e.g. `ValveError::raise(ExceptionType::new("shop.OutOfStock"), "no stock")`.
    pub fn raise(exception_type: portico_schema::ExceptionType, message: impl Into<String>) -> Self {
        Self::Raised(Exception::new(exception_type, message))
    }

    /// The declared exception type, when the failure carries one.
    pub fn exception_type(&self) -> Option<&portico_schema::ExceptionType> {
        match self {
            Self::Raised(e) => Some(e.exception_type()),
            Self::Cancelled | Self::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_schema::ExceptionType;

    #[test]
    fn duplicate_child_display() {
        let e = ContainerError::DuplicateChild {
            parent: "Host[localhost]".to_owned(),
            child: "/shop".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("localhost"));
        assert!(msg.contains("/shop"));
    }

    #[test]
    fn invalid_transition_display() {
        let e = LifecycleError::InvalidTransition {
            component: "Engine[portico]".to_owned(),
            operation: "start",
            state: LifecycleState::Destroyed,
        };
        assert_eq!(
            e.to_string(),
            "cannot start Engine[portico] while it is DESTROYED"
        );
    }

    #[test]
    fn lifecycle_error_is_transparent_in_container_error() {
        let inner = LifecycleError::TransitionInProgress {
            component: "Host[a]".to_owned(),
            active: "start",
            operation: "stop",
        };
        let msg = inner.to_string();
        let outer = ContainerError::from(inner);
        assert_eq!(outer.to_string(), msg);
    }

    #[test]
    fn raised_error_exposes_type() {
        let e = ValveError::raise(ExceptionType::new("shop.OutOfStock"), "none left");
        assert_eq!(e.exception_type().unwrap().name(), "shop.OutOfStock");
        assert!(e.to_string().contains("none left"));
        assert!(ValveError::Cancelled.exception_type().is_none());
    }
}
