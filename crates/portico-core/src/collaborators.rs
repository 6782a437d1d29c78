//! Narrow traits for the collaborators a container holds but never implements:
//! authentication realms, clusters, class loaders and the servlets behind
//! wrappers.

use crate::request::{Request, Response};
use crate::ValveError;
use std::any::Any;
use std::sync::Arc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque parent class loader, passed down the tree unchanged.
pub type ClassLoaderRef = Arc<dyn Any + Send + Sync>;

pub trait Realm: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn background_process(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn background_process(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The request handler a wrapper container manages.
pub trait Servlet: Send + Sync {
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError>;

    fn init(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn destroy(&self) {}

    fn is_async_supported(&self) -> bool {
        false
    }
}

impl<F> Servlet for F
where
    F: Fn(&mut Request, &mut Response) -> Result<(), ValveError> + Send + Sync,
{
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        self(request, response)
    }
}
