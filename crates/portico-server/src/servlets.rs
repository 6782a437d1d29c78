//! Built-in handlers that contexts can map in configuration.

use crate::ServerError;
use portico_core::{Request, Response, Servlet, ValveError};
use portico_schema::ExceptionType;
use std::sync::Arc;

pub const ERROR_STATUS_ATTR: &str = "portico.error.status_code";
pub const ERROR_EXCEPTION_ATTR: &str = "portico.error.exception_type";
pub const ERROR_MESSAGE_ATTR: &str = "portico.error.message";
pub const ERROR_URI_ATTR: &str = "portico.error.request_uri";

/// Build the handler named by a `responses` entry.
///
/// Known kinds: `welcome`, `status`, `echo`, `error`, and
/// `fail:<type>[:<ancestor>...]`, which raises the named exception type with
/// the given ancestors, nearest first.
pub fn builtin_servlet(kind: &str) -> Result<Arc<dyn Servlet>, ServerError> {
    let servlet: Arc<dyn Servlet> = match kind {
        "welcome" => Arc::new(Welcome),
        "status" => Arc::new(Status),
        "echo" => Arc::new(Echo),
        "error" => Arc::new(ErrorReport),
        other => {
            let Some(chain) = other.strip_prefix("fail:") else {
                return Err(ServerError::UnknownHandler(other.to_owned()));
            };
            let mut names = chain.split(':').filter(|s| !s.is_empty());
            let Some(name) = names.next() else {
                return Err(ServerError::UnknownHandler(other.to_owned()));
            };
            let exception_type = names.fold(ExceptionType::new(name), ExceptionType::extends);
            Arc::new(Fail { exception_type })
        }
    };
    Ok(servlet)
}

fn context_label(request: &Request) -> String {
    request
        .mapping
        .context
        .as_ref()
        .and_then(|c| c.context_name().map(ToString::to_string))
        .unwrap_or_else(|| "/".to_owned())
}

struct Welcome;

impl Servlet for Welcome {
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        response.set_header("Content-Type", "text/plain");
        response.write_str(&format!("Welcome to {}\n", context_label(request)));
        Ok(())
    }

    fn is_async_supported(&self) -> bool {
        true
    }
}

/// JSON snapshot of the whole tree the request travelled through.
struct Status;

impl Servlet for Status {
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        let Some(root) = request.mapping.context.as_ref().and_then(|c| c.root()) else {
            response.send_error(500);
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&root.snapshot())
            .map_err(|e| ValveError::Io(std::io::Error::other(e)))?;
        response.set_header("Content-Type", "application/json");
        response.write(&json);
        Ok(())
    }
}

struct Echo;

impl Servlet for Echo {
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        response.set_header("Content-Type", "text/plain");
        let mut line = format!("{} {}", request.method(), request.path());
        if let Some(query) = request.query() {
            line.push('?');
            line.push_str(query);
        }
        line.push('\n');
        response.write_str(&line);
        Ok(())
    }

    fn is_async_supported(&self) -> bool {
        true
    }
}

/// Renders the error attributes set by the connector before re-dispatch.
struct ErrorReport;

impl Servlet for ErrorReport {
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        response.set_header("Content-Type", "text/plain");
        let status = request.attribute(ERROR_STATUS_ATTR).unwrap_or("500");
        let uri = request.attribute(ERROR_URI_ATTR).unwrap_or_default();
        let mut body = format!("error {status} for {uri}\n");
        if let Some(exception) = request.attribute(ERROR_EXCEPTION_ATTR) {
            body.push_str(exception);
            if let Some(message) = request.attribute(ERROR_MESSAGE_ATTR) {
                body.push_str(": ");
                body.push_str(message);
            }
            body.push('\n');
        }
        response.write_str(&body);
        Ok(())
    }
}

struct Fail {
    exception_type: ExceptionType,
}

impl Servlet for Fail {
    fn service(&self, request: &mut Request, _response: &mut Response) -> Result<(), ValveError> {
        Err(ValveError::raise(
            self.exception_type.clone(),
            format!("raised while serving {}", request.path()),
        ))
    }
}
