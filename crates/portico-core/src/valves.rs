//! Terminal valves installed by each container kind.
//!
//! Each one records what it mapped on the request and hands the request to
//! the pipeline of the selected child. Mapping failures end the chain with
//! an error status rather than an `Err`, so the connector can still apply an
//! error page.

use crate::container::Container;
use crate::lifecycle::Lifecycle;
use crate::pipeline::{Next, Valve};
use crate::request::{Request, Response};
use crate::ValveError;
use std::sync::{Arc, Weak};
use tracing::debug;

const PROTECTED_DIRS: [&str; 2] = ["/web-inf", "/meta-inf"];

fn owner(container: &Weak<Container>, response: &mut Response) -> Option<Arc<Container>> {
    let owner = container.upgrade();
    if owner.is_none() {
        response.send_error(503);
    }
    owner
}

fn check_cancelled(request: &Request) -> Result<(), ValveError> {
    if request.is_cancelled() {
        return Err(ValveError::Cancelled);
    }
    Ok(())
}

/// Selects the host by request host name.
pub struct EngineValve {
    engine: Weak<Container>,
}

impl EngineValve {
    pub fn new(engine: Weak<Container>) -> Self {
        Self { engine }
    }
}

impl Valve for EngineValve {
    fn name(&self) -> &str {
        "EngineValve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: Next<'_>,
    ) -> Result<(), ValveError> {
        check_cancelled(request)?;
        let Some(engine) = owner(&self.engine, response) else {
            return Ok(());
        };
        let Some(host) = engine.map_host(request.host()) else {
            debug!("no host matches '{}' and no default host", request.host());
            response.send_error(400);
            return Ok(());
        };
        if !host.state().is_available() {
            response.send_error(503);
            return Ok(());
        }
        request.mapping.host = Some(host.clone());
        host.invoke(request, response)
    }

    fn is_async_supported(&self) -> bool {
        true
    }
}

/// Selects the context by longest context path.
pub struct HostValve {
    host: Weak<Container>,
}

impl HostValve {
    pub fn new(host: Weak<Container>) -> Self {
        Self { host }
    }
}

impl Valve for HostValve {
    fn name(&self) -> &str {
        "HostValve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: Next<'_>,
    ) -> Result<(), ValveError> {
        check_cancelled(request)?;
        let Some(host) = owner(&self.host, response) else {
            return Ok(());
        };
        let Some(context) = host.map_context(request.path()) else {
            response.send_error(404);
            return Ok(());
        };
        request.mapping.context_path = context
            .context_name()
            .map(|n| n.path().to_owned())
            .unwrap_or_default();
        request.mapping.context = Some(context.clone());
        if !context.state().is_available() {
            response.send_error(503);
            return Ok(());
        }
        context.invoke(request, response)
    }

    fn is_async_supported(&self) -> bool {
        true
    }
}

/// Guards private directories and selects the wrapper by servlet mapping.
pub struct ContextValve {
    context: Weak<Container>,
}

impl ContextValve {
    pub fn new(context: Weak<Container>) -> Self {
        Self { context }
    }
}

fn is_protected(relative: &str) -> bool {
    let lower = relative.to_ascii_lowercase();
    PROTECTED_DIRS.iter().any(|dir| {
        lower
            .strip_prefix(dir)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

impl Valve for ContextValve {
    fn name(&self) -> &str {
        "ContextValve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: Next<'_>,
    ) -> Result<(), ValveError> {
        check_cancelled(request)?;
        let Some(context) = owner(&self.context, response) else {
            return Ok(());
        };

        let context_path = request.mapping.context_path.len();
        let relative = match request.path().get(context_path..) {
            None | Some("") => "/".to_owned(),
            Some(rest) => rest.to_owned(),
        };
        if is_protected(&relative) {
            response.send_error(404);
            return Ok(());
        }

        let Some((wrapper, mapped)) = context.map_wrapper(&relative) else {
            response.send_error(404);
            return Ok(());
        };
        request.mapping.servlet_path = mapped.servlet_path;
        request.mapping.path_info = mapped.path_info;
        request.mapping.wrapper = Some(wrapper.clone());

        if let (Some(locale), Some(mapper)) = (request.locale(), context.charset_mapper()) {
            if let Some(charset) = mapper.charset(locale) {
                response.set_charset(charset);
            }
        }
        wrapper.invoke(request, response)
    }

    fn is_async_supported(&self) -> bool {
        true
    }
}

/// Hands the request to the wrapper's servlet.
pub struct WrapperValve {
    wrapper: Weak<Container>,
}

impl WrapperValve {
    pub fn new(wrapper: Weak<Container>) -> Self {
        Self { wrapper }
    }
}

impl Valve for WrapperValve {
    fn name(&self) -> &str {
        "WrapperValve"
    }

    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        _next: Next<'_>,
    ) -> Result<(), ValveError> {
        check_cancelled(request)?;
        let Some(wrapper) = owner(&self.wrapper, response) else {
            return Ok(());
        };
        let servlet = match wrapper.servlet() {
            Some(servlet)
                if wrapper.state().is_available()
                    && wrapper.is_servlet_available()
                    && wrapper.load_servlet() =>
            {
                servlet
            }
            _ => {
                response.send_error(503);
                return Ok(());
            }
        };
        servlet.service(request, response)
    }

    fn is_async_supported(&self) -> bool {
        self.wrapper
            .upgrade()
            .and_then(|wrapper| wrapper.servlet())
            .is_some_and(|servlet| servlet.is_async_supported())
    }
}
