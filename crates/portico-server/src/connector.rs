//! Adapts `tiny_http` requests to the container core and maps failures that
//! escape the valve chain onto error pages.

use crate::servlets::{ERROR_EXCEPTION_ATTR, ERROR_MESSAGE_ATTR, ERROR_STATUS_ATTR, ERROR_URI_ATTR};
use portico_core::{Container, Exception, Request, Response, ValveError};
use portico_schema::ErrorPage;
use std::io::Read;
use std::sync::Arc;
use tiny_http::{Header, StatusCode};
use tracing::{debug, error, warn};

/// Run a request through the engine and turn the outcome into a response,
/// applying at most one error page.
pub fn dispatch(engine: &Container, request: &mut Request) -> Response {
    let mut response = Response::new();
    match engine.invoke(request, &mut response) {
        Ok(()) => {
            if response.is_error() && response.body().is_empty() && response.status() >= 400 {
                let status = response.status();
                let page = request
                    .mapping
                    .context
                    .as_ref()
                    .and_then(|ctx| ctx.error_pages())
                    .and_then(|pages| pages.find_status_or_default(status));
                if let Some(page) = page {
                    if let Some(rendered) = render_error_page(request, &page, status, None) {
                        return rendered;
                    }
                }
                write_plain_error(&mut response, status);
            }
            response
        }
        Err(ValveError::Raised(exception)) => {
            warn!("{} {} raised {exception}", request.method(), request.path());
            let page = request
                .mapping
                .context
                .as_ref()
                .and_then(|ctx| ctx.error_pages())
                .and_then(|pages| pages.find_exception(exception.exception_type()));
            if let Some(page) = page {
                if let Some(rendered) = render_error_page(request, &page, 500, Some(&exception)) {
                    return rendered;
                }
            }
            let mut response = Response::new();
            response.send_error(500);
            write_plain_error(&mut response, 500);
            response
        }
        Err(ValveError::Cancelled) => {
            debug!("{} {} cancelled", request.method(), request.path());
            let mut response = Response::new();
            response.send_error(503);
            write_plain_error(&mut response, 503);
            response
        }
        Err(ValveError::Io(e)) => {
            error!("{} {} failed: {e}", request.method(), request.path());
            let mut response = Response::new();
            response.send_error(500);
            write_plain_error(&mut response, 500);
            response
        }
    }
}

/// Forward once into the mapped context at the page location. `None` when
/// the page itself could not be produced.
fn render_error_page(
    request: &mut Request,
    page: &ErrorPage,
    status: u16,
    exception: Option<&Exception>,
) -> Option<Response> {
    let context: Arc<Container> = request.mapping.context.clone()?;
    let host = request.mapping.host.clone();
    let context_path = request.mapping.context_path.clone();
    let original_uri = request.path().to_owned();

    request.set_attribute(ERROR_STATUS_ATTR, status.to_string());
    request.set_attribute(ERROR_URI_ATTR, original_uri);
    if let Some(exception) = exception {
        request.set_attribute(ERROR_EXCEPTION_ATTR, exception.exception_type().name());
        request.set_attribute(ERROR_MESSAGE_ATTR, exception.message());
    }

    request.forward_to(&format!("{context_path}{}", page.location()));
    request.mapping.host = host;
    request.mapping.context = Some(context.clone());
    request.mapping.context_path = context_path;

    let mut response = Response::new();
    match context.invoke(request, &mut response) {
        Ok(()) if !response.is_error() => {
            response.set_status(status);
            Some(response)
        }
        Ok(()) => {
            warn!(
                "error page {} answered {}; using plain error",
                page.location(),
                response.status()
            );
            None
        }
        Err(e) => {
            warn!("error page {} failed: {e}", page.location());
            None
        }
    }
}

fn write_plain_error(response: &mut Response, status: u16) {
    response.reset_body();
    response.set_status(status);
    response.set_header("Content-Type", "text/plain");
    response.write_str(&format!(
        "{status} {}\n",
        StatusCode(status).default_reason_phrase()
    ));
}

/// First language tag of an `Accept-Language` value.
fn preferred_locale(accept_language: &str) -> Option<&str> {
    accept_language
        .split(',')
        .map(|tag| tag.split(';').next().unwrap_or_default().trim())
        .find(|tag| !tag.is_empty() && *tag != "*")
}

pub fn to_core_request(req: &tiny_http::Request) -> Request {
    let host = req
        .headers()
        .iter()
        .find(|h| h.field.equiv("Host"))
        .map_or_else(String::new, |h| h.value.as_str().to_owned());

    let mut request = Request::new(req.method().as_str(), &host, req.url());
    for header in req.headers() {
        request = request.with_header(header.field.as_str().as_str(), header.value.as_str());
    }
    let locale = request
        .header("Accept-Language")
        .and_then(preferred_locale)
        .map(str::to_owned);
    if let Some(locale) = locale {
        request = request.with_locale(&locale);
    }
    request
}

fn to_http_response(response: &Response) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let mut http = tiny_http::Response::from_data(response.body().to_vec())
        .with_status_code(StatusCode(response.status()));

    for (name, value) in response.headers() {
        if name.eq_ignore_ascii_case("Content-Type") {
            continue;
        }
        match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => http.add_header(header),
            Err(()) => warn!("dropping invalid response header '{name}'"),
        }
    }

    let mut content_type = response
        .header("Content-Type")
        .unwrap_or("text/plain")
        .to_owned();
    if let Some(charset) = response.charset() {
        content_type = format!("{content_type}; charset={charset}");
    }
    if let Ok(header) = Header::from_bytes("Content-Type", content_type.as_bytes()) {
        http.add_header(header);
    }
    http
}

/// Serve one HTTP exchange.
pub fn handle_request(engine: &Container, mut req: tiny_http::Request) {
    let mut request = to_core_request(&req);
    // Bodies are not consumed by any built-in handler; drain so keep-alive works.
    let mut sink = Vec::new();
    if let Err(e) = req.as_reader().read_to_end(&mut sink) {
        debug!("failed to drain request body: {e}");
    }

    debug!("{} {}", request.method(), req.url());
    let response = dispatch(engine, &mut request);
    if let Err(e) = req.respond(to_http_response(&response)) {
        debug!("client went away before response: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_language_first_tag() {
        assert_eq!(preferred_locale("de-AT,de;q=0.9,en;q=0.5"), Some("de-AT"));
        assert_eq!(preferred_locale("*;q=0.1, fr"), Some("fr"));
        assert_eq!(preferred_locale(""), None);
    }

    #[test]
    fn content_type_carries_charset() {
        let mut response = Response::new();
        response.set_header("Content-Type", "text/html");
        response.set_charset("UTF-8");
        response.write_str("<p>hi</p>");
        let http = to_http_response(&response);
        let content_type = http
            .headers()
            .iter()
            .find(|h| h.field.equiv("Content-Type"))
            .unwrap();
        assert_eq!(content_type.value.as_str(), "text/html; charset=UTF-8");
    }

    #[test]
    fn plain_error_body() {
        let mut response = Response::new();
        write_plain_error(&mut response, 404);
        assert_eq!(response.body(), b"404 Not Found\n");
    }
}
