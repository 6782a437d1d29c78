//! Supervisor and HTTP connector for the Portico container core.
//!
//! [`build_engine`] turns a [`ServerConfig`] into a container tree, [`serve`]
//! drives its lifecycle around a `tiny_http` accept loop, and the
//! [`TestServer`] helper runs the whole stack on a random port for
//! integration tests.

pub mod connector;
pub mod servlets;

pub use connector::{dispatch, handle_request, to_core_request};
pub use servlets::builtin_servlet;

use portico_core::{
    BackgroundProcessor, Container, ContainerError, Lifecycle, LifecycleError, ShutdownSignal,
};
use portico_schema::{ContextSection, EngineSection, HostSection, SchemaError, ServerConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tiny_http::Server;
use tracing::{error, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(250);
/// How often the supervisor drives background work for an engine whose own
/// delay is not positive.
const SUPERVISOR_BACKGROUND_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] SchemaError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("unknown handler '{0}'")]
    UnknownHandler(String),
}

/// Single host, single root context with the welcome and status handlers.
pub fn default_config() -> ServerConfig {
    let responses = BTreeMap::from([
        ("/".to_owned(), "welcome".to_owned()),
        ("/status".to_owned(), "status".to_owned()),
    ]);
    ServerConfig {
        engine: EngineSection::default(),
        charsets: BTreeMap::new(),
        hosts: vec![HostSection {
            name: "localhost".to_owned(),
            aliases: vec!["127.0.0.1".to_owned()],
            contexts: vec![ContextSection {
                path: Some("/".to_owned()),
                responses,
                ..ContextSection::default()
            }],
        }],
    }
}

/// Build the container tree described by `config`. Nothing is started.
pub fn build_engine(config: &ServerConfig) -> Result<Arc<Container>, ServerError> {
    config.validate()?;
    let threads = config.engine.start_stop_threads;
    let charsets = Arc::new(config.charset_mapper());

    let engine = Container::engine(&config.engine.name, &config.engine.default_host);
    engine.set_background_processor_delay(config.engine.background_processor_delay_secs);
    engine.set_start_stop_threads(threads);

    for host_section in &config.hosts {
        let host = Container::host(&host_section.name);
        host.set_start_stop_threads(threads);
        for alias in &host_section.aliases {
            host.add_alias(alias)?;
        }
        engine.add_child(host.clone())?;

        for context_section in &host_section.contexts {
            let context = Container::context(context_section.context_name()?, charsets.clone());
            context.set_start_stop_threads(threads);
            if let Some(pages) = context.error_pages() {
                for page in &context_section.error_pages {
                    pages.add(Arc::new(page.to_error_page()?));
                }
            }
            for (pattern, kind) in &context_section.responses {
                if context.find_child(kind).is_none() {
                    context.add_child(Container::wrapper(kind, builtin_servlet(kind)?, 1))?;
                }
                context.add_servlet_mapping(pattern, kind)?;
            }
            host.add_child(context)?;
        }
    }
    Ok(engine)
}

fn bind(addr: &str) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Accept and serve requests until `shutdown` is requested.
pub fn run_server(engine: &Arc<Container>, server: &Server, shutdown: &ShutdownSignal) {
    let processor = BackgroundProcessor::new(engine.start_stop_threads());
    let mut last_background = Instant::now();

    while !shutdown.is_requested() {
        match server.recv_timeout(ACCEPT_POLL) {
            Ok(Some(request)) => handle_request(engine, request),
            Ok(None) => {}
            Err(e) => error!("accept failed: {e}"),
        }

        if engine.background_processor_delay() <= 0
            && last_background.elapsed() >= SUPERVISOR_BACKGROUND_INTERVAL
        {
            last_background = Instant::now();
            let report = processor.process(engine);
            if !report.is_clean() {
                warn!("{} background failures", report.failures.len());
            }
        }
    }
}

/// Build, start, serve and finally stop and destroy the engine.
pub fn serve(config: &ServerConfig, addr: &str, shutdown: &ShutdownSignal) -> Result<(), ServerError> {
    let engine = build_engine(config)?;
    engine.start()?;
    info!("{} started with {} host(s)", engine.label(), engine.find_children().len());

    let served = bind(addr).map(|server| {
        info!("listening on {addr}");
        run_server(&engine, &server, shutdown);
    });

    info!("shutting down {}", engine.label());
    let stopped = engine.stop();
    let destroyed = engine.destroy();
    served?;
    stopped?;
    destroyed?;
    Ok(())
}

/// A test helper that runs a started engine behind `127.0.0.1:{port}`.
///
/// Dropping it unblocks the accept loop, then stops and destroys the engine.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub engine: Arc<Container>,
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: &ServerConfig) -> Self {
        let engine = build_engine(config).expect("invalid test configuration");
        engine.start().expect("failed to start test engine");

        let server = Arc::new(bind("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let srv = Arc::clone(&server);
        let serving = Arc::clone(&engine);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&serving, request);
            }
        });

        Self {
            url,
            port,
            engine,
            server,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = self.engine.stop();
        let _ = self.engine.destroy();
    }
}
