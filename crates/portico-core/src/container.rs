//! The composite container tree: engine, host, context and wrapper nodes.
//!
//! Parents own their children through `Arc`s keyed by child name; children
//! point back with a `Weak`. Every node owns a [`Pipeline`] whose terminal
//! valve selects the next, more specific container.

use crate::background::{BackgroundHandle, BackgroundProcessor};
use crate::collaborators::{ClassLoaderRef, Cluster, Realm, Servlet};
use crate::concurrency::run_bounded;
use crate::lifecycle::{Lifecycle, LifecycleHooks, LifecycleState, LifecycleSupport, PERIODIC_EVENT};
use crate::listeners::{
    fire_container_event, ContainerListener, Listeners, PropertyChangeEvent,
    PropertyChangeListener, ADD_CHILD_EVENT, REMOVE_CHILD_EVENT,
};
use crate::mapping::{MappedServlet, ServletMappings};
use crate::pipeline::{Pipeline, Valve};
use crate::request::{Request, Response};
use crate::valves::{ContextValve, EngineValve, HostValve, WrapperValve};
use crate::{ContainerError, LifecycleError, ValveError};
use portico_schema::{CharsetMapper, ContextName, ErrorPageSupport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const LOG_PREFIX: &str = "portico::container";
const DEFAULT_DOMAIN: &str = "portico";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerKind {
    Engine,
    Host,
    Context,
    Wrapper,
}

impl ContainerKind {
    /// The only kind this kind may hold as children.
    pub fn child_kind(self) -> Option<ContainerKind> {
        match self {
            ContainerKind::Engine => Some(ContainerKind::Host),
            ContainerKind::Host => Some(ContainerKind::Context),
            ContainerKind::Context => Some(ContainerKind::Wrapper),
            ContainerKind::Wrapper => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKind::Engine => "Engine",
            ContainerKind::Host => "Host",
            ContainerKind::Context => "Context",
            ContainerKind::Wrapper => "Wrapper",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum KindData {
    Engine {
        default_host: RwLock<String>,
    },
    Host {
        aliases: RwLock<Vec<String>>,
    },
    Context {
        name: ContextName,
        error_pages: ErrorPageSupport,
        mappings: ServletMappings,
        charsets: Arc<CharsetMapper>,
    },
    Wrapper {
        servlet: Arc<dyn Servlet>,
        load_on_startup: i32,
        available: AtomicBool,
        loaded: AtomicBool,
        load_lock: Mutex<()>,
    },
}

impl KindData {
    fn kind(&self) -> ContainerKind {
        match self {
            KindData::Engine { .. } => ContainerKind::Engine,
            KindData::Host { .. } => ContainerKind::Host,
            KindData::Context { .. } => ContainerKind::Context,
            KindData::Wrapper { .. } => ContainerKind::Wrapper,
        }
    }
}

/// Management identity: `domain:key=value,...`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectName {
    pub domain: String,
    pub properties: Vec<(String, String)>,
}

impl ObjectName {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.domain)?;
        for (i, (key, value)) in self.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Serializable view of a subtree, used for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSnapshot {
    pub kind: ContainerKind,
    pub name: String,
    pub state: LifecycleState,
    pub object_name: String,
    pub background_processor_delay: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ContainerSnapshot>,
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Container {
    name: String,
    label: String,
    kind: KindData,
    self_ref: Weak<Container>,
    parent: RwLock<Weak<Container>>,
    children: RwLock<BTreeMap<String, Arc<Container>>>,
    pipeline: Pipeline,
    lifecycle: LifecycleSupport,
    container_listeners: Arc<Listeners<dyn ContainerListener>>,
    property_listeners: Listeners<dyn PropertyChangeListener>,
    realm: RwLock<Option<Arc<dyn Realm>>>,
    cluster: RwLock<Option<Arc<dyn Cluster>>>,
    parent_class_loader: RwLock<Option<ClassLoaderRef>>,
    background_delay: AtomicI64,
    start_stop_threads: AtomicUsize,
    start_children: AtomicBool,
    background_running: AtomicBool,
    background_thread: Mutex<Option<BackgroundHandle>>,
}

impl Container {
    pub fn engine(name: &str, default_host: &str) -> Arc<Self> {
        Self::build(
            name.to_owned(),
            KindData::Engine {
                default_host: RwLock::new(default_host.to_owned()),
            },
            10,
        )
    }

    pub fn host(name: &str) -> Arc<Self> {
        Self::build(
            name.to_owned(),
            KindData::Host {
                aliases: RwLock::new(Vec::new()),
            },
            -1,
        )
    }

    /// A context named by `context_name`; its child key is the canonical
    /// `path##version` name (empty for the unversioned root).
    pub fn context(context_name: ContextName, charsets: Arc<CharsetMapper>) -> Arc<Self> {
        Self::build(
            context_name.name().to_owned(),
            KindData::Context {
                name: context_name,
                error_pages: ErrorPageSupport::new(),
                mappings: ServletMappings::new(),
                charsets,
            },
            -1,
        )
    }

    pub fn wrapper(name: &str, servlet: Arc<dyn Servlet>, load_on_startup: i32) -> Arc<Self> {
        Self::build(
            name.to_owned(),
            KindData::Wrapper {
                servlet,
                load_on_startup,
                available: AtomicBool::new(false),
                loaded: AtomicBool::new(false),
                load_lock: Mutex::new(()),
            },
            -1,
        )
    }

    fn build(name: String, kind: KindData, background_delay: i64) -> Arc<Self> {
        let label = match &kind {
            KindData::Context { name, .. } => format!("Context[{}]", name.display_name()),
            other => format!("{}[{name}]", other.kind()),
        };
        Arc::new_cyclic(|weak: &Weak<Container>| {
            let basic: Arc<dyn Valve> = match kind.kind() {
                ContainerKind::Engine => Arc::new(EngineValve::new(weak.clone())),
                ContainerKind::Host => Arc::new(HostValve::new(weak.clone())),
                ContainerKind::Context => Arc::new(ContextValve::new(weak.clone())),
                ContainerKind::Wrapper => Arc::new(WrapperValve::new(weak.clone())),
            };
            let container_listeners = Arc::new(Listeners::new());
            Container {
                pipeline: Pipeline::new(label.clone(), basic, container_listeners.clone()),
                lifecycle: LifecycleSupport::new(label.clone()),
                name,
                label,
                kind,
                self_ref: weak.clone(),
                parent: RwLock::new(Weak::new()),
                children: RwLock::new(BTreeMap::new()),
                container_listeners,
                property_listeners: Listeners::new(),
                realm: RwLock::new(None),
                cluster: RwLock::new(None),
                parent_class_loader: RwLock::new(None),
                background_delay: AtomicI64::new(background_delay),
                start_stop_threads: AtomicUsize::new(1),
                start_children: AtomicBool::new(true),
                background_running: AtomicBool::new(false),
                background_thread: Mutex::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind.kind()
    }

    /// `Kind[name]`, used as the event source and lifecycle component name.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn invoke(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        self.pipeline.invoke(request, response)
    }

    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.read().expect("container lock poisoned").upgrade()
    }

    /// Topmost ancestor, or `self` for a detached node.
    pub fn root(&self) -> Option<Arc<Container>> {
        let mut current = self.self_ref.upgrade()?;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        Some(current)
    }

    // ----- children -----

    /// Attach `child`. When this container is running (or starting) and
    /// `start_children` is set, the child is started too; a start failure is
    /// reported but leaves the child attached. A child that a concurrent
    /// parent start is already bringing up counts as started.
    pub fn add_child(&self, child: Arc<Container>) -> Result<(), ContainerError> {
        if self.kind().child_kind() != Some(child.kind()) {
            return Err(ContainerError::InvalidOperation(format!(
                "{} cannot hold a {} child",
                self.label,
                child.kind()
            )));
        }

        {
            let mut children = self.children.write().expect("container lock poisoned");
            if children.contains_key(child.name()) {
                return Err(ContainerError::DuplicateChild {
                    parent: self.label.clone(),
                    child: child.name().to_owned(),
                });
            }
            let mut parent = child.parent.write().expect("container lock poisoned");
            if parent.upgrade().is_some() {
                return Err(ContainerError::InvalidOperation(format!(
                    "{} already has a parent",
                    child.label
                )));
            }
            *parent = self.self_ref.clone();
            children.insert(child.name().to_owned(), child.clone());
        }

        debug!("{}: added child {}", self.log_name(), child.label);
        self.fire_container_event(ADD_CHILD_EVENT, Some(child.name().to_owned()));

        let state = self.state();
        if self.start_children.load(Ordering::SeqCst)
            && (state.is_available() || state == LifecycleState::StartingPrep)
        {
            match child.start() {
                Ok(()) => {}
                Err(LifecycleError::TransitionInProgress { active: "start", .. }) => {
                    debug!("{}: {} is already starting", self.log_name(), child.label);
                }
                Err(source) => {
                    return Err(ContainerError::ChildStart {
                        parent: self.label.clone(),
                        child: child.name().to_owned(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Detach `child`, stopping and destroying it first. Returns `false`
    /// when it is not a child of this container.
    pub fn remove_child(&self, child: &Arc<Container>) -> bool {
        let present = self
            .children
            .read()
            .expect("container lock poisoned")
            .get(child.name())
            .is_some_and(|c| Arc::ptr_eq(c, child));
        if !present {
            return false;
        }

        if child.state().is_available() {
            if let Err(e) = child.stop() {
                warn!("{}: stopping removed child {} failed: {e}", self.log_name(), child.label);
            }
        }
        if !matches!(
            child.state(),
            LifecycleState::Destroying | LifecycleState::Destroyed
        ) {
            if let Err(e) = child.destroy() {
                warn!("{}: destroying removed child {} failed: {e}", self.log_name(), child.label);
            }
        }

        let removed = {
            let mut children = self.children.write().expect("container lock poisoned");
            match children.get(child.name()) {
                Some(c) if Arc::ptr_eq(c, child) => children.remove(child.name()),
                _ => None,
            }
        };
        let Some(removed) = removed else {
            return false;
        };
        *removed.parent.write().expect("container lock poisoned") = Weak::new();

        if let KindData::Context { mappings, .. } = &self.kind {
            mappings.remove_wrapper(removed.name());
        }
        debug!("{}: removed child {}", self.log_name(), removed.label);
        self.fire_container_event(REMOVE_CHILD_EVENT, Some(removed.name().to_owned()));
        true
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Container>> {
        self.children
            .read()
            .expect("container lock poisoned")
            .get(name)
            .cloned()
    }

    /// Name-ordered snapshot of the children.
    pub fn find_children(&self) -> Vec<Arc<Container>> {
        self.children
            .read()
            .expect("container lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn set_start_children(&self, start_children: bool) {
        self.start_children.store(start_children, Ordering::SeqCst);
    }

    // ----- listeners -----

    pub fn add_container_listener(&self, listener: Arc<dyn ContainerListener>) {
        self.container_listeners.add(listener);
    }

    pub fn remove_container_listener(&self, listener: &Arc<dyn ContainerListener>) -> bool {
        self.container_listeners.remove(listener)
    }

    pub fn find_container_listeners(&self) -> Vec<Arc<dyn ContainerListener>> {
        self.container_listeners.snapshot()
    }

    pub fn fire_container_event(&self, event_type: &str, data: Option<String>) {
        fire_container_event(&self.container_listeners, &self.label, event_type, data);
    }

    pub fn add_property_change_listener(&self, listener: Arc<dyn PropertyChangeListener>) {
        self.property_listeners.add(listener);
    }

    pub fn remove_property_change_listener(
        &self,
        listener: &Arc<dyn PropertyChangeListener>,
    ) -> bool {
        self.property_listeners.remove(listener)
    }

    fn fire_property_change(&self, property: &str, old: Option<String>, new: Option<String>) {
        let event = PropertyChangeEvent {
            source: self.label.clone(),
            property: property.to_owned(),
            old_value: old,
            new_value: new,
        };
        for listener in self.property_listeners.snapshot() {
            listener.property_change(&event);
        }
    }

    // ----- inherited collaborators -----

    /// The realm set here, else the nearest ancestor's.
    pub fn realm(&self) -> Option<Arc<dyn Realm>> {
        let local = self.realm.read().expect("container lock poisoned").clone();
        local.or_else(|| self.parent().and_then(|p| p.realm()))
    }

    pub fn set_realm(&self, realm: Option<Arc<dyn Realm>>) {
        let running = self.state().is_available();
        if running {
            if let Some(new) = &realm {
                if let Err(e) = new.start() {
                    warn!("{}: starting realm {} failed: {e}", self.log_name(), new.name());
                }
            }
        }
        let old = std::mem::replace(
            &mut *self.realm.write().expect("container lock poisoned"),
            realm.clone(),
        );
        if running {
            if let Some(old) = &old {
                if let Err(e) = old.stop() {
                    warn!("{}: stopping realm {} failed: {e}", self.log_name(), old.name());
                }
            }
        }
        self.fire_property_change(
            "realm",
            old.map(|r| r.name().to_owned()),
            realm.map(|r| r.name().to_owned()),
        );
    }

    /// The cluster set here, else the nearest ancestor's.
    pub fn cluster(&self) -> Option<Arc<dyn Cluster>> {
        let local = self.cluster.read().expect("container lock poisoned").clone();
        local.or_else(|| self.parent().and_then(|p| p.cluster()))
    }

    pub fn set_cluster(&self, cluster: Option<Arc<dyn Cluster>>) {
        let running = self.state().is_available();
        if running {
            if let Some(new) = &cluster {
                if let Err(e) = new.start() {
                    warn!("{}: starting cluster {} failed: {e}", self.log_name(), new.name());
                }
            }
        }
        let old = std::mem::replace(
            &mut *self.cluster.write().expect("container lock poisoned"),
            cluster.clone(),
        );
        if running {
            if let Some(old) = &old {
                if let Err(e) = old.stop() {
                    warn!("{}: stopping cluster {} failed: {e}", self.log_name(), old.name());
                }
            }
        }
        self.fire_property_change(
            "cluster",
            old.map(|c| c.name().to_owned()),
            cluster.map(|c| c.name().to_owned()),
        );
    }

    /// The class loader set here, else the one inherited from the parent.
    pub fn parent_class_loader(&self) -> Option<ClassLoaderRef> {
        let local = self
            .parent_class_loader
            .read()
            .expect("container lock poisoned")
            .clone();
        local.or_else(|| self.parent().and_then(|p| p.parent_class_loader()))
    }

    pub fn set_parent_class_loader(&self, loader: Option<ClassLoaderRef>) {
        let had = loader.is_some();
        let old = std::mem::replace(
            &mut *self
                .parent_class_loader
                .write()
                .expect("container lock poisoned"),
            loader,
        );
        self.fire_property_change(
            "parentClassLoader",
            old.map(|_| "set".to_owned()),
            had.then(|| "set".to_owned()),
        );
    }

    // ----- tuning -----

    pub fn background_processor_delay(&self) -> i64 {
        self.background_delay.load(Ordering::SeqCst)
    }

    /// Seconds between periodic runs; zero or negative means a parent (or
    /// the supervisor) drives this container's background work.
    pub fn set_background_processor_delay(&self, delay: i64) {
        let old = self.background_delay.swap(delay, Ordering::SeqCst);
        self.fire_property_change(
            "backgroundProcessorDelay",
            Some(old.to_string()),
            Some(delay.to_string()),
        );
    }

    pub fn start_stop_threads(&self) -> usize {
        self.start_stop_threads.load(Ordering::SeqCst)
    }

    pub fn set_start_stop_threads(&self, threads: usize) {
        let old = self.start_stop_threads.swap(threads.max(1), Ordering::SeqCst);
        self.fire_property_change(
            "startStopThreads",
            Some(old.to_string()),
            Some(threads.max(1).to_string()),
        );
    }

    // ----- naming -----

    /// Segment of this node in log and management names; root contexts
    /// render as `/`.
    fn path_segment(&self) -> String {
        match &self.kind {
            KindData::Context { name, .. } => name.display_name(),
            _ => self.name.clone(),
        }
    }

    /// `portico::container.[engine].[host].[/ctx].[wrapper]`.
    pub fn log_name(&self) -> String {
        let mut segments = vec![self.path_segment()];
        let mut current = self.parent();
        while let Some(container) = current {
            segments.push(container.path_segment());
            current = container.parent();
        }
        let mut name = String::from(LOG_PREFIX);
        for segment in segments.iter().rev() {
            name.push_str(".[");
            name.push_str(segment);
            name.push(']');
        }
        name
    }

    pub fn span(&self) -> tracing::Span {
        tracing::debug_span!("container", name = %self.log_name())
    }

    fn ancestor_of_kind(&self, kind: ContainerKind) -> Option<Arc<Container>> {
        let mut current = self.self_ref.upgrade();
        while let Some(container) = current {
            if container.kind() == kind {
                return Some(container);
            }
            current = container.parent();
        }
        None
    }

    pub fn object_name(&self) -> ObjectName {
        let domain = self
            .ancestor_of_kind(ContainerKind::Engine)
            .map_or_else(|| DEFAULT_DOMAIN.to_owned(), |e| e.name.clone());
        let host_name = self
            .ancestor_of_kind(ContainerKind::Host)
            .map_or_else(String::new, |h| h.name.clone());
        let web_module = |context: &Container| format!("//{host_name}{}", context.path_segment());

        let properties: Vec<(&str, String)> = match &self.kind {
            KindData::Engine { .. } => vec![("type", "Engine".to_owned())],
            KindData::Host { .. } => vec![("type", "Host".to_owned()), ("host", self.name.clone())],
            KindData::Context { .. } => vec![
                ("j2eeType", "WebModule".to_owned()),
                ("name", web_module(self)),
            ],
            KindData::Wrapper { .. } => {
                let module = self
                    .parent()
                    .map_or_else(|| "//none".to_owned(), |ctx| web_module(ctx.as_ref()));
                vec![
                    ("j2eeType", "Servlet".to_owned()),
                    ("WebModule", module),
                    ("name", self.name.clone()),
                ]
            }
        };
        ObjectName {
            domain,
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        }
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        let mappings = match &self.kind {
            KindData::Wrapper { .. } => self
                .parent()
                .and_then(|context| {
                    context
                        .servlet_mappings()
                        .map(|m| m.patterns_for(&self.name))
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let (aliases, path, version, available) = match &self.kind {
            KindData::Engine { .. } => (Vec::new(), None, None, None),
            KindData::Host { aliases } => (
                aliases.read().expect("container lock poisoned").clone(),
                None,
                None,
                None,
            ),
            KindData::Context { name, .. } => (
                Vec::new(),
                Some(if name.is_root() { "/" } else { name.path() }.to_owned()),
                (!name.version().is_empty()).then(|| name.version().to_owned()),
                None,
            ),
            KindData::Wrapper { .. } => (Vec::new(), None, None, Some(self.is_servlet_available())),
        };
        ContainerSnapshot {
            kind: self.kind(),
            name: self.name.clone(),
            state: self.state(),
            object_name: self.object_name().to_string(),
            background_processor_delay: self.background_processor_delay(),
            aliases,
            path,
            version,
            available,
            mappings,
            children: self.find_children().iter().map(|c| c.snapshot()).collect(),
        }
    }

    // ----- engine -----

    pub fn default_host(&self) -> Option<String> {
        match &self.kind {
            KindData::Engine { default_host } => {
                Some(default_host.read().expect("container lock poisoned").clone())
            }
            _ => None,
        }
    }

    pub fn set_default_host(&self, host: &str) -> Result<(), ContainerError> {
        let KindData::Engine { default_host } = &self.kind else {
            return Err(self.wrong_kind("default host"));
        };
        let old = std::mem::replace(
            &mut *default_host.write().expect("container lock poisoned"),
            host.to_owned(),
        );
        self.fire_property_change("defaultHost", Some(old), Some(host.to_owned()));
        Ok(())
    }

    /// Host for a request host name: exact name or alias (case-insensitive),
    /// else the default host.
    pub fn map_host(&self, host_name: &str) -> Option<Arc<Container>> {
        let hosts = self.find_children();
        hosts
            .iter()
            .find(|h| h.matches_host_name(host_name))
            .cloned()
            .or_else(|| {
                let fallback = self.default_host()?;
                hosts
                    .into_iter()
                    .find(|h| h.name.eq_ignore_ascii_case(&fallback))
            })
    }

    // ----- host -----

    pub fn aliases(&self) -> Vec<String> {
        match &self.kind {
            KindData::Host { aliases } => aliases.read().expect("container lock poisoned").clone(),
            _ => Vec::new(),
        }
    }

    pub fn add_alias(&self, alias: &str) -> Result<(), ContainerError> {
        let KindData::Host { aliases } = &self.kind else {
            return Err(self.wrong_kind("aliases"));
        };
        let mut aliases = aliases.write().expect("container lock poisoned");
        if !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
            aliases.push(alias.to_ascii_lowercase());
        }
        Ok(())
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        let KindData::Host { aliases } = &self.kind else {
            return false;
        };
        let mut aliases = aliases.write().expect("container lock poisoned");
        let before = aliases.len();
        aliases.retain(|a| !a.eq_ignore_ascii_case(alias));
        aliases.len() != before
    }

    fn matches_host_name(&self, host_name: &str) -> bool {
        self.name.eq_ignore_ascii_case(host_name)
            || self
                .aliases()
                .iter()
                .any(|a| a.eq_ignore_ascii_case(host_name))
    }

    /// Context whose path is the longest prefix of `path` on a segment
    /// boundary. Ties between versions go to the running one, then to the
    /// greatest version.
    pub fn map_context(&self, path: &str) -> Option<Arc<Container>> {
        self.find_children()
            .into_iter()
            .filter(|c| {
                c.context_name().is_some_and(|name| {
                    let prefix = name.path();
                    prefix.is_empty()
                        || path == prefix
                        || path
                            .strip_prefix(prefix)
                            .is_some_and(|rest| rest.starts_with('/'))
                })
            })
            .max_by(|a, b| {
                let key = |c: &Arc<Container>| {
                    let name = c.context_name().map(ContextName::clone);
                    let len = name.as_ref().map_or(0, |n| n.path().len());
                    (len, c.state().is_available(), name.map(|n| n.version().to_owned()))
                };
                key(a).cmp(&key(b))
            })
    }

    // ----- context -----

    pub fn context_name(&self) -> Option<&ContextName> {
        match &self.kind {
            KindData::Context { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn error_pages(&self) -> Option<&ErrorPageSupport> {
        match &self.kind {
            KindData::Context { error_pages, .. } => Some(error_pages),
            _ => None,
        }
    }

    pub fn servlet_mappings(&self) -> Option<&ServletMappings> {
        match &self.kind {
            KindData::Context { mappings, .. } => Some(mappings),
            _ => None,
        }
    }

    pub fn charset_mapper(&self) -> Option<&CharsetMapper> {
        match &self.kind {
            KindData::Context { charsets, .. } => Some(charsets),
            _ => None,
        }
    }

    /// Route `pattern` to the wrapper child `wrapper_name`.
    pub fn add_servlet_mapping(&self, pattern: &str, wrapper_name: &str) -> Result<(), ContainerError> {
        let KindData::Context { mappings, .. } = &self.kind else {
            return Err(self.wrong_kind("servlet mappings"));
        };
        if self.find_child(wrapper_name).is_none() {
            return Err(ContainerError::InvalidOperation(format!(
                "{} has no wrapper named '{wrapper_name}' for pattern '{pattern}'",
                self.label
            )));
        }
        mappings.add(pattern, wrapper_name);
        Ok(())
    }

    /// Wrapper for a context-relative path.
    pub fn map_wrapper(&self, relative: &str) -> Option<(Arc<Container>, MappedServlet)> {
        let mapped = self.servlet_mappings()?.map(relative)?;
        let wrapper = self.find_child(&mapped.wrapper_name)?;
        Some((wrapper, mapped))
    }

    // ----- wrapper -----

    pub fn servlet(&self) -> Option<Arc<dyn Servlet>> {
        match &self.kind {
            KindData::Wrapper { servlet, .. } => Some(servlet.clone()),
            _ => None,
        }
    }

    pub fn load_on_startup(&self) -> Option<i32> {
        match &self.kind {
            KindData::Wrapper {
                load_on_startup, ..
            } => Some(*load_on_startup),
            _ => None,
        }
    }

    /// Whether the wrapper is started and its servlet has not been marked
    /// unavailable. Always `false` for other kinds.
    pub fn is_servlet_available(&self) -> bool {
        match &self.kind {
            KindData::Wrapper { available, .. } => available.load(Ordering::SeqCst),
            _ => false,
        }
    }

    pub fn set_servlet_available(&self, value: bool) {
        if let KindData::Wrapper { available, .. } = &self.kind {
            available.store(value, Ordering::SeqCst);
        }
    }

    /// Whether the servlet's `init` has run since the wrapper last started.
    pub fn is_servlet_loaded(&self) -> bool {
        match &self.kind {
            KindData::Wrapper { loaded, .. } => loaded.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Initialise the servlet once, returning whether it is ready to serve.
    /// An `init` failure marks the servlet unavailable.
    pub fn load_servlet(&self) -> bool {
        let KindData::Wrapper {
            servlet,
            available,
            loaded,
            load_lock,
            ..
        } = &self.kind
        else {
            return false;
        };
        if loaded.load(Ordering::Acquire) {
            return available.load(Ordering::SeqCst);
        }

        let _guard = load_lock.lock().expect("servlet load lock poisoned");
        if loaded.load(Ordering::Acquire) {
            return available.load(Ordering::SeqCst);
        }
        if !available.load(Ordering::SeqCst) {
            return false;
        }
        match servlet.init() {
            Ok(()) => {
                loaded.store(true, Ordering::Release);
                debug!("{}: servlet loaded", self.log_name());
                true
            }
            Err(e) => {
                available.store(false, Ordering::SeqCst);
                warn!("{}: servlet failed to initialise, marking unavailable: {e}", self.log_name());
                false
            }
        }
    }

    /// Load every wrapper with a non-negative load-on-startup value, lowest
    /// first; ties keep name order. The rest load on their first request.
    fn load_on_startup_children(&self) {
        if self.kind() != ContainerKind::Context {
            return;
        }
        let mut eager: Vec<(i32, Arc<Container>)> = self
            .find_children()
            .into_iter()
            .filter_map(|w| w.load_on_startup().filter(|n| *n >= 0).map(|n| (n, w)))
            .collect();
        eager.sort_by_key(|(n, _)| *n);
        for (_, wrapper) in eager {
            wrapper.load_servlet();
        }
    }

    fn wrong_kind(&self, what: &str) -> ContainerError {
        ContainerError::InvalidOperation(format!("{} has no {what}", self.label))
    }

    // ----- background work -----

    /// One round of this node's own periodic work: cluster, realm, pipeline
    /// valves, then the `periodic` lifecycle event. Children are not visited
    /// here; see [`BackgroundProcessor`].
    ///
    /// Returns `Ok(false)` when skipped because the container is not
    /// available or a previous round on it is still running.
    pub fn background_process(&self) -> Result<bool, ContainerError> {
        if !self.state().is_available() {
            return Ok(false);
        }
        if self
            .background_running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("{}: background work still running, skipping", self.log_name());
            return Ok(false);
        }
        let _guard = FlagGuard(&self.background_running);

        let mut failures = Vec::new();
        if let Some(cluster) = self.local_cluster() {
            if let Err(e) = cluster.background_process() {
                failures.push(format!("cluster {}: {e}", cluster.name()));
            }
        }
        if let Some(realm) = self.local_realm() {
            if let Err(e) = realm.background_process() {
                failures.push(format!("realm {}: {e}", realm.name()));
            }
        }
        for (valve, e) in self.pipeline.background_process() {
            failures.push(format!("valve {valve}: {e}"));
        }
        self.lifecycle.fire(PERIODIC_EVENT, None);

        if failures.is_empty() {
            Ok(true)
        } else {
            Err(ContainerError::Background {
                container: self.label.clone(),
                reason: failures.join("; "),
            })
        }
    }

    fn local_realm(&self) -> Option<Arc<dyn Realm>> {
        self.realm.read().expect("container lock poisoned").clone()
    }

    fn local_cluster(&self) -> Option<Arc<dyn Cluster>> {
        self.cluster.read().expect("container lock poisoned").clone()
    }

    fn hook_failure(&self, operation: &'static str, reason: String) -> LifecycleError {
        LifecycleError::Failed {
            component: self.label.clone(),
            operation,
            reason,
        }
    }

    fn start_wrapper(&self) {
        if let KindData::Wrapper { available, .. } = &self.kind {
            available.store(true, Ordering::SeqCst);
        }
    }

    fn stop_wrapper(&self) {
        if let KindData::Wrapper {
            servlet,
            available,
            loaded,
            load_lock,
            ..
        } = &self.kind
        {
            available.store(false, Ordering::SeqCst);
            let _guard = load_lock.lock().expect("servlet load lock poisoned");
            if loaded.swap(false, Ordering::AcqRel) {
                servlet.destroy();
            }
        }
    }

    fn stop_background_thread(&self) {
        let handle = self
            .background_thread
            .lock()
            .expect("background thread lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }
}

impl LifecycleHooks for Container {
    fn start_internal(&self) -> Result<(), LifecycleError> {
        let span = self.span();
        let _entered = span.enter();

        if let Some(cluster) = self.local_cluster() {
            cluster
                .start()
                .map_err(|e| self.hook_failure("start", format!("cluster {}: {e}", cluster.name())))?;
        }
        if let Some(realm) = self.local_realm() {
            realm
                .start()
                .map_err(|e| self.hook_failure("start", format!("realm {}: {e}", realm.name())))?;
        }
        self.start_wrapper();

        let children = self.find_children();
        let failures: Vec<String> = run_bounded(&children, self.start_stop_threads(), |child| {
            match child.start() {
                Ok(()) | Err(LifecycleError::TransitionInProgress { active: "start", .. }) => None,
                Err(e) => Some(e.to_string()),
            }
        })
        .into_iter()
        .flatten()
        .collect();
        if !failures.is_empty() {
            return Err(self.hook_failure(
                "start",
                format!("child start failed: {}", failures.join("; ")),
            ));
        }
        self.load_on_startup_children();

        self.pipeline.start()?;

        let delay = self.background_processor_delay();
        if delay > 0 {
            let handle = BackgroundProcessor::spawn(
                self.self_ref.clone(),
                Duration::from_secs(delay.unsigned_abs()),
                self.start_stop_threads(),
            );
            *self
                .background_thread
                .lock()
                .expect("background thread lock poisoned") = Some(handle);
        }

        if matches!(self.kind(), ContainerKind::Engine | ContainerKind::Host) {
            info!("{} started", self.label);
        } else {
            debug!("{} started", self.label);
        }
        Ok(())
    }

    fn stop_internal(&self) -> Result<(), LifecycleError> {
        let span = self.span();
        let _entered = span.enter();

        self.stop_background_thread();

        let mut failures = Vec::new();
        if let Err(e) = self.pipeline.stop() {
            failures.push(e.to_string());
        }

        let children = self.find_children();
        failures.extend(
            run_bounded(&children, self.start_stop_threads(), |child| {
                child.stop().err().map(|e| e.to_string())
            })
            .into_iter()
            .flatten(),
        );

        self.stop_wrapper();

        if let Some(realm) = self.local_realm() {
            if let Err(e) = realm.stop() {
                failures.push(format!("realm {}: {e}", realm.name()));
            }
        }
        if let Some(cluster) = self.local_cluster() {
            if let Err(e) = cluster.stop() {
                failures.push(format!("cluster {}: {e}", cluster.name()));
            }
        }

        if !failures.is_empty() {
            return Err(self.hook_failure("stop", failures.join("; ")));
        }
        if matches!(self.kind(), ContainerKind::Engine | ContainerKind::Host) {
            info!("{} stopped", self.label);
        }
        Ok(())
    }

    fn destroy_internal(&self) -> Result<(), LifecycleError> {
        for child in self.find_children() {
            self.remove_child(&child);
        }
        Ok(())
    }
}

impl Lifecycle for Container {
    fn lifecycle(&self) -> &LifecycleSupport {
        &self.lifecycle
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("label", &self.label)
            .field("state", &self.state())
            .field(
                "children",
                &self
                    .children
                    .read()
                    .expect("container lock poisoned")
                    .keys()
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
