use crate::collaborators::BoxError;
use crate::listeners::{
    fire_container_event, ContainerListener, Listeners, ADD_VALVE_EVENT, REMOVE_VALVE_EVENT,
};
use crate::request::{Request, Response};
use crate::{ContainerError, LifecycleError, ValveError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// One interception step in a [`Pipeline`].
pub trait Valve: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Do this valve's work, then either continue with `next`, return
    /// without continuing, or fail. `next` is consumed on use, so the chain
    /// continues at most once.
    fn invoke(
        &self,
        request: &mut Request,
        response: &mut Response,
        next: Next<'_>,
    ) -> Result<(), ValveError>;

    fn is_async_supported(&self) -> bool {
        false
    }

    fn background_process(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The remainder of a chain after the current valve.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Valve>],
}

impl<'a> Next<'a> {
    pub fn new(rest: &'a [Arc<dyn Valve>]) -> Self {
        Self { rest }
    }

    pub fn invoke(self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        match self.rest.split_first() {
            Some((valve, rest)) => valve.invoke(request, response, Next { rest }),
            None => Ok(()),
        }
    }
}

struct Chain {
    valves: Vec<Arc<dyn Valve>>,
    basic: Arc<dyn Valve>,
    // Rebuilt on every mutation; dispatch clones the Arc and runs lock-free.
    snapshot: Arc<[Arc<dyn Valve>]>,
}

impl Chain {
    fn contains(&self, valve: &Arc<dyn Valve>) -> bool {
        self.snapshot.iter().any(|v| Arc::ptr_eq(v, valve))
    }

    fn rebuild(&mut self) {
        self.snapshot = self
            .valves
            .iter()
            .chain(std::iter::once(&self.basic))
            .cloned()
            .collect();
    }
}

/// Ordered valves plus the terminal valve, scoped to one container.
pub struct Pipeline {
    source: String,
    chain: RwLock<Chain>,
    listeners: Arc<Listeners<dyn ContainerListener>>,
    started: AtomicBool,
}

impl Pipeline {
    pub fn new(
        source: impl Into<String>,
        basic: Arc<dyn Valve>,
        listeners: Arc<Listeners<dyn ContainerListener>>,
    ) -> Self {
        let mut chain = Chain {
            valves: Vec::new(),
            basic,
            snapshot: Arc::from(Vec::new()),
        };
        chain.rebuild();
        Self {
            source: source.into(),
            chain: RwLock::new(chain),
            listeners,
            started: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Arc<[Arc<dyn Valve>]> {
        self.chain
            .read()
            .expect("pipeline lock poisoned")
            .snapshot
            .clone()
    }

    pub fn basic(&self) -> Arc<dyn Valve> {
        self.chain.read().expect("pipeline lock poisoned").basic.clone()
    }

    /// Replace the terminal valve. The new one is started first when the
    /// pipeline is running, and the old one stopped afterwards. A valve that
    /// already sits earlier in the chain is rejected.
    pub fn set_basic(&self, valve: Arc<dyn Valve>) -> Result<(), ContainerError> {
        {
            let chain = self.chain.read().expect("pipeline lock poisoned");
            if Arc::ptr_eq(&chain.basic, &valve) {
                return Ok(());
            }
            if chain.contains(&valve) {
                return Err(self.already_linked(&*valve));
            }
        }
        if self.is_started() {
            valve.start().map_err(|e| self.valve_failure("start", &*valve, &e))?;
        }
        let old = {
            let mut chain = self.chain.write().expect("pipeline lock poisoned");
            if chain.contains(&valve) {
                return Err(self.already_linked(&*valve));
            }
            let old = std::mem::replace(&mut chain.basic, valve);
            chain.rebuild();
            old
        };
        if self.is_started() {
            if let Err(e) = old.stop() {
                warn!("{}: stopping replaced terminal valve {} failed: {e}", self.source, old.name());
            }
        }
        Ok(())
    }

    /// Append a valve just before the terminal valve. The same instance is
    /// never linked twice, even by racing callers.
    pub fn add_valve(&self, valve: Arc<dyn Valve>) -> Result<(), ContainerError> {
        if self.chain.read().expect("pipeline lock poisoned").contains(&valve) {
            return Err(self.already_linked(&*valve));
        }
        if self.is_started() {
            valve.start().map_err(|e| self.valve_failure("start", &*valve, &e))?;
        }
        {
            let mut chain = self.chain.write().expect("pipeline lock poisoned");
            // Re-checked under the write lock; the linked instance keeps running.
            if chain.contains(&valve) {
                return Err(self.already_linked(&*valve));
            }
            chain.valves.push(valve.clone());
            chain.rebuild();
        }
        debug!("{}: added valve {}", self.source, valve.name());
        fire_container_event(
            &self.listeners,
            &self.source,
            ADD_VALVE_EVENT,
            Some(valve.name().to_owned()),
        );
        Ok(())
    }

    /// Unlink a valve. Returns `Ok(false)` when it was not in the chain; the
    /// terminal valve cannot be removed this way.
    pub fn remove_valve(&self, valve: &Arc<dyn Valve>) -> Result<bool, ContainerError> {
        {
            let mut chain = self.chain.write().expect("pipeline lock poisoned");
            if Arc::ptr_eq(&chain.basic, valve) {
                return Err(ContainerError::InvalidOperation(format!(
                    "cannot remove the terminal valve of {}",
                    self.source
                )));
            }
            let before = chain.valves.len();
            chain.valves.retain(|v| !Arc::ptr_eq(v, valve));
            if chain.valves.len() == before {
                return Ok(false);
            }
            chain.rebuild();
        }
        if self.is_started() {
            if let Err(e) = valve.stop() {
                warn!("{}: stopping removed valve {} failed: {e}", self.source, valve.name());
            }
        }
        fire_container_event(
            &self.listeners,
            &self.source,
            REMOVE_VALVE_EVENT,
            Some(valve.name().to_owned()),
        );
        Ok(true)
    }

    /// Every valve in execution order, terminal valve last.
    pub fn valves(&self) -> Vec<Arc<dyn Valve>> {
        self.snapshot().to_vec()
    }

    pub fn first(&self) -> Arc<dyn Valve> {
        let snapshot = self.snapshot();
        // The snapshot always ends with the terminal valve.
        snapshot.first().cloned().unwrap_or_else(|| self.basic())
    }

    /// The valve after `valve`; `None` for the terminal valve or a stranger.
    pub fn next_of(&self, valve: &Arc<dyn Valve>) -> Option<Arc<dyn Valve>> {
        let snapshot = self.snapshot();
        let position = snapshot.iter().position(|v| Arc::ptr_eq(v, valve))?;
        snapshot.get(position + 1).cloned()
    }

    pub fn is_async_supported(&self) -> bool {
        self.snapshot().iter().all(|v| v.is_async_supported())
    }

    pub fn invoke(&self, request: &mut Request, response: &mut Response) -> Result<(), ValveError> {
        let snapshot = self.snapshot();
        Next::new(&snapshot).invoke(request, response)
    }

    /// Run every valve's background work. A failing valve does not stop the
    /// rest; failures are returned as `(valve name, error)`.
    pub fn background_process(&self) -> Vec<(String, BoxError)> {
        self.snapshot()
            .iter()
            .filter_map(|valve| {
                valve
                    .background_process()
                    .err()
                    .map(|e| (valve.name().to_owned(), e))
            })
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        for valve in self.snapshot().iter() {
            valve
                .start()
                .map_err(|e| self.lifecycle_failure("start", &**valve, &e))?;
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop every valve, reporting the first failure after trying them all.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.started.store(false, Ordering::SeqCst);
        let mut first_error = None;
        for valve in self.snapshot().iter() {
            if let Err(e) = valve.stop() {
                warn!("{}: valve {} failed to stop: {e}", self.source, valve.name());
                first_error.get_or_insert_with(|| self.lifecycle_failure("stop", &**valve, &e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn already_linked(&self, valve: &dyn Valve) -> ContainerError {
        ContainerError::InvalidOperation(format!(
            "valve {} is already in the pipeline of {}",
            valve.name(),
            self.source
        ))
    }

    fn lifecycle_failure(
        &self,
        operation: &'static str,
        valve: &dyn Valve,
        cause: &BoxError,
    ) -> LifecycleError {
        LifecycleError::Failed {
            component: self.source.clone(),
            operation,
            reason: format!("valve {}: {cause}", valve.name()),
        }
    }

    fn valve_failure(
        &self,
        operation: &'static str,
        valve: &dyn Valve,
        cause: &BoxError,
    ) -> ContainerError {
        ContainerError::Lifecycle(self.lifecycle_failure(operation, valve, cause))
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.snapshot().iter().map(|v| v.name().to_owned()).collect();
        f.debug_struct("Pipeline")
            .field("source", &self.source)
            .field("valves", &names)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listeners::ContainerEvent;
    use std::sync::Mutex;

    struct Tag {
        label: &'static str,
        stop_here: bool,
        is_async: bool,
    }

    impl Tag {
        fn new(label: &'static str) -> Arc<dyn Valve> {
            Arc::new(Self {
                label,
                stop_here: false,
                is_async: true,
            })
        }
    }

    impl Valve for Tag {
        fn name(&self) -> &str {
            self.label
        }

        fn invoke(
            &self,
            request: &mut Request,
            response: &mut Response,
            next: Next<'_>,
        ) -> Result<(), ValveError> {
            let trail = request.attribute("trail").unwrap_or_default().to_owned();
            request.set_attribute("trail", format!("{trail}{}", self.label));
            if self.stop_here {
                return Ok(());
            }
            next.invoke(request, response)
        }

        fn is_async_supported(&self) -> bool {
            self.is_async
        }
    }

    struct Boom;

    impl Valve for Boom {
        fn invoke(&self, _: &mut Request, _: &mut Response, _: Next<'_>) -> Result<(), ValveError> {
            Err(ValveError::Cancelled)
        }

        fn background_process(&self) -> Result<(), BoxError> {
            Err("background boom".into())
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<ContainerEvent>>);

    impl ContainerListener for Events {
        fn container_event(&self, event: &ContainerEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn pipeline(basic: Arc<dyn Valve>) -> (Pipeline, Arc<Events>) {
        let listeners: Arc<Listeners<dyn ContainerListener>> = Arc::new(Listeners::new());
        let events = Arc::new(Events::default());
        listeners.add(events.clone());
        (Pipeline::new("Host[test]", basic, listeners), events)
    }

    fn trail(pipeline: &Pipeline) -> String {
        let mut request = Request::new("GET", "h", "/");
        let mut response = Response::new();
        pipeline.invoke(&mut request, &mut response).unwrap();
        request.attribute("trail").unwrap_or_default().to_owned()
    }

    #[test]
    fn runs_in_insertion_order_with_terminal_last() {
        let (pipeline, events) = pipeline(Tag::new("Z"));
        pipeline.add_valve(Tag::new("A")).unwrap();
        pipeline.add_valve(Tag::new("B")).unwrap();
        assert_eq!(trail(&pipeline), "ABZ");
        let fired = events.0.lock().unwrap();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[1].event_type, ADD_VALVE_EVENT);
        assert_eq!(fired[1].data.as_deref(), Some("B"));
    }

    #[test]
    fn short_circuit_skips_the_rest() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        pipeline
            .add_valve(Arc::new(Tag {
                label: "S",
                stop_here: true,
                is_async: true,
            }))
            .unwrap();
        pipeline.add_valve(Tag::new("B")).unwrap();
        assert_eq!(trail(&pipeline), "S");
    }

    #[test]
    fn failure_aborts_chain() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        pipeline.add_valve(Tag::new("A")).unwrap();
        pipeline.add_valve(Arc::new(Boom)).unwrap();
        let mut request = Request::new("GET", "h", "/");
        let mut response = Response::new();
        assert!(pipeline.invoke(&mut request, &mut response).is_err());
        assert_eq!(request.attribute("trail"), Some("A"));
    }

    #[test]
    fn terminal_valve_cannot_be_removed() {
        let basic = Tag::new("Z");
        let (pipeline, _) = pipeline(basic.clone());
        let err = pipeline.remove_valve(&basic).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidOperation(_)));
        assert_eq!(pipeline.valves().len(), 1);
        assert!(pipeline.next_of(&basic).is_none());
    }

    #[test]
    fn remove_relinks_neighbours() {
        let (pipeline, events) = pipeline(Tag::new("Z"));
        let a = Tag::new("A");
        let b = Tag::new("B");
        let c = Tag::new("C");
        for v in [&a, &b, &c] {
            pipeline.add_valve(v.clone()).unwrap();
        }
        assert!(pipeline.remove_valve(&b).unwrap());
        assert!(!pipeline.remove_valve(&b).unwrap());
        assert_eq!(pipeline.next_of(&a).unwrap().name(), "C");
        assert_eq!(pipeline.first().name(), "A");
        assert_eq!(trail(&pipeline), "ACZ");
        assert_eq!(
            events.0.lock().unwrap().last().unwrap().event_type,
            REMOVE_VALVE_EVENT
        );
    }

    #[test]
    fn duplicate_valve_rejected() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        let a = Tag::new("A");
        pipeline.add_valve(a.clone()).unwrap();
        assert!(pipeline.add_valve(a).is_err());
        assert_eq!(pipeline.valves().len(), 2);
    }

    #[test]
    fn async_support_is_conjunction() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        pipeline.add_valve(Tag::new("A")).unwrap();
        assert!(pipeline.is_async_supported());
        pipeline.add_valve(Arc::new(Boom)).unwrap();
        assert!(!pipeline.is_async_supported());
    }

    #[test]
    fn set_basic_replaces_terminal() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        pipeline.add_valve(Tag::new("A")).unwrap();
        pipeline.set_basic(Tag::new("Y")).unwrap();
        assert_eq!(trail(&pipeline), "AY");
    }

    #[test]
    fn set_basic_rejects_a_linked_valve() {
        let basic = Tag::new("Z");
        let (pipeline, _) = pipeline(basic.clone());
        let a = Tag::new("A");
        pipeline.add_valve(a.clone()).unwrap();

        let err = pipeline.set_basic(a).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidOperation(_)));
        assert_eq!(trail(&pipeline), "AZ");

        pipeline.set_basic(basic).unwrap();
        assert_eq!(pipeline.valves().len(), 2);
    }

    #[test]
    fn racing_adds_link_a_valve_once() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        pipeline.start().unwrap();
        let shared = Tag::new("A");
        let accepted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| pipeline.add_valve(shared.clone()).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(accepted, 1);
        assert_eq!(trail(&pipeline), "AZ");
    }

    #[test]
    fn background_failures_are_isolated() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        pipeline.add_valve(Arc::new(Boom)).unwrap();
        pipeline.add_valve(Tag::new("A")).unwrap();
        let failures = pipeline.background_process();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.to_string().contains("background boom"));
    }

    #[test]
    fn start_and_stop_track_state() {
        let (pipeline, _) = pipeline(Tag::new("Z"));
        pipeline.start().unwrap();
        assert!(pipeline.is_started());
        pipeline.stop().unwrap();
        assert!(!pipeline.is_started());
    }
}
