use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::desktop::DesktopContext;
use crate::error::{ProcessError, ProcessResult};
use crate::host::{EventKind, HostEvent};

pub type EventHandler = Box<dyn Fn(&HostEvent) + Send + Sync>;

thread_local! {
    /// Listeners whose handlers are running on this thread, innermost last.
    static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn is_delivering(listener_id: u64) -> bool {
    DELIVERING.with(|delivering| delivering.borrow().contains(&listener_id))
}

struct DeliveryScope;

impl DeliveryScope {
    fn enter(listener_id: u64) -> Self {
        DELIVERING.with(|delivering| delivering.borrow_mut().push(listener_id));
        Self
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|delivering| {
            delivering.borrow_mut().pop();
        });
    }
}

struct Listener {
    id: u64,
    kind: EventKind,
    active: AtomicBool,
    // Held for the whole handler call so release can wait out an in-flight delivery.
    handler: Mutex<Option<EventHandler>>,
}

impl Listener {
    fn deliver(&self, event: &HostEvent) -> bool {
        // A handler dispatching into its own listener would wait on its own lock.
        if is_delivering(self.id) {
            log::debug!("[event-bridge] skipped re-entrant delivery to listener {}", self.id);
            return false;
        }

        let guard = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        let Some(handler) = guard.as_ref() else {
            return false;
        };

        let _scope = DeliveryScope::enter(self.id);
        handler(event);
        true
    }
}

struct BridgeShared {
    context: DesktopContext,
    transport: Option<broadcast::Sender<HostEvent>>,
    next_listener_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<Arc<Listener>>>>,
    transport_warning_logged: AtomicBool,
}

impl BridgeShared {
    fn unregister(&self, listener: &Listener) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registered) = listeners.get_mut(&listener.kind) {
            registered.retain(|candidate| candidate.id != listener.id);
            if registered.is_empty() {
                listeners.remove(&listener.kind);
            }
        }
    }

    fn report_transport_unavailable(&self) {
        if !self.transport_warning_logged.swap(true, Ordering::AcqRel) {
            log::warn!(
                "[event-bridge] {}; subscriptions will not receive events",
                ProcessError::TransportUnavailable
            );
        }
    }
}

/// Capability token for one registration. Releasing it is idempotent and guarantees the
/// handler is not running and will not run again once `release` returns.
#[must_use = "dropping a Subscription keeps the listener registered; call release() to stop delivery"]
pub struct Subscription {
    registration: Option<(Arc<BridgeShared>, Arc<Listener>)>,
}

impl Subscription {
    pub fn inert() -> Self {
        Self { registration: None }
    }

    pub fn is_active(&self) -> bool {
        self.registration
            .as_ref()
            .map(|(_, listener)| listener.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn release(&self) {
        let Some((shared, listener)) = self.registration.as_ref() else {
            return;
        };
        if !listener.active.swap(false, Ordering::AcqRel) {
            return;
        }
        shared.unregister(listener);

        if is_delivering(listener.id) {
            return;
        }
        let mut handler = listener
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handler.take();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Fans host events out to per-kind listeners, in host emission order.
#[derive(Clone)]
pub struct EventBridge {
    shared: Arc<BridgeShared>,
}

impl EventBridge {
    pub fn new(context: DesktopContext, transport: Option<broadcast::Sender<HostEvent>>) -> Self {
        Self {
            shared: Arc::new(BridgeShared {
                context,
                transport,
                next_listener_id: AtomicU64::new(1),
                listeners: Mutex::new(HashMap::new()),
                transport_warning_logged: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport_available(&self) -> bool {
        self.shared.transport.is_some()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&HostEvent) + Send + Sync + 'static,
    {
        if !self.shared.context.is_desktop_context() {
            return Subscription::inert();
        }
        if !self.transport_available() {
            self.shared.report_transport_unavailable();
            return Subscription::inert();
        }

        let handler: EventHandler = Box::new(handler);
        let listener = Arc::new(Listener {
            id: self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed),
            kind,
            active: AtomicBool::new(true),
            handler: Mutex::new(Some(handler)),
        });

        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener.clone());

        Subscription {
            registration: Some((self.shared.clone(), listener)),
        }
    }

    pub fn on_log<F>(&self, on_log: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Log, move |event| {
            if let HostEvent::Log(line) = event {
                on_log(line);
            }
        })
    }

    pub fn on_error<F>(&self, on_error: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Error, move |event| {
            if let HostEvent::Error(line) = event {
                on_error(line);
            }
        })
    }

    pub fn on_terminated<F>(&self, on_terminated: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Terminated, move |event| {
            if let HostEvent::Terminated(info) = event {
                on_terminated(info);
            }
        })
    }

    pub fn on_show_requested<F>(&self, on_show: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(EventKind::ShowRequested, move |_| on_show())
    }

    /// Delivers one host event to every live listener of its kind. Returns how many
    /// handlers ran. A listener whose handler is already running on this thread is
    /// skipped rather than re-entered.
    pub fn dispatch(&self, event: &HostEvent) -> usize {
        if !self.shared.context.is_desktop_context() {
            return 0;
        }

        let listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        listeners
            .iter()
            .filter(|listener| listener.deliver(event))
            .count()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drains the host transport on a tokio task until the channel closes.
    pub fn spawn_pump(&self) -> ProcessResult<JoinHandle<()>> {
        if !self.shared.context.is_desktop_context() {
            return Err(ProcessError::NotDesktopContext);
        }
        let Some(transport) = self.shared.transport.as_ref() else {
            self.shared.report_transport_unavailable();
            return Err(ProcessError::TransportUnavailable);
        };

        let mut receiver = transport.subscribe();
        let bridge = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        bridge.dispatch(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[event-bridge] pump lagged; skipped {skipped} host events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        log::debug!("[event-bridge] host transport closed; pump exiting");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{BroadcastEmitter, EventEmitter};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn desktop_bridge() -> (EventBridge, BroadcastEmitter) {
        let emitter = BroadcastEmitter::new();
        (
            EventBridge::new(DesktopContext::desktop(), Some(emitter.sender())),
            emitter,
        )
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&str) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move |_: &str| {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn delivers_only_to_listeners_of_the_matching_kind() {
        let (bridge, _emitter) = desktop_bridge();
        let (logs, on_log) = counter();
        let (errors, on_error) = counter();
        let _log_sub = bridge.on_log(on_log);
        let _error_sub = bridge.on_error(on_error);

        bridge.dispatch(&HostEvent::Log("listening on :8080".to_string()));
        bridge.dispatch(&HostEvent::Log("ready".to_string()));
        bridge.dispatch(&HostEvent::Error("warn".to_string()));

        assert_eq!(logs.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_handler_is_never_invoked_again() {
        let (bridge, _emitter) = desktop_bridge();
        let (count, on_log) = counter();
        let subscription = bridge.on_log(on_log);

        bridge.dispatch(&HostEvent::Log("before".to_string()));
        subscription.release();
        subscription.release();
        bridge.dispatch(&HostEvent::Log("after".to_string()));
        bridge.dispatch(&HostEvent::Log("after again".to_string()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
        assert_eq!(bridge.listener_count(EventKind::Log), 0);
    }

    #[test]
    fn independent_subscriptions_per_kind_coexist() {
        let (bridge, _emitter) = desktop_bridge();
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        let first_sub = bridge.on_terminated(on_first);
        let _second_sub = bridge.on_terminated(on_second);
        assert_eq!(bridge.listener_count(EventKind::Terminated), 2);

        first_sub.release();
        bridge.dispatch(&HostEvent::Terminated("exit status: 1".to_string()));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_desktop_context_yields_inert_subscriptions() {
        let emitter = BroadcastEmitter::new();
        let bridge = EventBridge::new(DesktopContext::browser(), Some(emitter.sender()));
        let (count, on_log) = counter();
        let subscription = bridge.on_log(on_log);

        assert!(!subscription.is_active());
        assert_eq!(bridge.dispatch(&HostEvent::Log("simulated".to_string())), 0);
        subscription.release();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.spawn_pump().unwrap_err(), ProcessError::NotDesktopContext);
    }

    #[test]
    fn missing_transport_degrades_to_inert_subscriptions() {
        let bridge = EventBridge::new(DesktopContext::desktop(), None);
        let shown = Arc::new(AtomicBool::new(false));
        let flag = shown.clone();
        let subscription = bridge.on_show_requested(move || flag.store(true, Ordering::SeqCst));

        assert!(!subscription.is_active());
        bridge.dispatch(&HostEvent::ShowRequested);
        assert!(!shown.load(Ordering::SeqCst));
        assert_eq!(bridge.spawn_pump().unwrap_err(), ProcessError::TransportUnavailable);
    }

    #[test]
    fn handler_may_release_its_own_subscription() {
        let (bridge, _emitter) = desktop_bridge();
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let handler_count = count.clone();
        let handler_slot = slot.clone();
        let subscription = bridge.on_log(move |_| {
            handler_count.fetch_add(1, Ordering::SeqCst);
            if let Some(own) = handler_slot.lock().unwrap().as_ref() {
                own.release();
            }
        });
        *slot.lock().unwrap() = Some(subscription);

        bridge.dispatch(&HostEvent::Log("once".to_string()));
        bridge.dispatch(&HostEvent::Log("twice".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_dispatching_its_own_kind_is_not_re_entered() {
        let (bridge, _emitter) = desktop_bridge();
        let (observed, on_observed) = counter();
        let _observer = bridge.on_error(on_observed);

        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = calls.clone();
        let inner = bridge.clone();
        let _echo = bridge.on_error(move |line| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            inner.dispatch(&HostEvent::Error(format!("echo: {line}")));
        });

        assert_eq!(bridge.dispatch(&HostEvent::Error("boom".to_string())), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_waits_for_an_in_flight_delivery() {
        let (bridge, _emitter) = desktop_bridge();
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let handler_finished = finished.clone();
        let entered_tx = Mutex::new(entered_tx);
        let subscription = bridge.on_log(move |_| {
            let _ = entered_tx.lock().unwrap().send(());
            std::thread::sleep(Duration::from_millis(100));
            handler_finished.store(true, Ordering::SeqCst);
        });

        let delivering = bridge.clone();
        let worker = std::thread::spawn(move || {
            delivering.dispatch(&HostEvent::Log("slow".to_string()));
        });

        entered_rx.recv().unwrap();
        subscription.release();
        assert!(finished.load(Ordering::SeqCst));
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn pump_forwards_host_events_in_emission_order() {
        let (bridge, emitter) = desktop_bridge();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = bridge.on_log(move |line| sink.lock().unwrap().push(line.to_string()));

        let pump = bridge.spawn_pump().unwrap();
        for index in 0..5 {
            emitter.emit(HostEvent::Log(format!("line {index}"))).unwrap();
        }

        for _ in 0..100 {
            if received.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pump.abort();

        assert_eq!(
            *received.lock().unwrap(),
            (0..5).map(|index| format!("line {index}")).collect::<Vec<_>>()
        );
    }
}
