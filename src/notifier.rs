use std::sync::Arc;

use crate::auth::{StaticTokenAuthenticator, StreamAuthenticator};
use crate::broadcast::BroadcastHub;
use crate::config::NotifierConfig;
use crate::dispatcher::WebhookDispatcher;
use crate::error::BuildError;
use crate::event_log::EventLog;
use crate::registry::WebhookRegistry;
use crate::scheduler::{Clock, Scheduler, SystemClock, TokioScheduler};
use crate::storage::{DeliveryStore, EventStore, InMemoryStorage, WebhookStore};
use crate::worker::Transport;

/// Wired-up notification subsystem.
///
/// Producers get an [`EventLog`] via [`events`](Self::events); admin code
/// talks to [`webhooks`](Self::webhooks); the live feed hangs off
/// [`hub`](Self::hub).
#[derive(Clone)]
pub struct Notifier {
    config: Arc<NotifierConfig>,
    events: EventLog,
    dispatcher: WebhookDispatcher,
    hub: BroadcastHub,
    authenticator: Arc<dyn StreamAuthenticator>,
}

impl Notifier {
    pub fn builder() -> NotifierBuilder {
        NotifierBuilder::new()
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn webhooks(&self) -> &WebhookDispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &WebhookRegistry {
        self.dispatcher.registry()
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn authenticator(&self) -> &Arc<dyn StreamAuthenticator> {
        &self.authenticator
    }

    /// Admin and live feed routes.
    #[cfg(feature = "server")]
    pub fn router(&self) -> axum::Router {
        crate::server::router(self.clone())
    }

    /// Close all live feed connections.
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}

/// Every collaborator defaults to the in-process implementation.
pub struct NotifierBuilder {
    config: NotifierConfig,
    event_store: Option<Arc<dyn EventStore>>,
    webhook_store: Option<Arc<dyn WebhookStore>>,
    delivery_store: Option<Arc<dyn DeliveryStore>>,
    transport: Option<Arc<dyn Transport>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    clock: Option<Arc<dyn Clock>>,
    authenticator: Option<Arc<dyn StreamAuthenticator>>,
}

impl Default for NotifierBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifierBuilder {
    pub fn new() -> Self {
        Self {
            config: NotifierConfig::default(),
            event_store: None,
            webhook_store: None,
            delivery_store: None,
            transport: None,
            scheduler: None,
            clock: None,
            authenticator: None,
        }
    }

    pub fn config(mut self, config: NotifierConfig) -> Self {
        self.config = config;
        self
    }

    /// Use one backend for events, webhooks and deliveries.
    pub fn storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: EventStore + WebhookStore + DeliveryStore + 'static,
    {
        self.event_store = Some(storage.clone());
        self.webhook_store = Some(storage.clone());
        self.delivery_store = Some(storage);
        self
    }

    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn webhook_store(mut self, store: Arc<dyn WebhookStore>) -> Self {
        self.webhook_store = Some(store);
        self
    }

    pub fn delivery_store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.delivery_store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn StreamAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn build(self) -> Result<Notifier, BuildError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };

        let memory = Arc::new(InMemoryStorage::new());
        let event_store = self.event_store.unwrap_or_else(|| memory.clone());
        let webhook_store = self.webhook_store.unwrap_or_else(|| memory.clone());
        let delivery_store = self.delivery_store.unwrap_or_else(|| memory.clone());

        let scheduler = self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(StaticTokenAuthenticator::new()));

        let registry = WebhookRegistry::new(webhook_store, self.config.catalog(), clock.clone());
        let dispatcher = WebhookDispatcher::new(
            self.config.dispatcher_config(),
            registry,
            delivery_store,
            transport,
            scheduler.clone(),
            clock.clone(),
        );
        let hub = BroadcastHub::new();
        let events = EventLog::new(event_store, hub.clone(), dispatcher.clone(), scheduler, clock);

        Ok(Notifier {
            config: Arc::new(self.config),
            events,
            dispatcher,
            hub,
            authenticator,
        })
    }
}

#[cfg(feature = "http")]
fn default_transport() -> Result<Arc<dyn Transport>, BuildError> {
    let transport = crate::worker::HttpTransport::new().map_err(|e| BuildError::Transport(e.to_string()))?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "http"))]
fn default_transport() -> Result<Arc<dyn Transport>, BuildError> {
    Err(BuildError::MissingTransport)
}
