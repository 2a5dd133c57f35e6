//! Connector-level configuration and collaborator wiring.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::listener::{ChannelListener, NoopListener};
use crate::channel::Channel;
use crate::error::ChannelError;
use crate::handler::{ErrorHandler, Server};
use crate::scheduling::{Executor, Scheduler};

/// Per-request customization hook, run before the initial dispatch.
///
/// A customizer that marks the request handled short-circuits the handler.
pub trait Customizer: Send + Sync {
    fn customize(&self, channel: &Channel) -> Result<(), ChannelError>;
}

/// Hook consulted during completion to install a protocol upgrade.
///
/// Returning true breaks out of the normal completion path, typically
/// because the upgrade preparation scheduled an error response instead.
pub trait UpgradeHandler: Send + Sync {
    fn check_and_prepare_upgrade(&self, channel: &Channel) -> bool;
}

/// Tunables shared by every channel of a connector.
#[derive(Clone)]
pub struct HttpConfig {
    /// Idle timeout applied to the endpoint while a request is in flight.
    /// The previous endpoint timeout is restored at completion.
    pub idle_timeout: Option<Duration>,
    /// Stamp a `Date:` header on responses that lack one.
    pub send_date_header: bool,
    /// Initial capacity of the output aggregation buffer.
    pub output_buffer_size: usize,
    /// Default async-context timeout when `start_async` is given none.
    pub async_timeout: Option<Duration>,
    pub customizers: Vec<Arc<dyn Customizer>>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            send_date_header: true,
            output_buffer_size: 32 * 1024,
            async_timeout: Some(Duration::from_secs(30)),
            customizers: Vec::new(),
        }
    }
}

impl fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConfig")
            .field("idle_timeout", &self.idle_timeout)
            .field("send_date_header", &self.send_date_header)
            .field("output_buffer_size", &self.output_buffer_size)
            .field("async_timeout", &self.async_timeout)
            .field("customizers", &self.customizers.len())
            .finish()
    }
}

/// One connector's worth of collaborators, shared by all its channels.
pub struct Connector {
    config: HttpConfig,
    executor: Arc<dyn Executor>,
    scheduler: Arc<dyn Scheduler>,
    server: Arc<dyn Server>,
    listener: Arc<dyn ChannelListener>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    upgrader: Option<Arc<dyn UpgradeHandler>>,
}

impl Connector {
    pub fn new(
        config: HttpConfig,
        executor: Arc<dyn Executor>,
        scheduler: Arc<dyn Scheduler>,
        server: Arc<dyn Server>,
    ) -> Self {
        Self {
            config,
            executor,
            scheduler,
            server,
            listener: Arc::new(NoopListener),
            error_handler: None,
            upgrader: None,
        }
    }

    /// Installs the combined listener notified at every exchange phase.
    pub fn with_listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    pub fn with_upgrader(mut self, upgrader: Arc<dyn UpgradeHandler>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    pub fn listener(&self) -> &Arc<dyn ChannelListener> {
        &self.listener
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }

    pub fn upgrader(&self) -> Option<&Arc<dyn UpgradeHandler>> {
        self.upgrader.as_ref()
    }
}
