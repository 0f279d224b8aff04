//! Service registry: which handler answers which DIMSE command

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::association::Association;
use crate::command::DimseMessage;
use crate::transport::DimseChannel;
use crate::types::CommandField;
use crate::{DimseError, Result};

/// Per-association facts handed to every handler invocation
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub association: Association,
    /// Our own AE title
    pub ae_title: String,
}

impl ServiceContext {
    pub fn new(association: Association, ae_title: impl Into<String>) -> Self {
        Self {
            association,
            ae_title: ae_title.into(),
        }
    }

    /// Transfer syntax negotiated for a presentation context
    pub fn transfer_syntax(&self, presentation_context_id: u8) -> Result<&str> {
        self.association
            .context(presentation_context_id)
            .map(|pc| pc.transfer_syntax.as_str())
            .ok_or(DimseError::UnknownPresentationContext(presentation_context_id))
    }

    pub fn abstract_syntax(&self, presentation_context_id: u8) -> Result<&str> {
        self.association
            .context(presentation_context_id)
            .map(|pc| pc.abstract_syntax.as_str())
            .ok_or(DimseError::UnknownPresentationContext(presentation_context_id))
    }
}

/// Behaviour bound to one DIMSE request command
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Request command this handler answers
    fn command(&self) -> CommandField;

    /// Process one request, sending every response on `channel`.
    ///
    /// Errors returned here are transport or protocol failures; service
    /// failures are reported to the peer as DIMSE statuses instead.
    async fn handle(
        &self,
        ctx: &ServiceContext,
        request: DimseMessage,
        channel: &mut dyn DimseChannel,
    ) -> Result<()>;
}

/// Immutable command to handler map shared by all associations
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    handlers: HashMap<CommandField, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::default()
    }

    pub fn get(&self, command: CommandField) -> Option<&Arc<dyn ServiceHandler>> {
        self.handlers.get(&command)
    }

    pub fn contains(&self, command: CommandField) -> bool {
        self.handlers.contains_key(&command)
    }

    pub fn commands(&self) -> Vec<CommandField> {
        let mut commands: Vec<CommandField> = self.handlers.keys().copied().collect();
        commands.sort_by_key(|c| c.code());
        commands
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("commands", &self.commands())
            .finish()
    }
}

/// Collects handlers before the registry is frozen
#[derive(Default)]
pub struct ServiceRegistryBuilder {
    handlers: HashMap<CommandField, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistryBuilder {
    /// Register a handler; fails if its command already has one
    pub fn register<H>(self, handler: H) -> Result<Self>
    where
        H: ServiceHandler + 'static,
    {
        self.register_shared(Arc::new(handler))
    }

    pub fn register_shared(mut self, handler: Arc<dyn ServiceHandler>) -> Result<Self> {
        let command = handler.command();
        if command.is_response() || command == CommandField::CCancelRq {
            return Err(DimseError::config(format!(
                "{} cannot be bound to a service handler",
                command
            )));
        }
        if self.handlers.contains_key(&command) {
            return Err(DimseError::DuplicateHandler(command));
        }
        self.handlers.insert(command, handler);
        Ok(self)
    }

    pub fn build(self) -> ServiceRegistry {
        ServiceRegistry {
            handlers: self.handlers,
        }
    }
}
