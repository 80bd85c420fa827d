use log::info;
use once_cell::sync::OnceCell;
use std::sync::Arc;

use crate::config::VertexSettings;
use crate::error::TryOnError;
use crate::vertex::{Recontext, VertexClient};

type SettingsFn = dyn Fn() -> Result<VertexSettings, TryOnError> + Send + Sync;
type ConnectFn = dyn Fn(VertexSettings) -> Result<Arc<dyn Recontext>, TryOnError> + Send + Sync;

/// Owns the remote client. Built on first use and shared afterwards; a
/// failed attempt leaves the slot empty so the next request retries.
pub struct ClientSlot {
    settings: Box<SettingsFn>,
    connect: Box<ConnectFn>,
    cell: OnceCell<Arc<dyn Recontext>>,
}

impl ClientSlot {
    pub fn new<S, C>(settings: S, connect: C) -> Self
    where
        S: Fn() -> Result<VertexSettings, TryOnError> + Send + Sync + 'static,
        C: Fn(VertexSettings) -> Result<Arc<dyn Recontext>, TryOnError> + Send + Sync + 'static,
    {
        ClientSlot {
            settings: Box::new(settings),
            connect: Box::new(connect),
            cell: OnceCell::new(),
        }
    }

    /// Vertex AI with ambient credentials, configured from the environment.
    pub fn from_env() -> Self {
        Self::new(VertexSettings::from_env, |settings| {
            let client: Arc<dyn Recontext> = Arc::new(VertexClient::connect(settings)?);
            Ok(client)
        })
    }

    pub fn get(&self) -> Result<Arc<dyn Recontext>, TryOnError> {
        self.cell
            .get_or_try_init(|| {
                let settings = (self.settings)()?;
                let (project, location) = (settings.project.clone(), settings.location.clone());
                let client = (self.connect)(settings)?;
                info!(
                    "Gen AI client initialized for project: {}, location: {}",
                    project, location
                );
                Ok(client)
            })
            .cloned()
    }
}
