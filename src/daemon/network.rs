//! Network plumbing for sessions: per-run networks, attachment of the
//! engine's own container and labeled cleanup.

use std::collections::HashMap;

use bollard::errors::Error as BollardError;
use bollard::models::Network;
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, ListNetworksOptions,
};
use tracing::{debug, info};

use super::{is_not_found, DaemonClient};
use crate::error::Result;

fn is_conflict(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

impl DaemonClient {
    /// Creates a bridge network with the given labels. An already
    /// existing network of the same name is fine; the network is always
    /// tracked by name, never by the daemon-assigned id.
    pub async fn ensure_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            labels,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => info!("Created network {}", name),
            Err(e) if is_conflict(&e) => debug!("Network {} already exists", name),
            Err(e) => return Err(e.into()),
        }
        Ok(name.to_string())
    }

    pub async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            ..Default::default()
        };
        self.docker.connect_network(network, options).await?;
        debug!("Connected {} to network {}", container, network);
        Ok(())
    }

    pub async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> Result<()> {
        let options = DisconnectNetworkOptions {
            container: container.to_string(),
            force,
        };
        match self.docker.disconnect_network(network, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_network(&self, name: &str) -> Result<()> {
        match self.docker.remove_network(name).await {
            Ok(()) => {
                info!("Removed network {}", name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_networks_by_label(&self, key: &str, value: &str) -> Result<Vec<Network>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{key}={value}")]);
        let options = ListNetworksOptions { filters };
        Ok(self.docker.list_networks(Some(options)).await?)
    }

    /// Name of the first network a container is attached to, used to
    /// join the engine's own network when containerized.
    pub async fn network_of_container(&self, id: &str) -> Result<Option<String>> {
        let inspect = self.inspect_container(id).await?;
        Ok(inspect
            .and_then(|i| i.network_settings)
            .and_then(|s| s.networks)
            .and_then(|networks| networks.keys().next().cloned()))
    }
}
