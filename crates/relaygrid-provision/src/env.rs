//! The node service's environment file.

use relaygrid_core::config::ProvisionConfig;

/// Render the `.env` the node's compose project reads on start.
pub fn render_env(config: &ProvisionConfig) -> String {
    format!(
        "SSL_CLIENT_CERT_FILE={}\nSERVICE_PORT={}\nXRAY_API_PORT={}\nSERVICE_PROTOCOL=rest\n",
        config.cert_path, config.service_port, config.api_port
    )
}
