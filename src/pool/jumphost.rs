//! Jumphost tunneling for the connection pool — reuses one connection to
//! the jumphost, opens a `direct-tcpip` channel to the target through it,
//! and performs a fresh SSH handshake over that tunneled stream.
//!
//! Grounded on `ssh/connection_registry.rs::establish_tunneled_connection`.

use std::sync::Arc;
use std::time::Duration;

use russh::keys::key::PrivateKeyWithHashAlg;

use crate::ssh::{spawn_handle_owner_task, AuthMethod, ClientHandler, HandleController, SshConfig, SshError};

pub async fn connect_through_jumphost(
    jumphost: &HandleController,
    target_config: &SshConfig,
) -> Result<HandleController, SshError> {
    let channel = jumphost
        .open_direct_tcpip(&target_config.host, target_config.port as u32, "127.0.0.1", 0)
        .await?;

    let stream = channel.into_stream();

    let ssh_config = russh::client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler::with_trust(
        target_config.host.clone(),
        target_config.port,
        target_config.strict_host_key_checking,
        target_config.trust_host_key,
    );

    let mut handle = tokio::time::timeout(
        Duration::from_secs(target_config.timeout_secs),
        russh::client::connect_stream(Arc::new(ssh_config), stream, handler),
    )
    .await
    .map_err(|_| SshError::Timeout("Tunneled connection timed out".to_string()))?
    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

    let authenticated = match &target_config.auth {
        AuthMethod::Password { password } => {
            handle
                .authenticate_password(&target_config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        AuthMethod::Key { key_path, passphrase } => {
            let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                .map_err(|e| SshError::KeyError(e.to_string()))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&target_config.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        AuthMethod::Agent => {
            return Err(SshError::AuthenticationFailed(
                "agent authentication is not supported over a jumphost tunnel".to_string(),
            ))
        }
        AuthMethod::Certificate {
            key_path,
            cert_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                .map_err(|e| SshError::KeyError(e.to_string()))?;
            let cert = russh::keys::load_openssh_certificate(cert_path)
                .map_err(|e| SshError::CertificateParseError(e.to_string()))?;
            handle
                .authenticate_openssh_cert(&target_config.username, Arc::new(key), cert)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(
            "authentication rejected by target host".to_string(),
        ));
    }

    Ok(spawn_handle_owner_task(
        handle,
        format!("{}@{}:{} (tunneled)", target_config.username, target_config.host, target_config.port),
    ))
}
