// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Listen-point allocation for incoming migrations.
//!
//! The operator names a transport and may leave the address and port
//! unset; the destination host fills in the blanks while preparing: an
//! ephemeral TCP port for the socket transports, a private path for the
//! unix transport. Transport validation itself happens when the request is
//! parsed into [`TransportProtocol`], before any side effect.

use std::net::TcpListener;

use apiary_api_types::{
    IncomingDescriptor, MigrationUri, TransportProtocol,
};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::migrate::MigrateError;

/// Resolves the operator's (possibly partial) transport request into the
/// concrete listen point the destination will stand up.
pub(crate) fn allocate(
    config: &MigrationConfig,
    migration_id: Uuid,
    uri: &MigrationUri,
) -> Result<IncomingDescriptor, MigrateError> {
    match uri.protocol {
        TransportProtocol::Tcp | TransportProtocol::Rdma => {
            let address = uri
                .address
                .clone()
                .unwrap_or_else(|| config.listen_ip.to_string());
            let port = match uri.port {
                Some(port) => port,
                None => ephemeral_port(&address)?,
            };
            Ok(IncomingDescriptor {
                protocol: uri.protocol,
                address: Some(address),
                port: Some(port),
            })
        }
        TransportProtocol::Unix => {
            let path = uri.address.clone().unwrap_or_else(|| {
                config
                    .socket_dir
                    .join(format!("incoming-{migration_id}.sock"))
                    .display()
                    .to_string()
            });
            Ok(IncomingDescriptor {
                protocol: TransportProtocol::Unix,
                address: Some(path),
                port: None,
            })
        }
        TransportProtocol::Fd => {
            let name = uri.address.clone().ok_or_else(|| {
                MigrateError::Listen(
                    "fd transport requires a descriptor name".to_owned(),
                )
            })?;
            Ok(IncomingDescriptor {
                protocol: TransportProtocol::Fd,
                address: Some(name),
                port: None,
            })
        }
    }
}

/// Picks a free TCP port by binding port zero and reading back the
/// kernel's choice. The port is released before the hypervisor rebinds
/// it; a lost race surfaces as a failed incoming migration.
fn ephemeral_port(address: &str) -> Result<u16, MigrateError> {
    let listener = TcpListener::bind((address, 0))
        .map_err(|e| MigrateError::Listen(format!("{address}: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| MigrateError::Listen(e.to_string()))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> MigrationConfig {
        MigrationConfig {
            listen_ip: "127.0.0.1".parse().unwrap(),
            socket_dir: std::env::temp_dir(),
            ..MigrationConfig::default()
        }
    }

    #[test]
    fn tcp_without_port_gets_an_ephemeral_one() {
        let uri = MigrationUri {
            protocol: TransportProtocol::Tcp,
            address: None,
            port: None,
        };
        let descriptor =
            allocate(&config(), Uuid::new_v4(), &uri).unwrap();
        assert_eq!(descriptor.protocol, TransportProtocol::Tcp);
        assert_eq!(descriptor.address.as_deref(), Some("127.0.0.1"));
        assert!(descriptor.port.unwrap() > 0);
    }

    #[test]
    fn explicit_endpoint_is_preserved() {
        let uri = MigrationUri {
            protocol: TransportProtocol::Tcp,
            address: Some("192.0.2.9".to_owned()),
            port: Some(4444),
        };
        let descriptor =
            allocate(&config(), Uuid::new_v4(), &uri).unwrap();
        assert_eq!(descriptor.uri(), "tcp:192.0.2.9:4444");
    }

    #[test]
    fn unix_without_path_gets_a_private_socket() {
        let uri = MigrationUri {
            protocol: TransportProtocol::Unix,
            address: None,
            port: None,
        };
        let id = Uuid::new_v4();
        let descriptor = allocate(&config(), id, &uri).unwrap();
        let path = descriptor.address.unwrap();
        assert!(path.contains(&id.to_string()));
        assert!(path.ends_with(".sock"));
    }

    #[test]
    fn fd_requires_a_name() {
        let uri = MigrationUri {
            protocol: TransportProtocol::Fd,
            address: None,
            port: None,
        };
        assert!(matches!(
            allocate(&config(), Uuid::new_v4(), &uri),
            Err(MigrateError::Listen(_))
        ));

        let named = MigrationUri {
            protocol: TransportProtocol::Fd,
            address: Some("migfd".to_owned()),
            port: None,
        };
        let descriptor =
            allocate(&config(), Uuid::new_v4(), &named).unwrap();
        assert_eq!(descriptor.uri(), "fd:migfd");
    }
}
