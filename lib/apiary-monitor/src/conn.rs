// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stream plumbing shared by both monitor variants.

use std::time::Duration;

use apiary_api_types::ControlAddress;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::MonitorError;

/// Trait bounds for the byte streams a monitor connection can ride on.
pub trait MonitorConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl MonitorConn for UnixStream {}
impl MonitorConn for TcpStream {}

pub(crate) type Conn = Box<dyn MonitorConn>;

/// Opens a stream to the given control address, failing fast if the target
/// is unreachable and bounding the attempt by `connect_timeout`.
pub(crate) async fn dial(
    address: &ControlAddress,
    connect_timeout: Duration,
) -> Result<Conn, MonitorError> {
    let attempt = async {
        let conn: Conn = match address {
            ControlAddress::Unix(path) => {
                Box::new(UnixStream::connect(path).await?)
            }
            ControlAddress::Tcp(addr) => {
                Box::new(TcpStream::connect(*addr).await?)
            }
        };
        Ok::<_, std::io::Error>(conn)
    };

    match tokio::time::timeout(connect_timeout, attempt).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(MonitorError::Connect {
            endpoint: address.to_string(),
            source: e,
        }),
        Err(_) => Err(MonitorError::Connect {
            endpoint: address.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no connection within {connect_timeout:?}"),
            ),
        }),
    }
}
