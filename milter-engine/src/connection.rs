use crate::filter::{Filter, FilterDef, FilterIo, FilterState};
use camino::Utf8Path;
use milter::{Command, MilterError, OptNeg, SocketSpec, TimeoutClass};
use std::net::SocketAddr;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, info};

/// Connects to the filter and negotiates, leaving it OPEN.
pub(crate) async fn open(filter: &mut Filter, max_payload: usize) -> Result<(), MilterError> {
    filter.set_state(FilterState::Connecting);
    let stream = connect(filter.def()).await?;
    filter.attach(stream);

    let negotiated = negotiate(filter, &OptNeg::default(), max_payload).await?;
    info!(
        filter = %filter.name(),
        version = negotiated.version,
        actions = ?negotiated.actions,
        protocol = ?negotiated.protocol,
        "filter negotiated"
    );
    filter.opened(negotiated);
    Ok(())
}

/// Opens the configured socket under the connect timeout.
pub(crate) async fn connect(def: &FilterDef) -> Result<Box<dyn FilterIo>, MilterError> {
    let deadline = def.timeouts.deadline(TimeoutClass::Connect);

    match &def.socket {
        SocketSpec::Unix(path) => {
            check_socket_path(Utf8Path::new(path)).await?;
            let stream = deadline
                .run(UnixStream::connect(path))
                .await
                .map_err(|e| connect_failure(&def.socket, e))?;
            Ok(Box::new(stream))
        }
        SocketSpec::Inet { host, port } | SocketSpec::Inet6 { host, port } => {
            let want_v6 = matches!(def.socket, SocketSpec::Inet6 { .. });
            let addrs: Vec<SocketAddr> = deadline
                .run(tokio::net::lookup_host((host.as_str(), *port)))
                .await
                .map_err(|e| connect_failure(&def.socket, e))?
                .filter(|addr| addr.is_ipv6() == want_v6)
                .collect();

            let mut last_error = None;
            for addr in addrs {
                match deadline.run(TcpStream::connect(addr)).await {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        debug!(filter = %def.name, %addr, "connected");
                        return Ok(Box::new(stream));
                    }
                    Err(MilterError::Io(e)) => {
                        debug!(filter = %def.name, %addr, error = %e, "connect attempt failed");
                        last_error = Some(e.to_string());
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(MilterError::ConnectFailure {
                address: def.socket.to_string(),
                reason: last_error.unwrap_or_else(|| "no usable address".to_string()),
            })
        }
    }
}

fn connect_failure(socket: &SocketSpec, error: MilterError) -> MilterError {
    match error {
        MilterError::Io(e) => MilterError::ConnectFailure {
            address: socket.to_string(),
            reason: e.to_string(),
        },
        other => other,
    }
}

/// Refuses anything that is not a socket, and sockets in directories
/// anyone may write to without the sticky bit.
async fn check_socket_path(path: &Utf8Path) -> Result<(), MilterError> {
    let unsafe_socket = |reason: &str| MilterError::UnsafeSocket {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let meta = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|e| MilterError::ConnectFailure {
            address: format!("unix:{}", path),
            reason: e.to_string(),
        })?;
    if !meta.file_type().is_socket() {
        return Err(unsafe_socket("not a socket"));
    }

    let dir = match path.parent() {
        Some(dir) if dir.as_str().is_empty() => Utf8Path::new("."),
        Some(dir) => dir,
        None => return Err(unsafe_socket("no parent directory")),
    };
    let mode = tokio::fs::metadata(dir).await?.permissions().mode();
    if mode & 0o002 != 0 && mode & 0o1000 == 0 {
        return Err(unsafe_socket("parent directory is world writable"));
    }
    Ok(())
}

/// Exchanges option negotiation frames and checks the filter's answer.
pub(crate) async fn negotiate(
    filter: &mut Filter,
    offer: &OptNeg,
    max_payload: usize,
) -> Result<OptNeg, MilterError> {
    filter
        .send(Command::OptNeg, &offer.encode(), max_payload)
        .await?;
    let deadline = filter.def().timeouts.deadline(TimeoutClass::Read);
    let reply = filter.receive(max_payload, deadline).await?;
    Ok(offer.accept_reply(&reply)?)
}
