use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{CommandResult, Endpoint};

/// Send fixed-format control datagrams to a device control endpoint.
///
/// Fire-and-forget: each command is sent once, given a short bounded
/// window for a response, and recorded as a `CommandResult` either way.
/// A per-command socket error is caught into that command's record and
/// never aborts the rest of the list. A fixed delay between commands
/// avoids flooding the device.
pub async fn send_commands(
    target: Endpoint,
    commands: &[Vec<u8>],
    response_wait: Duration,
    gap: Duration,
    cancel: &CancellationToken,
) -> Vec<CommandResult> {
    let mut results: Vec<CommandResult> = Vec::with_capacity(commands.len());

    let sock = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            debug!("command socket creation failed: {e}");
            // Without a socket, nothing was sent; record every command as silent.
            return commands
                .iter()
                .map(|c| CommandResult {
                    command: c.clone(),
                    endpoint: target,
                    responded: false,
                    response_payload: None,
                })
                .collect();
        }
    };

    for (i, command) in commands.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }

        let mut responded = false;
        let mut response_payload = None;

        match sock.send_to(command, (target.address, target.port)).await {
            Ok(_) => {
                let mut buf = vec![0u8; 1024];
                match time::timeout(response_wait, sock.recv_from(&mut buf)).await {
                    Ok(Ok((n, from))) => {
                        debug!("command {} drew {} bytes from {}", i + 1, n, from);
                        buf.truncate(n);
                        responded = true;
                        response_payload = Some(buf);
                    }
                    Ok(Err(e)) => {
                        // Port-unreachable style errors count as no response.
                        debug!("command {} receive failed: {e}", i + 1);
                    }
                    Err(_) => {
                        debug!("command {} got no response (normal for some commands)", i + 1);
                    }
                }
            }
            Err(e) => {
                debug!("command {} send failed: {e}", i + 1);
            }
        }

        results.push(CommandResult {
            command: command.clone(),
            endpoint: target,
            responded,
            response_payload,
        });

        if i + 1 < commands.len() {
            time::sleep(gap).await;
        }
    }

    results
}
