//! Per-connection session: handshake, command reader, outbound writer

use std::future::Future;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::player::{DeployError, Outbound, SharedPlayer};
use crate::net::protocol::{ClientCommand, ServerMsg};
use crate::util::rate_limit::CommandRateLimiter;

/// Accept connections until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, state).await;
                    });
                }
                Err(e) => {
                    // Keep accepting other connections
                    error!(error = %e, "Failed to accept connection");
                }
            },
            _ = &mut shutdown => {
                info!("Listener stopped");
                return Ok(());
            }
        }
    }
}

/// Handle one client from handshake to disconnect
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: AppState) {
    info!(peer = %peer, "New connection");

    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let conn_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel::<ServerMsg>(state.config.outbound_queue);
    let writer = tokio::spawn(write_loop(write_half, rx, peer));
    let outbound = Outbound::new(conn_id, tx);

    let Some((username, password)) = read_credentials(&mut lines, peer).await else {
        drop(outbound);
        let _ = writer.await;
        return;
    };

    let player = match state
        .registry
        .authenticate(&username, &password, outbound.clone())
        .await
    {
        Ok(player) => player,
        Err(e) => {
            warn!(peer = %peer, username = %username, error = %e, "Authentication failed");
            outbound.push(ServerMsg::AuthFailed);
            // Let the writer flush the refusal, then close
            drop(outbound);
            let _ = writer.await;
            return;
        }
    };

    state.registry.join_or_create(&player);

    run_session(&username, &player, &outbound, &mut lines).await;

    state.registry.disconnect(&username, conn_id);
    writer.abort();

    info!(peer = %peer, username = %username, "Connection closed");
}

/// Username line then password line
async fn read_credentials(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    peer: SocketAddr,
) -> Option<(String, String)> {
    let username = handshake_line(lines, peer).await?;
    let password = handshake_line(lines, peer).await?;
    Some((username, password))
}

async fn handshake_line(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    peer: SocketAddr,
) -> Option<String> {
    match lines.next_line().await {
        Ok(Some(line)) => Some(line.trim().to_string()),
        Ok(None) => {
            debug!(peer = %peer, "Closed during handshake");
            None
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Handshake read failed");
            None
        }
    }
}

/// Reader loop: client lines -> commands
async fn run_session(
    username: &str,
    player: &SharedPlayer,
    outbound: &Outbound,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) {
    let rate_limiter = CommandRateLimiter::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(username, "Player disconnected");
                break;
            }
            Err(e) => {
                warn!(username, error = %e, "Connection read failed");
                break;
            }
        };

        if !rate_limiter.check() {
            warn!(username, "Rate limited command line");
            continue;
        }

        match ClientCommand::parse(&line) {
            Ok(command) => handle_command(username, player, outbound, command),
            Err(e) => {
                warn!(username, error = %e, line = %line.trim(), "Ignoring client line");
            }
        }
    }
}

/// Apply one command. Rejections go to the requesting connection only.
pub fn handle_command(
    username: &str,
    player: &SharedPlayer,
    outbound: &Outbound,
    command: ClientCommand,
) {
    match command {
        ClientCommand::Deploy { troop } => {
            let result = player.lock().deploy(&troop);
            match result {
                Ok(mana_left) => {
                    info!(username, troop = %troop, mana_left, "Deploying troop");
                }
                Err(e) => {
                    if let DeployError::NotEnoughMana { cost, available, .. } = &e {
                        debug!(username, cost, available, "Deploy rejected");
                    } else {
                        debug!(username, error = %e, "Deploy rejected");
                    }
                    outbound.push(ServerMsg::Notice(e.to_string()));
                }
            }
        }
    }
}

/// Writer loop: outbound queue -> socket
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ServerMsg>,
    peer: SocketAddr,
) {
    while let Some(msg) = rx.recv().await {
        let mut line = match msg.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to encode message");
                continue;
            }
        };
        line.push('\n');

        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            debug!(peer = %peer, error = %e, "Socket write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
