//! The manager-side stream listener workers connect to.
//!
//! One TCP connection per worker. The first frame must be a handshake; a
//! controller is built around the stream's outbound channel, registered with
//! the attack service and torn back down -- with the recovery timer armed --
//! on any exit path.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{BufReader, BufWriter},
    net::TcpListener,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{core::Operation, proto, wire};

use super::{node::NodeController, service::AttackService};

/// Configuration of the stream listener.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address workers dial, host:port.
    pub listen_addr: String,
    /// Capacity of each node's pending-operation queue.
    pub op_queue_capacity: usize,
    /// Seconds between re-emissions of an unacknowledged operation.
    pub retry_interval_sec: u64,
}

/// Errors produced by [`Server`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The listen address could not be bound.
    #[error("failed to bind stream listener to {addr}: {source}")]
    Bind {
        /// The configured address.
        addr: String,
        /// The bind error.
        #[source]
        source: std::io::Error,
    },
    /// Accepting a connection failed unrecoverably.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The stream listener.
#[derive(Debug)]
pub struct Server {
    service: AttackService,
    config: Config,
}

impl Server {
    /// Create a listener registering nodes with `service`.
    #[must_use]
    pub fn new(service: AttackService, config: Config) -> Self {
        Self { service, config }
    }

    /// Accept worker connections until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        info!(addr = %self.config.listen_addr, "stream listener up");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping stream listener");
                    return Ok(());
                }
                incoming = listener.accept() => {
                    let (stream, peer) = match incoming {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!(%peer, "accepted node connection");

                    let service = self.service.clone();
                    let config = self.config.clone();
                    let stream_cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        handle_stream(service, config, stream, stream_cancel).await;
                    });
                }
            }
        }
    }
}

async fn handle_stream(
    service: AttackService,
    config: Config,
    stream: tokio::net::TcpStream,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // The stream must open with a handshake.
    let handshake = match wire::read_frame::<proto::AttackRequest, _>(&mut reader).await {
        Ok(Some(proto::AttackRequest {
            request: Some(proto::attack_request::Request::Handshake(handshake)),
        })) => handshake,
        Ok(Some(_)) => {
            error!("connection cannot be established: first message is not a handshake");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            error!("error receiving initial request: {e}");
            return;
        }
    };

    let scenarios = handshake
        .scenarios
        .into_iter()
        .map(|scenario| (scenario.name.clone(), wire::scenario_to_core(scenario)))
        .collect();

    let (ops_tx, mut ops_rx) = mpsc::channel::<Operation>(1);
    let controller = Arc::new(NodeController::new(
        handshake.node_name,
        scenarios,
        ops_tx,
        config.op_queue_capacity,
        Duration::from_secs(config.retry_interval_sec),
    ));
    Arc::clone(&controller).start(cancel.clone());

    if let Err(e) = service.add_node(Arc::clone(&controller)).await {
        error!(node = %controller.name(), "error registering node: {e}");
        cancel.cancel();
        return;
    }
    info!(node = %controller.name(), "node registered");

    let receiver_cancel = cancel.clone();
    let receiver_controller = Arc::clone(&controller);
    let receiver = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = receiver_cancel.cancelled() => break,
                frame = wire::read_frame::<proto::AttackRequest, _>(&mut reader) => match frame {
                    Ok(Some(proto::AttackRequest {
                        request: Some(proto::attack_request::Request::Acknowledge(_)),
                    })) => receiver_controller.ack_operation(),
                    Ok(Some(_)) => {
                        error!("protocol error: expected an acknowledge");
                        break;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("error receiving request: {e}");
                        break;
                    }
                }
            }
        }
        receiver_cancel.cancel();
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            op = ops_rx.recv() => {
                let Some(op) = op else { break };
                let response = wire::response_from_operation(&op);
                if let Err(e) = wire::write_frame(&mut writer, &response).await {
                    error!("error sending response: {e}");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let _ = receiver.await;

    service.remove_node(&controller).await;
    info!(node = %controller.name(), "node deregistered, recovery timer armed");
}
