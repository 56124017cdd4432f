//! The worker-side stream client.
//!
//! Opens the long-lived stream to the manager, sends the handshake and then
//! cooperates through three tasks: a sender draining the outbound channel, a
//! receiver pumping inbound frames and the handler translating operations
//! into generator calls. Every received operation is acknowledged on
//! receipt, not on completion. A `Kill` makes the sender close the stream
//! gracefully, which in turn drains the whole pipeline.

use tokio::{
    io::{AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{core, generator::Generator, proto, wire};

/// Errors produced by [`Gateway`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The manager could not be reached.
    #[error("failed to connect to manager: {0}")]
    Connect(std::io::Error),
    /// The handshake could not be sent.
    #[error("failed to send handshake")]
    Handshake,
}

/// The worker's connection to the manager.
#[derive(Debug)]
pub struct Gateway {
    manager_addr: String,
    node_name: String,
    scenarios: Vec<core::ScenarioDetails>,
    generator: Generator,
}

impl Gateway {
    /// Create a new gateway for `node_name`, advertising `scenarios`.
    #[must_use]
    pub fn new(
        manager_addr: String,
        node_name: String,
        scenarios: Vec<core::ScenarioDetails>,
        generator: Generator,
    ) -> Self {
        Self {
            manager_addr,
            node_name,
            scenarios,
            generator,
        }
    }

    /// Run the gateway until the stream ends or `shutdown` fires. The
    /// generator is drained before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager cannot be reached or the handshake
    /// cannot be sent.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let stream = TcpStream::connect(&self.manager_addr)
            .await
            .map_err(Error::Connect)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        // A `None` on the send channel asks the sender for a graceful close.
        let (send_tx, mut send_rx) = mpsc::channel::<Option<proto::AttackRequest>>(1);
        let (recv_tx, mut recv_rx) = mpsc::channel::<proto::AttackResponse>(1);

        let stream_cancel = shutdown.child_token();

        let sender_cancel = stream_cancel.clone();
        let sender = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sender_cancel.cancelled() => return,
                    message = send_rx.recv() => match message {
                        Some(Some(request)) => {
                            if let Err(e) = wire::write_frame(&mut writer, &request).await {
                                error!("error sending request: {e}");
                                return;
                            }
                        }
                        Some(None) => {
                            if let Err(e) = writer.shutdown().await {
                                error!("error closing stream: {e}");
                            }
                            info!("stream closed, stopping sender");
                            return;
                        }
                        None => return,
                    }
                }
            }
        });

        let receiver_cancel = stream_cancel.clone();
        let receiver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = receiver_cancel.cancelled() => return,
                    frame = wire::read_frame::<proto::AttackResponse, _>(&mut reader) => match frame {
                        Ok(Some(response)) => {
                            if recv_tx.send(response).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            info!("stream ended by manager, stopping receiver");
                            return;
                        }
                        Err(e) => {
                            error!("error receiving response: {e}");
                            return;
                        }
                    }
                }
            }
        });

        let handshake = proto::AttackRequest {
            request: Some(proto::attack_request::Request::Handshake(proto::Handshake {
                node_name: self.node_name.clone(),
                scenarios: self
                    .scenarios
                    .iter()
                    .map(|scenario| proto::Scenario {
                        name: scenario.name.clone(),
                        description: scenario.description.clone(),
                    })
                    .collect(),
            })),
        };
        if send_tx.send(Some(handshake)).await.is_err() {
            stream_cancel.cancel();
            return Err(Error::Handshake);
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping handler");
                    break;
                }
                response = recv_rx.recv() => {
                    let Some(response) = response else {
                        info!("recv channel closed, stopping handler");
                        break;
                    };
                    if !self.handle(response, &send_tx).await {
                        break;
                    }
                }
            }
        }

        stream_cancel.cancel();
        let _ = tokio::join!(sender, receiver);
        self.generator.stop().await;

        Ok(())
    }

    /// Apply one inbound operation and acknowledge it. Returns `false` when
    /// the outbound channel is gone and the handler should stop.
    async fn handle(
        &self,
        response: proto::AttackResponse,
        send_tx: &mpsc::Sender<Option<proto::AttackRequest>>,
    ) -> bool {
        let ack = proto::AttackRequest {
            request: Some(proto::attack_request::Request::Acknowledge(
                proto::Acknowledge {},
            )),
        };

        match response.response {
            Some(proto::attack_response::Response::Start(start)) => {
                if let Err(e) = self.generator.start_attack(wire::start_to_core(start)).await {
                    error!("failed to start attack: {e}");
                }
                send_tx.send(Some(ack)).await.is_ok()
            }
            Some(proto::attack_response::Response::Stop(stop)) => {
                if let Err(e) = self.generator.stop_attack(wire::stop_to_core(stop)).await {
                    error!("failed to stop attack: {e}");
                }
                send_tx.send(Some(ack)).await.is_ok()
            }
            Some(proto::attack_response::Response::Kill(_)) => {
                send_tx.send(None).await.is_ok()
            }
            None => {
                warn!("dropping response with empty payload");
                true
            }
        }
    }
}
