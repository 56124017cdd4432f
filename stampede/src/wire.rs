//! Framing and mapping for the node-manager stream.
//!
//! Messages travel as a u32 length prefix followed by the prost-encoded
//! payload. The mapping functions translate between the committed wire
//! structs in [`crate::proto`] and the core types in [`crate::core`].

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{core, proto};

/// Upper bound on a single frame. A handshake listing every scenario of a
/// large worker stays well below this.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Errors produced by the framing layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer sent bytes that do not decode as the expected message.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    /// A frame exceeded [`MAX_FRAME_BYTES`].
    #[error("frame of {0} bytes exceeds the frame limit")]
    Oversized(usize),
}

/// Read one length-prefixed message from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream, that is when the peer closes
/// before the next length prefix.
///
/// # Errors
///
/// Returns an error on transport failure, an oversized frame or a payload
/// that does not decode.
pub async fn read_frame<M, R>(reader: &mut R) -> Result<Option<M>, Error>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    if len > MAX_FRAME_BYTES {
        return Err(Error::Oversized(len));
    }

    let mut buf = vec![0_u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(Some(M::decode(buf.as_slice())?))
}

/// Write one length-prefixed message to `writer` and flush it.
///
/// # Errors
///
/// Returns an error on transport failure or an oversized message.
pub async fn write_frame<M, W>(writer: &mut W, message: &M) -> Result<(), Error>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let len = message.encoded_len();
    if len > MAX_FRAME_BYTES {
        return Err(Error::Oversized(len));
    }

    let mut buf = Vec::with_capacity(len);
    message
        .encode(&mut buf)
        .expect("vec write is infallible at reserved capacity");

    writer.write_u32(len as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;

    Ok(())
}

/// Translate an outbound operation into its wire form.
#[must_use]
pub fn response_from_operation(op: &core::Operation) -> proto::AttackResponse {
    let response = match op {
        core::Operation::Start(start) => {
            proto::attack_response::Response::Start(proto::OperationStart {
                id: start.id.clone(),
                attack_id: start.attack_id,
                increment_id: start.increment_id,
                wait_time_sec: start.wait_time_sec as f32,
                scenarios: start.scenarios.clone(),
            })
        }
        core::Operation::Stop(stop) => {
            proto::attack_response::Response::Stop(proto::OperationStop {
                attack_id: stop.attack_id,
                increment_id: stop.increment_id,
            })
        }
        core::Operation::Kill => proto::attack_response::Response::Kill(proto::OperationKill {}),
    };

    proto::AttackResponse {
        response: Some(response),
    }
}

/// Translate a wire start command into core form.
#[must_use]
pub fn start_to_core(start: proto::OperationStart) -> core::OperationStart {
    core::OperationStart {
        id: start.id,
        attack_id: start.attack_id,
        increment_id: start.increment_id,
        wait_time_sec: f64::from(start.wait_time_sec),
        scenarios: start.scenarios,
    }
}

/// Translate a wire stop command into core form.
#[must_use]
pub fn stop_to_core(stop: proto::OperationStop) -> core::OperationStop {
    core::OperationStop {
        attack_id: stop.attack_id,
        increment_id: stop.increment_id,
    }
}

/// Translate an advertised scenario into core form.
#[must_use]
pub fn scenario_to_core(scenario: proto::Scenario) -> core::ScenarioDetails {
    core::ScenarioDetails {
        name: scenario.name,
        description: scenario.description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_frame_survives_the_wire() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = proto::AttackRequest {
            request: Some(proto::attack_request::Request::Handshake(proto::Handshake {
                node_name: "n1".to_string(),
                scenarios: vec![proto::Scenario {
                    name: "test_http".to_string(),
                    description: "test http".to_string(),
                }],
            })),
        };
        write_frame(&mut client, &sent).await.expect("write frame");

        let received: proto::AttackRequest = read_frame(&mut server)
            .await
            .expect("read frame")
            .expect("frame present");
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let got: Option<proto::AttackRequest> =
            read_frame(&mut server).await.expect("clean eof");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_u32(u32::MAX)
            .await
            .expect("write length prefix");

        let got: Result<Option<proto::AttackRequest>, Error> = read_frame(&mut server).await;
        assert!(matches!(got, Err(Error::Oversized(_))));
    }

    #[test]
    fn operation_round_trips_through_wire_form() {
        let op = core::Operation::Start(core::OperationStart {
            id: "op-1".to_string(),
            attack_id: 3,
            increment_id: 1,
            wait_time_sec: 1.5,
            scenarios: [("http".to_string(), 4)].into_iter().collect(),
        });

        let wire = response_from_operation(&op);
        let Some(proto::attack_response::Response::Start(start)) = wire.response else {
            panic!("expected start payload");
        };
        let back = start_to_core(start);

        let core::Operation::Start(orig) = op else {
            unreachable!()
        };
        assert_eq!(back, orig);
    }
}
