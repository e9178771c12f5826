//! Frame codec and request/acknowledge handshake.
//!
//! Wire format: `u32 length prefix (big-endian) + bincode payload`.
//! A request frame carries `(MessageHeader, VdqmRequest)`; acknowledgement,
//! reply-body, and replica frames carry their enum directly — each side of
//! an exchange knows which frame kind comes next.
//!
//! Every mutating exchange is
//! `request -> {commit|rollback} -> [body] -> peer ack`; ping and hangup
//! use a single acknowledgement.
//!
//! [`Connection`] is generic over the stream so tests can drive both ends
//! of a handshake over an in-memory duplex pipe.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use vdqm_proto::constants::{SENTINEL_ID, VDQM_MAX_FRAME};
use vdqm_proto::{
    Ack, ClientInfo, MessageHeader, ReplicaMessage, ReplyBody, VdqmError, VdqmRequest, VdqmResult,
};

/// One framed VDQM connection.
pub struct Connection<S = TcpStream> {
    stream: S,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Consume the connection and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn send_frame<T: Serialize>(&mut self, value: &T) -> VdqmResult<()> {
        let data = bincode::serialize(value).map_err(|_| VdqmError::SystemError)?;
        self.stream
            .write_u32(data.len() as u32)
            .await
            .map_err(|_| VdqmError::NetworkError)?;
        self.stream
            .write_all(&data)
            .await
            .map_err(|_| VdqmError::NetworkError)?;
        self.stream
            .flush()
            .await
            .map_err(|_| VdqmError::NetworkError)?;
        Ok(())
    }

    async fn recv_frame<T: DeserializeOwned>(&mut self) -> VdqmResult<T> {
        let len = self
            .stream
            .read_u32()
            .await
            .map_err(|_| VdqmError::ConnectionDropped)? as usize;

        if len > VDQM_MAX_FRAME {
            return Err(VdqmError::ProtocolError);
        }

        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|_| VdqmError::ConnectionDropped)?;

        bincode::deserialize(&buf).map_err(|_| VdqmError::ProtocolError)
    }

    // ---- Request frames ----

    pub async fn send_request(&mut self, req: &VdqmRequest) -> VdqmResult<()> {
        self.send_frame(&(MessageHeader::new(), req)).await
    }

    /// Receive a request frame and validate its magic.
    pub async fn recv_request(&mut self) -> VdqmResult<(MessageHeader, VdqmRequest)> {
        let (hdr, req): (MessageHeader, VdqmRequest) = self.recv_frame().await?;
        if !hdr.is_valid() {
            return Err(VdqmError::ProtocolError);
        }
        Ok((hdr, req))
    }

    // ---- Acknowledgement frames ----

    pub async fn send_ack(&mut self, ack: &Ack) -> VdqmResult<()> {
        self.send_frame(ack).await
    }

    pub async fn recv_ack(&mut self) -> VdqmResult<Ack> {
        self.recv_frame().await
    }

    // ---- Reply-body frames ----

    pub async fn send_body(&mut self, body: &ReplyBody) -> VdqmResult<()> {
        self.send_frame(body).await
    }

    pub async fn recv_body(&mut self) -> VdqmResult<ReplyBody> {
        self.recv_frame().await
    }

    // ---- Job start frames ----

    pub async fn send_client_info(&mut self, info: &ClientInfo) -> VdqmResult<()> {
        self.send_frame(info).await
    }

    pub async fn recv_client_info(&mut self) -> VdqmResult<ClientInfo> {
        self.recv_frame().await
    }

    // ---- Replica-stream frames ----

    pub async fn send_replica(&mut self, msg: &ReplicaMessage) -> VdqmResult<()> {
        self.send_frame(msg).await
    }

    pub async fn recv_replica(&mut self) -> VdqmResult<ReplicaMessage> {
        self.recv_frame().await
    }

    // ---- Client-side composite exchanges ----

    /// Full mutating exchange: send the request, wait for the server's
    /// acknowledgement, read the reply body on commit, acknowledge receipt.
    pub async fn exchange(&mut self, req: &VdqmRequest) -> VdqmResult<ReplyBody> {
        self.send_request(req).await?;
        match self.recv_ack().await? {
            Ack::Commit => {
                let body = self.recv_body().await?;
                self.send_ack(&Ack::Commit).await?;
                Ok(body)
            }
            Ack::Rollback(err) => Err(err),
            other => {
                debug!("unexpected acknowledgement {:?}", other);
                Err(VdqmError::ProtocolError)
            }
        }
    }

    /// Body-less exchange for administrative and replica-join requests:
    /// commit acknowledgement in, peer acknowledgement out.
    pub async fn exchange_no_body(&mut self, req: &VdqmRequest) -> VdqmResult<()> {
        self.send_request(req).await?;
        match self.recv_ack().await? {
            Ack::Commit => {
                self.send_ack(&Ack::Commit).await?;
                Ok(())
            }
            Ack::Rollback(err) => Err(err),
            _ => Err(VdqmError::ProtocolError),
        }
    }

    /// Enumeration exchange: stream records until the sentinel id, then
    /// acknowledge. The sentinel record itself is not returned.
    pub async fn fetch_queue(&mut self, req: &VdqmRequest) -> VdqmResult<Vec<ReplyBody>> {
        self.send_request(req).await?;
        match self.recv_ack().await? {
            Ack::Commit => {}
            Ack::Rollback(err) => return Err(err),
            _ => return Err(VdqmError::ProtocolError),
        }
        let mut records = Vec::new();
        loop {
            let body = self.recv_body().await?;
            if body.id() == SENTINEL_ID {
                break;
            }
            records.push(body);
        }
        self.send_ack(&Ack::Commit).await?;
        Ok(records)
    }

    /// Ping exchange: a single acknowledgement carrying the 0-based queue
    /// position, or the negated error code.
    pub async fn ping(&mut self, req: &VdqmRequest) -> VdqmResult<i32> {
        self.send_request(req).await?;
        match self.recv_ack().await? {
            Ack::QueuePos(pos) if pos >= 0 => Ok(pos),
            Ack::QueuePos(neg) => Err(
                VdqmError::from_code((-neg) as u32).unwrap_or(VdqmError::SystemError)
            ),
            Ack::Rollback(err) => Err(err),
            _ => Err(VdqmError::ProtocolError),
        }
    }
}
