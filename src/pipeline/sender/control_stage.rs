//! Read side of the sender's connection
//!
//! The receiver may only ever say `Stop`; anything else it sends is logged
//! and ignored.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::net::PacketReader;
use crate::net::protocol::{ControlMessage, Role};
use crate::pipeline::PipelineStage;
use crate::pipeline::session::SessionEvent;
use crate::pipeline::types::MediaKind;

pub struct ControlStage<R> {
    reader: Option<PacketReader<R>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin + Send + Sync + 'static> ControlStage<R> {
    pub fn new(
        reader: PacketReader<R>,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader: Some(reader),
            events,
            cancel,
        }
    }

    async fn listen(&mut self, reader: &mut PacketReader<R>) -> Result<(), StreamError> {
        let mut ignored = 0u64;
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                packet = reader.next_packet() => packet?,
            };
            let Some(packet) = packet else {
                return Err(StreamError::transport("receiver closed the connection"));
            };

            if packet.header.kind != MediaKind::Control {
                ignored += 1;
                if ignored % 30 == 1 {
                    warn!(
                        "ControlStage: ignoring {} packet from receiver",
                        packet.header.kind
                    );
                }
                continue;
            }

            let msg = match ControlMessage::decode(packet.header.sequence, &packet.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("ControlStage: {}", e);
                    continue;
                }
            };
            if !msg.may_originate_from(Role::Receiver) {
                warn!("ControlStage: receiver may not send {:?}, ignored", msg);
                continue;
            }

            info!("ControlStage: receiver asked to stop");
            let _ = self.events.send(SessionEvent::PeerStop);
            return Ok(());
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + Sync + 'static> PipelineStage for ControlStage<R> {
    async fn run(&mut self) -> Result<()> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input connection"))?;
        info!("ControlStage: started");
        let result = self.listen(&mut reader).await;
        info!("ControlStage: finished");
        result.map_err(Into::into)
    }

    fn name(&self) -> &'static str {
        "ControlStage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::PacketWriter;
    use crate::pipeline::types::Timestamp;
    use std::time::Duration;

    #[tokio::test]
    async fn test_only_stop_is_honoured() {
        let (a, b) = tokio::io::duplex(4096);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut stage = ControlStage::new(
            PacketReader::new(b, 1 << 20, 4),
            events_tx,
            CancellationToken::new(),
        );

        let mut writer = PacketWriter::new(a, Duration::from_secs(1));
        let ts = Timestamp::from_micros(0);
        let quality = ControlMessage::SetQuality { level: 10 }.encode();
        writer.send(MediaKind::Control, 0, ts, &quality).await.unwrap();
        writer.send(MediaKind::Control, 1, ts, &ControlMessage::Pause.encode()).await.unwrap();
        writer.send(MediaKind::Control, 2, ts, &ControlMessage::Stop.encode()).await.unwrap();

        stage.run().await.unwrap();
        assert!(matches!(events_rx.try_recv(), Ok(SessionEvent::PeerStop)));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hangup_is_transport_error() {
        let (a, b) = tokio::io::duplex(4096);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut stage = ControlStage::new(
            PacketReader::new(b, 1 << 20, 4),
            events_tx,
            CancellationToken::new(),
        );
        drop(a);
        let err = stage.run().await.unwrap_err();
        assert_eq!(
            crate::error::stream_cause(&err).map(|e| e.kind()),
            Some("TransportError")
        );
    }
}
