//! In-process transport: a [`ClientHandle`] plays the remote participant.

use crate::error::{Result, VoxError};
use crate::frame::{
    AudioChunk, Direction, Frame, FrameData, StartParams, Transcript, TurnEnd, TurnEndReason,
};
use crate::pipeline::{Stage, StageContext, StageError};
use crate::transport::{ClientInfo, EventHandlers, Transport, TransportEventKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
enum Inbound {
    Connected(ClientInfo),
    Disconnected(ClientInfo),
    Audio(AudioChunk),
    Text(String),
}

/// Bot output delivered to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Audio(AudioChunk),
    /// A streamed fragment of the bot's reply.
    Text(String),
    /// The bot finished its reply.
    ResponseEnd,
}

type SharedReceiver = Arc<Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>>;
type SharedSender = Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>;

/// Transport whose client lives in the same process.
///
/// The input and output stages own the two halves of the connection; once
/// the session ends gracefully both are gone, so the client sees its sends
/// fail and `recv` return `None`.
pub struct LocalTransport {
    events: EventHandlers,
    inbound: SharedReceiver,
    outbound: SharedSender,
}

impl LocalTransport {
    pub fn new() -> (Self, ClientHandle) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = Self {
            events: EventHandlers::new(),
            inbound: Arc::new(Mutex::new(Some(in_rx))),
            outbound: Arc::new(Mutex::new(Some(out_tx))),
        };
        let client = ClientHandle {
            inbound: in_tx,
            outbound: out_rx,
            client: None,
            next_seq: 0,
        };
        (transport, client)
    }
}

impl Transport for LocalTransport {
    fn input(&self) -> Box<dyn Stage> {
        Box::new(LocalInputStage {
            events: self.events.clone(),
            inbound: self.inbound.clone(),
            pump: None,
        })
    }

    fn output(&self) -> Box<dyn Stage> {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Box::new(LocalOutputStage { outbound })
    }

    fn events(&self) -> &EventHandlers {
        &self.events
    }
}

/// The client side of a [`LocalTransport`].
pub struct ClientHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    client: Option<ClientInfo>,
    next_seq: u64,
}

impl ClientHandle {
    fn send(&self, message: Inbound) -> Result<()> {
        self.inbound
            .send(message)
            .map_err(|_| VoxError::Other("transport input closed".to_string()))
    }

    /// Announces the client; fires `ClientConnected` handlers.
    pub fn connect(&mut self, id: impl Into<String>) -> Result<()> {
        let client = ClientInfo { id: id.into() };
        self.client = Some(client.clone());
        self.send(Inbound::Connected(client))
    }

    /// Sends microphone audio; sequence numbers are assigned automatically.
    pub fn send_audio(&mut self, samples: Vec<i16>, sample_rate: u32) -> Result<()> {
        let chunk = AudioChunk::new(samples, sample_rate, self.next_seq);
        self.next_seq += 1;
        self.send(Inbound::Audio(chunk))
    }

    /// Sends a chunk as-is, sequence number included.
    pub fn send_audio_chunk(&mut self, chunk: AudioChunk) -> Result<()> {
        self.next_seq = self.next_seq.max(chunk.seq + 1);
        self.send(Inbound::Audio(chunk))
    }

    /// Sends a typed user turn, bypassing turn detection and STT.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Inbound::Text(text.into()))
    }

    /// Leaves the session; fires `ClientDisconnected` handlers.
    pub fn disconnect(&mut self) -> Result<()> {
        let client = self.client.take().unwrap_or_else(|| ClientInfo {
            id: "anonymous".to_string(),
        });
        self.send(Inbound::Disconnected(client))
    }

    /// Next piece of bot output; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Collects reply text up to the next `ResponseEnd`, skipping audio.
    pub async fn next_response(&mut self) -> Option<String> {
        let mut reply = String::new();
        loop {
            match self.recv().await? {
                Outbound::Text(text) => reply.push_str(&text),
                Outbound::ResponseEnd => return Some(reply),
                Outbound::Audio(_) => {}
            }
        }
    }
}

/// Checks inbound audio before it enters the pipeline.
fn check_chunk(chunk: &AudioChunk, last_seq: Option<u64>) -> Result<()> {
    if chunk.samples.is_empty() {
        return Err(VoxError::StreamIntegrity {
            stage: "LocalTransportInput".to_string(),
            message: format!("empty audio chunk #{}", chunk.seq),
        });
    }
    if let Some(last) = last_seq
        && chunk.seq <= last
    {
        return Err(VoxError::StreamIntegrity {
            stage: "LocalTransportInput".to_string(),
            message: format!("audio chunk #{} arrived after #{}", chunk.seq, last),
        });
    }
    Ok(())
}

struct LocalInputStage {
    events: EventHandlers,
    inbound: SharedReceiver,
    pump: Option<JoinHandle<()>>,
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    events: EventHandlers,
    ctx: StageContext,
) {
    let mut last_seq = None;
    loop {
        let message = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else { break };

        match message {
            Inbound::Connected(client) => {
                tracing::info!(client = %client.id, "client connected");
                events.dispatch(TransportEventKind::ClientConnected, &client);
            }
            Inbound::Disconnected(client) => {
                tracing::info!(client = %client.id, "client disconnected");
                events.dispatch(TransportEventKind::ClientDisconnected, &client);
            }
            Inbound::Audio(chunk) => match check_chunk(&chunk, last_seq) {
                Ok(()) => {
                    last_seq = Some(chunk.seq);
                    ctx.push_downstream(FrameData::InputAudio(chunk));
                }
                Err(e) => tracing::warn!(error = %e, "dropping inbound audio"),
            },
            Inbound::Text(text) => {
                tracing::debug!(%text, "typed user turn");
                ctx.push_downstream(FrameData::TranscriptFinal(Transcript::final_text(text)));
                ctx.push_downstream(FrameData::UserTurnEnded(TurnEnd {
                    reason: TurnEndReason::Text,
                    probability: None,
                    silence_ms: 0,
                }));
            }
        }
    }
    tracing::debug!("transport input pump stopped");
}

#[async_trait]
impl Stage for LocalInputStage {
    fn name(&self) -> &str {
        "LocalTransportInput"
    }

    async fn start(
        &mut self,
        _params: &StartParams,
        ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        let rx = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| StageError::Fatal("transport input already in use".to_string()))?;
        self.pump = Some(tokio::spawn(pump(rx, self.events.clone(), ctx.clone())));
        Ok(())
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        ctx.forward(frame, direction);
        Ok(())
    }

    /// Stops reading from the client, closing its side of the connection.
    async fn finish(&mut self, _ctx: &StageContext) -> std::result::Result<(), StageError> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            if let Err(e) = pump.await
                && !e.is_cancelled()
            {
                tracing::warn!(error = %e, "transport input pump failed");
            }
            tracing::debug!("client connection closed");
        }
        Ok(())
    }

    async fn cancel(&mut self, _ctx: &StageContext) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for LocalInputStage {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct LocalOutputStage {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl LocalOutputStage {
    fn deliver(&self, message: Outbound) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        if outbound.send(message).is_err() {
            tracing::trace!("client gone, output dropped");
        }
    }
}

#[async_trait]
impl Stage for LocalOutputStage {
    fn name(&self) -> &str {
        "LocalTransportOutput"
    }

    async fn start(
        &mut self,
        _params: &StartParams,
        _ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        if self.outbound.is_none() {
            return Err(StageError::Fatal("transport output already in use".to_string()));
        }
        Ok(())
    }

    async fn finish(&mut self, _ctx: &StageContext) -> std::result::Result<(), StageError> {
        self.outbound = None;
        Ok(())
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> std::result::Result<(), StageError> {
        if direction == Direction::Downstream {
            match frame.data() {
                FrameData::TtsAudio(chunk) => {
                    self.deliver(Outbound::Audio(chunk.clone()));
                    return Ok(());
                }
                FrameData::LlmText(text) => self.deliver(Outbound::Text(text.clone())),
                FrameData::LlmResponseEnd => self.deliver(Outbound::ResponseEnd),
                _ => {}
            }
        }
        ctx.forward(frame, direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use crate::pipeline::stage::test_support::Harness;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn params() -> StartParams {
        StartParams {
            audio_in_sample_rate: 16000,
            audio_out_sample_rate: 22050,
            enable_metrics: false,
            enable_usage_metrics: false,
        }
    }

    async fn drain_until(harness: &mut Harness, count: usize) -> Vec<FrameData> {
        let mut out = Vec::new();
        while out.len() < count {
            let routed = tokio::time::timeout(Duration::from_secs(1), harness.downstream.recv())
                .await
                .expect("timed out waiting for frames")
                .expect("channel closed");
            out.push(routed.frame.data().clone());
        }
        out
    }

    #[test]
    fn test_check_chunk_rejects_empty_and_out_of_order() {
        let ok = AudioChunk::new(vec![1; 10], 16000, 5);
        assert!(check_chunk(&ok, Some(4)).is_ok());
        assert!(check_chunk(&ok, None).is_ok());
        assert!(check_chunk(&ok, Some(5)).is_err());
        let empty = AudioChunk::new(Vec::new(), 16000, 6);
        assert!(matches!(
            check_chunk(&empty, Some(5)),
            Err(VoxError::StreamIntegrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_input_pushes_valid_audio_and_drops_bad_chunks() {
        let (transport, mut client) = LocalTransport::new();
        let mut stage = transport.input();
        let mut harness = Harness::new("LocalTransportInput");
        stage.start(&params(), &harness.ctx).await.unwrap();

        client.send_audio(vec![10; 160], 16000).unwrap();
        client.send_audio_chunk(AudioChunk::new(Vec::new(), 16000, 7)).unwrap();
        client.send_audio_chunk(AudioChunk::new(vec![1; 160], 16000, 0)).unwrap();
        client.send_audio(vec![20; 160], 16000).unwrap();

        let frames = drain_until(&mut harness, 2).await;
        let seqs: Vec<_> = frames
            .iter()
            .map(|f| match f {
                FrameData::InputAudio(chunk) => chunk.seq,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // seq 7 was empty, the repeated 0 was out of order
        assert_eq!(seqs, vec![0, 8]);
    }

    #[tokio::test]
    async fn test_typed_text_becomes_a_user_turn() {
        let (transport, client) = LocalTransport::new();
        let mut stage = transport.input();
        let mut harness = Harness::new("LocalTransportInput");
        stage.start(&params(), &harness.ctx).await.unwrap();

        client.send_text("Привіт").unwrap();
        let kinds: Vec<_> = drain_until(&mut harness, 2)
            .await
            .iter()
            .map(FrameData::kind)
            .collect();
        assert_eq!(kinds, vec![FrameKind::TranscriptFinal, FrameKind::UserTurnEnded]);
    }

    #[tokio::test]
    async fn test_connection_events_dispatch_to_handlers() {
        let (transport, mut client) = LocalTransport::new();
        let connected = Arc::new(AtomicUsize::new(0));
        let seen = connected.clone();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let _on_connect = transport
            .events()
            .on(TransportEventKind::ClientConnected, move |client| {
                assert_eq!(client.id, "alice");
                seen.fetch_add(1, Ordering::SeqCst);
            });
        let _on_disconnect = transport
            .events()
            .on(TransportEventKind::ClientDisconnected, move |client| {
                let _ = done_tx.send(client.id.clone());
            });

        let mut stage = transport.input();
        let harness = Harness::new("LocalTransportInput");
        stage.start(&params(), &harness.ctx).await.unwrap();

        client.connect("alice").unwrap();
        client.disconnect().unwrap();
        assert_eq!(done_rx.recv().await.as_deref(), Some("alice"));
        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_input_stage_cannot_start() {
        let (transport, _client) = LocalTransport::new();
        let harness = Harness::new("LocalTransportInput");
        let mut first = transport.input();
        let mut second = transport.input();

        first.start(&params(), &harness.ctx).await.unwrap();
        let err = second.start(&params(), &harness.ctx).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_finish_closes_client_connection() {
        let (transport, mut client) = LocalTransport::new();
        let harness = Harness::new("LocalTransport");
        let mut input = transport.input();
        let mut output = transport.output();
        input.start(&params(), &harness.ctx).await.unwrap();
        output.start(&params(), &harness.ctx).await.unwrap();
        client.connect("alice").unwrap();

        input.finish(&harness.ctx).await.unwrap();
        output.finish(&harness.ctx).await.unwrap();

        assert!(client.send_text("ще тут?").is_err());
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_second_output_stage_cannot_start() {
        let (transport, _client) = LocalTransport::new();
        let harness = Harness::new("LocalTransportOutput");
        let mut first = transport.output();
        let mut second = transport.output();

        first.start(&params(), &harness.ctx).await.unwrap();
        let err = second.start(&params(), &harness.ctx).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_output_delivers_audio_and_reply_text() {
        let (transport, mut client) = LocalTransport::new();
        let mut stage = transport.output();
        let mut harness = Harness::new("LocalTransportOutput");

        for data in [
            FrameData::LlmResponseStart,
            FrameData::TtsAudio(AudioChunk::new(vec![0; 441], 22050, 0)),
            FrameData::LlmText("Добрий ".into()),
            FrameData::LlmText("день".into()),
            FrameData::LlmResponseEnd,
        ] {
            let frame = harness.input(data);
            stage
                .process(frame, Direction::Downstream, &harness.ctx)
                .await
                .unwrap();
        }

        assert!(matches!(client.recv().await, Some(Outbound::Audio(_))));
        assert_eq!(client.next_response().await.as_deref(), Some("Добрий день"));

        // Audio is consumed, text is passed on to the assistant aggregator
        let kinds: Vec<_> = harness
            .drain_downstream()
            .iter()
            .map(FrameData::kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                FrameKind::LlmResponseStart,
                FrameKind::LlmText,
                FrameKind::LlmText,
                FrameKind::LlmResponseEnd,
            ]
        );
    }
}
