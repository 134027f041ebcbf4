//! Playback pump: forwards decoder output to a client as it arrives.

use super::DecodeStream;
use crate::protocol::ServerEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A running decode pipeline owned by a session.
///
/// The pump task owns the decoder; the session only keeps this handle so it
/// can terminate the process if the connection goes away first. Dropping the
/// handle without calling [`terminate`](Self::terminate) detaches the
/// pipeline: it keeps streaming until the decoder exits or the client
/// receiver is gone.
pub struct PlaybackPipeline {
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PlaybackPipeline {
    /// Start pumping `stream` into `outbound` as `AUDIO_STREAM_PAYLOAD` events.
    pub fn spawn(
        session_id: String,
        mut stream: Box<dyn DecodeStream>,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut chunks = 0u64;
            let mut bytes = 0u64;
            let mut detached = false;
            loop {
                tokio::select! {
                    biased;
                    kill = &mut kill_rx, if !detached => match kill {
                        Ok(()) => {
                            stream.kill().await;
                            info!(session_id = %session_id, chunks, bytes, "Playback terminated");
                            return;
                        }
                        // Handle dropped without terminate: run to natural exit
                        Err(_) => detached = true,
                    },
                    chunk = stream.next_chunk() => match chunk {
                        Some(chunk) => {
                            chunks += 1;
                            bytes += chunk.len() as u64;
                            if outbound.send(ServerEvent::audio_payload(&chunk)).is_err() {
                                // Client is gone; nobody left to play to
                                stream.kill().await;
                                debug!(session_id = %session_id, "Playback receiver dropped");
                                return;
                            }
                        }
                        None => {
                            info!(session_id = %session_id, chunks, bytes, "Playback finished");
                            return;
                        }
                    },
                }
            }
        });

        Self {
            kill_tx: Some(kill_tx),
            task,
        }
    }

    /// Whether the decoder has already stopped on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Forcefully stop the decoder (if still running) and wait for the pump to exit.
    pub async fn terminate(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            // Err only means the pump already returned
            let _ = kill_tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            debug!("Playback pump ended abnormally: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mock::MockDecodeStream;
    use base64::Engine;
    use std::sync::atomic::Ordering;

    fn decode_payload(event: ServerEvent) -> Vec<u8> {
        match event {
            ServerEvent::AudioStreamPayload { audio_chunk } => base64::engine::general_purpose::STANDARD
                .decode(audio_chunk)
                .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_forwards_every_chunk_then_stops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = MockDecodeStream::new(vec![vec![1, 2], vec![3], vec![4, 5, 6]], false);
        let killed = stream.killed_flag();

        let pipeline = PlaybackPipeline::spawn("s1".to_string(), Box::new(stream), tx);

        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(decode_payload(event));
        }
        assert_eq!(received, vec![vec![1, 2], vec![3], vec![4, 5, 6]]);
        assert!(pipeline.is_finished());
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_terminate_kills_running_decoder() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = MockDecodeStream::new(vec![vec![9; 8]], true);
        let killed = stream.killed_flag();

        let pipeline = PlaybackPipeline::spawn("s2".to_string(), Box::new(stream), tx);
        // First chunk arrives, then the decoder hangs
        let first = rx.recv().await.unwrap();
        assert_eq!(decode_payload(first), vec![9; 8]);
        assert!(!pipeline.is_finished());

        pipeline.terminate().await;
        assert!(killed.load(Ordering::SeqCst));
        // Pump dropped its sender: no more payloads
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_handle_detaches_pipeline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = MockDecodeStream::new(vec![vec![1], vec![2], vec![3]], false);
        let killed = stream.killed_flag();

        drop(PlaybackPipeline::spawn("s4".to_string(), Box::new(stream), tx));

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_terminate_after_natural_exit_is_harmless() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = MockDecodeStream::new(vec![vec![1]], false);
        let killed = stream.killed_flag();

        let pipeline = PlaybackPipeline::spawn("s3".to_string(), Box::new(stream), tx);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        pipeline.terminate().await;
        assert!(!killed.load(Ordering::SeqCst));
    }
}
