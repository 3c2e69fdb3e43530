//! Chunked upload session: connect, authenticate, solve the proof-of-work gate, stream the file
//! chunk by chunk and wait for the upload link.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, FrameTransport, FramedMessageChannel, WsTransport};
use crate::chunk::{chunk_count, effective_chunk_size, UploadSource};
use crate::config::EndpointConfig;
use crate::error::UploadError;
use crate::pow::{self, Puzzle};
use crate::progress::{ProgressEvent, ProgressReporter, ProgressSink};
use crate::protocol::{
    message_or_unknown, AuthReply, ChunkAck, PowChallenge, PowSolution, StartUpload,
    UploadAccepted, UploadComplete, AUTH_TIMEOUT, CHALLENGE_TIMEOUT, CHUNK_ACK_TIMEOUT,
    COMPLETION_TIMEOUT, OP_AUTH, OP_POW_CHALLENGE, OP_POW_SOLUTION, OP_REQUEST_NEXT_CHUNK,
    OP_START_UPLOAD, OP_UPLOAD_COMPLETE, SOLUTION_ACK_TIMEOUT,
};
use crate::token::TokenProvider;
use crate::wire::{self, UNHASHED_PLACEHOLDER};

/// Protocol progress of one session. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Authenticated,
    AwaitingChallenge,
    Solving,
    SolutionSent,
    UploadAccepted,
    Streaming,
    AwaitingCompletion,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub link: String,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub elapsed: Duration,
}

/// One upload over one socket. Created per file, never reused; the socket is closed on every exit.
pub struct ChunkedUploadSession<T> {
    /// `None` until connected.
    channel: Option<FramedMessageChannel<T>>,
    state: SessionState,
    /// State in which the session failed, for diagnostics.
    failed_in: Option<SessionState>,
    authenticated: bool,
    chunk_size: usize,
    upload_token: Option<String>,
    bytes_sent: u64,
    started: Option<Instant>,
    solver_workers: usize,
    progress: ProgressReporter,
}

impl ChunkedUploadSession<WsTransport> {
    /// Open the socket to the endpoint. Failure is a [`UploadError::Connection`].
    pub async fn open(&mut self, endpoint: &EndpointConfig) -> Result<(), UploadError> {
        info!(uri = %endpoint.socket_uri(), "connecting to socket uploader");
        self.connect_with(FramedMessageChannel::connect(endpoint)).await?;
        info!("connected to socket uploader");
        Ok(())
    }
}

impl<T: FrameTransport> ChunkedUploadSession<T> {
    /// A session with no socket yet; connect it with [`connect_with`](Self::connect_with).
    pub fn disconnected() -> Self {
        Self {
            channel: None,
            state: SessionState::Disconnected,
            failed_in: None,
            authenticated: false,
            chunk_size: 0,
            upload_token: None,
            bytes_sent: 0,
            started: None,
            solver_workers: pow::default_workers(),
            progress: ProgressReporter::new(),
        }
    }

    /// Wrap an already connected channel.
    pub fn new(channel: FramedMessageChannel<T>) -> Self {
        Self {
            channel: Some(channel),
            state: SessionState::Connected,
            ..Self::disconnected()
        }
    }

    /// Threads used for the proof-of-work search (minimum 1).
    pub fn with_solver_workers(mut self, workers: usize) -> Self {
        self.solver_workers = workers.max(1);
        self
    }

    /// `Disconnected -> Connected`, or `Failed` with a connection error.
    pub async fn connect_with<F>(&mut self, connect: F) -> Result<(), UploadError>
    where
        F: Future<Output = Result<FramedMessageChannel<T>, ChannelError>>,
    {
        if self.state != SessionState::Disconnected {
            return Err(UploadError::Protocol(format!(
                "session cannot connect from {:?}",
                self.state
            )));
        }
        match connect.await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                let err = UploadError::Connection(e);
                self.fail(&err);
                Err(err)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn failed_in(&self) -> Option<SessionState> {
        self.failed_in
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Chunk size dictated by the server; zero until accepted.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn upload_token(&self) -> Option<&str> {
        self.upload_token.as_deref()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(FramedMessageChannel::is_open)
    }

    /// Drive the whole exchange. Whatever happens, the channel is closed before this returns.
    pub async fn run(
        &mut self,
        token: &str,
        source: UploadSource,
        sink: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        if self.state != SessionState::Connected {
            return Err(UploadError::Protocol(format!(
                "session cannot start from {:?}",
                self.state
            )));
        }
        self.started = Some(Instant::now());

        let result = tokio::select! {
            result = self.drive(token, source, sink, cancel) => result,
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        };
        if let Some(channel) = self.channel.as_mut() {
            channel.close().await;
        }

        match &result {
            Ok(outcome) => {
                self.state = SessionState::Done;
                info!(link = %outcome.link, bytes = outcome.bytes_sent, "file uploaded");
            }
            Err(e) => self.fail(e),
        }
        result
    }

    fn fail(&mut self, error: &UploadError) {
        warn!(state = ?self.state, %error, "upload session failed");
        self.failed_in = Some(self.state);
        self.state = SessionState::Failed;
    }

    fn channel(&mut self) -> Result<&mut FramedMessageChannel<T>, UploadError> {
        self.channel
            .as_mut()
            .ok_or_else(|| UploadError::Protocol("session is not connected".into()))
    }

    async fn drive(
        &mut self,
        token: &str,
        source: UploadSource,
        sink: &mut dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        self.authenticate(token).await?;
        let puzzle = self.request_challenge(&source).await?;
        let nonce = self.solve(puzzle, cancel).await?;
        let accepted = self.submit_solution(nonce).await?;
        self.prepare_stream(accepted).await?;
        let chunks_sent = self.stream(source, sink).await?;
        let link = self.await_completion().await?;
        Ok(UploadOutcome {
            link,
            bytes_sent: self.bytes_sent,
            chunks_sent,
            elapsed: self.started.map(|s| s.elapsed()).unwrap_or_default(),
        })
    }

    async fn authenticate(&mut self, token: &str) -> Result<(), UploadError> {
        info!("authenticating socket uploader");
        let channel = self.channel()?;
        channel.send_operation(OP_AUTH, token).await?;
        let reply = channel
            .receive_next_operation(Some(AUTH_TIMEOUT))
            .await?
            .ok_or_else(|| UploadError::Protocol("no reply to auth".into()))?;
        let auth: AuthReply = reply.data_as();
        if !auth.success {
            return Err(UploadError::Authentication(message_or_unknown(auth.message)));
        }
        debug!(message = ?auth.message, "auth result");
        self.authenticated = true;
        self.state = SessionState::Authenticated;
        info!("socket uploader authenticated");
        Ok(())
    }

    async fn request_challenge(&mut self, source: &UploadSource) -> Result<Puzzle, UploadError> {
        let start = StartUpload {
            file_name: &source.file_name,
            file_size: source.size,
        };
        self.channel()?.send_operation(OP_START_UPLOAD, &start).await?;
        self.state = SessionState::AwaitingChallenge;
        let envelope = self
            .channel()?
            .receive_operation(OP_POW_CHALLENGE, Some(CHALLENGE_TIMEOUT))
            .await?
            .ok_or_else(|| UploadError::Protocol("no challenge received".into()))?;
        let challenge: PowChallenge = envelope.data_as();
        debug!(
            challenge = %challenge.challenge,
            difficulty = challenge.difficulty,
            "received proof-of-work challenge"
        );
        Ok(Puzzle::new(challenge.challenge, challenge.difficulty))
    }

    /// Search off the runtime while watching the idle channel; a peer close stops the search.
    async fn solve(&mut self, puzzle: Puzzle, cancel: &CancellationToken) -> Result<u64, UploadError> {
        self.state = SessionState::Solving;
        let began = Instant::now();
        let workers = self.solver_workers;
        let stop = cancel.child_token();
        let channel = self.channel()?;
        let nonce = tokio::select! {
            nonce = pow::solve_off_thread(puzzle, workers, stop.clone()) => nonce?,
            closed = channel.peer_close() => {
                stop.cancel();
                closed?;
                return Err(UploadError::Protocol("connection closed while solving".into()));
            }
        };
        debug!(nonce, elapsed = ?began.elapsed(), "solved proof-of-work");
        Ok(nonce)
    }

    async fn submit_solution(&mut self, nonce: u64) -> Result<UploadAccepted, UploadError> {
        self.channel()?
            .send_operation(OP_POW_SOLUTION, &PowSolution { nonce })
            .await?;
        self.state = SessionState::SolutionSent;
        // The server reuses `start_upload` for the post-solution acknowledgment.
        let envelope = self
            .channel()?
            .receive_operation(OP_START_UPLOAD, Some(SOLUTION_ACK_TIMEOUT))
            .await?
            .ok_or_else(|| UploadError::Protocol("no acknowledgment of solution".into()))?;
        let accepted: UploadAccepted = envelope.data_as();
        if !accepted.success {
            return Err(UploadError::UploadRejected(message_or_unknown(accepted.message)));
        }
        Ok(accepted)
    }

    async fn prepare_stream(&mut self, accepted: UploadAccepted) -> Result<(), UploadError> {
        self.state = SessionState::UploadAccepted;
        self.chunk_size = effective_chunk_size(accepted.chunk_size);
        debug!(
            message = ?accepted.message,
            chunk_size = self.chunk_size,
            "upload accepted"
        );
        if accepted.one_time_upload_token.is_empty() {
            warn!("server accepted the upload without a one-time token");
        }
        let header = wire::upload_header(&accepted.one_time_upload_token, UNHASHED_PLACEHOLDER);
        self.upload_token = Some(accepted.one_time_upload_token);
        self.channel()?.send_raw(header).await?;
        Ok(())
    }

    /// Strictly one chunk in flight: send, then wait for the server to ask for the next.
    async fn stream(
        &mut self,
        source: UploadSource,
        sink: &mut dyn ProgressSink,
    ) -> Result<u64, UploadError> {
        self.state = SessionState::Streaming;
        let declared = source.size;
        let chunk_total = chunk_count(declared, self.chunk_size);
        let mut reader = source.into_chunks(self.chunk_size);
        let mut index = 0u64;
        self.progress.record(0);

        while let Some(chunk) = reader.next_chunk().await? {
            let len = chunk.len() as u64;
            self.channel()?.send_raw(chunk).await?;
            self.bytes_sent += len;
            index += 1;

            let ack: ChunkAck = self
                .channel()?
                .receive_operation(OP_REQUEST_NEXT_CHUNK, CHUNK_ACK_TIMEOUT)
                .await?
                .ok_or_else(|| UploadError::Protocol("no chunk ack".into()))?
                .data_as();
            self.progress.record(self.bytes_sent);
            sink.on_progress(&ProgressEvent {
                chunk_index: index,
                chunk_total: chunk_total.max(index),
                bytes_sent: self.bytes_sent,
                total_received: ack.total_received,
                total_size: ack.total_size,
                percentage: ack.percentage,
                upload_speed_mbps: ack.upload_speed_mbps,
                estimated_time: ack.estimated_time_str,
                local_rate: self.progress.rate(),
            });
        }
        sink.on_stream_finished();

        if self.bytes_sent != declared {
            warn!(
                declared,
                sent = self.bytes_sent,
                "file size changed while streaming"
            );
        }
        Ok(index)
    }

    async fn await_completion(&mut self) -> Result<String, UploadError> {
        self.state = SessionState::AwaitingCompletion;
        let complete: UploadComplete = self
            .channel()?
            .receive_operation(OP_UPLOAD_COMPLETE, Some(COMPLETION_TIMEOUT))
            .await?
            .ok_or_else(|| UploadError::Protocol("no completion received".into()))?
            .data_as();
        if !complete.success {
            return Err(UploadError::UploadFailed(message_or_unknown(complete.message)));
        }
        Ok(complete.upload_link)
    }
}

/// Upload one file over a fresh socket session.
pub async fn upload_file(
    endpoint: &EndpointConfig,
    tokens: &dyn TokenProvider,
    path: &Path,
    solver_workers: usize,
    sink: &mut dyn ProgressSink,
    cancel: &CancellationToken,
) -> Result<UploadOutcome, UploadError> {
    let token = tokens.token().ok_or(UploadError::MissingToken)?;
    debug!(path = %path.display(), "uploading file via socket");
    let source = UploadSource::open(path).await?;
    let mut session = ChunkedUploadSession::<WsTransport>::disconnected().with_solver_workers(solver_workers);
    let connected = tokio::select! {
        connected = session.open(endpoint) => connected,
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
    };
    if let Err(e) = connected {
        if session.state() == SessionState::Disconnected {
            session.fail(&e);
        }
        return Err(e);
    }
    session.run(&token, source, sink, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Frame;
    use crate::memory::{self, MemoryTransport};
    use crate::progress::NoProgress;
    use serde_json::json;
    use std::io::Cursor;

    fn session() -> (ChunkedUploadSession<MemoryTransport>, MemoryTransport) {
        let (client, server) = memory::pair();
        let session = ChunkedUploadSession::new(FramedMessageChannel::new(client)).with_solver_workers(2);
        (session, server)
    }

    fn ten_bytes() -> UploadSource {
        UploadSource::from_reader("ten.bin", 10, Cursor::new((0u8..10).collect::<Vec<u8>>()))
    }

    /// Plays the server through auth and the challenge exchange; returns the submitted nonce.
    async fn serve_until_solution(server: &mut MemoryTransport, challenge: &str, difficulty: u32) -> u64 {
        let auth = server.expect_envelope().await;
        assert_eq!(auth.op, "auth");
        assert_eq!(auth.data, json!("secret"));
        server
            .send_envelope("auth_result", json!({"success": true, "message": "hi"}))
            .await;

        let start = server.expect_envelope().await;
        assert_eq!(start.op, "start_upload");
        assert_eq!(start.data, json!({"fileName": "ten.bin", "fileSize": 10}));
        server
            .send_envelope(
                "pow_challenge",
                json!({"challenge": challenge, "difficulty": difficulty}),
            )
            .await;

        let solution = server.expect_envelope().await;
        assert_eq!(solution.op, "pow_solution");
        solution.field::<u64>("nonce").expect("nonce")
    }

    #[tokio::test]
    async fn happy_path_streams_three_chunks() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            let nonce = serve_until_solution(&mut server, "abc123", 2).await;
            assert!(pow::verify(&Puzzle::new("abc123", 2), nonce));
            server
                .send_envelope(
                    "start_upload",
                    json!({"success": true, "message": "go", "oneTimeUploadToken": "ott", "chunkSize": 4}),
                )
                .await;

            assert_eq!(server.expect_binary().await, b"FILEUPLOAD_ott||no>>".to_vec());
            let mut chunks = Vec::new();
            let mut received = 0u64;
            for _ in 0..3 {
                let chunk = server.expect_binary().await;
                received += chunk.len() as u64;
                chunks.push(chunk);
                server.send_envelope("noise", json!({"ignored": true})).await;
                server
                    .send_envelope(
                        "request_next_chunk",
                        json!({
                            "totalReceived": received,
                            "totalSize": 10,
                            "percentage": received as f64 * 10.0,
                            "uploadSpeedMbps": 1.0,
                            "estimatedTimeStr": "0s"
                        }),
                    )
                    .await;
            }
            server
                .send_envelope(
                    "upload_complete",
                    json!({"success": true, "uploadLink": "https://host/x"}),
                )
                .await;
            let closes = server.count_closes().await;
            (chunks, closes)
        });

        let mut events: Vec<ProgressEvent> = Vec::new();
        let outcome = session
            .run("secret", ten_bytes(), &mut events, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.link, "https://host/x");
        assert_eq!(outcome.bytes_sent, 10);
        assert_eq!(outcome.chunks_sent, 3);
        assert_eq!(session.state(), SessionState::Done);
        assert!(session.is_authenticated());
        assert_eq!(session.chunk_size(), 4);
        assert_eq!(session.upload_token(), Some("ott"));
        assert!(!session.is_channel_open());

        assert_eq!(events.len(), 3);
        assert_eq!(events[2].total_received, 10);
        assert_eq!(events[2].chunk_index, 3);
        assert_eq!(events[2].chunk_total, 3);
        assert_eq!(events[0].bytes_sent, 4);

        drop(session);
        let (chunks, closes) = fake.await.unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunks.concat(), (0u8..10).collect::<Vec<u8>>());
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn auth_rejected_fails_and_closes_once() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            server.expect_envelope().await;
            server
                .send_envelope("auth", json!({"success": false, "message": "bad token"}))
                .await;
            server.count_closes().await
        });

        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::Authentication(m) if m == "bad token"));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.failed_in(), Some(SessionState::Connected));
        assert!(!session.is_authenticated());
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_challenge_times_out() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            server.expect_envelope().await;
            server.send_envelope("auth", json!({"success": true})).await;
            server.expect_envelope().await;
            // Chatter that is not a challenge does not extend the wait.
            server.send_envelope("status", json!({})).await;
            server.count_closes().await
        });

        let began = tokio::time::Instant::now();
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::Protocol(m) if m == "no challenge received"));
        let waited = began.elapsed();
        assert!(waited >= CHALLENGE_TIMEOUT && waited < CHALLENGE_TIMEOUT + Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.failed_in(), Some(SessionState::AwaitingChallenge));
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_auth_times_out_after_five_seconds() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move { server.count_closes().await });
        let began = tokio::time::Instant::now();
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
        let waited = began.elapsed();
        assert!(waited >= AUTH_TIMEOUT && waited < CHALLENGE_TIMEOUT);
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejected_solution() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            serve_until_solution(&mut server, "c", 1).await;
            server
                .send_envelope("start_upload", json!({"success": false, "message": "too slow"}))
                .await;
            server.count_closes().await
        });
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::UploadRejected(m) if m == "too slow"));
        assert_eq!(session.failed_in(), Some(SessionState::SolutionSent));
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_completion_passes_message_through() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            serve_until_solution(&mut server, "c", 0).await;
            // No chunkSize: the 1 MiB default swallows the whole file in one chunk.
            server
                .send_envelope("start_upload", json!({"success": true, "oneTimeUploadToken": "t"}))
                .await;
            server.expect_binary().await;
            let chunk = server.expect_binary().await;
            server
                .send_envelope("request_next_chunk", json!({"totalReceived": 10}))
                .await;
            server
                .send_envelope("upload_complete", json!({"success": false, "message": "disk full"}))
                .await;
            server.count_closes().await;
            chunk.len()
        });
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::UploadFailed(m) if m == "disk full"));
        assert_eq!(session.chunk_size(), crate::protocol::DEFAULT_CHUNK_SIZE);
        drop(session);
        assert_eq!(fake.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn peer_close_mid_stream_is_protocol_error() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            serve_until_solution(&mut server, "c", 0).await;
            server
                .send_envelope(
                    "start_upload",
                    json!({"success": true, "oneTimeUploadToken": "t", "chunkSize": 4}),
                )
                .await;
            server.expect_binary().await;
            server.expect_binary().await;
            server.send(Frame::Close).await;
            server.count_closes().await
        });
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::Protocol(m) if m == "no chunk ack"));
        assert_eq!(session.failed_in(), Some(SessionState::Streaming));
        assert_eq!(session.bytes_sent(), 4);
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_while_solving() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            server.expect_envelope().await;
            server.send_envelope("auth", json!({"success": true})).await;
            server.expect_envelope().await;
            server
                .send_envelope("pow_challenge", json!({"challenge": "c", "difficulty": 60}))
                .await;
            server.count_closes().await
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(session.failed_in(), Some(SessionState::Solving));
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn peer_close_while_solving_stops_search() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            server.expect_envelope().await;
            server.send_envelope("auth", json!({"success": true})).await;
            server.expect_envelope().await;
            server
                .send_envelope("pow_challenge", json!({"challenge": "c", "difficulty": 60}))
                .await;
            server.send_envelope("status", json!({})).await;
            server.send(Frame::Close).await;
            server.count_closes().await
        });
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            session.run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new()),
        )
        .await
        .expect("session ended")
        .unwrap_err();
        assert!(matches!(&err, UploadError::Protocol(m) if m == "connection closed while solving"));
        assert_eq!(session.failed_in(), Some(SessionState::Solving));
        assert!(!session.is_channel_open());
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_solution_ack_times_out() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            serve_until_solution(&mut server, "c", 0).await;
            server.send_envelope("status", json!({})).await;
            server.count_closes().await
        });
        let began = tokio::time::Instant::now();
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::Protocol(m) if m == "no acknowledgment of solution"));
        let waited = began.elapsed();
        assert!(waited >= SOLUTION_ACK_TIMEOUT && waited < SOLUTION_ACK_TIMEOUT + Duration::from_secs(1));
        assert_eq!(session.failed_in(), Some(SessionState::SolutionSent));
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_completion_times_out_after_thirty_seconds() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            serve_until_solution(&mut server, "c", 0).await;
            server
                .send_envelope("start_upload", json!({"success": true, "oneTimeUploadToken": "t"}))
                .await;
            server.expect_binary().await;
            server.expect_binary().await;
            server
                .send_envelope("request_next_chunk", json!({"totalReceived": 10, "totalSize": 10}))
                .await;
            server.count_closes().await
        });
        let began = tokio::time::Instant::now();
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::Protocol(m) if m == "no completion received"));
        let waited = began.elapsed();
        assert!(waited >= COMPLETION_TIMEOUT && waited < COMPLETION_TIMEOUT + Duration::from_secs(1));
        assert_eq!(session.failed_in(), Some(SessionState::AwaitingCompletion));
        assert_eq!(session.bytes_sent(), 10);
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn connect_failure_fails_from_disconnected() {
        let mut session = ChunkedUploadSession::<MemoryTransport>::disconnected();
        assert_eq!(session.state(), SessionState::Disconnected);
        let err = session
            .connect_with(async { Err(ChannelError::Connect("refused".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Connection(ChannelError::Connect(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.failed_in(), Some(SessionState::Disconnected));
        assert!(!session.is_channel_open());
        let again = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(again, UploadError::Protocol(_)));
    }

    #[tokio::test]
    async fn connect_moves_to_connected_once() {
        let (client, _server) = memory::pair();
        let mut session = ChunkedUploadSession::<MemoryTransport>::disconnected();
        session
            .connect_with(async { Ok(FramedMessageChannel::new(client)) })
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_channel_open());

        let (other, _peer) = memory::pair();
        let err = session
            .connect_with(async { Ok(FramedMessageChannel::new(other)) })
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn session_is_single_use() {
        let (mut session, mut server) = session();
        let fake = tokio::spawn(async move {
            server.expect_envelope().await;
            server.send_envelope("auth", json!({"success": false})).await;
            server.count_closes().await
        });
        let err = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(&err, UploadError::Authentication(m) if m == "Unknown error"));
        let again = session
            .run("secret", ten_bytes(), &mut NoProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(again, UploadError::Protocol(_)));
        drop(session);
        assert_eq!(fake.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upload_file_requires_token() {
        let err = upload_file(
            &EndpointConfig::default(),
            &|| -> Option<String> { None },
            Path::new("/nonexistent"),
            1,
            &mut NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UploadError::MissingToken));
    }

    #[tokio::test]
    async fn upload_file_missing_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = upload_file(
            &EndpointConfig::default(),
            &crate::token::StaticToken("t".into()),
            &dir.path().join("missing.bin"),
            1,
            &mut NoProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UploadError::Io(_)));
    }
}
