use crate::config::{StreamConfig, TokenConfig};
use crate::error::TranscribeError;
use crate::pcm;
use crate::protocol::{self, ServiceMessage, TerminateMessage};
use crate::reconnect::ReconnectPolicy;
use crate::token::{TokenSource, TranscriptionToken};
use crate::types::{AudioFrame, SessionMetrics, SessionState};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// セッションの接続パラメータ
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub endpoint: String,
    pub sample_rate: u32,
    pub language: Option<String>,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub idle_timeout: Duration,
    pub refresh_margin: Duration,
}

impl SessionParams {
    pub fn from_config(stream: &StreamConfig, token: &TokenConfig, sample_rate: u32) -> Self {
        Self {
            endpoint: stream.endpoint.clone(),
            sample_rate,
            language: stream.language.clone(),
            connect_timeout: Duration::from_secs(stream.connect_timeout_seconds),
            drain_timeout: Duration::from_secs(stream.drain_timeout_seconds),
            idle_timeout: Duration::from_secs(stream.idle_timeout_seconds),
            refresh_margin: Duration::from_secs(token.refresh_margin_seconds),
        }
    }
}

/// 文字起こしサービスとのストリーミングセッション
///
/// ちょうど1本の双方向WebSocket接続を所有する状態機械。
///
/// ```text
/// Idle --start--> Connecting --Begin受信--> Streaming
/// Streaming --切断--> Connecting (バックオフ付き再接続、回数有限)
/// Streaming --トークン期限接近--> Connecting (新トークンで張り替え)
/// Streaming --stop--> Draining --フラッシュ+終了応答|タイムアウト--> Closed
/// Connecting --リトライ枯渇--> Errored --> Closed
/// ```
///
/// 接続への書き込みはセッションタスクだけが行う（単一ライタ）。
/// トークンのTTL(60秒)はキャプチャ時間より短いことがあるため、
/// 期限のマージン前に新しいトークンで先回り再接続する。
/// このトランスポートはセッション途中の再認証を持たないので、
/// 張り替えの瞬間にわずかな空白が生じるのは仕様上の割り切り。
pub struct StreamSession {
    params: SessionParams,
    policy: ReconnectPolicy,
    tokens: Arc<dyn TokenSource>,
    metrics: Arc<SessionMetrics>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StreamSession {
    pub fn new(
        params: SessionParams,
        policy: ReconnectPolicy,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Self {
            params,
            policy,
            tokens,
            metrics: Arc::new(SessionMetrics::default()),
            state_tx: Arc::new(state_tx),
            state_rx,
            stop_tx: None,
            task: None,
        }
    }

    /// 状態の購読チャンネルを取得
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// 現在の状態
    pub fn current_state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// メトリクスを取得
    pub fn metrics(&self) -> Arc<SessionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// セッションを開始
    ///
    /// `frame_rx` から取り出したフレームを到着順にバイナリ送信し、
    /// 受信メッセージを `msg_tx` へ流す。回復不能なエラーは
    /// `fatal_tx` へちょうど1回だけ報告される。
    ///
    /// 最初のトークン取得はここで行うため、認証情報の欠落は
    /// この時点で `Config` エラーとして即座に返る。
    pub async fn start(
        &mut self,
        frame_rx: mpsc::Receiver<AudioFrame>,
        msg_tx: mpsc::Sender<ServiceMessage>,
        fatal_tx: oneshot::Sender<TranscribeError>,
    ) -> Result<(), TranscribeError> {
        if self.current_state() != SessionState::Idle {
            return Err(TranscribeError::Config(
                "セッションは既に開始されています".to_string(),
            ));
        }

        self.metrics.reset();

        // 最初のトークン取得。設定不備はここで確定させる
        let initial_token = match self.tokens.fetch_token().await {
            Ok(token) => Some(token),
            Err(e) if e.is_fatal() => {
                self.state_tx.send_replace(SessionState::Errored);
                return Err(e);
            }
            Err(e) => {
                log::warn!("初回トークン取得に失敗（接続時に再試行）: {}", e);
                None
            }
        };

        // 二重開始の判定が競合しないよう、spawn前に Connecting へ遷移する
        self.state_tx.send_replace(SessionState::Connecting);

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        let mut task = SessionTask {
            params: self.params.clone(),
            policy: self.policy.clone(),
            tokens: Arc::clone(&self.tokens),
            metrics: Arc::clone(&self.metrics),
            state: Arc::clone(&self.state_tx),
            frame_rx,
            msg_tx,
        };

        self.task = Some(tokio::spawn(async move {
            task.run(stop_rx, fatal_tx, initial_token).await;
        }));

        Ok(())
    }

    /// セッションを停止
    ///
    /// どの状態から呼んでも安全で、冪等。Draining を経て必ず Closed で
    /// 終わる。終了応答の待機は drain タイムアウトで打ち切られる。
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            // drainタイムアウト + 余裕ぶんだけ待って、それでも残るなら打ち切る
            let grace = self.params.drain_timeout + Duration::from_secs(2);
            if timeout(grace, &mut task).await.is_err() {
                log::warn!("セッションタスクが終了しないため中断します");
                task.abort();
            }
        }

        if self.current_state() != SessionState::Closed {
            self.state_tx.send_replace(SessionState::Closed);
        }
    }
}

/// ストリーミングループの1接続ぶんの結末
enum LoopOutcome {
    /// stop() された、または生成側が終了した（drain済み・Closed設定済み）
    Stopped,
    /// 回復不能
    Fatal(TranscribeError),
    /// 再接続する。`count_failure` が false の場合（トークン張り替え）は
    /// リトライ回数を消費しない
    Reconnect { reason: String, count_failure: bool },
}

struct SessionTask {
    params: SessionParams,
    policy: ReconnectPolicy,
    tokens: Arc<dyn TokenSource>,
    metrics: Arc<SessionMetrics>,
    state: Arc<watch::Sender<SessionState>>,
    frame_rx: mpsc::Receiver<AudioFrame>,
    msg_tx: mpsc::Sender<ServiceMessage>,
}

impl SessionTask {
    async fn run(
        &mut self,
        mut stop_rx: oneshot::Receiver<()>,
        fatal_tx: oneshot::Sender<TranscribeError>,
        mut initial_token: Option<TranscriptionToken>,
    ) {
        let mut fatal_tx = Some(fatal_tx);
        let mut failures: u32 = 0;
        let mut first_connect = true;

        loop {
            self.state.send_replace(SessionState::Connecting);
            if !first_connect {
                self.metrics.record_reconnect();
            }
            first_connect = false;

            let outcome = self
                .connect_and_stream(&mut stop_rx, initial_token.take(), &mut failures)
                .await;

            match outcome {
                LoopOutcome::Stopped => return,
                LoopOutcome::Fatal(err) => {
                    Self::report_fatal(&self.state, &mut fatal_tx, err);
                    return;
                }
                LoopOutcome::Reconnect {
                    reason,
                    count_failure,
                } => {
                    if count_failure {
                        failures += 1;
                        if !self.policy.should_retry(failures) {
                            Self::report_fatal(
                                &self.state,
                                &mut fatal_tx,
                                TranscribeError::Network(format!(
                                    "再接続の上限 ({} 回) に達しました: {}",
                                    self.policy.max_attempts(),
                                    reason
                                )),
                            );
                            return;
                        }

                        let delay = self.policy.calculate_delay(failures);
                        log::warn!(
                            "接続断: {} ({} 回目)。{:?} 後に再接続します",
                            reason,
                            failures,
                            delay
                        );

                        tokio::select! {
                            _ = &mut stop_rx => {
                                self.state.send_replace(SessionState::Closed);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        log::info!("{}", reason);
                    }
                }
            }
        }
    }

    /// 1本の接続を確立してストリーミングする
    async fn connect_and_stream(
        &mut self,
        stop_rx: &mut oneshot::Receiver<()>,
        initial_token: Option<TranscriptionToken>,
        failures: &mut u32,
    ) -> LoopOutcome {
        // トークンを用意する。持ち越し分は期限に余裕がある場合のみ使う
        let token = match initial_token {
            Some(token) if !token.expires_within(self.params.refresh_margin) => token,
            _ => match self.tokens.fetch_token().await {
                Ok(token) => token,
                Err(e) if e.is_fatal() => return LoopOutcome::Fatal(e),
                Err(e) => {
                    return LoopOutcome::Reconnect {
                        reason: format!("トークン取得失敗: {}", e),
                        count_failure: true,
                    };
                }
            },
        };

        let url = protocol::build_stream_url(
            &self.params.endpoint,
            &token.value,
            self.params.sample_rate,
            self.params.language.as_deref(),
        );

        let ws = match timeout(self.params.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                return LoopOutcome::Reconnect {
                    reason: format!("接続失敗: {}", e),
                    count_failure: true,
                };
            }
            Err(_) => {
                return LoopOutcome::Reconnect {
                    reason: "接続タイムアウト".to_string(),
                    count_failure: true,
                };
            }
        };

        let (mut ws_sink, mut ws_source) = ws.split();

        // サービス側の受理応答を待ってから Streaming とみなす
        let begin = match wait_for_begin(&mut ws_source, self.params.connect_timeout).await {
            Ok(begin) => begin,
            Err(e) if e.is_fatal() => return LoopOutcome::Fatal(e),
            Err(e) => {
                return LoopOutcome::Reconnect {
                    reason: format!("ハンドシェイク失敗: {}", e),
                    count_failure: true,
                };
            }
        };

        *failures = 0;
        self.state.send_replace(SessionState::Streaming);
        log::info!("ストリーミングを開始しました (セッション {})", begin.id);

        // トークン期限のマージン前に張り替える
        let refresh = tokio::time::sleep_until(token.refresh_deadline(self.params.refresh_margin));
        tokio::pin!(refresh);

        loop {
            tokio::select! {
                _ = &mut *stop_rx => {
                    self.drain(&mut ws_sink, &mut ws_source).await;
                    self.state.send_replace(SessionState::Closed);
                    return LoopOutcome::Stopped;
                }

                _ = &mut refresh => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    return LoopOutcome::Reconnect {
                        reason: "トークン期限が近いため新しいトークンで再接続します".to_string(),
                        count_failure: false,
                    };
                }

                maybe_frame = self.frame_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => {
                            let bytes = Bytes::from(pcm::frame_bytes(&frame.samples));
                            let len = bytes.len();
                            if let Err(e) = ws_sink.send(Message::Binary(bytes)).await {
                                return LoopOutcome::Reconnect {
                                    reason: format!("フレーム送信失敗: {}", e),
                                    count_failure: true,
                                };
                            }
                            self.metrics.record_frame(len);
                        }
                        None => {
                            // 生成側が終了。停止と同じく終了ハンドシェイクへ
                            self.drain(&mut ws_sink, &mut ws_source).await;
                            self.state.send_replace(SessionState::Closed);
                            return LoopOutcome::Stopped;
                        }
                    }
                }

                inbound = timeout(self.params.idle_timeout, ws_source.next()) => {
                    match inbound {
                        Ok(Some(Ok(message))) => {
                            match self.handle_message(message) {
                                MessageFlow::Continue => {}
                                MessageFlow::Reconnect(reason) => {
                                    return LoopOutcome::Reconnect { reason, count_failure: true };
                                }
                                MessageFlow::Fatal(err) => return LoopOutcome::Fatal(err),
                            }
                        }
                        Ok(Some(Err(e))) => {
                            return LoopOutcome::Reconnect {
                                reason: format!("WebSocketエラー: {}", e),
                                count_failure: true,
                            };
                        }
                        Ok(None) => {
                            return LoopOutcome::Reconnect {
                                reason: "サーバーが接続を閉じました".to_string(),
                                count_failure: true,
                            };
                        }
                        Err(_) => {
                            return LoopOutcome::Reconnect {
                                reason: format!(
                                    "アイドルタイムアウト ({:?} 受信なし)",
                                    self.params.idle_timeout
                                ),
                                count_failure: true,
                            };
                        }
                    }
                }
            }
        }
    }

    /// 受信メッセージ1件の処理
    fn handle_message(&self, message: Message) -> MessageFlow {
        match message {
            Message::Text(text) => match ServiceMessage::parse(&text) {
                Ok(ServiceMessage::Turn(turn)) => {
                    if self
                        .msg_tx
                        .try_send(ServiceMessage::Turn(turn))
                        .is_err()
                    {
                        log::warn!("文字起こし結果の転送に失敗（チャンネル満杯またはクローズ）");
                    }
                    MessageFlow::Continue
                }
                Ok(ServiceMessage::Begin(begin)) => {
                    log::debug!("ストリーミング中に Begin を受信: {}", begin.id);
                    MessageFlow::Continue
                }
                Ok(ServiceMessage::Termination(term)) => MessageFlow::Reconnect(format!(
                    "サービス側からセッションが終了されました ({} ms 処理済み)",
                    term.audio_duration_ms
                )),
                Ok(ServiceMessage::Error(err)) if err.is_auth_error() => MessageFlow::Fatal(
                    TranscribeError::Config(format!("認証エラー: {}", err.error)),
                ),
                Ok(ServiceMessage::Error(err)) => {
                    // 軽度のサービスエラーはこのメッセージだけ読み飛ばす
                    log::warn!("サービスエラー: {}", err.error);
                    MessageFlow::Continue
                }
                Ok(ServiceMessage::Unknown(raw)) => {
                    log::debug!("未知のメッセージ種別: {}", raw);
                    MessageFlow::Continue
                }
                Err(e) => {
                    log::warn!("メッセージのパース失敗（読み飛ばし）: {}", e);
                    MessageFlow::Continue
                }
            },
            Message::Close(frame) => {
                MessageFlow::Reconnect(format!("サーバーが接続を閉じました: {:?}", frame))
            }
            Message::Ping(_) | Message::Pong(_) => MessageFlow::Continue,
            Message::Binary(_) => {
                log::debug!("予期しないバイナリメッセージを受信");
                MessageFlow::Continue
            }
            _ => MessageFlow::Continue,
        }
    }

    /// 停止処理
    ///
    /// 新規フレームは受け付けず、キュー済みフレームをフラッシュして
    /// 終了要求を送る。終了応答かタイムアウトの早い方で接続を閉じる。
    async fn drain(&mut self, ws_sink: &mut WsSink, ws_source: &mut WsSource) {
        self.state.send_replace(SessionState::Draining);
        log::info!("停止処理を開始します");

        // キュー済みフレームのフラッシュ
        while let Ok(frame) = self.frame_rx.try_recv() {
            let bytes = Bytes::from(pcm::frame_bytes(&frame.samples));
            let len = bytes.len();
            if ws_sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
            self.metrics.record_frame(len);
        }

        // 終了要求
        if let Ok(json) = serde_json::to_string(&TerminateMessage::default()) {
            let _ = ws_sink.send(Message::Text(json.into())).await;
        }

        // 終了応答を有界で待つ。残っていた確定結果はその間も転送する
        let msg_tx = self.msg_tx.clone();
        let wait_ack = async {
            while let Some(Ok(message)) = ws_source.next().await {
                match message {
                    Message::Text(text) => match ServiceMessage::parse(&text) {
                        Ok(ServiceMessage::Termination(term)) => {
                            log::info!(
                                "終了応答を受信しました ({} ms 分を処理)",
                                term.audio_duration_ms
                            );
                            break;
                        }
                        Ok(other) => {
                            let _ = msg_tx.try_send(other);
                        }
                        Err(e) => log::warn!("終了待ち中のパース失敗: {}", e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        };

        if timeout(self.params.drain_timeout, wait_ack).await.is_err() {
            log::warn!("終了応答がタイムアウトしました。接続を閉じます");
        }

        let _ = ws_sink.send(Message::Close(None)).await;
    }

    /// 回復不能なエラーを1回だけ報告して Errored へ
    fn report_fatal(
        state: &watch::Sender<SessionState>,
        fatal_tx: &mut Option<oneshot::Sender<TranscribeError>>,
        err: TranscribeError,
    ) {
        log::error!("セッションを終了します: {}", err);
        state.send_replace(SessionState::Errored);
        if let Some(tx) = fatal_tx.take() {
            let _ = tx.send(err);
        }
    }
}

enum MessageFlow {
    Continue,
    Reconnect(String),
    Fatal(TranscribeError),
}

/// Begin メッセージを有界で待つ
async fn wait_for_begin(
    ws_source: &mut WsSource,
    connect_timeout: Duration,
) -> Result<crate::protocol::BeginMessage, TranscribeError> {
    let wait = async {
        loop {
            match ws_source.next().await {
                Some(Ok(Message::Text(text))) => match ServiceMessage::parse(&text) {
                    Ok(ServiceMessage::Begin(begin)) => return Ok(begin),
                    Ok(ServiceMessage::Error(err)) if err.is_auth_error() => {
                        return Err(TranscribeError::Config(format!(
                            "認証エラー: {}",
                            err.error
                        )));
                    }
                    Ok(ServiceMessage::Error(err)) => {
                        return Err(TranscribeError::Network(format!(
                            "接続確立前のエラー: {}",
                            err.error
                        )));
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("ハンドシェイク中のパース失敗: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TranscribeError::Network(
                        "ハンドシェイク中に接続が閉じられました".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(TranscribeError::Network(format!(
                        "ハンドシェイク中のWebSocketエラー: {}",
                        e
                    )));
                }
            }
        }
    };

    match timeout(connect_timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(TranscribeError::Network(
            "ハンドシェイク応答のタイムアウト".to_string(),
        )),
    }
}
