use crate::audio_input::CaptureSource;
use crate::config::Config;
use crate::error::TranscribeError;
use crate::protocol::ServiceMessage;
use crate::reconciler::TranscriptReconciler;
use crate::reconnect::ReconnectPolicy;
use crate::stream_session::{SessionParams, StreamSession};
use crate::token::{TokenBroker, TokenSource};
use crate::types::{MetricsSnapshot, SessionState, TranscriptSegment};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, MissedTickBehavior};

/// キャプチャから文字起こしまでの完全なパイプライン
///
/// CaptureSource → (フレームチャンネル) → StreamSession →
/// TranscriptReconciler → セグメント受信チャンネル、という配線を
/// 1つにまとめた制御面。外部にはセグメントのストリームと
/// start/stop だけを見せる。
pub struct Transcriber {
    config: Config,
    capture: Option<CaptureSource>,
    session: Option<StreamSession>,
    forward_task: Option<tokio::task::JoinHandle<()>>,
    fatal_rx: Option<oneshot::Receiver<TranscribeError>>,
}

impl Transcriber {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            capture: None,
            session: None,
            forward_task: None,
            fatal_rx: None,
        }
    }

    /// キャプチャと文字起こしを開始
    ///
    /// 確定・部分セグメントが流れてくる受信チャンネルを返す。
    /// 同時に開始できるセッションは1つだけ。
    pub async fn start(
        &mut self,
    ) -> Result<mpsc::Receiver<TranscriptSegment>, TranscribeError> {
        if self.session.is_some() {
            return Err(TranscribeError::Config(
                "キャプチャは既に開始されています".to_string(),
            ));
        }

        // マイクデバイスを確保（ネイティブレートを接続パラメータに使う）
        let mut capture = CaptureSource::new(&self.config.audio)?;
        let sample_rate = capture.sample_rate();

        let params =
            SessionParams::from_config(&self.config.stream, &self.config.token, sample_rate);
        let policy = ReconnectPolicy::new(&self.config.reconnect);
        let tokens: Arc<dyn TokenSource> =
            Arc::new(TokenBroker::new(self.config.token.clone())?);

        let mut session = StreamSession::new(params, policy, tokens);

        let (frame_tx, frame_rx) =
            mpsc::channel(self.config.audio.frame_channel_capacity.max(1));
        let (msg_tx, msg_rx) = mpsc::channel(256);
        let (segment_tx, segment_rx) = mpsc::channel(256);
        let (fatal_tx, fatal_rx) = oneshot::channel();

        session.start(frame_rx, msg_tx, fatal_tx).await?;

        if let Err(e) = capture.start(frame_tx) {
            session.stop().await;
            return Err(e);
        }

        let reconciler = TranscriptReconciler::new(Duration::from_millis(
            self.config.reconciler.reorder_window_ms,
        ));
        self.forward_task = Some(tokio::spawn(forward_transcripts(
            msg_rx,
            segment_tx,
            reconciler,
        )));

        self.capture = Some(capture);
        self.session = Some(session);
        self.fatal_rx = Some(fatal_rx);

        log::info!("文字起こしパイプラインを開始しました ({} Hz)", sample_rate);

        Ok(segment_rx)
    }

    /// キャプチャと文字起こしを停止
    ///
    /// 冪等。キャプチャを先に止めてからセッションを Draining させる。
    /// セッションが動いていた場合はそのメトリクスを返す。
    pub async fn stop(&mut self) -> Option<MetricsSnapshot> {
        // 先にマイクを止める（以後フレームは送出されない）
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }

        let mut snapshot = None;
        if let Some(mut session) = self.session.take() {
            snapshot = Some(session.metrics().snapshot());
            session.stop().await;
        }

        if let Some(mut task) = self.forward_task.take() {
            if timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }

        self.fatal_rx = None;

        if let Some(snapshot) = &snapshot {
            log::info!(
                "セッションを終了しました: 送信 {} フレーム / {} バイト, 再接続 {} 回",
                snapshot.frames_sent,
                snapshot.bytes_sent,
                snapshot.reconnect_count
            );
        }

        snapshot
    }

    /// セッション状態の購読チャンネルを取得
    pub fn state(&self) -> Option<watch::Receiver<SessionState>> {
        self.session.as_ref().map(|s| s.state())
    }

    /// 回復不能エラーの受信側を取り出す（1回だけ報告される）
    pub fn take_error_receiver(&mut self) -> Option<oneshot::Receiver<TranscribeError>> {
        self.fatal_rx.take()
    }
}

/// 受信メッセージをセグメント列へ整えて下流へ流すループ
///
/// メッセージチャンネルが閉じたら保留分を流し切って終了する。
/// 保留期限は200ms周期で確認する。
async fn forward_transcripts(
    mut msg_rx: mpsc::Receiver<ServiceMessage>,
    segment_tx: mpsc::Sender<TranscriptSegment>,
    mut reconciler: TranscriptReconciler,
) {
    let mut flush_interval = tokio::time::interval(Duration::from_millis(200));
    flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_msg = msg_rx.recv() => {
                match maybe_msg {
                    Some(ServiceMessage::Turn(turn)) => {
                        for segment in reconciler.apply(&turn, Instant::now()) {
                            if segment_tx.send(segment).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(_) => {}
                    None => {
                        // セッション終了: 保留分を受信順で流し切る
                        for segment in reconciler.flush_all() {
                            if segment_tx.send(segment).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                }
            }
            _ = flush_interval.tick() => {
                for segment in reconciler.flush_due(Instant::now()) {
                    if segment_tx.send(segment).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
