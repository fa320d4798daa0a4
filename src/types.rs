use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// マルチチャンネル入力のモノラル化ポリシー
///
/// 入力デバイスが複数チャンネルを持つ場合に、どのように
/// 1チャンネルへ落とすかを指定する。
///
/// # Examples
///
/// ```
/// # use mic_transcribe::types::MixdownPolicy;
/// let policy = MixdownPolicy::ChannelZero; // 先頭チャンネルのみ使用
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MixdownPolicy {
    /// チャンネル0のみを使用する
    ///
    /// リファレンスデバイス構成と同じ挙動。他チャンネルは読み捨てる。
    ChannelZero,

    /// 全チャンネルの平均を取る
    Average,
}

/// オーディオフレーム
///
/// 固定サイズのオーディオ量子1つぶんのPCMサンプル。
/// CaptureSource だけが生成し、StreamSession がちょうど1回消費する。
/// 生成後に変更されることはない（チャンネル経由で所有権ごと移動する）。
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// PCM音声サンプルの配列
    pub samples: Vec<SampleI16>,

    /// 単調増加するシーケンス番号（0始まり）
    pub sequence_number: u64,

    /// このフレームの取得タイムスタンプ (ナノ秒)
    ///
    /// UNIX_EPOCHからの経過時間
    pub captured_at_ns: u128,
}

/// ストリーミングセッションの状態
///
/// 1つのキャプチャコンテキストにつき、`Connecting`/`Streaming` の
/// セッションは同時に1つまで。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// 未開始
    Idle,

    /// 接続中（トークン取得〜ハンドシェイク待ち）
    Connecting,

    /// ストリーミング中
    Streaming,

    /// 停止処理中（キュー済みフレームのフラッシュと終了ハンドシェイク）
    Draining,

    /// 正常終了（終端状態）
    Closed,

    /// 回復不能なエラーで終了（終端状態）
    Errored,
}

impl SessionState {
    /// 終端状態かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }
}

/// 文字起こしセグメント
///
/// リモートサービスから受信した発話区間1つぶんの文字起こし。
/// `is_final` が true になったセグメントのテキストは以後変更されない。
///
/// # JSON出力例
///
/// ```json
/// {
///   "id": "seg-1200",
///   "text": "こちら本部、応答願います",
///   "is_final": true,
///   "confidence": 0.94,
///   "start_offset_ms": 1200,
///   "end_offset_ms": 2900
/// }
/// ```
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TranscriptSegment {
    /// セグメント識別子
    pub id: String,

    /// 文字起こしテキスト
    pub text: String,

    /// 確定結果かどうか
    ///
    /// false: 部分結果（後続の更新で置き換わる）, true: 確定結果
    pub is_final: bool,

    /// 信頼度 [0.0, 1.0]
    pub confidence: f32,

    /// 音声ストリーム先頭からの開始オフセット (ミリ秒)
    pub start_offset_ms: u64,

    /// 音声ストリーム先頭からの終了オフセット (ミリ秒)
    pub end_offset_ms: u64,
}

/// セッションメトリクス
///
/// セッションのライフサイクルごとにリセットされるプロセスローカルな
/// カウンタ。観測用途のみで、制御ロジックからは参照しない。
/// 複数のコンテキストから更新されるためアトミックにしてある。
#[derive(Debug, Default)]
pub struct SessionMetrics {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    reconnect_count: AtomicU64,
}

/// メトリクスのスナップショット
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub reconnect_count: u64,
}

impl SessionMetrics {
    /// フレーム送信を記録
    pub fn record_frame(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 再接続を記録
    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 現在値のスナップショットを取得
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }

    /// セッション開始時のリセット
    pub fn reset(&self) {
        self.frames_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.reconnect_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_creation() {
        let frame = AudioFrame {
            samples: vec![0i16; 128],
            sequence_number: 42,
            captured_at_ns: 1_000_000_000,
        };
        assert_eq!(frame.samples.len(), 128);
        assert_eq!(frame.sequence_number, 42);
        assert_eq!(frame.captured_at_ns, 1_000_000_000);
    }

    #[test]
    fn test_mixdown_policy_serialization() {
        let policy = MixdownPolicy::ChannelZero;
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#""channel_zero""#);

        let deserialized: MixdownPolicy = serde_json::from_str(r#""average""#).unwrap();
        assert_eq!(deserialized, MixdownPolicy::Average);
    }

    #[test]
    fn test_session_state_terminal() {
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
        assert!(!SessionState::Streaming.is_terminal());
        assert!(!SessionState::Draining.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Errored.is_terminal());
    }

    #[test]
    fn test_transcript_segment_json_serialization() {
        let segment = TranscriptSegment {
            id: "seg-1200".to_string(),
            text: "こんにちは".to_string(),
            is_final: true,
            confidence: 0.94,
            start_offset_ms: 1200,
            end_offset_ms: 2900,
        };

        let json = serde_json::to_string(&segment).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["id"], "seg-1200");
        assert_eq!(parsed["text"], "こんにちは");
        assert_eq!(parsed["is_final"], true);
        assert_eq!(parsed["start_offset_ms"], 1200);
        assert_eq!(parsed["end_offset_ms"], 2900);
    }

    #[test]
    fn test_metrics_counters() {
        let metrics = SessionMetrics::default();
        metrics.record_frame(256);
        metrics.record_frame(256);
        metrics.record_reconnect();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 512);
        assert_eq!(snapshot.reconnect_count, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 0);
        assert_eq!(snapshot.bytes_sent, 0);
        assert_eq!(snapshot.reconnect_count, 0);
    }
}
