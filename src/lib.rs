//! mic-transcribe - マイク音声のリアルタイムストリーミング文字起こし
//!
//! このクレートは、マイクから取得した音声をリアルタイムに
//! リモートの文字起こしサービスへストリーミングし、
//! 部分/確定の文字起こし結果を順序の安定したセグメント列として
//! 提供します。
//!
//! # 主な機能
//!
//! - **リアルタイムキャプチャ**: オーディオコールバック上で固定サイズの
//!   量子ごとにPCMエンコード（ブロックしない・割り当てを増やさない）
//! - **短命トークン認証**: 長期シークレットを60秒のトークンに交換し、
//!   期限前に先回りして接続を張り替え
//! - **再接続**: 予期しない切断はジッタ付き指数バックオフで回復
//! - **結果の整合**: 部分結果の上書き・確定結果の不変性・
//!   時間オフセット順の出力を保証
//!
//! # アーキテクチャ
//!
//! ```text
//! [Microphone] → [CaptureSource] → (有界フレームチャンネル)
//!                                         ↓
//!                 [TokenBroker] → [StreamSession] ⇄ リモートサービス
//!                                         ↓
//!                              [TranscriptReconciler]
//!                                         ↓
//!                                  [セグメント出力]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use mic_transcribe::config::Config;
//! use mic_transcribe::transcriber::Transcriber;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load_or_default("config.toml")?;
//! let mut transcriber = Transcriber::new(config);
//!
//! let mut segments = transcriber.start().await?;
//! while let Some(segment) = segments.recv().await {
//!     println!("{}: {}", segment.id, segment.text);
//! }
//!
//! transcriber.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod audio_input;
pub mod config;
pub mod error;
pub mod pcm;
pub mod protocol;
pub mod reconciler;
pub mod reconnect;
pub mod stream_session;
pub mod token;
pub mod transcriber;
pub mod types;
