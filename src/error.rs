use thiserror::Error;

/// クレート共通のエラー分類
///
/// 回復可能なエラー (`Network`, 一時的な `Upstream`) は内部でリトライされ、
/// リトライ上限に達するまで呼び出し側には伝播しない。
/// `Config` と `Device` はリトライで解決しないため即座に伝播する。
#[derive(Debug, Error)]
pub enum TranscribeError {
    /// 設定不備（認証情報の欠落など）。リトライしない。
    #[error("設定エラー: {0}")]
    Config(String),

    /// 上流サービスが失敗を返した（トークン発行・ストリーミングとも）
    #[error("上流サービスエラー (HTTP {status}): {body}")]
    Upstream { status: u16, body: String },

    /// レスポンス・メッセージが期待した形式でない
    #[error("プロトコルエラー: {0}")]
    Protocol(String),

    /// マイクデバイスが利用できない。リトライしない。
    #[error("オーディオデバイスエラー: {0}")]
    Device(String),

    /// ストリーミング中のトランスポート断。再接続パスで処理する。
    #[error("ネットワークエラー: {0}")]
    Network(String),
}

impl TranscribeError {
    /// リトライで解決し得ないエラーかどうか
    pub fn is_fatal(&self) -> bool {
        matches!(self, TranscribeError::Config(_) | TranscribeError::Device(_))
    }

    /// 再接続・リトライの対象になるエラーかどうか
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranscribeError::Network(_) | TranscribeError::Upstream { .. }
        )
    }
}
