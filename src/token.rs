use crate::config::TokenConfig;
use crate::error::TranscribeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// 短命のストリーミング用トークン
///
/// 長期シークレットと引き換えに発行される、1セッションスコープの
/// 認証情報。`issued_at + ttl` を過ぎたトークンをリモートサービスへ
/// 提示してはならない。
#[derive(Clone)]
pub struct TranscriptionToken {
    pub value: String,
    issued_at: Instant,
    ttl: Duration,
}

impl TranscriptionToken {
    pub fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            issued_at: Instant::now(),
            ttl,
        }
    }

    /// 発行時刻を取得
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// `margin` 以内に期限切れになるかどうか
    ///
    /// セッションはこの判定が true になる前に新しいトークンで
    /// 再接続しておく必要がある。
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.issued_at.elapsed() + margin >= self.ttl
    }

    /// 先回り再接続の期限
    ///
    /// この時点を過ぎる前にセッションを張り替える。
    pub fn refresh_deadline(&self, margin: Duration) -> Instant {
        self.issued_at + self.ttl.saturating_sub(margin)
    }
}

// トークン値はログに出さない
impl fmt::Debug for TranscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscriptionToken")
            .field("value", &format!("<{}バイト>", self.value.len()))
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// トークン供給元の共通トレイト
///
/// StreamSession は再接続のたびにここから新しいトークンを取得する。
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<TranscriptionToken, TranscribeError>;
}

#[derive(Serialize)]
struct TokenRequest {
    expires_in: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

/// トークン発行エンドポイントへの仲介クライアント
///
/// 環境変数から読んだシークレットを Authorization ヘッダに載せて
/// 1回のPOSTを発行する。シークレットはこのコンポーネントの外へ出ない。
/// リトライはしない（リトライ方針は呼び出し側が持つ）。
pub struct TokenBroker {
    config: TokenConfig,
    client: reqwest::Client,
}

impl TokenBroker {
    pub fn new(config: TokenConfig) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| TranscribeError::Config(format!("HTTPクライアント作成失敗: {}", e)))?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl TokenSource for TokenBroker {
    async fn fetch_token(&self) -> Result<TranscriptionToken, TranscribeError> {
        let secret = std::env::var(&self.config.api_key_env).map_err(|_| {
            TranscribeError::Config(format!(
                "環境変数 {} が設定されていません",
                self.config.api_key_env
            ))
        })?;

        let request = TokenRequest {
            expires_in: self.config.ttl_seconds,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", secret)
            .json(&request)
            .send()
            .await
            .map_err(|e| TranscribeError::Network(format!("トークン発行リクエスト失敗: {}", e)))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let value = parse_token_response(status, &body)?;

        log::debug!("トークンを取得しました (TTL {} 秒)", self.config.ttl_seconds);

        Ok(TranscriptionToken::new(
            value,
            Duration::from_secs(self.config.ttl_seconds),
        ))
    }
}

/// トークンエンドポイントのレスポンスを検証してトークン文字列を取り出す
fn parse_token_response(status: u16, body: &str) -> Result<String, TranscribeError> {
    if !(200..300).contains(&status) {
        return Err(TranscribeError::Upstream {
            status,
            body: body.to_string(),
        });
    }

    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| TranscribeError::Protocol(format!("トークンレスポンスのパース失敗: {}", e)))?;

    match parsed.token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(TranscribeError::Protocol(
            "レスポンスに token フィールドがありません".to_string(),
        )),
    }
}
