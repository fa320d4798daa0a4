use serde::{Deserialize, Serialize};

/// 文字起こしサービスとのワイヤメッセージ定義
///
/// 受信側はすべて `type` フィールドで判別されるタグ付きJSON。
/// 送信側は生のバイナリPCMフレームと、終了要求の制御メッセージのみ。

// =============================================================================
// 受信メッセージ (サービス → クライアント)
// =============================================================================

/// セッション確立通知
///
/// 接続がサービス側で受理されたときに最初に届く。
/// これを受け取るまでセッションは Streaming にならない。
#[derive(Debug, Clone, Deserialize)]
pub struct BeginMessage {
    /// セッション識別子
    pub id: String,
    /// セッション期限 (Unixエポック秒)
    #[serde(default)]
    pub expires_at: i64,
}

/// 文字起こし結果
///
/// 1つの発話区間（セグメント）に対する部分結果または確定結果。
/// `id` が省略された場合は開始オフセットから識別子を導出する。
#[derive(Debug, Clone, Deserialize)]
pub struct TurnMessage {
    /// セグメント識別子（省略されることがある）
    #[serde(default)]
    pub id: Option<String>,
    /// 文字起こしテキスト
    pub transcript: String,
    /// 確定結果かどうか
    pub end_of_turn: bool,
    /// 信頼度 [0.0, 1.0]
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// 音声ストリーム先頭からの開始オフセット (ミリ秒)
    #[serde(default)]
    pub audio_start_ms: u64,
    /// 音声ストリーム先頭からの終了オフセット (ミリ秒)
    #[serde(default)]
    pub audio_end_ms: u64,
}

/// セッション終了通知
#[derive(Debug, Clone, Deserialize)]
pub struct TerminationMessage {
    /// 処理された音声の長さ (ミリ秒)
    #[serde(default)]
    pub audio_duration_ms: u64,
}

/// サービスからのエラー通知
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMessage {
    /// エラーコード ("invalid_token" など)
    #[serde(default)]
    pub code: Option<String>,
    /// エラー内容
    pub error: String,
}

impl ErrorMessage {
    /// 認証系の（リトライで解決しない）エラーかどうか
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("invalid_token") | Some("token_expired") | Some("authentication_failed")
        )
    }
}

// =============================================================================
// 送信メッセージ (クライアント → サービス)
// =============================================================================

/// 終了要求
///
/// Draining 中に送る制御メッセージ。サービスは残りの確定結果を
/// 流し切ったあと Termination を返す。
#[derive(Debug, Clone, Serialize)]
pub struct TerminateMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
}

impl Default for TerminateMessage {
    fn default() -> Self {
        Self {
            message_type: "Terminate",
        }
    }
}

// =============================================================================
// パース
// =============================================================================

/// 受信メッセージの判別結果
#[derive(Debug)]
pub enum ServiceMessage {
    /// セッション確立
    Begin(BeginMessage),
    /// 文字起こし結果
    Turn(TurnMessage),
    /// セッション終了
    Termination(TerminationMessage),
    /// エラー通知
    Error(ErrorMessage),
    /// 未知のメッセージ種別（前方互換のため読み捨てる）
    Unknown(String),
}

impl ServiceMessage {
    /// 受信テキストを種別ごとの型にパースする
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        // 先に type フィールドだけ覗く
        #[derive(Deserialize)]
        struct TypePeek {
            #[serde(rename = "type")]
            message_type: String,
        }

        let peek: TypePeek = serde_json::from_str(text)?;

        match peek.message_type.as_str() {
            "Begin" => Ok(ServiceMessage::Begin(serde_json::from_str(text)?)),
            "Turn" => Ok(ServiceMessage::Turn(serde_json::from_str(text)?)),
            "Termination" => Ok(ServiceMessage::Termination(serde_json::from_str(text)?)),
            "Error" => Ok(ServiceMessage::Error(serde_json::from_str(text)?)),
            _ => Ok(ServiceMessage::Unknown(text.to_string())),
        }
    }
}

fn default_confidence() -> f32 {
    1.0
}

/// ストリーミング接続のURLを組み立てる
///
/// トークンとサンプルレートを接続パラメータとしてクエリに載せる。
pub fn build_stream_url(
    endpoint: &str,
    token: &str,
    sample_rate: u32,
    language: Option<&str>,
) -> String {
    let mut url = format!("{}?sample_rate={}&token={}", endpoint, sample_rate, token);
    if let Some(lang) = language {
        url.push_str("&language=");
        url.push_str(lang);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_begin_message() {
        let json = r#"{"type":"Begin","id":"sess-123","expires_at":1704067200}"#;
        let msg = ServiceMessage::parse(json).unwrap();

        match msg {
            ServiceMessage::Begin(begin) => {
                assert_eq!(begin.id, "sess-123");
                assert_eq!(begin.expires_at, 1704067200);
            }
            _ => panic!("Begin を期待した"),
        }
    }

    #[test]
    fn test_parse_turn_message() {
        let json = r#"{
            "type": "Turn",
            "id": "seg-a",
            "transcript": "こちら本部",
            "end_of_turn": true,
            "confidence": 0.93,
            "audio_start_ms": 1200,
            "audio_end_ms": 2900
        }"#;

        let msg = ServiceMessage::parse(json).unwrap();

        match msg {
            ServiceMessage::Turn(turn) => {
                assert_eq!(turn.id.as_deref(), Some("seg-a"));
                assert_eq!(turn.transcript, "こちら本部");
                assert!(turn.end_of_turn);
                assert!((turn.confidence - 0.93).abs() < f32::EPSILON);
                assert_eq!(turn.audio_start_ms, 1200);
                assert_eq!(turn.audio_end_ms, 2900);
            }
            _ => panic!("Turn を期待した"),
        }
    }

    #[test]
    fn test_parse_turn_message_without_optional_fields() {
        // id と confidence が省略されたメッセージ
        let json = r#"{"type":"Turn","transcript":"hello","end_of_turn":false}"#;
        let msg = ServiceMessage::parse(json).unwrap();

        match msg {
            ServiceMessage::Turn(turn) => {
                assert!(turn.id.is_none());
                assert!((turn.confidence - 1.0).abs() < f32::EPSILON);
                assert_eq!(turn.audio_start_ms, 0);
            }
            _ => panic!("Turn を期待した"),
        }
    }

    #[test]
    fn test_parse_termination_message() {
        let json = r#"{"type":"Termination","audio_duration_ms":5000}"#;
        let msg = ServiceMessage::parse(json).unwrap();

        match msg {
            ServiceMessage::Termination(term) => {
                assert_eq!(term.audio_duration_ms, 5000);
            }
            _ => panic!("Termination を期待した"),
        }
    }

    #[test]
    fn test_parse_error_message_auth() {
        let json = r#"{"type":"Error","code":"invalid_token","error":"token is invalid"}"#;
        let msg = ServiceMessage::parse(json).unwrap();

        match msg {
            ServiceMessage::Error(err) => {
                assert!(err.is_auth_error());
                assert_eq!(err.error, "token is invalid");
            }
            _ => panic!("Error を期待した"),
        }
    }

    #[test]
    fn test_parse_error_message_non_auth() {
        let json = r#"{"type":"Error","code":"rate_limit","error":"slow down"}"#;
        let msg = ServiceMessage::parse(json).unwrap();

        match msg {
            ServiceMessage::Error(err) => assert!(!err.is_auth_error()),
            _ => panic!("Error を期待した"),
        }
    }

    #[test]
    fn test_parse_unknown_message() {
        let json = r#"{"type":"FutureMessageType","data":"something"}"#;
        let msg = ServiceMessage::parse(json).unwrap();
        assert!(matches!(msg, ServiceMessage::Unknown(_)));
    }

    #[test]
    fn test_parse_invalid_json_is_error() {
        assert!(ServiceMessage::parse("not json").is_err());
    }

    #[test]
    fn test_terminate_message_serialization() {
        let msg = TerminateMessage::default();
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Terminate"}"#);
    }

    #[test]
    fn test_build_stream_url() {
        let url = build_stream_url("wss://example.test/listen", "tok123", 48000, None);
        assert_eq!(url, "wss://example.test/listen?sample_rate=48000&token=tok123");

        let url = build_stream_url("wss://example.test/listen", "tok123", 16000, Some("ja"));
        assert!(url.ends_with("&language=ja"));
        assert!(url.contains("sample_rate=16000"));
    }
}
