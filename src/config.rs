use crate::types::MixdownPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// オーディオ入力設定
///
/// マイクデバイスからの入力に関する設定。サンプルレートと
/// チャンネル数はデバイスのネイティブ値をそのまま使う。
///
/// # デフォルト値
///
/// - `device_id`: "default" (システムのデフォルトデバイス)
/// - `quantum_samples`: 128 (標準のオーディオ処理ブロックサイズ)
/// - `frame_channel_capacity`: 256 フレーム
/// - `mixdown`: channel_zero
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_quantum_samples")]
    pub quantum_samples: usize,
    #[serde(default = "default_frame_channel_capacity")]
    pub frame_channel_capacity: usize,
    #[serde(default = "default_mixdown")]
    pub mixdown: MixdownPolicy,
    /// 入力候補から除外するデバイス名の正規表現
    ///
    /// 仮想デバイスや会議アプリのループバックを誤って掴まないためのもの。
    #[serde(default = "default_exclude_pattern")]
    pub exclude_pattern: String,
}

/// ストリーミング接続設定
///
/// 文字起こしサービスへのWebSocket接続に関する設定。
///
/// # デフォルト値
///
/// - `endpoint`: wss://streaming.example.com/v1/listen
/// - `connect_timeout_seconds`: 10 秒
/// - `drain_timeout_seconds`: 3 秒
/// - `idle_timeout_seconds`: 60 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_endpoint")]
    pub endpoint: String,
    /// 言語ヒント（"ja", "en" など）。省略可能
    pub language: Option<String>,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
}

/// トークン発行設定
///
/// 長期シークレットを60秒の短命トークンに交換するエンドポイントの設定。
/// シークレット自体は設定ファイルには置かず、環境変数から読む。
///
/// # デフォルト値
///
/// - `endpoint`: https://api.example.com/v1/token
/// - `api_key_env`: "TRANSCRIBE_API_KEY"
/// - `ttl_seconds`: 60 秒
/// - `refresh_margin_seconds`: 10 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// 期限のこの秒数前に先回りして再接続する
    #[serde(default = "default_refresh_margin_seconds")]
    pub refresh_margin_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

/// 再接続設定
///
/// 予期しない切断時の指数バックオフに関する設定。
///
/// # デフォルト値
///
/// - `max_attempts`: 5 回
/// - `initial_delay_ms`: 500 ms
/// - `max_delay_ms`: 10000 ms
/// - `jitter`: true
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

/// 順序整合設定
///
/// 確定セグメントの並べ替え待ち時間。
///
/// # デフォルト値
///
/// - `reorder_window_ms`: 1500 ms
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reorder_window_ms")]
    pub reorder_window_ms: u64,
}

/// 出力設定
///
/// # デフォルト値
///
/// - `log_level`: "info"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default functions
fn default_device_id() -> String {
    "default".to_string()
}

fn default_quantum_samples() -> usize {
    128
}

fn default_frame_channel_capacity() -> usize {
    256
}

fn default_mixdown() -> MixdownPolicy {
    MixdownPolicy::ChannelZero
}

fn default_exclude_pattern() -> String {
    "Background|Microsoft Teams|ZoomAudioDevice".to_string()
}

fn default_stream_endpoint() -> String {
    "wss://streaming.example.com/v1/listen".to_string()
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_drain_timeout_seconds() -> u64 {
    3
}

fn default_idle_timeout_seconds() -> u64 {
    60
}

fn default_token_endpoint() -> String {
    "https://api.example.com/v1/token".to_string()
}

fn default_api_key_env() -> String {
    "TRANSCRIBE_API_KEY".to_string()
}

fn default_ttl_seconds() -> u64 {
    60
}

fn default_refresh_margin_seconds() -> u64 {
    10
}

fn default_request_timeout_seconds() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> bool {
    true
}

fn default_reorder_window_ms() -> u64 {
    1500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            stream: StreamConfig::default(),
            token: TokenConfig::default(),
            reconnect: ReconnectConfig::default(),
            reconciler: ReconcilerConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            quantum_samples: default_quantum_samples(),
            frame_channel_capacity: default_frame_channel_capacity(),
            mixdown: default_mixdown(),
            exclude_pattern: default_exclude_pattern(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_stream_endpoint(),
            language: None,
            connect_timeout_seconds: default_connect_timeout_seconds(),
            drain_timeout_seconds: default_drain_timeout_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            endpoint: default_token_endpoint(),
            api_key_env: default_api_key_env(),
            ttl_seconds: default_ttl_seconds(),
            refresh_margin_seconds: default_refresh_margin_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reorder_window_ms: default_reorder_window_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use mic_transcribe::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.device_id, "default");
        assert_eq!(config.audio.quantum_samples, 128);
        assert_eq!(config.audio.mixdown, MixdownPolicy::ChannelZero);
        assert_eq!(config.token.ttl_seconds, 60);
        assert_eq!(config.token.refresh_margin_seconds, 10);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconciler.reorder_window_ms, 1500);
    }

    #[test]
    fn test_write_and_read_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        // デフォルト設定を書き込み
        Config::write_default(path).unwrap();

        // 読み込み
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.audio.quantum_samples, 128);
        assert_eq!(config.token.api_key_env, "TRANSCRIBE_API_KEY");
    }

    #[test]
    fn test_custom_config() {
        let toml_content = r#"
[audio]
device_id = "USB Audio CODEC"
quantum_samples = 256
frame_channel_capacity = 64
mixdown = "average"

[stream]
endpoint = "wss://example.test/listen"
language = "ja"
connect_timeout_seconds = 5
drain_timeout_seconds = 2

[token]
endpoint = "https://example.test/token"
api_key_env = "MY_SECRET"
ttl_seconds = 60
refresh_margin_seconds = 15

[reconnect]
max_attempts = 3
initial_delay_ms = 100
max_delay_ms = 2000
jitter = false

[reconciler]
reorder_window_ms = 800

[output]
log_level = "debug"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        assert_eq!(config.audio.device_id, "USB Audio CODEC");
        assert_eq!(config.audio.quantum_samples, 256);
        assert_eq!(config.audio.frame_channel_capacity, 64);
        assert_eq!(config.audio.mixdown, MixdownPolicy::Average);
        assert_eq!(config.stream.endpoint, "wss://example.test/listen");
        assert_eq!(config.stream.language.as_deref(), Some("ja"));
        assert_eq!(config.stream.connect_timeout_seconds, 5);
        assert_eq!(config.token.api_key_env, "MY_SECRET");
        assert_eq!(config.token.refresh_margin_seconds, 15);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert!(!config.reconnect.jitter);
        assert_eq!(config.reconciler.reorder_window_ms, 800);
        assert_eq!(config.output.log_level, "debug");
    }

    #[test]
    fn test_load_or_default_nonexistent() {
        let config = Config::load_or_default("nonexistent_file.toml").unwrap();
        // デフォルト設定が返されることを確認
        assert_eq!(config.audio.quantum_samples, 128);
    }

    #[test]
    fn test_partial_config() {
        // 一部の設定のみ記述した場合、残りはデフォルト値が使われる
        let toml_content = r#"
[stream]
language = "en"

[reconnect]
max_attempts = 10
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::from_file(temp_file.path()).unwrap();

        // 指定した値
        assert_eq!(config.stream.language.as_deref(), Some("en"));
        assert_eq!(config.reconnect.max_attempts, 10);

        // デフォルト値
        assert_eq!(config.audio.device_id, "default");
        assert_eq!(config.token.ttl_seconds, 60);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
    }
}
