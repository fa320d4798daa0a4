use crate::config::AudioConfig;
use crate::error::TranscribeError;
use crate::pcm;
use crate::types::AudioFrame;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use regex_lite::Regex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// マイクデバイスからの音声キャプチャ
///
/// キャプチャセッションの間、入力デバイスを専有する。
/// デバイスのネイティブなサンプルレートとチャンネル数で取得し、
/// 固定サイズの量子（デフォルト128サンプル）単位でエンコードして
/// 有界チャンネルへ送出する。
pub struct CaptureSource {
    device: cpal::Device,
    stream: Option<cpal::Stream>,
    sample_rate: u32,
    channels: u16,
    config: AudioConfig,
}

impl CaptureSource {
    /// 新しいCaptureSourceを作成
    pub fn new(config: &AudioConfig) -> Result<Self, TranscribeError> {
        let host = cpal::default_host();

        let exclude = Regex::new(&config.exclude_pattern).map_err(|e| {
            TranscribeError::Config(format!("除外パターンが不正です: {}", e))
        })?;

        // デバイスを取得
        let device = if config.device_id == "default" {
            host.default_input_device().ok_or_else(|| {
                TranscribeError::Device("デフォルト入力デバイスが見つかりません".to_string())
            })?
        } else {
            // デバイスIDが指定されている場合は、デバイス一覧から検索
            Self::input_devices(&exclude)?
                .into_iter()
                .find(|d| d.name().ok().as_deref() == Some(&config.device_id))
                .ok_or_else(|| {
                    TranscribeError::Device(format!(
                        "デバイスが見つかりません: {}",
                        config.device_id
                    ))
                })?
        };

        log::info!("入力デバイス: {:?}", device.name());

        // デバイスのネイティブ設定を取得
        let default_config = device.default_input_config().map_err(|e| {
            TranscribeError::Device(format!("デフォルト入力設定が取得できません: {}", e))
        })?;

        log::info!(
            "デバイス設定: {:?}, {}Hz, {}ch",
            default_config.sample_format(),
            default_config.sample_rate().0,
            default_config.channels()
        );

        Ok(Self {
            device,
            stream: None,
            sample_rate: default_config.sample_rate().0,
            channels: default_config.channels(),
            config: config.clone(),
        })
    }

    /// デバイスのネイティブサンプルレート (Hz)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// デバイスのネイティブチャンネル数
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// キャプチャを開始
    ///
    /// 量子ごとにPCMエンコードしたAudioFrameを `frame_tx` へ送出する。
    /// 送出は非ブロッキングで、チャンネルが満杯のフレームは破棄される
    /// （キャプチャを停滞させるより欠落を選ぶ）。
    pub fn start(&mut self, frame_tx: mpsc::Sender<AudioFrame>) -> Result<(), TranscribeError> {
        let default_config = self.device.default_input_config().map_err(|e| {
            TranscribeError::Device(format!("デフォルト入力設定が取得できません: {}", e))
        })?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(frame_tx)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(frame_tx)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(frame_tx)?,
            cpal::SampleFormat::I32 => self.build_stream::<i32>(frame_tx)?,
            other => {
                return Err(TranscribeError::Device(format!(
                    "サポートされていないサンプルフォーマット: {:?}",
                    other
                )));
            }
        };

        stream.play().map_err(|e| {
            TranscribeError::Device(format!("ストリームの再生開始に失敗: {}", e))
        })?;
        self.stream = Some(stream);

        log::info!("音声キャプチャを開始しました");

        Ok(())
    }

    /// ストリームを構築
    fn build_stream<T>(
        &self,
        frame_tx: mpsc::Sender<AudioFrame>,
    ) -> Result<cpal::Stream, TranscribeError>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let channels = self.channels;
        let quantum = self.config.quantum_samples.max(1);
        let mixdown = self.config.mixdown;
        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // コールバック内の状態: インターリーブ蓄積バッファとシーケンス番号
        let samples_per_quantum = quantum * channels as usize;
        let mut pending: Vec<f32> = Vec::with_capacity(samples_per_quantum * 2);
        let mut sequence: u64 = 0;

        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            // タイムスタンプは量子をまたいで共有
            let captured_at_ns = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();

            for &sample in data {
                pending.push(sample.to_float_sample().into());
            }

            // 量子サイズごとに切り出してエンコード・送出
            while pending.len() >= samples_per_quantum {
                let samples = pcm::encode_block(&pending[..samples_per_quantum], channels, mixdown);
                pending.drain(..samples_per_quantum);

                let frame = AudioFrame {
                    samples,
                    sequence_number: sequence,
                    captured_at_ns,
                };
                sequence += 1;

                push_frame(&frame_tx, frame);
            }
        };

        let error_callback = move |err| {
            log::error!("ストリームエラー: {}", err);
        };

        self.device
            .build_input_stream(&stream_config, data_callback, error_callback, None)
            .map_err(|e| TranscribeError::Device(format!("入力ストリームの構築に失敗: {}", e)))
    }

    /// キャプチャを停止
    ///
    /// 戻った後にフレームが送出されることはない。
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("音声キャプチャを停止しました");
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices(exclude_pattern: &str) -> Result<(), TranscribeError> {
        let exclude = Regex::new(exclude_pattern).map_err(|e| {
            TranscribeError::Config(format!("除外パターンが不正です: {}", e))
        })?;

        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in Self::input_devices(&exclude)?.into_iter().enumerate() {
            let name = device
                .name()
                .map_err(|e| TranscribeError::Device(format!("デバイス名の取得に失敗: {}", e)))?;
            println!("  [{}] {}", idx, name);

            if let Ok(configs) = device.supported_input_configs() {
                configs.for_each(|config_range| {
                    println!(
                        "      フォーマット: {:?}, {}-{}Hz, {}ch",
                        config_range.sample_format(),
                        config_range.min_sample_rate().0,
                        config_range.max_sample_rate().0,
                        config_range.channels()
                    );
                });
            }
            println!();
        }

        Ok(())
    }

    /// 除外パターンに一致しない入力デバイス一覧を取得
    fn input_devices(exclude: &Regex) -> Result<Vec<cpal::Device>, TranscribeError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| TranscribeError::Device(format!("デバイス一覧の取得に失敗: {}", e)))?
            .filter(|device| {
                if let Ok(name) = device.name() {
                    !exclude.is_match(&name)
                } else {
                    true
                }
            })
            .collect();
        Ok(devices)
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// フレームを非ブロッキングで送出する
///
/// 満杯のときは新しいフレーム側を破棄する（オーディオコールバックを
/// 待たせない）。送出できたかどうかを返す。
fn push_frame(frame_tx: &mpsc::Sender<AudioFrame>, frame: AudioFrame) -> bool {
    match frame_tx.try_send(frame) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(frame)) => {
            log::warn!(
                "フレームチャンネル満杯: シーケンス {} を破棄",
                frame.sequence_number
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::warn!("フレームチャンネルクローズ: 送信失敗");
            false
        }
    }
}
