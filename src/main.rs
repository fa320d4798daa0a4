use anyhow::Result;
use env_logger::Env;
use mic_transcribe::audio_input::CaptureSource;
use mic_transcribe::config::Config;
use mic_transcribe::transcriber::Transcriber;
use mic_transcribe::types::TranscriptSegment;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// 標準出力へのJSON Lines形式の1行
#[derive(Serialize)]
struct TranscriptLine<'a> {
    /// 受信時刻 (ISO 8601)
    timestamp: String,
    #[serde(flatten)]
    segment: &'a TranscriptSegment,
}

fn print_segment(segment: &TranscriptSegment) {
    let line = TranscriptLine {
        timestamp: chrono::Utc::now().to_rfc3339(),
        segment,
    };
    if let Ok(json) = serde_json::to_string(&line) {
        println!("{}", json);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        CaptureSource::list_devices(&Config::default().audio.exclude_pattern)?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み
    let config = Config::load_or_default(config_path)?;

    // ロガーを初期化
    env_logger::Builder::from_env(
        Env::default().default_filter_or(config.output.log_level.as_str()),
    )
    .format_timestamp(None)
    .init();

    log::info!("mic-transcribe を起動します");
    log::info!("設定: {:?}", config);

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    // パイプラインを開始
    let mut transcriber = Transcriber::new(config);
    let mut segment_rx = transcriber.start().await?;
    let mut fatal_rx = transcriber
        .take_error_receiver()
        .ok_or_else(|| anyhow::anyhow!("エラーチャンネルの取得に失敗"))?;

    log::info!("文字起こしを開始しました (Ctrl+C で停止)");

    // メインループ: セグメントをJSON Linesで出力しつつ停止を待つ
    loop {
        tokio::select! {
            maybe_segment = segment_rx.recv() => {
                match maybe_segment {
                    Some(segment) => print_segment(&segment),
                    None => {
                        log::info!("セグメントストリームが終了しました");
                        break;
                    }
                }
            }
            result = &mut fatal_rx => {
                if let Ok(err) = result {
                    log::error!("回復不能なエラー: {}", err);
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    // クリーンアップ
    log::info!("停止処理を開始します...");
    transcriber.stop().await;

    // 停止処理で流れてきた残りの確定結果を出力
    while let Ok(segment) = segment_rx.try_recv() {
        print_segment(&segment);
    }

    log::info!("mic-transcribe を終了しました");

    Ok(())
}
