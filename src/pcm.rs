use crate::types::{MixdownPolicy, SampleI16};

/// f32サンプル1つをi16 PCMへ変換
///
/// [-1.0, 1.0] にクランプしたうえで、負側は 32768 倍、非負側は 32767 倍
/// する。2の補数16ビットの非対称なレンジ (-32768..32767) を使い切りつつ、
/// 正側のオーバーフローを避けるための係数。小数部は0方向へ切り捨てる。
#[inline]
pub fn sample_to_i16(sample: f32) -> SampleI16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as SampleI16
    } else {
        (clamped * 32767.0) as SampleI16
    }
}

/// インターリーブされたf32ブロックをモノラルi16 PCMへ変換
///
/// オーディオコールバック上で毎量子呼ばれるため、出力バッファ以外の
/// ヒープ確保を行わない。`channels` は1以上であること。
///
/// # Examples
///
/// ```
/// # use mic_transcribe::pcm::encode_block;
/// # use mic_transcribe::types::MixdownPolicy;
/// let encoded = encode_block(&[0.0, 1.0, -1.0], 1, MixdownPolicy::ChannelZero);
/// assert_eq!(encoded, vec![0, 32767, -32768]);
/// ```
pub fn encode_block(block: &[f32], channels: u16, mixdown: MixdownPolicy) -> Vec<SampleI16> {
    let channels = channels.max(1) as usize;
    let frames = block.len() / channels;
    let mut out = Vec::with_capacity(frames);

    for frame in 0..frames {
        let base = frame * channels;
        let value = match mixdown {
            MixdownPolicy::ChannelZero => block[base],
            MixdownPolicy::Average => {
                let sum: f32 = block[base..base + channels].iter().sum();
                sum / channels as f32
            }
        };
        out.push(sample_to_i16(value));
    }

    out
}

/// i16サンプル列をリトルエンディアンのバイト列へ変換
///
/// ストリーミング接続へ送るバイナリフレームのワイヤ形式。
pub fn frame_bytes(samples: &[SampleI16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_reference_vector() {
        // 基準入力に対する期待値（0.5は切り捨てで16383）
        let block = [0.0f32, 1.0, -1.0, 0.5, -0.5];
        let encoded = encode_block(&block, 1, MixdownPolicy::ChannelZero);
        assert_eq!(encoded, vec![0, 32767, -32768, 16383, -16384]);
    }

    #[test]
    fn test_clamping_out_of_range() {
        assert_eq!(sample_to_i16(1.5), sample_to_i16(1.0));
        assert_eq!(sample_to_i16(-1.5), sample_to_i16(-1.0));
        assert_eq!(sample_to_i16(1.5), 32767);
        assert_eq!(sample_to_i16(-1.5), -32768);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let block = [0.25f32, -0.75, 0.99, -0.01];
        let a = encode_block(&block, 1, MixdownPolicy::ChannelZero);
        let b = encode_block(&block, 1, MixdownPolicy::ChannelZero);
        assert_eq!(a, b);
    }

    #[test]
    fn test_channel_zero_takes_first_channel() {
        // 2チャンネルインターリーブ: [L0, R0, L1, R1]
        let block = [0.5f32, -0.5, 1.0, 0.0];
        let encoded = encode_block(&block, 2, MixdownPolicy::ChannelZero);
        assert_eq!(encoded, vec![16383, 32767]);
    }

    #[test]
    fn test_average_mixdown() {
        // (0.5 + -0.5)/2 = 0.0, (1.0 + 0.0)/2 = 0.5
        let block = [0.5f32, -0.5, 1.0, 0.0];
        let encoded = encode_block(&block, 2, MixdownPolicy::Average);
        assert_eq!(encoded, vec![0, 16383]);
    }

    #[test]
    fn test_incomplete_trailing_frame_is_dropped() {
        // 2chで5サンプル: 最後の半端なサンプルは読み捨てる
        let block = [0.0f32, 0.0, 1.0, 1.0, -1.0];
        let encoded = encode_block(&block, 2, MixdownPolicy::ChannelZero);
        assert_eq!(encoded.len(), 2);
    }

    #[test]
    fn test_frame_bytes_little_endian() {
        let bytes = frame_bytes(&[0x0102i16, -2]);
        assert_eq!(bytes, vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn test_empty_block() {
        assert!(encode_block(&[], 1, MixdownPolicy::ChannelZero).is_empty());
        assert!(frame_bytes(&[]).is_empty());
    }
}
