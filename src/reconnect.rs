use crate::config::ReconnectConfig;
use std::time::Duration;

/// 再接続の指数バックオフポリシー
///
/// 初期値から2倍ずつ増やし、上限でキャップする。ジッタを加えて
/// 同時再接続の集中を避ける。試行回数は有限で、使い切ったら
/// セッションは Errored へ遷移する。
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    jitter: bool,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter: config.jitter,
        }
    }

    /// `attempt` 回目（1始まり）の接続試行前に待つ時間
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64;

        // 指数バックオフ: initial * 2^(attempt-1)
        let delay = base_delay * 2f64.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        let delay_ms = if self.jitter {
            // ±25% のジッタ
            let jitter_range = delay * 0.25;
            (delay + pseudo_jitter(jitter_range)).max(0.0) as u64
        } else {
            delay as u64
        };

        Duration::from_millis(delay_ms)
    }

    /// `failures` 回失敗した時点でまだ再試行してよいか
    ///
    /// 接続試行の総数は `max_attempts` で打ち止めになる。
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

/// 簡易LCGによる擬似乱数ジッタ
///
/// この用途のためだけに rand クレートを引き込まない。
fn pseudo_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64; // 0.0 .. 1.0
    (normalized - 0.5) * 2.0 * range // -range .. +range
}
