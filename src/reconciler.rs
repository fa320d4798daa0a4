use crate::protocol::TurnMessage;
use crate::types::TranscriptSegment;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// 文字起こし結果の整合器
///
/// 受信した部分/確定メッセージを、順序が安定したセグメント列へ整える。
///
/// - 部分結果は同一セグメントの前回値を上書きし、そのまま下流へ流す
///   （表示側は同じidのテキストを置き換える）。
/// - 確定結果はセグメントごとに1回だけ流す。確定後に届いた同一idの
///   メッセージは破棄する。
/// - 下流への確定結果は開始オフセットの昇順になるよう、未確定の
///   先行セグメントがある間は保留する。保留は `reorder_window` で
///   打ち切り、期限切れ分は受信順で流す（ベストエフォート）。
pub struct TranscriptReconciler {
    reorder_window: Duration,
    /// セグメントidごとの最新の部分結果
    partials: HashMap<String, TranscriptSegment>,
    /// 確定済みセグメントのid
    finalized: HashSet<String>,
    /// 先行セグメント待ちで保留中の確定結果（受信順）
    held: Vec<(TranscriptSegment, Instant)>,
}

impl TranscriptReconciler {
    pub fn new(reorder_window: Duration) -> Self {
        Self {
            reorder_window,
            partials: HashMap::new(),
            finalized: HashSet::new(),
            held: Vec::new(),
        }
    }

    /// 受信メッセージを適用し、下流へ流すセグメントを返す
    ///
    /// 戻り値は出力順。保留が解けたセグメントも含まれる。
    pub fn apply(&mut self, turn: &TurnMessage, now: Instant) -> Vec<TranscriptSegment> {
        let mut out = Vec::new();
        let id = segment_id(turn);

        // 確定済みidへの後続メッセージはすべて破棄
        if self.finalized.contains(&id) {
            log::debug!("確定済みセグメント {} へのメッセージを破棄", id);
            self.release(now, &mut out);
            return out;
        }

        let segment = TranscriptSegment {
            id: id.clone(),
            text: turn.transcript.clone(),
            is_final: turn.end_of_turn,
            confidence: turn.confidence.clamp(0.0, 1.0),
            start_offset_ms: turn.audio_start_ms,
            end_offset_ms: turn.audio_end_ms,
        };

        if !turn.end_of_turn {
            // 部分結果: 前回値を上書きして即時に流す
            self.partials.insert(id, segment.clone());
            out.push(segment);
        } else {
            self.finalized.insert(id.clone());
            self.partials.remove(&id);

            if self.has_unresolved_predecessor(segment.start_offset_ms) {
                // 先行セグメントが未確定のうちは順序が崩れるので保留
                self.held.push((segment, now));
            } else {
                out.push(segment);
            }
        }

        self.release(now, &mut out);
        out
    }

    /// 保留期限が切れたセグメントを流す
    ///
    /// セッションループから定期的に呼ばれる。
    pub fn flush_due(&mut self, now: Instant) -> Vec<TranscriptSegment> {
        let mut out = Vec::new();
        self.release(now, &mut out);
        out
    }

    /// 保留中のセグメントを受信順ですべて流す（セッション終了時）
    pub fn flush_all(&mut self) -> Vec<TranscriptSegment> {
        self.held.drain(..).map(|(segment, _)| segment).collect()
    }

    /// 保留中のセグメント数
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// `start_ms` より前に始まる未確定セグメントが残っているか
    fn has_unresolved_predecessor(&self, start_ms: u64) -> bool {
        self.partials
            .values()
            .any(|p| p.start_offset_ms < start_ms)
    }

    /// 保留の解放
    ///
    /// 期限切れ分は受信順で、解放可能になった分は開始オフセット順で流す。
    fn release(&mut self, now: Instant, out: &mut Vec<TranscriptSegment>) {
        // 期限切れ: 受信順のまま流す
        let mut index = 0;
        while index < self.held.len() {
            let (_, held_at) = &self.held[index];
            if now.duration_since(*held_at) >= self.reorder_window {
                let (segment, _) = self.held.remove(index);
                out.push(segment);
            } else {
                index += 1;
            }
        }

        // 先行セグメントが解決した分: 開始オフセット順で流す
        let mut ready: Vec<usize> = self
            .held
            .iter()
            .enumerate()
            .filter(|(_, (segment, _))| {
                !self.partials
                    .values()
                    .any(|p| p.start_offset_ms < segment.start_offset_ms)
            })
            .map(|(i, _)| i)
            .collect();

        // インデックスを保つため後ろから取り出す
        ready.sort_unstable();
        for &i in ready.iter().rev() {
            let (segment, _) = self.held.remove(i);
            out.push(segment);
        }
        // 取り出しが逆順だったぶん、末尾を開始オフセット順に戻す
        let tail_start = out.len() - ready.len();
        out[tail_start..].sort_by_key(|segment| segment.start_offset_ms);
    }
}

/// メッセージからセグメント識別子を得る
///
/// 明示idがなければ開始オフセットの時間窓キーから導出する。
fn segment_id(turn: &TurnMessage) -> String {
    match &turn.id {
        Some(id) => id.clone(),
        None => format!("seg-{}", turn.audio_start_ms),
    }
}
