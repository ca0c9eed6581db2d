//! キーストローク予測エンジン
//!
//! 打鍵のたびに条件付きセルを仮描画し、サーバーのエコーと突き合わせる。
//! 当たればスコアと RTT 推定が進み、外れれば全予測を撤回してスコアを
//! リセットする。`score > 3` になるまで仮描画は画面に出さない
//! （表示ゲートは OverlayManager が持つ）。
//!
//! SRTT が大きい（エコーが遅い）ときは新しい予測セルに下線を引いて
//! ユーザーに知らせる。閾値はヒステリシスつき: 150ms 超で点灯、
//! 100ms 未満で消灯。

use crate::element::{
    ConditionalCursorMove, ConditionalOverlayCell, OverlayElement, Validity,
};
use crate::terminal::Framebuffer;

/// 下線フラグを点灯する SRTT 閾値（ms）
const FLAG_ON_SRTT_MS: f64 = 150.0;
/// 下線フラグを消灯する SRTT 閾値（ms）
const FLAG_OFF_SRTT_MS: f64 = 100.0;

/// 予測の生存時間の下限（ms）
const PREDICTION_LEN_MIN_MS: u64 = 20;
/// 予測の生存時間の上限（ms）
const PREDICTION_LEN_MAX_MS: u64 = 2000;

/// キーストローク予測エンジン
///
/// 不変条件: `elements` が非空なら先頭は `ConditionalCursorMove`。
pub struct PredictionEngine {
    /// 予測要素（挿入順。先頭はカーソル移動）
    elements: Vec<OverlayElement>,
    /// 連続して当たった予測の数
    score: u32,
    /// エコー RTT の Smoothed RTT（ms）
    srtt: f64,
    /// エコー RTT の平均偏差（ms）
    rttvar: f64,
    /// 一つでも RTT サンプルを観測したか
    rtt_hit: bool,
    /// 新しい予測セルに下線を引くか
    flagging: bool,
}

impl PredictionEngine {
    pub fn new() -> Self {
        PredictionEngine {
            elements: Vec::new(),
            score: 0,
            srtt: 0.0,
            rttvar: 0.0,
            rtt_hit: false,
            flagging: false,
        }
    }

    /// ユーザーの 1 バイト入力を受けて予測を生成する
    ///
    /// 印字可能 ASCII（0x20〜0x7E）で、予測カーソルが右端 2 桁より
    /// 手前なら条件付きセルを追加する。それ以外の入力（制御文字、
    /// 改行など）は画面への影響を予測できないので全予測を捨てる。
    pub fn new_user_byte(&mut self, byte: u8, fb: &Framebuffer, now_ms: u64) {
        self.ensure_leading_cursor(fb, now_ms);

        let (ccm_row, ccm_col) = match self.elements.first() {
            Some(OverlayElement::ConditionalCursorMove(ccm)) => (ccm.new_row, ccm.new_col),
            _ => return,
        };

        if ccm_row >= fb.height() || ccm_col >= fb.width() {
            return;
        }

        if (0x20..=0x7E).contains(&byte) && ccm_col < fb.width().saturating_sub(2) {
            // 同じセルに既存の予測があれば上書きする
            self.elements.retain(|el| {
                !matches!(el, OverlayElement::ConditionalCell(c)
                    if c.row == ccm_row && c.col == ccm_col)
            });

            let existing = match fb.get_cell(ccm_row, ccm_col) {
                Some(c) => c.clone(),
                None => return,
            };

            let mut replacement = existing.clone();
            replacement.contents = vec![byte as char];
            replacement.width = 1;

            let expiration = now_ms + self.prediction_len();
            self.elements
                .push(OverlayElement::ConditionalCell(ConditionalOverlayCell {
                    expiration_time: expiration,
                    prediction_time: now_ms,
                    row: ccm_row,
                    col: ccm_col,
                    original_contents: existing,
                    replacement,
                    flag: self.flagging,
                }));

            // 予測カーソルを一桁進め、期限を更新する
            if let Some(OverlayElement::ConditionalCursorMove(ccm)) = self.elements.first_mut() {
                ccm.new_col += 1;
                ccm.expiration_time = expiration;
            }
        } else {
            self.clear();
            self.score = 0;
        }
    }

    /// 予測を順に見て連続正解数を更新する
    ///
    /// 一つでも外れ/期限切れがあれば score を 0 に戻して全予測を捨てる。
    pub fn calculate_score(&mut self, fb: &Framebuffer, now_ms: u64) {
        for el in &self.elements {
            match el.get_validity(fb, now_ms) {
                Validity::Pending => {}
                Validity::Correct => self.score += 1,
                Validity::IncorrectOrExpired => {
                    self.score = 0;
                    self.clear();
                    return;
                }
            }
        }
    }

    /// 決着のついた予測を取り除く
    ///
    /// Correct な要素からは RTT サンプルを回収して推定器を更新する。
    /// Pending 以外はすべて削除される（ここが唯一の削除地点。
    /// `clear` は全捨て）。
    pub fn cull(&mut self, fb: &Framebuffer, now_ms: u64) {
        let elements = core::mem::take(&mut self.elements);
        for el in elements {
            match el.get_validity(fb, now_ms) {
                Validity::Correct => {
                    let r = now_ms.saturating_sub(el.prediction_time()) as f64;
                    self.observe_rtt(r);
                }
                Validity::Pending => self.elements.push(el),
                Validity::IncorrectOrExpired => {}
            }
        }

        // ヒステリシス: 150ms 超で点灯、100ms 未満で消灯、間は現状維持
        if self.srtt > FLAG_ON_SRTT_MS {
            self.flagging = true;
        }
        if self.srtt < FLAG_OFF_SRTT_MS {
            self.flagging = false;
        }
    }

    /// 予測をすべて画面に重ね描きする（表示ゲートは呼び出し側）
    pub fn apply(&self, fb: &mut Framebuffer) {
        for el in &self.elements {
            el.apply(fb);
        }
    }

    /// 全予測を破棄する
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// 予測の生存時間: `clamp(ceil(1.25·SRTT + 8·RTTVAR), 20, 2000)` ms
    pub fn prediction_len(&self) -> u64 {
        let rto = (1.25 * self.srtt + 8.0 * self.rttvar).ceil() as u64;
        rto.clamp(PREDICTION_LEN_MIN_MS, PREDICTION_LEN_MAX_MS)
    }

    /// 連続正解数
    pub fn score(&self) -> u32 {
        self.score
    }

    /// 下線フラグの現在値
    pub fn flagging(&self) -> bool {
        self.flagging
    }

    /// Smoothed RTT（ms）
    pub fn srtt(&self) -> f64 {
        self.srtt
    }

    /// 要素数（テスト用）
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// 最も近い期限（要素がなければ None）
    pub fn min_expiration(&self) -> Option<u64> {
        self.elements.iter().map(|el| el.expiration_time()).min()
    }

    /// 先頭をカーソル移動要素にする（不変条件の維持）
    fn ensure_leading_cursor(&mut self, fb: &Framebuffer, now_ms: u64) {
        if matches!(
            self.elements.first(),
            Some(OverlayElement::ConditionalCursorMove(_))
        ) {
            return;
        }

        self.elements.insert(
            0,
            OverlayElement::ConditionalCursorMove(ConditionalCursorMove {
                expiration_time: now_ms + self.prediction_len(),
                prediction_time: now_ms,
                new_row: fb.cursor_row(),
                new_col: fb.cursor_col(),
            }),
        );
    }

    /// Jacobson 推定の更新（初回は SRTT=R, RTTVAR=R/2）
    fn observe_rtt(&mut self, r_ms: f64) {
        if !self.rtt_hit {
            self.srtt = r_ms;
            self.rttvar = r_ms / 2.0;
            self.rtt_hit = true;
        } else {
            let alpha = 1.0 / 8.0;
            let beta = 1.0 / 4.0;
            self.rttvar = (1.0 - beta) * self.rttvar + beta * (self.srtt - r_ms).abs();
            self.srtt = (1.0 - alpha) * self.srtt + alpha * r_ms;
        }
    }
}

impl Default for PredictionEngine {
    fn default() -> Self {
        Self::new()
    }
}
