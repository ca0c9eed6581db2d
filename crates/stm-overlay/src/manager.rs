//! オーバーレイマネージャー
//!
//! 予測エンジンと通知エンジンを正本のフレームバッファに重ね合わせる
//! 合成窓口。予測の表示は `score > 3` の確信ゲートで抑制する。

use crate::notification::NotificationEngine;
use crate::prediction::PredictionEngine;
use crate::terminal::Framebuffer;

/// 予測を表示し始める連続正解数の閾値
const PREDICTION_DISPLAY_SCORE: u32 = 3;

/// 予測 + 通知の合成窓口
pub struct OverlayManager {
    predictions: PredictionEngine,
    notifications: NotificationEngine,
}

impl OverlayManager {
    pub fn new(now_ms: u64) -> Self {
        OverlayManager {
            predictions: PredictionEngine::new(),
            notifications: NotificationEngine::new(now_ms),
        }
    }

    /// ユーザーの 1 バイト入力を予測エンジンに渡す
    pub fn new_user_byte(&mut self, byte: u8, fb: &Framebuffer, now_ms: u64) {
        self.predictions.new_user_byte(byte, fb, now_ms);
    }

    /// 正本のコピーにオーバーレイを適用する
    ///
    /// 採点 → 決着済み予測の除去（+ RTT 回収）→ ゲートを超えていれば
    /// 予測の重ね描き → 通知バー、の順。
    pub fn apply(&mut self, fb: &mut Framebuffer, now_ms: u64) {
        self.predictions.calculate_score(fb, now_ms);
        self.predictions.cull(fb, now_ms);

        if self.predictions.score() > PREDICTION_DISPLAY_SCORE {
            self.predictions.apply(fb);
        }

        self.notifications.render_notification(now_ms);
        self.notifications.apply(fb);
    }

    /// 通知メッセージを設定する
    pub fn set_notification_string(&mut self, message: &str, now_ms: u64) {
        self.notifications.set_notification_string(message, now_ms);
    }

    /// サーバーからの着信を通知エンジンに記録する
    pub fn server_ping(&mut self, t_ms: u64) {
        self.notifications.server_ping(t_ms);
    }

    /// 次にオーバーレイ要素が失効するまでの時間（ms）
    ///
    /// 要素がなければ `u64::MAX`。失効済みの要素があれば 0
    /// （いま描き直す仕事がある）。
    pub fn wait_time(&self, now_ms: u64) -> u64 {
        let next_expiry = [
            self.predictions.min_expiration(),
            self.notifications.min_expiration(),
        ]
        .into_iter()
        .flatten()
        .min();

        match next_expiry {
            None => u64::MAX,
            Some(expiry) => expiry.saturating_sub(now_ms),
        }
    }

    /// 予測エンジンへの参照（統計用）
    pub fn predictions(&self) -> &PredictionEngine {
        &self.predictions
    }

    /// 通知エンジンへの参照（統計用）
    pub fn notifications(&self) -> &NotificationEngine {
        &self.notifications
    }
}
