//! # stm-overlay
//!
//! ローカルエコー予測と通知バーのオーバーレイエンジン。
//!
//! サーバーの応答を待たずにキーストロークを画面に仮描画（予測）し、
//! 後から届く正本のフレームバッファと突き合わせて正誤を判定する。
//! 当たった予測は RTT サンプルとして回収し、外れた予測は撤回する。
//!
//! ## データフロー
//!
//! ```text
//! ユーザーのキー入力 → PredictionEngine (仮のセル/カーソル移動を生成)
//!                                 │
//! サーバーからの正本状態 ──────────┤
//!                                 ▼
//! 描画ティックごとに OverlayManager::apply:
//!   calculate_score → cull → (score > 3 なら) 予測を重ね描き → 通知バー
//! ```
//!
//! すべての操作は現在時刻 `now_ms` を引数に取る。エンジン自身は
//! 時計を持たず、テストでは任意の時刻を注入できる。

pub mod element;
pub mod manager;
pub mod notification;
pub mod prediction;
pub mod terminal;

pub use element::{OverlayElement, Validity};
pub use manager::OverlayManager;
pub use notification::NotificationEngine;
pub use prediction::PredictionEngine;
pub use terminal::{Cell, Framebuffer, Renditions};
