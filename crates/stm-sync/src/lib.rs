//! # stm-sync
//!
//! 状態同期プロトコルのコア状態機械。
//!
//! ## プロトコルの概要
//!
//! TCP とは異なり、最新の状態の同期だけを保証する（中間状態はスキップ可能）。
//! 送信側はアンカー（相手が ACK 済みの状態）から現在状態への差分を送り、
//! 受信側は差分を適用して状態履歴を進める。
//!
//! ### キーコンセプト
//!
//! - **SyncState**: 同期対象の不透明な状態型。差分の生成と適用は状態型自身が行う
//! - **アンカー**: 相手が最後に ACK した自分の状態。差分エンコードの起点
//! - **Instruction**: 送信の最小単位。old_num〜new_num の状態差分を含む
//! - **ACK**: `ack_num` で受信確認を通知する。受信から `ACK_INTERVAL_MS` 以内に
//!   まとめて送る（コアレッシング）
//! - **throwaway_num**: これより古い自分の状態はもう差分の起点にしない
//!   （相手側のメモリ解放の合図）
//! - **ハートビート**: `HEARTBEAT_INTERVAL_MS` ごとに ACK を送って接続を維持する
//! - **RTT 推定**: Jacobson アルゴリズム（RFC 6298）で Smoothed RTT を推定
//! - **再送**: RTO 経過後に未 ACK の差分を再送（受信側で冪等）
//!
//! ## シャットダウンの状態遷移
//!
//! ```text
//! Active → (start_shutdown) → ShutdownSending → ShutdownAcknowledged   [終了・正常]
//!                             ShutdownSending → ShutdownAckTimedOut    [終了・失敗]
//! Active → (相手が new_num=MAX を送信) → CounterpartyShutdown
//!        → (ack_num=MAX を 1 回送信)   → CounterpartyShutdownAcked     [終了・相手主導]
//! ```

pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod state;

pub use receiver::TransportReceiver;
pub use rtt::RttEstimator;
pub use sender::{AckView, ShutdownState, TransportSender};
pub use state::{SyncError, SyncState, TimestampedState};

/// 送信間隔の下限（ミリ秒）
pub const SEND_INTERVAL_MIN_MS: u64 = 20;

/// 送信間隔の上限（ミリ秒）
pub const SEND_INTERVAL_MAX_MS: u64 = 250;

/// ACK コアレッシングの猶予（ミリ秒）
/// 受信から最大この時間だけ ACK をまとめて遅らせる
pub const ACK_INTERVAL_MS: u64 = 100;

/// ハートビート間隔（ミリ秒）
pub const HEARTBEAT_INTERVAL_MS: u64 = 3000;

/// シャットダウン確認待ちのタイムアウト（ミリ秒）
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// 再送タイムアウト最小値（ミリ秒）
pub const RTO_MIN_MS: u64 = 50;

/// 再送タイムアウト最大値（ミリ秒）
pub const RTO_MAX_MS: u64 = 1000;

/// RTT サンプルが一つもないときの仮 SRTT（ミリ秒）
pub const SRTT_INITIAL_MS: f64 = 1000.0;

/// クロック粒度 G（RFC 6298、ミリ秒）
pub const CLOCK_GRANULARITY_MS: f64 = 50.0;

/// `wait_time` が返す「やることなし」の番兵値（ミリ秒）
pub const WAIT_IDLE_MS: u64 = u64::MAX;
