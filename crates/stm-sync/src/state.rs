//! 同期対象状態の抽象化
//!
//! トランスポートは状態の内部構造を一切覗かない。シリアライズ・差分生成・
//! 差分適用・等価比較・初期値の 5 つの能力だけを要求する。

/// 差分適用のエラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// 差分バイト列が壊れている、または起点状態に適用できない
    InvalidDiff,
}

impl core::fmt::Display for SyncError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SyncError::InvalidDiff => write!(f, "Diff is malformed or inapplicable"),
        }
    }
}

/// トランスポートが同期する不透明な状態型
///
/// 差分の表現形式は状態型が決める。トランスポートが保証するのは
/// 「`a.diff_from(&b)` で得たバイト列を `a.apply_diff` すると `b` に
/// 等しい状態が得られる」ことへの依存だけである。
pub trait SyncState: Clone + PartialEq {
    /// 初期状態（接続確立時に双方で一致していなければならない）
    fn init() -> Self;

    /// 状態全体をバイト列にシリアライズする
    fn serialize(&self) -> Vec<u8>;

    /// `self` から `target` へ遷移する差分を生成する
    fn diff_from(&self, target: &Self) -> Vec<u8>;

    /// `self` に差分を適用した新しい状態を返す
    fn apply_diff(&self, diff: &[u8]) -> Result<Self, SyncError>;
}

/// 番号と受信/生成時刻つきの状態
///
/// `num` は生成側が割り当てる単調増加の 64 ビット番号。
#[derive(Debug, Clone)]
pub struct TimestampedState<T> {
    /// 状態番号（生成側で単調増加）
    pub num: u64,
    /// ローカル時刻（ms、生成時または受信時）
    pub timestamp_ms: u64,
    /// 状態本体
    pub state: T,
}

impl<T> TimestampedState<T> {
    pub fn new(num: u64, timestamp_ms: u64, state: T) -> Self {
        TimestampedState {
            num,
            timestamp_ms,
            state,
        }
    }
}
