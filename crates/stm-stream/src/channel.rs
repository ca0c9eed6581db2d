//! ユーザー入力バイトストリーム状態

use stm_sync::{SyncError, SyncState};

/// 追記: payload を末尾に足す
const DIFF_TAG_APPEND: u8 = 0x00;
/// 全置換: payload で丸ごと置き換える
const DIFF_TAG_REPLACE: u8 = 0x01;

/// ユーザー入力の追記ログを一つの同期状態として表すクラス
///
/// ローカル側はキーストロークを `push_bytes` で積み、その値を
/// `set_current_state` に渡す。リモート側は差分適用後の状態から
/// `bytes_since` で未処理分を取り出す。
///
/// ログは追記専用。送信側の履歴に残る古いアンカーが常に現在値の
/// 接頭辞であり続けることが、差分を「未読の末尾」にできる条件なので、
/// セッション中に先頭を切り詰めることはしない。
#[derive(Debug, Clone)]
pub struct UserByteStream {
    /// これまでに入力された全バイト（追記のみ）
    bytes: Vec<u8>,
    /// `push_bytes` で積まれた総バイト数（統計用）
    total_sent: u64,
    /// 差分適用で受け取った総バイト数（統計用）
    total_received: u64,
}

impl UserByteStream {
    /// 空のストリームを生成する
    pub fn new() -> Self {
        UserByteStream {
            bytes: Vec::new(),
            total_sent: 0,
            total_received: 0,
        }
    }

    /// ユーザー入力バイトを末尾に追記する
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
        self.total_sent += data.len() as u64;
    }

    /// ログの総バイト数
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// ログが空か
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `offset` 以降のバイト列（受信側が未処理分を取り出すのに使う）
    pub fn bytes_since(&self, offset: usize) -> &[u8] {
        &self.bytes[offset.min(self.bytes.len())..]
    }

    /// `push_bytes` で積まれた総バイト数（統計用）
    pub fn total_sent_bytes(&self) -> u64 {
        self.total_sent
    }

    /// 差分適用で受け取った総バイト数（統計用）
    pub fn total_received_bytes(&self) -> u64 {
        self.total_received
    }
}

impl Default for UserByteStream {
    fn default() -> Self {
        Self::new()
    }
}

/// 同期される値はログ本体だけ。統計カウンタはローカルな観測値なので
/// 等価判定（＝トランスポートの「状態が変わったか」）には含めない。
impl PartialEq for UserByteStream {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for UserByteStream {}

impl SyncState for UserByteStream {
    fn init() -> Self {
        Self::new()
    }

    fn serialize(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn diff_from(&self, target: &Self) -> Vec<u8> {
        if target.bytes.starts_with(&self.bytes) {
            // 通常ケース: 相手が見ていない末尾だけ送る
            let mut diff = Vec::with_capacity(1 + target.bytes.len() - self.bytes.len());
            diff.push(DIFF_TAG_APPEND);
            diff.extend_from_slice(&target.bytes[self.bytes.len()..]);
            diff
        } else {
            // 履歴が分岐している（起こらないはずだが自己修復できる形にする）
            let mut diff = Vec::with_capacity(1 + target.bytes.len());
            diff.push(DIFF_TAG_REPLACE);
            diff.extend_from_slice(&target.bytes);
            diff
        }
    }

    fn apply_diff(&self, diff: &[u8]) -> Result<Self, SyncError> {
        let (&tag, payload) = diff.split_first().ok_or(SyncError::InvalidDiff)?;
        match tag {
            DIFF_TAG_APPEND => {
                let mut next = self.clone();
                next.bytes.extend_from_slice(payload);
                next.total_received += payload.len() as u64;
                Ok(next)
            }
            DIFF_TAG_REPLACE => Ok(UserByteStream {
                bytes: payload.to_vec(),
                total_sent: self.total_sent,
                total_received: self.total_received + payload.len() as u64,
            }),
            _ => Err(SyncError::InvalidDiff),
        }
    }
}
