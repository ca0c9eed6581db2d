//! # stm-proto
//!
//! 状態同期プロトコルの Instruction レコードとエンコード/デコード。
//!
//! ## Instruction の役割
//!
//! Instruction は、以下の情報を一つのメッセージに格納する：
//! - `old_num` / `new_num`: 送信側の状態番号（差分の起点と終点）
//! - `ack_num`: 受信確認済みの状態番号
//! - `throwaway_num`: これより古い状態は破棄可能（送信側のアンカー番号）
//! - `timestamp` / `timestamp_reply`: RTT 計測用の 16 ビットタイムスタンプ
//! - `diff`: 状態差分データ（状態型自身が生成・解釈する不透明なバイト列）
//!
//! ## Wire Format（固定リトルエンディアン、ヘッダー 36 バイト）
//!
//! ```text
//! [old_num:        u64 LE]
//! [new_num:        u64 LE]
//! [ack_num:        u64 LE]
//! [throwaway_num:  u64 LE]
//! [timestamp:      u16 LE]
//! [timestamp_reply:u16 LE]
//! [diff: variable]
//! ```
//!
//! ## 番兵値
//!
//! - `new_num == u64::MAX`: シャットダウン要求
//! - `ack_num == u64::MAX`: シャットダウン確認
//! - `timestamp_reply == 0`: エコーすべき相手タイムスタンプなし

#![no_std]
extern crate alloc;

use alloc::vec::Vec;

pub mod error;

pub use error::ProtoError;

/// シャットダウンを表す番兵値（`new_num` / `ack_num` に使用）
pub const SHUTDOWN_NUM: u64 = u64::MAX;

/// 「エコーすべきタイムスタンプなし」を表す番兵値（`timestamp_reply`）
pub const TIMESTAMP_REPLY_NONE: u16 = 0;

/// Instruction ヘッダー長（u64 x 4 + u16 x 2）
pub const INSTRUCTION_HEADER_LEN: usize = 36;

/// 状態同期の最小送信単位
///
/// 一つの状態差分と、受信確認・RTT 計測のメタデータを運ぶ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// 差分の起点となる状態番号（送信側のアンカー）
    pub old_num: u64,
    /// 差分適用後の状態番号
    pub new_num: u64,
    /// 送信側が受信済みの相手状態番号の最大値
    pub ack_num: u64,
    /// これ以下の相手保管分は破棄してよい（送信側アンカー番号）
    pub throwaway_num: u64,
    /// 送信側ローカル時刻の下位 16 ビット（ms）
    pub timestamp: u16,
    /// 最後に観測した相手タイムスタンプ + 滞留時間（0 = なし）
    pub timestamp_reply: u16,
    /// 状態差分（空 = ACK のみ）
    pub diff: Vec<u8>,
}

impl Instruction {
    /// 送信用 Instruction を組み立てる
    pub fn new_send(
        old_num: u64,
        new_num: u64,
        ack_num: u64,
        throwaway_num: u64,
        timestamp: u16,
        timestamp_reply: u16,
        diff: Vec<u8>,
    ) -> Self {
        Instruction {
            old_num,
            new_num,
            ack_num,
            throwaway_num,
            timestamp,
            timestamp_reply,
            diff,
        }
    }

    /// ACK のみの Instruction（差分なし）
    ///
    /// `old_num == new_num` かつ diff 空。受信側は ACK を処理した上で
    /// 状態適用をスキップする（重複 or アンカー不在として落ちる）。
    pub fn new_ack(
        current_num: u64,
        ack_num: u64,
        throwaway_num: u64,
        timestamp: u16,
        timestamp_reply: u16,
    ) -> Self {
        Instruction {
            old_num: current_num,
            new_num: current_num,
            ack_num,
            throwaway_num,
            timestamp,
            timestamp_reply,
            diff: Vec::new(),
        }
    }

    /// バイト列から Instruction をデコードする
    ///
    /// # エラー
    /// - `ProtoError::TooShort`: ヘッダー 36 バイトに満たない
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < INSTRUCTION_HEADER_LEN {
            return Err(ProtoError::TooShort);
        }

        let u64_at = |off: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(buf)
        };

        let old_num = u64_at(0);
        let new_num = u64_at(8);
        let ack_num = u64_at(16);
        let throwaway_num = u64_at(24);
        let timestamp = u16::from_le_bytes([bytes[32], bytes[33]]);
        let timestamp_reply = u16::from_le_bytes([bytes[34], bytes[35]]);
        let diff = bytes[INSTRUCTION_HEADER_LEN..].to_vec();

        Ok(Instruction {
            old_num,
            new_num,
            ack_num,
            throwaway_num,
            timestamp,
            timestamp_reply,
            diff,
        })
    }

    /// Instruction をバイト列にエンコードする
    pub fn encode_to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INSTRUCTION_HEADER_LEN + self.diff.len());
        buf.extend_from_slice(&self.old_num.to_le_bytes());
        buf.extend_from_slice(&self.new_num.to_le_bytes());
        buf.extend_from_slice(&self.ack_num.to_le_bytes());
        buf.extend_from_slice(&self.throwaway_num.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_reply.to_le_bytes());
        buf.extend_from_slice(&self.diff);
        buf
    }

    /// 状態差分を持つか（diff が非空）
    pub fn has_diff(&self) -> bool {
        !self.diff.is_empty()
    }

    /// シャットダウン要求か（`new_num` が番兵値）
    pub fn is_shutdown_request(&self) -> bool {
        self.new_num == SHUTDOWN_NUM
    }

    /// シャットダウン確認か（`ack_num` が番兵値）
    pub fn is_shutdown_ack(&self) -> bool {
        self.ack_num == SHUTDOWN_NUM
    }
}
