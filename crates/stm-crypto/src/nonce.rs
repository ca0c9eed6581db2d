//! パケット Nonce
//!
//! AES-128-OCB3 は 12 バイトの nonce を要求するが、このプロトコルで
//! 一意性を担保しているのは direction ビット込みの 64 ビット
//! シーケンス番号だけである。そこでこの型は u64 を一つ保持し、
//! 必要になった時点で 2 つのバイト表現を導出する:
//!
//! - 暗号器に渡す 12 バイトブロック: 上位 4 バイトをゼロで埋め、
//!   下位 8 バイトに direction_seq をビッグエンディアンで置く
//! - wire に載せる 8 バイト: direction_seq のビッグエンディアン表現
//!   そのもの（ゼロ埋め部分は受信側が補えるので送らない）
//!
//! nonce はビュー/導出値にすぎないので、送信カウンタの管理は
//! `CryptoSession` 側にある。

/// direction ビット込みシーケンス番号の nonce 表現
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNonce {
    direction_seq: u64,
}

impl PacketNonce {
    /// direction ビット込みのシーケンス番号から nonce を作る
    ///
    /// # 例
    /// ```
    /// use stm_crypto::PacketNonce;
    /// let nonce = PacketNonce::new(7);
    /// assert_eq!(nonce.tail_bytes(), 7u64.to_be_bytes());
    /// ```
    pub fn new(direction_seq: u64) -> Self {
        PacketNonce { direction_seq }
    }

    /// wire 上の 8 バイトから nonce を復元する
    pub fn from_nonce_tail(tail: &[u8; 8]) -> Self {
        PacketNonce {
            direction_seq: u64::from_be_bytes(*tail),
        }
    }

    /// direction ビット込みのシーケンス番号
    pub fn direction_seq(&self) -> u64 {
        self.direction_seq
    }

    /// 暗号器に渡す 12 バイトの nonce ブロックを導出する
    pub fn to_block(&self) -> [u8; 12] {
        let mut block = [0u8; 12];
        block[4..].copy_from_slice(&self.direction_seq.to_be_bytes());
        block
    }

    /// wire に載せる 8 バイト（ブロックの下位 8 バイトと一致する）
    pub fn tail_bytes(&self) -> [u8; 8] {
        self.direction_seq.to_be_bytes()
    }
}
