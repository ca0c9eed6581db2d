//! # stm-crypto
//!
//! stm プロトコルのデータグラム暗号化（AES-128-OCB3）
//!
//! 各データグラムを単調増加するシーケンス番号ベースの Nonce で
//! 認証付き暗号化するクレート。`no_std` + `alloc` 環境で動作する。
//!
//! ## 暗号化仕様
//!
//! ```text
//! データグラム = [direction_seq: u64 BE][ciphertext + 16バイトタグ]
//!
//! direction_seq:
//!   bit 63 (MSB) = direction (TO_SERVER=0, TO_CLIENT=1)
//!   bit 0..62    = 送信シーケンス番号（鍵ごと・方向ごとに一意）
//! ```
//!
//! OCB3 に渡す 12 バイト nonce は direction_seq から導出する
//! （上位 4 バイトゼロ + direction_seq のビッグエンディアン 8 バイト）。
//! wire にはゼロ埋め部分を省いた 8 バイトだけを載せる。
//!
//! 平文はフラグメントのバイト列そのもの。シーケンス番号と方向は
//! Nonce から復元する（Nonce が改ざんされていれば認証タグ検証が失敗する）。
//!
//! 同じ Nonce を二度受理しないよう、受信側はスライディングウィンドウで
//! 再生（リプレイ）検出を行う。

#![no_std]
extern crate alloc;

mod error;
mod nonce;
mod replay;
mod session;

pub use error::CryptoError;
pub use nonce::PacketNonce;
pub use replay::ReplayWindow;
pub use session::{CryptoSession, DecryptedPacket, EncryptedPacket};

/// stm パケットの方向（TO_SERVER or TO_CLIENT）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// クライアント → サーバー (bit 63 = 0)
    ToServer = 0,
    /// サーバー → クライアント (bit 63 = 1)
    ToClient = 1,
}

impl Direction {
    /// direction_seq の MSB から方向を判定する
    pub fn from_seq(direction_seq: u64) -> Self {
        if direction_seq >> 63 == 0 {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// direction を seq の MSB に適用する
    pub fn apply_to_seq(&self, seq: u64) -> u64 {
        match self {
            Direction::ToServer => seq & !(1u64 << 63),
            Direction::ToClient => seq | (1u64 << 63),
        }
    }

    /// 逆方向を返す（受信パケットが持つべき方向）
    pub fn opposite(&self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// Base64 文字列（22文字）を 16 バイトの鍵にデコードする
///
/// サーバーが出力する鍵フォーマット: `4NeCCgvZFe2RnPgrcU1PQw`（22文字、
/// URL-safe base64 パディングなし）
pub fn decode_base64_key(key_b64: &str) -> Result<[u8; 16], CryptoError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(key_b64)
        .map_err(|_| CryptoError::InvalidBase64)?;

    if bytes.len() != 16 {
        return Err(CryptoError::InvalidKeyLength);
    }

    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// 16 バイトの鍵を Base64 文字列（22文字）にエンコードする
pub fn encode_base64_key(key: &[u8; 16]) -> alloc::string::String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key)
}

/// OS の乱数源から新しいセッション鍵を生成する（サーバー側で使用）
pub fn generate_key() -> [u8; 16] {
    use rand::RngCore;
    let mut key = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_to_server() {
        let dir = Direction::from_seq(0x0000000000000001u64);
        assert_eq!(dir, Direction::ToServer);
    }

    #[test]
    fn test_direction_to_client() {
        let dir = Direction::from_seq(0x8000000000000001u64);
        assert_eq!(dir, Direction::ToClient);
    }

    #[test]
    fn test_direction_apply_to_seq() {
        let seq: u64 = 42;
        let ts = Direction::ToServer.apply_to_seq(seq);
        assert_eq!(ts >> 63, 0);
        let tc = Direction::ToClient.apply_to_seq(seq);
        assert_eq!(tc >> 63, 1);
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::ToServer.opposite(), Direction::ToClient);
        assert_eq!(Direction::ToClient.opposite(), Direction::ToServer);
    }

    #[test]
    fn test_decode_base64_key_valid() {
        // 16バイト = 22文字（URL-safe base64 no-pad）
        let key_b64 = "AAAAAAAAAAAAAAAAAAAAAA"; // 16 zero bytes
        let key = decode_base64_key(key_b64).unwrap();
        assert_eq!(key, [0u8; 16]);
    }

    #[test]
    fn test_decode_base64_key_invalid_length() {
        let key_b64 = "AAAAAAAAAAAAAA"; // 短すぎる
        let result = decode_base64_key(key_b64);
        assert!(result.is_err());
    }

    #[test]
    fn test_key_roundtrip() {
        let key: [u8; 16] = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xFE, 0xDC, 0xBA, 0x98, 0x76, 0x54,
            0x32, 0x10,
        ];
        let encoded = encode_base64_key(&key);
        assert_eq!(encoded.len(), 22);
        let decoded = decode_base64_key(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_generate_key_not_constant() {
        let k1 = generate_key();
        let k2 = generate_key();
        // 128 ビットの乱数が衝突することは事実上ない
        assert_ne!(k1, k2);
    }
}
