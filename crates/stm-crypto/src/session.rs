//! AES-128-OCB3 暗号セッション
//!
//! 一つの接続（鍵）に対する送受信双方の暗号状態を管理する。

use alloc::vec::Vec;

use aead::KeyInit;
use aes::Aes128;
use ocb3::Ocb3;

use crate::error::CryptoError;
use crate::nonce::PacketNonce;
use crate::replay::ReplayWindow;
use crate::{decode_base64_key, Direction};

/// AES-128-OCB3 (12バイト nonce, 16バイト tag) の型エイリアス
type Aes128Ocb3 = Ocb3<Aes128>;

/// 認証タグ長（バイト）
const TAG_LEN: usize = 16;

/// AES-128-OCB3 暗号セッション
///
/// 送信シーケンス番号を自動インクリメントして Nonce の重複を防ぎ、
/// 受信側ではスライディングウィンドウで再生パケットを拒否する。
/// 方向ビットにより、自分が送ったパケットの反射も検出する。
pub struct CryptoSession {
    cipher: Aes128Ocb3,
    /// 送信パケットに付く方向ビット
    direction: Direction,
    /// 次の送信シーケンス番号
    send_seq: u64,
    /// 受信側の再生検出ウィンドウ
    replay: ReplayWindow,
}

impl CryptoSession {
    /// Base64 鍵（22文字）からセッションを初期化する
    ///
    /// # 引数
    /// - `key_b64`: Base64 エンコードされた 16 バイト鍵（例: "4NeCCgvZFe2RnPgrcU1PQw"）
    /// - `direction`: このセッションが送信するパケットの方向
    ///
    /// # エラー
    /// - `CryptoError::InvalidBase64`: Base64 デコード失敗
    /// - `CryptoError::InvalidKeyLength`: 鍵長が 16 バイト以外
    pub fn from_base64_key(key_b64: &str, direction: Direction) -> Result<Self, CryptoError> {
        let key = decode_base64_key(key_b64)?;
        Ok(Self::from_key(key, direction))
    }

    /// 16 バイトの raw 鍵からセッションを初期化する
    pub fn from_key(key: [u8; 16], direction: Direction) -> Self {
        let cipher = Aes128Ocb3::new((&key).into());
        CryptoSession {
            cipher,
            direction,
            send_seq: 0,
            replay: ReplayWindow::new(),
        }
    }

    /// ペイロードを暗号化する
    ///
    /// # 引数
    /// - `payload`: 暗号化するペイロード（Fragment バイト列）
    ///
    /// # 戻り値
    /// nonce 後半 8 バイトと暗号文（認証タグ込み）。データグラムへの
    /// 連結は呼び出し側（`stm-transport` の `seal_datagram`）が担当する。
    pub fn encrypt_packet(&mut self, payload: &[u8]) -> Result<EncryptedPacket, CryptoError> {
        let seq = self.send_seq;
        self.send_seq += 1;

        let direction_seq = self.direction.apply_to_seq(seq);
        let nonce = PacketNonce::new(direction_seq);
        let block = nonce.to_block();

        use aead::Aead;
        let ciphertext = self
            .cipher
            .encrypt((&block).into(), payload)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(EncryptedPacket {
            nonce_tail: nonce.tail_bytes(),
            ciphertext,
        })
    }

    /// 受信パケットを復号する
    ///
    /// 認証に成功したパケットのみ再生ウィンドウを更新する。
    ///
    /// # 引数
    /// - `nonce_tail`: UDP ペイロード先頭の 8 バイト
    /// - `ciphertext`: 暗号文（認証タグ込み、最低 16 バイト）
    ///
    /// # エラー
    /// - `CryptoError::PacketTooShort`: 暗号文がタグ長未満
    /// - `CryptoError::DecryptionFailed`: 認証タグ検証失敗
    /// - `CryptoError::ReflectedPacket`: 方向ビットが自分の送信と同じ
    /// - `CryptoError::ReplayedNonce`: 受信済み Nonce
    pub fn decrypt_packet(
        &mut self,
        nonce_tail: &[u8; 8],
        ciphertext: &[u8],
    ) -> Result<DecryptedPacket, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::PacketTooShort);
        }

        let nonce = PacketNonce::from_nonce_tail(nonce_tail);
        let block = nonce.to_block();

        use aead::Aead;
        let payload = self
            .cipher
            .decrypt((&block).into(), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let direction_seq = nonce.direction_seq();
        let direction = Direction::from_seq(direction_seq);
        if direction == self.direction {
            return Err(CryptoError::ReflectedPacket);
        }

        let seq = direction_seq & !(1u64 << 63);
        if !self.replay.check_and_update(seq) {
            return Err(CryptoError::ReplayedNonce);
        }

        Ok(DecryptedPacket {
            seq,
            direction,
            payload,
        })
    }

    /// 現在の送信シーケンス番号を返す（テスト用）
    pub fn send_seq(&self) -> u64 {
        self.send_seq
    }
}

/// 暗号化されたパケットの内容
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedPacket {
    /// Nonce の後半 8 バイト（先頭 4 バイトのゼロは省略）
    pub nonce_tail: [u8; 8],
    /// 暗号文 + 16 バイトの認証タグ
    pub ciphertext: Vec<u8>,
}

/// 復号されたパケットの内容
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedPacket {
    /// シーケンス番号（direction ビット除く）
    pub seq: u64,
    /// パケットの方向
    pub direction: Direction,
    /// 復号されたペイロード（Fragment バイト列）
    pub payload: Vec<u8>,
}
