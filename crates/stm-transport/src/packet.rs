//! データグラムの wire framing
//!
//! 暗号化済み Fragment 1 個と UDP データグラム 1 個を一対一に対応させる。
//! 送信方向は nonce 後半と暗号文の連結、受信方向は受信バッファを
//! ゼロコピーで 2 つの領域に切り分けるビューになる。復号そのものは
//! `stm-crypto` の仕事で、この層では「認証タグを含み得ない長さの
//! データグラムを早期に弾く」ことと、MTU 計算に使うオーバーヘッド
//! 定数の提供だけを行う。

use crate::error::TransportError;

/// wire 上の nonce 後半の長さ（バイト）
pub const NONCE_TAIL_LEN: usize = 8;

/// AES-128-OCB3 認証タグの長さ（バイト）
pub const AUTH_TAG_LEN: usize = 16;

/// データグラム 1 個あたりの暗号化オーバーヘッド
///
/// Fragment ペイロードに使える容量 = MTU − これ − Fragment ヘッダー。
pub const DATAGRAM_OVERHEAD: usize = NONCE_TAIL_LEN + AUTH_TAG_LEN;

/// 受信データグラムを領域分けしたゼロコピーのビュー
///
/// 受信バッファの寿命に縛られる。復号前の中身には意味がないので、
/// 所有権つきのコピーは作らない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealedDatagram<'a> {
    /// Nonce の後半 8 バイト
    pub nonce_tail: &'a [u8; 8],
    /// 暗号文（認証タグ込み）
    pub ciphertext: &'a [u8],
}

impl<'a> SealedDatagram<'a> {
    /// 受信バッファを nonce 部と暗号文に切り分ける
    ///
    /// # エラー
    /// - `TransportError::TooShort`: 空ペイロードの認証タグすら
    ///   入らない長さ（`DATAGRAM_OVERHEAD` 未満）
    pub fn parse(wire: &'a [u8]) -> Result<Self, TransportError> {
        if wire.len() < DATAGRAM_OVERHEAD {
            return Err(TransportError::TooShort);
        }

        let (head, ciphertext) = wire.split_at(NONCE_TAIL_LEN);
        let nonce_tail = head.try_into().map_err(|_| TransportError::TooShort)?;

        Ok(SealedDatagram {
            nonce_tail,
            ciphertext,
        })
    }
}

/// 送信データグラムを組み立てる（nonce 後半 + 暗号文の連結）
pub fn seal_datagram(nonce_tail: &[u8; 8], ciphertext: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(NONCE_TAIL_LEN + ciphertext.len());
    wire.extend_from_slice(nonce_tail);
    wire.extend_from_slice(ciphertext);
    wire
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_parse_recovers_regions() {
        let tail = [0x61u8, 0x6F, 0x03, 0x00, 0x00, 0x00, 0x00, 0x2C];
        let ciphertext: Vec<u8> = (0x30u8..0x55).collect(); // 37 バイト

        let wire = seal_datagram(&tail, &ciphertext);
        assert_eq!(wire.len(), NONCE_TAIL_LEN + ciphertext.len());

        let datagram = SealedDatagram::parse(&wire).unwrap();
        assert_eq!(datagram.nonce_tail, &tail);
        assert_eq!(datagram.ciphertext, ciphertext.as_slice());
    }

    #[test]
    fn test_parse_is_zero_copy() {
        let wire = seal_datagram(&[9u8; 8], &[7u8; 16]);
        let datagram = SealedDatagram::parse(&wire).unwrap();

        // ビューは元のバッファの中を指している
        let base = wire.as_ptr() as usize;
        assert_eq!(datagram.nonce_tail.as_ptr() as usize, base);
        assert_eq!(
            datagram.ciphertext.as_ptr() as usize,
            base + NONCE_TAIL_LEN
        );
    }

    #[test]
    fn test_runt_datagram_rejected() {
        // タグを含み得ない長さはすべて拒否
        assert_eq!(
            SealedDatagram::parse(&[]),
            Err(TransportError::TooShort)
        );
        assert_eq!(
            SealedDatagram::parse(&[0u8; DATAGRAM_OVERHEAD - 1]),
            Err(TransportError::TooShort)
        );
        assert!(SealedDatagram::parse(&[0u8; DATAGRAM_OVERHEAD]).is_ok());
    }

    #[test]
    fn test_overhead_is_nonce_plus_tag() {
        // MTU 計算の前提: 空ペイロードのデータグラムはちょうど
        // オーバーヘッド分の長さになる
        let wire = seal_datagram(&[0u8; 8], &[0u8; AUTH_TAG_LEN]);
        assert_eq!(wire.len(), DATAGRAM_OVERHEAD);
    }
}
