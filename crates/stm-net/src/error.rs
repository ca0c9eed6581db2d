//! stm-net エラー型
//!
//! 呼び出し側に見えるのは致命的な失敗だけ。パケット単位の復号失敗や
//! プロトコル上の破棄は内部で数えて飲み込む。

use thiserror::Error;

/// ネットワーク層のエラー
#[derive(Debug, Error)]
pub enum NetError {
    /// ソケットの致命的エラー（バインド失敗、FD 破損など）
    #[error("socket I/O error: {0}")]
    Socket(#[from] std::io::Error),

    /// セッション鍵のデコード失敗
    #[error("invalid session key: {0}")]
    Key(stm_crypto::CryptoError),

    /// 送信時の暗号化失敗（通常は起こらない）
    #[error("encryption failed: {0}")]
    Crypto(stm_crypto::CryptoError),

    /// アドレス文字列のパース失敗
    #[error("invalid address: {0}")]
    Addr(#[from] std::net::AddrParseError),
}
