//! # stm-transport
//!
//! stm プロトコルのデータグラム分割/再組み立て層。
//!
//! Instruction バイト列の Fragment 分割・圧縮・再組み立てと、
//! 暗号化済みデータグラムの wire framing を担当する。
//!
//! ## Fragment の Wire Format
//!
//! ```text
//! [instruction_id: u64 BE][fragment_word: u16 BE][payload...]
//!
//! fragment_word:
//!   bit 15 (MSB) = is_final フラグ（最後の Fragment なら 1）
//!   bit 14       = compressed フラグ（Instruction 全体が zstd 圧縮済みなら 1）
//!   bit 0..13    = fragment_num（0 始まり）
//! ```
//!
//! ## データグラムの全体構造
//!
//! ```text
//! UDP データグラム 1 個 = [nonce 後半 8 バイト][暗号化済み Fragment + 16 バイトタグ]
//! ```
//!
//! 復号前の切り分け（ゼロコピー）とオーバーヘッド定数は `packet`
//! モジュールが持つ。復号そのものは `stm-crypto` の担当。

pub mod error;
pub mod fragment;
pub mod packet;
pub mod timestamp;

pub use error::TransportError;
pub use fragment::{Fragment, FragmentAssembly, Fragmenter};
pub use packet::{seal_datagram, SealedDatagram, DATAGRAM_OVERHEAD};
pub use timestamp::Timestamp16;
