//! # stm-net
//!
//! UDP ソケットの上にプロトコル全層を積んだエッジクレート。
//!
//! ## 内部アーキテクチャ
//!
//! ```text
//! Transport<L, R>
//!   ├── Connection          (本クレート) - UDP ソケット + 暗号化 + ローミング
//!   │     └── CryptoSession (stm-crypto) - AES-128-OCB3 暗号化/復号
//!   ├── Fragmenter          (stm-transport) - Instruction を Fragment に分割
//!   ├── FragmentAssembly    (stm-transport) - Fragment を再組み立て
//!   ├── TransportSender     (stm-sync) - 差分生成・再送・シャットダウン
//!   └── TransportReceiver   (stm-sync) - 重複抑制・差分適用・ACK 管理
//! ```
//!
//! ## スレッドモデル
//!
//! シングルスレッドの協調モデル。唯一のブロッキングポイントは
//! `recv()` 内のソケット受信で、`wait_time()` 由来のタイムアウトで
//! 上限が切られる。

pub mod connection;
pub mod error;
pub mod transport;

pub use connection::{Connection, ConnectionStats};
pub use error::NetError;
pub use transport::{Transport, TransportStats};
