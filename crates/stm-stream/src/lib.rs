//! # stm-stream
//!
//! ユーザー入力（キーストローク）側の具象状態。
//!
//! トランスポートは状態型に対して総称的なので、入力側は
//! 「これまでに打たれたバイトの追記ログ」を一つの状態として表現する。
//! 差分はほとんどの場合「相手がまだ見ていない末尾のバイト列」になり、
//! 1 キーストロークの更新は数バイトの差分で届く。
//!
//! ## 差分フォーマット
//!
//! ```text
//! [tag: u8][payload...]
//!   tag = 0x00: payload を末尾に追記（通常ケース）
//!   tag = 0x01: payload で全置換（履歴が分岐した場合の保険）
//! ```

pub mod channel;

pub use channel::UserByteStream;
