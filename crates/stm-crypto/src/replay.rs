//! Nonce 再生検出（スライディングウィンドウ）
//!
//! データグラムは順不同・重複ありで届く。認証に成功したパケットの
//! シーケンス番号を 64 個分のビットマスクで記憶し、
//! 既に見た番号と、ウィンドウから外れた古すぎる番号を拒否する。

/// シーケンス番号のスライディングウィンドウ
///
/// `highest` を右端とする 64 番号分のウィンドウを保持する。
/// `mask` の bit N は `highest - N` を受理済みかどうかを表す。
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// これまでに受理した最大のシーケンス番号
    highest: u64,
    /// 受理済みフラグ（bit 0 = highest そのもの）
    mask: u64,
    /// 最初のパケットを受理したか
    primed: bool,
}

/// ウィンドウ幅（mask のビット数）
const WINDOW: u64 = 64;

impl ReplayWindow {
    /// 空のウィンドウを生成する
    pub fn new() -> Self {
        ReplayWindow {
            highest: 0,
            mask: 0,
            primed: false,
        }
    }

    /// シーケンス番号を検査し、新規なら受理して true を返す
    ///
    /// 認証タグ検証に成功したパケットに対してのみ呼び出すこと
    /// （未認証の番号でウィンドウを汚染しないため）。
    ///
    /// # 戻り値
    /// - `true`: 初見の番号（受理、ウィンドウ更新済み）
    /// - `false`: 受信済み、またはウィンドウより古い番号（破棄すべき）
    pub fn check_and_update(&mut self, seq: u64) -> bool {
        if !self.primed {
            self.primed = true;
            self.highest = seq;
            self.mask = 1;
            return true;
        }

        if seq > self.highest {
            let shift = seq - self.highest;
            self.mask = if shift >= WINDOW {
                1
            } else {
                (self.mask << shift) | 1
            };
            self.highest = seq;
            return true;
        }

        let offset = self.highest - seq;
        if offset >= WINDOW {
            // ウィンドウから外れた古い番号は区別できないので拒否
            return false;
        }

        let bit = 1u64 << offset;
        if self.mask & bit != 0 {
            false
        } else {
            self.mask |= bit;
            true
        }
    }

    /// これまでに受理した最大のシーケンス番号（テスト用）
    pub fn highest(&self) -> u64 {
        self.highest
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
