//! オーバーレイ要素
//!
//! 仮描画されるセル/カーソル移動をタグ付きバリアントで表す。
//! 条件付き（Conditional）バリアントは生成時のセル内容を記録しておき、
//! 正本のフレームバッファと突き合わせて正誤を判定できる。
//! 無条件バリアントは通知バーなど「正誤の概念がない」描画に使う。

use crate::terminal::{Cell, Framebuffer};

/// 正本と突き合わせた判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// まだ判定できない（期限内で、対象セルが手つかず）
    Pending,
    /// 予測どおりに正本が変化した
    Correct,
    /// 予測が外れた、または期限切れ
    IncorrectOrExpired,
}

/// 無条件のセル上書き（通知バーの文字など）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayCell {
    /// この時刻を過ぎたら消える（ローカル ms）
    pub expiration_time: u64,
    /// 生成時刻（RTT サンプル用、ローカル ms）
    pub prediction_time: u64,
    pub row: usize,
    pub col: usize,
    /// 上書きする内容
    pub replacement: Cell,
    /// 下線を引くか（エコー遅延時のフラグ表示）
    pub flag: bool,
}

/// 無条件のカーソル移動
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorMove {
    pub expiration_time: u64,
    pub prediction_time: u64,
    pub new_row: usize,
    pub new_col: usize,
}

/// 条件付きのセル上書き（キーストローク予測）
///
/// 生成時のセル内容 `original_contents` を控えておき、
/// 正本のセルがそれと一致する間だけ Pending を維持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalOverlayCell {
    pub expiration_time: u64,
    pub prediction_time: u64,
    pub row: usize,
    pub col: usize,
    /// 生成時点での正本セルのスナップショット
    pub original_contents: Cell,
    /// 予測内容
    pub replacement: Cell,
    pub flag: bool,
}

/// 条件付きのカーソル移動（予測チェーンの先頭）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalCursorMove {
    pub expiration_time: u64,
    pub prediction_time: u64,
    pub new_row: usize,
    pub new_col: usize,
}

/// オーバーレイ要素のタグ付きバリアント
///
/// エンジンの Vec に値としてインラインに置ける。ヒープ確保も
/// 仮想ディスパッチもキーストロークごとには発生しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayElement {
    Cell(OverlayCell),
    CursorMove(CursorMove),
    ConditionalCell(ConditionalOverlayCell),
    ConditionalCursorMove(ConditionalCursorMove),
}

impl OverlayElement {
    /// 要素の期限（ローカル ms）
    pub fn expiration_time(&self) -> u64 {
        match self {
            OverlayElement::Cell(e) => e.expiration_time,
            OverlayElement::CursorMove(e) => e.expiration_time,
            OverlayElement::ConditionalCell(e) => e.expiration_time,
            OverlayElement::ConditionalCursorMove(e) => e.expiration_time,
        }
    }

    /// 要素の生成時刻（ローカル ms）
    pub fn prediction_time(&self) -> u64 {
        match self {
            OverlayElement::Cell(e) => e.prediction_time,
            OverlayElement::CursorMove(e) => e.prediction_time,
            OverlayElement::ConditionalCell(e) => e.prediction_time,
            OverlayElement::ConditionalCursorMove(e) => e.prediction_time,
        }
    }

    /// 正本のフレームバッファと突き合わせて判定する
    pub fn get_validity(&self, fb: &Framebuffer, now_ms: u64) -> Validity {
        match self {
            // 無条件要素は期限だけで判定する（Correct にはならない）
            OverlayElement::Cell(e) => unconditional_validity(e.expiration_time, now_ms),
            OverlayElement::CursorMove(e) => unconditional_validity(e.expiration_time, now_ms),

            OverlayElement::ConditionalCell(e) => {
                let current = match fb.get_cell(e.row, e.col) {
                    Some(c) => c,
                    None => return Validity::IncorrectOrExpired,
                };

                if now_ms < e.expiration_time && *current == e.original_contents {
                    return Validity::Pending;
                }

                if *current == e.replacement {
                    Validity::Correct
                } else {
                    Validity::IncorrectOrExpired
                }
            }

            OverlayElement::ConditionalCursorMove(e) => {
                if e.new_row >= fb.height() || e.new_col >= fb.width() {
                    return Validity::IncorrectOrExpired;
                }

                if now_ms < e.expiration_time {
                    return Validity::Pending;
                }

                if fb.cursor_row() == e.new_row && fb.cursor_col() == e.new_col {
                    Validity::Correct
                } else {
                    Validity::IncorrectOrExpired
                }
            }
        }
    }

    /// フレームバッファに適用する（範囲外なら何もしない）
    pub fn apply(&self, fb: &mut Framebuffer) {
        match self {
            OverlayElement::Cell(e) => {
                apply_cell_overwrite(fb, e.row, e.col, &e.replacement, e.flag);
            }
            OverlayElement::ConditionalCell(e) => {
                apply_cell_overwrite(fb, e.row, e.col, &e.replacement, e.flag);
            }
            OverlayElement::CursorMove(e) => {
                fb.set_cursor(e.new_row, e.new_col);
            }
            OverlayElement::ConditionalCursorMove(e) => {
                fb.set_cursor(e.new_row, e.new_col);
            }
        }
    }
}

/// 無条件要素の判定: 期限内なら Pending、過ぎたら IncorrectOrExpired
fn unconditional_validity(expiration_time: u64, now_ms: u64) -> Validity {
    if now_ms < expiration_time {
        Validity::Pending
    } else {
        Validity::IncorrectOrExpired
    }
}

/// セル上書きの共通処理
fn apply_cell_overwrite(fb: &mut Framebuffer, row: usize, col: usize, replacement: &Cell, flag: bool) {
    let cell = match fb.get_mutable_cell(row, col) {
        Some(c) => c,
        None => return,
    };

    if *cell != *replacement {
        *cell = replacement.clone();
        if flag {
            cell.renditions.underlined = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::Cell;

    fn cond_cell(fb: &Framebuffer, row: usize, col: usize, ch: char, exp: u64) -> OverlayElement {
        let original = fb.get_cell(row, col).cloned().unwrap_or_else(Cell::blank);
        let mut replacement = original.clone();
        replacement.contents = vec![ch];
        OverlayElement::ConditionalCell(ConditionalOverlayCell {
            expiration_time: exp,
            prediction_time: 0,
            row,
            col,
            original_contents: original,
            replacement,
            flag: false,
        })
    }

    #[test]
    fn test_unconditional_cell_pending_until_expiry() {
        let fb = Framebuffer::new(10, 5);
        let el = OverlayElement::Cell(OverlayCell {
            expiration_time: 100,
            prediction_time: 0,
            row: 0,
            col: 0,
            replacement: Cell::from_char('x'),
            flag: false,
        });
        assert_eq!(el.get_validity(&fb, 99), Validity::Pending);
        assert_eq!(el.get_validity(&fb, 100), Validity::IncorrectOrExpired);
    }

    #[test]
    fn test_conditional_cell_lifecycle() {
        let mut fb = Framebuffer::new(10, 5);
        let el = cond_cell(&fb, 1, 2, 'a', 1000);

        // 正本が手つかずのうちは Pending
        assert_eq!(el.get_validity(&fb, 10), Validity::Pending);

        // サーバーが予測どおりのエコーを書いたら Correct
        fb.get_mutable_cell(1, 2).unwrap().contents = vec!['a'];
        assert_eq!(el.get_validity(&fb, 10), Validity::Correct);

        // 予測と違う内容になったら IncorrectOrExpired
        fb.get_mutable_cell(1, 2).unwrap().contents = vec!['b'];
        assert_eq!(el.get_validity(&fb, 10), Validity::IncorrectOrExpired);
    }

    #[test]
    fn test_conditional_cell_expires() {
        let fb = Framebuffer::new(10, 5);
        let el = cond_cell(&fb, 0, 0, 'a', 100);
        // 期限切れ後、セルは original のまま（= replacement ではない）
        assert_eq!(el.get_validity(&fb, 100), Validity::IncorrectOrExpired);
    }

    #[test]
    fn test_conditional_cell_out_of_bounds() {
        let fb = Framebuffer::new(10, 5);
        let el = OverlayElement::ConditionalCell(ConditionalOverlayCell {
            expiration_time: u64::MAX,
            prediction_time: 0,
            row: 99,
            col: 0,
            original_contents: Cell::blank(),
            replacement: Cell::from_char('a'),
            flag: false,
        });
        assert_eq!(el.get_validity(&fb, 0), Validity::IncorrectOrExpired);
    }

    #[test]
    fn test_conditional_cursor_move_validity() {
        let mut fb = Framebuffer::new(10, 5);
        let el = OverlayElement::ConditionalCursorMove(ConditionalCursorMove {
            expiration_time: 100,
            prediction_time: 0,
            new_row: 2,
            new_col: 3,
        });

        // 期限内は Pending（カーソルが一致していても確定しない）
        fb.set_cursor(2, 3);
        assert_eq!(el.get_validity(&fb, 50), Validity::Pending);

        // 期限後、一致していれば Correct
        assert_eq!(el.get_validity(&fb, 100), Validity::Correct);

        // 期限後、外れていれば IncorrectOrExpired
        fb.set_cursor(0, 0);
        assert_eq!(el.get_validity(&fb, 100), Validity::IncorrectOrExpired);
    }

    #[test]
    fn test_apply_writes_cell_and_flag() {
        let mut fb = Framebuffer::new(10, 5);
        let el = OverlayElement::Cell(OverlayCell {
            expiration_time: 100,
            prediction_time: 0,
            row: 0,
            col: 4,
            replacement: Cell::from_char('z'),
            flag: true,
        });
        el.apply(&mut fb);

        let cell = fb.get_cell(0, 4).unwrap();
        assert_eq!(cell.contents, vec!['z']);
        assert!(cell.renditions.underlined, "flag で下線が引かれるべき");
    }

    #[test]
    fn test_apply_out_of_bounds_is_noop() {
        let mut fb = Framebuffer::new(10, 5);
        let snapshot = fb.clone();
        let el = OverlayElement::Cell(OverlayCell {
            expiration_time: 100,
            prediction_time: 0,
            row: 99,
            col: 99,
            replacement: Cell::from_char('z'),
            flag: false,
        });
        el.apply(&mut fb);
        assert_eq!(fb, snapshot);
    }

    #[test]
    fn test_apply_cursor_move() {
        let mut fb = Framebuffer::new(10, 5);
        let el = OverlayElement::CursorMove(CursorMove {
            expiration_time: 100,
            prediction_time: 0,
            new_row: 3,
            new_col: 7,
        });
        el.apply(&mut fb);
        assert_eq!((fb.cursor_row(), fb.cursor_col()), (3, 7));
    }
}
