//! 通知バーエンジン
//!
//! 画面最上行（row 0）に太字・黄色・青背景のステータスバーを描く。
//! メッセージの有無と「最後にサーバーと交信してからの経過時間」の
//! 組み合わせで 4 種類のテンプレートを使い分ける。
//!
//! 再描画はレート制限（250ms に 1 回）つき。サーバーとの交信が
//! 4 秒以上途切れた後に再開したときは強制的に描き直す。

use unicode_width::UnicodeWidthChar;

use crate::element::{OverlayCell, OverlayElement};
use crate::terminal::{Cell, Framebuffer, Renditions};

/// メッセージとバーセルの生存時間（ms）
const MESSAGE_LIFETIME_MS: u64 = 1100;
/// 再描画のレート制限（ms）
const RENDER_INTERVAL_MS: u64 = 250;
/// この間隔以上あいた server_ping は再描画を強制する（ms）
const PING_GAP_RERENDER_MS: u64 = 4000;
/// 交信断とみなす閾値（ms）
const NO_CONTACT_MS: u64 = 5000;

/// バーの描画属性（太字・黄色・青背景）
fn bar_renditions() -> Renditions {
    Renditions {
        bold: true,
        underlined: false,
        foreground: 33,
        background: 44,
    }
}

/// 通知バーエンジン
pub struct NotificationEngine {
    /// row 0 に描く文字セル
    elements: Vec<OverlayElement>,
    /// 表示中のメッセージ（空 = なし）
    message: String,
    /// メッセージの失効時刻（ms）
    message_expiration: u64,
    /// 最後にサーバーと交信した時刻（ms）
    last_word: u64,
    /// 最後に render した時刻（ms）
    last_render: u64,
    /// レート制限を無視して描き直すか
    needs_render: bool,
}

impl NotificationEngine {
    pub fn new(now_ms: u64) -> Self {
        NotificationEngine {
            elements: Vec::new(),
            message: String::new(),
            message_expiration: 0,
            last_word: now_ms,
            last_render: 0,
            needs_render: true,
        }
    }

    /// サーバーからの着信を記録する
    ///
    /// 前回の交信から 4 秒以上あいていたら、「No contact」表示を
    /// 消すために次の render を強制する。
    pub fn server_ping(&mut self, t_ms: u64) {
        if t_ms.saturating_sub(self.last_word) > PING_GAP_RERENDER_MS {
            self.needs_render = true;
        }
        self.last_word = t_ms;
    }

    /// 通知メッセージを設定する（1100ms で自動失効）
    pub fn set_notification_string(&mut self, message: &str, now_ms: u64) {
        self.message = message.to_owned();
        self.message_expiration = now_ms + MESSAGE_LIFETIME_MS;
        self.needs_render = true;
    }

    /// バーのセルを組み立て直す
    pub fn render_notification(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_render) < RENDER_INTERVAL_MS && !self.needs_render {
            return;
        }

        self.needs_render = false;
        self.last_render = now_ms;
        self.elements.clear();

        if now_ms >= self.message_expiration {
            self.message.clear();
        }

        let time_expired = now_ms.saturating_sub(self.last_word) > NO_CONTACT_MS;
        let seconds_silent = (now_ms.saturating_sub(self.last_word) + 500) / 1000;

        let string_to_draw = match (self.message.is_empty(), time_expired) {
            (true, false) => return,
            (true, true) => format!(
                "[stm] No contact for {} seconds. [To quit: Ctrl-^ .]",
                seconds_silent
            ),
            (false, false) => format!("[stm] {}", self.message),
            (false, true) => format!(
                "[stm] {} [To quit: Ctrl-^ .] (No contact for {} seconds.)",
                self.message, seconds_silent
            ),
        };

        self.layout_string(&string_to_draw, now_ms);
    }

    /// 文字列を row 0 のセル列に変換する
    ///
    /// 全角文字は 2 桁進め、結合文字は直前のセルにぶら下げる。
    /// 文字列が結合文字で始まる場合は no-break space の土台セルを作る。
    fn layout_string(&mut self, s: &str, now_ms: u64) {
        let expiration = now_ms + MESSAGE_LIFETIME_MS;
        let mut overlay_col: usize = 0;
        let mut current: Option<OverlayCell> = None;

        for ch in s.chars() {
            match ch.width() {
                Some(w @ (1 | 2)) => {
                    // 前のセルを確定して新しいセルを始める
                    if let Some(cell) = current.take() {
                        self.elements.push(OverlayElement::Cell(cell));
                    }
                    current = Some(OverlayCell {
                        expiration_time: expiration,
                        prediction_time: now_ms,
                        row: 0,
                        col: overlay_col,
                        replacement: Cell {
                            contents: vec![ch],
                            renditions: bar_renditions(),
                            width: w as u8,
                        },
                        flag: false,
                    });
                    overlay_col += w;
                }
                Some(0) => {
                    // 結合文字: 現在のセルに付ける。先頭に来たら NBSP を土台にする
                    let cell = current.get_or_insert_with(|| {
                        let base = OverlayCell {
                            expiration_time: expiration,
                            prediction_time: now_ms,
                            row: 0,
                            col: overlay_col,
                            replacement: Cell {
                                contents: vec!['\u{A0}'],
                                renditions: bar_renditions(),
                                width: 1,
                            },
                            flag: false,
                        };
                        overlay_col += 1;
                        base
                    });
                    cell.replacement.contents.push(ch);
                }
                // 制御文字などは幅を持たないので飛ばす
                _ => {}
            }
        }

        if let Some(cell) = current.take() {
            self.elements.push(OverlayElement::Cell(cell));
        }
    }

    /// バーをフレームバッファに描く
    ///
    /// セルがなければ何もしない。ある場合は row 0 全体を青背景で塗り、
    /// カーソルが row 0 にあれば隠す。
    pub fn apply(&self, fb: &mut Framebuffer) {
        if self.elements.is_empty() {
            return;
        }

        let mut bar = Cell {
            contents: vec![' '],
            renditions: bar_renditions(),
            width: 1,
        };
        bar.renditions.bold = false;

        for col in 0..fb.width() {
            if let Some(cell) = fb.get_mutable_cell(0, col) {
                *cell = bar.clone();
            }
        }

        if fb.cursor_row() == 0 {
            fb.cursor_visible = false;
        }

        for el in &self.elements {
            el.apply(fb);
        }
    }

    /// 最も近い期限（セルがなければ None）
    pub fn min_expiration(&self) -> Option<u64> {
        self.elements.iter().map(|el| el.expiration_time()).min()
    }

    /// バーのセル数（テスト用）
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// row 0 の文字列を読み出すヘルパー
    fn row_text(fb: &Framebuffer) -> String {
        let mut s = String::new();
        for col in 0..fb.width() {
            if let Some(cell) = fb.get_cell(0, col) {
                for &ch in &cell.contents {
                    s.push(ch);
                }
            }
        }
        s
    }

    #[test]
    fn test_notification_renders_message() {
        let mut fb = Framebuffer::new(80, 24);
        let mut n = NotificationEngine::new(0);

        n.set_notification_string("hi", 0);
        n.render_notification(0);
        n.apply(&mut fb);

        let text = row_text(&fb);
        assert!(text.starts_with("[stm] hi"), "row 0: {:?}", text);

        // メッセージセルは太字・黄色・青背景
        let cell = fb.get_cell(0, 0).unwrap();
        assert!(cell.renditions.bold);
        assert_eq!(cell.renditions.foreground, 33);
        assert_eq!(cell.renditions.background, 44);
    }

    #[test]
    fn test_message_expires_after_lifetime() {
        let mut n = NotificationEngine::new(0);
        n.set_notification_string("hi", 0);
        n.render_notification(0);
        assert!(n.element_count() > 0);

        // server_ping を続けて「No contact」にはしない
        n.server_ping(1000);
        n.render_notification(0 + MESSAGE_LIFETIME_MS + 1);
        assert_eq!(n.element_count(), 0, "1100ms 経過でバーは消えるべき");

        let mut fb = Framebuffer::new(80, 24);
        n.apply(&mut fb);
        assert_eq!(fb.get_cell(0, 0), Some(&Cell::blank()));
    }

    #[test]
    fn test_no_contact_template() {
        let mut fb = Framebuffer::new(100, 24);
        let mut n = NotificationEngine::new(0);

        // 7.2 秒間サーバーと交信がない
        n.render_notification(7200);
        n.apply(&mut fb);

        let text = row_text(&fb);
        assert!(
            text.contains("No contact for 7 seconds"),
            "row 0: {:?}",
            text
        );
        assert!(text.contains("[To quit: Ctrl-^ .]"));
    }

    #[test]
    fn test_message_and_no_contact_combined() {
        let mut fb = Framebuffer::new(120, 24);
        let mut n = NotificationEngine::new(0);

        n.set_notification_string("Network degraded.", 6000);
        n.render_notification(6000);
        n.apply(&mut fb);

        let text = row_text(&fb);
        assert!(text.contains("[stm] Network degraded."));
        assert!(text.contains("(No contact for 6 seconds.)"));
    }

    #[test]
    fn test_render_rate_limited() {
        let mut n = NotificationEngine::new(0);
        n.set_notification_string("hi", 0);
        n.render_notification(0);
        n.render_notification(1000); // まだ失効前。last_render = 1000
        assert!(n.element_count() > 0);

        // needs_render が立っていない 250ms 以内の再描画は無視される
        // （メッセージが失効していてもセルは残る）
        n.render_notification(1150);
        assert!(n.element_count() > 0);

        // 前回の render から 250ms 過ぎた時点で消える
        n.render_notification(1000 + RENDER_INTERVAL_MS);
        assert_eq!(n.element_count(), 0);
    }

    #[test]
    fn test_ping_gap_forces_render() {
        let mut n = NotificationEngine::new(0);
        n.render_notification(6000); // No contact 表示
        assert!(n.element_count() > 0);

        // 4 秒を超える沈黙の後の着信は強制再描画 → バーが消える
        n.server_ping(6100);
        n.render_notification(6101);
        assert_eq!(n.element_count(), 0);
    }

    #[test]
    fn test_cursor_hidden_under_bar() {
        let mut fb = Framebuffer::new(80, 24);
        fb.set_cursor(0, 5);
        let mut n = NotificationEngine::new(0);
        n.set_notification_string("hi", 0);
        n.render_notification(0);
        n.apply(&mut fb);
        assert!(!fb.cursor_visible);
    }

    #[test]
    fn test_wide_chars_advance_two_columns() {
        let mut n = NotificationEngine::new(0);
        n.set_notification_string("全角", 0);
        n.render_notification(0);

        // "[stm] " は 6 桁、全角 2 文字は 2 桁ずつ
        let cols: Vec<usize> = n
            .elements
            .iter()
            .map(|el| match el {
                OverlayElement::Cell(c) => c.col,
                other => panic!("通知はセルのみのはず: {:?}", other),
            })
            .collect();
        assert_eq!(&cols[6..], &[6, 8]);
    }

    #[test]
    fn test_combining_mark_attaches_to_previous_cell() {
        let mut n = NotificationEngine::new(0);
        // e + 結合アクセント
        n.set_notification_string("e\u{0301}", 0);
        n.render_notification(0);

        let last = match n.elements.last() {
            Some(OverlayElement::Cell(c)) => c,
            other => panic!("セルのはず: {:?}", other.map(|_| ())),
        };
        assert_eq!(last.replacement.contents, vec!['e', '\u{0301}']);
    }

    #[test]
    fn test_leading_combining_mark_gets_nbsp_carrier() {
        let mut n = NotificationEngine::new(0);
        // メッセージ全体が結合文字で始まることはないが、layout は
        // 単体でも壊れないこと
        n.layout_string("\u{0301}x", 0);

        match &n.elements[0] {
            OverlayElement::Cell(c) => {
                assert_eq!(c.replacement.contents, vec!['\u{A0}', '\u{0301}']);
                assert_eq!(c.col, 0);
            }
            other => panic!("セルのはず: {:?}", other),
        }
        match &n.elements[1] {
            OverlayElement::Cell(c) => {
                assert_eq!(c.replacement.contents, vec!['x']);
                assert_eq!(c.col, 1);
            }
            other => panic!("セルのはず: {:?}", other),
        }
    }
}
