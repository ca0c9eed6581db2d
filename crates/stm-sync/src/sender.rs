//! 送信側状態機械
//!
//! 送信済み状態の履歴（先頭 = アンカー = 相手が ACK 済みの状態）を保持し、
//! アンカーから現在状態への差分 Instruction を生成する。送信ペースは
//! `send_interval`（SRTT の半分、上下限つき）で制御し、ACK が進まないまま
//! RTO が経過したら同じ `new_num` の差分を再送する。
//!
//! I/O は一切行わない。`tick` が返した Instruction の暗号化・分割・送信は
//! 呼び出し側（`stm-net`）が担当する。

use stm_proto::{Instruction, SHUTDOWN_NUM};
use stm_transport::Timestamp16;
use tracing::{debug, trace, warn};

use crate::rtt::RttEstimator;
use crate::state::{SyncState, TimestampedState};
use crate::{
    HEARTBEAT_INTERVAL_MS, SEND_INTERVAL_MAX_MS, SEND_INTERVAL_MIN_MS, SHUTDOWN_TIMEOUT_MS,
    WAIT_IDLE_MS,
};

/// シャットダウン状態機械
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// 通常運転
    Active,
    /// ローカル発のシャットダウン要求を送信中（new_num = u64::MAX）
    ShutdownSending,
    /// 相手がシャットダウンを確認した（終了・正常）
    ShutdownAcknowledged,
    /// 相手発のシャットダウン要求を受信、確認送信待ち
    CounterpartyShutdown,
    /// 相手発のシャットダウンに確認を 1 回送信済み（終了・相手主導）
    CounterpartyShutdownAcked,
    /// 確認が来ないままタイムアウト（終了・失敗）
    ShutdownAckTimedOut,
}

/// 受信側から送信側へ渡す ACK 情報のスナップショット
///
/// 送信側と受信側は可変状態を共有しない。tick のたびに
/// 呼び出し側がこのビューを組み立てて渡す。
#[derive(Debug, Clone, Copy)]
pub struct AckView {
    /// 受信済みの相手状態番号の最大値
    pub ack_num: u64,
    /// ACK 期限が到来しているか
    pub ack_due: bool,
    /// エコーバックするタイムスタンプ（0 = なし）
    pub timestamp_reply: u16,
}

/// 送信側状態機械
pub struct TransportSender<T: SyncState> {
    /// 送信済み状態の履歴。不変条件: 非空、[0] がアンカー、num は狭義単調増加
    sent_states: Vec<TimestampedState<T>>,
    /// 実際に送信した最大の状態番号
    last_sent_num: u64,
    /// 最後に何かを送信した時刻（ms、0 = 未送信）
    last_send_ms: u64,
    /// RTT 推定器（send_interval と RTO の根拠）
    rtt: RttEstimator,
    /// 送信間隔の下限（ms、set_send_delay で変更可能）
    send_delay_ms: u64,
    /// シャットダウン状態
    shutdown: ShutdownState,
    /// ShutdownSending に入った時刻（ms）
    shutdown_started_ms: u64,
}

impl<T: SyncState> TransportSender<T> {
    /// 初期状態（番号 0）でセンダーを生成する
    pub fn new(initial_state: T, now_ms: u64) -> Self {
        TransportSender {
            sent_states: vec![TimestampedState::new(0, now_ms, initial_state)],
            last_sent_num: 0,
            last_send_ms: 0,
            rtt: RttEstimator::new(),
            send_delay_ms: SEND_INTERVAL_MIN_MS,
            shutdown: ShutdownState::Active,
            shutdown_started_ms: 0,
        }
    }

    /// 現在のローカル状態（履歴の末尾）
    pub fn current_state(&self) -> &T {
        &self.sent_states[self.sent_states.len() - 1].state
    }

    /// ローカル状態を更新する
    ///
    /// 直前の状態と等しい場合は何もしない。異なる場合のみ次の番号で
    /// 履歴に追加する。`start_shutdown` 後の呼び出しは不正で、無視される。
    pub fn set_current_state(&mut self, state: T, now_ms: u64) {
        if self.shutdown != ShutdownState::Active {
            warn!("set_current_state called during shutdown; ignored");
            return;
        }

        let last = &self.sent_states[self.sent_states.len() - 1];
        if last.state == state {
            return;
        }

        let next_num = last.num + 1;
        self.sent_states
            .push(TimestampedState::new(next_num, now_ms, state));
    }

    /// アンカー（相手が ACK 済みの状態）の番号
    pub fn get_sent_state_acked(&self) -> u64 {
        self.sent_states[0].num
    }

    /// 現在状態の番号
    pub fn get_sent_state_last(&self) -> u64 {
        self.sent_states[self.sent_states.len() - 1].num
    }

    /// 相手からの ACK を処理してアンカーを進める
    ///
    /// `ack_num` と一致する履歴エントリがある場合のみ、それより古い
    /// エントリをすべて破棄する（一致エントリが新しいアンカーになる）。
    /// シャットダウン番兵値は呼び出し側でフィルタされる前提だが、
    /// 二重に防御する。
    pub fn process_acknowledgment_through(&mut self, ack_num: u64) {
        if ack_num == SHUTDOWN_NUM {
            return;
        }

        if self.sent_states.iter().any(|s| s.num == ack_num) {
            let before = self.sent_states.len();
            self.sent_states.retain(|s| s.num >= ack_num);
            if self.sent_states.len() != before {
                trace!(ack_num, "anchor advanced");
            }
        }
    }

    /// RTT サンプル（ミリ秒）を取り込む
    pub fn on_rtt_sample(&mut self, r_ms: f64) {
        self.rtt.observe(r_ms);
    }

    /// 送信間隔（ms）: `clamp(ceil(SRTT / 2), send_delay, SEND_INTERVAL_MAX)`
    pub fn send_interval(&self) -> u64 {
        let half_rtt = (self.rtt.srtt() / 2.0).ceil() as u64;
        half_rtt.clamp(
            self.send_delay_ms.max(SEND_INTERVAL_MIN_MS),
            SEND_INTERVAL_MAX_MS,
        )
    }

    /// 送信間隔の下限を設定する（ms）
    pub fn set_send_delay(&mut self, delay_ms: u64) {
        self.send_delay_ms = delay_ms;
    }

    /// 再送タイムアウト（ms）
    pub fn rto_ms(&self) -> u64 {
        self.rtt.rto_ms()
    }

    /// RTT 推定器への参照（統計用）
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// シャットダウン要求の送信を開始する
    pub fn start_shutdown(&mut self, now_ms: u64) {
        if self.shutdown == ShutdownState::Active {
            debug!("shutdown started");
            self.shutdown = ShutdownState::ShutdownSending;
            self.shutdown_started_ms = now_ms;
        }
    }

    /// 相手からシャットダウン要求（new_num = u64::MAX）を受信した
    ///
    /// 自分もシャットダウン送信中だった場合は、相手も接続を畳んでいる
    /// ということなので確認を受けたものとして扱う。
    pub fn counterparty_shutdown_requested(&mut self) {
        match self.shutdown {
            ShutdownState::Active => {
                debug!("counterparty requested shutdown");
                self.shutdown = ShutdownState::CounterpartyShutdown;
            }
            ShutdownState::ShutdownSending => {
                debug!("mutual shutdown; treating as acknowledged");
                self.shutdown = ShutdownState::ShutdownAcknowledged;
            }
            _ => {}
        }
    }

    /// 相手からシャットダウン確認（ack_num = u64::MAX）を受信した
    pub fn shutdown_acknowledged_received(&mut self) {
        if self.shutdown == ShutdownState::ShutdownSending {
            debug!("shutdown acknowledged by peer");
            self.shutdown = ShutdownState::ShutdownAcknowledged;
        }
    }

    /// ローカル発のシャットダウンが進行中か
    pub fn get_shutdown_in_progress(&self) -> bool {
        matches!(
            self.shutdown,
            ShutdownState::ShutdownSending
                | ShutdownState::ShutdownAcknowledged
                | ShutdownState::ShutdownAckTimedOut
        )
    }

    /// シャットダウンが相手に確認されたか
    pub fn get_shutdown_acknowledged(&self) -> bool {
        self.shutdown == ShutdownState::ShutdownAcknowledged
    }

    /// シャットダウン確認待ちがタイムアウトしたか
    pub fn shutdown_ack_timed_out(&self) -> bool {
        self.shutdown == ShutdownState::ShutdownAckTimedOut
    }

    /// 相手発のシャットダウンに確認を送信済みか
    pub fn get_counterparty_shutdown_acknowledged(&self) -> bool {
        self.shutdown == ShutdownState::CounterpartyShutdownAcked
    }

    /// 現在のシャットダウン状態（テスト用）
    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown
    }

    /// 送信判定を行い、送信すべき Instruction を返す
    ///
    /// 送信するものがなければ `None`。返した Instruction の暗号化・分割・
    /// 送信と、送信後の ACK 期限クリアは呼び出し側が行う。
    pub fn tick(&mut self, now_ms: u64, ack: &AckView) -> Option<Instruction> {
        match self.shutdown {
            ShutdownState::ShutdownAcknowledged
            | ShutdownState::CounterpartyShutdownAcked
            | ShutdownState::ShutdownAckTimedOut => None,

            ShutdownState::ShutdownSending => {
                if now_ms.saturating_sub(self.shutdown_started_ms) >= SHUTDOWN_TIMEOUT_MS {
                    warn!("shutdown ack timed out");
                    self.shutdown = ShutdownState::ShutdownAckTimedOut;
                    return None;
                }
                if now_ms.saturating_sub(self.last_send_ms) < self.send_interval() {
                    return None;
                }
                self.last_send_ms = now_ms;
                Some(Instruction::new_send(
                    self.get_sent_state_acked(),
                    SHUTDOWN_NUM,
                    ack.ack_num,
                    self.get_sent_state_acked(),
                    Timestamp16::now_from_ms(now_ms).raw(),
                    ack.timestamp_reply,
                    Vec::new(),
                ))
            }

            ShutdownState::CounterpartyShutdown => {
                // 確認はちょうど 1 回。以後この接続は終了状態
                self.shutdown = ShutdownState::CounterpartyShutdownAcked;
                self.last_send_ms = now_ms;
                Some(Instruction::new_ack(
                    self.get_sent_state_last(),
                    SHUTDOWN_NUM,
                    self.get_sent_state_acked(),
                    Timestamp16::now_from_ms(now_ms).raw(),
                    ack.timestamp_reply,
                ))
            }

            ShutdownState::Active => self.tick_active(now_ms, ack),
        }
    }

    fn tick_active(&mut self, now_ms: u64, ack: &AckView) -> Option<Instruction> {
        let elapsed = now_ms.saturating_sub(self.last_send_ms);
        let last_num = self.get_sent_state_last();
        let anchor_num = self.get_sent_state_acked();

        // (i) 未送信の新しい状態がある → 送信間隔を守って差分を送る
        if last_num > self.last_sent_num && elapsed >= self.send_interval() {
            return Some(self.make_data_instruction(now_ms, ack));
        }

        // 送信済みだが ACK が進まない → RTO ごとに同じ new_num で再送
        if last_num == self.last_sent_num && last_num > anchor_num && elapsed >= self.rto_ms() {
            trace!(new_num = last_num, "retransmitting");
            return Some(self.make_data_instruction(now_ms, ack));
        }

        // (ii) ACK 期限が到来していて、最後の送信から間隔が空いた
        if ack.ack_due && elapsed >= self.send_interval() {
            return Some(self.make_ack_instruction(now_ms, ack));
        }

        // ハートビート: 接続維持のための ACK のみ送信
        if elapsed >= HEARTBEAT_INTERVAL_MS {
            return Some(self.make_ack_instruction(now_ms, ack));
        }

        None
    }

    /// `tick` が次に仕事をするまでの時間（ms）
    ///
    /// ACK 期限・再送期限・ハートビートのうち最も近いもの。
    /// やることがなければ `WAIT_IDLE_MS`。
    pub fn wait_time(&self, now_ms: u64, ack_deadline: Option<u64>) -> u64 {
        let mut next: u64 = WAIT_IDLE_MS;

        match self.shutdown {
            ShutdownState::ShutdownAcknowledged
            | ShutdownState::CounterpartyShutdownAcked
            | ShutdownState::ShutdownAckTimedOut => return WAIT_IDLE_MS,

            ShutdownState::CounterpartyShutdown => return 0,

            ShutdownState::ShutdownSending => {
                next = next.min(self.last_send_ms + self.send_interval());
                next = next.min(self.shutdown_started_ms + SHUTDOWN_TIMEOUT_MS);
            }

            ShutdownState::Active => {
                let last_num = self.get_sent_state_last();
                let anchor_num = self.get_sent_state_acked();

                if last_num > self.last_sent_num {
                    next = next.min(self.last_send_ms + self.send_interval());
                } else if last_num > anchor_num {
                    next = next.min(self.last_send_ms + self.rto_ms());
                }

                if let Some(deadline) = ack_deadline {
                    // ACK は期限と送信間隔の両方を満たした時点で送る
                    next = next.min(deadline.max(self.last_send_ms + self.send_interval()));
                }

                next = next.min(self.last_send_ms + HEARTBEAT_INTERVAL_MS);
            }
        }

        next.saturating_sub(now_ms)
    }

    /// アンカーから現在状態への差分 Instruction を組み立てる
    fn make_data_instruction(&mut self, now_ms: u64, ack: &AckView) -> Instruction {
        let anchor = &self.sent_states[0];
        let last = &self.sent_states[self.sent_states.len() - 1];
        let diff = anchor.state.diff_from(&last.state);

        let instr = Instruction::new_send(
            anchor.num,
            last.num,
            ack.ack_num,
            anchor.num,
            Timestamp16::now_from_ms(now_ms).raw(),
            ack.timestamp_reply,
            diff,
        );

        self.last_sent_num = instr.new_num;
        self.last_send_ms = now_ms;
        instr
    }

    /// ACK のみの Instruction（差分なし、番号は現在状態のまま）
    fn make_ack_instruction(&mut self, now_ms: u64, ack: &AckView) -> Instruction {
        self.last_send_ms = now_ms;
        Instruction::new_ack(
            self.get_sent_state_last(),
            ack.ack_num,
            self.get_sent_state_acked(),
            Timestamp16::now_from_ms(now_ms).raw(),
            ack.timestamp_reply,
        )
    }

    /// 履歴の長さ（テスト用）
    pub fn sent_states_len(&self) -> usize {
        self.sent_states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state::TextState;
    use crate::ACK_INTERVAL_MS;

    fn no_ack() -> AckView {
        AckView {
            ack_num: 0,
            ack_due: false,
            timestamp_reply: 0,
        }
    }

    fn sender() -> TransportSender<TextState> {
        TransportSender::new(TextState::init(), 0)
    }

    #[test]
    fn test_initial_invariants() {
        let s = sender();
        assert_eq!(s.get_sent_state_acked(), 0);
        assert_eq!(s.get_sent_state_last(), 0);
        assert_eq!(s.sent_states_len(), 1);
        assert_eq!(s.shutdown_state(), ShutdownState::Active);
    }

    #[test]
    fn test_set_current_state_appends_only_on_change() {
        let mut s = sender();
        s.set_current_state(TextState("a".into()), 10);
        assert_eq!(s.get_sent_state_last(), 1);

        // 同じ値では番号が進まない
        s.set_current_state(TextState("a".into()), 20);
        assert_eq!(s.get_sent_state_last(), 1);

        s.set_current_state(TextState("ab".into()), 30);
        assert_eq!(s.get_sent_state_last(), 2);
    }

    #[test]
    fn test_tick_sends_diff_from_anchor() {
        let mut s = sender();
        s.set_current_state(TextState("hello".into()), 100);

        let instr = s.tick(1000, &no_ack()).expect("差分が送信されるべき");
        assert_eq!(instr.old_num, 0);
        assert_eq!(instr.new_num, 1);
        assert_eq!(instr.throwaway_num, 0);
        assert_eq!(instr.diff, b"hello");
    }

    #[test]
    fn test_tick_paces_sends() {
        let mut s = sender();
        s.set_current_state(TextState("a".into()), 100);
        assert!(s.tick(1000, &no_ack()).is_some());

        // 直後に状態が変わっても送信間隔が空くまで送らない
        s.set_current_state(TextState("ab".into()), 1001);
        assert!(s.tick(1002, &no_ack()).is_none());

        let later = 1000 + s.send_interval();
        let instr = s.tick(later, &no_ack()).expect("間隔経過後は送信すべき");
        assert_eq!(instr.new_num, 2);
        assert_eq!(instr.diff, b"ab");
    }

    #[test]
    fn test_ack_advances_anchor() {
        let mut s = sender();
        s.set_current_state(TextState("a".into()), 100);
        s.set_current_state(TextState("ab".into()), 200);
        assert_eq!(s.sent_states_len(), 3);

        s.process_acknowledgment_through(1);
        assert_eq!(s.get_sent_state_acked(), 1);
        assert_eq!(s.sent_states_len(), 2);

        // 一致しない番号では何も起きない
        s.process_acknowledgment_through(99);
        assert_eq!(s.get_sent_state_acked(), 1);
    }

    #[test]
    fn test_diff_uses_advanced_anchor() {
        let mut s = sender();
        s.set_current_state(TextState("a".into()), 100);
        let _ = s.tick(1000, &no_ack());
        s.process_acknowledgment_through(1);

        s.set_current_state(TextState("ab".into()), 1100);
        let instr = s.tick(2000, &no_ack()).unwrap();
        assert_eq!(instr.old_num, 1);
        assert_eq!(instr.new_num, 2);
        assert_eq!(instr.throwaway_num, 1);
    }

    #[test]
    fn test_retransmit_after_rto() {
        let mut s = sender();
        s.set_current_state(TextState("a".into()), 100);
        let first = s.tick(1000, &no_ack()).unwrap();

        // RTO 未満では再送しない
        assert!(s.tick(1000 + s.rto_ms() - 1, &no_ack()).is_none());

        // RTO 経過後、同じ new_num で再送
        let retx = s.tick(1000 + s.rto_ms(), &no_ack()).expect("再送すべき");
        assert_eq!(retx.new_num, first.new_num);
        assert_eq!(retx.diff, first.diff);
    }

    #[test]
    fn test_no_retransmit_after_ack() {
        let mut s = sender();
        s.set_current_state(TextState("a".into()), 100);
        let _ = s.tick(1000, &no_ack());
        s.process_acknowledgment_through(1);

        // ACK 済みなら RTO を超えても再送しない（ハートビート到来までは沈黙）
        assert!(s.tick(1000 + s.rto_ms() + 1, &no_ack()).is_none());
    }

    #[test]
    fn test_ack_only_instruction_when_due() {
        let mut s = sender();
        let ack = AckView {
            ack_num: 7,
            ack_due: true,
            timestamp_reply: 0,
        };
        let instr = s.tick(1000, &ack).expect("ACK を送信すべき");
        assert!(!instr.has_diff());
        assert_eq!(instr.ack_num, 7);
        assert_eq!(instr.old_num, instr.new_num);
    }

    #[test]
    fn test_heartbeat_after_interval() {
        let mut s = sender();
        let first = s.tick(HEARTBEAT_INTERVAL_MS, &no_ack());
        assert!(first.is_some(), "ハートビートが生成されるべき");
        assert!(!first.unwrap().has_diff());

        // 送信直後は不要
        assert!(s.tick(HEARTBEAT_INTERVAL_MS + 1, &no_ack()).is_none());
    }

    #[test]
    fn test_wait_time_idle_geq_send_interval() {
        let mut s = sender();
        let _ = s.tick(HEARTBEAT_INTERVAL_MS, &no_ack()); // 送信直後の静止状態を作る

        // 保留差分も ACK 義務もないとき、wait_time は送信間隔以上
        let wait = s.wait_time(HEARTBEAT_INTERVAL_MS + 1, None);
        assert!(wait >= s.send_interval());
    }

    #[test]
    fn test_wait_time_tracks_ack_deadline() {
        let mut s = sender();
        let _ = s.tick(3000, &no_ack());

        let deadline = 3000 + ACK_INTERVAL_MS;
        let wait = s.wait_time(3010, Some(deadline));
        // ACK 期限は送信間隔との max で評価される
        let expected = deadline.max(3000 + s.send_interval()) - 3010;
        assert_eq!(wait, expected);
    }

    #[test]
    fn test_send_interval_clamps() {
        let mut s = sender();
        // 未観測時は保守的（上限）
        assert_eq!(s.send_interval(), SEND_INTERVAL_MAX_MS);

        s.on_rtt_sample(10.0);
        assert_eq!(s.send_interval(), SEND_INTERVAL_MIN_MS);

        for _ in 0..100 {
            s.on_rtt_sample(10_000.0);
        }
        assert_eq!(s.send_interval(), SEND_INTERVAL_MAX_MS);
    }

    #[test]
    fn test_send_delay_raises_floor() {
        let mut s = sender();
        s.on_rtt_sample(10.0);
        assert_eq!(s.send_interval(), SEND_INTERVAL_MIN_MS);

        s.set_send_delay(60);
        assert_eq!(s.send_interval(), 60);
    }

    #[test]
    fn test_shutdown_sends_sentinel() {
        let mut s = sender();
        s.start_shutdown(1000);
        assert!(s.get_shutdown_in_progress());

        let instr = s.tick(2000, &no_ack()).expect("シャットダウン要求を送信すべき");
        assert!(instr.is_shutdown_request());
        assert_eq!(instr.new_num, u64::MAX);
        assert!(!instr.has_diff());
    }

    #[test]
    fn test_shutdown_acknowledged() {
        let mut s = sender();
        s.start_shutdown(1000);
        let _ = s.tick(2000, &no_ack());

        s.shutdown_acknowledged_received();
        assert!(s.get_shutdown_acknowledged());
        assert!(!s.shutdown_ack_timed_out());
        // 終了状態では何も送らない
        assert!(s.tick(10_000, &no_ack()).is_none());
    }

    #[test]
    fn test_shutdown_timeout() {
        let mut s = sender();
        s.start_shutdown(1000);
        let _ = s.tick(2000, &no_ack());

        assert!(s.tick(1000 + SHUTDOWN_TIMEOUT_MS, &no_ack()).is_none());
        assert!(s.shutdown_ack_timed_out());
        assert!(!s.get_shutdown_acknowledged());
    }

    #[test]
    fn test_shutdown_retries_until_timeout() {
        let mut s = sender();
        s.start_shutdown(0);

        let mut sent = 0;
        let mut now = 0;
        while now < SHUTDOWN_TIMEOUT_MS {
            if s.tick(now, &no_ack()).is_some() {
                sent += 1;
            }
            now += s.send_interval();
        }
        assert!(sent > 1, "タイムアウトまで再試行を繰り返すべき");
    }

    #[test]
    fn test_counterparty_shutdown_acks_exactly_once() {
        let mut s = sender();
        s.counterparty_shutdown_requested();
        assert_eq!(s.shutdown_state(), ShutdownState::CounterpartyShutdown);
        assert_eq!(s.wait_time(0, None), 0);

        let instr = s.tick(100, &no_ack()).expect("確認を送信すべき");
        assert!(instr.is_shutdown_ack());
        assert!(s.get_counterparty_shutdown_acknowledged());

        // 2 回目はない
        assert!(s.tick(10_000, &no_ack()).is_none());
    }

    #[test]
    fn test_set_current_state_ignored_after_shutdown() {
        let mut s = sender();
        s.start_shutdown(100);
        s.set_current_state(TextState("late".into()), 200);
        assert_eq!(s.get_sent_state_last(), 0);
    }

    #[test]
    fn test_mutual_shutdown_counts_as_ack() {
        let mut s = sender();
        s.start_shutdown(100);
        s.counterparty_shutdown_requested();
        assert!(s.get_shutdown_acknowledged());
    }
}
