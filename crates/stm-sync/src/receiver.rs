//! 受信側状態機械
//!
//! 組み立て済み Instruction を受け取り、重複・順序逆転を落とし、
//! アンカー状態に差分を適用して受信履歴を進める。ACK は
//! `ACK_INTERVAL_MS` の猶予でまとめて送るよう期限を管理する。
//!
//! 落とすだけのケース（重複、アンカー不在、壊れた差分）はエラーではない。
//! 送信側が再送で回復する。

use stm_proto::Instruction;
use stm_transport::Timestamp16;
use tracing::trace;

use crate::state::{SyncState, TimestampedState};
use crate::ACK_INTERVAL_MS;

/// 受信側状態機械
pub struct TransportReceiver<R: SyncState> {
    /// 受信済み状態の履歴。不変条件: 非空、末尾が最新
    received_states: Vec<TimestampedState<R>>,
    /// アプリケーションが最後に `get_remote_diff` で観測した状態
    last_receiver_state: R,
    /// まとめ送り中の ACK 期限（ms）
    ack_deadline: Option<u64>,
    /// 最後に観測した相手タイムスタンプと、その受信時刻 (ts, received_at_ms)
    last_peer_timestamp: Option<(u16, u64)>,
}

/// Instruction 処理の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// 新しい状態を履歴に追加した
    Applied,
    /// 既知の番号（重複 or 順序逆転）なので落とした
    Duplicate,
    /// `old_num` のアンカーが見つからず落とした（再送待ち）
    MissingAnchor,
    /// 差分が適用できず落とした
    BadDiff,
}

impl<R: SyncState> TransportReceiver<R> {
    /// 初期リモート状態（番号 0）でレシーバーを生成する
    pub fn new(initial_remote: R, now_ms: u64) -> Self {
        TransportReceiver {
            received_states: vec![TimestampedState::new(0, now_ms, initial_remote.clone())],
            last_receiver_state: initial_remote,
            ack_deadline: None,
            last_peer_timestamp: None,
        }
    }

    /// 受信済みの最大状態番号
    pub fn latest_num(&self) -> u64 {
        self.received_states[self.received_states.len() - 1].num
    }

    /// 最新のリモート状態
    pub fn get_latest_remote_state(&self) -> &TimestampedState<R> {
        &self.received_states[self.received_states.len() - 1]
    }

    /// 相手タイムスタンプを記録する（シャットダウン要求などの
    /// 状態適用を伴わない Instruction にも呼ぶ）
    pub fn note_peer_timestamp(&mut self, timestamp: u16, now_ms: u64) {
        self.last_peer_timestamp = Some((timestamp, now_ms));
    }

    /// 組み立て済み Instruction を処理する
    ///
    /// ACK（`ack_num`）の送信側への転送と、シャットダウン番兵値の処理は
    /// 呼び出し側が済ませている前提。ここでは状態適用だけを行う。
    pub fn process_instruction(&mut self, instr: &Instruction, now_ms: u64) -> ReceiveOutcome {
        self.note_peer_timestamp(instr.timestamp, now_ms);

        // 重複・順序逆転の抑制
        if instr.new_num <= self.latest_num() {
            trace!(new_num = instr.new_num, "duplicate or stale instruction");
            return ReceiveOutcome::Duplicate;
        }

        // 差分の起点（アンカー）を履歴から探す
        let anchor = match self
            .received_states
            .iter()
            .find(|s| s.num == instr.old_num)
        {
            Some(s) => s,
            None => {
                // 適用できない。送信側がより古いアンカーから再送してくる
                trace!(old_num = instr.old_num, "anchor not in history");
                return ReceiveOutcome::MissingAnchor;
            }
        };

        let new_state = match anchor.state.apply_diff(&instr.diff) {
            Ok(s) => s,
            Err(_) => {
                trace!(new_num = instr.new_num, "diff failed to apply");
                return ReceiveOutcome::BadDiff;
            }
        };

        self.received_states
            .push(TimestampedState::new(instr.new_num, now_ms, new_state));

        // 相手はこれより古い状態を差分の起点にしないと約束している
        self.process_throwaway_until(instr.throwaway_num);

        // ACK をまとめ送りの期限つきで予約する
        let deadline = now_ms + ACK_INTERVAL_MS;
        self.ack_deadline = Some(match self.ack_deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });

        ReceiveOutcome::Applied
    }

    /// `throwaway_num` より古い履歴エントリを破棄する
    fn process_throwaway_until(&mut self, throwaway_num: u64) {
        self.received_states.retain(|s| s.num >= throwaway_num);
        debug_assert!(!self.received_states.is_empty());
    }

    /// ACK 期限が到来しているか
    pub fn ack_due(&self, now_ms: u64) -> bool {
        self.ack_deadline.is_some_and(|d| now_ms >= d)
    }

    /// 予約中の ACK 期限（ms）
    pub fn next_ack_deadline(&self) -> Option<u64> {
        self.ack_deadline
    }

    /// ACK を送信したので予約をクリアする
    /// （すべての送信 Instruction が ack_num を運ぶため、どの送信でもよい）
    pub fn ack_sent(&mut self) {
        self.ack_deadline = None;
    }

    /// エコーバックするタイムスタンプを計算する
    ///
    /// 観測したタイムスタンプにローカル滞留時間を加算して返す。相手は
    /// `now - timestamp_reply` を取るだけで、こちらの保持時間を除いた
    /// 正味の RTT サンプルを得られる。0 は「なし」の番兵値なので、
    /// 計算結果が 0 になった場合は 1 にずらす。
    pub fn timestamp_reply(&self, now_ms: u64) -> u16 {
        match self.last_peer_timestamp {
            None => 0,
            Some((ts, received_at)) => {
                let sojourn = now_ms.saturating_sub(received_at);
                let reply = Timestamp16::from(ts).advanced_by(sojourn).raw();
                if reply == 0 {
                    1
                } else {
                    reply
                }
            }
        }
    }

    /// アプリケーションが最後に観測した状態から最新状態への差分を返し、
    /// 観測位置を最新に進める
    pub fn get_remote_diff(&mut self) -> Vec<u8> {
        let latest = &self.received_states[self.received_states.len() - 1];
        let diff = self.last_receiver_state.diff_from(&latest.state);
        self.last_receiver_state = latest.state.clone();
        diff
    }

    /// 履歴の長さ（テスト用）
    pub fn received_states_len(&self) -> usize {
        self.received_states.len()
    }
}
