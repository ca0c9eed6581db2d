//! 状態同期トランスポートのファサード
//!
//! 接続・分割・符号化・送受信状態機械を束ね、アプリケーションに
//! `tick` / `recv` / `wait_time` / `get_remote_diff` の 4 点インター
//! フェースを提供する。型パラメータ `L`（ローカル状態）と `R`
//! （リモート状態）は不透明で、差分の生成と適用は状態型自身が行う。

use std::time::{Duration, Instant};

use stm_proto::{Instruction, TIMESTAMP_REPLY_NONE};
use stm_sync::receiver::ReceiveOutcome;
use stm_sync::{AckView, SyncState, TimestampedState, TransportReceiver, TransportSender};
use stm_transport::{Fragment, FragmentAssembly, Fragmenter, Timestamp16, DATAGRAM_OVERHEAD};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::NetError;

/// デフォルトの UDP データグラム上限（モバイル向け保守的設定）
pub const DEFAULT_MTU: usize = 500;

/// `recv` がソケットでブロックする時間の上限（ms）
const MAX_RECV_WAIT_MS: u64 = 60_000;

/// セッション統計のスナップショット
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 復号できずに捨てたパケット数
    pub decrypt_drops: u64,
    /// プロトコル上の理由（重複、アンカー不在など）で捨てた Instruction 数
    pub protocol_drops: u64,
    pub srtt_ms: f64,
    pub sent_state_last: u64,
    pub remote_state_num: u64,
}

/// 状態同期トランスポート
pub struct Transport<L: SyncState, R: SyncState> {
    connection: Connection,
    sender: TransportSender<L>,
    receiver: TransportReceiver<R>,
    fragmenter: Fragmenter,
    assembly: FragmentAssembly,
    /// ローカル時刻の基準点（ms 換算は epoch.elapsed()）
    epoch: Instant,
    protocol_drops: u64,
    verbose: bool,
}

impl<L: SyncState, R: SyncState> Transport<L, R> {
    /// サーバーとして構築する（鍵を生成する。`get_key` で取り出して
    /// 帯域外でクライアントに渡す）
    pub fn new_server(
        initial_state: L,
        initial_remote: R,
        desired_ip: Option<&str>,
    ) -> Result<Self, NetError> {
        let connection = Connection::new_server(desired_ip, DEFAULT_MTU)?;
        Ok(Self::with_connection(connection, initial_state, initial_remote))
    }

    /// クライアントとして構築する
    pub fn new_client(
        initial_state: L,
        initial_remote: R,
        key_b64: &str,
        ip: &str,
        port: u16,
    ) -> Result<Self, NetError> {
        let connection = Connection::new_client(key_b64, ip, port, DEFAULT_MTU)?;
        Ok(Self::with_connection(connection, initial_state, initial_remote))
    }

    fn with_connection(connection: Connection, initial_state: L, initial_remote: R) -> Self {
        let app_payload_mtu = connection
            .mtu()
            .saturating_sub(DATAGRAM_OVERHEAD + Fragment::HEADER_LEN)
            .max(64);
        let epoch = Instant::now();

        Transport {
            connection,
            sender: TransportSender::new(initial_state, 0),
            receiver: TransportReceiver::new(initial_remote, 0),
            fragmenter: Fragmenter::new(app_payload_mtu),
            assembly: FragmentAssembly::new(),
            epoch,
            protocol_drops: 0,
            verbose: false,
        }
    }

    /// 基準点からの経過ミリ秒
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// 必要なら差分か ACK を送信する
    pub fn tick(&mut self) -> Result<(), NetError> {
        let now = self.now_ms();
        let ack = AckView {
            ack_num: self.receiver.latest_num(),
            ack_due: self.receiver.ack_due(now),
            timestamp_reply: self.receiver.timestamp_reply(now),
        };

        if let Some(instr) = self.sender.tick(now, &ack) {
            self.send_instruction(&instr)?;
            // すべての送信 Instruction が ack_num を運ぶ
            self.receiver.ack_sent();
        }
        Ok(())
    }

    /// Instruction を分割・暗号化して送信する
    fn send_instruction(&mut self, instr: &Instruction) -> Result<(), NetError> {
        let bytes = instr.encode_to_bytes();
        for frag in self.fragmenter.make_fragments(&bytes) {
            self.connection.send(&frag.to_bytes())?;
        }
        Ok(())
    }

    /// `tick` が次に仕事をするまでの時間（ms）
    pub fn wait_time(&self) -> u64 {
        let now = self.now_ms();
        self.sender.wait_time(now, self.receiver.next_ack_deadline())
    }

    /// データグラムを待ち受けて処理する
    ///
    /// `wait_time()` を上限にブロックし、届いているデータグラムを
    /// すべて処理して戻る。タイムアウトや破棄はエラーではない。
    pub fn recv(&mut self) -> Result<(), NetError> {
        let timeout = self.wait_time().clamp(1, MAX_RECV_WAIT_MS);

        if let Some(payload) = self
            .connection
            .recv_timeout(Duration::from_millis(timeout))?
        {
            self.process_payload(&payload);
        }

        // 残りはブロックせずに掃き出す
        while let Some(payload) = self.connection.try_recv()? {
            self.process_payload(&payload);
        }

        Ok(())
    }

    /// 復号済みペイロード（Fragment 1 個分）を処理する
    fn process_payload(&mut self, payload: &[u8]) {
        let frag = match Fragment::from_bytes(payload) {
            Ok(f) => f,
            Err(e) => {
                self.protocol_drops += 1;
                trace!(error = %e, "unparsable fragment dropped");
                return;
            }
        };

        let instruction_bytes = match self.assembly.add_fragment(frag) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return, // まだ揃っていない
            Err(e) => {
                self.protocol_drops += 1;
                debug!(error = %e, "reassembly failed; instruction dropped");
                return;
            }
        };

        let instr = match Instruction::decode_from_bytes(&instruction_bytes) {
            Ok(i) => i,
            Err(e) => {
                self.protocol_drops += 1;
                debug!(error = %e, "undecodable instruction dropped");
                return;
            }
        };

        self.process_instruction(&instr);
    }

    /// 組み立て済み Instruction をプロトコル処理する
    fn process_instruction(&mut self, instr: &Instruction) {
        let now = self.now_ms();

        // タイムスタンプエコーから RTT サンプルを取る
        if instr.timestamp_reply != TIMESTAMP_REPLY_NONE {
            let r = Timestamp16::diff(
                Timestamp16::now_from_ms(now),
                Timestamp16::from(instr.timestamp_reply),
            );
            self.sender.on_rtt_sample(r as f64);
        }

        // ACK（シャットダウン確認の番兵値は ACK 処理に混ぜない）
        if instr.is_shutdown_ack() {
            self.sender.shutdown_acknowledged_received();
        } else {
            self.sender.process_acknowledgment_through(instr.ack_num);
        }

        // 相手発のシャットダウン要求
        if instr.is_shutdown_request() {
            self.receiver.note_peer_timestamp(instr.timestamp, now);
            self.sender.counterparty_shutdown_requested();
            return;
        }

        match self.receiver.process_instruction(instr, now) {
            ReceiveOutcome::Applied => {
                if self.verbose {
                    debug!(new_num = instr.new_num, "remote state advanced");
                }
            }
            outcome => {
                self.protocol_drops += 1;
                trace!(?outcome, new_num = instr.new_num, "instruction dropped");
            }
        }
    }

    /// アプリケーションが最後に観測した状態から最新リモート状態への差分
    pub fn get_remote_diff(&mut self) -> Vec<u8> {
        self.receiver.get_remote_diff()
    }

    /// 現在のローカル状態
    pub fn get_current_state(&self) -> &L {
        self.sender.current_state()
    }

    /// ローカル状態を更新する（変化があれば次の tick で差分が飛ぶ）
    pub fn set_current_state(&mut self, state: L) {
        let now = self.now_ms();
        self.sender.set_current_state(state, now);
    }

    /// 相手にシャットダウンを要求する。以後 `set_current_state` は不正
    pub fn start_shutdown(&mut self) {
        let now = self.now_ms();
        self.sender.start_shutdown(now);
    }

    pub fn shutdown_in_progress(&self) -> bool {
        self.sender.get_shutdown_in_progress()
    }

    pub fn shutdown_acknowledged(&self) -> bool {
        self.sender.get_shutdown_acknowledged()
    }

    pub fn shutdown_ack_timed_out(&self) -> bool {
        self.sender.shutdown_ack_timed_out()
    }

    /// 相手発のシャットダウンに確認を送信済みか
    pub fn counterparty_shutdown_ack_sent(&self) -> bool {
        self.sender.get_counterparty_shutdown_acknowledged()
    }

    /// バインドしたローカルポート
    pub fn port(&self) -> u16 {
        self.connection.port()
    }

    /// セッション鍵（Base64）
    pub fn get_key(&self) -> String {
        self.connection.get_key()
    }

    /// ソケットのファイルディスクリプタ（イベントループ統合用）
    #[cfg(unix)]
    pub fn fd(&self) -> std::os::fd::RawFd {
        self.connection.fd()
    }

    /// 相手アドレスが一度でも確定したか
    pub fn attached(&self) -> bool {
        self.connection.get_attached()
    }

    /// 受信済みの最新リモート状態番号
    pub fn get_remote_state_num(&self) -> u64 {
        self.receiver.latest_num()
    }

    /// 最新のリモート状態
    pub fn get_latest_remote_state(&self) -> &TimestampedState<R> {
        self.receiver.get_latest_remote_state()
    }

    /// 相手が ACK 済みのローカル状態番号
    pub fn get_sent_state_acked(&self) -> u64 {
        self.sender.get_sent_state_acked()
    }

    /// 現在のローカル状態番号
    pub fn get_sent_state_last(&self) -> u64 {
        self.sender.get_sent_state_last()
    }

    /// 現在の送信間隔（ms）
    pub fn send_interval(&self) -> u64 {
        self.sender.send_interval()
    }

    /// 送信間隔の下限を設定する（ms）
    pub fn set_send_delay(&mut self, delay_ms: u64) {
        self.sender.set_send_delay(delay_ms);
    }

    /// 状態適用のログを有効にする
    pub fn set_verbose(&mut self) {
        self.verbose = true;
    }

    /// セッション統計のスナップショット
    pub fn stats(&self) -> TransportStats {
        let conn = self.connection.stats();
        TransportStats {
            packets_sent: conn.packets_sent,
            packets_received: conn.packets_received,
            bytes_sent: conn.bytes_sent,
            bytes_received: conn.bytes_received,
            decrypt_drops: conn.decrypt_drops,
            protocol_drops: self.protocol_drops,
            srtt_ms: self.sender.rtt().srtt(),
            sent_state_last: self.sender.get_sent_state_last(),
            remote_state_num: self.receiver.latest_num(),
        }
    }
}
