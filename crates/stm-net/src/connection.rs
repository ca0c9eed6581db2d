//! 暗号化 UDP 接続
//!
//! UDP ソケットと暗号セッションを束ね、ローミングする相手アドレスを
//! 追跡する。認証に成功したデータグラムの送信元だけを「最後に確認した
//! 相手」として記憶するので、相手の IP/ポートが移動しても追従できる。
//!
//! パケット単位の失敗（復号失敗、再生、送受信の一時エラー）はここで
//! 数えて飲み込む。呼び出し側に返るのはソケットの致命的エラーだけ。

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use stm_crypto::{generate_key, CryptoSession, Direction};
use stm_transport::{seal_datagram, SealedDatagram};
use tracing::{debug, trace};

use crate::error::NetError;

/// 受信バッファサイズ（UDP データグラムの上限）
const RECV_BUFFER_LEN: usize = 65536;

/// 送受信の統計カウンタ
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 復号失敗・再生・反射で捨てたパケット数
    pub decrypt_drops: u64,
    /// 飲み込んだ送信エラー数
    pub send_errors: u64,
}

/// 暗号化されたデータグラム接続
pub struct Connection {
    socket: UdpSocket,
    local_addr: SocketAddr,
    crypto: CryptoSession,
    key: [u8; 16],
    /// 最後に認証済みデータグラムを受け取った相手アドレス
    remote_addr: Option<SocketAddr>,
    mtu: usize,
    recv_buffer: Vec<u8>,
    stats: ConnectionStats,
}

impl Connection {
    /// サーバー側の接続を作る（鍵を生成してポートをバインドする）
    ///
    /// # 引数
    /// - `desired_ip`: バインドするアドレス（None なら 0.0.0.0）
    /// - `mtu`: UDP データグラムの上限バイト数
    ///
    /// 相手アドレスは最初の認証済みパケットが届くまで不明。
    pub fn new_server(desired_ip: Option<&str>, mtu: usize) -> Result<Self, NetError> {
        let bind_addr = format!("{}:0", desired_ip.unwrap_or("0.0.0.0"));
        let socket = UdpSocket::bind(bind_addr)?;
        let local_addr = socket.local_addr()?;
        let key = generate_key();

        debug!(%local_addr, "server connection bound");

        Ok(Connection {
            socket,
            local_addr,
            crypto: CryptoSession::from_key(key, Direction::ToClient),
            key,
            remote_addr: None,
            mtu,
            recv_buffer: vec![0u8; RECV_BUFFER_LEN],
            stats: ConnectionStats::default(),
        })
    }

    /// クライアント側の接続を作る（サーバーの鍵とアドレスで接続する）
    pub fn new_client(key_b64: &str, ip: &str, port: u16, mtu: usize) -> Result<Self, NetError> {
        let key = stm_crypto::decode_base64_key(key_b64).map_err(NetError::Key)?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let local_addr = socket.local_addr()?;
        let remote: SocketAddr = format!("{}:{}", ip, port).parse()?;

        debug!(%local_addr, %remote, "client connection bound");

        Ok(Connection {
            socket,
            local_addr,
            crypto: CryptoSession::from_key(key, Direction::ToServer),
            key,
            remote_addr: Some(remote),
            mtu,
            recv_buffer: vec![0u8; RECV_BUFFER_LEN],
            stats: ConnectionStats::default(),
        })
    }

    /// ペイロードを暗号化して相手に送信する
    ///
    /// 相手アドレスが未確定（サーバー起動直後）なら何もしない。
    /// 一時的な送信エラーは数えて飲み込む。
    pub fn send(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let remote = match self.remote_addr {
            Some(addr) => addr,
            None => {
                trace!("no peer address yet; dropping outbound packet");
                return Ok(());
            }
        };

        let sealed = self.crypto.encrypt_packet(payload).map_err(NetError::Crypto)?;
        let wire = seal_datagram(&sealed.nonce_tail, &sealed.ciphertext);

        match self.socket.send_to(&wire, remote) {
            Ok(n) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += n as u64;
                Ok(())
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                self.stats.send_errors += 1;
                debug!(error = %e, "transient send failure; dropping packet");
                Ok(())
            }
            Err(e) => Err(NetError::Socket(e)),
        }
    }

    /// タイムアウトつきで 1 データグラムを受信して復号する
    ///
    /// # 戻り値
    /// - `Ok(Some(payload))`: 認証済みの Fragment バイト列
    /// - `Ok(None)`: タイムアウト、または捨てたパケット（復号失敗など）
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, NetError> {
        // set_read_timeout(0) はエラーなので最低 1ms
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        self.recv_one()
    }

    /// ブロックせずに 1 データグラムを受信して復号する
    pub fn try_recv(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        self.socket.set_nonblocking(true)?;
        let result = self.recv_one();
        self.socket.set_nonblocking(false)?;
        result
    }

    fn recv_one(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        let (len, src) = match self.socket.recv_from(&mut self.recv_buffer) {
            Ok(ok) => ok,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                return Ok(None);
            }
            Err(e) => return Err(NetError::Socket(e)),
        };

        let datagram = match SealedDatagram::parse(&self.recv_buffer[..len]) {
            Ok(d) => d,
            Err(_) => {
                self.stats.decrypt_drops += 1;
                trace!(%src, len, "runt datagram dropped");
                return Ok(None);
            }
        };

        match self.crypto.decrypt_packet(datagram.nonce_tail, datagram.ciphertext) {
            Ok(decrypted) => {
                self.stats.packets_received += 1;
                self.stats.bytes_received += len as u64;

                // 認証済みの送信元だけを信じてローミングに追従する
                if self.remote_addr != Some(src) {
                    debug!(old = ?self.remote_addr, new = %src, "peer address updated");
                    self.remote_addr = Some(src);
                }

                Ok(Some(decrypted.payload))
            }
            Err(e) => {
                self.stats.decrypt_drops += 1;
                trace!(%src, error = %e, "undecryptable datagram dropped");
                Ok(None)
            }
        }
    }

    /// バインドしたローカルポート
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// セッション鍵（Base64、22文字）
    pub fn get_key(&self) -> String {
        stm_crypto::encode_base64_key(&self.key)
    }

    /// ソケットのファイルディスクリプタ（イベントループ統合用）
    #[cfg(unix)]
    pub fn fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.socket.as_raw_fd()
    }

    /// 最後に確認した相手アドレス
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// 相手アドレスが一度でも確定したか
    pub fn get_attached(&self) -> bool {
        self.remote_addr.is_some()
    }

    /// UDP データグラムの上限バイト数
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// 統計カウンタ
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 同じ鍵を共有するサーバー/クライアントのペアを作る
    fn make_pair() -> (Connection, Connection) {
        let server = Connection::new_server(Some("127.0.0.1"), 500).unwrap();
        let client =
            Connection::new_client(&server.get_key(), "127.0.0.1", server.port(), 500).unwrap();
        (server, client)
    }

    #[test]
    fn test_client_to_server_roundtrip() {
        let (mut server, mut client) = make_pair();

        client.send(b"knock knock").unwrap();

        let payload = server
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("サーバーがペイロードを受信すべき");
        assert_eq!(payload, b"knock knock");

        // 認証済みパケットで相手アドレスが確定する
        assert!(server.get_attached());
    }

    #[test]
    fn test_server_learns_address_then_replies() {
        let (mut server, mut client) = make_pair();

        // 相手不明のうちは送信しても何も起きない（エラーにならない）
        server.send(b"early").unwrap();
        assert_eq!(server.stats().packets_sent, 0);

        client.send(b"hello").unwrap();
        server.recv_timeout(Duration::from_secs(2)).unwrap();

        server.send(b"welcome").unwrap();
        let payload = client
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("クライアントが返信を受信すべき");
        assert_eq!(payload, b"welcome");
    }

    #[test]
    fn test_wrong_key_dropped_silently() {
        let (mut server, _client) = make_pair();
        let mut impostor =
            Connection::new_client("AAAAAAAAAAAAAAAAAAAAAA", "127.0.0.1", server.port(), 500)
                .unwrap();

        impostor.send(b"let me in").unwrap();

        let result = server.recv_timeout(Duration::from_millis(500)).unwrap();
        assert!(result.is_none(), "偽鍵のパケットは捨てられるべき");
        assert_eq!(server.stats().decrypt_drops, 1);
        assert!(!server.get_attached(), "偽鍵の送信元は相手として記録しない");
    }

    #[test]
    fn test_try_recv_does_not_block() {
        let (mut server, _client) = make_pair();
        let before = std::time::Instant::now();
        let result = server.try_recv().unwrap();
        assert!(result.is_none());
        assert!(before.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_key_is_base64_22_chars() {
        let server = Connection::new_server(None, 500).unwrap();
        assert_eq!(server.get_key().len(), 22);
    }
}
