//! Fragment 分割と再組み立て
//!
//! ## Fragment Wire Format
//! ```text
//! [instruction_id: u64 BE (8 bytes)]
//! [fragment_word: u16 BE (2 bytes)]
//!   - bit 15: is_final (最後の Fragment の場合 1)
//!   - bit 14: compressed (Instruction 全体が zstd 圧縮済みの場合 1)
//!   - bit 0..13: fragment 番号 (0 始まり)
//! [payload: variable]
//! ```
//!
//! 閾値を超える Instruction は分割前に zstd で圧縮され、全 Fragment に
//! compressed ビットが立つ。再組み立て側は完成後に伸長する。

use std::collections::BTreeMap;

use crate::error::TransportError;

/// is_final フラグのビット
const FINAL_BIT: u16 = 0x8000;
/// compressed フラグのビット
const COMPRESSED_BIT: u16 = 0x4000;
/// fragment_num のマスク（下位 14 ビット）
const FRAGMENT_NUM_MASK: u16 = 0x3FFF;

/// この長さを超える Instruction は圧縮してから分割する（バイト）
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// zstd 圧縮レベル
const COMPRESSION_LEVEL: i32 = 3;

/// 伸長後 Instruction の許容最大長（壊れた length 爆弾への防壁）
pub const MAX_INSTRUCTION_LEN: usize = 4 * 1024 * 1024;

/// ネットワーク上の最小送受信単位
///
/// 一つの Instruction が MTU を超える場合、複数の Fragment に分割される。
/// すべての Fragment が揃うと元の Instruction バイト列に再組み立てされる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// この Fragment が属する Instruction の ID
    pub instruction_id: u64,
    /// Fragment 番号（0 始まり、14 ビット）
    pub fragment_num: u16,
    /// 最後の Fragment かどうか
    pub is_final: bool,
    /// Instruction 全体が圧縮済みかどうか（全 Fragment で共通）
    pub compressed: bool,
    /// Fragment ペイロード（Instruction バイト列の一部）
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Fragment ヘッダー長（instruction_id: 8 + fragment_word: 2）
    pub const HEADER_LEN: usize = 10;

    /// バイト列から Fragment を復元する（復号後のバイト列を渡す）
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(TransportError::TooShort);
        }

        // instruction_id (8 bytes, big-endian)
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&bytes[0..8]);
        let instruction_id = u64::from_be_bytes(id_bytes);

        // fragment_word (2 bytes, big-endian)
        let frag_word = u16::from_be_bytes([bytes[8], bytes[9]]);
        let is_final = frag_word & FINAL_BIT != 0;
        let compressed = frag_word & COMPRESSED_BIT != 0;
        let fragment_num = frag_word & FRAGMENT_NUM_MASK;

        let payload = bytes[Self::HEADER_LEN..].to_vec();

        Ok(Fragment {
            instruction_id,
            fragment_num,
            is_final,
            compressed,
            payload,
        })
    }

    /// Fragment を Wire Format に変換する
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());

        bytes.extend_from_slice(&self.instruction_id.to_be_bytes());

        let mut frag_word: u16 = self.fragment_num & FRAGMENT_NUM_MASK;
        if self.is_final {
            frag_word |= FINAL_BIT;
        }
        if self.compressed {
            frag_word |= COMPRESSED_BIT;
        }
        bytes.extend_from_slice(&frag_word.to_be_bytes());

        bytes.extend_from_slice(&self.payload);

        bytes
    }
}

/// Instruction バイト列を Fragment 列に分割するクラス
///
/// instruction_id は送信ごとに単調増加する。再組み立て側の
/// 「新しい ID が勝つ」ポリシーはこの単調性に依存している。
pub struct Fragmenter {
    /// 次に使う instruction_id
    next_instruction_id: u64,
    /// アプリケーション MTU（Fragment ペイロードの最大バイト数）
    /// = ネットワーク MTU - 暗号オーバーヘッド(24) - Fragment ヘッダー(10)
    app_payload_mtu: usize,
}

impl Fragmenter {
    /// 新しい Fragmenter を生成する
    ///
    /// # 引数
    /// - `app_mtu`: Fragment ペイロードの最大バイト数
    ///   - デフォルト MTU 500 の場合: 500 - 24(crypto overhead) - 10(fragment header) = 466
    pub fn new(app_mtu: usize) -> Self {
        Fragmenter {
            next_instruction_id: 1, // 1 始まり（0 は未初期化扱い）
            app_payload_mtu: app_mtu.max(1),
        }
    }

    /// Instruction バイト列を Fragment 列に分割する
    ///
    /// `COMPRESSION_THRESHOLD` を超える Instruction は zstd 圧縮を試み、
    /// 縮んだ場合のみ圧縮版を採用して compressed ビットを立てる。
    ///
    /// # 戻り値
    /// Fragment のベクタ。1 つに収まる場合でも常に Vec で返す。
    pub fn make_fragments(&mut self, instruction_bytes: &[u8]) -> Vec<Fragment> {
        let id = self.next_instruction_id;
        self.next_instruction_id = self.next_instruction_id.wrapping_add(1);

        let (body, compressed) = if instruction_bytes.len() > COMPRESSION_THRESHOLD {
            match zstd::bulk::compress(instruction_bytes, COMPRESSION_LEVEL) {
                Ok(z) if z.len() < instruction_bytes.len() => (z, true),
                _ => (instruction_bytes.to_vec(), false),
            }
        } else {
            (instruction_bytes.to_vec(), false)
        };

        if body.is_empty() {
            // 空 Instruction → Fragment 1 つ（ハートビート用）
            return vec![Fragment {
                instruction_id: id,
                fragment_num: 0,
                is_final: true,
                compressed: false,
                payload: vec![],
            }];
        }

        let chunks: Vec<&[u8]> = body.chunks(self.app_payload_mtu).collect();
        let num_chunks = chunks.len();

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Fragment {
                instruction_id: id,
                fragment_num: i as u16,
                is_final: i == num_chunks - 1,
                compressed,
                payload: chunk.to_vec(),
            })
            .collect()
    }

    /// 現在の instruction_id カウンタを返す（テスト用）
    pub fn current_id(&self) -> u64 {
        self.next_instruction_id
    }
}

/// Fragment を受け取り、Instruction に再組み立てするクラス
///
/// 複数の Fragment を順不同で受け取り、すべて揃った時点で
/// 元の Instruction バイト列を返す。
///
/// より新しい instruction_id の Fragment が来たら、組み立て中の
/// 古い instruction_id の Fragment は破棄する（古い Instruction は
/// 放棄しても差分チェーンが回復する）。古い ID の Fragment は捨てる。
pub struct FragmentAssembly {
    /// 現在組み立て中の instruction_id
    current_id: Option<u64>,
    /// 受信済み Fragment（fragment_num → payload）
    arrived: BTreeMap<u16, Vec<u8>>,
    /// 最後の Fragment（is_final=true）の fragment_num
    final_fragment_num: Option<u16>,
    /// 組み立て中の Instruction が圧縮済みか
    compressed: bool,
}

impl FragmentAssembly {
    /// 新しい FragmentAssembly を生成する
    pub fn new() -> Self {
        FragmentAssembly {
            current_id: None,
            arrived: BTreeMap::new(),
            final_fragment_num: None,
            compressed: false,
        }
    }

    /// Fragment を追加する
    ///
    /// # 戻り値
    /// - `Ok(Some(bytes))`: すべての Fragment が揃い、再組み立て（必要なら伸長）
    ///   した Instruction バイト列
    /// - `Ok(None)`: まだ Fragment が足りない、または古い ID で破棄された
    /// - `Err(TransportError::DecompressFailed)`: 伸長失敗
    pub fn add_fragment(&mut self, frag: Fragment) -> Result<Option<Vec<u8>>, TransportError> {
        match self.current_id {
            Some(current) if frag.instruction_id < current => {
                // 放棄済みの古い Instruction の残骸
                return Ok(None);
            }
            Some(current) if frag.instruction_id > current => {
                // 新しい Instruction が来たら古いものを破棄
                self.reset_to(frag.instruction_id);
            }
            Some(_) => {}
            None => {
                self.reset_to(frag.instruction_id);
            }
        }

        if frag.is_final {
            self.final_fragment_num = Some(frag.fragment_num);
        }
        self.compressed = self.compressed || frag.compressed;

        self.arrived.insert(frag.fragment_num, frag.payload);

        // すべての Fragment が揃ったか確認
        self.try_assemble()
    }

    /// 組み立て状態を新しい instruction_id 用にリセットする
    fn reset_to(&mut self, id: u64) {
        self.arrived.clear();
        self.final_fragment_num = None;
        self.compressed = false;
        self.current_id = Some(id);
    }

    /// すべての Fragment が揃っていれば Instruction バイト列を返す
    fn try_assemble(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let final_num = match self.final_fragment_num {
            Some(n) => n,
            None => return Ok(None),
        };

        // fragment_num が 0..=final_num のすべてが揃っているか
        for num in 0..=final_num {
            if !self.arrived.contains_key(&num) {
                return Ok(None);
            }
        }

        // 揃ったので順番に結合する
        let mut assembled = Vec::new();
        for num in 0..=final_num {
            assembled.extend_from_slice(&self.arrived[&num]);
        }

        if self.compressed {
            let restored = zstd::bulk::decompress(&assembled, MAX_INSTRUCTION_LEN)
                .map_err(|_| TransportError::DecompressFailed)?;
            Ok(Some(restored))
        } else {
            Ok(Some(assembled))
        }
    }

    /// 現在組み立て中の instruction_id を返す
    pub fn current_id(&self) -> Option<u64> {
        self.current_id
    }
}

impl Default for FragmentAssembly {
    fn default() -> Self {
        Self::new()
    }
}
