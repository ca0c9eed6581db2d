//! stm-transport エラー型

/// トランスポート層のエラー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// パケット/フラグメントが短すぎる
    TooShort,
    /// fragment_num が 14 ビットに収まらない
    FragmentNumOverflow,
    /// zstd 伸長に失敗（破損、またはサイズ上限超過）
    DecompressFailed,
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::TooShort => write!(f, "Packet or fragment too short"),
            TransportError::FragmentNumOverflow => {
                write!(f, "Fragment number exceeds 14-bit range")
            }
            TransportError::DecompressFailed => write!(f, "Instruction decompression failed"),
        }
    }
}
