//! 左側（デバッグ対象内エージェント）が公開するランタイムオフセット
//!
//! 右側はアタッチ直後にこの構造体を一度だけ受け取り、
//! パッチテーブルの読み取りとネイティブイベントの分類に使います。

/// リモートパッチテーブルのレイアウト
///
/// ヘッダ `table_address` には、エントリ配列へのポインタ（u64）と
/// エントリ数（u32）が格納されています。アドレスが0のスロットは空きです。
/// 値はデバッグ対象が公開するものなので、信用せずに検査して使います。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchTableLayout {
    /// パッチテーブルヘッダのアドレス
    pub table_address: u64,
    /// ヘッダ内のエントリ配列ポインタのオフセット
    pub entries_offset: u64,
    /// ヘッダ内のエントリ数のオフセット
    pub count_offset: u64,
    /// 1エントリのサイズ
    pub entry_size: u64,
    /// エントリ内のパッチアドレスのオフセット
    pub address_offset: u64,
    /// エントリ内の元のオペコードのオフセット
    pub opcode_offset: u64,
    /// エントリ内のトレース種別のオフセット
    pub trace_type_offset: u64,
    /// アンマネージドを示すトレース種別の値
    pub trace_type_unmanaged: u32,
}

impl PatchTableLayout {
    /// エントリ配列内の `index` 番目のエントリのアドレス（桁あふれなら `None`）
    pub fn entry_address(&self, entries: u64, index: u64) -> Option<u64> {
        index
            .checked_mul(self.entry_size)
            .and_then(|offset| entries.checked_add(offset))
    }
}

/// ハイジャック用ブレークポイントのアドレス群
///
/// ランタイムが右側へ合図を送るために踏む、既知のブレークポイントです。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HijackAddresses {
    pub signal_hijack_started: u64,
    pub signal_hijack_complete: u64,
    pub excep_for_runtime_handoff_start: u64,
    pub excep_for_runtime_handoff_complete: u64,
    pub excep_not_for_runtime: u64,
    pub notify_rs_of_sync_complete: u64,
}

impl HijackAddresses {
    /// いずれかのハイジャック用アドレスに一致するか
    pub fn contains(&self, address: u64) -> bool {
        address != 0
            && [
                self.signal_hijack_started,
                self.signal_hijack_complete,
                self.excep_for_runtime_handoff_start,
                self.excep_for_runtime_handoff_complete,
                self.excep_not_for_runtime,
                self.notify_rs_of_sync_complete,
            ]
            .contains(&address)
    }
}

/// ランタイムオフセット
///
/// ランタイムのないネイティブだけのデバッグ対象では既定値（すべて0）を使います。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeOffsets {
    pub patch_table: PatchTableLayout,
    pub hijack: HijackAddresses,
    /// デバッガヘルパースレッドのID（未起動なら0）
    pub helper_thread: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hijack_contains_ignores_zero() {
        let hijack = HijackAddresses {
            signal_hijack_started: 0x1000,
            ..Default::default()
        };
        assert!(hijack.contains(0x1000));
        assert!(!hijack.contains(0));
        assert!(!hijack.contains(0x2000));
    }

    #[test]
    fn test_entry_address_rejects_overflow() {
        let layout = PatchTableLayout {
            entry_size: 24,
            ..Default::default()
        };
        assert_eq!(layout.entry_address(0x1000, 2), Some(0x1030));
        assert_eq!(layout.entry_address(u64::MAX - 8, 1), None);

        let hostile = PatchTableLayout {
            entry_size: u64::MAX / 2,
            ..Default::default()
        };
        assert_eq!(hostile.entry_address(0x1000, 4), None);
    }
}
