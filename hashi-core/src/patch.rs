//! パッチテーブルのキャッシュ
//!
//! 左側が管理するブレークポイントパッチの表を丸ごと読み込み、
//! アドレスから元のオペコードを引けるようにします。メモリの読み書き時には
//! [`PatchTable::adjust_buffer`] でトラップ命令を隠し（読み取り）、
//! 上書きされた元のオペコードを記録します（書き込み）。

use crate::errors::DebugError;
use crate::Result;
use hashi_target::memory::{write_scalar, Scalar};
use hashi_target::{MemoryAccessor, PatchTableLayout, INT3_OPCODE};
use std::collections::HashMap;

/// キャッシュされたパッチ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub address: u64,
    /// 元のオペコード
    pub opcode: u8,
    /// リモートテーブル内のスロット番号
    pub index: u32,
    /// アンマネージドコードのパッチか
    pub unmanaged: bool,
}

/// バッファ調整の方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustMode {
    /// 読み取ったバッファからトラップを隠す
    Read,
    /// 書き込むバッファにトラップを残し、新しい元オペコードを記録する
    Write,
}

pub struct PatchTable {
    layout: PatchTableLayout,
    max_entries: u32,
    /// 最後に読んだエントリ配列のアドレス
    entries_base: u64,
    patches: HashMap<u64, Patch>,
    min_address: u64,
    max_address: u64,
    valid: bool,
    /// スロット番号 → 書き込み待ちのオペコード
    staged: HashMap<u32, u8>,
}

/// 1エントリの最大サイズ（これを超えるレイアウトはプロトコル違反）
pub const MAX_ENTRY_SIZE: u64 = 0x100;

fn overflow(what: &str) -> DebugError {
    DebugError::ProtocolViolation(format!("patch table {} overflows the address space", what))
}

fn field<T: Scalar>(bytes: &[u8], base: u64, offset: u64) -> Result<T> {
    let slice = base
        .checked_add(offset)
        .and_then(|start| usize::try_from(start).ok())
        .and_then(|start| start.checked_add(T::SIZE).map(|end| (start, end)))
        .and_then(|(start, end)| bytes.get(start..end))
        .ok_or_else(|| DebugError::ProtocolViolation(format!("patch entry field +0x{:x} is out of range", offset)))?;
    T::decode(slice).map_err(DebugError::memory)
}

impl PatchTable {
    pub fn new(layout: PatchTableLayout, max_entries: u32) -> Self {
        Self {
            layout,
            max_entries,
            entries_base: 0,
            patches: HashMap::new(),
            min_address: u64::MAX,
            max_address: 0,
            valid: false,
            staged: HashMap::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// キャッシュを古いものとして扱う（次の参照で読み直す）
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// キャッシュ内のパッチのアドレス範囲（空なら `None`）
    pub fn bounds(&self) -> Option<(u64, u64)> {
        (!self.patches.is_empty()).then_some((self.min_address, self.max_address))
    }

    /// アドレス順のパッチ一覧
    pub fn patches(&self) -> Vec<Patch> {
        let mut patches: Vec<Patch> = self.patches.values().copied().collect();
        patches.sort_by_key(|p| p.address);
        patches
    }

    /// リモートのテーブルを丸ごと読み直す
    pub fn refresh(&mut self, memory: &dyn MemoryAccessor) -> Result<usize> {
        self.clear();
        let layout = self.layout;

        if layout.entry_size == 0 || layout.entry_size > MAX_ENTRY_SIZE {
            return Err(DebugError::ProtocolViolation(format!(
                "patch entry size {} is out of range",
                layout.entry_size
            )));
        }

        let header = layout.table_address;
        let entries_field = header.checked_add(layout.entries_offset).ok_or_else(|| overflow("header"))?;
        let count_field = header.checked_add(layout.count_offset).ok_or_else(|| overflow("header"))?;
        let entries: u64 = hashi_target::memory::read_scalar(memory, entries_field).map_err(DebugError::memory)?;
        let count: u32 = hashi_target::memory::read_scalar(memory, count_field).map_err(DebugError::memory)?;
        if count > self.max_entries {
            return Err(DebugError::ProtocolViolation(format!(
                "patch table reports {} entries (limit {})",
                count, self.max_entries
            )));
        }

        // エントリ数とエントリサイズの上限で、一度に読む量も抑えられている
        let total = u64::from(count) * layout.entry_size;
        if layout.entry_address(entries, u64::from(count)).is_none() {
            return Err(overflow("entry array"));
        }
        let bytes = if total == 0 {
            Vec::new()
        } else {
            let len = usize::try_from(total).map_err(|_| overflow("entry array"))?;
            memory.read(entries, len).map_err(DebugError::memory)?
        };

        if let Err(e) = self.decode_entries(&bytes, count) {
            self.clear();
            return Err(e);
        }

        self.entries_base = entries;
        self.valid = true;
        tracing::debug!(
            "patch table refreshed: {} patch(es) in {} slot(s)",
            self.patches.len(),
            count
        );
        Ok(self.patches.len())
    }

    fn decode_entries(&mut self, bytes: &[u8], count: u32) -> Result<()> {
        let layout = self.layout;
        for index in 0..count {
            let base = u64::from(index) * layout.entry_size;
            let address: u64 = field(bytes, base, layout.address_offset)?;
            if address == 0 {
                continue;
            }
            let opcode: u32 = field(bytes, base, layout.opcode_offset)?;
            let trace_type: u32 = field(bytes, base, layout.trace_type_offset)?;
            self.patches.insert(
                address,
                Patch {
                    address,
                    opcode: opcode as u8,
                    index,
                    unmanaged: trace_type == layout.trace_type_unmanaged,
                },
            );
            self.min_address = self.min_address.min(address);
            self.max_address = self.max_address.max(address);
        }
        Ok(())
    }

    /// アドレスにあるパッチを探す（範囲外は即座に `None`）
    pub fn find_patch(&self, address: u64) -> Option<&Patch> {
        if address < self.min_address || address > self.max_address {
            return None;
        }
        self.patches.get(&address)
    }

    /// `address` から始まるバッファのパッチ部分を調整する
    ///
    /// 調整したバイト数を返します。
    pub fn adjust_buffer(&mut self, address: u64, buffer: &mut [u8], mode: AdjustMode) -> usize {
        if buffer.is_empty() || self.patches.is_empty() {
            return 0;
        }
        let end = address.saturating_add(buffer.len() as u64);
        if end <= self.min_address || address > self.max_address {
            return 0;
        }

        let mut adjusted = 0;
        for patch in self.patches.values() {
            if patch.address < address || patch.address >= end {
                continue;
            }
            let offset = (patch.address - address) as usize;
            match mode {
                AdjustMode::Read => buffer[offset] = patch.opcode,
                AdjustMode::Write => {
                    self.staged.insert(patch.index, buffer[offset]);
                    buffer[offset] = INT3_OPCODE;
                }
            }
            adjusted += 1;
        }
        adjusted
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// 記録した元オペコードをリモートテーブルとキャッシュに書き込む
    pub fn commit_buffer_adjustments(&mut self, memory: &dyn MemoryAccessor) -> Result<usize> {
        let staged: Vec<(u32, u8)> = self.staged.drain().collect();
        for (index, opcode) in &staged {
            let opcode_field = self
                .layout
                .entry_address(self.entries_base, u64::from(*index))
                .and_then(|entry| entry.checked_add(self.layout.opcode_offset))
                .ok_or_else(|| overflow("entry"))?;
            write_scalar(memory, opcode_field, u32::from(*opcode)).map_err(DebugError::memory)?;
            if let Some(patch) = self.patches.values_mut().find(|p| p.index == *index) {
                patch.opcode = *opcode;
            }
        }
        Ok(staged.len())
    }

    /// キャッシュを空にする
    pub fn clear(&mut self) {
        self.patches.clear();
        self.staged.clear();
        self.min_address = u64::MAX;
        self.max_address = 0;
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashi_target::SharedMemory;

    const BASE: u64 = 0x4000;
    const ENTRIES: u64 = BASE + 0x100;
    const CODE: u64 = BASE + 0x800;

    fn layout() -> PatchTableLayout {
        PatchTableLayout {
            table_address: BASE,
            entries_offset: 0,
            count_offset: 8,
            entry_size: 24,
            address_offset: 0,
            opcode_offset: 8,
            trace_type_offset: 16,
            trace_type_unmanaged: 1,
        }
    }

    /// スロットにパッチを置き、コードにトラップを書く
    fn install(memory: &SharedMemory, slot: u64, address: u64, unmanaged: bool) {
        let entry = ENTRIES + slot * 24;
        let original = memory.read(address, 1).unwrap()[0];
        memory.write_scalar(entry, address).unwrap();
        memory.write_scalar(entry + 8, u32::from(original)).unwrap();
        memory.write_scalar(entry + 16, u32::from(unmanaged)).unwrap();
        memory.write(address, &[INT3_OPCODE]).unwrap();
    }

    fn image(slots: u32) -> SharedMemory {
        let memory = SharedMemory::new(BASE, 0x1000);
        memory.write_scalar(BASE, ENTRIES).unwrap();
        memory.write_scalar(BASE + 8, slots).unwrap();
        let code: Vec<u8> = (0..0x100u32).map(|i| i as u8).collect();
        memory.write(CODE, &code).unwrap();
        memory
    }

    #[test]
    fn test_refresh_recomputes_bounds() {
        let memory = image(4);
        install(&memory, 0, CODE + 0x20, false);
        install(&memory, 2, CODE + 0x08, true);

        let mut table = PatchTable::new(layout(), 16);
        assert!(!table.is_valid());
        assert_eq!(table.refresh(&memory).unwrap(), 2);
        assert!(table.is_valid());
        assert_eq!(table.bounds(), Some((CODE + 0x08, CODE + 0x20)));

        let patch = table.find_patch(CODE + 0x08).unwrap();
        assert_eq!(patch.opcode, 0x08);
        assert_eq!(patch.index, 2);
        assert!(patch.unmanaged);
        assert!(table.find_patch(CODE + 0x09).is_none());
        assert!(table.find_patch(CODE + 0x100).is_none());

        // スロットを空けて読み直すと範囲も縮む
        memory.write_scalar(ENTRIES, 0u64).unwrap();
        assert_eq!(table.refresh(&memory).unwrap(), 1);
        assert_eq!(table.bounds(), Some((CODE + 0x08, CODE + 0x08)));
    }

    #[test]
    fn test_refresh_rejects_oversized_table() {
        let memory = image(100);
        let mut table = PatchTable::new(layout(), 16);
        assert!(matches!(
            table.refresh(&memory),
            Err(DebugError::ProtocolViolation(_))
        ));
        assert!(!table.is_valid());
    }

    #[test]
    fn test_refresh_rejects_hostile_layout() {
        let memory = image(4);
        install(&memory, 0, CODE, false);

        let hostile = [
            PatchTableLayout {
                entry_size: u64::MAX / 2,
                ..layout()
            },
            PatchTableLayout {
                entry_size: 0,
                ..layout()
            },
            PatchTableLayout {
                address_offset: u64::MAX,
                ..layout()
            },
            PatchTableLayout {
                opcode_offset: 0x1000,
                ..layout()
            },
            PatchTableLayout {
                table_address: u64::MAX - 4,
                ..layout()
            },
        ];
        for layout in hostile {
            let mut table = PatchTable::new(layout, 16);
            let result = table.refresh(&memory);
            println!("{:?} -> {:?}", layout, result);
            assert!(matches!(result, Err(DebugError::ProtocolViolation(_))));
            assert!(!table.is_valid());
            assert!(table.is_empty());
        }
    }

    #[test]
    fn test_refresh_rejects_wrapping_entry_array() {
        let memory = image(4);
        memory.write_scalar(BASE, u64::MAX - 16).unwrap();
        let mut table = PatchTable::new(layout(), 16);
        assert!(matches!(
            table.refresh(&memory),
            Err(DebugError::ProtocolViolation(_))
        ));
        assert!(!table.is_valid());
    }

    #[test]
    fn test_read_adjustment_hides_traps() {
        let memory = image(4);
        install(&memory, 1, CODE + 0x10, false);
        let mut table = PatchTable::new(layout(), 16);
        table.refresh(&memory).unwrap();

        let mut buffer = memory.read(CODE + 0x0e, 4).unwrap();
        assert_eq!(buffer, vec![0x0e, 0x0f, INT3_OPCODE, 0x11]);
        assert_eq!(table.adjust_buffer(CODE + 0x0e, &mut buffer, AdjustMode::Read), 1);
        assert_eq!(buffer, vec![0x0e, 0x0f, 0x10, 0x11]);

        let mut outside = vec![0u8; 4];
        assert_eq!(table.adjust_buffer(CODE + 0x11, &mut outside, AdjustMode::Read), 0);
    }

    #[test]
    fn test_write_adjustment_round_trip() {
        let memory = image(4);
        install(&memory, 3, CODE + 0x40, false);
        let mut table = PatchTable::new(layout(), 16);
        table.refresh(&memory).unwrap();

        let mut data = vec![0xaa, 0xbb, 0xcc];
        assert_eq!(table.adjust_buffer(CODE + 0x3f, &mut data, AdjustMode::Write), 1);
        assert_eq!(data, vec![0xaa, INT3_OPCODE, 0xcc]);
        assert!(table.has_staged());
        memory.write(CODE + 0x3f, &data).unwrap();
        assert_eq!(table.commit_buffer_adjustments(&memory).unwrap(), 1);
        assert!(!table.has_staged());

        // トラップはメモリに残り、読み取りでは書いた値が見える
        assert_eq!(memory.read(CODE + 0x40, 1).unwrap(), vec![INT3_OPCODE]);
        let mut read_back = memory.read(CODE + 0x3f, 3).unwrap();
        table.adjust_buffer(CODE + 0x3f, &mut read_back, AdjustMode::Read);
        assert_eq!(read_back, vec![0xaa, 0xbb, 0xcc]);

        // リモートテーブルにも書き込まれている
        let mut fresh = PatchTable::new(layout(), 16);
        fresh.refresh(&memory).unwrap();
        assert_eq!(fresh.find_patch(CODE + 0x40).map(|p| p.opcode), Some(0xbb));
    }

    #[test]
    fn test_read_then_write_adjustment_is_identity() {
        let memory = image(4);
        install(&memory, 0, CODE + 0x61, false);
        install(&memory, 2, CODE + 0x63, true);
        let mut table = PatchTable::new(layout(), 16);
        table.refresh(&memory).unwrap();

        let raw = memory.read(CODE + 0x60, 5).unwrap();
        assert_eq!(raw, vec![0x60, INT3_OPCODE, 0x62, INT3_OPCODE, 0x64]);

        let mut buffer = raw.clone();
        assert_eq!(table.adjust_buffer(CODE + 0x60, &mut buffer, AdjustMode::Read), 2);
        assert_eq!(buffer, vec![0x60, 0x61, 0x62, 0x63, 0x64]);
        assert_eq!(table.adjust_buffer(CODE + 0x60, &mut buffer, AdjustMode::Write), 2);
        assert_eq!(buffer, raw);

        // 書き戻しても元のオペコードは変わらない
        memory.write(CODE + 0x60, &buffer).unwrap();
        assert_eq!(table.commit_buffer_adjustments(&memory).unwrap(), 2);
        assert_eq!(memory.read(CODE + 0x60, 5).unwrap(), raw);
        let mut fresh = PatchTable::new(layout(), 16);
        fresh.refresh(&memory).unwrap();
        assert_eq!(fresh.find_patch(CODE + 0x61).map(|p| p.opcode), Some(0x61));
        assert_eq!(fresh.find_patch(CODE + 0x63).map(|p| p.opcode), Some(0x63));
    }

    #[test]
    fn test_clear_releases_entries() {
        let memory = image(4);
        install(&memory, 0, CODE, false);
        let mut table = PatchTable::new(layout(), 16);
        table.refresh(&memory).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(!table.is_valid());
        assert_eq!(table.bounds(), None);
        assert!(table.find_patch(CODE).is_none());
    }
}
