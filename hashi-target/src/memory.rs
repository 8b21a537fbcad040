//! リモートメモリアクセス
//!
//! パッチテーブルの読み取りやブレークポイントの書き込みは、
//! すべて [`MemoryAccessor`] を経由して行います。

use crate::Result;
use nix::unistd::Pid;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::sync::Arc;

/// リトルエンディアンで読み書きできる固定長の値
pub trait Scalar: Sized + Copy {
    const SIZE: usize;

    fn decode(bytes: &[u8]) -> Result<Self>;

    fn encode(self) -> Vec<u8>;
}

macro_rules! impl_scalar {
    ($($ty:ty),+) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn decode(bytes: &[u8]) -> Result<Self> {
                    let array: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                        anyhow::anyhow!(
                            "expected {} bytes for {}, got {}",
                            Self::SIZE,
                            stringify!($ty),
                            bytes.len()
                        )
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }

                fn encode(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )+
    };
}

impl_scalar!(u8, u16, u32, u64);

/// デバッグ対象のメモリを読み書きする能力
pub trait MemoryAccessor: Send + Sync {
    /// `addr` から `len` バイトを読み取る
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// `addr` にデータを書き込む
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// 型付き値を読み取る
    fn read_scalar<T: Scalar>(&self, addr: u64) -> Result<T>
    where
        Self: Sized,
    {
        T::decode(&self.read(addr, T::SIZE)?)
    }

    /// 型付き値を書き込む
    fn write_scalar<T: Scalar>(&self, addr: u64, value: T) -> Result<()>
    where
        Self: Sized,
    {
        self.write(addr, &value.encode())
    }
}

/// `dyn MemoryAccessor` から型付き値を読むためのヘルパー
pub fn read_scalar<T: Scalar>(memory: &dyn MemoryAccessor, addr: u64) -> Result<T> {
    T::decode(&memory.read(addr, T::SIZE)?)
}

/// `dyn MemoryAccessor` へ型付き値を書くためのヘルパー
pub fn write_scalar<T: Scalar>(memory: &dyn MemoryAccessor, addr: u64, value: T) -> Result<()> {
    memory.write(addr, &value.encode())
}

/// /proc/pid/mem 経由のメモリアクセス
///
/// /proc/pid/mem が EIO を返す領域では PTRACE_PEEKDATA にフォールバックします。
pub struct ProcMemory {
    pid: Pid,
}

impl ProcMemory {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    fn read_via_proc_mem(&self, addr: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATA でワード単位に読み取る
    fn read_via_ptrace(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<nix::libc::c_long>();
        let mut data = Vec::with_capacity(len + word_size);
        for offset in (0..len).step_by(word_size) {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!("ptrace read at 0x{:x} failed: {}", addr as usize + offset, e)
            })?;
            data.extend_from_slice(&word.to_ne_bytes());
        }
        data.truncate(len);
        Ok(data)
    }
}

impl MemoryAccessor for ProcMemory {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, len) {
            Ok(data) => Ok(data),
            // EIO (errno 5): 未マッピング扱いの領域
            Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => self.read_via_ptrace(addr, len),
            Err(e) => Err(anyhow::anyhow!(
                "failed to read {} bytes at 0x{:x} from {}: {}",
                len,
                addr,
                self.mem_path(),
                e
            )),
        }
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("failed to open {} for writing: {}", mem_path, e))?;
        file.seek(SeekFrom::Start(addr))?;
        file.write_all(data).map_err(|e| {
            anyhow::anyhow!("failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e)
        })?;
        Ok(())
    }
}

/// 連続したメモリイメージ（ループバックのデバッグ対象用）
///
/// クローンは同じイメージを共有します。
#[derive(Clone)]
pub struct SharedMemory {
    base: u64,
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl SharedMemory {
    /// `base` から始まる `size` バイトのゼロ埋めイメージを作成する
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: Arc::new(RwLock::new(vec![0; size])),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.bytes.read().len()
    }

    fn range(&self, addr: u64, len: usize, total: usize) -> Result<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(self.base)
            .ok_or_else(|| anyhow::anyhow!("address 0x{:x} is below image base", addr))?
            as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= total)
            .ok_or_else(|| anyhow::anyhow!("range 0x{:x}+{} is outside the image", addr, len))?;
        Ok(start..end)
    }
}

impl MemoryAccessor for SharedMemory {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let bytes = self.bytes.read();
        let range = self.range(addr, len, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let range = self.range(addr, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}
