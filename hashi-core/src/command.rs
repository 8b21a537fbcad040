//! REPL コマンド

use crate::parse::{parse_address, parse_hex_bytes, parse_millis};
use hashi_target::ThreadId;
use std::time::Duration;

/// メモリ読み取りの既定の長さ
const DEFAULT_READ_LEN: usize = 16;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// デバッグ対象を停止（タイムアウト省略時は設定値）
    Stop(Option<Duration>),
    /// 実行継続
    Continue,
    /// 保留中の帯域外イベントを1つ再開
    ContinueOutOfBand,
    /// ブレークポイントを設定
    Break(u64),
    /// 保持しているブレークポイントのハンドルを手放す
    Delete(usize),
    /// ブレークポイント一覧（列挙子経由）
    Breakpoints,
    /// パッチテーブルを読み直して表示
    Patches,
    /// メモリ読み取り
    Read { address: u64, len: usize },
    /// メモリ書き込み
    Write { address: u64, bytes: Vec<u8> },
    /// メモリのスナップショットを作成
    Snapshot { address: u64, len: usize },
    /// 同期状態とオブジェクト統計を表示
    Status,
    /// 届いているライフサイクルイベントを表示
    Events,
    /// ユーザーブレークポイントを発生させる（ループバック対象のみ）
    Raise(ThreadId),
    /// 合成したネイティブブレークポイントイベントを分類する
    Native { thread: ThreadId, address: u64 },
    /// デバッグ対象を終了させる
    Terminate(i32),
    /// デバッグ対象をクラッシュさせる
    Kill,
    /// デタッチ
    Detach,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (name, args) = parts.split_first()?;

        match (*name, args) {
            ("stop", []) => Some(Command::Stop(None)),
            ("stop", [timeout]) => parse_millis(timeout).ok().map(|t| Command::Stop(Some(t))),
            ("continue" | "c", []) => Some(Command::Continue),
            ("oob", []) => Some(Command::ContinueOutOfBand),
            ("break" | "b", [address]) => parse_address(address).ok().map(Command::Break),
            ("delete" | "d", [index]) => index.parse().ok().map(Command::Delete),
            ("breakpoints" | "bl", []) | ("info", ["breakpoints"]) => Some(Command::Breakpoints),
            ("patches", []) => Some(Command::Patches),
            ("x" | "read", [address, rest @ ..]) if rest.len() <= 1 => {
                let address = parse_address(address).ok()?;
                let len = match rest.first() {
                    Some(len) => len.parse().ok()?,
                    None => DEFAULT_READ_LEN,
                };
                Some(Command::Read { address, len })
            }
            ("write", [address, bytes @ ..]) if !bytes.is_empty() => Some(Command::Write {
                address: parse_address(address).ok()?,
                bytes: parse_hex_bytes(&bytes.join(" ")).ok()?,
            }),
            ("snapshot", [address, len]) => Some(Command::Snapshot {
                address: parse_address(address).ok()?,
                len: len.parse().ok()?,
            }),
            ("status" | "st", []) => Some(Command::Status),
            ("events", []) => Some(Command::Events),
            ("raise", [thread]) => thread.parse().ok().map(Command::Raise),
            ("native", [thread, address]) => Some(Command::Native {
                thread: thread.parse().ok()?,
                address: parse_address(address).ok()?,
            }),
            ("terminate", []) => Some(Command::Terminate(0)),
            ("terminate", [code]) => code.parse().ok().map(Command::Terminate),
            ("kill", []) => Some(Command::Kill),
            ("detach", []) => Some(Command::Detach),
            ("help" | "h" | "?", _) => Some(Command::Help),
            ("quit" | "q" | "exit", []) => Some(Command::Quit),
            _ => None,
        }
    }
}
