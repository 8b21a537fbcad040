//! Hashi CLI - コマンドラインインターフェース
//!
//! ループバックのデバッグ対象に対する REPL と、ptrace で起動した
//! ネイティブプロセスのイベント分類トレーサを提供します。

use anyhow::Result;
use clap::{Parser, Subcommand};
use hashi_core::{
    BreakpointHandle, Command, EventMarkers, ManagedEvent, NativeEvent, NativeEventKind, Process, ProcessConfig,
    SnapshotHandle,
};
use hashi_target::{AgentBehavior, Inferior, TargetHandle};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Hashi - out-of-process managed debugger engine
#[derive(Parser)]
#[command(name = "hashi")]
#[command(version = "0.1.0")]
#[command(about = "Host-side engine of an out-of-process managed debugger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Start a REPL session against a loopback debuggee
    Session {
        /// Delay before the debuggee reports a requested stop
        #[arg(long, default_value_t = 10)]
        stop_latency_ms: u64,

        /// Never report requested stops (every stop times out)
        #[arg(long)]
        no_stop_report: bool,

        /// Default timeout for `stop`
        #[arg(long, env = "HASHI_STOP_TIMEOUT_MS", default_value_t = 5000)]
        stop_timeout_ms: u64,

        /// Timeout for request/reply exchanges with the debuggee
        #[arg(long, env = "HASHI_REPLY_TIMEOUT_MS", default_value_t = 5000)]
        reply_timeout_ms: u64,
    },

    /// Launch an executable under ptrace and print the triage of every native event
    Trace {
        /// Path to the executable binary
        binary: String,

        /// Stop after this many events
        #[arg(long)]
        max_events: Option<usize>,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        DebugCommand::Session {
            stop_latency_ms,
            no_stop_report,
            stop_timeout_ms,
            reply_timeout_ms,
        } => {
            let behavior = AgentBehavior {
                stop_latency: (!no_stop_report).then(|| Duration::from_millis(stop_latency_ms)),
                ..Default::default()
            };
            let config = ProcessConfig::default()
                .with_stop_timeout(Duration::from_millis(stop_timeout_ms))
                .with_reply_timeout(Duration::from_millis(reply_timeout_ms))
                .with_interop(true);
            let mut session = Session::start(behavior, config)?;
            run_repl(&mut session)?;
        }
        DebugCommand::Trace {
            binary,
            max_events,
            args,
        } => run_trace(&binary, &args, max_events)?,
    }

    Ok(())
}

/// REPL のセッション状態
struct Session {
    process: Process,
    target: TargetHandle,
    /// REPL が保持しているブレークポイントのハンドル
    breakpoints: Vec<BreakpointHandle>,
    snapshots: Vec<SnapshotHandle>,
}

impl Session {
    fn start(behavior: AgentBehavior, config: ProcessConfig) -> Result<Self> {
        let target = TargetHandle::launch(behavior)?;
        let process = Process::connect(&target, config)?;
        println!("Connected to loopback debuggee");
        println!("Code region starts at 0x{:x}", target.code_base());
        println!();
        Ok(Self {
            process,
            target,
            breakpoints: Vec::new(),
            snapshots: Vec::new(),
        })
    }
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".hashi_history"))
}

/// REPLループを実行する
fn run_repl(session: &mut Session) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        let _ = rl.load_history(path);
    }

    loop {
        print_pending_events(session);

        let readline = rl.readline("(hashi) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(session, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Err(e) = rl.save_history(path) {
            tracing::warn!("failed to save history to {}: {}", path.display(), e);
        }
    }
    Ok(())
}

fn print_pending_events(session: &Session) {
    for event in session.process.managed_events().try_iter() {
        match event {
            ManagedEvent::UserBreakpoint { thread } => {
                println!("Debuggee stopped at a user breakpoint on thread {}", thread)
            }
            ManagedEvent::ProcessExited { code: Some(code) } => println!("Debuggee exited with code {}", code),
            ManagedEvent::ProcessExited { code: None } => println!("Connection to the debuggee was lost"),
            ManagedEvent::ProcessDetached => println!("Detached from the debuggee"),
        }
    }
}

/// コマンドを処理する。REPL を続けるなら `true`
fn handle_command(session: &mut Session, line: &str) -> Result<bool> {
    let Some(command) = Command::parse(line) else {
        println!("Unknown command: {}", line);
        println!("Type 'help' for available commands.");
        return Ok(true);
    };

    let process = &session.process;
    match command {
        Command::Help => print_help(),
        Command::Quit => {
            println!("Goodbye!");
            return Ok(false);
        }
        Command::Stop(timeout) => {
            match timeout {
                Some(timeout) => process.stop(timeout)?,
                None => process.stop_default()?,
            }
            println!("Stopped (stop count {})", process.stop_count());
        }
        Command::Continue => {
            process.continue_(false)?;
            if process.is_synchronized() {
                println!("Still stopped (stop count {})", process.stop_count());
            } else {
                println!("Continuing execution...");
            }
        }
        Command::ContinueOutOfBand => {
            process.continue_(true)?;
            println!("Continued one out-of-band event");
        }
        Command::Break(address) => {
            let bp = process.create_breakpoint_at_address(address)?;
            println!(
                "Breakpoint {} set at 0x{:x} (slot handle {})",
                session.breakpoints.len(),
                address,
                bp.remote_handle()?
            );
            session.breakpoints.push(bp);
        }
        Command::Delete(index) => {
            if index >= session.breakpoints.len() {
                println!("No breakpoint {}", index);
            } else {
                let bp = session.breakpoints.remove(index);
                println!("Released breakpoint {} (removed on the next continue)", bp.id());
            }
        }
        Command::Breakpoints => {
            let breakpoints = process.enumerate_breakpoints()?;
            println!("Breakpoints ({} found):", breakpoints.count()?);
            while let Some(bp) = breakpoints.next()? {
                println!("  {} @ 0x{:x} (active: {})", bp.id(), bp.address()?, bp.is_active()?);
            }
        }
        Command::Patches => {
            let count = process.refresh_patch_table()?;
            println!("Patch table ({} entries):", count);
            for patch in process.patches()? {
                println!(
                    "  [{}] 0x{:x} original 0x{:02x}{}",
                    patch.index,
                    patch.address,
                    patch.opcode,
                    if patch.unmanaged { " (unmanaged)" } else { "" }
                );
            }
        }
        Command::Read { address, len } => {
            let bytes = process.read_memory(address, len)?;
            print_bytes(address, &bytes);
        }
        Command::Write { address, bytes } => {
            process.write_memory(address, &bytes)?;
            println!("Wrote {} byte(s) at 0x{:x}", bytes.len(), address);
        }
        Command::Snapshot { address, len } => {
            let snapshot = process.snapshot_memory(address, len)?;
            println!("Snapshot {} of {} byte(s) at 0x{:x}", snapshot.id(), len, address);
            session.snapshots.push(snapshot);
        }
        Command::Status => {
            let stats = process.stats();
            println!("State: {:?} (stop count {})", process.sync_state(), process.stop_count());
            println!(
                "Objects: {} created, {} live, {} disposed",
                stats.created, stats.live, stats.disposed
            );
            println!(
                "Held handles: {} breakpoint(s), {} snapshot(s)",
                session.breakpoints.len(),
                session.snapshots.len()
            );
            println!("Pending out-of-band events: {}", process.pending_out_of_band());
        }
        Command::Events => print_pending_events(session),
        Command::Raise(thread) => {
            session.target.raise_user_breakpoint(thread);
            println!("Raised a user breakpoint on thread {}", thread);
        }
        Command::Native { thread, address } => {
            let event = NativeEvent::breakpoint(thread, address);
            let reaction = process.on_native_event(&event, EventMarkers::default());
            println!("Thread {} breakpoint at 0x{:x} -> {:?}", thread, address, reaction);
        }
        Command::Terminate(code) => {
            session.target.exit(code);
            println!("Asked the debuggee to exit with code {}", code);
        }
        Command::Kill => {
            session.target.kill();
            println!("Killed the debuggee");
        }
        Command::Detach => {
            process.detach()?;
            session.breakpoints.clear();
            session.snapshots.clear();
        }
    }

    Ok(true)
}

fn print_bytes(address: u64, bytes: &[u8]) {
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  0x{:x}: {}", address + (i * 16) as u64, hex.join(" "));
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help                  - Show this help message");
    println!("  quit/exit/q           - Exit the debugger");
    println!();
    println!("Execution control:");
    println!("  stop [ms]             - Stop the debuggee (nests when already stopped)");
    println!("  continue (c)          - Continue execution (sweeps released objects)");
    println!("  oob                   - Continue the oldest out-of-band native event");
    println!("  detach                - Detach from the debuggee");
    println!();
    println!("Breakpoints and memory:");
    println!("  break <addr> (b)      - Set breakpoint at address");
    println!("  delete <n> (d)        - Release a held breakpoint handle");
    println!("  breakpoints (bl)      - Enumerate live breakpoints");
    println!("  patches               - Refresh and show the patch table");
    println!("  x <addr> [len]        - Read memory with patches hidden");
    println!("  write <addr> <hex>    - Write memory (patches are preserved)");
    println!("  snapshot <addr> <len> - Take a memory snapshot");
    println!();
    println!("Diagnostics:");
    println!("  status (st)           - Show sync state and object counts");
    println!("  events                - Show pending lifecycle events");
    println!("  native <tid> <addr>   - Triage a synthetic native breakpoint");
    println!();
    println!("Loopback debuggee:");
    println!("  raise <tid>           - Hit a user breakpoint");
    println!("  terminate [code]      - Make the debuggee exit");
    println!("  kill                  - Crash the debuggee");
}

/// ptrace でプログラムを起動し、ネイティブイベントを分類して表示する
fn run_trace(binary: &str, args: &[String], max_events: Option<usize>) -> Result<()> {
    let mut inferior = Inferior::spawn(binary, args)?;
    let pid = inferior.pid();
    println!("Tracing {} (pid {})", binary, pid);
    inferior.continue_handled(pid)?;

    // ランタイムのないネイティブプロセスとして扱う
    let memory = Arc::new(inferior.memory());
    let config = ProcessConfig::default().with_interop(true);
    let process = Process::attach_native(Box::new(inferior), memory, config);
    let mut seen = 0usize;

    loop {
        let (event, reaction) = process.wait_native_event(EventMarkers::default())?;
        seen += 1;
        println!("[{}] {:?} -> {:?}", event.thread, event.kind, reaction);

        if let NativeEventKind::ExitProcess { code } = event.kind {
            if event.thread == pid {
                println!("Process exited with code {}", code);
                break;
            }
            continue;
        }
        if max_events.is_some_and(|max| seen >= max) {
            println!("Stopping after {} event(s)", seen);
            break;
        }

        if reaction.is_out_of_band() {
            process.continue_(true)?;
        } else {
            process.continue_native(&event, reaction)?;
        }
    }

    Ok(())
}
