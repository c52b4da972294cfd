/// Decoded pseudo-instructions. Tokens are whitespace-separated; the first
/// is the opcode, the rest positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Noop,
    Write { address: usize, value: String },
    Read { address: usize, size: usize },
    Goto { target: u64 },
    Io { device: String, time: u64 },
    InitProc { script: String, size: u64 },
    DumpMemory,
    Exit,
}

/// Why one dispatch returns to the Kernel. Serialized with the wire names
/// the Kernel matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    SyscallIo,
    SyscallInitProc,
    SyscallDumpMemory,
    Exit,
    Error,
    Interrupted,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::SyscallIo => "SYSCALL_IO",
            Reason::SyscallInitProc => "SYSCALL_INIT_PROC",
            Reason::SyscallDumpMemory => "SYSCALL_DUMP_MEMORY",
            Reason::Exit => "EXIT",
            Reason::Error => "ERROR",
            Reason::Interrupted => "INTERRUPTED",
        }
    }
}

/// Tokenize and decode one instruction line. Unknown opcodes and malformed
/// arguments are decode errors; the caller turns them into an `ERROR`
/// return reason.
pub fn decode(line: &str) -> Result<Instruction, String> {
    let mut tokens = line.split_whitespace();
    let opcode = tokens.next().ok_or_else(|| "empty instruction".to_string())?;
    let args: Vec<&str> = tokens.collect();

    match opcode {
        "NOOP" => Ok(Instruction::Noop),
        "WRITE" => {
            let (addr, value) = two_args(opcode, &args)?;
            Ok(Instruction::Write {
                address: parse(opcode, addr)?,
                value: value.to_string(),
            })
        }
        "READ" => {
            let (addr, size) = two_args(opcode, &args)?;
            Ok(Instruction::Read {
                address: parse(opcode, addr)?,
                size: parse(opcode, size)?,
            })
        }
        "GOTO" => {
            let target = args.first().ok_or_else(|| missing(opcode))?;
            Ok(Instruction::Goto {
                target: parse(opcode, target)?,
            })
        }
        "IO" => {
            let (device, time) = two_args(opcode, &args)?;
            Ok(Instruction::Io {
                device: device.to_string(),
                time: parse(opcode, time)?,
            })
        }
        "INIT_PROC" => {
            let (script, size) = two_args(opcode, &args)?;
            Ok(Instruction::InitProc {
                script: script.to_string(),
                size: parse(opcode, size)?,
            })
        }
        "DUMP_MEMORY" => Ok(Instruction::DumpMemory),
        "EXIT" => Ok(Instruction::Exit),
        other => Err(format!("unknown opcode '{}'", other)),
    }
}

fn two_args<'a>(opcode: &str, args: &[&'a str]) -> Result<(&'a str, &'a str), String> {
    match args {
        [a, b, ..] => Ok((a, b)),
        _ => Err(missing(opcode)),
    }
}

fn missing(opcode: &str) -> String {
    format!("{}: missing arguments", opcode)
}

fn parse<T: std::str::FromStr>(opcode: &str, token: &str) -> Result<T, String> {
    token
        .parse()
        .map_err(|_| format!("{}: invalid argument '{}'", opcode, token))
}
